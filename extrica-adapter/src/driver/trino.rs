use std::{
    collections::BTreeMap,
    fs,
    sync::{
        Arc, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::Duration,
};

use extrica_adapter_core::{
    QueryId,
    columns::Column,
    sanitization::Sanitize,
    value::{Value, quote_string},
};
use http::{HeaderMap, HeaderName, HeaderValue, StatusCode, header};
use reqwest::blocking::{Client, RequestBuilder, Response};
use tracing::{debug, instrument, warn};
use url::Url;

use crate::driver::{
    CancelHandle, ConnectParams, Driver, DriverConnection, DriverCursor, DriverError,
    HttpStatusSnafu, IsolationLevel, QuerySnafu, Row, StatementCanceller,
    protocol::{self, QueryResults},
};

const RETRYABLE_STATUS_CODES: [StatusCode; 3] = [
    StatusCode::BAD_GATEWAY,
    StatusCode::SERVICE_UNAVAILABLE,
    StatusCode::GATEWAY_TIMEOUT,
];
const INITIAL_RETRY_BACKOFF: Duration = Duration::from_millis(100);
const MAX_RETRY_BACKOFF: Duration = Duration::from_secs(10);

/// Driver speaking the Trino client statement protocol over HTTP(S).
///
/// Connections are pure cursor factories, nothing is sent to the engine until the first
/// statement is executed.
#[derive(Debug, Default)]
pub struct TrinoDriver;

impl Driver for TrinoDriver {
    #[instrument(skip(self))]
    fn connect(&self, params: ConnectParams) -> Result<Box<dyn DriverConnection>, DriverError> {
        if params.isolation_level != IsolationLevel::AutoCommit {
            return Err(DriverError::other(format!(
                "Isolation level {} is not supported, the engine runs in {}",
                params.isolation_level,
                IsolationLevel::AutoCommit
            )));
        }

        let mut client_builder = Client::builder()
            .user_agent(params.source.clone())
            // Callers enforce their own timeouts around the blocking calls
            .timeout(None::<Duration>);
        if let Some(cert) = &params.cert {
            let pem = fs::read(cert).map_err(|err| {
                DriverError::other(format!(
                    "Failed to read TLS certificate {}: {err}",
                    cert.display()
                ))
            })?;
            let certificate = reqwest::Certificate::from_pem(&pem).map_err(|err| {
                DriverError::other(format!(
                    "Failed to parse TLS certificate {}: {err}",
                    cert.display()
                ))
            })?;
            client_builder = client_builder.add_root_certificate(certificate);
        }
        let client = client_builder
            .build()
            .map_err(|err| DriverError::other(format!("Failed to construct HTTP client: {err}")))?;

        let statement_endpoint = Url::parse(&format!(
            "{}://{}:{}/v1/statement",
            params.http_scheme, params.host, params.port
        ))
        .map_err(|err| DriverError::other(format!("Invalid engine endpoint: {err}")))?;

        Ok(Box::new(TrinoConnection {
            client,
            statement_endpoint,
            max_attempts: params.max_attempts.max(1),
            session: Arc::new(Mutex::new(ClientSession::new(params))),
        }))
    }
}

pub struct TrinoConnection {
    client: Client,
    statement_endpoint: Url,
    max_attempts: u32,

    /// Shared with all cursors of this connection, so that session changes made by one
    /// statement (e.g. `USE`) apply to the following ones.
    session: Arc<Mutex<ClientSession>>,
}

impl DriverConnection for TrinoConnection {
    fn cursor(&self) -> Result<Box<dyn DriverCursor>, DriverError> {
        Ok(Box::new(TrinoCursor {
            statement_endpoint: self.statement_endpoint.clone(),
            max_attempts: self.max_attempts,
            running: Arc::new(RunningStatement {
                client: self.client.clone(),
                session: Arc::clone(&self.session),
                next_uri: Mutex::new(None),
                cancelled: AtomicBool::new(false),
            }),
            query: None,
            query_id: None,
            columns: None,
            rows: Vec::new(),
            update_count: None,
        }))
    }

    fn close(&mut self) -> Result<(), DriverError> {
        // There is no server side state to clean up
        Ok(())
    }
}

/// The client side session state that is sent along with every request.
#[derive(Clone)]
pub struct ClientSession {
    user: Option<String>,
    source: String,
    catalog: String,
    schema: String,
    client_tags: Vec<String>,
    roles: BTreeMap<String, String>,
    timezone: Option<String>,
    session_properties: BTreeMap<String, String>,
    extra_headers: HeaderMap,
    bearer_token: String,
}

impl ClientSession {
    pub fn new(params: ConnectParams) -> Self {
        let session_properties = params
            .session_properties
            .into_iter()
            .map(|(key, value)| {
                let value = match value {
                    serde_json::Value::String(value) => value,
                    other => other.to_string(),
                };
                (key, value)
            })
            .collect();

        Self {
            user: params.user,
            source: params.source,
            catalog: params.catalog,
            schema: params.schema,
            client_tags: params.client_tags,
            roles: params.roles,
            timezone: params.timezone,
            session_properties,
            extra_headers: params.http_headers,
            bearer_token: params.bearer_token,
        }
    }

    /// Request headers describing this session. The extra headers of the profile are sent
    /// as well, but can not override the protocol headers.
    pub fn headers(&self) -> Result<HeaderMap, DriverError> {
        let mut headers = self.extra_headers.clone();

        insert_header(&mut headers, protocol::HEADER_SOURCE, &self.source)?;
        if let Some(user) = &self.user {
            insert_header(&mut headers, protocol::HEADER_USER, user)?;
        }
        if !self.catalog.is_empty() {
            insert_header(&mut headers, protocol::HEADER_CATALOG, &self.catalog)?;
        }
        if !self.schema.is_empty() {
            insert_header(&mut headers, protocol::HEADER_SCHEMA, &self.schema)?;
        }
        if !self.client_tags.is_empty() {
            insert_header(
                &mut headers,
                protocol::HEADER_CLIENT_TAGS,
                &self.client_tags.join(","),
            )?;
        }
        if let Some(timezone) = &self.timezone {
            insert_header(&mut headers, protocol::HEADER_TIME_ZONE, timezone)?;
        }
        if !self.session_properties.is_empty() {
            let session = self
                .session_properties
                .iter()
                .map(|(key, value)| format!("{key}={}", urlencoding::encode(value)))
                .collect::<Vec<_>>()
                .join(",");
            insert_header(&mut headers, protocol::HEADER_SESSION, &session)?;
        }
        if !self.roles.is_empty() {
            let roles = self
                .roles
                .iter()
                .map(|(catalog, role)| {
                    let role = match role.to_uppercase().as_str() {
                        "ALL" | "NONE" => role.to_uppercase(),
                        _ => format!("ROLE{{{role}}}"),
                    };
                    format!("{catalog}={}", urlencoding::encode(&role))
                })
                .collect::<Vec<_>>()
                .join(",");
            insert_header(&mut headers, protocol::HEADER_ROLE, &roles)?;
        }

        let mut authorization = HeaderValue::from_str(&format!("Bearer {}", self.bearer_token))
            .map_err(|_| DriverError::other("The access token contains invalid characters"))?;
        authorization.set_sensitive(true);
        headers.insert(header::AUTHORIZATION, authorization);

        Ok(headers)
    }

    /// Applies the session changes the engine requested in its response headers.
    pub fn apply_response_headers(&mut self, headers: &HeaderMap) {
        if let Some(catalog) = header_str(headers, protocol::HEADER_SET_CATALOG) {
            self.catalog = catalog.to_owned();
        }
        if let Some(schema) = header_str(headers, protocol::HEADER_SET_SCHEMA) {
            self.schema = schema.to_owned();
        }
        for set_session in headers.get_all(protocol::HEADER_SET_SESSION) {
            let Some((key, value)) = set_session.to_str().ok().and_then(|s| s.split_once('='))
            else {
                continue;
            };
            let value = urlencoding::decode(value)
                .map(|value| value.into_owned())
                .unwrap_or_else(|_| value.to_owned());
            self.session_properties
                .insert(key.trim().to_owned(), value);
        }
        for clear_session in headers.get_all(protocol::HEADER_CLEAR_SESSION) {
            if let Ok(key) = clear_session.to_str() {
                self.session_properties.remove(key.trim());
            }
        }
    }

    pub fn catalog(&self) -> &str {
        &self.catalog
    }

    pub fn schema(&self) -> &str {
        &self.schema
    }

    pub fn session_properties(&self) -> &BTreeMap<String, String> {
        &self.session_properties
    }
}

fn insert_header(headers: &mut HeaderMap, name: &'static str, value: &str) -> Result<(), DriverError> {
    let value = HeaderValue::from_str(value).map_err(|_| {
        DriverError::other(format!("The value for header {name} contains invalid characters"))
    })?;
    headers.insert(HeaderName::from_static(name), value);
    Ok(())
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|value| value.to_str().ok())
}

fn lock_session(session: &Mutex<ClientSession>) -> MutexGuard<'_, ClientSession> {
    // The session is only ever replaced field by field, so it is consistent even if a panic
    // happened while it was locked
    session.lock().unwrap_or_else(PoisonError::into_inner)
}

/// The part of a cursor its cancel handles share with it.
struct RunningStatement {
    client: Client,
    session: Arc<Mutex<ClientSession>>,

    /// Where the next page of the running statement is fetched from. Only set while the
    /// statement runs.
    next_uri: Mutex<Option<Url>>,
    cancelled: AtomicBool,
}

impl RunningStatement {
    fn next_uri(&self) -> Option<Url> {
        self.next_uri
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn set_next_uri(&self, next_uri: Option<Url>) {
        *self.next_uri.lock().unwrap_or_else(PoisonError::into_inner) = next_uri;
    }

    fn start(&self) {
        self.set_next_uri(None);
        self.cancelled.store(false, Ordering::SeqCst);
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

impl StatementCanceller for RunningStatement {
    #[instrument(skip(self))]
    fn cancel(&self) -> Result<(), DriverError> {
        let Some(next_uri) = self.next_uri() else {
            debug!("Nothing to cancel, the statement is not running");
            return Ok(());
        };
        // Set before the engine is told, so the page in flight is the last one read
        self.cancelled.store(true, Ordering::SeqCst);

        let headers = lock_session(&self.session).headers()?;
        let response = self
            .client
            .delete(next_uri.clone())
            .headers(headers)
            .send()
            .map_err(|err| DriverError::SendRequest {
                source: Box::new(err),
                endpoint: next_uri.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            return HttpStatusSnafu {
                endpoint: next_uri.to_string(),
                status: status.as_u16(),
                body: response.text().unwrap_or_default(),
            }
            .fail();
        }

        debug!(%next_uri, "Cancelled statement");
        Ok(())
    }
}

pub struct TrinoCursor {
    statement_endpoint: Url,
    max_attempts: u32,
    running: Arc<RunningStatement>,

    query: Option<String>,
    query_id: Option<QueryId>,
    columns: Option<Vec<Column>>,
    rows: Vec<Row>,
    update_count: Option<u64>,
}

impl TrinoCursor {
    fn session(&self) -> MutexGuard<'_, ClientSession> {
        lock_session(&self.running.session)
    }

    fn reset(&mut self) {
        self.query = None;
        self.query_id = None;
        self.columns = None;
        self.rows.clear();
        self.update_count = None;
        self.running.start();
    }

    #[instrument(skip(self, endpoint, request), fields(%endpoint))]
    fn send_with_retries(
        &self,
        endpoint: &Url,
        request: impl Fn() -> RequestBuilder,
    ) -> Result<Response, DriverError> {
        let mut attempt = 1;
        loop {
            let result = request().send();
            let retryable = match &result {
                Ok(response) => RETRYABLE_STATUS_CODES.contains(&response.status()),
                Err(err) => err.is_connect() || err.is_timeout(),
            };

            if retryable && attempt < self.max_attempts {
                let backoff = retry_backoff(attempt);
                warn!(attempt, ?backoff, "Request to engine failed, retrying");
                thread::sleep(backoff);
                attempt += 1;
                continue;
            }

            return match result {
                Ok(response) => Ok(response),
                Err(err) if err.is_connect() => Err(DriverError::Connect {
                    source: Box::new(err),
                    endpoint: endpoint.to_string(),
                }),
                Err(err) => Err(DriverError::SendRequest {
                    source: Box::new(err),
                    endpoint: endpoint.to_string(),
                }),
            };
        }
    }

    fn read_results(&self, response: Response, endpoint: &Url) -> Result<QueryResults, DriverError> {
        let status = response.status();
        if status != StatusCode::OK {
            let body = response.text().unwrap_or_default();
            return HttpStatusSnafu {
                endpoint: endpoint.to_string(),
                status: status.as_u16(),
                body,
            }
            .fail();
        }

        self.session().apply_response_headers(response.headers());
        response
            .json::<QueryResults>()
            .map_err(|err| DriverError::Protocol {
                message: format!("Failed to decode query results from {endpoint}: {err}"),
            })
    }

    fn process_results(&mut self, results: QueryResults) -> Result<(), DriverError> {
        self.query_id = Some(results.id.clone());
        self.running.set_next_uri(None);

        if let Some(error) = results.error {
            return QuerySnafu {
                message: error.full_message(),
                query_id: Some(results.id),
                error_name: error.error_name,
            }
            .fail();
        }

        for warning in &results.warnings {
            warn!(query_id = %results.id, warning = %warning.message, "Engine reported a warning");
        }
        if let Some(columns) = results.columns {
            self.columns = Some(columns);
        }
        if let Some(data) = results.data {
            self.rows.extend(data);
        }
        if results.update_count.is_some() {
            self.update_count = results.update_count;
        }

        let next_uri = results
            .next_uri
            .map(|next_uri| Url::parse(&next_uri))
            .transpose()
            .map_err(|err| DriverError::Protocol {
                message: format!("Failed to parse nextUri: {err}"),
            })?;
        self.running.set_next_uri(next_uri);

        Ok(())
    }

    fn fetch_page(
        &self,
        next_uri: &Url,
        headers: &HeaderMap,
    ) -> Result<QueryResults, DriverError> {
        let response = self.send_with_retries(next_uri, || {
            self.running
                .client
                .get(next_uri.clone())
                .headers(headers.clone())
        })?;
        self.read_results(response, next_uri)
    }

    /// Stops a statement whose remaining pages can not be read anymore, so it does not keep
    /// running on the engine.
    fn abandon(&self) {
        if let Err(err) = self.running.cancel() {
            warn!(query_id = ?self.query_id, ?err, "Failed to cancel abandoned statement");
        }
        self.running.set_next_uri(None);
    }
}

impl DriverCursor for TrinoCursor {
    #[instrument(skip(self, sql, params))]
    fn execute(&mut self, sql: &str, params: Option<&[Value]>) -> Result<(), DriverError> {
        self.reset();

        let sql = match params {
            Some(params) if !params.is_empty() => execute_immediate(sql, params),
            _ => sql.to_owned(),
        };
        self.query = Some(sql.clone());

        let headers = self.session().headers()?;
        debug!(headers = ?headers.sanitize(), "Submitting statement");

        let endpoint = self.statement_endpoint.clone();
        let response = self.send_with_retries(&endpoint, || {
            self.running
                .client
                .post(endpoint.clone())
                .headers(headers.clone())
                .body(sql.clone())
        })?;
        let mut results = self.read_results(response, &endpoint)?;

        loop {
            self.process_results(results)?;

            let Some(next_uri) = self.running.next_uri() else {
                break;
            };
            if self.running.is_cancelled() {
                self.running.set_next_uri(None);
                return QuerySnafu {
                    message: "USER_CANCELED: Query was canceled",
                    query_id: self.query_id.clone(),
                    error_name: Some("USER_CANCELED".to_owned()),
                }
                .fail();
            }

            results = match self.fetch_page(&next_uri, &headers) {
                Ok(results) => results,
                Err(err) => {
                    self.abandon();
                    return Err(err);
                }
            };
        }

        debug!(
            query_id = ?self.query_id,
            rows = self.rows.len(),
            "Statement finished"
        );
        Ok(())
    }

    fn fetchall(&mut self) -> Result<Vec<Row>, DriverError> {
        Ok(std::mem::take(&mut self.rows))
    }

    fn description(&self) -> Option<&[Column]> {
        self.columns.as_deref()
    }

    fn query(&self) -> Option<&str> {
        self.query.as_deref()
    }

    fn query_id(&self) -> Option<&str> {
        self.query_id.as_deref()
    }

    fn rowcount(&self) -> Option<u64> {
        self.update_count
    }

    fn cancel_handle(&self) -> CancelHandle {
        self.running.clone()
    }
}

/// Binds `params` natively by letting the engine substitute the `?` placeholders.
pub fn execute_immediate(sql: &str, params: &[Value]) -> String {
    let params = params
        .iter()
        .map(native_literal)
        .collect::<Vec<_>>()
        .join(", ");

    format!("EXECUTE IMMEDIATE {} USING {params}", quote_string(sql))
}

/// Renders `value` as a literal of the matching engine type. Unlike the literal escaping of
/// the compatibility path, every value can be expressed here.
pub fn native_literal(value: &Value) -> String {
    match value {
        Value::Null => "NULL".to_owned(),
        Value::Boolean(boolean) => boolean.to_string(),
        Value::Integer(integer) => integer.to_string(),
        Value::Double(double) if double.is_nan() => "nan()".to_owned(),
        Value::Double(double) if double.is_infinite() && double.is_sign_positive() => {
            "infinity()".to_owned()
        }
        Value::Double(double) if double.is_infinite() => "-infinity()".to_owned(),
        Value::Double(double) => format!("DOUBLE '{double}'"),
        Value::Varchar(string) => quote_string(string),
        Value::Date(date) => format!("DATE '{}'", date.format("%Y-%m-%d")),
        Value::Timestamp(timestamp) => {
            format!("TIMESTAMP '{}'", timestamp.format("%Y-%m-%d %H:%M:%S%.6f"))
        }
        Value::Array(values) => format!(
            "ARRAY[{}]",
            values
                .iter()
                .map(native_literal)
                .collect::<Vec<_>>()
                .join(",")
        ),
    }
}

fn retry_backoff(attempt: u32) -> Duration {
    INITIAL_RETRY_BACKOFF
        .saturating_mul(2_u32.saturating_pow(attempt.saturating_sub(1)))
        .min(MAX_RETRY_BACKOFF)
}

#[cfg(test)]
mod tests {
    use std::{
        io::{BufRead, BufReader, Read, Write},
        net::{TcpListener, TcpStream},
        sync::mpsc,
    };

    use chrono::NaiveDate;
    use extrica_adapter_core::credentials::HttpScheme;
    use rstest::rstest;

    use super::*;

    fn connect_params() -> ConnectParams {
        let mut http_headers = HeaderMap::new();
        http_headers.insert("x-trino-client-info", "dbt-extrica".parse().unwrap());
        // Must not win over the protocol header
        http_headers.insert(protocol::HEADER_SOURCE, "spoofed".parse().unwrap());

        ConnectParams {
            host: "127.0.0.1".to_owned(),
            port: 1,
            http_scheme: HttpScheme::Http,
            user: Some("analyst".to_owned()),
            catalog: "lakehouse".to_owned(),
            schema: "public".to_owned(),
            client_tags: vec!["dbt".to_owned(), "nightly".to_owned()],
            roles: BTreeMap::from([
                ("lakehouse".to_owned(), "admin".to_owned()),
                ("system".to_owned(), "all".to_owned()),
            ]),
            bearer_token: "token".to_owned(),
            max_attempts: 1,
            isolation_level: IsolationLevel::AutoCommit,
            source: "dbt-extrica-0.1.0".to_owned(),
            cert: None,
            timezone: Some("Europe/Berlin".to_owned()),
            session_properties: BTreeMap::from([
                (
                    "query_max_run_time".to_owned(),
                    serde_json::Value::String("4h".to_owned()),
                ),
                (
                    "exchange_compression".to_owned(),
                    serde_json::Value::Bool(true),
                ),
                (
                    "spill_path".to_owned(),
                    serde_json::Value::String("a,b=c".to_owned()),
                ),
            ]),
            http_headers,
        }
    }

    #[test]
    fn test_session_headers() {
        let headers = ClientSession::new(connect_params()).headers().unwrap();

        assert_eq!(headers[protocol::HEADER_USER], "analyst");
        assert_eq!(headers[protocol::HEADER_SOURCE], "dbt-extrica-0.1.0");
        assert_eq!(headers[protocol::HEADER_CATALOG], "lakehouse");
        assert_eq!(headers[protocol::HEADER_SCHEMA], "public");
        assert_eq!(headers[protocol::HEADER_CLIENT_TAGS], "dbt,nightly");
        assert_eq!(headers[protocol::HEADER_TIME_ZONE], "Europe/Berlin");
        assert_eq!(
            headers[protocol::HEADER_SESSION],
            "exchange_compression=true,query_max_run_time=4h,spill_path=a%2Cb%3Dc"
        );
        assert_eq!(
            headers[protocol::HEADER_ROLE],
            "lakehouse=ROLE%7Badmin%7D,system=ALL"
        );
        assert_eq!(headers["x-trino-client-info"], "dbt-extrica");
        assert_eq!(headers[header::AUTHORIZATION], "Bearer token");
        assert!(headers[header::AUTHORIZATION].is_sensitive());
    }

    #[test]
    fn test_session_headers_without_user() {
        let mut params = connect_params();
        params.user = None;
        params.client_tags.clear();
        params.roles.clear();

        let headers = ClientSession::new(params).headers().unwrap();
        assert!(headers.get(protocol::HEADER_USER).is_none());
        assert!(headers.get(protocol::HEADER_CLIENT_TAGS).is_none());
        assert!(headers.get(protocol::HEADER_ROLE).is_none());
    }

    #[test]
    fn test_apply_response_headers() {
        let mut session = ClientSession::new(connect_params());

        let mut response_headers = HeaderMap::new();
        response_headers.insert(protocol::HEADER_SET_CATALOG, "other".parse().unwrap());
        response_headers.insert(protocol::HEADER_SET_SCHEMA, "staging".parse().unwrap());
        response_headers.append(
            protocol::HEADER_SET_SESSION,
            "join_distribution_type=BROADCAST".parse().unwrap(),
        );
        response_headers.append(
            protocol::HEADER_SET_SESSION,
            "query_max_run_time=1h%2030m".parse().unwrap(),
        );
        response_headers.insert(
            protocol::HEADER_CLEAR_SESSION,
            "exchange_compression".parse().unwrap(),
        );
        session.apply_response_headers(&response_headers);

        assert_eq!(session.catalog(), "other");
        assert_eq!(session.schema(), "staging");
        assert_eq!(
            session.session_properties()["join_distribution_type"],
            "BROADCAST"
        );
        assert_eq!(session.session_properties()["query_max_run_time"], "1h 30m");
        assert!(
            !session
                .session_properties()
                .contains_key("exchange_compression")
        );
    }

    #[rstest]
    #[case(Value::Null, "NULL")]
    #[case(Value::Boolean(true), "true")]
    #[case(Value::Integer(5), "5")]
    #[case(Value::Double(1.5), "DOUBLE '1.5'")]
    #[case(Value::Double(f64::NAN), "nan()")]
    #[case(Value::Double(f64::NEG_INFINITY), "-infinity()")]
    #[case(Value::Varchar("O'Brien".to_owned()), "'O''Brien'")]
    #[case(Value::Date(NaiveDate::from_ymd_opt(2019, 1, 1).unwrap()), "DATE '2019-01-01'")]
    #[case(
        Value::Timestamp(NaiveDate::from_ymd_opt(2019, 1, 1).unwrap().and_hms_micro_opt(1, 2, 3, 4).unwrap()),
        "TIMESTAMP '2019-01-01 01:02:03.000004'"
    )]
    #[case(
        Value::Array(vec![Value::Integer(1), Value::Varchar("a".to_owned())]),
        "ARRAY[1,'a']"
    )]
    fn test_native_literal(#[case] value: Value, #[case] expected: &str) {
        assert_eq!(native_literal(&value), expected);
    }

    #[test]
    fn test_execute_immediate() {
        assert_eq!(
            execute_immediate(
                "select * from t where name = ? and id = ?",
                &[Value::Varchar("it's".to_owned()), Value::Integer(1)]
            ),
            "EXECUTE IMMEDIATE 'select * from t where name = ? and id = ?' USING 'it''s', 1"
        );
    }

    #[rstest]
    #[case(1, Duration::from_millis(100))]
    #[case(2, Duration::from_millis(200))]
    #[case(4, Duration::from_millis(800))]
    #[case(20, MAX_RETRY_BACKOFF)]
    fn test_retry_backoff(#[case] attempt: u32, #[case] expected: Duration) {
        assert_eq!(retry_backoff(attempt), expected);
    }

    #[test]
    fn test_connect_rejects_transactions() {
        let mut params = connect_params();
        params.isolation_level = IsolationLevel::Serializable;

        let err = TrinoDriver.connect(params).err().unwrap();
        assert!(err.to_string().contains("SERIALIZABLE"), "{err}");
    }

    #[test]
    fn test_connect_with_missing_certificate() {
        let mut params = connect_params();
        params.cert = Some("/does/not/exist.pem".into());

        let err = TrinoDriver.connect(params).err().unwrap();
        assert!(err.to_string().contains("/does/not/exist.pem"), "{err}");
    }

    #[test]
    fn test_unreachable_engine_is_a_connect_failure() {
        // Nothing listens on port 1, so the connection is refused right away
        let connection = TrinoDriver.connect(connect_params()).unwrap();
        let mut cursor = connection.cursor().unwrap();

        let err = cursor.execute("select 1", None).unwrap_err();
        assert!(matches!(err, DriverError::Connect { .. }), "{err:?}");
        assert!(
            err.to_string()
                .contains(crate::driver::CONNECT_FAILURE_SIGNATURE)
        );
        assert_eq!(cursor.query(), Some("select 1"));
        assert!(cursor.fetchall().unwrap().is_empty());
    }

    /// Reads a single request from `stream` and returns its method and path.
    fn read_request(stream: &mut TcpStream) -> String {
        let mut reader = BufReader::new(stream.try_clone().unwrap());
        let mut request_line = String::new();
        reader.read_line(&mut request_line).unwrap();

        let mut content_length = 0;
        loop {
            let mut line = String::new();
            reader.read_line(&mut line).unwrap();
            if line.trim().is_empty() {
                break;
            }
            if let Some((name, value)) = line.split_once(':') {
                if name.eq_ignore_ascii_case("content-length") {
                    content_length = value.trim().parse().unwrap();
                }
            }
        }
        let mut body = vec![0; content_length];
        reader.read_exact(&mut body).unwrap();

        request_line
            .split_whitespace()
            .take(2)
            .collect::<Vec<_>>()
            .join(" ")
    }

    fn respond(stream: &mut TcpStream, status: u16, body: &str) {
        write!(
            stream,
            "HTTP/1.1 {status} Status\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
            body.len()
        )
        .unwrap();
        stream.flush().unwrap();
    }

    fn running_page(port: u16, page: u32) -> String {
        format!(
            r#"{{"id": "q1", "nextUri": "http://127.0.0.1:{port}/v1/statement/executing/q1/y/{page}", "stats": {{"state": "RUNNING"}}}}"#
        )
    }

    #[test]
    fn test_statement_runs_until_last_page() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let engine = thread::spawn(move || {
            let mut requests = Vec::new();
            let (mut stream, _) = listener.accept().unwrap();
            requests.push(read_request(&mut stream));
            respond(&mut stream, 200, &running_page(port, 1));

            let (mut stream, _) = listener.accept().unwrap();
            requests.push(read_request(&mut stream));
            respond(
                &mut stream,
                200,
                r#"{"id": "q1", "updateType": "INSERT", "updateCount": 3, "stats": {"state": "FINISHED"}}"#,
            );
            requests
        });

        let connection = TrinoDriver
            .connect(ConnectParams {
                port,
                ..connect_params()
            })
            .unwrap();
        let mut cursor = connection.cursor().unwrap();
        cursor.execute("insert into t select * from s", None).unwrap();

        assert_eq!(cursor.query_id(), Some("q1"));
        assert_eq!(cursor.rowcount(), Some(3));
        assert_eq!(
            engine.join().unwrap(),
            ["POST /v1/statement", "GET /v1/statement/executing/q1/y/1"]
        );
        // The statement is done, so there is nothing left to cancel
        cursor.cancel().unwrap();
    }

    #[test]
    fn test_failed_page_cancels_statement() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let engine = thread::spawn(move || {
            let mut requests = Vec::new();
            let (mut stream, _) = listener.accept().unwrap();
            requests.push(read_request(&mut stream));
            respond(&mut stream, 200, &running_page(port, 1));

            let (mut stream, _) = listener.accept().unwrap();
            requests.push(read_request(&mut stream));
            respond(&mut stream, 500, "internal error");

            let (mut stream, _) = listener.accept().unwrap();
            requests.push(read_request(&mut stream));
            respond(&mut stream, 204, "");
            requests
        });

        let connection = TrinoDriver
            .connect(ConnectParams {
                port,
                ..connect_params()
            })
            .unwrap();
        let mut cursor = connection.cursor().unwrap();
        let err = cursor.execute("select * from big_table", None).unwrap_err();

        assert!(
            matches!(err, DriverError::HttpStatus { status: 500, .. }),
            "{err:?}"
        );
        assert_eq!(
            engine.join().unwrap(),
            [
                "POST /v1/statement",
                "GET /v1/statement/executing/q1/y/1",
                "DELETE /v1/statement/executing/q1/y/1"
            ]
        );
    }

    #[test]
    fn test_cancel_from_another_thread() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let (page_requested, wait_for_page_request) = mpsc::channel();
        let engine = thread::spawn(move || {
            let mut requests = Vec::new();
            let (mut stream, _) = listener.accept().unwrap();
            requests.push(read_request(&mut stream));
            respond(&mut stream, 200, &running_page(port, 1));

            // The page is only served once the statement got cancelled
            let (mut page, _) = listener.accept().unwrap();
            requests.push(read_request(&mut page));
            page_requested.send(()).unwrap();

            let (mut stream, _) = listener.accept().unwrap();
            requests.push(read_request(&mut stream));
            respond(&mut stream, 204, "");
            respond(&mut page, 200, &running_page(port, 2));
            requests
        });

        let connection = TrinoDriver
            .connect(ConnectParams {
                port,
                ..connect_params()
            })
            .unwrap();
        let mut cursor = connection.cursor().unwrap();
        let cancel_handle = cursor.cancel_handle();

        let err = thread::scope(|scope| {
            scope.spawn(move || {
                wait_for_page_request.recv().unwrap();
                cancel_handle.cancel().unwrap();
            });
            cursor.execute("select * from big_table", None).unwrap_err()
        });

        assert!(
            matches!(
                &err,
                DriverError::Query { error_name: Some(error_name), .. } if error_name == "USER_CANCELED"
            ),
            "{err:?}"
        );
        assert_eq!(err.query_id(), Some("q1"));
        assert_eq!(
            engine.join().unwrap(),
            [
                "POST /v1/statement",
                "GET /v1/statement/executing/q1/y/1",
                "DELETE /v1/statement/executing/q1/y/1"
            ]
        );
    }
}
