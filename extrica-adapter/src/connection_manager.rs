use std::{path::PathBuf, sync::Arc};

use extrica_adapter_core::{
    ConnectionName, QueryId, columns::Column, config::ProfilesConfig, credentials::Credentials,
    statements::split_statements, value::Value,
};
use serde::Serialize;
use snafu::{OptionExt, ResultExt};
use strum::Display;
use tracing::{debug, instrument};

use crate::{
    auth::{Authenticate, Authentication},
    connection_wrapper::{Canceller, ConnectionWrapper},
    driver::{ConnectParams, Driver, Row},
    error::{AuthSnafu, ConfigSnafu, ConnectionNotOpenSnafu, EmptyQuerySnafu, Error},
    token_cache::TokenCache,
};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Display, Serialize)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ConnectionState {
    #[default]
    Closed,
    Open,
}

/// A named link to the engine, owned by a single worker.
pub struct Connection {
    name: ConnectionName,
    state: ConnectionState,
    handle: Option<ConnectionWrapper>,
    credentials: Credentials,
}

impl Connection {
    pub fn new(name: impl Into<ConnectionName>, credentials: Credentials) -> Self {
        Self {
            name: name.into(),
            state: ConnectionState::Closed,
            handle: None,
            credentials,
        }
    }

    /// Creates a connection to the selected target of `profiles`, see
    /// [`ProfilesConfig::target_credentials`] for how it is selected.
    pub fn from_profiles(
        name: impl Into<ConnectionName>,
        profiles: &ProfilesConfig,
        profile: Option<&str>,
        target: Option<&str>,
    ) -> Result<Self, Error> {
        let credentials = profiles
            .target_credentials(profile, target)
            .context(ConfigSnafu)?;
        Ok(Self::new(name, credentials))
    }

    pub fn from_profiles_file(
        name: impl Into<ConnectionName>,
        profiles_file: &PathBuf,
        profile: Option<&str>,
        target: Option<&str>,
    ) -> Result<Self, Error> {
        let profiles = ProfilesConfig::read_from_file(profiles_file).context(ConfigSnafu)?;
        Self::from_profiles(name, &profiles, profile, target)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Only [`ConnectionState::Open`] after the driver connected successfully.
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    pub fn handle(&self) -> Option<&ConnectionWrapper> {
        self.handle.as_ref()
    }

    pub fn handle_mut(&mut self) -> Option<&mut ConnectionWrapper> {
        self.handle.as_mut()
    }

    /// Cancels statements of this connection while another thread runs them. Only available
    /// while the connection is open, and only valid until it is closed.
    pub fn canceller(&self) -> Option<Canceller> {
        self.handle.as_ref().map(ConnectionWrapper::canceller)
    }

    fn open_handle(&mut self) -> Result<&mut ConnectionWrapper, Error> {
        let connection_name = &self.name;
        self.handle
            .as_mut()
            .filter(|_| self.state == ConnectionState::Open)
            .context(ConnectionNotOpenSnafu { connection_name })
    }
}

/// What a statement did, returned after every top-level execute.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct AdapterResponse {
    pub message: String,
    pub query: String,
    pub query_id: Option<QueryId>,
    pub rows_affected: Option<u64>,
}

/// The result set of a statement.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct Table {
    pub columns: Vec<Column>,
    pub rows: Vec<Row>,
}

/// Opens connections and runs SQL over them.
///
/// All connections share the token cache, so a token is only requested once for all of
/// them.
pub struct ConnectionManager {
    driver: Arc<dyn Driver>,
    token_cache: Arc<TokenCache>,
}

impl ConnectionManager {
    pub fn new(driver: Arc<dyn Driver>, token_cache: Arc<TokenCache>) -> Self {
        Self {
            driver,
            token_cache,
        }
    }

    #[instrument(skip(self, connection), fields(connection = %connection.name))]
    pub fn open(&self, connection: &mut Connection) -> Result<(), Error> {
        if connection.state == ConnectionState::Open {
            debug!("Connection is already open, skipping open");
            return Ok(());
        }

        let credentials = &connection.credentials;
        let authentication = Authentication::for_credentials(credentials, &self.token_cache);
        let bearer_token = authentication.bearer_token().context(AuthSnafu {
            host: credentials.host(),
        })?;

        let params = ConnectParams::new(credentials, bearer_token);
        debug!(?params, "Connecting to engine");
        let handle = self
            .driver
            .connect(params)
            .map_err(Error::from_driver_error)?;

        connection.handle = Some(ConnectionWrapper::new(
            handle,
            credentials.prepared_statements_enabled(),
        ));
        connection.state = ConnectionState::Open;
        Ok(())
    }

    /// Closes the connection. It is closed afterwards even if the driver failed to close.
    #[instrument(skip(self, connection), fields(connection = %connection.name))]
    pub fn close(&self, connection: &mut Connection) -> Result<(), Error> {
        connection.state = ConnectionState::Closed;
        match connection.handle.take() {
            Some(mut handle) => Ok(handle.close()?),
            None => Ok(()),
        }
    }

    #[instrument(skip(self, connection), fields(connection = %connection.name))]
    pub fn cancel(&self, connection: &Connection) -> Result<(), Error> {
        match &connection.handle {
            Some(handle) => Ok(handle.cancel()?),
            None => Ok(()),
        }
    }

    /// The engine runs in autocommit, there is no transaction to begin.
    pub fn add_begin_query(&self) {}

    /// The engine runs in autocommit, there is no transaction to commit.
    pub fn add_commit_query(&self) {}

    /// Runs every statement of `sql` in order and returns the handle holding the state of the
    /// last one. Fragments that only contain comments or whitespace are skipped, but at least
    /// one statement has to be left.
    #[instrument(skip(self, connection, sql, bindings), fields(connection = %connection.name))]
    pub fn add_query<'a>(
        &self,
        connection: &'a mut Connection,
        sql: &str,
        bindings: Option<&[Value]>,
    ) -> Result<&'a mut ConnectionWrapper, Error> {
        let statements = split_statements(sql);
        if statements.is_empty() {
            let connection_name = match connection.name.as_str() {
                "" => "<None>",
                name => name,
            };
            return EmptyQuerySnafu {
                connection_name,
                sql,
            }
            .fail();
        }

        let handle = connection.open_handle()?;
        for statement in statements {
            debug!(%statement, "Executing statement");
            handle.cursor()?;
            handle.execute(&statement, bindings)?;
            debug!(query_id = ?handle.query_id(), "Statement succeeded");
        }

        Ok(handle)
    }

    pub fn get_response(handle: &ConnectionWrapper) -> AdapterResponse {
        AdapterResponse {
            message: "SUCCESS".to_owned(),
            query: handle.query().unwrap_or_default().to_owned(),
            query_id: handle.query_id().map(ToOwned::to_owned),
            rows_affected: handle.rowcount(),
        }
    }

    /// Runs `sql`, optionally fetching the result set of its last statement. At most `limit`
    /// rows are returned.
    pub fn execute(
        &self,
        connection: &mut Connection,
        sql: &str,
        fetch: bool,
        limit: Option<usize>,
    ) -> Result<(AdapterResponse, Table), Error> {
        let handle = self.add_query(connection, sql, None)?;
        let response = Self::get_response(handle);

        let table = if fetch {
            let mut rows = handle.fetchall().unwrap_or_default();
            if let Some(limit) = limit {
                rows.truncate(limit);
            }
            Table {
                columns: handle.description().map(<[_]>::to_vec).unwrap_or_default(),
                rows,
            }
        } else {
            Table::default()
        };

        Ok((response, table))
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            Barrier, Mutex,
            atomic::{AtomicUsize, Ordering},
        },
        thread,
        time::Duration,
    };

    use indoc::{formatdoc, indoc};
    use serde_json::json;

    use super::*;
    use crate::{
        connection_wrapper::tests::{MockConnection, MockState},
        driver::{DriverConnection, DriverError},
        error::ErrorKind,
        error_formatting::snafu_error_to_string,
        token_cache::tests::CountingIssuer,
    };

    struct MockDriver {
        state: Arc<Mutex<MockState>>,
        connects: AtomicUsize,
        last_params: Mutex<Option<ConnectParams>>,
        fail_connect: bool,
    }

    impl Driver for MockDriver {
        fn connect(&self, params: ConnectParams) -> Result<Box<dyn DriverConnection>, DriverError> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            *self.last_params.lock().unwrap() = Some(params);
            if self.fail_connect {
                return Err(DriverError::Connect {
                    source: Box::new(std::io::Error::from(std::io::ErrorKind::ConnectionRefused)),
                    endpoint: "https://extrica.example.com:443/v1/statement".to_owned(),
                });
            }
            Ok(Box::new(MockConnection {
                state: Arc::clone(&self.state),
            }))
        }
    }

    struct Fixture {
        manager: ConnectionManager,
        driver: Arc<MockDriver>,
        issuer: Arc<CountingIssuer>,
        state: Arc<Mutex<MockState>>,
    }

    fn fixture() -> Fixture {
        let state = Arc::new(Mutex::new(MockState {
            rows: vec![vec![json!(1)], vec![json!(2)], vec![json!(3)]],
            ..Default::default()
        }));
        let driver = Arc::new(MockDriver {
            state: Arc::clone(&state),
            connects: AtomicUsize::new(0),
            last_params: Mutex::new(None),
            fail_connect: false,
        });
        let issuer = Arc::new(CountingIssuer::new(Duration::from_secs(3600)));
        let manager = ConnectionManager::new(
            driver.clone(),
            Arc::new(TokenCache::new(issuer.clone())),
        );

        Fixture {
            manager,
            driver,
            issuer,
            state,
        }
    }

    fn credentials(prepared_statements_enabled: bool) -> Credentials {
        let yaml = formatdoc! {"
                type: extrica
                host: extrica.example.com
                port: 443
                catalog: lakehouse
                schema: public
                username: analyst@example.com
                password: secret
                impersonation_user: etl
                prepared_statements_enabled: {prepared_statements_enabled}
            "};
        Credentials::resolve(serde_yaml::from_str(&yaml).unwrap()).unwrap()
    }

    fn open_connection(fixture: &Fixture) -> Connection {
        let mut connection = Connection::new("model.jaffle_shop.orders", credentials(true));
        fixture.manager.open(&mut connection).unwrap();
        connection
    }

    #[test]
    fn test_connection_from_profiles() {
        let profiles: ProfilesConfig = serde_yaml::from_str(indoc! {"
            dbt_extrica:
              target: dev
              outputs:
                dev:
                  type: extrica
                  host: dev.extrica.example.com
                  port: 443
                  catalog: lakehouse
                  schema: dev
                  username: analyst@example.com
                  password: secret
                no_host:
                  type: extrica
                  port: 443
                  catalog: lakehouse
                  schema: dev
                  username: analyst@example.com
                  password: secret
        "})
        .unwrap();

        let connection =
            Connection::from_profiles("model.jaffle_shop.orders", &profiles, None, None).unwrap();
        assert_eq!(connection.credentials().host(), "dev.extrica.example.com");
        assert_eq!(connection.state(), ConnectionState::Closed);

        let err =
            Connection::from_profiles("model.jaffle_shop.orders", &profiles, None, Some("no_host"))
                .err()
                .unwrap();
        assert_eq!(err.kind(), ErrorKind::Config);

        let err =
            Connection::from_profiles("model.jaffle_shop.orders", &profiles, None, Some("prod"))
                .err()
                .unwrap();
        assert_eq!(err.kind(), ErrorKind::Config);

        let err = Connection::from_profiles_file(
            "model.jaffle_shop.orders",
            &PathBuf::from("/does/not/exist/profiles.yml"),
            None,
            None,
        )
        .err()
        .unwrap();
        assert_eq!(err.kind(), ErrorKind::Config);
        assert!(
            snafu_error_to_string(&err).contains("/does/not/exist/profiles.yml"),
            "{err:?}"
        );
    }

    #[test]
    fn test_open_signs_in_and_connects() {
        let fixture = fixture();
        let connection = open_connection(&fixture);

        assert_eq!(connection.state(), ConnectionState::Open);
        assert_eq!(fixture.issuer.sign_ins(), 1);

        let params = fixture.driver.last_params.lock().unwrap();
        let params = params.as_ref().unwrap();
        assert_eq!(params.user.as_deref(), Some("etl"));
        assert_eq!(params.catalog, "lakehouse");
        assert_eq!(params.max_attempts, 3);
        assert!(params.source.starts_with("dbt-extrica-"));
        assert_eq!(params.bearer_token.split('.').count(), 3);
    }

    #[test]
    fn test_open_twice_is_skipped() {
        let fixture = fixture();
        let mut connection = open_connection(&fixture);
        fixture.manager.open(&mut connection).unwrap();

        assert_eq!(fixture.driver.connects.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_connections_share_token() {
        let fixture = fixture();
        open_connection(&fixture);
        open_connection(&fixture);

        assert_eq!(fixture.driver.connects.load(Ordering::SeqCst), 2);
        assert_eq!(fixture.issuer.sign_ins(), 1);
    }

    #[test]
    fn test_failed_sign_in_keeps_connection_closed() {
        let mut fixture = fixture();
        fixture.manager = ConnectionManager::new(
            fixture.driver.clone(),
            Arc::new(TokenCache::new(Arc::new(CountingIssuer::failing()))),
        );

        let mut connection = Connection::new("model.jaffle_shop.orders", credentials(true));
        let err = fixture.manager.open(&mut connection).unwrap_err();

        assert_eq!(err.kind(), ErrorKind::Auth);
        assert_eq!(connection.state(), ConnectionState::Closed);
        assert_eq!(fixture.driver.connects.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_failed_connect_keeps_connection_closed() {
        let state = Arc::new(Mutex::new(MockState::default()));
        let driver = Arc::new(MockDriver {
            state,
            connects: AtomicUsize::new(0),
            last_params: Mutex::new(None),
            fail_connect: true,
        });
        let manager = ConnectionManager::new(
            driver,
            Arc::new(TokenCache::new(Arc::new(CountingIssuer::new(
                Duration::from_secs(3600),
            )))),
        );

        let mut connection = Connection::new("model.jaffle_shop.orders", credentials(true));
        let err = manager.open(&mut connection).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ConnectFailure);
        assert_eq!(connection.state(), ConnectionState::Closed);
        assert!(connection.handle().is_none());
    }

    #[test]
    fn test_add_query_runs_statements_and_returns_last() {
        let fixture = fixture();
        let mut connection = open_connection(&fixture);

        let handle = fixture
            .manager
            .add_query(
                &mut connection,
                "select 1; -- comment\n ;  \nselect 2;",
                None,
            )
            .unwrap();
        let response = ConnectionManager::get_response(handle);

        assert_eq!(
            response,
            AdapterResponse {
                message: "SUCCESS".to_owned(),
                query: "select 2".to_owned(),
                query_id: Some("query_2".to_owned()),
                rows_affected: Some(3),
            }
        );
        let executed: Vec<_> = fixture
            .state
            .lock()
            .unwrap()
            .executed
            .iter()
            .map(|(sql, _)| sql.clone())
            .collect();
        assert_eq!(executed, ["select 1", "select 2"]);
    }

    #[test]
    fn test_all_comment_sql_is_an_error() {
        let fixture = fixture();
        let mut connection = open_connection(&fixture);

        let sql = "-- {% if false %}\n;\n/* nothing */ ;";
        let err = fixture
            .manager
            .add_query(&mut connection, sql, None)
            .err()
            .unwrap();

        assert_eq!(err.kind(), ErrorKind::RuntimeDatabase);
        assert!(matches!(err, Error::EmptyQuery { .. }));
        assert!(err.to_string().contains("model.jaffle_shop.orders"));
        assert!(err.to_string().ends_with(sql));
        assert!(fixture.state.lock().unwrap().executed.is_empty());
    }

    #[test]
    fn test_query_error_carries_query_id() {
        let fixture = fixture();
        let mut connection = open_connection(&fixture);
        fixture.state.lock().unwrap().fail_with = Some(|| DriverError::Query {
            message: "SYNTAX_ERROR: mismatched input 'selec'".to_owned(),
            query_id: Some("20240112_082858_00002_kggk9".to_owned()),
            error_name: Some("SYNTAX_ERROR".to_owned()),
        });

        let err = fixture
            .manager
            .add_query(&mut connection, "selec 1", None)
            .err()
            .unwrap();
        assert_eq!(err.kind(), ErrorKind::Query);
        assert_eq!(err.query_id(), Some("20240112_082858_00002_kggk9"));
        assert!(err.to_string().contains("mismatched input"));
    }

    #[test]
    fn test_escape_hatch_bindings() {
        let fixture = fixture();
        let mut connection = Connection::new("seed", credentials(false));
        fixture.manager.open(&mut connection).unwrap();

        fixture
            .manager
            .add_query(
                &mut connection,
                "insert into t values (%s, %s)",
                Some(&[Value::Null, "O'Brien".into()]),
            )
            .unwrap();
        assert_eq!(
            fixture.state.lock().unwrap().executed[0].0,
            "insert into t values (NULL, 'O''Brien')"
        );

        let err = fixture
            .manager
            .add_query(
                &mut connection,
                "insert into t values (%s)",
                Some(&[Value::Array(vec![])]),
            )
            .err()
            .unwrap();
        assert_eq!(err.kind(), ErrorKind::UnsupportedBindingType);
    }

    #[test]
    fn test_execute_fetches_limited_rows() {
        let fixture = fixture();
        let mut connection = open_connection(&fixture);

        let (response, table) = fixture
            .manager
            .execute(&mut connection, "select id from t", true, Some(2))
            .unwrap();
        assert_eq!(response.query, "select id from t");
        assert_eq!(table.rows, [vec![json!(1)], vec![json!(2)]]);

        let (_, table) = fixture
            .manager
            .execute(&mut connection, "select id from t", false, None)
            .unwrap();
        assert_eq!(table, Table::default());
    }

    #[test]
    fn test_query_on_closed_connection() {
        let fixture = fixture();
        let mut connection = open_connection(&fixture);
        fixture.manager.close(&mut connection).unwrap();

        assert_eq!(connection.state(), ConnectionState::Closed);
        assert_eq!(fixture.state.lock().unwrap().closed, 1);
        let err = fixture
            .manager
            .add_query(&mut connection, "select 1", None)
            .err()
            .unwrap();
        assert!(matches!(err, Error::ConnectionNotOpen { .. }), "{err:?}");
    }

    #[test]
    fn test_cancel_and_transaction_noops() {
        let fixture = fixture();
        let mut connection = open_connection(&fixture);

        // Nothing ran yet, so there is no cursor to cancel
        fixture.manager.cancel(&connection).unwrap();
        fixture
            .manager
            .add_query(&mut connection, "select 1", None)
            .unwrap();
        fixture.manager.add_begin_query();
        fixture.manager.cancel(&connection).unwrap();
        fixture.manager.add_commit_query();

        assert_eq!(fixture.state.lock().unwrap().cancelled, 1);
        assert_eq!(connection.state(), ConnectionState::Open);
    }

    #[test]
    fn test_cancel_running_statement_from_another_thread() {
        let fixture = fixture();
        let mut connection = open_connection(&fixture);
        let started = Arc::new(Barrier::new(2));
        fixture.state.lock().unwrap().block_until_cancelled = Some(Arc::clone(&started));

        let canceller = connection.canceller().unwrap();
        let err = thread::scope(|scope| {
            scope.spawn(|| {
                started.wait();
                canceller.cancel().unwrap();
            });
            fixture
                .manager
                .add_query(&mut connection, "select * from big_table", None)
                .err()
                .unwrap()
        });

        assert_eq!(err.kind(), ErrorKind::Query);
        assert_eq!(err.query_id(), Some("query_1"));
        assert_eq!(fixture.state.lock().unwrap().cancelled, 1);
        // The connection stays usable
        assert_eq!(connection.state(), ConnectionState::Open);
    }
}
