//! The seam between the connection lifecycle and the client speaking the engine's wire
//! protocol.
//!
//! Every error a driver returns is tagged with its kind right where the failing call is
//! made, so the connection manager can classify it without inspecting opaque error types.

use std::{collections::BTreeMap, fmt::Debug, path::PathBuf, sync::Arc};

use extrica_adapter_core::{
    QueryId, columns::Column, credentials::Credentials, credentials::HttpScheme,
    sanitization::Sanitize, value::Value,
};
use http::HeaderMap;
use snafu::Snafu;
use strum::Display;

pub mod protocol;
pub mod trino;

pub use trino::TrinoDriver;

/// A single result row, one JSON value per column.
pub type Row = Vec<serde_json::Value>;

pub type BoxedError = Box<dyn std::error::Error + Send + Sync>;

/// Drivers put this into the message of every error caused by not reaching the engine at all.
pub const CONNECT_FAILURE_SIGNATURE: &str = "Failed to establish a new connection";

#[derive(Snafu, Debug)]
#[snafu(visibility(pub))]
pub enum DriverError {
    #[snafu(display("Failed to establish a new connection to {endpoint}"))]
    Connect { source: BoxedError, endpoint: String },

    #[snafu(display("{message}"))]
    Query {
        message: String,
        query_id: Option<QueryId>,
        error_name: Option<String>,
    },

    #[snafu(display("Request to {endpoint} failed with HTTP status {status}: {body}"))]
    HttpStatus {
        endpoint: String,
        status: u16,
        body: String,
    },

    #[snafu(display("Failed to send request to {endpoint}"))]
    SendRequest { source: BoxedError, endpoint: String },

    #[snafu(display("Unexpected response from the engine: {message}"))]
    Protocol { message: String },

    #[snafu(display("{message}"))]
    Other { message: String },
}

impl DriverError {
    pub fn other(message: impl Into<String>) -> Self {
        Self::Other {
            message: message.into(),
        }
    }

    /// The id the engine assigned to the failed query, if it got that far.
    pub fn query_id(&self) -> Option<&str> {
        match self {
            DriverError::Query { query_id, .. } => query_id.as_deref(),
            _ => None,
        }
    }
}

/// The engine runs every statement in its own transaction, other levels are rejected by
/// the drivers.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Display)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
pub enum IsolationLevel {
    #[default]
    AutoCommit,
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

/// Everything a driver needs to open a connection.
#[derive(Clone)]
pub struct ConnectParams {
    pub host: String,
    pub port: u16,
    pub http_scheme: HttpScheme,
    pub user: Option<String>,
    pub catalog: String,
    pub schema: String,
    pub client_tags: Vec<String>,
    pub roles: BTreeMap<String, String>,
    pub bearer_token: String,
    pub max_attempts: u32,
    pub isolation_level: IsolationLevel,
    pub source: String,
    pub cert: Option<PathBuf>,
    pub timezone: Option<String>,
    pub session_properties: BTreeMap<String, serde_json::Value>,
    pub http_headers: HeaderMap,
}

impl ConnectParams {
    pub fn new(credentials: &Credentials, bearer_token: String) -> Self {
        Self {
            host: credentials.host().to_owned(),
            port: credentials.port(),
            http_scheme: credentials.http_scheme(),
            user: credentials.session_user().map(ToOwned::to_owned),
            catalog: credentials.database().to_owned(),
            schema: credentials.schema().to_owned(),
            client_tags: credentials.client_tags().to_vec(),
            roles: credentials.roles().clone(),
            bearer_token,
            max_attempts: credentials.retries(),
            isolation_level: IsolationLevel::AutoCommit,
            source: format!("dbt-extrica-{}", env!("CARGO_PKG_VERSION")),
            cert: credentials.cert().cloned(),
            timezone: credentials.timezone().map(ToOwned::to_owned),
            session_properties: credentials.session_properties().clone(),
            http_headers: credentials.http_headers().clone(),
        }
    }
}

impl Debug for ConnectParams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectParams")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("http_scheme", &self.http_scheme)
            .field("user", &self.user)
            .field("catalog", &self.catalog)
            .field("schema", &self.schema)
            .field("client_tags", &self.client_tags)
            .field("roles", &self.roles)
            .field("bearer_token", &"<redacted>")
            .field("max_attempts", &self.max_attempts)
            .field("isolation_level", &self.isolation_level)
            .field("source", &self.source)
            .field("cert", &self.cert)
            .field("timezone", &self.timezone)
            .field("session_properties", &self.session_properties)
            .field("http_headers", &self.http_headers.sanitize())
            .finish()
    }
}

pub trait Driver: Send + Sync {
    fn connect(&self, params: ConnectParams) -> Result<Box<dyn DriverConnection>, DriverError>;
}

/// An open link to the engine. Connections are cursor factories, they don't hold any
/// server side state themselves.
pub trait DriverConnection: Send {
    fn cursor(&self) -> Result<Box<dyn DriverCursor>, DriverError>;

    fn close(&mut self) -> Result<(), DriverError>;
}

/// Cancels the statement of the cursor it was taken from.
pub trait StatementCanceller: Send + Sync {
    /// Does nothing when no statement is running.
    fn cancel(&self) -> Result<(), DriverError>;
}

/// Can be moved to other threads and used there while the cursor blocks in `execute`.
pub type CancelHandle = Arc<dyn StatementCanceller>;

pub trait DriverCursor: Send {
    /// Runs `sql`, binding `params` to its `?` placeholders natively when given.
    fn execute(&mut self, sql: &str, params: Option<&[Value]>) -> Result<(), DriverError>;

    /// Returns all remaining rows of the last executed statement.
    fn fetchall(&mut self) -> Result<Vec<Row>, DriverError>;

    /// The columns of the last executed statement, if it produced a result set.
    fn description(&self) -> Option<&[Column]>;

    /// The statement text that was sent to the engine.
    fn query(&self) -> Option<&str>;

    fn query_id(&self) -> Option<&str>;

    /// Number of rows changed by the last statement, if the engine reported it.
    fn rowcount(&self) -> Option<u64>;

    fn cancel_handle(&self) -> CancelHandle;

    /// Cancels the running statement, does nothing when no statement is running.
    fn cancel(&self) -> Result<(), DriverError> {
        self.cancel_handle().cancel()
    }
}
