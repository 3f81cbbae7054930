use extrica_adapter_core::{ConnectionName, QueryId, config, value};
use snafu::Snafu;
use strum::Display;
use tracing::debug;

use crate::{
    connection_wrapper,
    driver::{CONNECT_FAILURE_SIGNATURE, DriverError},
    error_formatting::snafu_error_to_string,
    token_cache,
};

/// The kinds of failures callers of the adapter distinguish.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Display)]
pub enum ErrorKind {
    /// Bad or missing credential fields, surfaced immediately and never retried.
    Config,

    /// Sign-in failed. Fatal for the connection attempt.
    Auth,

    /// The engine could not be reached. Callers may retry.
    ConnectFailure,

    /// The engine rejected or failed a statement.
    Query,

    UnsupportedBindingType,

    /// Everything not classified otherwise.
    RuntimeDatabase,
}

#[derive(Snafu, Debug)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display("Failed to load the connection profile"))]
    Config { source: config::Error },

    #[snafu(display("Failed to authenticate against {host}"))]
    Auth {
        source: token_cache::Error,
        host: String,
    },

    #[snafu(display("{source}"))]
    ConnectFailure { source: DriverError },

    #[snafu(display(
        "{message} (query id: {})",
        query_id.as_deref().unwrap_or("<unknown>")
    ))]
    Query {
        message: String,
        query_id: Option<QueryId>,
    },

    #[snafu(display("Cannot escape binding of type {type_name} into a SQL literal"))]
    UnsupportedBindingType { type_name: String },

    #[snafu(display("{message}"))]
    Database { message: String },

    #[snafu(display("{message}"))]
    Runtime { message: String },

    #[snafu(display(
        "Tried to run an empty query on model '{connection_name}'. If you are conditionally \
         running\nsql, eg. in a model hook, make sure your `else` clause contains valid \
         sql!\n\nProvided SQL:\n{sql}"
    ))]
    EmptyQuery {
        connection_name: ConnectionName,
        sql: String,
    },

    #[snafu(display("The connection {connection_name:?} is not open"))]
    ConnectionNotOpen { connection_name: ConnectionName },
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Config { .. } => ErrorKind::Config,
            Error::Auth { .. } => ErrorKind::Auth,
            Error::ConnectFailure { .. } => ErrorKind::ConnectFailure,
            Error::Query { .. } => ErrorKind::Query,
            Error::UnsupportedBindingType { .. } => ErrorKind::UnsupportedBindingType,
            Error::Database { .. }
            | Error::Runtime { .. }
            | Error::EmptyQuery { .. }
            | Error::ConnectionNotOpen { .. } => ErrorKind::RuntimeDatabase,
        }
    }

    /// The id of the failed query, if the engine got far enough to assign one.
    pub fn query_id(&self) -> Option<&str> {
        match self {
            Error::Query { query_id, .. } => query_id.as_deref(),
            _ => None,
        }
    }

    /// Classifies an error of the driver by the tag it was given at the failing call, falling
    /// back to the message for failures to reach the engine that were tagged otherwise.
    pub fn from_driver_error(err: DriverError) -> Self {
        let message = snafu_error_to_string(&err);
        if matches!(err, DriverError::Connect { .. }) || message.contains(CONNECT_FAILURE_SIGNATURE)
        {
            return Error::ConnectFailure { source: err };
        }

        match err {
            DriverError::Query {
                message, query_id, ..
            } => {
                debug!(?query_id, "Engine query id");
                debug!(%message, "Engine error");
                Error::Query { message, query_id }
            }
            _ => {
                debug!(%message, "Engine error");
                Error::Database { message }
            }
        }
    }
}

impl From<connection_wrapper::Error> for Error {
    fn from(err: connection_wrapper::Error) -> Self {
        use connection_wrapper::Error as WrapperError;

        match err {
            WrapperError::BindLiterals {
                source: value::Error::UnsupportedBindingType { type_name },
            } => Error::UnsupportedBindingType { type_name },
            WrapperError::BindLiterals { source } => Error::Runtime {
                message: source.to_string(),
            },
            WrapperError::CreateCursor { source }
            | WrapperError::Execute { source }
            | WrapperError::FetchResults { source }
            | WrapperError::Cancel { source }
            | WrapperError::Close { source } => Error::from_driver_error(source),
        }
    }
}
