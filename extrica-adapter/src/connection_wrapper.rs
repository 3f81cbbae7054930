//! Presents an engine connection through the usual transactional cursor interface.
//!
//! Results are prefetched on execute, so a statement has fully run on the engine when
//! [`ConnectionWrapper::execute`] returns. The engine runs every statement in autocommit,
//! which turns `commit`, `rollback` and `start_transaction` into no-ops. Callers must never
//! assume a rollback undoes an earlier statement.

use std::sync::{Arc, Mutex, PoisonError};

use extrica_adapter_core::{
    columns::Column,
    value::{self, Value, escape_literal, substitute_placeholders},
};
use snafu::{ResultExt, Snafu};
use tracing::{debug, instrument};

use crate::driver::{
    CancelHandle, DriverConnection, DriverCursor, DriverError, Row, StatementCanceller,
};

#[derive(Snafu, Debug)]
pub enum Error {
    #[snafu(display("Failed to create cursor"))]
    CreateCursor { source: DriverError },

    #[snafu(display("Failed to execute statement"))]
    Execute { source: DriverError },

    #[snafu(display("Failed to fetch results"))]
    FetchResults { source: DriverError },

    #[snafu(display("Failed to cancel statement"))]
    Cancel { source: DriverError },

    #[snafu(display("Failed to close connection"))]
    Close { source: DriverError },

    #[snafu(display("Failed to bind parameters into the statement text"))]
    BindLiterals { source: value::Error },
}

impl Error {
    /// The error of the driver call that failed, if any.
    pub fn driver_error(&self) -> Option<&DriverError> {
        match self {
            Error::CreateCursor { source }
            | Error::Execute { source }
            | Error::FetchResults { source }
            | Error::Cancel { source }
            | Error::Close { source } => Some(source),
            Error::BindLiterals { .. } => None,
        }
    }
}

/// Cancels the statement a [`ConnectionWrapper`] is running from another thread. It always
/// targets the current cursor of the wrapper it was taken from.
#[derive(Clone, Default)]
pub struct Canceller {
    current: Arc<Mutex<Option<CancelHandle>>>,
}

impl Canceller {
    fn track(&self, cursor: &dyn DriverCursor) {
        let mut current = self.current.lock().unwrap_or_else(PoisonError::into_inner);
        *current = Some(cursor.cancel_handle());
    }

    pub fn cancel(&self) -> Result<(), Error> {
        // Released before the engine is called
        let handle = self
            .current
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        match handle {
            Some(handle) => handle.cancel().context(CancelSnafu),
            None => Ok(()),
        }
    }
}

pub struct ConnectionWrapper {
    handle: Box<dyn DriverConnection>,
    cursor: Option<Box<dyn DriverCursor>>,
    canceller: Canceller,

    /// Results of the last execute, until a fetch consumes them.
    fetch_result: Option<Vec<Row>>,
    prepared_statements_enabled: bool,
}

impl ConnectionWrapper {
    pub fn new(handle: Box<dyn DriverConnection>, prepared_statements_enabled: bool) -> Self {
        Self {
            handle,
            cursor: None,
            canceller: Canceller::default(),
            fetch_result: None,
            prepared_statements_enabled,
        }
    }

    fn create_cursor(&self) -> Result<Box<dyn DriverCursor>, Error> {
        let cursor = self.handle.cursor().context(CreateCursorSnafu)?;
        self.canceller.track(cursor.as_ref());
        Ok(cursor)
    }

    /// Replaces the current cursor with a new one.
    pub fn cursor(&mut self) -> Result<&mut Self, Error> {
        self.cursor = Some(self.create_cursor()?);
        self.fetch_result = None;
        Ok(self)
    }

    /// Runs `sql` and buffers all of its result rows.
    ///
    /// With prepared statements enabled the `bindings` are sent along for native binding,
    /// otherwise they are escaped into `%s` placeholders of the statement text.
    #[instrument(skip(self, sql, bindings))]
    pub fn execute(&mut self, sql: &str, bindings: Option<&[Value]>) -> Result<(), Error> {
        self.fetch_result = None;

        let escaped_sql;
        let (sql, bindings) = match bindings {
            Some(bindings) if !self.prepared_statements_enabled => {
                let literals = bindings
                    .iter()
                    .map(escape_literal)
                    .collect::<Result<Vec<_>, _>>()
                    .context(BindLiteralsSnafu)?;
                escaped_sql = substitute_placeholders(sql, &literals).context(BindLiteralsSnafu)?;
                (escaped_sql.as_str(), None)
            }
            bindings => (sql, bindings),
        };

        let cursor = match self.cursor.take() {
            Some(cursor) => cursor,
            None => {
                debug!("No cursor created yet, creating one");
                self.create_cursor()?
            }
        };
        let cursor = self.cursor.insert(cursor);

        cursor.execute(sql, bindings).context(ExecuteSnafu)?;
        self.fetch_result = Some(cursor.fetchall().context(FetchResultsSnafu)?);
        Ok(())
    }

    /// Returns the first buffered row, the rest of the buffer is discarded.
    pub fn fetchone(&mut self) -> Option<Row> {
        self.cursor.as_ref()?;
        self.fetch_result.take()?.into_iter().next()
    }

    pub fn fetchmany(&mut self, size: usize) -> Option<Vec<Row>> {
        self.cursor.as_ref()?;
        let mut rows = self.fetch_result.take()?;
        rows.truncate(size);
        Some(rows)
    }

    pub fn fetchall(&mut self) -> Option<Vec<Row>> {
        self.cursor.as_ref()?;
        self.fetch_result.take()
    }

    pub fn cancel(&self) -> Result<(), Error> {
        self.canceller.cancel()
    }

    /// A [`Canceller`] that can be moved to another thread while this wrapper executes.
    pub fn canceller(&self) -> Canceller {
        self.canceller.clone()
    }

    pub fn close(&mut self) -> Result<(), Error> {
        self.handle.close().context(CloseSnafu)
    }

    pub fn commit(&self) {}

    pub fn rollback(&self) {}

    pub fn start_transaction(&self) {}

    /// The columns of the last executed statement.
    pub fn description(&self) -> Option<&[Column]> {
        self.cursor.as_ref()?.description()
    }

    pub fn query(&self) -> Option<&str> {
        self.cursor.as_ref()?.query()
    }

    pub fn query_id(&self) -> Option<&str> {
        self.cursor.as_ref()?.query_id()
    }

    pub fn rowcount(&self) -> Option<u64> {
        self.cursor.as_ref()?.rowcount()
    }

    pub fn prepared_statements_enabled(&self) -> bool {
        self.prepared_statements_enabled
    }
}
