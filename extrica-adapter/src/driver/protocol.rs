//! Types and headers of the Trino client statement protocol.

use extrica_adapter_core::{QueryId, columns::Column};
use serde::{Deserialize, Serialize};

use crate::driver::Row;

pub const HEADER_USER: &str = "x-trino-user";
pub const HEADER_SOURCE: &str = "x-trino-source";
pub const HEADER_CATALOG: &str = "x-trino-catalog";
pub const HEADER_SCHEMA: &str = "x-trino-schema";
pub const HEADER_SESSION: &str = "x-trino-session";
pub const HEADER_ROLE: &str = "x-trino-role";
pub const HEADER_CLIENT_TAGS: &str = "x-trino-client-tags";
pub const HEADER_TIME_ZONE: &str = "x-trino-time-zone";

pub const HEADER_SET_CATALOG: &str = "x-trino-set-catalog";
pub const HEADER_SET_SCHEMA: &str = "x-trino-set-schema";
pub const HEADER_SET_SESSION: &str = "x-trino-set-session";
pub const HEADER_CLEAR_SESSION: &str = "x-trino-clear-session";

/// One page of results, as returned by `POST /v1/statement` and every following `nextUri`.
#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryResults {
    pub id: QueryId,
    pub info_uri: Option<String>,

    /// Set as long as the query has more pages, the last page has none.
    pub next_uri: Option<String>,
    pub partial_cancel_uri: Option<String>,

    pub columns: Option<Vec<Column>>,
    pub data: Option<Vec<Row>>,

    pub error: Option<QueryError>,
    #[serde(default)]
    pub warnings: Vec<Warning>,

    pub stats: Option<Stat>,

    pub update_type: Option<String>,
    pub update_count: Option<u64>,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryError {
    pub message: String,
    pub error_code: Option<i64>,
    pub error_name: Option<String>,
    pub error_type: Option<String>,
    pub error_location: Option<ErrorLocation>,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorLocation {
    pub line_number: u32,
    pub column_number: u32,
}

#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Warning {
    pub warning_code: Option<serde_json::Value>,
    pub message: String,
}

/// Only the parts of the query stats needed for diagnostics.
#[derive(Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Stat {
    pub state: String,
    #[serde(default)]
    pub queued: bool,
    #[serde(default)]
    pub scheduled: bool,
    #[serde(default)]
    pub processed_rows: u64,
    pub progress_percentage: Option<f32>,
}

impl QueryError {
    /// The message as the engine's own clients print it, including the error name and the
    /// position of the offending token. Most engine messages already start with the position.
    pub fn full_message(&self) -> String {
        let message = match &self.error_location {
            Some(location) if !self.message.starts_with("line ") => format!(
                "line {}:{}: {}",
                location.line_number, location.column_number, self.message
            ),
            _ => self.message.clone(),
        };
        match &self.error_name {
            Some(error_name) => format!("{error_name}: {message}"),
            None => message,
        }
    }
}
