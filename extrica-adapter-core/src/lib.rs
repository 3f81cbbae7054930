pub mod columns;
pub mod config;
pub mod credentials;
pub mod sanitization;
pub mod statements;
pub mod value;

pub type QueryId = String;
pub type ConnectionName = String;

/// The adapter type profiles have to declare in their `type` field.
pub const ADAPTER_TYPE: &str = "extrica";
