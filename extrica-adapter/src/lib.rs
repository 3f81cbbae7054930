//! Connection lifecycle of the Extrica adapter.
//!
//! [`connection_manager::ConnectionManager`] opens authenticated connections to the
//! engine and runs SQL over them, reporting failures as [`Error`].

pub mod auth;
pub mod connection_manager;
pub mod connection_wrapper;
pub mod driver;
pub mod error;
pub mod error_formatting;
pub mod token_cache;

pub use error::{Error, ErrorKind};
