//! Error kinds and their disposition, per the error-handling design.
//!
//! Every external failure is local to the operation that produced it; the
//! engine never panics its way out of a caller's hands in non-test code.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("config error at '{key}': {detail}")]
    Config { key: String, detail: String },

    #[error("persistence backend rejected write: {0}")]
    Persistence(String),
}

pub type Result<T> = std::result::Result<T, Error>;
