//! Error types for playbook-runner.

use thiserror::Error;

use crate::rest::RestError;

#[derive(Debug, Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(String),

    /// Caller-supplied parameters could not be understood.
    #[error("invalid input: {0}")]
    InputFormat(String),

    #[error("invalid playbook reference '{0}': expected <repo name>/<playbook name>")]
    PlaybookReference(String),

    /// An external store call did not happen.
    #[error("{operation} failed: {source}")]
    Rest {
        operation: &'static str,
        #[source]
        source: RestError,
    },

    #[error("invalid state transition: {from} -> {to}")]
    InvalidTransition {
        from: crate::model::MarkerState,
        to: crate::model::MarkerState,
    },

    /// The store returned a record this crate cannot interpret.
    #[error("malformed record: {0}")]
    Malformed(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Tag a gateway failure with the operation that needed it.
    pub fn rest(operation: &'static str) -> impl FnOnce(RestError) -> Error {
        move |source| Error::Rest { operation, source }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
