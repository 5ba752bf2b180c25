//! Hub error types.

use std::fmt;
use thiserror::Error;

/// Failure reported by a single subscriber
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HandlerError {
    /// The handler returned an error
    #[error("{0}")]
    Failed(String),

    /// The handler panicked
    #[error("handler panicked")]
    Panicked,

    /// A route received a message of another type
    #[error("message is not a {expected}")]
    TypeMismatch {
        /// Type id the route expected
        expected: &'static str,
    },
}

impl HandlerError {
    /// Wrap any displayable error
    pub fn failed(err: impl fmt::Display) -> Self {
        HandlerError::Failed(err.to_string())
    }
}

/// Hub errors
#[derive(Error, Debug, Clone)]
pub enum HubError {
    /// Some subscribers failed; every subscriber still ran
    #[error("{} of {total} handlers for {type_id} failed", errors.len())]
    HandlerFailures {
        /// Type id of the published message
        type_id: String,
        /// Number of handlers invoked
        total: usize,
        /// One entry per failed handler
        errors: Vec<HandlerError>,
    },
}
