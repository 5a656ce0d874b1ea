//! Errors raised by the registrar and the call state machine

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// A call event arrived in a state that does not accept it
    #[error("illegal call transition: {0}")]
    InvalidStateTransition(String),

    /// Unknown or expired AOR, unknown call
    #[error("not found: {0}")]
    NotFound(String),

    /// Malformed input from the wire (bad AOR, missing expiry, ...)
    #[error("invalid request: {0}")]
    ValidationError(String),

    #[error("internal error: {0}")]
    Internal(String),
}
