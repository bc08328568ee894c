//! Core error type.
//!
//! Variants are grouped by *kind*, not by call site, matching the recovery
//! table the rest of the gateway is built against: invalid input is
//! surfaced to the caller, parse/state errors are logged and the offending
//! message or entry is dropped, queue-full is returned to the producer, and
//! transport errors tear the connection down for the outer supervisor to
//! reconnect.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("parse error: {0}")]
    ParseError(String),

    #[error("state conflict: {0}")]
    StateConflict(String),

    #[error("queue full")]
    QueueFull,

    #[error("transport error: {0}")]
    TransportError(String),

    #[error("not initialized")]
    NotInitialized,
}

pub type Result<T> = std::result::Result<T, GatewayError>;
