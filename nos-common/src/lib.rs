//! Common types and utilities shared between nosd and nos-agent

pub mod agent;
pub mod fsatomic;

/// Errors shared across the agent and the control plane.
///
/// Each daemon maps these onto its HTTP error taxonomy; the variants mirror
/// the short error codes returned on the wire.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("not allowed: {0}")]
    NotAllowed(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("payload too large: {0}")]
    PayloadTooLarge(String),

    #[error("rate limited, retry after {retry_after_sec}s")]
    RateLimited { retry_after_sec: u64 },

    #[error("precondition failed: {0}")]
    PreconditionFailed(String),

    #[error("not implemented: {0}")]
    NotImplemented(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
