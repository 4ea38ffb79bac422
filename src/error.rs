//! Layered error types for the collaboration engine.
//!
//! Each component owns a narrow error enum; `CollabError` is the one surfaced
//! across the websocket and pull-surface boundaries, mapped to the wire
//! `code` values documented in the external interface.

use thiserror::Error;
use uuid::Uuid;

/// Errors from the pure operational-transformation core.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum OtError {
    #[error("position {position} out of bounds for text of length {len}")]
    InvalidPosition { position: u64, len: u64 },
    #[error("delete range [{position}, {end}) exceeds text of length {len}")]
    InvalidRange { position: u64, end: u64, len: u64 },
}

/// Errors from a single document's Hub.
#[derive(Debug, Error)]
pub enum HubError {
    #[error(transparent)]
    Ot(#[from] OtError),
    #[error("base_version {base_version} is below the retained floor {floor}")]
    StaleBase { base_version: u64, floor: u64 },
    #[error("operation position or length is invalid after transformation")]
    InvalidPosition,
    #[error("inbound queue is full")]
    Overloaded,
    #[error("session {0} is not subscribed to this hub")]
    UnknownSession(Uuid),
    #[error("hub has terminated")]
    Terminated,
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Errors from the durable operation log.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("store is unavailable")]
    Unavailable,
}

/// Top-level error surfaced across the websocket and HTTP pull-surface boundaries.
#[derive(Debug, Error)]
pub enum CollabError {
    #[error(transparent)]
    Hub(#[from] HubError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("document {0} is unknown")]
    UnknownDocument(Uuid),
    #[error("session {0} is closed")]
    SessionClosed(Uuid),
    #[error("internal error: {0}")]
    Internal(String),
}

/// The stable wire error code reported to clients, per the external interface spec.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    StaleBase,
    InvalidPosition,
    Overloaded,
    UnknownDocument,
    SessionClosed,
    Internal,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::StaleBase => "STALE_BASE",
            ErrorCode::InvalidPosition => "INVALID_POSITION",
            ErrorCode::Overloaded => "OVERLOADED",
            ErrorCode::UnknownDocument => "UNKNOWN_DOCUMENT",
            ErrorCode::SessionClosed => "SESSION_CLOSED",
            ErrorCode::Internal => "INTERNAL",
        }
    }
}

impl CollabError {
    pub fn code(&self) -> ErrorCode {
        match self {
            CollabError::Hub(HubError::StaleBase { .. }) => ErrorCode::StaleBase,
            CollabError::Hub(HubError::InvalidPosition) | CollabError::Hub(HubError::Ot(_)) => {
                ErrorCode::InvalidPosition
            }
            CollabError::Hub(HubError::Overloaded) => ErrorCode::Overloaded,
            CollabError::Hub(HubError::UnknownSession(_))
            | CollabError::Hub(HubError::Terminated) => ErrorCode::SessionClosed,
            CollabError::Hub(HubError::Store(_)) | CollabError::Store(_) => ErrorCode::Internal,
            CollabError::UnknownDocument(_) => ErrorCode::UnknownDocument,
            CollabError::SessionClosed(_) => ErrorCode::SessionClosed,
            CollabError::Internal(_) => ErrorCode::Internal,
        }
    }
}

pub type OtResult<T> = Result<T, OtError>;
pub type HubResult<T> = Result<T, HubError>;
pub type StoreResult<T> = Result<T, StoreError>;
pub type CollabResult<T> = Result<T, CollabError>;
