//! Centralized error types for mailsnare.

use thiserror::Error;

use crate::model::message::MessageId;

/// Errors returned by the message store and the parser.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// No message with this id (or it was deleted).
    #[error("No such message: {0}")]
    NotFound(MessageId),

    /// The message exists but has no part at this index or Content-ID.
    #[error("Message {id} has no part {part}")]
    PartNotFound { id: MessageId, part: String },

    /// The raw bytes could not be decomposed into parts at all.
    #[error("Failed to parse message structure: {0}")]
    ParseFailed(String),

    /// The store lock was poisoned by a panicking writer.
    #[error("Message store unavailable")]
    Unavailable,
}

impl StoreError {
    /// `true` for the negative results a caller is expected to handle
    /// as a normal "not found" response.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_) | Self::PartNotFound { .. })
    }
}

/// Errors surfaced to the protocol collaborator on ingestion.
#[derive(Error, Debug)]
pub enum IngestError {
    /// The store could not accept the message right now; the client should retry.
    #[error("Temporary failure storing message: {0}")]
    Transient(#[source] StoreError),

    /// The envelope is unusable (e.g. no recipients).
    #[error("Rejected envelope: {0}")]
    Rejected(String),
}

/// Convenience alias for `Result<T, StoreError>`.
pub type Result<T> = std::result::Result<T, StoreError>;
