// src/error.rs
//! Error types shared across the VIGIL pipeline.
//!
//! Background loops never die on a per-record error: they log it and move
//! on. The HTTP surface is the only place errors are flattened into status
//! codes.

use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, VigilError>;

#[derive(Error, Debug)]
pub enum VigilError {
    /// An alarm expression failed to lex or parse.
    #[error("invalid alarm expression: {0}")]
    Expression(String),

    /// Malformed caller input: bad JSON, missing required fields, or an
    /// alarm-definition update that breaks the structural invariants.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// A store lookup by id came back empty.
    #[error("not found: {0}")]
    NotFound(String),

    /// The message bus is unreachable or a send/receive failed after the
    /// configured retries.
    #[error("bus error: {0}")]
    Bus(String),

    /// The document store returned a failure or could not be reached.
    #[error("store error: {0}")]
    Store(String),

    #[error("configuration error: {0}")]
    Config(String),

    /// Startup failure that must abort the process, e.g. the metrics index
    /// template could not be installed.
    #[error("fatal: {0}")]
    Fatal(String),

    #[error("smtp error: {0}")]
    Smtp(#[from] lettre::transport::smtp::Error),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

impl VigilError {
    /// Whether the error is the caller's fault (maps to 4xx at the HTTP
    /// boundary) rather than an upstream failure.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            VigilError::Expression(_) | VigilError::InvalidInput(_) | VigilError::NotFound(_)
        )
    }
}
