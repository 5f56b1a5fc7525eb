//! Error types for coordkv

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    // === Lifecycle Errors ===
    #[error("coordination store is not initialized")]
    NotInitialized,

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    // === Concurrency Errors ===
    #[error("the value has been changed by others since revision {expected}")]
    ValueChanged { expected: i64 },

    // === Timeout Errors ===
    #[error("deadline exceeded: store({endpoints:?}) may be unreachable")]
    DeadlineExceeded { endpoints: Vec<String> },

    #[error("Operation timeout: {0}")]
    Timeout(String),

    // === Store Errors ===
    #[error("etcd error: {0}")]
    Etcd(#[from] etcd_client::Error),

    #[error("requested lease not found: {0}")]
    LeaseNotFound(i64),

    #[error("Watch error: {0}")]
    Watch(String),

    // === Config Errors ===
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Config load error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    // === Generic ===
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Does this error report an elapsed deadline?
    ///
    /// Holds for endpoint-annotated deadlines, plain request timeouts and
    /// `DEADLINE_EXCEEDED` statuses returned by the store itself.
    pub fn is_deadline_exceeded(&self) -> bool {
        match self {
            Error::DeadlineExceeded { .. } | Error::Timeout(_) => true,
            Error::Etcd(e) => is_etcd_deadline(e),
            _ => false,
        }
    }

    /// Did a concurrent writer win an optimistic-concurrency race?
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::ValueChanged { .. })
    }

    /// Is this error retryable by the caller?
    pub fn is_retryable(&self) -> bool {
        self.is_deadline_exceeded() || matches!(self, Error::ConnectionFailed(_))
    }
}

/// True if the store answered with a gRPC `DEADLINE_EXCEEDED` status.
pub(crate) fn is_etcd_deadline(e: &etcd_client::Error) -> bool {
    matches!(e, etcd_client::Error::GRpcStatus(status) if status.code() == tonic::Code::DeadlineExceeded)
}
