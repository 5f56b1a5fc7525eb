//! Per-request deadlines
//!
//! A [`RequestScope`] bounds exactly one store request. Running it consumes
//! the scope, and the request future is dropped (cancelled) on every exit
//! path: completion, error or elapsed deadline.

use crate::common::error::is_etcd_deadline;
use crate::common::{Error, Result};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug)]
pub struct RequestScope {
    deadline: Instant,
    endpoints: Arc<[String]>,
}

impl RequestScope {
    pub fn new(timeout: Duration, endpoints: Arc<[String]>) -> Self {
        Self {
            deadline: Instant::now() + timeout,
            endpoints,
        }
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    /// Drive `request` until it completes or the deadline passes.
    ///
    /// Deadline failures, ours or the store's, come back as
    /// [`Error::DeadlineExceeded`] naming the configured endpoints. Other
    /// errors are returned untouched.
    pub async fn run<T, F>(self, request: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        match tokio::time::timeout_at(self.deadline, request).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(Error::Etcd(e))) if is_etcd_deadline(&e) => {
                tracing::debug!("store reported deadline exceeded: {}", e);
                Err(self.exceeded())
            }
            Ok(Err(e)) => Err(e),
            Err(_) => {
                tracing::warn!("Request to {:?} exceeded its deadline", self.endpoints);
                Err(self.exceeded())
            }
        }
    }

    fn exceeded(&self) -> Error {
        Error::DeadlineExceeded {
            endpoints: self.endpoints.to_vec(),
        }
    }
}
