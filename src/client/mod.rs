//! Coordination client
//!
//! [`Coordinator`] owns the connection to the coordination store. It is
//! built once at startup, initialized with [`Coordinator::initialize`] and
//! then shared (usually in an `Arc`) with everything that needs it:
//! - key-value operations and optimistic-concurrency puts (`kv`)
//! - lease grant/revoke (`lease`)
//! - distributed locks (`lock`)
//! - watch subscriptions (`watch`)
//!
//! Every operation checks for an installed handle first and fails with
//! [`Error::NotInitialized`] without touching the network otherwise.

pub mod deadline;
pub mod kv;
pub mod lease;
pub mod lock;
pub mod watch;

pub use deadline::RequestScope;

use crate::common::{Error, Result, StoreConfig};
use crate::store::{CoordStore, EtcdStore};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

/// An established store connection plus its per-request timeout.
///
/// Immutable once built; safe to share between any number of tasks.
pub struct StoreHandle {
    store: Arc<dyn CoordStore>,
    endpoints: Arc<[String]>,
    request_timeout: Duration,
}

impl StoreHandle {
    pub fn new(
        store: Arc<dyn CoordStore>,
        endpoints: Vec<String>,
        request_timeout: Duration,
    ) -> Self {
        Self {
            store,
            endpoints: endpoints.into(),
            request_timeout,
        }
    }

    /// Dial an etcd cluster as described by `config`.
    pub async fn connect(config: &StoreConfig) -> Result<Self> {
        let store = EtcdStore::connect(config).await?;
        Ok(Self::new(
            Arc::new(store),
            config.endpoints.clone(),
            config.request_timeout(),
        ))
    }

    pub fn store(&self) -> &dyn CoordStore {
        self.store.as_ref()
    }

    pub fn endpoints(&self) -> &[String] {
        &self.endpoints
    }

    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    /// Start a request bounded by `now + request_timeout`.
    pub fn scope(&self) -> RequestScope {
        RequestScope::new(self.request_timeout, self.endpoints.clone())
    }
}

impl std::fmt::Debug for StoreHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreHandle")
            .field("endpoints", &self.endpoints)
            .field("request_timeout", &self.request_timeout)
            .finish()
    }
}

/// Owner of the process's store connection.
#[derive(Debug, Default)]
pub struct Coordinator {
    handle: RwLock<Option<Arc<StoreHandle>>>,
}

impl Coordinator {
    /// An uninitialized coordinator.
    pub fn new() -> Self {
        Self::default()
    }

    /// A coordinator that already holds `handle`.
    pub fn with_handle(handle: StoreHandle) -> Self {
        let coordinator = Self::new();
        coordinator.install(handle);
        coordinator
    }

    /// Connect to the configured store and make it the active handle.
    ///
    /// Meant to run once during startup. A second call replaces the handle
    /// (last writer wins); operations already running keep the old one.
    pub async fn initialize(&self, config: &StoreConfig) -> Result<Arc<StoreHandle>> {
        tracing::info!(
            "Connecting to coordination store {:?} (dial timeout {}s, request timeout {}s)",
            config.endpoints,
            config.dial_timeout,
            config.req_timeout
        );
        let handle = StoreHandle::connect(config).await.inspect_err(|e| {
            tracing::error!("Failed to connect to coordination store: {}", e);
        })?;
        tracing::info!("Coordination store connected");
        Ok(self.install(handle))
    }

    /// Make `handle` the active handle, replacing any previous one.
    pub fn install(&self, handle: StoreHandle) -> Arc<StoreHandle> {
        let handle = Arc::new(handle);
        let previous = self
            .handle
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .replace(handle.clone());
        if previous.is_some() {
            tracing::warn!("Coordination store handle replaced");
        }
        handle
    }

    /// The active handle, if any. Absence is logged, not an error.
    pub fn handle(&self) -> Option<Arc<StoreHandle>> {
        let handle = self.current();
        if handle.is_none() {
            tracing::warn!("Coordination store is not initialized");
        }
        handle
    }

    pub fn is_initialized(&self) -> bool {
        self.current().is_some()
    }

    fn current(&self) -> Option<Arc<StoreHandle>> {
        self.handle
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub(crate) fn require(&self) -> Result<Arc<StoreHandle>> {
        self.current().ok_or(Error::NotInitialized)
    }
}
