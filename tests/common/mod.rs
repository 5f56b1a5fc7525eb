//! Shared fixtures for integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use coordkv::store::{DeleteResult, GetResult, LeaseRevoked, PutResult, Txn, TxnResult};
use coordkv::{
    CoordStore, Coordinator, DeleteOptions, GetOptions, Lease, LeaseId, MemStore, PutOptions,
    Result, StoreHandle, WatchOptions, WatchStream,
};
use futures_util::StreamExt;
use std::sync::Arc;
use std::time::Duration;

pub const ENDPOINTS: &[&str] = &["127.0.0.1:2379"];

pub fn endpoints() -> Vec<String> {
    ENDPOINTS.iter().map(|e| e.to_string()).collect()
}

/// A coordinator over a fresh in-memory store with a 3s request timeout.
pub fn mem_coordinator() -> (Arc<Coordinator>, Arc<MemStore>) {
    let store = Arc::new(MemStore::new());
    let coord = Coordinator::with_handle(StoreHandle::new(
        store.clone(),
        endpoints(),
        Duration::from_secs(3),
    ));
    (Arc::new(coord), store)
}

/// A store that never answers.
pub struct StalledStore;

#[async_trait]
impl CoordStore for StalledStore {
    async fn put(&self, _key: &str, _value: Vec<u8>, _options: PutOptions) -> Result<PutResult> {
        std::future::pending().await
    }

    async fn get(&self, _key: &str, _options: GetOptions) -> Result<GetResult> {
        std::future::pending().await
    }

    async fn delete(&self, _key: &str, _options: DeleteOptions) -> Result<DeleteResult> {
        std::future::pending().await
    }

    async fn txn(&self, _txn: Txn) -> Result<TxnResult> {
        std::future::pending().await
    }

    async fn lease_grant(&self, _ttl: i64) -> Result<Lease> {
        std::future::pending().await
    }

    async fn lease_revoke(&self, _id: LeaseId) -> Result<LeaseRevoked> {
        std::future::pending().await
    }

    async fn watch(&self, _key: &str, _options: WatchOptions) -> Result<WatchStream> {
        Ok(futures_util::stream::pending().boxed())
    }
}
