//! Key-value operations
//!
//! Every call is bounded by its own [`RequestScope`](super::RequestScope);
//! a store that does not answer in time yields a deadline error.

use super::Coordinator;
use crate::common::{Error, Result};
use crate::store::{
    Compare, CompareOp, DeleteOptions, DeleteResult, GetOptions, GetResult, PutOptions, PutResult,
    Revision, Txn, TxnOp, TxnOpResult,
};

impl Coordinator {
    pub async fn put(
        &self,
        key: &str,
        value: impl Into<Vec<u8>>,
        options: PutOptions,
    ) -> Result<PutResult> {
        let handle = self.require()?;
        tracing::debug!("put {}", key);
        handle
            .scope()
            .run(handle.store().put(key, value.into(), options))
            .await
    }

    /// Put `value` under a freshly granted lease of `ttl` seconds.
    ///
    /// The put is not attempted if the grant fails.
    pub async fn put_with_lease(
        &self,
        key: &str,
        value: impl Into<Vec<u8>>,
        ttl: i64,
    ) -> Result<PutResult> {
        let handle = self.require()?;
        let lease = self.grant(ttl).await?;
        tracing::debug!("put {} with lease {} ({}s)", key, lease.id, ttl);
        handle
            .scope()
            .run(
                handle
                    .store()
                    .put(key, value.into(), PutOptions::new().with_lease(lease.id)),
            )
            .await
    }

    /// Put only if `key` was last modified at `expected`.
    ///
    /// `None` (or `Some(0)`) skips the check and does a plain put. When
    /// another writer got there first this fails with
    /// [`Error::ValueChanged`]; re-read and retry.
    pub async fn put_with_expected_revision(
        &self,
        key: &str,
        value: impl Into<Vec<u8>>,
        expected: Option<Revision>,
    ) -> Result<PutResult> {
        let handle = self.require()?;
        let expected = match expected {
            Some(rev) if rev != 0 => rev,
            _ => return self.put(key, value, PutOptions::new()).await,
        };

        let txn = Txn::new()
            .when(vec![Compare::mod_revision(key, CompareOp::Equal, expected)])
            .and_then(vec![TxnOp::put(key, value, PutOptions::new())]);
        let resp = handle.scope().run(handle.store().txn(txn)).await?;

        if !resp.succeeded {
            tracing::debug!("put {} rejected: revision moved past {}", key, expected);
            return Err(Error::ValueChanged { expected });
        }
        match resp.responses.into_iter().next() {
            Some(TxnOpResult::Put(put)) => Ok(put),
            _ => Err(Error::Internal(format!(
                "transaction on {} succeeded without a put response",
                key
            ))),
        }
    }

    pub async fn get(&self, key: &str, options: GetOptions) -> Result<GetResult> {
        let handle = self.require()?;
        tracing::debug!("get {}", key);
        handle.scope().run(handle.store().get(key, options)).await
    }

    pub async fn delete(&self, key: &str, options: DeleteOptions) -> Result<DeleteResult> {
        let handle = self.require()?;
        tracing::debug!("delete {}", key);
        handle.scope().run(handle.store().delete(key, options)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::StoreHandle;
    use crate::store::MemStore;
    use std::sync::Arc;
    use std::time::Duration;

    fn coordinator() -> Coordinator {
        Coordinator::with_handle(StoreHandle::new(
            Arc::new(MemStore::new()),
            vec!["mem:0".to_string()],
            Duration::from_secs(3),
        ))
    }

    #[tokio::test]
    async fn test_put_get_roundtrip() {
        let coord = coordinator();
        coord.put("/cfg/a", "v1", PutOptions::new()).await.unwrap();
        let got = coord.get("/cfg/a", GetOptions::new()).await.unwrap();
        assert_eq!(got.first().unwrap().value, b"v1");
    }

    #[tokio::test]
    async fn test_expected_revision_zero_is_plain_put() {
        let coord = coordinator();
        coord.put("k", "a", PutOptions::new()).await.unwrap();
        coord
            .put_with_expected_revision("k", "b", Some(0))
            .await
            .unwrap();
        coord.put_with_expected_revision("k", "c", None).await.unwrap();
        let got = coord.get("k", GetOptions::new()).await.unwrap();
        assert_eq!(got.first().unwrap().value, b"c");
    }

    #[tokio::test]
    async fn test_expected_revision_match_and_mismatch() {
        let coord = coordinator();
        let first = coord.put("k", "a", PutOptions::new()).await.unwrap();

        let second = coord
            .put_with_expected_revision("k", "b", Some(first.revision))
            .await
            .unwrap();
        assert!(second.revision > first.revision);

        let err = coord
            .put_with_expected_revision("k", "c", Some(first.revision))
            .await
            .unwrap_err();
        assert!(err.is_conflict());

        let got = coord.get("k", GetOptions::new()).await.unwrap();
        assert_eq!(got.first().unwrap().value, b"b");
        assert_eq!(got.first().unwrap().mod_revision, second.revision);
    }

    #[tokio::test]
    async fn test_expected_revision_on_missing_key_conflicts() {
        let coord = coordinator();
        let err = coord
            .put_with_expected_revision("missing", "x", Some(5))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::ValueChanged { expected: 5 }));
    }

    #[tokio::test]
    async fn test_put_with_lease_binds_key() {
        let coord = coordinator();
        coord.put_with_lease("/svc/a", "up", 30).await.unwrap();
        let kv = coord
            .get("/svc/a", GetOptions::new())
            .await
            .unwrap()
            .kvs
            .remove(0);
        assert_ne!(kv.lease, crate::store::LeaseId::NONE);

        coord.revoke(kv.lease).await.unwrap();
        assert_eq!(coord.get("/svc/a", GetOptions::new()).await.unwrap().count, 0);
    }

    #[tokio::test]
    async fn test_put_with_lease_grant_failure_skips_put() {
        let coord = coordinator();
        let err = coord.put_with_lease("/svc/b", "up", 0).await.unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
        assert_eq!(coord.get("/svc/b", GetOptions::new()).await.unwrap().count, 0);
    }

    #[tokio::test]
    async fn test_delete_prefix() {
        let coord = coordinator();
        for k in ["/jobs/1", "/jobs/2", "/other"] {
            coord.put(k, "x", PutOptions::new()).await.unwrap();
        }
        let res = coord
            .delete("/jobs/", DeleteOptions::new().with_prefix().with_prev_kv())
            .await
            .unwrap();
        assert_eq!(res.deleted, 2);
        assert_eq!(res.prev_kvs.len(), 2);
        assert_eq!(
            coord
                .get("/", GetOptions::new().with_prefix())
                .await
                .unwrap()
                .count,
            1
        );
    }
}
