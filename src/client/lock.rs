//! Distributed lock
//!
//! A lock named `n` is held while the key `/common/lock/<n>` exists. It is
//! taken by creating that key under the holder's lease in a single
//! transaction, and freed by deleting it or by the lease running out. No
//! lock state is kept in process.
//!
//! Lock names should pass [`is_valid_as_key_path`](crate::common::is_valid_as_key_path)
//! before use.

use super::Coordinator;
use crate::common::{lock_key, Result};
use crate::store::{Compare, CompareOp, DeleteOptions, LeaseId, PutOptions, Txn, TxnOp};

impl Coordinator {
    /// Try to take the lock `name` under `lease`.
    ///
    /// Returns `Ok(false)` when somebody else holds it. Exactly one of any
    /// number of concurrent callers gets `Ok(true)`.
    pub async fn acquire_lock(&self, name: &str, lease: LeaseId) -> Result<bool> {
        let handle = self.require()?;
        let key = lock_key(name);
        let txn = Txn::new()
            .when(vec![Compare::create_revision(&key, CompareOp::Equal, 0)])
            .and_then(vec![TxnOp::put(
                &key,
                Vec::new(),
                PutOptions::new().with_lease(lease),
            )]);
        let resp = handle.scope().run(handle.store().txn(txn)).await?;
        if resp.succeeded {
            tracing::debug!("lock {} acquired with lease {}", name, lease);
        } else {
            tracing::debug!("lock {} is busy", name);
        }
        Ok(resp.succeeded)
    }

    /// Free the lock `name`.
    ///
    /// Deletes the lock key whoever holds it; releasing a free lock is a
    /// no-op.
    pub async fn release_lock(&self, name: &str) -> Result<()> {
        self.delete(&lock_key(name), DeleteOptions::new()).await?;
        tracing::debug!("lock {} released", name);
        Ok(())
    }
}
