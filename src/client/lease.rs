//! Lease grant and revoke
//!
//! Leases are never renewed here. A caller that needs a key to outlive its
//! lease TTL must re-grant and rebind it.

use super::Coordinator;
use crate::common::{Error, Result};
use crate::store::{Lease, LeaseId, LeaseRevoked};

impl Coordinator {
    /// Grant a lease of `ttl` seconds.
    pub async fn grant(&self, ttl: i64) -> Result<Lease> {
        let handle = self.require()?;
        if ttl <= 0 {
            return Err(Error::InvalidArgument(format!(
                "lease ttl must be positive, got {}",
                ttl
            )));
        }
        let lease = handle.scope().run(handle.store().lease_grant(ttl)).await?;
        tracing::debug!("granted lease {} for {:?}", lease.id, lease.ttl);
        Ok(lease)
    }

    /// End `id` now, deleting every key attached to it.
    pub async fn revoke(&self, id: LeaseId) -> Result<LeaseRevoked> {
        let handle = self.require()?;
        let timeout = handle.request_timeout();
        match tokio::time::timeout(timeout, handle.store().lease_revoke(id)).await {
            Ok(res) => {
                if res.is_ok() {
                    tracing::debug!("revoked lease {}", id);
                }
                res
            }
            Err(_) => Err(Error::Timeout(format!(
                "revoking lease {} took longer than {:?}",
                id, timeout
            ))),
        }
    }
}
