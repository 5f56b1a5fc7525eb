//! Watch subscriptions

use super::Coordinator;
use crate::common::Result;
use crate::store::{WatchOptions, WatchStream};

impl Coordinator {
    /// Subscribe to changes of `key` (or everything under it with
    /// [`WatchOptions::with_prefix`]).
    ///
    /// The stream has no deadline and runs until it is dropped.
    pub async fn watch(&self, key: &str, options: WatchOptions) -> Result<WatchStream> {
        let handle = self.require()?;
        tracing::debug!("watch {} (prefix: {})", key, options.prefix);
        handle.store().watch(key, options).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::StoreHandle;
    use crate::store::{EventKind, MemStore, PutOptions};
    use futures_util::StreamExt;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_watch_sees_later_writes_only() {
        let coord = Coordinator::with_handle(StoreHandle::new(
            Arc::new(MemStore::new()),
            vec!["mem:0".to_string()],
            Duration::from_secs(3),
        ));
        coord.put("/conf/a", "old", PutOptions::new()).await.unwrap();

        let mut events = coord
            .watch("/conf/", WatchOptions::new().with_prefix())
            .await
            .unwrap();
        coord.put("/conf/a", "new", PutOptions::new()).await.unwrap();

        let event = events.next().await.unwrap().unwrap();
        assert_eq!(event.kind, EventKind::Put);
        assert_eq!(event.kv.value, b"new");
    }
}
