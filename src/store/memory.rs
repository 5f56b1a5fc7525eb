//! In-process coordination store
//!
//! Keeps the observable semantics the coordination primitives rely on:
//! a global revision bumped once per mutating request or transaction,
//! per-key create/mod revisions and versions, leases whose expiry deletes
//! their keys, and a watch feed that can replay retained history.
//!
//! Lease TTLs are measured on the tokio clock and expired lazily at the
//! start of every request, so a paused test clock controls expiry.

use super::{
    CompareTarget, CoordStore, DeleteOptions, DeleteResult, EventKind, GetOptions, GetResult,
    KeyValue, Lease, LeaseId, LeaseRevoked, PutOptions, PutResult, Revision, Txn, TxnOp,
    TxnOpResult, TxnResult, WatchEvent, WatchOptions, WatchStream,
};
use crate::common::{Error, Result};
use async_trait::async_trait;
use futures_util::StreamExt;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;

/// Events kept for watch replay before the oldest are compacted away.
const HISTORY_LIMIT: usize = 10_000;

const EVENT_CHANNEL_CAPACITY: usize = 1024;

struct LeaseEntry {
    ttl: Duration,
    deadline: Instant,
    keys: BTreeSet<String>,
}

struct State {
    revision: Revision,
    /// Oldest revision still replayable.
    compacted: Revision,
    kvs: BTreeMap<String, KeyValue>,
    leases: HashMap<LeaseId, LeaseEntry>,
    next_lease: i64,
    history: VecDeque<WatchEvent>,
}

/// In-memory [`CoordStore`].
pub struct MemStore {
    state: Mutex<State>,
    events: broadcast::Sender<WatchEvent>,
}

impl Default for MemStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            state: Mutex::new(State {
                revision: 1,
                compacted: 1,
                kvs: BTreeMap::new(),
                leases: HashMap::new(),
                next_lease: 1,
                history: VecDeque::new(),
            }),
            events,
        }
    }

    /// Current store revision.
    pub fn revision(&self) -> Revision {
        self.lock().revision
    }

    /// Number of live (unexpired, unrevoked) leases.
    pub fn lease_count(&self) -> usize {
        let mut state = self.lock();
        self.expire(&mut state);
        state.leases.len()
    }

    /// Granted TTL and time remaining for a live lease.
    pub fn time_to_live(&self, id: LeaseId) -> Option<(Duration, Duration)> {
        let mut state = self.lock();
        self.expire(&mut state);
        state
            .leases
            .get(&id)
            .map(|l| (l.ttl, l.deadline.saturating_duration_since(Instant::now())))
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emit(&self, state: &mut State, event: WatchEvent) {
        state.history.push_back(event.clone());
        // Compact whole revisions so a replay never starts mid-transaction.
        while state.history.len() > HISTORY_LIMIT {
            let Some(dropped) = state.history.pop_front() else {
                break;
            };
            let rev = dropped.kv.mod_revision;
            while state
                .history
                .front()
                .is_some_and(|e| e.kv.mod_revision == rev)
            {
                state.history.pop_front();
            }
            state.compacted = rev + 1;
        }
        // No receivers is fine.
        let _ = self.events.send(event);
    }

    /// Revoke every lease whose deadline has passed, one revision each.
    fn expire(&self, state: &mut State) {
        let now = Instant::now();
        let mut expired: Vec<LeaseId> = state
            .leases
            .iter()
            .filter(|(_, lease)| lease.deadline <= now)
            .map(|(id, _)| *id)
            .collect();
        expired.sort();
        for id in expired {
            tracing::debug!(lease = %id, "lease expired");
            self.revoke_locked(state, id);
        }
    }

    fn revoke_locked(&self, state: &mut State, id: LeaseId) -> bool {
        let Some(lease) = state.leases.remove(&id) else {
            return false;
        };
        if lease.keys.is_empty() {
            return true;
        }
        let rev = state.revision + 1;
        for key in lease.keys {
            self.delete_key(state, &key, rev);
        }
        state.revision = rev;
        true
    }

    fn delete_key(&self, state: &mut State, key: &str, rev: Revision) -> Option<KeyValue> {
        let prev = state.kvs.remove(key)?;
        if let Some(lease) = state.leases.get_mut(&prev.lease) {
            lease.keys.remove(key);
        }
        let tombstone = KeyValue {
            key: key.to_string(),
            value: Vec::new(),
            create_revision: 0,
            mod_revision: rev,
            version: 0,
            lease: LeaseId::NONE,
        };
        self.emit(
            state,
            WatchEvent {
                kind: EventKind::Delete,
                kv: tombstone,
                prev_kv: Some(prev.clone()),
            },
        );
        Some(prev)
    }

    fn check_lease(state: &State, options: &PutOptions) -> Result<()> {
        match options.lease {
            Some(id) if id != LeaseId::NONE && !state.leases.contains_key(&id) => {
                Err(Error::LeaseNotFound(id.0))
            }
            _ => Ok(()),
        }
    }

    fn apply_put(
        &self,
        state: &mut State,
        key: &str,
        value: Vec<u8>,
        options: &PutOptions,
        rev: Revision,
    ) -> Option<KeyValue> {
        let lease = options.lease.unwrap_or(LeaseId::NONE);
        let prev = state.kvs.get(key).cloned();
        if let Some(old) = &prev {
            if old.lease != lease {
                if let Some(entry) = state.leases.get_mut(&old.lease) {
                    entry.keys.remove(key);
                }
            }
        }
        if let Some(entry) = state.leases.get_mut(&lease) {
            entry.keys.insert(key.to_string());
        }
        let kv = KeyValue {
            key: key.to_string(),
            value,
            create_revision: prev.as_ref().map_or(rev, |p| p.create_revision),
            mod_revision: rev,
            version: prev.as_ref().map_or(1, |p| p.version + 1),
            lease,
        };
        state.kvs.insert(key.to_string(), kv.clone());
        self.emit(
            state,
            WatchEvent {
                kind: EventKind::Put,
                kv,
                prev_kv: prev.clone(),
            },
        );
        prev
    }

    fn apply_delete(
        &self,
        state: &mut State,
        key: &str,
        options: &DeleteOptions,
        rev: Revision,
    ) -> Vec<KeyValue> {
        let keys = matching_keys(&state.kvs, key, options.prefix);
        keys.iter()
            .filter_map(|k| self.delete_key(state, k, rev))
            .collect()
    }

    fn check_read(state: &State, options: &GetOptions) -> Result<()> {
        match options.revision {
            Some(rev) if rev > state.revision => Err(Error::InvalidArgument(format!(
                "required revision {} is a future revision (current {})",
                rev, state.revision
            ))),
            Some(rev) if rev > 0 && rev < state.revision => Err(Error::InvalidArgument(format!(
                "historical reads at revision {} are not supported in memory",
                rev
            ))),
            _ => Ok(()),
        }
    }

    fn read(state: &State, key: &str, options: &GetOptions) -> Result<GetResult> {
        Self::check_read(state, options)?;
        let keys = matching_keys(&state.kvs, key, options.prefix);
        let count = keys.len() as i64;
        let limit = match options.limit {
            Some(n) if n > 0 => n as usize,
            _ => keys.len(),
        };
        let kvs: Vec<KeyValue> = if options.count_only {
            Vec::new()
        } else {
            keys.iter()
                .take(limit)
                .filter_map(|k| state.kvs.get(k))
                .map(|kv| {
                    let mut kv = kv.clone();
                    if options.keys_only {
                        kv.value.clear();
                    }
                    kv
                })
                .collect()
        };
        Ok(GetResult {
            revision: state.revision,
            more: !options.count_only && (kvs.len() as i64) < count,
            kvs,
            count,
        })
    }

    fn compare_holds(state: &State, compare: &super::Compare) -> bool {
        let kv = state.kvs.get(&compare.key);
        match &compare.target {
            CompareTarget::Version(v) => compare.op.holds(&kv.map_or(0, |kv| kv.version), v),
            CompareTarget::CreateRevision(r) => {
                compare.op.holds(&kv.map_or(0, |kv| kv.create_revision), r)
            }
            CompareTarget::ModRevision(r) => {
                compare.op.holds(&kv.map_or(0, |kv| kv.mod_revision), r)
            }
            CompareTarget::Value(v) => match kv {
                Some(kv) => compare.op.holds(kv.value.as_slice(), v.as_slice()),
                None => false,
            },
            CompareTarget::Lease(l) => {
                compare.op.holds(&kv.map_or(LeaseId::NONE, |kv| kv.lease), l)
            }
        }
    }
}

fn matching_keys(kvs: &BTreeMap<String, KeyValue>, key: &str, prefix: bool) -> Vec<String> {
    if prefix {
        kvs.range(key.to_string()..)
            .take_while(|(k, _)| k.starts_with(key))
            .map(|(k, _)| k.clone())
            .collect()
    } else if kvs.contains_key(key) {
        vec![key.to_string()]
    } else {
        Vec::new()
    }
}

fn watch_matches(event: &WatchEvent, key: &str, prefix: bool) -> bool {
    if prefix {
        event.kv.key.starts_with(key)
    } else {
        event.kv.key == key
    }
}

#[async_trait]
impl CoordStore for MemStore {
    async fn put(&self, key: &str, value: Vec<u8>, options: PutOptions) -> Result<PutResult> {
        let mut state = self.lock();
        self.expire(&mut state);
        Self::check_lease(&state, &options)?;
        let rev = state.revision + 1;
        let prev = self.apply_put(&mut state, key, value, &options, rev);
        state.revision = rev;
        Ok(PutResult {
            revision: rev,
            prev_kv: prev.filter(|_| options.prev_kv),
        })
    }

    async fn get(&self, key: &str, options: GetOptions) -> Result<GetResult> {
        let mut state = self.lock();
        self.expire(&mut state);
        Self::read(&state, key, &options)
    }

    async fn delete(&self, key: &str, options: DeleteOptions) -> Result<DeleteResult> {
        let mut state = self.lock();
        self.expire(&mut state);
        let rev = state.revision + 1;
        let prev = self.apply_delete(&mut state, key, &options, rev);
        if !prev.is_empty() {
            state.revision = rev;
        }
        Ok(DeleteResult {
            revision: state.revision,
            deleted: prev.len() as i64,
            prev_kvs: if options.prev_kv { prev } else { Vec::new() },
        })
    }

    async fn txn(&self, txn: Txn) -> Result<TxnResult> {
        let mut state = self.lock();
        self.expire(&mut state);

        let succeeded = txn.compare.iter().all(|c| Self::compare_holds(&state, c));
        let ops = if succeeded { txn.success } else { txn.failure };

        for op in &ops {
            match op {
                TxnOp::Put { options, .. } => Self::check_lease(&state, options)?,
                TxnOp::Get { options, .. } => Self::check_read(&state, options)?,
                TxnOp::Delete { .. } => {}
            }
        }

        let rev = state.revision + 1;
        let mut wrote = false;
        let mut responses = Vec::with_capacity(ops.len());
        for op in ops {
            let response = match op {
                TxnOp::Put {
                    key,
                    value,
                    options,
                } => {
                    let prev = self.apply_put(&mut state, &key, value, &options, rev);
                    wrote = true;
                    TxnOpResult::Put(PutResult {
                        revision: rev,
                        prev_kv: prev.filter(|_| options.prev_kv),
                    })
                }
                TxnOp::Delete { key, options } => {
                    let prev = self.apply_delete(&mut state, &key, &options, rev);
                    wrote |= !prev.is_empty();
                    TxnOpResult::Delete(DeleteResult {
                        revision: rev,
                        deleted: prev.len() as i64,
                        prev_kvs: if options.prev_kv { prev } else { Vec::new() },
                    })
                }
                TxnOp::Get { key, options } => {
                    TxnOpResult::Get(Self::read(&state, &key, &options)?)
                }
            };
            responses.push(response);
        }
        if wrote {
            state.revision = rev;
        }
        Ok(TxnResult {
            succeeded,
            revision: state.revision,
            responses,
        })
    }

    async fn lease_grant(&self, ttl: i64) -> Result<Lease> {
        if ttl <= 0 {
            return Err(Error::InvalidArgument(format!(
                "lease ttl must be positive, got {}",
                ttl
            )));
        }
        let mut state = self.lock();
        self.expire(&mut state);
        let id = LeaseId(state.next_lease);
        state.next_lease += 1;
        let ttl = Duration::from_secs(ttl as u64);
        state.leases.insert(
            id,
            LeaseEntry {
                ttl,
                deadline: Instant::now() + ttl,
                keys: BTreeSet::new(),
            },
        );
        Ok(Lease { id, ttl })
    }

    async fn lease_revoke(&self, id: LeaseId) -> Result<LeaseRevoked> {
        let mut state = self.lock();
        self.expire(&mut state);
        if !self.revoke_locked(&mut state, id) {
            return Err(Error::LeaseNotFound(id.0));
        }
        Ok(LeaseRevoked {
            revision: state.revision,
        })
    }

    async fn watch(&self, key: &str, options: WatchOptions) -> Result<WatchStream> {
        let (backlog, mut rx, floor) = {
            let mut state = self.lock();
            self.expire(&mut state);
            let backlog: Vec<WatchEvent> = match options.start_revision {
                Some(start) if start > 0 => {
                    if start < state.compacted {
                        return Err(Error::Watch(format!(
                            "required revision {} has been compacted (oldest {})",
                            start, state.compacted
                        )));
                    }
                    state
                        .history
                        .iter()
                        .filter(|e| {
                            e.kv.mod_revision >= start && watch_matches(e, key, options.prefix)
                        })
                        .cloned()
                        .collect()
                }
                _ => Vec::new(),
            };
            // Live events start after the current revision, or at a later
            // start revision if one was asked for.
            let next = state.revision + 1;
            let floor = options
                .start_revision
                .filter(|s| *s > 0)
                .map_or(next, |s| s.max(next));
            (backlog, self.events.subscribe(), floor)
        };

        let key = key.to_string();
        let prefix = options.prefix;
        let live = async_stream::stream! {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        if event.kv.mod_revision >= floor && watch_matches(&event, &key, prefix) {
                            yield Ok(event);
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        yield Err(Error::Watch(format!("watcher fell behind by {} events", n)));
                        break;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        };

        let with_prev = options.prev_kv;
        let stream = futures_util::stream::iter(backlog.into_iter().map(Ok))
            .chain(live)
            .map(move |res: Result<WatchEvent>| {
                res.map(|mut event| {
                    if !with_prev {
                        event.prev_kv = None;
                    }
                    event
                })
            });
        Ok(stream.boxed())
    }
}

impl std::fmt::Debug for MemStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("MemStore")
            .field("revision", &state.revision)
            .field("keys", &state.kvs.len())
            .field("leases", &state.leases.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{Compare, CompareOp};

    #[tokio::test]
    async fn test_put_tracks_revisions_and_versions() {
        let store = MemStore::new();
        let first = store.put("a", b"1".to_vec(), PutOptions::new()).await.unwrap();
        let second = store
            .put("a", b"2".to_vec(), PutOptions::new().with_prev_kv())
            .await
            .unwrap();
        assert_eq!(second.revision, first.revision + 1);
        assert_eq!(second.prev_kv.unwrap().value, b"1");

        let got = store.get("a", GetOptions::new()).await.unwrap();
        let kv = got.first().unwrap();
        assert_eq!(kv.create_revision, first.revision);
        assert_eq!(kv.mod_revision, second.revision);
        assert_eq!(kv.version, 2);
    }

    #[tokio::test]
    async fn test_prefix_get_limit_and_count() {
        let store = MemStore::new();
        for k in ["/p/a", "/p/b", "/p/c", "/q/a"] {
            store.put(k, b"v".to_vec(), PutOptions::new()).await.unwrap();
        }
        let got = store
            .get("/p/", GetOptions::new().with_prefix().with_limit(2))
            .await
            .unwrap();
        assert_eq!(got.count, 3);
        assert_eq!(got.kvs.len(), 2);
        assert!(got.more);

        let counted = store
            .get("/p/", GetOptions::new().with_prefix().with_count_only())
            .await
            .unwrap();
        assert_eq!(counted.count, 3);
        assert!(counted.kvs.is_empty());
    }

    #[tokio::test]
    async fn test_delete_missing_key_keeps_revision() {
        let store = MemStore::new();
        let before = store.revision();
        let res = store.delete("nope", DeleteOptions::new()).await.unwrap();
        assert_eq!(res.deleted, 0);
        assert_eq!(store.revision(), before);
    }

    #[tokio::test]
    async fn test_txn_single_revision() {
        let store = MemStore::new();
        let res = store
            .txn(
                Txn::new()
                    .when(vec![Compare::version("x", CompareOp::Equal, 0)])
                    .and_then(vec![
                        TxnOp::put("x", "1", PutOptions::new()),
                        TxnOp::put("y", "2", PutOptions::new()),
                    ]),
            )
            .await
            .unwrap();
        assert!(res.succeeded);
        let x = store.get("x", GetOptions::new()).await.unwrap();
        let y = store.get("y", GetOptions::new()).await.unwrap();
        assert_eq!(x.first().unwrap().mod_revision, res.revision);
        assert_eq!(y.first().unwrap().mod_revision, res.revision);
    }

    #[tokio::test]
    async fn test_put_with_unknown_lease_fails() {
        let store = MemStore::new();
        let err = store
            .put("k", b"v".to_vec(), PutOptions::new().with_lease(LeaseId(42)))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::LeaseNotFound(42)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_lease_expiry_deletes_keys() {
        let store = MemStore::new();
        let lease = store.lease_grant(2).await.unwrap();
        store
            .put("k", b"v".to_vec(), PutOptions::new().with_lease(lease.id))
            .await
            .unwrap();
        assert_eq!(
            store.time_to_live(lease.id),
            Some((Duration::from_secs(2), Duration::from_secs(2)))
        );

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(store.get("k", GetOptions::new()).await.unwrap().count, 1);

        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(store.get("k", GetOptions::new()).await.unwrap().count, 0);
        assert_eq!(store.lease_count(), 0);
    }

    #[tokio::test]
    async fn test_rebinding_key_detaches_old_lease() {
        let store = MemStore::new();
        let l1 = store.lease_grant(60).await.unwrap();
        let l2 = store.lease_grant(60).await.unwrap();
        store
            .put("k", b"v".to_vec(), PutOptions::new().with_lease(l1.id))
            .await
            .unwrap();
        store
            .put("k", b"v".to_vec(), PutOptions::new().with_lease(l2.id))
            .await
            .unwrap();

        store.lease_revoke(l1.id).await.unwrap();
        assert_eq!(store.get("k", GetOptions::new()).await.unwrap().count, 1);
        store.lease_revoke(l2.id).await.unwrap();
        assert_eq!(store.get("k", GetOptions::new()).await.unwrap().count, 0);
    }

    #[tokio::test]
    async fn test_revoke_unknown_lease() {
        let store = MemStore::new();
        assert!(matches!(
            store.lease_revoke(LeaseId(7)).await,
            Err(Error::LeaseNotFound(7))
        ));
    }

    #[tokio::test]
    async fn test_watch_replays_from_start_revision() {
        let store = MemStore::new();
        let first = store.put("/w/a", b"1".to_vec(), PutOptions::new()).await.unwrap();
        store.put("/other", b"x".to_vec(), PutOptions::new()).await.unwrap();

        let mut stream = store
            .watch(
                "/w/",
                WatchOptions::new().with_prefix().with_start_revision(first.revision),
            )
            .await
            .unwrap();
        store.delete("/w/a", DeleteOptions::new()).await.unwrap();

        let replayed = stream.next().await.unwrap().unwrap();
        assert_eq!(replayed.kind, EventKind::Put);
        assert_eq!(replayed.kv.value, b"1");

        let live = stream.next().await.unwrap().unwrap();
        assert_eq!(live.kind, EventKind::Delete);
        assert_eq!(live.kv.key, "/w/a");
        assert!(live.prev_kv.is_none());
    }

    #[tokio::test]
    async fn test_read_at_future_revision_is_rejected() {
        let store = MemStore::new();
        store.put("k", b"v".to_vec(), PutOptions::new()).await.unwrap();
        let current = store.revision();

        let err = store
            .get("k", GetOptions::new().with_revision(current + 1))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
        assert!(err.to_string().contains("future revision"));

        let got = store
            .get("k", GetOptions::new().with_revision(current))
            .await
            .unwrap();
        assert_eq!(got.count, 1);
    }

    #[tokio::test]
    async fn test_compaction_drops_whole_revisions() {
        let store = MemStore::new();
        let txn = store
            .txn(Txn::new().and_then(vec![
                TxnOp::put("/c/a", "1", PutOptions::new()),
                TxnOp::put("/c/b", "1", PutOptions::new()),
            ]))
            .await
            .unwrap();
        // Two events at the txn revision, then enough single puts to push
        // one event past the history limit.
        for i in 0..HISTORY_LIMIT - 1 {
            store
                .put("/c/n", i.to_string().into_bytes(), PutOptions::new())
                .await
                .unwrap();
        }

        let err = store
            .watch("/c/", WatchOptions::new().with_prefix().with_start_revision(txn.revision))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, Error::Watch(_)));

        let mut stream = store
            .watch(
                "/c/",
                WatchOptions::new().with_prefix().with_start_revision(txn.revision + 1),
            )
            .await
            .unwrap();
        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(first.kv.mod_revision, txn.revision + 1);
        assert_eq!(first.kv.key, "/c/n");
    }
}
