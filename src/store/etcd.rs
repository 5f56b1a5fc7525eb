//! etcd v3 backend
//!
//! Translates [`CoordStore`] requests into `etcd-client` calls. The etcd
//! client is a cheap handle over a shared gRPC channel, so each request
//! works on its own clone and no lock is needed.

use super::{
    Compare, CompareOp, CompareTarget, CoordStore, DeleteOptions, DeleteResult, EventKind,
    GetOptions, GetResult, KeyValue, Lease, LeaseId, LeaseRevoked, PutOptions, PutResult, Txn,
    TxnOp, TxnOpResult, TxnResult, WatchEvent, WatchOptions, WatchStream,
};
use crate::common::{Error, Result, StoreConfig};
use async_trait::async_trait;
use etcd_client::{Client, ConnectOptions};
use futures_util::StreamExt;
use std::time::Duration;

/// [`CoordStore`] over an etcd cluster.
#[derive(Clone)]
pub struct EtcdStore {
    client: Client,
}

impl EtcdStore {
    /// Dial the configured endpoints and confirm one of them answers, all
    /// within the dial timeout.
    pub async fn connect(config: &StoreConfig) -> Result<Self> {
        config.validate()?;
        let dial_timeout = config.dial_timeout();

        let mut options = ConnectOptions::new().with_connect_timeout(dial_timeout);
        if let (Some(user), Some(password)) = (&config.username, &config.password) {
            options = options.with_user(user.clone(), password.clone());
        }

        let dial = async {
            let mut client = Client::connect(&config.endpoints, Some(options)).await?;
            client.status().await?;
            Ok::<_, etcd_client::Error>(client)
        };

        match tokio::time::timeout(dial_timeout, dial).await {
            Ok(Ok(client)) => Ok(Self { client }),
            Ok(Err(e)) => Err(Error::ConnectionFailed(format!(
                "etcd({:?}): {}",
                config.endpoints, e
            ))),
            Err(_) => Err(Error::ConnectionFailed(format!(
                "etcd({:?}): no endpoint reachable within {:?}",
                config.endpoints, dial_timeout
            ))),
        }
    }

    /// Wrap an already connected client.
    pub fn from_client(client: Client) -> Self {
        Self { client }
    }
}

impl std::fmt::Debug for EtcdStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EtcdStore").finish_non_exhaustive()
    }
}

// === Conversions ===

fn kv_from(kv: &etcd_client::KeyValue) -> KeyValue {
    KeyValue {
        key: String::from_utf8_lossy(kv.key()).into_owned(),
        value: kv.value().to_vec(),
        create_revision: kv.create_revision(),
        mod_revision: kv.mod_revision(),
        version: kv.version(),
        lease: LeaseId(kv.lease()),
    }
}

fn header_revision(header: Option<&etcd_client::ResponseHeader>) -> i64 {
    header.map_or(0, |h| h.revision())
}

fn put_options(options: &PutOptions) -> etcd_client::PutOptions {
    let mut opts = etcd_client::PutOptions::new();
    if let Some(lease) = options.lease {
        opts = opts.with_lease(lease.0);
    }
    if options.prev_kv {
        opts = opts.with_prev_key();
    }
    opts
}

fn get_options(options: &GetOptions) -> etcd_client::GetOptions {
    let mut opts = etcd_client::GetOptions::new();
    if options.prefix {
        opts = opts.with_prefix();
    }
    if let Some(limit) = options.limit {
        opts = opts.with_limit(limit);
    }
    if let Some(revision) = options.revision {
        opts = opts.with_revision(revision);
    }
    if options.keys_only {
        opts = opts.with_keys_only();
    }
    if options.count_only {
        opts = opts.with_count_only();
    }
    opts
}

fn delete_options(options: &DeleteOptions) -> etcd_client::DeleteOptions {
    let mut opts = etcd_client::DeleteOptions::new();
    if options.prefix {
        opts = opts.with_prefix();
    }
    if options.prev_kv {
        opts = opts.with_prev_key();
    }
    opts
}

fn watch_options(options: &WatchOptions) -> etcd_client::WatchOptions {
    let mut opts = etcd_client::WatchOptions::new();
    if options.prefix {
        opts = opts.with_prefix();
    }
    if let Some(revision) = options.start_revision {
        opts = opts.with_start_revision(revision);
    }
    if options.prev_kv {
        opts = opts.with_prev_key();
    }
    opts
}

fn compare_op(op: CompareOp) -> etcd_client::CompareOp {
    match op {
        CompareOp::Equal => etcd_client::CompareOp::Equal,
        CompareOp::NotEqual => etcd_client::CompareOp::NotEqual,
        CompareOp::Greater => etcd_client::CompareOp::Greater,
        CompareOp::Less => etcd_client::CompareOp::Less,
    }
}

fn compare(c: Compare) -> etcd_client::Compare {
    let op = compare_op(c.op);
    match c.target {
        CompareTarget::Version(v) => etcd_client::Compare::version(c.key, op, v),
        CompareTarget::CreateRevision(r) => etcd_client::Compare::create_revision(c.key, op, r),
        CompareTarget::ModRevision(r) => etcd_client::Compare::mod_revision(c.key, op, r),
        CompareTarget::Value(v) => etcd_client::Compare::value(c.key, op, v),
        CompareTarget::Lease(l) => etcd_client::Compare::lease(c.key, op, l.0),
    }
}

fn txn_op(op: TxnOp) -> etcd_client::TxnOp {
    match op {
        TxnOp::Put {
            key,
            value,
            options,
        } => etcd_client::TxnOp::put(key, value, Some(put_options(&options))),
        TxnOp::Get { key, options } => etcd_client::TxnOp::get(key, Some(get_options(&options))),
        TxnOp::Delete { key, options } => {
            etcd_client::TxnOp::delete(key, Some(delete_options(&options)))
        }
    }
}

fn put_result(resp: &etcd_client::PutResponse) -> PutResult {
    PutResult {
        revision: header_revision(resp.header()),
        prev_kv: resp.prev_key().map(kv_from),
    }
}

fn get_result(resp: &etcd_client::GetResponse) -> GetResult {
    GetResult {
        revision: header_revision(resp.header()),
        kvs: resp.kvs().iter().map(kv_from).collect(),
        count: resp.count(),
        more: resp.more(),
    }
}

fn delete_result(resp: &etcd_client::DeleteResponse) -> DeleteResult {
    DeleteResult {
        revision: header_revision(resp.header()),
        deleted: resp.deleted(),
        prev_kvs: resp.prev_kvs().iter().map(kv_from).collect(),
    }
}

fn txn_op_result(resp: etcd_client::TxnOpResponse) -> Result<TxnOpResult> {
    match resp {
        etcd_client::TxnOpResponse::Put(r) => Ok(TxnOpResult::Put(put_result(&r))),
        etcd_client::TxnOpResponse::Get(r) => Ok(TxnOpResult::Get(get_result(&r))),
        etcd_client::TxnOpResponse::Delete(r) => Ok(TxnOpResult::Delete(delete_result(&r))),
        etcd_client::TxnOpResponse::Txn(_) => {
            Err(Error::Internal("unexpected nested transaction response".into()))
        }
    }
}

fn watch_event(event: &etcd_client::Event) -> Option<WatchEvent> {
    let kind = match event.event_type() {
        etcd_client::EventType::Put => EventKind::Put,
        etcd_client::EventType::Delete => EventKind::Delete,
    };
    Some(WatchEvent {
        kind,
        kv: kv_from(event.kv()?),
        prev_kv: event.prev_kv().map(kv_from),
    })
}

#[async_trait]
impl CoordStore for EtcdStore {
    async fn put(&self, key: &str, value: Vec<u8>, options: PutOptions) -> Result<PutResult> {
        let mut client = self.client.clone();
        let resp = client.put(key, value, Some(put_options(&options))).await?;
        Ok(put_result(&resp))
    }

    async fn get(&self, key: &str, options: GetOptions) -> Result<GetResult> {
        let mut client = self.client.clone();
        let resp = client.get(key, Some(get_options(&options))).await?;
        Ok(get_result(&resp))
    }

    async fn delete(&self, key: &str, options: DeleteOptions) -> Result<DeleteResult> {
        let mut client = self.client.clone();
        let resp = client.delete(key, Some(delete_options(&options))).await?;
        Ok(delete_result(&resp))
    }

    async fn txn(&self, txn: Txn) -> Result<TxnResult> {
        let request = etcd_client::Txn::new()
            .when(txn.compare.into_iter().map(compare).collect::<Vec<_>>())
            .and_then(txn.success.into_iter().map(txn_op).collect::<Vec<_>>())
            .or_else(txn.failure.into_iter().map(txn_op).collect::<Vec<_>>());

        let mut client = self.client.clone();
        let resp = client.txn(request).await?;
        let responses = resp
            .op_responses()
            .into_iter()
            .map(txn_op_result)
            .collect::<Result<Vec<_>>>()?;
        Ok(TxnResult {
            succeeded: resp.succeeded(),
            revision: header_revision(resp.header()),
            responses,
        })
    }

    async fn lease_grant(&self, ttl: i64) -> Result<Lease> {
        let mut client = self.client.clone();
        let resp = client.lease_grant(ttl, None).await?;
        Ok(Lease {
            id: LeaseId(resp.id()),
            ttl: Duration::from_secs(resp.ttl().max(0) as u64),
        })
    }

    async fn lease_revoke(&self, id: LeaseId) -> Result<LeaseRevoked> {
        let mut client = self.client.clone();
        let resp = client.lease_revoke(id.0).await?;
        Ok(LeaseRevoked {
            revision: header_revision(resp.header()),
        })
    }

    async fn watch(&self, key: &str, options: WatchOptions) -> Result<WatchStream> {
        let mut client = self.client.clone();
        let (watcher, mut stream) = client.watch(key, Some(watch_options(&options))).await?;
        let key = key.to_string();

        let events = async_stream::stream! {
            // The watch stays open only as long as its watcher is alive.
            let _watcher = watcher;
            loop {
                match stream.message().await {
                    Ok(Some(resp)) => {
                        if resp.canceled() {
                            yield Err(Error::Watch(format!(
                                "watch on {} canceled (compact revision {}): {}",
                                key,
                                resp.compact_revision(),
                                resp.cancel_reason()
                            )));
                            break;
                        }
                        for event in resp.events().iter().filter_map(watch_event) {
                            yield Ok(event);
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        yield Err(Error::Etcd(e));
                        break;
                    }
                }
            }
        };
        Ok(events.boxed())
    }
}
