//! The resolver service and its fetch machinery.
//!
//! The fctx population is partitioned into buckets by question-name hash.
//! Each bucket owns a long-lived worker task draining an mpsc channel; all
//! task-serialized fctx state is mutated only on that worker. Bucket-locked
//! state (membership, waiter lists, lifecycle flags) lives behind the
//! bucket's mutex so callers on arbitrary tasks can join, cancel, and
//! observe completion.

mod caching;
mod classify;
mod context;
mod query;

use crate::adb::Adb;
use crate::cache::CacheDb;
use crate::dispatch::Dispatcher;
use crate::hints::Hints;
use crate::rdataset::Rdataset;
use crate::validate::{NullValidator, Validator};
use crate::view::View;
use compact_str::CompactString;
use self::context::{FctxInit, FetchMachine};
use hickory_proto::rr::{Name, RecordType};
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;
use taproot_domain::{FetchOptions, FetchOutcome, ForwardPolicy, ResolverConfig, ResolverError};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::oneshot;
use tracing::{debug, info, trace};

pub(crate) type FctxId = u64;

/// Events delivered to a bucket worker.
pub(crate) enum BucketMsg {
    Start { fctx: FctxId, init: Box<FctxInit> },
    Control { fctx: FctxId },
    Timeout { fctx: FctxId, epoch: u64 },
    Response { fctx: FctxId, query: u64, event: ResponseEvent },
    FindDone { fctx: FctxId, found: bool },
}

pub(crate) enum ResponseEvent {
    Packet { bytes: Vec<u8>, via_tcp: bool },
    TcpError(String),
}

/// What one waiter observes: the learned outcome with the canonical records,
/// or a fetch-terminating error.
pub type FetchReply = Result<FetchResponse, ResolverError>;

#[derive(Debug, Clone)]
pub struct FetchResponse {
    pub outcome: FetchOutcome,
    /// Owner name of the canonical answer rdataset.
    pub name: Name,
    pub rdataset: Option<Rdataset>,
    pub sigrdataset: Option<Rdataset>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FctxState {
    Init,
    Active,
    Done,
}

pub(crate) struct Waiter {
    pub id: u64,
    pub tx: oneshot::Sender<FetchReply>,
}

pub(crate) type FctxKey = (CompactString, RecordType, u32);

pub(crate) struct FctxShared {
    pub state: FctxState,
    pub want_shutdown: bool,
    pub references: u32,
    pub waiters: Vec<Waiter>,
    pub key: FctxKey,
}

#[derive(Default)]
pub(crate) struct BucketShared {
    pub exiting: bool,
    pub fctxs: HashMap<FctxId, FctxShared>,
    pub by_key: HashMap<FctxKey, FctxId>,
}

pub(crate) struct Bucket {
    pub tx: UnboundedSender<BucketMsg>,
    pub shared: Mutex<BucketShared>,
}

struct Lifecycle {
    exiting: bool,
    active_buckets: usize,
    listeners: Vec<oneshot::Sender<()>>,
}

pub(crate) struct ResolverInner {
    config: RwLock<ResolverConfig>,
    frozen: AtomicBool,
    lifecycle: Mutex<Lifecycle>,
    pub(crate) buckets: Vec<Bucket>,
    pub(crate) disp_v4: Option<Dispatcher>,
    pub(crate) disp_v6: Option<Dispatcher>,
    pub(crate) adb: Arc<Adb>,
    pub(crate) cache: Arc<CacheDb>,
    pub(crate) view: Arc<View>,
    pub(crate) validator: Arc<dyn Validator>,
    next_fctx: AtomicU64,
    next_waiter: AtomicU64,
}

/// The top-level iterative resolver service.
pub struct Resolver {
    inner: Arc<ResolverInner>,
}

impl Resolver {
    pub async fn new(config: ResolverConfig, hints: Hints) -> Result<Self, ResolverError> {
        Self::with_validator(config, hints, Arc::new(NullValidator)).await
    }

    pub async fn with_validator(
        config: ResolverConfig,
        hints: Hints,
        validator: Arc<dyn Validator>,
    ) -> Result<Self, ResolverError> {
        config.validate()?;

        let hints = Arc::new(hints);
        let cache = Arc::new(CacheDb::new());
        let view = Arc::new(View::new(
            Arc::clone(&cache),
            Arc::clone(&hints),
            &config.security_roots,
        )?);
        let adb = Arc::new(Adb::new(
            Arc::clone(&cache),
            Arc::clone(&hints),
            Duration::from_secs(config.lame_ttl_secs),
            config.dns_port,
        ));

        let disp_v4 = if config.bind_ipv4 {
            Some(
                Dispatcher::bind(
                    IpAddr::V4(Ipv4Addr::UNSPECIFIED),
                    config.query_port_min,
                    config.query_port_max,
                )
                .await?,
            )
        } else {
            None
        };
        let disp_v6 = if config.bind_ipv6 {
            // Lack of IPv6 connectivity is common; fall back to v4-only.
            Dispatcher::bind(
                IpAddr::V6(Ipv6Addr::UNSPECIFIED),
                config.query_port_min,
                config.query_port_max,
            )
            .await
            .ok()
        } else {
            None
        };
        if disp_v4.is_none() && disp_v6.is_none() {
            return Err(ResolverError::Io("no usable address family".into()));
        }

        let nbuckets = config.nbuckets;
        let mut buckets = Vec::with_capacity(nbuckets);
        let mut receivers = Vec::with_capacity(nbuckets);
        for _ in 0..nbuckets {
            let (tx, rx) = mpsc::unbounded_channel();
            buckets.push(Bucket {
                tx,
                shared: Mutex::new(BucketShared::default()),
            });
            receivers.push(rx);
        }

        let inner = Arc::new(ResolverInner {
            config: RwLock::new(config),
            frozen: AtomicBool::new(false),
            lifecycle: Mutex::new(Lifecycle {
                exiting: false,
                active_buckets: nbuckets,
                listeners: Vec::new(),
            }),
            buckets,
            disp_v4,
            disp_v6,
            adb: Arc::clone(&adb),
            cache,
            view,
            validator,
            next_fctx: AtomicU64::new(1),
            next_waiter: AtomicU64::new(1),
        });

        adb.set_resolver(Arc::downgrade(&inner));
        for (idx, rx) in receivers.into_iter().enumerate() {
            let weak = Arc::downgrade(&inner);
            tokio::spawn(bucket_worker(weak, idx, rx));
        }

        info!(nbuckets, "Resolver created");
        Ok(Resolver { inner })
    }

    /// Replaces the default forwarder list. Rejected once frozen.
    pub fn set_forwarders(&self, forwarders: Vec<SocketAddr>) -> Result<(), ResolverError> {
        if self.inner.frozen.load(Ordering::Acquire) {
            return Err(ResolverError::Frozen);
        }
        self.inner.config.write().unwrap().forwarders = forwarders;
        Ok(())
    }

    /// Sets the forward policy. Rejected once frozen.
    pub fn set_forward_policy(&self, policy: ForwardPolicy) -> Result<(), ResolverError> {
        if self.inner.frozen.load(Ordering::Acquire) {
            return Err(ResolverError::Frozen);
        }
        self.inner.config.write().unwrap().forward_policy = policy;
        Ok(())
    }

    /// Registers a shutdown listener. Rejected once frozen.
    pub fn when_shutdown(&self) -> Result<oneshot::Receiver<()>, ResolverError> {
        if self.inner.frozen.load(Ordering::Acquire) {
            return Err(ResolverError::Frozen);
        }
        let (tx, rx) = oneshot::channel();
        self.inner.lifecycle.lock().unwrap().listeners.push(tx);
        Ok(rx)
    }

    /// Configuration ends here; fetches may start.
    pub fn freeze(&self) {
        self.inner.frozen.store(true, Ordering::Release);
    }

    /// Starts (or joins) a fetch for (name, type).
    pub fn create_fetch(
        &self,
        name: &Name,
        qtype: RecordType,
        options: FetchOptions,
    ) -> Result<Fetch, ResolverError> {
        self.inner
            .create_fetch_full(name, qtype, options, None, false)
    }

    /// Starts a fetch with an explicit starting zone cut, bypassing the
    /// view's zone-cut lookup.
    pub fn create_fetch_with_domain(
        &self,
        name: &Name,
        qtype: RecordType,
        options: FetchOptions,
        domain: Name,
        nameservers: Rdataset,
    ) -> Result<Fetch, ResolverError> {
        self.inner
            .create_fetch_full(name, qtype, options, Some((domain, nameservers)), false)
    }

    /// Idempotent: cascades shutdown to every bucket and cancels pending
    /// waiters. Listeners fire once every bucket has quiesced.
    pub fn shutdown(&self) {
        let inner = &self.inner;
        {
            let mut lifecycle = inner.lifecycle.lock().unwrap();
            if lifecycle.exiting {
                return;
            }
            lifecycle.exiting = true;
        }
        info!("Resolver shutting down");

        let mut now_empty = 0;
        for bucket in &inner.buckets {
            let mut shared = bucket.shared.lock().unwrap();
            shared.exiting = true;
            if shared.fctxs.is_empty() {
                now_empty += 1;
            }
            for (&id, fctx) in shared.fctxs.iter_mut() {
                fctx.want_shutdown = true;
                let _ = bucket.tx.send(BucketMsg::Control { fctx: id });
            }
        }
        inner.dec_active_buckets(now_empty);

        if let Some(dispatcher) = &inner.disp_v4 {
            dispatcher.shutdown();
        }
        if let Some(dispatcher) = &inner.disp_v6 {
            dispatcher.shutdown();
        }
    }

    pub fn cache(&self) -> &Arc<CacheDb> {
        &self.inner.cache
    }
}

impl ResolverInner {
    pub(crate) fn config(&self) -> std::sync::RwLockReadGuard<'_, ResolverConfig> {
        self.config.read().unwrap()
    }

    pub(crate) fn dispatcher(&self, v6: bool) -> Option<&Dispatcher> {
        if v6 {
            self.disp_v6.as_ref()
        } else {
            self.disp_v4.as_ref()
        }
    }

    /// Fetch used by the ADB to learn nameserver addresses.
    pub(crate) fn create_fetch_internal(
        self: &Arc<Self>,
        name: &Name,
        qtype: RecordType,
        options: FetchOptions,
        start_at_root: bool,
    ) -> Result<Fetch, ResolverError> {
        let domain = if start_at_root {
            let hints = self.view.hints();
            Some((hints.zone().clone(), hints.ns().clone()))
        } else {
            None
        };
        self.create_fetch_full(name, qtype, options, domain, true)
    }

    fn create_fetch_full(
        self: &Arc<Self>,
        name: &Name,
        qtype: RecordType,
        options: FetchOptions,
        domain: Option<(Name, Rdataset)>,
        internal: bool,
    ) -> Result<Fetch, ResolverError> {
        if !self.frozen.load(Ordering::Acquire) {
            return Err(ResolverError::NotFrozen);
        }
        if self.lifecycle.lock().unwrap().exiting {
            return Err(ResolverError::ShuttingDown);
        }

        let name = name.to_lowercase();
        let key: FctxKey = (CacheDb::name_key(&name), qtype, options.bits());
        let bucket_idx = bucket_for(&key.0, self.buckets.len());
        let bucket = &self.buckets[bucket_idx];

        let mut shared = bucket.shared.lock().unwrap();
        if shared.exiting {
            return Err(ResolverError::ShuttingDown);
        }

        let waiter_id = self.next_waiter.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();

        if !options.contains(FetchOptions::UNSHARED) {
            if let Some(&existing) = shared.by_key.get(&key) {
                if let Some(fctx) = shared.fctxs.get_mut(&existing) {
                    if fctx.state != FctxState::Done {
                        fctx.references += 1;
                        fctx.waiters.push(Waiter { id: waiter_id, tx });
                        trace!(name = %name, ?qtype, fctx = existing, "Joined in-flight fetch");
                        return Ok(Fetch {
                            inner: Arc::clone(self),
                            bucket: bucket_idx,
                            fctx: existing,
                            waiter: waiter_id,
                            rx: Some(rx),
                        });
                    }
                }
            }
        }

        let fctx_id = self.next_fctx.fetch_add(1, Ordering::Relaxed);
        let init = {
            let config = self.config();
            let (domain, nameservers) = match domain {
                Some((d, ns)) => (d.to_lowercase(), ns),
                None => {
                    if config.forward_policy == ForwardPolicy::Only {
                        (Name::root(), Rdataset::from_ns_names(Name::root(), 0, &[]))
                    } else {
                        let (d, ns) = self.view.find_zonecut(&name, std::time::Instant::now());
                        (d.to_lowercase(), ns)
                    }
                }
            };
            let fwd_servers = if config.forward_policy == ForwardPolicy::None {
                Vec::new()
            } else {
                config.forwarders_for(key.0.as_str()).to_vec()
            };
            FctxInit {
                name: name.clone(),
                qtype,
                options,
                domain,
                nameservers,
                fwd_servers,
                forward_only: config.forward_policy == ForwardPolicy::Only,
                lifetime: Duration::from_secs(config.lifetime_secs),
                internal,
            }
        };

        shared.fctxs.insert(
            fctx_id,
            FctxShared {
                state: FctxState::Init,
                want_shutdown: false,
                references: 1,
                waiters: vec![Waiter { id: waiter_id, tx }],
                key: key.clone(),
            },
        );
        shared.by_key.insert(key, fctx_id);
        drop(shared);

        debug!(name = %name, ?qtype, fctx = fctx_id, bucket = bucket_idx, "Created fetch");
        let _ = bucket.tx.send(BucketMsg::Start {
            fctx: fctx_id,
            init: Box::new(init),
        });

        Ok(Fetch {
            inner: Arc::clone(self),
            bucket: bucket_idx,
            fctx: fctx_id,
            waiter: waiter_id,
            rx: Some(rx),
        })
    }

    /// Fans the terminal reply out to every waiter and marks the fctx done.
    /// Runs under the bucket lock so a joiner can never race past the
    /// transition.
    pub(crate) fn finish_fctx(&self, bucket_idx: usize, fctx_id: FctxId, reply: FetchReply) {
        let bucket = &self.buckets[bucket_idx];
        let mut shared = bucket.shared.lock().unwrap();
        let Some(fctx) = shared.fctxs.get_mut(&fctx_id) else {
            return;
        };
        if fctx.state == FctxState::Done {
            return;
        }
        fctx.state = FctxState::Done;
        let waiters = std::mem::take(&mut fctx.waiters);
        let key = fctx.key.clone();
        let references = fctx.references;

        trace!(fctx = fctx_id, waiters = waiters.len(), "Fanning out fetch result");
        for waiter in waiters {
            let _ = waiter.tx.send(reply.clone());
        }

        if shared.by_key.get(&key) == Some(&fctx_id) {
            shared.by_key.remove(&key);
        }
        if references == 0 {
            shared.fctxs.remove(&fctx_id);
            if shared.exiting && shared.fctxs.is_empty() {
                drop(shared);
                self.dec_active_buckets(1);
            }
        }
    }

    fn cancel_fetch(&self, bucket_idx: usize, fctx_id: FctxId, waiter_id: u64) {
        let bucket = &self.buckets[bucket_idx];
        let mut shared = bucket.shared.lock().unwrap();
        let Some(fctx) = shared.fctxs.get_mut(&fctx_id) else {
            return;
        };
        if fctx.state == FctxState::Done {
            return;
        }
        if let Some(pos) = fctx.waiters.iter().position(|w| w.id == waiter_id) {
            let waiter = fctx.waiters.remove(pos);
            let _ = waiter.tx.send(Err(ResolverError::Canceled));
        }
    }

    fn release_fetch(&self, bucket_idx: usize, fctx_id: FctxId, waiter_id: u64) {
        let bucket = &self.buckets[bucket_idx];
        let mut shared = bucket.shared.lock().unwrap();
        let Some(fctx) = shared.fctxs.get_mut(&fctx_id) else {
            return;
        };
        fctx.references = fctx.references.saturating_sub(1);
        if fctx.state != FctxState::Done {
            if let Some(pos) = fctx.waiters.iter().position(|w| w.id == waiter_id) {
                fctx.waiters.remove(pos);
            }
        }
        if fctx.references > 0 {
            return;
        }
        match fctx.state {
            FctxState::Done => {
                let key = fctx.key.clone();
                shared.fctxs.remove(&fctx_id);
                if shared.by_key.get(&key) == Some(&fctx_id) {
                    shared.by_key.remove(&key);
                }
                if shared.exiting && shared.fctxs.is_empty() {
                    drop(shared);
                    self.dec_active_buckets(1);
                }
            }
            _ => {
                // Last reference gone mid-flight: initiate fctx shutdown.
                fctx.want_shutdown = true;
                let _ = bucket.tx.send(BucketMsg::Control { fctx: fctx_id });
            }
        }
    }

    pub(crate) fn want_shutdown(&self, bucket_idx: usize, fctx_id: FctxId) -> bool {
        let shared = self.buckets[bucket_idx].shared.lock().unwrap();
        shared
            .fctxs
            .get(&fctx_id)
            .map(|f| f.want_shutdown)
            .unwrap_or(false)
    }

    pub(crate) fn activate_fctx(&self, bucket_idx: usize, fctx_id: FctxId) {
        let mut shared = self.buckets[bucket_idx].shared.lock().unwrap();
        if let Some(fctx) = shared.fctxs.get_mut(&fctx_id) {
            if fctx.state == FctxState::Init {
                fctx.state = FctxState::Active;
            }
        }
    }

    fn dec_active_buckets(&self, n: usize) {
        if n == 0 {
            return;
        }
        let mut lifecycle = self.lifecycle.lock().unwrap();
        lifecycle.active_buckets = lifecycle.active_buckets.saturating_sub(n);
        if lifecycle.exiting && lifecycle.active_buckets == 0 {
            info!("Resolver shutdown complete");
            for listener in lifecycle.listeners.drain(..) {
                let _ = listener.send(());
            }
        }
    }
}

fn bucket_for(key: &CompactString, nbuckets: usize) -> usize {
    let mut hasher = rustc_hash::FxHasher::default();
    key.hash(&mut hasher);
    (hasher.finish() as usize) % nbuckets
}

/// Caller handle for one joined fetch. Dropping the last handle for an fctx
/// initiates its shutdown.
pub struct Fetch {
    inner: Arc<ResolverInner>,
    bucket: usize,
    fctx: FctxId,
    waiter: u64,
    rx: Option<oneshot::Receiver<FetchReply>>,
}

impl Fetch {
    /// Waits for the fetch to settle. Each waiter observes exactly one
    /// result.
    pub async fn result(&mut self) -> FetchReply {
        match self.rx.take() {
            Some(rx) => match rx.await {
                Ok(reply) => reply,
                // The fctx vanished without replying; the pre-populated
                // default result stands.
                Err(_) => Err(ResolverError::ServFail),
            },
            None => Err(ResolverError::Canceled),
        }
    }

    /// Removes this waiter without affecting the other joiners.
    pub fn cancel(&self) {
        self.inner.cancel_fetch(self.bucket, self.fctx, self.waiter);
    }
}

impl Drop for Fetch {
    fn drop(&mut self) {
        self.inner.release_fetch(self.bucket, self.fctx, self.waiter);
    }
}

async fn bucket_worker(
    weak: Weak<ResolverInner>,
    bucket_idx: usize,
    mut rx: UnboundedReceiver<BucketMsg>,
) {
    let mut machines: HashMap<FctxId, FetchMachine> = HashMap::new();
    while let Some(msg) = rx.recv().await {
        let Some(res) = weak.upgrade() else {
            break;
        };
        match msg {
            BucketMsg::Start { fctx, init } => {
                let mut machine = FetchMachine::new(fctx, bucket_idx, *init);
                machine.on_start(&res).await;
                if !machine.done {
                    machines.insert(fctx, machine);
                }
            }
            BucketMsg::Control { fctx } => {
                if let Some(machine) = machines.get_mut(&fctx) {
                    machine.on_control(&res);
                    if machine.done {
                        machines.remove(&fctx);
                    }
                }
            }
            BucketMsg::Timeout { fctx, epoch } => {
                if let Some(machine) = machines.get_mut(&fctx) {
                    machine.on_timeout(&res, epoch).await;
                    if machine.done {
                        machines.remove(&fctx);
                    }
                }
            }
            BucketMsg::Response {
                fctx,
                query,
                event,
            } => {
                if let Some(machine) = machines.get_mut(&fctx) {
                    machine.on_response(&res, query, event).await;
                    if machine.done {
                        machines.remove(&fctx);
                    }
                }
            }
            BucketMsg::FindDone { fctx, found } => {
                if let Some(machine) = machines.get_mut(&fctx) {
                    machine.on_find_done(&res, found).await;
                    if machine.done {
                        machines.remove(&fctx);
                    }
                }
            }
        }
    }
}
