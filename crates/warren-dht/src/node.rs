//! The DHT node: request/response state machine, bootstrap, queries and
//! server-side handling.
//!
//! One [`DhtNode`] owns one local UDP endpoint (through the transport
//! multiplexer's DHT half), a routing table, the server-side stores and the
//! outstanding-request map. A background task reads datagrams: replies are
//! matched to waiters by transaction id *and* sender endpoint, queries are
//! answered inline.
//!
//! ## Timeouts
//!
//! Reply timeouts adapt per query type: a rolling window of the last ten
//! reply times yields `mean + 3σ`, capped at three seconds; with fewer than
//! five samples the three-second default applies.
//!
//! ## Bootstrap
//!
//! Well-known routers are resolved (shuffled) on port 6881 and pinged; the
//! `ip` field of the first reply tells us our external endpoint, from which
//! the BEP-42 node id is derived. A `find_node` for our own id then
//! populates the routing table. Failures back off ten seconds and retry
//! until cancelled.

use std::collections::{HashMap, HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use tokio::sync::{oneshot, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{info, trace, warn};

use warren_crypto::ed25519::PublicKey;
use warren_transport::{DhtSender, DhtSocket};

use crate::bencode::{dict_bytes, dict_int, Dict, Value};
use crate::lookup::{Candidate, Traversal};
use crate::martian::is_martian;
use crate::node_id::{
    decode_contacts_v4, decode_contacts_v6, decode_endpoint, encode_endpoint, NodeContact, NodeId,
};
use crate::routing::RoutingTable;
use crate::storage::{
    immutable_target, mutable_target, Bep44Store, MutableItem, TokenMint, TrackerStore,
    MAX_PEERS_PER_REPLY,
};
use crate::{DhtConfig, DhtError, Result, BOOTSTRAP_PORT, K, MAX_VALUE_SIZE, RESPONSIBLE_NODES};

/// Default and maximum adaptive reply timeout.
const DEFAULT_REPLY_TIMEOUT: Duration = Duration::from_secs(3);

/// Samples needed before the adaptive estimate is trusted.
const MIN_TIMEOUT_SAMPLES: usize = 5;

/// Rolling reply-time window per query type.
const TIMEOUT_WINDOW: usize = 10;

/// Attempts for write queries (`announce_peer`, `put`).
const WRITE_TRIES: usize = 3;

/// Per-query-type rolling reply-time statistics.
#[derive(Default)]
struct Stat {
    window: VecDeque<f32>, // seconds
}

impl Stat {
    fn add(&mut self, d: Duration) {
        if self.window.len() == TIMEOUT_WINDOW {
            self.window.pop_front();
        }
        self.window.push_back(d.as_secs_f32());
    }

    fn max_reply_wait(&self) -> Duration {
        if self.window.len() < MIN_TIMEOUT_SAMPLES {
            return DEFAULT_REPLY_TIMEOUT;
        }
        let n = self.window.len() as f32;
        let mean = self.window.iter().sum::<f32>() / n;
        let var = self.window.iter().map(|x| (x - mean) * (x - mean)).sum::<f32>() / n;
        let est = Duration::from_secs_f32((mean + 3.0 * var.sqrt()).max(0.050));
        est.min(DEFAULT_REPLY_TIMEOUT)
    }
}

#[derive(Default)]
struct Stats {
    per_type: HashMap<String, Stat>,
}

impl Stats {
    fn add_reply_time(&mut self, query_type: &str, d: Duration) {
        self.per_type.entry(query_type.into()).or_default().add(d);
    }

    fn max_reply_wait(&self, query_type: &str) -> Duration {
        self.per_type
            .get(query_type)
            .map(|s| s.max_reply_wait())
            .unwrap_or(DEFAULT_REPLY_TIMEOUT)
    }
}

struct PendingRequest {
    endpoint: SocketAddr,
    tx: oneshot::Sender<Dict>,
}

struct Inner {
    config: DhtConfig,
    sender: DhtSender,
    local_endpoint: SocketAddr,
    is_v4: bool,

    node_id: Mutex<NodeId>,
    wan_endpoint: Mutex<Option<SocketAddr>>,
    routing: Mutex<Option<RoutingTable>>,
    bootstrap_endpoints: Mutex<Vec<SocketAddr>>,

    active_requests: Mutex<HashMap<Vec<u8>, PendingRequest>>,
    next_transaction: Mutex<u32>,
    stats: Mutex<Stats>,

    tracker: Mutex<TrackerStore>,
    tracker_tokens: Mutex<TokenMint>,
    data: Mutex<Bep44Store>,
    data_tokens: Mutex<TokenMint>,

    ready: AtomicBool,
    ready_notify: Notify,
    cancel: CancellationToken,
}

/// A Mainline-DHT node bound to one local UDP endpoint.
pub struct DhtNode {
    inner: Arc<Inner>,
}

impl Drop for DhtNode {
    fn drop(&mut self) {
        self.inner.cancel.cancel();
    }
}

impl DhtNode {
    /// Start a node over the DHT half of a bound multiplexer. Spawns the
    /// receive loop and the bootstrap task.
    pub fn new(socket: DhtSocket, config: DhtConfig) -> Self {
        let local_endpoint = socket.local_addr();
        let inner = Arc::new(Inner {
            sender: socket.sender(),
            local_endpoint,
            is_v4: local_endpoint.is_ipv4(),
            config,
            node_id: Mutex::new(NodeId::zero()),
            wan_endpoint: Mutex::new(None),
            routing: Mutex::new(None),
            bootstrap_endpoints: Mutex::new(Vec::new()),
            active_requests: Mutex::new(HashMap::new()),
            next_transaction: Mutex::new(1),
            stats: Mutex::new(Stats::default()),
            tracker: Mutex::new(TrackerStore::new()),
            tracker_tokens: Mutex::new(TokenMint::new()),
            data: Mutex::new(Bep44Store::new()),
            data_tokens: Mutex::new(TokenMint::new()),
            ready: AtomicBool::new(false),
            ready_notify: Notify::new(),
            cancel: CancellationToken::new(),
        });

        tokio::spawn(Inner::receive_loop(inner.clone(), socket));
        tokio::spawn(Inner::bootstrap_loop(inner.clone()));

        Self { inner }
    }

    /// The local UDP endpoint.
    pub fn local_endpoint(&self) -> SocketAddr {
        self.inner.local_endpoint
    }

    /// The external endpoint learned during bootstrap, if any.
    pub fn wan_endpoint(&self) -> Option<SocketAddr> {
        *self.inner.wan_endpoint.lock().unwrap()
    }

    /// This node's id (zero until bootstrapped).
    pub fn id(&self) -> NodeId {
        *self.inner.node_id.lock().unwrap()
    }

    /// Whether bootstrap has completed.
    pub fn is_ready(&self) -> bool {
        self.inner.ready.load(Ordering::SeqCst)
    }

    /// Wait until the node is bootstrapped.
    pub async fn wait_ready(&self, cancel: &CancellationToken) -> Result<()> {
        loop {
            if self.is_ready() {
                return Ok(());
            }
            let notified = self.inner.ready_notify.notified();
            if self.is_ready() {
                return Ok(());
            }
            tokio::select! {
                _ = cancel.cancelled() => return Err(DhtError::OperationAborted),
                _ = self.inner.cancel.cancelled() => return Err(DhtError::OperationAborted),
                _ = notified => {}
            }
        }
    }

    /// Stop the node: cancels the receive loop, bootstrap and every
    /// outstanding operation.
    pub fn shutdown(&self) {
        self.inner.cancel.cancel();
    }

    /// Up to eight known-good contacts closest to `target`.
    pub async fn find_closest_nodes(
        &self,
        target: NodeId,
        cancel: &CancellationToken,
    ) -> Result<Vec<NodeContact>> {
        self.inner.find_closest_nodes(target, cancel).await
    }

    /// BEP-5 `get_peers` search: the union of peer lists found among the
    /// closest responders.
    pub async fn tracker_get_peers(
        &self,
        infohash: NodeId,
        cancel: &CancellationToken,
    ) -> Result<HashSet<SocketAddr>> {
        let (peers, _) = self.inner.tracker_search(infohash, cancel).await?;
        Ok(peers)
    }

    /// BEP-5 announce: `get_peers` for tokens, then `announce_peer` to the
    /// closest responders. Succeeds iff at least one write lands.
    pub async fn tracker_announce(
        &self,
        infohash: NodeId,
        port: Option<u16>,
        cancel: &CancellationToken,
    ) -> Result<HashSet<SocketAddr>> {
        let inner = &self.inner;
        let (peers, responsible) = inner.tracker_search(infohash, cancel).await?;

        let node_id = *inner.node_id.lock().unwrap();
        let mut args = Dict::new();
        args.insert(b"id".to_vec(), Value::bytes(node_id.as_bytes().to_vec()));
        args.insert(b"info_hash".to_vec(), Value::bytes(infohash.as_bytes().to_vec()));
        args.insert(
            b"implied_port".to_vec(),
            Value::Int(if port.is_some() { 0 } else { 1 }),
        );
        args.insert(b"port".to_vec(), Value::Int(port.unwrap_or(0) as i64));

        let mut writes = Vec::new();
        for r in &responsible {
            let mut args = args.clone();
            args.insert(b"token".to_vec(), Value::bytes(r.token.clone()));
            let inner = inner.clone();
            let contact = r.contact;
            let cancel = cancel.clone();
            writes.push(tokio::spawn(async move {
                inner
                    .send_write_query(contact, "announce_peer", args, &cancel)
                    .await
                    .is_ok()
            }));
        }
        let mut any_ok = false;
        for w in writes {
            any_ok |= w.await.unwrap_or(false);
        }
        if cancel.is_cancelled() {
            return Err(DhtError::OperationAborted);
        }
        if !any_ok {
            return Err(DhtError::NetworkDown);
        }
        Ok(peers)
    }

    /// BEP-44 immutable get: succeeds as soon as any responder returns a
    /// value whose SHA-1 matches `key`.
    pub async fn data_get_immutable(
        &self,
        key: NodeId,
        cancel: &CancellationToken,
    ) -> Result<Value> {
        self.inner.data_get_immutable(key, cancel).await
    }

    /// BEP-44 immutable put. Returns the content key.
    pub async fn data_put_immutable(
        &self,
        value: Value,
        cancel: &CancellationToken,
    ) -> Result<NodeId> {
        if value.encode().len() >= MAX_VALUE_SIZE {
            return Err(DhtError::InvalidArgument("value too big".into()));
        }
        self.inner.data_put_immutable(value, cancel).await
    }

    /// BEP-44 mutable get: the highest-sequence item whose signature
    /// verifies under `public_key` and `salt`.
    pub async fn data_get_mutable(
        &self,
        public_key: &PublicKey,
        salt: &[u8],
        cancel: &CancellationToken,
    ) -> Result<MutableItem> {
        self.inner.data_get_mutable(public_key, salt, cancel).await
    }

    /// BEP-44 mutable put; also refreshes responders observed with an
    /// older sequence. Returns the target id.
    pub async fn data_put_mutable(
        &self,
        item: MutableItem,
        cancel: &CancellationToken,
    ) -> Result<NodeId> {
        if !item.verify() {
            return Err(DhtError::InvalidArgument("item signature invalid".into()));
        }
        self.inner.data_put_mutable(item, cancel).await
    }

    #[cfg(test)]
    pub(crate) fn force_ready_for_tests(&self, id: NodeId) {
        *self.inner.node_id.lock().unwrap() = id;
        let weak = Arc::downgrade(&self.inner);
        *self.inner.routing.lock().unwrap() =
            Some(RoutingTable::new(id, Inner::make_pinger(weak)));
        self.inner.ready.store(true, Ordering::SeqCst);
        self.inner.ready_notify.notify_waiters();
    }

    #[cfg(test)]
    pub(crate) fn add_bootstrap_endpoint_for_tests(&self, ep: SocketAddr) {
        self.inner.bootstrap_endpoints.lock().unwrap().push(ep);
    }
}

/// A responder that handed us a write token.
struct ResponsibleNode {
    contact: NodeContact,
    token: Vec<u8>,
}

/// What one traversal query produced.
struct QueryOutcome {
    candidate: Candidate,
    /// The `r` dictionary of a successful reply.
    reply: Option<Dict>,
    /// Closer nodes extracted from the reply (martians already dropped).
    nodes: Vec<NodeContact>,
}

impl Inner {
    fn make_pinger(weak: Weak<Inner>) -> Box<dyn Fn(NodeContact) + Send + Sync> {
        Box::new(move |contact| {
            let Some(inner) = weak.upgrade() else { return };
            tokio::spawn(async move {
                let cancel = inner.cancel.child_token();
                // Reply or failure feeds the routing table inside
                // send_query_await_reply.
                let _ = inner.send_ping(contact, &cancel).await;
            });
        })
    }

    async fn send_ping(self: &Arc<Self>, contact: NodeContact, cancel: &CancellationToken) -> Result<Dict> {
        let node_id = *self.node_id.lock().unwrap();
        let mut args = Dict::new();
        args.insert(b"id".to_vec(), Value::bytes(node_id.as_bytes().to_vec()));
        self.send_query_await_reply(contact.into(), "ping", args, cancel)
            .await
    }

    // ---- receive path -----------------------------------------------

    async fn receive_loop(self: Arc<Self>, mut socket: DhtSocket) {
        let cancel = self.cancel.clone();
        loop {
            let (datagram, from) = match socket.recv(&cancel).await {
                Ok(x) => x,
                Err(_) => return,
            };
            let Some(Value::Dict(msg)) = Value::decode(&datagram) else {
                trace!(%from, "undecodable datagram");
                continue;
            };
            let Some(transaction) = dict_bytes(&msg, b"t").map(<[u8]>::to_vec) else {
                continue;
            };
            let Some(y) = dict_bytes(&msg, b"y") else {
                continue;
            };
            match y {
                b"q" => self.handle_query(from, &msg).await,
                b"r" | b"e" => {
                    let pending = {
                        let mut reqs = self.active_requests.lock().unwrap();
                        match reqs.get(&transaction) {
                            // Sender must match the recorded destination,
                            // otherwise the reply is dropped silently.
                            Some(p) if p.endpoint == from => reqs.remove(&transaction),
                            _ => None,
                        }
                    };
                    if let Some(p) = pending {
                        let _ = p.tx.send(msg);
                    }
                }
                _ => {}
            }
        }
    }

    // ---- query sending ----------------------------------------------

    fn new_transaction(&self, reqs: &HashMap<Vec<u8>, PendingRequest>) -> Vec<u8> {
        let mut next = self.next_transaction.lock().unwrap();
        loop {
            let tid = *next;
            *next = next.wrapping_add(1);
            let encoded = if tid == 0 {
                vec![0u8]
            } else {
                let mut v = Vec::with_capacity(4);
                let mut x = tid;
                while x != 0 {
                    v.push((x & 0xff) as u8);
                    x >>= 8;
                }
                v
            };
            // Ids may wrap; ones still in flight are skipped.
            if !reqs.contains_key(&encoded) {
                return encoded;
            }
        }
    }

    /// Send one query and await its reply, the adaptive timeout, or
    /// cancellation. Updates reply-time stats and the routing table.
    async fn send_query_await_reply(
        self: &Arc<Self>,
        dst: Candidate,
        query_type: &str,
        args: Dict,
        cancel: &CancellationToken,
    ) -> Result<Dict> {
        let timeout = self.stats.lock().unwrap().max_reply_wait(query_type);

        let (tx, rx) = oneshot::channel();
        let transaction = {
            let mut reqs = self.active_requests.lock().unwrap();
            let t = self.new_transaction(&reqs);
            reqs.insert(
                t.clone(),
                PendingRequest {
                    endpoint: dst.endpoint,
                    tx,
                },
            );
            t
        };

        let mut msg = Dict::new();
        msg.insert(b"t".to_vec(), Value::bytes(transaction.clone()));
        msg.insert(b"y".to_vec(), Value::from("q"));
        msg.insert(b"q".to_vec(), Value::from(query_type));
        msg.insert(b"a".to_vec(), Value::Dict(args));
        if self.config.read_only {
            msg.insert(b"ro".to_vec(), Value::Int(1));
        }

        let started = Instant::now();
        let send_result = self
            .sender
            .send_to(&Value::Dict(msg).encode(), dst.endpoint)
            .await;

        let outcome: Result<Dict> = async {
            send_result?;
            tokio::select! {
                _ = cancel.cancelled() => Err(DhtError::OperationAborted),
                _ = self.cancel.cancelled() => Err(DhtError::OperationAborted),
                _ = tokio::time::sleep(timeout) => Err(DhtError::TimedOut),
                reply = rx => match reply {
                    Ok(msg) => Ok(msg),
                    Err(_) => Err(DhtError::OperationAborted),
                },
            }
        }
        .await;

        self.active_requests.lock().unwrap().remove(&transaction);

        let reply = match outcome {
            Ok(msg) => {
                let y = dict_bytes(&msg, b"y").unwrap_or_default().to_vec();
                if y == b"r" {
                    self.stats
                        .lock()
                        .unwrap()
                        .add_reply_time(query_type, started.elapsed());
                    // The full message is returned: BEP-42 puts the
                    // requester-visible `ip` field at the top level.
                    if msg.get(b"r".as_slice()).and_then(|v| v.as_dict()).is_some() {
                        Ok(msg)
                    } else {
                        Err(DhtError::InvalidArgument("reply without r".into()))
                    }
                } else {
                    let (code, message) = msg
                        .get(b"e".as_slice())
                        .and_then(|v| v.as_list())
                        .map(|l| {
                            let code = l.first().and_then(|v| v.as_int()).unwrap_or(0);
                            let message = l
                                .get(1)
                                .and_then(|v| v.as_bytes())
                                .map(|b| String::from_utf8_lossy(b).into_owned())
                                .unwrap_or_default();
                            (code, message)
                        })
                        .unwrap_or((0, String::new()));
                    Err(DhtError::Remote { code, message })
                }
            }
            Err(e) => Err(e),
        };

        // Feed the routing table for identified destinations.
        if let Some(id) = dst.id {
            let contact = NodeContact {
                id,
                endpoint: dst.endpoint,
            };
            let mut routing = self.routing.lock().unwrap();
            if let Some(table) = routing.as_mut() {
                match &reply {
                    Ok(_) => table.try_add_node(contact, true),
                    Err(DhtError::OperationAborted) => {}
                    Err(_) => table.fail_node(contact),
                }
            }
        }

        reply
    }

    /// Write query with retries.
    async fn send_write_query(
        self: &Arc<Self>,
        dst: NodeContact,
        query_type: &str,
        args: Dict,
        cancel: &CancellationToken,
    ) -> Result<Dict> {
        let mut last = Err(DhtError::TimedOut);
        for _ in 0..WRITE_TRIES {
            last = self
                .send_query_await_reply(dst.into(), query_type, args.clone(), cancel)
                .await;
            match &last {
                Ok(_) | Err(DhtError::OperationAborted) => break,
                Err(_) => continue,
            }
        }
        last
    }

    // ---- bootstrap --------------------------------------------------

    async fn bootstrap_loop(self: Arc<Self>) {
        use rand::seq::SliceRandom;

        let cancel = self.cancel.clone();
        loop {
            let mut servers = self.config.bootstrap_servers.clone();
            servers.shuffle(&mut rand::thread_rng());

            let mut done = false;
            for server in &servers {
                match self.bootstrap_single(server, &cancel).await {
                    Ok(()) => {
                        done = true;
                        break;
                    }
                    Err(DhtError::OperationAborted) => return,
                    Err(e) => {
                        warn!(server, error = %e, "bootstrap attempt failed");
                    }
                }
            }
            if done {
                return;
            }
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(self.config.bootstrap_retry()) => {}
            }
        }
    }

    /// Split an optional `host:port` bootstrap entry; the port defaults
    /// to the well-known router port.
    fn split_host_port(server: &str) -> (&str, u16) {
        match server.rsplit_once(':') {
            Some((host, port)) if !port.is_empty() && port.bytes().all(|b| b.is_ascii_digit()) => {
                (host, port.parse().unwrap_or(BOOTSTRAP_PORT))
            }
            _ => (server, BOOTSTRAP_PORT),
        }
    }

    async fn bootstrap_single(
        self: &Arc<Self>,
        server: &str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let (host, port) = Self::split_host_port(server);
        let lookup = tokio::select! {
            _ = cancel.cancelled() => return Err(DhtError::OperationAborted),
            r = tokio::net::lookup_host((host, port)) => r,
        };
        let addrs =
            lookup.map_err(|e| DhtError::BootstrapFailed(format!("resolve {server}: {e}")))?;
        let bootstrap_ep = addrs
            .into_iter()
            .find(|a| a.is_ipv4() == self.is_v4)
            .ok_or_else(|| DhtError::BootstrapFailed(format!("no usable address for {server}")))?;

        let node_id = *self.node_id.lock().unwrap();
        let mut args = Dict::new();
        args.insert(b"id".to_vec(), Value::bytes(node_id.as_bytes().to_vec()));
        let reply = self
            .send_query_await_reply(
                Candidate {
                    id: None,
                    endpoint: bootstrap_ep,
                },
                "ping",
                args,
                cancel,
            )
            .await?;

        // The reply's `ip` field carries our external endpoint in compact
        // form; the node id must be derived from it (BEP 42).
        let wan = dict_bytes(&reply, b"ip")
            .and_then(decode_endpoint)
            .ok_or_else(|| DhtError::BootstrapFailed("no ip field in bootstrap reply".into()))?;

        let id = NodeId::generate(wan.ip());
        *self.node_id.lock().unwrap() = id;
        *self.wan_endpoint.lock().unwrap() = Some(wan);
        info!(%id, %wan, "bootstrap: external endpoint learned");

        {
            let weak = Arc::downgrade(self);
            *self.routing.lock().unwrap() = Some(RoutingTable::new(id, Self::make_pinger(weak)));
        }
        self.bootstrap_endpoints.lock().unwrap().push(bootstrap_ep);

        // Populate the table by looking ourselves up.
        let _ = self.find_closest_nodes(id, cancel).await?;

        self.ready.store(true, Ordering::SeqCst);
        self.ready_notify.notify_waiters();
        Ok(())
    }

    // ---- iterative traversal ----------------------------------------

    fn seed_traversal(&self, target: NodeId) -> Result<Traversal> {
        let routing = self.routing.lock().unwrap();
        let Some(table) = routing.as_ref() else {
            return Err(DhtError::TryAgain);
        };
        let mut seeds: Vec<Candidate> = table
            .find_closest(&target, RESPONSIBLE_NODES)
            .into_iter()
            .map(Candidate::from)
            .collect();
        let seeded: HashSet<SocketAddr> = seeds.iter().map(|c| c.endpoint).collect();
        for ep in self.bootstrap_endpoints.lock().unwrap().iter() {
            if !seeded.contains(ep) {
                seeds.push(Candidate {
                    id: None,
                    endpoint: *ep,
                });
            }
        }
        Ok(Traversal::new(target, seeds))
    }

    fn nodes_from_reply(&self, reply: &Dict) -> Vec<NodeContact> {
        let mut nodes = if self.is_v4 {
            dict_bytes(reply, b"nodes").map(decode_contacts_v4)
        } else {
            dict_bytes(reply, b"nodes6").map(decode_contacts_v6)
        }
        .unwrap_or_default();
        nodes.retain(|n| !is_martian(&n.endpoint));
        nodes
    }

    /// Run one traversal query against `candidate`: the primary query,
    /// plus a `find_node` fallback when it yields no closer nodes.
    async fn run_traversal_query(
        self: Arc<Self>,
        candidate: Candidate,
        target: NodeId,
        query_type: &'static str,
        target_key: &'static [u8],
        cancel: CancellationToken,
    ) -> QueryOutcome {
        let node_id = *self.node_id.lock().unwrap();
        let mut args = Dict::new();
        args.insert(b"id".to_vec(), Value::bytes(node_id.as_bytes().to_vec()));
        args.insert(target_key.to_vec(), Value::bytes(target.as_bytes().to_vec()));

        // Keep the inner `r` dictionary; that is where all reply fields
        // of interest to traversals live.
        let reply = self
            .send_query_await_reply(candidate, query_type, args, &cancel)
            .await
            .ok()
            .and_then(|msg| msg.get(b"r".as_slice()).and_then(|v| v.as_dict()).cloned());
        let mut nodes = reply
            .as_ref()
            .map(|r| self.nodes_from_reply(r))
            .unwrap_or_default();

        // Nodes that do not speak the primary query (common for BEP 44
        // `get`) still answer `find_node`; without the fallback the
        // traversal starves.
        if nodes.is_empty() && query_type != "find_node" && !cancel.is_cancelled() {
            let mut args = Dict::new();
            args.insert(b"id".to_vec(), Value::bytes(node_id.as_bytes().to_vec()));
            args.insert(b"target".to_vec(), Value::bytes(target.as_bytes().to_vec()));
            if let Some(fn_reply) = self
                .send_query_await_reply(candidate, "find_node", args, &cancel)
                .await
                .ok()
                .and_then(|msg| msg.get(b"r".as_slice()).and_then(|v| v.as_dict()).cloned())
            {
                nodes = self.nodes_from_reply(&fn_reply);
            }
        }

        QueryOutcome {
            candidate,
            reply,
            nodes,
        }
    }

    /// Generic α-parallel traversal driver. `on_reply` sees every
    /// successful reply together with the (possibly id-upgraded)
    /// responder; returning `false` stops the traversal early.
    async fn collect<F>(
        self: &Arc<Self>,
        target: NodeId,
        query_type: &'static str,
        target_key: &'static [u8],
        cancel: &CancellationToken,
        mut on_reply: F,
    ) -> Result<()>
    where
        F: FnMut(&mut Traversal, NodeContact, &Dict) -> bool,
    {
        let mut traversal = self.seed_traversal(target)?;
        let local_cancel = cancel.child_token();
        let mut tasks = tokio::task::JoinSet::new();

        loop {
            while let Some(candidate) = traversal.next_candidate() {
                tasks.spawn(self.clone().run_traversal_query(
                    candidate,
                    target,
                    query_type,
                    target_key,
                    local_cancel.clone(),
                ));
            }
            if traversal.is_done() {
                break;
            }

            let outcome = tokio::select! {
                _ = cancel.cancelled() => {
                    local_cancel.cancel();
                    return Err(DhtError::OperationAborted);
                }
                _ = self.cancel.cancelled() => {
                    local_cancel.cancel();
                    return Err(DhtError::OperationAborted);
                }
                joined = tasks.join_next() => match joined {
                    Some(Ok(o)) => o,
                    Some(Err(_)) => {
                        traversal.complete_one();
                        continue;
                    }
                    None => break,
                },
            };

            traversal.complete_one();
            traversal.add_candidates(outcome.nodes.iter().copied().map(Candidate::from));

            if let Some(reply) = outcome.reply {
                // Bootstrap candidates have no id; their reply does.
                let id = outcome.candidate.id.or_else(|| {
                    dict_bytes(&reply, b"id").and_then(NodeId::from_slice)
                });
                if let Some(id) = id {
                    let contact = NodeContact {
                        id,
                        endpoint: outcome.candidate.endpoint,
                    };
                    if !on_reply(&mut traversal, contact, &reply) {
                        local_cancel.cancel();
                        break;
                    }
                }
            }
        }

        local_cancel.cancel();
        // Drain outstanding tasks so their cancellation is orderly.
        while tasks.join_next().await.is_some() {}
        Ok(())
    }

    // ---- exported operations ----------------------------------------

    async fn find_closest_nodes(
        self: &Arc<Self>,
        target: NodeId,
        cancel: &CancellationToken,
    ) -> Result<Vec<NodeContact>> {
        let mut endpoints: HashMap<NodeId, SocketAddr> = HashMap::new();
        self.collect(target, "find_node", b"target", cancel, |t, contact, _reply| {
            if t.would_accept(&contact.id) {
                t.accept(contact.id);
                endpoints.insert(contact.id, contact.endpoint);
            }
            true
        })
        .await?;

        // Accepted ids, closest first, resolved back to contacts.
        let mut contacts: Vec<NodeContact> = endpoints
            .into_iter()
            .map(|(id, endpoint)| NodeContact { id, endpoint })
            .collect();
        contacts.sort_by(|a, b| target.distance(&a.id).cmp(&target.distance(&b.id)));
        contacts.truncate(RESPONSIBLE_NODES);
        Ok(contacts)
    }

    async fn tracker_search(
        self: &Arc<Self>,
        infohash: NodeId,
        cancel: &CancellationToken,
    ) -> Result<(HashSet<SocketAddr>, Vec<ResponsibleNode>)> {
        let mut peers: HashSet<SocketAddr> = HashSet::new();
        let mut responsible: Vec<ResponsibleNode> = Vec::new();

        self.collect(infohash, "get_peers", b"info_hash", cancel, |t, contact, reply| {
            let Some(token) = dict_bytes(reply, b"token").map(<[u8]>::to_vec) else {
                return true;
            };
            if t.would_accept(&contact.id) {
                t.accept(contact.id);
                if let Some(values) = reply.get(b"values".as_slice()).and_then(|v| v.as_list()) {
                    for v in values {
                        let Some(ep) = v.as_bytes().and_then(decode_endpoint) else {
                            continue;
                        };
                        if !is_martian(&ep) {
                            peers.insert(ep);
                        }
                    }
                }
                responsible.push(ResponsibleNode { contact, token });
            }
            true
        })
        .await?;

        // Keep only tokens of responders that stayed among the closest.
        let accepted: HashSet<SocketAddr> = {
            // Responsible entries were only pushed when accepted, but later
            // closer responders may have pushed earlier ones out.
            let mut t = Traversal::new(infohash, std::iter::empty::<Candidate>());
            for r in &responsible {
                t.accept(r.contact.id);
            }
            let keep: HashSet<NodeId> = t.accepted().iter().copied().collect();
            responsible
                .iter()
                .filter(|r| keep.contains(&r.contact.id))
                .map(|r| r.contact.endpoint)
                .collect()
        };
        responsible.retain(|r| accepted.contains(&r.contact.endpoint));

        Ok((peers, responsible))
    }

    async fn data_get_immutable(
        self: &Arc<Self>,
        key: NodeId,
        cancel: &CancellationToken,
    ) -> Result<Value> {
        let mut found: Option<Value> = None;
        self.collect(key, "get", b"target", cancel, |t, contact, reply| {
            t.accept(contact.id);
            if let Some(v) = reply.get(b"v".as_slice()) {
                if immutable_target(v) == key {
                    found = Some(v.clone());
                    return false; // stop the search, the value is content-addressed
                }
            }
            true
        })
        .await?;
        found.ok_or(DhtError::NotFound)
    }

    async fn data_put_immutable(
        self: &Arc<Self>,
        value: Value,
        cancel: &CancellationToken,
    ) -> Result<NodeId> {
        let key = immutable_target(&value);
        let mut responsible: Vec<ResponsibleNode> = Vec::new();
        self.collect(key, "get", b"target", cancel, |t, contact, reply| {
            if let Some(token) = dict_bytes(reply, b"token") {
                if t.would_accept(&contact.id) {
                    t.accept(contact.id);
                    responsible.push(ResponsibleNode {
                        contact,
                        token: token.to_vec(),
                    });
                }
            }
            true
        })
        .await?;

        let node_id = *self.node_id.lock().unwrap();
        let mut any_ok = false;
        let mut writes = tokio::task::JoinSet::new();
        for r in responsible {
            let mut args = Dict::new();
            args.insert(b"id".to_vec(), Value::bytes(node_id.as_bytes().to_vec()));
            args.insert(b"v".to_vec(), value.clone());
            args.insert(b"token".to_vec(), Value::bytes(r.token));
            let inner = self.clone();
            let cancel = cancel.clone();
            writes.spawn(async move {
                inner
                    .send_write_query(r.contact, "put", args, &cancel)
                    .await
                    .is_ok()
            });
        }
        while let Some(ok) = writes.join_next().await {
            any_ok |= ok.unwrap_or(false);
        }
        if cancel.is_cancelled() {
            return Err(DhtError::OperationAborted);
        }
        if !any_ok {
            return Err(DhtError::NetworkDown);
        }
        Ok(key)
    }

    async fn data_get_mutable(
        self: &Arc<Self>,
        public_key: &PublicKey,
        salt: &[u8],
        cancel: &CancellationToken,
    ) -> Result<MutableItem> {
        let target = mutable_target(public_key, salt);
        let early_cancel = self.config.mutable_get_early_cancel();
        let search_cancel = cancel.child_token();

        let mut best: Option<MutableItem> = None;
        let mut watchdog: Option<tokio::task::JoinHandle<()>> = None;

        let pk = *public_key;
        let salt = salt.to_vec();
        let result = self
            .collect(target, "get", b"target", &search_cancel, |t, contact, reply| {
                t.accept(contact.id);

                if dict_bytes(reply, b"k") != Some(&pk.to_bytes()[..]) {
                    return true;
                }
                let Some(seq) = dict_int(reply, b"seq") else {
                    return true;
                };
                let Some(sig) = dict_bytes(reply, b"sig") else {
                    return true;
                };
                let Ok(signature) = <[u8; 64]>::try_from(sig) else {
                    return true;
                };
                let Some(value) = reply.get(b"v".as_slice()).cloned() else {
                    return true;
                };
                let item = MutableItem {
                    public_key: pk,
                    salt: salt.clone(),
                    value,
                    seq,
                    signature,
                };
                if !item.verify() {
                    return true;
                }
                let newer = best.as_ref().map(|b| seq > b.seq).unwrap_or(true);
                if newer {
                    best = Some(item);
                    // Freshness-for-latency trade: optionally stop the
                    // search a bit after the first valid item.
                    if let Some(delay) = early_cancel {
                        if watchdog.is_none() {
                            let c = search_cancel.clone();
                            watchdog = Some(tokio::spawn(async move {
                                tokio::time::sleep(delay).await;
                                c.cancel();
                            }));
                        }
                    }
                }
                true
            })
            .await;

        if let Some(w) = watchdog {
            w.abort();
        }

        match result {
            Ok(()) => {}
            Err(DhtError::OperationAborted) => {
                // Only the watchdog fired; the caller did not cancel.
                if cancel.is_cancelled() || best.is_none() {
                    return Err(DhtError::OperationAborted);
                }
            }
            Err(e) => return Err(e),
        }
        best.ok_or(DhtError::NotFound)
    }

    async fn data_put_mutable(
        self: &Arc<Self>,
        item: MutableItem,
        cancel: &CancellationToken,
    ) -> Result<NodeId> {
        let target = item.target();
        let mut responsible: Vec<ResponsibleNode> = Vec::new();
        let mut stale: Vec<ResponsibleNode> = Vec::new();

        let pk = item.public_key;
        let item_seq = item.seq;
        self.collect(target, "get", b"target", cancel, |t, contact, reply| {
            let Some(token) = dict_bytes(reply, b"token").map(<[u8]>::to_vec) else {
                return true;
            };
            if t.would_accept(&contact.id) {
                t.accept(contact.id);
                responsible.push(ResponsibleNode {
                    contact,
                    token: token.clone(),
                });
            } else if dict_bytes(reply, b"k") == Some(&pk.to_bytes()[..])
                && dict_int(reply, b"seq").map(|s| s < item_seq).unwrap_or(false)
            {
                // Not responsible any more, but it still serves an old
                // version: refresh it opportunistically.
                stale.push(ResponsibleNode { contact, token });
            }
            true
        })
        .await?;

        if responsible.is_empty() && stale.is_empty() {
            return Err(DhtError::NetworkDown);
        }

        let node_id = *self.node_id.lock().unwrap();
        let mut base = Dict::new();
        base.insert(b"id".to_vec(), Value::bytes(node_id.as_bytes().to_vec()));
        base.insert(b"k".to_vec(), Value::bytes(item.public_key.to_bytes().to_vec()));
        base.insert(b"seq".to_vec(), Value::Int(item.seq));
        base.insert(b"sig".to_vec(), Value::bytes(item.signature.to_vec()));
        base.insert(b"v".to_vec(), item.value.clone());
        if !item.salt.is_empty() {
            base.insert(b"salt".to_vec(), Value::bytes(item.salt.clone()));
        }

        let mut any_ok = false;
        let mut writes = tokio::task::JoinSet::new();
        for r in responsible.into_iter().chain(stale) {
            let mut args = base.clone();
            args.insert(b"token".to_vec(), Value::bytes(r.token));
            let inner = self.clone();
            let cancel = cancel.clone();
            writes.spawn(async move {
                inner
                    .send_write_query(r.contact, "put", args, &cancel)
                    .await
                    .is_ok()
            });
        }
        while let Some(ok) = writes.join_next().await {
            any_ok |= ok.unwrap_or(false);
        }
        if cancel.is_cancelled() {
            return Err(DhtError::OperationAborted);
        }
        if !any_ok {
            return Err(DhtError::NetworkDown);
        }
        Ok(target)
    }

    // ---- server side ------------------------------------------------

    async fn send_reply(&self, dest: SocketAddr, transaction: &[u8], mut reply: Dict) {
        let node_id = *self.node_id.lock().unwrap();
        reply.insert(b"id".to_vec(), Value::bytes(node_id.as_bytes().to_vec()));

        let mut msg = Dict::new();
        msg.insert(b"t".to_vec(), Value::bytes(transaction.to_vec()));
        msg.insert(b"y".to_vec(), Value::from("r"));
        msg.insert(b"r".to_vec(), Value::Dict(reply));
        // BEP 42: tell the requester how we see it, so it can derive its
        // own id; our bootstrap reads the same field.
        msg.insert(b"ip".to_vec(), Value::bytes(encode_endpoint(dest)));
        let _ = self.sender.send_to(&Value::Dict(msg).encode(), dest).await;
    }

    async fn send_error(&self, dest: SocketAddr, transaction: &[u8], code: i64, message: &str) {
        let mut msg = Dict::new();
        msg.insert(b"t".to_vec(), Value::bytes(transaction.to_vec()));
        msg.insert(b"y".to_vec(), Value::from("e"));
        msg.insert(
            b"e".to_vec(),
            Value::List(vec![Value::Int(code), Value::from(message)]),
        );
        let _ = self.sender.send_to(&Value::Dict(msg).encode(), dest).await;
    }

    fn closest_nodes_blob(&self, target: &NodeId) -> Vec<u8> {
        let routing = self.routing.lock().unwrap();
        let mut blob = Vec::new();
        if let Some(table) = routing.as_ref() {
            for c in table.find_closest(target, K) {
                blob.extend_from_slice(c.id.as_bytes());
                blob.extend_from_slice(&encode_endpoint(c.endpoint));
            }
        }
        blob
    }

    fn nodes_key(&self) -> &'static [u8] {
        if self.is_v4 {
            b"nodes"
        } else {
            b"nodes6"
        }
    }

    /// Whether we are within plausible responsibility range of `target`:
    /// closer than at least one of the 4×N closest contacts we know.
    fn is_responsible_for(&self, target: &NodeId) -> bool {
        let routing = self.routing.lock().unwrap();
        match routing.as_ref() {
            Some(table) => table.is_closer_than_known(target, RESPONSIBLE_NODES * 4),
            None => true,
        }
    }

    async fn handle_query(self: &Arc<Self>, sender: SocketAddr, msg: &Dict) {
        if self.config.read_only {
            // BEP 43: read-only nodes do not answer queries.
            return;
        }
        let Some(transaction) = dict_bytes(msg, b"t").map(<[u8]>::to_vec) else {
            return;
        };
        let t = &transaction;

        let Some(query_type) = dict_bytes(msg, b"q").map(<[u8]>::to_vec) else {
            return self.send_error(sender, t, 203, "Missing field 'q'").await;
        };
        let Some(args) = msg.get(b"a".as_slice()).and_then(|v| v.as_dict()).cloned() else {
            return self.send_error(sender, t, 203, "Missing field 'a'").await;
        };
        let Some(sender_id) = dict_bytes(&args, b"id") else {
            return self.send_error(sender, t, 203, "Missing argument 'id'").await;
        };
        let Some(sender_id) = NodeId::from_slice(sender_id) else {
            return self.send_error(sender, t, 203, "Malformed argument 'id'").await;
        };

        // BEP 43: read-only senders stay out of the routing table.
        let read_only = dict_int(&args, b"ro") == Some(1);
        if !read_only {
            let mut routing = self.routing.lock().unwrap();
            if let Some(table) = routing.as_mut() {
                table.try_add_node(
                    NodeContact {
                        id: sender_id,
                        endpoint: sender,
                    },
                    false,
                );
            }
        }

        match query_type.as_slice() {
            b"ping" => self.send_reply(sender, t, Dict::new()).await,
            b"find_node" => {
                let Some(target) = dict_bytes(&args, b"target").and_then(NodeId::from_slice) else {
                    return self
                        .send_error(sender, t, 203, "Missing or malformed argument 'target'")
                        .await;
                };
                let mut reply = Dict::new();
                reply.insert(
                    self.nodes_key().to_vec(),
                    Value::bytes(self.closest_nodes_blob(&target)),
                );
                self.send_reply(sender, t, reply).await
            }
            b"get_peers" => {
                let Some(infohash) = dict_bytes(&args, b"info_hash").and_then(NodeId::from_slice)
                else {
                    return self
                        .send_error(sender, t, 203, "Missing or malformed argument 'info_hash'")
                        .await;
                };
                let mut reply = Dict::new();
                reply.insert(
                    self.nodes_key().to_vec(),
                    Value::bytes(self.closest_nodes_blob(&infohash)),
                );
                let token = self
                    .tracker_tokens
                    .lock()
                    .unwrap()
                    .generate(&sender.ip(), &infohash);
                reply.insert(b"token".to_vec(), Value::bytes(token));
                let peers = self
                    .tracker
                    .lock()
                    .unwrap()
                    .list_peers(&infohash, MAX_PEERS_PER_REPLY);
                if !peers.is_empty() {
                    reply.insert(
                        b"values".to_vec(),
                        Value::List(
                            peers
                                .into_iter()
                                .map(|p| Value::bytes(encode_endpoint(p)))
                                .collect(),
                        ),
                    );
                }
                self.send_reply(sender, t, reply).await
            }
            b"announce_peer" => {
                let Some(infohash) = dict_bytes(&args, b"info_hash").and_then(NodeId::from_slice)
                else {
                    return self
                        .send_error(sender, t, 203, "Missing or malformed argument 'info_hash'")
                        .await;
                };
                let Some(token) = dict_bytes(&args, b"token") else {
                    return self.send_error(sender, t, 203, "Missing argument 'token'").await;
                };
                let Some(port) = dict_int(&args, b"port") else {
                    return self.send_error(sender, t, 203, "Missing argument 'port'").await;
                };
                let implied = dict_int(&args, b"implied_port") == Some(1);
                let effective_port = if implied { sender.port() } else { port as u16 };

                if !self.is_responsible_for(&infohash) {
                    return self
                        .send_error(sender, t, 201, "This torrent is not my responsibility")
                        .await;
                }
                if !self
                    .tracker_tokens
                    .lock()
                    .unwrap()
                    .verify(&sender.ip(), &infohash, token)
                {
                    return self.send_error(sender, t, 203, "Incorrect announce token").await;
                }
                self.tracker
                    .lock()
                    .unwrap()
                    .add_peer(infohash, SocketAddr::new(sender.ip(), effective_port));
                self.send_reply(sender, t, Dict::new()).await
            }
            b"get" => {
                let Some(target) = dict_bytes(&args, b"target").and_then(NodeId::from_slice) else {
                    return self
                        .send_error(sender, t, 203, "Missing or malformed argument 'target'")
                        .await;
                };
                let want_seq = dict_int(&args, b"seq");

                let mut reply = Dict::new();
                reply.insert(
                    self.nodes_key().to_vec(),
                    Value::bytes(self.closest_nodes_blob(&target)),
                );
                let token = self
                    .data_tokens
                    .lock()
                    .unwrap()
                    .generate(&sender.ip(), &target);
                reply.insert(b"token".to_vec(), Value::bytes(token));

                if want_seq.is_none() {
                    let immutable = self.data.lock().unwrap().get_immutable(&target);
                    if let Some(v) = immutable {
                        reply.insert(b"v".to_vec(), v);
                        return self.send_reply(sender, t, reply).await;
                    }
                }
                let mutable_item = self.data.lock().unwrap().get_mutable(&target);
                if let Some(item) = mutable_item {
                    // `seq` in the query means "only if newer".
                    if want_seq.map(|s| s <= item.seq).unwrap_or(false) {
                        return self.send_reply(sender, t, reply).await;
                    }
                    reply.insert(
                        b"k".to_vec(),
                        Value::bytes(item.public_key.to_bytes().to_vec()),
                    );
                    reply.insert(b"seq".to_vec(), Value::Int(item.seq));
                    reply.insert(b"sig".to_vec(), Value::bytes(item.signature.to_vec()));
                    reply.insert(b"v".to_vec(), item.value);
                }
                self.send_reply(sender, t, reply).await
            }
            b"put" => self.handle_put(sender, t, args).await,
            _ => self.send_error(sender, t, 204, "Query type not implemented").await,
        }
    }

    async fn handle_put(self: &Arc<Self>, sender: SocketAddr, t: &[u8], args: Dict) {
        let Some(token) = dict_bytes(&args, b"token").map(<[u8]>::to_vec) else {
            return self.send_error(sender, t, 203, "Missing argument 'token'").await;
        };
        let Some(value) = args.get(b"v".as_slice()).cloned() else {
            return self.send_error(sender, t, 203, "Missing argument 'v'").await;
        };
        if value.encode().len() >= MAX_VALUE_SIZE {
            return self.send_error(sender, t, 205, "Argument 'v' too big").await;
        }

        let mutable = args.contains_key(b"k".as_slice());
        if mutable {
            let Some(pk) = dict_bytes(&args, b"k").and_then(|k| PublicKey::from_slice(k).ok())
            else {
                return self
                    .send_error(sender, t, 203, "Missing or malformed argument 'k'")
                    .await;
            };
            let Some(signature) =
                dict_bytes(&args, b"sig").and_then(|s| <[u8; 64]>::try_from(s).ok())
            else {
                return self
                    .send_error(sender, t, 203, "Missing or malformed argument 'sig'")
                    .await;
            };
            let Some(seq) = dict_int(&args, b"seq") else {
                return self.send_error(sender, t, 203, "Missing argument 'seq'").await;
            };
            let salt = dict_bytes(&args, b"salt").unwrap_or_default().to_vec();
            if salt.len() > crate::MAX_SALT_SIZE {
                return self.send_error(sender, t, 207, "Argument 'salt' too big").await;
            }
            let cas = dict_int(&args, b"cas");

            let target = mutable_target(&pk, &salt);
            if !self
                .data_tokens
                .lock()
                .unwrap()
                .verify(&sender.ip(), &target, &token)
            {
                return self.send_error(sender, t, 203, "Incorrect put token").await;
            }
            if !self.is_responsible_for(&target) {
                return self
                    .send_error(sender, t, 201, "This data item is not my responsibility")
                    .await;
            }

            let item = MutableItem {
                public_key: pk,
                salt,
                value,
                seq,
                signature,
            };
            let put = self.data.lock().unwrap().put_mutable(item, cas);
            match put {
                Ok(_) => self.send_reply(sender, t, Dict::new()).await,
                Err(e) => self.send_error(sender, t, e.code(), e.message()).await,
            }
        } else {
            let target = immutable_target(&value);
            if !self
                .data_tokens
                .lock()
                .unwrap()
                .verify(&sender.ip(), &target, &token)
            {
                return self.send_error(sender, t, 203, "Incorrect put token").await;
            }
            if !self.is_responsible_for(&target) {
                return self
                    .send_error(sender, t, 201, "This data item is not my responsibility")
                    .await;
            }
            let put = self.data.lock().unwrap().put_immutable(value);
            match put {
                Ok(_) => self.send_reply(sender, t, Dict::new()).await,
                Err(e) => self.send_error(sender, t, e.code(), e.message()).await,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use warren_transport::UdpMultiplexer;

    async fn test_node() -> (DhtNode, SocketAddr) {
        let any: SocketAddr = "127.0.0.1:0".parse().unwrap();
        let (mux, dht_socket) = UdpMultiplexer::bind(any).await.unwrap();
        let addr = mux.local_addr();
        std::mem::forget(mux);
        let config = DhtConfig {
            bootstrap_servers: vec![], // no live network in unit tests
            ..Default::default()
        };
        let node = DhtNode::new(dht_socket, config);
        (node, addr)
    }

    /// A bare UDP client for poking the server side.
    struct RawClient {
        socket: tokio::net::UdpSocket,
    }

    impl RawClient {
        async fn new() -> Self {
            Self {
                socket: tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap(),
            }
        }

        async fn query(&self, dest: SocketAddr, q: &str, args: Dict) -> Dict {
            let mut msg = Dict::new();
            msg.insert(b"t".to_vec(), Value::bytes(&b"xy"[..]));
            msg.insert(b"y".to_vec(), Value::from("q"));
            msg.insert(b"q".to_vec(), Value::from(q));
            msg.insert(b"a".to_vec(), Value::Dict(args));
            self.socket
                .send_to(&Value::Dict(msg).encode(), dest)
                .await
                .unwrap();

            let mut buf = vec![0u8; 64 * 1024];
            let (len, _) = tokio::time::timeout(
                Duration::from_secs(2),
                self.socket.recv_from(&mut buf),
            )
            .await
            .unwrap()
            .unwrap();
            match Value::decode(&buf[..len]) {
                Some(Value::Dict(d)) => d,
                _ => panic!("undecodable reply"),
            }
        }
    }

    fn base_args() -> Dict {
        let mut args = Dict::new();
        args.insert(b"id".to_vec(), Value::bytes(vec![7u8; 20]));
        args
    }

    fn reply_dict(msg: &Dict) -> Dict {
        assert_eq!(dict_bytes(msg, b"y"), Some(&b"r"[..]), "not a reply: {msg:?}");
        msg.get(b"r".as_slice())
            .and_then(|v| v.as_dict())
            .cloned()
            .unwrap()
    }

    #[tokio::test]
    async fn test_ping_reply_envelope() {
        let (node, addr) = test_node().await;
        node.force_ready_for_tests(NodeId::from_bytes([1u8; 20]));

        let client = RawClient::new().await;
        let msg = client.query(addr, "ping", base_args()).await;
        // Correct BEP-5 envelope: y=r with the reply under r.
        let r = reply_dict(&msg);
        assert_eq!(dict_bytes(&r, b"id").unwrap().len(), 20);
    }

    #[tokio::test]
    async fn test_malformed_id_rejected() {
        let (node, addr) = test_node().await;
        node.force_ready_for_tests(NodeId::from_bytes([1u8; 20]));

        let client = RawClient::new().await;
        let mut args = Dict::new();
        args.insert(b"id".to_vec(), Value::bytes(vec![7u8; 19]));
        let msg = client.query(addr, "ping", args).await;
        assert_eq!(dict_bytes(&msg, b"y"), Some(&b"e"[..]));
        let e = msg.get(b"e".as_slice()).and_then(|v| v.as_list()).unwrap();
        assert_eq!(e[0].as_int(), Some(203));
    }

    #[tokio::test]
    async fn test_get_peers_then_announce() {
        let (node, addr) = test_node().await;
        node.force_ready_for_tests(NodeId::from_bytes([1u8; 20]));

        let client = RawClient::new().await;
        let infohash = vec![9u8; 20];

        let mut args = base_args();
        args.insert(b"info_hash".to_vec(), Value::bytes(infohash.clone()));
        let r = reply_dict(&client.query(addr, "get_peers", args).await);
        let token = dict_bytes(&r, b"token").unwrap().to_vec();
        assert!(r.get(b"values".as_slice()).is_none());

        // Announce with implied port.
        let mut args = base_args();
        args.insert(b"info_hash".to_vec(), Value::bytes(infohash.clone()));
        args.insert(b"token".to_vec(), Value::bytes(token));
        args.insert(b"port".to_vec(), Value::Int(0));
        args.insert(b"implied_port".to_vec(), Value::Int(1));
        let msg = client.query(addr, "announce_peer", args).await;
        reply_dict(&msg);

        // The swarm now lists the announcer at its UDP source port.
        let mut args = base_args();
        args.insert(b"info_hash".to_vec(), Value::bytes(infohash));
        let r = reply_dict(&client.query(addr, "get_peers", args).await);
        let values = r.get(b"values".as_slice()).and_then(|v| v.as_list()).unwrap();
        let ep = decode_endpoint(values[0].as_bytes().unwrap()).unwrap();
        assert_eq!(ep, client.socket.local_addr().unwrap());
    }

    #[tokio::test]
    async fn test_announce_bad_token_rejected() {
        let (node, addr) = test_node().await;
        node.force_ready_for_tests(NodeId::from_bytes([1u8; 20]));

        let client = RawClient::new().await;
        let mut args = base_args();
        args.insert(b"info_hash".to_vec(), Value::bytes(vec![9u8; 20]));
        args.insert(b"token".to_vec(), Value::bytes(&b"bogus"[..]));
        args.insert(b"port".to_vec(), Value::Int(6881));
        let msg = client.query(addr, "announce_peer", args).await;
        assert_eq!(dict_bytes(&msg, b"y"), Some(&b"e"[..]));
    }

    #[tokio::test]
    async fn test_put_get_immutable_server_side() {
        let (node, addr) = test_node().await;
        node.force_ready_for_tests(NodeId::from_bytes([1u8; 20]));

        let client = RawClient::new().await;
        let value = Value::bytes(&b"payload"[..]);
        let target = immutable_target(&value);

        let mut args = base_args();
        args.insert(b"target".to_vec(), Value::bytes(target.as_bytes().to_vec()));
        let r = reply_dict(&client.query(addr, "get", args).await);
        let token = dict_bytes(&r, b"token").unwrap().to_vec();
        assert!(r.get(b"v".as_slice()).is_none());

        let mut args = base_args();
        args.insert(b"v".to_vec(), value.clone());
        args.insert(b"token".to_vec(), Value::bytes(token));
        reply_dict(&client.query(addr, "put", args).await);

        let mut args = base_args();
        args.insert(b"target".to_vec(), Value::bytes(target.as_bytes().to_vec()));
        let r = reply_dict(&client.query(addr, "get", args).await);
        assert_eq!(r.get(b"v".as_slice()), Some(&value));
    }

    async fn get_put_token(client: &RawClient, addr: SocketAddr, target: NodeId) -> Vec<u8> {
        let mut args = base_args();
        args.insert(b"target".to_vec(), Value::bytes(target.as_bytes().to_vec()));
        let r = reply_dict(&client.query(addr, "get", args).await);
        dict_bytes(&r, b"token").unwrap().to_vec()
    }

    async fn put_item(
        client: &RawClient,
        addr: SocketAddr,
        item: &MutableItem,
        cas: Option<i64>,
        token: Vec<u8>,
    ) -> Dict {
        let mut args = base_args();
        args.insert(
            b"k".to_vec(),
            Value::bytes(item.public_key.to_bytes().to_vec()),
        );
        args.insert(b"seq".to_vec(), Value::Int(item.seq));
        args.insert(b"sig".to_vec(), Value::bytes(item.signature.to_vec()));
        args.insert(b"v".to_vec(), item.value.clone());
        args.insert(b"token".to_vec(), Value::bytes(token));
        if let Some(cas) = cas {
            args.insert(b"cas".to_vec(), Value::Int(cas));
        }
        client.query(addr, "put", args).await
    }

    fn error_code(msg: &Dict) -> Option<i64> {
        msg.get(b"e".as_slice())
            .and_then(|v| v.as_list())
            .and_then(|l| l.first())
            .and_then(|v| v.as_int())
    }

    #[tokio::test]
    async fn test_put_mutable_cas_codes() {
        use warren_crypto::ed25519::SigningKey;

        let (node, addr) = test_node().await;
        node.force_ready_for_tests(NodeId::from_bytes([1u8; 20]));
        let client = RawClient::new().await;
        let key = SigningKey::from_bytes(&[3u8; 32]);
        let target = mutable_target(&key.public_key(), b"");

        // Scenario: A@1 stored; B@1 with cas=1 swaps; C@1 with cas=1 -> 301.
        let a = MutableItem::sign(&key, vec![], Value::bytes(&b"A"[..]), 1);
        let token = get_put_token(&client, addr, target).await;
        reply_dict(&put_item(&client, addr, &a, None, token).await);

        let b = MutableItem::sign(&key, vec![], Value::bytes(&b"B"[..]), 1);
        let token = get_put_token(&client, addr, target).await;
        reply_dict(&put_item(&client, addr, &b, Some(1), token).await);

        let c = MutableItem::sign(&key, vec![], Value::bytes(&b"C"[..]), 1);
        let token = get_put_token(&client, addr, target).await;
        let msg = put_item(&client, addr, &c, Some(1), token).await;
        assert_eq!(error_code(&msg), Some(301));

        // Lower sequence: 302.
        let old = MutableItem::sign(&key, vec![], Value::bytes(&b"O"[..]), 0);
        let token = get_put_token(&client, addr, target).await;
        let msg = put_item(&client, addr, &old, None, token).await;
        assert_eq!(error_code(&msg), Some(302));

        // Bad signature: 206.
        let mut bad = MutableItem::sign(&key, vec![], Value::bytes(&b"X"[..]), 9);
        bad.signature[0] ^= 1;
        let token = get_put_token(&client, addr, target).await;
        let msg = put_item(&client, addr, &bad, None, token).await;
        assert_eq!(error_code(&msg), Some(206));
    }

    #[tokio::test]
    async fn test_reply_from_wrong_endpoint_dropped() {
        let (node_a, _addr_a) = test_node().await;
        node_a.force_ready_for_tests(NodeId::from_bytes([1u8; 20]));

        // The queried endpoint never answers itself; a bystander echoes a
        // well-formed reply with the right transaction id from a different
        // socket. The query must time out regardless.
        let silent = RawClient::new().await;
        let bystander = RawClient::new().await;
        let silent_addr = silent.socket.local_addr().unwrap();

        tokio::spawn(async move {
            let mut buf = vec![0u8; 64 * 1024];
            let (len, from) = silent.socket.recv_from(&mut buf).await.unwrap();
            let Some(Value::Dict(q)) = Value::decode(&buf[..len]) else {
                return;
            };
            let transaction = dict_bytes(&q, b"t").unwrap().to_vec();
            let mut r = Dict::new();
            r.insert(b"id".to_vec(), Value::bytes(vec![8u8; 20]));
            let mut msg = Dict::new();
            msg.insert(b"t".to_vec(), Value::bytes(transaction));
            msg.insert(b"y".to_vec(), Value::from("r"));
            msg.insert(b"r".to_vec(), Value::Dict(r));
            bystander
                .socket
                .send_to(&Value::Dict(msg).encode(), from)
                .await
                .unwrap();
        });

        let cancel = CancellationToken::new();
        let contact = NodeContact {
            id: NodeId::from_bytes([8u8; 20]),
            endpoint: silent_addr,
        };
        let result = node_a.inner.send_ping(contact, &cancel).await;
        assert!(matches!(result, Err(DhtError::TimedOut)), "{result:?}");
    }

    #[tokio::test]
    async fn test_traversal_over_two_local_nodes() {
        let (node_a, _addr_a) = test_node().await;
        let (node_b, addr_b) = test_node().await;
        node_a.force_ready_for_tests(NodeId::from_bytes([0xaa; 20]));
        node_b.force_ready_for_tests(NodeId::from_bytes([0xbb; 20]));
        node_a.add_bootstrap_endpoint_for_tests(addr_b);

        let cancel = CancellationToken::new();
        let infohash = NodeId::from_bytes([0x33; 20]);

        // B has no peers for the infohash; the search must still converge
        // via the bootstrap seed and return empty.
        let peers = node_a.tracker_get_peers(infohash, &cancel).await.unwrap();
        assert!(peers.is_empty());

        // Announcing reaches B (token round trip over the wire).
        let res = node_a.tracker_announce(infohash, Some(4444), &cancel).await;
        assert!(res.is_ok(), "announce failed: {res:?}");
        let stored = node_b
            .inner
            .tracker
            .lock()
            .unwrap()
            .list_peers(&infohash, 50);
        assert_eq!(stored.len(), 1);
    }

    #[tokio::test]
    async fn test_not_bootstrapped_is_try_again() {
        let (node, _) = test_node().await;
        let cancel = CancellationToken::new();
        let err = node
            .tracker_get_peers(NodeId::from_bytes([5u8; 20]), &cancel)
            .await;
        assert!(matches!(err, Err(DhtError::TryAgain)));
    }

    #[tokio::test]
    async fn test_mutable_roundtrip_over_wire() {
        use warren_crypto::ed25519::SigningKey;

        let (node_a, _) = test_node().await;
        let (node_b, addr_b) = test_node().await;
        node_a.force_ready_for_tests(NodeId::from_bytes([0xaa; 20]));
        node_b.force_ready_for_tests(NodeId::from_bytes([0xbb; 20]));
        node_a.add_bootstrap_endpoint_for_tests(addr_b);

        let cancel = CancellationToken::new();
        let key = SigningKey::from_bytes(&[9u8; 32]);
        let item = MutableItem::sign(&key, vec![], Value::bytes(&b"hello"[..]), 7);

        node_a.data_put_mutable(item, &cancel).await.unwrap();

        let got = node_a
            .data_get_mutable(&key.public_key(), b"", &cancel)
            .await
            .unwrap();
        assert_eq!(got.seq, 7);
        assert_eq!(got.value, Value::bytes(&b"hello"[..]));
    }

    #[tokio::test]
    async fn test_immutable_roundtrip_over_wire() {
        let (node_a, _) = test_node().await;
        let (node_b, addr_b) = test_node().await;
        node_a.force_ready_for_tests(NodeId::from_bytes([0xaa; 20]));
        node_b.force_ready_for_tests(NodeId::from_bytes([0xbb; 20]));
        node_a.add_bootstrap_endpoint_for_tests(addr_b);

        let cancel = CancellationToken::new();
        let value = Value::bytes(&b"immutable payload"[..]);
        let key = node_a.data_put_immutable(value.clone(), &cancel).await.unwrap();
        let got = node_a.data_get_immutable(key, &cancel).await.unwrap();
        assert_eq!(got, value);
    }
}
