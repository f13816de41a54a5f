//! Single-flight DHT lookup cache.
//!
//! Swarm lookups are slow and bursty: one page load asks for the same
//! group many times over. Each cache entry runs at most one `get_peers`
//! traversal at a time; concurrent callers share the running job's result.
//! A successful result stays fresh for five minutes; a watchdog kills
//! jobs that run longer than that.
//!
//! A caller's cancellation only detaches that caller: the shared job
//! keeps running for the others and is aborted only when the entry itself
//! is evicted or the cache is dropped.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use lru::LruCache;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use warren_dht::{DhtNode, NodeId};

use crate::{ClientError, Result};

/// Cached lookups per node.
pub const CACHE_CAPACITY: usize = 256;

/// How long a successful result stays fresh.
const FRESH_FOR: Duration = Duration::from_secs(5 * 60);

/// Watchdog on a single lookup job.
const JOB_TIMEOUT: Duration = Duration::from_secs(5 * 60);

#[derive(Clone, Debug)]
enum Outcome {
    Found(HashSet<SocketAddr>),
    NoData,
    Failed,
}

struct State {
    last: Option<(Instant, HashSet<SocketAddr>)>,
    job: Option<broadcast::Sender<Outcome>>,
}

/// One cached, single-flight lookup for one infohash.
pub struct DhtLookup {
    infohash: NodeId,
    dht: Weak<DhtNode>,
    state: Mutex<State>,
    lifetime: CancellationToken,
}

impl DhtLookup {
    fn new(infohash: NodeId, dht: Weak<DhtNode>) -> Self {
        Self {
            infohash,
            dht,
            state: Mutex::new(State {
                last: None,
                job: None,
            }),
            lifetime: CancellationToken::new(),
        }
    }

    /// The infohash this entry looks up.
    pub fn infohash(&self) -> NodeId {
        self.infohash
    }

    /// Get the peer set: a fresh cached result if present, otherwise the
    /// result of the (possibly already running) shared job.
    pub async fn get(
        self: &Arc<Self>,
        cancel: &CancellationToken,
    ) -> Result<HashSet<SocketAddr>> {
        let mut rx = {
            let mut state = self.state.lock().unwrap();

            if let Some((at, value)) = &state.last {
                if at.elapsed() < FRESH_FOR {
                    return Ok(value.clone());
                }
            }

            match &state.job {
                Some(tx) => tx.subscribe(),
                None => {
                    let (tx, rx) = broadcast::channel(1);
                    state.job = Some(tx.clone());
                    tokio::spawn(self.clone().run_job(tx));
                    rx
                }
            }
        };

        let outcome = tokio::select! {
            _ = cancel.cancelled() => return Err(ClientError::OperationAborted),
            _ = self.lifetime.cancelled() => return Err(ClientError::OperationAborted),
            r = rx.recv() => r,
        };
        match outcome {
            Ok(Outcome::Found(peers)) => Ok(peers),
            Ok(Outcome::NoData) | Ok(Outcome::Failed) | Err(_) => Err(ClientError::NotFound),
        }
    }

    async fn run_job(self: Arc<Self>, tx: broadcast::Sender<Outcome>) {
        let job_cancel = self.lifetime.child_token();
        let watchdog = job_cancel.clone();
        let wd_task = tokio::spawn(async move {
            tokio::time::sleep(JOB_TIMEOUT).await;
            warn!("DHT lookup watchdog fired");
            watchdog.cancel();
        });

        let outcome = match self.dht.upgrade() {
            None => Outcome::Failed,
            Some(dht) => match dht.tracker_get_peers(self.infohash, &job_cancel).await {
                Ok(peers) if peers.is_empty() => Outcome::NoData,
                Ok(peers) => Outcome::Found(peers),
                Err(e) => {
                    debug!(infohash = %self.infohash, error = %e, "lookup failed");
                    Outcome::Failed
                }
            },
        };
        wd_task.abort();

        let mut state = self.state.lock().unwrap();
        if let Outcome::Found(peers) = &outcome {
            state.last = Some((Instant::now(), peers.clone()));
        }
        state.job = None;
        let _ = tx.send(outcome);
    }
}

impl Drop for DhtLookup {
    fn drop(&mut self) {
        self.lifetime.cancel();
    }
}

/// Bounded LRU of [`DhtLookup`] entries.
pub struct DhtLookupCache {
    dht: Weak<DhtNode>,
    entries: Mutex<LruCache<NodeId, Arc<DhtLookup>>>,
}

impl DhtLookupCache {
    pub fn new(dht: Weak<DhtNode>) -> Self {
        Self {
            dht,
            entries: Mutex::new(LruCache::new(NonZeroUsize::new(CACHE_CAPACITY).unwrap())),
        }
    }

    /// The lookup entry for `infohash`, created on first use. Evicted
    /// entries abort their job once the last outside reference drops.
    pub fn lookup(&self, infohash: NodeId) -> Arc<DhtLookup> {
        let mut entries = self.entries.lock().unwrap();
        if let Some(found) = entries.get(&infohash) {
            return found.clone();
        }
        let entry = Arc::new(DhtLookup::new(infohash, self.dht.clone()));
        entries.put(infohash, entry.clone());
        entry
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // The single-flight property is exercised end to end (with a live DHT
    // node) in the integration tests; here the entry's bookkeeping is
    // checked in isolation.

    #[tokio::test]
    async fn test_fresh_result_served_without_job() {
        let lookup = Arc::new(DhtLookup::new(
            NodeId::from_bytes([1u8; 20]),
            Weak::new(),
        ));
        let peers: HashSet<SocketAddr> = ["198.51.100.1:7000".parse().unwrap()].into();
        lookup.state.lock().unwrap().last = Some((Instant::now(), peers.clone()));

        let got = lookup.get(&CancellationToken::new()).await.unwrap();
        assert_eq!(got, peers);
        assert!(lookup.state.lock().unwrap().job.is_none());
    }

    #[tokio::test]
    async fn test_dead_dht_fails_not_found() {
        let lookup = Arc::new(DhtLookup::new(
            NodeId::from_bytes([2u8; 20]),
            Weak::new(), // no node behind it
        ));
        let err = lookup.get(&CancellationToken::new()).await;
        assert!(matches!(err, Err(ClientError::NotFound)));
    }

    #[tokio::test]
    async fn test_waiter_cancel_leaves_job_running() {
        let lookup = Arc::new(DhtLookup::new(
            NodeId::from_bytes([3u8; 20]),
            Weak::new(),
        ));
        // Fake a running job that never completes.
        let (tx, _rx) = broadcast::channel(1);
        lookup.state.lock().unwrap().job = Some(tx.clone());

        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = lookup.get(&cancel).await;
        assert!(matches!(err, Err(ClientError::OperationAborted)));
        // The job slot is untouched by the cancelled waiter.
        assert!(lookup.state.lock().unwrap().job.is_some());
        drop(tx);
    }

    #[tokio::test]
    async fn test_cache_returns_same_entry() {
        let cache = DhtLookupCache::new(Weak::new());
        let a = cache.lookup(NodeId::from_bytes([7u8; 20]));
        let b = cache.lookup(NodeId::from_bytes([7u8; 20]));
        assert!(Arc::ptr_eq(&a, &b));
        let c = cache.lookup(NodeId::from_bytes([8u8; 20]));
        assert!(!Arc::ptr_eq(&a, &c));
    }
}
