//! Periodic and manual swarm announcement.
//!
//! A periodic announcer keeps one infohash alive on the DHT by
//! re-announcing at a uniformly random interval between 5 and 30 minutes,
//! backing off between one second and one minute after failures. A manual
//! announcer stays quiet until [`ManualAnnouncer::update`] is called, then
//! announces once and goes back to waiting.
//!
//! Both hold only a weak handle onto the node: dropping the node stops the
//! loops, dropping the announcer cancels them.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use rand::Rng;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::node::DhtNode;
use crate::node_id::NodeId;

/// Re-announce interval bounds after success.
const REANNOUNCE_MIN: Duration = Duration::from_secs(5 * 60);
const REANNOUNCE_MAX: Duration = Duration::from_secs(30 * 60);

/// Backoff bounds after a failed announce.
const BACKOFF_MIN: Duration = Duration::from_secs(1);
const BACKOFF_MAX: Duration = Duration::from_secs(60);

fn uniform(min: Duration, max: Duration) -> Duration {
    let span = max.as_millis().saturating_sub(min.as_millis()) as u64;
    min + Duration::from_millis(rand::thread_rng().gen_range(0..=span))
}

#[derive(Clone, Copy, PartialEq, Eq)]
enum Mode {
    Periodic,
    Manual,
}

struct AnnouncerCore {
    infohash: NodeId,
    dht: Weak<DhtNode>,
    mode: Mode,
    cancel: CancellationToken,
    kick: Arc<Notify>,
    go_again: Arc<AtomicBool>,
}

impl AnnouncerCore {
    async fn run(self) {
        debug!(infohash = %self.infohash, "announcer started");
        loop {
            if self.mode == Mode::Manual {
                while !self.go_again.swap(false, Ordering::SeqCst) {
                    tokio::select! {
                        _ = self.cancel.cancelled() => return,
                        _ = self.kick.notified() => {}
                    }
                }
            }

            let Some(dht) = self.dht.upgrade() else { return };
            if dht.wait_ready(&self.cancel).await.is_err() {
                return;
            }

            debug!(infohash = %self.infohash, "announcing");
            let result = dht.tracker_announce(self.infohash, None, &self.cancel).await;
            drop(dht);
            if self.cancel.is_cancelled() {
                return;
            }

            let sleep = match result {
                Ok(_) => {
                    debug!(infohash = %self.infohash, "announce ok");
                    if self.mode == Mode::Manual {
                        continue; // straight back to waiting
                    }
                    uniform(REANNOUNCE_MIN, REANNOUNCE_MAX)
                }
                Err(e) => {
                    warn!(infohash = %self.infohash, error = %e, "announce failed, backing off");
                    uniform(BACKOFF_MIN, BACKOFF_MAX)
                }
            };

            tokio::select! {
                _ = self.cancel.cancelled() => return,
                _ = tokio::time::sleep(sleep) => {}
            }
        }
    }
}

/// Keeps an infohash announced on a random 5–30 minute cadence.
pub struct PeriodicAnnouncer {
    cancel: CancellationToken,
}

impl PeriodicAnnouncer {
    pub fn new(infohash: NodeId, dht: Weak<DhtNode>) -> Self {
        let cancel = CancellationToken::new();
        let core = AnnouncerCore {
            infohash,
            dht,
            mode: Mode::Periodic,
            cancel: cancel.clone(),
            kick: Arc::new(Notify::new()),
            go_again: Arc::new(AtomicBool::new(false)),
        };
        tokio::spawn(core.run());
        Self { cancel }
    }
}

impl Drop for PeriodicAnnouncer {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Announces an infohash only when told to.
pub struct ManualAnnouncer {
    cancel: CancellationToken,
    kick: Arc<Notify>,
    go_again: Arc<AtomicBool>,
}

impl ManualAnnouncer {
    pub fn new(infohash: NodeId, dht: Weak<DhtNode>) -> Self {
        let cancel = CancellationToken::new();
        let kick = Arc::new(Notify::new());
        let go_again = Arc::new(AtomicBool::new(false));
        let core = AnnouncerCore {
            infohash,
            dht,
            mode: Mode::Manual,
            cancel: cancel.clone(),
            kick: kick.clone(),
            go_again: go_again.clone(),
        };
        tokio::spawn(core.run());
        Self {
            cancel,
            kick,
            go_again,
        }
    }

    /// Request one announcement round. Safe to call repeatedly; rounds in
    /// progress absorb later requests.
    pub fn update(&self) {
        self.go_again.store(true, Ordering::SeqCst);
        self.kick.notify_one();
    }
}

impl Drop for ManualAnnouncer {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uniform_bounds() {
        for _ in 0..100 {
            let d = uniform(BACKOFF_MIN, BACKOFF_MAX);
            assert!(d >= BACKOFF_MIN && d <= BACKOFF_MAX);
        }
        // Degenerate span.
        assert_eq!(
            uniform(Duration::from_secs(4), Duration::from_secs(4)),
            Duration::from_secs(4)
        );
    }
}
