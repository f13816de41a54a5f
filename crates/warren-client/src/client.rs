//! The client facade: one object wiring the DHT node, the uTP transport,
//! the store, the groups, the announcers and the lookup cache together.
//!
//! `store_response` runs the injector-side path: sign the stream, write it
//! to the store, and keep the group's swarm announced. `load` runs the
//! client-side path: serve from the local store when possible, otherwise
//! race peers found through the DHT and tee every verified part into the
//! store on the way through.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use warren_cache::response::{Part, PartReader};
use warren_cache::store::{PendingEntry, StoreReader};
use warren_cache::{CacheError, HttpStore, SigningReader, PROTOCOL_VERSION};
use warren_crypto::ed25519::{PublicKey, SigningKey};
use warren_dht::announcer::PeriodicAnnouncer;
use warren_dht::{DhtConfig, DhtNode};
use warren_transport::{UdpMultiplexer, UtpConfig, UtpSocket};

use crate::groups::DhtGroups;
use crate::lookup_cache::DhtLookupCache;
use crate::multi_peer::MultiPeerReader;
use crate::swarms::{group_for_url, swarm_infohash, uri_swarm_name};
use crate::{peer_server, ClientError, Result};

/// Client knobs and directories.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Root directory of the response store.
    pub store_dir: PathBuf,
    /// Root directory of the persistent DHT groups.
    pub groups_dir: PathBuf,
    /// uTP transport tuning.
    pub utp: UtpConfig,
    /// DHT tuning.
    pub dht: DhtConfig,
}

impl ClientConfig {
    /// Conventional layout under one data directory.
    pub fn under(data_dir: impl Into<PathBuf>) -> Self {
        let data_dir = data_dir.into();
        Self {
            store_dir: data_dir.join("store"),
            groups_dir: data_dir.join("groups"),
            utp: UtpConfig::default(),
            dht: DhtConfig::default(),
        }
    }
}

struct ClientInner {
    public_key: PublicKey,
    signing_key: Option<SigningKey>,
    /// Owns the shared socket's receive task.
    _mux: UdpMultiplexer,
    dht: Arc<DhtNode>,
    utp: UtpSocket,
    store: Arc<HttpStore>,
    groups: tokio::sync::Mutex<DhtGroups>,
    lookups: DhtLookupCache,
    announcers: Mutex<HashMap<String, PeriodicAnnouncer>>,
    /// Most recent good peers per group host, tried before the DHT.
    peer_cache: Mutex<HashMap<String, Vec<SocketAddr>>>,
    lifetime: CancellationToken,
}

/// A Warren cache client (and peer server) on one UDP endpoint.
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Drop for Client {
    fn drop(&mut self) {
        self.inner.lifetime.cancel();
    }
}

impl Client {
    /// Bind to `addr` and start: DHT bootstrap, peer serving, and
    /// re-announcement of every group already in the store.
    ///
    /// `signing_key` makes this node an injector; without it,
    /// [`Client::store_response`] is refused.
    pub async fn start(
        addr: SocketAddr,
        public_key: PublicKey,
        signing_key: Option<SigningKey>,
        config: ClientConfig,
    ) -> Result<Client> {
        let lifetime = CancellationToken::new();

        let (mux, dht_socket) = UdpMultiplexer::bind(addr).await?;
        let utp = mux.utp_socket(config.utp.clone());
        let dht = Arc::new(DhtNode::new(dht_socket, config.dht.clone()));
        let store = Arc::new(HttpStore::open(&config.store_dir).await?);
        let groups = DhtGroups::load(&config.groups_dir, &lifetime).await?;
        let lookups = DhtLookupCache::new(Arc::downgrade(&dht));

        let inner = Arc::new(ClientInner {
            public_key,
            signing_key,
            _mux: mux,
            dht,
            utp,
            store,
            groups: tokio::sync::Mutex::new(groups),
            lookups,
            announcers: Mutex::new(HashMap::new()),
            peer_cache: Mutex::new(HashMap::new()),
            lifetime: lifetime.clone(),
        });

        // Serve stored responses to other peers.
        let mut listener = inner.utp.listen();
        let serve_inner = inner.clone();
        tokio::spawn(async move {
            loop {
                match listener.accept(&serve_inner.lifetime).await {
                    Ok((stream, from)) => {
                        debug!(%from, "accepted peer connection");
                        tokio::spawn(peer_server::serve(
                            stream,
                            serve_inner.store.clone(),
                            serve_inner.lifetime.child_token(),
                        ));
                    }
                    Err(_) => return,
                }
            }
        });

        // Keep every known group announced.
        {
            let groups = inner.groups.lock().await;
            let names: Vec<String> = groups.groups().map(str::to_string).collect();
            drop(groups);
            for name in names {
                inner.announce_group(&name);
            }
        }

        info!(local = %inner.utp.local_addr(), "client started");
        Ok(Client { inner })
    }

    /// The local UDP endpoint shared by DHT and uTP.
    pub fn local_endpoint(&self) -> SocketAddr {
        self.inner.utp.local_addr()
    }

    /// The DHT node.
    pub fn dht(&self) -> &Arc<DhtNode> {
        &self.inner.dht
    }

    /// The response store.
    pub fn store(&self) -> &Arc<HttpStore> {
        &self.inner.store
    }

    /// Seed the peer cache for a group host (e.g. from configuration).
    pub fn add_known_peer(&self, group: &str, ep: SocketAddr) {
        self.inner
            .peer_cache
            .lock()
            .unwrap()
            .entry(group.to_string())
            .or_default()
            .push(ep);
    }

    /// Sign and store the response streamed by `reader` under `url`, then
    /// keep its group announced. Returns the injection id.
    pub async fn store_response(
        &self,
        url: &str,
        reader: &mut (dyn PartReader + '_),
        cancel: &CancellationToken,
    ) -> Result<String> {
        let Some(signing_key) = self.inner.signing_key.clone() else {
            return Err(ClientError::InvalidArgument(
                "this node has no signing key".into(),
            ));
        };
        let group = group_for_url(url)?;

        let mut signer = SigningReader::new(reader, url, signing_key);
        let injection_id = signer.injection_id().to_string();
        self.inner.store.store(url, &mut signer, cancel).await?;

        self.inner.groups.lock().await.add(&group, url).await?;
        self.inner.announce_group(&group);
        debug!(url, group, injection_id, "stored and announced");
        Ok(injection_id)
    }

    /// Load `url`: from the local store if present, otherwise from peers
    /// (verified block by block and cached locally on the way).
    pub async fn load(&self, url: &str, cancel: &CancellationToken) -> Result<ClientResponse> {
        match self.inner.store.reader(url).await {
            Ok(reader) => {
                debug!(url, "serving from local store");
                return Ok(ClientResponse::Local(reader));
            }
            Err(CacheError::NotFound) => {}
            Err(e) => return Err(e.into()),
        }

        let group = group_for_url(url)?;
        let infohash = swarm_infohash(&uri_swarm_name(
            &self.inner.public_key,
            PROTOCOL_VERSION,
            &group,
        ));

        // Cached peers first, then whatever the DHT lookup finds.
        let mut candidates: Vec<SocketAddr> = self
            .inner
            .peer_cache
            .lock()
            .unwrap()
            .get(&group)
            .cloned()
            .unwrap_or_default();
        let lookup = self.inner.lookups.lookup(infohash);
        match lookup.get(cancel).await {
            Ok(peers) => candidates.extend(peers),
            Err(ClientError::OperationAborted) => return Err(ClientError::OperationAborted),
            Err(e) => {
                debug!(url, error = %e, "DHT lookup found nothing");
            }
        }

        let mut own: HashSet<SocketAddr> = HashSet::new();
        own.insert(self.inner.utp.local_addr());
        if let Some(wan) = self.inner.dht.wan_endpoint() {
            own.insert(wan);
        }

        let reader = MultiPeerReader::start(
            url,
            self.inner.public_key,
            self.inner.utp.clone(),
            candidates,
            own,
            cancel,
        )
        .await?;

        let entry = match self.inner.store.writer(url).await {
            Ok(entry) => Some(entry),
            Err(e) => {
                warn!(url, error = %e, "cannot tee into store");
                None
            }
        };
        Ok(ClientResponse::Remote(TeeReader {
            inner: self.inner.clone(),
            reader,
            entry,
            url: url.to_string(),
            group,
            finished: false,
        }))
    }

    /// Drop a stored entry; withdraws announcements of groups it emptied.
    pub async fn remove(&self, url: &str) -> Result<()> {
        let _ = self.inner.store.remove(url).await;
        let emptied = self.inner.groups.lock().await.remove_item(url).await?;
        let mut announcers = self.inner.announcers.lock().unwrap();
        for group in emptied {
            announcers.remove(&group);
        }
        Ok(())
    }

    /// Stop background activity.
    pub fn shutdown(&self) {
        self.inner.lifetime.cancel();
        self.inner.dht.shutdown();
    }
}

impl ClientInner {
    fn announce_group(&self, group: &str) {
        let infohash = swarm_infohash(&uri_swarm_name(&self.public_key, PROTOCOL_VERSION, group));
        let mut announcers = self.announcers.lock().unwrap();
        announcers
            .entry(group.to_string())
            .or_insert_with(|| PeriodicAnnouncer::new(infohash, Arc::downgrade(&self.dht)));
    }
}

/// What [`Client::load`] hands back.
pub enum ClientResponse {
    /// Served from the local store.
    Local(StoreReader),
    /// Fetched from peers, teeing into the local store.
    Remote(TeeReader),
}

impl std::fmt::Debug for ClientResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClientResponse::Local(_) => f.write_str("ClientResponse::Local"),
            ClientResponse::Remote(_) => f.write_str("ClientResponse::Remote"),
        }
    }
}

#[async_trait]
impl PartReader for ClientResponse {
    async fn read_part(
        &mut self,
        cancel: &CancellationToken,
    ) -> warren_cache::Result<Option<Part>> {
        match self {
            ClientResponse::Local(r) => r.read_part(cancel).await,
            ClientResponse::Remote(r) => r.read_part(cancel).await,
        }
    }
}

/// Forwards parts from a multi-peer fetch while writing them into a
/// pending store entry; commits and refreshes the peer cache at the end.
pub struct TeeReader {
    inner: Arc<ClientInner>,
    reader: MultiPeerReader,
    entry: Option<PendingEntry>,
    url: String,
    group: String,
    finished: bool,
}

#[async_trait]
impl PartReader for TeeReader {
    async fn read_part(
        &mut self,
        cancel: &CancellationToken,
    ) -> warren_cache::Result<Option<Part>> {
        let part = self.reader.read_part(cancel).await?;

        match &part {
            Some(part) => {
                if let Some(entry) = self.entry.as_mut() {
                    if let Err(e) = entry.write_part(part.clone(), cancel).await {
                        warn!(url = %self.url, error = %e, "store tee failed, continuing without");
                        self.entry = None;
                    }
                }
            }
            None if !self.finished => {
                self.finished = true;
                if let Some(entry) = self.entry.take() {
                    match entry.commit().await {
                        Ok(()) => debug!(url = %self.url, "fetched response cached"),
                        Err(e) => warn!(url = %self.url, error = %e, "failed to commit entry"),
                    }
                }

                // Remember which peers actually delivered.
                let good = self.reader.good_peers();
                if !good.is_empty() {
                    self.inner
                        .peer_cache
                        .lock()
                        .unwrap()
                        .insert(self.group.clone(), good);
                }

                // We hold it now; join the swarm.
                let mut groups = self.inner.groups.lock().await;
                let _ = groups.add(&self.group, &self.url).await;
                drop(groups);
                self.inner.announce_group(&self.group);
            }
            None => {}
        }
        Ok(part)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_layout() {
        let c = ClientConfig::under("/data/warren");
        assert_eq!(c.store_dir, PathBuf::from("/data/warren/store"));
        assert_eq!(c.groups_dir, PathBuf::from("/data/warren/groups"));
    }
}
