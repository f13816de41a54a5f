//! Persistent DHT groups.
//!
//! A group maps a swarm-worthy name (usually a host) to the set of cached
//! item keys (URLs) belonging to it. Groups survive restarts so the
//! announcer can immediately re-advertise everything the cache holds.
//!
//! On-disk layout under the root directory:
//!
//! ```text
//! <sha1-hex(group)>/group_name      the group name itself
//! <sha1-hex(group)>/items/<sha1-hex(item)>   each item's name
//! ```
//!
//! Malformed group directories found while loading are removed.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use tokio::fs;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use warren_crypto::sha::sha1;

use crate::{ClientError, Result};

/// Longest stored group or item name; anything bigger is hostile.
const MAX_NAME_LEN: u64 = 2000;

/// The persistent group map.
pub struct DhtGroups {
    root: PathBuf,
    groups: BTreeMap<String, BTreeSet<String>>,
}

fn name_dir(root: &Path, name: &str) -> PathBuf {
    root.join(hex::encode(sha1(name)))
}

async fn read_name_file(path: &Path) -> Result<String> {
    let meta = fs::metadata(path).await?;
    if meta.len() > MAX_NAME_LEN {
        return Err(ClientError::InvalidArgument("stored name too large".into()));
    }
    let raw = fs::read(path).await?;
    String::from_utf8(raw).map_err(|_| ClientError::InvalidArgument("stored name not UTF-8".into()))
}

impl DhtGroups {
    /// Load all groups under `root`, creating it if needed. Unreadable
    /// group directories are removed.
    pub async fn load(root: impl Into<PathBuf>, cancel: &CancellationToken) -> Result<DhtGroups> {
        let root = root.into();
        fs::create_dir_all(&root).await?;

        let mut groups = BTreeMap::new();
        let mut dir = fs::read_dir(&root).await?;
        while let Some(entry) = dir.next_entry().await? {
            if cancel.is_cancelled() {
                return Err(ClientError::OperationAborted);
            }
            let path = entry.path();
            if !path.is_dir() {
                warn!(path = %path.display(), "removing stray file in groups dir");
                let _ = fs::remove_file(&path).await;
                continue;
            }
            match Self::load_group(&path).await {
                Ok((name, items)) => {
                    debug!(group = %name, items = items.len(), "loaded group");
                    groups.insert(name, items);
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "removing unreadable group");
                    let _ = fs::remove_dir_all(&path).await;
                }
            }
        }
        Ok(DhtGroups { root, groups })
    }

    async fn load_group(dir: &Path) -> Result<(String, BTreeSet<String>)> {
        let name = read_name_file(&dir.join("group_name")).await?;

        let mut items = BTreeSet::new();
        let items_dir = dir.join("items");
        if let Ok(mut rd) = fs::read_dir(&items_dir).await {
            while let Some(entry) = rd.next_entry().await? {
                match read_name_file(&entry.path()).await {
                    Ok(item) => {
                        items.insert(item);
                    }
                    Err(e) => {
                        warn!(path = %entry.path().display(), error = %e, "dropping unreadable item");
                        let _ = fs::remove_file(entry.path()).await;
                    }
                }
            }
        }
        Ok((name, items))
    }

    /// All group names.
    pub fn groups(&self) -> impl Iterator<Item = &str> {
        self.groups.keys().map(String::as_str)
    }

    /// Items of one group.
    pub fn items(&self, group: &str) -> impl Iterator<Item = &str> {
        self.groups
            .get(group)
            .into_iter()
            .flat_map(|s| s.iter().map(String::as_str))
    }

    /// Add `item` to `group`, persisting both.
    pub async fn add(&mut self, group: &str, item: &str) -> Result<()> {
        let dir = name_dir(&self.root, group);
        let items_dir = dir.join("items");
        fs::create_dir_all(&items_dir).await?;
        fs::write(dir.join("group_name"), group.as_bytes()).await?;
        fs::write(items_dir.join(hex::encode(sha1(item))), item.as_bytes()).await?;

        self.groups
            .entry(group.to_string())
            .or_default()
            .insert(item.to_string());
        Ok(())
    }

    /// Remove `item` from every group. Returns the groups that became
    /// empty (their swarms can stop being announced).
    pub async fn remove_item(&mut self, item: &str) -> Result<Vec<String>> {
        let item_fname = hex::encode(sha1(item));
        let mut emptied = Vec::new();

        let group_names: Vec<String> = self.groups.keys().cloned().collect();
        for group in group_names {
            let Some(items) = self.groups.get_mut(&group) else { continue };
            if !items.remove(item) {
                continue;
            }
            let dir = name_dir(&self.root, &group);
            let _ = fs::remove_file(dir.join("items").join(&item_fname)).await;

            if items.is_empty() {
                self.groups.remove(&group);
                let _ = fs::remove_dir_all(&dir).await;
                emptied.push(group);
            }
        }
        Ok(emptied)
    }

    /// Remove a whole group.
    pub async fn remove_group(&mut self, group: &str) -> Result<()> {
        self.groups.remove(group);
        let _ = fs::remove_dir_all(name_dir(&self.root, group)).await;
        Ok(())
    }
}
