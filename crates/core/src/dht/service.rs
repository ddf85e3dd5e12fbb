// Coral is an open source distributed map-reduce engine.
// Copyright (C) 2024 Stract ApS
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as
// published by the Free Software Foundation, either version 3 of the
// License, or (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::daemon::{Insert, Lookup, Remove, RemoteDaemon, StoreEntries};
use crate::distributed::member::Endpoint;
use crate::id::NodeId;

use super::{ChordNode, Error, Stored};

/// Key/value store layered over the ring. Writes land on the key's primary
/// owner and fan out to the next `R - 1` successors; readers fall back to
/// replicas when the primary is gone. Conflicts resolve last-writer-wins on
/// the version counter minted by the primary.
pub struct ChordService {
    node: Arc<ChordNode>,
    store: Mutex<BTreeMap<String, Stored>>,
    clock: AtomicU64,
}

impl ChordService {
    pub fn new(node: Arc<ChordNode>) -> Self {
        Self {
            node,
            store: Mutex::new(BTreeMap::new()),
            clock: AtomicU64::new(0),
        }
    }

    pub fn node(&self) -> &Arc<ChordNode> {
        &self.node
    }

    fn mint(&self, bytes: Vec<u8>) -> Stored {
        Stored {
            version: self.clock.fetch_add(1, Ordering::SeqCst) + 1,
            bytes,
        }
    }

    /// Read from the local shard only. Remote callers hit this through the
    /// daemon's `Lookup` handler after routing to the owner themselves.
    pub fn local_value(&self, key: &str) -> Option<Vec<u8>> {
        self.local_get(key)
    }

    fn local_get(&self, key: &str) -> Option<Vec<u8>> {
        self.store
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .map(|stored| stored.bytes.clone())
    }

    fn local_remove(&self, key: &str) {
        self.store
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(key);
    }

    /// Applies replicated records, keeping whichever version is newer.
    pub fn apply_entries(&self, entries: Vec<(String, Stored)>) {
        let mut store = self.store.lock().unwrap_or_else(|e| e.into_inner());

        for (key, stored) in entries {
            self.clock.fetch_max(stored.version, Ordering::SeqCst);

            match store.get(&key) {
                Some(existing) if existing.version >= stored.version => {}
                _ => {
                    store.insert(key, stored);
                }
            }
        }
    }

    pub fn local_entries(&self) -> Vec<(String, Stored)> {
        self.store
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }

    fn replica_targets(&self) -> Vec<Endpoint> {
        let replicas = self.node.config().replication.saturating_sub(1);
        self.node
            .successor_list()
            .into_iter()
            .filter(|endpoint| endpoint != self.node.endpoint())
            .take(replicas)
            .collect()
    }

    /// Pushes records to the replica set in the background; writes do not
    /// wait for replicas to catch up.
    fn spawn_replicate(&self, entries: Vec<(String, Stored)>) {
        let net = self.node.config().net;

        for target in self.replica_targets() {
            let entries = entries.clone();
            tokio::spawn(async move {
                if let Err(err) = RemoteDaemon::new(target.addr, net)
                    .send_once(&StoreEntries { entries })
                    .await
                {
                    tracing::debug!(%target, ?err, "replica push failed");
                }
            });
        }
    }

    pub async fn insert(&self, key: &str, value: Vec<u8>) -> Result<(), Error> {
        self.handle_insert(key.to_string(), value, false).await
    }

    pub async fn lookup(&self, key: &str) -> Result<Option<Vec<u8>>, Error> {
        let retries = self.node.config().net.request_retries;

        for _ in 0..retries.max(1) {
            let owner = self.node.find_successor(NodeId::of_key(key)).await?;

            if owner == *self.node.endpoint() {
                return Ok(self.local_get(key));
            }

            match RemoteDaemon::new(owner.addr, self.node.config().net)
                .send_once(&Lookup {
                    key: key.to_string(),
                })
                .await
            {
                Ok(res) => return res,
                Err(_) => {
                    // the ring heals around the dead owner; the next lookup
                    // resolves to a replica-holding successor
                    self.node.drop_peer(&owner);
                }
            }
        }

        if let Some(bytes) = self.local_get(key) {
            return Ok(Some(bytes));
        }

        Err(Error::RingUnavailable)
    }

    pub async fn remove(&self, key: &str) -> Result<(), Error> {
        let owner = self.node.find_successor(NodeId::of_key(key)).await?;

        if owner == *self.node.endpoint() {
            self.remove_as_owner(key);
            return Ok(());
        }

        RemoteDaemon::new(owner.addr, self.node.config().net)
            .send(&Remove {
                key: key.to_string(),
                replicate: true,
            })
            .await
            .map_err(|_| Error::Unreachable)?
    }

    /// Removes a key we own and tells the replica set to forget it too.
    pub fn remove_as_owner(&self, key: &str) {
        self.local_remove(key);

        let net = self.node.config().net;
        for target in self.replica_targets() {
            let key = key.to_string();
            tokio::spawn(async move {
                let req = Remove {
                    key,
                    replicate: false,
                };
                if let Err(err) = RemoteDaemon::new(target.addr, net).send_once(&req).await {
                    tracing::debug!(%target, ?err, "replica removal failed");
                }
            });
        }
    }

    pub fn remove_replica(&self, key: &str) {
        self.local_remove(key);
    }

    /// Handles an incoming write. A write that was already forwarded once is
    /// stored locally even when our ownership view disagrees with the
    /// sender's; the recheck loop re-routes it once the ring settles. This
    /// bounds forwarding to a single hop.
    pub async fn handle_insert(
        &self,
        key: String,
        value: Vec<u8>,
        forwarded: bool,
    ) -> Result<(), Error> {
        let owner = self.node.find_successor(NodeId::of_key(&key)).await?;

        if owner == *self.node.endpoint() || forwarded {
            let stored = self.mint(value);
            self.apply_entries(vec![(key.clone(), stored.clone())]);
            self.spawn_replicate(vec![(key, stored)]);
            return Ok(());
        }

        RemoteDaemon::new(owner.addr, self.node.config().net)
            .send(&Insert {
                key,
                value,
                forwarded: true,
            })
            .await
            .map_err(|_| Error::Unreachable)?
    }

    /// One replica-maintenance tick: re-push records we own to the current
    /// replica set and hand stray records back to their owner.
    pub async fn recheck_once(&self) {
        let predecessor = self.node.predecessor();
        let self_id = self.node.id();

        let mut owned = Vec::new();
        let mut stray = Vec::new();

        for (key, stored) in self.local_entries() {
            let hash = NodeId::of_key(&key);
            let is_owner = match &predecessor {
                Some(pred) => hash.in_open_closed(&NodeId::of_endpoint(pred), &self_id),
                None => true,
            };

            if is_owner {
                owned.push((key, stored));
            } else {
                stray.push((key, stored));
            }
        }

        if !owned.is_empty() {
            self.spawn_replicate(owned);
        }

        for (key, stored) in stray {
            if let Ok(owner) = self.node.find_successor(NodeId::of_key(&key)).await {
                if owner == *self.node.endpoint() {
                    continue;
                }

                let net = self.node.config().net;
                let entries = vec![(key, stored)];
                tokio::spawn(async move {
                    RemoteDaemon::new(owner.addr, net)
                        .send_once(&StoreEntries { entries })
                        .await
                        .ok();
                });
            }
        }
    }

    /// Bulk transfer used on graceful shutdown: everything we hold goes to
    /// our successor so replication stays intact without us.
    pub async fn handoff_all(&self) {
        let successor = self.node.successor();
        if successor == *self.node.endpoint() {
            return;
        }

        let entries = self.local_entries();
        if entries.is_empty() {
            return;
        }

        if let Err(err) = RemoteDaemon::new(successor.addr, self.node.config().net)
            .send(&StoreEntries { entries })
            .await
        {
            tracing::warn!(%successor, ?err, "key handoff failed");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NetConfig;
    use crate::dht::RingConfig;
    use std::time::Duration;

    fn test_service() -> ChordService {
        let endpoint = Endpoint::new("chord.dht", "127.0.0.1:7100".parse().unwrap());
        let node = Arc::new(ChordNode::new(
            endpoint,
            RingConfig {
                replication: 3,
                finger_table_size: 80,
                net: NetConfig {
                    request_timeout: Duration::from_millis(100),
                    request_retries: 2,
                },
            },
        ));

        ChordService::new(node)
    }

    #[tokio::test]
    async fn insert_lookup_roundtrip_on_sole_node() {
        let service = test_service();

        service.insert("greeting", b"hello".to_vec()).await.unwrap();
        assert_eq!(
            service.lookup("greeting").await.unwrap(),
            Some(b"hello".to_vec())
        );
        assert_eq!(service.lookup("missing").await.unwrap(), None);
    }

    #[tokio::test]
    async fn newer_version_wins() {
        let service = test_service();

        service.apply_entries(vec![(
            "key".to_string(),
            Stored {
                version: 5,
                bytes: b"new".to_vec(),
            },
        )]);
        service.apply_entries(vec![(
            "key".to_string(),
            Stored {
                version: 3,
                bytes: b"old".to_vec(),
            },
        )]);

        assert_eq!(service.local_get("key"), Some(b"new".to_vec()));
    }

    #[tokio::test]
    async fn minted_versions_advance_past_replicated_ones() {
        let service = test_service();

        service.apply_entries(vec![(
            "other".to_string(),
            Stored {
                version: 40,
                bytes: Vec::new(),
            },
        )]);

        service.insert("key", b"v".to_vec()).await.unwrap();
        let entries = service.local_entries();
        let (_, stored) = entries.iter().find(|(k, _)| k == "key").unwrap();
        assert!(stored.version > 40);
    }

    #[tokio::test]
    async fn remove_deletes_locally() {
        let service = test_service();

        service.insert("key", b"v".to_vec()).await.unwrap();
        service.remove("key").await.unwrap();

        assert_eq!(service.lookup("key").await.unwrap(), None);
    }
}
