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

//! Cluster-wide name registry with contested leadership.
//!
//! Every node boots a naming daemon that considers itself the leader.
//! Daemons discover each other over UDP; when two leaders meet, the one with
//! the higher endpoint id keeps the registry and the loser forwards its
//! bindings and becomes a proxy. A proxy whose leader dies either adopts a
//! newly discovered leader or promotes itself, seeding its registry from the
//! mirror the previous leader kept in the DHT.

pub mod broadcast;

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use tokio::net::UdpSocket;

use crate::config::{NetConfig, NS_BACKUP_KEY};
use crate::daemon::{LookupName, RegisterName, RemoteDaemon};
use crate::dht::{decode_value, encode_value, ChordService};
use crate::distributed::member::Endpoint;
use crate::distributed::probe;
use crate::id::NodeId;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub enum Error {
    #[error("no naming leader is currently known")]
    Unavailable,
}

#[derive(Debug, Clone)]
pub struct NsConfig {
    /// UDP address the discovery listener binds to.
    pub listen_addr: SocketAddr,
    /// Broadcast target for discovery queries, when the network allows it.
    pub broadcast_to: Option<SocketAddr>,
    pub contest_interval: Duration,
    pub backup_interval: Duration,
    pub net: NetConfig,
}

struct NsState {
    is_local: bool,
    leader: Option<Endpoint>,
    registry: BTreeMap<String, Endpoint>,
}

/// A role another component wants the naming service to manage: when the
/// name is unbound or its holder dies, the local candidate takes over and
/// `start` runs; when a healthy remote holder exists, `stop` runs.
struct Delegate {
    name: String,
    endpoint: Endpoint,
    start: Box<dyn Fn() + Send + Sync>,
    stop: Box<dyn Fn() + Send + Sync>,
    started: AtomicBool,
}

pub struct NameServer {
    endpoint: Endpoint,
    id: NodeId,
    cfg: NsConfig,
    socket: Arc<UdpSocket>,
    seeds: Mutex<Vec<SocketAddr>>,
    state: tokio::sync::Mutex<NsState>,
    delegates: Mutex<Vec<Arc<Delegate>>>,
    kv: OnceLock<Arc<ChordService>>,
    alive: Arc<AtomicBool>,
}

impl NameServer {
    /// `endpoint` is the daemon address the registry RPCs are served on; its
    /// id decides contests. Starts out as a leader, like every fresh node.
    pub async fn bind(
        endpoint: Endpoint,
        seeds: Vec<SocketAddr>,
        cfg: NsConfig,
    ) -> crate::Result<Self> {
        let socket = UdpSocket::bind(cfg.listen_addr).await?;

        Ok(Self {
            id: NodeId::of_endpoint(&endpoint),
            endpoint,
            cfg,
            socket: Arc::new(socket),
            seeds: Mutex::new(seeds),
            state: tokio::sync::Mutex::new(NsState {
                is_local: true,
                leader: None,
                registry: BTreeMap::new(),
            }),
            delegates: Mutex::new(Vec::new()),
            kv: OnceLock::new(),
            alive: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// The UDP address discovery queries should be sent to.
    pub fn udp_addr(&self) -> crate::Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    pub fn set_seeds(&self, seeds: Vec<SocketAddr>) {
        *self.seeds.lock().unwrap_or_else(|e| e.into_inner()) = seeds;
    }

    fn seeds(&self) -> Vec<SocketAddr> {
        self.seeds
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub async fn is_local(&self) -> bool {
        self.state.lock().await.is_local
    }

    pub async fn leader(&self) -> Option<Endpoint> {
        let state = self.state.lock().await;
        if state.is_local {
            Some(self.endpoint.clone())
        } else {
            state.leader.clone()
        }
    }

    /// Registers a binding. `safe` skips the write when the name is already
    /// bound, which is how a losing leader forwards without clobbering.
    pub async fn register(
        &self,
        name: String,
        endpoint: Endpoint,
        safe: bool,
    ) -> Result<bool, Error> {
        let leader = {
            let mut state = self.state.lock().await;
            if state.is_local {
                if safe && state.registry.contains_key(&name) {
                    return Ok(false);
                }

                tracing::debug!(%name, %endpoint, "registered binding");
                state.registry.insert(name, endpoint);
                return Ok(true);
            }

            state.leader.clone().ok_or(Error::Unavailable)?
        };

        RemoteDaemon::new(leader.addr, self.cfg.net)
            .send(&RegisterName {
                name,
                endpoint,
                safe,
            })
            .await
            .map_err(|_| Error::Unavailable)?
    }

    pub async fn unregister(&self, name: &str) -> bool {
        let mut state = self.state.lock().await;
        if state.is_local {
            return state.registry.remove(name).is_some();
        }

        let Some(leader) = state.leader.clone() else {
            return false;
        };
        drop(state);

        RemoteDaemon::new(leader.addr, self.cfg.net)
            .send_once(&crate::daemon::UnregisterName {
                name: name.to_string(),
            })
            .await
            .unwrap_or(false)
    }

    pub async fn lookup(&self, name: &str) -> Option<Endpoint> {
        let leader = {
            let state = self.state.lock().await;
            if state.is_local {
                return state.registry.get(name).cloned();
            }

            state.leader.clone()?
        };

        RemoteDaemon::new(leader.addr, self.cfg.net)
            .send_once(&LookupName {
                name: name.to_string(),
            })
            .await
            .ok()
            .flatten()
    }

    pub async fn list(&self) -> Vec<(String, Endpoint)> {
        let leader = {
            let state = self.state.lock().await;
            if state.is_local {
                return state
                    .registry
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect();
            }

            match state.leader.clone() {
                Some(leader) => leader,
                None => return Vec::new(),
            }
        };

        RemoteDaemon::new(leader.addr, self.cfg.net)
            .send_once(&crate::daemon::ListNames)
            .await
            .unwrap_or_default()
    }

    /// Hands a role to the naming service. Must be called before `start`.
    pub fn delegate(
        &self,
        name: &str,
        endpoint: Endpoint,
        start: impl Fn() + Send + Sync + 'static,
        stop: impl Fn() + Send + Sync + 'static,
    ) {
        self.delegates
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(Arc::new(Delegate {
                name: name.to_string(),
                endpoint,
                start: Box::new(start),
                stop: Box::new(stop),
                started: AtomicBool::new(false),
            }));
    }

    /// One round of the contest protocol.
    pub async fn refresh_once(&self) {
        let is_local = self.is_local().await;

        let remote = broadcast::discover(
            &self.seeds(),
            self.cfg.broadcast_to,
            Some(&self.endpoint),
            self.cfg.contest_interval,
        )
        .await;

        if is_local {
            let Some(remote) = remote else { return };

            if NodeId::of_endpoint(&remote) > self.id {
                tracing::info!(%remote, "lost naming contest; forwarding registry");
                self.concede_to(remote).await;
            } else {
                tracing::debug!(%remote, "won naming contest");
            }

            return;
        }

        let leader = self.state.lock().await.leader.clone();
        let leader_alive = match &leader {
            Some(leader) => probe::reachable(leader.addr, self.cfg.net.request_timeout).await,
            None => false,
        };

        if leader_alive {
            return;
        }

        match remote {
            Some(remote) => {
                tracing::info!(%remote, "adopted new naming leader");
                self.state.lock().await.leader = Some(remote);
            }
            None => self.promote().await,
        }
    }

    /// Forwards every binding to the winner, then becomes a proxy. The
    /// forward uses `safe` writes so the winner's own bindings survive.
    async fn concede_to(&self, winner: Endpoint) {
        let entries: Vec<(String, Endpoint)> = {
            let state = self.state.lock().await;
            state
                .registry
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect()
        };

        let remote = RemoteDaemon::new(winner.addr, self.cfg.net);
        for (name, endpoint) in entries {
            if let Err(err) = remote
                .send(&RegisterName {
                    name: name.clone(),
                    endpoint,
                    safe: true,
                })
                .await
            {
                tracing::warn!(%name, ?err, "failed to forward binding to new leader");
            }
        }

        let mut state = self.state.lock().await;
        state.is_local = false;
        state.leader = Some(winner);
        state.registry.clear();
    }

    /// Self-promotion: no leader is reachable and discovery found none. The
    /// registry is seeded from the DHT mirror when one exists.
    async fn promote(&self) {
        let mut registry = BTreeMap::new();

        if let Some(kv) = self.kv.get() {
            if let Ok(Some(bytes)) = kv.lookup(NS_BACKUP_KEY).await {
                match decode_value::<BTreeMap<String, Endpoint>>(&bytes) {
                    Ok(mirror) => registry = mirror,
                    Err(err) => tracing::warn!(?err, "discarding undecodable registry mirror"),
                }
            }
        }

        tracing::info!(
            bindings = registry.len(),
            "no reachable naming leader; promoting self"
        );

        let mut state = self.state.lock().await;
        state.is_local = true;
        state.leader = None;
        state.registry = registry;
    }

    /// One pass over the delegated roles.
    pub async fn check_delegates_once(&self) {
        let delegates: Vec<Arc<Delegate>> = self
            .delegates
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();

        for delegate in delegates {
            match self.lookup(&delegate.name).await {
                Some(holder) if holder == delegate.endpoint => {
                    if !delegate.started.swap(true, Ordering::SeqCst) {
                        tracing::info!(name = %delegate.name, "starting delegated role");
                        (delegate.start)();
                    }
                }
                Some(holder) => {
                    if probe::reachable(holder.addr, self.cfg.net.request_timeout).await {
                        if delegate.started.swap(false, Ordering::SeqCst) {
                            tracing::info!(name = %delegate.name, %holder, "stopping delegated role; remote holder is healthy");
                            (delegate.stop)();
                        }
                    } else {
                        tracing::info!(name = %delegate.name, %holder, "holder is dead; taking over role");
                        self.register(delegate.name.clone(), delegate.endpoint.clone(), false)
                            .await
                            .ok();
                        if !delegate.started.swap(true, Ordering::SeqCst) {
                            (delegate.start)();
                        }
                    }
                }
                None => {
                    if let Ok(true) = self
                        .register(delegate.name.clone(), delegate.endpoint.clone(), true)
                        .await
                    {
                        if !delegate.started.swap(true, Ordering::SeqCst) {
                            tracing::info!(name = %delegate.name, "claimed unbound role");
                            (delegate.start)();
                        }
                    }
                }
            }
        }
    }

    /// Mirrors the registry into the DHT so a successor leader can recover
    /// it.
    pub async fn mirror_once(&self) {
        let registry = {
            let state = self.state.lock().await;
            if !state.is_local {
                return;
            }

            state.registry.clone()
        };

        if let Some(kv) = self.kv.get() {
            if let Err(err) = kv.insert(NS_BACKUP_KEY, encode_value(&registry)).await {
                tracing::debug!(?err, "failed to mirror registry");
            }
        }
    }

    /// Answers discovery queries for as long as we are the leader.
    pub fn spawn_listener(self: Arc<Self>) {
        let this = self;

        tokio::spawn(async move {
            let mut buf = [0u8; 4096];

            loop {
                if !this.alive.load(Ordering::SeqCst) {
                    break;
                }

                let received = tokio::time::timeout(
                    Duration::from_secs(1),
                    this.socket.recv_from(&mut buf),
                )
                .await;

                let Ok(Ok((n, src))) = received else { continue };

                if let Some(broadcast::Datagram::WhoIsLeader) = broadcast::decode(&buf[..n]) {
                    if this.is_local().await {
                        let answer = broadcast::encode(&broadcast::Datagram::IAmLeader {
                            leader: this.endpoint.clone(),
                        });
                        this.socket.send_to(&answer, src).await.ok();
                    }
                }
            }
        });
    }

    /// Spawns the listener, contest, delegation and mirror loops.
    pub fn start(self: Arc<Self>, kv: Arc<ChordService>) {
        let _ = self.kv.set(kv);
        self.alive.store(true, Ordering::SeqCst);

        Arc::clone(&self).spawn_listener();

        let this = Arc::clone(&self);
        tokio::spawn(async move {
            while this.alive.load(Ordering::SeqCst) {
                this.refresh_once().await;
                tokio::time::sleep(this.cfg.contest_interval).await;
            }
        });

        let this = Arc::clone(&self);
        tokio::spawn(async move {
            while this.alive.load(Ordering::SeqCst) {
                this.check_delegates_once().await;
                tokio::time::sleep(this.cfg.net.request_timeout).await;
            }
        });

        let this = self;
        tokio::spawn(async move {
            while this.alive.load(Ordering::SeqCst) {
                tokio::time::sleep(this.cfg.backup_interval).await;
                this.mirror_once().await;
            }
        });
    }

    pub fn stop(&self) {
        self.alive.store(false, Ordering::SeqCst);
    }

    #[cfg(test)]
    async fn force_proxy(&self, leader: Option<Endpoint>) {
        let mut state = self.state.lock().await;
        state.is_local = false;
        state.leader = leader;
        state.registry.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::free_socket_addr;

    fn ns_config(listen: SocketAddr) -> NsConfig {
        NsConfig {
            listen_addr: listen,
            broadcast_to: None,
            contest_interval: Duration::from_millis(100),
            backup_interval: Duration::from_secs(5),
            net: NetConfig {
                request_timeout: Duration::from_millis(200),
                request_retries: 2,
            },
        }
    }

    async fn test_ns(daemon_port: u16) -> Arc<NameServer> {
        let endpoint = Endpoint::new(
            crate::config::NS_NAME,
            format!("127.0.0.1:{daemon_port}").parse().unwrap(),
        );

        Arc::new(
            NameServer::bind(endpoint, Vec::new(), ns_config("127.0.0.1:0".parse().unwrap()))
                .await
                .unwrap(),
        )
    }

    #[tokio::test]
    async fn local_register_lookup_roundtrip() {
        let ns = test_ns(8008).await;
        let target = Endpoint::new("rq.handler", "127.0.0.1:8008".parse().unwrap());

        assert!(ns
            .register("rq.handler".to_string(), target.clone(), false)
            .await
            .unwrap());
        assert_eq!(ns.lookup("rq.handler").await, Some(target));
        assert_eq!(ns.lookup("unknown").await, None);
    }

    #[tokio::test]
    async fn safe_register_skips_existing_binding() {
        let ns = test_ns(8008).await;
        let first = Endpoint::new("svc", "127.0.0.1:1000".parse().unwrap());
        let second = Endpoint::new("svc", "127.0.0.1:2000".parse().unwrap());

        assert!(ns.register("svc".into(), first.clone(), true).await.unwrap());
        assert!(!ns.register("svc".into(), second, true).await.unwrap());
        assert_eq!(ns.lookup("svc").await, Some(first));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn contest_leaves_exactly_one_leader() {
        let a = test_ns(8008).await;
        let b = test_ns(8010).await;

        a.alive.store(true, Ordering::SeqCst);
        b.alive.store(true, Ordering::SeqCst);
        Arc::clone(&a).spawn_listener();
        Arc::clone(&b).spawn_listener();

        a.set_seeds(vec![b.udp_addr().unwrap()]);
        b.set_seeds(vec![a.udp_addr().unwrap()]);

        for _ in 0..3 {
            a.refresh_once().await;
            b.refresh_once().await;
        }

        let leaders = [a.is_local().await, b.is_local().await]
            .iter()
            .filter(|l| **l)
            .count();
        assert_eq!(leaders, 1);

        // the loser proxies to the winner
        let (winner, loser) = if a.is_local().await {
            (a.clone(), b.clone())
        } else {
            (b.clone(), a.clone())
        };
        assert_eq!(loser.leader().await.as_ref(), Some(winner.endpoint()));

        a.stop();
        b.stop();
    }

    #[tokio::test]
    async fn orphaned_proxy_promotes_itself() {
        let ns = test_ns(8008).await;

        // known leader is unreachable and discovery finds nothing
        let dead = Endpoint::new(crate::config::NS_NAME, free_socket_addr());
        ns.force_proxy(Some(dead)).await;

        ns.refresh_once().await;

        assert!(ns.is_local().await);
    }
}
