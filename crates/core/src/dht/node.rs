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

use std::net::SocketAddr;
use std::sync::Mutex;
use std::time::Duration;

use crate::daemon::{FindSuccessor, GetPredecessor, GetSuccessorList, LeaveNotice, RemoteDaemon};
use crate::distributed::member::Endpoint;
use crate::distributed::probe;
use crate::distributed::retry_strategy::{ConstantBackoff, ExponentialBackoff};
use crate::id::NodeId;

use super::{Error, RingConfig};

/// One node's view of the chord ring.
///
/// The tables are guarded by a single mutex that is only held for the short,
/// CPU-bound updates; every remote call works on a copied snapshot.
pub struct ChordNode {
    endpoint: Endpoint,
    id: NodeId,
    cfg: RingConfig,
    tables: Mutex<Tables>,
}

struct Tables {
    predecessor: Option<Endpoint>,
    successors: Vec<Endpoint>,
    fingers: Vec<Option<Endpoint>>,
    next_finger: usize,
}

impl ChordNode {
    pub fn new(endpoint: Endpoint, cfg: RingConfig) -> Self {
        let id = NodeId::of_endpoint(&endpoint);
        let tables = Tables {
            predecessor: None,
            successors: vec![endpoint.clone()],
            fingers: vec![None; cfg.finger_table_size],
            next_finger: 0,
        };

        Self {
            endpoint,
            id,
            cfg,
            tables: Mutex::new(tables),
        }
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn id(&self) -> NodeId {
        self.id
    }

    pub fn config(&self) -> &RingConfig {
        &self.cfg
    }

    fn remote(&self, addr: SocketAddr) -> RemoteDaemon {
        RemoteDaemon::new(addr, self.cfg.net)
    }

    /// The immediate successor. A sole ring member is its own successor.
    pub fn successor(&self) -> Endpoint {
        self.tables
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .successors
            .first()
            .cloned()
            .unwrap_or_else(|| self.endpoint.clone())
    }

    pub fn predecessor(&self) -> Option<Endpoint> {
        self.tables
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .predecessor
            .clone()
    }

    pub fn successor_list(&self) -> Vec<Endpoint> {
        self.tables
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .successors
            .clone()
    }

    /// Called by a node that believes it is our predecessor. Idempotent.
    pub fn notify(&self, candidate: Endpoint) {
        if candidate == self.endpoint {
            return;
        }

        let mut tables = self.tables.lock().unwrap_or_else(|e| e.into_inner());
        let adopt = match &tables.predecessor {
            None => true,
            Some(current) => NodeId::of_endpoint(&candidate)
                .in_open(&NodeId::of_endpoint(current), &self.id),
        };

        if adopt {
            tracing::debug!(%candidate, "adopted new predecessor");
            tables.predecessor = Some(candidate);
        }
    }

    /// Normalises and installs a successor list: self removed, duplicates
    /// dropped, truncated to the replication factor. An empty list collapses
    /// back to the sole-member state.
    fn set_successors(&self, list: Vec<Endpoint>) {
        let mut seen = Vec::new();
        for endpoint in list {
            if endpoint != self.endpoint && !seen.contains(&endpoint) {
                seen.push(endpoint);
            }

            if seen.len() == self.cfg.replication {
                break;
            }
        }

        if seen.is_empty() {
            seen.push(self.endpoint.clone());
        }

        self.tables
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .successors = seen;
    }

    /// Drops a peer that failed to respond from every table.
    pub fn drop_peer(&self, peer: &Endpoint) {
        let mut tables = self.tables.lock().unwrap_or_else(|e| e.into_inner());

        tables.successors.retain(|s| s != peer);
        if tables.successors.is_empty() {
            tables.successors.push(self.endpoint.clone());
        }

        for finger in tables.fingers.iter_mut() {
            if finger.as_ref() == Some(peer) {
                *finger = None;
            }
        }

        if tables.predecessor.as_ref() == Some(peer) {
            tables.predecessor = None;
        }
    }

    /// Finds the node responsible for `target`, retrying over the ring until
    /// the budget is exhausted.
    pub async fn find_successor(&self, target: NodeId) -> Result<Endpoint, Error> {
        let mut backoff =
            ConstantBackoff::new(self.cfg.net.request_timeout, self.cfg.net.request_retries);

        loop {
            match self.try_find_successor(target).await {
                Ok(endpoint) => return Ok(endpoint),
                Err(err) => match backoff.next() {
                    Some(delay) => {
                        tracing::debug!(?err, "lookup attempt failed; retrying");
                        tokio::time::sleep(delay).await;
                    }
                    None => return Err(Error::RingUnavailable),
                },
            }
        }
    }

    async fn try_find_successor(&self, target: NodeId) -> Result<Endpoint, Error> {
        let successor = self.successor();

        if successor == self.endpoint {
            return Ok(self.endpoint.clone());
        }

        if target.in_open_closed(&self.id, &NodeId::of_endpoint(&successor)) {
            return Ok(successor);
        }

        let next = self.closest_preceding(target);
        if next == self.endpoint {
            return Ok(successor);
        }

        match self
            .remote(next.addr)
            .send_once(&FindSuccessor { id: target })
            .await
        {
            Ok(res) => res,
            Err(_) => {
                self.drop_peer(&next);
                Err(Error::Unreachable)
            }
        }
    }

    /// The table entry closest to, but strictly preceding, `target`.
    fn closest_preceding(&self, target: NodeId) -> Endpoint {
        let tables = self.tables.lock().unwrap_or_else(|e| e.into_inner());

        for finger in tables.fingers.iter().rev().flatten() {
            if NodeId::of_endpoint(finger).in_open(&self.id, &target) {
                return finger.clone();
            }
        }

        for successor in tables.successors.iter().rev() {
            if NodeId::of_endpoint(successor).in_open(&self.id, &target) {
                return successor.clone();
            }
        }

        tables
            .successors
            .first()
            .cloned()
            .unwrap_or_else(|| self.endpoint.clone())
    }

    /// Joins an existing ring through `bootstrap`, or seeds a new one when
    /// `bootstrap` is unset. The bootstrap node may still be coming up, so
    /// the join backs off and retries before giving up.
    pub async fn join(&self, bootstrap: Option<SocketAddr>) -> Result<(), Error> {
        let Some(bootstrap) = bootstrap else {
            tracing::info!("no bootstrap configured; seeding a new ring");
            return Ok(());
        };

        let retry = ExponentialBackoff::from_millis(100)
            .with_limit(Duration::from_secs(10))
            .take(10);

        let mut successor = None;
        for delay in retry {
            match self
                .remote(bootstrap)
                .send_once(&FindSuccessor { id: self.id })
                .await
            {
                Ok(Ok(endpoint)) => {
                    successor = Some(endpoint);
                    break;
                }
                Ok(Err(err)) => tracing::debug!(?err, "bootstrap cannot route yet"),
                Err(err) => tracing::debug!(?err, "bootstrap unreachable"),
            }

            tokio::time::sleep(delay).await;
        }

        let Some(successor) = successor else {
            return Err(Error::RingUnavailable);
        };

        tracing::info!(%successor, "joined ring");
        self.set_successors(vec![successor]);

        {
            let mut tables = self.tables.lock().unwrap_or_else(|e| e.into_inner());
            tables.predecessor = None;
        }

        Ok(())
    }

    /// One stabilisation tick:
    /// 1. adopt our successor's predecessor when it sits between us,
    /// 2. notify the successor of our existence,
    /// 3. refresh the successor list from the successor's view,
    /// pruning any peer that fails to respond.
    pub async fn stabilize_once(&self) {
        // a dead predecessor blocks its successor from claiming the slot
        if let Some(predecessor) = self.predecessor() {
            if !probe::reachable(predecessor.addr, self.cfg.net.request_timeout).await {
                tracing::debug!(%predecessor, "predecessor unreachable; clearing");
                self.drop_peer(&predecessor);
            }
        }

        let successor = self.successor();

        let reported = if successor == self.endpoint {
            self.predecessor()
        } else {
            match self
                .remote(successor.addr)
                .send_once(&GetPredecessor)
                .await
            {
                Ok(pred) => pred,
                Err(_) => {
                    tracing::debug!(%successor, "successor unreachable; dropping");
                    self.drop_peer(&successor);
                    return;
                }
            }
        };

        if let Some(candidate) = reported {
            if candidate != self.endpoint
                && NodeId::of_endpoint(&candidate)
                    .in_open(&self.id, &NodeId::of_endpoint(&successor))
            {
                let mut list = self.successor_list();
                list.insert(0, candidate);
                self.set_successors(list);
            }
        }

        let successor = self.successor();
        if successor == self.endpoint {
            return;
        }

        let remote = self.remote(successor.addr);
        if remote
            .send_once(&crate::daemon::Notify {
                candidate: self.endpoint.clone(),
            })
            .await
            .is_err()
        {
            self.drop_peer(&successor);
            return;
        }

        match remote.send_once(&GetSuccessorList).await {
            Ok(mut list) => {
                list.insert(0, successor);
                self.set_successors(list);
            }
            Err(_) => self.drop_peer(&successor),
        }
    }

    /// Repairs one finger table slot per call, round-robin.
    pub async fn fix_next_finger(&self) {
        let slot = {
            let mut tables = self.tables.lock().unwrap_or_else(|e| e.into_inner());
            let slot = tables.next_finger;
            tables.next_finger = (slot + 1) % tables.fingers.len();
            slot
        };

        let target = self.id.wrapping_add_pow2(slot as u32);
        let entry = self.find_successor(target).await.ok();

        let mut tables = self.tables.lock().unwrap_or_else(|e| e.into_inner());
        tables.fingers[slot] = entry;
    }

    /// Handles a graceful departure announced by a peer.
    pub fn handle_leave(&self, leaving: &Endpoint, predecessor: Option<Endpoint>, successor: Endpoint) {
        {
            let mut tables = self.tables.lock().unwrap_or_else(|e| e.into_inner());

            if tables.predecessor.as_ref() == Some(leaving) {
                tables.predecessor = predecessor.filter(|p| *p != self.endpoint);
            }

            for finger in tables.fingers.iter_mut() {
                if finger.as_ref() == Some(leaving) {
                    *finger = None;
                }
            }
        }

        let mut list = self.successor_list();
        list.retain(|s| s != leaving);
        list.push(successor);
        self.set_successors(list);
    }

    /// Graceful shutdown: tell both neighbours we are going away. Key
    /// handoff is the [`ChordService`](super::ChordService)'s job and must
    /// happen before this.
    pub async fn leave(&self) {
        let successor = self.successor();
        let predecessor = self.predecessor();

        let notice = LeaveNotice {
            leaving: self.endpoint.clone(),
            predecessor: predecessor.clone(),
            successor: successor.clone(),
        };

        if successor != self.endpoint {
            if let Err(err) = self.remote(successor.addr).send_once(&notice).await {
                tracing::debug!(?err, "failed to notify successor of departure");
            }
        }

        if let Some(predecessor) = predecessor {
            if predecessor != self.endpoint {
                if let Err(err) = self.remote(predecessor.addr).send_once(&notice).await {
                    tracing::debug!(?err, "failed to notify predecessor of departure");
                }
            }
        }
    }
}
