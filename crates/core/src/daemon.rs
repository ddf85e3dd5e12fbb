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

//! The per-process RPC surface. Every remotely callable object of a node
//! (ring membership, key/value store, naming registry, master, follower,
//! request handler) answers on one daemon port behind a single service
//! enum; [`RemoteDaemon`] is the matching typed client with the hard
//! per-request timeout and retry budget every remote call is subject to.

use std::net::SocketAddr;
use std::sync::Arc;

use crate::config::NetConfig;
use crate::dht::{self, ChordNode, ChordService, Stored};
use crate::distributed::member::Endpoint;
use crate::distributed::retry_strategy::ConstantBackoff;
use crate::distributed::sonic::{
    self,
    service::{sonic_service, Message, Wrapper},
};
use crate::id::NodeId;
use crate::mapreduce::{
    self, FnRef, Follower, Master, RequestHandler, TaskId, TaskPayload, TaskResult,
};
use crate::naming::{self, NameServer};

pub struct Daemon {
    chord: Arc<ChordNode>,
    kv: Arc<ChordService>,
    naming: Arc<NameServer>,
    master: Arc<Master>,
    follower: Arc<Follower>,
    handler: Arc<RequestHandler>,
}

impl Daemon {
    pub fn new(
        chord: Arc<ChordNode>,
        kv: Arc<ChordService>,
        naming: Arc<NameServer>,
        master: Arc<Master>,
        follower: Arc<Follower>,
        handler: Arc<RequestHandler>,
    ) -> Self {
        Self {
            chord,
            kv,
            naming,
            master,
            follower,
            handler,
        }
    }
}

sonic_service!(
    Daemon,
    [
        Ping,
        FindSuccessor,
        Notify,
        GetPredecessor,
        GetSuccessorList,
        LeaveNotice,
        Insert,
        Lookup,
        Remove,
        StoreEntries,
        RegisterName,
        UnregisterName,
        LookupName,
        ListNames,
        Subscribe,
        ReportTask,
        DoTask,
        Startup,
    ]
);

#[derive(Debug, Clone, bincode::Encode, bincode::Decode)]
pub struct Ping;

impl Message<Daemon> for Ping {
    type Response = ();

    async fn handle(self, _: &Daemon) -> Self::Response {}
}

#[derive(Debug, Clone, bincode::Encode, bincode::Decode)]
pub struct FindSuccessor {
    pub id: NodeId,
}

impl Message<Daemon> for FindSuccessor {
    type Response = Result<Endpoint, dht::Error>;

    async fn handle(self, server: &Daemon) -> Self::Response {
        server.chord.find_successor(self.id).await
    }
}

#[derive(Debug, Clone, bincode::Encode, bincode::Decode)]
pub struct Notify {
    pub candidate: Endpoint,
}

impl Message<Daemon> for Notify {
    type Response = ();

    async fn handle(self, server: &Daemon) -> Self::Response {
        server.chord.notify(self.candidate);
    }
}

#[derive(Debug, Clone, bincode::Encode, bincode::Decode)]
pub struct GetPredecessor;

impl Message<Daemon> for GetPredecessor {
    type Response = Option<Endpoint>;

    async fn handle(self, server: &Daemon) -> Self::Response {
        server.chord.predecessor()
    }
}

#[derive(Debug, Clone, bincode::Encode, bincode::Decode)]
pub struct GetSuccessorList;

impl Message<Daemon> for GetSuccessorList {
    type Response = Vec<Endpoint>;

    async fn handle(self, server: &Daemon) -> Self::Response {
        server.chord.successor_list()
    }
}

#[derive(Debug, Clone, bincode::Encode, bincode::Decode)]
pub struct LeaveNotice {
    pub leaving: Endpoint,
    pub predecessor: Option<Endpoint>,
    pub successor: Endpoint,
}

impl Message<Daemon> for LeaveNotice {
    type Response = ();

    async fn handle(self, server: &Daemon) -> Self::Response {
        server
            .chord
            .handle_leave(&self.leaving, self.predecessor, self.successor);
    }
}

#[derive(Debug, Clone, bincode::Encode, bincode::Decode)]
pub struct Insert {
    pub key: String,
    pub value: Vec<u8>,
    pub forwarded: bool,
}

impl Message<Daemon> for Insert {
    type Response = Result<(), dht::Error>;

    async fn handle(self, server: &Daemon) -> Self::Response {
        server
            .kv
            .handle_insert(self.key, self.value, self.forwarded)
            .await
    }
}

#[derive(Debug, Clone, bincode::Encode, bincode::Decode)]
pub struct Lookup {
    pub key: String,
}

impl Message<Daemon> for Lookup {
    type Response = Result<Option<Vec<u8>>, dht::Error>;

    async fn handle(self, server: &Daemon) -> Self::Response {
        // the caller already routed to us as owner (or replica); answer
        // from the local store
        Ok(server.kv.local_value(&self.key))
    }
}

#[derive(Debug, Clone, bincode::Encode, bincode::Decode)]
pub struct Remove {
    pub key: String,
    pub replicate: bool,
}

impl Message<Daemon> for Remove {
    type Response = Result<(), dht::Error>;

    async fn handle(self, server: &Daemon) -> Self::Response {
        if self.replicate {
            server.kv.remove_as_owner(&self.key);
        } else {
            server.kv.remove_replica(&self.key);
        }

        Ok(())
    }
}

#[derive(Debug, Clone, bincode::Encode, bincode::Decode)]
pub struct StoreEntries {
    pub entries: Vec<(String, Stored)>,
}

impl Message<Daemon> for StoreEntries {
    type Response = ();

    async fn handle(self, server: &Daemon) -> Self::Response {
        server.kv.apply_entries(self.entries);
    }
}

#[derive(Debug, Clone, bincode::Encode, bincode::Decode)]
pub struct RegisterName {
    pub name: String,
    pub endpoint: Endpoint,
    pub safe: bool,
}

impl Message<Daemon> for RegisterName {
    type Response = Result<bool, naming::Error>;

    async fn handle(self, server: &Daemon) -> Self::Response {
        server
            .naming
            .register(self.name, self.endpoint, self.safe)
            .await
    }
}

#[derive(Debug, Clone, bincode::Encode, bincode::Decode)]
pub struct UnregisterName {
    pub name: String,
}

impl Message<Daemon> for UnregisterName {
    type Response = bool;

    async fn handle(self, server: &Daemon) -> Self::Response {
        server.naming.unregister(&self.name).await
    }
}

#[derive(Debug, Clone, bincode::Encode, bincode::Decode)]
pub struct LookupName {
    pub name: String,
}

impl Message<Daemon> for LookupName {
    type Response = Option<Endpoint>;

    async fn handle(self, server: &Daemon) -> Self::Response {
        server.naming.lookup(&self.name).await
    }
}

#[derive(Debug, Clone, bincode::Encode, bincode::Decode)]
pub struct ListNames;

impl Message<Daemon> for ListNames {
    type Response = Vec<(String, Endpoint)>;

    async fn handle(self, server: &Daemon) -> Self::Response {
        server.naming.list().await
    }
}

#[derive(Debug, Clone, bincode::Encode, bincode::Decode)]
pub struct Subscribe {
    pub follower: Endpoint,
}

impl Message<Daemon> for Subscribe {
    type Response = ();

    async fn handle(self, server: &Daemon) -> Self::Response {
        server.master.subscribe(self.follower).await;
    }
}

#[derive(Debug, Clone, bincode::Encode, bincode::Decode)]
pub struct ReportTask {
    pub follower: Endpoint,
    pub task: TaskId,
    pub func: FnRef,
    pub result: TaskResult,
}

impl Message<Daemon> for ReportTask {
    type Response = Result<(), mapreduce::Error>;

    async fn handle(self, server: &Daemon) -> Self::Response {
        server
            .master
            .report_task(self.follower, self.task, self.func, self.result)
            .await
    }
}

#[derive(Debug, Clone, bincode::Encode, bincode::Decode)]
pub struct DoTask {
    pub task: TaskId,
    pub payload: TaskPayload,
    pub func: FnRef,
}

impl Message<Daemon> for DoTask {
    type Response = Result<(), mapreduce::Error>;

    async fn handle(self, server: &Daemon) -> Self::Response {
        Arc::clone(&server.follower).accept_task(self.task, self.payload, self.func)
    }
}

#[derive(Debug, Clone, bincode::Encode, bincode::Decode)]
pub struct Startup {
    pub client: Endpoint,
    pub data: Vec<String>,
    pub map: FnRef,
    pub reduce: FnRef,
}

impl Message<Daemon> for Startup {
    type Response = Result<bool, mapreduce::Error>;

    async fn handle(self, server: &Daemon) -> Self::Response {
        server
            .handler
            .startup(self.client, self.data, self.map, self.reduce)
            .await
    }
}

/// Typed client for a remote daemon. `send_once` is a single attempt with
/// the hard request timeout; `send` retries over the full budget.
#[derive(Debug, Clone, Copy)]
pub struct RemoteDaemon {
    addr: SocketAddr,
    net: NetConfig,
}

impl RemoteDaemon {
    pub fn new(addr: SocketAddr, net: NetConfig) -> Self {
        Self { addr, net }
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub async fn send_once<R: Wrapper<Daemon>>(
        &self,
        request: &R,
    ) -> Result<R::Response, sonic::Error> {
        let conn = sonic::service::Connection::create_with_timeout(
            self.addr,
            self.net.request_timeout,
        )
        .await?;

        conn.send_with_timeout(request, self.net.request_timeout)
            .await
    }

    pub async fn send<R: Wrapper<Daemon>>(
        &self,
        request: &R,
    ) -> Result<R::Response, sonic::Error> {
        let mut backoff = ConstantBackoff::new(self.net.request_timeout, self.net.request_retries);

        loop {
            match self.send_once(request).await {
                Ok(res) => return Ok(res),
                Err(err) => match backoff.next() {
                    Some(delay) => tokio::time::sleep(delay).await,
                    None => return Err(err),
                },
            }
        }
    }
}
