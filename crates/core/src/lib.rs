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

//! Main library for Coral.
//!
//! A coral cluster is a set of identical server processes. Each process runs a
//! chord ring node with a key/value service layered on top, a naming daemon
//! that contests cluster-wide leadership, a dormant map-reduce master that is
//! woken by the naming service, a follower that executes tasks, and a request
//! handler that accepts jobs from clients.

use std::net::SocketAddr;

pub mod config;
pub mod daemon;
pub mod dht;
pub mod distributed;
pub mod entrypoint;
pub mod id;
pub mod mapreduce;
pub mod naming;

pub type Result<T, E = anyhow::Error> = std::result::Result<T, E>;

/// Reserves a free localhost address by binding port 0 and dropping the
/// listener. Used by tests and by the client callback daemon.
pub fn free_socket_addr() -> SocketAddr {
    let listener =
        std::net::TcpListener::bind(("127.0.0.1", 0)).expect("failed to bind to a free port");
    listener
        .local_addr()
        .expect("listener always has a local address")
}
