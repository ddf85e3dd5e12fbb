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

//! Cheap liveness checks. A daemon that accepts a TCP connection within the
//! request timeout is considered alive; everything else is treated as a dead
//! peer and pruned by the caller.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::TcpStream;

pub async fn reachable(addr: SocketAddr, timeout: Duration) -> bool {
    matches!(
        tokio::time::timeout(timeout, TcpStream::connect(addr)).await,
        Ok(Ok(_))
    )
}

/// Probes `addr` up to `attempts` times, waiting `delay` between probes.
pub async fn await_reachable(addr: SocketAddr, delay: Duration, attempts: u32) -> bool {
    for _ in 0..attempts {
        if reachable(addr, delay).await {
            return true;
        }

        tokio::time::sleep(delay).await;
    }

    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::free_socket_addr;

    #[tokio::test]
    async fn listener_is_reachable() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        assert!(reachable(addr, Duration::from_millis(500)).await);
    }

    #[tokio::test]
    async fn closed_port_is_unreachable() {
        // the address was free a moment ago, so nothing is listening there
        let addr = free_socket_addr();

        assert!(!reachable(addr, Duration::from_millis(500)).await);
    }
}
