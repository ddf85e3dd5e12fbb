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

//! Leader discovery over UDP. A querier fires `WhoIsLeader` datagrams at the
//! configured seed daemons and the broadcast address; only an active leader
//! answers. Broadcast may be unavailable (tests, locked-down networks), so
//! the seed path must be sufficient on its own.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::UdpSocket;

use crate::distributed::member::Endpoint;

#[derive(Debug, Clone, bincode::Encode, bincode::Decode)]
pub(crate) enum Datagram {
    WhoIsLeader,
    IAmLeader { leader: Endpoint },
}

pub(crate) fn encode(datagram: &Datagram) -> Vec<u8> {
    bincode::encode_to_vec(datagram, bincode::config::standard())
        .expect("encoding to an in-memory buffer cannot fail")
}

pub(crate) fn decode(bytes: &[u8]) -> Option<Datagram> {
    bincode::decode_from_slice(bytes, bincode::config::standard())
        .map(|(datagram, _)| datagram)
        .ok()
}

/// Queries the network for the active naming leader. `exclude` filters our
/// own answer out when the local daemon is itself a leader.
pub async fn discover(
    seeds: &[SocketAddr],
    broadcast_to: Option<SocketAddr>,
    exclude: Option<&Endpoint>,
    timeout: Duration,
) -> Option<Endpoint> {
    let socket = UdpSocket::bind(("0.0.0.0", 0)).await.ok()?;
    socket.set_broadcast(true).ok();

    let query = encode(&Datagram::WhoIsLeader);
    for seed in seeds {
        socket.send_to(&query, seed).await.ok();
    }

    if let Some(broadcast_to) = broadcast_to {
        // broadcast is best-effort; some networks refuse it outright
        socket.send_to(&query, broadcast_to).await.ok();
    }

    let deadline = tokio::time::Instant::now() + timeout;
    let mut buf = [0u8; 4096];

    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        if remaining.is_zero() {
            return None;
        }

        match tokio::time::timeout(remaining, socket.recv_from(&mut buf)).await {
            Ok(Ok((n, _))) => {
                if let Some(Datagram::IAmLeader { leader }) = decode(&buf[..n]) {
                    if exclude != Some(&leader) {
                        return Some(leader);
                    }
                }
            }
            Ok(Err(_)) | Err(_) => return None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn discovery_times_out_without_leader() {
        let found = discover(&[], None, None, Duration::from_millis(100)).await;
        assert!(found.is_none());
    }

    #[tokio::test]
    async fn seed_answers_are_found() {
        let responder = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let seed = responder.local_addr().unwrap();
        let leader = Endpoint::new("ns", "127.0.0.1:8008".parse().unwrap());

        let answer = leader.clone();
        tokio::spawn(async move {
            let mut buf = [0u8; 4096];
            let (n, src) = responder.recv_from(&mut buf).await.unwrap();
            assert!(matches!(decode(&buf[..n]), Some(Datagram::WhoIsLeader)));
            responder
                .send_to(&encode(&Datagram::IAmLeader { leader: answer }), src)
                .await
                .unwrap();
        });

        let found = discover(&[seed], None, None, Duration::from_secs(2)).await;
        assert_eq!(found, Some(leader));
    }

    #[tokio::test]
    async fn own_answer_is_excluded() {
        let responder = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let seed = responder.local_addr().unwrap();
        let leader = Endpoint::new("ns", "127.0.0.1:8008".parse().unwrap());

        let answer = leader.clone();
        tokio::spawn(async move {
            let mut buf = [0u8; 4096];
            let (n, src) = responder.recv_from(&mut buf).await.unwrap();
            assert!(matches!(decode(&buf[..n]), Some(Datagram::WhoIsLeader)));
            responder
                .send_to(&encode(&Datagram::IAmLeader { leader: answer }), src)
                .await
                .unwrap();
        });

        let found = discover(&[seed], None, Some(&leader), Duration::from_millis(300)).await;
        assert!(found.is_none());
    }
}
