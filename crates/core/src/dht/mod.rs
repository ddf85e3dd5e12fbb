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

//! Chord ring membership and the key/value service layered on top of it.

pub mod node;
pub mod service;

pub use node::ChordNode;
pub use service::ChordService;

use crate::config::NetConfig;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub enum Error {
    #[error("no live ring path could be found")]
    RingUnavailable,

    #[error("remote endpoint did not respond within the retry budget")]
    Unreachable,
}

/// A stored record. `version` is the last-writer-wins counter minted by the
/// key's primary owner; replicas never mint versions themselves.
#[derive(Debug, Clone, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub struct Stored {
    pub version: u64,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, Copy)]
pub struct RingConfig {
    pub replication: usize,
    pub finger_table_size: usize,
    pub net: NetConfig,
}

/// DHT values are opaque byte sequences; typed callers go through these.
pub fn encode_value<T: bincode::Encode>(value: &T) -> Vec<u8> {
    bincode::encode_to_vec(value, bincode::config::standard())
        .expect("encoding to an in-memory buffer cannot fail")
}

pub fn decode_value<T: bincode::Decode>(bytes: &[u8]) -> crate::Result<T> {
    Ok(bincode::decode_from_slice(bytes, bincode::config::standard())?.0)
}
