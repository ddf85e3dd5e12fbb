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

use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;

/// Logical address of an exposed object: `name@host:port`.
///
/// Every remotely callable object in the cluster has one. The display form is
/// the hashable input for ring identifiers, so two objects with different
/// names on the same daemon land on different ring positions.
#[derive(
    Debug,
    Clone,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    serde::Serialize,
    serde::Deserialize,
    bincode::Encode,
    bincode::Decode,
)]
pub struct Endpoint {
    pub name: String,
    pub addr: SocketAddr,
}

impl Endpoint {
    pub fn new<S: Into<String>>(name: S, addr: SocketAddr) -> Self {
        Self {
            name: name.into(),
            addr,
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.name, self.addr)
    }
}

impl FromStr for Endpoint {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (name, addr) = s
            .split_once('@')
            .ok_or_else(|| anyhow::anyhow!("endpoint must have the form name@host:port"))?;

        Ok(Self {
            name: name.to_string(),
            addr: addr.parse()?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_parse_roundtrip() {
        let endpoint = Endpoint::new("chord.dht", "10.0.0.1:8008".parse().unwrap());
        assert_eq!(endpoint.to_string(), "chord.dht@10.0.0.1:8008");
        assert_eq!(
            endpoint.to_string().parse::<Endpoint>().unwrap(),
            endpoint
        );
    }

    #[test]
    fn rejects_missing_name() {
        assert!("10.0.0.1:8008".parse::<Endpoint>().is_err());
    }
}
