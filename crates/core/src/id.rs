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

//! 160-bit ring identifiers. Nodes and keys share the same identifier space;
//! all interval arithmetic is modulo 2^160 and wrap-aware.

use std::fmt;

use sha1::{Digest, Sha1};

use crate::distributed::member::Endpoint;

pub const ID_BITS: usize = 160;

#[derive(
    Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, bincode::Encode, bincode::Decode,
)]
pub struct NodeId([u8; 20]);

impl NodeId {
    pub fn hash<T: AsRef<[u8]>>(bytes: T) -> Self {
        Self(Sha1::digest(bytes.as_ref()).into())
    }

    /// Identifier of an exposed object. The display form (`name@host:port`)
    /// is the hashable input, so distinct objects on one daemon get distinct
    /// ring positions.
    pub fn of_endpoint(endpoint: &Endpoint) -> Self {
        Self::hash(endpoint.to_string())
    }

    pub fn of_key(key: &str) -> Self {
        Self::hash(key)
    }

    /// `self + 2^exp (mod 2^160)`. Used to place finger table entries.
    pub fn wrapping_add_pow2(mut self, exp: u32) -> Self {
        debug_assert!((exp as usize) < ID_BITS);

        let mut byte = 19 - (exp / 8) as usize;
        let mut carry = 1u16 << (exp % 8);

        loop {
            let sum = self.0[byte] as u16 + carry;
            self.0[byte] = sum as u8;
            carry = sum >> 8;

            if carry == 0 || byte == 0 {
                break;
            }

            byte -= 1;
        }

        self
    }

    /// `self ∈ (a, b)` walking clockwise. With `a == b` the interval covers
    /// the whole ring except `a` itself, which is what makes the one- and
    /// two-node rings stabilise without special cases.
    pub fn in_open(&self, a: &NodeId, b: &NodeId) -> bool {
        if a == b {
            return self != a;
        }

        if a < b {
            a < self && self < b
        } else {
            a < self || self < b
        }
    }

    /// `self ∈ (a, b]` walking clockwise. With `a == b` the interval is the
    /// full ring: a sole node owns every key.
    pub fn in_open_closed(&self, a: &NodeId, b: &NodeId) -> bool {
        if a == b {
            return true;
        }

        if a < b {
            a < self && self <= b
        } else {
            a < self || self <= b
        }
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }

        Ok(())
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "NodeId({:02x}{:02x}{:02x}{:02x}..)",
            self.0[0], self.0[1], self.0[2], self.0[3]
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn id(bytes: [u8; 20]) -> NodeId {
        NodeId(bytes)
    }

    fn small(v: u8) -> NodeId {
        let mut bytes = [0; 20];
        bytes[19] = v;
        id(bytes)
    }

    #[test]
    fn sha1_known_vector() {
        assert_eq!(
            NodeId::hash("abc").to_string(),
            "a9993e364706816aba3e25717850c26c9cd0d89d"
        );
    }

    #[test]
    fn add_pow2_increments() {
        assert_eq!(small(1).wrapping_add_pow2(0), small(2));
        assert_eq!(small(1).wrapping_add_pow2(3), small(9));
    }

    #[test]
    fn add_pow2_carries_across_bytes() {
        let mut bytes = [0; 20];
        bytes[19] = 0xff;
        let mut expected = [0; 20];
        expected[18] = 1;

        assert_eq!(id(bytes).wrapping_add_pow2(0), id(expected));
    }

    #[test]
    fn add_pow2_wraps_around() {
        let top = id([0xff; 20]);
        assert_eq!(top.wrapping_add_pow2(0), id([0; 20]));
    }

    #[test]
    fn open_interval_without_wrap() {
        assert!(small(5).in_open(&small(1), &small(10)));
        assert!(!small(1).in_open(&small(1), &small(10)));
        assert!(!small(10).in_open(&small(1), &small(10)));
    }

    #[test]
    fn open_interval_with_wrap() {
        // interval (200, 10) wraps through zero
        assert!(small(250).in_open(&small(200), &small(10)));
        assert!(small(5).in_open(&small(200), &small(10)));
        assert!(!small(100).in_open(&small(200), &small(10)));
    }

    #[test]
    fn degenerate_intervals() {
        // (a, a) is the whole ring minus a, (a, a] is everything
        assert!(small(3).in_open(&small(7), &small(7)));
        assert!(!small(7).in_open(&small(7), &small(7)));
        assert!(small(7).in_open_closed(&small(7), &small(7)));
        assert!(small(3).in_open_closed(&small(7), &small(7)));
    }

    #[test]
    fn half_open_includes_upper_bound() {
        assert!(small(10).in_open_closed(&small(1), &small(10)));
        assert!(!small(1).in_open_closed(&small(1), &small(10)));
    }

    proptest! {
        #[test]
        fn open_closed_is_open_plus_bound(a: [u8; 20], b: [u8; 20], x: [u8; 20]) {
            let (a, b, x) = (id(a), id(b), id(x));
            prop_assume!(a != b);

            let expected = x.in_open(&a, &b) || x == b;
            prop_assert_eq!(x.in_open_closed(&a, &b), expected);
        }

        #[test]
        fn interval_excludes_lower_bound(a: [u8; 20], b: [u8; 20]) {
            let (a, b) = (id(a), id(b));
            prop_assert!(!a.in_open(&a, &b));
        }
    }
}
