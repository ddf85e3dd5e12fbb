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

use std::net::IpAddr;

pub struct Net;

impl Net {
    pub fn host() -> IpAddr {
        IpAddr::from([127, 0, 0, 1])
    }

    pub fn daemon_port() -> u16 {
        8008
    }

    pub fn broadcast_port() -> u16 {
        8009
    }

    pub fn request_timeout() -> f64 {
        0.5
    }

    pub fn request_retries() -> u32 {
        5
    }
}

pub struct Dht;

impl Dht {
    pub fn stabilisation_interval() -> f64 {
        1.0
    }

    pub fn recheck_interval() -> f64 {
        1.0
    }

    pub fn replication_size() -> usize {
        5
    }

    pub fn finger_table_size() -> usize {
        160 / 2
    }
}

pub struct Naming;

impl Naming {
    pub fn contest_interval() -> f64 {
        0.01
    }

    pub fn backup_interval() -> f64 {
        5.0
    }
}

pub struct Master;

impl Master {
    pub fn backup_interval() -> f64 {
        2.0
    }

    pub fn max_task_timeout() -> f64 {
        300.0
    }

    pub fn items_per_chunk() -> usize {
        16
    }

    pub fn task_retry_cap() -> u32 {
        3
    }
}
