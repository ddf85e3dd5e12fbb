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

pub mod defaults;

use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use std::time::Duration;

// Well-known registry names.
pub const DHT_NAME: &str = "chord.dht";
pub const MASTER_NAME: &str = "master";
pub const FOLLOWER_NAME: &str = "follower";
pub const RQ_HANDLER_NAME: &str = "rq.handler";
pub const CLIENT_NAME: &str = "client";
pub const NS_NAME: &str = "ns";

// Well-known DHT keys.
pub const MASTER_DATA_KEY: &str = "master/staged/data";
pub const MASTER_MAP_CODE_KEY: &str = "master/staged/map-code";
pub const MASTER_REDUCE_CODE_KEY: &str = "master/staged/reduce-code";
pub const MASTER_CLIENT_KEY: &str = "master/staged/client";
pub const MASTER_BACKUP_KEY: &str = "master/backup";
pub const NS_BACKUP_KEY: &str = "ns/backup";
pub const RESULTS_KEY: &str = "map-reduce/final-results";

/// Timeout and retry budget every remote call is subject to.
#[derive(Debug, Clone, Copy)]
pub struct NetConfig {
    pub request_timeout: Duration,
    pub request_retries: u32,
}

fn override_from_env<T: FromStr>(field: &mut T, var: &str) {
    if let Ok(raw) = std::env::var(var) {
        if let Ok(value) = raw.parse() {
            *field = value;
        } else {
            tracing::warn!("ignoring unparsable value for {var}: {raw:?}");
        }
    }
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct ServerConfig {
    #[serde(default = "defaults::Net::host")]
    pub host: IpAddr,

    #[serde(default = "defaults::Net::daemon_port")]
    pub daemon_port: u16,

    #[serde(default = "defaults::Net::broadcast_port")]
    pub broadcast_port: u16,

    #[serde(default = "defaults::Net::request_timeout")]
    pub request_timeout: f64,

    #[serde(default = "defaults::Net::request_retries")]
    pub request_retries: u32,

    #[serde(default = "defaults::Dht::stabilisation_interval")]
    pub dht_stabilisation_interval: f64,

    #[serde(default = "defaults::Dht::recheck_interval")]
    pub dht_recheck_interval: f64,

    #[serde(default = "defaults::Dht::replication_size")]
    pub dht_replication_size: usize,

    #[serde(default = "defaults::Dht::finger_table_size")]
    pub dht_finger_table_size: usize,

    /// Daemon address of an existing ring member. Unset means this node
    /// seeds a new ring.
    #[serde(default)]
    pub dht_bootstrap: Option<SocketAddr>,

    /// Known naming daemons that are probed directly during the contest, in
    /// addition to the broadcast discovery.
    #[serde(default)]
    pub seed_addrs: Vec<SocketAddr>,

    #[serde(default = "defaults::Naming::contest_interval")]
    pub ns_contest_interval: f64,

    #[serde(default = "defaults::Naming::backup_interval")]
    pub ns_backup_interval: f64,

    #[serde(default = "defaults::Master::backup_interval")]
    pub master_backup_interval: f64,

    #[serde(default = "defaults::Master::max_task_timeout")]
    pub max_task_timeout: f64,

    #[serde(default = "defaults::Master::items_per_chunk")]
    pub items_per_chunk: usize,

    #[serde(default = "defaults::Master::task_retry_cap")]
    pub task_retry_cap: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: defaults::Net::host(),
            daemon_port: defaults::Net::daemon_port(),
            broadcast_port: defaults::Net::broadcast_port(),
            request_timeout: defaults::Net::request_timeout(),
            request_retries: defaults::Net::request_retries(),
            dht_stabilisation_interval: defaults::Dht::stabilisation_interval(),
            dht_recheck_interval: defaults::Dht::recheck_interval(),
            dht_replication_size: defaults::Dht::replication_size(),
            dht_finger_table_size: defaults::Dht::finger_table_size(),
            dht_bootstrap: None,
            seed_addrs: Vec::new(),
            ns_contest_interval: defaults::Naming::contest_interval(),
            ns_backup_interval: defaults::Naming::backup_interval(),
            master_backup_interval: defaults::Master::backup_interval(),
            max_task_timeout: defaults::Master::max_task_timeout(),
            items_per_chunk: defaults::Master::items_per_chunk(),
            task_retry_cap: defaults::Master::task_retry_cap(),
        }
    }
}

impl ServerConfig {
    /// Environment variables take precedence over the config file.
    pub fn apply_env(&mut self) {
        override_from_env(&mut self.host, "CORAL_HOST");
        override_from_env(&mut self.daemon_port, "CORAL_DAEMON_PORT");
        override_from_env(&mut self.broadcast_port, "CORAL_BROADCAST_PORT");
        override_from_env(&mut self.request_timeout, "CORAL_REQUEST_TIMEOUT");
        override_from_env(&mut self.request_retries, "CORAL_REQUEST_RETRIES");
        override_from_env(
            &mut self.dht_stabilisation_interval,
            "CORAL_DHT_STABILISATION_INTERVAL",
        );
        override_from_env(&mut self.dht_recheck_interval, "CORAL_DHT_RECHECK_INTERVAL");
        override_from_env(
            &mut self.dht_replication_size,
            "CORAL_DHT_REPLICATION_SIZE",
        );
        override_from_env(
            &mut self.dht_finger_table_size,
            "CORAL_DHT_FINGER_TABLE_SIZE",
        );
        override_from_env(&mut self.ns_contest_interval, "CORAL_NS_CONTEST_INTERVAL");
        override_from_env(&mut self.ns_backup_interval, "CORAL_NS_BACKUP_INTERVAL");
        override_from_env(
            &mut self.master_backup_interval,
            "CORAL_MASTER_BACKUP_INTERVAL",
        );
        override_from_env(&mut self.max_task_timeout, "CORAL_MAX_TASK_TIMEOUT");
        override_from_env(&mut self.items_per_chunk, "CORAL_ITEMS_PER_CHUNK");
        override_from_env(&mut self.task_retry_cap, "CORAL_TASK_RETRY_CAP");

        if let Ok(raw) = std::env::var("CORAL_DHT_BOOTSTRAP") {
            match raw.parse() {
                Ok(addr) => self.dht_bootstrap = Some(addr),
                Err(_) => tracing::warn!("ignoring unparsable CORAL_DHT_BOOTSTRAP: {raw:?}"),
            }
        }
    }

    pub fn daemon_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.daemon_port)
    }

    pub fn broadcast_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.broadcast_port)
    }

    pub fn net(&self) -> NetConfig {
        NetConfig {
            request_timeout: Duration::from_secs_f64(self.request_timeout),
            request_retries: self.request_retries,
        }
    }

    pub fn stabilisation_interval(&self) -> Duration {
        Duration::from_secs_f64(self.dht_stabilisation_interval)
    }

    pub fn recheck_interval(&self) -> Duration {
        Duration::from_secs_f64(self.dht_recheck_interval)
    }

    pub fn contest_interval(&self) -> Duration {
        Duration::from_secs_f64(self.ns_contest_interval)
    }

    pub fn ns_backup_interval(&self) -> Duration {
        Duration::from_secs_f64(self.ns_backup_interval)
    }

    pub fn master_backup_interval(&self) -> Duration {
        Duration::from_secs_f64(self.master_backup_interval)
    }

    pub fn max_task_timeout_duration(&self) -> Duration {
        Duration::from_secs_f64(self.max_task_timeout)
    }
}

#[derive(Debug, Clone, serde::Deserialize)]
pub struct ClientConfig {
    #[serde(default = "defaults::Net::host")]
    pub host: IpAddr,

    #[serde(default = "defaults::Net::broadcast_port")]
    pub broadcast_port: u16,

    #[serde(default)]
    pub seed_addrs: Vec<SocketAddr>,

    #[serde(default = "defaults::Net::request_timeout")]
    pub request_timeout: f64,

    #[serde(default = "defaults::Net::request_retries")]
    pub request_retries: u32,

    #[serde(default)]
    pub data_path: Option<String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            host: defaults::Net::host(),
            broadcast_port: defaults::Net::broadcast_port(),
            seed_addrs: Vec::new(),
            request_timeout: defaults::Net::request_timeout(),
            request_retries: defaults::Net::request_retries(),
            data_path: None,
        }
    }
}

impl ClientConfig {
    pub fn apply_env(&mut self) {
        override_from_env(&mut self.host, "CORAL_HOST");
        override_from_env(&mut self.broadcast_port, "CORAL_BROADCAST_PORT");
        override_from_env(&mut self.request_timeout, "CORAL_REQUEST_TIMEOUT");
        override_from_env(&mut self.request_retries, "CORAL_REQUEST_RETRIES");
    }

    pub fn net(&self) -> NetConfig {
        NetConfig {
            request_timeout: Duration::from_secs_f64(self.request_timeout),
            request_retries: self.request_retries,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_toml_yields_defaults() {
        let config: ServerConfig = toml::from_str("").unwrap();
        assert_eq!(config.daemon_port, 8008);
        assert_eq!(config.broadcast_port, 8009);
        assert_eq!(config.dht_replication_size, 5);
        assert_eq!(config.dht_finger_table_size, 80);
        assert_eq!(config.items_per_chunk, 16);
        assert!(config.dht_bootstrap.is_none());
    }

    #[test]
    fn env_overrides_file() {
        let mut config = ServerConfig::default();
        std::env::set_var("CORAL_DAEMON_PORT", "9100");
        config.apply_env();
        std::env::remove_var("CORAL_DAEMON_PORT");
        assert_eq!(config.daemon_port, 9100);
    }
}
