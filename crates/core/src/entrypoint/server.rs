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

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::config::{
    ServerConfig, DHT_NAME, FOLLOWER_NAME, MASTER_NAME, NS_NAME, RQ_HANDLER_NAME,
};
use crate::daemon::Daemon;
use crate::dht::{ChordNode, ChordService, RingConfig};
use crate::distributed::member::Endpoint;
use crate::mapreduce::kernel::KernelRegistry;
use crate::mapreduce::master::MasterConfig;
use crate::mapreduce::{Follower, Master, RequestHandler};
use crate::naming::{NameServer, NsConfig};
use crate::Result;

/// One running cluster node with all of its daemons and loops.
pub struct Node {
    daemon_addr: SocketAddr,
    chord: Arc<ChordNode>,
    kv: Arc<ChordService>,
    naming: Arc<NameServer>,
    master: Arc<Master>,
    follower: Arc<Follower>,
    alive: Arc<AtomicBool>,
    server_task: tokio::task::JoinHandle<()>,
}

impl Node {
    pub fn daemon_addr(&self) -> SocketAddr {
        self.daemon_addr
    }

    pub fn naming(&self) -> &Arc<NameServer> {
        &self.naming
    }

    /// Graceful shutdown: stop the loops, hand the keys to the successor
    /// and say goodbye to the neighbours.
    pub async fn shutdown(self) {
        tracing::info!("shutting down node");

        self.alive.store(false, Ordering::SeqCst);
        self.master.stop();
        self.follower.stop();
        self.naming.stop();

        self.kv.handoff_all().await;
        self.chord.leave().await;

        self.server_task.abort();
    }

    /// Crash without any goodbyes. Only reachable from tests, where it
    /// stands in for a killed process.
    #[cfg(test)]
    fn kill(self) {
        self.alive.store(false, Ordering::SeqCst);
        self.master.stop();
        self.follower.stop();
        self.naming.stop();
        self.server_task.abort();
    }
}

/// Builds and starts every component of a node: the daemon service, the
/// ring loops, the naming contest and the follower heartbeat.
pub async fn spawn_node(config: &ServerConfig) -> Result<Node> {
    let daemon_addr = config.daemon_addr();
    let net = config.net();

    let chord = Arc::new(ChordNode::new(
        Endpoint::new(DHT_NAME, daemon_addr),
        RingConfig {
            replication: config.dht_replication_size,
            finger_table_size: config.dht_finger_table_size,
            net,
        },
    ));
    let kv = Arc::new(ChordService::new(Arc::clone(&chord)));

    let broadcast_to = (config.broadcast_port != 0).then(|| {
        SocketAddr::new(Ipv4Addr::BROADCAST.into(), config.broadcast_port)
    });
    let naming = Arc::new(
        NameServer::bind(
            Endpoint::new(NS_NAME, daemon_addr),
            config.seed_addrs.clone(),
            NsConfig {
                listen_addr: config.broadcast_addr(),
                broadcast_to,
                contest_interval: config.contest_interval(),
                backup_interval: config.ns_backup_interval(),
                net,
            },
        )
        .await?,
    );

    let registry = Arc::new(KernelRegistry::with_defaults());
    let master = Arc::new(Master::new(
        Endpoint::new(MASTER_NAME, daemon_addr),
        Arc::clone(&kv),
        MasterConfig {
            net,
            backup_interval: config.master_backup_interval(),
            max_task_timeout: config.max_task_timeout_duration(),
            items_per_chunk: config.items_per_chunk,
            task_retry_cap: config.task_retry_cap,
        },
    ));
    let follower = Arc::new(Follower::new(
        Endpoint::new(FOLLOWER_NAME, daemon_addr),
        registry,
        Arc::clone(&naming),
        net,
    ));
    let handler = Arc::new(RequestHandler::new(Arc::clone(&kv)));

    let daemon = Daemon::new(
        Arc::clone(&chord),
        Arc::clone(&kv),
        Arc::clone(&naming),
        Arc::clone(&master),
        Arc::clone(&follower),
        Arc::clone(&handler),
    );
    let server = daemon.bind(daemon_addr).await?;

    let alive = Arc::new(AtomicBool::new(true));

    let server_task = {
        let alive = Arc::clone(&alive);
        tokio::spawn(async move {
            while alive.load(Ordering::SeqCst) {
                if let Err(err) = server.accept().await {
                    tracing::error!(?err, "daemon accept failed");
                    break;
                }
            }
        })
    };

    chord.join(config.dht_bootstrap).await?;

    {
        let chord = Arc::clone(&chord);
        let alive = Arc::clone(&alive);
        let interval = config.stabilisation_interval();
        tokio::spawn(async move {
            while alive.load(Ordering::SeqCst) {
                chord.stabilize_once().await;
                tokio::time::sleep(interval).await;
            }
        });
    }

    {
        let chord = Arc::clone(&chord);
        let alive = Arc::clone(&alive);
        let interval = config.stabilisation_interval();
        tokio::spawn(async move {
            while alive.load(Ordering::SeqCst) {
                chord.fix_next_finger().await;
                tokio::time::sleep(interval).await;
            }
        });
    }

    {
        let kv = Arc::clone(&kv);
        let alive = Arc::clone(&alive);
        let interval = config.recheck_interval();
        tokio::spawn(async move {
            while alive.load(Ordering::SeqCst) {
                kv.recheck_once().await;
                tokio::time::sleep(interval).await;
            }
        });
    }

    // the naming service owns the master and request-handler roles; every
    // node offers itself and the registry decides who actually runs them
    {
        let start = {
            let master = Arc::clone(&master);
            move || Arc::clone(&master).start()
        };
        let stop = {
            let master = Arc::clone(&master);
            move || master.stop()
        };
        naming.delegate(MASTER_NAME, master.endpoint().clone(), start, stop);
    }
    naming.delegate(
        RQ_HANDLER_NAME,
        Endpoint::new(RQ_HANDLER_NAME, daemon_addr),
        || {},
        || {},
    );

    Arc::clone(&naming).start(Arc::clone(&kv));
    Arc::clone(&follower).start();

    // followers are also published in the registry, one binding per node
    {
        let naming = Arc::clone(&naming);
        let follower_endpoint = follower.endpoint().clone();
        tokio::spawn(async move {
            let name = format!("{FOLLOWER_NAME}:{daemon_addr}");
            if naming
                .register(name.clone(), follower_endpoint, false)
                .await
                .is_err()
            {
                tracing::debug!(%name, "follower registration deferred until a leader exists");
            }
        });
    }

    tracing::info!(%daemon_addr, "node started");

    Ok(Node {
        daemon_addr,
        chord,
        kv,
        naming,
        master,
        follower,
        alive,
        server_task,
    })
}

pub fn run(config: ServerConfig) -> Result<()> {
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?;

    rt.block_on(async move {
        let node = spawn_node(&config).await?;

        tokio::signal::ctrl_c().await?;
        node.shutdown().await;

        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClientConfig;
    use crate::dht::decode_value;
    use crate::free_socket_addr;
    use crate::mapreduce::client as mr_client;
    use crate::mapreduce::kernel::{WORD_COUNT_MAP, WORD_COUNT_REDUCE};
    use crate::mapreduce::master::MasterState;
    use crate::mapreduce::{FnRef, JobOutcome};
    use std::collections::BTreeMap;
    use std::time::{Duration, Instant};

    fn test_config() -> ServerConfig {
        let daemon = free_socket_addr();

        ServerConfig {
            host: daemon.ip(),
            daemon_port: daemon.port(),
            broadcast_port: 0,
            request_timeout: 0.1,
            request_retries: 3,
            dht_stabilisation_interval: 0.05,
            dht_recheck_interval: 0.05,
            dht_replication_size: 5,
            dht_finger_table_size: 80,
            dht_bootstrap: None,
            seed_addrs: Vec::new(),
            ns_contest_interval: 0.05,
            ns_backup_interval: 0.3,
            master_backup_interval: 0.2,
            max_task_timeout: 10.0,
            items_per_chunk: 2,
            task_retry_cap: 3,
        }
    }

    fn client_config(nodes: &[&Node]) -> ClientConfig {
        ClientConfig {
            host: "127.0.0.1".parse().unwrap(),
            broadcast_port: 0,
            seed_addrs: nodes
                .iter()
                .map(|n| n.naming().udp_addr().unwrap())
                .collect(),
            request_timeout: 0.2,
            request_retries: 5,
            data_path: None,
        }
    }

    async fn submit_with_retry(
        config: &ClientConfig,
        data: Vec<String>,
        deadline: Duration,
    ) -> mr_client::Submission {
        let deadline = Instant::now() + deadline;

        loop {
            match mr_client::submit(
                config,
                data.clone(),
                FnRef::new(WORD_COUNT_MAP),
                FnRef::new(WORD_COUNT_REDUCE),
            )
            .await
            {
                Ok(submission) => return submission,
                Err(err) => {
                    assert!(
                        Instant::now() < deadline,
                        "submission never accepted: {err}"
                    );
                    tokio::time::sleep(Duration::from_millis(200)).await;
                }
            }
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn two_node_ring_stabilises() {
        let a = spawn_node(&test_config()).await.unwrap();

        let mut config_b = test_config();
        config_b.dht_bootstrap = Some(a.daemon_addr());
        let b = spawn_node(&config_b).await.unwrap();

        let deadline = Instant::now() + Duration::from_secs(15);
        loop {
            let converged = a.chord.successor() == *b.chord.endpoint()
                && b.chord.successor() == *a.chord.endpoint()
                && a.chord.predecessor().as_ref() == Some(b.chord.endpoint())
                && b.chord.predecessor().as_ref() == Some(a.chord.endpoint());

            if converged {
                break;
            }

            assert!(Instant::now() < deadline, "two-node ring did not converge");
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        a.shutdown().await;
        b.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn keys_survive_a_crashed_node() {
        let a = spawn_node(&test_config()).await.unwrap();

        let mut config_b = test_config();
        config_b.dht_bootstrap = Some(a.daemon_addr());
        let b = spawn_node(&config_b).await.unwrap();

        let mut config_c = test_config();
        config_c.dht_bootstrap = Some(a.daemon_addr());
        let c = spawn_node(&config_c).await.unwrap();

        let deadline = Instant::now() + Duration::from_secs(20);
        loop {
            let stable = [&a, &b, &c]
                .iter()
                .all(|n| n.chord.successor_list().len() == 2);

            if stable {
                break;
            }

            assert!(Instant::now() < deadline, "three-node ring did not converge");
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        for i in 0..20 {
            a.kv
                .insert(&format!("key/{i}"), format!("value {i}").into_bytes())
                .await
                .unwrap();
        }

        // give the background replica pushes a moment to fan out
        tokio::time::sleep(Duration::from_millis(500)).await;

        b.kill();

        let deadline = Instant::now() + Duration::from_secs(30);
        'readable: loop {
            assert!(
                Instant::now() < deadline,
                "keys did not become readable after the crash"
            );

            for i in 0..20 {
                let expected = format!("value {i}").into_bytes();
                match a.kv.lookup(&format!("key/{i}")).await {
                    Ok(Some(found)) if found == expected => {}
                    _ => {
                        tokio::time::sleep(Duration::from_millis(200)).await;
                        continue 'readable;
                    }
                }
            }

            break;
        }

        a.shutdown().await;
        c.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn word_count_end_to_end_on_a_single_node() {
        let node = spawn_node(&test_config()).await.unwrap();
        let client_config = client_config(&[&node]);

        let data: Vec<String> = [
            "Hello MapReduce World",
            "This is a MapReduce example",
            "MapReduce is powerful and distributed",
            "Hello again distributed world",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();

        let submission =
            submit_with_retry(&client_config, data, Duration::from_secs(20)).await;

        let outcome = tokio::time::timeout(Duration::from_secs(60), submission.await_results())
            .await
            .expect("job timed out")
            .unwrap();

        let JobOutcome::Completed(results) = outcome else {
            panic!("job failed: {outcome:?}");
        };

        let counts: BTreeMap<String, u64> = results
            .iter()
            .map(|(word, value)| (word.clone(), decode_value(value).unwrap()))
            .collect();

        let expected: BTreeMap<String, u64> = [
            ("mapreduce", 3),
            ("hello", 2),
            ("distributed", 2),
            ("world", 2),
            ("is", 2),
            ("this", 1),
            ("a", 1),
            ("example", 1),
            ("powerful", 1),
            ("and", 1),
            ("again", 1),
        ]
        .into_iter()
        .map(|(word, count)| (word.to_string(), count))
        .collect();

        assert_eq!(counts, expected);

        node.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn second_job_is_rejected_while_the_first_runs() {
        let node = spawn_node(&test_config()).await.unwrap();
        let client_config = client_config(&[&node]);

        // enough chunks that the first job is still mapping when the second
        // submission arrives
        let data: Vec<String> = (0..40).map(|i| format!("word{i} filler text")).collect();
        let first = submit_with_retry(&client_config, data, Duration::from_secs(20)).await;

        let second = mr_client::submit(
            &client_config,
            vec!["too late".to_string()],
            FnRef::new(WORD_COUNT_MAP),
            FnRef::new(WORD_COUNT_REDUCE),
        )
        .await;
        assert!(second.is_err(), "second job should be rejected while busy");

        let outcome = tokio::time::timeout(Duration::from_secs(120), first.await_results())
            .await
            .expect("job timed out")
            .unwrap();
        assert!(matches!(outcome, JobOutcome::Completed(_)));

        node.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn master_failover_completes_the_job() {
        let a = spawn_node(&test_config()).await.unwrap();

        let mut config_b = test_config();
        config_b.dht_bootstrap = Some(a.daemon_addr());
        config_b.seed_addrs = vec![a.naming().udp_addr().unwrap()];
        let b = spawn_node(&config_b).await.unwrap();
        a.naming().set_seeds(vec![b.naming().udp_addr().unwrap()]);

        let client_config = client_config(&[&a, &b]);

        // wait for the ring and for exactly one active master
        let deadline = Instant::now() + Duration::from_secs(30);
        loop {
            let ring_ok = a.chord.successor() == *b.chord.endpoint()
                && b.chord.successor() == *a.chord.endpoint();
            let masters = [&a, &b]
                .iter()
                .filter(|n| n.master.state() == MasterState::AwaitingJob)
                .count();

            if ring_ok && masters == 1 {
                break;
            }

            assert!(Instant::now() < deadline, "cluster did not settle");
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        let (active, standby) = if a.master.state() == MasterState::AwaitingJob {
            (a, b)
        } else {
            (b, a)
        };

        // 64 records in chunks of 2: 32 map tasks, like the reference
        // failover scenario
        let data: Vec<String> = (0..64).map(|_| "alpha beta".to_string()).collect();
        let submission =
            submit_with_retry(&client_config, data, Duration::from_secs(20)).await;

        // let the job make real progress before the crash
        let deadline = Instant::now() + Duration::from_secs(60);
        loop {
            if active.master.completed_map_tasks().await >= 8 {
                break;
            }

            assert!(
                Instant::now() < deadline,
                "job never reached 8 completed map tasks"
            );
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        active.kill();

        let outcome = tokio::time::timeout(Duration::from_secs(180), submission.await_results())
            .await
            .expect("job did not survive the failover")
            .unwrap();

        let JobOutcome::Completed(results) = outcome else {
            panic!("job failed: {outcome:?}");
        };

        let counts: BTreeMap<String, u64> = results
            .iter()
            .map(|(word, value)| (word.clone(), decode_value(value).unwrap()))
            .collect();

        assert_eq!(counts.get("alpha"), Some(&64));
        assert_eq!(counts.get("beta"), Some(&64));

        standby.shutdown().await;
    }
}
