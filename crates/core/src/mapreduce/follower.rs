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

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use crate::config::{NetConfig, MASTER_NAME};
use crate::daemon::{RemoteDaemon, ReportTask, Subscribe};
use crate::distributed::member::Endpoint;
use crate::distributed::probe;
use crate::naming::NameServer;

use super::kernel::KernelRegistry;
use super::{Error, FnRef, TaskId, TaskPayload, TaskResult};

/// Executes one task at a time and reports the outcome to the master. The
/// RPC entry acks immediately; execution happens off the request path so the
/// master's dispatch timeout stays bounded.
pub struct Follower {
    endpoint: Endpoint,
    registry: Arc<KernelRegistry>,
    naming: Arc<NameServer>,
    net: NetConfig,
    current: Mutex<Option<TaskId>>,
    master: Mutex<Option<Endpoint>>,
    alive: AtomicBool,
}

impl Follower {
    pub fn new(
        endpoint: Endpoint,
        registry: Arc<KernelRegistry>,
        naming: Arc<NameServer>,
        net: NetConfig,
    ) -> Self {
        Self {
            endpoint,
            registry,
            naming,
            net,
            current: Mutex::new(None),
            master: Mutex::new(None),
            alive: AtomicBool::new(false),
        }
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    fn cached_master(&self) -> Option<Endpoint> {
        self.master
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn cache_master(&self, master: Option<Endpoint>) {
        *self.master.lock().unwrap_or_else(|e| e.into_inner()) = master;
    }

    /// RPC entry point. Rejects a second task while one is running.
    pub fn accept_task(
        self: Arc<Self>,
        task: TaskId,
        payload: TaskPayload,
        func: FnRef,
    ) -> Result<(), Error> {
        {
            let mut current = self.current.lock().unwrap_or_else(|e| e.into_inner());
            if current.is_some() {
                return Err(Error::WorkerBusy);
            }

            *current = Some(task.clone());
        }

        tracing::info!(%task, "accepted task");
        tokio::spawn(async move {
            self.execute_and_report(task, payload, func).await;
        });

        Ok(())
    }

    async fn execute_and_report(self: Arc<Self>, task: TaskId, payload: TaskPayload, func: FnRef) {
        let result = self.execute(&payload, &func);

        if let TaskResult::Failed(reason) = &result {
            tracing::warn!(%task, %reason, "task execution failed");
        }

        let report = ReportTask {
            follower: self.endpoint.clone(),
            task: task.clone(),
            func,
            result,
        };

        // the master may have failed over since dispatch; trust the name
        // registry over the cached endpoint
        let master = match self.naming.lookup(MASTER_NAME).await {
            Some(master) => {
                self.cache_master(Some(master.clone()));
                Some(master)
            }
            None => self.cached_master(),
        };

        match master {
            Some(master) => {
                match RemoteDaemon::new(master.addr, self.net).send(&report).await {
                    Ok(Ok(())) => tracing::debug!(%task, "reported task"),
                    Ok(Err(err)) => {
                        tracing::warn!(%task, ?err, "master rejected task report")
                    }
                    Err(err) => tracing::warn!(%task, ?err, "failed to report task"),
                }
            }
            None => tracing::warn!(%task, "no master known; dropping task report"),
        }

        *self.current.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }

    fn execute(&self, payload: &TaskPayload, func: &FnRef) -> TaskResult {
        match payload {
            TaskPayload::Map(records) => {
                let Some(kernel) = self.registry.map(func) else {
                    return TaskResult::Failed(format!(
                        "map kernel {} is not registered",
                        func.kernel
                    ));
                };

                let mut pairs = Vec::new();
                for (line_no, line) in records {
                    match kernel.map(*line_no, line) {
                        Ok(mut emitted) => pairs.append(&mut emitted),
                        Err(err) => return TaskResult::Failed(err.to_string()),
                    }
                }

                TaskResult::Map(pairs)
            }
            TaskPayload::Reduce { key, values } => {
                let Some(kernel) = self.registry.reduce(func) else {
                    return TaskResult::Failed(format!(
                        "reduce kernel {} is not registered",
                        func.kernel
                    ));
                };

                match kernel.reduce(key, values) {
                    Ok(value) => TaskResult::Reduce(value),
                    Err(err) => TaskResult::Failed(err.to_string()),
                }
            }
        }
    }

    /// Resolves the master and announces ourselves as idle.
    pub async fn subscribe_once(&self) -> bool {
        let Some(master) = self.naming.lookup(MASTER_NAME).await else {
            return false;
        };

        match RemoteDaemon::new(master.addr, self.net)
            .send_once(&Subscribe {
                follower: self.endpoint.clone(),
            })
            .await
        {
            Ok(()) => {
                tracing::info!(%master, "subscribed to master");
                self.cache_master(Some(master));
                true
            }
            Err(err) => {
                tracing::debug!(%master, ?err, "failed to subscribe to master");
                false
            }
        }
    }

    /// Heartbeat loop: keeps the subscription pointed at whichever node
    /// currently holds the `master` name, re-resolving once the cached
    /// master has been unreachable for the full retry budget.
    pub fn start(self: Arc<Self>) {
        if self.alive.swap(true, Ordering::SeqCst) {
            return;
        }

        let this = self;
        tokio::spawn(async move {
            let mut misses = 0u32;

            while this.alive.load(Ordering::SeqCst) {
                match this.naming.lookup(MASTER_NAME).await {
                    Some(master) if this.cached_master().as_ref() != Some(&master) => {
                        this.subscribe_once().await;
                        misses = 0;
                    }
                    Some(master) => {
                        if probe::reachable(master.addr, this.net.request_timeout).await {
                            misses = 0;
                        } else {
                            misses += 1;
                            if misses >= this.net.request_retries {
                                tracing::warn!(%master, "master unreachable; re-resolving");
                                this.cache_master(None);
                                this.subscribe_once().await;
                                misses = 0;
                            }
                        }
                    }
                    None => {}
                }

                tokio::time::sleep(this.net.request_timeout).await;
            }
        });
    }

    pub fn stop(&self) {
        self.alive.store(false, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dht::decode_value;
    use crate::mapreduce::kernel::{WORD_COUNT_MAP, WORD_COUNT_REDUCE};
    use crate::naming::NsConfig;
    use std::time::Duration;

    async fn test_follower() -> Arc<Follower> {
        let net = NetConfig {
            request_timeout: Duration::from_millis(50),
            request_retries: 2,
        };

        let naming = Arc::new(
            NameServer::bind(
                Endpoint::new("ns", "127.0.0.1:8008".parse().unwrap()),
                Vec::new(),
                NsConfig {
                    listen_addr: "127.0.0.1:0".parse().unwrap(),
                    broadcast_to: None,
                    contest_interval: Duration::from_millis(100),
                    backup_interval: Duration::from_secs(5),
                    net,
                },
            )
            .await
            .unwrap(),
        );

        Arc::new(Follower::new(
            Endpoint::new("follower", "127.0.0.1:8008".parse().unwrap()),
            Arc::new(KernelRegistry::with_defaults()),
            naming,
            net,
        ))
    }

    #[tokio::test]
    async fn map_execution_flattens_chunk_output() {
        let follower = test_follower().await;

        let payload = TaskPayload::Map(vec![
            (0, "Hello World".to_string()),
            (1, "hello again".to_string()),
        ]);
        let result = follower.execute(&payload, &FnRef::new(WORD_COUNT_MAP));

        let TaskResult::Map(pairs) = result else {
            panic!("expected map output");
        };
        let words: Vec<&str> = pairs.iter().map(|(w, _)| w.as_str()).collect();
        assert_eq!(words, vec!["hello", "world", "hello", "again"]);
    }

    #[tokio::test]
    async fn reduce_execution_sums_values() {
        let follower = test_follower().await;

        let payload = TaskPayload::Reduce {
            key: "word".to_string(),
            values: vec![
                crate::dht::encode_value(&1u64),
                crate::dht::encode_value(&1u64),
            ],
        };
        let result = follower.execute(&payload, &FnRef::new(WORD_COUNT_REDUCE));

        let TaskResult::Reduce(value) = result else {
            panic!("expected reduce output");
        };
        assert_eq!(decode_value::<u64>(&value).unwrap(), 2);
    }

    #[tokio::test]
    async fn unknown_kernel_reports_the_error_sentinel() {
        let follower = test_follower().await;

        let payload = TaskPayload::Map(vec![(0, "text".to_string())]);
        let result = follower.execute(&payload, &FnRef::new("missing/kernel"));

        assert!(matches!(result, TaskResult::Failed(_)));
    }

    #[tokio::test]
    async fn second_task_is_rejected_while_busy() {
        let follower = test_follower().await;
        *follower.current.lock().unwrap() = Some(TaskId::Chunk(99));

        let res = Arc::clone(&follower).accept_task(
            TaskId::Chunk(1),
            TaskPayload::Map(Vec::new()),
            FnRef::new(WORD_COUNT_MAP),
        );

        assert!(matches!(res, Err(Error::WorkerBusy)));
    }
}
