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

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use itertools::Itertools;

use crate::config::{
    NetConfig, MASTER_BACKUP_KEY, MASTER_CLIENT_KEY, MASTER_DATA_KEY, MASTER_MAP_CODE_KEY,
    MASTER_REDUCE_CODE_KEY, RESULTS_KEY,
};
use crate::daemon::{DoTask, RemoteDaemon};
use crate::dht::{decode_value, encode_value, ChordService};
use crate::distributed::member::Endpoint;

use super::{
    client, Error, FnRef, JobOutcome, TaskGroup, TaskGroupDump, TaskId, TaskPayload, TaskResult,
    Value,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MasterState {
    Bootstrapping,
    AwaitingJob,
    Mapping,
    Reducing,
    Committing,
    Idle,
    Stopped,
}

#[derive(Debug, Clone, Copy)]
pub struct MasterConfig {
    pub net: NetConfig,
    pub backup_interval: Duration,
    pub max_task_timeout: Duration,
    pub items_per_chunk: usize,
    pub task_retry_cap: u32,
}

/// Everything a successor master needs to pick a job up where we left it.
/// Assigned tasks are dumped as-is and requeued wholesale on recovery.
#[derive(Debug, Clone, bincode::Encode, bincode::Decode)]
pub struct MasterBackup {
    pub map: TaskGroupDump<u64, Vec<(u64, String)>>,
    pub reduce: TaskGroupDump<String, Vec<Value>>,
    pub followers: Vec<Endpoint>,
    pub results: Vec<(String, Value)>,
}

#[derive(Default)]
struct FollowerSets {
    busy: BTreeSet<Endpoint>,
    idle: BTreeSet<Endpoint>,
}

/// The map-reduce coordinator. Dormant until the naming service delegates
/// the `master` role to this node; a `stop` followed by a later `start`
/// re-enters the job from the DHT backup.
///
/// Lock order, where several are held at once:
/// `followers` → `map_tasks` → `reduce_tasks` → `results`.
pub struct Master {
    endpoint: Endpoint,
    cfg: MasterConfig,
    kv: Arc<ChordService>,
    state: Mutex<MasterState>,
    followers: tokio::sync::Mutex<FollowerSets>,
    map_tasks: tokio::sync::Mutex<TaskGroup<u64, Vec<(u64, String)>>>,
    reduce_tasks: tokio::sync::Mutex<TaskGroup<String, Vec<Value>>>,
    results: tokio::sync::Mutex<Vec<(String, Value)>>,
    functions: Mutex<Option<(FnRef, FnRef)>>,
    attempts: Mutex<BTreeMap<TaskId, u32>>,
    failure: Mutex<Option<String>>,
    alive: AtomicBool,
    job_active: AtomicBool,
}

impl Master {
    pub fn new(endpoint: Endpoint, kv: Arc<ChordService>, cfg: MasterConfig) -> Self {
        Self {
            endpoint,
            cfg,
            kv,
            state: Mutex::new(MasterState::Bootstrapping),
            followers: tokio::sync::Mutex::new(FollowerSets::default()),
            map_tasks: tokio::sync::Mutex::new(TaskGroup::new()),
            reduce_tasks: tokio::sync::Mutex::new(TaskGroup::new()),
            results: tokio::sync::Mutex::new(Vec::new()),
            functions: Mutex::new(None),
            attempts: Mutex::new(BTreeMap::new()),
            failure: Mutex::new(None),
            alive: AtomicBool::new(false),
            job_active: AtomicBool::new(false),
        }
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn state(&self) -> MasterState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub async fn completed_map_tasks(&self) -> usize {
        self.map_tasks.lock().await.completed_len()
    }

    fn set_state(&self, state: MasterState) {
        tracing::debug!(?state, "master state change");
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = state;
    }

    fn alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    /// Starts the coordinator loop. Called by the naming service when this
    /// node wins (or takes over) the `master` role.
    pub fn start(self: Arc<Self>) {
        if self.alive.swap(true, Ordering::SeqCst) {
            return;
        }

        tracing::info!("master starting");
        tokio::spawn(self.run());
    }

    /// Cooperative shutdown; every loop observes the flag within one tick.
    pub fn stop(&self) {
        if self.alive.swap(false, Ordering::SeqCst) {
            tracing::info!("master stopping");
        }
    }

    /// A follower announcing itself as ready for work.
    pub async fn subscribe(&self, follower: Endpoint) {
        let mut followers = self.followers.lock().await;
        if !followers.busy.contains(&follower) {
            tracing::info!(%follower, "follower subscribed");
            followers.idle.insert(follower);
        }
    }

    async fn run(self: Arc<Self>) {
        while self.alive() {
            self.set_state(MasterState::AwaitingJob);
            let Some(functions) = self.await_job().await else {
                break;
            };

            *self.functions.lock().unwrap_or_else(|e| e.into_inner()) = Some(functions);

            if let Err(err) = self.prepare().await {
                tracing::warn!(?err, "failed to prepare job; retrying");
                tokio::time::sleep(self.cfg.net.request_timeout).await;
                continue;
            }

            self.job_active.store(true, Ordering::SeqCst);
            tokio::spawn(Arc::clone(&self).backup_loop());

            let outcome = self.drive().await;
            self.job_active.store(false, Ordering::SeqCst);

            self.set_state(MasterState::Committing);
            self.commit(outcome).await;
            self.set_state(MasterState::Idle);
        }

        self.set_state(MasterState::Stopped);
    }

    /// Polls the staging keys until a complete job shows up.
    async fn await_job(&self) -> Option<(FnRef, FnRef)> {
        loop {
            if !self.alive() {
                return None;
            }

            let map = self.staged_fn(MASTER_MAP_CODE_KEY).await;
            let reduce = self.staged_fn(MASTER_REDUCE_CODE_KEY).await;
            let data = self
                .kv
                .lookup(MASTER_DATA_KEY)
                .await
                .ok()
                .flatten()
                .is_some();

            if let (Some(map), Some(reduce), true) = (map, reduce, data) {
                tracing::info!("found map-reduce request");
                return Some((map, reduce));
            }

            tokio::time::sleep(self.cfg.net.request_timeout).await;
        }
    }

    async fn staged_fn(&self, key: &str) -> Option<FnRef> {
        let bytes = self.kv.lookup(key).await.ok().flatten()?;
        decode_value(&bytes).ok()
    }

    /// Loads the previous master's backup if one exists, otherwise chunks
    /// the staged input into map tasks.
    async fn prepare(&self) -> crate::Result<()> {
        self.attempts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        *self.failure.lock().unwrap_or_else(|e| e.into_inner()) = None;

        let backup = self
            .kv
            .lookup(MASTER_BACKUP_KEY)
            .await
            .ok()
            .flatten()
            .and_then(|bytes| decode_value::<MasterBackup>(&bytes).ok());

        if let Some(backup) = backup {
            {
                let mut map = self.map_tasks.lock().await;
                map.load(backup.map);
                map.reset_assigned_to_pending();
            }
            {
                let mut reduce = self.reduce_tasks.lock().await;
                reduce.load(backup.reduce);
                reduce.reset_assigned_to_pending();
            }
            {
                // every known follower is assumed idle; their in-flight
                // reports went to the dead master
                let mut followers = self.followers.lock().await;
                followers.busy.clear();
                followers.idle.extend(backup.followers);
            }
            *self.results.lock().await = backup.results;

            tracing::info!("recovered job state from previous master's backup");
            return Ok(());
        }

        let bytes = self
            .kv
            .lookup(MASTER_DATA_KEY)
            .await
            .map_err(|err| anyhow::anyhow!("staged data unavailable: {err}"))?
            .ok_or_else(|| anyhow::anyhow!("staged data disappeared"))?;
        let data: Vec<String> = decode_value(&bytes)?;

        {
            let mut map = self.map_tasks.lock().await;
            map.reset();

            let numbered = data
                .into_iter()
                .enumerate()
                .map(|(line_no, line)| (line_no as u64, line));
            let chunks = numbered.chunks(self.cfg.items_per_chunk);
            for (chunk_id, chunk) in chunks.into_iter().enumerate() {
                map.add_pending(chunk_id as u64, chunk.collect());
            }

            tracing::info!(tasks = map.len(), "no backup found; chunked staged input");
        }

        self.reduce_tasks.lock().await.reset();
        self.results.lock().await.clear();

        Ok(())
    }

    /// Runs the map phase, then the reduce phase, dispatching one task per
    /// tick and requeueing work lost to dead or stuck followers.
    async fn drive(&self) -> JobOutcome {
        let (map_fn, reduce_fn) = match self
            .functions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
        {
            Some(functions) => functions,
            None => return JobOutcome::Failed("job functions went missing".to_string()),
        };

        self.set_state(MasterState::Mapping);
        tracing::info!("started map tasks");
        if let Some(outcome) = self.drive_phase(Phase::Map, &map_fn).await {
            return outcome;
        }

        self.set_state(MasterState::Reducing);
        tracing::info!("started reduce tasks");
        if let Some(outcome) = self.drive_phase(Phase::Reduce, &reduce_fn).await {
            return outcome;
        }

        JobOutcome::Completed(self.results.lock().await.clone())
    }

    /// Returns `Some` when the job ends early (failure or shutdown).
    async fn drive_phase(&self, phase: Phase, func: &FnRef) -> Option<JobOutcome> {
        loop {
            if !self.alive() {
                return Some(JobOutcome::Failed("master stopped".to_string()));
            }

            if let Some(reason) = self
                .failure
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .clone()
            {
                return Some(JobOutcome::Failed(reason));
            }

            let drained = match phase {
                Phase::Map => !self.map_tasks.lock().await.any(),
                Phase::Reduce => !self.reduce_tasks.lock().await.any(),
            };
            if drained {
                return None;
            }

            self.assign_one(phase, func).await;
            self.requeue_stale().await;

            tokio::time::sleep(self.cfg.net.request_timeout).await;
        }
    }

    /// Hands at most one pending task to an idle follower.
    async fn assign_one(&self, phase: Phase, func: &FnRef) {
        let mut followers = self.followers.lock().await;
        let Some(worker) = followers.idle.iter().next().cloned() else {
            return;
        };

        let (task, payload) = match phase {
            Phase::Map => {
                let mut group = self.map_tasks.lock().await;
                let Some((id, task)) = group.pop_pending() else {
                    return;
                };
                group.assign(id, task.clone(), worker.clone());
                (TaskId::Chunk(id), TaskPayload::Map(task))
            }
            Phase::Reduce => {
                let mut group = self.reduce_tasks.lock().await;
                let Some((key, values)) = group.pop_pending() else {
                    return;
                };
                group.assign(key.clone(), values.clone(), worker.clone());
                (
                    TaskId::Key(key.clone()),
                    TaskPayload::Reduce { key, values },
                )
            }
        };

        followers.idle.remove(&worker);
        followers.busy.insert(worker.clone());
        drop(followers);

        let request = DoTask {
            task: task.clone(),
            payload,
            func: func.clone(),
        };

        match RemoteDaemon::new(worker.addr, self.cfg.net)
            .send_once(&request)
            .await
        {
            Ok(Ok(())) => {
                tracing::info!(%task, %worker, "dispatched task");
            }
            Ok(Err(err)) => {
                tracing::warn!(%task, %worker, ?err, "follower rejected task");
                self.undo_assignment(&task, &worker).await;
            }
            Err(err) => {
                tracing::warn!(%task, %worker, ?err, "follower unreachable; dropping it");
                self.undo_assignment(&task, &worker).await;
            }
        }
    }

    /// Dispatch failed: the task goes back to pending and the follower is
    /// dropped until it resubscribes.
    async fn undo_assignment(&self, task: &TaskId, worker: &Endpoint) {
        match task {
            TaskId::Chunk(id) => {
                self.map_tasks.lock().await.return_to_pending(id);
            }
            TaskId::Key(key) => {
                self.reduce_tasks.lock().await.return_to_pending(key);
            }
        }

        let mut followers = self.followers.lock().await;
        followers.busy.remove(worker);
        followers.idle.remove(worker);
    }

    /// Assigned tasks that stayed silent past the deadline are presumed
    /// lost with their follower.
    async fn requeue_stale(&self) {
        let mut evicted: Vec<Endpoint> = Vec::new();

        for (task, follower) in self
            .map_tasks
            .lock()
            .await
            .requeue_stale(self.cfg.max_task_timeout)
        {
            tracing::warn!(task, %follower, "map task timed out; requeued");
            evicted.push(follower);
        }

        for (task, follower) in self
            .reduce_tasks
            .lock()
            .await
            .requeue_stale(self.cfg.max_task_timeout)
        {
            tracing::warn!(%task, %follower, "reduce task timed out; requeued");
            evicted.push(follower);
        }

        if !evicted.is_empty() {
            let mut followers = self.followers.lock().await;
            for follower in evicted {
                followers.busy.remove(&follower);
                followers.idle.remove(&follower);
            }
        }
    }

    /// Completion report from a follower. Serialised per task group by the
    /// group's own mutex, so completing a map task and seeding its reduce
    /// entries is atomic per report.
    pub async fn report_task(
        &self,
        follower: Endpoint,
        task: TaskId,
        func: FnRef,
        result: TaskResult,
    ) -> Result<(), Error> {
        {
            let mut followers = self.followers.lock().await;
            if followers.busy.remove(&follower) {
                followers.idle.insert(follower.clone());
            } else if !followers.idle.contains(&follower) {
                tracing::warn!(%follower, "task report from an unsubscribed follower");
                followers.idle.insert(follower.clone());
            }
        }

        let Some((map_fn, reduce_fn)) = self
            .functions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
        else {
            return Err(Error::UnknownFunction(func.kernel));
        };

        if let TaskResult::Failed(reason) = result {
            return self.task_failed(task, reason).await;
        }

        if func == map_fn {
            let TaskId::Chunk(id) = task else {
                return Err(Error::UnknownFunction(func.kernel));
            };
            let TaskResult::Map(pairs) = result else {
                return Err(Error::UnknownFunction(func.kernel));
            };

            let mut map = self.map_tasks.lock().await;
            if map.complete(&id) {
                tracing::info!(chunk = id, pairs = pairs.len(), "map task completed");
                let mut reduce = self.reduce_tasks.lock().await;
                for (key, value) in pairs {
                    reduce.push_pending_value(key, value);
                }
            } else {
                tracing::warn!(chunk = id, "ignoring duplicate map report");
            }

            Ok(())
        } else if func == reduce_fn {
            let TaskId::Key(key) = task else {
                return Err(Error::UnknownFunction(func.kernel));
            };
            let TaskResult::Reduce(value) = result else {
                return Err(Error::UnknownFunction(func.kernel));
            };

            let mut reduce = self.reduce_tasks.lock().await;
            if reduce.complete(&key) {
                tracing::info!(%key, "reduce task completed");
                self.results.lock().await.push((key, value));
            } else {
                tracing::warn!(%key, "ignoring duplicate reduce report");
            }

            Ok(())
        } else {
            Err(Error::UnknownFunction(func.kernel))
        }
    }

    /// Failed user code is retried up to the cap, then the whole job fails.
    async fn task_failed(&self, task: TaskId, reason: String) -> Result<(), Error> {
        let attempts = {
            let mut attempts = self.attempts.lock().unwrap_or_else(|e| e.into_inner());
            let entry = attempts.entry(task.clone()).or_insert(0);
            *entry += 1;
            *entry
        };

        if attempts >= self.cfg.task_retry_cap {
            tracing::error!(%task, attempts, %reason, "task exhausted its retries; failing job");
            let err = Error::TaskFailed(format!("{task} after {attempts} attempts: {reason}"));
            *self.failure.lock().unwrap_or_else(|e| e.into_inner()) = Some(err.to_string());
            return Ok(());
        }

        tracing::warn!(%task, attempts, %reason, "task failed; requeueing");

        match &task {
            TaskId::Chunk(id) => {
                self.map_tasks.lock().await.return_to_pending(id);
            }
            TaskId::Key(key) => {
                self.reduce_tasks.lock().await.return_to_pending(key);
            }
        }

        Ok(())
    }

    async fn backup_loop(self: Arc<Self>) {
        tracing::debug!("backup loop started");

        while self.alive() && self.job_active.load(Ordering::SeqCst) {
            self.backup_once().await;
            tokio::time::sleep(self.cfg.backup_interval).await;
        }

        tracing::debug!("backup loop stopped");
    }

    /// Snapshots the four state shards under the full lock set so the
    /// backup is internally consistent.
    pub async fn backup_once(&self) {
        let followers = self.followers.lock().await;
        let map = self.map_tasks.lock().await;
        let reduce = self.reduce_tasks.lock().await;
        let results = self.results.lock().await;

        let backup = MasterBackup {
            map: map.dump(),
            reduce: reduce.dump(),
            followers: followers
                .busy
                .iter()
                .chain(followers.idle.iter())
                .cloned()
                .collect(),
            results: results.clone(),
        };

        if let Err(err) = self
            .kv
            .insert(MASTER_BACKUP_KEY, encode_value(&backup))
            .await
        {
            tracing::warn!(?err, "could not back up master state");
        }
    }

    /// Publishes the outcome, notifies the client and clears the job from
    /// the DHT so the request handler accepts the next submission.
    async fn commit(&self, outcome: JobOutcome) {
        if !self.alive() {
            return;
        }

        match &outcome {
            JobOutcome::Completed(results) => {
                tracing::info!(results = results.len(), "committing final results");
                if let Err(err) = self.kv.insert(RESULTS_KEY, encode_value(results)).await {
                    tracing::error!(?err, "failed to commit final results");
                }
            }
            JobOutcome::Failed(reason) => {
                tracing::error!(%reason, "job failed");
            }
        }

        if let Ok(Some(bytes)) = self.kv.lookup(MASTER_CLIENT_KEY).await {
            match decode_value::<Endpoint>(&bytes) {
                Ok(client) => {
                    if let Err(err) =
                        client::notify(client.addr, self.cfg.net, outcome.clone()).await
                    {
                        tracing::warn!(%client, ?err, "failed to notify client");
                    }
                }
                Err(err) => tracing::warn!(?err, "staged client endpoint is undecodable"),
            }
        }

        for key in [
            MASTER_DATA_KEY,
            MASTER_MAP_CODE_KEY,
            MASTER_REDUCE_CODE_KEY,
            MASTER_CLIENT_KEY,
            MASTER_BACKUP_KEY,
        ] {
            if let Err(err) = self.kv.remove(key).await {
                tracing::warn!(key, ?err, "failed to clear job key");
            }
        }

        self.map_tasks.lock().await.reset();
        self.reduce_tasks.lock().await.reset();
        self.results.lock().await.clear();
        *self.functions.lock().unwrap_or_else(|e| e.into_inner()) = None;
        self.attempts
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clear();
        *self.failure.lock().unwrap_or_else(|e| e.into_inner()) = None;

        let mut followers = self.followers.lock().await;
        let busy = std::mem::take(&mut followers.busy);
        followers.idle.extend(busy);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Map,
    Reduce,
}
