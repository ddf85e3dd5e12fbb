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

//! The map-reduce control plane: task bookkeeping shared by the master and
//! its followers.

use std::collections::BTreeMap;
use std::fmt;
use std::time::{Duration, Instant};

use crate::distributed::member::Endpoint;

pub mod client;
pub mod follower;
pub mod kernel;
pub mod master;
pub mod request_handler;

pub use follower::Follower;
pub use master::Master;
pub use request_handler::RequestHandler;

/// Opaque task payload bytes; only the kernels interpret them.
pub type Value = Vec<u8>;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub enum Error {
    #[error("a job is already in progress")]
    Busy,

    #[error("the follower is already executing a task")]
    WorkerBusy,

    #[error("unknown task function: {0}")]
    UnknownFunction(String),

    #[error("task failed on the follower: {0}")]
    TaskFailed(String),

    #[error("job failed: {0}")]
    JobFailed(String),

    #[error("the cluster is currently unavailable")]
    Unavailable,
}

/// Reference to a pre-registered kernel. This is what travels the wire in
/// place of a serialised closure; followers resolve it against their local
/// [`kernel::KernelRegistry`].
#[derive(Debug, Clone, PartialEq, Eq, bincode::Encode, bincode::Decode)]
pub struct FnRef {
    pub kernel: String,
}

impl FnRef {
    pub fn new<S: Into<String>>(kernel: S) -> Self {
        Self {
            kernel: kernel.into(),
        }
    }
}

/// Map tasks are keyed by chunk index, reduce tasks by output key.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, bincode::Encode, bincode::Decode)]
pub enum TaskId {
    Chunk(u64),
    Key(String),
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TaskId::Chunk(id) => write!(f, "map-chunk/{id}"),
            TaskId::Key(key) => write!(f, "reduce-key/{key}"),
        }
    }
}

#[derive(Debug, Clone, bincode::Encode, bincode::Decode)]
pub enum TaskPayload {
    /// Numbered input records.
    Map(Vec<(u64, String)>),
    /// One output key with every intermediate value collected for it.
    Reduce { key: String, values: Vec<Value> },
}

#[derive(Debug, Clone, bincode::Encode, bincode::Decode)]
pub enum TaskResult {
    Map(Vec<(String, Value)>),
    Reduce(Value),
    /// Error sentinel: user code raised on the follower.
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, bincode::Encode, bincode::Decode)]
pub enum JobOutcome {
    Completed(Vec<(String, Value)>),
    Failed(String),
}

/// All tasks of one phase, in three disjoint sections. The union of the
/// sections is constant for the lifetime of the phase.
#[derive(Debug, Default)]
pub struct TaskGroup<K: Ord + Clone, V: Clone> {
    pending: BTreeMap<K, V>,
    assigned: BTreeMap<K, V>,
    assigned_to: BTreeMap<K, (Endpoint, Instant)>,
    completed: BTreeMap<K, V>,
}

/// The serialisable projection of a [`TaskGroup`]; who holds which task (and
/// since when) is deliberately not part of the backup, assigned tasks are
/// requeued wholesale on recovery.
#[derive(Debug, Clone, bincode::Encode, bincode::Decode)]
pub struct TaskGroupDump<K: Ord, V> {
    pub pending: BTreeMap<K, V>,
    pub assigned: BTreeMap<K, V>,
    pub completed: BTreeMap<K, V>,
}

impl<K: Ord + Clone, V: Clone> TaskGroup<K, V> {
    pub fn new() -> Self {
        Self {
            pending: BTreeMap::new(),
            assigned: BTreeMap::new(),
            assigned_to: BTreeMap::new(),
            completed: BTreeMap::new(),
        }
    }

    /// True while the phase still has work in flight or waiting.
    pub fn any(&self) -> bool {
        !self.pending.is_empty() || !self.assigned.is_empty()
    }

    pub fn len(&self) -> usize {
        self.pending.len() + self.assigned.len() + self.completed.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn assigned_len(&self) -> usize {
        self.assigned.len()
    }

    pub fn completed_len(&self) -> usize {
        self.completed.len()
    }

    pub fn add_pending(&mut self, id: K, task: V) {
        self.pending.insert(id, task);
    }

    /// Appends an element to a pending `Vec` task, creating it if needed.
    /// This is the shuffle step: grouping is associative and commutative, so
    /// report order does not matter.
    pub fn push_pending_value<T>(&mut self, id: K, value: T)
    where
        V: AsMut<Vec<T>> + Default,
    {
        self.pending.entry(id).or_default().as_mut().push(value);
    }

    pub fn pop_pending(&mut self) -> Option<(K, V)> {
        let id = self.pending.keys().next().cloned()?;
        let task = self.pending.remove(&id)?;
        Some((id, task))
    }

    pub fn assign(&mut self, id: K, task: V, follower: Endpoint) {
        self.assigned_to.insert(id.clone(), (follower, Instant::now()));
        self.assigned.insert(id, task);
    }

    /// Flags a task as completed wherever it currently sits. Returns false
    /// when the id is unknown (e.g. a duplicate report for an already
    /// completed task), in which case the group is unchanged.
    pub fn complete(&mut self, id: &K) -> bool {
        let task = self
            .pending
            .remove(id)
            .or_else(|| self.assigned.remove(id));

        match task {
            Some(task) => {
                self.assigned_to.remove(id);
                self.completed.insert(id.clone(), task);
                true
            }
            None => false,
        }
    }

    /// Puts an assigned task back into the queue, e.g. after a dispatch
    /// failure.
    pub fn return_to_pending(&mut self, id: &K) -> bool {
        match self.assigned.remove(id) {
            Some(task) => {
                self.assigned_to.remove(id);
                self.pending.insert(id.clone(), task);
                true
            }
            None => false,
        }
    }

    /// Requeues every assigned task older than `timeout` and reports which
    /// follower held it.
    pub fn requeue_stale(&mut self, timeout: Duration) -> Vec<(K, Endpoint)> {
        let stale: Vec<K> = self
            .assigned_to
            .iter()
            .filter(|(_, (_, at))| at.elapsed() > timeout)
            .map(|(id, _)| id.clone())
            .collect();

        let mut evicted = Vec::new();
        for id in stale {
            if let Some((follower, _)) = self.assigned_to.get(&id).cloned() {
                if self.return_to_pending(&id) {
                    evicted.push((id, follower));
                }
            }
        }

        evicted
    }

    pub fn reset_assigned_to_pending(&mut self) {
        let assigned = std::mem::take(&mut self.assigned);
        self.assigned_to.clear();
        self.pending.extend(assigned);
    }

    pub fn reset(&mut self) {
        self.pending.clear();
        self.assigned.clear();
        self.assigned_to.clear();
        self.completed.clear();
    }

    pub fn completed_tasks(&self) -> impl Iterator<Item = (&K, &V)> {
        self.completed.iter()
    }

    pub fn dump(&self) -> TaskGroupDump<K, V> {
        TaskGroupDump {
            pending: self.pending.clone(),
            assigned: self.assigned.clone(),
            completed: self.completed.clone(),
        }
    }

    pub fn load(&mut self, dump: TaskGroupDump<K, V>) {
        self.pending = dump.pending;
        self.assigned = dump.assigned;
        self.assigned_to.clear();
        self.completed = dump.completed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn follower() -> Endpoint {
        Endpoint::new("follower", "127.0.0.1:9000".parse().unwrap())
    }

    fn group_with_tasks(n: u64) -> TaskGroup<u64, Vec<(u64, String)>> {
        let mut group = TaskGroup::new();
        for id in 0..n {
            group.add_pending(id, vec![(id, format!("line {id}"))]);
        }
        group
    }

    #[test]
    fn task_count_is_conserved() {
        let mut group = group_with_tasks(8);
        assert_eq!(group.len(), 8);

        let (id, task) = group.pop_pending().unwrap();
        group.assign(id, task, follower());
        assert_eq!(group.len(), 8);

        assert!(group.complete(&id));
        assert_eq!(group.len(), 8);
        assert_eq!(group.completed_len(), 1);
    }

    #[test]
    fn sections_stay_disjoint() {
        let mut group = group_with_tasks(4);

        let (id, task) = group.pop_pending().unwrap();
        group.assign(id, task, follower());

        assert_eq!(group.pending_len(), 3);
        assert_eq!(group.assigned_len(), 1);

        group.complete(&id);
        assert_eq!(group.assigned_len(), 0);
        assert_eq!(group.completed_len(), 1);

        // a second report for the same task changes nothing
        assert!(!group.complete(&id));
        assert_eq!(group.len(), 4);
        assert_eq!(group.completed_len(), 1);
    }

    #[test]
    fn requeue_stale_evicts_holder() {
        let mut group = group_with_tasks(2);
        let (id, task) = group.pop_pending().unwrap();
        group.assign(id, task, follower());

        let evicted = group.requeue_stale(Duration::ZERO);
        assert_eq!(evicted.len(), 1);
        assert_eq!(evicted[0].0, id);
        assert_eq!(group.pending_len(), 2);
        assert_eq!(group.assigned_len(), 0);
    }

    #[test]
    fn fresh_assignments_are_not_stale() {
        let mut group = group_with_tasks(1);
        let (id, task) = group.pop_pending().unwrap();
        group.assign(id, task, follower());

        assert!(group.requeue_stale(Duration::from_secs(300)).is_empty());
        assert_eq!(group.assigned_len(), 1);
    }

    #[test]
    fn recovery_requeues_assigned() {
        let mut group = group_with_tasks(4);
        let (id, task) = group.pop_pending().unwrap();
        group.assign(id, task, follower());
        let (id2, _) = group.pop_pending().unwrap();
        group.complete(&id2);

        let dump = group.dump();

        let mut restored: TaskGroup<u64, Vec<(u64, String)>> = TaskGroup::new();
        restored.load(dump);
        restored.reset_assigned_to_pending();

        assert_eq!(restored.len(), 4);
        assert_eq!(restored.assigned_len(), 0);
        assert_eq!(restored.pending_len(), 3);
        assert_eq!(restored.completed_len(), 1);
    }

    #[test]
    fn shuffle_groups_values_under_key() {
        let mut group: TaskGroup<String, Vec<Value>> = TaskGroup::new();

        group.push_pending_value("word".to_string(), vec![1u8]);
        group.push_pending_value("word".to_string(), vec![2u8]);
        group.push_pending_value("other".to_string(), vec![3u8]);

        assert_eq!(group.pending_len(), 2);
        let (_, values) = group.pop_pending().unwrap();
        assert_eq!(values.len(), 1); // "other"
        let (_, values) = group.pop_pending().unwrap();
        assert_eq!(values.len(), 2); // "word"
    }
}
