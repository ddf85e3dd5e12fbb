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

//! User code. Shipping executable closures between processes is replaced by
//! a registry of named kernels: every node registers the same kernels at
//! startup and jobs reference them by name.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::dht::{decode_value, encode_value};
use crate::Result;

use super::{FnRef, Value};

pub const WORD_COUNT_MAP: &str = "word-count/map";
pub const WORD_COUNT_REDUCE: &str = "word-count/reduce";

pub trait MapKernel: Send + Sync + 'static {
    /// Emits `(key, value)` pairs for one input record. An `Err` is reported
    /// to the master as a failed task.
    fn map(&self, line_no: u64, line: &str) -> Result<Vec<(String, Value)>>;
}

pub trait ReduceKernel: Send + Sync + 'static {
    fn reduce(&self, key: &str, values: &[Value]) -> Result<Value>;
}

#[derive(Default)]
pub struct KernelRegistry {
    maps: BTreeMap<String, Arc<dyn MapKernel>>,
    reduces: BTreeMap<String, Arc<dyn ReduceKernel>>,
}

impl KernelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The registry every node starts with.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register_map(WORD_COUNT_MAP, Arc::new(WordCountMap));
        registry.register_reduce(WORD_COUNT_REDUCE, Arc::new(WordCountReduce));
        registry
    }

    pub fn register_map<S: Into<String>>(&mut self, name: S, kernel: Arc<dyn MapKernel>) {
        self.maps.insert(name.into(), kernel);
    }

    pub fn register_reduce<S: Into<String>>(&mut self, name: S, kernel: Arc<dyn ReduceKernel>) {
        self.reduces.insert(name.into(), kernel);
    }

    pub fn map(&self, func: &FnRef) -> Option<Arc<dyn MapKernel>> {
        self.maps.get(&func.kernel).cloned()
    }

    pub fn reduce(&self, func: &FnRef) -> Option<Arc<dyn ReduceKernel>> {
        self.reduces.get(&func.kernel).cloned()
    }
}

/// Lowercases, splits on whitespace and emits `(word, 1)` per word.
struct WordCountMap;

impl MapKernel for WordCountMap {
    fn map(&self, _line_no: u64, line: &str) -> Result<Vec<(String, Value)>> {
        Ok(line
            .split_whitespace()
            .map(|word| (word.to_lowercase(), encode_value(&1u64)))
            .collect())
    }
}

struct WordCountReduce;

impl ReduceKernel for WordCountReduce {
    fn reduce(&self, _key: &str, values: &[Value]) -> Result<Value> {
        let mut sum = 0u64;
        for value in values {
            sum += decode_value::<u64>(value)?;
        }

        Ok(encode_value(&sum))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn word_count_map_emits_lowercased_pairs() {
        let registry = KernelRegistry::with_defaults();
        let kernel = registry.map(&FnRef::new(WORD_COUNT_MAP)).unwrap();

        let pairs = kernel.map(0, "Hello MapReduce World").unwrap();
        let words: Vec<&str> = pairs.iter().map(|(w, _)| w.as_str()).collect();

        assert_eq!(words, vec!["hello", "mapreduce", "world"]);
        for (_, value) in &pairs {
            assert_eq!(decode_value::<u64>(value).unwrap(), 1);
        }
    }

    #[test]
    fn word_count_reduce_sums() {
        let registry = KernelRegistry::with_defaults();
        let kernel = registry.reduce(&FnRef::new(WORD_COUNT_REDUCE)).unwrap();

        let values: Vec<Value> = (0..3).map(|_| encode_value(&1u64)).collect();
        let out = kernel.reduce("word", &values).unwrap();

        assert_eq!(decode_value::<u64>(&out).unwrap(), 3);
    }

    #[test]
    fn unknown_kernel_is_absent() {
        let registry = KernelRegistry::with_defaults();
        assert!(registry.map(&FnRef::new("no-such-kernel")).is_none());
    }
}
