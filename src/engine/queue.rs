// src/engine/queue.rs

use std::cmp::Reverse;
use std::collections::BTreeMap;

use tracing::debug;

use crate::engine::ResourceVector;
use crate::types::ModelId;

/// A submission waiting for capacity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingEntry {
    pub model: ModelId,
    pub requirement: ResourceVector,
    pub priority: i32,
    /// Monotonic submission sequence; breaks priority ties FIFO.
    pub seq: u64,
}

/// Priority queue of submissions that did not fit when they were scheduled.
///
/// Ordering:
/// - higher `priority` first
/// - equal priority in submission order
///
/// A model appears at most once; the scheduler checks in-flight state before
/// pushing.
#[derive(Debug, Default)]
pub struct PendingQueue {
    entries: BTreeMap<(Reverse<i32>, u64), PendingEntry>,
    next_seq: u64,
}

impl PendingQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, model: impl Into<ModelId>, requirement: ResourceVector, priority: i32) {
        let model = model.into();
        let seq = self.next_seq;
        self.next_seq += 1;

        debug!(model = %model, priority, seq, "queued submission");
        self.entries.insert(
            (Reverse(priority), seq),
            PendingEntry {
                model,
                requirement,
                priority,
                seq,
            },
        );
    }

    /// Remove a queued model, returning its entry if it was present.
    pub fn remove(&mut self, model: &str) -> Option<PendingEntry> {
        let key = self
            .entries
            .iter()
            .find(|(_, e)| e.model == model)
            .map(|(k, _)| *k)?;
        self.entries.remove(&key)
    }

    pub fn contains(&self, model: &str) -> bool {
        self.entries.values().any(|e| e.model == model)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Queued model ids in admission order.
    pub fn models(&self) -> Vec<ModelId> {
        self.entries.values().map(|e| e.model.clone()).collect()
    }

    /// Walk the queue in admission order and take out every entry for which
    /// `admit` returns true.
    ///
    /// `admit` is expected to allocate as a side effect, so later entries see
    /// the capacity left over by earlier ones. Entries that are refused stay
    /// queued; a refused high-priority entry does not block smaller entries
    /// behind it.
    pub fn drain_admissible<F>(&mut self, mut admit: F) -> Vec<PendingEntry>
    where
        F: FnMut(&PendingEntry) -> bool,
    {
        let admitted_keys: Vec<(Reverse<i32>, u64)> = self
            .entries
            .iter()
            .filter(|(_, entry)| admit(*entry))
            .map(|(k, _)| *k)
            .collect();

        let admitted: Vec<PendingEntry> = admitted_keys
            .iter()
            .filter_map(|k| self.entries.remove(k))
            .collect();

        if !admitted.is_empty() {
            debug!(
                admitted = admitted.len(),
                still_queued = self.entries.len(),
                "drained admissible submissions"
            );
        }
        admitted
    }
}
