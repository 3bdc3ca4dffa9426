//! Executor slot capacity as a step function over time.
//!
//! Every executor contributes `+cores` when added and `-cores` when removed.
//! The level at `t` is the prefix sum of all deltas stamped `<= t`, clamped at
//! zero. Adds sort before removes at equal timestamps so a same-instant swap
//! never dips.

use sparkmon_core::{EpochMillis, ExecutorId};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CapacitySample {
    pub ts: EpochMillis,
    pub delta: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ExecutorKey {
    pub epoch: u32,
    pub executor_id: ExecutorId,
}

impl ExecutorKey {
    pub fn new(epoch: u32, executor_id: ExecutorId) -> Self {
        Self { epoch, executor_id }
    }
}

#[derive(Debug, Clone)]
struct ExecutorRecord {
    cores: u32,
    added_at: EpochMillis,
    removed_at: Option<EpochMillis>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapacityOutcome {
    Added { cores: u32 },
    /// The add completed a removal that had arrived first.
    AddedAfterRemoval { cores: u32, removed_at: EpochMillis },
    Removed { cores: u32, at: EpochMillis },
    /// Removal stamped before its own add; recorded at the add time instead.
    RemovedBeforeAdd { cores: u32, at: EpochMillis },
    /// Removal for an executor not yet added; held until the add shows up.
    RemovalPending,
    Duplicate,
}

#[derive(Debug, Default, Clone)]
pub struct CapacityTracker {
    executors: HashMap<ExecutorKey, ExecutorRecord>,
    pending_removals: HashMap<ExecutorKey, EpochMillis>,
    samples: Vec<CapacitySample>,
    levels: Vec<u64>,
    clamps: Vec<bool>,
    clamped: usize,
}

impl CapacityTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn executor_added(
        &mut self,
        key: ExecutorKey,
        cores: u32,
        ts: EpochMillis,
    ) -> CapacityOutcome {
        if self.executors.contains_key(&key) {
            return CapacityOutcome::Duplicate;
        }
        self.insert_sample(ts, i64::from(cores));
        let pending = self.pending_removals.remove(&key);
        let removed_at = pending.map(|removed| removed.max(ts));
        if let Some(at) = removed_at {
            self.insert_sample(at, -i64::from(cores));
        }
        self.executors.insert(
            key,
            ExecutorRecord {
                cores,
                added_at: ts,
                removed_at,
            },
        );
        match removed_at {
            Some(removed_at) => CapacityOutcome::AddedAfterRemoval { cores, removed_at },
            None => CapacityOutcome::Added { cores },
        }
    }

    pub fn executor_removed(&mut self, key: ExecutorKey, ts: EpochMillis) -> CapacityOutcome {
        let Some(record) = self.executors.get_mut(&key) else {
            if self.pending_removals.contains_key(&key) {
                return CapacityOutcome::Duplicate;
            }
            self.pending_removals.insert(key, ts);
            return CapacityOutcome::RemovalPending;
        };
        if record.removed_at.is_some() {
            return CapacityOutcome::Duplicate;
        }
        let cores = record.cores;
        let at = ts.max(record.added_at);
        record.removed_at = Some(at);
        self.insert_sample(at, -i64::from(cores));
        if ts < at {
            CapacityOutcome::RemovedBeforeAdd { cores, at }
        } else {
            CapacityOutcome::Removed { cores, at }
        }
    }

    /// Removes every live executor at `ts`, e.g. when the application ends.
    /// Returns how many executors were retired.
    pub fn retire_all(&mut self, ts: EpochMillis) -> usize {
        let mut retired = Vec::new();
        for record in self.executors.values_mut() {
            if record.removed_at.is_none() {
                let at = ts.max(record.added_at);
                record.removed_at = Some(at);
                retired.push((at, record.cores));
            }
        }
        for (at, cores) in &retired {
            self.insert_sample(*at, -i64::from(*cores));
        }
        retired.len()
    }

    /// Capacity in force at `t` (right-continuous). Zero before any executor.
    pub fn capacity_at(&self, t: EpochMillis) -> u64 {
        let idx = self.samples.partition_point(|sample| sample.ts <= t);
        if idx == 0 {
            0
        } else {
            self.levels[idx - 1]
        }
    }

    /// One `(ts, level)` point per distinct sample timestamp.
    pub fn steps(&self) -> Vec<(EpochMillis, u64)> {
        let mut steps: Vec<(EpochMillis, u64)> = Vec::new();
        for (sample, level) in self.samples.iter().zip(&self.levels) {
            match steps.last_mut() {
                Some(last) if last.0 == sample.ts => last.1 = *level,
                _ => steps.push((sample.ts, *level)),
            }
        }
        steps
    }

    pub fn live_executors(&self) -> usize {
        self.executors
            .values()
            .filter(|record| record.removed_at.is_none())
            .count()
    }

    pub fn total_cores(&self) -> u64 {
        self.executors
            .values()
            .filter(|record| record.removed_at.is_none())
            .map(|record| u64::from(record.cores))
            .sum()
    }

    /// Number of prefix-sum steps that had to be clamped at zero.
    pub fn clamped_steps(&self) -> usize {
        self.clamped
    }

    pub fn samples(&self) -> &[CapacitySample] {
        &self.samples
    }

    fn insert_sample(&mut self, ts: EpochMillis, delta: i64) {
        let idx = self
            .samples
            .partition_point(|sample| (sample.ts, -sample.delta) <= (ts, -delta));
        self.samples.insert(idx, CapacitySample { ts, delta });
        self.clamps.insert(idx, false);
        self.recompute_levels_from(idx);
    }

    /// Levels before `from` do not depend on samples at or after it.
    fn recompute_levels_from(&mut self, from: usize) {
        self.levels.truncate(from);
        let mut level = match from.checked_sub(1) {
            Some(prev) => self.levels[prev] as i64,
            None => 0,
        };
        for (offset, sample) in self.samples[from..].iter().enumerate() {
            let idx = from + offset;
            level += sample.delta;
            let clamped = level < 0;
            if clamped && !self.clamps[idx] {
                self.clamped += 1;
                tracing::warn!(
                    event = "capacity_underflow",
                    ts = sample.ts,
                    delta = sample.delta,
                    level
                );
            } else if !clamped && self.clamps[idx] {
                self.clamped -= 1;
            }
            self.clamps[idx] = clamped;
            if clamped {
                level = 0;
            }
            self.levels.push(level as u64);
        }
    }
}
