//! Worker record table.
//!
//! In-memory roster of live workers keyed by pid. Ordinals are unique within
//! a generation; a worker keeps its ordinal until it is reaped.

use std::collections::HashMap;
use std::time::Duration;

use nix::unistd::Pid;
use tokio::time::Instant;

use crate::config::WorkerInfo;
use crate::lifecycle::Heartbeat;

#[derive(Debug)]
pub struct WorkerRecord {
    pub pid: Pid,
    pub ordinal: usize,
    pub generation: u64,
    pub last_heartbeat: Instant,
    /// Graceful-quit has been sent.
    pub quitting: bool,
    /// When the worker was terminated for silence.
    pub terminated_at: Option<Instant>,
    /// SIGKILL has been sent.
    pub killed: bool,
    heartbeat: Heartbeat,
    last_counter: u64,
}

impl WorkerRecord {
    pub fn new(pid: Pid, info: WorkerInfo, heartbeat: Heartbeat, now: Instant) -> Self {
        Self {
            pid,
            ordinal: info.ordinal,
            generation: info.generation,
            last_heartbeat: now,
            quitting: false,
            terminated_at: None,
            killed: false,
            heartbeat,
            last_counter: 0,
        }
    }

    /// Check the heartbeat channel; returns true if the worker beat since the
    /// last check.
    pub fn observe(&mut self, now: Instant) -> bool {
        match self.heartbeat.read() {
            Ok(counter) if counter != self.last_counter => {
                self.last_counter = counter;
                self.last_heartbeat = now;
                true
            }
            Ok(_) => false,
            Err(e) => {
                tracing::warn!(pid = %self.pid, error = %e, "Failed to read heartbeat");
                false
            }
        }
    }

    pub fn silent_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_heartbeat)
    }

    pub fn heartbeat(&self) -> &Heartbeat {
        &self.heartbeat
    }
}

#[derive(Debug, Default)]
pub struct WorkerTable {
    records: HashMap<Pid, WorkerRecord>,
}

impl WorkerTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, record: WorkerRecord) {
        self.records.insert(record.pid, record);
    }

    /// Drop a record. Its heartbeat file is closed with it.
    pub fn remove(&mut self, pid: Pid) -> Option<WorkerRecord> {
        self.records.remove(&pid)
    }

    pub fn get(&self, pid: Pid) -> Option<&WorkerRecord> {
        self.records.get(&pid)
    }

    pub fn get_mut(&mut self, pid: Pid) -> Option<&mut WorkerRecord> {
        self.records.get_mut(&pid)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn pids(&self) -> Vec<Pid> {
        self.records.keys().copied().collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = &WorkerRecord> {
        self.records.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut WorkerRecord> {
        self.records.values_mut()
    }

    /// Ordinals in `0..pool` that no worker of `generation` holds.
    pub fn missing_ordinals(&self, pool: usize, generation: u64) -> Vec<usize> {
        (0..pool)
            .filter(|&ordinal| {
                !self
                    .records
                    .values()
                    .any(|r| r.generation == generation && r.ordinal == ordinal)
            })
            .collect()
    }

    /// Workers of `generation` beyond the pool size that have not been asked
    /// to quit, highest ordinal first.
    pub fn excess(&self, pool: usize, generation: u64) -> Vec<Pid> {
        let mut excess: Vec<&WorkerRecord> = self
            .records
            .values()
            .filter(|r| r.generation == generation && r.ordinal >= pool && !r.quitting)
            .collect();
        excess.sort_by(|a, b| b.ordinal.cmp(&a.ordinal));
        excess.into_iter().map(|r| r.pid).collect()
    }

    /// Workers from generations before `generation` not yet asked to quit.
    pub fn outdated(&self, generation: u64) -> Vec<Pid> {
        self.records
            .values()
            .filter(|r| r.generation < generation && !r.quitting)
            .map(|r| r.pid)
            .collect()
    }
}
