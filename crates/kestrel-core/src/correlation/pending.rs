//! The deferred set of the correlation engine.
//!
//! One entry per deferred event, at most one exec and one exit entry
//! per process key. Entries are owned exclusively by the engine while
//! pending and leave the set in the same critical section that emits
//! them, which is what makes emission exactly-once.

use std::{collections::HashMap, net::IpAddr, time::Instant};

use kernel_common::{ExecveMsg, ExitMsg, ProcessKey};

/// Unmet dependencies of a deferred exec event. `None` everywhere
/// means the event is ready to finalize.
#[derive(Clone, Debug, Default)]
pub(crate) struct Deps {
    /// Waiting for this parent record to resolve.
    pub parent: Option<ProcessKey>,
    /// Waiting for container metadata under this id.
    pub container: Option<String>,
    /// Waiting for the pod hostname of this address.
    pub hostname: Option<IpAddr>,
}

impl Deps {
    pub fn is_met(&self) -> bool {
        self.parent.is_none() && self.container.is_none() && self.hostname.is_none()
    }

    pub fn describe(&self) -> String {
        let mut unmet = Vec::new();
        if let Some(parent) = self.parent {
            unmet.push(format!("parent {parent}"));
        }
        if let Some(container) = &self.container {
            unmet.push(format!("container {container}"));
        }
        if let Some(ip) = self.hostname {
            unmet.push(format!("hostname of {ip}"));
        }
        unmet.join(", ")
    }
}

pub(crate) struct ExecEntry {
    pub msg: ExecveMsg,
    pub deps: Deps,
    pub attempts: u32,
    pub deadline: Instant,
}

pub(crate) struct ExitEntry {
    pub msg: ExitMsg,
    pub attempts: u32,
    pub deadline: Instant,
}

/// Both lifecycle sides of one process share a slot so that a shared
/// dependency finalizes them together, exec first.
pub(crate) struct PendingPair {
    pub exec: Option<ExecEntry>,
    pub exit: Option<ExitEntry>,
    /// Submission order, used to expire the oldest pair first.
    created: u64,
}

impl PendingPair {
    fn is_empty(&self) -> bool {
        self.exec.is_none() && self.exit.is_none()
    }

    fn entry_count(&self) -> usize {
        self.exec.is_some() as usize + self.exit.is_some() as usize
    }
}

#[derive(Default)]
pub(crate) struct PendingSet {
    pairs: HashMap<ProcessKey, PendingPair>,
    entries: usize,
    next_seq: u64,
}

impl PendingSet {
    pub fn entry_count(&self) -> usize {
        self.entries
    }

    pub fn keys(&self) -> Vec<ProcessKey> {
        self.pairs.keys().copied().collect()
    }

    pub fn get_mut(&mut self, key: ProcessKey) -> Option<&mut PendingPair> {
        self.pairs.get_mut(&key)
    }

    /// Returns false (leaving the set unchanged) when an exec entry
    /// for the key is already deferred.
    pub fn insert_exec(&mut self, key: ProcessKey, entry: ExecEntry) -> bool {
        let pair = self.pair_mut(key);
        if pair.exec.is_some() {
            return false;
        }
        pair.exec = Some(entry);
        self.entries += 1;
        true
    }

    /// Returns false (leaving the set unchanged) when an exit entry
    /// for the key is already deferred.
    pub fn insert_exit(&mut self, key: ProcessKey, entry: ExitEntry) -> bool {
        let pair = self.pair_mut(key);
        if pair.exit.is_some() {
            return false;
        }
        pair.exit = Some(entry);
        self.entries += 1;
        true
    }

    fn pair_mut(&mut self, key: ProcessKey) -> &mut PendingPair {
        let next_seq = &mut self.next_seq;
        self.pairs.entry(key).or_insert_with(|| {
            let pair = PendingPair {
                exec: None,
                exit: None,
                created: *next_seq,
            };
            *next_seq += 1;
            pair
        })
    }

    pub fn remove(&mut self, key: ProcessKey) -> Option<PendingPair> {
        let pair = self.pairs.remove(&key)?;
        self.entries -= pair.entry_count();
        Some(pair)
    }

    /// Drops a pair that became empty after its entries were taken.
    pub fn prune(&mut self, key: ProcessKey) {
        if self.pairs.get(&key).is_some_and(PendingPair::is_empty) {
            self.pairs.remove(&key);
        }
    }

    /// Bookkeeping for an entry taken out of a pair in place.
    pub fn entry_taken(&mut self) {
        self.entries -= 1;
    }

    pub fn oldest(&self) -> Option<ProcessKey> {
        self.pairs
            .iter()
            .min_by_key(|(_, pair)| pair.created)
            .map(|(key, _)| *key)
    }

    pub fn drain(&mut self) -> Vec<(ProcessKey, PendingPair)> {
        self.entries = 0;
        self.pairs.drain().collect()
    }
}
