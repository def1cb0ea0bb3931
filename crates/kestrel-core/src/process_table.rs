//! Authoritative in-memory map from process identity to process
//! record.
//!
//! A record exists from the first sighting of either lifecycle message
//! (an exit arriving first creates a bare placeholder) until its
//! reference count reaches zero. The count is the number of live
//! children plus one for the process itself; the self reference is
//! released when the exit event has been emitted. Every operation is a
//! short critical section and never touches external I/O.

use std::{
    collections::HashMap,
    sync::RwLock,
};

use kernel_common::{Credentials, ExecveMsg, Namespaces, ProcessKey};

use crate::event::{ContainerMetadata, ProcessSnapshot};

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum RecordState {
    /// Sighted but its exec event has not been emitted yet.
    Pending,
    /// Exec event emitted; fields are final apart from enrichment that
    /// ran out of budget.
    Resolved,
    /// Exit event emitted; the record lingers while children live.
    Exited,
}

#[derive(Clone, Debug)]
pub struct ProcessRecord {
    pub key: ProcessKey,
    /// Resolved parent linkage. While this is set, the parent record
    /// carries one reference on our behalf.
    pub parent: Option<ProcessKey>,
    pub filename: String,
    pub args: String,
    pub creds: Credentials,
    pub namespaces: Namespaces,
    pub cgroup_id: u64,
    pub container_id: String,
    pub container: Option<ContainerMetadata>,
    pub state: RecordState,
    /// False for placeholders created by an out-of-order exit.
    pub exec_seen: bool,
    refcnt: u32,
}

impl ProcessRecord {
    fn from_exec(msg: &ExecveMsg) -> Self {
        Self {
            key: msg.process,
            parent: None,
            filename: msg.filename.clone(),
            args: msg.args.clone(),
            creds: msg.creds,
            namespaces: msg.namespaces,
            cgroup_id: msg.cgroup_id,
            container_id: msg.container_id.clone(),
            container: None,
            state: RecordState::Pending,
            exec_seen: true,
            refcnt: 1,
        }
    }

    fn placeholder(key: ProcessKey) -> Self {
        Self {
            key,
            parent: None,
            filename: String::new(),
            args: String::new(),
            creds: Credentials::default(),
            namespaces: Namespaces::default(),
            cgroup_id: 0,
            container_id: String::new(),
            container: None,
            state: RecordState::Pending,
            exec_seen: false,
            refcnt: 1,
        }
    }

    pub fn refcnt(&self) -> u32 {
        self.refcnt
    }

    pub fn snapshot(&self) -> ProcessSnapshot {
        ProcessSnapshot {
            key: self.key,
            filename: self.filename.clone(),
            args: self.args.clone(),
            creds: self.creds,
            namespaces: self.namespaces,
            cgroup_id: self.cgroup_id,
            container: self.container.clone(),
            refcnt: self.refcnt,
        }
    }
}

/// Outcome of [`ProcessTable::upsert_from_exec`].
#[derive(Debug, PartialEq, Eq)]
pub enum ExecUpsert {
    Created,
    /// An exit had arrived first; its placeholder absorbed the exec
    /// fields, keeping the existing reference count.
    MergedPlaceholder,
    /// A record with the same identity key and an exec already existed.
    /// The new record won and the stale parent linkage, if any, must
    /// be released by the caller.
    Collision { stale_parent: Option<ProcessKey> },
}

#[derive(Default)]
pub struct ProcessTable {
    records: RwLock<HashMap<ProcessKey, ProcessRecord>>,
}

impl ProcessTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.read().unwrap().is_empty()
    }

    /// Creates or updates a record from an execve message. Placeholder
    /// records left by an out-of-order exit are merged; a second exec
    /// for the same identity key is a data-integrity anomaly and the
    /// newer record wins.
    pub fn upsert_from_exec(&self, msg: &ExecveMsg) -> ExecUpsert {
        let mut records = self.records.write().unwrap();
        match records.get_mut(&msg.process) {
            None => {
                records.insert(msg.process, ProcessRecord::from_exec(msg));
                ExecUpsert::Created
            }
            Some(record) if !record.exec_seen => {
                let refcnt = record.refcnt;
                let mut merged = ProcessRecord::from_exec(msg);
                merged.refcnt = refcnt;
                *record = merged;
                ExecUpsert::MergedPlaceholder
            }
            Some(record) => {
                let stale_parent = record.parent;
                let refcnt = record.refcnt;
                let mut fresh = ProcessRecord::from_exec(msg);
                // children of the stale record still reference this key
                fresh.refcnt = refcnt;
                *record = fresh;
                ExecUpsert::Collision { stale_parent }
            }
        }
    }

    /// Creates a bare record when an exit is observed before the
    /// matching exec. Returns false if the key already exists.
    pub fn upsert_placeholder_from_exit(&self, key: ProcessKey) -> bool {
        let mut records = self.records.write().unwrap();
        match records.get(&key) {
            Some(_) => false,
            None => {
                records.insert(key, ProcessRecord::placeholder(key));
                true
            }
        }
    }

    pub fn lookup(&self, key: ProcessKey) -> Option<ProcessRecord> {
        self.records.read().unwrap().get(&key).cloned()
    }

    pub fn snapshot(&self, key: ProcessKey) -> Option<ProcessSnapshot> {
        self.records
            .read()
            .unwrap()
            .get(&key)
            .map(ProcessRecord::snapshot)
    }

    pub fn state(&self, key: ProcessKey) -> Option<RecordState> {
        self.records.read().unwrap().get(&key).map(|r| r.state)
    }

    /// Records the resolved parent linkage. The caller must have taken
    /// a reference on the parent via [`ProcessTable::inc_ref`].
    pub fn set_parent(&self, key: ProcessKey, parent: ProcessKey) {
        if let Some(record) = self.records.write().unwrap().get_mut(&key) {
            record.parent = Some(parent);
        }
    }

    pub fn set_container(&self, key: ProcessKey, container: ContainerMetadata) {
        if let Some(record) = self.records.write().unwrap().get_mut(&key) {
            record.container = Some(container);
        }
    }

    pub fn set_pod_hostname(&self, key: ProcessKey, hostname: String) {
        if let Some(record) = self.records.write().unwrap().get_mut(&key) {
            if let Some(pod) = record.container.as_mut().and_then(|c| c.pod.as_mut()) {
                pod.hostname = Some(hostname);
            }
        }
    }

    pub fn set_state(&self, key: ProcessKey, state: RecordState) {
        if let Some(record) = self.records.write().unwrap().get_mut(&key) {
            record.state = state;
        }
    }

    /// Transitions to Exited without removing; removal requires the
    /// reference count to reach zero.
    pub fn mark_exited(&self, key: ProcessKey) {
        self.set_state(key, RecordState::Exited);
    }

    /// Returns false when the key is gone and no reference was taken.
    pub fn inc_ref(&self, key: ProcessKey) -> bool {
        match self.records.write().unwrap().get_mut(&key) {
            Some(record) => {
                record.refcnt += 1;
                true
            }
            None => false,
        }
    }

    /// Drops one reference. A record reaching zero is removed if it is
    /// Exited or never matched an exec, and the release cascades to
    /// its parent. The cascade is a chain of short per-key critical
    /// sections, never one recursive walk under a single lock.
    pub fn dec_ref(&self, key: ProcessKey) {
        let mut next = Some(key);
        while let Some(key) = next {
            next = self.dec_ref_step(key);
        }
    }

    fn dec_ref_step(&self, key: ProcessKey) -> Option<ProcessKey> {
        let mut records = self.records.write().unwrap();
        let record = match records.get_mut(&key) {
            Some(record) => record,
            None => {
                log::warn!("released a reference on untracked process {key}");
                return None;
            }
        };
        if record.refcnt == 0 {
            log::warn!("reference count underflow for process {key}");
            return None;
        }
        record.refcnt -= 1;
        if record.refcnt > 0 {
            return None;
        }
        let removable = record.state == RecordState::Exited || !record.exec_seen;
        if !removable {
            return None;
        }
        let parent = record.parent;
        records.remove(&key);
        log::trace!("removed process {key} from the table");
        parent
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn exec_msg(pid: i32, ktime: u64, parent: ProcessKey) -> ExecveMsg {
        ExecveMsg {
            process: ProcessKey::new(pid, ktime),
            parent,
            creds: Credentials { uid: 0, auid: 0 },
            filename: format!("/bin/proc-{pid}"),
            args: String::new(),
            namespaces: Namespaces::default(),
            cgroup_id: 0,
            container_id: String::new(),
        }
    }

    #[test]
    fn exec_creates_record_with_self_reference() {
        let table = ProcessTable::new();
        let msg = exec_msg(10, 100, ProcessKey::new(1, 1u64));
        assert_eq!(table.upsert_from_exec(&msg), ExecUpsert::Created);
        let record = table.lookup(msg.process).unwrap();
        assert_eq!(record.refcnt(), 1);
        assert_eq!(record.state, RecordState::Pending);
        assert!(record.exec_seen);
    }

    #[test]
    fn placeholder_merge_preserves_refcnt() {
        let table = ProcessTable::new();
        let key = ProcessKey::new(10, 100u64);
        assert!(table.upsert_placeholder_from_exit(key));
        assert!(!table.upsert_placeholder_from_exit(key));
        table.inc_ref(key); // a child sighting

        let msg = exec_msg(10, 100, ProcessKey::new(1, 1u64));
        assert_eq!(table.upsert_from_exec(&msg), ExecUpsert::MergedPlaceholder);
        let record = table.lookup(key).unwrap();
        assert_eq!(record.refcnt(), 2);
        assert_eq!(record.filename, "/bin/proc-10");
        assert!(record.exec_seen);
    }

    #[test]
    fn duplicate_exec_reports_collision() {
        let table = ProcessTable::new();
        let parent = ProcessKey::new(1, 1u64);
        let msg = exec_msg(10, 100, parent);
        table.upsert_from_exec(&msg);
        table.set_parent(msg.process, parent);

        let outcome = table.upsert_from_exec(&msg);
        assert_eq!(
            outcome,
            ExecUpsert::Collision {
                stale_parent: Some(parent)
            }
        );
        // newer record wins and starts unlinked
        assert_eq!(table.lookup(msg.process).unwrap().parent, None);
    }

    #[test]
    fn release_cascades_through_exited_ancestors() {
        let table = ProcessTable::new();
        let root = ProcessKey::new(1, 1u64);
        let parent = ProcessKey::new(2, 2u64);
        let child = ProcessKey::new(3, 3u64);

        table.upsert_from_exec(&exec_msg(1, 1, ProcessKey::new(0, 0u64)));
        table.upsert_from_exec(&exec_msg(2, 2, root));
        table.upsert_from_exec(&exec_msg(3, 3, parent));
        table.inc_ref(root);
        table.set_parent(parent, root);
        table.inc_ref(parent);
        table.set_parent(child, parent);

        // ancestors exit first but stay pinned by their children
        table.mark_exited(root);
        table.dec_ref(root);
        table.mark_exited(parent);
        table.dec_ref(parent);
        assert_eq!(table.len(), 3);

        // the leaf exit unpins the whole chain
        table.mark_exited(child);
        table.dec_ref(child);
        assert!(table.is_empty());
    }

    #[test]
    fn live_record_survives_zero_children() {
        let table = ProcessTable::new();
        let key = ProcessKey::new(10, 100u64);
        table.upsert_from_exec(&exec_msg(10, 100, ProcessKey::new(1, 1u64)));
        table.inc_ref(key);
        table.dec_ref(key); // child came and went
        assert!(table.lookup(key).is_some());
        assert_eq!(table.lookup(key).unwrap().refcnt(), 1);
    }

    #[test]
    fn unmatched_placeholder_is_removed_on_release() {
        let table = ProcessTable::new();
        let key = ProcessKey::new(10, 100u64);
        table.upsert_placeholder_from_exit(key);
        table.dec_ref(key);
        assert!(table.is_empty());
    }
}
