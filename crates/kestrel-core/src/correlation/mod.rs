//! The correlation engine: raw lifecycle messages in, ordered and
//! enriched logical events out.
//!
//! Translators ([`CorrelationEngine::handle_execve`] and
//! [`CorrelationEngine::handle_exit`]) emit synchronously when every
//! dependency is already available and defer to the pending set
//! otherwise. A periodic sweep re-probes deferred entries and, once
//! the retry budget runs out, emits them with whatever data there is.
//!
//! Locking discipline: every transition to `Resolved`/`Exited` and
//! every delivery happens under the pending-set mutex, which makes it
//! both the exactly-once completion point and the per-process
//! exec-before-exit ordering gate. Lookup-service probes always run
//! outside that lock (the sweep snapshots unmet dependencies, probes
//! unlocked, then re-acquires to apply). Lock order is pending set →
//! process table, never the reverse.

mod pending;

use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicU64, Ordering},
    },
    time::{Instant, SystemTime},
};

use kernel_common::{ExecveMsg, ExitMsg, KernelMsg, MsgError, ProcessKey};

use crate::{
    config::CorrelationConfig,
    event::{Event, Payload},
    fanout::{Fanout, ListenerId},
    lookup::{HostnameResolver, MetadataResolver},
    process_table::{ExecUpsert, ProcessTable, RecordState},
    shutdown::{CleanExit, ShutdownSignal},
};
use pending::{Deps, ExecEntry, ExitEntry, PendingSet};

/// Counters kept by the engine. Malformed input is rejected and
/// counted; degraded emissions and identity collisions are absorbed
/// and counted.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct CorrelationStats {
    pub invalid_msgs: u64,
    pub degraded_events: u64,
    pub duplicate_keys: u64,
}

pub struct CorrelationEngine {
    config: CorrelationConfig,
    table: ProcessTable,
    fanout: Fanout,
    pending: Mutex<PendingSet>,
    metadata: Arc<dyn MetadataResolver>,
    hostnames: Arc<dyn HostnameResolver>,
    invalid_msgs: AtomicU64,
    degraded_events: AtomicU64,
    duplicate_keys: AtomicU64,
}

impl CorrelationEngine {
    pub fn new(
        config: CorrelationConfig,
        metadata: Arc<dyn MetadataResolver>,
        hostnames: Arc<dyn HostnameResolver>,
    ) -> Self {
        Self {
            fanout: Fanout::new(config.listener_buffer),
            config,
            table: ProcessTable::new(),
            pending: Mutex::new(PendingSet::default()),
            metadata,
            hostnames,
            invalid_msgs: AtomicU64::new(0),
            degraded_events: AtomicU64::new(0),
            duplicate_keys: AtomicU64::new(0),
        }
    }

    pub fn add_listener(&self) -> (ListenerId, tokio::sync::mpsc::Receiver<Arc<Event>>) {
        self.fanout.add_listener()
    }

    pub fn remove_listener(&self, id: ListenerId) {
        self.fanout.remove_listener(id)
    }

    pub fn stats(&self) -> CorrelationStats {
        CorrelationStats {
            invalid_msgs: self.invalid_msgs.load(Ordering::Relaxed),
            degraded_events: self.degraded_events.load(Ordering::Relaxed),
            duplicate_keys: self.duplicate_keys.load(Ordering::Relaxed),
        }
    }

    /// Number of processes currently tracked.
    pub fn process_count(&self) -> usize {
        self.table.len()
    }

    /// Number of deferred events awaiting resolution.
    pub fn pending_len(&self) -> usize {
        self.pending.lock().unwrap().entry_count()
    }

    /// Dispatches a raw message to the matching translator.
    pub fn handle_msg(&self, msg: KernelMsg) -> Result<Option<Arc<Event>>, MsgError> {
        match msg {
            KernelMsg::Execve(msg) => self.handle_execve(msg),
            KernelMsg::Exit(msg) => self.handle_exit(msg),
        }
    }

    /// Translates one execve message. Returns the finalized event when
    /// every dependency resolved synchronously, `None` when the event
    /// was deferred.
    pub fn handle_execve(&self, msg: ExecveMsg) -> Result<Option<Arc<Event>>, MsgError> {
        if let Err(err) = msg.validate() {
            self.invalid_msgs.fetch_add(1, Ordering::Relaxed);
            return Err(err);
        }

        let upsert = self.table.upsert_from_exec(&msg);
        let collided = matches!(upsert, ExecUpsert::Collision { .. });
        if let ExecUpsert::Collision { stale_parent } = upsert {
            self.duplicate_keys.fetch_add(1, Ordering::Relaxed);
            log::warn!("second execve under identity {}, newer record wins", msg.process);
            if let Some(parent) = stale_parent {
                self.table.dec_ref(parent);
            }
        }

        let mut deps = Deps {
            parent: (!msg.parent.is_null()).then_some(msg.parent),
            container: (!msg.container_id.is_empty()).then(|| msg.container_id.clone()),
            hostname: None,
        };
        // lookup-service probes, before taking the pending-set lock
        self.resolve_container(msg.process, &mut deps);

        let mut pending = self.pending.lock().unwrap();
        if collided && pending.remove(msg.process).is_some() {
            log::warn!("force-expired deferred events of stale record {}", msg.process);
        }
        self.resolve_parent(msg.process, &mut deps);

        if deps.is_met() {
            let event = self.finalize_exec(msg.process, None);
            // an out-of-order exit may already be queued behind us
            if let Some(mut pair) = pending.remove(msg.process) {
                if let Some(exit) = pair.exit.take() {
                    self.finalize_exit(&exit.msg);
                }
            }
            return Ok(event);
        }

        log::debug!(
            "deferring exec of {} waiting on {}",
            msg.process,
            deps.describe()
        );
        let key = msg.process;
        let inserted = pending.insert_exec(
            key,
            ExecEntry {
                msg,
                deps,
                attempts: 0,
                deadline: Instant::now() + self.config.max_age,
            },
        );
        if !inserted {
            log::debug!("exec of {key} already deferred");
        }
        self.enforce_bound(&mut pending);
        Ok(None)
    }

    /// Translates one exit message. The exit of a process is gated on
    /// the same resolution as its exec so that it is never emitted
    /// with stale or empty process fields, and never before the exec.
    pub fn handle_exit(&self, msg: ExitMsg) -> Result<Option<Arc<Event>>, MsgError> {
        if let Err(err) = msg.validate() {
            self.invalid_msgs.fetch_add(1, Ordering::Relaxed);
            return Err(err);
        }

        let mut pending = self.pending.lock().unwrap();
        let state = match self.table.lookup(msg.process) {
            Some(record) => record.state,
            None => {
                log::debug!("exit before exec for {}, deferring", msg.process);
                self.table.upsert_placeholder_from_exit(msg.process);
                RecordState::Pending
            }
        };
        match state {
            RecordState::Pending => {
                let key = msg.process;
                let inserted = pending.insert_exit(
                    key,
                    ExitEntry {
                        msg,
                        attempts: 0,
                        deadline: Instant::now() + self.config.max_age,
                    },
                );
                if !inserted {
                    log::warn!("dropped duplicate exit for {key}");
                }
                self.enforce_bound(&mut pending);
                Ok(None)
            }
            RecordState::Resolved => Ok(self.finalize_exit(&msg)),
            RecordState::Exited => {
                log::warn!("dropped duplicate exit for emitted {}", msg.process);
                Ok(None)
            }
        }
    }

    /// Inserts an already-running process (discovered by scanning
    /// procfs at startup) without emitting an event. Enrichment is
    /// probed once, best effort.
    pub fn seed_process(&self, msg: ExecveMsg) -> Result<(), MsgError> {
        if let Err(err) = msg.validate() {
            self.invalid_msgs.fetch_add(1, Ordering::Relaxed);
            return Err(err);
        }
        if let ExecUpsert::Collision { stale_parent } = self.table.upsert_from_exec(&msg) {
            self.duplicate_keys.fetch_add(1, Ordering::Relaxed);
            if let Some(parent) = stale_parent {
                self.table.dec_ref(parent);
            }
        }
        let mut deps = Deps {
            parent: (!msg.parent.is_null()).then_some(msg.parent),
            container: (!msg.container_id.is_empty()).then(|| msg.container_id.clone()),
            hostname: None,
        };
        self.resolve_container(msg.process, &mut deps);
        if deps.parent.is_some() && self.table.inc_ref(msg.parent) {
            self.table.set_parent(msg.process, msg.parent);
        }
        self.table.set_state(msg.process, RecordState::Resolved);
        Ok(())
    }

    /// One pass over the deferred set: re-probe every unmet
    /// dependency, finalize what resolved, degrade what ran out of
    /// budget. Exec and exit of the same process finalize in the same
    /// pass, exec first. Public so tests can drive the cadence
    /// synchronously; [`CorrelationEngine::run`] drives it from a
    /// timer.
    pub fn sweep(&self) {
        // snapshot unmet lookup dependencies under the lock
        let probes: Vec<(ProcessKey, Deps)> = {
            let mut pending = self.pending.lock().unwrap();
            let keys = pending.keys();
            keys.into_iter()
                .filter_map(|key| {
                    let pair = pending.get_mut(key)?;
                    let exec = pair.exec.as_ref()?;
                    Some((key, exec.deps.clone()))
                })
                .collect()
        };

        // probe lookup services with no lock held
        let probed: Vec<(ProcessKey, Deps)> = probes
            .into_iter()
            .map(|(key, mut deps)| {
                self.resolve_container(key, &mut deps);
                (key, deps)
            })
            .collect();
        let mut probed: std::collections::HashMap<ProcessKey, Deps> =
            probed.into_iter().collect();

        // apply results, finalize, enforce the retry budget
        let now = Instant::now();
        let mut pending = self.pending.lock().unwrap();
        for key in pending.keys() {
            let Some(pair) = pending.get_mut(key) else {
                continue;
            };

            if let Some(exec) = pair.exec.as_mut() {
                if let Some(deps) = probed.remove(&key) {
                    exec.deps = deps;
                }
                self.resolve_parent(key, &mut exec.deps);
                if exec.deps.is_met() {
                    pair.exec = None;
                    pending.entry_taken();
                    self.finalize_exec(key, None);
                } else {
                    exec.attempts += 1;
                    if exec.attempts >= self.config.max_attempts || now >= exec.deadline {
                        let unmet = exec.deps.clone();
                        pair.exec = None;
                        pending.entry_taken();
                        self.finalize_exec(key, Some(&unmet));
                    }
                }
            }

            let Some(pair) = pending.get_mut(key) else {
                continue;
            };
            if pair.exec.is_none() {
                if let Some(exit) = pair.exit.as_mut() {
                    match self.table.state(key) {
                        Some(RecordState::Resolved) => {
                            let msg = exit.msg.clone();
                            pair.exit = None;
                            pending.entry_taken();
                            self.finalize_exit(&msg);
                        }
                        Some(_) => {
                            exit.attempts += 1;
                            if exit.attempts >= self.config.max_attempts || now >= exit.deadline {
                                let msg = exit.msg.clone();
                                pair.exit = None;
                                pending.entry_taken();
                                self.finalize_exit(&msg);
                            }
                        }
                        None => {
                            log::warn!("dropped deferred exit of untracked process {key}");
                            pair.exit = None;
                            pending.entry_taken();
                        }
                    }
                }
            }
            pending.prune(key);
        }
    }

    /// Drives the sweep until cancellation, then flushes what is left
    /// with partial data rather than discarding it.
    pub async fn run(&self, mut shutdown: ShutdownSignal) -> CleanExit {
        let mut sweep = tokio::time::interval(self.config.sweep_interval);
        loop {
            tokio::select! {
                exit = shutdown.recv() => {
                    self.flush();
                    return exit;
                }
                _ = sweep.tick() => self.sweep(),
            }
        }
    }

    /// Finalizes every deferred event with the data at hand.
    pub fn flush(&self) {
        let mut pending = self.pending.lock().unwrap();
        let drained = pending.drain();
        if drained.is_empty() {
            return;
        }
        log::info!("flushing {} deferred process pairs", drained.len());
        for (key, pair) in drained {
            if let Some(exec) = pair.exec {
                self.finalize_exec(key, Some(&exec.deps));
            }
            if let Some(exit) = pair.exit {
                self.finalize_exit(&exit.msg);
            }
        }
    }

    /// Probes container metadata and, once the pod address is known,
    /// the pod hostname. Mutates the record and clears the met
    /// dependencies. Must be called with the pending-set lock NOT
    /// held.
    fn resolve_container(&self, key: ProcessKey, deps: &mut Deps) {
        if let Some(container_id) = &deps.container {
            if let Some(metadata) = self.metadata.resolve(container_id) {
                deps.hostname = metadata
                    .pod
                    .as_ref()
                    .filter(|pod| pod.hostname.is_none())
                    .and_then(|pod| pod.ip);
                self.table.set_container(key, metadata);
                deps.container = None;
            }
        }
        if deps.container.is_none() {
            if let Some(ip) = deps.hostname {
                if let Some(hostname) = self.hostnames.resolve(ip) {
                    self.table.set_pod_hostname(key, hostname);
                    deps.hostname = None;
                }
            }
        }
    }

    /// Checks whether the parent record has resolved and, if so, takes
    /// a reference on it and records the linkage. Touches only the
    /// table; safe under the pending-set lock.
    fn resolve_parent(&self, key: ProcessKey, deps: &mut Deps) {
        let Some(parent) = deps.parent else {
            return;
        };
        match self.table.lookup(parent) {
            Some(record) if record.state != RecordState::Pending => {
                if self.table.inc_ref(parent) {
                    self.table.set_parent(key, parent);
                    deps.parent = None;
                }
            }
            _ => {}
        }
    }

    /// Emits the exec event for a record, transitioning it to
    /// Resolved. `unmet` carries the dependencies given up on, if any.
    /// Must be called under the pending-set lock.
    fn finalize_exec(&self, key: ProcessKey, unmet: Option<&Deps>) -> Option<Arc<Event>> {
        let record = self.table.lookup(key)?;
        if record.state != RecordState::Pending {
            log::debug!("exec of {key} already emitted");
            return None;
        }
        if let Some(unmet) = unmet {
            if !unmet.is_met() {
                self.degraded_events.fetch_add(1, Ordering::Relaxed);
                log::warn!(
                    "emitting exec of {key} with partial data, gave up on {}",
                    unmet.describe()
                );
            }
        }
        self.table.set_state(key, RecordState::Resolved);
        let parent = record.parent.and_then(|parent| self.table.snapshot(parent));
        let event = Arc::new(Event {
            process: record.snapshot(),
            parent,
            payload: Payload::Exec,
            timestamp: SystemTime::now(),
        });
        self.fanout.deliver(event.clone());
        Some(event)
    }

    /// Emits the exit event for a record, transitioning it to Exited
    /// and releasing the self reference. An exit that never saw its
    /// exec is emitted with empty process fields and counted as
    /// degraded. Must be called under the pending-set lock.
    fn finalize_exit(&self, msg: &ExitMsg) -> Option<Arc<Event>> {
        let key = msg.process;
        let record = self.table.lookup(key)?;
        if record.state == RecordState::Exited {
            log::debug!("exit of {key} already emitted");
            return None;
        }
        if !record.exec_seen {
            self.degraded_events.fetch_add(1, Ordering::Relaxed);
            log::warn!("emitting exit of {key} that never matched an execve");
        }
        self.table.mark_exited(key);
        let parent = record.parent.and_then(|parent| self.table.snapshot(parent));
        let event = Arc::new(Event {
            process: record.snapshot(),
            parent,
            payload: Payload::Exit {
                exit_code: msg.exit_code,
                cached: msg.cached,
            },
            timestamp: SystemTime::now(),
        });
        self.fanout.deliver(event.clone());
        self.table.dec_ref(key);
        Some(event)
    }

    /// Keeps the deferred set inside its configured bound by
    /// force-finalizing the oldest pair with partial data. Nothing is
    /// ever silently dropped.
    fn enforce_bound(&self, pending: &mut PendingSet) {
        while pending.entry_count() > self.config.max_pending {
            let Some(oldest) = pending.oldest() else {
                break;
            };
            log::warn!("deferred set over {} entries, expiring {oldest}", self.config.max_pending);
            let Some(pair) = pending.remove(oldest) else {
                break;
            };
            if let Some(exec) = pair.exec {
                self.finalize_exec(oldest, Some(&exec.deps));
            }
            if let Some(exit) = pair.exit {
                self.finalize_exit(&exit.msg);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::HashMap, net::IpAddr};

    use kernel_common::{Credentials, Namespaces, Timestamp};
    use tokio::sync::mpsc;

    use super::*;
    use crate::{
        event::{ContainerMetadata, Pod},
        lookup::{HostnameCache, MetadataCache},
    };

    const NO_PARENT: ProcessKey = ProcessKey {
        pid: 0,
        ktime: Timestamp::from_raw(0),
    };

    struct Rig {
        engine: Arc<CorrelationEngine>,
        metadata: Arc<MetadataCache>,
        hostnames: Arc<HostnameCache>,
        rx: mpsc::Receiver<Arc<Event>>,
    }

    fn test_config() -> CorrelationConfig {
        CorrelationConfig {
            max_attempts: 3,
            listener_buffer: 4096,
            ..Default::default()
        }
    }

    fn rig_with(config: CorrelationConfig) -> Rig {
        let metadata = Arc::new(MetadataCache::new());
        let hostnames = Arc::new(HostnameCache::new());
        let engine = Arc::new(CorrelationEngine::new(
            config,
            metadata.clone(),
            hostnames.clone(),
        ));
        let (_id, rx) = engine.add_listener();
        Rig {
            engine,
            metadata,
            hostnames,
            rx,
        }
    }

    fn rig() -> Rig {
        rig_with(test_config())
    }

    fn exec_msg(key: ProcessKey, parent: ProcessKey) -> ExecveMsg {
        ExecveMsg {
            process: key,
            parent,
            creds: Credentials {
                uid: 1010,
                auid: 1010,
            },
            filename: format!("/usr/bin/app-{}", key.pid),
            args: "--color=auto\0/tmp".to_string(),
            namespaces: Namespaces {
                net: 4026531992,
                ..Default::default()
            },
            cgroup_id: 7,
            container_id: String::new(),
        }
    }

    fn exit_msg(key: ProcessKey) -> ExitMsg {
        ExitMsg {
            process: key,
            exit_code: 0,
            cached: false,
        }
    }

    fn drain(rx: &mut mpsc::Receiver<Arc<Event>>) -> Vec<Arc<Event>> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    fn metadata(id: &str, pod_ip: Option<IpAddr>) -> ContainerMetadata {
        ContainerMetadata {
            id: id.to_string(),
            name: "web".to_string(),
            image: "nginx:latest".to_string(),
            image_digest: "sha256:0000".to_string(),
            pod: pod_ip.map(|ip| Pod {
                name: "web-0".to_string(),
                namespace: "default".to_string(),
                ip: Some(ip),
                hostname: None,
            }),
        }
    }

    #[test]
    fn in_order_exec_then_exit() {
        let mut rig = rig();
        let key = ProcessKey::new(46983, 21034975089403u64);

        assert!(rig.engine.handle_execve(exec_msg(key, NO_PARENT)).unwrap().is_some());
        assert!(rig.engine.handle_exit(exit_msg(key)).unwrap().is_some());

        let events = drain(&mut rig.rx);
        assert_eq!(events.len(), 2);
        assert!(events[0].is_exec());
        assert!(events[1].is_exit());
        assert_eq!(events[0].process.filename, "/usr/bin/app-46983");
        assert_eq!(rig.engine.stats().degraded_events, 0);
    }

    #[test]
    fn out_of_order_exit_then_exec() {
        let mut rig = rig();
        let parent = ProcessKey::new(1459, 75200000000u64);
        let key = ProcessKey::new(46983, 21034975089403u64);
        rig.engine.handle_execve(exec_msg(parent, NO_PARENT)).unwrap();

        // the exit reaches user space first
        assert!(rig.engine.handle_exit(exit_msg(key)).unwrap().is_none());
        assert!(rig.engine.handle_execve(exec_msg(key, parent)).unwrap().is_some());

        let events = drain(&mut rig.rx);
        let child: Vec<_> = events.iter().filter(|e| e.key() == key).collect();
        assert_eq!(child.len(), 2);
        assert!(child[0].is_exec());
        assert!(child[1].is_exit());

        // identical process fields, modulo the live reference count
        let mut exec_process = child[0].process.clone();
        let mut exit_process = child[1].process.clone();
        exec_process.refcnt = 0;
        exit_process.refcnt = 0;
        assert_eq!(exec_process, exit_process);
        assert_eq!(child[0].parent, child[1].parent);
        assert_eq!(
            child[0].parent.as_ref().unwrap().filename,
            "/usr/bin/app-1459"
        );
    }

    #[test]
    fn exec_waits_for_missing_parent() {
        let mut rig = rig();
        let parent = ProcessKey::new(100, 50u64);
        let child = ProcessKey::new(200, 99u64);

        assert!(rig.engine.handle_execve(exec_msg(child, parent)).unwrap().is_none());
        rig.engine.sweep();
        assert!(drain(&mut rig.rx).is_empty());
        assert_eq!(rig.engine.pending_len(), 1);

        rig.engine.handle_execve(exec_msg(parent, NO_PARENT)).unwrap();
        rig.engine.sweep();

        let events = drain(&mut rig.rx);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].key(), parent);
        assert_eq!(events[1].key(), child);
        assert_eq!(
            events[1].parent.as_ref().unwrap().filename,
            events[0].process.filename
        );
        assert_eq!(rig.engine.pending_len(), 0);
        assert_eq!(rig.engine.stats().degraded_events, 0);
    }

    #[test]
    fn container_metadata_enriches_synchronously() {
        let mut rig = rig();
        let ip: IpAddr = "10.0.0.7".parse().unwrap();
        rig.metadata.insert(metadata("cafe", Some(ip)));
        rig.hostnames.insert(ip, "web-0.cluster.local".to_string());

        let key = ProcessKey::new(7, 70u64);
        let mut msg = exec_msg(key, NO_PARENT);
        msg.container_id = "cafe".to_string();
        assert!(rig.engine.handle_execve(msg).unwrap().is_some());

        let events = drain(&mut rig.rx);
        let container = events[0].process.container.as_ref().unwrap();
        assert_eq!(container.image, "nginx:latest");
        assert_eq!(
            container.pod.as_ref().unwrap().hostname.as_deref(),
            Some("web-0.cluster.local")
        );
    }

    #[test]
    fn hostname_resolution_defers_exec() {
        let mut rig = rig();
        let ip: IpAddr = "10.0.0.7".parse().unwrap();
        rig.metadata.insert(metadata("cafe", Some(ip)));

        let key = ProcessKey::new(7, 70u64);
        let mut msg = exec_msg(key, NO_PARENT);
        msg.container_id = "cafe".to_string();
        assert!(rig.engine.handle_execve(msg).unwrap().is_none());

        rig.hostnames.insert(ip, "web-0.cluster.local".to_string());
        rig.engine.sweep();

        let events = drain(&mut rig.rx);
        assert_eq!(events.len(), 1);
        let pod = events[0].process.container.as_ref().unwrap().pod.as_ref().unwrap();
        assert_eq!(pod.hostname.as_deref(), Some("web-0.cluster.local"));
    }

    #[test]
    fn unresolvable_container_degrades_after_budget() {
        let mut rig = rig();
        let key = ProcessKey::new(7, 70u64);
        let mut msg = exec_msg(key, NO_PARENT);
        msg.container_id = "unknowable".to_string();
        assert!(rig.engine.handle_execve(msg).unwrap().is_none());

        rig.engine.sweep();
        rig.engine.sweep();
        assert!(drain(&mut rig.rx).is_empty());
        rig.engine.sweep(); // third attempt exhausts the budget

        let events = drain(&mut rig.rx);
        assert_eq!(events.len(), 1);
        assert!(events[0].is_exec());
        assert!(events[0].process.container.is_none());
        assert_eq!(rig.engine.stats().degraded_events, 1);
        assert_eq!(rig.engine.pending_len(), 0);

        // the exit still matches the degraded exec fields
        assert!(rig.engine.handle_exit(exit_msg(key)).unwrap().is_some());
        let events = drain(&mut rig.rx);
        assert!(events[0].is_exit());
        assert!(events[0].process.container.is_none());
    }

    #[test]
    fn exit_without_exec_degrades_and_reclaims() {
        let mut rig = rig();
        let key = ProcessKey::new(31337, 90u64);
        assert!(rig.engine.handle_exit(exit_msg(key)).unwrap().is_none());
        assert_eq!(rig.engine.process_count(), 1);

        rig.engine.sweep();
        rig.engine.sweep();
        rig.engine.sweep();

        let events = drain(&mut rig.rx);
        assert_eq!(events.len(), 1);
        assert!(events[0].is_exit());
        assert_eq!(events[0].process.filename, "");
        assert_eq!(rig.engine.stats().degraded_events, 1);
        assert_eq!(rig.engine.process_count(), 0);
        assert_eq!(rig.engine.pending_len(), 0);
    }

    #[test]
    fn records_are_reclaimed_bottom_up() {
        let mut rig = rig();
        let parent = ProcessKey::new(1, 10u64);
        let child = ProcessKey::new(2, 20u64);
        rig.engine.handle_execve(exec_msg(parent, NO_PARENT)).unwrap();
        rig.engine.handle_execve(exec_msg(child, parent)).unwrap();

        // the parent exits first and stays pinned by its child
        rig.engine.handle_exit(exit_msg(parent)).unwrap();
        assert_eq!(rig.engine.process_count(), 2);

        rig.engine.handle_exit(exit_msg(child)).unwrap();
        assert_eq!(rig.engine.process_count(), 0);
        assert_eq!(drain(&mut rig.rx).len(), 4);
    }

    #[test]
    fn concurrent_pairs_deliver_exactly_once() {
        let mut rig = rig_with(CorrelationConfig {
            listener_buffer: 8192,
            ..test_config()
        });

        let threads: Vec<_> = (0..8)
            .map(|t| {
                let engine = rig.engine.clone();
                std::thread::spawn(move || {
                    for i in 0..125 {
                        let pid = 1000 + t * 125 + i;
                        let key = ProcessKey::new(pid, pid as u64 * 10 + 1);
                        if pid % 2 == 0 {
                            let _ = engine.handle_exit(exit_msg(key));
                            let _ = engine.handle_execve(exec_msg(key, NO_PARENT));
                        } else {
                            let _ = engine.handle_execve(exec_msg(key, NO_PARENT));
                            let _ = engine.handle_exit(exit_msg(key));
                        }
                    }
                })
            })
            .collect();
        for thread in threads {
            thread.join().unwrap();
        }
        for _ in 0..5 {
            rig.engine.sweep();
        }

        let events = drain(&mut rig.rx);
        assert_eq!(events.len(), 2000);
        let mut by_key: HashMap<ProcessKey, Vec<&Arc<Event>>> = HashMap::new();
        for event in &events {
            by_key.entry(event.key()).or_default().push(event);
        }
        assert_eq!(by_key.len(), 1000);
        for (key, events) in by_key {
            assert_eq!(events.len(), 2, "wrong event count for {key}");
            assert!(events[0].is_exec(), "exit before exec for {key}");
            assert!(events[1].is_exit());
        }
        assert_eq!(rig.engine.pending_len(), 0);
        assert_eq!(rig.engine.process_count(), 0);
        assert_eq!(rig.engine.stats().degraded_events, 0);
    }

    #[test]
    fn pending_bound_expires_oldest_pair() {
        let mut rig = rig_with(CorrelationConfig {
            max_pending: 2,
            ..test_config()
        });
        for pid in 1..=3 {
            let key = ProcessKey::new(pid, pid as u64 * 10);
            let orphan_parent = ProcessKey::new(9000 + pid, 5u64);
            assert!(rig
                .engine
                .handle_execve(exec_msg(key, orphan_parent))
                .unwrap()
                .is_none());
        }

        // the third submission pushed the first pair out, degraded
        let events = drain(&mut rig.rx);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].key().pid, 1);
        assert!(events[0].parent.is_none());
        assert_eq!(rig.engine.pending_len(), 2);
        assert_eq!(rig.engine.stats().degraded_events, 1);
    }

    #[test]
    fn malformed_input_is_rejected_and_counted() {
        let mut rig = rig();
        let mut msg = exec_msg(ProcessKey::new(5, 50u64), NO_PARENT);
        msg.filename.clear();
        assert!(rig.engine.handle_execve(msg).is_err());
        assert_eq!(rig.engine.stats().invalid_msgs, 1);
        assert_eq!(rig.engine.process_count(), 0);
        assert!(drain(&mut rig.rx).is_empty());
    }

    #[test]
    fn identity_collision_expires_stale_record() {
        let mut rig = rig();
        let parent = ProcessKey::new(100, 50u64);
        let key = ProcessKey::new(7, 70u64);

        // first exec defers on its unknown parent, then a second exec
        // arrives under the same identity
        assert!(rig.engine.handle_execve(exec_msg(key, parent)).unwrap().is_none());
        assert!(rig.engine.handle_execve(exec_msg(key, parent)).unwrap().is_none());
        assert_eq!(rig.engine.stats().duplicate_keys, 1);

        rig.engine.handle_execve(exec_msg(parent, NO_PARENT)).unwrap();
        rig.engine.sweep();

        // the stale record never emits; the winner emits once
        let execs = drain(&mut rig.rx)
            .into_iter()
            .filter(|e| e.key() == key)
            .count();
        assert_eq!(execs, 1);
    }

    #[test]
    fn duplicate_exit_of_pinned_record_is_dropped() {
        let mut rig = rig();
        let parent = ProcessKey::new(1, 10u64);
        let child = ProcessKey::new(2, 20u64);
        rig.engine.handle_execve(exec_msg(parent, NO_PARENT)).unwrap();
        rig.engine.handle_execve(exec_msg(child, parent)).unwrap();

        assert!(rig.engine.handle_exit(exit_msg(parent)).unwrap().is_some());
        assert!(rig.engine.handle_exit(exit_msg(parent)).unwrap().is_none());
        let exits = drain(&mut rig.rx).iter().filter(|e| e.is_exit()).count();
        assert_eq!(exits, 1);
    }

    #[test]
    fn seeded_processes_do_not_emit() {
        let mut rig = rig();
        let key = ProcessKey::new(1, 10u64);
        rig.engine.seed_process(exec_msg(key, NO_PARENT)).unwrap();
        assert_eq!(rig.engine.process_count(), 1);
        assert!(drain(&mut rig.rx).is_empty());

        // live traffic against the seeded record resolves directly
        assert!(rig.engine.handle_exit(exit_msg(key)).unwrap().is_some());
        let events = drain(&mut rig.rx);
        assert_eq!(events.len(), 1);
        assert!(events[0].is_exit());
        assert_eq!(events[0].process.filename, "/usr/bin/app-1");
        assert_eq!(rig.engine.process_count(), 0);
    }

    #[tokio::test]
    async fn shutdown_flushes_deferred_events() {
        let mut rig = rig();
        let orphan_parent = ProcessKey::new(100, 50u64);
        let key = ProcessKey::new(7, 70u64);
        rig.engine.handle_execve(exec_msg(key, orphan_parent)).unwrap();

        let (sender, signal) = ShutdownSignal::new();
        let engine = rig.engine.clone();
        let task = tokio::spawn(async move { engine.run(signal).await });
        sender.send_signal();
        task.await.unwrap();

        let events = drain(&mut rig.rx);
        assert_eq!(events.len(), 1);
        assert!(events[0].is_exec());
        assert!(events[0].parent.is_none());
        assert_eq!(rig.engine.pending_len(), 0);
    }
}
