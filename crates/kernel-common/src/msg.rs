//! Raw process lifecycle messages as they leave the kernel.
//!
//! Per-CPU ring buffers give no total order: an [`ExitMsg`] can reach
//! user space before the [`ExecveMsg`] that established the process
//! identity it points at. The correlation engine sorts that out; this
//! module only defines the shapes and their structural validation.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::time::Timestamp;

/// Identity of one process instance.
///
/// The kernel reuses numeric pids, so the creation timestamp is part
/// of the key. Immutable once assigned.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProcessKey {
    pub pid: i32,
    pub ktime: Timestamp,
}

impl ProcessKey {
    pub fn new(pid: i32, ktime: impl Into<Timestamp>) -> Self {
        Self {
            pid,
            ktime: ktime.into(),
        }
    }

    /// Keys with pid 0 mark "no process", e.g. the parent of init.
    pub fn is_null(&self) -> bool {
        self.pid == 0
    }
}

impl fmt::Display for ProcessKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.pid, self.ktime)
    }
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub uid: u32,
    /// Audit uid, stable across setuid.
    pub auid: u32,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Namespaces {
    pub uts: u32,
    pub ipc: u32,
    pub mnt: u32,
    pub pid: u32,
    pub net: u32,
    pub time: u32,
    pub cgroup: u32,
}

impl fmt::Display for Namespaces {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{{ uts: {}, ipc: {}, mnt: {}, pid: {}, net: {}, time: {}, cgroup: {} }}",
            self.uts, self.ipc, self.mnt, self.pid, self.net, self.time, self.cgroup
        )
    }
}

/// An execve notification.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecveMsg {
    pub process: ProcessKey,
    pub parent: ProcessKey,
    pub creds: Credentials,
    pub filename: String,
    /// NUL-separated argument string, argv[0] excluded.
    pub args: String,
    pub namespaces: Namespaces,
    pub cgroup_id: u64,
    /// Empty when the process runs outside a container.
    pub container_id: String,
}

impl ExecveMsg {
    pub fn validate(&self) -> Result<(), MsgError> {
        validate_key(self.process)?;
        if self.filename.is_empty() {
            return Err(MsgError::EmptyFilename(self.process));
        }
        if self.parent == self.process {
            return Err(MsgError::SelfParent(self.process));
        }
        Ok(())
    }

    /// Split the argument string on its NUL separators.
    pub fn argv(&self) -> Vec<String> {
        self.args
            .split('\0')
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect()
    }
}

/// An exit notification.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExitMsg {
    pub process: ProcessKey,
    pub exit_code: u32,
    /// Set when the record was reconstructed from a non-live source
    /// instead of the running kernel.
    pub cached: bool,
}

impl ExitMsg {
    pub fn validate(&self) -> Result<(), MsgError> {
        validate_key(self.process)
    }
}

fn validate_key(key: ProcessKey) -> Result<(), MsgError> {
    if key.pid <= 0 {
        return Err(MsgError::InvalidPid(key.pid));
    }
    if key.ktime.raw() == 0 {
        return Err(MsgError::ZeroKtime(key.pid));
    }
    Ok(())
}

/// Raw message kinds, resolved once at ingestion.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", content = "content")]
pub enum KernelMsg {
    Execve(ExecveMsg),
    Exit(ExitMsg),
}

impl KernelMsg {
    pub fn process_key(&self) -> ProcessKey {
        match self {
            KernelMsg::Execve(msg) => msg.process,
            KernelMsg::Exit(msg) => msg.process,
        }
    }
}

/// Structural validation failures. The only error raw-message handling
/// surfaces synchronously: malformed input is rejected and counted,
/// never retried.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum MsgError {
    #[error("invalid pid {0}")]
    InvalidPid(i32),
    #[error("process {0} has no creation timestamp")]
    ZeroKtime(i32),
    #[error("execve for {0} carries no binary path")]
    EmptyFilename(ProcessKey),
    #[error("process {0} claims to be its own parent")]
    SelfParent(ProcessKey),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn execve() -> ExecveMsg {
        ExecveMsg {
            process: ProcessKey::new(46983, 21034975089403u64),
            parent: ProcessKey::new(1459, 75200000000u64),
            creds: Credentials {
                uid: 1010,
                auid: 1010,
            },
            filename: "/usr/bin/ls".to_string(),
            args: "--color=auto\0/tmp".to_string(),
            namespaces: Namespaces {
                net: 4026531992,
                ..Default::default()
            },
            cgroup_id: 0,
            container_id: String::new(),
        }
    }

    #[test]
    fn valid_execve_passes() {
        assert_eq!(execve().validate(), Ok(()));
    }

    #[test]
    fn execve_requires_filename() {
        let mut msg = execve();
        msg.filename.clear();
        assert_eq!(msg.validate(), Err(MsgError::EmptyFilename(msg.process)));
    }

    #[test]
    fn execve_rejects_self_parent() {
        let mut msg = execve();
        msg.parent = msg.process;
        assert_eq!(msg.validate(), Err(MsgError::SelfParent(msg.process)));
    }

    #[test]
    fn exit_rejects_zero_identity() {
        let msg = ExitMsg {
            process: ProcessKey::new(42, 0u64),
            exit_code: 0,
            cached: false,
        };
        assert_eq!(msg.validate(), Err(MsgError::ZeroKtime(42)));
    }

    #[test]
    fn argv_splits_on_nul() {
        assert_eq!(execve().argv(), vec!["--color=auto", "/tmp"]);
    }

    #[test]
    fn kernel_msg_round_trips_as_json() {
        let msg = KernelMsg::Execve(execve());
        let json = serde_json::to_string(&msg).unwrap();
        let back: KernelMsg = serde_json::from_str(&json).unwrap();
        assert_eq!(back.process_key(), msg.process_key());
    }
}
