use std::{
    fmt::{self, Display},
    net::IpAddr,
    time::SystemTime,
};

use chrono::{DateTime, Utc};
use kernel_common::{Credentials, Namespaces, ProcessKey};
use serde::{Deserialize, Serialize};

/// Pod metadata attached by the cluster-metadata lookup service.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pod {
    pub name: String,
    pub namespace: String,
    pub ip: Option<IpAddr>,
    /// Resolved from `ip` by the hostname lookup service.
    pub hostname: Option<String>,
}

/// Container information attached to events of containerized processes.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContainerMetadata {
    pub id: String,
    pub name: String,
    pub image: String,
    pub image_digest: String,
    pub pod: Option<Pod>,
}

impl fmt::Display for ContainerMetadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{{ id: {}, name: {}, image: {}, image_digest: {} }}",
            self.id, self.name, self.image, self.image_digest
        )
    }
}

/// State of one process record as captured at emission time.
///
/// Unresolved enrichment is represented by `container: None`; the
/// reference count is a live value and two snapshots of the same
/// process may legitimately differ in it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessSnapshot {
    pub key: ProcessKey,
    pub filename: String,
    pub args: String,
    pub creds: Credentials,
    pub namespaces: Namespaces,
    pub cgroup_id: u64,
    pub container: Option<ContainerMetadata>,
    pub refcnt: u32,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "content")]
pub enum Payload {
    Exec,
    Exit { exit_code: u32, cached: bool },
}

impl Display for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Payload::Exec => write!(f, "Exec"),
            Payload::Exit { exit_code, cached } => {
                write!(f, "Exit {{ exit_code: {exit_code}, cached: {cached} }}")
            }
        }
    }
}

/// One finalized logical event, produced at most once per process and
/// event kind. `parent` is `None` when parent resolution ran out of
/// retry budget.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub process: ProcessSnapshot,
    pub parent: Option<ProcessSnapshot>,
    pub payload: Payload,
    pub timestamp: SystemTime,
}

impl Event {
    pub fn is_exec(&self) -> bool {
        matches!(self.payload, Payload::Exec)
    }

    pub fn is_exit(&self) -> bool {
        matches!(self.payload, Payload::Exit { .. })
    }

    pub fn key(&self) -> ProcessKey {
        self.process.key
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let time = DateTime::<Utc>::from(self.timestamp).format("%Y-%m-%dT%TZ");
        let image = &self.process.filename;
        let pid = self.process.key.pid;

        let process_info = match self.process.container {
            Some(ref container) => {
                format!("{} {} ({pid})", container.image, image)
            }
            None => format!("{image} ({pid})"),
        };

        writeln!(f, "[{time} EVENT {process_info}] {}", self.payload)
    }
}
