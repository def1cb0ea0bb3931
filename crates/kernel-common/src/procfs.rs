//! Utility functions used to extract data from procfs.
//!
//! The correlation engine is fed by live kernel traffic; procfs is
//! only scanned once at startup to seed the process table with the
//! processes that were already running.

use std::{
    fs::{self, File},
    io::{self, BufRead, BufReader},
    path::PathBuf,
};

use glob::glob;
use lazy_static::lazy_static;
use nix::unistd::{Pid, Uid};
use regex::Regex;
use thiserror::Error;

use crate::{msg::Namespaces, time::Timestamp};

lazy_static! {
    /// Pattern for matching cgroups created by Docker.
    static ref RE_CGROUP_DOCKER: Regex = Regex::new(r"docker.(?P<id>[0-9a-f]+)(?:[^0-9a-f])").unwrap();
    /// Pattern for matching cgroups created by libpod/podman.
    static ref RE_CGROUP_LIBPOD: Regex = Regex::new(r"libpod(?:-conmon)?-(?P<id>[0-9a-f]+)(?:[^0-9a-f])").unwrap();
}

#[derive(Error, Debug)]
pub enum ProcfsError {
    #[error("reading {path} failed")]
    ReadFile {
        #[source]
        source: io::Error,
        path: String,
    },

    #[error("parent for process {0} not found")]
    ParentNotFound(Pid),
    #[error("user id for process {0} not found")]
    UserNotFound(Pid),
    #[error("start time for process {0} not found")]
    StartTimeNotFound(Pid),

    #[error("globbing running processes")]
    GlobbingError(#[from] glob::PatternError),
    #[error("unreadable entry")]
    GlobError(#[from] glob::GlobError),
    #[error(transparent)]
    ParseIntError(#[from] std::num::ParseIntError),
}

/// Returns the path of the executable image of a given process.
pub fn get_process_image(pid: Pid) -> Result<PathBuf, ProcfsError> {
    read_link(&format!("/proc/{pid}/exe"))
}

/// Return where a link is pointing to.
fn read_link(path: &str) -> Result<PathBuf, ProcfsError> {
    fs::read_link(path).map_err(|source| ProcfsError::ReadFile {
        source,
        path: path.to_string(),
    })
}

/// Returns the command line for the given process.
pub fn get_process_command_line(pid: Pid) -> Result<Vec<String>, ProcfsError> {
    let path = format!("/proc/{pid}/cmdline");
    let data =
        fs::read_to_string(&path).map_err(|source| ProcfsError::ReadFile { source, path })?;

    Ok(data
        .split('\0')
        .filter(|s| !s.is_empty())
        .map(String::from)
        .collect())
}

/// Returns the parent of a given process.
pub fn get_process_parent_pid(pid: Pid) -> Result<Pid, ProcfsError> {
    read_status_field(pid, "PPid:")?
        .and_then(|value| value.parse().ok())
        .map(Pid::from_raw)
        .ok_or(ProcfsError::ParentNotFound(pid))
}

/// Returns the user id of a given process.
pub fn get_process_user_id(pid: Pid) -> Result<Uid, ProcfsError> {
    read_status_field(pid, "Uid:")?
        .and_then(|value| value.parse().ok())
        .map(Uid::from_raw)
        .ok_or(ProcfsError::UserNotFound(pid))
}

fn read_status_field(pid: Pid, field: &str) -> Result<Option<String>, ProcfsError> {
    let path = format!("/proc/{pid}/status");
    let file = File::open(&path).map_err(|source| ProcfsError::ReadFile { source, path })?;

    let reader = BufReader::new(file);
    for line in reader.lines().map_while(Result::ok) {
        if let Some(rest) = line.strip_prefix(field) {
            return Ok(rest.split_whitespace().next().map(String::from));
        }
    }
    Ok(None)
}

/// Returns the creation timestamp of a given process, on the kernel
/// boot clock. Field 22 of `/proc/pid/stat`, counted in clock ticks.
pub fn get_process_start_ktime(pid: Pid) -> Result<Timestamp, ProcfsError> {
    let path = format!("/proc/{pid}/stat");
    let data =
        fs::read_to_string(&path).map_err(|source| ProcfsError::ReadFile { source, path })?;

    // comm may contain spaces, skip past its closing parenthesis
    let after_comm = data
        .rfind(')')
        .map(|i| &data[i + 1..])
        .ok_or(ProcfsError::StartTimeNotFound(pid))?;
    let ticks: u64 = after_comm
        .split_whitespace()
        .nth(19)
        .ok_or(ProcfsError::StartTimeNotFound(pid))?
        .parse()?;

    // procfs reports times in USER_HZ ticks, fixed at 100 by the kernel ABI
    Ok(Timestamp::from(ticks * 10_000_000))
}

/// Returns the namespace ids of a given process. Namespaces we cannot
/// read (permissions, missing kernel support) are left at zero.
pub fn get_process_namespaces(pid: Pid) -> Namespaces {
    Namespaces {
        uts: read_namespace_id(pid, "uts"),
        ipc: read_namespace_id(pid, "ipc"),
        mnt: read_namespace_id(pid, "mnt"),
        pid: read_namespace_id(pid, "pid"),
        net: read_namespace_id(pid, "net"),
        time: read_namespace_id(pid, "time"),
        cgroup: read_namespace_id(pid, "cgroup"),
    }
}

fn read_namespace_id(pid: Pid, ns: &str) -> u32 {
    // the link target has the form "uts:[4026531838]"
    fs::read_link(format!("/proc/{pid}/ns/{ns}"))
        .ok()
        .and_then(|target| {
            let target = target.to_string_lossy().into_owned();
            let start = target.find('[')? + 1;
            let end = target.find(']')?;
            target[start..end].parse().ok()
        })
        .unwrap_or(0)
}

pub fn get_running_processes() -> Result<Vec<Pid>, ProcfsError> {
    glob("/proc/[0-9]*")?
        .map(|entry| {
            let entry: String = entry?.to_string_lossy().into();
            let pid = entry.replace("/proc/", "").parse()?;
            Ok(Pid::from_raw(pid))
        })
        .collect()
}

fn get_container_id_from_cgroup(cgroup_info: &str) -> Option<String> {
    if let Some(caps) = RE_CGROUP_DOCKER.captures(cgroup_info) {
        return Some(caps.name("id").unwrap().as_str().to_string());
    }
    if let Some(caps) = RE_CGROUP_LIBPOD.captures(cgroup_info) {
        return Some(caps.name("id").unwrap().as_str().to_string());
    }
    None
}

pub fn get_process_container_id(pid: Pid) -> Result<Option<String>, ProcfsError> {
    if pid.as_raw() == 0 {
        return Ok(None);
    }

    let path = format!("/proc/{pid}/cgroup");
    let file = File::open(&path).map_err(|source| ProcfsError::ReadFile { source, path })?;

    let reader = BufReader::new(file);
    for line in reader.lines().map_while(Result::ok) {
        if let Some(container_id) = get_container_id_from_cgroup(&line) {
            return Ok(Some(container_id));
        }
    }

    Ok(None)
}
