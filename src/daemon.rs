use std::{collections::HashMap, net::IpAddr, path::Path, sync::Arc};

use anyhow::{Context, Result};
use kernel_common::{Credentials, ExecveMsg, Pid, ProcessKey, procfs};
use kestrel_core::{
    ContainerMetadata, CorrelationConfig, CorrelationEngine, ShutdownSignal,
    lookup::{HostnameCache, MetadataCache},
};
use serde::Deserialize;

use crate::{cli::Options, config::KestrelConfig, output, replay};

/// Section of the INI file holding the engine settings.
const CORRELATION_CONFIG: &str = "correlation";

pub async fn run(options: &Options) -> Result<()> {
    log::trace!("Kestrel Daemon Options: {:?}", options);

    let config = match &options.config_file {
        Some(custom_file) => KestrelConfig::with_custom_file(custom_file)?,
        None => KestrelConfig::new()?,
    };
    let correlation_config = CorrelationConfig::try_from(&config.module_config(CORRELATION_CONFIG))
        .context("invalid correlation configuration")?;

    let metadata = Arc::new(MetadataCache::new());
    let hostnames = Arc::new(HostnameCache::new());
    if let Some(path) = &options.metadata {
        let loaded = load_metadata_snapshot(path, &metadata, &hostnames)?;
        log::info!("loaded metadata for {loaded} containers");
    }

    let engine = Arc::new(CorrelationEngine::new(
        correlation_config,
        metadata,
        hostnames,
    ));

    if !options.no_seed {
        let seeded = seed_from_procfs(&engine);
        log::info!("seeded {seeded} running processes from procfs");
    }

    let (_listener_id, events) = engine.add_listener();
    let printer = tokio::spawn(output::print_events(events, options.output));

    let (shutdown_tx, shutdown_rx) = ShutdownSignal::new();
    let sweeper = tokio::spawn({
        let engine = engine.clone();
        async move { engine.run(shutdown_rx).await }
    });

    tokio::select! {
        result = replay::feed(&engine, options.replay.as_deref()) => {
            let accepted = result?;
            log::info!("replay source exhausted after {accepted} messages");
        }
        _ = tokio::signal::ctrl_c() => log::trace!("SIGINT received"),
    }

    log::info!("Terminating Kestrel Daemon...");
    shutdown_tx.send_signal();
    sweeper.await.context("sweep task failed")?;

    let stats = engine.stats();
    log::info!(
        "{} processes tracked, {} deferred, {} invalid, {} degraded, {} identity collisions",
        engine.process_count(),
        engine.pending_len(),
        stats.invalid_msgs,
        stats.degraded_events,
        stats.duplicate_keys,
    );

    // closing the engine ends the printer's channel
    drop(engine);
    printer.await.context("printer task failed")?;
    Ok(())
}

#[derive(Deserialize)]
struct MetadataSnapshot {
    #[serde(default)]
    containers: Vec<ContainerMetadata>,
    #[serde(default)]
    hostnames: HashMap<IpAddr, String>,
}

fn load_metadata_snapshot(
    path: &Path,
    metadata: &MetadataCache,
    hostnames: &HostnameCache,
) -> Result<usize> {
    let data = std::fs::read_to_string(path)
        .with_context(|| format!("reading metadata snapshot {}", path.display()))?;
    let snapshot: MetadataSnapshot = serde_json::from_str(&data)
        .with_context(|| format!("parsing metadata snapshot {}", path.display()))?;
    let count = snapshot.containers.len();
    for container in snapshot.containers {
        metadata.insert(container);
    }
    for (ip, hostname) in snapshot.hostnames {
        hostnames.insert(ip, hostname);
    }
    Ok(count)
}

/// Scans procfs and inserts the already-running processes, oldest
/// first so parents are linked before their children. Seeded records
/// emit no events; only live traffic does.
fn seed_from_procfs(engine: &Arc<CorrelationEngine>) -> usize {
    let pids = match procfs::get_running_processes() {
        Ok(pids) => pids,
        Err(err) => {
            log::warn!("procfs scan failed: {err}");
            return 0;
        }
    };
    let mut msgs: Vec<ExecveMsg> = pids.into_iter().filter_map(seed_msg).collect();
    msgs.sort_by_key(|msg| msg.process.ktime);

    let mut seeded = 0;
    for msg in msgs {
        match engine.seed_process(msg) {
            Ok(()) => seeded += 1,
            Err(err) => log::debug!("skipping procfs entry: {err}"),
        }
    }
    seeded
}

/// Builds a synthetic execve message for a running process. Kernel
/// threads carry no executable image and are skipped.
fn seed_msg(pid: Pid) -> Option<ExecveMsg> {
    let ktime = procfs::get_process_start_ktime(pid).ok()?;
    let filename = procfs::get_process_image(pid)
        .ok()?
        .to_string_lossy()
        .into_owned();
    let parent = procfs::get_process_parent_pid(pid)
        .ok()
        .filter(|ppid| ppid.as_raw() > 0)
        .and_then(|ppid| {
            let ktime = procfs::get_process_start_ktime(ppid).ok()?;
            Some(ProcessKey::new(ppid.as_raw(), ktime))
        })
        .unwrap_or(ProcessKey::new(0, 0u64));
    let uid = procfs::get_process_user_id(pid)
        .map(|uid| uid.as_raw())
        .unwrap_or(0);
    let args = procfs::get_process_command_line(pid)
        .ok()
        .map(|argv| argv.into_iter().skip(1).collect::<Vec<_>>().join("\0"))
        .unwrap_or_default();
    let container_id = procfs::get_process_container_id(pid)
        .ok()
        .flatten()
        .unwrap_or_default();

    Some(ExecveMsg {
        process: ProcessKey::new(pid.as_raw(), ktime),
        parent,
        creds: Credentials { uid, auid: uid },
        filename,
        args,
        namespaces: procfs::get_process_namespaces(pid),
        cgroup_id: 0,
        container_id,
    })
}
