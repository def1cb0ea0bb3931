//! Lookup services consumed by the correlation engine.
//!
//! Every lookup is a non-blocking probe: it either has the answer now
//! or reports "not yet available" by returning `None`, and the caller
//! retries on its own cadence. Implementations must never wait on
//! I/O; the shipped implementations are plain in-memory caches kept
//! current by whatever watcher owns them.

use std::{collections::HashMap, net::IpAddr, sync::RwLock};

use crate::event::ContainerMetadata;

/// Container and pod metadata by container id.
pub trait MetadataResolver: Send + Sync {
    fn resolve(&self, container_id: &str) -> Option<ContainerMetadata>;
}

/// Reverse hostname resolution for pod addresses.
pub trait HostnameResolver: Send + Sync {
    fn resolve(&self, ip: IpAddr) -> Option<String>;
}

#[derive(Default)]
pub struct MetadataCache {
    entries: RwLock<HashMap<String, ContainerMetadata>>,
}

impl MetadataCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, metadata: ContainerMetadata) {
        self.entries
            .write()
            .unwrap()
            .insert(metadata.id.clone(), metadata);
    }

    pub fn remove(&self, container_id: &str) {
        self.entries.write().unwrap().remove(container_id);
    }
}

impl MetadataResolver for MetadataCache {
    fn resolve(&self, container_id: &str) -> Option<ContainerMetadata> {
        self.entries.read().unwrap().get(container_id).cloned()
    }
}

#[derive(Default)]
pub struct HostnameCache {
    entries: RwLock<HashMap<IpAddr, String>>,
}

impl HostnameCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, ip: IpAddr, hostname: String) {
        self.entries.write().unwrap().insert(ip, hostname);
    }
}

impl HostnameResolver for HostnameCache {
    fn resolve(&self, ip: IpAddr) -> Option<String> {
        self.entries.read().unwrap().get(&ip).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn metadata_probe_misses_then_hits() {
        let cache = MetadataCache::new();
        assert!(cache.resolve("cafe").is_none());
        cache.insert(ContainerMetadata {
            id: "cafe".to_string(),
            name: "web".to_string(),
            image: "nginx:latest".to_string(),
            image_digest: "sha256:0000".to_string(),
            pod: None,
        });
        assert_eq!(cache.resolve("cafe").unwrap().name, "web");
    }

    #[test]
    fn hostname_probe_misses_then_hits() {
        let cache = HostnameCache::new();
        let ip: IpAddr = "10.0.0.7".parse().unwrap();
        assert!(cache.resolve(ip).is_none());
        cache.insert(ip, "web-0.cluster.local".to_string());
        assert_eq!(cache.resolve(ip).unwrap(), "web-0.cluster.local");
    }
}
