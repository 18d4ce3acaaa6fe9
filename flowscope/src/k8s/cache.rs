//! Address to workload correlation.

use std::{collections::HashSet, net::IpAddr, sync::Arc};

use dashmap::DashMap;
use tracing::trace;

use crate::{
    k8s::{ObjectKey, PodSnapshot, WatchEvent, WorkloadInfo},
    metrics::registry,
};

/// At most one live [`WorkloadInfo`] per address.
///
/// Lookups are lock-free reads and may run from any task. All writes go
/// through [`WorkloadCache::apply`], called by a single watch consumer, so the
/// two maps never disagree for longer than one `apply` call.
#[derive(Debug, Default)]
pub struct WorkloadCache {
    by_ip: DashMap<IpAddr, Arc<WorkloadInfo>>,
    // last address each object was seen with
    by_object: DashMap<ObjectKey, IpAddr>,
}

impl WorkloadCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the workload currently holding `ip`. A miss is normal: host
    /// network traffic, services and other nodes are never in the cache.
    pub fn lookup(&self, ip: &IpAddr) -> Option<Arc<WorkloadInfo>> {
        let found = self.by_ip.get(ip).map(|entry| Arc::clone(entry.value()));
        let result = if found.is_some() { "hit" } else { "miss" };
        registry::K8S_CACHE_LOOKUPS_TOTAL
            .with_label_values(&[result])
            .inc();
        found
    }

    pub fn apply(&self, event: WatchEvent) {
        match event {
            WatchEvent::Upsert(snapshot) => self.upsert(snapshot),
            WatchEvent::Delete(snapshot) => self.delete(snapshot),
            WatchEvent::Restarted(snapshots) => self.resync(snapshots),
        }
        registry::K8S_CACHE_ENTRIES.set(self.by_ip.len() as i64);
    }

    pub fn len(&self) -> usize {
        self.by_ip.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_ip.is_empty()
    }

    fn upsert(&self, snapshot: PodSnapshot) {
        let key = snapshot.key();
        let previous = self.by_object.get(&key).map(|entry| *entry.value());

        if let Some(previous) = previous {
            if snapshot.ip != Some(previous) {
                // only if the old address was not already taken over by another pod
                self.by_ip.remove_if(&previous, |_, info| {
                    info.namespace == key.namespace && info.name == key.name
                });
                trace!(
                    event.name = "k8s.cache.address_moved",
                    k8s.pod.name = %key,
                    k8s.pod.previous_ip = %previous,
                    "pod address changed"
                );
            }
        }

        match snapshot.ip {
            Some(ip) => {
                self.by_ip.insert(ip, Arc::new(snapshot.info));
                self.by_object.insert(key, ip);
            }
            None => {
                self.by_object.remove(&key);
            }
        }
    }

    fn delete(&self, snapshot: PodSnapshot) {
        let key = snapshot.key();
        let last_known = self.by_object.remove(&key).map(|(_, ip)| ip);

        if let Some(ip) = snapshot.ip.or(last_known) {
            self.by_ip.remove(&ip);
            trace!(
                event.name = "k8s.cache.removed",
                k8s.pod.name = %key,
                k8s.pod.ip = %ip,
                "pod removed from cache"
            );
        }
    }

    fn resync(&self, snapshots: Vec<PodSnapshot>) {
        let mut live_ips = HashSet::with_capacity(snapshots.len());
        let mut live_objects = HashSet::with_capacity(snapshots.len());

        for snapshot in snapshots {
            let key = snapshot.key();
            if let Some(ip) = snapshot.ip {
                live_ips.insert(ip);
                live_objects.insert(key.clone());
                self.by_ip.insert(ip, Arc::new(snapshot.info));
                self.by_object.insert(key, ip);
            }
        }

        self.by_ip.retain(|ip, _| live_ips.contains(ip));
        self.by_object.retain(|key, _| live_objects.contains(key));
    }
}
