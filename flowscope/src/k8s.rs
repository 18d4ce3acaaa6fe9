//! Workload identity for flow endpoints.
//!
//! [`cache::WorkloadCache`] maps pod addresses to [`WorkloadInfo`]; the pod
//! watcher in [`watcher`] is its only writer.

pub mod cache;
pub mod error;
pub mod watcher;

use std::{collections::BTreeMap, fmt, net::IpAddr};

use k8s_openapi::api::core::v1::Pod;

pub use cache::WorkloadCache;
pub use error::K8sError;

/// Identity attached to one side of a flow.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct WorkloadInfo {
    pub name: String,
    pub namespace: String,
    /// Name of the first owner reference (e.g. a ReplicaSet).
    pub workload_name: Option<String>,
    pub workload_kind: Option<String>,
    pub labels: BTreeMap<String, String>,
}

impl WorkloadInfo {
    pub fn key(&self) -> ObjectKey {
        ObjectKey {
            namespace: self.namespace.clone(),
            name: self.name.clone(),
        }
    }
}

/// `namespace/name` of a pod.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ObjectKey {
    pub namespace: String,
    pub name: String,
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// The parts of a pod the cache cares about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PodSnapshot {
    pub info: WorkloadInfo,
    /// Absent while the pod is pending or after its address was released.
    pub ip: Option<IpAddr>,
}

impl PodSnapshot {
    pub fn key(&self) -> ObjectKey {
        self.info.key()
    }

    pub fn from_pod(pod: &Pod) -> Self {
        let meta = &pod.metadata;
        let owner = meta
            .owner_references
            .as_ref()
            .and_then(|refs| refs.first());

        let ip = pod
            .status
            .as_ref()
            .and_then(|s| s.pod_ip.as_deref())
            .filter(|ip| !ip.is_empty())
            .and_then(|ip| ip.parse::<IpAddr>().ok());

        Self {
            info: WorkloadInfo {
                name: meta.name.clone().unwrap_or_default(),
                namespace: meta.namespace.clone().unwrap_or_default(),
                workload_name: owner.map(|o| o.name.clone()),
                workload_kind: owner.map(|o| o.kind.clone()),
                labels: meta.labels.clone().unwrap_or_default(),
            },
            ip,
        }
    }
}

/// A change to apply to the cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    Upsert(PodSnapshot),
    Delete(PodSnapshot),
    /// Full listing after a (re)connect; replaces the cache contents.
    Restarted(Vec<PodSnapshot>),
}

#[cfg(test)]
pub(crate) mod test_pods {
    use std::collections::BTreeMap;

    use k8s_openapi::{
        api::core::v1::{Pod, PodStatus},
        apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference},
    };

    /// Creates a test pod owned by a ReplicaSet named `<name>-rs`.
    pub fn create_test_pod(name: &str, namespace: &str, ip: Option<&str>) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some(namespace.to_string()),
                labels: Some(BTreeMap::from([("app".to_string(), name.to_string())])),
                owner_references: Some(vec![OwnerReference {
                    api_version: "apps/v1".to_string(),
                    kind: "ReplicaSet".to_string(),
                    name: format!("{name}-rs"),
                    uid: format!("{name}-rs-uid"),
                    ..Default::default()
                }]),
                uid: Some(format!("{name}-uid")),
                ..Default::default()
            },
            status: Some(PodStatus {
                pod_ip: ip.map(str::to_string),
                ..Default::default()
            }),
            ..Default::default()
        }
    }
}
