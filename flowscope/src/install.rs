//! Cluster manifests for the node agent.
//!
//! [`render_manifests`] builds the objects with `k8s_openapi` types; they are
//! either printed as a multi-document YAML stream or server-side applied with
//! field manager `flowscope`.

use std::{collections::BTreeMap, fmt::Debug};

use k8s_openapi::{
    api::{
        apps::v1::{DaemonSet, DaemonSetSpec},
        core::v1::{
            Container, ContainerPort, EnvVar, HostPathVolumeSource, Namespace, PodSpec,
            PodTemplateSpec, SecurityContext, ServiceAccount, Toleration, Volume, VolumeMount,
        },
        rbac::v1::{ClusterRole, ClusterRoleBinding, PolicyRule, RoleRef, Subject},
    },
    apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta},
};
use kube::{
    Api, Client, Resource, ResourceExt,
    api::{Patch, PatchParams},
};
use serde::{Serialize, de::DeserializeOwned};
use thiserror::Error;
use tracing::info;

use crate::runtime::cli::InstallArgs;

pub const FIELD_MANAGER: &str = "flowscope";
const APP_NAME: &str = "flowscope";
const GRPC_PORT: i32 = 4245;
const METRICS_PORT: i32 = 10250;

#[derive(Debug, Error)]
pub enum InstallError {
    #[error("failed to render manifests")]
    Render(#[from] serde_yaml::Error),

    #[error("failed to connect to the cluster")]
    Client(#[source] Box<kube::Error>),

    #[error("failed to apply {kind} '{name}'")]
    Apply {
        kind: &'static str,
        name: String,
        #[source]
        source: Box<kube::Error>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallOptions {
    pub namespace: String,
    pub image: String,
}

impl From<&InstallArgs> for InstallOptions {
    fn from(args: &InstallArgs) -> Self {
        Self {
            namespace: args.namespace.clone(),
            image: args.image.clone(),
        }
    }
}

#[derive(Debug, Clone)]
pub enum Manifest {
    Namespace(Namespace),
    ServiceAccount(ServiceAccount),
    ClusterRole(ClusterRole),
    ClusterRoleBinding(ClusterRoleBinding),
    DaemonSet(DaemonSet),
}

impl Manifest {
    pub fn kind(&self) -> &'static str {
        match self {
            Manifest::Namespace(_) => "Namespace",
            Manifest::ServiceAccount(_) => "ServiceAccount",
            Manifest::ClusterRole(_) => "ClusterRole",
            Manifest::ClusterRoleBinding(_) => "ClusterRoleBinding",
            Manifest::DaemonSet(_) => "DaemonSet",
        }
    }

    pub fn name(&self) -> String {
        match self {
            Manifest::Namespace(o) => o.name_any(),
            Manifest::ServiceAccount(o) => o.name_any(),
            Manifest::ClusterRole(o) => o.name_any(),
            Manifest::ClusterRoleBinding(o) => o.name_any(),
            Manifest::DaemonSet(o) => o.name_any(),
        }
    }

    pub fn to_yaml(&self) -> Result<String, serde_yaml::Error> {
        match self {
            Manifest::Namespace(o) => serde_yaml::to_string(o),
            Manifest::ServiceAccount(o) => serde_yaml::to_string(o),
            Manifest::ClusterRole(o) => serde_yaml::to_string(o),
            Manifest::ClusterRoleBinding(o) => serde_yaml::to_string(o),
            Manifest::DaemonSet(o) => serde_yaml::to_string(o),
        }
    }
}

fn labels() -> BTreeMap<String, String> {
    BTreeMap::from([
        ("app.kubernetes.io/name".to_string(), APP_NAME.to_string()),
        (
            "app.kubernetes.io/component".to_string(),
            "agent".to_string(),
        ),
    ])
}

fn metadata(name: &str, namespace: Option<&str>) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: namespace.map(str::to_string),
        labels: Some(labels()),
        ..Default::default()
    }
}

fn host_path_volume(name: &str, path: &str) -> Volume {
    Volume {
        name: name.to_string(),
        host_path: Some(HostPathVolumeSource {
            path: path.to_string(),
            type_: Some("Directory".to_string()),
        }),
        ..Default::default()
    }
}

fn daemon_set(opts: &InstallOptions) -> DaemonSet {
    let container = Container {
        name: APP_NAME.to_string(),
        image: Some(opts.image.clone()),
        args: Some(vec!["agent".to_string(), "--discover".to_string()]),
        env: Some(vec![EnvVar {
            name: "FLOWSCOPE_LOG_LEVEL".to_string(),
            value: Some("info".to_string()),
            ..Default::default()
        }]),
        ports: Some(vec![
            ContainerPort {
                name: Some("grpc".to_string()),
                container_port: GRPC_PORT,
                ..Default::default()
            },
            ContainerPort {
                name: Some("metrics".to_string()),
                container_port: METRICS_PORT,
                ..Default::default()
            },
        ]),
        security_context: Some(SecurityContext {
            privileged: Some(true),
            ..Default::default()
        }),
        volume_mounts: Some(vec![
            VolumeMount {
                name: "bpffs".to_string(),
                mount_path: "/sys/fs/bpf".to_string(),
                ..Default::default()
            },
            VolumeMount {
                name: "sys-kernel-debug".to_string(),
                mount_path: "/sys/kernel/debug".to_string(),
                ..Default::default()
            },
        ]),
        ..Default::default()
    };

    DaemonSet {
        metadata: metadata(APP_NAME, Some(&opts.namespace)),
        spec: Some(DaemonSetSpec {
            selector: LabelSelector {
                match_labels: Some(labels()),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels()),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    service_account_name: Some(APP_NAME.to_string()),
                    host_network: Some(true),
                    dns_policy: Some("ClusterFirstWithHostNet".to_string()),
                    tolerations: Some(vec![Toleration {
                        operator: Some("Exists".to_string()),
                        ..Default::default()
                    }]),
                    containers: vec![container],
                    volumes: Some(vec![
                        host_path_volume("bpffs", "/sys/fs/bpf"),
                        host_path_volume("sys-kernel-debug", "/sys/kernel/debug"),
                    ]),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Namespace, ServiceAccount, RBAC granting read access to pods, and the
/// privileged host-network DaemonSet, in apply order.
pub fn render_manifests(opts: &InstallOptions) -> Vec<Manifest> {
    let namespace = Namespace {
        metadata: metadata(&opts.namespace, None),
        ..Default::default()
    };

    let service_account = ServiceAccount {
        metadata: metadata(APP_NAME, Some(&opts.namespace)),
        ..Default::default()
    };

    let cluster_role = ClusterRole {
        metadata: metadata(APP_NAME, None),
        rules: Some(vec![PolicyRule {
            api_groups: Some(vec![String::new()]),
            resources: Some(vec!["pods".to_string()]),
            verbs: vec!["get".to_string(), "list".to_string(), "watch".to_string()],
            ..Default::default()
        }]),
        ..Default::default()
    };

    let binding = ClusterRoleBinding {
        metadata: metadata(APP_NAME, None),
        role_ref: RoleRef {
            api_group: "rbac.authorization.k8s.io".to_string(),
            kind: "ClusterRole".to_string(),
            name: APP_NAME.to_string(),
        },
        subjects: Some(vec![Subject {
            kind: "ServiceAccount".to_string(),
            name: APP_NAME.to_string(),
            namespace: Some(opts.namespace.clone()),
            ..Default::default()
        }]),
    };

    vec![
        Manifest::Namespace(namespace),
        Manifest::ServiceAccount(service_account),
        Manifest::ClusterRole(cluster_role),
        Manifest::ClusterRoleBinding(binding),
        Manifest::DaemonSet(daemon_set(opts)),
    ]
}

/// Multi-document YAML stream.
pub fn to_yaml(manifests: &[Manifest]) -> Result<String, InstallError> {
    let mut out = String::new();
    for manifest in manifests {
        out.push_str("---\n");
        out.push_str(&manifest.to_yaml()?);
    }
    Ok(out)
}

async fn apply_one<K>(api: Api<K>, kind: &'static str, object: &K) -> Result<(), InstallError>
where
    K: Resource + Clone + Debug + Serialize + DeserializeOwned,
{
    let name = object.name_any();
    api.patch(
        &name,
        &PatchParams::apply(FIELD_MANAGER).force(),
        &Patch::Apply(object),
    )
    .await
    .map_err(|e| InstallError::Apply {
        kind,
        name: name.clone(),
        source: Box::new(e),
    })?;
    info!(
        event.name = "install.applied",
        k8s.resource.kind = kind,
        k8s.resource.name = %name,
        "manifest applied"
    );
    Ok(())
}

/// Server-side applies `manifests` in order.
pub async fn apply(client: Client, manifests: &[Manifest]) -> Result<(), InstallError> {
    for manifest in manifests {
        let kind = manifest.kind();
        match manifest {
            Manifest::Namespace(o) => apply_one(Api::all(client.clone()), kind, o).await?,
            Manifest::ClusterRole(o) => apply_one(Api::all(client.clone()), kind, o).await?,
            Manifest::ClusterRoleBinding(o) => {
                apply_one(Api::all(client.clone()), kind, o).await?
            }
            Manifest::ServiceAccount(o) => {
                let ns = o.namespace().unwrap_or_default();
                apply_one(Api::namespaced(client.clone(), &ns), kind, o).await?
            }
            Manifest::DaemonSet(o) => {
                let ns = o.namespace().unwrap_or_default();
                apply_one(Api::namespaced(client.clone(), &ns), kind, o).await?
            }
        }
    }
    Ok(())
}
