pub mod conf_serde;

use std::{
    net::Ipv4Addr,
    path::{Path, PathBuf},
    time::Duration,
};

use figment::{
    Figment,
    providers::{Format, Serialized, Yaml},
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::Level;

use crate::runtime::{
    cli::GlobalArgs,
    conf::conf_serde::{duration, level},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Full,
    Json,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AttachMode {
    /// Attach to the single interface named by `attach.interface`.
    #[default]
    Fixed,
    /// Attach to every link matching `attach.patterns` or `attach.kinds`, following
    /// netlink link events.
    Discover,
}

/// Where the TC classifier is attached.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct AttachConf {
    pub mode: AttachMode,
    /// Interface used in `fixed` mode.
    pub interface: String,
    /// Glob patterns matched against link names in `discover` mode.
    pub patterns: Vec<String>,
    /// Link kinds (IFLA_INFO_KIND) attached in `discover` mode.
    pub kinds: Vec<String>,
}

impl Default for AttachConf {
    fn default() -> Self {
        Self {
            mode: AttachMode::Fixed,
            interface: "cni0".to_string(),
            patterns: vec!["veth*".to_string()],
            kinds: vec!["veth".to_string()],
        }
    }
}

/// Tuning for the ingestion loop and its handoff to distribution.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct PipelineConf {
    /// Capacity of the channel between the ingestion loop and the distribution task.
    pub handoff_capacity: usize,
    /// How long the ingestion loop waits on a full handoff channel before dropping.
    #[serde(with = "duration")]
    pub handoff_timeout: Duration,
    #[serde(with = "duration")]
    pub backoff_initial: Duration,
    #[serde(with = "duration")]
    pub backoff_max: Duration,
    /// Consecutive read failures after which ingestion gives up.
    pub max_consecutive_failures: u32,
    #[serde(with = "duration")]
    pub loss_poll_interval: Duration,
}

impl Default for PipelineConf {
    fn default() -> Self {
        Self {
            handoff_capacity: 1024,
            handoff_timeout: Duration::from_secs(1),
            backoff_initial: Duration::from_secs(1),
            backoff_max: Duration::from_secs(30),
            max_consecutive_failures: 5,
            loss_poll_interval: Duration::from_secs(1),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct DistributionConf {
    /// Queue depth of every subscription.
    pub subscriber_capacity: usize,
}

impl Default for DistributionConf {
    fn default() -> Self {
        Self {
            subscriber_capacity: 256,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct KubernetesConf {
    /// Correlate flow endpoints with pods. Without a reachable cluster the agent
    /// falls back to reporting bare addresses.
    pub enabled: bool,
    #[serde(with = "duration")]
    pub watch_reconnect_delay: Duration,
}

impl Default for KubernetesConf {
    fn default() -> Self {
        Self {
            enabled: true,
            watch_reconnect_delay: Duration::from_secs(5),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct GrpcConf {
    /// The network address the gRPC server will listen on.
    pub listen_address: String,
    /// The port the gRPC server will listen on.
    pub port: u16,
}

impl Default for GrpcConf {
    fn default() -> Self {
        Self {
            listen_address: Ipv4Addr::UNSPECIFIED.to_string(),
            port: 4245,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct MetricsConf {
    /// Enable the metrics server.
    pub enabled: bool,
    /// The network address the metrics server will listen on.
    pub listen_address: String,
    /// The port the metrics server will listen on.
    pub port: u16,
}

impl Default for MetricsConf {
    fn default() -> Self {
        Self {
            enabled: true,
            listen_address: Ipv4Addr::UNSPECIFIED.to_string(),
            port: 10250,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct ServiceMapConf {
    pub enabled: bool,
    /// Window used when a request does not name one.
    #[serde(with = "duration")]
    pub default_window: Duration,
    /// How much history is kept; also the largest window a request may ask for.
    #[serde(with = "duration")]
    pub retention: Duration,
}

impl Default for ServiceMapConf {
    fn default() -> Self {
        Self {
            enabled: true,
            default_window: Duration::from_secs(60),
            retention: Duration::from_secs(15 * 60),
        }
    }
}

/// Agent configuration.
///
/// Layered as defaults < YAML file (`--config`) < global CLI flags and their
/// environment variables. Subcommand flags are applied by the caller afterwards.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Conf {
    #[serde(with = "level")]
    pub log_level: Level,
    #[serde(default)]
    pub log_format: LogFormat,

    #[serde(default)]
    pub attach: AttachConf,

    /// Compiled classifier object loaded at startup.
    #[serde(default = "defaults::ebpf_object_path")]
    pub ebpf_object_path: PathBuf,

    #[serde(default)]
    pub pipeline: PipelineConf,
    #[serde(default)]
    pub distribution: DistributionConf,
    #[serde(default)]
    pub kubernetes: KubernetesConf,
    #[serde(default)]
    pub grpc: GrpcConf,
    #[serde(default)]
    pub metrics: MetricsConf,
    #[serde(default)]
    pub servicemap: ServiceMapConf,

    /// Upper bound for each stage of graceful shutdown.
    #[serde(default = "defaults::shutdown_timeout", with = "duration")]
    pub shutdown_timeout: Duration,

    #[serde(skip)]
    pub config_path: Option<PathBuf>,
}

impl Default for Conf {
    fn default() -> Self {
        Self {
            log_level: Level::INFO,
            log_format: LogFormat::default(),
            attach: AttachConf::default(),
            ebpf_object_path: defaults::ebpf_object_path(),
            pipeline: PipelineConf::default(),
            distribution: DistributionConf::default(),
            kubernetes: KubernetesConf::default(),
            grpc: GrpcConf::default(),
            metrics: MetricsConf::default(),
            servicemap: ServiceMapConf::default(),
            shutdown_timeout: defaults::shutdown_timeout(),
            config_path: None,
        }
    }
}

mod defaults {
    use std::{path::PathBuf, time::Duration};

    pub fn ebpf_object_path() -> PathBuf {
        PathBuf::from(env!("EBPF_PROGRAM_PATH"))
    }

    pub fn shutdown_timeout() -> Duration {
        Duration::from_secs(5)
    }
}

impl Conf {
    /// Builds the configuration from defaults, the optional YAML file and the
    /// global CLI flags, in that priority order.
    ///
    /// # Errors
    ///
    /// * `ConfError::NoConfigFile` - the `--config` path does not exist.
    /// * `ConfError::InvalidConfigPath` - the path is not a regular file.
    /// * `ConfError::InvalidExtension` - the file is not `.yaml` or `.yml`.
    /// * `ConfError::Extraction` - a value failed to parse.
    pub fn new(global: &GlobalArgs) -> Result<Self, ConfError> {
        let mut figment = Figment::new().merge(Serialized::defaults(Conf::default()));

        if let Some(config_path) = &global.config {
            validate_config_path(config_path)?;
            figment = figment.merge(Yaml::file(config_path));
        }

        figment = figment.merge(Serialized::defaults(global));

        let mut conf: Conf = figment.extract()?;
        conf.config_path = global.config.clone();
        Ok(conf)
    }
}

/// Validates that the given path points to an existing file with a supported extension.
fn validate_config_path(path: &Path) -> Result<(), ConfError> {
    if !path.is_file() {
        if path.exists() {
            return Err(ConfError::InvalidConfigPath(
                path.to_string_lossy().into_owned(),
            ));
        }
        return Err(ConfError::NoConfigFile(path.to_string_lossy().into_owned()));
    }

    match path.extension().and_then(|s| s.to_str()) {
        Some("yaml") | Some("yml") => Ok(()),
        Some(ext) => Err(ConfError::InvalidExtension(ext.to_string())),
        None => Err(ConfError::InvalidExtension("none".to_string())),
    }
}

#[derive(Debug, Error)]
pub enum ConfError {
    #[error("config file '{0}' does not exist")]
    NoConfigFile(String),

    #[error("path '{0}' is not a valid file")]
    InvalidConfigPath(String),

    #[error("invalid file extension '.{0}', expected 'yaml' or 'yml'")]
    InvalidExtension(String),

    #[error("configuration error: {0}")]
    Extraction(#[from] Box<figment::Error>),
}

impl From<figment::Error> for ConfError {
    fn from(e: figment::Error) -> Self {
        ConfError::Extraction(Box::new(e))
    }
}
