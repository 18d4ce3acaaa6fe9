use std::path::PathBuf;

use clap::{Args, Parser, Subcommand, ValueEnum};
use serde::{Deserialize, Serialize};
use tracing::Level;

use crate::runtime::conf::{AttachMode, Conf, conf_serde::level};

pub const DEFAULT_SERVER: &str = "http://localhost:4245";
pub const DEFAULT_IMAGE: &str = concat!("ghcr.io/flowscope/flowscope:", env!("CARGO_PKG_VERSION"));

#[derive(Parser, Debug)]
#[command(name = "flowscope", version, about, long_about = None)]
pub struct Cli {
    #[command(flatten)]
    pub global: GlobalArgs,

    #[command(subcommand)]
    pub command: Command,
}

/// Flags shared by every subcommand. Serialized as the top figment layer, so a
/// flag only overrides the config file when it was actually given.
#[derive(Args, Debug, Default, Serialize, Deserialize)]
pub struct GlobalArgs {
    /// Set the path to the configuration file (e.g., "config.yaml").
    #[arg(
        short,
        long,
        value_name = "FILE",
        env = "FLOWSCOPE_CONFIG_PATH",
        global = true
    )]
    #[serde(skip)]
    pub config: Option<PathBuf>,

    /// Set the application's log level (e.g., "debug", "warn").
    #[arg(
        short,
        long,
        value_name = "LEVEL",
        env = "FLOWSCOPE_LOG_LEVEL",
        global = true
    )]
    #[serde(
        default,
        with = "level::option",
        skip_serializing_if = "Option::is_none"
    )]
    pub log_level: Option<Level>,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the node agent: attach the classifier and serve flows.
    Agent(AgentArgs),
    /// Stream flows from an agent.
    Observe(ObserveArgs),
    /// Print the workload-to-workload edges seen by an agent.
    ServiceMap(ServiceMapArgs),
    /// Render or apply the cluster manifests for the agent.
    Install(InstallArgs),
}

#[derive(Args, Debug, Default)]
pub struct AgentArgs {
    /// Attach to this interface only.
    #[arg(long, value_name = "NAME", conflicts_with = "discover")]
    pub interface: Option<String>,

    /// Attach to every matching link and follow link changes.
    #[arg(long)]
    pub discover: bool,

    /// Path to the compiled classifier object.
    #[arg(long, value_name = "PATH")]
    pub ebpf_object: Option<PathBuf>,
}

impl AgentArgs {
    /// Applies the subcommand flags on top of the extracted configuration.
    pub fn apply_to(&self, conf: &mut Conf) {
        if let Some(interface) = &self.interface {
            conf.attach.mode = AttachMode::Fixed;
            conf.attach.interface = interface.clone();
        }
        if self.discover {
            conf.attach.mode = AttachMode::Discover;
        }
        if let Some(path) = &self.ebpf_object {
            conf.ebpf_object_path = path.clone();
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

#[derive(Args, Debug)]
pub struct ObserveArgs {
    /// Agent gRPC endpoint.
    #[arg(long, value_name = "URL", default_value = DEFAULT_SERVER)]
    pub server: String,

    /// Only flows whose source or destination pod lives in this namespace.
    #[arg(long, value_name = "NS")]
    pub namespace: Option<String>,

    /// Only flows with this verdict (FORWARDED or DROPPED).
    #[arg(long, value_name = "VERDICT")]
    pub verdict: Option<String>,

    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,
}

#[derive(Args, Debug)]
pub struct ServiceMapArgs {
    /// Agent gRPC endpoint.
    #[arg(long, value_name = "URL", default_value = DEFAULT_SERVER)]
    pub server: String,

    /// Trailing window in seconds. The agent default applies when omitted.
    #[arg(long, value_name = "SECS")]
    pub window: Option<u32>,

    #[arg(long, value_enum, default_value_t = OutputFormat::Text)]
    pub format: OutputFormat,
}

#[derive(Args, Debug)]
pub struct InstallArgs {
    /// Namespace the agent runs in.
    #[arg(long, value_name = "NS", default_value = "flowscope")]
    pub namespace: String,

    /// Agent container image.
    #[arg(long, value_name = "IMG", default_value = DEFAULT_IMAGE)]
    pub image: String,

    /// Server-side apply to the current cluster instead of printing YAML.
    #[arg(long)]
    pub apply: bool,
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use clap::Parser as _;
    use figment::Jail;
    use tracing::Level;

    use super::*;

    #[test]
    fn parses_global_flags_after_subcommand() {
        Jail::expect_with(|_| {
            let cli = Cli::parse_from([
                "flowscope",
                "agent",
                "--config",
                "/path/to/conf.yaml",
                "--log-level",
                "warn",
            ]);
            assert_eq!(cli.global.config, Some(PathBuf::from("/path/to/conf.yaml")));
            assert_eq!(cli.global.log_level, Some(Level::WARN));
            assert!(matches!(cli.command, Command::Agent(_)));

            Ok(())
        });
    }

    #[test]
    fn parses_global_flags_from_env() {
        Jail::expect_with(|jail| {
            jail.set_env("FLOWSCOPE_CONFIG_PATH", "/tmp/flowscope.yaml");
            jail.set_env("FLOWSCOPE_LOG_LEVEL", "debug");

            let cli = Cli::parse_from(["flowscope", "agent"]);
            assert_eq!(cli.global.config, Some(PathBuf::from("/tmp/flowscope.yaml")));
            assert_eq!(cli.global.log_level, Some(Level::DEBUG));

            Ok(())
        });
    }

    #[test]
    fn log_level_absent_by_default() {
        Jail::expect_with(|_| {
            let cli = Cli::parse_from(["flowscope", "agent"]);
            assert_eq!(cli.global.log_level, None);

            Ok(())
        });
    }

    #[test]
    fn agent_flags_override_conf() {
        let cli = Cli::parse_from([
            "flowscope",
            "agent",
            "--interface",
            "eth1",
            "--ebpf-object",
            "/opt/flowscope/flowscope-ebpf",
        ]);
        let Command::Agent(args) = cli.command else {
            panic!("expected agent subcommand");
        };

        let mut conf = Conf::default();
        conf.attach.mode = AttachMode::Discover;
        args.apply_to(&mut conf);
        assert_eq!(conf.attach.mode, AttachMode::Fixed);
        assert_eq!(conf.attach.interface, "eth1");
        assert_eq!(
            conf.ebpf_object_path,
            PathBuf::from("/opt/flowscope/flowscope-ebpf")
        );
    }

    #[test]
    fn agent_discover_switches_mode() {
        let cli = Cli::parse_from(["flowscope", "agent", "--discover"]);
        let Command::Agent(args) = cli.command else {
            panic!("expected agent subcommand");
        };

        let mut conf = Conf::default();
        args.apply_to(&mut conf);
        assert_eq!(conf.attach.mode, AttachMode::Discover);
        assert_eq!(conf.attach.interface, "cni0");
    }

    #[test]
    fn interface_conflicts_with_discover() {
        let result = Cli::try_parse_from(["flowscope", "agent", "--discover", "--interface", "eth0"]);
        assert!(result.is_err());
    }

    #[test]
    fn observe_defaults() {
        let cli = Cli::parse_from(["flowscope", "observe"]);
        let Command::Observe(args) = cli.command else {
            panic!("expected observe subcommand");
        };
        assert_eq!(args.server, DEFAULT_SERVER);
        assert_eq!(args.namespace, None);
        assert_eq!(args.verdict, None);
        assert_eq!(args.format, OutputFormat::Text);
    }

    #[test]
    fn observe_filters_and_json() {
        let cli = Cli::parse_from([
            "flowscope",
            "observe",
            "--namespace",
            "default",
            "--verdict",
            "DROPPED",
            "--format",
            "json",
        ]);
        let Command::Observe(args) = cli.command else {
            panic!("expected observe subcommand");
        };
        assert_eq!(args.namespace.as_deref(), Some("default"));
        assert_eq!(args.verdict.as_deref(), Some("DROPPED"));
        assert_eq!(args.format, OutputFormat::Json);
    }

    #[test]
    fn service_map_window() {
        let cli = Cli::parse_from(["flowscope", "service-map", "--window", "300"]);
        let Command::ServiceMap(args) = cli.command else {
            panic!("expected service-map subcommand");
        };
        assert_eq!(args.window, Some(300));
    }

    #[test]
    fn install_defaults() {
        let cli = Cli::parse_from(["flowscope", "install"]);
        let Command::Install(args) = cli.command else {
            panic!("expected install subcommand");
        };
        assert_eq!(args.namespace, "flowscope");
        assert_eq!(args.image, DEFAULT_IMAGE);
        assert!(!args.apply);
    }
}
