use std::io;

use kube::Client;
use tracing::info;

use crate::{
    error::FlowscopeError,
    grpc::{client, pb},
    install::{self, InstallError, InstallOptions},
    runtime::{
        cli::{Cli, Command},
        conf::{Conf, ConfError},
    },
};

pub mod agent;
pub mod cli;
pub mod conf;
pub mod logging;
pub mod tasks;

pub struct Runtime {
    pub cli: Cli,
    pub conf: Conf,
}

impl Runtime {
    /// Extracts the configuration and applies the subcommand flags that
    /// override it.
    pub fn new(cli: Cli) -> Result<Self, ConfError> {
        let mut conf = Conf::new(&cli.global)?;
        if let Command::Agent(args) = &cli.command {
            args.apply_to(&mut conf);
        }
        Ok(Runtime { cli, conf })
    }

    pub async fn run(self) -> Result<(), FlowscopeError> {
        let Runtime { cli, conf } = self;
        match cli.command {
            Command::Agent(_) => agent::run_agent(conf).await,
            Command::Observe(args) => {
                let mut client = client::connect(&args.server).await?;
                let request = pb::GetFlowsRequest {
                    namespace: args.namespace.unwrap_or_default(),
                    verdict: args.verdict.unwrap_or_default(),
                };
                let stop = async {
                    let _ = tokio::signal::ctrl_c().await;
                };
                let mut out = io::stdout();
                client::stream_flows(&mut client, request, args.format, &mut out, stop).await?;
                Ok(())
            }
            Command::ServiceMap(args) => {
                let mut client = client::connect(&args.server).await?;
                let mut out = io::stdout();
                client::print_service_map(&mut client, args.window, args.format, &mut out).await?;
                Ok(())
            }
            Command::Install(args) => {
                let manifests = install::render_manifests(&InstallOptions::from(&args));
                if args.apply {
                    let client = Client::try_default()
                        .await
                        .map_err(|e| InstallError::Client(Box::new(e)))?;
                    install::apply(client, &manifests).await?;
                    info!(
                        event.name = "install.completed",
                        k8s.namespace.name = %args.namespace,
                        manifests = manifests.len(),
                        "manifests applied"
                    );
                } else {
                    let yaml = install::to_yaml(&manifests)?;
                    print!("{yaml}");
                }
                Ok(())
            }
        }
    }
}
