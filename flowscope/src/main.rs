use clap::Parser;
use flowscope::runtime::{Runtime, cli::Cli, logging::init_tracing};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let runtime = Runtime::new(Cli::parse())?;
    init_tracing(&runtime.conf);

    runtime.run().await?;
    Ok(())
}
