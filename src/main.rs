use std::{path::PathBuf, process::ExitCode};

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use toolgate::{GatewayOptions, GatewayServer};

#[derive(Parser, Debug)]
#[command(name = "toolgate", version, about = "MCP gateway aggregating tool-serving backends")]
struct Cli {
    /// Only connect the named backends. Repeatable; accepts
    /// comma-separated lists.
    #[arg(long = "server", value_name = "NAME[,NAME...]")]
    servers: Vec<String>,

    /// Only expose tools with these original names. Repeatable; accepts
    /// comma-separated lists.
    #[arg(long = "tool", value_name = "NAME[,NAME...]")]
    tools: Vec<String>,

    /// Expand the named groups into the backend filter. Repeatable;
    /// accepts comma-separated lists.
    #[arg(long = "group", value_name = "NAME[,NAME...]")]
    groups: Vec<String>,

    /// Gateway home directory (config, instance records, usage metrics).
    #[arg(long, env = "TOOLGATE_HOME", value_name = "DIR")]
    home: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> ExitCode {
    // stdout carries the upstream MCP stream; logs go to stderr.
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("toolgate=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match run(cli).await {
        Ok(0) => ExitCode::SUCCESS,
        Ok(_) => ExitCode::FAILURE,
        Err(e) => {
            tracing::error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<i32> {
    tracing::info!("Starting toolgate gateway");

    let server = GatewayServer::start(GatewayOptions {
        home: cli.home,
        servers: cli.servers,
        tools: cli.tools,
        groups: cli.groups,
        sweep_interval: None,
    })
    .await
    .context("gateway startup failed")?;

    Ok(server.serve().await)
}
