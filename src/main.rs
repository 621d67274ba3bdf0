use std::net::SocketAddr;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use bootlease::memory::{Counters, DefaultResponder, IgnoreList, MemoryInventory, MemoryWorkflows};
use bootlease::server::{DEFAULT_TEMPLATE, UdpReplyWriter};
use bootlease::supervisor::bind_socket;
use bootlease::{Config, DhcpServer, Dispatcher, Error, JobLayer, Leases, Result, Supervisor};

#[derive(Parser)]
#[command(name = "bootlease")]
#[command(author, version, about = "DHCP front end for bare-metal provisioning", long_about = None)]
struct Cli {
    /// Address the DHCP socket binds to.
    #[arg(long, default_value = "0.0.0.0:67")]
    dhcp_addr: SocketAddr,

    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    Run,
    ShowConfig,
}

#[derive(Serialize)]
struct Resolved<'a> {
    dhcp_addr: SocketAddr,
    #[serde(flatten)]
    config: &'a Config,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level)),
        )
        .init();

    match execute(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(error @ Error::RetriesExhausted { .. }) => {
            error!("Fatal: could not start DHCP server: {}", error);
            ExitCode::FAILURE
        }
        Err(error) => {
            error!("{}", error);
            ExitCode::FAILURE
        }
    }
}

async fn execute(cli: Cli) -> Result<()> {
    let config = Config::from_env()?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run(cli.dhcp_addr, config).await,
        Commands::ShowConfig => {
            let resolved = Resolved {
                dhcp_addr: cli.dhcp_addr,
                config: &config,
            };
            println!("{}", serde_json::to_string_pretty(&resolved)?);
            Ok(())
        }
    }
}

async fn run(dhcp_addr: SocketAddr, config: Config) -> Result<()> {
    info!(
        "IP pool: {} - {} ({} addresses), gateway {}",
        config.pool.start,
        config.pool_end(),
        config.pool.range_size,
        config.pool.gateway
    );

    let supervisor = Supervisor::new(config.bind_retry);
    let socket = supervisor
        .run("bind DHCP socket", move || async move { bind_socket(dhcp_addr) })
        .await?;
    let socket = Arc::new(socket);
    info!("DHCP server starting on {}", dhcp_addr);

    let jobs = JobLayer::new(
        Arc::new(MemoryInventory::new()),
        Arc::new(MemoryWorkflows::with_templates([DEFAULT_TEMPLATE])),
        Arc::new(DefaultResponder::new(config.pool.gateway)),
    );
    let dispatcher = Dispatcher::new(
        Arc::new(Leases::new(config.pool)),
        jobs,
        Arc::new(IgnoreList::new(
            config.ignore_ouis.clone(),
            config.ignore_giaddrs.clone(),
        )),
        Arc::new(Counters::new()),
    )
    .with_default_workflows(config.default_workflows);

    let writer = Arc::new(UdpReplyWriter::new(Arc::clone(&socket)));
    let server = DhcpServer::new(socket, dispatcher, writer, config.workers);

    tokio::select! {
        result = server.run() => result,
        _ = tokio::signal::ctrl_c() => {
            info!("Received shutdown signal, stopping server...");
            server.close();
            Ok(())
        }
    }
}
