//! AMF Sidecar - health, registration and cnode plumbing for an AMF node
//!
//! Runs next to the AMF process and speaks the small protobuf-over-TCP
//! protocols the rest of the core network expects from it.

mod config;
mod network;
mod protocol;

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use config::Config;
use network::{
    probe_health, start_all, stop_all, CnodeClient, HealthServer, MockCnodeOptions, MockCnodeServer,
    Registrar, Sidecar,
};

/// AMF Sidecar - health and control-plane sidecars for an AMF node
#[derive(Parser)]
#[command(name = "amf-sidecar")]
#[command(author = "AMF Sidecar Contributors")]
#[command(version = "0.1.0")]
#[command(
    about = "Health server, registration and cnode client for an AMF node",
    long_about = None
)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the sidecars until Ctrl+C
    Run,

    /// Show current configuration
    Config {
        /// Generate sample configuration
        #[arg(long)]
        generate: bool,

        /// Write to this path instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Send one health check and print the status
    Probe {
        /// Health server host
        #[arg(default_value = "127.0.0.1")]
        host: String,

        /// Health server port
        #[arg(short, long, default_value_t = protocol::DEFAULT_HEALTH_PORT)]
        port: u16,

        /// Overall deadline in milliseconds
        #[arg(long, default_value_t = 2000)]
        timeout_ms: u64,
    },

    /// Play the cnode side against a running cnode client
    MockCnode {
        /// Port to listen on
        #[arg(short, long, default_value_t = protocol::DEFAULT_CNODE_PORT)]
        port: u16,

        /// Seconds between health checks
        #[arg(short, long, default_value_t = 2)]
        interval: u64,

        /// Health checks per session (0 = until the client hangs up)
        #[arg(short = 'n', long, default_value_t = 3)]
        count: u32,

        /// Keep accepting sessions instead of exiting after one
        #[arg(long = "loop")]
        keep_accepting: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let mut config = if let Some(config_path) = &cli.config {
        Config::load(config_path)?
    } else {
        Config::load_default().unwrap_or_default()
    };
    config.apply_process_env();

    // Initialize logging
    let filter = if let Ok(filter) = EnvFilter::try_from_default_env() {
        filter
    } else if let Some(directives) = &config.general.log_filter {
        EnvFilter::new(directives)
    } else if cli.verbose || config.general.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    match cli.command {
        Commands::Run => {
            run_sidecars(config).await?;
        }
        Commands::Config { generate, output } => {
            if generate {
                let sample = config::generate_sample_config();
                if let Some(path) = output {
                    std::fs::write(&path, &sample)?;
                    println!("Configuration written to: {}", path.display());
                } else {
                    println!("{}", sample);
                }
            } else if let Some(path) = output {
                config.save(&path)?;
                println!("Configuration written to: {}", path.display());
            } else {
                println!("{}", toml::to_string_pretty(&config)?);
            }
        }
        Commands::Probe {
            host,
            port,
            timeout_ms,
        } => {
            let report = probe_health(&host, port, Duration::from_millis(timeout_ms)).await?;
            println!(
                "{}:{} status={} ({} ms)",
                host,
                port,
                report.describe(),
                report.elapsed.as_millis()
            );
            if !report.is_serving() {
                anyhow::bail!("{}:{} is not serving", host, port);
            }
        }
        Commands::MockCnode {
            port,
            interval,
            count,
            keep_accepting,
        } => {
            let options = MockCnodeOptions {
                interval: Duration::from_secs(interval),
                count,
                keep_accepting,
                ..Default::default()
            };
            run_mock_cnode(port, options).await?;
        }
    }

    Ok(())
}

/// Run the health server and cnode client, register, wait for Ctrl+C
async fn run_sidecars(config: Config) -> anyhow::Result<()> {
    let mut sidecars: Vec<Box<dyn Sidecar>> = vec![
        Box::new(HealthServer::new(config.server.clone())),
        Box::new(CnodeClient::new(config.cnode.clone())),
    ];

    start_all(&mut sidecars).await?;

    // Registration only makes sense once the health server answers
    let registrar = Registrar::new(&config.server);
    if registrar.send_registration().is_some() {
        tracing::debug!("Registration triggered: {:?}", registrar.request());
    }

    for sidecar in &sidecars {
        tracing::info!(
            "{}: {}",
            sidecar.name(),
            if sidecar.is_running() { "running" } else { "disabled" }
        );
    }
    println!("AMF sidecars running. Press Ctrl+C to stop.");

    tokio::signal::ctrl_c().await?;
    println!("\nShutting down...");

    stop_all(&mut sidecars).await;
    tracing::info!("Sidecars stopped");

    Ok(())
}

/// Serve the mock cnode until its sessions are done
async fn run_mock_cnode(port: u16, options: MockCnodeOptions) -> anyhow::Result<()> {
    let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port);
    let server = MockCnodeServer::bind(addr).await?;
    println!(
        "Mock cnode listening on {} ({} checks every {:?})",
        server.local_addr()?,
        options.count,
        options.interval
    );

    let passed = tokio::select! {
        passed = server.run(&options) => passed,
        _ = tokio::signal::ctrl_c() => {
            println!("\nInterrupted");
            return Ok(());
        }
    };

    if passed {
        println!("PASS");
        Ok(())
    } else {
        anyhow::bail!("FAIL")
    }
}
