use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, EnvFilter};

use weatherhub::client::{self, station, Client};
use weatherhub::config::Config;
use weatherhub::server::Server;

/// Lamport-stamped aggregation server for weather station readings.
#[derive(Parser)]
#[command(name = "weatherhub", about)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Logging verbosity level (trace, debug, info, warn, error).
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the aggregation server (default).
    Serve {
        /// Listen port, overriding the config file.
        port: Option<u16>,
    },

    /// Submit a station data file to an aggregator.
    Put {
        /// Aggregator address: [http://]host[:port].
        server: String,

        /// File of `key: value` readings; must contain an `id`.
        file: PathBuf,
    },

    /// Print the readings held by an aggregator.
    Get {
        /// Aggregator address: [http://]host[:port].
        server: String,

        /// Only show this station.
        station: Option<String>,
    },

    /// Print version information and exit.
    Version,
}

/// Build-time version info, injected via env at build time.
mod version {
    /// Release version string (set at build time).
    pub const RELEASE: &str = env!("CARGO_PKG_VERSION");

    /// Git commit hash (set at build time via env, or "unknown").
    pub fn git_commit() -> &'static str {
        option_env!("GIT_COMMIT").unwrap_or("unknown")
    }

    /// Full version string with platform info.
    pub fn full() -> String {
        format!(
            "{} (commit: {}, {}/{})",
            RELEASE,
            git_commit(),
            std::env::consts::OS,
            std::env::consts::ARCH,
        )
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Handle version subcommand before anything else.
    if let Some(Command::Version) = &cli.command {
        println!("weatherhub {}", version::full());
        return Ok(());
    }

    // Initialize tracing. Logs go to stderr so `get` output stays clean.
    let filter = EnvFilter::try_new(&cli.log_level)
        .with_context(|| format!("invalid log level: {}", cli.log_level))?;

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    match cli.command.unwrap_or(Command::Serve { port: None }) {
        Command::Serve { port } => {
            let mut cfg = match &cli.config {
                Some(path) => Config::load(path)
                    .with_context(|| format!("loading config from {}", path.display()))?,
                None => Config::default(),
            };
            if let Some(port) = port {
                cfg.listen.port = port;
            }
            cfg.validate()?;

            tracing::info!(
                version = version::RELEASE,
                commit = version::git_commit(),
                "starting weatherhub",
            );

            rt.block_on(serve(cfg))
        }
        Command::Put { server, file } => rt.block_on(put(&server, &file)),
        Command::Get { server, station } => rt.block_on(get(&server, station.as_deref())),
        Command::Version => Ok(()),
    }
}

async fn serve(cfg: Config) -> Result<()> {
    // Set up signal handling.
    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        .context("registering SIGTERM handler")?;

    tokio::spawn(async move {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("received SIGINT, shutting down");
            }
            _ = sigterm.recv() => {
                tracing::info!("received SIGTERM, shutting down");
            }
        }

        let _ = shutdown_tx.send(());
    });

    let mut server = Server::new(cfg)?;
    server.start().await?;

    // Wait for shutdown signal.
    let _ = shutdown_rx.await;

    // Graceful shutdown.
    server.stop().await?;

    tracing::info!("weatherhub stopped");

    Ok(())
}

async fn put(server: &str, file: &std::path::Path) -> Result<()> {
    let addr = client::parse_server(server)?;
    let payload = station::load(file)?;

    let client = Client::new(addr);
    let status = client.put(&payload).await?;

    let verb = if status == 201 { "created" } else { "updated" };
    println!("Station {verb} (status {status}, clock {})", client.clock().read());

    Ok(())
}

async fn get(server: &str, station: Option<&str>) -> Result<()> {
    let addr = client::parse_server(server)?;
    if let Some(id) = station {
        if id.trim().is_empty() {
            bail!("station id must not be empty");
        }
    }

    let client = Client::new(addr);
    let snapshot = client.get().await?;
    print!("{}", client::render(&snapshot, station));

    Ok(())
}
