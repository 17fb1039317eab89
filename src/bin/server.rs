//! sockstun daemon
//!
//! Usage: sockstun [OPTIONS]
//!
//! Options:
//!   -c, --config <FILE>    Path to configuration file (JSON or TOML)
//!       --log-file <FILE>  Append logs to this file instead of stderr
//!       --pid-file <FILE>  Where to write the process id
//!   -h, --help             Print help information

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use sockstun::server::{Config, Server};
use sockstun::{DEFAULT_CONFIG_PATH, DEFAULT_PID_FILE};

#[derive(Parser, Debug)]
#[command(name = "sockstun", version, about = "Multi-node encrypted TCP/UDP relay")]
struct Args {
    /// Configuration file (JSON, or TOML with a .toml extension)
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Append logs to this file instead of stderr
    #[arg(long)]
    log_file: Option<PathBuf>,

    /// PID file
    #[arg(long, default_value = DEFAULT_PID_FILE)]
    pid_file: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let config = Config::load(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;

    init_logging(&config, args.log_file.as_deref())?;

    // Ciphers are resolved here, before any socket is bound.
    let server = Server::new(config)?;

    write_pid(&args.pid_file)
        .with_context(|| format!("writing pid file {}", args.pid_file.display()))?;

    tracing::info!(
        nodes = server.config().nodes.len(),
        metrics = server.config().influxdb.is_some(),
        "starting sockstun"
    );

    server.run().await?;
    Ok(())
}

/// RUST_LOG wins when set; otherwise the configured level applies.
fn init_logging(config: &Config, log_file: Option<&Path>) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_filter().to_string()));

    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(false);

    match log_file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("opening log file {}", path.display()))?;
            builder.with_ansi(false).with_writer(Mutex::new(file)).init();
        }
        None => builder.init(),
    }
    Ok(())
}

fn write_pid(path: &Path) -> std::io::Result<()> {
    let mut file = File::create(path)?;
    writeln!(file, "{}", std::process::id())?;
    file.sync_all()
}
