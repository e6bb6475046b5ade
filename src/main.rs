mod child;
mod config;
mod merge;
mod reaper;
mod sentinel;
mod signals;
mod supervisor;
#[cfg(test)]
mod test_support;

use clap::Parser;
use config::{Config, Overrides, WatchRule};
use std::path::PathBuf;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Exit code for configuration errors, matching clap's usage errors.
const EXIT_CONFIG: i32 = 2;

/// A minimal init for containers: runs one command as its child, reaps
/// zombies, forwards signals, and signals the child when watched files change.
#[derive(Parser, Debug)]
#[command(name = "init-sentinel", version, about)]
pub struct Cli {
    /// File watch rule, ex: --watch "/path/to/file:SIGNAME". Can be specified multiple times.
    #[arg(long = "watch", value_name = "PATH:SIGNAL", value_parser = config::parse_watch_rule)]
    watch: Vec<WatchRule>,

    /// Interval to check files for changes (default: 10s)
    #[arg(long, value_name = "DURATION", value_parser = config::parse_duration)]
    interval: Option<Duration>,

    /// Grace period for the child to shut down before SIGKILL (default: 30s)
    #[arg(long = "stop-timeout", value_name = "DURATION", value_parser = config::parse_duration)]
    stop_timeout: Option<Duration>,

    /// Optional TOML config file with interval, stop_timeout and [[watch]] rules
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Display debug log messages
    #[arg(long)]
    debug: bool,

    /// Command to supervise, followed by its arguments
    #[arg(value_name = "COMMAND", trailing_var_arg = true, num_args = 1..)]
    command: Vec<String>,
}

impl Cli {
    fn into_overrides(self) -> Overrides {
        Overrides {
            config_file: self.config,
            command: self.command,
            watches: self.watch,
            interval: self.interval,
            stop_timeout: self.stop_timeout,
        }
    }
}

/// Log to stdout. `--debug` forces debug level; otherwise `RUST_LOG` or info.
fn init_tracing(debug: bool) {
    let filter = if debug {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stdout)
        .with_target(false)
        .with_thread_ids(false)
        .init();
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_tracing(cli.debug);

    tracing::debug!(?cli, "parsed CLI arguments");

    let config = match Config::resolve(cli.into_overrides()) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, "invalid configuration, exiting");
            std::process::exit(EXIT_CONFIG);
        }
    };

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        pid = std::process::id(),
        watches = config.watches.len(),
        interval_ms = config.interval.as_millis() as u64,
        stop_timeout_ms = config.stop_timeout.as_millis() as u64,
        "init-sentinel starting"
    );

    let code = match supervisor::run(config).await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!(error = %e, "supervision failed");
            e.exit_code()
        }
    };

    std::process::exit(code);
}
