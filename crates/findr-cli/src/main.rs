//! FINDR CLI - drives KLIP reduction runs over a worker pool.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Mutex;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use tracing::error;
use tracing_subscriber::EnvFilter;

use findr_control_plane::queue::DEFAULT_PORT;
use findr_control_plane::{summarize_run, Config, QueueConfig, RunMode};

/// FINDR - resumable KLIP reduction runs
#[derive(Parser)]
#[command(name = "findr")]
#[command(about = "Run KLIP reductions over a worker pool", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start or resume a run from a manifest
    Run(RunArgs),

    /// Summarize a run from its logs
    Status {
        /// Prefix of the run logs
        #[arg(long, default_value = "run")]
        prefix: String,

        /// Retry limit used to classify failed tasks
        #[arg(long, default_value_t = 0)]
        retry_failed: u32,

        /// Print the summary as JSON
        #[arg(long)]
        json: bool,
    },
}

#[derive(Args)]
struct RunArgs {
    /// Manifest of `<config> <expected_output>` lines
    manifest: PathBuf,

    /// Resume the run recorded under --prefix instead of starting a new one
    #[arg(long)]
    resume: bool,

    /// Prefix of the run logs
    #[arg(long, default_value = "run")]
    prefix: String,

    /// KLIP reduction command or path
    #[arg(long, default_value = "klipReduce")]
    klip_path: String,

    /// Failures allowed per task before it is given up on
    #[arg(long, default_value_t = 0)]
    retry_failed: u32,

    /// Write status messages to this file instead of stdout
    #[arg(long)]
    output: Option<PathBuf>,

    /// Completed outputs per archive batch
    #[arg(long, default_value_t = 100)]
    compress_threshold: usize,

    /// Archive prefix; batches are written as <batch-root><N>.tar.gz
    #[arg(long, default_value = "batch")]
    batch_root: PathBuf,

    /// Preferred queue port
    #[arg(long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Worker slots (defaults to the number of CPUs)
    #[arg(long)]
    workers: Option<usize>,

    /// Seconds to wait for a finished task per cycle
    #[arg(long, default_value_t = 5)]
    wait_timeout: u64,

    /// Wait cycles between status lines
    #[arg(long, default_value_t = 10)]
    status_every: u32,

    /// Record per-task resource usage
    #[arg(long)]
    monitor: bool,
}

impl RunArgs {
    fn into_config(self) -> Config {
        let mut queue = QueueConfig::for_prefix(&self.prefix);
        queue.preferred_port = self.port;
        queue.monitor = self.monitor;
        if let Some(workers) = self.workers {
            queue.workers = workers;
        }

        Config {
            manifest: self.manifest,
            prefix: self.prefix,
            mode: if self.resume {
                RunMode::Resume
            } else {
                RunMode::Fresh
            },
            klip_path: self.klip_path,
            retry_limit: self.retry_failed,
            compress_threshold: self.compress_threshold,
            batch_root: self.batch_root,
            wait_timeout: Duration::from_secs(self.wait_timeout),
            status_every: self.status_every,
            queue,
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    let output = match &cli.command {
        Commands::Run(args) => args.output.as_deref(),
        Commands::Status { .. } => None,
    };
    if let Err(e) = init_logging(output) {
        eprintln!("Failed to set up logging: {e}");
        return ExitCode::FAILURE;
    }

    let result = match cli.command {
        Commands::Run(args) => run(args).await,
        Commands::Status {
            prefix,
            retry_failed,
            json,
        } => status(&prefix, retry_failed, json),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e}");
            ExitCode::FAILURE
        }
    }
}

fn init_logging(output: Option<&Path>) -> Result<(), Box<dyn std::error::Error>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("findr=info"));

    match output {
        Some(path) => {
            let file = OpenOptions::new().create(true).append(true).open(path)?;
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(Mutex::new(file))
                .with_ansi(false)
                .init();
        }
        None => {
            tracing_subscriber::fmt().with_env_filter(filter).init();
        }
    }
    Ok(())
}

async fn run(args: RunArgs) -> Result<(), Box<dyn std::error::Error>> {
    let config = args.into_config();
    findr_control_plane::run(&config).await?;
    Ok(())
}

fn status(prefix: &str, retry_failed: u32, json: bool) -> Result<(), Box<dyn std::error::Error>> {
    let report = summarize_run(prefix, retry_failed)?;
    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        println!("{prefix}: {report}");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_args_defaults() {
        let cli = Cli::parse_from(["findr", "run", "configList.list"]);
        let Commands::Run(args) = cli.command else {
            panic!("expected run");
        };
        let config = args.into_config();

        assert_eq!(config.mode, RunMode::Fresh);
        assert_eq!(config.prefix, "run");
        assert_eq!(config.klip_path, "klipReduce");
        assert_eq!(config.retry_limit, 0);
        assert_eq!(config.compress_threshold, 100);
        assert_eq!(config.wait_timeout, Duration::from_secs(5));
        assert_eq!(config.status_every, 10);
        assert_eq!(config.queue.preferred_port, 9123);
        assert_eq!(config.queue.sandbox_root, PathBuf::from("run_sandbox"));
    }

    #[test]
    fn test_run_args_resume() {
        let cli = Cli::parse_from([
            "findr",
            "run",
            "list.txt",
            "--resume",
            "--prefix",
            "try2",
            "--klip-path",
            "/opt/klip/klipReduce",
            "--retry-failed",
            "3",
            "--workers",
            "8",
        ]);
        let Commands::Run(args) = cli.command else {
            panic!("expected run");
        };
        let config = args.into_config();

        assert_eq!(config.mode, RunMode::Resume);
        assert_eq!(config.manifest, PathBuf::from("list.txt"));
        assert_eq!(config.klip_path, "/opt/klip/klipReduce");
        assert_eq!(config.retry_limit, 3);
        assert_eq!(config.queue.workers, 8);
        assert_eq!(config.queue.sandbox_root, PathBuf::from("try2_sandbox"));
    }
}
