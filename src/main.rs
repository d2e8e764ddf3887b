use anyhow::Context;
use chunkflow::{
    Coordinator, Dataset, EngineConfig, ExecutionStrategy, ProcessingMode, ProgressUpdate, Record,
    ReduceError,
};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use tracing::{debug, error, info, trace};

/// Run synthetic keyed workloads through the chunkflow engine
#[derive(Parser)]
#[command(name = "chunkflow")]
#[command(
    about = "Bounded-memory chunked streaming and parallel batch processing",
    long_about = None
)]
struct Cli {
    /// Enable verbose output (-v for debug, -vv for trace, -vvv for all)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Generate a keyed dataset and reduce it (default command)
    Run {
        /// Number of rows to generate
        #[arg(long, default_value = "100000")]
        rows: usize,

        /// Number of distinct keys
        #[arg(long, default_value = "100")]
        keys: usize,

        /// Mark every Nth row as malformed (0 disables)
        #[arg(long, default_value = "0")]
        malformed_every: usize,

        /// Execution strategy override
        #[arg(long, value_enum)]
        strategy: Option<StrategyArg>,

        /// Worker flavor for the parallel path
        #[arg(long, value_enum)]
        mode: Option<ModeArg>,

        /// Number of workers
        #[arg(short = 'w', long)]
        workers: Option<usize>,

        /// Initial chunk size in rows
        #[arg(long)]
        chunk_size: Option<usize>,

        /// Path to a JSON engine configuration
        #[arg(short = 'c', long)]
        config: Option<PathBuf>,

        /// Print progress updates to stderr
        #[arg(long)]
        show_progress: bool,

        /// Include per-unit partial results in the printed report
        #[arg(long)]
        partials: bool,
    },
    /// Print the default engine configuration as JSON
    Config,
}

#[derive(Clone, Copy, ValueEnum)]
enum StrategyArg {
    Sequential,
    Streaming,
    Parallel,
}

impl From<StrategyArg> for ExecutionStrategy {
    fn from(arg: StrategyArg) -> Self {
        match arg {
            StrategyArg::Sequential => ExecutionStrategy::Sequential,
            StrategyArg::Streaming => ExecutionStrategy::Streaming,
            StrategyArg::Parallel => ExecutionStrategy::Parallel,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum ModeArg {
    Thread,
    Process,
    Auto,
}

impl From<ModeArg> for ProcessingMode {
    fn from(arg: ModeArg) -> Self {
        match arg {
            ModeArg::Thread => ProcessingMode::Thread,
            ModeArg::Process => ProcessingMode::Process,
            ModeArg::Auto => ProcessingMode::Auto,
        }
    }
}

#[derive(Debug, Clone)]
struct DemoRow {
    key: String,
    value: u64,
    malformed: bool,
}

impl Record for DemoRow {
    fn key(&self) -> &str {
        &self.key
    }

    fn estimated_bytes(&self) -> usize {
        std::mem::size_of::<Self>() + self.key.capacity()
    }
}

struct RunOptions {
    rows: usize,
    keys: usize,
    malformed_every: usize,
    strategy: Option<StrategyArg>,
    mode: Option<ModeArg>,
    workers: Option<usize>,
    chunk_size: Option<usize>,
    config: Option<PathBuf>,
    show_progress: bool,
    partials: bool,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            rows: 100_000,
            keys: 100,
            malformed_every: 0,
            strategy: None,
            mode: None,
            workers: None,
            chunk_size: None,
            config: None,
            show_progress: false,
            partials: false,
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let log_level = match cli.verbose {
        0 => "info",
        1 => "debug",
        2 => "trace",
        _ => "trace,tokio=debug,runtime=debug",
    };

    tracing_subscriber::fmt()
        .with_env_filter(log_level)
        .with_writer(std::io::stderr)
        .with_target(cli.verbose >= 2)
        .with_thread_ids(cli.verbose >= 3)
        .with_line_number(cli.verbose >= 3)
        .init();

    debug!("chunkflow started with verbosity level: {}", cli.verbose);
    trace!("Full CLI args: {:?}", std::env::args().collect::<Vec<_>>());

    let result = match cli.command {
        Some(Commands::Run {
            rows,
            keys,
            malformed_every,
            strategy,
            mode,
            workers,
            chunk_size,
            config,
            show_progress,
            partials,
        }) => {
            run(RunOptions {
                rows,
                keys,
                malformed_every,
                strategy,
                mode,
                workers,
                chunk_size,
                config,
                show_progress,
                partials,
            })
            .await
        }
        Some(Commands::Config) => print_default_config(),
        None => run(RunOptions::default()).await,
    };

    if let Err(e) = result {
        error!("Fatal error: {:#}", e);
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
}

fn load_config(path: Option<&PathBuf>) -> anyhow::Result<EngineConfig> {
    let Some(path) = path else {
        return Ok(EngineConfig::default());
    };
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&raw)
        .with_context(|| format!("Invalid engine configuration in {}", path.display()))
}

fn generate_rows(rows: usize, keys: usize, malformed_every: usize) -> Vec<DemoRow> {
    let keys = keys.max(1);
    let per_key = rows.div_ceil(keys).max(1);
    (0..rows)
        .map(|index| DemoRow {
            key: format!("K{:03}", index / per_key),
            value: index as u64,
            malformed: malformed_every > 0 && (index + 1) % malformed_every == 0,
        })
        .collect()
}

fn reduce(rows: &[DemoRow]) -> Result<u64, ReduceError> {
    if let Some(bad) = rows.iter().find(|row| row.malformed) {
        let error = ReduceError::new(format!("malformed value {}", bad.value));
        return Err(error.for_key(bad.key.as_str()));
    }
    Ok(rows.iter().map(|row| row.value).sum())
}

async fn run(options: RunOptions) -> anyhow::Result<()> {
    let mut config = load_config(options.config.as_ref())?;
    if let Some(strategy) = options.strategy {
        config.strategy = strategy.into();
    }
    if let Some(mode) = options.mode {
        config.processing_mode = mode.into();
    }
    if let Some(workers) = options.workers {
        config.worker_count = workers;
    }
    if let Some(chunk_size) = options.chunk_size {
        config.initial_chunk_size = chunk_size;
    }

    let mut coordinator = Coordinator::new(config).context("Invalid engine configuration")?;
    if options.show_progress {
        coordinator = coordinator.on_progress(|update: &ProgressUpdate| {
            eprintln!(
                "{}: {:.1}% ({} done, {} failed)",
                update.unit,
                update.fraction() * 100.0,
                update.rows_done,
                update.rows_failed
            );
        });
    }

    let cancel = coordinator.cancel_handle();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupt received, cancelling");
            cancel.cancel();
        }
    });

    let dataset = Dataset::new(generate_rows(options.rows, options.keys, options.malformed_every));
    let mut report = coordinator.process(dataset, reduce).await?;
    if !options.partials {
        report.partials.clear();
    }

    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn print_default_config() -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(&EngineConfig::default())?);
    Ok(())
}
