//! CLI command definitions for env-forge.
//!
//! `run` drives a whole batch through the refinement loop, `validate` runs
//! the validator alone on a hand-written artifact pair, and `pool` inspects
//! the memory pool.

use anyhow::Context;
use clap::Parser;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::builder::{
    load_instances, run_batch, BatchSummary, BuilderConfig, Orchestrator, ProgressCounters,
    ProgressMonitor, ResultsWriter,
};
use crate::pool::MemoryPool;
use crate::sandbox::{DockerSandbox, Sandbox};
use crate::types::{EnvironmentSpec, EvalScript, TaskInstance};
use crate::validation::{ValidationResult, Validator};

/// How often the batch progress line is logged.
const PROGRESS_INTERVAL: Duration = Duration::from_secs(30);

/// Synthesize validated build environments and eval scripts for repository
/// task instances.
#[derive(Parser)]
#[command(name = "env-forge")]
#[command(about = "Synthesize executable environments and eval scripts for repository tasks")]
#[command(version)]
#[command(
    long_about = "env-forge explores each repository in a sandbox, drafts a Dockerfile and an eval script, and refines them until the gold patch turns failing tests into passing ones.\n\nExample usage:\n  env-forge run --input tasks.jsonl --output ./envforge-results --workers 4"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,

    /// YAML configuration file.
    #[arg(short, long, env = "ENVFORGE_CONFIG", global = true)]
    pub config: Option<PathBuf>,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Process every instance of a JSONL file.
    Run(RunArgs),

    /// Validate one hand-written Dockerfile + eval script against an instance.
    Validate(ValidateArgs),

    /// Inspect the memory pool.
    Pool(PoolArgs),
}

/// Arguments for `env-forge run`.
#[derive(Parser, Debug)]
pub struct RunArgs {
    /// JSONL file with one task instance per line.
    #[arg(short, long)]
    pub input: PathBuf,

    /// Results directory.
    #[arg(short, long)]
    pub output: Option<PathBuf>,

    /// Instances processed concurrently.
    #[arg(short, long)]
    pub workers: Option<usize>,

    /// Refinement rounds per instance.
    #[arg(long)]
    pub round_limit: Option<u32>,

    /// Model used by every agent.
    #[arg(short, long)]
    pub model: Option<String>,

    /// Disable memory pool lookups and writes.
    #[arg(long)]
    pub no_memory_pool: bool,

    /// Memory pool database path.
    #[arg(long)]
    pub memory_pool: Option<PathBuf>,

    /// Pre-patch runs per validation, used for flakiness detection.
    #[arg(long)]
    pub repeat_count: Option<u32>,

    /// Image build timeout in seconds.
    #[arg(long)]
    pub build_timeout: Option<u64>,

    /// Eval-script run timeout in seconds.
    #[arg(long)]
    pub run_timeout: Option<u64>,

    /// Keep images of failed rounds.
    #[arg(long)]
    pub keep_images: bool,

    /// Print the batch summary as JSON.
    #[arg(short = 'j', long)]
    pub json: bool,
}

/// Arguments for `env-forge validate`.
#[derive(Parser, Debug)]
pub struct ValidateArgs {
    /// JSON file holding one task instance.
    #[arg(long)]
    pub instance: PathBuf,

    /// Dockerfile to build.
    #[arg(long)]
    pub dockerfile: PathBuf,

    /// Eval script; receives the patch path as `$1`.
    #[arg(long)]
    pub eval_script: PathBuf,

    /// Print the full validation result as JSON.
    #[arg(short = 'j', long)]
    pub json: bool,
}

/// Arguments for `env-forge pool`.
#[derive(Parser, Debug)]
pub struct PoolArgs {
    /// Memory pool database path (overrides the configuration).
    #[arg(long, global = true)]
    pub path: Option<PathBuf>,

    #[command(subcommand)]
    pub command: PoolSubcommand,
}

#[derive(clap::Subcommand, Debug)]
pub enum PoolSubcommand {
    /// Show the entry a lookup would reuse.
    Lookup(PoolLookupArgs),

    /// Show entry counts.
    Stats,

    /// List every entry, oldest first.
    List,
}

#[derive(Parser, Debug)]
pub struct PoolLookupArgs {
    #[arg(long)]
    pub repo: String,

    #[arg(long)]
    pub language: String,

    /// Requested version; the nearest cached version is used when no exact
    /// match exists.
    #[arg(long)]
    pub version: Option<String>,
}

/// Parse CLI arguments and return the Cli struct.
///
/// This allows main.rs to access CLI arguments (like log_level) before running commands.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI by parsing arguments and executing the command.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    let config = BuilderConfig::load(cli.config.as_deref())
        .context("Failed to load configuration")?;
    match cli.command {
        Commands::Run(args) => run_batch_command(config, args).await,
        Commands::Validate(args) => run_validate_command(config, args).await,
        Commands::Pool(args) => run_pool_command(config, args).await,
    }
}

// ============================================================================
// run
// ============================================================================

fn apply_run_args(config: &mut BuilderConfig, args: &RunArgs) {
    if let Some(output) = &args.output {
        config.output_dir = output.clone();
    }
    if let Some(workers) = args.workers {
        config.workers = workers;
    }
    if let Some(limit) = args.round_limit {
        config.round_limit = limit;
    }
    if let Some(model) = &args.model {
        config.llm.model = model.clone();
    }
    if args.no_memory_pool {
        config.pool.enabled = false;
    }
    if let Some(path) = &args.memory_pool {
        config.pool.path = path.clone();
    }
    if let Some(n) = args.repeat_count {
        config.sandbox.repeat_count = n;
    }
    if let Some(secs) = args.build_timeout {
        config.sandbox.build_timeout_secs = secs;
    }
    if let Some(secs) = args.run_timeout {
        config.sandbox.run_timeout_secs = secs;
    }
    if args.keep_images {
        config.keep_images = true;
    }
}

async fn run_batch_command(mut config: BuilderConfig, args: RunArgs) -> anyhow::Result<()> {
    apply_run_args(&mut config, &args);
    config.validate()?;

    let records = load_instances(&args.input)
        .await
        .with_context(|| format!("Failed to read {}", args.input.display()))?;
    if records.is_empty() {
        anyhow::bail!("No task instances in {}", args.input.display());
    }

    let provider = config
        .build_provider()
        .context("Failed to initialize the generation backend")?;
    let client = config.generation_client(provider);
    let sandbox = docker_sandbox(&config).await?;
    let pool = config
        .open_pool()
        .await
        .with_context(|| format!("Failed to open memory pool {}", config.pool.path.display()))?;

    info!(
        instances = records.len(),
        workers = config.workers,
        round_limit = config.round_limit,
        model = %config.llm.model,
        memory_pool = pool.is_enabled(),
        output = %config.output_dir.display(),
        "Starting env-forge run"
    );

    let counters = ProgressCounters::new();
    let orchestrator = Arc::new(
        Orchestrator::new(&config, client, sandbox, pool.clone()).with_progress(counters.clone()),
    );
    let monitor = ProgressMonitor::start(counters, records.len(), PROGRESS_INTERVAL);

    let writer = Arc::new(ResultsWriter::new(&config.output_dir));
    let (tx, mut rx) = mpsc::channel(64);
    let sink = {
        let writer = writer.clone();
        tokio::spawn(async move {
            while let Some(outcome) = rx.recv().await {
                if let Err(e) = writer.write_instance(&outcome).await {
                    warn!(instance_id = %outcome.instance_id, error = %e, "Failed to write instance results");
                }
            }
        })
    };

    let outcomes = run_batch(orchestrator, records, config.workers, Some(tx)).await;
    if let Err(e) = sink.await {
        warn!(error = %e, "Result writer task failed");
    }
    monitor.stop().await;

    let summary = writer.write_summary(&outcomes).await?;
    pool.log_stats().await;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        print_summary(&summary, writer.root());
    }
    Ok(())
}

fn print_summary(summary: &BatchSummary, root: &Path) {
    println!(
        "{} instances: {} succeeded, {} failed ({} cache hits, {} rounds)",
        summary.total, summary.succeeded, summary.failed, summary.cache_hits, summary.total_rounds
    );
    for (kind, count) in &summary.failures {
        println!("  {:<22} {}", kind, count);
    }
    for status in &summary.instances {
        println!(
            "  {:<40} {:<28} rounds={}",
            status.instance_id, status.status, status.rounds_used
        );
    }
    println!("Results written to {}", root.display());
}

// ============================================================================
// validate
// ============================================================================

#[derive(Debug, Serialize)]
struct ValidateOutput<'a> {
    instance_id: &'a str,
    classification: String,
    reason: &'a str,
    fail_to_pass: Vec<&'a String>,
    pass_to_pass: usize,
    regressions: Vec<&'a String>,
}

async fn run_validate_command(config: BuilderConfig, args: ValidateArgs) -> anyhow::Result<()> {
    config.validate()?;
    let instance_text = std::fs::read_to_string(&args.instance)
        .with_context(|| format!("Failed to read {}", args.instance.display()))?;
    let instance: TaskInstance = serde_json::from_str(&instance_text)
        .with_context(|| format!("Invalid task instance in {}", args.instance.display()))?;
    let instance = instance.with_resolved_id();

    let dockerfile = std::fs::read_to_string(&args.dockerfile)
        .with_context(|| format!("Failed to read {}", args.dockerfile.display()))?;
    let env = EnvironmentSpec::from_dockerfile(&dockerfile).map_err(|e| anyhow::anyhow!(e))?;
    let script = EvalScript::new(
        std::fs::read_to_string(&args.eval_script)
            .with_context(|| format!("Failed to read {}", args.eval_script.display()))?,
    );

    let sandbox = docker_sandbox(&config).await?;
    let validator = Validator::new(sandbox.clone(), config.validator_config());
    let result = validator.validate(&env, &script, &instance).await?;
    if let (Some(image), false) = (&result.image, config.keep_images) {
        sandbox.remove_image(image).await;
    }

    if args.json {
        println!("{}", serde_json::to_string_pretty(&result)?);
    } else {
        print_validation(&instance, &result)?;
    }
    Ok(())
}

fn print_validation(instance: &TaskInstance, result: &ValidationResult) -> anyhow::Result<()> {
    let output = ValidateOutput {
        instance_id: &instance.instance_id,
        classification: result.classification.to_string(),
        reason: &result.reason,
        fail_to_pass: result.analysis.fail_to_pass.iter().collect(),
        pass_to_pass: result.analysis.pass_to_pass.len(),
        regressions: result.analysis.regressions.iter().collect(),
    };
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

// ============================================================================
// pool
// ============================================================================

async fn run_pool_command(mut config: BuilderConfig, args: PoolArgs) -> anyhow::Result<()> {
    if let Some(path) = args.path {
        config.pool.path = path;
    }
    let pool = MemoryPool::open(&config.pool.path)
        .await
        .with_context(|| format!("Failed to open memory pool {}", config.pool.path.display()))?;

    match args.command {
        PoolSubcommand::Lookup(lookup) => {
            match pool
                .lookup(&lookup.repo, &lookup.language, lookup.version.as_deref())
                .await?
            {
                Some(entry) => println!("{}", serde_json::to_string_pretty(&entry)?),
                None => println!(
                    "No entry for {} ({})",
                    lookup.repo, lookup.language
                ),
            }
        }
        PoolSubcommand::List => {
            for entry in pool.all_entries().await? {
                println!(
                    "{:<32} {:<12} {:<10} {:<40} {}",
                    entry.repo,
                    entry.language,
                    if entry.version.is_empty() { "-" } else { &entry.version },
                    entry.instance_id,
                    entry.success_timestamp.to_rfc3339()
                );
            }
        }
        PoolSubcommand::Stats => {
            let stats = pool.stats().await?;
            println!(
                "{} entries, {} keys, {} repos ({})",
                stats.entries,
                stats.keys,
                stats.repos,
                config.pool.path.display()
            );
        }
    }
    Ok(())
}

// ============================================================================
// shared
// ============================================================================

async fn docker_sandbox(config: &BuilderConfig) -> anyhow::Result<Arc<DockerSandbox>> {
    let sandbox = DockerSandbox::new()
        .with_binary(config.sandbox.docker_binary.clone())
        .with_run_flags(config.sandbox.run_flags.clone());
    sandbox.ping().await.map_err(|e| {
        anyhow::anyhow!(
            "Container engine is unavailable; install Docker or set ENVFORGE_DOCKER_BINARY: {}",
            e
        )
    })?;
    Ok(Arc::new(sandbox))
}
