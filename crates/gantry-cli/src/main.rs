//! Gantry - a small self-hosted CI runner
//!
//! The `gantry` command validates and runs staged pipelines.
//!
//! ## Commands
//!
//! - `validate`: Parse a pipeline file and print its stage plan
//! - `run`: Execute a pipeline for a branch or tag
//! - `artifacts`: Read back artifacts stored by earlier runs
//! - `prune`: Destroy artifacts whose retention window has elapsed

mod git;

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use gantry_ci::{
    obs, DockerCliRegistry, Executor, GateVerdict, JobStatus, PipelineDef, PipelineResult,
    PipelineRunner, PublishConfig, Publisher, RunGate, RunnerConfig, StageGraph, TriggerEvent,
};
use gantry_state::fakes::MemoryRunLedger;
use gantry_state::{ArtifactKey, ArtifactStore, FsArtifactStore, RunId, RunLedger};
use tracing::{debug, Level};

#[derive(Parser)]
#[command(name = "gantry")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Self-hosted staged pipeline runner", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    /// Runner configuration file (default: ./gantry.toml when present)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a pipeline file and print its stage plan
    Validate {
        /// Pipeline definition (YAML)
        file: PathBuf,
    },

    /// Run a pipeline
    Run {
        /// Pipeline definition (YAML)
        file: PathBuf,

        /// Branch or tag that triggered the run (default: current branch)
        #[arg(long = "ref")]
        git_ref: Option<String>,

        /// Commit SHA (default: HEAD of the current directory)
        #[arg(long)]
        sha: Option<String>,

        /// Treat the ref as a tag
        #[arg(long)]
        tag: bool,

        /// Where jobs execute: local or docker
        #[arg(long)]
        executor: Option<Executor>,

        /// Extra variables, KEY=VALUE (repeatable)
        #[arg(long = "var", value_parser = parse_key_val)]
        vars: Vec<(String, String)>,
    },

    /// Inspect stored artifacts
    Artifacts {
        #[command(subcommand)]
        action: ArtifactsAction,
    },

    /// Destroy expired artifacts
    Prune,
}

#[derive(Subcommand)]
enum ArtifactsAction {
    /// Write one artifact to a file or stdout
    Get {
        /// Run ID
        run: String,
        /// Job that produced the artifact
        job: String,
        /// Relative path of the artifact
        path: String,
        /// Output file (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// List the artifacts of a job
    List {
        /// Run ID
        run: String,
        /// Job that produced the artifacts
        job: String,
    },
}

fn parse_key_val(raw: &str) -> std::result::Result<(String, String), String> {
    let (key, value) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got '{raw}'"))?;
    if key.is_empty() {
        return Err(format!("empty variable name in '{raw}'"));
    }
    Ok((key.to_string(), value.to_string()))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    gantry_ci::telemetry::init_tracing(cli.json, level);

    let config =
        RunnerConfig::load(cli.config.as_deref()).context("Failed to load runner configuration")?;

    match cli.command {
        Commands::Validate { file } => cmd_validate(&file),
        Commands::Run {
            file,
            git_ref,
            sha,
            tag,
            executor,
            vars,
        } => {
            let config = match executor {
                Some(executor) => config.with_executor(executor),
                None => config,
            };
            let event = trigger_event(git_ref, sha, tag, vars);
            let publish = PublishConfig::from_env().context("Invalid registry configuration")?;
            let (result, verdict) = cmd_run(config, &file, event, publish).await?;
            if result.success() && verdict.passed {
                println!("\n✓ Pipeline succeeded");
                Ok(())
            } else {
                anyhow::bail!("pipeline failed")
            }
        }
        Commands::Artifacts { action } => {
            let store = open_store(&config)?;
            match action {
                ArtifactsAction::Get {
                    run,
                    job,
                    path,
                    output,
                } => cmd_artifacts_get(&store, &run, &job, &path, output.as_deref()).await,
                ArtifactsAction::List { run, job } => {
                    cmd_artifacts_list(&store, &run, &job).await
                }
            }
        }
        Commands::Prune => {
            let store = open_store(&config)?;
            cmd_prune(&store).await
        }
    }
}

fn open_store(config: &RunnerConfig) -> Result<FsArtifactStore> {
    FsArtifactStore::new(&config.artifact_dir).with_context(|| {
        format!(
            "Failed to open artifact store at {}",
            config.artifact_dir.display()
        )
    })
}

/// Build the trigger event, filling gaps from the git working copy.
fn trigger_event(
    git_ref: Option<String>,
    sha: Option<String>,
    tag: bool,
    vars: Vec<(String, String)>,
) -> TriggerEvent {
    let cwd = Path::new(".");
    let git_ref = git_ref
        .or_else(|| git::current_branch(cwd).ok())
        .unwrap_or_else(|| "main".to_string());
    let mut event = if tag {
        TriggerEvent::tag(git_ref)
    } else {
        TriggerEvent::branch(git_ref)
    };
    event.sha = sha.or_else(|| git::capture_head_sha(cwd).ok());
    for (key, value) in vars {
        event = event.with_variable(key, value);
    }
    event
}

fn load_graph(file: &Path) -> Result<StageGraph> {
    let def = PipelineDef::from_path(file)
        .with_context(|| format!("Failed to read pipeline {}", file.display()))?;
    StageGraph::build(&def).with_context(|| format!("Invalid pipeline {}", file.display()))
}

/// Validate a pipeline and print its plan
fn cmd_validate(file: &Path) -> Result<()> {
    let graph = load_graph(file)?;

    println!(
        "✓ {} is valid (digest {})",
        file.display(),
        graph.digest().short()
    );
    for (idx, stage) in graph.stages().iter().enumerate() {
        println!("Stage {}: {}", idx + 1, stage.name);
        if stage.waves.is_empty() {
            println!("  (no jobs)");
        }
        for (wave_idx, wave) in stage.waves.iter().enumerate() {
            for name in wave {
                let only = graph
                    .job(name)
                    .filter(|job| job.trigger.is_some())
                    .map(|_| " [gated]")
                    .unwrap_or_default();
                println!("  {}. {}{}", wave_idx + 1, name, only);
            }
        }
    }
    Ok(())
}

/// Run a pipeline and evaluate the gate over its recorded events
async fn cmd_run(
    config: RunnerConfig,
    file: &Path,
    event: TriggerEvent,
    publish: Option<PublishConfig>,
) -> Result<(PipelineResult, GateVerdict)> {
    let graph = load_graph(file)?;
    let store = Arc::new(open_store(&config)?);
    let ledger = Arc::new(MemoryRunLedger::new());
    let provider = config.environment_provider();

    let pipeline_name = file
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "pipeline".to_string());

    let mut runner = PipelineRunner::new(config.clone(), store, ledger.clone(), provider)
        .with_pipeline_name(pipeline_name);
    if let Some(publish) = publish {
        debug!(registry = %publish.credentials.registry, "registry publishing enabled");
        let registry = Arc::new(DockerCliRegistry::new(config.docker_bin.clone()));
        runner = runner.with_publisher(Publisher::new(registry, publish));
    }

    println!("Running pipeline {}", file.display());
    println!(
        "Ref: {}{}",
        event.git_ref,
        if event.is_tag { " (tag)" } else { "" }
    );
    if let Some(sha) = &event.sha {
        println!("Commit: {sha}");
    }
    println!();

    let result = runner
        .execute(&graph, &event)
        .await
        .context("Pipeline could not be executed")?;

    println!("Run ID: {}", result.run_id);
    println!(
        "Status: {}",
        if result.success() { "✓ PASSED" } else { "✗ FAILED" }
    );
    println!("Duration: {}ms", result.duration_ms);
    println!();

    for job in &result.jobs {
        let marker = match job.status {
            JobStatus::Succeeded => "✓",
            JobStatus::Failed => "✗",
            JobStatus::Skipped => "-",
            _ => "○",
        };
        println!(
            "  {} {} [{}] {} ({}ms)",
            marker, job.job_name, job.stage, job.status, job.duration_ms
        );
        if let Some(image) = &job.published_image {
            println!("      published {image}");
        }
        if job.status == JobStatus::Failed {
            for line in job.logs.lines() {
                println!("      | {line}");
            }
        }
    }

    println!();
    println!(
        "Summary: {}/{} jobs passed",
        result.passed_count(),
        result.jobs.len()
    );

    let events = ledger.get_events(&result.run_id).await?;
    let verdict = RunGate::evaluate(&events);
    println!(
        "Gate: {}",
        if verdict.passed { "✓ PASSED" } else { "✗ FAILED" }
    );
    if !verdict.violations.is_empty() {
        println!("Violations:");
        for violation in &verdict.violations {
            println!("  - {violation}");
        }
    }

    Ok((result, verdict))
}

/// Write one artifact to `output` or stdout
async fn cmd_artifacts_get(
    store: &dyn ArtifactStore,
    run: &str,
    job: &str,
    path: &str,
    output: Option<&Path>,
) -> Result<()> {
    let key = ArtifactKey::new(&RunId(run.to_string()), job, path)?;
    let data = store
        .get(&key)
        .await
        .with_context(|| format!("Failed to read artifact {key}"))?;

    match output {
        Some(out) => {
            std::fs::write(out, &data)
                .with_context(|| format!("Failed to write {}", out.display()))?;
            println!("✓ Wrote {} bytes to {}", data.len(), out.display());
        }
        None => {
            let mut stdout = std::io::stdout().lock();
            stdout.write_all(&data)?;
            stdout.flush()?;
        }
    }
    Ok(())
}

/// List the live artifacts of a job
async fn cmd_artifacts_list(store: &dyn ArtifactStore, run: &str, job: &str) -> Result<()> {
    let artifacts = store.list(&RunId(run.to_string()), job).await?;
    if artifacts.is_empty() {
        println!("No artifacts for {run}/{job}");
        return Ok(());
    }
    for meta in &artifacts {
        let expires = meta
            .expires_at
            .map(|at| at.to_rfc3339())
            .unwrap_or_else(|| "never".to_string());
        println!(
            "{:<40} {:>10} bytes  {}  expires {}",
            meta.key.path,
            meta.size,
            meta.digest.short(),
            expires
        );
    }
    Ok(())
}

/// Destroy expired artifacts
async fn cmd_prune(store: &dyn ArtifactStore) -> Result<()> {
    let removed = store.prune(chrono::Utc::now()).await?;
    obs::emit_artifact_pruned(removed);
    println!("✓ Pruned {removed} expired artifact(s)");
    Ok(())
}
