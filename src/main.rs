//! atelier - Main CLI Entry Point

use anyhow::{bail, Context, Result};
use clap::Parser;
use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use serde_json::json;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use atelier::{
    cli::{Args, Commands},
    config::{Config, VectorBackend},
    rag::{
        embedding::{EmbeddingService, OpenAiEmbeddings},
        index::build_index,
        ingest::{load_documents, Ingestor},
        RecommendationPipeline, Recommendations, RetrievalMode,
    },
    tasks::{
        builtin::{default_registry, HELLO_TASK, RECOMMEND_TASK},
        TaskId, TaskRuntime, TaskState, TaskStatusRecord,
    },
    telemetry::{self, TelemetryCollector, TelemetryDisplay},
};

const POLL_INTERVAL: Duration = Duration::from_millis(250);

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => Config::load_from(path)?,
        None => Config::load()?,
    };
    config.apply_env();
    if let Some(level) = args.log_level_override() {
        config.telemetry.level = level.to_string();
    }
    if args.json_logs {
        config.telemetry.json = true;
    }
    if let Commands::Recommend { limit, threshold, .. } = &args.command {
        if let Some(limit) = limit {
            config.retrieval.limit = *limit;
        }
        if let Some(threshold) = threshold {
            config.retrieval.threshold = *threshold;
        }
    }
    config.validate()?;
    telemetry::init_tracing(&config.telemetry)?;

    let collector = TelemetryCollector::new();

    match &args.command {
        Commands::Recommend { query, queued, .. } => {
            if *queued {
                recommend_queued(&config, query, collector.clone()).await?;
            } else {
                recommend_direct(&config, query, collector.clone()).await?;
            }
        }
        Commands::Hello { name } => {
            run_hello(&config, name, collector.clone()).await?;
        }
        Commands::Config => {
            show_config(&config, args.config.as_deref())?;
        }
        Commands::Ingest { file } => {
            run_ingest(&config, file).await?;
        }
    }

    if args.verbose > 0 {
        TelemetryDisplay::new(collector).display_summary();
    }

    Ok(())
}

fn spinner(message: &str) -> ProgressBar {
    let pb = ProgressBar::new_spinner();
    pb.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner:.cyan} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner()),
    );
    pb.set_message(message.to_string());
    pb.enable_steady_tick(Duration::from_millis(100));
    pb
}

/// Upper bound on how long a queued task may take, retries included
fn wait_budget(config: &Config) -> Duration {
    config
        .worker
        .time_limit()
        .saturating_mul(config.worker.max_retries.saturating_add(1))
        .saturating_add(Duration::from_secs(60))
}

async fn recommend_direct(config: &Config, query: &str, collector: TelemetryCollector) -> Result<()> {
    let pb = spinner("Retrieving trends and generating recommendations...");
    let pipeline = RecommendationPipeline::from_config(config, collector).await?;
    let outcome = pipeline.get_recommendations(query).await;
    pb.finish_and_clear();

    print_recommendations(&outcome?);
    Ok(())
}

async fn recommend_queued(config: &Config, query: &str, collector: TelemetryCollector) -> Result<()> {
    let pipeline = Arc::new(RecommendationPipeline::from_config(config, collector.clone()).await?);
    let runtime = TaskRuntime::start(config, default_registry(Some(pipeline))?, collector);

    let outcome: Result<()> = async {
        let id = runtime.client().submit(RECOMMEND_TASK, vec![json!(query)]).await?;
        println!("{} {}", "Submitted task".cyan(), id);
        let record = wait_with_spinner(&runtime, id, wait_budget(config)).await?;
        finish(record, |value| {
            let recommendations: Recommendations =
                serde_json::from_value(value).context("Unexpected recommend_task result")?;
            print_recommendations(&recommendations);
            Ok(())
        })
    }
    .await;

    runtime.shutdown().await;
    outcome
}

async fn run_hello(config: &Config, name: &str, collector: TelemetryCollector) -> Result<()> {
    let runtime = TaskRuntime::start(config, default_registry(None)?, collector);

    let outcome: Result<()> = async {
        let id = runtime.client().submit(HELLO_TASK, vec![json!(name)]).await?;
        let first = runtime.client().poll(id).await?;
        println!("{} {} ({})", "Submitted task".cyan(), id, first.state);

        let record = wait_with_spinner(&runtime, id, wait_budget(config)).await?;
        finish(record, |value| {
            match value.as_str() {
                Some(text) => println!("{}", text.green()),
                None => println!("{}", value),
            }
            Ok(())
        })
    }
    .await;

    runtime.shutdown().await;
    outcome
}

async fn wait_with_spinner(runtime: &TaskRuntime, id: TaskId, budget: Duration) -> Result<TaskStatusRecord> {
    let pb = spinner("Waiting for worker...");
    let record = runtime.client().wait(id, POLL_INTERVAL, budget).await;
    pb.finish_and_clear();
    Ok(record?)
}

/// Render a terminal status record
fn finish<F>(record: TaskStatusRecord, on_success: F) -> Result<()>
where
    F: FnOnce(serde_json::Value) -> Result<()>,
{
    match (record.state, record.result, record.error) {
        (TaskState::Success, Some(value), _) => on_success(value),
        (TaskState::Failure, _, Some(error)) => {
            eprintln!("{} {}: {}", "Task failed:".red().bold(), error.kind, error.message);
            bail!("task {} failed", record.id)
        }
        (state, _, _) => bail!("task {} ended in state {}", record.id, state),
    }
}

fn print_recommendations(result: &Recommendations) {
    println!("\n{} {}", "Query:".bold(), result.query);

    match &result.retrieval_mode {
        RetrievalMode::Ranked => {
            println!("{} ({} trends)", "Relevant trends".bold(), result.retrieved.len());
        }
        RetrievalMode::Fallback { reason } => {
            println!(
                "{} ({} trends, unranked: {})",
                "Trends".bold(),
                result.retrieved.len(),
                reason.yellow()
            );
        }
    }

    for trend in &result.retrieved {
        let score = trend
            .score
            .map(|s| format!(" [{:.2}]", s))
            .unwrap_or_default();
        println!(
            "  • {} - {} ({}){}",
            trend.title.as_deref().unwrap_or("N/A").cyan(),
            trend.category.as_deref().unwrap_or("N/A"),
            trend.season.as_deref().unwrap_or("N/A"),
            score.dimmed()
        );
    }

    println!("\n{}", "Recommendations".bold());
    if result.generated {
        println!("{}", result.recommendations);
    } else {
        println!("{}", result.recommendations.yellow());
    }
}

fn show_config(config: &Config, path: Option<&Path>) -> Result<()> {
    let location = match path {
        Some(path) => path.to_path_buf(),
        None => Config::config_path()?,
    };
    println!("{} {}\n", "Configuration:".bold(), location.display());

    let rendered = toml::to_string_pretty(&config.redacted()).context("Failed to render config")?;
    println!("{}", rendered);
    Ok(())
}

async fn run_ingest(config: &Config, file: &Path) -> Result<()> {
    let documents = load_documents(file)
        .with_context(|| format!("Failed to load trend documents from {}", file.display()))?;

    let embedder: Arc<dyn EmbeddingService> = Arc::new(OpenAiEmbeddings::new(&config.embedding)?);
    let index = build_index(&config.vector_store, config.embedding.dimension)?;

    let pb = spinner(&format!("Embedding {} trends...", documents.len()));
    let report = Ingestor::new(embedder, index).ingest(&documents).await;
    pb.finish_and_clear();

    println!(
        "{} {}/{} trends",
        "Stored".green().bold(),
        report.stored,
        report.total()
    );
    for (title, error) in &report.failed {
        eprintln!("  {} {}: {}", "✗".red(), title, error);
    }
    if config.vector_store.backend == VectorBackend::Memory {
        println!(
            "{}",
            "The in-memory backend is not persisted; set vector_store.seed_file to load these trends at startup."
                .yellow()
        );
    }
    Ok(())
}
