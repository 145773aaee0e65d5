//! Strata CLI - Command-line interface
//!
//! Usage:
//!   strata query <question> [--repeat N] [--corpus docs.json]
//!   strata bump-version [namespace]
//!   strata invalidate-tag <name>
//!   strata stats
//!   strata check-config

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use strata_cache::{Invalidator, MetricsSink};
use strata_core::{
    AppConfig, DecodingParams, LoggingConfig, QueryOptions, StoreBackend, StoreConfig,
};
use strata_rag::providers::InMemoryIndex;
use strata_rag::{create_embedder, create_llm_client, RagPipeline};
use strata_store::{CacheStore, ErrorTally, MemoryStore, ResilientStore};
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(name = "strata")]
#[command(about = "Layered cache for retrieval-augmented generation")]
#[command(version)]
struct Cli {
    /// Configuration file (TOML); environment variables override it
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Answer a question through the cached pipeline
    Query {
        /// Question to ask
        question: String,

        /// Ask the same question this many times
        #[arg(long, default_value_t = 1)]
        repeat: u32,

        /// JSON file with `[{"id": ..., "text": ...}]` documents
        #[arg(long)]
        corpus: Option<PathBuf>,

        /// Override retrieval_top_k
        #[arg(long)]
        top_k: Option<usize>,

        /// Sampling temperature; anything but 0 bypasses the answer cache
        #[arg(long)]
        temperature: Option<f32>,
    },
    /// Bump a corpus version counter, orphaning its retrieval entries
    BumpVersion {
        /// Counter namespace (defaults to corpus_version_namespace)
        namespace: Option<String>,
    },
    /// Delete every key registered under a tag, e.g. `doc:doc1`
    InvalidateTag { name: String },
    /// Print the fleet-wide cache counters kept in the store
    Stats,
    /// Load and validate the configuration, then print it
    CheckConfig,
}

#[derive(Debug, Deserialize)]
struct CorpusDocument {
    id: String,
    text: String,
}

const SAMPLE_CORPUS: &[(&str, &str)] = &[
    ("doc1", "Our refund policy is 30 days."),
    ("doc2", "Shipping takes 3–5 days."),
];

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;
    init_tracing(&config.logging);

    match cli.command {
        Commands::Query {
            question,
            repeat,
            corpus,
            top_k,
            temperature,
        } => {
            let index = load_corpus(&config, corpus.as_deref()).await?;
            let pipeline = RagPipeline::new(
                config.pipeline.clone(),
                connect_store(&config.store).await?,
                config.store.operation_timeout(),
                create_embedder(&config.llm, &config.pipeline)?,
                Arc::new(index),
                create_llm_client(&config.llm, &config.pipeline)?,
            )?;

            let mut options = QueryOptions::default();
            if let Some(k) = top_k {
                options = options.with_top_k(k);
            }
            if let Some(temperature) = temperature {
                options = options.with_decoding(DecodingParams {
                    temperature,
                    ..config.pipeline.answer_decoding_params.clone()
                });
            }

            // Keeps the local embedding tier coherent with other processes
            let shutdown = CancellationToken::new();
            let listener = pipeline
                .spawn_invalidation_listener(shutdown.clone())
                .await?;

            for run in 1..=repeat.max(1) {
                let start = Instant::now();
                let response = pipeline
                    .query_with_options(&question, options.clone())
                    .await?;
                println!(
                    "# run {run} ({:.1} ms)",
                    start.elapsed().as_secs_f64() * 1000.0
                );
                println!("{}", serde_json::to_string_pretty(&response)?);
            }

            println!("# metrics");
            println!(
                "{}",
                serde_json::to_string_pretty(&pipeline.metrics().snapshot())?
            );

            shutdown.cancel();
            if let Some(listener) = listener {
                listener.await.context("invalidation listener panicked")?;
            }
        }
        Commands::BumpVersion { namespace } => {
            let store = resilient(&config).await?;
            let namespace =
                namespace.unwrap_or_else(|| config.pipeline.corpus_version_namespace.clone());
            let invalidator = Invalidator::new(store, namespace.clone());
            let version = invalidator.bump_version().await?;
            println!("version:{namespace} = {version}");
        }
        Commands::InvalidateTag { name } => {
            let store = resilient(&config).await?;
            let invalidator =
                Invalidator::new(store, config.pipeline.corpus_version_namespace.clone());
            let deleted = invalidator.invalidate_tag(&name).await?;
            println!("tag:{name}: {deleted} keys deleted");
        }
        Commands::Stats => {
            let sink = MetricsSink::mirrored(resilient(&config).await?);
            let snapshot = sink.fleet_snapshot().await?;
            println!("{}", serde_json::to_string_pretty(&snapshot)?);
        }
        Commands::CheckConfig => {
            config.pipeline.validate()?;
            let store = resilient(&config).await?;
            let reachable = store.get("version:probe", &ErrorTally::new()).await.is_ok();
            println!("{}", serde_json::to_string_pretty(&config.pipeline)?);
            println!(
                "# store: {:?} ({})",
                config.store.backend,
                if reachable { "reachable" } else { "unreachable" }
            );
        }
    }

    Ok(())
}

fn load_config(path: Option<&Path>) -> anyhow::Result<AppConfig> {
    let config = match path {
        Some(path) => AppConfig::from_file(path)?.with_env_override()?,
        None => AppConfig::from_env()?,
    };
    Ok(config)
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        ["strata", "strata_core", "strata_store", "strata_cache", "strata_rag"]
            .iter()
            .map(|target| format!("{target}={}", logging.level))
            .collect::<Vec<_>>()
            .join(",")
            .into()
    });

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_file(logging.include_location)
        .with_line_number(logging.include_location);

    if logging.json_format {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn connect_store(config: &StoreConfig) -> anyhow::Result<Arc<dyn CacheStore>> {
    match config.backend {
        StoreBackend::Memory => Ok(Arc::new(MemoryStore::new())),
        #[cfg(feature = "redis")]
        StoreBackend::Redis => Ok(Arc::new(
            strata_store::RedisStore::connect(&config.redis_url)
                .await
                .with_context(|| format!("connecting to {}", config.redis_url))?,
        )),
        #[cfg(not(feature = "redis"))]
        StoreBackend::Redis => {
            anyhow::bail!("the redis backend requires building with `--features redis`")
        }
    }
}

/// Store wrapper for the administrative commands
///
/// Errors surface instead of degrading so the operator sees them.
async fn resilient(config: &AppConfig) -> anyhow::Result<ResilientStore> {
    Ok(ResilientStore::new(
        connect_store(&config.store).await?,
        false,
        config.store.operation_timeout(),
    ))
}

async fn load_corpus(config: &AppConfig, path: Option<&Path>) -> anyhow::Result<InMemoryIndex> {
    let documents = match path {
        Some(path) => {
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("reading corpus {}", path.display()))?;
            parse_corpus(&content)?
        }
        None => SAMPLE_CORPUS
            .iter()
            .map(|(id, text)| CorpusDocument {
                id: id.to_string(),
                text: text.to_string(),
            })
            .collect(),
    };

    let index = InMemoryIndex::new(create_embedder(&config.llm, &config.pipeline)?);
    for doc in documents {
        index.add(doc.id, doc.text).await?;
    }
    tracing::info!(documents = index.len().await, "Corpus indexed");
    Ok(index)
}

fn parse_corpus(content: &str) -> anyhow::Result<Vec<CorpusDocument>> {
    serde_json::from_str(content).context("corpus must be a JSON array of {id, text}")
}
