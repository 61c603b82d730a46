use std::sync::Arc;

use anyhow::Result;
use tokio::time::MissedTickBehavior;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use evaluator::config::Config;
use evaluator::db::create_pool;
use evaluator::llm_client::{AnthropicBackend, GenerativeClient, RetryPolicy, MODEL};
use evaluator::orchestrator::{Orchestrator, OrchestratorConfig};
use evaluator::pipeline::EvaluationPipeline;
use evaluator::retrieval::{ingest_reference_documents, RetrievalAssembler};
use evaluator::rubric::RubricRegistry;
use evaluator::store::pg::{ensure_schema, PgContextStore, PgDocumentStore, PgJobStore};
use evaluator::store::DocumentStore;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration first (fails on missing required env vars)
    let config = Config::from_env()?;

    // Initialize structured logging
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(format!("{}={}", env!("CARGO_PKG_NAME"), &config.rust_log))
        }))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting evaluator v{}", env!("CARGO_PKG_VERSION"));

    // Initialize PostgreSQL
    let pool = create_pool(&config.database_url).await?;
    ensure_schema(&pool).await?;

    let documents = Arc::new(PgDocumentStore::new(pool.clone()));
    let jobs = Arc::new(PgJobStore::new(pool.clone()));

    // Load rubrics (built-in set unless a file override is configured)
    let rubrics = Arc::new(match &config.rubric_path {
        Some(path) => {
            let raw = std::fs::read_to_string(path)?;
            info!(path = path.as_str(), "loaded rubric overrides");
            RubricRegistry::from_json(&raw)?
        }
        None => RubricRegistry::builtin(),
    });

    // Ingest the reference corpus into the context store (idempotent across
    // restarts; already-chunked documents are skipped at the row level)
    let context_store = Arc::new(PgContextStore::new(pool));
    let references = documents.reference_documents().await?;
    let chunks = ingest_reference_documents(context_store.as_ref(), &references).await?;
    info!(
        documents = references.len(),
        chunks, "reference corpus ingested"
    );

    // Initialize the generation client
    let retry = RetryPolicy {
        max_attempts: config.max_attempts,
        base_delay: config.retry_base_delay,
    };
    let backend = Arc::new(AnthropicBackend::new(config.anthropic_api_key.clone()));
    let client = GenerativeClient::new(backend, retry.clone());
    info!("generation client initialized (model: {MODEL})");

    let assembler = RetrievalAssembler::new(
        context_store,
        config.retrieval_top_k,
        config.context_char_budget,
    );
    let pipeline = Arc::new(
        EvaluationPipeline::new(
            jobs.clone(),
            documents.clone(),
            assembler,
            client,
            rubrics,
        )
        .with_retrieval_retry(retry),
    );

    let orchestrator = Orchestrator::start(
        jobs,
        documents,
        pipeline,
        OrchestratorConfig {
            worker_count: config.worker_count,
            lease_ttl: config.lease_ttl,
        },
    );

    // Pick up whatever a previous process left unfinished
    let recovered = orchestrator.recover().await?;
    if recovered > 0 {
        info!(recovered, "resumed unfinished jobs");
    }

    info!(
        workers = config.worker_count,
        scan_secs = config.queue_scan_interval.as_secs(),
        "evaluator running"
    );

    // Rescan for externally enqueued jobs until shutdown
    let mut scan = tokio::time::interval(config.queue_scan_interval);
    scan.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = scan.tick() => {
                if let Err(e) = orchestrator.recover().await {
                    warn!(error = %e, "queue scan failed");
                }
            }
        }
    }

    info!("shutdown signal received, draining workers");
    orchestrator.close().await;
    Ok(())
}
