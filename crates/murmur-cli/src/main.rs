//! Murmur binary: config loading, tracing setup, component wiring, and the
//! Slack Socket Mode loop.

mod cli;
mod config;
mod socket;

use std::sync::Arc;

use anyhow::Result;
use clap::Parser;
use tracing::debug;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

use murmur_ai::{LlmBackend, OpenAiBackend};
use murmur_docs::{DocumentExtractor, PlainTextExtractor};
use murmur_orchestrator::MessageOrchestrator;
use murmur_platform::{ChatPlatform, SlackClient};
use murmur_store::{SqliteThreadStore, ThreadStore};
use murmur_stream::RateLimiter;
use murmur_thread::ThreadStateManager;

use cli::Cli;
use config::AppConfig;

fn init_tracing() {
    let env_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::WARN.into())
        .from_env_lossy();

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .compact()
        .init();
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    run(cli).await
}

async fn run(cli: Cli) -> Result<()> {
    let config = AppConfig::load(&cli)?;

    let backend: Arc<dyn LlmBackend> = Arc::new(OpenAiBackend::new(config.openai.clone())?);
    let slack = Arc::new(SlackClient::new(config.slack.clone())?);
    let platform: Arc<dyn ChatPlatform> = slack.clone();

    let store: Option<Arc<dyn ThreadStore>> = config.store_path.as_ref().map(|path| {
        debug!(path = %path.display(), "using the sqlite thread store");
        Arc::new(SqliteThreadStore::new(path)) as Arc<dyn ThreadStore>
    });

    let threads = Arc::new(ThreadStateManager::new(
        Arc::clone(&backend),
        store,
        config.tuning.clone(),
        config.orchestrator.default_model.clone(),
    ));
    let limiter = Arc::new(RateLimiter::new(config.limiter));
    let extractor: Arc<dyn DocumentExtractor> = Arc::new(PlainTextExtractor);

    let orchestrator = Arc::new(MessageOrchestrator::new(
        backend,
        platform,
        threads,
        extractor,
        limiter,
        config.orchestrator.clone(),
    ));

    socket::run_socket_loop(slack, orchestrator, config.socket.clone()).await
}
