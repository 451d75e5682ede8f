use chatkeeper::{config::Config, db::Database, llm::LlmClient, platform::TelegramClient, App};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // Load configuration
    let config = Config::from_env()?;
    debug!(?config, "Configuration loaded");
    let shutdown_grace = config.shutdown_grace;

    let db = Database::new(&config)?;
    db.execute_init()?;

    let telegram = Arc::new(TelegramClient::connect(&config).await?);
    let llm_client = Arc::new(LlmClient::new(&config));

    let app = Arc::new(App::build(config, db, telegram.clone(), llm_client));
    app.seed_allow_list().await?;

    let tracker = TaskTracker::new();
    let cancel = CancellationToken::new();
    app.start(&tracker, &cancel);

    let (tx, mut rx) = mpsc::channel(256);
    {
        let cancel = cancel.clone();
        tracker.spawn(async move {
            if let Err(e) = telegram.run_updates(tx, cancel).await {
                error!("Telegram poller failed: {:#}", e);
            }
        });
    }
    {
        let app = app.clone();
        let ingest_tracker = tracker.clone();
        tracker.spawn(async move {
            // Ends once the poller drops its sender.
            while let Some(message) = rx.recv().await {
                app.spawn_ingest(message, &ingest_tracker);
            }
        });
    }

    info!("Bot is running, press Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;

    info!("Shutting down...");
    cancel.cancel();
    tracker.close();
    if tokio::time::timeout(shutdown_grace, tracker.wait()).await.is_err() {
        warn!(
            pending_tasks = tracker.len(),
            "Shutdown grace period elapsed, abandoning in-flight work"
        );
    }
    info!("Stopped");
    Ok(())
}
