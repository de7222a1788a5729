use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use anyhow::Context;

use agent_inbox::channels::{EmailConfig, ImapMailbox, IngestionPoller, spawn_ingestion_poller};
use agent_inbox::config::{EngineConfig, PollerConfig};
use agent_inbox::decisions::decision_routes;
use agent_inbox::llm::{LlmConfig, create_provider};
use agent_inbox::store::LibSqlBackend;
use agent_inbox::workflow::{Engine, EngineDeps};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install rustls crypto provider before any TLS usage. Err means one is
    // already installed.
    let _ = rustls::crypto::ring::default_provider().install_default();

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let llm_config = LlmConfig::from_env()?;
    let email_config =
        EmailConfig::from_env().context("EMAIL_IMAP_HOST not set, no mailbox to watch")?;
    let engine_config = EngineConfig::from_env()?;
    let poller_config = PollerConfig::from_env()?;

    let http_port: u16 = std::env::var("AGENT_INBOX_HTTP_PORT")
        .unwrap_or_else(|_| "8080".to_string())
        .parse()
        .unwrap_or(8080);

    let db_path = std::env::var("AGENT_INBOX_DB_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("./data/agent-inbox.db"));

    eprintln!("📬 Agent Inbox v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Model: {}", llm_config.model);
    eprintln!("   Mailbox: {}", email_config.username);
    eprintln!("   Database: {}", db_path.display());
    eprintln!(
        "   Polling every {}s (last {} messages)",
        poller_config.interval.as_secs(),
        poller_config.batch_limit
    );
    eprintln!("   Decisions API: http://0.0.0.0:{}/api/runs/suspended\n", http_port);

    // ── Stores ──────────────────────────────────────────────────────────
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    let db = Arc::new(LibSqlBackend::new_local(&db_path).await?);

    // ── Engine ──────────────────────────────────────────────────────────
    let llm = create_provider(&llm_config)?;
    let mailbox = Arc::new(ImapMailbox::new(email_config));
    let engine = Arc::new(Engine::new(
        EngineDeps {
            llm,
            mailbox: mailbox.clone(),
            checkpoints: db.clone(),
            history: db.clone(),
        },
        engine_config,
    ));

    let suspended = engine.list_suspended().await?;
    if !suspended.is_empty() {
        eprintln!("   {} runs awaiting a decision", suspended.len());
    }

    // ── Ingestion ───────────────────────────────────────────────────────
    let poller = Arc::new(IngestionPoller::new(
        mailbox,
        db,
        Arc::clone(&engine),
        poller_config,
    ));
    let (poller_handle, poller_shutdown) = spawn_ingestion_poller(poller);

    // ── Decision channel ────────────────────────────────────────────────
    let app = decision_routes(engine);
    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", http_port))
        .await
        .with_context(|| format!("binding port {http_port}"))?;
    tracing::info!(port = http_port, "Decision server started");

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    tracing::info!("Shutting down");
    poller_shutdown.store(true, Ordering::Relaxed);
    poller_handle.abort();
    Ok(())
}
