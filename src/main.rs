use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use futures::stream::{self, StreamExt};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use inbox_triage::TriageEngine;
use inbox_triage::approval::spawn_expiry_task;
use inbox_triage::clock::SystemClock;
use inbox_triage::config::{ChannelConfig, ConfigHandle, TriageConfig, spawn_config_watcher};
use inbox_triage::escalation::{LogChannel, NotificationChannel};
use inbox_triage::pipeline::types::Message;
use inbox_triage::store::{LibSqlBackend, MemoryStore, Persistence};

const CONFIG_POLL_INTERVAL: Duration = Duration::from_secs(5);

/// Logs go to stderr (stdout carries outcomes), plus a daily file under
/// `TRIAGE_LOG_DIR` when set.
fn init_tracing() -> Option<WorkerGuard> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let (file_layer, guard) = match std::env::var("TRIAGE_LOG_DIR") {
        Ok(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "inbox-triage.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer()
                .with_writer(writer)
                .with_target(true)
                .with_ansi(false);
            (Some(layer), Some(guard))
        }
        Err(_) => (None, None),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_writer(std::io::stderr).with_target(false))
        .with(file_layer)
        .init();
    guard
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _log_guard = init_tracing();

    let config_path = TriageConfig::path_from_env();
    let mut settings = match &config_path {
        Some(path) => TriageConfig::load(path)
            .with_context(|| format!("Failed to load configuration from {}", path.display()))?,
        None => TriageConfig::default(),
    };
    // Tier-1 alerts need somewhere to go.
    if settings.escalation.channels.is_empty() {
        settings
            .escalation
            .channels
            .push(ChannelConfig::new("log", "principal"));
    }
    let config = ConfigHandle::new(settings).context("Invalid configuration")?;

    let principal = std::env::var("TRIAGE_PRINCIPAL").unwrap_or_else(|_| "principal".to_string());
    let workers: usize = std::env::var("TRIAGE_WORKERS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(4)
        .max(1);

    // ── Store ───────────────────────────────────────────────────────────
    let store: Arc<dyn Persistence> = match std::env::var("TRIAGE_DB_PATH") {
        Ok(db_path) => Arc::new(
            LibSqlBackend::new_local(Path::new(&db_path))
                .await
                .with_context(|| format!("Failed to open database at {db_path}"))?,
        ),
        Err(_) => Arc::new(MemoryStore::new()),
    };

    let channels: Vec<Arc<dyn NotificationChannel>> = vec![Arc::new(LogChannel::default())];
    let engine = TriageEngine::new(
        principal.clone(),
        config.clone(),
        store,
        SystemClock::shared(),
        channels,
    )
    .await
    .context("Failed to start triage engine")?
    .with_workers(workers);

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        principal = %principal,
        workers,
        config_version = config.snapshot().version,
        "Inbox triage started"
    );

    // ── Background tasks ────────────────────────────────────────────────
    let cancel = CancellationToken::new();
    let expiry = spawn_expiry_task(engine.queue().clone(), cancel.clone());
    let watcher = config_path
        .map(|path| spawn_config_watcher(config.clone(), path, CONFIG_POLL_INTERVAL));

    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Interrupt received, shutting down");
                cancel.cancel();
            }
        }
    });

    // ── Input: JSON-lines messages on stdin ─────────────────────────────
    let (tx, rx) = mpsc::channel::<Message>(workers * 2);
    let reader = tokio::spawn({
        let cancel = cancel.clone();
        async move {
            let mut lines = BufReader::new(tokio::io::stdin()).lines();
            loop {
                let line = tokio::select! {
                    _ = cancel.cancelled() => break,
                    line = lines.next_line() => line,
                };
                match line {
                    Ok(Some(line)) if line.trim().is_empty() => continue,
                    Ok(Some(line)) => match serde_json::from_str::<Message>(&line) {
                        Ok(message) => {
                            if tx.send(message).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => tracing::warn!(error = %e, "Skipping malformed input line"),
                    },
                    Ok(None) => break,
                    Err(e) => {
                        tracing::error!(error = %e, "Failed to read stdin");
                        break;
                    }
                }
            }
        }
    });

    // ── Output: one JSON outcome per message on stdout ──────────────────
    let engine = &engine;
    let cancel_ref = &cancel;
    let inputs = stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|m| (m, rx)) });
    let outcomes = inputs
        .map(|message| async move {
            let result = engine.process(&message, None, cancel_ref).await;
            (message.id, result)
        })
        .buffered(workers);
    futures::pin_mut!(outcomes);

    let mut stdout = tokio::io::stdout();
    while let Some((message_id, result)) = outcomes.next().await {
        let line = match result {
            Ok(outcome) => serde_json::to_string(&outcome)?,
            Err(e) => {
                tracing::error!(message_id = %message_id, error = %e, "Failed to route message");
                serde_json::json!({ "message_id": message_id, "error": e.to_string() }).to_string()
            }
        };
        stdout.write_all(line.as_bytes()).await?;
        stdout.write_all(b"\n").await?;
        stdout.flush().await?;
    }

    // ── Shutdown ────────────────────────────────────────────────────────
    cancel.cancel();
    let _ = reader.await;
    let _ = expiry.await;
    if let Some(watcher) = watcher {
        watcher.abort();
    }

    let stats = engine.queue().statistics(&principal).await?;
    tracing::info!(
        pending = stats.pending,
        approved = stats.approved,
        rejected = stats.rejected,
        expired = stats.expired,
        escalation = ?engine.dispatcher().all_stats(),
        "Inbox triage stopped"
    );
    Ok(())
}
