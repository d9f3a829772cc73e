use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, anyhow};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

use automation_hub::config::{HubConfig, SinksConfig, SourcesConfig};
use automation_hub::governor::Governor;
use automation_hub::llm::create_provider;
use automation_hub::lock::InstanceLock;
use automation_hub::pipeline::{Admit, Dispatcher, Orchestrator, Summarizer};
use automation_hub::sinks::{EmailSink, NotionSink, Sink, SlackSink, TelegramSink, WebhookSink};
use automation_hub::sources::{
    CalendarSource, DriveSource, MailboxSource, SlackSource, SourceClient, TelegramSource, Watcher,
};
use automation_hub::store::{LedgerStore, LibSqlLedger};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install rustls crypto provider before any TLS usage
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow!("failed to install rustls crypto provider"))?;

    let config = HubConfig::from_env().context("invalid configuration")?;
    let _log_guard = init_tracing(config.log_file.as_deref())?;

    let lock = InstanceLock::acquire(&config.lock_path).context("another hub instance is running")?;

    eprintln!("🤖 Automation hub v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Lock: {}", config.lock_path.display());
    eprintln!("   Ledger: {}", config.ledger_path.display());
    eprintln!("   Model: {}", config.llm.model);

    // ── Ledger ──────────────────────────────────────────────────────────
    let ledger = LibSqlLedger::new_local(&config.ledger_path)
        .await
        .with_context(|| format!("failed to open ledger at {}", config.ledger_path.display()))?;
    let swept = ledger.sweep_stale_pending(config.pending_grace).await?;
    if swept > 0 {
        warn!(swept, "Reset stale pending ledger entries to failed");
    }
    if let Some(days) = config.retention_days {
        let pruned = ledger.prune_done(days).await?;
        info!(pruned, keep_days = days, "Pruned old ledger entries");
    }
    let ledger: Arc<dyn LedgerStore> = Arc::new(ledger);

    // ── Pipeline ────────────────────────────────────────────────────────
    let llm = create_provider(&config.llm)?;
    let governor = Governor::new(config.ai_permits, config.poll_permits);
    let summarizer = Arc::new(Summarizer::new(
        llm,
        governor.clone(),
        config.retry.clone(),
        config.pipeline.clone(),
    ));

    let sinks = build_sinks(&config.sinks);
    let dispatcher = Arc::new(Dispatcher::new(sinks, config.retry.clone()));
    let names = dispatcher.sink_names();
    eprintln!(
        "   Sinks: {}",
        if names.is_empty() { "none".to_string() } else { names.join(", ") }
    );

    let sources = build_sources(&config.sources);
    eprintln!(
        "   Sources: {}\n",
        if sources.is_empty() {
            "none".to_string()
        } else {
            sources.iter().map(|(s, _)| s.name()).collect::<Vec<_>>().join(", ")
        }
    );
    if sources.is_empty() {
        warn!("No sources configured; the hub will idle until stopped");
    }

    let orchestrator = Orchestrator::new(
        Arc::clone(&ledger),
        sources.iter().map(|(s, _)| Arc::clone(s)).collect(),
        summarizer,
        dispatcher,
        config.retry.clone(),
        config.orchestrator.clone(),
    );
    orchestrator.start();

    // ── Watchers ────────────────────────────────────────────────────────
    let cancel = CancellationToken::new();
    let admit: Arc<dyn Admit> = orchestrator.clone();
    let watchers: Vec<_> = sources
        .into_iter()
        .map(|(source, cadence)| {
            Watcher::new(
                source,
                Arc::clone(&admit),
                governor.clone(),
                config.retry.clone(),
                cadence,
            )
            .spawn(cancel.child_token())
        })
        .collect();
    let sweeper = orchestrator.spawn_sweeper(
        config.pending_grace,
        config.sweep_interval,
        cancel.child_token(),
    );

    shutdown_signal().await;
    info!("Shutdown requested");

    cancel.cancel();
    for result in futures::future::join_all(watchers).await {
        if let Err(e) = result {
            error!(error = %e, "Watcher task ended abnormally");
        }
    }
    if let Err(e) = sweeper.await {
        error!(error = %e, "Orphan sweeper ended abnormally");
    }
    orchestrator.shutdown(config.shutdown_grace).await;
    governor.close();

    lock.release()?;
    info!("Hub stopped");
    Ok(())
}

fn init_tracing(
    log_file: Option<&Path>,
) -> anyhow::Result<Option<tracing_appender::non_blocking::WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let (file_layer, guard) = match log_file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("cannot open log file {}", path.display()))?;
            let (writer, guard) = tracing_appender::non_blocking(file);
            let layer = fmt::layer()
                .with_writer(writer)
                .with_ansi(false)
                .with_target(false);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false))
        .with(file_layer)
        .init();
    Ok(guard)
}

fn build_sources(config: &SourcesConfig) -> Vec<(Arc<dyn SourceClient>, Duration)> {
    let mut sources: Vec<(Arc<dyn SourceClient>, Duration)> = Vec::new();
    if let Some(c) = &config.telegram {
        sources.push((Arc::new(TelegramSource::new(c)), c.cadence));
    }
    if let Some(c) = &config.slack {
        sources.push((Arc::new(SlackSource::new(c)), c.cadence));
    }
    if let Some(c) = &config.drive {
        sources.push((Arc::new(DriveSource::new(c)), c.cadence));
    }
    if let Some(c) = &config.mailbox {
        let senders = &c.allowed_senders;
        let allowed = if senders.iter().any(|s| s == "*") {
            "everyone".to_string()
        } else if senders.is_empty() {
            "none (deny all)".to_string()
        } else {
            senders.join(", ")
        };
        info!(host = %c.imap_host, allowed = %allowed, "Mailbox source enabled");
        sources.push((Arc::new(MailboxSource::new(c.clone())), c.cadence));
    }
    if let Some(c) = &config.calendar {
        sources.push((Arc::new(CalendarSource::new(c)), c.cadence));
    }
    sources
}

fn build_sinks(config: &SinksConfig) -> Vec<Arc<dyn Sink>> {
    let mut sinks: Vec<Arc<dyn Sink>> = Vec::new();
    if let Some(c) = &config.telegram {
        sinks.push(Arc::new(TelegramSink::new(c)));
    }
    if let Some(c) = &config.slack {
        sinks.push(Arc::new(SlackSink::new(c)));
    }
    if let Some(c) = &config.notion {
        sinks.push(Arc::new(NotionSink::new(c)));
    }
    if let Some(c) = &config.webhook {
        sinks.push(Arc::new(WebhookSink::new(c)));
    }
    if let Some(c) = &config.email {
        sinks.push(Arc::new(EmailSink::new(c.clone())));
    }
    sinks
}

/// Resolves on Ctrl-C or, on Unix, SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Cannot listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
