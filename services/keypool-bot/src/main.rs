//! keypool-bot
//!
//! Single-binary service that:
//! 1. Keeps a persistent pool of API keys scored by admission time
//! 2. Validates sampled keys against the billing endpoint on a cron schedule
//! 3. Pulls fresh keys from the acquisition inbox
//! 4. Reconciles the pool with a Cloudflare KV mirror
//! 5. Serves the operator API, health and metrics on the admin listener

mod admin;
mod config;
mod metrics;
mod upstream_impl;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use key_pool::{
    ACQUIRE_JOB, AcquireJob, MirrorLayout, PoolManager, PoolStore, RECONCILE_JOB, ReconcileJob,
    Reconciler, Scheduler, SystemClock, VALIDATE_JOB, ValidateJob,
};
use openkey_client::{KvClient, TokenInbox};
use tokio::net::TcpListener;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use upstream::{CredentialSource, LogNotifier, MemoryMirror, Mirror, NoopSource, Notifier};

use crate::admin::{AdminState, build_admin_router};
use crate::config::{Config, MirrorConfig, MirrorKind};
use crate::upstream_impl::{HttpValidator, InboxSource, KvMirror, WebhookNotifier};

/// How long in-flight admin requests get to finish after a shutdown signal.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

#[tokio::main]
async fn main() -> Result<()> {
    // JSON logs; LOG_LEVEL wins over RUST_LOG
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_env("LOG_LEVEL")
                .or_else(|_| EnvFilter::try_from_default_env())
                .unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    info!("starting keypool-bot");

    let prometheus_handle =
        metrics::install_recorder().context("failed to install Prometheus recorder")?;

    let args: Vec<String> = std::env::args().collect();
    let cli_config_path = args
        .iter()
        .position(|a| a == "--config")
        .and_then(|i| args.get(i + 1))
        .map(|s| s.as_str());

    let config_path = Config::resolve_path(cli_config_path);
    info!(path = %config_path.display(), "loading configuration");

    let mut config = Config::load(&config_path)
        .with_context(|| format!("failed to load config from {}", config_path.display()))?;

    info!(
        state_path = %config.pool.state_path.display(),
        ttl_secs = config.pool.ttl_secs,
        mirror = ?config.mirror.kind,
        admin_addr = %config.admin.listen_addr,
        "configuration loaded"
    );

    let store = PoolStore::load(
        config.pool.state_path.clone(),
        Duration::from_secs(config.pool.ttl_secs),
        Arc::new(SystemClock),
    )
    .await
    .with_context(|| {
        format!(
            "failed to load pool state from {}",
            config.pool.state_path.display()
        )
    })?;

    let validator_client = reqwest::Client::builder()
        .timeout(Duration::from_secs(config.validator.timeout_secs))
        .build()
        .context("failed to build validator HTTP client")?;
    let validator = Arc::new(HttpValidator::new(
        validator_client,
        config.validator.endpoint.clone(),
    ));

    let manager = Arc::new(PoolManager::new(store, validator));
    info!(members = manager.len().await, "pool loaded");

    let mirror = build_mirror(&mut config.mirror)?;
    let source = build_source(&config);
    let notifier = build_notifier(&config)?;

    let reconciler = Arc::new(Reconciler::new(
        manager.clone(),
        mirror,
        MirrorLayout {
            snapshot_key: config.mirror.snapshot_key.clone(),
            dead_prefix: config.mirror.dead_prefix.clone(),
            delimiter: config.mirror.delimiter.clone(),
        },
        config.acquire_interval(),
    ));
    info!(
        acquire_interval_secs = reconciler.acquire_interval().as_secs(),
        pinned = config.pool.acquire_interval_secs.is_some(),
        "push window young edge set"
    );

    let scheduler = Arc::new(Scheduler::new(notifier));
    scheduler
        .add_job(
            VALIDATE_JOB,
            &config.schedule.validate,
            Arc::new(ValidateJob::new(manager.clone())),
        )
        .await?;
    scheduler
        .add_job(
            ACQUIRE_JOB,
            &config.schedule.acquire,
            Arc::new(AcquireJob::new(
                manager.clone(),
                source,
                config.pool.acquire_batch,
            )),
        )
        .await?;
    scheduler
        .add_job(
            RECONCILE_JOB,
            &config.schedule.reconcile,
            Arc::new(ReconcileJob::new(reconciler.clone())),
        )
        .await?;
    scheduler.start().await;

    let mut admin_state = AdminState::new(manager.clone(), scheduler.clone(), prometheus_handle);
    if config.pool.acquire_interval_secs.is_none() {
        admin_state = admin_state.with_push_window(reconciler);
    }
    let app = build_admin_router(admin_state, config.admin.max_connections);

    let listen_addr = config.admin.listen_addr;
    let listener = TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind to {listen_addr}"))?;
    info!(addr = %listen_addr, "admin API listening");

    let (shutdown_tx, shutdown_rx) = tokio::sync::oneshot::channel::<()>();
    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
            })
            .await
    });

    shutdown_signal().await;

    // No new ticks once shutdown starts; runs in flight finish on their own
    scheduler.stop().await;
    let _ = shutdown_tx.send(());

    match tokio::time::timeout(DRAIN_TIMEOUT, server_handle).await {
        Ok(Ok(Ok(()))) => {
            info!("admin listener drained");
        }
        Ok(Ok(Err(e))) => {
            error!(error = %e, "server error during shutdown");
        }
        Ok(Err(e)) => {
            error!(error = %e, "server task panicked");
        }
        Err(_) => {
            warn!(
                drain_timeout_secs = DRAIN_TIMEOUT.as_secs(),
                "drain timeout exceeded, forcing shutdown"
            );
        }
    }

    info!(members = manager.len().await, "shutdown complete");
    Ok(())
}

/// Mirror selected by `mirror.kind`. Takes the API token out of the config.
fn build_mirror(config: &mut MirrorConfig) -> Result<Arc<dyn Mirror>> {
    match config.kind {
        MirrorKind::Memory => {
            warn!("using in-process mirror; nothing leaves this host");
            Ok(Arc::new(MemoryMirror::new()))
        }
        MirrorKind::Cloudflare => {
            let account_id = config
                .account_id
                .as_deref()
                .context("mirror.account_id is required for the cloudflare mirror")?;
            let namespace_id = config
                .namespace_id
                .as_deref()
                .context("mirror.namespace_id is required for the cloudflare mirror")?;
            let api_token = config
                .api_token
                .take()
                .context("cloudflare mirror needs CF_API_TOKEN or mirror.api_token_file")?;
            let client = reqwest::Client::builder()
                .timeout(Duration::from_secs(config.timeout_secs))
                .build()
                .context("failed to build mirror HTTP client")?;
            info!(account_id, namespace_id, "using Cloudflare KV mirror");
            Ok(Arc::new(KvMirror::new(KvClient::new(
                client,
                &config.api_base,
                account_id,
                namespace_id,
                api_token,
            ))))
        }
    }
}

fn build_source(config: &Config) -> Arc<dyn CredentialSource> {
    match config.acquisition.inbox_path {
        Some(ref path) => {
            info!(path = %path.display(), "acquiring keys from inbox");
            Arc::new(InboxSource::new(TokenInbox::new(path.clone())))
        }
        None => {
            info!("no acquisition inbox configured; acquire job is a no-op");
            Arc::new(NoopSource)
        }
    }
}

fn build_notifier(config: &Config) -> Result<Arc<dyn Notifier>> {
    match config.notify.webhook_url {
        Some(ref url) => {
            let client = reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .context("failed to build webhook HTTP client")?;
            Ok(Arc::new(WebhookNotifier::new(client, url.clone())))
        }
        None => Ok(Arc::new(LogNotifier)),
    }
}

/// Wait for SIGTERM or SIGINT for graceful shutdown.
async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}
