// acs-bridge: Ingests ISUP v5 and ISAPI access events, normalizes them,
// and delivers them to each tenant's upstream endpoint with a durable
// pending queue for anything the upstream refuses.

use bridge::alert_stream::AlertStreamClient;
use bridge::config::{self, DeviceMode};
use bridge::correlation::CorrelationCache;
use bridge::dispatch::Dispatcher;
use bridge::isup_server::{self, IsupSettings};
use bridge::metrics::BridgeMetrics;
use bridge::normalize::IsapiRules;
use bridge::pipeline::{self, DispatchContext};
use bridge::provision;
use bridge::retry;
use bridge::status_http::StatusServer;
use bridge::storage::pending::PendingStore;
use bridge::tenants::TenantDirectory;
use bridge::webhook::{self, WebhookState};
use clap::Parser;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "acs-bridge", about = "Access-control event bridge")]
struct Args {
    /// Path to the YAML config file.
    #[arg(long, default_value = "/etc/acs-bridge/config.yaml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() {
    let args = Args::parse();

    let cfg = match config::load_config_from_path(&args.config) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("FATAL: failed to load config: {}", e);
            std::process::exit(1);
        }
    };

    // LOG_LEVEL env overrides the config value.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&cfg.server.log_level)),
        )
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "acs-bridge starting");

    // Shared subsystems.  Resource acquisition here is the only fatal zone;
    // after startup every listener is resilient on its own.
    let metrics = Arc::new(BridgeMetrics::new());
    let store = match PendingStore::open(&cfg.server.storage_path, cfg.server.max_pending_days) {
        Ok(store) => Arc::new(store),
        Err(e) => {
            eprintln!(
                "FATAL: cannot open pending store at {}: {}",
                cfg.server.storage_path.display(),
                e
            );
            std::process::exit(1);
        }
    };
    let tenants = Arc::new(TenantDirectory::from_config(&cfg));
    info!(
        tenants = tenants.tenant_count(),
        devices = tenants.device_count(),
        "tenant catalog loaded"
    );
    let dispatcher = Arc::new(
        Dispatcher::new(Duration::from_secs(cfg.server.dispatch_timeout_secs))
            .expect("failed to build HTTP client"),
    );

    let ctx = DispatchContext {
        tenants,
        dispatcher,
        store: store.clone(),
        metrics: metrics.clone(),
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (ingest_tx, worker) = pipeline::start(ctx.clone(), 1024, shutdown_rx.clone());

    // ISUP TCP listener.
    let isup_bind = format!("{}:{}", cfg.server.host, cfg.server.port);
    let isup_listener = match tokio::net::TcpListener::bind(&isup_bind).await {
        Ok(l) => l,
        Err(e) => {
            eprintln!("FATAL: cannot bind ISUP listener on {}: {}", isup_bind, e);
            std::process::exit(1);
        }
    };
    info!(addr = %isup_bind, "ISUP TCP server listening");
    tokio::spawn(isup_server::run(
        isup_listener,
        IsupSettings::from_config(&cfg.server),
        ingest_tx.clone(),
        metrics.clone(),
        shutdown_rx.clone(),
    ));

    // ISAPI webhook listener.
    let rules = IsapiRules::from_config(&cfg.isapi);
    let allowed: Arc<HashSet<String>> =
        Arc::new(cfg.hikvision.allowed_device_ids.iter().cloned().collect());
    let webhook_state = WebhookState {
        secret: cfg.isapi.webhook_secret.clone(),
        callback_secret: cfg.hikvision.callback_secret.clone(),
        rules: rules.clone(),
        allowed_device_ids: allowed.clone(),
        cache: Arc::new(CorrelationCache::new(Duration::from_secs(
            cfg.isapi.correlation_ttl_secs,
        ))),
        tx: ingest_tx.clone(),
        metrics: metrics.clone(),
    };
    let router = webhook::build_router(
        webhook_state,
        &cfg.isapi.webhook_path,
        &cfg.hikvision.callback_path,
    );
    let webhook_bind = format!("{}:{}", cfg.isapi.host, cfg.isapi.port);
    let webhook_listener = match tokio::net::TcpListener::bind(&webhook_bind).await {
        Ok(l) => l,
        Err(e) => {
            eprintln!("FATAL: cannot bind webhook listener on {}: {}", webhook_bind, e);
            std::process::exit(1);
        }
    };
    info!(addr = %webhook_bind, path = %cfg.isapi.webhook_path, "ISAPI webhook listening");
    tokio::spawn(webhook::serve(webhook_listener, router, shutdown_rx.clone()));

    // Status endpoint.
    let status_bind = format!("{}:{}", cfg.server.host, cfg.server.health_check_port);
    match StatusServer::start(&status_bind, metrics.clone(), store.clone(), shutdown_rx.clone())
        .await
    {
        Ok(server) => info!(addr = %server.local_addr(), "status endpoint listening"),
        Err(e) => {
            eprintln!("FATAL: cannot bind status endpoint on {}: {}", status_bind, e);
            std::process::exit(1);
        }
    }

    // One alertStream client per pull-mode device.
    for device in &cfg.hikvision.devices {
        if device.mode != DeviceMode::AlertStream {
            continue;
        }
        let client = AlertStreamClient::new(
            &device.ip,
            &device.username,
            &device.password,
            Duration::from_secs(cfg.isapi.alert_stream_reconnect_secs),
            Duration::from_secs(cfg.isapi.alert_stream_heartbeat_secs),
            rules.clone(),
            allowed.clone(),
            ingest_tx.clone(),
            metrics.clone(),
        );
        info!(device = %device.ip, "starting alertStream client");
        tokio::spawn(client.run(shutdown_rx.clone()));
    }

    // Pending replay loop.
    tokio::spawn(retry::run(
        ctx,
        Duration::from_secs(cfg.server.retry_interval_secs),
        shutdown_rx.clone(),
    ));

    // One-shot provisioning after the listeners are up.
    if cfg.features.auto_configure_terminals {
        let cfg = cfg.clone();
        tokio::spawn(async move {
            let configured = provision::auto_configure_terminals(&cfg).await;
            info!(configured, "terminal auto-configuration pass finished");
        });
    }

    shutdown_signal().await;
    info!("shutting down");
    let _ = shutdown_tx.send(true);

    // Give the dispatch worker a bounded window to drain its backlog.
    if tokio::time::timeout(Duration::from_secs(5), worker).await.is_err() {
        warn!("dispatch worker did not drain within 5s");
    }
    info!("stopped");
}

/// Waits for SIGTERM or Ctrl-C (SIGINT) and returns to trigger graceful shutdown.
async fn shutdown_signal() {
    use tokio::signal;

    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => { info!("received Ctrl+C, shutting down"); },
        _ = terminate => { info!("received SIGTERM, shutting down"); },
    }
}
