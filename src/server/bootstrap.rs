use crate::config::GatewayConfig;
use crate::metrics::Metrics;
use crate::{backplane, server, swim};
use anyhow::Result;
use std::sync::Arc;
use tokio::sync::Notify;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// CLI arguments forwarded from `main()`.
pub struct BootstrapArgs {
    pub config_path: std::path::PathBuf,
    pub admin_listen: String,
}

/// Gateway lifecycle: load config → build state → start frontends,
/// admin server and (if configured) cluster membership → block until
/// shutdown signal → drain.
pub async fn run(args: BootstrapArgs) -> Result<()> {
    init_tracing();
    let metrics = Metrics::install();

    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("failed to install rustls crypto provider"))?;

    let config = GatewayConfig::load(&args.config_path)?;
    let state = backplane::configure(&config, metrics)?;

    let shutdown = Arc::new(Notify::new());

    let mut swim_handles = Vec::new();
    if let Some(swim_cfg) = &config.swim {
        match swim::start_fabrics(swim_cfg).await {
            Ok(handles) => {
                tracing::info!(fabrics = swim_cfg.fabrics.len(), "swim: cluster membership started");
                swim_handles = handles;
            }
            Err(e) => {
                tracing::error!("swim: failed to start cluster membership: {}", e);
            }
        }
    }

    let admin_handle = tokio::spawn({
        let state = state.clone();
        let admin_listen = args.admin_listen.clone();
        async move {
            if let Err(e) = server::run_admin_server(&admin_listen, state).await {
                tracing::error!("server: admin failed, error={}", e);
            }
        }
    });

    let mut frontend_handles = Vec::with_capacity(state.frontends.len());
    for frontend in state.frontends.iter() {
        let frontend = frontend.clone();
        let state = state.clone();
        let shutdown = shutdown.clone();
        frontend_handles.push(tokio::spawn(async move {
            if let Err(e) = server::run_frontend(frontend, state, shutdown).await {
                tracing::error!("server: proxy: frontend failed, error={}", e);
            }
        }));
    }

    tracing::info!("server: gateway started, frontends={}", state.frontends.len());

    wait_for_shutdown().await;
    shutdown.notify_waiters();

    for handle in frontend_handles {
        let _ = handle.await;
    }
    admin_handle.abort();
    for handle in swim_handles {
        handle.abort();
    }

    tracing::info!("server: shutdown complete");
    Ok(())
}

fn init_tracing() {
    let (non_blocking, _guard) = tracing_appender::non_blocking::NonBlockingBuilder::default()
        .buffered_lines_limit(128_000)
        .lossy(true)
        .finish(std::io::stdout());

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(non_blocking)
                .with_ansi(false)
                .with_target(false)
                .json(),
        )
        .init();

    std::mem::forget(_guard);
}

async fn wait_for_shutdown() {
    let ctrl_c = tokio::signal::ctrl_c();

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
        _ = ctrl_c => tracing::info!("server: received SIGINT, shutting down"),
        _ = terminate => tracing::info!("server: received SIGTERM, shutting down"),
    }
}
