use std::sync::Arc;

use tracing::{error, info, warn};

mod app;
mod dispatch;
mod pulse_handlers;
mod rpc;

/// Grace period for background tasks to drain on shutdown.
const SHUTDOWN_GRACE_SECS: u64 = 10;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "ocg_agentd=info,ocg_agent=info,ocg_scheduler=info".into()),
        )
        .init();

    std::process::exit(run().await);
}

async fn run() -> i32 {
    // phase 1: env + file only, enough to find the DB
    let boot = match ocg_core::config::AgentConfig::load(None) {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "configuration failed to load");
            return 2;
        }
    };

    // phase 2: merge the DB-persisted layer beneath file and env
    let config = {
        let conn = match rusqlite::Connection::open(&boot.db_path) {
            Ok(c) => c,
            Err(e) => {
                error!(path = %boot.db_path.display(), error = %e, "cannot open store");
                return 1;
            }
        };
        match ocg_core::config::AgentConfig::load_with_db(None, &conn) {
            Ok(c) => c,
            Err(e) => {
                error!(error = %e, "configuration failed to load");
                return 2;
            }
        }
    };
    if let Err(e) = config.validate() {
        error!(error = %e, "invalid configuration");
        return 2;
    }

    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);

    let state = match app::AppState::build(config).await {
        Ok(s) => Arc::new(s),
        Err(e) => {
            error!(error = %e, "agent init failed");
            return 1;
        }
    };
    let background = app::start_background(&state, shutdown_rx.clone());

    let server = {
        let state = Arc::clone(&state);
        let shutdown = shutdown_rx.clone();
        tokio::spawn(async move { rpc::serve(state, shutdown).await })
    };

    wait_for_signal().await;
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);

    // bounded drain: workers finish claimed pulse events, connections close
    let drain = async {
        for handle in background {
            let _ = handle.await;
        }
        let _ = server.await;
    };
    if tokio::time::timeout(std::time::Duration::from_secs(SHUTDOWN_GRACE_SECS), drain)
        .await
        .is_err()
    {
        warn!("background tasks did not drain within the grace period");
    }

    state.shutdown_cleanup().await;
    info!("agent stopped");
    0
}

async fn wait_for_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = signal(SignalKind::terminate()).expect("install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {}
            _ = term.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
