// Licensed under the MIT license found in the LICENSE file
// at the root of this repository, or at
// https://opensource.org/licenses/MIT.

#[macro_use]
extern crate tracing;

mod activity;
mod api;
mod caldav;
mod config;
mod error;
mod models;
mod reconciler;
mod runner;
mod scheduler;
mod slug;
mod store;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tracing_subscriber::{EnvFilter, fmt};

use activity::ActivityTracker;
use api::AppState;
use config::Config;
use scheduler::Scheduler;
use store::EventStore;

fn init_tracing(rust_log: &str) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(rust_log))?;

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .init();

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load()?;
    init_tracing(&config.rust_log)?;

    info!(port = config.port, environment = %config.environment, "starting calbridge");

    let config = Arc::new(config);
    let store = EventStore::connect(&config.database_path, config.sqlite_max_connections).await?;
    let activity = ActivityTracker::new(config.activity_history_limit);

    let scheduler = Scheduler::new(Arc::clone(&config), store.clone(), Arc::clone(&activity));
    scheduler.start().await?;

    spawn_janitor(store.clone(), config.sync_log_retention_days);

    let state = AppState {
        store,
        activity,
        scheduler: Arc::clone(&scheduler),
    };
    let app = api::create_router(state);

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.port)).await?;
    info!(addr = %listener.local_addr()?, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    scheduler.shutdown().await;
    info!("shutdown complete");

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        let Ok(mut sig) = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
        else {
            return;
        };
        sig.recv().await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }

    info!("shutdown signal received");
}

/// Periodically prunes sync logs older than the configured retention window.
fn spawn_janitor(store: EventStore, retention_days: i64) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(6 * 3600));
        loop {
            ticker.tick().await;
            let cutoff = chrono::Utc::now() - chrono::Duration::days(retention_days);
            match store.clean_old_sync_logs(cutoff).await {
                Ok(n) if n > 0 => info!(pruned = n, "cleaned old sync logs"),
                Ok(_) => {}
                Err(e) => error!(error = %e, "failed to clean old sync logs"),
            }
        }
    });
}
