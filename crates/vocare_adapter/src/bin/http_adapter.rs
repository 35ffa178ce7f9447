#![forbid(unsafe_code)]

use std::{net::SocketAddr, time::Duration};

use tokio::time::MissedTickBehavior;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use vocare_adapter::{now_unix_ms, router, AdapterRuntime, SERVICE_NAME};
use vocare_os::config::ServiceConfig;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = ServiceConfig::from_env()?;
    let addr: SocketAddr = config.http_bind.parse()?;
    let (runtime, origin) = AdapterRuntime::from_config(&config)?;

    let initial = runtime.clone();
    if !tokio::task::spawn_blocking(move || initial.run_roster_reload_pass(now_unix_ms())).await? {
        warn!("starting with the roster unavailable; identity routes answer 503 until a reload succeeds");
    }

    if let Some(interval_ms) = config.roster_reload_interval_ms {
        let worker = runtime.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_millis(interval_ms));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let pass = worker.clone();
                if let Err(err) =
                    tokio::task::spawn_blocking(move || pass.run_roster_reload_pass(now_unix_ms()))
                        .await
                {
                    warn!(error = %err, "roster reload worker task failed");
                }
            }
        });
    }

    if config.flush_worker_enabled {
        let worker = runtime.clone();
        let interval_ms = config.flush_interval_ms;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_millis(interval_ms));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let pass = worker.clone();
                if let Err(err) =
                    tokio::task::spawn_blocking(move || pass.run_flush_worker_pass()).await
                {
                    warn!(error = %err, "flush worker task failed");
                }
            }
        });
    }

    info!(
        %addr,
        persistence = config.persistence.as_str(),
        creation = config.creation.as_str(),
        store = %config.store_path.display(),
        secret = ?origin,
        flush_worker = config.flush_worker_enabled,
        "{SERVICE_NAME} listening"
    );
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router(runtime.clone()))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    if config.flush_worker_enabled {
        let last = runtime.clone();
        let metrics = tokio::task::spawn_blocking(move || last.run_flush_worker_pass()).await?;
        info!(
            written = metrics.written,
            requeued = metrics.requeued,
            failed = metrics.failed,
            "final flush"
        );
    }
    for failed in runtime.service().failed_results() {
        warn!(
            record_id = %failed.result.record_id,
            code = failed.code,
            reason = %failed.reason,
            "result was never stored"
        );
    }
    let left = runtime.service().pending().len();
    if left > 0 {
        warn!(pending = left, "shutting down with uncollected results");
    }
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        warn!(error = %err, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}
