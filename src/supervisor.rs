//! Supervision: startup reconciliation, background loops, shutdown.
//!
//! [`run`] owns the process lifetime: reconcile orphaned containers, start
//! the health sweep and the limiter janitor, serve the listener, and on
//! SIGINT/SIGTERM walk the graceful-shutdown sequence. Background loop
//! errors are logged and retried next tick, never fatal.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::api;
use crate::broker::Broker;
use crate::container::HealthStatus;
use crate::session::TerminateReason;

/// Hard deadline converting a graceful shutdown into a forced one.
const SHUTDOWN_HARD_DEADLINE: Duration = Duration::from_secs(5);

/// One pass of the container health sweep: classify every live session's
/// container and terminate sessions whose container is gone.
pub async fn sweep_containers_once(broker: &Arc<Broker>) {
    let sessions = broker.registry.snapshot();
    if sessions.is_empty() {
        return;
    }
    let handles: Vec<_> = sessions.iter().map(|s| s.container.clone()).collect();
    let statuses = broker.adapter.health_check(&handles).await;

    for session in sessions {
        match statuses.get(&session.container) {
            Some(HealthStatus::Gone) => {
                tracing::warn!(session = %session.id, container = %session.container, "container gone, terminating session");
                broker
                    .registry
                    .terminate(&session, TerminateReason::ContainerGone)
                    .await;
            }
            Some(HealthStatus::Unhealthy) => {
                tracing::warn!(session = %session.id, container = %session.container, "container unhealthy");
            }
            Some(HealthStatus::Ok) | None => {}
        }
    }
}

/// Periodic container health sweep.
fn spawn_health_sweep(broker: Arc<Broker>, cancel: CancellationToken) {
    let interval = broker.config.monitor_interval;
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await; // consume the immediate first tick
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => sweep_containers_once(&broker).await,
            }
        }
        tracing::debug!("health sweep stopped");
    });
}

/// Periodic rate-limiter bucket sweep.
fn spawn_limiter_janitor(broker: Arc<Broker>, cancel: CancellationToken) {
    let interval = broker.config.throttle_window;
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => broker.limiters.sweep(),
            }
        }
        tracing::debug!("limiter janitor stopped");
    });
}

/// The graceful-shutdown sequence: refuse new upgrades, let attached
/// sockets drain for the configured grace, then terminate every session
/// under a hard deadline.
pub async fn shutdown_sequence(broker: &Arc<Broker>) {
    broker.shutdown.begin();

    let grace = broker.config.shutdown_grace;
    if broker.shutdown.wait_for_drain(grace).await {
        tracing::info!("all sockets drained");
    } else {
        tracing::warn!(
            remaining = broker.shutdown.active_connections(),
            "shutdown grace expired with sockets still attached"
        );
    }

    let teardown = broker.registry.terminate_all(TerminateReason::Shutdown);
    if tokio::time::timeout(SHUTDOWN_HARD_DEADLINE, teardown)
        .await
        .is_err()
    {
        tracing::error!("session teardown exceeded the hard deadline");
    }
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(e) => {
            tracing::warn!(error = %e, "SIGTERM handler unavailable, falling back to ctrl-c");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

/// Run the broker until interrupted.
pub async fn run(broker: Arc<Broker>) -> anyhow::Result<()> {
    // Startup reconciliation: stale labelled containers are removed,
    // running ones are left for their shells to finish.
    match broker.adapter.reconcile().await {
        Ok(report) => {
            tracing::info!(
                removed = report.removed.len(),
                left_running = report.left_running.len(),
                "container reconciliation complete"
            );
        }
        Err(e) => {
            tracing::warn!(error = %e, "container reconciliation failed, continuing");
        }
    }

    let cancel = CancellationToken::new();
    if broker.config.enable_resource_monitoring {
        spawn_health_sweep(broker.clone(), cancel.child_token());
    }
    spawn_limiter_janitor(broker.clone(), cancel.child_token());

    let addr = SocketAddr::from(([0, 0, 0, 0], broker.config.port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "listening");

    let app = api::router(broker.clone());
    let serve_cancel = cancel.clone();
    let server = tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(serve_cancel.cancelled_owned())
        .await
    });

    wait_for_signal().await;
    tracing::info!("shutdown signal received");

    shutdown_sequence(&broker).await;

    cancel.cancel();
    match server.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::error!(error = %e, "server error during shutdown"),
        Err(e) => tracing::error!(error = %e, "server task panicked"),
    }
    tracing::info!("broker stopped");
    Ok(())
}
