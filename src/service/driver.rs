//! # Heartbeat Driver
//!
//! Runs a connection manager's heartbeat on a tokio interval until a
//! shutdown signal arrives, then keeps ticking until every connection has
//! drained or the shutdown timeout is reached.
//!
//! Applications with their own game loop call `heartbeat()` directly and do
//! not need this module.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, instrument, warn};

use super::client::ClientManager;
use super::server::ServerManager;
use super::TickReport;
use crate::error::Result;
use crate::transport::Acceptor;

/// A manager that can be driven by [`run_with_shutdown`]
pub trait Heartbeat {
    fn heartbeat(&mut self) -> TickReport;

    fn tick_interval(&self) -> Duration;

    fn shutdown_timeout(&self) -> Duration;

    /// Stop taking new work and start disconnecting
    fn begin_shutdown(&mut self);

    /// Nothing left to drain
    fn is_idle(&self) -> bool;
}

impl<A: Acceptor> Heartbeat for ServerManager<A> {
    fn heartbeat(&mut self) -> TickReport {
        ServerManager::heartbeat(self)
    }

    fn tick_interval(&self) -> Duration {
        ServerManager::tick_interval(self)
    }

    fn shutdown_timeout(&self) -> Duration {
        ServerManager::shutdown_timeout(self)
    }

    fn begin_shutdown(&mut self) {
        self.shutdown();
    }

    fn is_idle(&self) -> bool {
        ServerManager::is_idle(self)
    }
}

impl Heartbeat for ClientManager {
    fn heartbeat(&mut self) -> TickReport {
        ClientManager::heartbeat(self)
    }

    fn tick_interval(&self) -> Duration {
        ClientManager::tick_interval(self)
    }

    fn shutdown_timeout(&self) -> Duration {
        ClientManager::shutdown_timeout(self)
    }

    fn begin_shutdown(&mut self) {
        self.disconnect();
    }

    fn is_idle(&self) -> bool {
        ClientManager::is_idle(self)
    }
}

/// Drive `manager` until CTRL+C, then drain.
#[instrument(skip(manager))]
pub async fn run<M: Heartbeat>(manager: &mut M) -> Result<()> {
    // Create internal shutdown channel
    let (shutdown_tx, shutdown_rx) = mpsc::channel::<()>(1);
    let signal_tx = shutdown_tx.clone();

    // Only the clone moves into the signal task; the channel stays open
    // until this function returns
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Received CTRL+C signal, shutting down");
                let _ = signal_tx.send(()).await;
            }
            Err(e) => warn!(error = %e, "Failed to listen for CTRL+C"),
        }
    });

    let result = run_with_shutdown(manager, shutdown_rx).await;
    drop(shutdown_tx);
    result
}

/// Drive `manager` until `shutdown_rx` fires (or its sender is dropped), then drain.
#[instrument(skip(manager, shutdown_rx))]
pub async fn run_with_shutdown<M: Heartbeat>(
    manager: &mut M,
    mut shutdown_rx: mpsc::Receiver<()>,
) -> Result<()> {
    let period = manager.tick_interval().max(Duration::from_millis(1));
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    // Heartbeat main loop with graceful shutdown
    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => {
                info!("Shutting down. Waiting for connections to drain...");
                manager.begin_shutdown();
                break;
            }
            _ = interval.tick() => {
                let report = manager.heartbeat();
                if !report.is_quiet() {
                    debug!(
                        accepted = report.accepted.len(),
                        dispatched = report.dispatched,
                        closed = report.closed.len(),
                        "Tick"
                    );
                }
            }
        }
    }

    // Connections bound their own drain time; this caps the whole shutdown
    let timeout = tokio::time::sleep(manager.shutdown_timeout() + period);
    tokio::pin!(timeout);

    loop {
        tokio::select! {
            _ = &mut timeout => {
                warn!("Shutdown timeout reached, forcing exit");
                return Ok(());
            }
            _ = interval.tick() => {
                manager.heartbeat();
                if manager.is_idle() {
                    info!("All connections closed, shutting down");
                    return Ok(());
                }
            }
        }
    }
}
