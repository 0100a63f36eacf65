//! Daemon lifecycle management for ztex-miner.
//!
//! The fleet supervisor and the group poll loops are plain threads doing
//! blocking USB and HTTP I/O. The async side only waits for signals:
//! SIGINT/SIGTERM shut down, SIGUSR1/SIGHUP request a rescan.

use std::sync::{mpsc, Arc};
use std::thread;

use tokio::signal::unix::{self, SignalKind};
use tokio_util::sync::CancellationToken;

use crate::config::MinerConfig;
use crate::fleet::{FleetCommand, FleetManager};
use crate::rpc::{ConnectionEffort, HttpJobServer};
use crate::tracing::prelude::*;
use crate::transport::UsbEnumerator;

/// The main daemon.
pub struct Daemon {
    config: MinerConfig,
    shutdown: CancellationToken,
}

impl Daemon {
    pub fn new(config: MinerConfig) -> Self {
        Self {
            config,
            shutdown: CancellationToken::new(),
        }
    }

    /// Run the daemon until shutdown is requested.
    pub async fn run(self) -> anyhow::Result<()> {
        let (command_tx, command_rx) = mpsc::channel::<FleetCommand>();

        for (i, endpoint) in self.config.endpoints.iter().enumerate() {
            let role = if i == 0 { "primary" } else { "backup" };
            info!(url = %endpoint.url, user = %endpoint.user, "Using {} job server", role);
        }

        // The blocking HTTP client owns its own runtime, so it is created
        // and dropped on the supervisor thread.
        let supervisor = thread::Builder::new().name("fleet".into()).spawn({
            let config = self.config.clone();
            let shutdown = self.shutdown.clone();
            move || {
                let effort = ConnectionEffort::default();
                let result = HttpJobServer::new(effort.clone())
                    .map_err(crate::error::Error::from)
                    .and_then(|server| {
                        FleetManager::new(
                            config,
                            Box::new(UsbEnumerator::new()),
                            Arc::new(server),
                            effort,
                            shutdown.clone(),
                        )
                        .run(command_rx)
                    });
                if let Err(e) = &result {
                    error!("Fleet supervisor failed: {}", e);
                }
                shutdown.cancel();
                result
            }
        })?;

        info!("Started.");
        info!("For debugging, set RUST_LOG=ztex_miner=debug.");

        // Install signal handlers
        let mut sigint = unix::signal(SignalKind::interrupt())?;
        let mut sigterm = unix::signal(SignalKind::terminate())?;
        let mut sigusr1 = unix::signal(SignalKind::user_defined1())?;
        let mut sighup = unix::signal(SignalKind::hangup())?;

        loop {
            tokio::select! {
                _ = sigint.recv() => {
                    info!("Received SIGINT.");
                    break;
                },
                _ = sigterm.recv() => {
                    info!("Received SIGTERM.");
                    break;
                },
                _ = sigusr1.recv() => {
                    info!("Received SIGUSR1, rescanning.");
                    let _ = command_tx.send(FleetCommand::Rescan);
                },
                _ = sighup.recv() => {
                    info!("Received SIGHUP, rescanning.");
                    let _ = command_tx.send(FleetCommand::Rescan);
                },
                _ = self.shutdown.cancelled() => break,
            }
        }

        // Initiate shutdown
        self.shutdown.cancel();

        // Wait for the supervisor, which joins the poll loops
        let result = tokio::task::spawn_blocking(move || supervisor.join()).await?;
        info!("Exiting.");
        match result {
            Ok(outcome) => outcome.map_err(anyhow::Error::from),
            Err(_) => anyhow::bail!("fleet supervisor panicked"),
        }
    }
}
