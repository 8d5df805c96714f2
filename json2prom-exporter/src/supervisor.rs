//! Starts one poller per target and shuts them all down together.

use std::time::Duration;

use reqwest::Client;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::{TargetConfig, TargetErrorPolicy};
use crate::error::{StartupError, TargetInitError};
use crate::poller::TargetPoller;
use crate::registry::SharedRegistry;

/// Resolve once shutdown has been requested.
///
/// A dropped sender counts as a shutdown request.
pub async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow_and_update() {
            return;
        }
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

/// Owns the poller tasks and the shared cancellation signal.
pub struct Supervisor {
    registry: SharedRegistry,
    client: Client,
    auth_header: Option<String>,
    policy: TargetErrorPolicy,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    tasks: Vec<JoinHandle<()>>,
    failed: Vec<TargetInitError>,
}

impl Supervisor {
    /// Create a supervisor with a shared HTTP client.
    pub fn new(
        registry: SharedRegistry,
        auth_header: Option<String>,
        policy: TargetErrorPolicy,
    ) -> Result<Self, StartupError> {
        let client = Client::builder()
            .user_agent(concat!("json2prom/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(StartupError::Client)?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        Ok(Self {
            registry,
            client,
            auth_header,
            policy,
            shutdown_tx,
            shutdown_rx,
            tasks: Vec::new(),
            failed: Vec::new(),
        })
    }

    /// Build a poller for every target, then spawn them.
    ///
    /// Under [`TargetErrorPolicy::Abort`] the first bad target fails the
    /// whole start and nothing is spawned. Under [`TargetErrorPolicy::Skip`]
    /// bad targets are logged and left out; starting fails only if no
    /// target is left.
    pub fn start(&mut self, targets: &[TargetConfig]) -> Result<usize, StartupError> {
        let mut pollers = Vec::with_capacity(targets.len());

        for target in targets {
            match TargetPoller::new(
                target,
                self.client.clone(),
                self.auth_header.as_deref(),
                self.registry.clone(),
            ) {
                Ok(poller) => pollers.push(poller),
                Err(e) => match self.policy {
                    TargetErrorPolicy::Abort => return Err(e.into()),
                    TargetErrorPolicy::Skip => {
                        error!(
                            target = %e.target(),
                            error = %e,
                            "Skipping target that failed to initialize"
                        );
                        self.failed.push(e);
                    }
                },
            }
        }

        if pollers.is_empty() {
            return Err(StartupError::NoTargets {
                failed: self.failed.len(),
            });
        }

        let started = pollers.len();
        for poller in pollers {
            let shutdown = self.shutdown_rx.clone();
            self.tasks.push(tokio::spawn(poller.run(shutdown)));
        }

        info!(
            started,
            failed = self.failed.len(),
            "Target pollers running"
        );
        Ok(started)
    }

    /// A receiver for the shared cancellation signal.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.shutdown_rx.clone()
    }

    /// Raise the cancellation signal without waiting.
    pub fn trigger_shutdown(&self) {
        // send_replace never fails, even with no receiver left.
        self.shutdown_tx.send_replace(true);
    }

    /// Targets that were skipped at startup.
    pub fn failed(&self) -> &[TargetInitError] {
        &self.failed
    }

    /// Number of spawned pollers.
    pub fn running(&self) -> usize {
        self.tasks.len()
    }

    /// Signal every poller and wait up to `grace` for them to exit.
    ///
    /// Returns false if some pollers had to be aborted.
    pub async fn shutdown(self, grace: Duration) -> bool {
        self.trigger_shutdown();

        let mut tasks = self.tasks;
        let drained = tokio::time::timeout(grace, async {
            for task in tasks.iter_mut() {
                if let Err(e) = task.await {
                    warn!(error = %e, "Poller task ended abnormally");
                }
            }
        })
        .await
        .is_ok();

        if !drained {
            warn!(grace_secs = grace.as_secs(), "Pollers did not stop in time, aborting");
            for task in &tasks {
                task.abort();
            }
        }

        drained
    }
}
