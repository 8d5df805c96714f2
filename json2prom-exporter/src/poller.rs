//! Periodic polling of one target.

use std::time::Duration;

use reqwest::Client;
use serde_json::Value;
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::config::TargetConfig;
use crate::error::{CycleError, TargetInitError};
use crate::extract::CompiledMetric;
use crate::fetcher::Fetcher;
use crate::mapping::TARGET_LABEL;
use crate::registry::{SeriesKey, SharedRegistry};
use crate::supervisor::wait_for_shutdown;

/// What one successful cycle did to the registry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CycleSummary {
    /// Series created or refreshed.
    pub published: usize,
    /// Items dropped because their value or labels could not be extracted.
    pub skipped: usize,
    /// New series rejected at the series limit.
    pub dropped: usize,
    /// Series retired because the cycle no longer reported them.
    pub retired: usize,
}

/// A poller for a single target.
pub struct TargetPoller {
    name: String,
    period: Duration,
    fetcher: Fetcher,
    metrics: Vec<CompiledMetric>,
    registry: SharedRegistry,
}

impl TargetPoller {
    /// Build a poller, rejecting settings that can never produce a request
    /// or a query result.
    pub fn new(
        config: &TargetConfig,
        client: Client,
        auth_header: Option<&str>,
        registry: SharedRegistry,
    ) -> Result<Self, TargetInitError> {
        let fetcher = Fetcher::new(config, client, auth_header)?;

        let metrics = config
            .metrics
            .iter()
            .map(|metric| {
                CompiledMetric::compile(metric).map_err(|source| TargetInitError::Query {
                    target: config.name.clone(),
                    metric: metric.name.clone(),
                    source,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            name: config.name.clone(),
            period: config.period(),
            fetcher,
            metrics,
            registry,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Run the polling loop until the shutdown signal is raised.
    ///
    /// The first cycle starts immediately. A cycle that overruns its period
    /// delays the next tick instead of queueing extra ones.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        self.registry.track_target(&self.name);

        info!(
            target = %self.name,
            url = %self.fetcher.url(),
            interval_secs = self.period.as_secs(),
            metrics = self.metrics.len(),
            "Starting target poller"
        );

        let mut interval = tokio::time::interval(self.period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = wait_for_shutdown(&mut shutdown) => break,
                _ = interval.tick() => {}
            }

            // Dropping the in-flight cycle cancels the request; nothing has
            // been published before the fetch and decode complete.
            tokio::select! {
                biased;
                _ = wait_for_shutdown(&mut shutdown) => break,
                result = self.poll_once() => match result {
                    Ok(summary) => debug!(
                        target = %self.name,
                        published = summary.published,
                        skipped = summary.skipped,
                        retired = summary.retired,
                        "Poll cycle complete"
                    ),
                    Err(e) => warn!(target = %self.name, error = %e, "Poll cycle failed"),
                }
            }
        }

        info!(target = %self.name, "Target poller stopped");
    }

    /// Perform a single poll cycle: fetch, decode, then publish every metric.
    ///
    /// A fetch or decode failure leaves the registry untouched.
    pub async fn poll_once(&self) -> Result<CycleSummary, CycleError> {
        let result = self.fetch_document().await;

        match result {
            Ok(document) => {
                let summary = self.apply(&document);
                self.registry.record_success(&self.name, summary.skipped);
                Ok(summary)
            }
            Err(e) => {
                self.registry.record_failure(&self.name, e.reason());
                Err(e)
            }
        }
    }

    async fn fetch_document(&self) -> Result<Value, CycleError> {
        let body = self.fetcher.fetch().await?;

        serde_json::from_slice(&body).map_err(|source| CycleError::Parse {
            target: self.name.clone(),
            source,
        })
    }

    /// Publish every metric extracted from an already decoded document.
    ///
    /// Each metric gets its own generation; its upserts and retirement are
    /// applied together.
    pub fn apply(&self, document: &Value) -> CycleSummary {
        let mut summary = CycleSummary::default();

        for metric in &self.metrics {
            let extraction = metric.extract(document);

            for error in &extraction.skipped {
                debug!(
                    target = %self.name,
                    metric = %metric.name(),
                    error = %error,
                    "Skipped item"
                );
            }
            summary.skipped += extraction.skipped.len();

            let cycle = self.registry.begin_cycle(&self.name, metric.name());
            let observations = extraction.observations.into_iter().map(|obs| {
                let labels = obs
                    .labels
                    .into_iter()
                    .chain(std::iter::once((TARGET_LABEL.to_string(), self.name.clone())));
                (SeriesKey::new(metric.name(), labels), obs.value)
            });

            let outcome = self.registry.publish(&cycle, observations);
            summary.published += outcome.upserted;
            summary.dropped += outcome.dropped;
            summary.retired += outcome.retired;
        }

        summary
    }
}
