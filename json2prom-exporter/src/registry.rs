//! Live store of discovered series and their per-cycle bookkeeping.

use std::collections::{BTreeMap, HashMap};
use std::fmt::Write;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::config::SeriesConfig;
use crate::error::FailureReason;
use crate::mapping::{TARGET_LABEL, format_labels, format_value};

/// A unique identifier for a time series.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SeriesKey {
    /// The metric name.
    pub name: String,
    /// Label pairs sorted by name, each name present once.
    pub labels: Vec<(String, String)>,
}

impl SeriesKey {
    /// Build a key from label pairs given in any order.
    ///
    /// If a label name repeats, the last value wins.
    pub fn new<I, K, V>(name: impl Into<String>, labels: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        let labels: BTreeMap<String, String> = labels
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();

        Self {
            name: name.into(),
            labels: labels.into_iter().collect(),
        }
    }

    /// Format labels for Prometheus exposition format.
    pub fn format_labels(&self) -> String {
        format_labels(&self.labels)
    }
}

/// The (target, metric) pair a generation counter belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CycleScope {
    pub target: String,
    pub metric: String,
}

/// Token for one publish pass of one metric definition.
#[derive(Debug, Clone)]
pub struct Cycle {
    scope: Arc<CycleScope>,
    generation: u64,
}

impl Cycle {
    pub fn scope(&self) -> &CycleScope {
        &self.scope
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }
}

/// One series in a snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub key: SeriesKey,
    pub value: f64,
}

#[derive(Debug, Clone)]
struct SeriesEntry {
    value: f64,
    generation: u64,
    scope: Arc<CycleScope>,
}

/// Registry statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistryStats {
    /// Series created.
    pub series_created: u64,
    /// Upserts that refreshed an existing series.
    pub series_updated: u64,
    /// Series removed because a cycle no longer reported them.
    pub series_retired: u64,
    /// New series rejected because max_series was reached.
    pub series_dropped: u64,
}

/// Per-target poll statistics.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PollStats {
    pub cycles_succeeded: u64,
    pub fetch_failures: u64,
    pub parse_failures: u64,
    pub items_skipped: u64,
    /// Unix time of the last successful cycle, in seconds.
    pub last_success: Option<f64>,
}

/// Counts from one [`SeriesRegistry::publish`] call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishOutcome {
    pub upserted: usize,
    pub dropped: usize,
    pub retired: usize,
}

#[derive(Default)]
struct Inner {
    series: HashMap<SeriesKey, SeriesEntry>,
    generations: HashMap<CycleScope, u64>,
    stats: RegistryStats,
}

/// Thread-safe series registry shared by all pollers and the HTTP server.
pub struct SeriesRegistry {
    inner: RwLock<Inner>,
    polls: RwLock<BTreeMap<String, PollStats>>,
    config: SeriesConfig,
    self_prefix: String,
}

impl SeriesRegistry {
    /// Create an empty registry.
    pub fn new(self_prefix: impl Into<String>, config: SeriesConfig) -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            polls: RwLock::new(BTreeMap::new()),
            config,
            self_prefix: self_prefix.into(),
        }
    }

    /// Start a new cycle for a (target, metric) pair.
    ///
    /// Generations are strictly increasing per pair and never reused.
    pub fn begin_cycle(&self, target: &str, metric: &str) -> Cycle {
        let scope = CycleScope {
            target: target.to_string(),
            metric: metric.to_string(),
        };

        let mut inner = self.inner.write();
        let counter = inner.generations.entry(scope.clone()).or_insert(0);
        *counter += 1;

        Cycle {
            scope: Arc::new(scope),
            generation: *counter,
        }
    }

    /// Create or refresh a series.
    ///
    /// A new series is dropped (and counted) once `max_series` is reached;
    /// refreshing an existing series always succeeds.
    pub fn upsert(&self, cycle: &Cycle, key: SeriesKey, value: f64) {
        let mut inner = self.inner.write();
        self.upsert_locked(&mut inner, cycle, key, value);
    }

    /// Remove every series of the cycle's (target, metric) that was not
    /// refreshed recently enough.
    ///
    /// With `grace_cycles = 0` this is every series not upserted during
    /// `cycle`. Must be called after all upserts of that cycle.
    pub fn retire_stale(&self, cycle: &Cycle) -> usize {
        let mut inner = self.inner.write();
        self.retire_locked(&mut inner, cycle)
    }

    /// Apply a whole cycle: upsert every observation, then retire stale
    /// series, under one lock so readers never see a half-applied cycle.
    pub fn publish<I>(&self, cycle: &Cycle, observations: I) -> PublishOutcome
    where
        I: IntoIterator<Item = (SeriesKey, f64)>,
    {
        let mut outcome = PublishOutcome::default();
        let mut inner = self.inner.write();

        for (key, value) in observations {
            if self.upsert_locked(&mut inner, cycle, key, value) {
                outcome.upserted += 1;
            } else {
                outcome.dropped += 1;
            }
        }
        outcome.retired = self.retire_locked(&mut inner, cycle);

        outcome
    }

    fn upsert_locked(&self, inner: &mut Inner, cycle: &Cycle, key: SeriesKey, value: f64) -> bool {
        if let Some(entry) = inner.series.get_mut(&key) {
            entry.value = value;
            entry.generation = cycle.generation;
            entry.scope = Arc::clone(&cycle.scope);
            inner.stats.series_updated += 1;
            return true;
        }

        if inner.series.len() >= self.config.max_series {
            inner.stats.series_dropped += 1;
            warn!(
                max_series = self.config.max_series,
                metric = %key.name,
                "Max series limit reached, dropping new series"
            );
            return false;
        }

        inner.series.insert(
            key,
            SeriesEntry {
                value,
                generation: cycle.generation,
                scope: Arc::clone(&cycle.scope),
            },
        );
        inner.stats.series_created += 1;
        true
    }

    fn retire_locked(&self, inner: &mut Inner, cycle: &Cycle) -> usize {
        let grace = self.config.grace_cycles;
        let before = inner.series.len();

        inner.series.retain(|_, entry| {
            *entry.scope != *cycle.scope
                || entry.generation.saturating_add(grace) >= cycle.generation
        });

        let retired = before - inner.series.len();
        if retired > 0 {
            inner.stats.series_retired += retired as u64;
            debug!(
                target = %cycle.scope.target,
                metric = %cycle.scope.metric,
                retired,
                "Retired stale series"
            );
        }
        retired
    }

    /// Point-in-time copy of every series, sorted by name then labels.
    pub fn snapshot(&self) -> Vec<Sample> {
        let mut samples: Vec<Sample> = {
            let inner = self.inner.read();
            inner
                .series
                .iter()
                .map(|(key, entry)| Sample {
                    key: key.clone(),
                    value: entry.value,
                })
                .collect()
        };
        samples.sort_by(|a, b| a.key.cmp(&b.key));
        samples
    }

    /// Get the current number of stored series.
    pub fn series_count(&self) -> usize {
        self.inner.read().series.len()
    }

    /// Get registry statistics.
    pub fn stats(&self) -> RegistryStats {
        self.inner.read().stats.clone()
    }

    /// Register a target so its poll counters are exported from zero.
    pub fn track_target(&self, target: &str) {
        self.polls.write().entry(target.to_string()).or_default();
    }

    /// Record a completed cycle.
    pub fn record_success(&self, target: &str, items_skipped: usize) {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs_f64())
            .unwrap_or_default();

        let mut polls = self.polls.write();
        let stats = polls.entry(target.to_string()).or_default();
        stats.cycles_succeeded += 1;
        stats.items_skipped += items_skipped as u64;
        stats.last_success = Some(now);
    }

    /// Record an abandoned cycle.
    pub fn record_failure(&self, target: &str, reason: FailureReason) {
        let mut polls = self.polls.write();
        let stats = polls.entry(target.to_string()).or_default();
        match reason {
            FailureReason::Fetch => stats.fetch_failures += 1,
            FailureReason::Parse => stats.parse_failures += 1,
        }
    }

    /// Poll statistics of one target.
    pub fn poll_stats(&self, target: &str) -> Option<PollStats> {
        self.polls.read().get(target).cloned()
    }

    /// Whether any target has completed a cycle yet.
    pub fn has_successful_poll(&self) -> bool {
        self.polls.read().values().any(|s| s.cycles_succeeded > 0)
    }

    /// Render metrics in Prometheus exposition format.
    pub fn render(&self) -> String {
        let samples = self.snapshot();
        let mut output = String::with_capacity(samples.len() * 100 + 1024);

        let mut current: Option<&str> = None;
        for sample in &samples {
            if current != Some(sample.key.name.as_str()) {
                writeln!(
                    output,
                    "# HELP {} Value extracted from a JSON endpoint.",
                    sample.key.name
                )
                .ok();
                writeln!(output, "# TYPE {} gauge", sample.key.name).ok();
                current = Some(sample.key.name.as_str());
            }
            writeln!(
                output,
                "{}{} {}",
                sample.key.name,
                sample.key.format_labels(),
                format_value(sample.value)
            )
            .ok();
        }

        self.render_self_metrics(&mut output, samples.len());
        output
    }

    fn render_self_metrics(&self, output: &mut String, series: usize) {
        let prefix = &self.self_prefix;
        let stats = self.stats();
        let polls = self.polls.read();

        if !output.is_empty() {
            output.push('\n');
        }

        write_header(output, prefix, "series", "gauge", "Number of live series.");
        writeln!(output, "{}_series {}", prefix, series).ok();

        write_header(
            output,
            prefix,
            "series_dropped_total",
            "counter",
            "New series rejected because the series limit was reached.",
        );
        writeln!(output, "{}_series_dropped_total {}", prefix, stats.series_dropped).ok();

        write_header(
            output,
            prefix,
            "series_retired_total",
            "counter",
            "Series removed after their item disappeared.",
        );
        writeln!(output, "{}_series_retired_total {}", prefix, stats.series_retired).ok();

        if polls.is_empty() {
            return;
        }

        write_header(
            output,
            prefix,
            "poll_success_total",
            "counter",
            "Poll cycles that completed.",
        );
        for (target, s) in polls.iter() {
            writeln!(
                output,
                "{}_poll_success_total{} {}",
                prefix,
                target_labels(target, None),
                s.cycles_succeeded
            )
            .ok();
        }

        write_header(
            output,
            prefix,
            "poll_failures_total",
            "counter",
            "Poll cycles abandoned before publishing.",
        );
        for (target, s) in polls.iter() {
            for (reason, count) in [
                (FailureReason::Fetch, s.fetch_failures),
                (FailureReason::Parse, s.parse_failures),
            ] {
                writeln!(
                    output,
                    "{}_poll_failures_total{} {}",
                    prefix,
                    target_labels(target, Some(reason)),
                    count
                )
                .ok();
            }
        }

        write_header(
            output,
            prefix,
            "items_skipped_total",
            "counter",
            "Items dropped because their value or labels could not be extracted.",
        );
        for (target, s) in polls.iter() {
            writeln!(
                output,
                "{}_items_skipped_total{} {}",
                prefix,
                target_labels(target, None),
                s.items_skipped
            )
            .ok();
        }

        write_header(
            output,
            prefix,
            "last_success_timestamp_seconds",
            "gauge",
            "Unix time of the last completed poll cycle.",
        );
        for (target, s) in polls.iter() {
            if let Some(ts) = s.last_success {
                writeln!(
                    output,
                    "{}_last_success_timestamp_seconds{} {}",
                    prefix,
                    target_labels(target, None),
                    format_value(ts)
                )
                .ok();
            }
        }
    }
}

fn write_header(output: &mut String, prefix: &str, suffix: &str, kind: &str, help: &str) {
    writeln!(output, "# HELP {}_{} {}", prefix, suffix, help).ok();
    writeln!(output, "# TYPE {}_{} {}", prefix, suffix, kind).ok();
}

fn target_labels(target: &str, reason: Option<FailureReason>) -> String {
    let mut labels = Vec::with_capacity(2);
    if let Some(reason) = reason {
        labels.push(("reason".to_string(), reason.as_str().to_string()));
    }
    labels.push((TARGET_LABEL.to_string(), target.to_string()));
    format_labels(&labels)
}

/// Create a shareable registry handle.
pub type SharedRegistry = Arc<SeriesRegistry>;
