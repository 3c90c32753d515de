use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde::Serialize;
use stratum_core::event::EventBus;
use stratum_core::{RunEvent, RunStatus, Stage};
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio::sync::broadcast::Receiver;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub const EXECUTION_TIME: &str = "execution_time";
pub const REWARD: &str = "reward";
pub const SUCCESS_RATE: &str = "success_rate";
pub const STAGE_FAILURE: &str = "stage_failure";

const DEFAULT_MAX_HISTORY: usize = 10_000;

/// One recorded value.
#[derive(Debug, Clone, Serialize)]
pub struct MetricSample {
    pub value: f64,
    pub timestamp: DateTime<Utc>,
    pub tags: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MetricSummary {
    pub count: usize,
    pub mean: f64,
    /// Sample standard deviation; 0 for fewer than two samples.
    pub std: f64,
    pub min: f64,
    pub max: f64,
    pub last: f64,
}

impl MetricSummary {
    fn rounded(&self, places: i32) -> Self {
        let factor = 10f64.powi(places);
        let round = |v: f64| (v * factor).round() / factor;
        Self {
            count: self.count,
            mean: round(self.mean),
            std: round(self.std),
            min: round(self.min),
            max: round(self.max),
            last: round(self.last),
        }
    }
}

/// Named series of tagged samples, each bounded to the newest
/// `max_history` entries.
#[derive(Debug)]
pub struct MetricsCollector {
    max_history: usize,
    series: HashMap<String, VecDeque<MetricSample>>,
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_HISTORY)
    }
}

impl MetricsCollector {
    pub fn new(max_history: usize) -> Self {
        Self {
            max_history: max_history.max(1),
            series: HashMap::new(),
        }
    }

    pub fn record<'a>(&mut self, name: &str, value: f64, tags: impl IntoIterator<Item = (&'a str, String)>) {
        let samples = self.series.entry(name.to_string()).or_default();
        samples.push_back(MetricSample {
            value,
            timestamp: Utc::now(),
            tags: tags.into_iter().map(|(k, v)| (k.to_string(), v)).collect(),
        });
        while samples.len() > self.max_history {
            samples.pop_front();
        }
    }

    pub fn summary(&self, name: &str) -> Option<MetricSummary> {
        let values: Vec<f64> = self.series.get(name)?.iter().map(|s| s.value).collect();
        summarize(&values)
    }

    /// The newest `n` values of a series, oldest first.
    pub fn recent(&self, name: &str, n: usize) -> Vec<f64> {
        let Some(samples) = self.series.get(name) else {
            return Vec::new();
        };
        samples.iter().skip(samples.len().saturating_sub(n)).map(|s| s.value).collect()
    }

    pub fn by_tag(&self, name: &str, key: &str, value: &str) -> Vec<&MetricSample> {
        self.series
            .get(name)
            .map(|samples| {
                samples
                    .iter()
                    .filter(|s| s.tags.get(key).is_some_and(|v| v == value))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Series names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.series.keys().cloned().collect();
        names.sort();
        names
    }

    /// Drop one series, or every series when `name` is `None`.
    pub fn clear(&mut self, name: Option<&str>) {
        match name {
            Some(name) => {
                self.series.remove(name);
            }
            None => self.series.clear(),
        }
    }
}

fn summarize(values: &[f64]) -> Option<MetricSummary> {
    let last = *values.last()?;
    let count = values.len();
    let mean = values.iter().sum::<f64>() / count as f64;
    let std = if count > 1 {
        (values.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / (count - 1) as f64).sqrt()
    } else {
        0.0
    };
    Some(MetricSummary {
        count,
        mean,
        std,
        min: values.iter().copied().fold(f64::INFINITY, f64::min),
        max: values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
        last,
    })
}

#[derive(Debug, Clone, Serialize)]
pub struct PerformanceReport {
    pub timestamp: DateTime<Utc>,
    /// Per-series summaries rounded to four places.
    pub metrics: BTreeMap<String, MetricSummary>,
    pub success_rate: f64,
    pub average_execution_ms: f64,
    pub average_execution_ms_by_stage: BTreeMap<Stage, f64>,
    pub reward_trend: Vec<f64>,
}

/// Stage timings, rewards and run outcomes folded out of `RunEvent`s.
///
/// Shared behind an `Arc`; every method takes `&self`.
#[derive(Debug, Default)]
pub struct PerformanceTracker {
    collector: Mutex<MetricsCollector>,
}

impl PerformanceTracker {
    pub fn new(max_history: usize) -> Self {
        Self {
            collector: Mutex::new(MetricsCollector::new(max_history)),
        }
    }

    pub fn record_execution_time(&self, stage: Stage, elapsed_ms: u64, iteration: usize) {
        self.lock().record(
            EXECUTION_TIME,
            elapsed_ms as f64,
            [("stage", stage.name().to_string()), ("iteration", iteration.to_string())],
        );
    }

    pub fn record_reward(&self, reward: f64, iteration: usize) {
        self.lock().record(REWARD, reward, [("iteration", iteration.to_string())]);
    }

    pub fn record_success(&self, success: bool, session_id: &str) {
        let value = if success { 1.0 } else { 0.0 };
        self.lock().record(SUCCESS_RATE, value, [("session", session_id.to_string())]);
    }

    /// Mean stage time in milliseconds, over one stage or all of them.
    pub fn average_execution_ms(&self, stage: Option<Stage>) -> f64 {
        let collector = self.lock();
        let values: Vec<f64> = match stage {
            Some(stage) => collector
                .by_tag(EXECUTION_TIME, "stage", stage.name())
                .into_iter()
                .map(|s| s.value)
                .collect(),
            None => collector.recent(EXECUTION_TIME, usize::MAX),
        };
        mean(&values)
    }

    /// The newest `n` rewards, oldest first.
    pub fn reward_trend(&self, n: usize) -> Vec<f64> {
        self.lock().recent(REWARD, n)
    }

    /// Share of the newest `n` finished runs that converged.
    pub fn success_rate(&self, n: usize) -> f64 {
        mean(&self.lock().recent(SUCCESS_RATE, n))
    }

    pub fn summary(&self, name: &str) -> Option<MetricSummary> {
        self.lock().summary(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.lock().names()
    }

    pub fn report(&self) -> PerformanceReport {
        let metrics = {
            let collector = self.lock();
            collector
                .names()
                .into_iter()
                .filter_map(|name| collector.summary(&name).map(|s| (name, s.rounded(4))))
                .collect()
        };
        let average_execution_ms_by_stage = Stage::ALL
            .into_iter()
            .map(|stage| (stage, self.average_execution_ms(Some(stage))))
            .collect();
        PerformanceReport {
            timestamp: Utc::now(),
            metrics,
            success_rate: self.success_rate(100),
            average_execution_ms: self.average_execution_ms(None),
            average_execution_ms_by_stage,
            reward_trend: self.reward_trend(10),
        }
    }

    pub fn reset(&self) {
        self.lock().clear(None);
    }

    /// Fold one event in. Events that carry no measurement are ignored.
    pub fn observe(&self, event: &RunEvent) {
        match event {
            RunEvent::StageCompleted {
                stage,
                iteration,
                elapsed_ms,
            } => self.record_execution_time(*stage, *elapsed_ms, *iteration),
            RunEvent::RewardComputed { iteration, reward, .. } => self.record_reward(*reward, *iteration),
            RunEvent::RunFinished { session_id, status, .. } => {
                self.record_success(*status == RunStatus::Converged, &session_id.to_string())
            }
            RunEvent::RunFailed { stage, .. } => {
                self.lock().record(STAGE_FAILURE, 1.0, [("stage", stage.name().to_string())]);
            }
            _ => {}
        }
    }

    /// Fold in whatever is already buffered on `rx` without waiting.
    /// Returns how many events were observed.
    pub fn drain(&self, rx: &mut Receiver<RunEvent>) -> usize {
        let mut observed = 0;
        loop {
            match rx.try_recv() {
                Ok(event) => {
                    self.observe(&event);
                    observed += 1;
                }
                Err(TryRecvError::Lagged(skipped)) => {
                    warn!(skipped, "Metrics lagged behind the event bus");
                }
                Err(TryRecvError::Empty | TryRecvError::Closed) => break,
            }
        }
        observed
    }

    /// Follow the event bus until cancelled or the bus closes.
    pub async fn track(self: Arc<Self>, event_bus: Arc<EventBus>, cancel: CancellationToken) {
        let mut rx = event_bus.subscribe();
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Metrics tracking cancelled");
                    break;
                }
                result = rx.recv() => match result {
                    Ok(event) => self.observe(&event),
                    Err(RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Metrics lagged behind the event bus");
                    }
                    Err(RecvError::Closed) => {
                        debug!("EventBus closed, metrics tracking stopped");
                        break;
                    }
                },
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, MetricsCollector> {
        self.collector.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        0.0
    } else {
        values.iter().sum::<f64>() / values.len() as f64
    }
}
