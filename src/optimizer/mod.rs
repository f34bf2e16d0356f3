//! Self-optimizing feedback loop.
//!
//! Records rolling performance samples per component, recommends
//! replacements once a candidate clears the improvement threshold, and
//! runs deterministic A/B experiments.

mod experiment;

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{Mutex, RwLock};
use tracing::debug;

use crate::config::OptimizerConfig;
use crate::models::ComponentKey;

pub use experiment::{bucket, Arm, ArmReport, ExperimentRegistry, ExperimentReport};

#[derive(Debug, thiserror::Error)]
pub enum OptimizerError {
    #[error("unknown experiment: {0}")]
    UnknownExperiment(String),
    #[error("experiment already exists: {0}")]
    DuplicateExperiment(String),
    #[error("traffic split {0} outside (0, 100)")]
    InvalidSplit(u8),
}

/// One observed pipeline interaction with a component.
#[derive(Debug, Clone)]
pub struct PerformanceSample {
    pub key: ComponentKey,
    pub latency_ms: f64,
    pub throughput_eps: f64,
    /// Proxy for accuracy, e.g. ensemble agreement on this request.
    pub accuracy_proxy: f64,
    pub error: bool,
    pub domain: String,
    pub recorded_at: DateTime<Utc>,
}

impl PerformanceSample {
    pub fn new(key: ComponentKey, domain: impl Into<String>) -> Self {
        Self {
            key,
            latency_ms: 0.0,
            throughput_eps: 0.0,
            accuracy_proxy: 0.0,
            error: false,
            domain: domain.into(),
            recorded_at: Utc::now(),
        }
    }
}

/// What a recommendation optimizes for.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OptimizationStrategy {
    LatencyFocused,
    AccuracyFocused,
    ThroughputFocused,
    CostFocused,
    #[default]
    Balanced,
}

/// Aggregates over a component's sample window.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct AggregateStats {
    pub samples: usize,
    pub mean_latency_ms: f64,
    pub mean_accuracy: f64,
    pub mean_throughput_eps: f64,
    pub error_rate: f64,
}

impl AggregateStats {
    /// Latency mapped onto [0, 1]: 1.0 at zero latency, 0.5 at 100ms.
    fn normalized_latency(&self) -> f64 {
        1.0 / (1.0 + self.mean_latency_ms / 100.0)
    }

    fn normalized_throughput(&self) -> f64 {
        self.mean_throughput_eps / (self.mean_throughput_eps + 100.0)
    }

    /// Score under a strategy, higher is better.
    pub fn score(&self, strategy: OptimizationStrategy) -> f64 {
        match strategy {
            OptimizationStrategy::LatencyFocused => self.normalized_latency(),
            OptimizationStrategy::AccuracyFocused => self.mean_accuracy,
            OptimizationStrategy::ThroughputFocused => self.normalized_throughput(),
            // Cost proxy: cheap components are fast and don't burn
            // retries on errors.
            OptimizationStrategy::CostFocused => (1.0 - self.error_rate) * self.normalized_latency(),
            OptimizationStrategy::Balanced => {
                0.6 * self.mean_accuracy + 0.4 * self.normalized_latency()
            }
        }
    }
}

/// A swap the optimizer believes is worth making.
#[derive(Debug, Clone, Serialize)]
pub struct SwapRecommendation {
    pub current: ComponentKey,
    pub current_score: f64,
    pub candidate: ComponentKey,
    pub candidate_score: f64,
    /// Relative improvement of the candidate over the current.
    pub improvement: f64,
    pub strategy: OptimizationStrategy,
}

struct RollingWindow {
    samples: VecDeque<PerformanceSample>,
    capacity: usize,
}

impl RollingWindow {
    fn new(capacity: usize) -> Self {
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    fn push(&mut self, sample: PerformanceSample) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
    }

    fn aggregate(&self) -> AggregateStats {
        let n = self.samples.len();
        if n == 0 {
            return AggregateStats::default();
        }
        let mut stats = AggregateStats {
            samples: n,
            ..Default::default()
        };
        let mut errors = 0usize;
        for sample in &self.samples {
            stats.mean_latency_ms += sample.latency_ms;
            stats.mean_accuracy += sample.accuracy_proxy;
            stats.mean_throughput_eps += sample.throughput_eps;
            if sample.error {
                errors += 1;
            }
        }
        stats.mean_latency_ms /= n as f64;
        stats.mean_accuracy /= n as f64;
        stats.mean_throughput_eps /= n as f64;
        stats.error_rate = errors as f64 / n as f64;
        stats
    }
}

/// Optimizer summary for `statistics()`.
#[derive(Debug, Clone, Serialize)]
pub struct OptimizerStats {
    pub tracked_components: usize,
    pub total_samples: usize,
    pub active_experiments: usize,
}

/// The self-optimizer service. Cloning shares windows and experiments.
#[derive(Clone)]
pub struct SelfOptimizer {
    config: OptimizerConfig,
    /// One lock per component key, so samples for different components
    /// never contend.
    windows: Arc<RwLock<HashMap<ComponentKey, Arc<Mutex<RollingWindow>>>>>,
    experiments: Arc<ExperimentRegistry>,
}

impl SelfOptimizer {
    pub fn new(config: OptimizerConfig) -> Self {
        Self {
            config,
            windows: Arc::new(RwLock::new(HashMap::new())),
            experiments: Arc::new(ExperimentRegistry::new()),
        }
    }

    pub fn experiments(&self) -> &ExperimentRegistry {
        &self.experiments
    }

    async fn window(&self, key: &ComponentKey) -> Arc<Mutex<RollingWindow>> {
        {
            let windows = self.windows.read().await;
            if let Some(window) = windows.get(key) {
                return window.clone();
            }
        }
        let mut windows = self.windows.write().await;
        windows
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(RollingWindow::new(self.config.window_size))))
            .clone()
    }

    /// Append a sample to the component's rolling window, evicting the
    /// oldest once the window is full.
    pub async fn record_sample(&self, sample: PerformanceSample) {
        let window = self.window(&sample.key).await;
        window.lock().await.push(sample);
    }

    pub async fn aggregate(&self, key: &ComponentKey) -> Option<AggregateStats> {
        let windows = self.windows.read().await;
        let window = windows.get(key)?;
        let stats = window.lock().await.aggregate();
        (stats.samples > 0).then_some(stats)
    }

    /// Compare `current` against `candidates` under the strategy and
    /// recommend a swap only when the best candidate's score beats the
    /// current score by more than the improvement threshold. The
    /// threshold is hysteresis against flapping on noise; components
    /// with fewer than `min_samples` observations are not compared.
    pub async fn recommend(
        &self,
        current: &ComponentKey,
        candidates: &[ComponentKey],
        strategy: OptimizationStrategy,
    ) -> Option<SwapRecommendation> {
        let current_stats = self.aggregate(current).await?;
        if current_stats.samples < self.config.min_samples {
            return None;
        }
        let current_score = current_stats.score(strategy);

        let mut best: Option<(ComponentKey, f64)> = None;
        for candidate in candidates {
            if candidate == current {
                continue;
            }
            let Some(stats) = self.aggregate(candidate).await else {
                continue;
            };
            if stats.samples < self.config.min_samples {
                continue;
            }
            let score = stats.score(strategy);
            if best.as_ref().map_or(true, |(_, s)| score > *s) {
                best = Some((candidate.clone(), score));
            }
        }

        let (candidate, candidate_score) = best?;
        let improvement = if current_score.abs() > f64::EPSILON {
            (candidate_score - current_score) / current_score
        } else {
            candidate_score
        };
        if improvement <= self.config.improvement_threshold {
            debug!(
                "No swap recommended over {}: best candidate {} improves {:.1}%, threshold {:.1}%",
                current,
                candidate,
                improvement * 100.0,
                self.config.improvement_threshold * 100.0
            );
            return None;
        }

        Some(SwapRecommendation {
            current: current.clone(),
            current_score,
            candidate,
            candidate_score,
            improvement,
            strategy,
        })
    }

    pub async fn start_experiment(
        &self,
        id: impl Into<String>,
        component_a: ComponentKey,
        component_b: ComponentKey,
        traffic_split: u8,
    ) -> Result<(), OptimizerError> {
        self.experiments
            .start(id, component_a, component_b, traffic_split)
            .await
    }

    pub async fn stop_experiment(&self, id: &str) -> Result<(), OptimizerError> {
        self.experiments.stop(id).await
    }

    pub async fn experiment_result(&self, id: &str) -> Result<ExperimentReport, OptimizerError> {
        self.experiments
            .report(id, self.config.improvement_threshold)
            .await
    }

    pub async fn stats(&self) -> OptimizerStats {
        let windows = self.windows.read().await;
        let mut total_samples = 0;
        for window in windows.values() {
            total_samples += window.lock().await.samples.len();
        }
        OptimizerStats {
            tracked_components: windows.len(),
            total_samples,
            active_experiments: self.experiments.active_count().await,
        }
    }
}
