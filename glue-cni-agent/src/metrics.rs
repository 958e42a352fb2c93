use std::sync::{LazyLock, PoisonError, RwLock};

use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::Histogram;
use prometheus_client::registry::{Registry, Unit};
use tokio::time::Instant;

use crate::reconcile::{PassOutcome, TeardownReport};

pub static REGISTRY: LazyLock<RwLock<Registry>> =
    LazyLock::new(|| RwLock::new(Registry::with_prefix("glue")));

#[derive(Clone)]
pub struct ReconcileMetrics {
    pub passes: Family<PassLabels, Counter>,
    pub teardown_failures: Family<StepLabels, Counter>,
    pub applied_generation: Gauge,
    pub duration: Histogram,
}

impl Default for ReconcileMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl ReconcileMetrics {
    /// Register reconcile metrics to start tracking them.
    pub fn new() -> Self {
        let mut registry = REGISTRY.write().unwrap_or_else(PoisonError::into_inner);
        let passes = Family::<PassLabels, Counter>::default();
        let teardown_failures = Family::<StepLabels, Counter>::default();
        let applied_generation = Gauge::default();
        let duration = Histogram::new([0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 5.0, 15.0].into_iter());

        registry.register_with_unit(
            "reconcile_duration",
            "reconcile pass duration",
            Unit::Seconds,
            duration.clone(),
        );
        registry.register(
            "reconcile_passes",
            "Number of reconcile passes by outcome",
            passes.clone(),
        );
        registry.register(
            "applied_generation",
            "Generation of the last applied topology",
            applied_generation.clone(),
        );
        registry.register(
            "teardown_failures",
            "Number of failed teardown steps",
            teardown_failures.clone(),
        );
        Self {
            passes,
            teardown_failures,
            applied_generation,
            duration,
        }
    }

    pub fn measure(&self) -> PassMeasurer {
        PassMeasurer {
            start: Instant::now(),
            metric: self.duration.clone(),
        }
    }

    pub fn count_pass(&self, generation: u64, outcome: &PassOutcome) {
        let step = match outcome {
            PassOutcome::Failed { step, .. } => step.to_string(),
            _ => String::new(),
        };
        let error = match outcome {
            PassOutcome::Failed { error, .. } => error.metric_label(),
            _ => String::new(),
        };
        self.passes
            .get_or_create(&PassLabels {
                outcome: outcome.label().into(),
                step,
                error,
            })
            .inc();
        if let PassOutcome::Applied = outcome {
            self.applied_generation
                .set(i64::try_from(generation).unwrap_or(i64::MAX));
        }
    }

    /// Counts a pass whose worker ended without an outcome.
    pub fn count_task_failure(&self) {
        self.passes
            .get_or_create(&PassLabels {
                outcome: "failed".into(),
                step: String::new(),
                error: "task".into(),
            })
            .inc();
    }

    pub fn count_teardown(&self, report: &TeardownReport) {
        for (step, _) in &report.failures {
            self.teardown_failures
                .get_or_create(&StepLabels {
                    step: step.to_string(),
                })
                .inc();
        }
    }
}

pub struct PassMeasurer {
    start: Instant,
    metric: Histogram,
}

impl Drop for PassMeasurer {
    fn drop(&mut self) {
        #[allow(clippy::cast_precision_loss)]
        let duration = self.start.elapsed().as_millis() as f64 / 1000.0;
        self.metric.observe(duration);
    }
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct PassLabels {
    pub outcome: String,
    pub step: String,
    pub error: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct StepLabels {
    pub step: String,
}
