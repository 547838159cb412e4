//! Prometheus metrics for the invocation controller.
//!
//! All counters and histograms are owned by `ControllerMetrics` and
//! registered against an injected registry. Tests create their own registry
//! per controller; nothing touches the global default.

use prometheus::{
    histogram_opts, opts, Histogram, HistogramVec, IntCounterVec, IntGauge, Registry,
};

/// Label values of the eval-jobs counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvalJobOutcome {
    /// Lock contention: another evaluation was already in flight.
    Duplicate,
    /// The evaluation aborted on an error.
    Error,
    /// The rule chain produced no actions.
    Noop,
    /// At least one action was submitted.
    Action,
}

impl EvalJobOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Duplicate => "duplicate",
            Self::Error => "error",
            Self::Noop => "noop",
            Self::Action => "action",
        }
    }
}

/// Source label of the recovery counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoverySource {
    /// Short loop: stale state found in the evaluation store.
    EvalStore,
    /// Long loop: orphaned invocation found in the cache.
    Cache,
}

impl RecoverySource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::EvalStore => "evalStore",
            Self::Cache => "cache",
        }
    }
}

/// Dependency-injected metrics sink for the controller.
pub struct ControllerMetrics {
    eval_jobs: IntCounterVec,
    eval_recovered: IntCounterVec,
    invocation_status: IntCounterVec,
    invocation_duration: Histogram,
    eval_duration: HistogramVec,
    expression_duration: Histogram,
    queue_size: IntGauge,
}

impl ControllerMetrics {
    /// Create and register every metric against the given registry.
    pub fn new(registry: &Registry) -> prometheus::Result<Self> {
        let eval_jobs = IntCounterVec::new(
            opts!(
                "windlass_eval_jobs_total",
                "Evaluation jobs by outcome"
            ),
            &["outcome"],
        )?;
        let eval_recovered = IntCounterVec::new(
            opts!(
                "windlass_eval_recovered_total",
                "Evaluations re-enqueued by the recovery sweeper, by source"
            ),
            &["source"],
        )?;
        let invocation_status = IntCounterVec::new(
            opts!(
                "windlass_invocation_status_total",
                "Invocation status transitions observed by the controller"
            ),
            &["status"],
        )?;
        let invocation_duration = Histogram::with_opts(histogram_opts!(
            "windlass_invocation_duration_seconds",
            "Wall time from invocation creation to a terminal state"
        ))?;
        let eval_duration = HistogramVec::new(
            histogram_opts!(
                "windlass_eval_duration_seconds",
                "Duration of a single evaluation, by resulting action kind"
            ),
            &["action"],
        )?;
        let expression_duration = Histogram::with_opts(histogram_opts!(
            "windlass_expression_resolution_duration_seconds",
            "Duration of input expression resolution"
        ))?;
        let queue_size = IntGauge::with_opts(opts!(
            "windlass_work_queue_size",
            "Items pending in the evaluation work queue"
        ))?;

        registry.register(Box::new(eval_jobs.clone()))?;
        registry.register(Box::new(eval_recovered.clone()))?;
        registry.register(Box::new(invocation_status.clone()))?;
        registry.register(Box::new(invocation_duration.clone()))?;
        registry.register(Box::new(eval_duration.clone()))?;
        registry.register(Box::new(expression_duration.clone()))?;
        registry.register(Box::new(queue_size.clone()))?;

        Ok(Self {
            eval_jobs,
            eval_recovered,
            invocation_status,
            invocation_duration,
            eval_duration,
            expression_duration,
            queue_size,
        })
    }

    /// Convenience constructor over a private registry, for wiring where no
    /// scrape endpoint exists (tests, ephemeral tools).
    pub fn unregistered() -> Self {
        Self::new(&Registry::new()).unwrap_or_else(|_| {
            // A fresh registry cannot produce duplicate-registration errors.
            unreachable!("metric construction on a fresh registry failed")
        })
    }

    pub fn record_eval_job(&self, outcome: EvalJobOutcome) {
        self.eval_jobs.with_label_values(&[outcome.as_str()]).inc();
    }

    pub fn eval_job_count(&self, outcome: EvalJobOutcome) -> u64 {
        self.eval_jobs.with_label_values(&[outcome.as_str()]).get()
    }

    pub fn record_recovered(&self, source: RecoverySource) {
        self.eval_recovered
            .with_label_values(&[source.as_str()])
            .inc();
    }

    pub fn recovered_count(&self, source: RecoverySource) -> u64 {
        self.eval_recovered
            .with_label_values(&[source.as_str()])
            .get()
    }

    pub fn record_invocation_status(&self, status: &str) {
        self.invocation_status.with_label_values(&[status]).inc();
    }

    pub fn observe_invocation_duration(&self, seconds: f64) {
        self.invocation_duration.observe(seconds);
    }

    pub fn invocation_duration_samples(&self) -> u64 {
        self.invocation_duration.get_sample_count()
    }

    pub fn invocation_duration_sum(&self) -> f64 {
        self.invocation_duration.get_sample_sum()
    }

    pub fn observe_eval_duration(&self, action: &str, seconds: f64) {
        self.eval_duration
            .with_label_values(&[action])
            .observe(seconds);
    }

    pub fn observe_expression_duration(&self, seconds: f64) {
        self.expression_duration.observe(seconds);
    }

    pub fn set_queue_size(&self, size: usize) {
        self.queue_size.set(size as i64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registers_against_injected_registry() {
        let registry = Registry::new();
        let metrics = ControllerMetrics::new(&registry).unwrap();

        metrics.record_eval_job(EvalJobOutcome::Noop);
        metrics.record_recovered(RecoverySource::Cache);
        metrics.set_queue_size(3);

        let families = registry.gather();
        assert!(families
            .iter()
            .any(|f| f.get_name() == "windlass_eval_jobs_total"));
        assert_eq!(metrics.eval_job_count(EvalJobOutcome::Noop), 1);
        assert_eq!(metrics.recovered_count(RecoverySource::Cache), 1);
    }

    #[test]
    fn registries_are_isolated() {
        let a = ControllerMetrics::unregistered();
        let b = ControllerMetrics::unregistered();

        a.record_eval_job(EvalJobOutcome::Duplicate);
        assert_eq!(a.eval_job_count(EvalJobOutcome::Duplicate), 1);
        assert_eq!(b.eval_job_count(EvalJobOutcome::Duplicate), 0);
    }
}
