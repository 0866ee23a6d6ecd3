//! Replicator Metrics
//!
//! Prometheus collectors updated by the controller and the event classifier.

use crate::error::Result;
use prometheus::{Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry};
use std::time::Duration;

const NAMESPACE: &str = "volume_replicator";

#[derive(Clone)]
pub struct ReplicatorMetrics {
    /// Completed reconciles by outcome (unchanged, created, deleted)
    pub reconciles: IntCounterVec,
    pub reconcile_errors: IntCounter,
    pub reconcile_duration: Histogram,
    pub queue_depth: IntGauge,
    /// Claim keys received from the event classifier
    pub events: IntCounter,
}

impl ReplicatorMetrics {
    /// Create the collectors and register them with `registry`
    pub fn new(registry: &Registry) -> Result<Self> {
        let reconciles = IntCounterVec::new(
            Opts::new("reconcile_total", "Completed reconciles by outcome").namespace(NAMESPACE),
            &["outcome"],
        )?;
        let reconcile_errors = IntCounter::with_opts(
            Opts::new("reconcile_errors_total", "Reconciles aborted by an error")
                .namespace(NAMESPACE),
        )?;
        let reconcile_duration = Histogram::with_opts(
            HistogramOpts::new("reconcile_duration_seconds", "Duration of a reconcile")
                .namespace(NAMESPACE)
                .buckets(vec![0.005, 0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]),
        )?;
        let queue_depth = IntGauge::with_opts(
            Opts::new("queue_depth", "Claim keys waiting for a worker").namespace(NAMESPACE),
        )?;
        let events = IntCounter::with_opts(
            Opts::new("events_total", "Claim keys enqueued from watch events")
                .namespace(NAMESPACE),
        )?;

        registry.register(Box::new(reconciles.clone()))?;
        registry.register(Box::new(reconcile_errors.clone()))?;
        registry.register(Box::new(reconcile_duration.clone()))?;
        registry.register(Box::new(queue_depth.clone()))?;
        registry.register(Box::new(events.clone()))?;

        Ok(Self {
            reconciles,
            reconcile_errors,
            reconcile_duration,
            queue_depth,
            events,
        })
    }

    pub fn record_success(&self, outcome: &str, elapsed: Duration) {
        self.reconciles.with_label_values(&[outcome]).inc();
        self.reconcile_duration.observe(elapsed.as_secs_f64());
    }

    pub fn record_failure(&self, elapsed: Duration) {
        self.reconcile_errors.inc();
        self.reconcile_duration.observe(elapsed.as_secs_f64());
    }
}
