use crate::util::errors::Error;
use prometheus::{
    histogram_opts, opts, HistogramVec, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Registry,
};
use tokio::time::Instant;

#[derive(Clone)]
pub struct Metrics {
    pub reconciliations: IntCounter,
    pub failures: IntCounterVec,
    pub reconcile_duration: HistogramVec,
    /// Live HAKeeper client sets held by the manager
    pub hakeeper_clients: IntGauge,
    /// Pool pods by phase
    pub cn_pool_pods: IntGaugeVec,
}

impl Default for Metrics {
    fn default() -> Self {
        let reconcile_duration = HistogramVec::new(
            histogram_opts!(
                "controller_reconcile_duration_seconds",
                "The duration of reconcile to complete in seconds",
            )
            .buckets(vec![0.01, 0.1, 0.25, 0.5, 1., 5., 15., 60.]),
            &["instance"],
        )
        .unwrap();
        let failures = IntCounterVec::new(
            opts!("controller_reconciliation_errors_total", "reconciliation errors",),
            &["instance", "error"],
        )
        .unwrap();
        let reconciliations = IntCounter::new("reconciliations_total", "reconciliations").unwrap();
        let hakeeper_clients =
            IntGauge::new("hakeeper_clients", "HAKeeper client sets cached by the operator").unwrap();
        let cn_pool_pods = IntGaugeVec::new(
            opts!("cn_pool_pods", "CN pool pods by phase"),
            &["pool", "phase"],
        )
        .unwrap();
        Metrics {
            reconciliations,
            failures,
            reconcile_duration,
            hakeeper_clients,
            cn_pool_pods,
        }
    }
}

impl Metrics {
    /// Register API metrics to start tracking them.
    pub fn register(self, registry: &Registry) -> Result<Self, prometheus::Error> {
        registry.register(Box::new(self.reconcile_duration.clone()))?;
        registry.register(Box::new(self.failures.clone()))?;
        registry.register(Box::new(self.reconciliations.clone()))?;
        registry.register(Box::new(self.hakeeper_clients.clone()))?;
        registry.register(Box::new(self.cn_pool_pods.clone()))?;
        Ok(self)
    }

    pub fn reconcile_failure(&self, controller: &str, e: &Error) {
        self.failures
            .with_label_values(&[controller, e.metric_label().as_ref()])
            .inc()
    }

    pub fn count_and_measure(&self, controller: &str) -> ReconcileMeasurer {
        self.reconciliations.inc();
        ReconcileMeasurer {
            start: Instant::now(),
            metric: self.reconcile_duration.clone(),
            instance: controller.to_string(),
        }
    }
}

/// Smart function duration measurer
///
/// Relies on Drop to calculate duration and register the observation in the histogram
pub struct ReconcileMeasurer {
    start: Instant,
    metric: HistogramVec,
    instance: String,
}

impl Drop for ReconcileMeasurer {
    fn drop(&mut self) {
        #[allow(clippy::cast_precision_loss)]
        let duration = self.start.elapsed().as_millis() as f64 / 1000.0;
        self.metric
            .with_label_values(&[self.instance.as_str()])
            .observe(duration);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn failures_are_labelled_by_controller() {
        let registry = Registry::new();
        let metrics = Metrics::default().register(&registry).unwrap();
        metrics.reconcile_failure("logset", &Error::invalid_spec("replicas"));
        {
            let _timer = metrics.count_and_measure("logset");
        }
        assert_eq!(metrics.failures.with_label_values(&["logset", "invalidspec"]).get(), 1);
        assert_eq!(metrics.reconciliations.get(), 1);
        assert!(registry.gather().iter().any(|m| m.get_name() == "controller_reconcile_duration_seconds"));
    }
}
