//! Prometheus counters for projection and reconcile activity

use crate::Result;
use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, Opts, Registry, TextEncoder,
};
use std::sync::Arc;

/// Metrics shared by the projector, the endpoints path and the reconcile pass
///
/// Clones share the same registry and counters.
#[derive(Clone)]
pub struct SyncMetrics {
    /// VIPs written to a load balancer
    pub vips_set_total: IntCounter,
    /// VIPs removed, by reason ("delete" or "stale")
    pub vips_removed_total: IntCounterVec,
    /// Reject rules created or re-attached
    pub reject_rules_ensured_total: IntCounter,
    /// Reject rules detached, by reason ("delete", "endpoints" or "stale")
    pub reject_rules_detached_total: IntCounterVec,
    /// Service ports skipped because validation failed
    pub ports_skipped_total: IntCounter,
    /// Backend calls that failed
    pub backend_errors_total: IntCounter,
    /// Completed reconcile passes
    pub sync_passes_total: IntCounter,
    /// Reconcile pass duration in seconds
    pub sync_duration_seconds: Histogram,
    pub registry: Arc<Registry>,
}

impl SyncMetrics {
    pub fn new() -> Result<Self> {
        let registry = Arc::new(Registry::new());

        let vips_set_total =
            IntCounter::new("lbsync_vips_set_total", "VIPs written to load balancers")?;
        let vips_removed_total = IntCounterVec::new(
            Opts::new("lbsync_vips_removed_total", "VIPs removed from load balancers"),
            &["reason"],
        )?;
        let reject_rules_ensured_total = IntCounter::new(
            "lbsync_reject_rules_ensured_total",
            "Reject rules created or re-attached",
        )?;
        let reject_rules_detached_total = IntCounterVec::new(
            Opts::new("lbsync_reject_rules_detached_total", "Reject rules detached"),
            &["reason"],
        )?;
        let ports_skipped_total = IntCounter::new(
            "lbsync_ports_skipped_total",
            "Service ports skipped after failing validation",
        )?;
        let backend_errors_total =
            IntCounter::new("lbsync_backend_errors_total", "Failed backend calls")?;
        let sync_passes_total =
            IntCounter::new("lbsync_sync_passes_total", "Completed reconcile passes")?;
        let sync_duration_seconds = Histogram::with_opts(HistogramOpts::new(
            "lbsync_sync_duration_seconds",
            "Reconcile pass duration in seconds",
        ))?;

        registry.register(Box::new(vips_set_total.clone()))?;
        registry.register(Box::new(vips_removed_total.clone()))?;
        registry.register(Box::new(reject_rules_ensured_total.clone()))?;
        registry.register(Box::new(reject_rules_detached_total.clone()))?;
        registry.register(Box::new(ports_skipped_total.clone()))?;
        registry.register(Box::new(backend_errors_total.clone()))?;
        registry.register(Box::new(sync_passes_total.clone()))?;
        registry.register(Box::new(sync_duration_seconds.clone()))?;

        Ok(Self {
            vips_set_total,
            vips_removed_total,
            reject_rules_ensured_total,
            reject_rules_detached_total,
            ports_skipped_total,
            backend_errors_total,
            sync_passes_total,
            sync_duration_seconds,
            registry,
        })
    }

    /// Gather all metrics in Prometheus text format
    pub fn gather(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = vec![];
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }
}
