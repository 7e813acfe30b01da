//! Prometheus metrics for the sampling loop

use prometheus::{Counter, Encoder, Gauge, Histogram, HistogramOpts, Registry, TextEncoder};
use std::sync::Arc;

/// Prometheus metrics collector for perflogd
#[derive(Clone)]
pub struct SamplerMetrics {
    ticks: Counter,
    subflows_registered: Counter,
    samples_recorded: Counter,
    loop_failures: Counter,
    active_subflows: Gauge,
    tick_duration_seconds: Histogram,
    registry: Arc<Registry>,
}

impl std::fmt::Debug for SamplerMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SamplerMetrics")
            .field("ticks", &self.ticks.get())
            .field("samples_recorded", &self.samples_recorded.get())
            .finish()
    }
}

impl SamplerMetrics {
    /// Create a new metrics collector with its own registry
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let ticks = Counter::new("perflogd_ticks_total", "Total sampling ticks completed")?;
        registry.register(Box::new(ticks.clone()))?;

        let subflows_registered = Counter::new(
            "perflogd_subflows_registered_total",
            "Total subflows registered in the sample store",
        )?;
        registry.register(Box::new(subflows_registered.clone()))?;

        let samples_recorded = Counter::new(
            "perflogd_samples_recorded_total",
            "Total subflow samples written to the sample store",
        )?;
        registry.register(Box::new(samples_recorded.clone()))?;

        let loop_failures = Counter::new(
            "perflogd_loop_failures_total",
            "Sampling loops terminated by an error",
        )?;
        registry.register(Box::new(loop_failures.clone()))?;

        let active_subflows = Gauge::new(
            "perflogd_active_subflows",
            "Subflows seen in the most recent tick",
        )?;
        registry.register(Box::new(active_subflows.clone()))?;

        let tick_duration_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "perflogd_tick_duration_seconds",
                "Time spent querying and persisting one tick",
            )
            .buckets(vec![0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5]),
        )?;
        registry.register(Box::new(tick_duration_seconds.clone()))?;

        Ok(Self {
            ticks,
            subflows_registered,
            samples_recorded,
            loop_failures,
            active_subflows,
            tick_duration_seconds,
            registry: Arc::new(registry),
        })
    }

    /// Record a completed tick
    pub fn record_tick(&self, subflows: usize) {
        self.ticks.inc();
        self.active_subflows.set(subflows as f64);
    }

    /// Record a subflow registration
    pub fn record_registration(&self) {
        self.subflows_registered.inc();
    }

    /// Record a written sample
    pub fn record_sample(&self) {
        self.samples_recorded.inc();
    }

    /// Record a loop terminated by an error
    pub fn record_loop_failure(&self) {
        self.loop_failures.inc();
    }

    /// Start tick duration timer
    pub fn start_tick_timer(&self) -> prometheus::HistogramTimer {
        self.tick_duration_seconds.start_timer()
    }

    /// Total samples written so far
    pub fn samples_recorded(&self) -> u64 {
        self.samples_recorded.get() as u64
    }

    /// Gather metrics in Prometheus text format
    pub fn gather_metrics(&self) -> String {
        let encoder = TextEncoder::new();
        let mut buf = vec![];
        encoder.encode(&self.registry.gather(), &mut buf).ok();
        String::from_utf8(buf).unwrap_or_else(|_| String::from("# Error encoding metrics\n"))
    }
}
