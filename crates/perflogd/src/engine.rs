//! SamplingEngine - periodic subflow sampling on a background thread
//!
//! Lifecycle: `Created` (iteration id generated, reporter notified) →
//! `Running` (after [`SamplingEngine::run`]) → `Stopped` (after
//! [`SamplingEngine::stop`], terminal). Dropping a running engine stops it.
//!
//! The loop thread exclusively owns the registration cache and its store
//! handle. The only state shared with the caller is the stop flag, which the
//! loop checks once per interval.

use crate::error::{PerflogError, Result};
use crate::filter::{filter_features, FeatureSelection};
use crate::metrics::SamplerMetrics;
use crate::reporter::IterationReporter;
use crate::store::{SampleStore, StoreFactory};
use crate::telemetry::SubflowTelemetry;
use crate::types::{SocketHandle, SubflowAddrs, SubflowId};
use rand::Rng;
use rand::distributions::Alphanumeric;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, error, info, info_span, instrument, warn, Span};

/// Length of generated iteration ids
pub const ITERATION_ID_LEN: usize = 16;

/// Default sampling interval in milliseconds
pub const DEFAULT_INTERVAL_MS: u64 = 1000;

/// Generate a random alphanumeric iteration id
pub fn random_iteration_id() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(ITERATION_ID_LEN)
        .map(char::from)
        .collect()
}

/// Engine lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    /// Constructed, loop not started
    Created,
    /// Sampling loop running (or exited early, awaiting `stop`)
    Running,
    /// Loop joined; terminal
    Stopped,
}

impl EngineState {
    /// State name for logging
    pub fn as_str(&self) -> &'static str {
        match self {
            EngineState::Created => "created",
            EngineState::Running => "running",
            EngineState::Stopped => "stopped",
        }
    }
}

/// Samples MPTCP subflow telemetry of one socket into a sample store
///
/// One engine is one iteration. `run` may be called once; a second call is
/// rejected with [`PerflogError::InvalidState`].
pub struct SamplingEngine {
    handle: SocketHandle,
    iteration_id: String,
    telemetry: Arc<dyn SubflowTelemetry>,
    store_factory: Arc<dyn StoreFactory>,
    metrics: Option<SamplerMetrics>,
    state: EngineState,
    interval: Option<Duration>,
    shutdown: Arc<AtomicBool>,
    worker: Option<JoinHandle<Result<()>>>,
    failure: Option<String>,
    span: Span,
}

impl std::fmt::Debug for SamplingEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SamplingEngine")
            .field("handle", &self.handle)
            .field("iteration_id", &self.iteration_id)
            .field("state", &self.state)
            .field("interval", &self.interval)
            .field("failure", &self.failure)
            .finish()
    }
}

impl SamplingEngine {
    /// Create an engine for a socket and announce its iteration
    pub fn new(
        handle: SocketHandle,
        telemetry: Arc<dyn SubflowTelemetry>,
        store_factory: Arc<dyn StoreFactory>,
        reporter: &dyn IterationReporter,
    ) -> Self {
        let iteration_id = random_iteration_id();
        let span = info_span!("perflog", fd = handle, iteration = %iteration_id);

        reporter.iteration_started(&iteration_id);
        span.in_scope(|| debug!("Sampling engine created"));

        Self {
            handle,
            iteration_id,
            telemetry,
            store_factory,
            metrics: None,
            state: EngineState::Created,
            interval: None,
            shutdown: Arc::new(AtomicBool::new(false)),
            worker: None,
            failure: None,
            span,
        }
    }

    /// Export loop activity to a metrics collector
    pub fn with_metrics(mut self, metrics: SamplerMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Iteration id of this engine
    pub fn iteration_id(&self) -> &str {
        &self.iteration_id
    }

    /// Socket handle being sampled
    pub fn handle(&self) -> SocketHandle {
        self.handle
    }

    /// Current lifecycle state
    pub fn state(&self) -> EngineState {
        self.state
    }

    /// Sampling interval recorded by `run`
    pub fn interval(&self) -> Option<Duration> {
        self.interval
    }

    /// Terminal loop error, once `stop` has observed one
    pub fn failure(&self) -> Option<&str> {
        self.failure.as_deref()
    }

    /// Check if the loop thread has exited on its own (error) before `stop`
    pub fn loop_exited(&self) -> bool {
        self.worker
            .as_ref()
            .is_some_and(|worker| worker.is_finished())
    }

    /// Start sampling every `interval_ms` milliseconds on a background thread
    ///
    /// Fails with [`PerflogError::InvalidConfiguration`] before any loop
    /// activity if the interval is zero or the selection is empty.
    #[instrument(skip(self, features), parent = &self.span, fields(features = %features))]
    pub fn run(&mut self, interval_ms: u64, features: FeatureSelection) -> Result<()> {
        if self.state != EngineState::Created {
            return Err(PerflogError::InvalidState(format!(
                "run called on a {} engine",
                self.state.as_str()
            )));
        }
        if interval_ms == 0 {
            return Err(PerflogError::invalid_config(
                "sampling interval must be at least 1 ms",
            ));
        }
        features.validate()?;

        let interval = Duration::from_millis(interval_ms);
        let sampler = SamplingLoop {
            handle: self.handle,
            iteration_id: self.iteration_id.clone(),
            interval,
            features,
            telemetry: Arc::clone(&self.telemetry),
            store_factory: Arc::clone(&self.store_factory),
            shutdown: Arc::clone(&self.shutdown),
            metrics: self.metrics.clone(),
        };

        let span = self.span.clone();
        let worker = thread::Builder::new()
            .name(format!("perflog-{}", self.handle))
            .spawn(move || span.in_scope(|| sampler.run()))?;

        info!(interval_ms, "Sampling loop started");
        self.interval = Some(interval);
        self.worker = Some(worker);
        self.state = EngineState::Running;
        Ok(())
    }

    /// Signal the loop to exit and wait for it
    ///
    /// Blocks until the loop has finished its current tick and closed its
    /// store; there is no timeout. Returns the loop's terminal error, if any.
    /// Calling `stop` again returns `Ok(())`.
    pub fn stop(&mut self) -> Result<()> {
        let _entered = self.span.enter();

        match self.state {
            EngineState::Stopped => return Ok(()),
            EngineState::Created => {
                self.state = EngineState::Stopped;
                debug!("Engine stopped before running");
                return Ok(());
            }
            EngineState::Running => {}
        }

        self.shutdown.store(true, Ordering::Release);
        let outcome = match self.worker.take() {
            Some(worker) => worker.join().unwrap_or(Err(PerflogError::LoopPanicked)),
            None => Ok(()),
        };
        self.state = EngineState::Stopped;

        match &outcome {
            Ok(()) => info!("Sampling loop stopped"),
            Err(e) => {
                error!(error = %e, "Sampling loop stopped with error");
                self.failure = Some(e.to_string());
            }
        }
        outcome
    }
}

impl Drop for SamplingEngine {
    fn drop(&mut self) {
        if self.state != EngineState::Stopped {
            if let Err(e) = self.stop() {
                warn!(error = %e, "Sampling engine dropped after loop failure");
            }
        }
    }
}

/// State moved onto the loop thread
struct SamplingLoop {
    handle: SocketHandle,
    iteration_id: String,
    interval: Duration,
    features: FeatureSelection,
    telemetry: Arc<dyn SubflowTelemetry>,
    store_factory: Arc<dyn StoreFactory>,
    shutdown: Arc<AtomicBool>,
    metrics: Option<SamplerMetrics>,
}

impl SamplingLoop {
    /// Open the store, sample until stopped, close the store
    fn run(self) -> Result<()> {
        let mut store = self.store_factory.open()?;
        let outcome = self.sample_until_stopped(store.as_mut());
        let closed = store.close();

        if let Err(e) = &outcome {
            error!(error = %e, "Sampling loop terminated");
            if let Some(metrics) = &self.metrics {
                metrics.record_loop_failure();
            }
        }
        if let Err(e) = &closed {
            warn!(error = %e, "Failed to close sample store");
        }
        outcome.and(closed)
    }

    fn sample_until_stopped(&self, store: &mut dyn SampleStore) -> Result<()> {
        let mut registered: HashSet<SubflowId> = HashSet::new();

        while !self.shutdown.load(Ordering::Acquire) {
            let timer = self.metrics.as_ref().map(SamplerMetrics::start_tick_timer);
            let subflows = self.tick(store, &mut registered)?;
            drop(timer);

            if let Some(metrics) = &self.metrics {
                metrics.record_tick(subflows);
            }
            thread::sleep(self.interval);
        }

        debug!(registered = registered.len(), "Stop signal observed");
        Ok(())
    }

    /// Sample every active subflow once; returns the number of subflows seen
    fn tick(
        &self,
        store: &mut dyn SampleStore,
        registered: &mut HashSet<SubflowId>,
    ) -> Result<usize> {
        let subflows = self.telemetry.subflow_stats(self.handle)?;
        // Address lookup happens at most once per tick, only if a new id shows up
        let mut addrs: Option<Vec<SubflowAddrs>> = None;

        for subflow in &subflows {
            if !registered.contains(&subflow.id) {
                if addrs.is_none() {
                    addrs = Some(self.telemetry.subflow_addrs(self.handle)?);
                }
                let info = addrs
                    .iter()
                    .flatten()
                    .find(|a| a.id == subflow.id)
                    .ok_or(PerflogError::SubflowInfoMissing {
                        subflow_id: subflow.id,
                    })?;

                store.register_subflow(&self.iteration_id, subflow.id, info.local, info.remote)?;
                registered.insert(subflow.id);
                info!(
                    subflow_id = subflow.id,
                    local = %info.local,
                    remote = %info.remote,
                    "Registered subflow"
                );
                if let Some(metrics) = &self.metrics {
                    metrics.record_registration();
                }
            }

            let sample = filter_features(&subflow.features, &self.features);
            store.record_sample(&self.iteration_id, subflow.id, &sample)?;
            if let Some(metrics) = &self.metrics {
                metrics.record_sample();
            }
        }

        Ok(subflows.len())
    }
}
