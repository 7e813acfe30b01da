//! Integration tests for the sampling engine
//!
//! Drives a real `SamplingEngine` thread against scripted telemetry and
//! recording stores, covering:
//! - Registration once per subflow per iteration
//! - Feature filtering (reserved columns, explicit selections)
//! - Fatal loop errors surfacing from `stop()`
//! - Store lifecycle (opened and closed exactly once)
//! - SQLite persistence end to end

use mptcp_perflogd::{
    EngineState, FeatureMap, FeatureSelection, FeatureValue, IterationReporter,
    MemoryStoreFactory, PerflogError, RESERVED_COLUMNS, Result, SamplerMetrics, SamplingEngine,
    SocketHandle, SqliteStore, SqliteStoreFactory, StoreEvent, SubflowAddrs, SubflowStats,
    SubflowTelemetry,
};
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

const SOCKFD: SocketHandle = 5;

/// Telemetry that serves one scripted subflow list per tick, then nothing
#[derive(Default)]
struct ScriptedTelemetry {
    ticks: Mutex<VecDeque<Vec<SubflowStats>>>,
    addrs: Mutex<Vec<SubflowAddrs>>,
    stats_calls: AtomicUsize,
    addr_calls: AtomicUsize,
    fail_stats: bool,
}

impl ScriptedTelemetry {
    fn new() -> Self {
        Self::default()
    }

    fn failing() -> Self {
        Self {
            fail_stats: true,
            ..Self::default()
        }
    }

    fn tick(self, subflows: Vec<SubflowStats>) -> Self {
        self.ticks.lock().push_back(subflows);
        self
    }

    fn known_addr(self, id: u32) -> Self {
        self.addrs.lock().push(SubflowAddrs::new(
            id,
            format!("192.168.1.10:{}", 50000 + id).parse().unwrap(),
            "203.0.113.7:443".parse().unwrap(),
        ));
        self
    }

    fn scripted_ticks(&self) -> usize {
        self.ticks.lock().len()
    }

    fn stats_calls(&self) -> usize {
        self.stats_calls.load(Ordering::SeqCst)
    }
}

impl SubflowTelemetry for ScriptedTelemetry {
    fn subflow_stats(&self, handle: SocketHandle) -> Result<Vec<SubflowStats>> {
        assert_eq!(handle, SOCKFD);
        self.stats_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_stats {
            return Err(PerflogError::telemetry("getsockopt failed: Bad file descriptor"));
        }
        Ok(self.ticks.lock().pop_front().unwrap_or_default())
    }

    fn subflow_addrs(&self, handle: SocketHandle) -> Result<Vec<SubflowAddrs>> {
        assert_eq!(handle, SOCKFD);
        self.addr_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.addrs.lock().clone())
    }
}

#[derive(Default)]
struct RecordingReporter(Mutex<Vec<String>>);

impl IterationReporter for RecordingReporter {
    fn iteration_started(&self, iteration_id: &str) {
        self.0.lock().push(iteration_id.to_string());
    }
}

/// Test fixture: engine wired to scripted telemetry and a recording store
struct TestSetup {
    telemetry: Arc<ScriptedTelemetry>,
    store: MemoryStoreFactory,
    engine: SamplingEngine,
}

impl TestSetup {
    fn new(telemetry: ScriptedTelemetry) -> Self {
        Self::with_store(telemetry, MemoryStoreFactory::new())
    }

    fn with_store(telemetry: ScriptedTelemetry, store: MemoryStoreFactory) -> Self {
        let telemetry = Arc::new(telemetry);
        let engine = SamplingEngine::new(
            SOCKFD,
            telemetry.clone(),
            Arc::new(store.clone()),
            &RecordingReporter::default(),
        );
        Self {
            telemetry,
            store,
            engine,
        }
    }

    /// Run until every scripted tick has been fully processed, then stop
    fn run_script(&mut self, features: FeatureSelection) -> Result<()> {
        let ticks = self.telemetry.scripted_ticks();
        self.engine.run(1, features)?;
        let telemetry = self.telemetry.clone();
        // Tick N is complete once the loop asks for tick N + 1
        wait_until(|| telemetry.stats_calls() > ticks);
        self.engine.stop()
    }
}

fn wait_until(condition: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for sampling loop");
        thread::sleep(Duration::from_millis(1));
    }
}

fn features(pairs: &[(&str, u64)]) -> FeatureMap {
    pairs
        .iter()
        .map(|(name, value)| (name.to_string(), FeatureValue::Unsigned(*value)))
        .collect()
}

#[test]
fn test_register_then_record_with_all_features() {
    let telemetry = ScriptedTelemetry::new().known_addr(1).tick(vec![
        SubflowStats::new(1)
            .with_feature("id", 1u32)
            .with_feature("tcpi_state", 3u8)
            .with_feature("rtt", 50u32),
    ]);
    let mut setup = TestSetup::new(telemetry);
    setup.run_script(FeatureSelection::All).unwrap();

    let iteration = setup.engine.iteration_id().to_string();
    assert_eq!(
        setup.store.events(),
        vec![
            StoreEvent::Opened,
            StoreEvent::Registered {
                iteration_id: iteration.clone(),
                subflow_id: 1,
                local: "192.168.1.10:50001".parse().unwrap(),
                remote: "203.0.113.7:443".parse().unwrap(),
            },
            StoreEvent::Recorded {
                iteration_id: iteration,
                subflow_id: 1,
                features: features(&[("rtt", 50)]),
            },
            StoreEvent::Closed,
        ]
    );
    assert_eq!(setup.engine.state(), EngineState::Stopped);
}

#[test]
fn test_known_subflow_is_not_registered_again() {
    let sample = || {
        SubflowStats::new(1)
            .with_feature("id", 1u32)
            .with_feature("tcpi_state", 1u8)
            .with_feature("rtt", 50u32)
    };
    let telemetry = ScriptedTelemetry::new()
        .known_addr(1)
        .tick(vec![sample()])
        .tick(vec![sample()]);
    let mut setup = TestSetup::new(telemetry);
    setup.run_script(FeatureSelection::All).unwrap();

    assert_eq!(setup.store.registrations(), vec![1]);
    assert_eq!(setup.store.samples().len(), 2);
    assert_eq!(setup.telemetry.addr_calls.load(Ordering::SeqCst), 1);
}

#[test]
fn test_surviving_subflow_keeps_its_id_after_close() {
    let sample = |id: u32, rtt: u32| {
        SubflowStats::new(id)
            .with_feature("id", id)
            .with_feature("tcpi_rtt", rtt)
    };
    // Subflow 1 closes after the first tick; 3 joins on the third
    let telemetry = ScriptedTelemetry::new()
        .known_addr(1)
        .known_addr(2)
        .known_addr(3)
        .tick(vec![sample(1, 100), sample(2, 200)])
        .tick(vec![sample(2, 210)])
        .tick(vec![sample(2, 220), sample(3, 300)]);
    let mut setup = TestSetup::new(telemetry);
    setup.run_script(FeatureSelection::All).unwrap();

    assert_eq!(setup.store.registrations(), vec![1, 2, 3]);
    let registered_local: Vec<(u32, String)> = setup
        .store
        .events()
        .into_iter()
        .filter_map(|e| match e {
            StoreEvent::Registered {
                subflow_id, local, ..
            } => Some((subflow_id, local.to_string())),
            _ => None,
        })
        .collect();
    assert_eq!(
        registered_local,
        vec![
            (1, "192.168.1.10:50001".to_string()),
            (2, "192.168.1.10:50002".to_string()),
            (3, "192.168.1.10:50003".to_string()),
        ]
    );

    let rtts_of = |id: u32| -> Vec<FeatureValue> {
        setup
            .store
            .samples()
            .into_iter()
            .filter(|(subflow_id, _)| *subflow_id == id)
            .map(|(_, features)| features["tcpi_rtt"].clone())
            .collect()
    };
    assert_eq!(rtts_of(1), vec![FeatureValue::Unsigned(100)]);
    assert_eq!(
        rtts_of(2),
        vec![
            FeatureValue::Unsigned(200),
            FeatureValue::Unsigned(210),
            FeatureValue::Unsigned(220)
        ]
    );
    assert_eq!(rtts_of(3), vec![FeatureValue::Unsigned(300)]);
}

#[test]
fn test_explicit_selection_keeps_only_named_features() {
    let telemetry = ScriptedTelemetry::new().known_addr(2).tick(vec![
        SubflowStats::new(2)
            .with_feature("id", 2u32)
            .with_feature("rtt", 10u32)
            .with_feature("cwnd", 20u32),
    ]);
    let mut setup = TestSetup::new(telemetry);
    setup
        .run_script(FeatureSelection::only(["rtt"]).unwrap())
        .unwrap();

    assert_eq!(setup.store.samples(), vec![(2, features(&[("rtt", 10)]))]);
}

#[test]
fn test_reserved_columns_never_written_even_when_selected() {
    let raw = SubflowStats::new(1)
        .with_feature("id", 1u32)
        .with_feature("tcpi_state", 1u8)
        .with_feature("tcpi_ca_state", 0u8)
        .with_feature("tcpi_rtt", 900u32)
        .with_feature("tcpi_snd_cwnd", 10u32)
        .with_feature("tcpi_retransmits", 0u8);
    let telemetry = ScriptedTelemetry::new()
        .known_addr(1)
        .tick(vec![raw.clone()])
        .tick(vec![raw]);
    let selection =
        FeatureSelection::only(["tcpi_state", "id", "tcpi_rtt", "tcpi_snd_cwnd"]).unwrap();
    let mut setup = TestSetup::new(telemetry);
    setup.run_script(selection.clone()).unwrap();

    let samples = setup.store.samples();
    assert_eq!(samples.len(), 2);
    for (_, sample) in samples {
        for reserved in RESERVED_COLUMNS {
            assert!(!sample.contains_key(reserved), "{} was written", reserved);
        }
        assert!(sample.keys().all(|name| selection.allows(name)));
        assert_eq!(sample, features(&[("tcpi_rtt", 900), ("tcpi_snd_cwnd", 10)]));
    }
}

#[test]
fn test_all_selection_keeps_every_non_reserved_feature() {
    let raw = SubflowStats::new(3)
        .with_feature("id", 3u32)
        .with_feature("tcpi_state", 1u8)
        .with_feature("tcpi_ca_state", 0u8)
        .with_feature("tcpi_rtt", 900u32)
        .with_feature("tcpi_rttvar", 120u32)
        .with_feature("tcpi_snd_cwnd", 10u32)
        .with_feature("tcpi_total_retrans", 2u32);
    let telemetry = ScriptedTelemetry::new().known_addr(3).tick(vec![raw.clone()]);
    let mut setup = TestSetup::new(telemetry);
    setup.run_script(FeatureSelection::All).unwrap();

    let expected: FeatureMap = raw
        .features
        .into_iter()
        .filter(|(name, _)| !RESERVED_COLUMNS.contains(&name.as_str()))
        .collect();
    assert_eq!(setup.store.samples(), vec![(3, expected)]);
}

#[test]
fn test_zero_interval_rejected_before_loop_activity() {
    let mut setup = TestSetup::new(ScriptedTelemetry::new().known_addr(1));

    let err = setup.engine.run(0, FeatureSelection::All).unwrap_err();
    assert!(matches!(err, PerflogError::InvalidConfiguration(_)));

    thread::sleep(Duration::from_millis(20));
    assert!(setup.store.events().is_empty());
    assert_eq!(setup.telemetry.stats_calls(), 0);
    assert_eq!(setup.engine.state(), EngineState::Created);
}

#[test]
fn test_missing_address_info_ends_loop() {
    // Stats report subflow 4, the address query only knows subflow 1
    let telemetry = ScriptedTelemetry::new()
        .known_addr(1)
        .tick(vec![SubflowStats::new(4).with_feature("rtt", 7u32)]);
    let mut setup = TestSetup::new(telemetry);
    setup.engine.run(1, FeatureSelection::All).unwrap();

    let engine = &setup.engine;
    wait_until(|| engine.loop_exited());
    let err = setup.engine.stop().unwrap_err();

    assert!(matches!(err, PerflogError::SubflowInfoMissing { subflow_id: 4 }));
    assert_eq!(
        setup.engine.failure(),
        Some("Subflow info not found for subflow id: 4")
    );
    assert!(setup.store.registrations().is_empty());
    assert!(setup.store.samples().is_empty());
    assert_eq!(setup.store.count(|e| matches!(e, StoreEvent::Closed)), 1);
    // The loop never came back for a second tick
    assert_eq!(setup.telemetry.stats_calls(), 1);
}

#[test]
fn test_registration_failure_ends_loop() {
    let store = MemoryStoreFactory::new();
    store.fail_register_for(2);
    let telemetry = ScriptedTelemetry::new().known_addr(1).known_addr(2).tick(vec![
        SubflowStats::new(1).with_feature("rtt", 1u32),
        SubflowStats::new(2).with_feature("rtt", 2u32),
    ]);
    let mut setup = TestSetup::with_store(telemetry, store);
    setup.engine.run(1, FeatureSelection::All).unwrap();

    let engine = &setup.engine;
    wait_until(|| engine.loop_exited());
    let err = setup.engine.stop().unwrap_err();

    assert!(matches!(
        err,
        PerflogError::Persistence { ref operation, .. } if operation == "register_subflow"
    ));
    assert_eq!(setup.store.registrations(), vec![1]);
    assert_eq!(setup.store.samples().len(), 1);
    assert_eq!(setup.store.events().last(), Some(&StoreEvent::Closed));
}

#[test]
fn test_telemetry_failure_ends_loop() {
    let mut setup = TestSetup::new(ScriptedTelemetry::failing());
    setup.engine.run(1, FeatureSelection::All).unwrap();

    let engine = &setup.engine;
    wait_until(|| engine.loop_exited());
    let err = setup.engine.stop().unwrap_err();

    assert!(matches!(err, PerflogError::Telemetry(_)));
    assert_eq!(
        setup.store.events(),
        vec![StoreEvent::Opened, StoreEvent::Closed]
    );
}

#[test]
fn test_no_store_calls_after_stop() {
    let telemetry = ScriptedTelemetry::new().known_addr(1);
    for _ in 0..1000 {
        telemetry
            .ticks
            .lock()
            .push_back(vec![SubflowStats::new(1).with_feature("rtt", 1u32)]);
    }
    let mut setup = TestSetup::new(telemetry);
    setup.engine.run(1, FeatureSelection::All).unwrap();

    let store = setup.store.clone();
    wait_until(|| store.samples().len() >= 3);
    setup.engine.stop().unwrap();

    let after_stop = setup.store.events();
    assert_eq!(after_stop.last(), Some(&StoreEvent::Closed));
    thread::sleep(Duration::from_millis(30));
    assert_eq!(setup.store.events(), after_stop);
}

#[test]
fn test_stop_is_idempotent() {
    let mut setup = TestSetup::new(ScriptedTelemetry::new());
    setup.run_script(FeatureSelection::All).unwrap();
    setup.engine.stop().unwrap();
    assert_eq!(setup.store.count(|e| matches!(e, StoreEvent::Closed)), 1);
}

#[test]
fn test_drop_stops_running_engine() {
    let store = MemoryStoreFactory::new();
    {
        let mut setup = TestSetup::with_store(ScriptedTelemetry::new(), store.clone());
        setup.engine.run(1, FeatureSelection::All).unwrap();
        thread::sleep(Duration::from_millis(5));
    }
    let events = store.events();
    assert_eq!(events.first(), Some(&StoreEvent::Opened));
    assert_eq!(events.last(), Some(&StoreEvent::Closed));
}

#[test]
fn test_reporter_notified_once_per_iteration() {
    let reporter = RecordingReporter::default();
    let telemetry: Arc<ScriptedTelemetry> = Arc::new(ScriptedTelemetry::new());
    let first = SamplingEngine::new(
        SOCKFD,
        telemetry.clone(),
        Arc::new(MemoryStoreFactory::new()),
        &reporter,
    );
    let second = SamplingEngine::new(
        SOCKFD,
        telemetry,
        Arc::new(MemoryStoreFactory::new()),
        &reporter,
    );

    assert_ne!(first.iteration_id(), second.iteration_id());
    assert_eq!(
        *reporter.0.lock(),
        vec![
            first.iteration_id().to_string(),
            second.iteration_id().to_string()
        ]
    );
}

#[test]
fn test_metrics_track_loop_activity() {
    let telemetry = ScriptedTelemetry::new()
        .known_addr(1)
        .known_addr(2)
        .tick(vec![
            SubflowStats::new(1).with_feature("rtt", 1u32),
            SubflowStats::new(2).with_feature("rtt", 2u32),
        ])
        .tick(vec![SubflowStats::new(1).with_feature("rtt", 3u32)]);
    let telemetry = Arc::new(telemetry);
    let store = MemoryStoreFactory::new();
    let metrics = SamplerMetrics::new().unwrap();
    let mut engine = SamplingEngine::new(
        SOCKFD,
        telemetry.clone(),
        Arc::new(store.clone()),
        &RecordingReporter::default(),
    )
    .with_metrics(metrics.clone());

    engine.run(1, FeatureSelection::All).unwrap();
    wait_until(|| telemetry.stats_calls() > 2);
    engine.stop().unwrap();

    assert_eq!(metrics.samples_recorded(), 3);
    let text = metrics.gather_metrics();
    assert!(text.contains("perflogd_subflows_registered_total 2"));
    assert!(text.contains("perflogd_loop_failures_total 0"));
}

#[test]
fn test_sqlite_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("performance_log.db");

    let telemetry = Arc::new(
        ScriptedTelemetry::new()
            .known_addr(1)
            .known_addr(2)
            .tick(vec![SubflowStats::new(1)
                .with_feature("id", 1u32)
                .with_feature("tcpi_rtt", 900u32)])
            .tick(vec![
                SubflowStats::new(1)
                    .with_feature("id", 1u32)
                    .with_feature("tcpi_rtt", 950u32),
                SubflowStats::new(2)
                    .with_feature("id", 2u32)
                    .with_feature("tcpi_rtt", 1200u32),
            ]),
    );
    let mut engine = SamplingEngine::new(
        SOCKFD,
        telemetry.clone(),
        Arc::new(SqliteStoreFactory::new(&path)),
        &RecordingReporter::default(),
    );
    engine.run(1, FeatureSelection::All).unwrap();
    wait_until(|| telemetry.stats_calls() > 2);
    engine.stop().unwrap();

    let reader = SqliteStore::open(&path).unwrap();
    let subflows = reader.subflows(engine.iteration_id()).unwrap();
    assert_eq!(
        subflows.iter().map(|s| s.subflow_id).collect::<Vec<_>>(),
        vec![1, 2]
    );
    assert_eq!(subflows[1].local_addr, "192.168.1.10:50002");
    assert_eq!(subflows[1].remote_addr, "203.0.113.7:443");

    assert_eq!(
        reader.samples(engine.iteration_id()).unwrap(),
        vec![
            (1, features(&[("tcpi_rtt", 900)])),
            (1, features(&[("tcpi_rtt", 950)])),
            (2, features(&[("tcpi_rtt", 1200)])),
        ]
    );
}

#[test]
fn test_sqlite_iterations_are_separate() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("performance_log.db");
    let mut iterations = Vec::new();

    for _ in 0..2 {
        let telemetry = Arc::new(
            ScriptedTelemetry::new()
                .known_addr(1)
                .tick(vec![SubflowStats::new(1).with_feature("tcpi_rtt", 5u32)]),
        );
        let mut engine = SamplingEngine::new(
            SOCKFD,
            telemetry.clone(),
            Arc::new(SqliteStoreFactory::new(&path)),
            &RecordingReporter::default(),
        );
        engine.run(1, FeatureSelection::All).unwrap();
        wait_until(|| telemetry.stats_calls() > 1);
        engine.stop().unwrap();
        iterations.push(engine.iteration_id().to_string());
    }

    let reader = SqliteStore::open(&path).unwrap();
    for iteration in &iterations {
        // A fresh iteration starts with an empty registration cache
        assert_eq!(reader.subflows(iteration).unwrap().len(), 1);
        assert_eq!(reader.samples(iteration).unwrap().len(), 1);
    }
}
