//! Persistence sink abstraction
//!
//! The sampling loop opens its own store through a [`StoreFactory`] on the
//! loop thread, so a [`SampleStore`] never has to be `Send`. SQLite
//! connections, for instance, stay on the thread that opened them.

use crate::error::{PerflogError, Result};
use crate::types::{FeatureMap, SubflowId};
use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::Arc;

/// Keyed-insert sink for subflow registrations and samples
pub trait SampleStore {
    /// Register a subflow for an iteration (once per subflow id)
    fn register_subflow(
        &mut self,
        iteration_id: &str,
        subflow_id: SubflowId,
        local: SocketAddr,
        remote: SocketAddr,
    ) -> Result<()>;

    /// Record one filtered sample
    fn record_sample(
        &mut self,
        iteration_id: &str,
        subflow_id: SubflowId,
        features: &FeatureMap,
    ) -> Result<()>;

    /// Release the underlying connection
    fn close(self: Box<Self>) -> Result<()>;
}

/// Opens a fresh [`SampleStore`] on the calling thread
pub trait StoreFactory: Send + Sync {
    /// Open a new store handle
    fn open(&self) -> Result<Box<dyn SampleStore>>;
}

/// One call observed by a [`MemoryStore`]
#[derive(Debug, Clone, PartialEq)]
pub enum StoreEvent {
    /// A store handle was opened
    Opened,
    /// `register_subflow` was called
    Registered {
        iteration_id: String,
        subflow_id: SubflowId,
        local: SocketAddr,
        remote: SocketAddr,
    },
    /// `record_sample` was called
    Recorded {
        iteration_id: String,
        subflow_id: SubflowId,
        features: FeatureMap,
    },
    /// The store handle was closed
    Closed,
}

/// In-memory store that records every call, used for dry runs and tests
///
/// Handles opened from the same factory share one event log.
#[derive(Debug, Clone, Default)]
pub struct MemoryStoreFactory {
    events: Arc<Mutex<Vec<StoreEvent>>>,
    fail_register: Arc<Mutex<Option<SubflowId>>>,
}

impl MemoryStoreFactory {
    /// Create a factory with an empty event log
    pub fn new() -> Self {
        Self::default()
    }

    /// Make `register_subflow` fail for the given subflow id
    pub fn fail_register_for(&self, subflow_id: SubflowId) {
        *self.fail_register.lock() = Some(subflow_id);
    }

    /// Snapshot of every recorded call, in order
    pub fn events(&self) -> Vec<StoreEvent> {
        self.events.lock().clone()
    }

    /// Subflow ids registered so far, in order
    pub fn registrations(&self) -> Vec<SubflowId> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                StoreEvent::Registered { subflow_id, .. } => Some(*subflow_id),
                _ => None,
            })
            .collect()
    }

    /// Samples recorded so far, in order
    pub fn samples(&self) -> Vec<(SubflowId, FeatureMap)> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                StoreEvent::Recorded {
                    subflow_id,
                    features,
                    ..
                } => Some((*subflow_id, features.clone())),
                _ => None,
            })
            .collect()
    }

    /// Number of recorded calls of a given kind
    pub fn count(&self, matches: impl Fn(&StoreEvent) -> bool) -> usize {
        self.events.lock().iter().filter(|e| matches(e)).count()
    }
}

impl StoreFactory for MemoryStoreFactory {
    fn open(&self) -> Result<Box<dyn SampleStore>> {
        self.events.lock().push(StoreEvent::Opened);
        Ok(Box::new(MemoryStore {
            events: Arc::clone(&self.events),
            fail_register: *self.fail_register.lock(),
        }))
    }
}

/// Store handle opened by [`MemoryStoreFactory`]
#[derive(Debug)]
pub struct MemoryStore {
    events: Arc<Mutex<Vec<StoreEvent>>>,
    fail_register: Option<SubflowId>,
}

impl SampleStore for MemoryStore {
    fn register_subflow(
        &mut self,
        iteration_id: &str,
        subflow_id: SubflowId,
        local: SocketAddr,
        remote: SocketAddr,
    ) -> Result<()> {
        if self.fail_register == Some(subflow_id) {
            return Err(PerflogError::persistence(
                "register_subflow",
                format!("injected failure for subflow {}", subflow_id),
            ));
        }
        self.events.lock().push(StoreEvent::Registered {
            iteration_id: iteration_id.to_string(),
            subflow_id,
            local,
            remote,
        });
        Ok(())
    }

    fn record_sample(
        &mut self,
        iteration_id: &str,
        subflow_id: SubflowId,
        features: &FeatureMap,
    ) -> Result<()> {
        self.events.lock().push(StoreEvent::Recorded {
            iteration_id: iteration_id.to_string(),
            subflow_id,
            features: features.clone(),
        });
        Ok(())
    }

    fn close(self: Box<Self>) -> Result<()> {
        self.events.lock().push(StoreEvent::Closed);
        Ok(())
    }
}
