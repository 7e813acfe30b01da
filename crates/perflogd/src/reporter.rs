//! Presentation hooks for sampling iterations

use tracing::info;

/// Receives a notification when a sampling iteration begins
///
/// Best effort: implementations must not fail or block the engine.
pub trait IterationReporter: Send + Sync {
    /// A new iteration with the given id was created
    fn iteration_started(&self, iteration_id: &str);
}

/// Reports iterations as structured log events
#[derive(Debug, Clone, Default)]
pub struct LogReporter {
    label: Option<String>,
}

impl LogReporter {
    /// Create a reporter without a connection label
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a label (e.g., the peer address) to every report
    pub fn with_label(label: impl Into<String>) -> Self {
        Self {
            label: Some(label.into()),
        }
    }
}

impl IterationReporter for LogReporter {
    fn iteration_started(&self, iteration_id: &str) {
        match &self.label {
            Some(label) => {
                info!(iteration_id, connection = %label, "Performance iteration started")
            }
            None => info!(iteration_id, "Performance iteration started"),
        }
    }
}

impl<T: IterationReporter + ?Sized> IterationReporter for std::sync::Arc<T> {
    fn iteration_started(&self, iteration_id: &str) {
        (**self).iteration_started(iteration_id)
    }
}
