use serde::Serialize;

/// Lifecycle of a single run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    Pending,
    Resolving,
    Instantiating,
    Executing,
    Completed,
    Failed,
    Cancelled,
}

impl RunState {
    pub fn is_final(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Legal transitions of the run state machine.
    pub fn can_transition_to(&self, next: RunState) -> bool {
        use RunState::*;
        matches!(
            (self, next),
            (Pending, Resolving)
                | (Resolving, Instantiating)
                | (Resolving, Failed)
                | (Instantiating, Executing)
                | (Instantiating, Failed)
                | (Instantiating, Cancelled)
                | (Executing, Completed)
                | (Executing, Failed)
                | (Executing, Cancelled)
        )
    }
}

/// Engine event broadcast to all subscribers.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    RunStateChanged {
        run_id: String,
        state: RunState,
    },
    NodeInstantiated {
        run_id: String,
        node_id: String,
        cached: bool,
        elapsed_ms: u64,
    },
    MemoryBound {
        run_id: String,
        node_id: String,
        messages: usize,
    },
    RunCompleted {
        run_id: String,
        elapsed_ms: u64,
    },
    RunFailed {
        run_id: String,
        error_kind: String,
        node_id: Option<String>,
        message: String,
    },
}

/// Event bus using tokio broadcast channel.
/// All subscribers receive all events.
pub struct EventBus {
    tx: tokio::sync::broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = tokio::sync::broadcast::channel(capacity);
        Self { tx }
    }

    pub fn publish(&self, event: EngineEvent) {
        // Ignore error if no receivers
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(256)
    }
}
