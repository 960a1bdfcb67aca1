//! Engine events for frontends.
//!
//! The engine reports progress through an [`EventEmitter`] so a CLI, GUI,
//! or test harness can render it without the core depending on any UI.

use crate::safety::RiskLevel;

/// A progress event emitted during a run.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    /// Streamed fragment of the model's visible text.
    TextDelta { run_id: String, text: String },
    ToolStarted {
        run_id: String,
        tool_name: String,
        args_preview: String,
    },
    ToolFinished {
        run_id: String,
        tool_name: String,
        success: bool,
    },
    ConfirmationRequested {
        run_id: String,
        tool_call_id: String,
        command: String,
        risk: RiskLevel,
    },
    ReflectionInjected { run_id: String, issues: Vec<String> },
    StrategySwitched { run_id: String, to: String },
    RunFinished {
        run_id: String,
        status: String,
        answer: String,
    },
}

/// Sink for engine events. Implementations must be cheap and non-blocking.
pub trait EventEmitter: Send + Sync {
    fn emit(&self, event: EngineEvent);
}

/// Default emitter: drops everything.
pub struct NoopEmitter;

impl EventEmitter for NoopEmitter {
    fn emit(&self, _event: EngineEvent) {}
}

/// Emitter backed by an unbounded std channel, for frontends that poll.
pub struct ChannelEmitter {
    tx: std::sync::mpsc::Sender<EngineEvent>,
}

impl ChannelEmitter {
    pub fn new() -> (Self, std::sync::mpsc::Receiver<EngineEvent>) {
        let (tx, rx) = std::sync::mpsc::channel();
        (Self { tx }, rx)
    }
}

impl EventEmitter for ChannelEmitter {
    fn emit(&self, event: EngineEvent) {
        // A dropped receiver means the frontend went away; not an error.
        let _ = self.tx.send(event);
    }
}
