//! Run cancellation.
//!
//! One token per AgentRun, propagated into every suspending call: the LLM
//! stream read, terminal polling, confirmation waits, and the `wait` tool
//! all race against it. Worker runs get child tokens so aborting the
//! master tears the whole tree down.

use tokio::sync::watch;

#[derive(Debug, Clone)]
pub struct CancelToken {
    tx: std::sync::Arc<watch::Sender<bool>>,
    rx: watch::Receiver<bool>,
}

impl CancelToken {
    pub fn new() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            tx: std::sync::Arc::new(tx),
            rx,
        }
    }

    pub fn cancel(&self) {
        let _ = self.tx.send(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve when cancelled. Safe to call from many tasks at once.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        // wait_for returns immediately if already true.
        let _ = rx.wait_for(|cancelled| *cancelled).await;
    }

    /// A token that cancels when either the parent cancels or it is
    /// cancelled directly.
    pub fn child(&self) -> CancelToken {
        let child = CancelToken::new();
        let parent = self.clone();
        let forward = child.clone();
        tokio::spawn(async move {
            parent.cancelled().await;
            forward.cancel();
        });
        child
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}
