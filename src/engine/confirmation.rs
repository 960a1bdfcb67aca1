//! Confirmation handshake for risk-gated commands.
//!
//! The engine raises at most one [`PendingConfirmation`] per run and
//! suspends until it is resolved or the run aborts. Resolution is a
//! one-shot: the second resolve of the same confirmation is a no-op, which
//! protects against double-submit races from the frontend.

use serde_json::Value;
use tokio::sync::{oneshot, Mutex};

use crate::safety::RiskLevel;

/// The decision a frontend hands back for a pending confirmation.
#[derive(Debug, Clone)]
pub struct ConfirmationDecision {
    pub approved: bool,
    /// Arguments edited by the operator before approval, if any.
    pub modified_args: Option<Value>,
}

impl ConfirmationDecision {
    pub fn approved() -> Self {
        Self {
            approved: true,
            modified_args: None,
        }
    }

    pub fn rejected() -> Self {
        Self {
            approved: false,
            modified_args: None,
        }
    }
}

/// A confirmation waiting on the operator.
pub struct PendingConfirmation {
    pub run_id: String,
    pub tool_call_id: String,
    pub tool_name: String,
    pub tool_args: Value,
    pub risk: RiskLevel,
    tx: Option<oneshot::Sender<ConfirmationDecision>>,
}

impl PendingConfirmation {
    /// Resolve the confirmation. Returns false if it was already resolved.
    pub fn resolve(&mut self, decision: ConfirmationDecision) -> bool {
        match self.tx.take() {
            Some(tx) => tx.send(decision).is_ok(),
            None => false,
        }
    }
}

impl std::fmt::Debug for PendingConfirmation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingConfirmation")
            .field("run_id", &self.run_id)
            .field("tool_call_id", &self.tool_call_id)
            .field("tool_name", &self.tool_name)
            .field("risk", &self.risk)
            .field("resolved", &self.tx.is_none())
            .finish()
    }
}

/// Per-run slot holding the single live confirmation.
#[derive(Default)]
pub struct ConfirmationSlot {
    slot: Mutex<Option<PendingConfirmation>>,
}

impl ConfirmationSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publish a confirmation and receive the channel the engine awaits.
    /// Fails if one is already pending for this run.
    pub async fn raise(
        &self,
        run_id: &str,
        tool_call_id: &str,
        tool_name: &str,
        tool_args: Value,
        risk: RiskLevel,
    ) -> anyhow::Result<oneshot::Receiver<ConfirmationDecision>> {
        let mut slot = self.slot.lock().await;
        if slot.is_some() {
            anyhow::bail!("a confirmation is already pending for run {}", run_id);
        }
        let (tx, rx) = oneshot::channel();
        *slot = Some(PendingConfirmation {
            run_id: run_id.to_string(),
            tool_call_id: tool_call_id.to_string(),
            tool_name: tool_name.to_string(),
            tool_args,
            risk,
            tx: Some(tx),
        });
        Ok(rx)
    }

    /// Resolve the pending confirmation if its tool_call_id matches.
    /// Returns false for a stale or unknown id, or a second resolve.
    pub async fn resolve(&self, tool_call_id: &str, decision: ConfirmationDecision) -> bool {
        let mut slot = self.slot.lock().await;
        match slot.as_mut() {
            Some(pending) if pending.tool_call_id == tool_call_id => {
                let sent = pending.resolve(decision);
                *slot = None;
                sent
            }
            _ => false,
        }
    }

    /// Reject and clear whatever is pending (used on abort).
    pub async fn reject_pending(&self) {
        let mut slot = self.slot.lock().await;
        if let Some(pending) = slot.as_mut() {
            pending.resolve(ConfirmationDecision::rejected());
        }
        *slot = None;
    }

    /// Snapshot of the pending confirmation for frontends.
    pub async fn peek(&self) -> Option<(String, String, RiskLevel)> {
        self.slot
            .lock()
            .await
            .as_ref()
            .map(|p| (p.tool_call_id.clone(), p.tool_name.clone(), p.risk))
    }

    /// Drop the slot after the engine observed the decision, so the next
    /// gated command can raise again.
    pub async fn clear(&self) {
        *self.slot.lock().await = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_raise_resolve_roundtrip() {
        let slot = ConfirmationSlot::new();
        let rx = slot
            .raise("run-1", "call_1", "execute_command", serde_json::json!({}), RiskLevel::Dangerous)
            .await
            .unwrap();

        assert!(slot.resolve("call_1", ConfirmationDecision::approved()).await);
        let decision = rx.await.unwrap();
        assert!(decision.approved);
        // Slot is free again.
        assert!(slot.peek().await.is_none());
    }

    #[tokio::test]
    async fn test_second_raise_rejected_while_pending() {
        let slot = ConfirmationSlot::new();
        let _rx = slot
            .raise("run-1", "call_1", "t", serde_json::json!({}), RiskLevel::Moderate)
            .await
            .unwrap();
        assert!(slot
            .raise("run-1", "call_2", "t", serde_json::json!({}), RiskLevel::Moderate)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_stale_id_ignored() {
        let slot = ConfirmationSlot::new();
        let _rx = slot
            .raise("run-1", "call_1", "t", serde_json::json!({}), RiskLevel::Moderate)
            .await
            .unwrap();
        assert!(!slot.resolve("call_9", ConfirmationDecision::approved()).await);
        assert!(slot.peek().await.is_some());
    }

    #[tokio::test]
    async fn test_double_resolve_is_noop() {
        let slot = ConfirmationSlot::new();
        let rx = slot
            .raise("run-1", "call_1", "t", serde_json::json!({}), RiskLevel::Moderate)
            .await
            .unwrap();
        assert!(slot.resolve("call_1", ConfirmationDecision::rejected()).await);
        // Slot already cleared; the retry is a no-op.
        assert!(!slot.resolve("call_1", ConfirmationDecision::approved()).await);
        assert!(!rx.await.unwrap().approved);
    }

    #[tokio::test]
    async fn test_reject_pending_on_abort() {
        let slot = ConfirmationSlot::new();
        let rx = slot
            .raise("run-1", "call_1", "t", serde_json::json!({}), RiskLevel::Dangerous)
            .await
            .unwrap();
        slot.reject_pending().await;
        assert!(!rx.await.unwrap().approved);
    }
}
