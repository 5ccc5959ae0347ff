//! Operation context shared by waiters, retry policies and stages
//!
//! Carries run/stage identity for events, the cooperative cancellation
//! token, and the injected event sink.

use crate::error::{Error, Result};
use crate::observability::{EventSinkRef, MigrationEvent, TracingEventSink};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Per-operation context
#[derive(Clone)]
pub struct OperationContext {
    run_id: String,
    stage: String,
    cancel: CancellationToken,
    events: EventSinkRef,
}

impl OperationContext {
    /// Create a run-scoped context
    pub fn new(run_id: impl Into<String>, cancel: CancellationToken, events: EventSinkRef) -> Self {
        Self {
            run_id: run_id.into(),
            stage: String::new(),
            cancel,
            events,
        }
    }

    /// Context with its own token that logs through tracing
    pub fn detached(run_id: impl Into<String>) -> Self {
        Self::new(
            run_id,
            CancellationToken::new(),
            Arc::new(TracingEventSink::default()),
        )
    }

    /// Derive a context for one stage of the run
    pub fn for_stage(&self, stage: impl Into<String>) -> Self {
        Self {
            run_id: self.run_id.clone(),
            stage: stage.into(),
            cancel: self.cancel.clone(),
            events: self.events.clone(),
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn stage(&self) -> &str {
        &self.stage
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Fail with `Cancelled` if the token has fired
    pub fn check_cancelled(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        Ok(())
    }

    /// Suspend for `duration` unless cancelled first
    pub async fn sleep(&self, duration: Duration) -> Result<()> {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(Error::Cancelled),
            _ = tokio::time::sleep(duration) => Ok(()),
        }
    }

    pub fn emit(&self, event: MigrationEvent) {
        self.events.emit(&event);
    }
}

impl std::fmt::Debug for OperationContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationContext")
            .field("run_id", &self.run_id)
            .field("stage", &self.stage)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[tokio::test(start_paused = true)]
    async fn test_sleep_completes() {
        let ctx = OperationContext::detached("run-1");
        assert!(ctx.sleep(Duration::from_secs(30)).await.is_ok());
    }

    #[tokio::test]
    async fn test_sleep_aborts_on_cancel() {
        let ctx = OperationContext::detached("run-1").for_stage("copy");
        let token = ctx.cancellation_token().clone();
        tokio::spawn(async move { token.cancel() });

        let result = ctx.sleep(Duration::from_secs(3600)).await;
        assert_matches!(result, Err(Error::Cancelled));
        assert_matches!(ctx.check_cancelled(), Err(Error::Cancelled));
        assert_eq!(ctx.stage(), "copy");
    }
}
