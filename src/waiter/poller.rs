//! Polling Waiter
//!
//! Repeatedly issues a query and evaluates a rule set against each result
//! until a rule matches or the attempt bound is exhausted. Sleeps between
//! polls suspend the task and abort promptly on cancellation.

use crate::domain::context::OperationContext;
use crate::error::{Error, Result};
use crate::observability::MigrationEvent;
use crate::waiter::descriptor::QuerySource;
use crate::waiter::rules::{Outcome, RuleSet};
use rand::Rng;
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Result of a successful wait
#[derive(Debug, Clone, PartialEq)]
pub struct WaitOutcome {
    /// Number of polls issued, including the matching one
    pub attempts: u32,
    /// Index of the success rule that matched
    pub rule_index: usize,
    /// Response of the matching poll (None when an error-code rule matched)
    pub response: Option<Value>,
}

/// Waiter bound to one rule set
#[derive(Debug, Clone)]
pub struct PollingWaiter {
    rules: RuleSet,
}

impl PollingWaiter {
    pub fn new(rules: RuleSet) -> Self {
        Self { rules }
    }

    pub fn rules(&self) -> &RuleSet {
        &self.rules
    }

    /// Poll `source` until a rule decides or attempts run out
    pub async fn wait<Q>(&self, source: &Q, ctx: &OperationContext) -> Result<WaitOutcome>
    where
        Q: QuerySource + ?Sized,
    {
        let rules = &self.rules;
        let max_attempts = rules.max_attempts;

        for attempt in 1..=max_attempts {
            ctx.check_cancelled()?;

            let result = source.query().await;
            let matched = rules.evaluate(&result, source.default_path());

            ctx.emit(MigrationEvent::PollAttempt {
                run_id: ctx.run_id().to_string(),
                stage: ctx.stage().to_string(),
                waiter: rules.name.clone(),
                attempt,
                max_attempts,
                matched: matched.map(|(_, rule)| rule.outcome),
            });

            match matched {
                Some((rule_index, rule)) => match rule.outcome {
                    Outcome::Success => {
                        info!(
                            waiter = %rules.name,
                            stage = %ctx.stage(),
                            attempt,
                            "Waiter reached success state"
                        );
                        return Ok(WaitOutcome {
                            attempts: attempt,
                            rule_index,
                            response: result.ok(),
                        });
                    }
                    Outcome::Failure => {
                        warn!(
                            waiter = %rules.name,
                            stage = %ctx.stage(),
                            attempt,
                            rule = %rule,
                            "Waiter reached failure state"
                        );
                        return Err(Error::WaiterRuleFailure {
                            waiter: rules.name.clone(),
                            attempt,
                            rule: Box::new(rule.clone()),
                        });
                    }
                },
                None => {
                    if let Err(err) = result {
                        return Err(Error::Remote(err));
                    }
                }
            }

            if attempt < max_attempts {
                let delay = self.next_delay();
                debug!(
                    waiter = %rules.name,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "No rule matched, polling again"
                );
                ctx.sleep(delay).await?;
            }
        }

        Err(Error::WaiterTimeout {
            waiter: rules.name.clone(),
            attempts: max_attempts,
        })
    }

    fn next_delay(&self) -> Duration {
        let jitter_ms = self.rules.poll_jitter.as_millis() as u64;
        if jitter_ms == 0 {
            return self.rules.poll_interval;
        }
        let extra = rand::thread_rng().gen_range(0..=jitter_ms);
        self.rules.poll_interval + Duration::from_millis(extra)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ports::RemoteError;
    use crate::observability::MemoryEventSink;
    use crate::waiter::rules::Matcher;
    use assert_matches::assert_matches;
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use serde_json::json;
    use std::collections::VecDeque;
    use tokio_util::sync::CancellationToken;

    /// Returns scripted results in order, repeating the last one
    struct Scripted {
        results: Mutex<VecDeque<std::result::Result<Value, RemoteError>>>,
        calls: Mutex<u32>,
    }

    impl Scripted {
        fn statuses(statuses: &[&str]) -> Self {
            Self::new(
                statuses
                    .iter()
                    .map(|s| Ok(json!({"DBClusters": [{"Status": s}]})))
                    .collect(),
            )
        }

        fn new(results: Vec<std::result::Result<Value, RemoteError>>) -> Self {
            Self {
                results: Mutex::new(results.into()),
                calls: Mutex::new(0),
            }
        }

        fn calls(&self) -> u32 {
            *self.calls.lock()
        }
    }

    #[async_trait]
    impl QuerySource for Scripted {
        async fn query(&self) -> std::result::Result<Value, RemoteError> {
            *self.calls.lock() += 1;
            let mut results = self.results.lock();
            if results.len() > 1 {
                results.pop_front().unwrap()
            } else {
                results.front().cloned().unwrap()
            }
        }
    }

    fn available_rules(max_attempts: u32) -> RuleSet {
        RuleSet::new("db_cluster_available", Duration::from_secs(30), max_attempts)
            .success(Matcher::all("DBClusters[].Status", "available"))
            .failure(Matcher::any("DBClusters[].Status", "failed"))
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_on_third_poll() {
        let source = Scripted::statuses(&["creating", "creating", "available"]);
        let waiter = PollingWaiter::new(available_rules(10));
        let ctx = OperationContext::detached("run-1");

        let started = tokio::time::Instant::now();
        let outcome = waiter.wait(&source, &ctx).await.unwrap();

        assert_eq!(outcome.attempts, 3);
        assert_eq!(outcome.rule_index, 0);
        assert_eq!(source.calls(), 3);
        // two sleeps between three polls
        assert_eq!(started.elapsed(), Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_rule_stops_on_second_poll() {
        let source = Scripted::statuses(&["creating", "failed", "available"]);
        let waiter = PollingWaiter::new(available_rules(10));
        let ctx = OperationContext::detached("run-1");

        let err = waiter.wait(&source, &ctx).await.unwrap_err();
        assert_matches!(
            err,
            Error::WaiterRuleFailure { attempt: 2, ref rule, .. } if rule.outcome == Outcome::Failure
        );
        assert_eq!(source.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_after_max_attempts() {
        let source = Scripted::statuses(&["creating"]);
        let waiter = PollingWaiter::new(available_rules(3));
        let ctx = OperationContext::detached("run-1");

        let err = waiter.wait(&source, &ctx).await.unwrap_err();
        assert_matches!(err, Error::WaiterTimeout { attempts: 3, .. });
        assert_eq!(source.calls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_error_code_rule_and_unmatched_error() {
        let rules = RuleSet::new("db_cluster_deleted", Duration::from_secs(30), 5)
            .success(Matcher::exact("length(DBClusters)", 0))
            .success(Matcher::error("DBClusterNotFoundFault"));
        let waiter = PollingWaiter::new(rules);
        let ctx = OperationContext::detached("run-1");

        let source = Scripted::new(vec![
            Ok(json!({"DBClusters": [{"Status": "deleting"}]})),
            Err(RemoteError::new("DBClusterNotFoundFault", "gone")),
        ]);
        let outcome = waiter.wait(&source, &ctx).await.unwrap();
        assert_eq!(outcome.attempts, 2);
        assert_eq!(outcome.rule_index, 1);
        assert!(outcome.response.is_none());

        let source = Scripted::new(vec![Err(RemoteError::new("AccessDenied", "no"))]);
        let err = waiter.wait(&source, &ctx).await.unwrap_err();
        assert_eq!(err.remote_code(), Some("AccessDenied"));
        assert_eq!(source.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_aborts_sleep() {
        let source = Scripted::statuses(&["creating"]);
        let waiter = PollingWaiter::new(available_rules(100));
        let cancel = CancellationToken::new();
        let ctx = OperationContext::new("run-1", cancel.clone(), MemoryEventSink::new());

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(45)).await;
            trigger.cancel();
        });

        let err = waiter.wait(&source, &ctx).await.unwrap_err();
        assert_matches!(err, Error::Cancelled);
        assert_eq!(source.calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_poll_events_emitted() {
        let source = Scripted::statuses(&["creating", "available"]);
        let waiter = PollingWaiter::new(available_rules(5));
        let sink = MemoryEventSink::new();
        let ctx = OperationContext::new("run-7", CancellationToken::new(), sink.clone())
            .for_stage("restore");

        waiter.wait(&source, &ctx).await.unwrap();

        let events = sink.events();
        assert_eq!(events.len(), 2);
        assert_matches!(
            &events[1],
            MigrationEvent::PollAttempt { attempt: 2, matched: Some(Outcome::Success), stage, .. } if stage == "restore"
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_jitter_bounds_delay() {
        let waiter = PollingWaiter::new(available_rules(3).with_jitter(Duration::from_secs(5)));
        for _ in 0..50 {
            let delay = waiter.next_delay();
            assert!(delay >= Duration::from_secs(30));
            assert!(delay <= Duration::from_secs(35));
        }
    }

    fn status_rules() -> RuleSet {
        RuleSet::new("resource_available", Duration::from_secs(1), 3)
            .success(Matcher::exact("Status", "available"))
            .failure(Matcher::exact("Status", "failed"))
    }

    fn status_source(statuses: &[&str]) -> Scripted {
        Scripted::new(statuses.iter().map(|s| Ok(json!({"Status": s}))).collect())
    }

    #[tokio::test(start_paused = true)]
    async fn test_exact_status_rules() {
        let waiter = PollingWaiter::new(status_rules());
        let ctx = OperationContext::detached("run-1");

        let source = status_source(&["pending", "pending", "available"]);
        let started = tokio::time::Instant::now();
        let outcome = waiter.wait(&source, &ctx).await.unwrap();
        assert_eq!(outcome.attempts, 3);
        assert_eq!(outcome.response, Some(json!({"Status": "available"})));
        assert_eq!(started.elapsed(), Duration::from_secs(2));

        let source = status_source(&["pending", "failed"]);
        let err = waiter.wait(&source, &ctx).await.unwrap_err();
        assert_matches!(err, Error::WaiterRuleFailure { attempt: 2, .. });
        assert_eq!(source.calls(), 2);

        let source = status_source(&["pending"]);
        let started = tokio::time::Instant::now();
        let err = waiter.wait(&source, &ctx).await.unwrap_err();
        assert_matches!(err, Error::WaiterTimeout { attempts: 3, .. });
        assert_eq!(source.calls(), 3);
        // no sleep after the last poll
        assert_eq!(started.elapsed(), Duration::from_secs(2));
    }
}
