//! Migration Stage
//!
//! Executes one [`StageDefinition`]: idempotency pre-check, action
//! submission (optionally under the retry policy), the wait for the
//! asynchronous effect, and extraction of produced identifiers.

use crate::domain::context::OperationContext;
use crate::domain::ports::{ClientProvider, ControlPlaneClientRef, Identifiers, RemoteError, ResourceId};
use crate::error::{Error, Result};
use crate::migration::config::{BatchSpec, OutputBinding, Precheck, RetryScope, StageDefinition};
use crate::observability::{MigrationEvent, SkipReason};
use crate::retry::{RetryConfig, RetryPolicy};
use crate::waiter::descriptor::{resolve_params, Bindings, QuerySource};
use crate::waiter::model::WaiterModel;
use crate::waiter::path::ExtractPath;
use crate::waiter::poller::PollingWaiter;
use crate::waiter::rules::{handles_error, Outcome};
use futures::stream::{self, StreamExt};
use serde_json::Value;
use tracing::{debug, info, warn};

/// What a stage produced
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StageOutput {
    /// Identifiers handed to later stages
    pub produced: Identifiers,
    /// The pre-check found the action's effect already in place
    pub precheck_satisfied: bool,
    /// Items processed by a batch stage
    pub items: usize,
}

/// A stage definition bound to its client, waiter and retry policy
pub struct MigrationStage<'a> {
    definition: &'a StageDefinition,
    client: ControlPlaneClientRef,
    waiter: Option<PollingWaiter>,
    retry: RetryPolicy,
}

impl<'a> MigrationStage<'a> {
    /// Resolve the stage's client, waiter and retry policy
    pub fn compile(
        definition: &'a StageDefinition,
        clients: &dyn ClientProvider,
        waiters: &WaiterModel,
        default_retry: &RetryConfig,
    ) -> Result<Self> {
        let client = clients.client(definition.context)?;
        let waiter = definition
            .wait
            .as_ref()
            .map(|w| w.rules(waiters).map(PollingWaiter::new))
            .transpose()?;
        let retry = RetryPolicy::from_config(
            definition
                .retry
                .clone()
                .unwrap_or_else(|| default_retry.clone()),
        );

        Ok(Self {
            definition,
            client,
            waiter,
            retry,
        })
    }

    pub fn name(&self) -> &str {
        &self.definition.name
    }

    pub fn definition(&self) -> &StageDefinition {
        self.definition
    }

    /// Run the stage against the identifiers produced so far
    pub async fn run(&self, inputs: &Identifiers, ctx: &OperationContext) -> Result<StageOutput> {
        self.execute(inputs, ctx)
            .await
            .map_err(|e| e.in_stage(&self.definition.name))
    }

    async fn execute(&self, inputs: &Identifiers, ctx: &OperationContext) -> Result<StageOutput> {
        let def = self.definition;
        let key = match &def.idempotency_key {
            Some(key) => Some(identifier(
                key.resolve(&Bindings::new(&def.name, inputs))?,
                &def.name,
                "idempotency key",
            )?),
            None => None,
        };
        let bindings = Bindings::new(&def.name, inputs).with_key(key.as_deref());

        if let Some(batch) = &def.batch {
            return self.run_batch(batch, bindings, ctx).await;
        }

        if let Some(precheck) = &def.precheck {
            if let Some(existing) = self.precheck(precheck, bindings, ctx).await? {
                info!(
                    run_id = %ctx.run_id(),
                    stage = %def.name,
                    "Pre-check satisfied, action not submitted"
                );
                ctx.emit(MigrationEvent::StageSkipped {
                    run_id: ctx.run_id().to_string(),
                    stage: def.name.clone(),
                    reason: SkipReason::PrecheckSatisfied,
                });
                let mut produced = self.action_outputs(&existing, true, bindings)?;
                self.wait_for_effect(&mut produced, bindings, ctx).await?;
                return Ok(StageOutput {
                    produced,
                    precheck_satisfied: true,
                    items: 1,
                });
            }
        }

        self.submit_and_wait(bindings, ctx).await
    }

    /// Submit the action and wait, honouring the retry scope
    async fn submit_and_wait(&self, bindings: Bindings<'_>, ctx: &OperationContext) -> Result<StageOutput> {
        let action = self.definition.action.action.as_str();
        match self.definition.retry_scope {
            RetryScope::Action => {
                let response = self
                    .retry
                    .execute(action, ctx, move |_| async move { self.submit(bindings).await })
                    .await?;
                self.after_submit(response, bindings, ctx).await
            }
            RetryScope::Unit => {
                self.retry
                    .execute(action, ctx, move |_| async move {
                        let response = self.submit(bindings).await?;
                        self.after_submit(response, bindings, ctx).await
                    })
                    .await
            }
        }
    }

    async fn submit(&self, bindings: Bindings<'_>) -> Result<Value> {
        let action = &self.definition.action;
        let params = resolve_params(&action.params, &bindings)?;
        debug!(
            stage = %self.definition.name,
            action = %action.action,
            client = %self.client.label(),
            "Submitting action"
        );
        Ok(self.client.invoke(&action.action, &params).await?)
    }

    async fn after_submit(
        &self,
        response: Value,
        bindings: Bindings<'_>,
        ctx: &OperationContext,
    ) -> Result<StageOutput> {
        let mut produced = self.action_outputs(&response, false, bindings)?;
        self.wait_for_effect(&mut produced, bindings, ctx).await?;
        Ok(StageOutput {
            produced,
            precheck_satisfied: false,
            items: 1,
        })
    }

    /// Wait for the asynchronous effect; the wait query may read the
    /// identifiers this stage has produced so far
    async fn wait_for_effect(
        &self,
        produced: &mut Identifiers,
        bindings: Bindings<'_>,
        ctx: &OperationContext,
    ) -> Result<()> {
        let (wait, waiter) = match (&self.definition.wait, &self.waiter) {
            (Some(wait), Some(waiter)) => (wait, waiter),
            _ => return Ok(()),
        };

        let mut scope = bindings.inputs.clone();
        scope.extend(produced.iter().map(|(k, v)| (k.clone(), v.clone())));
        let wait_bindings = Bindings {
            inputs: &scope,
            ..bindings
        };
        let query = wait.query.bind(self.client.clone(), &wait_bindings)?;

        info!(
            run_id = %ctx.run_id(),
            stage = %self.definition.name,
            waiter = %waiter.rules().name,
            target = %query.query_ref(),
            "Waiting for stage effect"
        );
        let outcome = waiter.wait(&query, ctx).await?;

        for (name, binding) in &self.definition.outputs {
            if let OutputBinding::Wait { path } = binding {
                let response = outcome.response.as_ref().ok_or_else(|| Error::MissingOutput {
                    context: format!("{} output {}", self.definition.name, name),
                    path: path.to_string(),
                })?;
                produced.insert(name.clone(), self.extract(path, response, name)?);
            }
        }
        Ok(())
    }

    fn action_outputs(
        &self,
        response: &Value,
        from_precheck: bool,
        bindings: Bindings<'_>,
    ) -> Result<Identifiers> {
        let mut produced = Identifiers::new();
        for (name, binding) in &self.definition.outputs {
            match binding {
                OutputBinding::Action { path, existing } => {
                    let path = match (from_precheck, existing) {
                        (true, Some(existing)) => existing,
                        _ => path,
                    };
                    produced.insert(name.clone(), self.extract(path, response, name)?);
                }
                OutputBinding::Key => {
                    let key = bindings.idempotency_key.ok_or_else(|| {
                        Error::Configuration(format!(
                            "stage {} outputs its idempotency key but has none",
                            self.definition.name
                        ))
                    })?;
                    produced.insert(name.clone(), ResourceId::new(key));
                }
                OutputBinding::Wait { .. } => {}
            }
        }
        Ok(produced)
    }

    fn extract(&self, path: &ExtractPath, response: &Value, output: &str) -> Result<ResourceId> {
        path.evaluate_strings(response)
            .into_iter()
            .next()
            .map(ResourceId::new)
            .ok_or_else(|| Error::MissingOutput {
                context: format!("{} output {}", self.definition.name, output),
                path: path.to_string(),
            })
    }

    /// Issue the pre-check query once; `Some(response)` when a success rule matched.
    ///
    /// Errors consumed by a rule, and not-found errors, are evaluated rather
    /// than propagated.
    async fn precheck(
        &self,
        precheck: &Precheck,
        bindings: Bindings<'_>,
        ctx: &OperationContext,
    ) -> Result<Option<Value>> {
        let query = precheck.query.bind(self.client.clone(), &bindings)?;
        let query_ref = &query;
        let result: std::result::Result<Value, RemoteError> = self
            .retry
            .execute("precheck", ctx, move |_| async move {
                match query_ref.query().await {
                    Ok(response) => Ok(Ok(response)),
                    Err(err) if err.is_not_found() || handles_error(&precheck.rules, &err.code) => {
                        Ok(Err(err))
                    }
                    Err(err) => Err(Error::Remote(err)),
                }
            })
            .await?;

        let matched = precheck
            .rules
            .iter()
            .find(|rule| rule.matcher.matches(&result, query.default_path()));

        match matched {
            Some(rule) if rule.outcome == Outcome::Success => {
                debug!(stage = %self.definition.name, rule = %rule, "Pre-check matched");
                Ok(Some(result.unwrap_or(Value::Null)))
            }
            _ => Ok(None),
        }
    }

    async fn run_batch(
        &self,
        batch: &BatchSpec,
        bindings: Bindings<'_>,
        ctx: &OperationContext,
    ) -> Result<StageOutput> {
        let list = batch.list.bind(self.client.clone(), &bindings)?;
        let list_ref = &list;
        let response = self
            .retry
            .execute("list", ctx, move |_| async move { Ok(list_ref.query().await?) })
            .await?;

        let items: Vec<String> = batch
            .items
            .evaluate_strings(&response)
            .into_iter()
            .filter(|id| batch.prefix.as_deref().map_or(true, |p| id.starts_with(p)))
            .collect();

        info!(
            run_id = %ctx.run_id(),
            stage = %self.definition.name,
            items = items.len(),
            concurrency = batch.concurrency,
            "Processing batch"
        );

        let results: Vec<(String, Result<StageOutput>)> = stream::iter(items.iter().cloned())
            .map(move |item| async move {
                let result = self
                    .submit_and_wait(bindings.with_item(Some(item.as_str())), ctx)
                    .await;
                (item, result)
            })
            .buffer_unordered(batch.concurrency.max(1))
            .collect()
            .await;

        let mut first_error = None;
        let mut failed = 0usize;
        for (item, result) in results {
            if let Err(err) = result {
                failed += 1;
                warn!(stage = %self.definition.name, item = %item, error = %err, "Batch item failed");
                if first_error.is_none() || err.is_cancelled() {
                    first_error = Some(err);
                }
            }
        }
        if let Some(err) = first_error {
            if err.is_cancelled() {
                return Err(Error::Cancelled);
            }
            warn!(stage = %self.definition.name, failed, total = items.len(), "Batch incomplete");
            return Err(err);
        }

        Ok(StageOutput {
            produced: Identifiers::new(),
            precheck_satisfied: false,
            items: items.len(),
        })
    }
}

fn identifier(value: Value, stage: &str, what: &str) -> Result<String> {
    match value {
        Value::String(s) if !s.is_empty() => Ok(s),
        other => Err(Error::Configuration(format!(
            "stage {} {} must resolve to a non-empty string, got {}",
            stage, what, other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ports::{ClientSet, ExecutionContext};
    use crate::migration::config::{ActionSpec, WaitSpec, WaiterRef};
    use crate::retry::JitterStrategy;
    use crate::testing::ScriptedClient;
    use crate::waiter::builtin;
    use crate::waiter::descriptor::{OperationDescriptor, ParamMap, ParamValue, ResourceQuery};
    use crate::waiter::rules::{Matcher, TerminationRule};
    use assert_matches::assert_matches;
    use serde_json::json;
    use std::sync::Arc;
    use std::time::Duration;

    fn describe_snapshot() -> OperationDescriptor {
        let params: ParamMap = [(
            "DBClusterSnapshotIdentifier".to_string(),
            ParamValue::key(),
        )]
        .into_iter()
        .collect();
        OperationDescriptor::new(ResourceQuery::invoke("DescribeDBClusterSnapshots", params))
    }

    fn create_stage() -> StageDefinition {
        StageDefinition::new(
            "create-snapshot",
            ActionSpec::new("CreateDBClusterSnapshot")
                .param("DBClusterIdentifier", ParamValue::input("cluster"))
                .param("DBClusterSnapshotIdentifier", ParamValue::key()),
        )
        .with_key("events-refresh-1")
        .with_precheck(Precheck::new(describe_snapshot()).rule(TerminationRule::new(
            Matcher::exact("length(DBClusterSnapshots)", 1),
            Outcome::Success,
        )))
        .with_wait(WaitSpec::new(
            describe_snapshot(),
            WaiterRef::Named(builtin::DB_CLUSTER_SNAPSHOT_AVAILABLE.into()),
        ))
        .output(
            "snapshot_arn",
            OutputBinding::action_or_existing(
                "DBClusterSnapshot.DBClusterSnapshotArn",
                "DBClusterSnapshots[0].DBClusterSnapshotArn",
            )
            .unwrap(),
        )
        .output("snapshot_id", OutputBinding::Key)
    }

    fn inputs() -> Identifiers {
        let mut inputs = Identifiers::new();
        inputs.insert("cluster".into(), ResourceId::new("new-events"));
        inputs
    }

    fn no_jitter() -> RetryConfig {
        RetryConfig {
            jitter: JitterStrategy::None,
            ..Default::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_submit_wait_and_outputs() {
        let client = Arc::new(
            ScriptedClient::new("source")
                .err("DescribeDBClusterSnapshots", "DBClusterSnapshotNotFoundFault")
                .ok("DescribeDBClusterSnapshots", json!({"DBClusterSnapshots": [{"Status": "creating"}]}))
                .ok("DescribeDBClusterSnapshots", json!({"DBClusterSnapshots": [{"Status": "available"}]}))
                .ok(
                    "CreateDBClusterSnapshot",
                    json!({"DBClusterSnapshot": {"DBClusterSnapshotArn": "arn:snap:1"}}),
                ),
        );
        let clients = ClientSet::single(client.clone());
        let def = create_stage();
        let stage = MigrationStage::compile(&def, &clients, &WaiterModel::builtin(), &no_jitter()).unwrap();

        let output = stage.run(&inputs(), &OperationContext::detached("run-1")).await.unwrap();

        assert!(!output.precheck_satisfied);
        assert_eq!(output.produced["snapshot_arn"].as_str(), "arn:snap:1");
        assert_eq!(output.produced["snapshot_id"].as_str(), "events-refresh-1");
        assert_eq!(client.count("CreateDBClusterSnapshot"), 1);
        // pre-check plus two polls
        assert_eq!(client.count("DescribeDBClusterSnapshots"), 3);

        let (_, params) = &client.calls()[1];
        assert_eq!(params["DBClusterSnapshotIdentifier"], json!("events-refresh-1"));
        assert_eq!(params["DBClusterIdentifier"], json!("new-events"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_precheck_skips_action() {
        let existing = json!({"DBClusterSnapshots": [
            {"Status": "available", "DBClusterSnapshotArn": "arn:snap:existing"}
        ]});
        let client = Arc::new(ScriptedClient::new("source").ok("DescribeDBClusterSnapshots", existing));
        let clients = ClientSet::single(client.clone());
        let def = create_stage();
        let stage = MigrationStage::compile(&def, &clients, &WaiterModel::builtin(), &no_jitter()).unwrap();

        let output = stage.run(&inputs(), &OperationContext::detached("run-1")).await.unwrap();

        assert!(output.precheck_satisfied);
        assert_eq!(output.produced["snapshot_arn"].as_str(), "arn:snap:existing");
        assert_eq!(client.count("CreateDBClusterSnapshot"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_precheck_error_consumed_by_rule() {
        let lookup = OperationDescriptor::new(ResourceQuery::invoke(
            "GetBucketReplication",
            [("Bucket".to_string(), ParamValue::from("media-src"))].into_iter().collect(),
        ));
        let def = StageDefinition::new(
            "put-replication",
            ActionSpec::new("PutBucketReplication").param("Bucket", "media-src"),
        )
        .with_precheck(
            Precheck::new(lookup)
                .rule(TerminationRule::new(
                    Matcher::any("ReplicationConfiguration.Rules[].ID", "replicate-media"),
                    Outcome::Success,
                ))
                .rule(TerminationRule::new(
                    Matcher::error("ReplicationConfigurationNotFoundError"),
                    Outcome::Failure,
                )),
        );

        let client = Arc::new(
            ScriptedClient::new("source").err("GetBucketReplication", "ReplicationConfigurationNotFoundError"),
        );
        let clients = ClientSet::single(client.clone());
        let stage = MigrationStage::compile(&def, &clients, &WaiterModel::builtin(), &no_jitter()).unwrap();
        let output = stage.run(&Identifiers::new(), &OperationContext::detached("run-1")).await.unwrap();
        assert!(!output.precheck_satisfied);
        assert_eq!(client.count("PutBucketReplication"), 1);

        // an error no rule names still fails the stage
        let client = Arc::new(ScriptedClient::new("source").err("GetBucketReplication", "AccessDenied"));
        let clients = ClientSet::single(client.clone());
        let stage = MigrationStage::compile(&def, &clients, &WaiterModel::builtin(), &no_jitter()).unwrap();
        let err = stage.run(&Identifiers::new(), &OperationContext::detached("run-1")).await.unwrap_err();
        assert_eq!(err.remote_code(), Some("AccessDenied"));
        assert_eq!(client.count("PutBucketReplication"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_wrapped_with_stage_name() {
        let client = Arc::new(
            ScriptedClient::new("source")
                .err("DescribeDBClusterSnapshots", "DBClusterSnapshotNotFoundFault")
                .err("CreateDBClusterSnapshot", "AccessDenied"),
        );
        let clients = ClientSet::single(client.clone());
        let def = create_stage();
        let stage = MigrationStage::compile(&def, &clients, &WaiterModel::builtin(), &no_jitter()).unwrap();

        let err = stage.run(&inputs(), &OperationContext::detached("run-1")).await.unwrap_err();
        assert_matches!(&err, Error::Stage { stage, .. } if stage == "create-snapshot");
        assert_eq!(err.remote_code(), Some("AccessDenied"));
        assert_eq!(client.count("CreateDBClusterSnapshot"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_throttled_action_retried() {
        let client = Arc::new(
            ScriptedClient::new("source")
                .err("DescribeDBClusterSnapshots", "DBClusterSnapshotNotFoundFault")
                .ok("DescribeDBClusterSnapshots", json!({"DBClusterSnapshots": [{"Status": "available"}]}))
                .err("CreateDBClusterSnapshot", "Throttling")
                .ok(
                    "CreateDBClusterSnapshot",
                    json!({"DBClusterSnapshot": {"DBClusterSnapshotArn": "arn:snap:1"}}),
                ),
        );
        let clients = ClientSet::single(client.clone());
        let def = create_stage();
        let stage = MigrationStage::compile(&def, &clients, &WaiterModel::builtin(), &no_jitter()).unwrap();

        stage.run(&inputs(), &OperationContext::detached("run-1")).await.unwrap();
        assert_eq!(client.count("CreateDBClusterSnapshot"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unit_scope_resubmits_after_waiter_failure() {
        let describe = OperationDescriptor::new(ResourceQuery::invoke(
            "DescribeTaskExecution",
            [("TaskExecutionArn".to_string(), ParamValue::input("execution_arn"))]
                .into_iter()
                .collect(),
        ));
        let def = StageDefinition::new(
            "transfer",
            ActionSpec::new("StartTaskExecution").param("TaskArn", ParamValue::input("task_arn")),
        )
        .with_wait(WaitSpec::new(
            describe,
            WaiterRef::Named(builtin::DATASYNC_TASK_EXECUTION_FINISHED.into()),
        ))
        .output("execution_arn", OutputBinding::action("TaskExecutionArn").unwrap())
        .with_retry(
            RetryConfig {
                max_attempts: 3,
                base_delay: Duration::from_millis(500),
                jitter: JitterStrategy::None,
                retry_on: crate::retry::ClassifierConfig {
                    waiter_failures: true,
                    ..Default::default()
                },
                ..Default::default()
            },
            RetryScope::Unit,
        );

        let client = Arc::new(
            ScriptedClient::new("datasync")
                .ok("StartTaskExecution", json!({"TaskExecutionArn": "exec-1"}))
                .ok("StartTaskExecution", json!({"TaskExecutionArn": "exec-2"}))
                .ok("DescribeTaskExecution", json!({"Status": "TRANSFERRING"}))
                .ok("DescribeTaskExecution", json!({"Status": "ERROR"}))
                .ok("DescribeTaskExecution", json!({"Status": "SUCCESS"})),
        );
        let clients = ClientSet::single(client.clone());
        let stage = MigrationStage::compile(&def, &clients, &WaiterModel::builtin(), &no_jitter()).unwrap();

        let mut inputs = Identifiers::new();
        inputs.insert("task_arn".into(), ResourceId::new("task-1"));
        let output = stage.run(&inputs, &OperationContext::detached("run-1")).await.unwrap();

        assert_eq!(client.count("StartTaskExecution"), 2);
        assert_eq!(output.produced["execution_arn"].as_str(), "exec-2");
        let polled: Vec<_> = client
            .calls()
            .into_iter()
            .filter(|(a, _)| a == "DescribeTaskExecution")
            .map(|(_, p)| p["TaskExecutionArn"].clone())
            .collect();
        assert_eq!(polled, vec![json!("exec-1"), json!("exec-1"), json!("exec-2")]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_batch_stage_processes_each_item() {
        let listing = OperationDescriptor::new(ResourceQuery::invoke(
            "DescribeDBClusterSnapshots",
            [("SnapshotType".to_string(), ParamValue::from("manual"))]
                .into_iter()
                .collect(),
        ));
        let def = StageDefinition::new(
            "delete-old-snapshots",
            ActionSpec::new("DeleteDBClusterSnapshot")
                .param("DBClusterSnapshotIdentifier", ParamValue::item()),
        )
        .with_batch(BatchSpec {
            list: listing,
            items: ExtractPath::parse("DBClusterSnapshots[].DBClusterSnapshotIdentifier").unwrap(),
            prefix: Some("new-events-".into()),
            concurrency: 2,
        })
        .best_effort();

        let client = Arc::new(ScriptedClient::new("source").ok(
            "DescribeDBClusterSnapshots",
            json!({"DBClusterSnapshots": [
                {"DBClusterSnapshotIdentifier": "new-events-a"},
                {"DBClusterSnapshotIdentifier": "other-b"},
                {"DBClusterSnapshotIdentifier": "new-events-c"}
            ]}),
        ));
        let clients = ClientSet::new(client.clone(), Arc::new(ScriptedClient::new("dest")));
        let stage = MigrationStage::compile(&def, &clients, &WaiterModel::builtin(), &no_jitter()).unwrap();
        assert_eq!(stage.definition().context, ExecutionContext::Source);

        let output = stage.run(&Identifiers::new(), &OperationContext::detached("run-1")).await.unwrap();
        assert_eq!(output.items, 2);

        let mut deleted: Vec<_> = client
            .calls()
            .into_iter()
            .filter(|(a, _)| a == "DeleteDBClusterSnapshot")
            .map(|(_, p)| p["DBClusterSnapshotIdentifier"].as_str().unwrap().to_string())
            .collect();
        deleted.sort();
        assert_eq!(deleted, vec!["new-events-a", "new-events-c"]);
    }
}
