//! Pipeline Definitions
//!
//! Serializable description of a migration pipeline: ordered stages, each
//! naming the action it submits, how to detect that the action already took
//! effect, what to wait for, and which identifiers it hands to later stages.

use crate::domain::ports::ExecutionContext;
use crate::error::{Error, Result};
use crate::retry::RetryConfig;
use crate::serde_util::option_seconds;
use crate::waiter::descriptor::{OperationDescriptor, ParamMap, ParamValue, ResourceQuery};
use crate::waiter::model::WaiterModel;
use crate::waiter::path::ExtractPath;
use crate::waiter::rules::{Outcome, RuleSet, TerminationRule};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::time::Duration;

// =============================================================================
// Stage Parts
// =============================================================================

/// Operation submitted by a stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionSpec {
    pub action: String,
    #[serde(default)]
    pub params: ParamMap,
}

impl ActionSpec {
    pub fn new(action: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            params: ParamMap::new(),
        }
    }

    pub fn param(mut self, name: impl Into<String>, value: impl Into<ParamValue>) -> Self {
        self.params.insert(name.into(), value.into());
        self
    }
}

/// Single query deciding whether the stage's effect already exists.
/// A success rule match means the action is not submitted again.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Precheck {
    pub query: OperationDescriptor,
    #[serde(rename = "acceptors")]
    pub rules: Vec<TerminationRule>,
}

impl Precheck {
    pub fn new(query: OperationDescriptor) -> Self {
        Self {
            query,
            rules: Vec::new(),
        }
    }

    pub fn rule(mut self, rule: TerminationRule) -> Self {
        self.rules.push(rule);
        self
    }
}

/// Named waiter from the waiter model, or an inline rule set
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WaiterRef {
    Named(String),
    Inline(RuleSet),
}

impl WaiterRef {
    pub fn resolve(&self, model: &WaiterModel) -> Result<RuleSet> {
        match self {
            WaiterRef::Named(name) => model
                .get(name)
                .map(|w| w.rules.clone())
                .ok_or_else(|| Error::Configuration(format!("unknown waiter {}", name))),
            WaiterRef::Inline(rules) => Ok(rules.clone()),
        }
    }
}

/// What an asynchronous stage waits for after submitting its action
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WaitSpec {
    pub query: OperationDescriptor,
    pub waiter: WaiterRef,
    #[serde(default, with = "option_seconds", skip_serializing_if = "Option::is_none")]
    pub poll_interval: Option<Duration>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,
}

impl WaitSpec {
    pub fn new(query: OperationDescriptor, waiter: WaiterRef) -> Self {
        Self {
            query,
            waiter,
            poll_interval: None,
            max_attempts: None,
        }
    }

    /// Resolve the waiter and apply the stage's overrides
    pub fn rules(&self, model: &WaiterModel) -> Result<RuleSet> {
        let mut rules = self.waiter.resolve(model)?;
        if let Some(interval) = self.poll_interval {
            rules.poll_interval = interval;
        }
        if let Some(max) = self.max_attempts {
            rules.max_attempts = max;
        }
        Ok(rules)
    }
}

/// Where a produced identifier comes from
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "from", rename_all = "snake_case")]
pub enum OutputBinding {
    /// Path into the action response; `existing` is read from the
    /// pre-check response when the action was not submitted
    Action {
        path: ExtractPath,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        existing: Option<ExtractPath>,
    },
    /// Path into the response that satisfied the waiter
    Wait { path: ExtractPath },
    /// The stage's idempotency key itself
    Key,
}

impl OutputBinding {
    pub fn action(path: &str) -> Result<Self> {
        Ok(OutputBinding::Action {
            path: ExtractPath::parse(path)?,
            existing: None,
        })
    }

    pub fn action_or_existing(path: &str, existing: &str) -> Result<Self> {
        Ok(OutputBinding::Action {
            path: ExtractPath::parse(path)?,
            existing: Some(ExtractPath::parse(existing)?),
        })
    }

    pub fn wait(path: &str) -> Result<Self> {
        Ok(OutputBinding::Wait {
            path: ExtractPath::parse(path)?,
        })
    }
}

/// What the retry policy wraps
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryScope {
    /// Only the action submission
    #[default]
    Action,
    /// Action submission and the wait, together
    Unit,
}

/// Run the stage once per listed item
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchSpec {
    /// Listing query
    pub list: OperationDescriptor,
    /// Path yielding item identifiers from the listing
    pub items: ExtractPath,
    /// Only items starting with this prefix
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
}

fn default_concurrency() -> usize {
    4
}

// =============================================================================
// Stage Definition
// =============================================================================

fn default_context() -> ExecutionContext {
    ExecutionContext::Source
}

fn is_false(value: &bool) -> bool {
    !*value
}

/// One named, idempotent unit of work
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageDefinition {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default = "default_context")]
    pub context: ExecutionContext,
    /// Deterministic name of the resource the stage creates
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<ParamValue>,
    #[serde(flatten)]
    pub action: ActionSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub precheck: Option<Precheck>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wait: Option<WaitSpec>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub outputs: BTreeMap<String, OutputBinding>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryConfig>,
    #[serde(default)]
    pub retry_scope: RetryScope,
    /// Failure is recorded but does not stop the run
    #[serde(default, skip_serializing_if = "is_false")]
    pub best_effort: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch: Option<BatchSpec>,
}

impl StageDefinition {
    pub fn new(name: impl Into<String>, action: ActionSpec) -> Self {
        Self {
            name: name.into(),
            description: None,
            context: ExecutionContext::Source,
            idempotency_key: None,
            action,
            precheck: None,
            wait: None,
            outputs: BTreeMap::new(),
            retry: None,
            retry_scope: RetryScope::Action,
            best_effort: false,
            batch: None,
        }
    }

    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn in_context(mut self, context: ExecutionContext) -> Self {
        self.context = context;
        self
    }

    pub fn with_key(mut self, key: impl Into<ParamValue>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    pub fn with_precheck(mut self, precheck: Precheck) -> Self {
        self.precheck = Some(precheck);
        self
    }

    pub fn with_wait(mut self, wait: WaitSpec) -> Self {
        self.wait = Some(wait);
        self
    }

    pub fn output(mut self, name: impl Into<String>, binding: OutputBinding) -> Self {
        self.outputs.insert(name.into(), binding);
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig, scope: RetryScope) -> Self {
        self.retry = Some(retry);
        self.retry_scope = scope;
        self
    }

    pub fn best_effort(mut self) -> Self {
        self.best_effort = true;
        self
    }

    pub fn with_batch(mut self, batch: BatchSpec) -> Self {
        self.batch = Some(batch);
        self
    }

    /// Input names read before the action is submitted
    fn submission_inputs(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self
            .action
            .params
            .values()
            .flat_map(ParamValue::input_names)
            .collect();
        names.extend(self.idempotency_key.iter().flat_map(ParamValue::input_names));
        if let Some(precheck) = &self.precheck {
            names.extend(precheck.query.query.input_names());
        }
        if let Some(batch) = &self.batch {
            names.extend(batch.list.query.input_names());
        }
        names
    }

    fn references_item(&self) -> bool {
        let is_item = ParamValue::references_item;
        let query_has_item = |q: &ResourceQuery| match q {
            ResourceQuery::Invoke { params, .. } => params.values().any(is_item),
            ResourceQuery::Describe { resource } => is_item(resource),
        };
        self.action.params.values().any(is_item)
            || self.idempotency_key.as_ref().map(is_item).unwrap_or(false)
            || self.wait.as_ref().map(|w| query_has_item(&w.query.query)).unwrap_or(false)
    }
}

// =============================================================================
// Pipeline Definition
// =============================================================================

/// Ordered stages plus the identifiers the caller must supply
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineDefinition {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Identifiers the caller must provide when starting a run
    #[serde(default)]
    pub inputs: Vec<String>,
    pub stages: Vec<StageDefinition>,
    /// Wall-clock bound for one execution of the run
    #[serde(default, with = "option_seconds", skip_serializing_if = "Option::is_none")]
    pub timeout: Option<Duration>,
    /// Resource key serializing runs against the same target
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lock: Option<ParamValue>,
}

impl PipelineDefinition {
    pub fn new(name: impl Into<String>, stages: Vec<StageDefinition>) -> Self {
        Self {
            name: name.into(),
            description: None,
            inputs: Vec::new(),
            stages,
            timeout: None,
            lock: None,
        }
    }

    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_inputs<I, S>(mut self, inputs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.inputs = inputs.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_lock(mut self, lock: impl Into<ParamValue>) -> Self {
        self.lock = Some(lock.into());
        self
    }

    pub fn stage(&self, name: &str) -> Option<&StageDefinition> {
        self.stages.iter().find(|s| s.name == name)
    }

    pub fn from_yaml(document: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(document)?)
    }

    /// Check structure, waiter references and input wiring.
    ///
    /// Every input a stage reads must be a declared pipeline input or an
    /// output of an earlier stage that is not best-effort.
    pub fn validate(&self, waiters: &WaiterModel) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::Configuration("pipeline name must not be empty".into()));
        }
        if self.stages.is_empty() {
            return Err(Error::Configuration(format!(
                "pipeline {} has no stages",
                self.name
            )));
        }

        let mut seen = HashSet::new();
        let mut available: HashSet<&str> = self.inputs.iter().map(String::as_str).collect();

        if let Some(name) = self.lock.as_ref().and_then(ParamValue::input_name) {
            if !available.contains(name) {
                return Err(Error::Configuration(format!(
                    "pipeline {} locks on undeclared input {}",
                    self.name, name
                )));
            }
        }

        for stage in &self.stages {
            if !seen.insert(stage.name.as_str()) {
                return Err(Error::Configuration(format!(
                    "pipeline {} has duplicate stage {}",
                    self.name, stage.name
                )));
            }

            for input in stage.submission_inputs() {
                if !available.contains(input) {
                    return Err(Error::MissingInput {
                        stage: stage.name.clone(),
                        input: input.to_string(),
                    });
                }
            }

            self.validate_stage_shape(stage, waiters)?;

            if let Some(wait) = &stage.wait {
                let own: HashSet<&str> = stage
                    .outputs
                    .iter()
                    .filter(|(_, b)| !matches!(b, OutputBinding::Wait { .. }))
                    .map(|(name, _)| name.as_str())
                    .collect();
                for input in wait.query.query.input_names() {
                    if !available.contains(input) && !own.contains(input) {
                        return Err(Error::MissingInput {
                            stage: stage.name.clone(),
                            input: input.to_string(),
                        });
                    }
                }
            }

            if !stage.best_effort {
                available.extend(stage.outputs.keys().map(String::as_str));
            }
        }
        Ok(())
    }

    fn validate_stage_shape(&self, stage: &StageDefinition, waiters: &WaiterModel) -> Result<()> {
        let invalid = |reason: &str| {
            Err(Error::Configuration(format!(
                "stage {} of pipeline {} {}",
                stage.name, self.name, reason
            )))
        };

        if stage.name.is_empty() {
            return invalid("has an empty name");
        }
        if stage.action.action.is_empty() {
            return invalid("has no action");
        }
        if let Some(wait) = &stage.wait {
            wait.rules(waiters)?.validate()?;
        } else if stage.retry_scope == RetryScope::Unit {
            return invalid("retries its whole unit but has nothing to wait for");
        }
        if let Some(retry) = &stage.retry {
            retry.validate()?;
        }
        if let Some(precheck) = &stage.precheck {
            if !precheck.rules.iter().any(|r| r.outcome == Outcome::Success) {
                return invalid("has a pre-check without a success rule");
            }
        }
        if stage.outputs.values().any(|b| matches!(b, OutputBinding::Key))
            && stage.idempotency_key.is_none()
        {
            return invalid("outputs its idempotency key but has none");
        }
        if stage.outputs.values().any(|b| matches!(b, OutputBinding::Wait { .. }))
            && stage.wait.is_none()
        {
            return invalid("reads an output from a wait it never performs");
        }
        match &stage.batch {
            Some(batch) => {
                if batch.concurrency == 0 {
                    return invalid("has a batch concurrency of zero");
                }
                if !stage.outputs.is_empty() || stage.precheck.is_some() {
                    return invalid("is a batch stage and cannot have outputs or a pre-check");
                }
            }
            None => {
                if stage.references_item() {
                    return invalid("references a batch item outside a batch");
                }
            }
        }
        Ok(())
    }
}
