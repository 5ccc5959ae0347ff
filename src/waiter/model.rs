//! Waiter Models
//!
//! A waiter definition pairs the operation to poll with its rule set. A
//! waiter model is a named collection of definitions in the botocore
//! `waiters-2.json` layout:
//!
//! ```json
//! {"version": 2, "waiters": {"DBClusterAvailable": {"operation": "DescribeDBClusters",
//!   "delay": 30, "maxAttempts": 60, "acceptors": [...]}}}
//! ```

use crate::error::{Error, Result};
use crate::waiter::builtin;
use crate::waiter::descriptor::{OperationDescriptor, ParamMap, ResourceQuery};
use crate::waiter::rules::RuleSet;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Operation plus rule set
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WaiterDefinition {
    pub operation: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(flatten)]
    pub rules: RuleSet,
}

impl WaiterDefinition {
    pub fn new(operation: impl Into<String>, rules: RuleSet) -> Self {
        Self {
            operation: operation.into(),
            description: None,
            rules,
        }
    }

    pub fn describe(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Descriptor polling this waiter's operation with the given parameters
    pub fn descriptor(&self, params: ParamMap) -> OperationDescriptor {
        OperationDescriptor::new(ResourceQuery::invoke(self.operation.clone(), params))
    }
}

/// Named waiter definitions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WaiterModel {
    pub version: u32,
    pub waiters: BTreeMap<String, WaiterDefinition>,
}

impl WaiterModel {
    /// Parse a botocore-style waiter document
    pub fn from_json(document: &str) -> Result<Self> {
        let model: WaiterModel = serde_json::from_str(document)?;
        model.validated()
    }

    /// Parse the same layout from YAML
    pub fn from_yaml(document: &str) -> Result<Self> {
        let model: WaiterModel = serde_yaml::from_str(document)?;
        model.validated()
    }

    /// The built-in waiters as a model
    pub fn builtin() -> Self {
        Self {
            version: 2,
            waiters: builtin::all()
                .into_iter()
                .map(|w| (w.rules.name.clone(), w))
                .collect(),
        }
    }

    fn validated(mut self) -> Result<Self> {
        if self.version != 2 {
            return Err(Error::Configuration(format!(
                "unsupported waiter model version {}",
                self.version
            )));
        }
        for (name, waiter) in self.waiters.iter_mut() {
            if waiter.rules.name.is_empty() {
                waiter.rules.name = name.clone();
            }
            waiter.rules.validate()?;
        }
        Ok(self)
    }

    pub fn get(&self, name: &str) -> Option<&WaiterDefinition> {
        self.waiters.get(name)
    }

    /// Merge another model in; later definitions replace earlier ones
    pub fn merge(&mut self, other: WaiterModel) {
        self.waiters.extend(other.waiters);
    }

    /// Poll every waiter at `interval` without jitter, keeping attempt limits
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        for waiter in self.waiters.values_mut() {
            waiter.rules.poll_interval = interval;
            waiter.rules.poll_jitter = Duration::ZERO;
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::waiter::rules::{Matcher, Outcome};

    const CUSTOM: &str = r#"{
        "version": 2,
        "waiters": {
            "DBClusterAvailable": {
                "delay": 30,
                "operation": "DescribeDBClusters",
                "maxAttempts": 60,
                "acceptors": [
                    {"expected": "available", "matcher": "pathAll", "state": "success", "argument": "DBClusters[].Status"},
                    {"expected": "deleted", "matcher": "pathAny", "state": "failure", "argument": "DBClusters[].Status"},
                    {"expected": "failed", "matcher": "pathAny", "state": "failure", "argument": "DBClusters[].Status"}
                ]
            },
            "DBClusterDeleted": {
                "delay": 30,
                "operation": "DescribeDBClusters",
                "maxAttempts": 60,
                "acceptors": [
                    {"expected": 0, "matcher": "path", "state": "success", "argument": "length(DBClusters)"},
                    {"expected": "DBClusterNotFoundFault", "matcher": "error", "state": "success"},
                    {"expected": "creating", "matcher": "pathAny", "state": "failure", "argument": "DBClusters[].Status"}
                ]
            }
        }
    }"#;

    #[test]
    fn test_parse_custom_model() {
        let model = WaiterModel::from_json(CUSTOM).unwrap();
        let available = model.get("DBClusterAvailable").unwrap();
        assert_eq!(available.operation, "DescribeDBClusters");
        assert_eq!(available.rules.name, "DBClusterAvailable");
        assert_eq!(available.rules.poll_interval, Duration::from_secs(30));
        assert_eq!(available.rules.rules.len(), 3);

        let deleted = model.get("DBClusterDeleted").unwrap();
        assert_eq!(deleted.rules.rules[1].matcher, Matcher::error("DBClusterNotFoundFault"));
        assert_eq!(deleted.rules.rules[1].outcome, Outcome::Success);
    }

    #[test]
    fn test_rejects_unknown_version() {
        let doc = r#"{"version": 1, "waiters": {}}"#;
        assert!(WaiterModel::from_json(doc).is_err());
    }

    #[test]
    fn test_rejects_empty_rule_set() {
        let doc = r#"{"version": 2, "waiters": {"X": {"operation": "Op", "delay": 1, "maxAttempts": 1, "acceptors": []}}}"#;
        assert!(WaiterModel::from_json(doc).is_err());
    }

    #[test]
    fn test_yaml_model_and_merge() {
        let yaml = r#"
version: 2
waiters:
  DBClusterAvailable:
    operation: DescribeDBClusters
    delay: 5
    maxAttempts: 10
    acceptors:
      - matcher: pathAll
        argument: "DBClusters[].Status"
        expected: available
        state: success
"#;
        let mut model = WaiterModel::builtin();
        let before = model.waiters.len();
        model.merge(WaiterModel::from_yaml(yaml).unwrap());
        assert_eq!(model.waiters.len(), before + 1);
        assert_eq!(
            model.get("DBClusterAvailable").unwrap().rules.poll_interval,
            Duration::from_secs(5)
        );
    }

    #[test]
    fn test_poll_interval_override() {
        let model = WaiterModel::builtin().with_poll_interval(Duration::from_millis(10));
        let deleted = model.get(builtin::DB_CLUSTER_DELETED).unwrap();
        assert_eq!(deleted.rules.poll_interval, Duration::from_millis(10));
        assert_eq!(deleted.rules.max_attempts, 60);
        assert!(model.waiters.values().all(|w| w.rules.poll_jitter.is_zero()));
    }
}
