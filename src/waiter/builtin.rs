//! Built-in waiters for the snapshot, cluster, instance, DataSync and S3
//! Batch Operations calls used by the migration plans.

use crate::waiter::model::WaiterDefinition;
use crate::waiter::rules::{Matcher, RuleSet};
use std::time::Duration;

pub const DB_SNAPSHOT_AVAILABLE: &str = "db_snapshot_available";
pub const DB_CLUSTER_SNAPSHOT_AVAILABLE: &str = "db_cluster_snapshot_available";
pub const DB_CLUSTER_SNAPSHOT_DELETED: &str = "db_cluster_snapshot_deleted";
pub const DB_INSTANCE_STOPPED: &str = "db_instance_stopped";
pub const DB_CLUSTER_AVAILABLE: &str = "db_cluster_available";
pub const DB_CLUSTER_DELETED: &str = "db_cluster_deleted";
pub const DATASYNC_TASK_EXECUTION_FINISHED: &str = "datasync_task_execution_finished";
pub const S3_BATCH_JOB_COMPLETE: &str = "s3_batch_job_complete";

const SNAPSHOT_FAILURE_STATES: &[&str] = &[
    "deleted",
    "deleting",
    "failed",
    "incompatible-restore",
    "incompatible-parameters",
];

/// Every built-in waiter
pub fn all() -> Vec<WaiterDefinition> {
    vec![
        db_snapshot_available(),
        db_cluster_snapshot_available(),
        db_cluster_snapshot_deleted(),
        db_instance_stopped(),
        db_cluster_available(),
        db_cluster_deleted(),
        datasync_task_execution_finished(),
        s3_batch_job_complete(),
    ]
}

/// Look up a built-in waiter by name
pub fn by_name(name: &str) -> Option<WaiterDefinition> {
    all().into_iter().find(|w| w.rules.name == name)
}

fn with_failures(mut rules: RuleSet, path: &str, states: &[&str]) -> RuleSet {
    for state in states {
        rules = rules.failure(Matcher::any(path, *state));
    }
    rules
}

pub fn db_snapshot_available() -> WaiterDefinition {
    let path = "DBSnapshots[].Status";
    let rules = RuleSet::new(DB_SNAPSHOT_AVAILABLE, Duration::from_secs(30), 120)
        .success(Matcher::all(path, "available"));
    WaiterDefinition::new("DescribeDBSnapshots", with_failures(rules, path, SNAPSHOT_FAILURE_STATES))
        .describe("Wait until a DB snapshot is available")
}

pub fn db_cluster_snapshot_available() -> WaiterDefinition {
    let path = "DBClusterSnapshots[].Status";
    let rules = RuleSet::new(DB_CLUSTER_SNAPSHOT_AVAILABLE, Duration::from_secs(30), 120)
        .success(Matcher::all(path, "available"));
    WaiterDefinition::new(
        "DescribeDBClusterSnapshots",
        with_failures(rules, path, SNAPSHOT_FAILURE_STATES),
    )
    .describe("Wait until a DB cluster snapshot is available")
}

pub fn db_cluster_snapshot_deleted() -> WaiterDefinition {
    let rules = RuleSet::new(DB_CLUSTER_SNAPSHOT_DELETED, Duration::from_secs(15), 40)
        .success(Matcher::exact("length(DBClusterSnapshots)", 0))
        .success(Matcher::error("DBClusterSnapshotNotFoundFault"))
        .failure(Matcher::any("DBClusterSnapshots[].Status", "creating"));
    WaiterDefinition::new("DescribeDBClusterSnapshots", rules)
        .describe("Wait until a DB cluster snapshot is gone")
}

pub fn db_instance_stopped() -> WaiterDefinition {
    let path = "DBInstances[].DBInstanceStatus";
    let rules = RuleSet::new(DB_INSTANCE_STOPPED, Duration::from_secs(30), 60)
        .success(Matcher::all(path, "stopped"));
    WaiterDefinition::new(
        "DescribeDBInstances",
        with_failures(rules, path, &["deleted", "deleting", "failed", "incompatible-restore", "incompatible-parameters"]),
    )
    .describe("Wait until a DB instance is stopped")
}

pub fn db_cluster_available() -> WaiterDefinition {
    let path = "DBClusters[].Status";
    let rules = RuleSet::new(DB_CLUSTER_AVAILABLE, Duration::from_secs(30), 60)
        .success(Matcher::all(path, "available"));
    WaiterDefinition::new("DescribeDBClusters", with_failures(rules, path, SNAPSHOT_FAILURE_STATES))
        .describe("Wait until a restored DB cluster is available")
}

pub fn db_cluster_deleted() -> WaiterDefinition {
    let path = "DBClusters[].Status";
    let rules = RuleSet::new(DB_CLUSTER_DELETED, Duration::from_secs(30), 60)
        .success(Matcher::exact("length(DBClusters)", 0))
        .success(Matcher::error("DBClusterNotFoundFault"));
    WaiterDefinition::new(
        "DescribeDBClusters",
        with_failures(
            rules,
            path,
            &["creating", "modifying", "rebooting", "resetting-master-credentials"],
        ),
    )
    .describe("Wait until a DB cluster is deleted")
}

pub fn datasync_task_execution_finished() -> WaiterDefinition {
    let rules = RuleSet::new(DATASYNC_TASK_EXECUTION_FINISHED, Duration::from_secs(1), 1_000_000)
        .success(Matcher::exact("Status", "SUCCESS"))
        .failure(Matcher::exact("Status", "ERROR"));
    WaiterDefinition::new("DescribeTaskExecution", rules)
        .describe("Wait until a DataSync task execution finishes")
}

pub fn s3_batch_job_complete() -> WaiterDefinition {
    let path = "Job.Status";
    let rules = RuleSet::new(S3_BATCH_JOB_COMPLETE, Duration::from_secs(30), 2880)
        .success(Matcher::exact(path, "Complete"))
        .failure(Matcher::exact(path, "Failed"))
        .failure(Matcher::exact(path, "Cancelled"));
    WaiterDefinition::new("DescribeJob", rules).describe("Wait until an S3 Batch Operations job completes")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ports::RemoteError;
    use crate::waiter::rules::Outcome;
    use serde_json::json;

    #[test]
    fn test_all_builtins_validate() {
        for waiter in all() {
            waiter.rules.validate().unwrap();
        }
        assert!(by_name(DB_CLUSTER_DELETED).is_some());
        assert!(by_name("nope").is_none());
    }

    #[test]
    fn test_cluster_available_rules() {
        let waiter = db_cluster_available();
        let rules = &waiter.rules;
        let result = Ok(json!({"DBClusters": [{"Status": "incompatible-restore"}]}));
        let (_, rule) = rules.evaluate(&result, None).unwrap();
        assert_eq!(rule.outcome, Outcome::Failure);

        let result = Ok(json!({"DBClusters": [{"Status": "available"}]}));
        let (_, rule) = rules.evaluate(&result, None).unwrap();
        assert_eq!(rule.outcome, Outcome::Success);
    }

    #[test]
    fn test_cluster_deleted_accepts_not_found() {
        let waiter = db_cluster_deleted();
        let result = Err(RemoteError::new("DBClusterNotFoundFault", "not found"));
        let (_, rule) = waiter.rules.evaluate(&result, None).unwrap();
        assert_eq!(rule.outcome, Outcome::Success);

        let result = Ok(json!({"DBClusters": [{"Status": "modifying"}]}));
        let (_, rule) = waiter.rules.evaluate(&result, None).unwrap();
        assert_eq!(rule.outcome, Outcome::Failure);
    }

    #[test]
    fn test_batch_job_rules() {
        let waiter = by_name(S3_BATCH_JOB_COMPLETE).unwrap();
        let rules = &waiter.rules;
        let job = |status: &str| Ok(json!({"Job": {"JobId": "job-1", "Status": status}}));

        assert!(rules.evaluate(&job("Active"), None).is_none());
        assert_eq!(rules.evaluate(&job("Complete"), None).unwrap().1.outcome, Outcome::Success);
        assert_eq!(rules.evaluate(&job("Cancelled"), None).unwrap().1.outcome, Outcome::Failure);
    }
}
