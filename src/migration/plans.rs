//! Migration Plans
//!
//! Typed builders producing [`PipelineDefinition`]s for the supported
//! migrations. Every plan is parameterised by an explicit
//! [`EnvironmentProfile`] and a stable migration key; resource names are
//! derived from the key so a re-run finds what an earlier attempt created.

use crate::domain::ports::ExecutionContext;
use crate::error::{Error, Result};
use crate::migration::config::{
    ActionSpec, BatchSpec, OutputBinding, PipelineDefinition, Precheck, RetryScope, StageDefinition,
    WaitSpec, WaiterRef,
};
use crate::retry::{ClassifierConfig, JitterStrategy, RetryConfig};
use crate::waiter::builtin;
use crate::waiter::descriptor::{OperationDescriptor, ParamMap, ParamValue, ResourceQuery};
use crate::waiter::path::ExtractPath;
use crate::waiter::rules::{Matcher, Outcome, TerminationRule};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;

// =============================================================================
// Environment
// =============================================================================

/// Partition a region belongs to, as used in ARNs
pub fn partition(region: &str) -> &'static str {
    if region.starts_with("cn-") {
        "aws-cn"
    } else if region.starts_with("us-gov-") {
        "aws-us-gov"
    } else {
        "aws"
    }
}

/// One side of a migration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountProfile {
    pub account_id: String,
    pub region: String,
    /// Key used to encrypt snapshots created on this side
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kms_key_id: Option<String>,
}

impl AccountProfile {
    pub fn new(account_id: impl Into<String>, region: impl Into<String>) -> Self {
        Self {
            account_id: account_id.into(),
            region: region.into(),
            kms_key_id: None,
        }
    }

    pub fn with_kms_key(mut self, key: impl Into<String>) -> Self {
        self.kms_key_id = Some(key.into());
        self
    }

    /// Principal standing for the whole account
    pub fn root_principal(&self) -> String {
        format!("arn:{}:iam::{}:root", partition(&self.region), self.account_id)
    }

    fn kms_key(&self, side: &str) -> Result<&str> {
        self.kms_key_id.as_deref().ok_or_else(|| {
            Error::Configuration(format!("{} account {} has no KMS key", side, self.account_id))
        })
    }
}

/// Explicit settings for one source/destination pairing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvironmentProfile {
    pub name: String,
    pub source: AccountProfile,
    pub destination: AccountProfile,
}

impl EnvironmentProfile {
    pub fn new(name: impl Into<String>, source: AccountProfile, destination: AccountProfile) -> Self {
        Self {
            name: name.into(),
            source,
            destination,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::Configuration("environment name must not be empty".into()));
        }
        for (side, account) in [("source", &self.source), ("destination", &self.destination)] {
            if account.account_id.len() != 12 || !account.account_id.chars().all(|c| c.is_ascii_digit()) {
                return Err(Error::Configuration(format!(
                    "environment {} has an invalid {} account id {:?}",
                    self.name, side, account.account_id
                )));
            }
            if account.region.is_empty() {
                return Err(Error::Configuration(format!(
                    "environment {} has no {} region",
                    self.name, side
                )));
            }
        }
        Ok(())
    }

    fn tags(&self, key: &str) -> Value {
        json!([
            {"Key": "MigrationKey", "Value": key},
            {"Key": "Environment", "Value": self.name},
        ])
    }

    /// Same tags in the KMS spelling
    fn key_tags(&self, key: &str) -> Value {
        json!([
            {"TagKey": "MigrationKey", "TagValue": key},
            {"TagKey": "Environment", "TagValue": self.name},
        ])
    }
}

// =============================================================================
// Resource Names
// =============================================================================

/// Snapshot names derived from a migration key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotNames {
    /// Snapshot taken of the source resource
    pub snapshot: String,
    /// Re-encrypted copy in the source account
    pub copy: String,
    /// Copy shared with the destination account
    pub shared: String,
}

impl SnapshotNames {
    /// Keys follow RDS identifier rules: a letter first, then letters, digits
    /// and single hyphens, at most 200 characters
    pub fn from_key(key: &str) -> Result<Self> {
        let valid = key.len() <= 200
            && key.chars().next().map_or(false, |c| c.is_ascii_alphabetic())
            && key.chars().all(|c| c.is_ascii_alphanumeric() || c == '-')
            && !key.ends_with('-')
            && !key.contains("--");
        if !valid {
            return Err(Error::Configuration(format!("invalid migration key {:?}", key)));
        }
        Ok(Self {
            snapshot: key.to_string(),
            copy: format!("{}-copy", key),
            shared: format!("{}-shared", key),
        })
    }
}

// =============================================================================
// Plan Requests
// =============================================================================

/// Refresh a destination cluster from a snapshot of a source cluster
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterRefreshPlan {
    pub key: String,
    pub source_cluster: String,
    pub target_cluster: String,
    /// Old manual snapshots of the source cluster with this prefix are
    /// deleted first
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cleanup_prefix: Option<String>,
    /// Extra `RestoreDBClusterFromSnapshot` parameters (engine, subnet
    /// group, security groups, scaling)
    #[serde(default)]
    pub restore: serde_json::Map<String, Value>,
}

/// Move an encrypted instance snapshot into the destination account
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceSnapshotPlan {
    pub key: String,
    pub instance: String,
    /// Stop the instance before taking the snapshot
    #[serde(default = "default_true")]
    pub stop_instance: bool,
    /// Create the destination key under this alias instead of using the
    /// profile's destination key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination_key_alias: Option<String>,
    /// Grant the destination account use of the source key
    #[serde(default)]
    pub grant_source_key: bool,
}

/// Replicate a bucket into the destination account
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct S3ReplicationPlan {
    pub key: String,
    pub source_bucket: String,
    pub destination_bucket: String,
    /// Role S3 assumes to replicate objects
    pub replication_role_arn: String,
    /// Only keys under this prefix are replicated
    #[serde(default)]
    pub prefix: String,
    /// Copy objects that predate the replication rule
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub existing_objects: Option<BatchReplication>,
}

/// Batch Operations job replicating the objects listed in an inventory
/// manifest
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchReplication {
    pub manifest_bucket: String,
    pub manifest_key: String,
    /// Role the job runs as; defaults to the replication role
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role_arn: Option<String>,
    /// Bucket receiving the completion report; defaults to the manifest bucket
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub report_bucket: Option<String>,
    #[serde(default = "default_job_priority")]
    pub priority: u32,
}

/// Copy between two DataSync locations through a one-off task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataSyncPlan {
    pub key: String,
    pub source_location_arn: String,
    pub destination_location_arn: String,
    #[serde(default)]
    pub preserve_deleted_files: bool,
    /// Attempts at start-and-wait before giving up
    #[serde(default = "default_execution_attempts")]
    pub execution_attempts: u32,
}

fn default_true() -> bool {
    true
}

fn default_execution_attempts() -> u32 {
    60
}

fn default_job_priority() -> u32 {
    10
}

/// A plan as it appears in configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "plan", rename_all = "kebab-case")]
pub enum PlanRequest {
    ClusterRefresh(ClusterRefreshPlan),
    InstanceSnapshot(InstanceSnapshotPlan),
    DatasyncCopy(DataSyncPlan),
    S3Replication(S3ReplicationPlan),
}

impl PlanRequest {
    pub fn key(&self) -> &str {
        match self {
            PlanRequest::ClusterRefresh(plan) => &plan.key,
            PlanRequest::InstanceSnapshot(plan) => &plan.key,
            PlanRequest::DatasyncCopy(plan) => &plan.key,
            PlanRequest::S3Replication(plan) => &plan.key,
        }
    }

    /// Build the pipeline for this plan under `name`
    pub fn build(&self, name: &str, profile: &EnvironmentProfile) -> Result<PipelineDefinition> {
        profile.validate()?;
        let mut pipeline = match self {
            PlanRequest::ClusterRefresh(plan) => cluster_refresh(profile, plan)?,
            PlanRequest::InstanceSnapshot(plan) => instance_snapshot_migration(profile, plan)?,
            PlanRequest::DatasyncCopy(plan) => datasync_copy(profile, plan)?,
            PlanRequest::S3Replication(plan) => s3_replication(profile, plan)?,
        };
        pipeline.name = name.to_string();
        Ok(pipeline)
    }
}

// =============================================================================
// Builder Helpers
// =============================================================================

fn params<const N: usize>(pairs: [(&str, ParamValue); N]) -> ParamMap {
    pairs
        .into_iter()
        .map(|(name, value)| (name.to_string(), value))
        .collect()
}

fn query<const N: usize>(action: &str, pairs: [(&str, ParamValue); N]) -> OperationDescriptor {
    OperationDescriptor::new(ResourceQuery::invoke(action, params(pairs)))
}

fn wait_for<const N: usize>(waiter: &str, action: &str, pairs: [(&str, ParamValue); N]) -> WaitSpec {
    WaitSpec::new(query(action, pairs), WaiterRef::Named(waiter.to_string()))
}

fn success(matcher: Matcher) -> TerminationRule {
    TerminationRule::new(matcher, Outcome::Success)
}

/// A snapshot shared a moment ago may not be visible to the destination
/// account yet; its not-found fault is retried along with throttling
fn shared_copy_retry(not_found: &str) -> RetryConfig {
    let mut retry_on = ClassifierConfig::default();
    retry_on.codes.push(not_found.to_string());
    RetryConfig {
        max_attempts: 6,
        base_delay: Duration::from_secs(15),
        max_delay: Duration::from_secs(120),
        multiplier: 2.0,
        jitter: JitterStrategy::Full,
        retry_on,
    }
}

/// Pre-check finding a snapshot that already exists or is being created
fn snapshot_exists(action: &str, id_param: &str, status_path: &str) -> Precheck {
    Precheck::new(query(action, [(id_param, ParamValue::key())]))
        .rule(success(Matcher::any(status_path, "available")))
        .rule(success(Matcher::any(status_path, "creating")))
        .rule(success(Matcher::any(status_path, "copying")))
}

// =============================================================================
// Cluster Refresh
// =============================================================================

const CLUSTER_SNAPSHOTS: &str = "DescribeDBClusterSnapshots";
const CLUSTER_SNAPSHOT_ID: &str = "DBClusterSnapshotIdentifier";
const CLUSTER_SNAPSHOT_STATUS: &str = "DBClusterSnapshots[].Status";

/// Snapshot a source cluster, hand a re-encrypted copy to the destination
/// account, and replace the destination cluster with a restore of it
pub fn cluster_refresh(profile: &EnvironmentProfile, plan: &ClusterRefreshPlan) -> Result<PipelineDefinition> {
    let names = SnapshotNames::from_key(&plan.key)?;
    let source_kms = profile.source.kms_key("source")?;
    let destination_kms = profile.destination.kms_key("destination")?;
    let mut stages = Vec::new();

    if let Some(prefix) = &plan.cleanup_prefix {
        if plan.key.starts_with(prefix.as_str()) {
            return Err(Error::Configuration(format!(
                "cleanup prefix {:?} would match the snapshots of migration {}",
                prefix, plan.key
            )));
        }
        stages.push(delete_cluster_snapshots(
            "delete-old-snapshots",
            &plan.source_cluster,
            prefix,
            ExecutionContext::Source,
        ));
    }

    stages.push(
        StageDefinition::new(
            "create-snapshot",
            ActionSpec::new("CreateDBClusterSnapshot")
                .param(CLUSTER_SNAPSHOT_ID, ParamValue::key())
                .param("DBClusterIdentifier", plan.source_cluster.as_str())
                .param("Tags", profile.tags(&plan.key)),
        )
        .describe("Snapshot the source cluster")
        .with_key(names.snapshot.as_str())
        .with_precheck(snapshot_exists(CLUSTER_SNAPSHOTS, CLUSTER_SNAPSHOT_ID, CLUSTER_SNAPSHOT_STATUS))
        .with_wait(wait_for(
            builtin::DB_CLUSTER_SNAPSHOT_AVAILABLE,
            CLUSTER_SNAPSHOTS,
            [(CLUSTER_SNAPSHOT_ID, ParamValue::key())],
        ))
        .output(
            "snapshot_arn",
            OutputBinding::action_or_existing(
                "DBClusterSnapshot.DBClusterSnapshotArn",
                "DBClusterSnapshots[0].DBClusterSnapshotArn",
            )?,
        ),
    );

    stages.push(
        StageDefinition::new(
            "copy-own-snapshot",
            ActionSpec::new("CopyDBClusterSnapshot")
                .param("SourceDBClusterSnapshotIdentifier", ParamValue::input("snapshot_arn"))
                .param("TargetDBClusterSnapshotIdentifier", ParamValue::key())
                .param("KmsKeyId", source_kms)
                .param("CopyTags", json!(true))
                .param("Tags", profile.tags(&plan.key)),
        )
        .describe("Re-encrypt the snapshot with a shareable source key")
        .with_key(names.copy.as_str())
        .with_precheck(snapshot_exists(CLUSTER_SNAPSHOTS, CLUSTER_SNAPSHOT_ID, CLUSTER_SNAPSHOT_STATUS))
        .with_wait(wait_for(
            builtin::DB_CLUSTER_SNAPSHOT_AVAILABLE,
            CLUSTER_SNAPSHOTS,
            [(CLUSTER_SNAPSHOT_ID, ParamValue::key())],
        ))
        .output("copy_id", OutputBinding::Key)
        .output(
            "copy_arn",
            OutputBinding::action_or_existing(
                "DBClusterSnapshot.DBClusterSnapshotArn",
                "DBClusterSnapshots[0].DBClusterSnapshotArn",
            )?,
        ),
    );

    stages.push(
        StageDefinition::new(
            "share-snapshot",
            ActionSpec::new("ModifyDBClusterSnapshotAttribute")
                .param(CLUSTER_SNAPSHOT_ID, ParamValue::input("copy_id"))
                .param("AttributeName", "restore")
                .param("ValuesToAdd", json!([profile.destination.account_id])),
        )
        .describe("Grant the destination account restore access"),
    );

    stages.push(
        StageDefinition::new(
            "copy-to-destination",
            ActionSpec::new("CopyDBClusterSnapshot")
                .param("SourceDBClusterSnapshotIdentifier", ParamValue::input("copy_arn"))
                .param("TargetDBClusterSnapshotIdentifier", ParamValue::key())
                .param("KmsKeyId", destination_kms)
                .param("SourceRegion", profile.source.region.as_str()),
        )
        .describe("Copy the shared snapshot into the destination account")
        .in_context(ExecutionContext::Destination)
        .with_key(names.copy.as_str())
        .with_precheck(snapshot_exists(CLUSTER_SNAPSHOTS, CLUSTER_SNAPSHOT_ID, CLUSTER_SNAPSHOT_STATUS))
        .with_wait(wait_for(
            builtin::DB_CLUSTER_SNAPSHOT_AVAILABLE,
            CLUSTER_SNAPSHOTS,
            [(CLUSTER_SNAPSHOT_ID, ParamValue::key())],
        ))
        .output("destination_snapshot", OutputBinding::Key)
        .with_retry(shared_copy_retry("DBClusterSnapshotNotFoundFault"), RetryScope::Action),
    );

    let cluster = [("DBClusterIdentifier", ParamValue::from(plan.target_cluster.as_str()))];
    stages.push(
        StageDefinition::new(
            "delete-target-cluster",
            ActionSpec::new("DeleteDBCluster")
                .param("DBClusterIdentifier", plan.target_cluster.as_str())
                .param("SkipFinalSnapshot", json!(true)),
        )
        .describe("Remove the cluster being replaced")
        .in_context(ExecutionContext::Destination)
        .with_precheck(
            Precheck::new(query("DescribeDBClusters", cluster.clone()))
                .rule(success(Matcher::error("DBClusterNotFoundFault")))
                .rule(success(Matcher::exact("length(DBClusters)", 0)))
                .rule(success(Matcher::any("DBClusters[].Status", "deleting"))),
        )
        .with_wait(wait_for(builtin::DB_CLUSTER_DELETED, "DescribeDBClusters", cluster.clone())),
    );

    let mut restore = ActionSpec::new("RestoreDBClusterFromSnapshot")
        .param("DBClusterIdentifier", plan.target_cluster.as_str())
        .param("SnapshotIdentifier", ParamValue::input("destination_snapshot"))
        .param("KmsKeyId", destination_kms)
        .param("CopyTagsToSnapshot", json!(true))
        .param("Tags", profile.tags(&plan.key));
    for (name, value) in &plan.restore {
        restore = restore.param(name.as_str(), value.clone());
    }
    stages.push(
        StageDefinition::new("restore-cluster", restore)
            .describe("Restore the destination cluster from the copied snapshot")
            .in_context(ExecutionContext::Destination)
            .with_precheck(
                Precheck::new(query("DescribeDBClusters", cluster.clone()))
                    .rule(success(Matcher::all("DBClusters[].Status", "available")))
                    .rule(success(Matcher::all("DBClusters[].Status", "creating"))),
            )
            .with_wait(wait_for(builtin::DB_CLUSTER_AVAILABLE, "DescribeDBClusters", cluster)),
    );

    stages.push(delete_cluster_snapshots(
        "delete-source-snapshots",
        &plan.source_cluster,
        &plan.key,
        ExecutionContext::Source,
    ));

    Ok(PipelineDefinition::new(format!("cluster-refresh-{}", plan.key), stages)
        .describe(format!(
            "Refresh {} from {} ({} -> {})",
            plan.target_cluster, plan.source_cluster, profile.source.account_id, profile.destination.account_id
        ))
        .with_lock(plan.target_cluster.as_str()))
}

/// Best-effort batch deleting manual cluster snapshots with `prefix`
fn delete_cluster_snapshots(
    name: &str,
    cluster: &str,
    prefix: &str,
    context: ExecutionContext,
) -> StageDefinition {
    let list = query(
        CLUSTER_SNAPSHOTS,
        [
            ("DBClusterIdentifier", ParamValue::from(cluster)),
            ("SnapshotType", ParamValue::from("manual")),
        ],
    );
    StageDefinition::new(
        name,
        ActionSpec::new("DeleteDBClusterSnapshot").param(CLUSTER_SNAPSHOT_ID, ParamValue::item()),
    )
    .describe(format!("Delete manual snapshots of {} starting with {}", cluster, prefix))
    .in_context(context)
    .with_wait(wait_for(
        builtin::DB_CLUSTER_SNAPSHOT_DELETED,
        CLUSTER_SNAPSHOTS,
        [(CLUSTER_SNAPSHOT_ID, ParamValue::item())],
    ))
    .with_batch(BatchSpec {
        list,
        items: items_path("DBClusterSnapshots[].DBClusterSnapshotIdentifier"),
        prefix: Some(prefix.to_string()),
        concurrency: 4,
    })
    .best_effort()
}

fn items_path(path: &str) -> ExtractPath {
    match ExtractPath::parse(path) {
        Ok(parsed) => parsed,
        Err(e) => panic!("invalid static extract path {:?}: {}", path, e),
    }
}

// =============================================================================
// Instance Snapshot Migration
// =============================================================================

const DB_SNAPSHOTS: &str = "DescribeDBSnapshots";
const DB_SNAPSHOT_ID: &str = "DBSnapshotIdentifier";
const DB_SNAPSHOT_STATUS: &str = "DBSnapshots[].Status";

/// Snapshot an instance and copy it, re-encrypted, into the destination
/// account
pub fn instance_snapshot_migration(
    profile: &EnvironmentProfile,
    plan: &InstanceSnapshotPlan,
) -> Result<PipelineDefinition> {
    let names = SnapshotNames::from_key(&plan.key)?;
    let source_kms = profile.source.kms_key("source")?;
    let destination_kms = match &plan.destination_key_alias {
        Some(alias) => {
            validate_alias(alias)?;
            ParamValue::input("destination_key")
        }
        None => ParamValue::from(profile.destination.kms_key("destination")?),
    };
    let instance = [("DBInstanceIdentifier", ParamValue::from(plan.instance.as_str()))];
    let mut stages = Vec::new();

    if plan.stop_instance {
        stages.push(
            StageDefinition::new(
                "stop-instance",
                ActionSpec::new("StopDBInstance").param("DBInstanceIdentifier", plan.instance.as_str()),
            )
            .describe("Stop the source instance so the snapshot is consistent")
            .with_precheck(
                Precheck::new(query("DescribeDBInstances", instance.clone()))
                    .rule(success(Matcher::all("DBInstances[].DBInstanceStatus", "stopped")))
                    .rule(success(Matcher::all("DBInstances[].DBInstanceStatus", "stopping"))),
            )
            .with_wait(wait_for(builtin::DB_INSTANCE_STOPPED, "DescribeDBInstances", instance.clone())),
        );
    }

    stages.push(
        StageDefinition::new(
            "create-snapshot",
            ActionSpec::new("CreateDBSnapshot")
                .param(DB_SNAPSHOT_ID, ParamValue::key())
                .param("DBInstanceIdentifier", plan.instance.as_str())
                .param("Tags", profile.tags(&plan.key)),
        )
        .describe("Snapshot the source instance")
        .with_key(names.snapshot.as_str())
        .with_precheck(snapshot_exists(DB_SNAPSHOTS, DB_SNAPSHOT_ID, DB_SNAPSHOT_STATUS))
        .with_wait(wait_for(
            builtin::DB_SNAPSHOT_AVAILABLE,
            DB_SNAPSHOTS,
            [(DB_SNAPSHOT_ID, ParamValue::key())],
        ))
        .output(
            "snapshot_arn",
            OutputBinding::action_or_existing("DBSnapshot.DBSnapshotArn", "DBSnapshots[0].DBSnapshotArn")?,
        ),
    );

    stages.push(
        StageDefinition::new(
            "copy-shareable",
            ActionSpec::new("CopyDBSnapshot")
                .param("SourceDBSnapshotIdentifier", ParamValue::input("snapshot_arn"))
                .param("TargetDBSnapshotIdentifier", ParamValue::key())
                .param("KmsKeyId", source_kms)
                .param("CopyTags", json!(true)),
        )
        .describe("Re-encrypt the snapshot with a shareable source key")
        .with_key(names.shared.as_str())
        .with_precheck(snapshot_exists(DB_SNAPSHOTS, DB_SNAPSHOT_ID, DB_SNAPSHOT_STATUS))
        .with_wait(wait_for(
            builtin::DB_SNAPSHOT_AVAILABLE,
            DB_SNAPSHOTS,
            [(DB_SNAPSHOT_ID, ParamValue::key())],
        ))
        .output("shared_id", OutputBinding::Key)
        .output(
            "shared_arn",
            OutputBinding::action_or_existing("DBSnapshot.DBSnapshotArn", "DBSnapshots[0].DBSnapshotArn")?,
        ),
    );

    if plan.grant_source_key {
        stages.push(grant_source_key(profile, source_kms, &plan.key));
    }

    stages.push(
        StageDefinition::new(
            "share-snapshot",
            ActionSpec::new("ModifyDBSnapshotAttribute")
                .param(DB_SNAPSHOT_ID, ParamValue::input("shared_id"))
                .param("AttributeName", "restore")
                .param("ValuesToAdd", json!([profile.destination.account_id])),
        )
        .describe("Grant the destination account restore access"),
    );

    if let Some(alias) = &plan.destination_key_alias {
        stages.extend(destination_key(profile, alias, &plan.key)?);
    }

    stages.push(
        StageDefinition::new(
            "copy-to-destination",
            ActionSpec::new("CopyDBSnapshot")
                .param("SourceDBSnapshotIdentifier", ParamValue::input("shared_arn"))
                .param("TargetDBSnapshotIdentifier", ParamValue::key())
                .param("KmsKeyId", destination_kms)
                .param("SourceRegion", profile.source.region.as_str())
                .param("CopyTags", json!(true)),
        )
        .describe("Copy the shared snapshot into the destination account")
        .in_context(ExecutionContext::Destination)
        .with_key(names.snapshot.as_str())
        .with_precheck(snapshot_exists(DB_SNAPSHOTS, DB_SNAPSHOT_ID, DB_SNAPSHOT_STATUS))
        .with_wait(wait_for(
            builtin::DB_SNAPSHOT_AVAILABLE,
            DB_SNAPSHOTS,
            [(DB_SNAPSHOT_ID, ParamValue::key())],
        ))
        .output("destination_snapshot", OutputBinding::Key)
        .with_retry(shared_copy_retry("DBSnapshotNotFound"), RetryScope::Action),
    );

    Ok(PipelineDefinition::new(format!("instance-snapshot-{}", plan.key), stages)
        .describe(format!(
            "Move a snapshot of {} from {} to {}",
            plan.instance, profile.source.account_id, profile.destination.account_id
        ))
        .with_lock(plan.instance.as_str()))
}

// =============================================================================
// Encryption Keys
// =============================================================================

const KMS_NOT_FOUND: &str = "NotFoundException";

fn validate_alias(alias: &str) -> Result<()> {
    let name = alias.strip_prefix("alias/").unwrap_or_default();
    let valid = !name.is_empty()
        && !name.starts_with("aws/")
        && name.len() <= 250
        && name.chars().all(|c| c.is_ascii_alphanumeric() || "/_-".contains(c));
    if !valid {
        return Err(Error::Configuration(format!("invalid key alias {:?}", alias)));
    }
    Ok(())
}

/// Pre-check on an alias resolving to an enabled key
fn alias_exists(alias: &str) -> Precheck {
    Precheck::new(query("DescribeKey", [("KeyId", ParamValue::from(alias))]))
        .rule(success(Matcher::exact("KeyMetadata.KeyState", "Enabled")))
        .rule(TerminationRule::new(Matcher::error(KMS_NOT_FOUND), Outcome::Failure))
}

/// Let the destination account decrypt snapshots sealed with the source key
fn grant_source_key(profile: &EnvironmentProfile, source_kms: &str, key: &str) -> StageDefinition {
    let grant_name = format!("{}-destination-copy", key);
    StageDefinition::new(
        "grant-source-key",
        ActionSpec::new("CreateGrant")
            .param("KeyId", source_kms)
            .param("GranteePrincipal", profile.destination.root_principal())
            .param("Operations", json!(["Decrypt", "DescribeKey", "CreateGrant"]))
            .param("Name", ParamValue::key()),
    )
    .describe("Grant the destination account use of the source key")
    .with_key(grant_name.as_str())
    .with_precheck(
        Precheck::new(query("ListGrants", [("KeyId", ParamValue::from(source_kms))]))
            .rule(success(Matcher::any("Grants[].Name", grant_name.as_str()))),
    )
}

/// Create a destination key and point `alias` at it. Produces
/// `destination_key` (the key ARN).
fn destination_key(profile: &EnvironmentProfile, alias: &str, key: &str) -> Result<[StageDefinition; 2]> {
    let create = StageDefinition::new(
        "create-destination-key",
        ActionSpec::new("CreateKey")
            .param("Description", format!("Snapshot migration {} ({})", key, profile.name))
            .param("KeyUsage", "ENCRYPT_DECRYPT")
            .param("Origin", "AWS_KMS")
            .param("Tags", profile.key_tags(key)),
    )
    .describe("Create the key destination snapshots are encrypted with")
    .in_context(ExecutionContext::Destination)
    .with_precheck(alias_exists(alias))
    .output(
        "destination_key",
        OutputBinding::action_or_existing("KeyMetadata.Arn", "KeyMetadata.Arn")?,
    );

    let name = StageDefinition::new(
        "create-key-alias",
        ActionSpec::new("CreateAlias")
            .param("AliasName", alias)
            .param("TargetKeyId", ParamValue::input("destination_key")),
    )
    .describe(format!("Point {} at the destination key", alias))
    .in_context(ExecutionContext::Destination)
    .with_precheck(alias_exists(alias));

    Ok([create, name])
}

// =============================================================================
// DataSync Copy
// =============================================================================

/// Create a task, run it to completion (re-submitting failed executions),
/// then remove the task
pub fn datasync_copy(profile: &EnvironmentProfile, plan: &DataSyncPlan) -> Result<PipelineDefinition> {
    SnapshotNames::from_key(&plan.key)?;
    if plan.execution_attempts == 0 {
        return Err(Error::Configuration("execution_attempts must be at least 1".into()));
    }

    let deleted_files = if plan.preserve_deleted_files { "PRESERVE" } else { "REMOVE" };
    let options = json!({
        "VerifyMode": "POINT_IN_TIME_CONSISTENT",
        "OverwriteMode": "ALWAYS",
        "PreserveDeletedFiles": deleted_files,
    });

    let create = StageDefinition::new(
        "create-task",
        ActionSpec::new("CreateTask")
            .param("SourceLocationArn", plan.source_location_arn.as_str())
            .param("DestinationLocationArn", plan.destination_location_arn.as_str())
            .param("Name", ParamValue::key())
            .param("Options", options)
            .param("Tags", json!([{"Key": "MigrationKey", "Value": plan.key}])),
    )
    .describe("Create the transfer task")
    .with_key(format!("{}-sync", plan.key))
    .output("task_arn", OutputBinding::action("TaskArn")?);

    // a failed execution is re-submitted as a whole
    let execution_retry = RetryConfig {
        max_attempts: plan.execution_attempts,
        base_delay: Duration::from_millis(500),
        max_delay: Duration::from_secs(60),
        multiplier: 2.0,
        jitter: JitterStrategy::Full,
        retry_on: ClassifierConfig {
            waiter_failures: true,
            ..Default::default()
        },
    };
    let run = StageDefinition::new(
        "run-task",
        ActionSpec::new("StartTaskExecution").param("TaskArn", ParamValue::input("task_arn")),
    )
    .describe("Start an execution and wait for it to finish")
    .with_wait(wait_for(
        builtin::DATASYNC_TASK_EXECUTION_FINISHED,
        "DescribeTaskExecution",
        [("TaskExecutionArn", ParamValue::input("execution_arn"))],
    ))
    .output("execution_arn", OutputBinding::action("TaskExecutionArn")?)
    .with_retry(execution_retry, RetryScope::Unit);

    let delete = StageDefinition::new(
        "delete-task",
        ActionSpec::new("DeleteTask").param("TaskArn", ParamValue::input("task_arn")),
    )
    .describe("Remove the transfer task")
    .best_effort();

    Ok(PipelineDefinition::new(format!("datasync-{}", plan.key), vec![create, run, delete])
        .describe(format!(
            "Copy {} to {} in {}",
            plan.source_location_arn, plan.destination_location_arn, profile.source.region
        ))
        .with_lock(plan.destination_location_arn.as_str()))
}

// =============================================================================
// S3 Replication
// =============================================================================

fn bucket_arn(account: &AccountProfile, bucket: &str) -> String {
    format!("arn:{}:s3:::{}", partition(&account.region), bucket)
}

/// Bucket naming rules, less the dotted-quad check
fn validate_bucket(bucket: &str) -> Result<()> {
    let valid = (3..=63).contains(&bucket.len())
        && bucket
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '.')
        && bucket.starts_with(|c: char| c.is_ascii_alphanumeric())
        && bucket.ends_with(|c: char| c.is_ascii_alphanumeric());
    if !valid {
        return Err(Error::Configuration(format!("invalid bucket name {:?}", bucket)));
    }
    Ok(())
}

fn enable_versioning(name: &str, bucket: &str, context: ExecutionContext) -> StageDefinition {
    let lookup = query("GetBucketVersioning", [("Bucket", ParamValue::from(bucket))]);
    StageDefinition::new(
        name,
        ActionSpec::new("PutBucketVersioning")
            .param("Bucket", bucket)
            .param("VersioningConfiguration", json!({"Status": "Enabled"})),
    )
    .describe(format!("Enable versioning on {}", bucket))
    .in_context(context)
    .with_precheck(Precheck::new(lookup).rule(success(Matcher::exact("Status", "Enabled"))))
}

/// Turn on live replication from the source bucket and, when asked, run a
/// Batch Operations job copying the objects already there
pub fn s3_replication(profile: &EnvironmentProfile, plan: &S3ReplicationPlan) -> Result<PipelineDefinition> {
    SnapshotNames::from_key(&plan.key)?;
    validate_bucket(&plan.source_bucket)?;
    validate_bucket(&plan.destination_bucket)?;
    if plan.source_bucket == plan.destination_bucket {
        return Err(Error::Configuration(format!(
            "bucket {} cannot replicate into itself",
            plan.source_bucket
        )));
    }

    let mut stages = vec![
        enable_versioning("enable-source-versioning", &plan.source_bucket, ExecutionContext::Source),
        enable_versioning(
            "enable-destination-versioning",
            &plan.destination_bucket,
            ExecutionContext::Destination,
        ),
    ];

    let fifteen_minutes = json!({"Minutes": 15});
    let rule = json!({
        "ID": plan.key,
        "Priority": 1,
        "Filter": {"Prefix": plan.prefix},
        "Status": "Enabled",
        "DeleteMarkerReplication": {"Status": "Enabled"},
        "Destination": {
            "Bucket": bucket_arn(&profile.destination, &plan.destination_bucket),
            "Account": profile.destination.account_id,
            "AccessControlTranslation": {"Owner": "Destination"},
            "ReplicationTime": {"Status": "Enabled", "Time": fifteen_minutes},
            "Metrics": {"Status": "Enabled", "EventThreshold": fifteen_minutes},
        },
    });
    stages.push(
        StageDefinition::new(
            "put-replication",
            ActionSpec::new("PutBucketReplication")
                .param("Bucket", plan.source_bucket.as_str())
                .param(
                    "ReplicationConfiguration",
                    json!({"Role": plan.replication_role_arn, "Rules": [rule]}),
                ),
        )
        .describe(format!(
            "Replicate {} into {}",
            plan.source_bucket, plan.destination_bucket
        ))
        .with_precheck(
            Precheck::new(query("GetBucketReplication", [("Bucket", ParamValue::from(plan.source_bucket.as_str()))]))
                .rule(success(Matcher::any("ReplicationConfiguration.Rules[].ID", plan.key.as_str())))
                .rule(TerminationRule::new(
                    Matcher::error("ReplicationConfigurationNotFoundError"),
                    Outcome::Failure,
                )),
        ),
    );

    if let Some(batch) = &plan.existing_objects {
        validate_bucket(&batch.manifest_bucket)?;
        stages.extend(batch_replication(profile, plan, batch)?);
    }

    Ok(PipelineDefinition::new(format!("s3-replication-{}", plan.key), stages)
        .describe(format!(
            "Replicate s3://{} ({}) to s3://{} ({})",
            plan.source_bucket, profile.source.account_id, plan.destination_bucket, profile.destination.account_id
        ))
        .with_lock(plan.destination_bucket.as_str()))
}

fn batch_replication(
    profile: &EnvironmentProfile,
    plan: &S3ReplicationPlan,
    batch: &BatchReplication,
) -> Result<[StageDefinition; 2]> {
    let token = format!("{}-batch", plan.key);
    // CreateJob request tokens are at most 64 characters
    if token.len() > 64 {
        return Err(Error::Configuration(format!(
            "migration key {} is too long for a batch job",
            plan.key
        )));
    }
    let account = profile.source.account_id.as_str();
    let read = StageDefinition::new(
        "read-manifest",
        ActionSpec::new("HeadObject")
            .param("Bucket", batch.manifest_bucket.as_str())
            .param("Key", batch.manifest_key.as_str()),
    )
    .describe("Read the inventory manifest's ETag")
    .output("manifest_etag", OutputBinding::action("ETag")?);

    let manifest = ParamValue::nested([
        (
            "Spec",
            ParamValue::literal(json!({
                "Format": "S3InventoryReport_CSV_20161130",
                "Fields": ["Bucket", "Key", "VersionId"],
            })),
        ),
        (
            "Location",
            ParamValue::nested([
                (
                    "ObjectArn",
                    ParamValue::from(format!(
                        "{}/{}",
                        bucket_arn(&profile.source, &batch.manifest_bucket),
                        batch.manifest_key
                    )),
                ),
                ("ETag", ParamValue::input("manifest_etag")),
            ]),
        ),
    ]);
    let report_bucket = batch.report_bucket.as_deref().unwrap_or(&batch.manifest_bucket);
    let report = json!({
        "Bucket": bucket_arn(&profile.source, report_bucket),
        "Format": "Report_CSV_20180820",
        "Enabled": true,
        "Prefix": "batch-replication-reports/",
        "ReportScope": "AllTasks",
    });
    let job = [
        ("AccountId", ParamValue::from(account)),
        ("JobId", ParamValue::input("job_id")),
    ];

    let create = StageDefinition::new(
        "replicate-existing-objects",
        ActionSpec::new("CreateJob")
            .param("AccountId", account)
            .param("ClientRequestToken", ParamValue::key())
            .param("ConfirmationRequired", json!(false))
            .param("Operation", json!({"S3ReplicateObject": {}}))
            .param("Manifest", manifest)
            .param("Report", report)
            .param("Priority", json!(batch.priority))
            .param(
                "RoleArn",
                batch.role_arn.as_deref().unwrap_or(&plan.replication_role_arn),
            )
            .param("Description", format!("Replicate existing objects of {}", plan.source_bucket)),
    )
    .describe("Replicate objects that predate the replication rule")
    .with_key(token)
    .with_wait(wait_for(builtin::S3_BATCH_JOB_COMPLETE, "DescribeJob", job))
    .output("job_id", OutputBinding::action("JobId")?);

    Ok([read, create])
}
