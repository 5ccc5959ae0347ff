//! Simulated Control Plane
//!
//! In-memory accounts modelling cluster and instance snapshots, clusters,
//! instances, DataSync tasks, S3 buckets and batch jobs, and KMS keys.
//! Every resource starts in a transitional status and settles after a
//! configurable number of observations, so waiters poll the way they would
//! against the real service. Accounts share one [`SimulatedWorld`], which
//! lets a destination account copy a snapshot the source account shared
//! with it.

use crate::domain::ports::{
    ClientSet, ControlPlaneClient, ExecutionContext, Params, RemoteError, ResourceId,
};
use crate::migration::plans::{partition, EnvironmentProfile};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use tracing::debug;

type Reply = std::result::Result<Value, RemoteError>;

// =============================================================================
// Resources
// =============================================================================

/// Kinds of resource the simulation models
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResourceKind {
    ClusterSnapshot,
    DbSnapshot,
    Cluster,
    Instance,
    Task,
    TaskExecution,
    Bucket,
    /// Identified as `bucket/key`
    Object,
    BatchJob,
    Key,
    /// Identified as `alias/name`
    Alias,
}

#[derive(Debug, Clone)]
struct Resource {
    kind: ResourceKind,
    account: String,
    id: String,
    arn: String,
    status: String,
    /// Status reached after the remaining number of observations
    pending: Option<(String, u32)>,
    /// Owning cluster/instance, or the task of an execution
    parent: Option<String>,
    name: Option<String>,
    kms_key: Option<String>,
    shared_with: BTreeSet<String>,
    /// Snapshot this resource was copied or restored from, or the key an
    /// alias targets
    source: Option<String>,
    /// Kind-specific fields (replication configuration, ETag, grants)
    details: serde_json::Map<String, Value>,
}

impl Resource {
    /// Move to `initial`, settling as `settled` after `after` observations
    fn begin(&mut self, initial: &str, settled: &str, after: u32) {
        if after == 0 {
            self.status = settled.to_string();
            self.pending = None;
        } else {
            self.status = initial.to_string();
            self.pending = Some((settled.to_string(), after));
        }
    }

    fn observe(&mut self) {
        if let Some((settled, remaining)) = self.pending.take() {
            if remaining <= 1 {
                self.status = settled;
            } else {
                self.pending = Some((settled, remaining - 1));
            }
        }
    }

    fn is_deleted(&self) -> bool {
        self.status == "deleted"
    }

    fn to_json(&self) -> Value {
        match self.kind {
            ResourceKind::ClusterSnapshot => json!({
                "DBClusterSnapshotIdentifier": self.id,
                "DBClusterSnapshotArn": self.arn,
                "DBClusterIdentifier": self.parent,
                "SnapshotType": "manual",
                "Status": self.status,
                "KmsKeyId": self.kms_key,
                "SourceDBClusterSnapshotArn": self.source,
            }),
            ResourceKind::DbSnapshot => json!({
                "DBSnapshotIdentifier": self.id,
                "DBSnapshotArn": self.arn,
                "DBInstanceIdentifier": self.parent,
                "SnapshotType": "manual",
                "Status": self.status,
                "KmsKeyId": self.kms_key,
                "SourceDBSnapshotIdentifier": self.source,
            }),
            ResourceKind::Cluster => json!({
                "DBClusterIdentifier": self.id,
                "DBClusterArn": self.arn,
                "Status": self.status,
                "KmsKeyId": self.kms_key,
                "SnapshotIdentifier": self.source,
            }),
            ResourceKind::Instance => json!({
                "DBInstanceIdentifier": self.id,
                "DBInstanceArn": self.arn,
                "DBInstanceStatus": self.status,
            }),
            ResourceKind::Task => json!({
                "TaskArn": self.arn,
                "Name": self.name,
                "Status": self.status,
            }),
            ResourceKind::TaskExecution => json!({
                "TaskExecutionArn": self.arn,
                "TaskArn": self.parent,
                "Status": self.status,
            }),
            ResourceKind::Bucket => json!({
                "Name": self.id,
                "Status": self.status,
            }),
            ResourceKind::Object => json!({
                "Key": self.id,
                "ETag": self.details.get("ETag"),
            }),
            ResourceKind::BatchJob => json!({
                "JobId": self.id,
                "Status": self.status,
                "Priority": self.details.get("Priority"),
                "ProgressSummary": {
                    "TotalNumberOfTasks": 1,
                    "NumberOfTasksSucceeded": u32::from(self.status == "Complete"),
                    "NumberOfTasksFailed": u32::from(self.status == "Failed"),
                },
            }),
            ResourceKind::Key => json!({
                "KeyId": self.id,
                "Arn": self.arn,
                "AWSAccountId": self.account,
                "KeyState": self.status,
                "Description": self.name,
                "KeyManager": "CUSTOMER",
            }),
            ResourceKind::Alias => json!({
                "AliasName": self.id,
                "AliasArn": self.arn,
                "TargetKeyId": self.parent,
            }),
        }
    }
}

/// Stable ETag for a seeded object
fn etag(id: &str) -> String {
    let mut hasher = std::collections::hash_map::DefaultHasher::new();
    id.hash(&mut hasher);
    format!("\"{:016x}\"", hasher.finish())
}

/// Account id field of an ARN
fn arn_account(arn: &str) -> Option<&str> {
    arn.split(':').nth(4).filter(|account| !account.is_empty())
}

/// Key referenced by id, key ARN, alias name or alias ARN, resolving names
/// within `account`
fn find_key<'s>(state: &'s WorldState, account: &str, reference: &str) -> Option<&'s Resource> {
    let (account, alias) = match reference.split_once(":alias/") {
        Some((prefix, name)) => (arn_account(prefix).unwrap_or(account), Some(format!("alias/{}", name))),
        None if reference.starts_with("alias/") => (account, Some(reference.to_string())),
        None => (account, None),
    };
    let key_arn = match alias {
        Some(alias) => state
            .resources
            .values()
            .find(|r| r.kind == ResourceKind::Alias && r.account == account && r.id == alias)?
            .source
            .clone()?,
        None if reference.starts_with("arn:") => reference.to_string(),
        None => state
            .resources
            .values()
            .find(|r| r.kind == ResourceKind::Key && r.account == account && r.id == reference)?
            .arn
            .clone(),
    };
    state
        .resources
        .get(&key_arn)
        .filter(|r| r.kind == ResourceKind::Key)
}

/// One call received by any simulated account
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedCall {
    pub account: String,
    pub action: String,
    pub params: Params,
}

#[derive(Debug)]
struct Fault {
    /// Only calls from this account fail; any account when unset
    account: Option<String>,
    action: String,
    code: String,
    remaining: u32,
}

#[derive(Debug, Default)]
struct WorldState {
    /// Keyed by ARN
    resources: BTreeMap<String, Resource>,
    faults: Vec<Fault>,
    failing_executions: u32,
    failing_jobs: u32,
    calls: Vec<RecordedCall>,
    sequence: u64,
}

impl WorldState {
    fn take_fault(&mut self, account: &str, action: &str) -> Option<RemoteError> {
        let fault = self.faults.iter_mut().find(|f| {
            f.action == action
                && f.remaining > 0
                && f.account.as_deref().map_or(true, |a| a == account)
        })?;
        fault.remaining -= 1;
        Some(RemoteError::new(fault.code.clone(), "injected fault"))
    }

    /// Observe each resource once; settled deletions disappear
    fn observe(&mut self, arns: &[String]) -> Vec<Value> {
        let mut items = Vec::new();
        for arn in arns {
            let deleted = match self.resources.get_mut(arn) {
                Some(resource) => {
                    resource.observe();
                    if !resource.is_deleted() {
                        items.push(resource.to_json());
                    }
                    resource.is_deleted()
                }
                None => continue,
            };
            if deleted {
                self.resources.remove(arn);
            }
        }
        items
    }

    fn next_id(&mut self, prefix: &str) -> String {
        self.sequence += 1;
        format!("{}-{:017x}", prefix, self.sequence)
    }
}

// =============================================================================
// World
// =============================================================================

/// State shared by every simulated account
#[derive(Debug)]
pub struct SimulatedWorld {
    state: Mutex<WorldState>,
    settle_after: u32,
}

impl SimulatedWorld {
    /// Resources settle after `settle_after` observations
    pub fn new(settle_after: u32) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(WorldState::default()),
            settle_after,
        })
    }

    /// Client for one account/region
    pub fn account(
        self: &Arc<Self>,
        account_id: impl Into<String>,
        region: impl Into<String>,
    ) -> Arc<SimulatedControlPlane> {
        let account_id = account_id.into();
        let region = region.into();
        Arc::new(SimulatedControlPlane {
            world: self.clone(),
            label: format!("simulated:{}/{}", account_id, region),
            account_id,
            region,
        })
    }

    /// Fail the next `times` calls of `action` with `code`
    pub fn inject_error(&self, action: &str, code: &str, times: u32) {
        self.push_fault(None, action, code, times);
    }

    /// Fail the next `times` calls of `action` made by `account`
    pub fn inject_error_for(&self, account: &str, action: &str, code: &str, times: u32) {
        self.push_fault(Some(account.to_string()), action, code, times);
    }

    fn push_fault(&self, account: Option<String>, action: &str, code: &str, times: u32) {
        self.state.lock().faults.push(Fault {
            account,
            action: action.to_string(),
            code: code.to_string(),
            remaining: times,
        });
    }

    /// The next `count` task executions finish with `ERROR`
    pub fn fail_next_executions(&self, count: u32) {
        self.state.lock().failing_executions += count;
    }

    /// The next `count` batch jobs end `Failed`
    pub fn fail_next_jobs(&self, count: u32) {
        self.state.lock().failing_jobs += count;
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.state.lock().calls.clone()
    }

    pub fn count(&self, action: &str) -> usize {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|c| c.action == action)
            .count()
    }
}

// =============================================================================
// Simulation Config
// =============================================================================

/// A resource present before the run starts
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SeedResource {
    pub kind: ResourceKind,
    pub id: String,
    /// Empty for a bucket that never had versioning
    #[serde(default)]
    pub status: String,
    /// Owning cluster/instance, or the key id an alias targets
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
}

impl SeedResource {
    pub fn new(kind: ResourceKind, id: impl Into<String>, status: impl Into<String>) -> Self {
        Self {
            kind,
            id: id.into(),
            status: status.into(),
            parent: None,
        }
    }

    pub fn with_parent(mut self, parent: impl Into<String>) -> Self {
        self.parent = Some(parent.into());
        self
    }
}

/// An error injected into the simulation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FaultSpec {
    pub action: String,
    pub code: String,
    #[serde(default = "default_times")]
    pub times: u32,
    /// Only calls made in this context fail
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<ExecutionContext>,
}

fn default_times() -> u32 {
    1
}

/// Rehearsal settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimulationConfig {
    pub settle_after: u32,
    pub source: Vec<SeedResource>,
    pub destination: Vec<SeedResource>,
    pub faults: Vec<FaultSpec>,
    pub failing_executions: u32,
    pub failing_jobs: u32,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            settle_after: 2,
            source: Vec::new(),
            destination: Vec::new(),
            faults: Vec::new(),
            failing_executions: 0,
            failing_jobs: 0,
        }
    }
}

impl SimulationConfig {
    /// Build seeded source and destination accounts for `profile`
    pub fn build(&self, profile: &EnvironmentProfile) -> (Arc<SimulatedWorld>, ClientSet) {
        let world = SimulatedWorld::new(self.settle_after);
        let source = world.account(&profile.source.account_id, &profile.source.region);
        let destination = world.account(&profile.destination.account_id, &profile.destination.region);

        for seed in &self.source {
            source.seed(seed.kind, &seed.id, &seed.status, seed.parent.as_deref());
        }
        for seed in &self.destination {
            destination.seed(seed.kind, &seed.id, &seed.status, seed.parent.as_deref());
        }
        for fault in &self.faults {
            match fault.context {
                Some(ExecutionContext::Source) => {
                    world.inject_error_for(&profile.source.account_id, &fault.action, &fault.code, fault.times)
                }
                Some(ExecutionContext::Destination) => world.inject_error_for(
                    &profile.destination.account_id,
                    &fault.action,
                    &fault.code,
                    fault.times,
                ),
                None => world.inject_error(&fault.action, &fault.code, fault.times),
            }
        }
        world.fail_next_executions(self.failing_executions);
        world.fail_next_jobs(self.failing_jobs);

        // a same-account profile shares one client
        let clients = if profile.source == profile.destination {
            ClientSet::single(source)
        } else {
            ClientSet::new(source, destination)
        };
        (world, clients)
    }
}

// =============================================================================
// Snapshot APIs
// =============================================================================

/// Names that differ between cluster and instance snapshot operations
struct SnapshotApi {
    kind: ResourceKind,
    id_param: &'static str,
    source_param: &'static str,
    target_param: &'static str,
    parent_param: &'static str,
    parent_kind: ResourceKind,
    parent_not_found: &'static str,
    parent_invalid_state: &'static str,
    list_key: &'static str,
    item_key: &'static str,
    not_found: &'static str,
    already_exists: &'static str,
    invalid_state: &'static str,
}

const CLUSTER_SNAPSHOTS: SnapshotApi = SnapshotApi {
    kind: ResourceKind::ClusterSnapshot,
    id_param: "DBClusterSnapshotIdentifier",
    source_param: "SourceDBClusterSnapshotIdentifier",
    target_param: "TargetDBClusterSnapshotIdentifier",
    parent_param: "DBClusterIdentifier",
    parent_kind: ResourceKind::Cluster,
    parent_not_found: "DBClusterNotFoundFault",
    parent_invalid_state: "InvalidDBClusterStateFault",
    list_key: "DBClusterSnapshots",
    item_key: "DBClusterSnapshot",
    not_found: "DBClusterSnapshotNotFoundFault",
    already_exists: "DBClusterSnapshotAlreadyExistsFault",
    invalid_state: "InvalidDBClusterSnapshotStateFault",
};

const DB_SNAPSHOTS: SnapshotApi = SnapshotApi {
    kind: ResourceKind::DbSnapshot,
    id_param: "DBSnapshotIdentifier",
    source_param: "SourceDBSnapshotIdentifier",
    target_param: "TargetDBSnapshotIdentifier",
    parent_param: "DBInstanceIdentifier",
    parent_kind: ResourceKind::Instance,
    parent_not_found: "DBInstanceNotFound",
    parent_invalid_state: "InvalidDBInstanceState",
    list_key: "DBSnapshots",
    item_key: "DBSnapshot",
    not_found: "DBSnapshotNotFound",
    already_exists: "DBSnapshotAlreadyExists",
    invalid_state: "InvalidDBSnapshotState",
};

fn required<'a>(params: &'a Params, key: &str) -> std::result::Result<&'a str, RemoteError> {
    params
        .get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| RemoteError::new("InvalidParameterValue", format!("missing parameter {}", key)))
}

fn optional<'a>(params: &'a Params, key: &str) -> Option<&'a str> {
    params.get(key).and_then(Value::as_str)
}

fn wrap(key: &str, value: Value) -> Value {
    let mut map = serde_json::Map::new();
    map.insert(key.to_string(), value);
    Value::Object(map)
}

fn fault(code: &str, subject: &str) -> RemoteError {
    RemoteError::new(code, format!("{} ({})", code, subject))
}

// =============================================================================
// Simulated Account
// =============================================================================

/// One account/region of a [`SimulatedWorld`]
#[derive(Debug)]
pub struct SimulatedControlPlane {
    world: Arc<SimulatedWorld>,
    account_id: String,
    region: String,
    label: String,
}

impl SimulatedControlPlane {
    pub fn account_id(&self) -> &str {
        &self.account_id
    }

    pub fn region(&self) -> &str {
        &self.region
    }

    pub fn world(&self) -> &Arc<SimulatedWorld> {
        &self.world
    }

    /// ARN of a resource of this account
    pub fn arn(&self, kind: ResourceKind, id: &str) -> String {
        let partition = partition(&self.region);
        let (service, path) = match kind {
            // bucket names are global
            ResourceKind::Bucket | ResourceKind::Object => return format!("arn:{}:s3:::{}", partition, id),
            ResourceKind::ClusterSnapshot => ("rds", format!("cluster-snapshot:{}", id)),
            ResourceKind::DbSnapshot => ("rds", format!("snapshot:{}", id)),
            ResourceKind::Cluster => ("rds", format!("cluster:{}", id)),
            ResourceKind::Instance => ("rds", format!("db:{}", id)),
            ResourceKind::Task => ("datasync", format!("task/{}", id)),
            ResourceKind::TaskExecution => ("datasync", format!("task-execution/{}", id)),
            ResourceKind::BatchJob => ("s3", format!("job/{}", id)),
            ResourceKind::Key => ("kms", format!("key/{}", id)),
            ResourceKind::Alias => ("kms", id.to_string()),
        };
        format!("arn:{}:{}:{}:{}:{}", partition, service, self.region, self.account_id, path)
    }

    fn resource(&self, kind: ResourceKind, id: &str) -> Resource {
        Resource {
            kind,
            account: self.account_id.clone(),
            id: id.to_string(),
            arn: self.arn(kind, id),
            status: String::new(),
            pending: None,
            parent: None,
            name: None,
            kms_key: None,
            shared_with: BTreeSet::new(),
            source: None,
            details: serde_json::Map::new(),
        }
    }

    /// Place a settled resource in this account
    pub fn seed(&self, kind: ResourceKind, id: &str, status: &str, parent: Option<&str>) {
        let mut resource = self.resource(kind, id);
        resource.status = status.to_string();
        resource.parent = parent.map(str::to_string);
        match kind {
            ResourceKind::Object => {
                resource.details.insert("ETag".into(), json!(etag(id)));
            }
            ResourceKind::Alias => {
                resource.source = parent.map(|key| self.arn(ResourceKind::Key, key));
            }
            _ => {}
        }
        self.world
            .state
            .lock()
            .resources
            .insert(resource.arn.clone(), resource);
    }

    /// Current representation of a resource, without observing it
    pub fn snapshot_of(&self, kind: ResourceKind, id: &str) -> Option<Value> {
        self.world
            .state
            .lock()
            .resources
            .get(&self.arn(kind, id))
            .map(Resource::to_json)
    }

    pub fn status(&self, kind: ResourceKind, id: &str) -> Option<String> {
        self.world
            .state
            .lock()
            .resources
            .get(&self.arn(kind, id))
            .map(|r| r.status.clone())
    }

    /// ARN of `reference` (id or ARN) if this account may read it
    fn visible(&self, state: &WorldState, kind: ResourceKind, reference: &str) -> Option<String> {
        let arn = if reference.starts_with("arn:") {
            reference.to_string()
        } else {
            self.arn(kind, reference)
        };
        let resource = state.resources.get(&arn)?;
        let readable = resource.account == self.account_id || resource.shared_with.contains(&self.account_id);
        (resource.kind == kind && readable).then_some(arn)
    }

    fn owned(&self, state: &WorldState, kind: ResourceKind, id: &str) -> Option<String> {
        let arn = self.arn(kind, id);
        state.resources.contains_key(&arn).then_some(arn)
    }

    fn call(&self, action: &str, params: &Params) -> Reply {
        let mut state = self.world.state.lock();
        state.calls.push(RecordedCall {
            account: self.account_id.clone(),
            action: action.to_string(),
            params: params.clone(),
        });
        if let Some(err) = state.take_fault(&self.account_id, action) {
            debug!(account = %self.account_id, action = %action, code = %err.code, "Injected fault");
            return Err(err);
        }

        let state = &mut *state;
        let reply = match action {
            "CreateDBClusterSnapshot" => self.create_snapshot(state, &CLUSTER_SNAPSHOTS, params),
            "CreateDBSnapshot" => self.create_snapshot(state, &DB_SNAPSHOTS, params),
            "CopyDBClusterSnapshot" => self.copy_snapshot(state, &CLUSTER_SNAPSHOTS, params),
            "CopyDBSnapshot" => self.copy_snapshot(state, &DB_SNAPSHOTS, params),
            "DescribeDBClusterSnapshots" => self.describe_snapshots(state, &CLUSTER_SNAPSHOTS, params),
            "DescribeDBSnapshots" => self.describe_snapshots(state, &DB_SNAPSHOTS, params),
            "DeleteDBClusterSnapshot" => self.delete_snapshot(state, &CLUSTER_SNAPSHOTS, params),
            "DeleteDBSnapshot" => self.delete_snapshot(state, &DB_SNAPSHOTS, params),
            "ModifyDBClusterSnapshotAttribute" => self.modify_attribute(state, &CLUSTER_SNAPSHOTS, params),
            "ModifyDBSnapshotAttribute" => self.modify_attribute(state, &DB_SNAPSHOTS, params),
            "DescribeDBClusters" => self.describe_kind(
                state,
                ResourceKind::Cluster,
                optional(params, "DBClusterIdentifier"),
                "DBClusters",
                "DBClusterNotFoundFault",
            ),
            "DeleteDBCluster" => self.delete_cluster(state, params),
            "RestoreDBClusterFromSnapshot" => self.restore_cluster(state, params),
            "DescribeDBInstances" => self.describe_kind(
                state,
                ResourceKind::Instance,
                optional(params, "DBInstanceIdentifier"),
                "DBInstances",
                "DBInstanceNotFound",
            ),
            "StopDBInstance" => self.stop_instance(state, params),
            "CreateTask" => self.create_task(state, params),
            "StartTaskExecution" => self.start_execution(state, params),
            "DescribeTaskExecution" => self.describe_execution(state, params),
            "DeleteTask" => self.delete_task(state, params),
            "GetBucketVersioning" => self.get_versioning(state, params),
            "PutBucketVersioning" => self.put_versioning(state, params),
            "GetBucketReplication" => self.get_replication(state, params),
            "PutBucketReplication" => self.put_replication(state, params),
            "HeadObject" => self.head_object(state, params),
            "CreateJob" => self.create_job(state, params),
            "DescribeJob" => self.describe_job(state, params),
            "CreateKey" => self.create_key(state, params),
            "DescribeKey" => self.describe_key(state, params),
            "CreateAlias" => self.create_alias(state, params),
            "CreateGrant" => self.create_grant(state, params),
            "ListGrants" => self.list_grants(state, params),
            other => Err(fault("InvalidAction", other)),
        };
        debug!(
            account = %self.account_id,
            action = %action,
            ok = reply.is_ok(),
            "Simulated call"
        );
        reply
    }

    // -------------------------------------------------------------------------
    // Snapshots
    // -------------------------------------------------------------------------

    fn create_snapshot(&self, state: &mut WorldState, api: &SnapshotApi, params: &Params) -> Reply {
        let id = required(params, api.id_param)?;
        let parent = required(params, api.parent_param)?;
        let parent_arn = self
            .owned(state, api.parent_kind, parent)
            .ok_or_else(|| fault(api.parent_not_found, parent))?;
        if let Some(owner) = state.resources.get(&parent_arn) {
            if !matches!(owner.status.as_str(), "available" | "stopped") {
                return Err(fault(api.parent_invalid_state, parent));
            }
        }
        if self.owned(state, api.kind, id).is_some() {
            return Err(fault(api.already_exists, id));
        }

        let mut snapshot = self.resource(api.kind, id);
        snapshot.parent = Some(parent.to_string());
        snapshot.begin("creating", "available", self.world.settle_after);
        let body = snapshot.to_json();
        state.resources.insert(snapshot.arn.clone(), snapshot);
        Ok(wrap(api.item_key, body))
    }

    fn copy_snapshot(&self, state: &mut WorldState, api: &SnapshotApi, params: &Params) -> Reply {
        let source_ref = required(params, api.source_param)?;
        let target = required(params, api.target_param)?;
        let source_arn = self
            .visible(state, api.kind, source_ref)
            .ok_or_else(|| fault(api.not_found, source_ref))?;
        let (parent, owner, kms_key) = match state.resources.get(&source_arn) {
            Some(source) if source.status == "available" => {
                (source.parent.clone(), source.account.clone(), source.kms_key.clone())
            }
            _ => return Err(fault(api.invalid_state, source_ref)),
        };
        // a snapshot from another account needs its key shared too; keys the
        // simulation does not model are assumed usable
        if owner != self.account_id {
            let key = kms_key.as_deref().and_then(|k| find_key(state, &owner, k));
            if let Some(key) = key {
                if key.account != self.account_id && !key.shared_with.contains(&self.account_id) {
                    return Err(fault("KMSKeyNotAccessibleFault", source_ref));
                }
            }
        }
        if self.owned(state, api.kind, target).is_some() {
            return Err(fault(api.already_exists, target));
        }

        let mut copy = self.resource(api.kind, target);
        copy.parent = parent;
        copy.kms_key = optional(params, "KmsKeyId").map(str::to_string);
        copy.source = Some(source_arn);
        copy.begin("creating", "available", self.world.settle_after);
        let body = copy.to_json();
        state.resources.insert(copy.arn.clone(), copy);
        Ok(wrap(api.item_key, body))
    }

    fn describe_snapshots(&self, state: &mut WorldState, api: &SnapshotApi, params: &Params) -> Reply {
        if let Some(id) = optional(params, api.id_param) {
            return self.describe_kind(state, api.kind, Some(id), api.list_key, api.not_found);
        }
        let parent = optional(params, api.parent_param);
        let arns: Vec<String> = state
            .resources
            .values()
            .filter(|r| r.kind == api.kind && r.account == self.account_id)
            .filter(|r| parent.map_or(true, |p| r.parent.as_deref() == Some(p)))
            .map(|r| r.arn.clone())
            .collect();
        Ok(wrap(api.list_key, Value::Array(state.observe(&arns))))
    }

    fn delete_snapshot(&self, state: &mut WorldState, api: &SnapshotApi, params: &Params) -> Reply {
        let id = required(params, api.id_param)?;
        let arn = self
            .owned(state, api.kind, id)
            .ok_or_else(|| fault(api.not_found, id))?;
        let settle_after = self.world.settle_after;
        let body = match state.resources.get_mut(&arn) {
            Some(snapshot) if snapshot.status == "creating" => return Err(fault(api.invalid_state, id)),
            Some(snapshot) => {
                snapshot.begin("deleting", "deleted", settle_after);
                snapshot.to_json()
            }
            None => return Err(fault(api.not_found, id)),
        };
        if settle_after == 0 {
            state.resources.remove(&arn);
        }
        Ok(wrap(api.item_key, body))
    }

    fn modify_attribute(&self, state: &mut WorldState, api: &SnapshotApi, params: &Params) -> Reply {
        let id = required(params, api.id_param)?;
        if required(params, "AttributeName")? != "restore" {
            return Err(fault("InvalidParameterValue", "AttributeName"));
        }
        let arn = self
            .owned(state, api.kind, id)
            .ok_or_else(|| fault(api.not_found, id))?;
        let accounts = |key: &str| -> Vec<String> {
            params
                .get(key)
                .and_then(Value::as_array)
                .map(|values| values.iter().filter_map(Value::as_str).map(str::to_string).collect())
                .unwrap_or_default()
        };
        let (add, remove) = (accounts("ValuesToAdd"), accounts("ValuesToRemove"));

        let snapshot = state
            .resources
            .get_mut(&arn)
            .ok_or_else(|| fault(api.not_found, id))?;
        snapshot.shared_with.extend(add);
        for account in &remove {
            snapshot.shared_with.remove(account);
        }

        let mut result = serde_json::Map::new();
        result.insert(api.id_param.to_string(), json!(id));
        result.insert(
            format!("{}Attributes", api.item_key),
            json!([{"AttributeName": "restore", "AttributeValues": snapshot.shared_with}]),
        );
        Ok(wrap(&format!("{}AttributesResult", api.item_key), Value::Object(result)))
    }

    // -------------------------------------------------------------------------
    // Clusters and Instances
    // -------------------------------------------------------------------------

    /// Describe one resource by id, or every resource of the kind
    fn describe_kind(
        &self,
        state: &mut WorldState,
        kind: ResourceKind,
        id: Option<&str>,
        list_key: &str,
        not_found: &str,
    ) -> Reply {
        let arns = match id {
            Some(id) => vec![self.owned(state, kind, id).ok_or_else(|| fault(not_found, id))?],
            None => state
                .resources
                .values()
                .filter(|r| r.kind == kind && r.account == self.account_id)
                .map(|r| r.arn.clone())
                .collect(),
        };
        Ok(wrap(list_key, Value::Array(state.observe(&arns))))
    }

    fn delete_cluster(&self, state: &mut WorldState, params: &Params) -> Reply {
        let id = required(params, "DBClusterIdentifier")?;
        let arn = self
            .owned(state, ResourceKind::Cluster, id)
            .ok_or_else(|| fault("DBClusterNotFoundFault", id))?;
        let settle_after = self.world.settle_after;
        let body = match state.resources.get_mut(&arn) {
            Some(cluster) if cluster.status == "available" => {
                cluster.begin("deleting", "deleted", settle_after);
                cluster.to_json()
            }
            _ => return Err(fault("InvalidDBClusterStateFault", id)),
        };
        if settle_after == 0 {
            state.resources.remove(&arn);
        }
        Ok(wrap("DBCluster", body))
    }

    fn restore_cluster(&self, state: &mut WorldState, params: &Params) -> Reply {
        let id = required(params, "DBClusterIdentifier")?;
        let snapshot_ref = required(params, "SnapshotIdentifier")?;
        if self.owned(state, ResourceKind::Cluster, id).is_some() {
            return Err(fault("DBClusterAlreadyExistsFault", id));
        }
        let snapshot_arn = self
            .visible(state, ResourceKind::ClusterSnapshot, snapshot_ref)
            .ok_or_else(|| fault("DBClusterSnapshotNotFoundFault", snapshot_ref))?;
        if state.resources.get(&snapshot_arn).map(|s| s.status.as_str()) != Some("available") {
            return Err(fault("InvalidDBClusterSnapshotStateFault", snapshot_ref));
        }

        let mut cluster = self.resource(ResourceKind::Cluster, id);
        cluster.kms_key = optional(params, "KmsKeyId").map(str::to_string);
        cluster.source = Some(snapshot_arn);
        cluster.begin("creating", "available", self.world.settle_after);
        let body = cluster.to_json();
        state.resources.insert(cluster.arn.clone(), cluster);
        Ok(wrap("DBCluster", body))
    }

    fn stop_instance(&self, state: &mut WorldState, params: &Params) -> Reply {
        let id = required(params, "DBInstanceIdentifier")?;
        let arn = self
            .owned(state, ResourceKind::Instance, id)
            .ok_or_else(|| fault("DBInstanceNotFound", id))?;
        let settle_after = self.world.settle_after;
        match state.resources.get_mut(&arn) {
            Some(instance) if instance.status == "available" => {
                instance.begin("stopping", "stopped", settle_after);
                Ok(wrap("DBInstance", instance.to_json()))
            }
            _ => Err(fault("InvalidDBInstanceState", id)),
        }
    }

    // -------------------------------------------------------------------------
    // DataSync
    // -------------------------------------------------------------------------

    fn task_arn<'p>(&self, state: &WorldState, params: &'p Params) -> std::result::Result<&'p str, RemoteError> {
        let task_arn = required(params, "TaskArn")?;
        match state.resources.get(task_arn) {
            Some(task) if task.kind == ResourceKind::Task && task.account == self.account_id => Ok(task_arn),
            _ => Err(fault("InvalidRequestException", task_arn)),
        }
    }

    fn create_task(&self, state: &mut WorldState, params: &Params) -> Reply {
        let name = required(params, "Name")?;
        required(params, "SourceLocationArn")?;
        required(params, "DestinationLocationArn")?;

        let id = state.next_id("task");
        let mut task = self.resource(ResourceKind::Task, &id);
        task.name = Some(name.to_string());
        task.status = "AVAILABLE".to_string();
        let arn = task.arn.clone();
        state.resources.insert(arn.clone(), task);
        Ok(json!({ "TaskArn": arn }))
    }

    fn start_execution(&self, state: &mut WorldState, params: &Params) -> Reply {
        let task_arn = self.task_arn(state, params)?;
        let id = state.next_id("exec");
        let outcome = if state.failing_executions > 0 {
            state.failing_executions -= 1;
            "ERROR"
        } else {
            "SUCCESS"
        };

        let mut execution = self.resource(ResourceKind::TaskExecution, &id);
        execution.arn = format!("{}/execution/{}", task_arn, id);
        execution.parent = Some(task_arn.to_string());
        execution.begin("LAUNCHING", outcome, self.world.settle_after);
        let arn = execution.arn.clone();
        state.resources.insert(arn.clone(), execution);
        Ok(json!({ "TaskExecutionArn": arn }))
    }

    fn describe_execution(&self, state: &mut WorldState, params: &Params) -> Reply {
        let arn = required(params, "TaskExecutionArn")?;
        match state.resources.get_mut(arn) {
            Some(execution) if execution.kind == ResourceKind::TaskExecution => {
                execution.observe();
                Ok(execution.to_json())
            }
            _ => Err(fault("InvalidRequestException", arn)),
        }
    }

    fn delete_task(&self, state: &mut WorldState, params: &Params) -> Reply {
        let task_arn = self.task_arn(state, params)?.to_string();
        state.resources.remove(&task_arn);
        Ok(json!({}))
    }

    // -------------------------------------------------------------------------
    // S3
    // -------------------------------------------------------------------------

    fn bucket_arn(&self, state: &WorldState, name: &str) -> std::result::Result<String, RemoteError> {
        let arn = self.arn(ResourceKind::Bucket, name);
        match state.resources.get(&arn) {
            Some(bucket) if bucket.kind == ResourceKind::Bucket && bucket.account == self.account_id => Ok(arn),
            _ => Err(fault("NoSuchBucket", name)),
        }
    }

    fn get_versioning(&self, state: &mut WorldState, params: &Params) -> Reply {
        let arn = self.bucket_arn(state, required(params, "Bucket")?)?;
        match state.resources.get(&arn) {
            Some(bucket) if !bucket.status.is_empty() => Ok(json!({ "Status": bucket.status })),
            _ => Ok(json!({})),
        }
    }

    fn put_versioning(&self, state: &mut WorldState, params: &Params) -> Reply {
        let name = required(params, "Bucket")?;
        let arn = self.bucket_arn(state, name)?;
        let status = params
            .get("VersioningConfiguration")
            .and_then(|c| c.get("Status"))
            .and_then(Value::as_str)
            .filter(|s| matches!(*s, "Enabled" | "Suspended"))
            .ok_or_else(|| fault("MalformedXML", name))?;
        if let Some(bucket) = state.resources.get_mut(&arn) {
            bucket.status = status.to_string();
        }
        Ok(json!({}))
    }

    fn get_replication(&self, state: &mut WorldState, params: &Params) -> Reply {
        let name = required(params, "Bucket")?;
        let arn = self.bucket_arn(state, name)?;
        state
            .resources
            .get(&arn)
            .and_then(|bucket| bucket.details.get("ReplicationConfiguration"))
            .map(|config| json!({ "ReplicationConfiguration": config }))
            .ok_or_else(|| fault("ReplicationConfigurationNotFoundError", name))
    }

    fn put_replication(&self, state: &mut WorldState, params: &Params) -> Reply {
        let name = required(params, "Bucket")?;
        let arn = self.bucket_arn(state, name)?;
        let config = params
            .get("ReplicationConfiguration")
            .filter(|c| c.get("Role").and_then(Value::as_str).is_some())
            .cloned()
            .ok_or_else(|| fault("MalformedXML", name))?;
        if state.resources.get(&arn).map(|b| b.status.as_str()) != Some("Enabled") {
            return Err(fault("InvalidRequest", "source bucket versioning is not enabled"));
        }
        let destinations: Vec<&str> = config["Rules"]
            .as_array()
            .map(|rules| {
                rules
                    .iter()
                    .filter_map(|rule| rule["Destination"]["Bucket"].as_str())
                    .collect()
            })
            .unwrap_or_default();
        if destinations.is_empty() {
            return Err(fault("MalformedXML", name));
        }
        for destination in destinations {
            match state.resources.get(destination) {
                Some(bucket) if bucket.kind == ResourceKind::Bucket && bucket.status == "Enabled" => {}
                Some(_) => return Err(fault("InvalidRequest", "destination bucket versioning is not enabled")),
                None => return Err(fault("InvalidRequest", destination)),
            }
        }
        if let Some(bucket) = state.resources.get_mut(&arn) {
            bucket.details.insert("ReplicationConfiguration".into(), config);
        }
        Ok(json!({}))
    }

    fn head_object(&self, state: &mut WorldState, params: &Params) -> Reply {
        let bucket = required(params, "Bucket")?;
        let key = required(params, "Key")?;
        self.bucket_arn(state, bucket)?;
        let id = format!("{}/{}", bucket, key);
        state
            .resources
            .get(&self.arn(ResourceKind::Object, &id))
            .map(|object| json!({ "ETag": object.details.get("ETag"), "ContentLength": 1024 }))
            .ok_or_else(|| fault("NotFound", &id))
    }

    fn check_account(&self, params: &Params) -> std::result::Result<(), RemoteError> {
        let account = required(params, "AccountId")?;
        if account != self.account_id {
            return Err(fault("AccessDenied", account));
        }
        Ok(())
    }

    fn create_job(&self, state: &mut WorldState, params: &Params) -> Reply {
        self.check_account(params)?;
        let token = required(params, "ClientRequestToken")?;
        required(params, "RoleArn")?;
        if let Some(existing) = state
            .resources
            .values()
            .find(|r| r.kind == ResourceKind::BatchJob && r.account == self.account_id && r.name.as_deref() == Some(token))
        {
            return Ok(json!({ "JobId": existing.id }));
        }

        let manifest = params.get("Manifest").cloned().unwrap_or_default();
        let location = &manifest["Location"];
        let object_arn = location["ObjectArn"].as_str().unwrap_or_default();
        match state.resources.get(object_arn) {
            Some(object) if object.kind == ResourceKind::Object && object.details.get("ETag") == location.get("ETag") => {}
            Some(_) => return Err(fault("InvalidRequest", "manifest ETag does not match")),
            None => return Err(fault("InvalidRequest", object_arn)),
        }

        let id = state.next_id("job");
        let outcome = if state.failing_jobs > 0 {
            state.failing_jobs -= 1;
            "Failed"
        } else {
            "Complete"
        };
        let mut job = self.resource(ResourceKind::BatchJob, &id);
        job.name = Some(token.to_string());
        if let Some(priority) = params.get("Priority") {
            job.details.insert("Priority".into(), priority.clone());
        }
        job.begin("Active", outcome, self.world.settle_after);
        state.resources.insert(job.arn.clone(), job);
        Ok(json!({ "JobId": id }))
    }

    fn describe_job(&self, state: &mut WorldState, params: &Params) -> Reply {
        self.check_account(params)?;
        let id = required(params, "JobId")?;
        let arn = self
            .owned(state, ResourceKind::BatchJob, id)
            .ok_or_else(|| fault("NotFoundException", id))?;
        let job = state.observe(&[arn]).pop().ok_or_else(|| fault("NotFoundException", id))?;
        Ok(json!({ "Job": job }))
    }

    // -------------------------------------------------------------------------
    // KMS
    // -------------------------------------------------------------------------

    /// ARN of a key this account may use
    fn usable_key(&self, state: &WorldState, reference: &str) -> std::result::Result<String, RemoteError> {
        match find_key(state, &self.account_id, reference) {
            Some(key) if key.account == self.account_id || key.shared_with.contains(&self.account_id) => {
                Ok(key.arn.clone())
            }
            _ => Err(fault("NotFoundException", reference)),
        }
    }

    fn create_key(&self, state: &mut WorldState, params: &Params) -> Reply {
        if let Some(usage) = optional(params, "KeyUsage") {
            if usage != "ENCRYPT_DECRYPT" {
                return Err(fault("UnsupportedOperationException", usage));
            }
        }
        let id = state.next_id("key");
        let mut key = self.resource(ResourceKind::Key, &id);
        key.name = optional(params, "Description").map(str::to_string);
        key.status = "Enabled".to_string();
        let body = key.to_json();
        state.resources.insert(key.arn.clone(), key);
        Ok(json!({ "KeyMetadata": body }))
    }

    fn describe_key(&self, state: &mut WorldState, params: &Params) -> Reply {
        let arn = self.usable_key(state, required(params, "KeyId")?)?;
        let key = state.resources.get(&arn).map(Resource::to_json);
        Ok(json!({ "KeyMetadata": key }))
    }

    fn create_alias(&self, state: &mut WorldState, params: &Params) -> Reply {
        let name = required(params, "AliasName")?;
        if !name.starts_with("alias/") || name.starts_with("alias/aws/") {
            return Err(fault("ValidationException", name));
        }
        if self.owned(state, ResourceKind::Alias, name).is_some() {
            return Err(fault("AlreadyExistsException", name));
        }
        let key_arn = self.usable_key(state, required(params, "TargetKeyId")?)?;
        let key_id = match state.resources.get(&key_arn) {
            Some(key) if key.account == self.account_id => key.id.clone(),
            _ => return Err(fault("NotFoundException", &key_arn)),
        };

        let mut alias = self.resource(ResourceKind::Alias, name);
        alias.parent = Some(key_id);
        alias.source = Some(key_arn);
        state.resources.insert(alias.arn.clone(), alias);
        Ok(json!({}))
    }

    fn create_grant(&self, state: &mut WorldState, params: &Params) -> Reply {
        let reference = required(params, "KeyId")?;
        let grantee = required(params, "GranteePrincipal")?;
        let grantee_account = arn_account(grantee)
            .ok_or_else(|| fault("InvalidArnException", grantee))?
            .to_string();
        let name = optional(params, "Name");
        let arn = self.usable_key(state, reference)?;

        let grant_id = state.next_id("grant");
        let key = state
            .resources
            .get_mut(&arn)
            .filter(|key| key.account == self.account_id)
            .ok_or_else(|| fault("NotFoundException", reference))?;
        let grants = key
            .details
            .entry("Grants")
            .or_insert_with(|| json!([]));
        let existing = grants.as_array().and_then(|grants| {
            grants.iter().find(|g| {
                name.is_some() && g["Name"].as_str() == name && g["GranteePrincipal"].as_str() == Some(grantee)
            })
        });
        if let Some(grant) = existing {
            return Ok(json!({ "GrantId": grant["GrantId"] }));
        }
        if let Some(grants) = grants.as_array_mut() {
            grants.push(json!({
                "GrantId": grant_id,
                "KeyId": arn,
                "Name": name,
                "GranteePrincipal": grantee,
                "Operations": params.get("Operations"),
            }));
        }
        key.shared_with.insert(grantee_account);
        Ok(json!({ "GrantId": grant_id }))
    }

    fn list_grants(&self, state: &mut WorldState, params: &Params) -> Reply {
        let reference = required(params, "KeyId")?;
        let arn = self.usable_key(state, reference)?;
        let grants = state
            .resources
            .get(&arn)
            .and_then(|key| key.details.get("Grants"))
            .cloned()
            .unwrap_or_else(|| json!([]));
        Ok(json!({ "Grants": grants, "Truncated": false }))
    }
}

#[async_trait]
impl ControlPlaneClient for SimulatedControlPlane {
    async fn invoke(&self, action: &str, params: &Params) -> Reply {
        self.call(action, params)
    }

    async fn describe(&self, resource_id: &ResourceId) -> Reply {
        let mut state = self.world.state.lock();
        let reference = resource_id.as_str();
        let arn = if reference.starts_with("arn:") {
            Some(reference.to_string())
        } else {
            state
                .resources
                .values()
                .find(|r| r.account == self.account_id && r.id == reference)
                .map(|r| r.arn.clone())
        };
        let arn = arn.ok_or_else(|| fault("ResourceNotFoundException", reference))?;
        state
            .observe(std::slice::from_ref(&arn))
            .pop()
            .ok_or_else(|| fault("ResourceNotFoundException", reference))
    }

    fn label(&self) -> &str {
        &self.label
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::ports::{Identifiers, ResourceId};
    use crate::migration::orchestrator::{MigrationOrchestrator, OrchestratorConfig};
    use crate::migration::plans::{
        AccountProfile, BatchReplication, ClusterRefreshPlan, DataSyncPlan, InstanceSnapshotPlan,
        PlanRequest, S3ReplicationPlan,
    };
    use crate::migration::state::{PipelineRunState, RunStatus, StageStatus};
    use crate::migration::store::{MemoryRunStore, RunStateStore};
    use crate::observability::{MemoryEventSink, MigrationEvent, SkipReason};
    use assert_matches::assert_matches;
    use tokio_util::sync::CancellationToken;

    const SOURCE: &str = "111111111111";
    const DESTINATION: &str = "222222222222";

    fn params(value: Value) -> Params {
        match value {
            Value::Object(map) => map,
            _ => Params::new(),
        }
    }

    fn profile() -> EnvironmentProfile {
        EnvironmentProfile::new(
            "staging",
            AccountProfile::new(SOURCE, "us-east-1").with_kms_key("alias/alpha-share"),
            AccountProfile::new(DESTINATION, "us-east-1").with_kms_key("alias/staging"),
        )
    }

    #[tokio::test]
    async fn test_snapshot_settles_after_observations() {
        let world = SimulatedWorld::new(2);
        let source = world.account(SOURCE, "us-east-1");
        source.seed(ResourceKind::Cluster, "alpha-events", "available", None);

        let created = source
            .invoke(
                "CreateDBClusterSnapshot",
                &params(json!({"DBClusterSnapshotIdentifier": "snap-1", "DBClusterIdentifier": "alpha-events"})),
            )
            .await
            .unwrap();
        assert_eq!(created["DBClusterSnapshot"]["Status"], "creating");

        let describe = params(json!({"DBClusterSnapshotIdentifier": "snap-1"}));
        let first = source.invoke("DescribeDBClusterSnapshots", &describe).await.unwrap();
        assert_eq!(first["DBClusterSnapshots"][0]["Status"], "creating");
        let second = source.invoke("DescribeDBClusterSnapshots", &describe).await.unwrap();
        assert_eq!(second["DBClusterSnapshots"][0]["Status"], "available");

        let duplicate = source
            .invoke(
                "CreateDBClusterSnapshot",
                &params(json!({"DBClusterSnapshotIdentifier": "snap-1", "DBClusterIdentifier": "alpha-events"})),
            )
            .await
            .unwrap_err();
        assert_eq!(duplicate.code, "DBClusterSnapshotAlreadyExistsFault");
    }

    #[tokio::test]
    async fn test_unshared_snapshot_is_invisible_to_destination() {
        let world = SimulatedWorld::new(0);
        let source = world.account(SOURCE, "us-east-1");
        let destination = world.account(DESTINATION, "us-east-1");
        source.seed(ResourceKind::ClusterSnapshot, "snap-1", "available", Some("alpha-events"));
        let arn = source.arn(ResourceKind::ClusterSnapshot, "snap-1");

        let copy = params(json!({
            "SourceDBClusterSnapshotIdentifier": arn,
            "TargetDBClusterSnapshotIdentifier": "snap-1",
        }));
        let err = destination.invoke("CopyDBClusterSnapshot", &copy).await.unwrap_err();
        assert!(err.is_not_found());

        source
            .invoke(
                "ModifyDBClusterSnapshotAttribute",
                &params(json!({
                    "DBClusterSnapshotIdentifier": "snap-1",
                    "AttributeName": "restore",
                    "ValuesToAdd": [DESTINATION],
                })),
            )
            .await
            .unwrap();
        destination.invoke("CopyDBClusterSnapshot", &copy).await.unwrap();
        assert_eq!(
            destination.status(ResourceKind::ClusterSnapshot, "snap-1").as_deref(),
            Some("available")
        );
    }

    #[tokio::test]
    async fn test_faults_and_call_log() {
        let world = SimulatedWorld::new(1);
        let source = world.account(SOURCE, "us-east-1");
        world.inject_error("DescribeDBClusters", "ThrottlingException", 1);

        let err = source.invoke("DescribeDBClusters", &Params::new()).await.unwrap_err();
        assert!(err.is_throttling());
        let ok = source.invoke("DescribeDBClusters", &Params::new()).await.unwrap();
        assert_eq!(ok["DBClusters"], json!([]));

        assert_eq!(world.count("DescribeDBClusters"), 2);
        assert_eq!(world.calls()[0].account, SOURCE);
        assert_eq!(
            source.invoke("Nope", &Params::new()).await.unwrap_err().code,
            "InvalidAction"
        );
    }

    fn orchestrator(clients: ClientSet, events: Arc<MemoryEventSink>) -> (MigrationOrchestrator, Arc<MemoryRunStore>) {
        let store = Arc::new(MemoryRunStore::new());
        let orchestrator = MigrationOrchestrator::new(
            OrchestratorConfig::default(),
            Arc::new(clients),
            store.clone(),
            events,
        );
        (orchestrator, store)
    }

    fn refresh_simulation() -> SimulationConfig {
        SimulationConfig {
            settle_after: 1,
            source: vec![
                SeedResource {
                    kind: ResourceKind::Cluster,
                    id: "alpha-events".into(),
                    status: "available".into(),
                    parent: None,
                },
                SeedResource {
                    kind: ResourceKind::ClusterSnapshot,
                    id: "alpha-events-snapshot-old".into(),
                    status: "available".into(),
                    parent: Some("alpha-events".into()),
                },
            ],
            destination: vec![SeedResource {
                kind: ResourceKind::Cluster,
                id: "staging-events".into(),
                status: "available".into(),
                parent: None,
            }],
            ..Default::default()
        }
    }

    fn refresh_plan() -> PlanRequest {
        PlanRequest::ClusterRefresh(ClusterRefreshPlan {
            key: "events-20261015".into(),
            source_cluster: "alpha-events".into(),
            target_cluster: "staging-events".into(),
            cleanup_prefix: Some("alpha-events-snapshot-".into()),
            restore: params(json!({"Engine": "aurora-postgresql"})),
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_cluster_refresh_end_to_end() {
        let profile = profile();
        let (world, clients) = refresh_simulation().build(&profile);
        let pipeline = refresh_plan().build("refresh-staging", &profile).unwrap();
        let (orchestrator, _) = orchestrator(clients, MemoryEventSink::new());

        let state = orchestrator
            .start(&pipeline, "refresh-1", Identifiers::new(), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(state.status, RunStatus::Succeeded);

        let source = world.account(SOURCE, "us-east-1");
        let destination = world.account(DESTINATION, "us-east-1");
        assert!(source.status(ResourceKind::ClusterSnapshot, "alpha-events-snapshot-old").is_none());
        assert!(source.status(ResourceKind::ClusterSnapshot, "events-20261015").is_none());
        assert!(source.status(ResourceKind::ClusterSnapshot, "events-20261015-copy").is_none());

        let restored = destination.snapshot_of(ResourceKind::Cluster, "staging-events").unwrap();
        assert_eq!(restored["Status"], "available");
        assert_eq!(
            restored["SnapshotIdentifier"],
            json!(destination.arn(ResourceKind::ClusterSnapshot, "events-20261015-copy"))
        );
        assert_eq!(restored["KmsKeyId"], "alias/staging");
        assert_eq!(
            state.record("copy-to-destination").unwrap().outputs["destination_snapshot"],
            ResourceId::new("events-20261015-copy")
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_cluster_refresh_resumes_after_restore_failure() {
        let profile = profile();
        let mut simulation = refresh_simulation();
        simulation.faults.push(FaultSpec {
            action: "RestoreDBClusterFromSnapshot".into(),
            code: "InsufficientDBClusterCapacityFault".into(),
            times: 1,
            context: None,
        });
        let (world, clients) = simulation.build(&profile);
        let pipeline = refresh_plan().build("refresh-staging", &profile).unwrap();
        let (orchestrator, store) = orchestrator(clients, MemoryEventSink::new());

        let err = orchestrator
            .start(&pipeline, "refresh-2", Identifiers::new(), CancellationToken::new())
            .await
            .unwrap_err();
        assert_matches!(&err, crate::error::Error::RunAborted { stage, .. } if stage == "restore-cluster");
        let stored = store.load("refresh-2").await.unwrap().unwrap();
        assert_eq!(stored.record("delete-target-cluster").unwrap().status, StageStatus::Succeeded);

        let state = orchestrator
            .resume(&pipeline, "refresh-2", CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(state.status, RunStatus::Succeeded);
        assert_eq!(world.count("CreateDBClusterSnapshot"), 1);
        assert_eq!(world.count("DeleteDBCluster"), 1);
        assert_eq!(world.count("RestoreDBClusterFromSnapshot"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_interrupted_stage_is_not_resubmitted() {
        let profile = profile();
        let (world, clients) = refresh_simulation().build(&profile);
        let pipeline = refresh_plan().build("refresh-staging", &profile).unwrap();
        let events = MemoryEventSink::new();
        let (orchestrator, store) = orchestrator(clients, events.clone());

        // the snapshot was submitted but the process died before recording it
        let source = world.account(SOURCE, "us-east-1");
        source.seed(ResourceKind::ClusterSnapshot, "events-20261015", "available", Some("alpha-events"));
        let mut state = PipelineRunState::new("refresh-3", &pipeline, Identifiers::new());
        state.mark_succeeded("delete-old-snapshots", Identifiers::new()).unwrap();
        state.mark_running("create-snapshot").unwrap();
        store.save(&state).await.unwrap();

        let state = orchestrator
            .resume(&pipeline, "refresh-3", CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(state.status, RunStatus::Succeeded);
        assert_eq!(world.count("CreateDBClusterSnapshot"), 0);
        assert_eq!(
            state.record("create-snapshot").unwrap().outputs["snapshot_arn"],
            ResourceId::new(source.arn(ResourceKind::ClusterSnapshot, "events-20261015"))
        );
        assert_eq!(
            events.count(|e| matches!(
                e,
                MigrationEvent::StageSkipped { reason: SkipReason::PrecheckSatisfied, stage, .. }
                    if stage == "create-snapshot"
            )),
            1
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_instance_snapshot_end_to_end() {
        let profile = profile();
        let simulation = SimulationConfig {
            settle_after: 2,
            source: vec![SeedResource {
                kind: ResourceKind::Instance,
                id: "reports-db".into(),
                status: "available".into(),
                parent: None,
            }],
            ..Default::default()
        };
        let (world, clients) = simulation.build(&profile);
        let pipeline = PlanRequest::InstanceSnapshot(InstanceSnapshotPlan {
            key: "reports-20261015".into(),
            instance: "reports-db".into(),
            stop_instance: true,
            destination_key_alias: None,
            grant_source_key: false,
        })
        .build("reports", &profile)
        .unwrap();
        let (orchestrator, _) = orchestrator(clients, MemoryEventSink::new());

        let state = orchestrator
            .start(&pipeline, "reports-1", Identifiers::new(), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(state.status, RunStatus::Succeeded);

        let source = world.account(SOURCE, "us-east-1");
        let destination = world.account(DESTINATION, "us-east-1");
        assert_eq!(source.status(ResourceKind::Instance, "reports-db").as_deref(), Some("stopped"));
        let copied = destination.snapshot_of(ResourceKind::DbSnapshot, "reports-20261015").unwrap();
        assert_eq!(copied["Status"], "available");
        assert_eq!(copied["KmsKeyId"], "alias/staging");
        assert_eq!(
            copied["SourceDBSnapshotIdentifier"],
            json!(source.arn(ResourceKind::DbSnapshot, "reports-20261015-shared"))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_datasync_execution_is_resubmitted_after_error() {
        let profile = profile();
        let simulation = SimulationConfig {
            settle_after: 3,
            failing_executions: 1,
            ..Default::default()
        };
        let (world, clients) = simulation.build(&profile);
        let pipeline = PlanRequest::DatasyncCopy(DataSyncPlan {
            key: "media-archive".into(),
            source_location_arn: "arn:aws:datasync:us-east-1:111111111111:location/loc-src".into(),
            destination_location_arn: "arn:aws:datasync:us-east-1:111111111111:location/loc-dst".into(),
            preserve_deleted_files: false,
            execution_attempts: 5,
        })
        .build("media", &profile)
        .unwrap();
        let (orchestrator, _) = orchestrator(clients, MemoryEventSink::new());

        let state = orchestrator
            .start(&pipeline, "media-1", Identifiers::new(), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(state.status, RunStatus::Succeeded);
        assert_eq!(world.count("CreateTask"), 1);
        assert_eq!(world.count("StartTaskExecution"), 2);
        assert_eq!(world.count("DeleteTask"), 1);
        assert!(state.record("run-task").unwrap().outputs["execution_arn"]
            .as_str()
            .contains("/execution/"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_share_not_yet_visible_is_retried() {
        let profile = profile();
        let mut simulation = refresh_simulation();
        simulation.faults.push(FaultSpec {
            action: "CopyDBClusterSnapshot".into(),
            code: "DBClusterSnapshotNotFoundFault".into(),
            times: 1,
            context: Some(ExecutionContext::Destination),
        });
        let (world, clients) = simulation.build(&profile);
        let pipeline = refresh_plan().build("refresh-staging", &profile).unwrap();
        let (orchestrator, _) = orchestrator(clients, MemoryEventSink::new());

        let state = orchestrator
            .start(&pipeline, "refresh-4", Identifiers::new(), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(state.status, RunStatus::Succeeded);

        let copies: Vec<_> = world
            .calls()
            .into_iter()
            .filter(|c| c.action == "CopyDBClusterSnapshot")
            .map(|c| c.account)
            .collect();
        assert_eq!(copies, vec![SOURCE, DESTINATION, DESTINATION]);
    }

    fn keyed_instance_simulation() -> SimulationConfig {
        SimulationConfig {
            settle_after: 1,
            source: vec![
                SeedResource::new(ResourceKind::Instance, "reports-db", "available"),
                SeedResource::new(ResourceKind::Key, "key-alpha", "Enabled"),
                SeedResource::new(ResourceKind::Alias, "alias/alpha-share", "").with_parent("key-alpha"),
            ],
            ..Default::default()
        }
    }

    fn keyed_instance_plan(grant_source_key: bool) -> PlanRequest {
        PlanRequest::InstanceSnapshot(InstanceSnapshotPlan {
            key: "reports-20261015".into(),
            instance: "reports-db".into(),
            stop_instance: false,
            destination_key_alias: Some("alias/reports-staging".into()),
            grant_source_key,
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_instance_snapshot_with_provisioned_keys() {
        let profile = profile();
        let (world, clients) = keyed_instance_simulation().build(&profile);
        let pipeline = keyed_instance_plan(true).build("reports", &profile).unwrap();
        let (orchestrator, _) = orchestrator(clients, MemoryEventSink::new());

        let state = orchestrator
            .start(&pipeline, "reports-2", Identifiers::new(), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(state.status, RunStatus::Succeeded);

        let destination = world.account(DESTINATION, "us-east-1");
        let key_arn = state.record("create-destination-key").unwrap().outputs["destination_key"].clone();
        assert!(key_arn.as_str().starts_with("arn:aws:kms:us-east-1:222222222222:key/"));
        let copied = destination.snapshot_of(ResourceKind::DbSnapshot, "reports-20261015").unwrap();
        assert_eq!(copied["KmsKeyId"], json!(key_arn.as_str()));

        let alias = destination.invoke("DescribeKey", &params(json!({"KeyId": "alias/reports-staging"}))).await.unwrap();
        assert_eq!(alias["KeyMetadata"]["Arn"], json!(key_arn.as_str()));

        // a second run finds every key, grant and snapshot in place
        let again = orchestrator
            .start(&pipeline, "reports-3", Identifiers::new(), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(again.status, RunStatus::Succeeded);
        assert_eq!(world.count("CreateKey"), 1);
        assert_eq!(world.count("CreateAlias"), 1);
        assert_eq!(world.count("CreateGrant"), 1);
        assert_eq!(
            again.record("create-destination-key").unwrap().outputs["destination_key"],
            key_arn
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_copy_without_source_key_grant_is_refused() {
        let profile = profile();
        let (world, clients) = keyed_instance_simulation().build(&profile);
        let pipeline = keyed_instance_plan(false).build("reports", &profile).unwrap();
        let (orchestrator, _) = orchestrator(clients, MemoryEventSink::new());

        let err = orchestrator
            .start(&pipeline, "reports-4", Identifiers::new(), CancellationToken::new())
            .await
            .unwrap_err();
        assert_matches!(&err, crate::error::Error::RunAborted { stage, .. } if stage == "copy-to-destination");
        assert_eq!(err.remote_code(), Some("KMSKeyNotAccessibleFault"));
        assert_eq!(world.count("CopyDBSnapshot"), 2);
    }

    fn replication_simulation() -> SimulationConfig {
        SimulationConfig {
            settle_after: 2,
            source: vec![
                SeedResource::new(ResourceKind::Bucket, "alpha-media", ""),
                SeedResource::new(ResourceKind::Bucket, "alpha-inventory", "Enabled"),
                SeedResource::new(ResourceKind::Object, "alpha-inventory/alpha-media/manifest.json", "available"),
            ],
            destination: vec![SeedResource::new(ResourceKind::Bucket, "staging-media", "Suspended")],
            ..Default::default()
        }
    }

    fn replication_plan() -> PlanRequest {
        PlanRequest::S3Replication(S3ReplicationPlan {
            key: "media-replication".into(),
            source_bucket: "alpha-media".into(),
            destination_bucket: "staging-media".into(),
            replication_role_arn: "arn:aws:iam::111111111111:role/s3-replication".into(),
            prefix: String::new(),
            existing_objects: Some(BatchReplication {
                manifest_bucket: "alpha-inventory".into(),
                manifest_key: "alpha-media/manifest.json".into(),
                role_arn: None,
                report_bucket: None,
                priority: 10,
            }),
        })
    }

    #[tokio::test(start_paused = true)]
    async fn test_s3_replication_end_to_end() {
        let profile = profile();
        let (world, clients) = replication_simulation().build(&profile);
        let pipeline = replication_plan().build("media", &profile).unwrap();
        let (orchestrator, _) = orchestrator(clients, MemoryEventSink::new());

        let state = orchestrator
            .start(&pipeline, "media-1", Identifiers::new(), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(state.status, RunStatus::Succeeded);

        let source = world.account(SOURCE, "us-east-1");
        let destination = world.account(DESTINATION, "us-east-1");
        assert_eq!(source.status(ResourceKind::Bucket, "alpha-media").as_deref(), Some("Enabled"));
        assert_eq!(destination.status(ResourceKind::Bucket, "staging-media").as_deref(), Some("Enabled"));
        let replication = source
            .invoke("GetBucketReplication", &params(json!({"Bucket": "alpha-media"})))
            .await
            .unwrap();
        assert_eq!(replication["ReplicationConfiguration"]["Rules"][0]["ID"], "media-replication");

        let job_id = state.record("replicate-existing-objects").unwrap().outputs["job_id"].clone();
        assert_eq!(source.status(ResourceKind::BatchJob, job_id.as_str()).as_deref(), Some("Complete"));
        let create = world.calls().into_iter().find(|c| c.action == "CreateJob").unwrap();
        assert_eq!(
            create.params["Manifest"]["Location"]["ETag"],
            json!(etag("alpha-inventory/alpha-media/manifest.json"))
        );

        // rerunning reuses the job submitted under the same request token
        let again = orchestrator
            .start(&pipeline, "media-2", Identifiers::new(), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(again.record("replicate-existing-objects").unwrap().outputs["job_id"], job_id);
        assert_eq!(world.count("PutBucketVersioning"), 2);
        assert_eq!(world.count("PutBucketReplication"), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_batch_job_aborts_run() {
        let profile = profile();
        let simulation = SimulationConfig {
            failing_jobs: 1,
            ..replication_simulation()
        };
        let (_, clients) = simulation.build(&profile);
        let pipeline = replication_plan().build("media", &profile).unwrap();
        let (orchestrator, _) = orchestrator(clients, MemoryEventSink::new());

        let err = orchestrator
            .start(&pipeline, "media-3", Identifiers::new(), CancellationToken::new())
            .await
            .unwrap_err();
        assert_matches!(&err, crate::error::Error::RunAborted { stage, .. } if stage == "replicate-existing-objects");
    }

    #[tokio::test]
    async fn test_replication_requires_versioned_buckets() {
        let world = SimulatedWorld::new(0);
        let source = world.account(SOURCE, "us-east-1");
        let destination = world.account(DESTINATION, "us-east-1");
        source.seed(ResourceKind::Bucket, "alpha-media", "Enabled", None);
        destination.seed(ResourceKind::Bucket, "staging-media", "", None);

        let put = params(json!({
            "Bucket": "alpha-media",
            "ReplicationConfiguration": {
                "Role": "arn:aws:iam::111111111111:role/s3-replication",
                "Rules": [{"ID": "r1", "Destination": {"Bucket": "arn:aws:s3:::staging-media"}}],
            },
        }));
        let err = source.invoke("PutBucketReplication", &put).await.unwrap_err();
        assert_eq!(err.code, "InvalidRequest");
        let err = source
            .invoke("GetBucketReplication", &params(json!({"Bucket": "alpha-media"})))
            .await
            .unwrap_err();
        assert_eq!(err.code, "ReplicationConfigurationNotFoundError");

        // buckets belong to one account
        let err = destination
            .invoke("GetBucketVersioning", &params(json!({"Bucket": "alpha-media"})))
            .await
            .unwrap_err();
        assert_eq!(err.code, "NoSuchBucket");
    }
}
