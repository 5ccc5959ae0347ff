//! Operation Descriptors
//!
//! An operation descriptor names the query a waiter issues against the
//! control plane and, optionally, the default path its rules read. Request
//! parameters may reference identifiers produced by earlier stages; they are
//! resolved against [`Bindings`] right before the query is issued.

use crate::domain::ports::{ControlPlaneClientRef, Identifiers, Params, RemoteError, ResourceId};
use crate::error::{Error, Result};
use crate::waiter::path::ExtractPath;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

// =============================================================================
// Parameter Values
// =============================================================================

/// Reference to a value known only at run time
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "$ref", rename_all = "snake_case")]
pub enum Reference {
    /// Identifier produced by an earlier stage (or supplied as run input)
    Input { name: String },
    /// The stage's idempotency key
    IdempotencyKey,
    /// Current batch item
    Item,
}

/// A request parameter: a literal JSON value, a run-time reference, or an
/// object whose fields may themselves hold references
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Ref(Reference),
    Nested(BTreeMap<String, ParamValue>),
    Literal(Value),
}

impl ParamValue {
    pub fn input(name: impl Into<String>) -> Self {
        ParamValue::Ref(Reference::Input { name: name.into() })
    }

    pub fn key() -> Self {
        ParamValue::Ref(Reference::IdempotencyKey)
    }

    pub fn item() -> Self {
        ParamValue::Ref(Reference::Item)
    }

    pub fn literal(value: impl Into<Value>) -> Self {
        ParamValue::Literal(value.into())
    }

    pub fn nested<K: Into<String>>(fields: impl IntoIterator<Item = (K, ParamValue)>) -> Self {
        ParamValue::Nested(fields.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    /// Input name this value depends on directly, if any
    pub fn input_name(&self) -> Option<&str> {
        match self {
            ParamValue::Ref(Reference::Input { name }) => Some(name),
            _ => None,
        }
    }

    /// Every input name referenced at any depth
    pub fn input_names(&self) -> Vec<&str> {
        match self {
            ParamValue::Ref(Reference::Input { name }) => vec![name.as_str()],
            ParamValue::Nested(fields) => fields.values().flat_map(ParamValue::input_names).collect(),
            _ => Vec::new(),
        }
    }

    /// Whether the current batch item is referenced at any depth
    pub fn references_item(&self) -> bool {
        match self {
            ParamValue::Ref(Reference::Item) => true,
            ParamValue::Nested(fields) => fields.values().any(ParamValue::references_item),
            _ => false,
        }
    }

    pub fn resolve(&self, bindings: &Bindings<'_>) -> Result<Value> {
        match self {
            ParamValue::Literal(value) => Ok(value.clone()),
            ParamValue::Nested(fields) => fields
                .iter()
                .map(|(name, value)| Ok((name.clone(), value.resolve(bindings)?)))
                .collect::<Result<serde_json::Map<_, _>>>()
                .map(Value::Object),
            ParamValue::Ref(Reference::Input { name }) => bindings
                .inputs
                .get(name)
                .map(|id| Value::String(id.to_string()))
                .ok_or_else(|| Error::MissingInput {
                    stage: bindings.stage.to_string(),
                    input: name.clone(),
                }),
            ParamValue::Ref(Reference::IdempotencyKey) => bindings
                .idempotency_key
                .map(|key| Value::String(key.to_string()))
                .ok_or_else(|| {
                    Error::Configuration(format!(
                        "stage {} references its idempotency key but has none",
                        bindings.stage
                    ))
                }),
            ParamValue::Ref(Reference::Item) => bindings
                .item
                .map(|item| Value::String(item.to_string()))
                .ok_or_else(|| {
                    Error::Configuration(format!(
                        "stage {} references a batch item outside a batch",
                        bindings.stage
                    ))
                }),
        }
    }
}

impl From<&str> for ParamValue {
    fn from(value: &str) -> Self {
        ParamValue::Literal(Value::String(value.to_string()))
    }
}

impl From<String> for ParamValue {
    fn from(value: String) -> Self {
        ParamValue::Literal(Value::String(value))
    }
}

impl From<Value> for ParamValue {
    fn from(value: Value) -> Self {
        ParamValue::Literal(value)
    }
}

/// Named request parameters before resolution
pub type ParamMap = BTreeMap<String, ParamValue>;

/// Resolve every parameter in `params`
pub fn resolve_params(params: &ParamMap, bindings: &Bindings<'_>) -> Result<Params> {
    params
        .iter()
        .map(|(name, value)| Ok((name.clone(), value.resolve(bindings)?)))
        .collect()
}

/// Values available to parameter resolution
#[derive(Debug, Clone, Copy)]
pub struct Bindings<'a> {
    pub stage: &'a str,
    pub inputs: &'a Identifiers,
    pub idempotency_key: Option<&'a str>,
    pub item: Option<&'a str>,
}

impl<'a> Bindings<'a> {
    pub fn new(stage: &'a str, inputs: &'a Identifiers) -> Self {
        Self {
            stage,
            inputs,
            idempotency_key: None,
            item: None,
        }
    }

    pub fn with_key(mut self, key: Option<&'a str>) -> Self {
        self.idempotency_key = key;
        self
    }

    pub fn with_item(mut self, item: Option<&'a str>) -> Self {
        self.item = item;
        self
    }
}

// =============================================================================
// Queries
// =============================================================================

/// What to ask the control plane
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResourceQuery {
    /// Call an operation (e.g. `DescribeDBClusters`)
    Invoke {
        action: String,
        #[serde(default)]
        params: ParamMap,
    },
    /// Describe one resource by identifier
    Describe { resource: ParamValue },
}

impl ResourceQuery {
    pub fn invoke(action: impl Into<String>, params: ParamMap) -> Self {
        ResourceQuery::Invoke {
            action: action.into(),
            params,
        }
    }

    /// Input names referenced by this query
    pub fn input_names(&self) -> Vec<&str> {
        match self {
            ResourceQuery::Invoke { params, .. } => {
                params.values().flat_map(ParamValue::input_names).collect()
            }
            ResourceQuery::Describe { resource } => resource.input_names(),
        }
    }

    pub fn resolve(&self, bindings: &Bindings<'_>) -> Result<ResolvedQuery> {
        match self {
            ResourceQuery::Invoke { action, params } => Ok(ResolvedQuery::Invoke {
                action: action.clone(),
                params: resolve_params(params, bindings)?,
            }),
            ResourceQuery::Describe { resource } => {
                let value = resource.resolve(bindings)?;
                let id = value.as_str().ok_or_else(|| {
                    Error::Configuration(format!(
                        "stage {} describe target must be a string",
                        bindings.stage
                    ))
                })?;
                Ok(ResolvedQuery::Describe {
                    resource: ResourceId::new(id),
                })
            }
        }
    }
}

/// A query with all references substituted
#[derive(Debug, Clone, PartialEq)]
pub enum ResolvedQuery {
    Invoke { action: String, params: Params },
    Describe { resource: ResourceId },
}

impl std::fmt::Display for ResolvedQuery {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ResolvedQuery::Invoke { action, .. } => write!(f, "{}", action),
            ResolvedQuery::Describe { resource } => write!(f, "describe {}", resource),
        }
    }
}

/// Immutable description of a polled attribute query
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationDescriptor {
    pub query: ResourceQuery,
    /// Default path for rules that do not name their own
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<ExtractPath>,
}

impl OperationDescriptor {
    pub fn new(query: ResourceQuery) -> Self {
        Self { query, path: None }
    }

    pub fn with_path(mut self, path: ExtractPath) -> Self {
        self.path = Some(path);
        self
    }

    /// Bind to a client, producing something the waiter can poll
    pub fn bind(&self, client: ControlPlaneClientRef, bindings: &Bindings<'_>) -> Result<BoundQuery> {
        Ok(BoundQuery {
            client,
            query: self.query.resolve(bindings)?,
            default_path: self.path.clone(),
        })
    }
}

// =============================================================================
// Query Sources
// =============================================================================

/// Something the waiter can poll
#[async_trait]
pub trait QuerySource: Send + Sync {
    /// Issue the query once
    async fn query(&self) -> std::result::Result<Value, RemoteError>;

    /// Path used by rules without their own
    fn default_path(&self) -> Option<&ExtractPath> {
        None
    }
}

/// A resolved query bound to one client
pub struct BoundQuery {
    client: ControlPlaneClientRef,
    query: ResolvedQuery,
    default_path: Option<ExtractPath>,
}

impl BoundQuery {
    pub fn query_ref(&self) -> &ResolvedQuery {
        &self.query
    }
}

#[async_trait]
impl QuerySource for BoundQuery {
    async fn query(&self) -> std::result::Result<Value, RemoteError> {
        match &self.query {
            ResolvedQuery::Invoke { action, params } => self.client.invoke(action, params).await,
            ResolvedQuery::Describe { resource } => self.client.describe(resource).await,
        }
    }

    fn default_path(&self) -> Option<&ExtractPath> {
        self.default_path.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use serde_json::json;

    #[test]
    fn test_param_value_parsing() {
        let params: ParamMap = serde_json::from_value(json!({
            "SourceDBClusterSnapshotIdentifier": {"$ref": "input", "name": "snapshot_arn"},
            "TargetDBClusterSnapshotIdentifier": {"$ref": "idempotency_key"},
            "CopyTags": true,
            "Tags": [{"Key": "CreatedBy", "Value": "migrator"}]
        }))
        .unwrap();

        assert_eq!(
            params["SourceDBClusterSnapshotIdentifier"],
            ParamValue::input("snapshot_arn")
        );
        assert_eq!(params["TargetDBClusterSnapshotIdentifier"], ParamValue::key());
        assert_eq!(params["CopyTags"], ParamValue::literal(true));
        assert_matches!(params["Tags"], ParamValue::Literal(Value::Array(_)));
    }

    #[test]
    fn test_resolution() {
        let mut inputs = Identifiers::new();
        inputs.insert("snapshot_arn".into(), ResourceId::new("arn:snap:1"));

        let params: ParamMap = [
            ("Source".to_string(), ParamValue::input("snapshot_arn")),
            ("Target".to_string(), ParamValue::key()),
        ]
        .into_iter()
        .collect();

        let bindings = Bindings::new("copy", &inputs).with_key(Some("migration-1-copy"));
        let resolved = resolve_params(&params, &bindings).unwrap();
        assert_eq!(resolved["Source"], json!("arn:snap:1"));
        assert_eq!(resolved["Target"], json!("migration-1-copy"));
    }

    #[test]
    fn test_nested_references_resolve() {
        let params: ParamMap = serde_json::from_value(json!({
            "Manifest": {
                "Spec": {"Format": "S3InventoryReport_CSV_20161130"},
                "Location": {
                    "ObjectArn": "arn:aws:s3:::inventory/manifest.json",
                    "ETag": {"$ref": "input", "name": "manifest_etag"}
                }
            },
            "ClientRequestToken": {"$ref": "idempotency_key"}
        }))
        .unwrap();
        assert_eq!(params["Manifest"].input_names(), vec!["manifest_etag"]);
        assert!(!params["Manifest"].references_item());

        let mut inputs = Identifiers::new();
        inputs.insert("manifest_etag".into(), ResourceId::new("\"abc123\""));
        let bindings = Bindings::new("create-job", &inputs).with_key(Some("replicate-1"));
        let resolved = resolve_params(&params, &bindings).unwrap();
        assert_eq!(resolved["Manifest"]["Location"]["ETag"], json!("\"abc123\""));
        assert_eq!(
            resolved["Manifest"]["Spec"]["Format"],
            json!("S3InventoryReport_CSV_20161130")
        );
        assert_eq!(resolved["ClientRequestToken"], json!("replicate-1"));
    }

    #[test]
    fn test_missing_input_is_reported() {
        let inputs = Identifiers::new();
        let bindings = Bindings::new("share", &inputs);
        let err = ParamValue::input("snapshot_id").resolve(&bindings).unwrap_err();
        assert_matches!(err, Error::MissingInput { stage, input } if stage == "share" && input == "snapshot_id");
    }

    #[test]
    fn test_describe_query_resolution() {
        let mut inputs = Identifiers::new();
        inputs.insert("cluster".into(), ResourceId::new("events-staging"));
        let query = ResourceQuery::Describe {
            resource: ParamValue::input("cluster"),
        };
        assert_eq!(query.input_names(), vec!["cluster"]);

        let resolved = query.resolve(&Bindings::new("restore", &inputs)).unwrap();
        assert_eq!(
            resolved,
            ResolvedQuery::Describe {
                resource: ResourceId::new("events-staging")
            }
        );
    }
}
