//! Domain Ports - Core trait definitions for the migrator
//!
//! These traits define the boundaries between the migration core and the
//! remote control plane. Adapters implement these traits to provide concrete
//! functionality; the core never sees credentials or wire formats.

use crate::error::{Result, THROTTLING_CODES};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;

// =============================================================================
// Identifiers
// =============================================================================

/// Opaque identifier (name or ARN) of a remote entity
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResourceId(String);

impl ResourceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ResourceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ResourceId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for ResourceId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Identifiers produced by stages, keyed by binding name (e.g. `snapshot_arn`)
pub type Identifiers = BTreeMap<String, ResourceId>;

/// Request parameters passed opaquely to the control plane
pub type Params = serde_json::Map<String, Value>;

// =============================================================================
// Execution Context
// =============================================================================

/// Account/region binding a stage executes in
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionContext {
    Source,
    Destination,
}

impl std::fmt::Display for ExecutionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ExecutionContext::Source => write!(f, "source"),
            ExecutionContext::Destination => write!(f, "destination"),
        }
    }
}

// =============================================================================
// Remote Errors
// =============================================================================

/// Error surfaced by the remote control plane
#[derive(Error, Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[error("{code}: {message}")]
pub struct RemoteError {
    /// Provider error code (e.g. `DBClusterNotFoundFault`)
    pub code: String,
    /// Human readable message
    pub message: String,
}

impl RemoteError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }

    /// Throttling or service-side transient failure
    pub fn is_throttling(&self) -> bool {
        THROTTLING_CODES.contains(&self.code.as_str())
    }

    /// Any of the provider's "not found" fault codes
    pub fn is_not_found(&self) -> bool {
        self.code.ends_with("NotFoundFault")
            || self.code.ends_with("NotFound")
            || self.code == "ResourceNotFoundException"
    }
}

// =============================================================================
// Control Plane Client Port
// =============================================================================

/// Port for the remote control plane bound to one account/region
#[async_trait]
pub trait ControlPlaneClient: Send + Sync {
    /// Submit an operation
    async fn invoke(&self, action: &str, params: &Params) -> std::result::Result<Value, RemoteError>;

    /// Describe a single resource by identifier
    async fn describe(&self, resource_id: &ResourceId) -> std::result::Result<Value, RemoteError>;

    /// Label for logs (account/region)
    fn label(&self) -> &str;
}

// =============================================================================
// Client Provider Port
// =============================================================================

/// Supplies one ready-to-use client per execution context
pub trait ClientProvider: Send + Sync {
    fn client(&self, context: ExecutionContext) -> Result<ControlPlaneClientRef>;
}

/// Pre-configured clients for the two execution contexts
#[derive(Clone)]
pub struct ClientSet {
    source: ControlPlaneClientRef,
    destination: ControlPlaneClientRef,
}

impl ClientSet {
    pub fn new(source: ControlPlaneClientRef, destination: ControlPlaneClientRef) -> Self {
        Self {
            source,
            destination,
        }
    }

    /// Same client for both contexts (same-account pipelines)
    pub fn single(client: ControlPlaneClientRef) -> Self {
        Self {
            source: client.clone(),
            destination: client,
        }
    }
}

impl ClientProvider for ClientSet {
    fn client(&self, context: ExecutionContext) -> Result<ControlPlaneClientRef> {
        Ok(match context {
            ExecutionContext::Source => self.source.clone(),
            ExecutionContext::Destination => self.destination.clone(),
        })
    }
}

impl std::fmt::Debug for ClientSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClientSet")
            .field("source", &self.source.label())
            .field("destination", &self.destination.label())
            .finish()
    }
}

// =============================================================================
// Type Aliases for Arc'd Traits
// =============================================================================

pub type ControlPlaneClientRef = Arc<dyn ControlPlaneClient>;
pub type ClientProviderRef = Arc<dyn ClientProvider>;
