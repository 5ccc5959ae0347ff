//! Declarative polling waiter
//!
//! - `path`: JSON extract paths used by descriptors and rules
//! - `descriptor`: what to query and how parameters bind to run inputs
//! - `rules`: ordered termination rules with polling bounds
//! - `model`: botocore-style waiter documents
//! - `builtin`: waiters for snapshot, cluster, instance and DataSync resources
//! - `poller`: the polling loop

pub mod builtin;
pub mod descriptor;
pub mod model;
pub mod path;
pub mod poller;
pub mod rules;

pub use descriptor::{
    Bindings, BoundQuery, OperationDescriptor, ParamMap, ParamValue, QuerySource, Reference,
    ResolvedQuery, ResourceQuery,
};
pub use model::{WaiterDefinition, WaiterModel};
pub use path::ExtractPath;
pub use poller::{PollingWaiter, WaitOutcome};
pub use rules::{Matcher, Outcome, RuleSet, TerminationRule};
