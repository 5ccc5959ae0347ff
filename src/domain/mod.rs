//! Domain layer - Core port definitions and shared operation context
//!
//! This module defines the traits (ports) that control-plane adapters
//! implement, following hexagonal architecture principles.

pub mod context;
pub mod ports;

pub use context::*;
pub use ports::*;
