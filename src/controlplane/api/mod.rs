//! API Module
//!
//! REST API for listing pipelines and managing runs.

pub mod rest;
pub mod server;

pub use rest::*;
pub use server::*;
