//! Shared functionality for lockrpc components
//!
//! This crate provides the ambient utilities used by the gateway crate:
//! logging setup and the environment-variable surface consumed by the
//! configuration layer.

/// Environment variable names and typed readers used across the workspace
pub mod env;
/// Logging setup and utilities for consistent logging across lockrpc components
pub mod logging;

pub use env::*;
pub use logging::*;
