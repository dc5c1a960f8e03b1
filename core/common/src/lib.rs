//! Common utilities and types shared across the fleetsync crates.
//!
//! This module provides the error type, deployment mode, secret wrapper and the
//! periodic task primitive used by every background component.

pub mod error;
pub mod periodic;
pub mod types;

pub use error::{Error, Result};
pub use periodic::{InFlightGuard, InFlightPermit, PeriodicTask};
pub use types::{parse_flag, DeploymentMode, Secret};
