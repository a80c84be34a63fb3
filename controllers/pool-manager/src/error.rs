//! Controller-specific error types.
//!
//! This module defines error types specific to the Pool Manager Controller
//! that are not covered by upstream library errors.

use block_ipam::IpamError;
use kube::Error as KubeError;
use thiserror::Error;

/// Errors that can occur in the Pool Manager Controller.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// Kubernetes API error
    #[error("Kubernetes error: {0}")]
    Kube(#[from] KubeError),

    /// Block allocation error
    #[error("IPAM error: {0}")]
    Ipam(#[from] IpamError),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Resource watch failed
    #[error("Resource watch failed: {0}")]
    Watch(String),

    /// Metrics registration or endpoint failure
    #[error("Metrics error: {0}")]
    Metrics(String),
}
