//! Cluster client abstraction
//!
//! Remote executions run as ephemeral workloads in a single namespace. The
//! orchestrator only needs a narrow surface: create a workload and its
//! credential object, observe the workload's pod, follow its logs, and delete
//! everything afterwards.

use crate::error::Result;
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

/// Label key that ties a workload's pods back to the workload
pub const WORKLOAD_LABEL: &str = "tugboat.io/workload";

/// Cluster client used by the remote backend
#[async_trait]
pub trait ClusterClient: Send + Sync {
    /// Create an ephemeral workload (a run-to-completion job)
    async fn create_workload(&self, spec: &WorkloadSpec) -> Result<ResourceHandle>;

    /// Create a credential object holding `data`, named with a generated suffix
    async fn create_credential_object(
        &self,
        prefix: &str,
        data: BTreeMap<String, String>,
    ) -> Result<ResourceHandle>;

    /// Watch pods matching `selector`; the stream ends when `timeout` elapses
    async fn watch(
        &self,
        selector: &str,
        timeout: Duration,
    ) -> Result<BoxStream<'static, Result<WatchEvent>>>;

    /// List pods matching `selector`
    async fn pods_by_selector(&self, selector: &str) -> Result<Vec<PodInfo>>;

    /// Stream a pod's logs, following them until the container exits
    async fn stream_logs(
        &self,
        pod: &str,
        follow: bool,
    ) -> Result<BoxStream<'static, Result<Bytes>>>;

    /// Delete a workload or credential object
    ///
    /// Workloads are deleted with background propagation so their pods go too.
    async fn delete(&self, handle: &ResourceHandle) -> Result<()>;
}

/// Specification of an ephemeral workload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkloadSpec {
    /// Generated unique name
    pub name: String,

    pub labels: BTreeMap<String, String>,

    /// Container image
    pub image: String,

    /// Full argv; the first entry is the program
    pub command: Vec<String>,

    /// CPU request and limit in millicores
    pub cpu_millis: u64,

    /// Memory request and limit in bytes
    pub memory_bytes: u64,

    /// Hard deadline enforced by the cluster
    pub active_deadline: Duration,

    pub volumes: Vec<WorkloadVolume>,

    pub env: BTreeMap<String, String>,
}

impl WorkloadSpec {
    /// Label selector matching this workload's pods
    pub fn selector(&self) -> String {
        selector_for(&self.name)
    }
}

/// Label selector for the pods of workload `name`
pub fn selector_for(name: &str) -> String {
    format!("{}={}", WORKLOAD_LABEL, name)
}

/// A volume mounted into the workload container
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkloadVolume {
    pub name: String,
    pub mount_path: String,
    pub source: VolumeSource,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum VolumeSource {
    /// Credential object created for this execution
    Secret(String),
    /// Shared configuration provisioned with the cluster
    ConfigMap(String),
}

/// Kind of cluster resource created for an execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResourceKind {
    Workload,
    Credential,
}

/// Handle to a created cluster resource
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceHandle {
    pub kind: ResourceKind,
    pub name: String,
}

impl ResourceHandle {
    pub fn workload(name: impl Into<String>) -> Self {
        Self {
            kind: ResourceKind::Workload,
            name: name.into(),
        }
    }

    pub fn credential(name: impl Into<String>) -> Self {
        Self {
            kind: ResourceKind::Credential,
            name: name.into(),
        }
    }
}

impl fmt::Display for ResourceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            ResourceKind::Workload => write!(f, "workload/{}", self.name),
            ResourceKind::Credential => write!(f, "secret/{}", self.name),
        }
    }
}

/// Pod lifecycle phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PodPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
    Unknown,
}

impl PodPhase {
    pub fn parse(phase: &str) -> Self {
        match phase {
            "Pending" => PodPhase::Pending,
            "Running" => PodPhase::Running,
            "Succeeded" => PodPhase::Succeeded,
            "Failed" => PodPhase::Failed,
            _ => PodPhase::Unknown,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, PodPhase::Succeeded | PodPhase::Failed)
    }
}

/// Observed pod state
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodInfo {
    pub name: String,
    pub phase: PodPhase,
    /// Reason reported by the cluster, if any
    pub message: Option<String>,
}

/// Pod watch notification
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    /// A matching pod was added or modified
    Changed(String),
    /// A matching pod was deleted
    Deleted(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_selector() {
        assert_eq!(
            selector_for("tugboat-build-1a2b"),
            "tugboat.io/workload=tugboat-build-1a2b"
        );
    }

    #[test]
    fn test_pod_phase_parse() {
        assert_eq!(PodPhase::parse("Running"), PodPhase::Running);
        assert_eq!(PodPhase::parse("Evicted"), PodPhase::Unknown);
        assert!(PodPhase::Failed.is_terminal());
        assert!(!PodPhase::Pending.is_terminal());
    }

    #[test]
    fn test_handle_display() {
        assert_eq!(ResourceHandle::workload("w").to_string(), "workload/w");
        assert_eq!(ResourceHandle::credential("s").to_string(), "secret/s");
    }
}
