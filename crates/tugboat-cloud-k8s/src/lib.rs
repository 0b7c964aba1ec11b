//! Kubernetes cluster client for Tugboat
//!
//! Implements [`tugboat_cloud::ClusterClient`] on top of `kube`. Workloads are
//! batch/v1 Jobs that never retry, credential objects are Secrets, and
//! everything lives in a single namespace.
//!
//! # Example
//!
//! ```ignore
//! use tugboat_cloud_k8s::KubeCluster;
//!
//! let cluster = KubeCluster::connect("tugboat").await?;
//! let pods = cluster.pods_by_selector("tugboat.io/workload=tugboat-build-abc").await?;
//! ```

pub mod cluster;
pub mod error;
pub mod manifest;

pub use cluster::KubeCluster;
pub use error::{K8sError, Result};
pub use manifest::{job_manifest, pod_info, secret_manifest};
