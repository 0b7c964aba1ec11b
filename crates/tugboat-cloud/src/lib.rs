//! Tugboat Cloud Collaborators
//!
//! This crate defines the narrow cluster and object store contracts used by
//! remote execution. Concrete clients live in their own crates.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────┐
//! │              tugboat-container                   │
//! │           (RemoteBackend / waiter)               │
//! └─────────────────┬───────────────────────────────┘
//!                   │
//! ┌─────────────────▼───────────────────────────────┐
//! │                tugboat-cloud                     │
//! │  trait ClusterClient    trait ObjectStore        │
//! └───────┬─────────────────┬───────────────────────┘
//!         │                 │
//! ┌───────▼───────┐ ┌───────▼───────┐
//! │  tugboat-     │ │  tugboat-     │
//! │  cloud-k8s    │ │  cloud-aws    │
//! └───────────────┘ └───────────────┘
//! ```

pub mod cluster;
pub mod error;
#[cfg(any(test, feature = "test-utils"))]
pub mod fake;
pub mod object_store;

// Re-exports
pub use cluster::{
    ClusterClient, PodInfo, PodPhase, ResourceHandle, ResourceKind, VolumeSource, WORKLOAD_LABEL,
    WatchEvent, WorkloadSpec, WorkloadVolume, selector_for,
};
pub use error::{CloudError, Result};
pub use object_store::ObjectStore;
