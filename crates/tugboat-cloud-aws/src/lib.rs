//! S3 object store for Tugboat
//!
//! Stages build contexts for remote executions. Workloads fetch them through
//! presigned URLs, so they never hold bucket credentials themselves.

pub mod error;
pub mod store;

pub use error::{Result, S3Error};
pub use store::{S3Config, S3ObjectStore};
