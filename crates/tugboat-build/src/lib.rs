//! Tugboat build and copy tooling
//!
//! This crate turns validated operations into buildctl / skopeo command lines,
//! unpacks build contexts, and frames tool output as the line-delimited JSON
//! stream that Engine API clients expect.

pub mod command;
pub mod context;
pub mod digest;
pub mod error;
pub mod stream;

pub use command::BuildctlArgs;
pub use context::BuildContext;
pub use digest::{resolve_digest, scan_digest};
pub use error::{BuildError, Result};
pub use stream::{BufferSink, OutputSink, StreamEncoder, StreamEvent};
