//! Tugboat daemon
//!
//! Serves the Engine API subset used by image build tooling (build, pull,
//! tag, inspect) and hands each request to the local or cluster backend.

pub mod api;
pub mod handlers;
pub mod state;

pub use api::{App, create_app, create_router};
pub use state::{AppState, Limits};
