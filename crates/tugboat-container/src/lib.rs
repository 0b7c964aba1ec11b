pub mod admission;
pub mod error;
pub mod local;
pub mod remote;
pub mod runtime;
pub mod waiter;
pub mod workload;

pub use admission::*;
pub use error::*;
pub use local::*;
pub use remote::*;
pub use runtime::*;
pub use waiter::*;
pub use workload::*;
