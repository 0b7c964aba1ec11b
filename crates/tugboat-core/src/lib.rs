//! Tugboat core
//!
//! Engine API のリクエストを検証し、実行バックエンドに渡す `OperationSpec` を
//! 組み立てます。レジストリ認証ヘッダーの変換と内部レジストリの命名規則もここに置きます。

pub mod auth;
pub mod error;
pub mod model;
pub mod protocol;

pub use auth::{REGISTRY_AUTH_HEADER, REGISTRY_CONFIG_HEADER, RegistryCredentials};
pub use error::{ParamError, Result};
pub use model::*;
pub use protocol::{Params, help_text, parse_build, parse_inspect, parse_pull, parse_tag};
