//! Tugboat の設定
//!
//! tugboat.kdl を探索して [`ServiceConfig`] に読み込みます。
//! ファイルが無ければデフォルト値で起動します。

pub mod discovery;
pub mod error;
pub mod service;

pub use discovery::{CONFIG_FILE_NAME, CONFIG_PATH_ENV, find_config_file};
pub use error::*;
pub use service::*;

use std::path::PathBuf;

/// 設定ファイルを探して読み込む
///
/// 読み込んだファイルのパスも返す（デフォルト設定なら `None`）。
pub fn load_config() -> Result<(ServiceConfig, Option<PathBuf>)> {
    match find_config_file()? {
        Some(path) => {
            let config = ServiceConfig::load(&path)?;
            Ok((config, Some(path)))
        }
        None => Ok((ServiceConfig::default(), None)),
    }
}
