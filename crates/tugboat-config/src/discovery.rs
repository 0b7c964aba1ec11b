//! 設定ファイルの探索

use crate::error::{ConfigError, Result};
use std::path::{Path, PathBuf};

/// 設定ファイルのパスを直接指定する環境変数
pub const CONFIG_PATH_ENV: &str = "TUGBOAT_CONFIG_PATH";

/// 設定ファイル名
pub const CONFIG_FILE_NAME: &str = "tugboat.kdl";

const SYSTEM_CONFIG: &str = "/etc/tugboat/tugboat.kdl";

/// tugboat.kdl を探す
///
/// 以下の優先順位で検索:
/// 1. 環境変数 TUGBOAT_CONFIG_PATH（存在しなければエラー）
/// 2. ./tugboat.kdl
/// 3. ./.tugboat/tugboat.kdl
/// 4. ~/.config/tugboat/tugboat.kdl
/// 5. /etc/tugboat/tugboat.kdl
///
/// どこにも無ければ `None`（デフォルト設定で起動する）。
pub fn find_config_file() -> Result<Option<PathBuf>> {
    if let Ok(config_path) = std::env::var(CONFIG_PATH_ENV) {
        let path = PathBuf::from(config_path);
        if path.is_file() {
            return Ok(Some(path));
        }
        return Err(ConfigError::ConfigFileNotFound(path));
    }

    let current_dir = std::env::current_dir()?;
    let global = dirs::config_dir().map(|dir| dir.join("tugboat").join(CONFIG_FILE_NAME));

    Ok(search(&current_dir, global.as_deref()))
}

fn search(current_dir: &Path, global: Option<&Path>) -> Option<PathBuf> {
    let mut candidates = vec![
        current_dir.join(CONFIG_FILE_NAME),
        current_dir.join(".tugboat").join(CONFIG_FILE_NAME),
    ];
    candidates.extend(global.map(Path::to_path_buf));
    candidates.push(PathBuf::from(SYSTEM_CONFIG));

    candidates.into_iter().find(|path| path.is_file())
}
