//! レジストリ認証処理
//!
//! Engine API の認証ヘッダー（`X-Registry-Config` / `X-Registry-Auth`）を
//! デコードし、buildctl / skopeo が読む `config.json` 形式に変換します。

use crate::error::{ParamError, Result};
use crate::model::registry_host;
use base64::Engine;
use base64::engine::general_purpose::{STANDARD, STANDARD_NO_PAD, URL_SAFE, URL_SAFE_NO_PAD};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

pub const REGISTRY_CONFIG_HEADER: &str = "X-Registry-Config";
pub const REGISTRY_AUTH_HEADER: &str = "X-Registry-Auth";

/// Engine API の AuthConfig
#[derive(Debug, Default, Deserialize)]
struct AuthConfig {
    #[serde(default)]
    username: Option<String>,
    #[serde(default)]
    password: Option<String>,
    /// Base64エンコードされた "username:password"
    #[serde(default)]
    auth: Option<String>,
    #[serde(default)]
    serveraddress: Option<String>,
    #[serde(default)]
    identitytoken: Option<String>,
    #[serde(default)]
    registrytoken: Option<String>,
}

/// config.json の認証エントリ
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthEntry {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub identitytoken: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub registrytoken: Option<String>,
}

/// レジストリごとの認証情報（config.json の形）
///
/// リクエストごとに一度だけ作られ、リクエストの終了とともに破棄される。
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryCredentials {
    #[serde(default)]
    pub auths: BTreeMap<String, AuthEntry>,
}

impl RegistryCredentials {
    pub fn is_empty(&self) -> bool {
        self.auths.is_empty()
    }

    /// 登録済みレジストリ名
    pub fn registries(&self) -> impl Iterator<Item = &str> {
        self.auths.keys().map(String::as_str)
    }

    /// `config.json` としてシリアライズ
    pub fn to_config_json(&self) -> String {
        let auths: serde_json::Map<String, serde_json::Value> = self
            .auths
            .iter()
            .map(|(registry, entry)| {
                let mut object = serde_json::Map::new();
                if let Some(auth) = &entry.auth {
                    object.insert("auth".into(), auth.clone().into());
                }
                if let Some(token) = &entry.identitytoken {
                    object.insert("identitytoken".into(), token.clone().into());
                }
                if let Some(token) = &entry.registrytoken {
                    object.insert("registrytoken".into(), token.clone().into());
                }
                (registry.clone(), serde_json::Value::Object(object))
            })
            .collect();

        serde_json::json!({ "auths": auths }).to_string()
    }

    /// `X-Registry-Config`（複数レジストリ形式）から変換
    ///
    /// ヘッダーが無い、または空の場合は認証なし。
    pub fn from_registry_config(header: Option<&str>) -> Result<Self> {
        let Some(raw) = decode_header(REGISTRY_CONFIG_HEADER, header)? else {
            return Ok(Self::default());
        };

        let configs: BTreeMap<String, AuthConfig> =
            serde_json::from_slice(&raw).map_err(|e| credential_error(REGISTRY_CONFIG_HEADER, e))?;

        let mut credentials = Self::default();
        for (registry, config) in configs {
            let registry = config
                .serveraddress
                .as_deref()
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .unwrap_or(registry);

            if let Some(entry) = to_entry(&config) {
                credentials.auths.insert(registry, entry);
            }
        }

        tracing::debug!(
            "Decoded registry config for {} registries",
            credentials.auths.len()
        );
        Ok(credentials)
    }

    /// `X-Registry-Auth`（単一レジストリ形式）から変換
    ///
    /// `serveraddress` が無い場合は `image` のレジストリを使う。
    pub fn from_registry_auth(header: Option<&str>, image: &str) -> Result<Self> {
        let Some(raw) = decode_header(REGISTRY_AUTH_HEADER, header)? else {
            return Ok(Self::default());
        };

        let config: AuthConfig =
            serde_json::from_slice(&raw).map_err(|e| credential_error(REGISTRY_AUTH_HEADER, e))?;

        let mut credentials = Self::default();
        if let Some(entry) = to_entry(&config) {
            let registry = config
                .serveraddress
                .as_deref()
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .unwrap_or_else(|| registry_host(image));
            credentials.auths.insert(registry, entry);
        }

        Ok(credentials)
    }
}

/// ヘッダー値を JSON のバイト列に戻す
///
/// クライアントによって生の JSON か Base64（URL-safe / 標準、パディング有無）が送られてくる。
fn decode_header(header: &'static str, value: Option<&str>) -> Result<Option<Vec<u8>>> {
    let Some(value) = value.map(str::trim).filter(|v| !v.is_empty()) else {
        return Ok(None);
    };

    if value.starts_with('{') {
        return Ok(Some(value.as_bytes().to_vec()));
    }

    for engine in [&URL_SAFE, &URL_SAFE_NO_PAD, &STANDARD, &STANDARD_NO_PAD] {
        if let Ok(decoded) = engine.decode(value) {
            return Ok(Some(decoded));
        }
    }

    Err(ParamError::Credential {
        header,
        message: "neither JSON nor base64".to_string(),
    })
}

fn to_entry(config: &AuthConfig) -> Option<AuthEntry> {
    let auth = match (&config.auth, &config.username) {
        (Some(auth), _) if !auth.is_empty() => Some(auth.clone()),
        (_, Some(username)) if !username.is_empty() => {
            let password = config.password.as_deref().unwrap_or("");
            Some(STANDARD.encode(format!("{}:{}", username, password)))
        }
        _ => None,
    };

    let entry = AuthEntry {
        auth,
        identitytoken: config.identitytoken.clone().filter(|t| !t.is_empty()),
        registrytoken: config.registrytoken.clone().filter(|t| !t.is_empty()),
    };

    if entry == AuthEntry::default() {
        None
    } else {
        Some(entry)
    }
}

fn credential_error(header: &'static str, err: serde_json::Error) -> ParamError {
    ParamError::Credential {
        header,
        message: err.to_string(),
    }
}
