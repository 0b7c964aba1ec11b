//! サービス設定
//!
//! ```kdl
//! listen "0.0.0.0:2375"
//! namespace "tugboat"
//! registry "tugboat-registry:5000"
//! log-level "info"
//! max-body-size "2Gi"
//!
//! images {
//!     builder "moby/buildkit:v0.16.0-rootless"
//!     copy "quay.io/skopeo/stable:v1.16.1"
//!     buildkitd-config "buildkitd-config"
//! }
//!
//! admission {
//!     build-capacity 1
//!     copy-capacity 2
//!     acquire-timeout-secs 5
//!     local-cpu-millis 1000
//!     local-memory "2Gi"
//! }
//!
//! copy-resources {
//!     cpu-millis 500
//!     memory "512Mi"
//! }
//!
//! timeouts {
//!     execution-secs 1800
//!     cleanup-secs 10
//!     watch-secs 60
//! }
//!
//! object-store {
//!     bucket "tugboat-contexts"
//!     prefix "contexts"
//!     endpoint "http://minio:9000"
//!     region "us-east-1"
//! }
//!
//! local {
//!     buildkitd "tcp://127.0.0.1:1234"
//! }
//! ```

use crate::error::{ConfigError, Result};
use kdl::{KdlDocument, KdlNode};
use std::path::Path;
use std::time::Duration;

const GIB: u64 = 1024 * 1024 * 1024;
const MIB: u64 = 1024 * 1024;

/// デーモン全体の設定
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceConfig {
    pub listen: String,
    pub namespace: String,
    pub registry: String,
    pub log_level: String,
    /// ビルドコンテキストとして受け付けるリクエストボディの上限
    pub max_body_size: u64,
    pub images: ImageConfig,
    pub admission: AdmissionSettings,
    pub copy_resources: CopyResources,
    pub timeouts: Timeouts,
    pub object_store: ObjectStoreSettings,
    pub local: LocalSettings,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:2375".to_string(),
            namespace: "tugboat".to_string(),
            registry: "tugboat-registry:5000".to_string(),
            log_level: "info".to_string(),
            max_body_size: 2 * GIB,
            images: ImageConfig::default(),
            admission: AdmissionSettings::default(),
            copy_resources: CopyResources::default(),
            timeouts: Timeouts::default(),
            object_store: ObjectStoreSettings::default(),
            local: LocalSettings::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageConfig {
    pub builder: String,
    pub copy: String,
    /// buildkitd.toml を持つ ConfigMap 名
    pub buildkitd_config: Option<String>,
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self {
            builder: "moby/buildkit:v0.16.0-rootless".to_string(),
            copy: "quay.io/skopeo/stable:v1.16.1".to_string(),
            buildkitd_config: Some("buildkitd-config".to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdmissionSettings {
    pub build_capacity: usize,
    pub copy_capacity: usize,
    pub acquire_timeout: Duration,
    /// ローカルで実行するビルドの上限
    pub local_cpu_millis: u64,
    pub local_memory_bytes: u64,
}

impl Default for AdmissionSettings {
    fn default() -> Self {
        Self {
            build_capacity: 1,
            copy_capacity: 2,
            acquire_timeout: Duration::from_secs(5),
            local_cpu_millis: 1000,
            local_memory_bytes: 2 * GIB,
        }
    }
}

/// pull/tag/inspect のワークロードに割り当てる固定リソース
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopyResources {
    pub cpu_millis: u64,
    pub memory_bytes: u64,
}

impl Default for CopyResources {
    fn default() -> Self {
        Self {
            cpu_millis: 500,
            memory_bytes: 512 * MIB,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Timeouts {
    /// 実行時間の上限
    pub execution: Duration,
    /// 後片付けの期限
    pub cleanup: Duration,
    /// 1回の watch の長さ
    pub watch: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            execution: Duration::from_secs(30 * 60),
            cleanup: Duration::from_secs(10),
            watch: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectStoreSettings {
    pub bucket: String,
    pub prefix: String,
    pub endpoint: Option<String>,
    pub region: Option<String>,
}

impl Default for ObjectStoreSettings {
    fn default() -> Self {
        Self {
            bucket: "tugboat-contexts".to_string(),
            prefix: "contexts".to_string(),
            endpoint: None,
            region: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalSettings {
    pub buildkitd_addr: String,
}

impl Default for LocalSettings {
    fn default() -> Self {
        Self {
            buildkitd_addr: "tcp://127.0.0.1:1234".to_string(),
        }
    }
}

impl ServiceConfig {
    /// KDL 文字列をパース（書かれていない項目はデフォルト値）
    pub fn parse(content: &str) -> Result<Self> {
        let doc: KdlDocument = content.parse()?;
        let mut config = Self::default();

        for node in doc.nodes() {
            match node.name().value() {
                "listen" => config.listen = string_arg(node)?,
                "namespace" => config.namespace = string_arg(node)?,
                "registry" => config.registry = string_arg(node)?,
                "log-level" | "log_level" => config.log_level = string_arg(node)?,
                "max-body-size" | "max_body_size" => config.max_body_size = bytes_arg(node)?,
                "images" => {
                    for child in children(node) {
                        match child.name().value() {
                            "builder" => config.images.builder = string_arg(child)?,
                            "copy" => config.images.copy = string_arg(child)?,
                            "buildkitd-config" | "buildkitd_config" => {
                                let name = string_arg(child)?;
                                config.images.buildkitd_config =
                                    (!name.is_empty()).then_some(name);
                            }
                            other => warn_unknown("images", other),
                        }
                    }
                }
                "admission" => {
                    let admission = &mut config.admission;
                    for child in children(node) {
                        match child.name().value() {
                            "build-capacity" => admission.build_capacity = u64_arg(child)? as usize,
                            "copy-capacity" => admission.copy_capacity = u64_arg(child)? as usize,
                            "acquire-timeout-secs" => {
                                admission.acquire_timeout = Duration::from_secs(u64_arg(child)?)
                            }
                            "local-cpu-millis" => admission.local_cpu_millis = u64_arg(child)?,
                            "local-memory" => admission.local_memory_bytes = bytes_arg(child)?,
                            other => warn_unknown("admission", other),
                        }
                    }
                }
                "copy-resources" => {
                    for child in children(node) {
                        match child.name().value() {
                            "cpu-millis" => config.copy_resources.cpu_millis = u64_arg(child)?,
                            "memory" => config.copy_resources.memory_bytes = bytes_arg(child)?,
                            other => warn_unknown("copy-resources", other),
                        }
                    }
                }
                "timeouts" => {
                    for child in children(node) {
                        let value = Duration::from_secs(u64_arg(child)?);
                        match child.name().value() {
                            "execution-secs" => config.timeouts.execution = value,
                            "cleanup-secs" => config.timeouts.cleanup = value,
                            "watch-secs" => config.timeouts.watch = value,
                            other => warn_unknown("timeouts", other),
                        }
                    }
                }
                "object-store" => {
                    let store = &mut config.object_store;
                    for child in children(node) {
                        match child.name().value() {
                            "bucket" => store.bucket = string_arg(child)?,
                            "prefix" => store.prefix = string_arg(child)?,
                            "endpoint" => store.endpoint = Some(string_arg(child)?),
                            "region" => store.region = Some(string_arg(child)?),
                            other => warn_unknown("object-store", other),
                        }
                    }
                }
                "local" => {
                    for child in children(node) {
                        match child.name().value() {
                            "buildkitd" => config.local.buildkitd_addr = string_arg(child)?,
                            other => warn_unknown("local", other),
                        }
                    }
                }
                other => warn_unknown("root", other),
            }
        }

        config.validate()?;
        Ok(config)
    }

    /// ファイルから読み込む
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config = Self::parse(&content)?;
        tracing::debug!("Loaded config from {}", path.display());
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.registry.is_empty() {
            return Err(ConfigError::invalid("registry", "must not be empty"));
        }
        if self.timeouts.execution.is_zero() {
            return Err(ConfigError::invalid("timeouts.execution-secs", "must be positive"));
        }
        if self.timeouts.cleanup.is_zero() {
            return Err(ConfigError::invalid("timeouts.cleanup-secs", "must be positive"));
        }
        if self.object_store.bucket.is_empty() {
            return Err(ConfigError::invalid("object-store.bucket", "must not be empty"));
        }
        Ok(())
    }
}

fn children(node: &KdlNode) -> impl Iterator<Item = &KdlNode> {
    node.children().into_iter().flat_map(|doc| doc.nodes())
}

fn warn_unknown(section: &str, name: &str) {
    tracing::warn!("Unknown config node in {}: {}", section, name);
}

fn string_arg(node: &KdlNode) -> Result<String> {
    node.entries()
        .first()
        .and_then(|e| e.value().as_string())
        .map(|s| s.to_string())
        .ok_or_else(|| ConfigError::invalid(node.name().value(), "expected a string"))
}

fn u64_arg(node: &KdlNode) -> Result<u64> {
    let key = node.name().value();
    let value = node
        .entries()
        .first()
        .and_then(|e| e.value().as_integer())
        .ok_or_else(|| ConfigError::invalid(key, "expected an integer"))?;
    u64::try_from(value).map_err(|_| ConfigError::invalid(key, "must not be negative"))
}

/// 整数（バイト数）か "512Mi" / "2Gi" 形式の文字列
fn bytes_arg(node: &KdlNode) -> Result<u64> {
    let key = node.name().value();
    let value = node
        .entries()
        .first()
        .map(|e| e.value())
        .ok_or_else(|| ConfigError::invalid(key, "expected a size"))?;

    if let Some(n) = value.as_integer() {
        return u64::try_from(n).map_err(|_| ConfigError::invalid(key, "must not be negative"));
    }
    let text = value
        .as_string()
        .ok_or_else(|| ConfigError::invalid(key, "expected a size"))?;
    parse_size(text).ok_or_else(|| ConfigError::invalid(key, format!("invalid size: {}", text)))
}

fn parse_size(text: &str) -> Option<u64> {
    let units = [("Ki", 1024), ("Mi", MIB), ("Gi", GIB)];
    for (suffix, multiplier) in units {
        if let Some(number) = text.strip_suffix(suffix) {
            return number.trim().parse::<u64>().ok()?.checked_mul(multiplier);
        }
    }
    text.trim().parse().ok()
}
