use crate::auth::RegistryCredentials;
use std::collections::BTreeMap;
use std::fmt;

/// CPU のデフォルト（1 vCPU 相当: quota / period = 100000 / 100000）
pub const DEFAULT_CPU_QUOTA: u64 = 100_000;
pub const DEFAULT_CPU_PERIOD: u64 = 100_000;

/// メモリのデフォルト（2GiB）
pub const DEFAULT_MEMORY_BYTES: u64 = 2 * 1024 * 1024 * 1024;

/// 1リクエストで指定できる上限（1024 vCPU / 1TiB）
pub const MAX_CPU_MILLIS: u64 = 1024 * 1000;
pub const MAX_MEMORY_BYTES: u64 = 1024 * 1024 * 1024 * 1024;

pub const DEFAULT_DOCKERFILE: &str = "Dockerfile";

/// 1リクエスト分の操作
#[derive(Debug, Clone, PartialEq)]
pub enum OperationSpec {
    Build(BuildSpec),
    Pull(CopySpec),
    Tag(CopySpec),
    Inspect(InspectSpec),
}

/// 操作の種類
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
    Build,
    Pull,
    Tag,
    Inspect,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Build => "build",
            OperationKind::Pull => "pull",
            OperationKind::Tag => "tag",
            OperationKind::Inspect => "inspect",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// ローカル実行枠の種類（ビルド用 / コピー用）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CapacityPool {
    Build,
    Copy,
}

/// 操作が要求する計算資源
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Footprint {
    pub cpu_millis: u64,
    pub memory_bytes: u64,
}

impl OperationSpec {
    pub fn kind(&self) -> OperationKind {
        match self {
            OperationSpec::Build(_) => OperationKind::Build,
            OperationSpec::Pull(_) => OperationKind::Pull,
            OperationSpec::Tag(_) => OperationKind::Tag,
            OperationSpec::Inspect(_) => OperationKind::Inspect,
        }
    }

    pub fn pool(&self) -> CapacityPool {
        match self {
            OperationSpec::Build(_) => CapacityPool::Build,
            _ => CapacityPool::Copy,
        }
    }

    /// ビルドのみ資源量を持つ。コピー系は常に小さいジョブとして扱う
    pub fn footprint(&self) -> Option<Footprint> {
        match self {
            OperationSpec::Build(build) => Some(Footprint {
                cpu_millis: build.cpu_millis,
                memory_bytes: build.memory_bytes,
            }),
            _ => None,
        }
    }

    pub fn credentials(&self) -> Option<&RegistryCredentials> {
        match self {
            OperationSpec::Build(build) => Some(&build.credentials),
            OperationSpec::Pull(copy) | OperationSpec::Tag(copy) => Some(&copy.credentials),
            OperationSpec::Inspect(_) => None,
        }
    }

    /// ログ用の短い説明
    pub fn describe(&self) -> String {
        match self {
            OperationSpec::Build(build) => format!("{:?}", build.tags),
            OperationSpec::Pull(copy) | OperationSpec::Tag(copy) => {
                format!("{} -> {}", copy.source, copy.destination)
            }
            OperationSpec::Inspect(inspect) => inspect.image.clone(),
        }
    }
}

/// ビルド設定
#[derive(Debug, Clone, PartialEq)]
pub struct BuildSpec {
    pub build_args: BTreeMap<String, String>,
    pub labels: BTreeMap<String, String>,
    /// コンテキストからの相対パス
    pub dockerfile: String,
    pub target: Option<String>,
    /// 呼び出し側が指定したタグ（内部レジストリへの変換前）
    pub tags: Vec<String>,
    pub cpu_millis: u64,
    pub memory_bytes: u64,
    pub cache_from: Option<String>,
    pub no_cache: bool,
    pub credentials: RegistryCredentials,
}

impl Default for BuildSpec {
    fn default() -> Self {
        Self {
            build_args: BTreeMap::new(),
            labels: BTreeMap::new(),
            dockerfile: DEFAULT_DOCKERFILE.to_string(),
            target: None,
            tags: Vec::new(),
            cpu_millis: 1000 * DEFAULT_CPU_QUOTA / DEFAULT_CPU_PERIOD,
            memory_bytes: DEFAULT_MEMORY_BYTES,
            cache_from: None,
            no_cache: false,
            credentials: RegistryCredentials::default(),
        }
    }
}

impl BuildSpec {
    /// Dockerfile のディレクトリ部分（コンテキスト相対、空なら `.`）
    pub fn dockerfile_dir(&self) -> &str {
        match self.dockerfile.rsplit_once('/') {
            Some((dir, _)) if !dir.is_empty() => dir,
            _ => ".",
        }
    }

    /// Dockerfile のファイル名部分
    pub fn dockerfile_name(&self) -> &str {
        match self.dockerfile.rsplit_once('/') {
            Some((_, name)) => name,
            None => &self.dockerfile,
        }
    }
}

/// skopeo によるイメージコピー（pull / tag）
#[derive(Debug, Clone, PartialEq)]
pub struct CopySpec {
    /// 完全な参照（`docker://` は含まない）
    pub source: String,
    pub destination: String,
    /// コピー元が内部レジストリでなければ TLS 検証を行う
    pub source_tls_verify: bool,
    pub credentials: RegistryCredentials,
}

/// 内部レジストリ上のイメージ検査
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InspectSpec {
    pub image: String,
}
