use std::time::Duration;
use thiserror::Error;
use tugboat_build::BuildError;
use tugboat_cloud::CloudError;

/// 実行中のエラー
///
/// ストリーミング開始後に発生するため、レスポンス本文の中で報告される。
#[derive(Error, Debug)]
pub enum ExecError {
    #[error("create {resource}: {source}")]
    ResourceCreation {
        resource: &'static str,
        #[source]
        source: CloudError,
    },

    #[error("{0}")]
    Execution(String),

    #[error("digest not found")]
    DigestNotFound,

    #[error("execution cancelled")]
    Cancelled,

    #[error("execution exceeded {}s", .0.as_secs())]
    Timeout(Duration),

    #[error("{0}")]
    Build(BuildError),

    #[error("cluster error: {0}")]
    Cloud(#[from] CloudError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<BuildError> for ExecError {
    fn from(err: BuildError) -> Self {
        match err {
            BuildError::DigestNotFound => ExecError::DigestNotFound,
            BuildError::Io(e) => ExecError::Io(e),
            other => ExecError::Build(other),
        }
    }
}

impl ExecError {
    /// クライアントが切断したか、実行がキャンセルされた
    pub fn is_cancelled(&self) -> bool {
        match self {
            ExecError::Cancelled => true,
            ExecError::Build(e) => e.is_disconnect(),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, ExecError>;
