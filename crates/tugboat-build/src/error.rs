use thiserror::Error;

#[derive(Debug, Error)]
pub enum BuildError {
    #[error("invalid build context: {0}")]
    InvalidContext(String),

    #[error("digest not found")]
    DigestNotFound,

    #[error("parse build metadata: {0}")]
    Metadata(#[from] serde_json::Error),

    #[error("output stream closed by client")]
    StreamClosed,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl BuildError {
    /// クライアントの切断によるエラーかどうか
    pub fn is_disconnect(&self) -> bool {
        matches!(self, BuildError::StreamClosed)
    }
}

pub type Result<T> = std::result::Result<T, BuildError>;
