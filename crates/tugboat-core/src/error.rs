use thiserror::Error;

/// リクエストパラメータの検証エラー
///
/// リソースを一切確保する前に検出され、HTTP 400 とヘルプテキストで返される。
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ParamError {
    #[error("unsupported argument {name} set to '{value}'")]
    Unsupported { name: &'static str, value: String },

    #[error("{0} is missing")]
    Missing(&'static str),

    #[error("{0} is not supported")]
    NotSupported(&'static str),

    #[error("decode {name}: {message}")]
    Invalid { name: &'static str, message: String },

    #[error("extract registry config from {header}: {message}")]
    Credential {
        header: &'static str,
        message: String,
    },
}

impl ParamError {
    /// 問題のあるパラメータ名（分かる場合）
    pub fn parameter(&self) -> Option<&'static str> {
        match self {
            ParamError::Unsupported { name, .. } | ParamError::Invalid { name, .. } => Some(name),
            ParamError::Credential { header, .. } => Some(header),
            ParamError::Missing(_) | ParamError::NotSupported(_) => None,
        }
    }

    /// 認証ヘッダーのデコード失敗かどうか
    pub fn is_credential(&self) -> bool {
        matches!(self, ParamError::Credential { .. })
    }

    pub(crate) fn invalid(name: &'static str, message: impl ToString) -> Self {
        ParamError::Invalid {
            name,
            message: message.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, ParamError>;
