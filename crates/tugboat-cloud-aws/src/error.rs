//! S3 object store error types

use thiserror::Error;
use tugboat_cloud::CloudError;

#[derive(Error, Debug)]
pub enum S3Error {
    #[error("S3 {operation} failed: {message}")]
    Request {
        operation: &'static str,
        message: String,
    },

    #[error("Invalid presign expiry: {0}")]
    Presign(String),
}

impl S3Error {
    pub fn request(operation: &'static str, err: impl std::error::Error) -> Self {
        S3Error::Request {
            operation,
            message: aws_sdk_s3::error::DisplayErrorContext(err).to_string(),
        }
    }
}

impl From<S3Error> for CloudError {
    fn from(err: S3Error) -> Self {
        match err {
            S3Error::Presign(_) => CloudError::InvalidConfig(err.to_string()),
            S3Error::Request { .. } => CloudError::ApiError(err.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, S3Error>;
