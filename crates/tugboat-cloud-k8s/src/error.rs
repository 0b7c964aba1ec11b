//! Kubernetes client error types

use thiserror::Error;
use tugboat_cloud::CloudError;

#[derive(Error, Debug)]
pub enum K8sError {
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    #[error("Invalid manifest: {0}")]
    Manifest(#[from] serde_json::Error),
}

impl K8sError {
    /// HTTP status returned by the API server, if any
    pub fn status_code(&self) -> Option<u16> {
        match self {
            K8sError::Kube(kube::Error::Api(resp)) => Some(resp.code),
            _ => None,
        }
    }
}

impl From<K8sError> for CloudError {
    fn from(err: K8sError) -> Self {
        match err.status_code() {
            Some(404) => CloudError::ResourceNotFound(err.to_string()),
            Some(409) => CloudError::ResourceAlreadyExists(err.to_string()),
            Some(401) | Some(403) => CloudError::AuthenticationFailed(err.to_string()),
            _ => match err {
                K8sError::Manifest(e) => CloudError::Json(e),
                other => CloudError::ApiError(other.to_string()),
            },
        }
    }
}

pub type Result<T> = std::result::Result<T, K8sError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manifest_error_maps_to_json() {
        let err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let cloud: CloudError = K8sError::Manifest(err).into();
        assert!(matches!(cloud, CloudError::Json(_)));
        assert!(!cloud.is_not_found());
    }
}
