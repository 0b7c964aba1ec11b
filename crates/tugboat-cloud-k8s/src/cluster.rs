//! `ClusterClient` backed by the Kubernetes API

use crate::error::K8sError;
use crate::manifest::{job_manifest, pod_info, secret_manifest};
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::BoxStream;
use futures_util::{AsyncBufRead, AsyncBufReadExt, StreamExt};
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{Pod, Secret};
use kube::api::{Api, DeleteParams, ListParams, LogParams, PostParams, WatchEvent as KubeEvent, WatchParams};
use kube::Client;
use std::collections::BTreeMap;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tugboat_cloud::{
    ClusterClient, CloudError, PodInfo, ResourceHandle, ResourceKind, Result, WatchEvent,
    WorkloadSpec,
};

/// API server rejects watch timeouts close to its own limit
const MAX_WATCH_SECS: u64 = 290;

const EVENT_BUFFER: usize = 64;

/// Kubernetes cluster client scoped to one namespace
#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
    namespace: String,
}

impl KubeCluster {
    pub fn new(client: Client, namespace: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
        }
    }

    /// Connect with the in-cluster service account or the local kubeconfig
    pub async fn connect(namespace: impl Into<String>) -> Result<Self> {
        let client = Client::try_default().await.map_err(K8sError::from)?;
        let cluster = Self::new(client, namespace);
        tracing::info!("Connected to cluster (namespace: {})", cluster.namespace);
        Ok(cluster)
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    fn jobs(&self) -> Api<Job> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    fn secrets(&self) -> Api<Secret> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    fn pods(&self) -> Api<Pod> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }
}

fn kube_err(e: kube::Error) -> CloudError {
    K8sError::from(e).into()
}

#[async_trait]
impl ClusterClient for KubeCluster {
    async fn create_workload(&self, spec: &WorkloadSpec) -> Result<ResourceHandle> {
        let job = job_manifest(spec)?;
        let created = self
            .jobs()
            .create(&PostParams::default(), &job)
            .await
            .map_err(kube_err)?;

        let name = created.metadata.name.unwrap_or_else(|| spec.name.clone());
        tracing::debug!("Created job {}", name);
        Ok(ResourceHandle::workload(name))
    }

    async fn create_credential_object(
        &self,
        prefix: &str,
        data: BTreeMap<String, String>,
    ) -> Result<ResourceHandle> {
        let secret = secret_manifest(prefix, &data)?;
        let created = self
            .secrets()
            .create(&PostParams::default(), &secret)
            .await
            .map_err(kube_err)?;

        let name = created
            .metadata
            .name
            .ok_or_else(|| CloudError::ApiError("secret created without a name".to_string()))?;
        tracing::debug!("Created secret {}", name);
        Ok(ResourceHandle::credential(name))
    }

    async fn watch(
        &self,
        selector: &str,
        timeout: Duration,
    ) -> Result<BoxStream<'static, Result<WatchEvent>>> {
        let secs = timeout.as_secs().clamp(1, MAX_WATCH_SECS) as u32;
        let params = WatchParams::default().labels(selector).timeout(secs);
        let api = self.pods();
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);

        // The kube stream borrows its Api, so both live in a forwarding task
        tokio::spawn(async move {
            let events = match api.watch(&params, "0").await {
                Ok(events) => events,
                Err(e) => {
                    let _ = tx.send(Err(kube_err(e))).await;
                    return;
                }
            };
            let mut events = Box::pin(events);

            while let Some(event) = events.next().await {
                let item = match event {
                    Ok(KubeEvent::Added(pod)) | Ok(KubeEvent::Modified(pod)) => {
                        Ok(WatchEvent::Changed(pod.metadata.name.unwrap_or_default()))
                    }
                    Ok(KubeEvent::Deleted(pod)) => {
                        Ok(WatchEvent::Deleted(pod.metadata.name.unwrap_or_default()))
                    }
                    Ok(KubeEvent::Bookmark(_)) => continue,
                    Ok(KubeEvent::Error(e)) => Err(CloudError::ApiError(format!("{:?}", e))),
                    Err(e) => Err(kube_err(e)),
                };
                if tx.send(item).await.is_err() {
                    break;
                }
            }
        });

        Ok(ReceiverStream::new(rx).boxed())
    }

    async fn pods_by_selector(&self, selector: &str) -> Result<Vec<PodInfo>> {
        let pods = self
            .pods()
            .list(&ListParams::default().labels(selector))
            .await
            .map_err(kube_err)?;
        Ok(pods.items.iter().map(pod_info).collect())
    }

    async fn stream_logs(
        &self,
        pod: &str,
        follow: bool,
    ) -> Result<BoxStream<'static, Result<Bytes>>> {
        let api = self.pods();
        let pod = pod.to_string();
        let params = LogParams {
            follow,
            ..Default::default()
        };
        let (tx, rx) = mpsc::channel(EVENT_BUFFER);

        tokio::spawn(async move {
            let reader = match api.log_stream(&pod, &params).await {
                Ok(reader) => reader,
                Err(e) => {
                    let _ = tx.send(Err(kube_err(e))).await;
                    return;
                }
            };
            forward_lines(Box::pin(reader), tx).await;
        });

        Ok(ReceiverStream::new(rx).boxed())
    }

    async fn delete(&self, handle: &ResourceHandle) -> Result<()> {
        let params = DeleteParams::background();
        let result = match handle.kind {
            ResourceKind::Workload => self.jobs().delete(&handle.name, &params).await.map(|_| ()),
            ResourceKind::Credential => {
                self.secrets().delete(&handle.name, &params).await.map(|_| ())
            }
        };
        result.map_err(kube_err)?;
        tracing::debug!("Deleted {}", handle);
        Ok(())
    }
}

/// Forward raw log lines until EOF or the first read error
///
/// Lines are passed through as bytes; output that is not UTF-8 must not end
/// the stream.
async fn forward_lines<R>(mut reader: R, tx: mpsc::Sender<Result<Bytes>>)
where
    R: AsyncBufRead + Unpin,
{
    loop {
        let mut line = Vec::new();
        let item = match reader.read_until(b'\n', &mut line).await {
            Ok(0) => break,
            Ok(_) => Ok(Bytes::from(line)),
            Err(e) => Err(CloudError::Io(e)),
        };
        let failed = item.is_err();
        if tx.send(item).await.is_err() || failed {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::io::Cursor;

    #[tokio::test]
    async fn test_forward_lines_passes_binary_output() {
        let mut log = b"#5 RUN head -c 4 /dev/urandom\n".to_vec();
        log.extend_from_slice(b"\xff\xfe\x00\x80\n");
        log.extend_from_slice(b"#9 exporting manifest sha256:ab done");

        let (tx, rx) = mpsc::channel(8);
        forward_lines(Cursor::new(log), tx).await;

        let lines: Vec<Bytes> = ReceiverStream::new(rx)
            .map(|item| item.unwrap())
            .collect()
            .await;
        assert_eq!(lines.len(), 3);
        assert_eq!(&lines[1][..], b"\xff\xfe\x00\x80\n");
        assert_eq!(&lines[2][..], b"#9 exporting manifest sha256:ab done");
    }
}
