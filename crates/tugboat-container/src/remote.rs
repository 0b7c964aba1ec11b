//! リモート実行バックエンド
//!
//! 操作をクラスタ上の一時的なワークロードとして実行します。
//! ビルドコンテキストはオブジェクトストアに置き、署名付き URL で渡します。
//! 作成したリソース（ワークロード・認証情報・コンテキスト）は成功・失敗・キャンセルの
//! いずれの場合も、独立した期限のもとで1回ずつ削除されます。

use crate::error::{ExecError, Result};
use crate::runtime::{ExecReport, ExecutionBackend};
use crate::waiter::{WaitConfig, WorkloadWaiter};
use crate::workload::{CREDENTIAL_KEY, CREDENTIAL_PREFIX, WorkloadConfig, workload_spec};
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{FutureExt, StreamExt};
use std::any::Any;
use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tugboat_build::OutputSink;
use tugboat_cloud::{ClusterClient, ObjectStore, PodPhase, ResourceHandle};
use tugboat_core::{InternalRegistry, OperationSpec};

/// リモート実行の設定
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteConfig {
    pub workload: WorkloadConfig,
    pub wait: WaitConfig,
    /// 後片付けの期限
    pub cleanup_timeout: Duration,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            workload: WorkloadConfig::default(),
            wait: WaitConfig::default(),
            cleanup_timeout: Duration::from_secs(10),
        }
    }
}

/// 1回の実行で作成したリソース
#[derive(Debug, Default)]
struct CreatedResources {
    staged_context: Option<String>,
    credential: Option<ResourceHandle>,
    workload: Option<ResourceHandle>,
}

pub struct RemoteBackend {
    cluster: Arc<dyn ClusterClient>,
    store: Arc<dyn ObjectStore>,
    registry: InternalRegistry,
    config: RemoteConfig,
}

impl RemoteBackend {
    pub fn new(
        cluster: Arc<dyn ClusterClient>,
        store: Arc<dyn ObjectStore>,
        registry: InternalRegistry,
        config: RemoteConfig,
    ) -> Self {
        Self {
            cluster,
            store,
            registry,
            config,
        }
    }

    async fn run(
        &self,
        op: &OperationSpec,
        context: Option<Bytes>,
        sink: &mut dyn OutputSink,
        created: &mut CreatedResources,
    ) -> Result<ExecReport> {
        let execution_timeout = self.config.workload.execution_timeout;

        // 1. ビルドコンテキストを置く
        let context_url = match (op, context) {
            (OperationSpec::Build(_), Some(context)) => {
                let key = self
                    .store
                    .store(context)
                    .await
                    .map_err(|source| ExecError::ResourceCreation {
                        resource: "build context",
                        source,
                    })?;
                created.staged_context = Some(key.clone());

                let url = self
                    .store
                    .presign_download(&key, execution_timeout)
                    .await
                    .map_err(|source| ExecError::ResourceCreation {
                        resource: "build context url",
                        source,
                    })?;
                Some(url)
            }
            _ => None,
        };

        // 2. 認証情報
        if let Some(credentials) = op.credentials().filter(|c| !c.is_empty()) {
            let mut data = BTreeMap::new();
            data.insert(CREDENTIAL_KEY.to_string(), credentials.to_config_json());

            match self
                .cluster
                .create_credential_object(CREDENTIAL_PREFIX, data)
                .await
            {
                Ok(handle) => created.credential = Some(handle),
                Err(source) => {
                    sink.write_line(&format!("Secret creation failed: {}", source))
                        .await?;
                    return Err(ExecError::ResourceCreation {
                        resource: "secret",
                        source,
                    });
                }
            }
        }

        // 3. ワークロード
        let spec = workload_spec(
            op,
            &self.registry,
            &self.config.workload,
            context_url.as_deref(),
            created.credential.as_ref().map(|h| h.name.as_str()),
        )?;

        // 4. 作成
        match self.cluster.create_workload(&spec).await {
            Ok(handle) => {
                tracing::info!("Created {} for {} {}", handle, op.kind(), op.describe());
                created.workload = Some(handle);
            }
            Err(source) => {
                sink.write_line(&format!("Workload creation failed: {}", source))
                    .await?;
                return Err(ExecError::ResourceCreation {
                    resource: "workload",
                    source,
                });
            }
        }

        // 5. Pod の起動を待つ
        let mut waiter =
            WorkloadWaiter::new(self.cluster.as_ref(), spec.selector(), self.config.wait);
        let pod = waiter.wait_for_start().await?;

        // 6. ログを中継
        waiter.streaming(&pod.name);
        let mut logs = self.cluster.stream_logs(&pod.name, true).await?;
        while let Some(chunk) = logs.next().await {
            match chunk {
                Ok(chunk) => sink.write(chunk).await?,
                Err(e) => {
                    sink.write_line(&format!("log stream error: {}", e)).await?;
                    break;
                }
            }
        }

        let terminal = waiter.wait_for_terminal().await?;
        match terminal.phase {
            PodPhase::Succeeded => Ok(ExecReport::default()),
            _ => Err(ExecError::Execution(format!(
                "workload {} failed: {}",
                spec.name,
                terminal.message.as_deref().unwrap_or("pod failed")
            ))),
        }
    }

    /// 作成したリソースを削除する
    ///
    /// 削除の失敗はログに残すだけで、結果には影響しない。
    async fn cleanup(&self, created: CreatedResources) {
        let cleanup = async {
            if let Some(handle) = &created.workload {
                match self.cluster.delete(handle).await {
                    Ok(()) => tracing::debug!("Deleted {}", handle),
                    Err(e) => tracing::warn!("Failed to delete {}: {}", handle, e),
                }
            }
            if let Some(handle) = &created.credential {
                match self.cluster.delete(handle).await {
                    Ok(()) => tracing::debug!("Deleted {}", handle),
                    Err(e) => tracing::warn!("Failed to delete {}: {}", handle, e),
                }
            }
            if let Some(key) = &created.staged_context {
                if let Err(e) = self.store.delete(key).await {
                    tracing::warn!("Failed to delete staged context {}: {}", key, e);
                }
            }
        };

        if tokio::time::timeout(self.config.cleanup_timeout, cleanup)
            .await
            .is_err()
        {
            tracing::error!(
                "Cleanup did not finish within {}s: {:?}",
                self.config.cleanup_timeout.as_secs(),
                created
            );
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}

#[async_trait]
impl ExecutionBackend for RemoteBackend {
    fn name(&self) -> &'static str {
        "remote"
    }

    async fn execute(
        &self,
        op: &OperationSpec,
        context: Option<Bytes>,
        sink: &mut dyn OutputSink,
        cancel: CancellationToken,
    ) -> Result<ExecReport> {
        let mut created = CreatedResources::default();
        let execution_timeout = self.config.workload.execution_timeout;

        // パニックしても作成済みのリソースは削除する
        let result = tokio::select! {
            _ = cancel.cancelled() => Err(ExecError::Cancelled),
            _ = tokio::time::sleep(execution_timeout) => Err(ExecError::Timeout(execution_timeout)),
            result = AssertUnwindSafe(self.run(op, context, sink, &mut created)).catch_unwind() => {
                result.unwrap_or_else(|panic| {
                    let message = panic_message(panic.as_ref());
                    tracing::error!("Remote {} panicked: {}", op.kind(), message);
                    Err(ExecError::Execution(format!("remote execution panicked: {}", message)))
                })
            }
        };

        self.cleanup(created).await;
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tugboat_build::{BufferSink, StreamEncoder};
    use tugboat_cloud::ResourceKind;
    use tugboat_cloud::fake::{ClusterCall, FakeCluster, FakeObjectStore};
    use tugboat_core::{BuildSpec, CopySpec, RegistryCredentials};

    fn credentials() -> RegistryCredentials {
        RegistryCredentials::from_registry_config(Some(
            r#"{"ghcr.io":{"username":"u","password":"p"}}"#,
        ))
        .unwrap()
    }

    fn build_op(credentials: RegistryCredentials) -> OperationSpec {
        OperationSpec::Build(BuildSpec {
            tags: vec!["myapp:latest".to_string()],
            cpu_millis: 4000,
            credentials,
            ..Default::default()
        })
    }

    fn tag_op() -> OperationSpec {
        OperationSpec::Tag(CopySpec {
            source: "reg/digests@sha256:ab".to_string(),
            destination: "reg/images/myapp_stable".to_string(),
            source_tls_verify: false,
            credentials: RegistryCredentials::default(),
        })
    }

    fn backend(cluster: Arc<FakeCluster>, store: Arc<FakeObjectStore>) -> RemoteBackend {
        RemoteBackend::new(
            cluster,
            store,
            InternalRegistry::new("reg"),
            RemoteConfig::default(),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_build_success_streams_logs_and_cleans_up() {
        let digest = format!("sha256:{}", "c".repeat(64));
        let cluster = Arc::new(
            FakeCluster::new()
                .with_observations(vec![Some(PodPhase::Pending), Some(PodPhase::Running)])
                .with_logs(vec![
                    "#1 load build definition\n".to_string(),
                    format!("#9 exporting manifest {} done\n", digest),
                ]),
        );
        let store = Arc::new(FakeObjectStore::new());
        let backend = backend(cluster.clone(), store.clone());

        let (tx, mut rx) = tokio::sync::mpsc::channel(64);
        let mut encoder = StreamEncoder::capturing(tx);

        let report = backend
            .execute(
                &build_op(credentials()),
                Some(Bytes::from_static(b"context")),
                &mut encoder,
                CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(report.image_digest, None);
        assert_eq!(encoder.finish_build(report.image_digest).await.unwrap(), digest);
        drop(encoder);

        let mut lines = Vec::new();
        while let Some(line) = rx.recv().await {
            lines.push(String::from_utf8(line.to_vec()).unwrap());
        }
        assert_eq!(lines.len(), 3);
        assert!(lines[2].contains(&digest));

        assert_eq!(cluster.created(ResourceKind::Credential), 1);
        assert_eq!(cluster.deleted(ResourceKind::Credential), 1);
        assert_eq!(cluster.created(ResourceKind::Workload), 1);
        assert_eq!(cluster.deleted(ResourceKind::Workload), 1);
        assert_eq!(store.stored(), 1);
        assert_eq!(store.deleted().len(), 1);

        let workload = &cluster.workloads()[0];
        assert!(workload.command.iter().any(|a| a.starts_with("https://objects.test/")));
        let secret = match &cluster.calls()[0] {
            ClusterCall::CreateCredential(name) => name.clone(),
            other => panic!("unexpected first call {:?}", other),
        };
        let data = cluster.credential_data(&secret).unwrap();
        assert!(data[CREDENTIAL_KEY].contains("ghcr.io"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_pod_is_execution_error() {
        let cluster = Arc::new(
            FakeCluster::new()
                .with_logs(vec!["error: failed to solve\n"])
                .with_final_phase(PodPhase::Failed),
        );
        let store = Arc::new(FakeObjectStore::new());
        let backend = backend(cluster.clone(), store.clone());
        let mut sink = BufferSink::new();

        let err = backend
            .execute(
                &build_op(credentials()),
                Some(Bytes::from_static(b"context")),
                &mut sink,
                CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ExecError::Execution(_)));
        assert_eq!(sink.as_bytes(), b"error: failed to solve\n");

        assert_eq!(cluster.deleted(ResourceKind::Credential), 1);
        assert_eq!(cluster.deleted(ResourceKind::Workload), 1);
        assert_eq!(store.deleted().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_utf8_output_does_not_end_log_relay() {
        let digest = format!("sha256:{}", "d".repeat(64));
        let cluster = Arc::new(FakeCluster::new().with_logs(vec![
            Bytes::from_static(b"#5 RUN head -c 4 /dev/urandom\n"),
            Bytes::from_static(b"\xff\xfe\x00\x80\n"),
            Bytes::from(format!("#9 exporting manifest {} done\n", digest)),
        ]));
        let store = Arc::new(FakeObjectStore::new());
        let backend = backend(cluster.clone(), store.clone());

        let (tx, mut rx) = tokio::sync::mpsc::channel(64);
        let mut encoder = StreamEncoder::capturing(tx);
        let report = backend
            .execute(
                &build_op(RegistryCredentials::default()),
                Some(Bytes::from_static(b"context")),
                &mut encoder,
                CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(encoder.finish_build(report.image_digest).await.unwrap(), digest);
        drop(encoder);

        let mut count = 0;
        while rx.recv().await.is_some() {
            count += 1;
        }
        assert_eq!(count, 4);
    }

    #[tokio::test]
    async fn test_panic_during_run_still_cleans_up() {
        let cluster = Arc::new(FakeCluster::new().panicking_workload_creation());
        let store = Arc::new(FakeObjectStore::new());
        let backend = backend(cluster.clone(), store.clone());
        let mut sink = BufferSink::new();

        let err = backend
            .execute(
                &build_op(credentials()),
                Some(Bytes::from_static(b"context")),
                &mut sink,
                CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ExecError::Execution(ref m) if m.contains("panicked")));

        assert_eq!(cluster.created(ResourceKind::Credential), 1);
        assert_eq!(cluster.deleted(ResourceKind::Credential), 1);
        assert_eq!(store.stored(), 1);
        assert_eq!(store.deleted().len(), 1);
    }

    #[tokio::test]
    async fn test_workload_creation_failure_still_deletes_credential() {
        let cluster = Arc::new(FakeCluster::new().failing_workload_creation());
        let store = Arc::new(FakeObjectStore::new());
        let backend = backend(cluster.clone(), store.clone());
        let mut sink = BufferSink::new();

        let err = backend
            .execute(
                &build_op(credentials()),
                Some(Bytes::from_static(b"context")),
                &mut sink,
                CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ExecError::ResourceCreation {
                resource: "workload",
                ..
            }
        ));
        let output = String::from_utf8(sink.as_bytes().to_vec()).unwrap();
        assert!(output.starts_with("Workload creation failed"));

        assert_eq!(cluster.created(ResourceKind::Credential), 1);
        assert_eq!(cluster.deleted(ResourceKind::Credential), 1);
        // 作成に失敗したワークロードは削除しない
        assert_eq!(cluster.deleted(ResourceKind::Workload), 0);
        assert_eq!(store.deleted().len(), 1);
    }

    #[tokio::test]
    async fn test_cancellation_during_log_stream_cleans_up() {
        let cluster = Arc::new(
            FakeCluster::new()
                .with_logs(vec!["#1 building\n"])
                .with_hanging_logs(),
        );
        let store = Arc::new(FakeObjectStore::new());
        let backend = Arc::new(backend(cluster.clone(), store.clone()));
        let cancel = CancellationToken::new();

        let task = {
            let backend = backend.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let mut sink = BufferSink::new();
                backend
                    .execute(
                        &build_op(credentials()),
                        Some(Bytes::from_static(b"context")),
                        &mut sink,
                        cancel,
                    )
                    .await
            })
        };

        // ログのストリーミングが始まるまで待つ
        while !cluster
            .calls()
            .iter()
            .any(|c| matches!(c, ClusterCall::StreamLogs(_)))
        {
            tokio::task::yield_now().await;
        }
        cancel.cancel();

        let err = task.await.unwrap().unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(
            cluster.created(ResourceKind::Credential),
            cluster.deleted(ResourceKind::Credential)
        );
        assert_eq!(cluster.deleted(ResourceKind::Workload), 1);
        assert_eq!(store.deleted().len(), 1);
    }

    #[tokio::test]
    async fn test_delete_failures_do_not_change_outcome() {
        let cluster = Arc::new(FakeCluster::new().failing_deletes());
        let store = Arc::new(FakeObjectStore::new());
        let backend = backend(cluster.clone(), store.clone());
        let mut sink = BufferSink::new();

        backend
            .execute(&tag_op(), None, &mut sink, CancellationToken::new())
            .await
            .unwrap();

        // 削除は1回だけ試みられ、再試行されない
        assert_eq!(cluster.deleted(ResourceKind::Workload), 1);
        assert_eq!(cluster.created(ResourceKind::Credential), 0);
        assert_eq!(cluster.deleted(ResourceKind::Credential), 0);
        assert_eq!(store.stored(), 0);
    }
}
