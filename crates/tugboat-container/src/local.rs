//! ローカル実行バックエンド
//!
//! ホスト上で buildctl（ローカルの buildkitd に接続）や skopeo をサブプロセスとして実行します。
//! 認証情報は一時的な `HOME/.docker/config.json` に書き出し、
//! サブプロセスの環境変数でのみ参照させます。

use crate::error::{ExecError, Result};
use crate::runtime::{ExecReport, ExecutionBackend};
use async_trait::async_trait;
use bytes::Bytes;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tempfile::TempDir;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::LinesStream;
use tokio_util::sync::CancellationToken;
use tugboat_build::command::{
    copy_command, inspect_fetch_command, inspect_read_command, local_build_command,
};
use tugboat_build::digest::read_metadata_file;
use tugboat_build::{BufferSink, BuildContext, BuildctlArgs, OutputSink};
use tugboat_core::{
    BuildSpec, CopySpec, InspectSpec, InternalRegistry, OperationSpec, RegistryCredentials,
};

/// ローカルの buildkitd のデフォルトアドレス
pub const DEFAULT_BUILDKITD_ADDR: &str = "tcp://127.0.0.1:1234";

/// ローカル実行の設定
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalConfig {
    pub buildkitd_addr: String,
    /// サブプロセスの実行時間の上限
    pub timeout: Duration,
}

impl Default for LocalConfig {
    fn default() -> Self {
        Self {
            buildkitd_addr: DEFAULT_BUILDKITD_ADDR.to_string(),
            timeout: Duration::from_secs(30 * 60),
        }
    }
}

pub struct LocalBackend {
    registry: InternalRegistry,
    config: LocalConfig,
}

impl LocalBackend {
    pub fn new(registry: InternalRegistry, config: LocalConfig) -> Self {
        Self { registry, config }
    }

    async fn build(
        &self,
        spec: &BuildSpec,
        context: Option<Bytes>,
        sink: &mut dyn OutputSink,
        cancel: &CancellationToken,
    ) -> Result<ExecReport> {
        let context =
            context.ok_or_else(|| ExecError::Execution("missing build context".to_string()))?;

        let scratch = tempfile::Builder::new()
            .prefix("tugboat-context-")
            .tempdir()?;
        let context_dir = scratch.path().join("context");
        let metadata_path = scratch.path().join("metadata.json");

        let target = context_dir.clone();
        tokio::task::spawn_blocking(move || {
            std::fs::create_dir_all(&target)?;
            BuildContext::extract(&context, &target)
        })
        .await
        .map_err(|e| ExecError::Execution(format!("extract context: {}", e)))?
        .map_err(|e| ExecError::Execution(format!("extract context: {}", e)))?;

        let home = CredentialHome::create(&spec.credentials).await?;

        let args = BuildctlArgs::new(spec, &self.registry)
            .context_dir(context_dir.to_string_lossy())
            .metadata_file(metadata_path.to_string_lossy());
        let argv = local_build_command(&self.config.buildkitd_addr, &args);

        let status = self.run(&argv, home.path(), sink, cancel).await?;
        check_status("execute build", status)?;

        let image_digest = match read_metadata_file(&metadata_path).await {
            Ok(digest) => digest,
            Err(e) => {
                tracing::warn!("Failed to read build metadata: {}", e);
                None
            }
        };

        Ok(ExecReport { image_digest })
    }

    async fn copy(
        &self,
        spec: &CopySpec,
        sink: &mut dyn OutputSink,
        cancel: &CancellationToken,
    ) -> Result<ExecReport> {
        let home = CredentialHome::create(&spec.credentials).await?;
        let status = self
            .run(&copy_command(spec), home.path(), sink, cancel)
            .await?;
        check_status("execute copy", status)?;
        Ok(ExecReport::default())
    }

    async fn inspect(
        &self,
        spec: &InspectSpec,
        sink: &mut dyn OutputSink,
        cancel: &CancellationToken,
    ) -> Result<ExecReport> {
        let home = CredentialHome::create(&RegistryCredentials::default()).await?;
        let dir = home.path().join("inspect-image");
        let dir = dir.to_string_lossy();

        // 取り出し段階の出力は失敗したときだけ返す
        let mut fetch_output = BufferSink::new();
        let status = self
            .run(
                &inspect_fetch_command(spec, &dir),
                home.path(),
                &mut fetch_output,
                cancel,
            )
            .await?;
        if !status.success() {
            sink.write(fetch_output.into_bytes()).await?;
            return Err(ExecError::Execution(format!(
                "fetch {}: {}",
                spec.image, status
            )));
        }

        let status = self
            .run(&inspect_read_command(&dir), home.path(), sink, cancel)
            .await?;
        check_status("inspect image", status)?;
        Ok(ExecReport::default())
    }

    /// サブプロセスを実行し、stdout / stderr を行単位で `sink` に流す
    ///
    /// キャンセルやタイムアウトではプロセスを kill する。
    async fn run(
        &self,
        argv: &[String],
        home: &Path,
        sink: &mut dyn OutputSink,
        cancel: &CancellationToken,
    ) -> Result<ExitStatus> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| ExecError::Execution("empty command".to_string()))?;

        tracing::debug!("Running {} {:?}", program, args);

        let mut child = Command::new(program)
            .args(args)
            .env("HOME", home)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ExecError::Execution(format!("start {}: {}", program, e)))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ExecError::Execution("stdout not captured".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| ExecError::Execution("stderr not captured".to_string()))?;

        let mut lines = LinesStream::new(BufReader::new(stdout).lines())
            .merge(LinesStream::new(BufReader::new(stderr).lines()));

        let deadline = tokio::time::sleep(self.config.timeout);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    let _ = child.kill().await;
                    return Err(ExecError::Cancelled);
                }
                _ = &mut deadline => {
                    let _ = child.kill().await;
                    return Err(ExecError::Timeout(self.config.timeout));
                }
                line = lines.next() => match line {
                    Some(Ok(line)) => sink.write_line(&line).await?,
                    Some(Err(e)) => {
                        tracing::warn!("Failed to read output of {}: {}", program, e);
                    }
                    None => break,
                },
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = child.kill().await;
                Err(ExecError::Cancelled)
            }
            _ = &mut deadline => {
                let _ = child.kill().await;
                Err(ExecError::Timeout(self.config.timeout))
            }
            status = child.wait() => Ok(status?),
        }
    }
}

#[async_trait]
impl ExecutionBackend for LocalBackend {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn execute(
        &self,
        op: &OperationSpec,
        context: Option<Bytes>,
        sink: &mut dyn OutputSink,
        cancel: CancellationToken,
    ) -> Result<ExecReport> {
        match op {
            OperationSpec::Build(spec) => self.build(spec, context, sink, &cancel).await,
            OperationSpec::Pull(spec) | OperationSpec::Tag(spec) => {
                self.copy(spec, sink, &cancel).await
            }
            OperationSpec::Inspect(spec) => self.inspect(spec, sink, &cancel).await,
        }
    }
}

fn check_status(what: &str, status: ExitStatus) -> Result<()> {
    if status.success() {
        Ok(())
    } else {
        Err(ExecError::Execution(format!("{}: {}", what, status)))
    }
}

/// サブプロセス用の一時的な HOME
///
/// 認証情報があれば `.docker/config.json` を置く。ドロップ時にディレクトリごと削除される。
struct CredentialHome {
    dir: TempDir,
}

impl CredentialHome {
    async fn create(credentials: &RegistryCredentials) -> Result<Self> {
        let dir = tempfile::Builder::new().prefix("tugboat-home-").tempdir()?;

        if !credentials.is_empty() {
            let docker_dir = dir.path().join(".docker");
            tokio::fs::create_dir_all(&docker_dir)
                .await
                .map_err(|e| ExecError::Execution(format!("write registry config: {}", e)))?;
            tokio::fs::write(docker_dir.join("config.json"), credentials.to_config_json())
                .await
                .map_err(|e| ExecError::Execution(format!("write registry config: {}", e)))?;
        }

        Ok(Self { dir })
    }

    fn path(&self) -> &Path {
        self.dir.path()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::Engine as _;
    use tugboat_build::StreamEncoder;

    fn backend(timeout: Duration) -> LocalBackend {
        LocalBackend::new(
            InternalRegistry::default(),
            LocalConfig {
                timeout,
                ..Default::default()
            },
        )
    }

    fn sh(script: &str) -> Vec<String> {
        vec!["sh".to_string(), "-c".to_string(), script.to_string()]
    }

    #[tokio::test]
    async fn test_run_streams_stdout_and_stderr() {
        let backend = backend(Duration::from_secs(30));
        let home = CredentialHome::create(&RegistryCredentials::default())
            .await
            .unwrap();
        let mut sink = BufferSink::new();

        let status = backend
            .run(
                &sh("echo out; echo err 1>&2; echo \"$HOME\""),
                home.path(),
                &mut sink,
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert!(status.success());

        let output = String::from_utf8(sink.as_bytes().to_vec()).unwrap();
        assert!(output.contains("out\n"));
        assert!(output.contains("err\n"));
        assert!(output.contains(&home.path().to_string_lossy().to_string()));
    }

    #[tokio::test]
    async fn test_run_reports_failure_status() {
        let backend = backend(Duration::from_secs(30));
        let home = CredentialHome::create(&RegistryCredentials::default())
            .await
            .unwrap();
        let mut sink = BufferSink::new();

        let status = backend
            .run(&sh("exit 3"), home.path(), &mut sink, &CancellationToken::new())
            .await
            .unwrap();
        assert!(check_status("execute copy", status).is_err());
    }

    #[tokio::test]
    async fn test_run_timeout_kills_process() {
        let backend = backend(Duration::from_millis(200));
        let home = CredentialHome::create(&RegistryCredentials::default())
            .await
            .unwrap();
        let mut sink = BufferSink::new();

        let err = backend
            .run(&sh("sleep 30"), home.path(), &mut sink, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ExecError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_run_cancellation() {
        let backend = backend(Duration::from_secs(30));
        let home = CredentialHome::create(&RegistryCredentials::default())
            .await
            .unwrap();
        let mut sink = BufferSink::new();
        let cancel = CancellationToken::new();

        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            trigger.cancel();
        });

        let err = backend
            .run(&sh("echo started; sleep 30"), home.path(), &mut sink, &cancel)
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
    }

    #[tokio::test]
    async fn test_run_stops_when_client_disconnects() {
        let backend = backend(Duration::from_secs(30));
        let home = CredentialHome::create(&RegistryCredentials::default())
            .await
            .unwrap();
        let (tx, rx) = tokio::sync::mpsc::channel(1);
        drop(rx);
        let mut encoder = StreamEncoder::new(tx);

        let err = backend
            .run(
                &sh("echo hello; sleep 30"),
                home.path(),
                &mut encoder,
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
    }

    #[tokio::test]
    async fn test_credential_home_writes_config_and_cleans_up() {
        let header = base64::engine::general_purpose::URL_SAFE
            .encode(r#"{"username":"u","password":"p","serveraddress":"ghcr.io"}"#);
        let credentials =
            RegistryCredentials::from_registry_auth(Some(&header), "ghcr.io/x").unwrap();

        let home = CredentialHome::create(&credentials).await.unwrap();
        let config_path = home.path().join(".docker/config.json");
        let config: serde_json::Value =
            serde_json::from_str(&std::fs::read_to_string(&config_path).unwrap()).unwrap();
        assert!(config["auths"]["ghcr.io"]["auth"].is_string());

        let root = home.path().to_path_buf();
        drop(home);
        assert!(!root.exists());
    }

    #[tokio::test]
    async fn test_credential_home_without_credentials_has_no_config() {
        let home = CredentialHome::create(&RegistryCredentials::default())
            .await
            .unwrap();
        assert!(!home.path().join(".docker").exists());
    }

    #[tokio::test]
    async fn test_build_without_context_is_error() {
        let backend = backend(Duration::from_secs(30));
        let mut sink = BufferSink::new();
        let err = backend
            .execute(
                &OperationSpec::Build(BuildSpec::default()),
                None,
                &mut sink,
                CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "missing build context");
    }
}
