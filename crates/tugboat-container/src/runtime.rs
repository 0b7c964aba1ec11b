use crate::admission::{Admission, AdmissionController};
use crate::error::{ExecError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tugboat_build::OutputSink;
use tugboat_core::OperationSpec;

/// 実行バックエンドのトレイト
///
/// 出力は生成され次第 `sink` に書き込まれ、終了時の結果が戻り値になる。
/// `cancel` が発火したら速やかに中断し、作成したリソースを片付けてから戻る。
#[async_trait]
pub trait ExecutionBackend: Send + Sync {
    fn name(&self) -> &'static str;

    async fn execute(
        &self,
        op: &OperationSpec,
        context: Option<Bytes>,
        sink: &mut dyn OutputSink,
        cancel: CancellationToken,
    ) -> Result<ExecReport>;
}

/// 実行結果
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecReport {
    /// 構造化された結果から得た digest（ビルドのみ）
    pub image_digest: Option<String>,
}

/// アドミッションとバックエンドの組み合わせ
#[derive(Clone)]
pub struct Executor {
    admission: AdmissionController,
    local: Arc<dyn ExecutionBackend>,
    remote: Arc<dyn ExecutionBackend>,
}

impl Executor {
    pub fn new(
        admission: AdmissionController,
        local: Arc<dyn ExecutionBackend>,
        remote: Arc<dyn ExecutionBackend>,
    ) -> Self {
        Self {
            admission,
            local,
            remote,
        }
    }

    pub fn admission(&self) -> &AdmissionController {
        &self.admission
    }

    /// 操作を実行する
    ///
    /// ローカル実行のパーミットは実行が終わるまで保持される。
    pub async fn run(
        &self,
        op: &OperationSpec,
        context: Option<Bytes>,
        sink: &mut dyn OutputSink,
        cancel: CancellationToken,
    ) -> Result<ExecReport> {
        // 枠の待ち時間中もキャンセルを受け付ける
        let admission = tokio::select! {
            _ = cancel.cancelled() => {
                tracing::info!("{} {} cancelled before admission", op.kind(), op.describe());
                return Err(ExecError::Cancelled);
            }
            admission = self.admission.admit(op) => admission,
        };

        let backend = match &admission {
            Admission::Local(_) => &self.local,
            Admission::Remote => &self.remote,
        };
        tracing::debug!("Executing {} on {} backend", op.kind(), backend.name());

        let result = backend.execute(op, context, sink, cancel).await;
        drop(admission);

        if let Err(e) = &result {
            tracing::warn!("{} {} failed: {}", op.kind(), op.describe(), e);
        }
        result
    }
}
