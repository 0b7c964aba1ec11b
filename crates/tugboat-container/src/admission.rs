//! ローカル実行枠の管理
//!
//! ビルド用とコピー用の2つのセマフォを持ち、操作ごとにローカルで実行するか
//! クラスタに回すかを決めます。ローカル実行の間はパーミットを保持し、
//! ドロップ時に必ず1回だけ返却されます。

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tugboat_core::{CapacityPool, DEFAULT_MEMORY_BYTES, Footprint, OperationSpec};

/// アドミッション設定
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdmissionConfig {
    /// 同時にローカル実行できるビルド数
    pub build_capacity: usize,
    /// 同時にローカル実行できるコピー（pull / tag / inspect）数
    pub copy_capacity: usize,
    /// パーミット取得の待ち時間の上限
    pub acquire_timeout: Duration,
    /// これ以下の資源量のビルドのみローカル実行を試みる
    pub local_threshold: Footprint,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            build_capacity: 1,
            copy_capacity: 2,
            acquire_timeout: Duration::from_secs(5),
            local_threshold: Footprint {
                cpu_millis: 1000,
                memory_bytes: DEFAULT_MEMORY_BYTES,
            },
        }
    }
}

/// アドミッションの結果
#[derive(Debug)]
pub enum Admission {
    /// ローカル実行（パーミットを実行終了まで保持する）
    Local(OwnedSemaphorePermit),
    /// クラスタで実行
    Remote,
}

impl Admission {
    pub fn is_local(&self) -> bool {
        matches!(self, Admission::Local(_))
    }
}

/// ローカル実行枠
#[derive(Debug, Clone)]
pub struct AdmissionController {
    build: Arc<Semaphore>,
    copy: Arc<Semaphore>,
    config: AdmissionConfig,
}

impl AdmissionController {
    pub fn new(config: AdmissionConfig) -> Self {
        Self {
            build: Arc::new(Semaphore::new(config.build_capacity)),
            copy: Arc::new(Semaphore::new(config.copy_capacity)),
            config,
        }
    }

    pub fn config(&self) -> &AdmissionConfig {
        &self.config
    }

    /// 資源量がローカル実行の閾値に収まるか（コピー系は常に収まる）
    pub fn fits_locally(&self, op: &OperationSpec) -> bool {
        match op.footprint() {
            Some(footprint) => {
                footprint.cpu_millis <= self.config.local_threshold.cpu_millis
                    && footprint.memory_bytes <= self.config.local_threshold.memory_bytes
            }
            None => true,
        }
    }

    /// 空いているパーミット数
    pub fn available(&self, pool: CapacityPool) -> usize {
        self.semaphore(pool).available_permits()
    }

    fn semaphore(&self, pool: CapacityPool) -> &Arc<Semaphore> {
        match pool {
            CapacityPool::Build => &self.build,
            CapacityPool::Copy => &self.copy,
        }
    }

    fn capacity(&self, pool: CapacityPool) -> usize {
        match pool {
            CapacityPool::Build => self.config.build_capacity,
            CapacityPool::Copy => self.config.copy_capacity,
        }
    }

    /// ローカルかリモートかを決める
    ///
    /// 閾値に収まり、待ち時間内にパーミットを取得できた場合のみローカル。
    pub async fn admit(&self, op: &OperationSpec) -> Admission {
        let pool = op.pool();

        if !self.fits_locally(op) || self.capacity(pool) == 0 {
            tracing::info!("{} scheduled {}", op.kind(), op.describe());
            return Admission::Remote;
        }

        let acquire = self.semaphore(pool).clone().acquire_owned();
        match tokio::time::timeout(self.config.acquire_timeout, acquire).await {
            Ok(Ok(permit)) => {
                tracing::info!("{} locally {}", op.kind(), op.describe());
                Admission::Local(permit)
            }
            Ok(Err(_)) | Err(_) => {
                tracing::info!("{} scheduled {}", op.kind(), op.describe());
                Admission::Remote
            }
        }
    }
}
