//! ワークロード監視の状態機械
//!
//! ラベルセレクタで期限付きの watch を張り、イベントや期限切れのたびに
//! 対応する Pod を1つ問い合わせます。
//!
//! ```text
//! Created -> Watching -> PodPending -> PodRunning -> LogStreaming -> Terminal
//!               ^  |         |
//!               +--+         +-- (Pod がまだ無い / 待機中なら再問い合わせ)
//! ```

use crate::error::{ExecError, Result};
use futures_util::StreamExt;
use std::time::Duration;
use tugboat_cloud::{ClusterClient, PodInfo, PodPhase};

/// ワークロードの観測状態
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkloadState {
    Created,
    Watching,
    PodPending(String),
    PodRunning(PodInfo),
    LogStreaming(String),
    Terminal(PodInfo),
}

/// 監視の設定
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitConfig {
    /// 1回の watch の長さ
    pub watch_timeout: Duration,
    /// Pending 中や終了待ちの問い合わせ間隔
    pub poll_interval: Duration,
}

impl Default for WaitConfig {
    fn default() -> Self {
        Self {
            watch_timeout: Duration::from_secs(60),
            poll_interval: Duration::from_secs(1),
        }
    }
}

/// Pod 一覧の観測結果から次の状態を決める
///
/// Pod が無ければ Watching に戻り、待機中なら PodPending、
/// 実行中か既に終了していればログを読める状態（PodRunning）。
pub fn observe(pods: &[PodInfo]) -> WorkloadState {
    match pods.first() {
        None => WorkloadState::Watching,
        Some(pod) => match pod.phase {
            PodPhase::Pending | PodPhase::Unknown => WorkloadState::PodPending(pod.name.clone()),
            PodPhase::Running | PodPhase::Succeeded | PodPhase::Failed => {
                WorkloadState::PodRunning(pod.clone())
            }
        },
    }
}

/// ワークロードの監視
pub struct WorkloadWaiter<'a> {
    cluster: &'a dyn ClusterClient,
    selector: String,
    config: WaitConfig,
    state: WorkloadState,
}

impl<'a> WorkloadWaiter<'a> {
    pub fn new(cluster: &'a dyn ClusterClient, selector: impl Into<String>, config: WaitConfig) -> Self {
        Self {
            cluster,
            selector: selector.into(),
            config,
            state: WorkloadState::Created,
        }
    }

    pub fn state(&self) -> &WorkloadState {
        &self.state
    }

    fn transition(&mut self, next: WorkloadState) {
        if next != self.state {
            tracing::debug!("{}: {:?} -> {:?}", self.selector, self.state, next);
            self.state = next;
        }
    }

    async fn poll(&mut self) -> Result<()> {
        let pods = self.cluster.pods_by_selector(&self.selector).await?;
        if pods.len() > 1 {
            tracing::warn!("{} matches {} pods, using the first", self.selector, pods.len());
        }
        self.transition(observe(&pods));
        Ok(())
    }

    /// ログを読める状態（Pod が実行中か終了済み）になるまで待つ
    pub async fn wait_for_start(&mut self) -> Result<PodInfo> {
        loop {
            match &self.state {
                WorkloadState::Created => self.transition(WorkloadState::Watching),
                WorkloadState::Watching => {
                    let mut events = self
                        .cluster
                        .watch(&self.selector, self.config.watch_timeout)
                        .await?;

                    // イベントごとに問い合わせ、ストリームの終了（期限切れ）でも1回問い合わせる
                    loop {
                        let event = events.next().await;
                        if let Some(Err(e)) = &event {
                            tracing::debug!("Watch on {} failed: {}", self.selector, e);
                        }
                        self.poll().await?;

                        if self.state != WorkloadState::Watching || event.is_none() {
                            break;
                        }
                    }
                }
                WorkloadState::PodPending(_) => {
                    tokio::time::sleep(self.config.poll_interval).await;
                    self.poll().await?;
                }
                WorkloadState::PodRunning(pod) => return Ok(pod.clone()),
                WorkloadState::LogStreaming(_) | WorkloadState::Terminal(_) => {
                    return Err(ExecError::Execution(format!(
                        "workload {} already started",
                        self.selector
                    )));
                }
            }
        }
    }

    /// ログのストリーミングを開始した
    pub fn streaming(&mut self, pod: &str) {
        self.transition(WorkloadState::LogStreaming(pod.to_string()));
    }

    /// Pod が終了するまで待ち、終了時の状態を返す
    pub async fn wait_for_terminal(&mut self) -> Result<PodInfo> {
        loop {
            let pods = self.cluster.pods_by_selector(&self.selector).await?;
            match pods.into_iter().next() {
                Some(pod) if pod.phase.is_terminal() => {
                    self.transition(WorkloadState::Terminal(pod.clone()));
                    return Ok(pod);
                }
                Some(_) => tokio::time::sleep(self.config.poll_interval).await,
                None => {
                    return Err(ExecError::Execution(format!(
                        "pod for {} disappeared",
                        self.selector
                    )));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tugboat_cloud::fake::{ClusterCall, FakeCluster};

    fn pod(phase: PodPhase) -> PodInfo {
        PodInfo {
            name: "p".to_string(),
            phase,
            message: None,
        }
    }

    #[test]
    fn test_observe_transitions() {
        assert_eq!(observe(&[]), WorkloadState::Watching);
        assert_eq!(
            observe(&[pod(PodPhase::Pending)]),
            WorkloadState::PodPending("p".to_string())
        );
        assert_eq!(
            observe(&[pod(PodPhase::Running)]),
            WorkloadState::PodRunning(pod(PodPhase::Running))
        );
        // 既に終了していてもログは読める
        assert_eq!(
            observe(&[pod(PodPhase::Failed)]),
            WorkloadState::PodRunning(pod(PodPhase::Failed))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_start_through_pending() {
        let cluster = FakeCluster::new()
            .with_observations(vec![None, None, Some(PodPhase::Pending), Some(PodPhase::Running)]);

        let mut waiter = WorkloadWaiter::new(&cluster, "tugboat.io/workload=w", WaitConfig::default());
        let pod = waiter.wait_for_start().await.unwrap();
        assert_eq!(pod.phase, PodPhase::Running);
        assert!(matches!(waiter.state(), WorkloadState::PodRunning(_)));

        let calls = cluster.calls();
        // 1回目の watch では Pod が見つからず、2回目の watch で Pending になる
        let watches = calls
            .iter()
            .filter(|c| matches!(c, ClusterCall::Watch(_)))
            .count();
        assert_eq!(watches, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_terminal() {
        let cluster = FakeCluster::new()
            .with_observations(vec![Some(PodPhase::Running), Some(PodPhase::Running)])
            .with_final_phase(PodPhase::Failed);

        let mut waiter = WorkloadWaiter::new(&cluster, "tugboat.io/workload=w", WaitConfig::default());
        waiter.streaming("fake-pod");
        assert_eq!(waiter.state(), &WorkloadState::LogStreaming("fake-pod".to_string()));

        let pod = waiter.wait_for_terminal().await.unwrap();
        assert_eq!(pod.phase, PodPhase::Failed);
        assert!(matches!(waiter.state(), WorkloadState::Terminal(_)));
    }

    #[tokio::test]
    async fn test_wait_for_terminal_pod_gone() {
        let cluster = FakeCluster::new().with_observations(vec![None]);
        let mut waiter = WorkloadWaiter::new(&cluster, "tugboat.io/workload=w", WaitConfig::default());
        assert!(waiter.wait_for_terminal().await.is_err());
    }
}
