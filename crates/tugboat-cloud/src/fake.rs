//! In-memory collaborators for tests
//!
//! `FakeCluster` plays back a scripted sequence of pod observations and log
//! chunks, and records every create and delete so tests can check that each
//! created resource is deleted exactly once.

use crate::cluster::{
    ClusterClient, PodInfo, PodPhase, ResourceHandle, ResourceKind, WatchEvent, WorkloadSpec,
};
use crate::error::{CloudError, Result};
use crate::object_store::ObjectStore;
use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::{self, BoxStream, StreamExt};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// A call made against `FakeCluster`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClusterCall {
    CreateWorkload(String),
    CreateCredential(String),
    Watch(String),
    ListPods(String),
    StreamLogs(String),
    Delete(ResourceHandle),
}

#[derive(Debug, Default)]
struct FakeClusterState {
    calls: Vec<ClusterCall>,
    workloads: Vec<WorkloadSpec>,
    credentials: HashMap<String, BTreeMap<String, String>>,
    observations: VecDeque<Option<PodPhase>>,
}

/// Scripted cluster
#[derive(Debug)]
pub struct FakeCluster {
    state: Mutex<FakeClusterState>,
    final_phase: PodPhase,
    logs: Vec<Bytes>,
    hang_logs: bool,
    fail_create_workload: bool,
    panic_create_workload: bool,
    fail_delete: bool,
    sequence: AtomicUsize,
}

impl Default for FakeCluster {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeCluster {
    /// A cluster whose pod runs, prints nothing and succeeds
    pub fn new() -> Self {
        Self {
            state: Mutex::new(FakeClusterState::default()),
            final_phase: PodPhase::Succeeded,
            logs: Vec::new(),
            hang_logs: false,
            fail_create_workload: false,
            panic_create_workload: false,
            fail_delete: false,
            sequence: AtomicUsize::new(0),
        }
    }

    /// Pod observations returned before the final phase (`None` = no pod yet)
    pub fn with_observations(self, observations: Vec<Option<PodPhase>>) -> Self {
        if let Ok(mut state) = self.state.lock() {
            state.observations = observations.into();
        }
        self
    }

    /// Phase reported once the scripted observations are used up
    pub fn with_final_phase(mut self, phase: PodPhase) -> Self {
        self.final_phase = phase;
        self
    }

    /// Log chunks streamed by the pod
    pub fn with_logs<I, S>(mut self, logs: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<Bytes>,
    {
        self.logs = logs.into_iter().map(Into::into).collect();
        self
    }

    /// Log stream emits its chunks and then never ends
    pub fn with_hanging_logs(mut self) -> Self {
        self.hang_logs = true;
        self
    }

    pub fn failing_workload_creation(mut self) -> Self {
        self.fail_create_workload = true;
        self
    }

    /// Workload creation panics, as a bug in the caller would
    pub fn panicking_workload_creation(mut self) -> Self {
        self.panic_create_workload = true;
        self
    }

    /// Deletes report the resource as already gone
    pub fn failing_deletes(mut self) -> Self {
        self.fail_delete = true;
        self
    }

    pub fn calls(&self) -> Vec<ClusterCall> {
        self.state
            .lock()
            .map(|s| s.calls.clone())
            .unwrap_or_default()
    }

    /// Workload specs passed to `create_workload`
    pub fn workloads(&self) -> Vec<WorkloadSpec> {
        self.state
            .lock()
            .map(|s| s.workloads.clone())
            .unwrap_or_default()
    }

    /// Data of a created credential object
    pub fn credential_data(&self, name: &str) -> Option<BTreeMap<String, String>> {
        self.state
            .lock()
            .ok()
            .and_then(|s| s.credentials.get(name).cloned())
    }

    pub fn created(&self, kind: ResourceKind) -> usize {
        self.count(|call| match call {
            ClusterCall::CreateWorkload(_) => kind == ResourceKind::Workload,
            ClusterCall::CreateCredential(_) => kind == ResourceKind::Credential,
            _ => false,
        })
    }

    pub fn deleted(&self, kind: ResourceKind) -> usize {
        self.count(|call| matches!(call, ClusterCall::Delete(handle) if handle.kind == kind))
    }

    fn count(&self, predicate: impl Fn(&ClusterCall) -> bool) -> usize {
        self.calls().iter().filter(|c| predicate(c)).count()
    }

    fn record(&self, call: ClusterCall) {
        if let Ok(mut state) = self.state.lock() {
            state.calls.push(call);
        }
    }

    fn next_name(&self, prefix: &str) -> String {
        let n = self.sequence.fetch_add(1, Ordering::SeqCst);
        format!("{}{:05}", prefix, n)
    }
}

#[async_trait]
impl ClusterClient for FakeCluster {
    async fn create_workload(&self, spec: &WorkloadSpec) -> Result<ResourceHandle> {
        self.record(ClusterCall::CreateWorkload(spec.name.clone()));
        if self.panic_create_workload {
            panic!("workload {} could not be built", spec.name);
        }
        if self.fail_create_workload {
            return Err(CloudError::ApiError("admission webhook denied".to_string()));
        }

        if let Ok(mut state) = self.state.lock() {
            state.workloads.push(spec.clone());
        }
        Ok(ResourceHandle::workload(&spec.name))
    }

    async fn create_credential_object(
        &self,
        prefix: &str,
        data: BTreeMap<String, String>,
    ) -> Result<ResourceHandle> {
        let name = self.next_name(prefix);
        self.record(ClusterCall::CreateCredential(name.clone()));

        if let Ok(mut state) = self.state.lock() {
            state.credentials.insert(name.clone(), data);
        }
        Ok(ResourceHandle::credential(name))
    }

    async fn watch(
        &self,
        selector: &str,
        _timeout: Duration,
    ) -> Result<BoxStream<'static, Result<WatchEvent>>> {
        self.record(ClusterCall::Watch(selector.to_string()));
        Ok(stream::iter(vec![Ok(WatchEvent::Changed("fake-pod".to_string()))]).boxed())
    }

    async fn pods_by_selector(&self, selector: &str) -> Result<Vec<PodInfo>> {
        self.record(ClusterCall::ListPods(selector.to_string()));

        let phase = self
            .state
            .lock()
            .ok()
            .and_then(|mut s| s.observations.pop_front())
            .unwrap_or(Some(self.final_phase));

        Ok(phase
            .map(|phase| PodInfo {
                name: "fake-pod".to_string(),
                phase,
                message: (phase == PodPhase::Failed).then(|| "Error".to_string()),
            })
            .into_iter()
            .collect())
    }

    async fn stream_logs(
        &self,
        pod: &str,
        _follow: bool,
    ) -> Result<BoxStream<'static, Result<Bytes>>> {
        self.record(ClusterCall::StreamLogs(pod.to_string()));

        let chunks = stream::iter(self.logs.clone().into_iter().map(Ok::<_, CloudError>));
        if self.hang_logs {
            Ok(chunks.chain(stream::pending()).boxed())
        } else {
            Ok(chunks.boxed())
        }
    }

    async fn delete(&self, handle: &ResourceHandle) -> Result<()> {
        self.record(ClusterCall::Delete(handle.clone()));
        if self.fail_delete {
            return Err(CloudError::ResourceNotFound(handle.to_string()));
        }
        Ok(())
    }
}

/// In-memory object store
#[derive(Debug, Default)]
pub struct FakeObjectStore {
    objects: Mutex<HashMap<String, Bytes>>,
    deleted: Mutex<Vec<String>>,
    sequence: AtomicUsize,
}

impl FakeObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn object(&self, key: &str) -> Option<Bytes> {
        self.objects.lock().ok().and_then(|o| o.get(key).cloned())
    }

    pub fn stored(&self) -> usize {
        self.sequence.load(Ordering::SeqCst)
    }

    pub fn deleted(&self) -> Vec<String> {
        self.deleted.lock().map(|d| d.clone()).unwrap_or_default()
    }
}

#[async_trait]
impl ObjectStore for FakeObjectStore {
    async fn store(&self, data: Bytes) -> Result<String> {
        let key = format!(
            "contexts/{:05}.tar",
            self.sequence.fetch_add(1, Ordering::SeqCst)
        );
        if let Ok(mut objects) = self.objects.lock() {
            objects.insert(key.clone(), data);
        }
        Ok(key)
    }

    async fn presign_download(&self, key: &str, ttl: Duration) -> Result<String> {
        Ok(format!(
            "https://objects.test/{}?expires={}",
            key,
            ttl.as_secs()
        ))
    }

    async fn presign_upload(&self, key: &str, ttl: Duration) -> Result<String> {
        Ok(format!(
            "https://objects.test/{}?upload=1&expires={}",
            key,
            ttl.as_secs()
        ))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let removed = self
            .objects
            .lock()
            .ok()
            .and_then(|mut o| o.remove(key));
        if let Ok(mut deleted) = self.deleted.lock() {
            deleted.push(key.to_string());
        }
        match removed {
            Some(_) => Ok(()),
            None => Err(CloudError::ResourceNotFound(key.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_fake_cluster_plays_observations_then_final_phase() {
        let cluster = FakeCluster::new()
            .with_observations(vec![None, Some(PodPhase::Pending)])
            .with_final_phase(PodPhase::Failed);

        assert!(cluster.pods_by_selector("a=b").await.unwrap().is_empty());
        assert_eq!(
            cluster.pods_by_selector("a=b").await.unwrap()[0].phase,
            PodPhase::Pending
        );
        let pods = cluster.pods_by_selector("a=b").await.unwrap();
        assert_eq!(pods[0].phase, PodPhase::Failed);
        assert_eq!(pods[0].message.as_deref(), Some("Error"));
    }

    #[tokio::test]
    async fn test_fake_cluster_counts_creates_and_deletes() {
        let cluster = FakeCluster::new();
        let secret = cluster
            .create_credential_object("tugboat-docker-config-", BTreeMap::new())
            .await
            .unwrap();
        assert!(secret.name.starts_with("tugboat-docker-config-"));
        cluster.delete(&secret).await.unwrap();

        assert_eq!(cluster.created(ResourceKind::Credential), 1);
        assert_eq!(cluster.deleted(ResourceKind::Credential), 1);
        assert_eq!(cluster.created(ResourceKind::Workload), 0);
    }

    #[tokio::test]
    async fn test_fake_object_store_delete_twice() {
        let store = FakeObjectStore::new();
        let key = store.store(Bytes::from_static(b"tar")).await.unwrap();
        assert_eq!(store.object(&key).unwrap(), Bytes::from_static(b"tar"));

        store.delete(&key).await.unwrap();
        assert!(store.delete(&key).await.unwrap_err().is_not_found());
        assert_eq!(store.deleted().len(), 2);
    }
}
