//! Shared service state

use std::sync::Arc;
use std::time::Duration;
use tugboat_cloud::{ClusterClient, ObjectStore};
use tugboat_config::ServiceConfig;
use tugboat_container::{
    AdmissionConfig, AdmissionController, Executor, LocalBackend, LocalConfig, RemoteBackend,
    RemoteConfig, WaitConfig, WorkloadConfig,
};
use tugboat_core::{Footprint, InternalRegistry};

/// Request limits
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Limits {
    /// Largest build context accepted as a request body
    pub max_body_size: usize,
    /// Ceiling after which a running operation is cancelled
    pub execution_timeout: Duration,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_body_size: 2 * 1024 * 1024 * 1024,
            execution_timeout: Duration::from_secs(30 * 60),
        }
    }
}

/// State injected into every handler
#[derive(Clone)]
pub struct AppState {
    pub executor: Executor,
    pub registry: InternalRegistry,
    pub limits: Limits,
}

impl AppState {
    pub fn new(executor: Executor, registry: InternalRegistry, limits: Limits) -> Self {
        Self {
            executor,
            registry,
            limits,
        }
    }

    /// Wire the admission controller and both backends from the service config
    pub fn from_config(
        config: &ServiceConfig,
        cluster: Arc<dyn ClusterClient>,
        store: Arc<dyn ObjectStore>,
    ) -> Self {
        let registry = InternalRegistry::new(&config.registry);

        let admission = AdmissionController::new(AdmissionConfig {
            build_capacity: config.admission.build_capacity,
            copy_capacity: config.admission.copy_capacity,
            acquire_timeout: config.admission.acquire_timeout,
            local_threshold: Footprint {
                cpu_millis: config.admission.local_cpu_millis,
                memory_bytes: config.admission.local_memory_bytes,
            },
        });

        let local = LocalBackend::new(
            registry.clone(),
            LocalConfig {
                buildkitd_addr: config.local.buildkitd_addr.clone(),
                timeout: config.timeouts.execution,
            },
        );

        let remote = RemoteBackend::new(
            cluster,
            store,
            registry.clone(),
            RemoteConfig {
                workload: WorkloadConfig {
                    builder_image: config.images.builder.clone(),
                    copy_image: config.images.copy.clone(),
                    copy_cpu_millis: config.copy_resources.cpu_millis,
                    copy_memory_bytes: config.copy_resources.memory_bytes,
                    execution_timeout: config.timeouts.execution,
                    buildkitd_config_map: config.images.buildkitd_config.clone(),
                },
                wait: WaitConfig {
                    watch_timeout: config.timeouts.watch,
                    ..WaitConfig::default()
                },
                cleanup_timeout: config.timeouts.cleanup,
            },
        );

        let limits = Limits {
            max_body_size: usize::try_from(config.max_body_size).unwrap_or(usize::MAX),
            execution_timeout: config.timeouts.execution,
        };

        Self::new(
            Executor::new(admission, Arc::new(local), Arc::new(remote)),
            registry,
            limits,
        )
    }
}
