//! Manifest generation
//!
//! Converts the provider-neutral workload description into Kubernetes objects.

use crate::error::Result;
use k8s_openapi::api::batch::v1::Job;
use k8s_openapi::api::core::v1::{Pod, Secret};
use serde_json::{Value, json};
use std::collections::BTreeMap;
use tugboat_cloud::{PodInfo, PodPhase, VolumeSource, WorkloadSpec};

const CONTAINER_NAME: &str = "worker";

/// Job for a workload: a single pod, never restarted, killed at the deadline
pub fn job_manifest(spec: &WorkloadSpec) -> Result<Job> {
    let resources = json!({
        "cpu": format!("{}m", spec.cpu_millis),
        "memory": spec.memory_bytes.to_string(),
    });

    let volumes: Vec<Value> = spec
        .volumes
        .iter()
        .map(|v| match &v.source {
            VolumeSource::Secret(name) => json!({
                "name": v.name,
                "secret": { "secretName": name },
            }),
            VolumeSource::ConfigMap(name) => json!({
                "name": v.name,
                "configMap": { "name": name },
            }),
        })
        .collect();

    let mounts: Vec<Value> = spec
        .volumes
        .iter()
        .map(|v| {
            json!({
                "name": v.name,
                "mountPath": v.mount_path,
                "readOnly": true,
            })
        })
        .collect();

    let env: Vec<Value> = spec
        .env
        .iter()
        .map(|(name, value)| json!({ "name": name, "value": value }))
        .collect();

    let manifest = json!({
        "apiVersion": "batch/v1",
        "kind": "Job",
        "metadata": {
            "name": spec.name,
            "labels": spec.labels,
        },
        "spec": {
            "backoffLimit": 0,
            "activeDeadlineSeconds": spec.active_deadline.as_secs(),
            "template": {
                "metadata": { "labels": spec.labels },
                "spec": {
                    "restartPolicy": "Never",
                    "automountServiceAccountToken": false,
                    "containers": [{
                        "name": CONTAINER_NAME,
                        "image": spec.image,
                        "command": spec.command,
                        "env": env,
                        "resources": {
                            "requests": resources,
                            "limits": resources,
                        },
                        "volumeMounts": mounts,
                    }],
                    "volumes": volumes,
                },
            },
        },
    });

    Ok(serde_json::from_value(manifest)?)
}

/// Secret whose name is generated by the API server from `prefix`
pub fn secret_manifest(prefix: &str, data: &BTreeMap<String, String>) -> Result<Secret> {
    let manifest = json!({
        "apiVersion": "v1",
        "kind": "Secret",
        "metadata": { "generateName": prefix },
        "type": "Opaque",
        "stringData": data,
    });
    Ok(serde_json::from_value(manifest)?)
}

/// Observed state of a pod
///
/// The message prefers the status message and falls back to the reason of a
/// terminated container.
pub fn pod_info(pod: &Pod) -> PodInfo {
    let status = pod.status.as_ref();
    let phase = status
        .and_then(|s| s.phase.as_deref())
        .map(PodPhase::parse)
        .unwrap_or(PodPhase::Unknown);

    let terminated = status
        .and_then(|s| s.container_statuses.as_ref())
        .and_then(|cs| cs.iter().find_map(|c| c.state.as_ref()?.terminated.as_ref()));

    let message = status
        .and_then(|s| s.message.clone())
        .or_else(|| terminated.and_then(|t| t.message.clone()))
        .or_else(|| terminated.and_then(|t| t.reason.clone()));

    PodInfo {
        name: pod.metadata.name.clone().unwrap_or_default(),
        phase,
        message,
    }
}
