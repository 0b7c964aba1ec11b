//! ワークロード仕様の生成
//!
//! OperationSpec からクラスタ上で実行するジョブの仕様を組み立てます。

use crate::error::{ExecError, Result};
use std::collections::BTreeMap;
use std::time::Duration;
use tugboat_build::BuildctlArgs;
use tugboat_build::command::{copy_command, remote_build_command, remote_inspect_command};
use tugboat_cloud::{VolumeSource, WORKLOAD_LABEL, WorkloadSpec, WorkloadVolume};
use tugboat_core::{InternalRegistry, OperationKind, OperationSpec};

/// buildkitd 自体が使うメモリ
pub const BUILDKITD_OVERHEAD_BYTES: u64 = 100 * 1024 * 1024;

/// 認証情報オブジェクトの名前の接頭辞
pub const CREDENTIAL_PREFIX: &str = "tugboat-docker-config-";

/// 認証情報オブジェクト内のキー
pub const CREDENTIAL_KEY: &str = "config.json";

const BUILDER_HOME: &str = "/home/user";
const COPY_AUTH_DIR: &str = "/tugboat/auth";

/// ワークロードの設定
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkloadConfig {
    /// buildkit のイメージ（rootless）
    pub builder_image: String,
    /// skopeo のイメージ
    pub copy_image: String,
    pub copy_cpu_millis: u64,
    pub copy_memory_bytes: u64,
    /// 実行時間の上限（`timeout` と Job の activeDeadlineSeconds に使う）
    pub execution_timeout: Duration,
    /// buildkitd.toml を持つ ConfigMap
    pub buildkitd_config_map: Option<String>,
}

impl Default for WorkloadConfig {
    fn default() -> Self {
        Self {
            builder_image: "moby/buildkit:v0.16.0-rootless".to_string(),
            copy_image: "quay.io/skopeo/stable:v1.16.1".to_string(),
            copy_cpu_millis: 500,
            copy_memory_bytes: 512 * 1024 * 1024,
            execution_timeout: Duration::from_secs(30 * 60),
            buildkitd_config_map: Some("buildkitd-config".to_string()),
        }
    }
}

/// `tugboat-<kind>-<random>` 形式の一意な名前
pub fn workload_name(kind: OperationKind) -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    format!("tugboat-{}-{}", kind, &id[..12])
}

/// ワークロード仕様を生成
///
/// `context_url` はビルドのみ必須。`credential` は作成済みの認証情報オブジェクト名。
pub fn workload_spec(
    op: &OperationSpec,
    registry: &InternalRegistry,
    config: &WorkloadConfig,
    context_url: Option<&str>,
    credential: Option<&str>,
) -> Result<WorkloadSpec> {
    let name = workload_name(op.kind());
    let mut labels = BTreeMap::new();
    labels.insert(WORKLOAD_LABEL.to_string(), name.clone());

    let mut volumes = Vec::new();
    let mut env = BTreeMap::new();

    let (image, command, cpu_millis, memory_bytes) = match op {
        OperationSpec::Build(spec) => {
            let url = context_url
                .ok_or_else(|| ExecError::Execution("missing build context".to_string()))?;

            if let Some(secret) = credential {
                volumes.push(WorkloadVolume {
                    name: "docker-config".to_string(),
                    mount_path: format!("{}/.docker", BUILDER_HOME),
                    source: VolumeSource::Secret(secret.to_string()),
                });
            }
            if let Some(config_map) = &config.buildkitd_config_map {
                volumes.push(WorkloadVolume {
                    name: "buildkitd-config".to_string(),
                    mount_path: format!("{}/.config/buildkit", BUILDER_HOME),
                    source: VolumeSource::ConfigMap(config_map.clone()),
                });
            }
            env.insert(
                "BUILDKITD_FLAGS".to_string(),
                "--oci-worker-no-process-sandbox".to_string(),
            );

            let args = BuildctlArgs::new(spec, registry);
            (
                config.builder_image.clone(),
                remote_build_command(url, &args),
                spec.cpu_millis,
                spec.memory_bytes.saturating_add(BUILDKITD_OVERHEAD_BYTES),
            )
        }
        OperationSpec::Pull(spec) | OperationSpec::Tag(spec) => {
            if let Some(secret) = credential {
                volumes.push(WorkloadVolume {
                    name: "docker-config".to_string(),
                    mount_path: COPY_AUTH_DIR.to_string(),
                    source: VolumeSource::Secret(secret.to_string()),
                });
                env.insert(
                    "REGISTRY_AUTH_FILE".to_string(),
                    format!("{}/{}", COPY_AUTH_DIR, CREDENTIAL_KEY),
                );
            }
            (
                config.copy_image.clone(),
                copy_command(spec),
                config.copy_cpu_millis,
                config.copy_memory_bytes,
            )
        }
        OperationSpec::Inspect(spec) => (
            config.copy_image.clone(),
            remote_inspect_command(spec),
            config.copy_cpu_millis,
            config.copy_memory_bytes,
        ),
    };

    let mut wrapped = vec![
        "timeout".to_string(),
        config.execution_timeout.as_secs().to_string(),
    ];
    wrapped.extend(command);

    Ok(WorkloadSpec {
        name,
        labels,
        image,
        command: wrapped,
        cpu_millis,
        memory_bytes,
        active_deadline: config.execution_timeout,
        volumes,
        env,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tugboat_core::{BuildSpec, CopySpec, InspectSpec, RegistryCredentials};

    fn registry() -> InternalRegistry {
        InternalRegistry::new("reg:5000")
    }

    #[test]
    fn test_workload_name() {
        let name = workload_name(OperationKind::Build);
        assert!(name.starts_with("tugboat-build-"));
        assert_eq!(name.len(), "tugboat-build-".len() + 12);
        assert_ne!(name, workload_name(OperationKind::Build));
    }

    #[test]
    fn test_build_workload() {
        let op = OperationSpec::Build(BuildSpec {
            cpu_millis: 2000,
            memory_bytes: 4 * 1024 * 1024 * 1024,
            tags: vec!["web:1".to_string()],
            ..Default::default()
        });
        let config = WorkloadConfig::default();
        let spec = workload_spec(
            &op,
            &registry(),
            &config,
            Some("https://objects/ctx?sig=x"),
            Some("tugboat-docker-config-abc"),
        )
        .unwrap();

        assert!(spec.name.starts_with("tugboat-build-"));
        assert_eq!(spec.labels[WORKLOAD_LABEL], spec.name);
        assert_eq!(spec.image, config.builder_image);
        assert_eq!(spec.cpu_millis, 2000);
        assert_eq!(
            spec.memory_bytes,
            4 * 1024 * 1024 * 1024 + BUILDKITD_OVERHEAD_BYTES
        );
        assert_eq!(spec.active_deadline, Duration::from_secs(1800));

        assert_eq!(&spec.command[..4], ["timeout", "1800", "sh", "-c"]);
        assert!(spec.command.contains(&"https://objects/ctx?sig=x".to_string()));

        assert_eq!(spec.volumes.len(), 2);
        assert_eq!(
            spec.volumes[0].source,
            VolumeSource::Secret("tugboat-docker-config-abc".to_string())
        );
        assert_eq!(
            spec.volumes[1].source,
            VolumeSource::ConfigMap("buildkitd-config".to_string())
        );
    }

    #[test]
    fn test_build_workload_memory_saturates() {
        let op = OperationSpec::Build(BuildSpec {
            memory_bytes: u64::MAX,
            ..Default::default()
        });
        let spec = workload_spec(
            &op,
            &registry(),
            &WorkloadConfig::default(),
            Some("https://objects/ctx"),
            None,
        )
        .unwrap();
        assert_eq!(spec.memory_bytes, u64::MAX);
    }

    #[test]
    fn test_build_workload_requires_context() {
        let op = OperationSpec::Build(BuildSpec::default());
        let err = workload_spec(&op, &registry(), &WorkloadConfig::default(), None, None)
            .unwrap_err();
        assert_eq!(err.to_string(), "missing build context");
    }

    #[test]
    fn test_copy_workload_uses_fixed_resources() {
        let op = OperationSpec::Pull(CopySpec {
            source: "nginx:1.27".to_string(),
            destination: "reg:5000/images/nginx_1.27".to_string(),
            source_tls_verify: true,
            credentials: RegistryCredentials::default(),
        });
        let config = WorkloadConfig::default();
        let spec = workload_spec(&op, &registry(), &config, None, None).unwrap();

        assert!(spec.name.starts_with("tugboat-pull-"));
        assert_eq!(spec.image, config.copy_image);
        assert_eq!(spec.cpu_millis, 500);
        assert_eq!(spec.memory_bytes, 512 * 1024 * 1024);
        assert_eq!(&spec.command[2..4], ["skopeo", "copy"]);
        assert!(spec.volumes.is_empty());
        assert!(spec.env.is_empty());
    }

    #[test]
    fn test_copy_workload_with_credentials() {
        let op = OperationSpec::Tag(CopySpec {
            source: "reg:5000/digests@sha256:ab".to_string(),
            destination: "reg:5000/images/web_latest".to_string(),
            source_tls_verify: false,
            credentials: RegistryCredentials::default(),
        });
        let spec = workload_spec(
            &op,
            &registry(),
            &WorkloadConfig::default(),
            None,
            Some("secret-1"),
        )
        .unwrap();
        assert_eq!(spec.volumes[0].mount_path, "/tugboat/auth");
        assert_eq!(spec.env["REGISTRY_AUTH_FILE"], "/tugboat/auth/config.json");
    }

    #[test]
    fn test_inspect_workload() {
        let op = OperationSpec::Inspect(InspectSpec {
            image: "reg:5000/images/web_1".to_string(),
        });
        let spec =
            workload_spec(&op, &registry(), &WorkloadConfig::default(), None, None).unwrap();
        assert!(spec.name.starts_with("tugboat-inspect-"));
        assert_eq!(spec.command.last().unwrap(), "reg:5000/images/web_1");
    }
}
