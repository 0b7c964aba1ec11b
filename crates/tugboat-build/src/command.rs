//! buildctl / skopeo のコマンドライン生成
//!
//! 呼び出し側が指定した値はすべて独立した argv 要素として渡し、
//! シェルのテキストには埋め込みません。リモート実行で使うシェルスクリプトは
//! 固定文字列で、値は位置引数（`"$@"`）でのみ受け取ります。

use tugboat_core::{BuildSpec, CopySpec, InspectSpec, InternalRegistry};

pub const BUILDCTL: &str = "buildctl";
pub const SKOPEO: &str = "skopeo";

/// skopeo のリトライ回数
const COPY_RETRIES: &str = "3";

/// リモートのビルド用スクリプト
///
/// `$1` はコンテキストのダウンロード URL、残りは buildctl の引数。
/// buildkitd の起動直後に失敗することがあるため一度だけ再試行する。
pub const REMOTE_BUILD_SCRIPT: &str = r#"set -eu
url="$1"
shift
mkdir -p "$HOME/context"
cd "$HOME/context"
echo "download build context"
wget -q -O "$HOME/context.tar" "$url"
tar -xf "$HOME/context.tar"
rm -f "$HOME/context.tar"
buildctl-daemonless.sh "$@" || buildctl-daemonless.sh "$@"
"#;

/// リモートの inspect 用スクリプト（`$1` は内部レジストリ上の参照）
pub const REMOTE_INSPECT_SCRIPT: &str = r#"set -eu
dir="$(mktemp -d)/inspect-image"
skopeo copy --quiet --retry-times 3 --src-tls-verify=false --dest-tls-verify=false "docker://$1" "dir://$dir"
skopeo inspect "dir://$dir"
"#;

/// `sh -c` で実行したときの `$0`
const SCRIPT_NAME: &str = "tugboat";

/// `buildctl build` の引数
pub struct BuildctlArgs<'a> {
    spec: &'a BuildSpec,
    registry: &'a InternalRegistry,
    context_dir: String,
    metadata_file: Option<String>,
}

impl<'a> BuildctlArgs<'a> {
    pub fn new(spec: &'a BuildSpec, registry: &'a InternalRegistry) -> Self {
        Self {
            spec,
            registry,
            context_dir: ".".to_string(),
            metadata_file: None,
        }
    }

    /// 展開済みコンテキストのディレクトリ（デフォルトはカレントディレクトリ）
    pub fn context_dir(mut self, dir: impl Into<String>) -> Self {
        self.context_dir = dir.into();
        self
    }

    /// ビルド結果のメタデータを書き出すファイル
    pub fn metadata_file(mut self, path: impl Into<String>) -> Self {
        self.metadata_file = Some(path.into());
        self
    }

    /// プッシュ先（digests リポジトリ + 指定タグ）
    pub fn output_names(&self) -> Vec<String> {
        std::iter::once(self.registry.digests())
            .chain(self.spec.tags.iter().map(|tag| self.registry.image_ref(tag)))
            .collect()
    }

    fn dockerfile_dir(&self) -> String {
        let dir = self.spec.dockerfile_dir();
        match (self.context_dir.as_str(), dir) {
            (ctx, ".") => ctx.to_string(),
            (".", dir) => dir.to_string(),
            (ctx, dir) => format!("{}/{}", ctx.trim_end_matches('/'), dir),
        }
    }

    /// `build` サブコマンド以降の引数
    pub fn to_args(&self) -> Vec<String> {
        let mut args = vec![
            "build".to_string(),
            "--frontend".to_string(),
            "dockerfile.v0".to_string(),
            "--local".to_string(),
            format!("context={}", self.context_dir),
            "--local".to_string(),
            format!("dockerfile={}", self.dockerfile_dir()),
            "--opt".to_string(),
            format!("filename={}", self.spec.dockerfile_name()),
        ];

        for (key, value) in &self.spec.build_args {
            args.push("--opt".to_string());
            args.push(format!("build-arg:{}={}", key, value));
        }

        for (key, value) in &self.spec.labels {
            args.push("--opt".to_string());
            args.push(format!("label:{}={}", key, value));
        }

        if let Some(target) = &self.spec.target {
            args.push("--opt".to_string());
            args.push(format!("target={}", target));
        }

        // 名前はカンマ区切りのため CSV としてクォートする
        args.push("--output".to_string());
        args.push(format!(
            "type=image,\"name={}\",push=true",
            self.output_names().join(",")
        ));

        args.push("--export-cache".to_string());
        args.push(format!(
            "type=registry,ref={},mode=max",
            self.registry.cache_repo()
        ));

        if self.spec.no_cache {
            args.push("--no-cache".to_string());
        } else {
            args.push("--import-cache".to_string());
            args.push(format!("type=registry,ref={}", self.registry.cache_repo()));

            if let Some(cache_from) = &self.spec.cache_from {
                args.push("--import-cache".to_string());
                args.push(format!(
                    "type=registry,ref={}",
                    self.registry.image_ref(cache_from)
                ));
            }
        }

        if let Some(path) = &self.metadata_file {
            args.push("--metadata-file".to_string());
            args.push(path.clone());
        }

        args
    }
}

/// ローカルの buildkitd に対する buildctl の argv（先頭はプログラム名）
pub fn local_build_command(addr: &str, args: &BuildctlArgs<'_>) -> Vec<String> {
    let mut argv = vec![BUILDCTL.to_string(), "--addr".to_string(), addr.to_string()];
    argv.extend(args.to_args());
    argv
}

/// ワークロード内で実行するビルドの argv
pub fn remote_build_command(context_url: &str, args: &BuildctlArgs<'_>) -> Vec<String> {
    let mut argv = vec![
        "sh".to_string(),
        "-c".to_string(),
        REMOTE_BUILD_SCRIPT.to_string(),
        SCRIPT_NAME.to_string(),
        context_url.to_string(),
    ];
    argv.extend(args.to_args());
    argv
}

/// `skopeo copy` の argv（pull / tag 共通）
pub fn copy_command(copy: &CopySpec) -> Vec<String> {
    let mut argv = vec![
        SKOPEO.to_string(),
        "copy".to_string(),
        "--retry-times".to_string(),
        COPY_RETRIES.to_string(),
    ];
    if !copy.source_tls_verify {
        argv.push("--src-tls-verify=false".to_string());
    }
    argv.push("--dest-tls-verify=false".to_string());
    argv.push(format!("docker://{}", copy.source));
    argv.push(format!("docker://{}", copy.destination));
    argv
}

/// inspect の1段目: 内部レジストリからディレクトリへ取り出す
pub fn inspect_fetch_command(inspect: &InspectSpec, dir: &str) -> Vec<String> {
    vec![
        SKOPEO.to_string(),
        "copy".to_string(),
        "--quiet".to_string(),
        "--retry-times".to_string(),
        COPY_RETRIES.to_string(),
        "--src-tls-verify=false".to_string(),
        "--dest-tls-verify=false".to_string(),
        format!("docker://{}", inspect.image),
        format!("dir://{}", dir),
    ]
}

/// inspect の2段目: 取り出したイメージを検査
pub fn inspect_read_command(dir: &str) -> Vec<String> {
    vec![
        SKOPEO.to_string(),
        "inspect".to_string(),
        format!("dir://{}", dir),
    ]
}

/// ワークロード内で実行する inspect の argv
pub fn remote_inspect_command(inspect: &InspectSpec) -> Vec<String> {
    vec![
        "sh".to_string(),
        "-c".to_string(),
        REMOTE_INSPECT_SCRIPT.to_string(),
        SCRIPT_NAME.to_string(),
        inspect.image.clone(),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use tugboat_core::RegistryCredentials;

    fn registry() -> InternalRegistry {
        InternalRegistry::new("reg:5000")
    }

    fn position(args: &[String], value: &str) -> Option<usize> {
        args.iter().position(|a| a == value)
    }

    #[test]
    fn test_build_args_defaults() {
        let spec = BuildSpec {
            tags: vec!["myapp:latest".to_string()],
            ..Default::default()
        };
        let registry = registry();
        let args = BuildctlArgs::new(&spec, &registry).to_args();

        assert_eq!(args[0], "build");
        assert!(args.contains(&"context=.".to_string()));
        assert!(args.contains(&"dockerfile=.".to_string()));
        assert!(args.contains(&"filename=Dockerfile".to_string()));
        assert!(args.contains(
            &"type=image,\"name=reg:5000/digests,reg:5000/images/myapp_latest\",push=true"
                .to_string()
        ));
        assert!(args.contains(&"type=registry,ref=reg:5000/cache-repo,mode=max".to_string()));
        assert!(args.contains(&"type=registry,ref=reg:5000/cache-repo".to_string()));
        assert!(position(&args, "--metadata-file").is_none());
    }

    #[test]
    fn test_build_args_values_are_single_entries() {
        let mut build_args = BTreeMap::new();
        build_args.insert("MSG".to_string(), "hello; rm -rf / 'x' $(id)".to_string());

        let spec = BuildSpec {
            build_args,
            target: Some("runtime".to_string()),
            ..Default::default()
        };
        let registry = registry();
        let args = BuildctlArgs::new(&spec, &registry).to_args();

        let idx = position(&args, "build-arg:MSG=hello; rm -rf / 'x' $(id)").unwrap();
        assert_eq!(args[idx - 1], "--opt");
        assert!(args.contains(&"target=runtime".to_string()));
    }

    #[test]
    fn test_build_args_dockerfile_in_subdir_and_local_context() {
        let spec = BuildSpec {
            dockerfile: "docker/Dockerfile.dev".to_string(),
            ..Default::default()
        };
        let registry = registry();

        let args = BuildctlArgs::new(&spec, &registry).to_args();
        assert!(args.contains(&"dockerfile=docker".to_string()));
        assert!(args.contains(&"filename=Dockerfile.dev".to_string()));

        let args = BuildctlArgs::new(&spec, &registry)
            .context_dir("/tmp/ctx")
            .metadata_file("/tmp/meta.json")
            .to_args();
        assert!(args.contains(&"context=/tmp/ctx".to_string()));
        assert!(args.contains(&"dockerfile=/tmp/ctx/docker".to_string()));
        let idx = position(&args, "--metadata-file").unwrap();
        assert_eq!(args[idx + 1], "/tmp/meta.json");
    }

    #[test]
    fn test_build_args_cache() {
        let registry = registry();

        let spec = BuildSpec {
            cache_from: Some("myapp:cache".to_string()),
            ..Default::default()
        };
        let args = BuildctlArgs::new(&spec, &registry).to_args();
        assert!(args.contains(&"type=registry,ref=reg:5000/images/myapp_cache".to_string()));

        let spec = BuildSpec {
            no_cache: true,
            cache_from: Some("myapp:cache".to_string()),
            ..Default::default()
        };
        let args = BuildctlArgs::new(&spec, &registry).to_args();
        assert!(args.contains(&"--no-cache".to_string()));
        assert!(position(&args, "--import-cache").is_none());
    }

    #[test]
    fn test_output_names_without_tags() {
        let spec = BuildSpec::default();
        let registry = registry();
        assert_eq!(
            BuildctlArgs::new(&spec, &registry).output_names(),
            vec!["reg:5000/digests".to_string()]
        );
    }

    #[test]
    fn test_local_and_remote_build_command() {
        let spec = BuildSpec::default();
        let registry = registry();
        let args = BuildctlArgs::new(&spec, &registry);

        let local = local_build_command("tcp://127.0.0.1:1234", &args);
        assert_eq!(&local[..4], ["buildctl", "--addr", "tcp://127.0.0.1:1234", "build"]);

        let remote = remote_build_command("https://s3/ctx?sig=a&b=c", &args);
        assert_eq!(remote[0], "sh");
        assert_eq!(remote[2], REMOTE_BUILD_SCRIPT);
        assert_eq!(remote[3], "tugboat");
        assert_eq!(remote[4], "https://s3/ctx?sig=a&b=c");
        assert_eq!(remote[5], "build");
        assert!(!REMOTE_BUILD_SCRIPT.contains("s3"));
    }

    #[test]
    fn test_copy_command() {
        let pull = CopySpec {
            source: "nginx:1.27".to_string(),
            destination: "reg:5000/images/nginx_1.27".to_string(),
            source_tls_verify: true,
            credentials: RegistryCredentials::default(),
        };
        assert_eq!(
            copy_command(&pull),
            vec![
                "skopeo",
                "copy",
                "--retry-times",
                "3",
                "--dest-tls-verify=false",
                "docker://nginx:1.27",
                "docker://reg:5000/images/nginx_1.27",
            ]
        );

        let tag = CopySpec {
            source_tls_verify: false,
            ..pull
        };
        assert!(copy_command(&tag).contains(&"--src-tls-verify=false".to_string()));
    }

    #[test]
    fn test_inspect_commands() {
        let inspect = InspectSpec {
            image: "reg:5000/images/web_1".to_string(),
        };
        let fetch = inspect_fetch_command(&inspect, "/tmp/x/inspect-image");
        assert_eq!(fetch.last().unwrap(), "dir:///tmp/x/inspect-image");
        assert_eq!(
            inspect_read_command("/tmp/x/inspect-image"),
            vec!["skopeo", "inspect", "dir:///tmp/x/inspect-image"]
        );

        let remote = remote_inspect_command(&inspect);
        assert_eq!(remote.last().unwrap(), "reg:5000/images/web_1");
    }
}
