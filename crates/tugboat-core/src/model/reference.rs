//! イメージ参照と内部レジストリの命名規則

/// 内部レジストリのデフォルトホスト
pub const DEFAULT_REGISTRY_HOST: &str = "tugboat-registry:5000";

/// 内部レジストリ上の名前空間
///
/// - `<host>/digests` : ビルド結果（digest でアドレス）
/// - `<host>/images/<name>` : 名前付きイメージ
/// - `<host>/cache-repo` : ビルドキャッシュ
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InternalRegistry {
    host: String,
}

impl Default for InternalRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_REGISTRY_HOST)
    }
}

impl InternalRegistry {
    pub fn new(host: impl Into<String>) -> Self {
        Self { host: host.into() }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// digest 付きでプッシュされるリポジトリ
    pub fn digests(&self) -> String {
        format!("{}/digests", self.host)
    }

    /// `sha256:...` を digests リポジトリの参照に変換
    pub fn digest_ref(&self, digest: &str) -> String {
        format!("{}/digests@{}", self.host, digest)
    }

    /// 呼び出し側のイメージ名を内部レジストリの参照に変換
    ///
    /// # Examples
    /// - `myapp:stable` -> `<host>/images/myapp_stable`
    /// - `nginx` -> `<host>/images/nginx_latest`
    /// - `localhost:5000/app:v1` -> `<host>/images/localhost_5000/app_v1`
    pub fn image_ref(&self, name: &str) -> String {
        format!("{}/images/{}", self.host, escape_image_name(name))
    }

    /// tag の元になるイメージ参照（digest ならば digests リポジトリ）
    pub fn source_ref(&self, name: &str) -> String {
        if name.starts_with("sha256:") {
            self.digest_ref(name)
        } else {
            self.image_ref(name)
        }
    }

    pub fn cache_repo(&self) -> String {
        format!("{}/cache-repo", self.host)
    }
}

/// タグを正規化したうえで `:` と `@` を `_` に置き換える
///
/// レジストリのポート番号、タグ、digest の区切りをすべて潰し、
/// (リポジトリ, タグ) ごとに一意なパスにする。
pub fn escape_image_name(name: &str) -> String {
    let (repo, tag) = split_image_tag(name);
    format!("{}:{}", repo, tag).replace([':', '@'], "_")
}

/// イメージ名とタグを分離
///
/// # Examples
/// - `ghcr.io/org/app:v1.0` -> `("ghcr.io/org/app", "v1.0")`
/// - `ghcr.io/org/app` -> `("ghcr.io/org/app", "latest")`
/// - `localhost:5000/app:dev` -> `("localhost:5000/app", "dev")`
pub fn split_image_tag(image: &str) -> (String, String) {
    if let Some(pos) = image.rfind(':') {
        let potential_tag = &image[pos + 1..];
        let potential_image = &image[..pos];

        // レジストリのポート番号の後ろには必ず / が続く
        if !potential_tag.contains('/') && !potential_tag.is_empty() {
            return (potential_image.to_string(), potential_tag.to_string());
        }
    }

    (image.to_string(), "latest".to_string())
}

/// イメージ名からレジストリを抽出
///
/// # Examples
/// - `ghcr.io/org/app:tag` -> `ghcr.io`
/// - `myuser/app:tag` -> `docker.io`
/// - `localhost:5000/app` -> `localhost:5000`
pub fn registry_host(image: &str) -> String {
    if let Some((first, _)) = image.split_once('/') {
        // `.` か `:` を含むか、localhost ならレジストリ
        if first.contains('.') || first.contains(':') || first == "localhost" {
            return first.to_string();
        }
    }

    "docker.io".to_string()
}

/// 参照として安全な文字列かを検証
///
/// buildctl の `--output` には CSV として埋め込まれるため、
/// `,` や `"` などを含む値はここで弾く。
pub fn validate_reference(reference: &str) -> Result<(), String> {
    if reference.is_empty() {
        return Err("(empty)".to_string());
    }

    if reference.len() > 255 {
        return Err(format!(
            "reference too long ({} characters, max 255)",
            reference.len()
        ));
    }

    if reference.starts_with('.') || reference.starts_with('-') {
        return Err(format!("reference must not start with '.' or '-': {}", reference));
    }

    for c in reference.chars() {
        if !c.is_ascii_alphanumeric() && !matches!(c, '.' | '-' | '_' | '/' | ':' | '@') {
            return Err(format!("invalid character '{}' in {}", c, reference));
        }
    }

    Ok(())
}
