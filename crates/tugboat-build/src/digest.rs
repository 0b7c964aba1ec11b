//! ビルド結果の digest 抽出
//!
//! ローカル実行では buildctl の `--metadata-file` を優先し、
//! 取れなければビルドログの `exporting manifest sha256:...` 行から読み取る。

use crate::error::{BuildError, Result};
use regex::Regex;
use serde::Deserialize;
use std::path::Path;
use std::sync::LazyLock;

static MANIFEST_DIGEST: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"exporting manifest (sha256:[0-9a-f]+)").expect("manifest digest pattern")
});

/// buildctl `--metadata-file` の内容（必要なキーのみ）
#[derive(Debug, Deserialize)]
struct BuildMetadata {
    #[serde(rename = "containerimage.digest")]
    digest: Option<String>,
}

/// ログ全体から最初の manifest digest を探す
pub fn scan_digest(log: &str) -> Option<String> {
    MANIFEST_DIGEST
        .captures(log)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_string())
}

/// メタデータ JSON から digest を読み取る
pub fn parse_metadata(data: &[u8]) -> Result<Option<String>> {
    let metadata: BuildMetadata = serde_json::from_slice(data)?;
    Ok(metadata.digest.filter(|d| d.starts_with("sha256:")))
}

/// メタデータファイルから digest を読み取る（ファイルが無ければ None）
pub async fn read_metadata_file(path: &Path) -> Result<Option<String>> {
    match tokio::fs::read(path).await {
        Ok(data) if data.is_empty() => Ok(None),
        Ok(data) => parse_metadata(&data),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(BuildError::Io(e)),
    }
}

/// 構造化された結果を優先し、無ければログから探す
pub fn resolve_digest(structured: Option<String>, log: &str) -> Result<String> {
    structured
        .or_else(|| scan_digest(log))
        .ok_or(BuildError::DigestNotFound)
}

#[cfg(test)]
mod tests {
    use super::*;

    const DIGEST: &str = "sha256:9f86d081884c7d659a2feaa0c55ad015a3bf4f1b2b0b822cd15d6c15b0f00a08";

    #[test]
    fn test_scan_digest_from_buildkit_log() {
        let log = format!(
            "#8 exporting to image\n\
             #8 exporting layers done\n\
             #8 exporting manifest {} 0.0s done\n\
             #8 exporting config sha256:0000 done\n\
             #8 pushing layers\n",
            DIGEST
        );
        assert_eq!(scan_digest(&log).as_deref(), Some(DIGEST));
    }

    #[test]
    fn test_scan_digest_missing() {
        assert_eq!(scan_digest("#1 [internal] load build definition\nERROR"), None);
        assert_eq!(scan_digest("exporting manifest sha256:"), None);
    }

    #[test]
    fn test_parse_metadata() {
        let data = format!(
            r#"{{"buildx.build.ref":"x","containerimage.digest":"{}","image.name":"reg/digests"}}"#,
            DIGEST
        );
        assert_eq!(parse_metadata(data.as_bytes()).unwrap().as_deref(), Some(DIGEST));
        assert_eq!(parse_metadata(b"{}").unwrap(), None);
        assert!(parse_metadata(b"not json").is_err());
    }

    #[test]
    fn test_resolve_digest_prefers_structured() {
        let log = "exporting manifest sha256:aaaa";
        assert_eq!(
            resolve_digest(Some(DIGEST.to_string()), log).unwrap(),
            DIGEST
        );
        assert_eq!(resolve_digest(None, log).unwrap(), "sha256:aaaa");
        assert!(matches!(
            resolve_digest(None, "done"),
            Err(BuildError::DigestNotFound)
        ));
    }

    #[tokio::test]
    async fn test_read_metadata_file_missing_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metadata.json");
        assert_eq!(read_metadata_file(&path).await.unwrap(), None);

        tokio::fs::write(&path, format!(r#"{{"containerimage.digest":"{}"}}"#, DIGEST))
            .await
            .unwrap();
        assert_eq!(
            read_metadata_file(&path).await.unwrap().as_deref(),
            Some(DIGEST)
        );
    }
}
