use crate::error::{BuildError, Result};
use flate2::read::GzDecoder;
use std::io::Read;
use std::path::Path;
use tar::Archive;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// ビルドコンテキスト（リクエストボディの tar アーカイブ）
pub struct BuildContext;

impl BuildContext {
    /// gzip 圧縮されているかどうか
    pub fn is_gzip(archive: &[u8]) -> bool {
        archive.starts_with(&GZIP_MAGIC)
    }

    /// アーカイブを `dest` に展開（非圧縮 / gzip のどちらも可）
    ///
    /// `..` や絶対パスでディレクトリ外に出るエントリは展開されない。
    pub fn extract(archive: &[u8], dest: &Path) -> Result<()> {
        if archive.is_empty() {
            return Err(BuildError::InvalidContext("empty archive".to_string()));
        }

        tracing::debug!(
            "Extracting build context ({} bytes) into {}",
            archive.len(),
            dest.display()
        );
        Self::check_context_size(archive.len());

        if Self::is_gzip(archive) {
            Self::unpack(GzDecoder::new(archive), dest)
        } else {
            Self::unpack(archive, dest)
        }
    }

    fn unpack<R: Read>(reader: R, dest: &Path) -> Result<()> {
        let mut archive = Archive::new(reader);
        archive.set_preserve_permissions(false);
        archive.set_overwrite(true);
        archive
            .unpack(dest)
            .map_err(|e| BuildError::InvalidContext(e.to_string()))
    }

    /// コンテキストサイズのチェックと警告
    fn check_context_size(size: usize) {
        const LARGE_CONTEXT_SIZE: usize = 500 * 1024 * 1024; // 500MB

        if size > LARGE_CONTEXT_SIZE {
            tracing::warn!(
                "Large build context ({}MB); consider a .dockerignore file",
                size / 1024 / 1024
            );
        }
    }
}
