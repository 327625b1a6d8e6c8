//! Decryption of AEA-encrypted disk images.
//!
//! Key material is pulled out of the original container by the external
//! tool, matched against the disk image by name, and deleted again once the
//! decrypted image exists.

use std::ffi::OsStr;
use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::error::{PipelineError, PipelineResult};
use crate::tools::ImageDecryptor;

/// Whether a disk image's extension marks it as AEA-encrypted.
pub fn is_encrypted(image: &Path) -> bool {
    image
        .extension()
        .and_then(OsStr::to_str)
        .is_some_and(|ext| ext.contains("aea"))
}

/// The image path with its trailing `.aea` suffix removed, i.e. the name
/// the decryption tool writes its output under.
pub fn decrypted_name(image: &Path) -> PathBuf {
    match image.file_stem() {
        Some(stem) => image.with_file_name(stem),
        None => image.to_path_buf(),
    }
}

/// Pick the key file for a disk image.
///
/// Prefers the key whose file stem equals the image's full file name
/// (`root.dmg.aea` pairs with `root.dmg.aea.pem`); falls back to the first
/// available key.
fn select_key<'a>(keys: &'a [PathBuf], image: &Path) -> Option<&'a PathBuf> {
    let image_name = image.file_name();
    keys.iter()
        .find(|key| key.file_stem() == image_name)
        .or_else(|| keys.first())
}

/// Decrypt `image` in place inside `out_dir`.
///
/// Extracts key material from `container`, decrypts, then deletes the
/// encrypted input and the key-material directory. Returns the path of the
/// decrypted image.
pub async fn decrypt_disk_image(
    container: &Path,
    image: &Path,
    out_dir: &Path,
    decryptor: &dyn ImageDecryptor,
) -> PipelineResult<PathBuf> {
    info!(image = %image.display(), "decrypting disk image");

    decryptor.ensure_installed().await?;
    decryptor.extract_keys(container, out_dir).await?;

    let pattern = format!("{}/**/*.pem", out_dir.display());
    let keys: Vec<PathBuf> = glob::glob(&pattern)
        .map_err(|e| PipelineError::Decryption {
            path: image.to_path_buf(),
            reason: format!("bad key glob: {}", e),
        })?
        .filter_map(Result::ok)
        .collect();

    let key = match select_key(&keys, image) {
        Some(key) => {
            if key.file_stem() == image.file_name() {
                info!(key = %key.display(), "found a matching key file");
            } else {
                warn!(key = %key.display(), "no exact key match, using the first one");
            }
            key.clone()
        }
        None => {
            return Err(PipelineError::NoKeyFound {
                image: image.to_path_buf(),
            })
        }
    };

    decryptor.decrypt_image(image, &key, out_dir).await?;

    // The encrypted image and the key-material directory are dead weight
    // once the decrypted image exists.
    if let Err(e) = tokio::fs::remove_file(image).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            return Err(PipelineError::io(image, e));
        }
    }
    if let Some(key_dir) = key.parent() {
        if key_dir != out_dir {
            tokio::fs::remove_dir_all(key_dir)
                .await
                .map_err(|e| PipelineError::io(key_dir, e))?;
        }
    }

    Ok(decrypted_name(image))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_is_encrypted() {
        assert!(is_encrypted(Path::new("root.dmg.aea")));
        assert!(!is_encrypted(Path::new("root.dmg")));
        assert!(!is_encrypted(Path::new("root")));
    }

    #[test]
    fn test_decrypted_name_strips_suffix() {
        assert_eq!(
            decrypted_name(Path::new("/v/root.dmg.aea")),
            PathBuf::from("/v/root.dmg")
        );
    }

    #[test]
    fn test_select_key_prefers_exact_match() {
        let keys = vec![
            PathBuf::from("/k/other.dmg.aea.pem"),
            PathBuf::from("/k/root.dmg.aea.pem"),
        ];
        let chosen = select_key(&keys, Path::new("/v/root.dmg.aea")).unwrap();
        assert_eq!(chosen, &PathBuf::from("/k/root.dmg.aea.pem"));
    }

    #[test]
    fn test_select_key_falls_back_to_first() {
        let keys = vec![
            PathBuf::from("/k/a.pem"),
            PathBuf::from("/k/b.pem"),
        ];
        let chosen = select_key(&keys, Path::new("/v/root.dmg.aea")).unwrap();
        assert_eq!(chosen, &PathBuf::from("/k/a.pem"));
    }

    #[test]
    fn test_select_key_empty() {
        assert!(select_key(&[], Path::new("/v/root.dmg.aea")).is_none());
    }

    /// Decryptor that fakes the external tool with filesystem effects.
    struct FakeDecryptor;

    #[async_trait]
    impl ImageDecryptor for FakeDecryptor {
        async fn ensure_installed(&self) -> PipelineResult<()> {
            Ok(())
        }

        async fn extract_keys(&self, _container: &Path, out_dir: &Path) -> PipelineResult<()> {
            let key_dir = out_dir.join("fcs-keys");
            fs::create_dir_all(&key_dir).unwrap();
            fs::write(key_dir.join("root.dmg.aea.pem"), b"key material").unwrap();
            Ok(())
        }

        async fn decrypt_image(
            &self,
            image: &Path,
            _key: &Path,
            _out_dir: &Path,
        ) -> PipelineResult<()> {
            fs::write(decrypted_name(image), b"decrypted contents").unwrap();
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_decrypt_flow_cleans_up() {
        let temp = TempDir::new().unwrap();
        let container = temp.path().join("fw.ipsw");
        let image = temp.path().join("root.dmg.aea");
        fs::write(&container, b"container").unwrap();
        fs::write(&image, b"encrypted").unwrap();

        let decrypted = decrypt_disk_image(&container, &image, temp.path(), &FakeDecryptor)
            .await
            .unwrap();

        assert_eq!(decrypted, temp.path().join("root.dmg"));
        assert!(decrypted.exists());
        assert!(!image.exists(), "encrypted input should be deleted");
        assert!(
            !temp.path().join("fcs-keys").exists(),
            "key-material directory should be deleted"
        );
    }

    struct NoKeysDecryptor;

    #[async_trait]
    impl ImageDecryptor for NoKeysDecryptor {
        async fn ensure_installed(&self) -> PipelineResult<()> {
            Ok(())
        }
        async fn extract_keys(&self, _: &Path, _: &Path) -> PipelineResult<()> {
            Ok(())
        }
        async fn decrypt_image(&self, _: &Path, _: &Path, _: &Path) -> PipelineResult<()> {
            panic!("must not be called without a key");
        }
    }

    #[tokio::test]
    async fn test_no_key_material_is_error() {
        let temp = TempDir::new().unwrap();
        let container = temp.path().join("fw.ipsw");
        let image = temp.path().join("root.dmg.aea");
        fs::write(&container, b"container").unwrap();
        fs::write(&image, b"encrypted").unwrap();

        let result = decrypt_disk_image(&container, &image, temp.path(), &NoKeysDecryptor).await;
        assert!(matches!(result, Err(PipelineError::NoKeyFound { .. })));
    }
}
