//! Multi-stage extraction: container → disk image → optional decryption →
//! carrier-bundle tree.
//!
//! ```text
//! fw.ipsw ──► largest entry ──► [decrypt if .aea] ──► 7z bundle subtree
//!    │              │                                       │
//!    └── deleted ◄──┴── deleted ◄───────────────────────────┘ on success
//! ```

mod container;
mod decrypt;

pub use container::extract_largest_entry;
pub use decrypt::{decrypted_name, decrypt_disk_image, is_encrypted};

use std::path::Path;

use tracing::{debug, info};

use crate::error::{PipelineError, PipelineResult};
use crate::progress::ProgressReporter;
use crate::tools::{BundleExtractor, ImageDecryptor};

/// Run the full extraction chain for one firmware container.
///
/// Byte progress for the disk-image copy is reported against the given
/// device/version pair. On success, `out_dir` holds the extracted
/// carrier-bundle tree and both the disk image and the original container
/// have been deleted.
pub async fn extract_carrier_bundles(
    container: &Path,
    out_dir: &Path,
    decryptor: &dyn ImageDecryptor,
    extractor: &dyn BundleExtractor,
    reporter: &dyn ProgressReporter,
    identifier: &str,
    version: &str,
) -> PipelineResult<()> {
    info!(container = %container.display(), "extracting the largest disk image");
    let mut image =
        extract_largest_entry(container, out_dir, reporter, identifier, version).await?;

    if is_encrypted(&image) {
        debug!(image = %image.display(), "encrypted disk image detected");
        image = decrypt_disk_image(container, &image, out_dir, decryptor).await?;
    }

    info!(image = %image.display(), "extracting carrier bundles");
    extractor.extract_bundles(&image, out_dir).await?;

    // Neither the disk image nor the container is needed once the bundle
    // tree exists on disk.
    remove_if_present(&image).await?;
    remove_if_present(container).await?;

    Ok(())
}

async fn remove_if_present(path: &Path) -> PipelineResult<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(PipelineError::io(path, e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::NullReporter;
    use crate::tools::BUNDLE_SUBTREE;
    use async_trait::async_trait;
    use std::fs::{self, File};
    use std::io::Write;
    use std::path::PathBuf;
    use tempfile::TempDir;
    use zip::write::SimpleFileOptions;

    fn write_container(path: &Path, image_name: &str) {
        let file = File::create(path).unwrap();
        let mut writer = zip::ZipWriter::new(file);
        let options =
            SimpleFileOptions::default().compression_method(zip::CompressionMethod::Stored);
        writer.start_file("BuildManifest.plist", options).unwrap();
        writer.write_all(&[0u8; 16]).unwrap();
        writer.start_file(image_name, options).unwrap();
        writer.write_all(&[0x42u8; 2048]).unwrap();
        writer.finish().unwrap();
    }

    struct UnusedDecryptor;

    #[async_trait]
    impl ImageDecryptor for UnusedDecryptor {
        async fn ensure_installed(&self) -> PipelineResult<()> {
            panic!("decryptor must not run for an unencrypted image");
        }
        async fn extract_keys(&self, _: &Path, _: &Path) -> PipelineResult<()> {
            unreachable!()
        }
        async fn decrypt_image(&self, _: &Path, _: &Path, _: &Path) -> PipelineResult<()> {
            unreachable!()
        }
    }

    /// Extractor that fakes 7z by materializing a bundle tree.
    struct FakeExtractor;

    #[async_trait]
    impl BundleExtractor for FakeExtractor {
        async fn extract_bundles(&self, _image: &Path, out_dir: &Path) -> PipelineResult<()> {
            let bundle = out_dir.join(BUNDLE_SUBTREE).join("ATT_US.bundle");
            fs::create_dir_all(&bundle).unwrap();
            fs::write(bundle.join("carrier.plist"), b"<plist/>").unwrap();
            Ok(())
        }
    }

    struct FailingExtractor;

    #[async_trait]
    impl BundleExtractor for FailingExtractor {
        async fn extract_bundles(&self, image: &Path, _out_dir: &Path) -> PipelineResult<()> {
            Err(PipelineError::Extraction {
                path: image.to_path_buf(),
                reason: "7z exited with code 2".to_string(),
            })
        }
    }

    #[tokio::test]
    async fn test_full_chain_cleans_intermediates() {
        let temp = TempDir::new().unwrap();
        let container = temp.path().join("fw.ipsw");
        write_container(&container, "root.dmg");

        extract_carrier_bundles(
            &container,
            temp.path(),
            &UnusedDecryptor,
            &FakeExtractor,
            &NullReporter,
            "iPhone12,1",
            "17.1",
        )
        .await
        .unwrap();

        let bundle = temp
            .path()
            .join(BUNDLE_SUBTREE)
            .join("ATT_US.bundle")
            .join("carrier.plist");
        assert!(bundle.exists());
        assert!(!temp.path().join("root.dmg").exists(), "disk image deleted");
        assert!(!container.exists(), "container deleted");
    }

    #[tokio::test]
    async fn test_extractor_failure_keeps_inputs() {
        let temp = TempDir::new().unwrap();
        let container = temp.path().join("fw.ipsw");
        write_container(&container, "root.dmg");

        let result = extract_carrier_bundles(
            &container,
            temp.path(),
            &UnusedDecryptor,
            &FailingExtractor,
            &NullReporter,
            "iPhone12,1",
            "17.1",
        )
        .await;

        assert!(matches!(result, Err(PipelineError::Extraction { .. })));
        // Inputs survive a failed extraction so a rerun can pick them up.
        assert!(container.exists());
        assert!(temp.path().join("root.dmg").exists());
    }

    #[tokio::test]
    async fn test_encrypted_image_goes_through_decryptor() {
        struct TrackingDecryptor(std::sync::atomic::AtomicBool);

        #[async_trait]
        impl ImageDecryptor for TrackingDecryptor {
            async fn ensure_installed(&self) -> PipelineResult<()> {
                Ok(())
            }
            async fn extract_keys(&self, _: &Path, out_dir: &Path) -> PipelineResult<()> {
                let key_dir = out_dir.join("keys");
                fs::create_dir_all(&key_dir).unwrap();
                fs::write(key_dir.join("root.dmg.aea.pem"), b"k").unwrap();
                Ok(())
            }
            async fn decrypt_image(
                &self,
                image: &Path,
                _: &Path,
                _: &Path,
            ) -> PipelineResult<()> {
                self.0.store(true, std::sync::atomic::Ordering::SeqCst);
                fs::write(decrypted_name(image), b"plain").unwrap();
                Ok(())
            }
        }

        let temp = TempDir::new().unwrap();
        let container = temp.path().join("fw.ipsw");
        write_container(&container, "root.dmg.aea");

        let decryptor = TrackingDecryptor(std::sync::atomic::AtomicBool::new(false));
        extract_carrier_bundles(
            &container,
            temp.path(),
            &decryptor,
            &FakeExtractor,
            &NullReporter,
            "iPhone12,1",
            "17.1",
        )
        .await
        .unwrap();

        assert!(decryptor.0.load(std::sync::atomic::Ordering::SeqCst));
        assert!(!temp.path().join("root.dmg.aea").exists());
        assert!(!PathBuf::from(temp.path().join("root.dmg")).exists());
    }
}
