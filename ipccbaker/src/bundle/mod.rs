//! Carrier bundle relocation and packaging.
//!
//! After extraction, bundles sit deep inside the platform tree
//! (`System/Library/Carrier Bundles/...`). They are moved up to the version
//! root, archived one tar per bundle with stable member ordering, and
//! described by a [`BundleRecord`] carrying digest, size, and timestamp.

use std::fs::{self, File};
use std::io::BufWriter;
use std::path::{Path, PathBuf};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::checksum::sha1_file;
use crate::error::{PipelineError, PipelineResult};
use crate::tools::BUNDLE_SUBTREE;

/// Final-artifact record for one packaged carrier bundle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BundleRecord {
    pub bundle_name: String,
    pub tar_file: String,
    pub sha1: String,
    pub file_size: u64,
    pub created_at: String,
}

/// Move every extracted bundle directory up to the version root and drop
/// the now-empty platform tree. Returns the relocated bundle paths.
pub async fn relocate_bundles(version_dir: &Path) -> PipelineResult<Vec<PathBuf>> {
    let pattern = format!("{}/{}/**/*.bundle", version_dir.display(), BUNDLE_SUBTREE);
    let bundles: Vec<PathBuf> = glob::glob(&pattern)
        .map_err(|e| PipelineError::Extraction {
            path: version_dir.to_path_buf(),
            reason: format!("bad bundle glob: {}", e),
        })?
        .filter_map(Result::ok)
        .collect();

    let mut relocated = Vec::with_capacity(bundles.len());
    for bundle in bundles {
        let Some(name) = bundle.file_name() else {
            continue;
        };
        let dest = version_dir.join(name);
        debug!(from = %bundle.display(), to = %dest.display(), "relocating bundle");
        tokio::fs::rename(&bundle, &dest)
            .await
            .map_err(|e| PipelineError::io(&bundle, e))?;
        relocated.push(dest);
    }

    // The platform tree may legitimately be absent when no bundles matched.
    let system_root = version_dir.join("System");
    if let Err(e) = tokio::fs::remove_dir_all(&system_root).await {
        if e.kind() != std::io::ErrorKind::NotFound {
            return Err(PipelineError::io(&system_root, e));
        }
    }

    Ok(relocated)
}

/// Archive each bundle directory into `{bundle}.tar` next to the source and
/// record its digest and size.
///
/// Source directories are left in place; deleting them once the records are
/// safely ledgered is the caller's responsibility.
pub async fn package_bundles(bundles: &[PathBuf]) -> PipelineResult<Vec<BundleRecord>> {
    let mut records = Vec::with_capacity(bundles.len());

    for bundle in bundles {
        let tar_path = bundle.with_extension("tar");

        let bundle_owned = bundle.clone();
        let tar_owned = tar_path.clone();
        tokio::task::spawn_blocking(move || build_tar(&bundle_owned, &tar_owned))
            .await
            .map_err(|e| PipelineError::Extraction {
                path: bundle.clone(),
                reason: format!("archive task failed: {}", e),
            })??;

        let sha1 = sha1_file(&tar_path).await?;
        let file_size = tokio::fs::metadata(&tar_path)
            .await
            .map_err(|e| PipelineError::io(&tar_path, e))?
            .len();

        records.push(BundleRecord {
            bundle_name: tar_path
                .file_stem()
                .unwrap_or_default()
                .to_string_lossy()
                .to_string(),
            tar_file: tar_path
                .file_name()
                .unwrap_or_default()
                .to_string_lossy()
                .to_string(),
            sha1,
            file_size,
            created_at: Utc::now().to_rfc3339(),
        });
    }

    Ok(records)
}

/// Write a tar of `bundle` rooted at its directory name, members in sorted
/// path order so identical trees produce identical archives.
fn build_tar(bundle: &Path, tar_path: &Path) -> PipelineResult<()> {
    let root_name = bundle.file_name().ok_or_else(|| {
        PipelineError::io(
            bundle,
            std::io::Error::new(std::io::ErrorKind::InvalidInput, "bundle has no file name"),
        )
    })?;

    let file = File::create(tar_path).map_err(|e| PipelineError::io(tar_path, e))?;
    let mut builder = tar::Builder::new(BufWriter::new(file));
    builder.follow_symlinks(false);

    append_dir_sorted(&mut builder, bundle, Path::new(root_name))
        .map_err(|e| PipelineError::io(bundle, e))?;

    builder
        .into_inner()
        .and_then(|writer| writer.into_inner().map_err(|e| e.into_error()))
        .and_then(|file| file.sync_all())
        .map_err(|e| PipelineError::io(tar_path, e))?;

    Ok(())
}

fn append_dir_sorted<W: std::io::Write>(
    builder: &mut tar::Builder<W>,
    dir: &Path,
    prefix: &Path,
) -> std::io::Result<()> {
    builder.append_dir(prefix, dir)?;

    let mut entries: Vec<_> = fs::read_dir(dir)?.collect::<Result<_, _>>()?;
    entries.sort_by_key(|entry| entry.file_name());

    for entry in entries {
        let path = entry.path();
        let name = prefix.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            append_dir_sorted(builder, &path, &name)?;
        } else {
            builder.append_path_with_name(&path, &name)?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn make_bundle(parent: &Path, name: &str, files: &[&str]) -> PathBuf {
        let bundle = parent.join(name);
        fs::create_dir_all(&bundle).unwrap();
        for file in files {
            let path = bundle.join(file);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(&path, format!("contents of {}", file)).unwrap();
        }
        bundle
    }

    fn tar_member_names(tar_path: &Path) -> Vec<String> {
        let mut archive = tar::Archive::new(File::open(tar_path).unwrap());
        archive
            .entries()
            .unwrap()
            .map(|e| {
                let entry = e.unwrap();
                let path = entry.path().unwrap().to_string_lossy().to_string();
                path.trim_end_matches('/').to_string()
            })
            .collect()
    }

    #[tokio::test]
    async fn test_relocate_moves_bundles_to_version_root() {
        let temp = TempDir::new().unwrap();
        let carrier_dir = temp.path().join(BUNDLE_SUBTREE);
        make_bundle(&carrier_dir, "ATT_US.bundle", &["carrier.plist"]);
        make_bundle(&carrier_dir.join("iPhone"), "TMobile_US.bundle", &["carrier.plist"]);

        let relocated = relocate_bundles(temp.path()).await.unwrap();

        assert_eq!(relocated.len(), 2);
        assert!(temp.path().join("ATT_US.bundle").is_dir());
        assert!(temp.path().join("TMobile_US.bundle").is_dir());
        assert!(!temp.path().join("System").exists(), "platform tree removed");
    }

    #[tokio::test]
    async fn test_relocate_with_no_bundles() {
        let temp = TempDir::new().unwrap();
        let relocated = relocate_bundles(temp.path()).await.unwrap();
        assert!(relocated.is_empty());
    }

    #[tokio::test]
    async fn test_package_produces_record_and_keeps_source() {
        let temp = TempDir::new().unwrap();
        let bundle = make_bundle(temp.path(), "ATT_US.bundle", &["carrier.plist", "overrides.plist"]);

        let records = package_bundles(&[bundle.clone()]).await.unwrap();

        assert_eq!(records.len(), 1);
        let record = &records[0];
        assert_eq!(record.bundle_name, "ATT_US");
        assert_eq!(record.tar_file, "ATT_US.tar");

        let tar_path = temp.path().join("ATT_US.tar");
        assert!(tar_path.exists());
        assert_eq!(record.file_size, tar_path.metadata().unwrap().len());
        assert_eq!(record.sha1, sha1_file(&tar_path).await.unwrap());

        assert!(bundle.is_dir(), "source bundle must not be deleted");
    }

    #[tokio::test]
    async fn test_tar_members_are_sorted_and_rooted() {
        let temp = TempDir::new().unwrap();
        let bundle = make_bundle(
            temp.path(),
            "ATT_US.bundle",
            &["zz.plist", "aa.plist", "nested/mm.plist"],
        );

        package_bundles(&[bundle]).await.unwrap();

        let names = tar_member_names(&temp.path().join("ATT_US.tar"));
        assert_eq!(
            names,
            vec![
                "ATT_US.bundle",
                "ATT_US.bundle/aa.plist",
                "ATT_US.bundle/nested",
                "ATT_US.bundle/nested/mm.plist",
                "ATT_US.bundle/zz.plist",
            ]
        );
    }

    #[tokio::test]
    async fn test_identical_trees_give_identical_member_order() {
        let temp = TempDir::new().unwrap();

        // Create the same tree twice, writing files in different orders.
        let one = make_bundle(temp.path().join("a").as_path(), "X.bundle", &["f1", "f2", "f3"]);
        let two = make_bundle(temp.path().join("b").as_path(), "X.bundle", &["f3", "f1", "f2"]);

        package_bundles(&[one, two]).await.unwrap();

        let names_a = tar_member_names(&temp.path().join("a/X.tar"));
        let names_b = tar_member_names(&temp.path().join("b/X.tar"));
        assert_eq!(names_a, names_b);
    }

    #[tokio::test]
    async fn test_package_missing_bundle_is_error() {
        let temp = TempDir::new().unwrap();
        let result = package_bundles(&[temp.path().join("ghost.bundle")]).await;
        assert!(result.is_err());
    }
}
