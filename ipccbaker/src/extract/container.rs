//! Firmware container inspection.
//!
//! A firmware image is a zip-like container holding several disk images;
//! the one we care about is always the largest entry by declared size.

use std::fs::File;
use std::io::{self, BufReader, Read, Write};
use std::path::{Path, PathBuf};

use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info};
use zip::ZipArchive;

use crate::error::{PipelineError, PipelineResult};
use crate::progress::ProgressReporter;

/// Copy chunk size for streaming a disk image out of the container.
const COPY_CHUNK: usize = 64 * 1024;

/// Extract the largest entry of the container into `out_dir`.
///
/// If a file with the entry's name and exact declared size already exists
/// at the destination, extraction is skipped (size check only; a rerun
/// after a completed extraction should not re-read gigabytes). Byte
/// progress against the entry's declared size is reported while the copy
/// runs. Returns the path of the extracted disk image.
pub async fn extract_largest_entry(
    container: &Path,
    out_dir: &Path,
    reporter: &dyn ProgressReporter,
    identifier: &str,
    version: &str,
) -> PipelineResult<PathBuf> {
    let container_owned = container.to_path_buf();
    let out_dir = out_dir.to_path_buf();
    let (progress, mut events) = tokio::sync::mpsc::unbounded_channel();

    let task = tokio::task::spawn_blocking(move || {
        extract_largest_blocking(&container_owned, &out_dir, progress)
    });

    // The sender half drops when the blocking copy finishes, ending the
    // event stream before the task result is collected.
    while let Some((bytes, total)) = events.recv().await {
        reporter.bytes_progress(identifier, version, bytes, Some(total));
    }

    task.await.map_err(|e| task_failure(container, e))?
}

fn task_failure(container: &Path, e: tokio::task::JoinError) -> PipelineError {
    PipelineError::Extraction {
        path: container.to_path_buf(),
        reason: format!("extraction task failed: {}", e),
    }
}

fn extract_largest_blocking(
    container: &Path,
    out_dir: &Path,
    progress: UnboundedSender<(u64, u64)>,
) -> PipelineResult<PathBuf> {
    let file = File::open(container).map_err(|e| PipelineError::io(container, e))?;
    let mut archive =
        ZipArchive::new(BufReader::new(file)).map_err(|e| PipelineError::Extraction {
            path: container.to_path_buf(),
            reason: format!("not a readable container: {}", e),
        })?;

    let (index, name, size) = select_largest(&mut archive, container)?;
    debug!(entry = %name.display(), size, "largest container entry selected");

    let dest = out_dir.join(&name);

    if let Ok(meta) = dest.metadata() {
        if meta.len() == size {
            info!(path = %dest.display(), "skipping disk image extraction (file already exists)");
            return Ok(dest);
        }
    }

    info!(entry = %name.display(), dest = %dest.display(), "extracting disk image");

    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent).map_err(|e| PipelineError::io(parent, e))?;
    }

    let mut entry = archive
        .by_index(index)
        .map_err(|e| PipelineError::Extraction {
            path: container.to_path_buf(),
            reason: e.to_string(),
        })?;
    let mut target = File::create(&dest).map_err(|e| PipelineError::io(&dest, e))?;

    let mut buffer = vec![0u8; COPY_CHUNK];
    let mut copied: u64 = 0;
    loop {
        let read = entry
            .read(&mut buffer)
            .map_err(|e| PipelineError::io(&dest, e))?;
        if read == 0 {
            break;
        }
        target
            .write_all(&buffer[..read])
            .map_err(|e| PipelineError::io(&dest, e))?;
        copied += read as u64;
        // The receiver may already be gone; progress is best-effort.
        let _ = progress.send((copied, size));
    }

    Ok(dest)
}

/// Pick the entry with the largest declared uncompressed size.
///
/// Entry names are sanitized against path traversal; the first maximal
/// entry wins on ties.
fn select_largest<R: io::Read + io::Seek>(
    archive: &mut ZipArchive<R>,
    container: &Path,
) -> PipelineResult<(usize, PathBuf, u64)> {
    let mut best: Option<(usize, PathBuf, u64)> = None;

    for index in 0..archive.len() {
        let entry = archive
            .by_index_raw(index)
            .map_err(|e| PipelineError::Extraction {
                path: container.to_path_buf(),
                reason: e.to_string(),
            })?;

        let Some(name) = entry.enclosed_name() else {
            continue;
        };

        if best.as_ref().map_or(true, |(_, _, size)| entry.size() > *size) {
            best = Some((index, name, entry.size()));
        }
    }

    best.ok_or_else(|| PipelineError::Extraction {
        path: container.to_path_buf(),
        reason: "container has no entries".to_string(),
    })
}
