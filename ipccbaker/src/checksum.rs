//! Streaming SHA-1 digests for downloaded and packaged files.

use std::path::Path;

use sha1::{Digest, Sha1};
use tokio::fs::File;
use tokio::io::AsyncReadExt;

use crate::error::{PipelineError, PipelineResult};

/// Chunk size for streaming reads during digest calculation.
const CHUNK_SIZE: usize = 4096;

/// Calculate the SHA-1 digest of a file without loading it into memory.
///
/// Returns the lowercase hexadecimal digest of the file contents.
pub async fn sha1_file(path: &Path) -> PipelineResult<String> {
    let mut file = File::open(path)
        .await
        .map_err(|e| PipelineError::io(path, e))?;

    let mut hasher = Sha1::new();
    let mut buffer = vec![0u8; CHUNK_SIZE];

    loop {
        let bytes_read = file
            .read(&mut buffer)
            .await
            .map_err(|e| PipelineError::io(path, e))?;

        if bytes_read == 0 {
            break;
        }

        hasher.update(&buffer[..bytes_read]);
    }

    Ok(format!("{:x}", hasher.finalize()))
}

/// Verify that a file matches an expected SHA-1 digest.
pub async fn verify_sha1(path: &Path, expected: &str) -> PipelineResult<()> {
    let actual = sha1_file(path).await?;
    if actual != expected {
        return Err(PipelineError::HashMismatch {
            path: path.to_path_buf(),
            expected: expected.to_string(),
            actual,
        });
    }
    Ok(())
}
