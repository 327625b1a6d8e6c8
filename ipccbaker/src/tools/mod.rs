//! External tool contracts: decryption (`ipsw`) and archive extraction (`7z`).
//!
//! Both tools are collaborators invoked as subprocesses; the pipeline only
//! sequences them and validates their exit status. The `ipsw` tool carries a
//! one-time bootstrap: if it is missing from the execution path it is
//! fetched from a fixed release URL and installed exactly once per process,
//! no matter how many workflows hit the decryption stage at the same time.

use std::path::{Path, PathBuf};
use std::process::Output;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::sync::OnceCell;
use tracing::{info, warn};

use crate::error::{PipelineError, PipelineResult};

/// Subtree inside a disk image where carrier bundles live.
pub const BUNDLE_SUBTREE: &str = "System/Library/Carrier Bundles";

/// Fixed release package for the one-time `ipsw` bootstrap.
const IPSW_RELEASE_URL: &str =
    "https://github.com/blacktop/ipsw/releases/download/v3.1.544/ipsw_3.1.544_linux_x86_64.deb";

/// Decryption tool seam for encrypted disk images.
#[async_trait]
pub trait ImageDecryptor: Send + Sync {
    /// Make sure the tool is present, installing it if permitted.
    async fn ensure_installed(&self) -> PipelineResult<()>;

    /// Extract key material from the firmware container into `out_dir`.
    async fn extract_keys(&self, container: &Path, out_dir: &Path) -> PipelineResult<()>;

    /// Decrypt `image` using `key`, writing the result into `out_dir`.
    async fn decrypt_image(&self, image: &Path, key: &Path, out_dir: &Path)
        -> PipelineResult<()>;
}

/// Archive tool seam for pulling the bundle subtree out of a disk image.
#[async_trait]
pub trait BundleExtractor: Send + Sync {
    /// Extract the carrier-bundle subtree from `image` into `out_dir`,
    /// overwriting without prompting.
    async fn extract_bundles(&self, image: &Path, out_dir: &Path) -> PipelineResult<()>;
}

/// Check whether a tool responds on the execution path.
async fn tool_on_path(tool: &str) -> bool {
    Command::new(tool)
        .arg("--version")
        .output()
        .await
        .map(|output| output.status.success())
        .unwrap_or(false)
}

fn stderr_of(output: &Output) -> String {
    String::from_utf8_lossy(&output.stderr).trim().to_string()
}

/// The `blacktop/ipsw` decryption tool, with single-flight bootstrap.
pub struct IpswTool {
    command: String,
    bootstrap: bool,
    install: OnceCell<()>,
}

impl IpswTool {
    /// Create the tool wrapper. `bootstrap` controls whether a missing
    /// binary may be fetched and installed on first use.
    pub fn new(bootstrap: bool) -> Self {
        Self {
            command: "ipsw".to_string(),
            bootstrap,
            install: OnceCell::new(),
        }
    }

    #[cfg(test)]
    fn with_command(command: &str, bootstrap: bool) -> Self {
        Self {
            command: command.to_string(),
            bootstrap,
            install: OnceCell::new(),
        }
    }

    async fn install_once(&self) -> PipelineResult<()> {
        if tool_on_path(&self.command).await {
            return Ok(());
        }

        if !self.bootstrap {
            return Err(PipelineError::ToolInstall {
                tool: self.command.clone(),
                reason: "not on PATH and bootstrap is disabled".to_string(),
            });
        }

        warn!(tool = %self.command, "tool not installed, bootstrapping from release package");

        let deb_path = PathBuf::from("ipsw.deb");
        if !deb_path.exists() {
            let bytes = reqwest::get(IPSW_RELEASE_URL)
                .await
                .map_err(|e| PipelineError::ToolInstall {
                    tool: self.command.clone(),
                    reason: format!("failed to fetch release package: {}", e),
                })?
                .bytes()
                .await
                .map_err(|e| PipelineError::ToolInstall {
                    tool: self.command.clone(),
                    reason: format!("failed to read release package: {}", e),
                })?;

            tokio::fs::write(&deb_path, &bytes)
                .await
                .map_err(|e| PipelineError::io(&deb_path, e))?;
        }

        let output = Command::new("dpkg")
            .arg("-i")
            .arg(&deb_path)
            .output()
            .await
            .map_err(|e| PipelineError::ToolInstall {
                tool: self.command.clone(),
                reason: format!("failed to run dpkg: {}", e),
            })?;

        if !output.status.success() {
            return Err(PipelineError::ToolInstall {
                tool: self.command.clone(),
                reason: format!("dpkg failed: {}", stderr_of(&output)),
            });
        }

        info!(tool = %self.command, "tool installed");
        Ok(())
    }
}

#[async_trait]
impl ImageDecryptor for IpswTool {
    async fn ensure_installed(&self) -> PipelineResult<()> {
        // Concurrent first-time callers coalesce into one install attempt;
        // a failed attempt is retried by the next caller.
        self.install
            .get_or_try_init(|| self.install_once())
            .await
            .map(|_| ())
    }

    async fn extract_keys(&self, container: &Path, out_dir: &Path) -> PipelineResult<()> {
        let output = Command::new(&self.command)
            .arg("extract")
            .arg("--fcs-key")
            .arg(container)
            .arg("--output")
            .arg(out_dir)
            .output()
            .await
            .map_err(|e| PipelineError::Decryption {
                path: container.to_path_buf(),
                reason: format!("failed to run {}: {}", self.command, e),
            })?;

        if !output.status.success() {
            return Err(PipelineError::Decryption {
                path: container.to_path_buf(),
                reason: format!("key extraction failed: {}", stderr_of(&output)),
            });
        }

        Ok(())
    }

    async fn decrypt_image(
        &self,
        image: &Path,
        key: &Path,
        out_dir: &Path,
    ) -> PipelineResult<()> {
        let output = Command::new(&self.command)
            .arg("fw")
            .arg("aea")
            .arg("--pem")
            .arg(key)
            .arg(image)
            .arg("--output")
            .arg(out_dir)
            .output()
            .await
            .map_err(|e| PipelineError::Decryption {
                path: image.to_path_buf(),
                reason: format!("failed to run {}: {}", self.command, e),
            })?;

        if !output.status.success() {
            return Err(PipelineError::Decryption {
                path: image.to_path_buf(),
                reason: format!("decryption failed: {}", stderr_of(&output)),
            });
        }

        Ok(())
    }
}

/// The `7z` archive tool.
#[derive(Debug, Default)]
pub struct SevenZipTool;

impl SevenZipTool {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl BundleExtractor for SevenZipTool {
    async fn extract_bundles(&self, image: &Path, out_dir: &Path) -> PipelineResult<()> {
        let output = Command::new("7z")
            .arg("x")
            .arg(image)
            .arg(format!("-o{}", out_dir.display()))
            .arg("-aos") // skip entries that already exist
            .arg("-bd") // no progress indicator
            .arg("-y")
            .arg(format!("{}/*", BUNDLE_SUBTREE))
            .output()
            .await
            .map_err(|e| PipelineError::Extraction {
                path: image.to_path_buf(),
                reason: format!("failed to run 7z: {}", e),
            })?;

        if !output.status.success() {
            return Err(PipelineError::Extraction {
                path: image.to_path_buf(),
                reason: stderr_of(&output),
            });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_tool_on_path_missing_tool() {
        assert!(!tool_on_path("definitely-not-a-real-tool-9000").await);
    }

    #[tokio::test]
    async fn test_tool_on_path_present_tool() {
        // tar is available on every platform this pipeline targets
        assert!(tool_on_path("tar").await);
    }

    #[tokio::test]
    async fn test_ensure_installed_present_tool() {
        let tool = IpswTool::with_command("tar", false);
        assert!(tool.ensure_installed().await.is_ok());
    }

    #[tokio::test]
    async fn test_ensure_installed_missing_without_bootstrap() {
        let tool = IpswTool::with_command("definitely-not-a-real-tool-9000", false);
        match tool.ensure_installed().await {
            Err(PipelineError::ToolInstall { reason, .. }) => {
                assert!(reason.contains("bootstrap is disabled"));
            }
            other => panic!("expected ToolInstall, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_ensure_installed_is_idempotent_once_satisfied() {
        let tool = IpswTool::with_command("tar", false);
        tool.ensure_installed().await.unwrap();
        // Second call resolves from the OnceCell without re-probing.
        assert!(tool.ensure_installed().await.is_ok());
    }
}
