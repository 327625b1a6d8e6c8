//! Configuration for a baking run.

use std::path::PathBuf;
use std::time::Duration;

/// Default number of concurrently running firmware workflows.
pub const DEFAULT_CONCURRENCY: usize = 5;

/// Default timeout for firmware downloads. Firmware images run into the
/// gigabytes, so this is deliberately long.
pub const DEFAULT_DOWNLOAD_TIMEOUT_SECS: u64 = 1000;

/// Default base URL of the firmware catalog API.
pub const DEFAULT_API_BASE: &str = "https://api.ipsw.me/v4";

/// Configuration for the baking pipeline.
#[derive(Debug, Clone)]
pub struct BakerConfig {
    /// Directory under which per-device trees are created.
    pub output_dir: PathBuf,

    /// Base URL of the firmware catalog API.
    pub api_base: String,

    /// Maximum number of firmware workflows running at once, across
    /// all devices.
    pub concurrency: usize,

    /// Timeout applied to each firmware download request.
    pub download_timeout: Duration,

    /// Whether the external decryption tool may be installed on first
    /// use if it is missing from the execution path.
    pub bootstrap_tools: bool,
}

impl Default for BakerConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("."),
            api_base: DEFAULT_API_BASE.to_string(),
            concurrency: DEFAULT_CONCURRENCY,
            download_timeout: Duration::from_secs(DEFAULT_DOWNLOAD_TIMEOUT_SECS),
            bootstrap_tools: true,
        }
    }
}

impl BakerConfig {
    /// Create a configuration rooted at the given output directory.
    pub fn new(output_dir: PathBuf) -> Self {
        Self {
            output_dir,
            ..Default::default()
        }
    }

    /// Set the global workflow concurrency limit (minimum 1).
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    /// Set the catalog API base URL.
    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into();
        self
    }

    /// Set the per-download timeout.
    pub fn with_download_timeout(mut self, timeout: Duration) -> Self {
        self.download_timeout = timeout;
        self
    }
}
