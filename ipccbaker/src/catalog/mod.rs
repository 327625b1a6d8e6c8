//! Device firmware catalog records and the client that fetches them.
//!
//! The catalog is an external HTTP API. Records are deserialized once and
//! never mutated; the [`CatalogClient`] trait exists so tests can supply
//! canned catalogs without a network.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use crate::error::{PipelineError, PipelineResult};

/// Device models processed when the caller gives no explicit list.
pub const DEFAULT_IPHONE_MODELS: &[&str] = &[
    "iPhone7,1",
    "iPhone7,2",
    "iPhone8,1",
    "iPhone8,2",
    "iPhone8,4",
    "iPhone9,1",
    "iPhone9,2",
    "iPhone9,3",
    "iPhone9,4",
    "iPhone10,1",
    "iPhone10,2",
    "iPhone10,4",
    "iPhone10,5",
    "iPhone10,6",
    "iPhone11,2",
    "iPhone11,4",
    "iPhone11,6",
    "iPhone11,8",
    "iPhone12,1",
    "iPhone12,3",
    "iPhone12,5",
    "iPhone12,8",
    "iPhone13,1",
    "iPhone13,2",
    "iPhone13,3",
    "iPhone13,4",
    "iPhone14,2",
    "iPhone14,3",
    "iPhone14,4",
    "iPhone14,5",
    "iPhone14,6",
];

/// One downloadable firmware image for a device.
#[derive(Debug, Clone, Deserialize, PartialEq)]
pub struct Firmware {
    /// Device model string, e.g. `iPhone12,1`.
    pub identifier: String,
    /// Marketing version, e.g. `17.1`.
    pub version: String,
    /// Build identifier, e.g. `21B74`.
    pub buildid: String,
    /// Expected SHA-1 digest of the image, lowercase hex.
    pub sha1sum: String,
    /// Expected MD5 digest of the image, lowercase hex.
    pub md5sum: String,
    /// Declared size of the image in bytes.
    pub filesize: u64,
    /// Source URL of the image.
    pub url: String,
    /// Release timestamp as delivered by the catalog.
    #[serde(default)]
    pub releasedate: Option<String>,
    /// Upload timestamp as delivered by the catalog.
    #[serde(default)]
    pub uploaddate: Option<String>,
    /// Whether the image is still being signed.
    pub signed: bool,
}

impl Firmware {
    /// Local filename for this firmware image.
    pub fn archive_name(&self) -> String {
        format!("{}-{}.ipsw", self.identifier, self.version)
    }
}

/// Catalog entry for one device: its identity plus every published firmware.
#[derive(Debug, Clone, Deserialize)]
pub struct DeviceCatalog {
    /// Human-readable device name.
    pub name: String,
    /// Device model string.
    pub identifier: String,
    /// Published firmwares, newest first as delivered by the API.
    pub firmwares: Vec<Firmware>,
    /// Board configuration string.
    pub boardconfig: String,
    /// Platform (SoC) name.
    pub platform: String,
    /// Chip identifier.
    pub cpid: u64,
    /// Board identifier.
    pub bdid: u64,
}

/// Client for the remote firmware catalog.
#[async_trait]
pub trait CatalogClient: Send + Sync {
    /// Fetch the catalog entry for one device model.
    async fn device_catalog(&self, model: &str) -> PipelineResult<DeviceCatalog>;
}

/// Catalog client backed by the real HTTP API.
pub struct HttpCatalogClient {
    client: reqwest::Client,
    api_base: String,
}

impl HttpCatalogClient {
    /// Create a client against the given API base URL.
    pub fn new(api_base: impl Into<String>) -> PipelineResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| PipelineError::Catalog {
                model: String::new(),
                reason: format!("failed to create HTTP client: {}", e),
            })?;

        Ok(Self {
            client,
            api_base: api_base.into(),
        })
    }
}

#[async_trait]
impl CatalogClient for HttpCatalogClient {
    async fn device_catalog(&self, model: &str) -> PipelineResult<DeviceCatalog> {
        let url = format!("{}/device/{}?type=ipsw", self.api_base, model);

        let response =
            self.client
                .get(&url)
                .send()
                .await
                .map_err(|e| PipelineError::Catalog {
                    model: model.to_string(),
                    reason: e.to_string(),
                })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(PipelineError::Catalog {
                model: model.to_string(),
                reason: format!("{}: {}", status, body),
            });
        }

        response
            .json::<DeviceCatalog>()
            .await
            .map_err(|e| PipelineError::Catalog {
                model: model.to_string(),
                reason: format!("decode error: {}", e),
            })
    }
}
