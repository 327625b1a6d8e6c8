//! Fan-out of firmware workflows across devices under a global
//! concurrency cap.
//!
//! Devices are enumerated sequentially; their firmware versions all feed
//! one shared admission gate, so at most N workflows run at once across the
//! entire run regardless of how many devices are in play. A workflow
//! failure (or panic) is logged and counted, never propagated to siblings.

use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{error, info};

use crate::catalog::{CatalogClient, Firmware, HttpCatalogClient};
use crate::config::BakerConfig;
use crate::download::{FirmwareFetcher, ReqwestFetcher};
use crate::error::PipelineResult;
use crate::ledger::LedgerLocks;
use crate::progress::ProgressReporter;
use crate::tools::{BundleExtractor, ImageDecryptor, IpswTool, SevenZipTool};
use crate::workflow::{run_workflow, WorkflowContext, WorkflowOutcome};

/// Tally of terminal workflow states for one run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RunSummary {
    /// Workflows that downloaded, extracted, and ledgered a version.
    pub processed: usize,
    /// Workflows skipped because their version was already ledgered.
    pub skipped: usize,
    /// Workflows that stopped at a stage failure (or panicked).
    pub failed: usize,
}

/// Services shared by every workflow of a run.
#[derive(Clone)]
struct SharedDeps {
    output_dir: PathBuf,
    fetcher: Arc<dyn FirmwareFetcher>,
    decryptor: Arc<dyn ImageDecryptor>,
    extractor: Arc<dyn BundleExtractor>,
    reporter: Arc<dyn ProgressReporter>,
    locks: LedgerLocks,
}

/// Drives the whole acquisition run.
pub struct Orchestrator {
    catalog: Arc<dyn CatalogClient>,
    deps: SharedDeps,
    gate: Arc<Semaphore>,
}

impl Orchestrator {
    /// Create an orchestrator with explicitly injected services.
    pub fn new(
        config: &BakerConfig,
        catalog: Arc<dyn CatalogClient>,
        fetcher: Arc<dyn FirmwareFetcher>,
        decryptor: Arc<dyn ImageDecryptor>,
        extractor: Arc<dyn BundleExtractor>,
        reporter: Arc<dyn ProgressReporter>,
    ) -> Self {
        Self {
            catalog,
            deps: SharedDeps {
                output_dir: config.output_dir.clone(),
                fetcher,
                decryptor,
                extractor,
                reporter,
                locks: LedgerLocks::new(),
            },
            gate: Arc::new(Semaphore::new(config.concurrency)),
        }
    }

    /// Create an orchestrator wired to the real catalog API, HTTP fetcher,
    /// and external tools.
    pub fn with_default_services(
        config: &BakerConfig,
        reporter: Arc<dyn ProgressReporter>,
    ) -> PipelineResult<Self> {
        let catalog = Arc::new(HttpCatalogClient::new(config.api_base.clone())?);
        let fetcher = Arc::new(ReqwestFetcher::new(config.download_timeout)?);
        let decryptor = Arc::new(IpswTool::new(config.bootstrap_tools));
        let extractor = Arc::new(SevenZipTool::new());

        Ok(Self::new(
            config, catalog, fetcher, decryptor, extractor, reporter,
        ))
    }

    /// Process every firmware of every given device model.
    ///
    /// Catalog failures are logged per device and skip that device only.
    /// Returns once every admitted workflow has reached a terminal state.
    pub async fn run(&self, models: &[String]) -> RunSummary {
        let mut tasks: JoinSet<Result<WorkflowOutcome, ()>> = JoinSet::new();

        for model in models {
            let catalog = match self.catalog.device_catalog(model).await {
                Ok(catalog) => catalog,
                Err(e) => {
                    error!(model, error = %e, "failed to fetch device catalog");
                    continue;
                }
            };

            info!(
                device = %catalog.identifier,
                firmwares = catalog.firmwares.len(),
                "scheduling device"
            );

            for firmware in catalog.firmwares {
                let deps = self.deps.clone();
                let gate = self.gate.clone();
                tasks.spawn(process_firmware(firmware, deps, gate));
            }
        }

        let mut summary = RunSummary::default();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(WorkflowOutcome::Processed)) => summary.processed += 1,
                Ok(Ok(WorkflowOutcome::Skipped)) => summary.skipped += 1,
                Ok(Err(())) => summary.failed += 1,
                Err(e) => {
                    error!(error = %e, "workflow task panicked");
                    summary.failed += 1;
                }
            }
        }

        info!(
            processed = summary.processed,
            skipped = summary.skipped,
            failed = summary.failed,
            "run complete"
        );
        summary
    }
}

/// One admitted workflow: acquire a permit, run, log the outcome.
async fn process_firmware(
    firmware: Firmware,
    deps: SharedDeps,
    gate: Arc<Semaphore>,
) -> Result<WorkflowOutcome, ()> {
    let _permit = match gate.acquire_owned().await {
        Ok(permit) => permit,
        Err(_) => return Err(()),
    };

    let ctx = WorkflowContext {
        output_dir: &deps.output_dir,
        fetcher: deps.fetcher.as_ref(),
        decryptor: deps.decryptor.as_ref(),
        extractor: deps.extractor.as_ref(),
        reporter: deps.reporter.as_ref(),
        locks: &deps.locks,
    };

    match run_workflow(&firmware, &ctx).await {
        Ok(outcome) => {
            info!(
                device = %firmware.identifier,
                version = %firmware.version,
                ?outcome,
                "workflow finished"
            );
            Ok(outcome)
        }
        Err(e) => {
            error!(
                device = %firmware.identifier,
                version = %firmware.version,
                error = %e,
                "workflow failed"
            );
            Err(())
        }
    }
}
