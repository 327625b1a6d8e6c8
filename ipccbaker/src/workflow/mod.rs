//! Per-firmware workflow: one (device, version) pair from download to
//! ledgered artifacts.
//!
//! The workflow is a strict state machine:
//!
//! ```text
//! NotStarted → Downloading → Extracting → Relocating → Packaging
//!            → MetadataWritten → Done
//! ```
//!
//! with `Failed` reachable from every non-terminal state. The first stage
//! failure ends the workflow; nothing it leaves behind corrupts completed
//! work, and a rerun resumes from whatever the disk and ledgers already
//! hold. Each workflow exclusively owns its version directory; the device
//! ledger is shared and therefore only touched under the device lock.

use std::path::Path;

use chrono::Utc;
use tracing::debug;

use crate::bundle::{self, BundleRecord};
use crate::catalog::Firmware;
use crate::download::{download_firmware, FirmwareFetcher};
use crate::error::{PipelineError, PipelineResult};
use crate::extract::extract_carrier_bundles;
use crate::ledger::{self, FirmwareEntry, LedgerLocks, BUNDLES_KEY};
use crate::progress::{ProgressReporter, Stage};
use crate::tools::{BundleExtractor, ImageDecryptor};

/// Workflow states, in transition order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkflowState {
    NotStarted,
    Downloading,
    Extracting,
    Relocating,
    Packaging,
    MetadataWritten,
    Done,
    Failed,
}

/// Terminal result of a completed workflow.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkflowOutcome {
    /// The version was downloaded, extracted, packaged, and ledgered.
    Processed,
    /// The version was already present in the device ledger.
    Skipped,
}

/// Everything a workflow needs besides the firmware record itself.
pub struct WorkflowContext<'a> {
    /// Root under which per-device trees live.
    pub output_dir: &'a Path,
    pub fetcher: &'a dyn FirmwareFetcher,
    pub decryptor: &'a dyn ImageDecryptor,
    pub extractor: &'a dyn BundleExtractor,
    pub reporter: &'a dyn ProgressReporter,
    pub locks: &'a LedgerLocks,
}

/// Run the workflow for one firmware.
///
/// Returns [`WorkflowOutcome::Skipped`] without touching the network when
/// the version already appears in the device ledger. Any stage failure is
/// returned to the caller; sibling workflows are unaffected.
pub async fn run_workflow(
    firmware: &Firmware,
    ctx: &WorkflowContext<'_>,
) -> PipelineResult<WorkflowOutcome> {
    let started_at = Utc::now();
    let id = firmware.identifier.as_str();
    let version = firmware.version.as_str();
    let mut state = WorkflowState::NotStarted;

    let device_dir = ctx.output_dir.join(id);
    let version_dir = device_dir.join(version);
    let metadata_path = device_dir.join("metadata.json");

    tokio::fs::create_dir_all(&version_dir)
        .await
        .map_err(|e| PipelineError::io(&version_dir, e))?;

    let device_lock = ctx.locks.lock_for(&metadata_path);

    // Resumability guard: a ledgered version is authoritative.
    {
        let _guard = device_lock.lock().await;
        if ledger::contains_version(&metadata_path, version).await? {
            debug!(device = id, version, "version already ledgered, skipping");
            ctx.reporter.workflow_skipped(id, version);
            return Ok(WorkflowOutcome::Skipped);
        }
    }

    transition(&mut state, WorkflowState::Downloading, id, version);
    ctx.reporter.stage_started(id, version, Stage::Download);
    let container = match download_firmware(firmware, &version_dir, ctx.fetcher, ctx.reporter).await {
        Ok(path) => {
            ctx.reporter.stage_completed(id, version, Stage::Download);
            path
        }
        Err(e) => return fail(&mut state, ctx.reporter, id, version, Stage::Download, e),
    };

    transition(&mut state, WorkflowState::Extracting, id, version);
    ctx.reporter.stage_started(id, version, Stage::Extract);
    match extract_carrier_bundles(
        &container,
        &version_dir,
        ctx.decryptor,
        ctx.extractor,
        ctx.reporter,
        id,
        version,
    )
    .await
    {
        Ok(()) => ctx.reporter.stage_completed(id, version, Stage::Extract),
        Err(e) => return fail(&mut state, ctx.reporter, id, version, Stage::Extract, e),
    }

    transition(&mut state, WorkflowState::Relocating, id, version);
    ctx.reporter.stage_started(id, version, Stage::Relocate);
    let bundles = match bundle::relocate_bundles(&version_dir).await {
        Ok(paths) => {
            ctx.reporter.stage_completed(id, version, Stage::Relocate);
            paths
        }
        Err(e) => return fail(&mut state, ctx.reporter, id, version, Stage::Relocate, e),
    };

    transition(&mut state, WorkflowState::Packaging, id, version);
    ctx.reporter.stage_started(id, version, Stage::Package);
    let records = match bundle::package_bundles(&bundles).await {
        Ok(records) => {
            ctx.reporter.stage_completed(id, version, Stage::Package);
            records
        }
        Err(e) => return fail(&mut state, ctx.reporter, id, version, Stage::Package, e),
    };

    // The raw bundle directories are superseded by their archives.
    for bundle_dir in &bundles {
        if let Err(e) = tokio::fs::remove_dir_all(bundle_dir).await {
            return fail(
                &mut state,
                ctx.reporter,
                id,
                version,
                Stage::Package,
                PipelineError::io(bundle_dir, e),
            );
        }
    }

    transition(&mut state, WorkflowState::MetadataWritten, id, version);
    ctx.reporter.stage_started(id, version, Stage::Metadata);
    let elapsed = (Utc::now() - started_at).num_milliseconds() as f64 / 1000.0;
    match write_metadata(&version_dir, &metadata_path, firmware, &records, elapsed, &device_lock)
        .await
    {
        Ok(()) => ctx.reporter.stage_completed(id, version, Stage::Metadata),
        Err(e) => return fail(&mut state, ctx.reporter, id, version, Stage::Metadata, e),
    }

    transition(&mut state, WorkflowState::Done, id, version);
    Ok(WorkflowOutcome::Processed)
}

/// Append the bundle records and the firmware summary to their ledgers.
async fn write_metadata(
    version_dir: &Path,
    metadata_path: &Path,
    firmware: &Firmware,
    records: &[BundleRecord],
    elapsed_seconds: f64,
    device_lock: &tokio::sync::Mutex<()>,
) -> PipelineResult<()> {
    let bundles_path = version_dir.join("bundles.json");
    let values = records
        .iter()
        .map(|record| {
            serde_json::to_value(record).map_err(|e| PipelineError::MalformedLedger {
                path: bundles_path.clone(),
                reason: e.to_string(),
            })
        })
        .collect::<PipelineResult<Vec<_>>>()?;

    // The version ledger is exclusively owned by this workflow.
    ledger::append_to_list(&bundles_path, BUNDLES_KEY, values).await?;

    let entry = FirmwareEntry {
        version: firmware.version.clone(),
        buildid: firmware.buildid.clone(),
        downloaded_at: Utc::now().to_rfc3339(),
        processing_time_seconds: elapsed_seconds,
        sha1: firmware.sha1sum.clone(),
        status: "processed".to_string(),
    };

    let _guard = device_lock.lock().await;
    ledger::append_firmware_entry(metadata_path, &entry).await
}

fn transition(state: &mut WorkflowState, next: WorkflowState, id: &str, version: &str) {
    debug!(device = id, version, from = ?state, to = ?next, "workflow transition");
    *state = next;
}

fn fail(
    state: &mut WorkflowState,
    reporter: &dyn ProgressReporter,
    id: &str,
    version: &str,
    stage: Stage,
    error: PipelineError,
) -> PipelineResult<WorkflowOutcome> {
    *state = WorkflowState::Failed;
    reporter.stage_failed(id, version, stage, &error.to_string());
    Err(error)
}
