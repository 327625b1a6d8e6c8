//! Progress reporting for pipeline stages.
//!
//! The pipeline never writes progress to a global channel. Callers inject a
//! [`ProgressReporter`] and receive stage lifecycle events plus byte-level
//! download progress; the CLI maps these onto progress bars, tests collect
//! them into vectors.

use std::fmt;

/// A pipeline stage, as seen by progress observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Fetching the firmware image.
    Download,
    /// Container inspection, decryption, and bundle extraction.
    Extract,
    /// Moving bundle directories out of the platform tree.
    Relocate,
    /// Archiving and hashing bundles.
    Package,
    /// Appending ledger records.
    Metadata,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Download => "download",
            Stage::Extract => "extract",
            Stage::Relocate => "relocate",
            Stage::Package => "package",
            Stage::Metadata => "metadata",
        };
        write!(f, "{}", name)
    }
}

/// Observer for workflow progress events.
///
/// Implementations must be cheap and non-blocking; they are called from
/// inside pipeline stages.
pub trait ProgressReporter: Send + Sync {
    /// A stage began for the given device/version pair.
    fn stage_started(&self, identifier: &str, version: &str, stage: Stage);

    /// Bytes moved during the current stage. `total` is the declared size
    /// when known (e.g. Content-Length).
    fn bytes_progress(&self, identifier: &str, version: &str, bytes: u64, total: Option<u64>);

    /// A stage completed successfully.
    fn stage_completed(&self, identifier: &str, version: &str, stage: Stage);

    /// A stage failed; the workflow will stop here.
    fn stage_failed(&self, identifier: &str, version: &str, stage: Stage, error: &str);

    /// The workflow was skipped because the version is already ledgered.
    fn workflow_skipped(&self, identifier: &str, version: &str);
}

/// Reporter that discards every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullReporter;

impl ProgressReporter for NullReporter {
    fn stage_started(&self, _identifier: &str, _version: &str, _stage: Stage) {}
    fn bytes_progress(&self, _identifier: &str, _version: &str, _bytes: u64, _total: Option<u64>) {}
    fn stage_completed(&self, _identifier: &str, _version: &str, _stage: Stage) {}
    fn stage_failed(&self, _identifier: &str, _version: &str, _stage: Stage, _error: &str) {}
    fn workflow_skipped(&self, _identifier: &str, _version: &str) {}
}
