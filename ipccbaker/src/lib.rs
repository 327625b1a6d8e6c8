//! ipccbaker - Carrier bundle acquisition from Apple firmware archives
//!
//! This library downloads IPSW firmware archives for a set of device
//! models, extracts the carrier bundles buried inside their disk images,
//! and repackages each bundle as a tar file with a SHA-1 checksum and a
//! JSON ledger per device.
//!
//! The moving parts, top down:
//!
//! ```text
//!   Orchestrator ── catalog lookup per device, global concurrency gate
//!        │
//!   run_workflow ── one firmware version: state machine over the stages
//!        │
//!        ├── download    resumable, hash-verified IPSW fetch
//!        ├── extract     largest zip entry, AEA decryption, 7z carve-out
//!        ├── bundle      relocation, deterministic tar, SHA-1
//!        └── ledger      append-only metadata.json / bundles.json
//! ```
//!
//! External effects (HTTP, the `ipsw` and `7z` tools, progress output)
//! sit behind traits so every stage is testable in process.

pub mod bundle;
pub mod catalog;
pub mod checksum;
pub mod config;
pub mod download;
pub mod error;
pub mod extract;
pub mod ledger;
pub mod orchestrator;
pub mod progress;
pub mod tools;
pub mod workflow;

pub use config::BakerConfig;
pub use error::{PipelineError, PipelineResult};
pub use orchestrator::{Orchestrator, RunSummary};
