//! Terminal progress rendering.
//!
//! Maps [`ProgressReporter`] events onto one indicatif bar per firmware
//! workflow. Bars live in a map keyed by device/version and are finished
//! when the workflow reaches a terminal stage event.

use std::collections::HashMap;
use std::sync::Mutex;

use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use ipccbaker::progress::{ProgressReporter, Stage};

const BAR_TEMPLATE: &str =
    "{prefix:24} {msg:10} [{bar:30}] {bytes}/{total_bytes} ({bytes_per_sec})";
const SPINNER_TEMPLATE: &str = "{prefix:24} {msg}";

pub struct TerminalReporter {
    multi: MultiProgress,
    bars: Mutex<HashMap<String, ProgressBar>>,
}

impl TerminalReporter {
    pub fn new() -> Self {
        Self {
            multi: MultiProgress::new(),
            bars: Mutex::new(HashMap::new()),
        }
    }

    fn key(identifier: &str, version: &str) -> String {
        format!("{}/{}", identifier, version)
    }

    fn bar_for(&self, identifier: &str, version: &str) -> ProgressBar {
        let key = Self::key(identifier, version);
        let mut bars = self.bars.lock().unwrap();
        bars.entry(key)
            .or_insert_with(|| {
                let bar = self.multi.add(ProgressBar::new_spinner());
                bar.set_style(
                    ProgressStyle::with_template(SPINNER_TEMPLATE)
                        .unwrap_or_else(|_| ProgressStyle::default_spinner()),
                );
                bar.set_prefix(Self::key(identifier, version));
                bar
            })
            .clone()
    }

    fn finish(&self, identifier: &str, version: &str, message: String) {
        let key = Self::key(identifier, version);
        if let Some(bar) = self.bars.lock().unwrap().remove(&key) {
            bar.finish_with_message(message);
        }
    }
}

impl Default for TerminalReporter {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressReporter for TerminalReporter {
    fn stage_started(&self, identifier: &str, version: &str, stage: Stage) {
        let bar = self.bar_for(identifier, version);
        bar.set_message(stage.to_string());
        if stage == Stage::Download {
            bar.set_style(
                ProgressStyle::with_template(BAR_TEMPLATE)
                    .unwrap_or_else(|_| ProgressStyle::default_bar()),
            );
        } else {
            bar.set_style(
                ProgressStyle::with_template(SPINNER_TEMPLATE)
                    .unwrap_or_else(|_| ProgressStyle::default_spinner()),
            );
            bar.tick();
        }
    }

    fn bytes_progress(&self, identifier: &str, version: &str, bytes: u64, total: Option<u64>) {
        let bar = self.bar_for(identifier, version);
        if let Some(total) = total {
            bar.set_length(total);
        }
        bar.set_position(bytes);
    }

    fn stage_completed(&self, identifier: &str, version: &str, stage: Stage) {
        if stage == Stage::Metadata {
            self.finish(identifier, version, "done".to_string());
        }
    }

    fn stage_failed(&self, identifier: &str, version: &str, stage: Stage, error: &str) {
        self.finish(identifier, version, format!("failed at {}: {}", stage, error));
    }

    fn workflow_skipped(&self, identifier: &str, version: &str) {
        let key = Self::key(identifier, version);
        if let Some(bar) = self.bars.lock().unwrap().remove(&key) {
            bar.finish_and_clear();
        }
        let _ = self.multi.println(format!("{} already processed, skipping", key));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bar_is_reused_per_workflow() {
        let reporter = TerminalReporter::new();
        reporter.stage_started("iPhone12,1", "17.1", Stage::Download);
        reporter.bytes_progress("iPhone12,1", "17.1", 512, Some(1024));
        assert_eq!(reporter.bars.lock().unwrap().len(), 1);

        reporter.stage_started("iPhone12,1", "17.2", Stage::Download);
        assert_eq!(reporter.bars.lock().unwrap().len(), 2);
    }

    #[test]
    fn test_terminal_events_drop_the_bar() {
        let reporter = TerminalReporter::new();
        reporter.stage_started("iPhone12,1", "17.1", Stage::Download);
        reporter.stage_failed("iPhone12,1", "17.1", Stage::Download, "boom");
        assert!(reporter.bars.lock().unwrap().is_empty());

        reporter.stage_started("iPhone12,1", "17.2", Stage::Metadata);
        reporter.stage_completed("iPhone12,1", "17.2", Stage::Metadata);
        assert!(reporter.bars.lock().unwrap().is_empty());
    }
}
