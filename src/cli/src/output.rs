//! Table formatting and progress display for CLI output.

use comfy_table::{ContentArrangement, Table};
use indicatif::{ProgressBar, ProgressStyle};
use kra_push::ProgressSink;

/// Create a styled table with the given headers.
pub fn new_table(headers: &[&str]) -> Table {
    let mut table = Table::new();
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.load_preset(comfy_table::presets::NOTHING);
    table.set_header(headers);
    table
}

/// Format a byte count as a human-readable string.
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = 1024 * KB;
    const GB: u64 = 1024 * MB;

    if bytes >= GB {
        format!("{:.1} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

const BAR_TEMPLATE: &str =
    "{msg:>16.bold.dim} {bar:40.green/green.dim} {bytes:.bold}/{total_bytes:.dim} {bytes_per_sec}";

/// [`ProgressSink`] drawing one indicatif bar per phase on stderr.
#[derive(Default)]
pub struct ProgressBarSink {
    bar: Option<ProgressBar>,
}

impl ProgressBarSink {
    pub fn new() -> Self {
        Self::default()
    }

    fn style() -> ProgressStyle {
        ProgressStyle::with_template(BAR_TEMPLATE)
            .map(|style| style.progress_chars("=+-"))
            .unwrap_or_else(|_| ProgressStyle::default_bar())
    }
}

impl ProgressSink for ProgressBarSink {
    fn begin(&mut self, label: &str, total: u64) {
        if let Some(old) = self.bar.take() {
            old.finish_and_clear();
        }
        let bar = ProgressBar::new(total);
        bar.set_style(Self::style());
        bar.set_message(label.to_string());
        self.bar = Some(bar);
    }

    fn advance(&mut self, bytes: u64) {
        if let Some(bar) = &self.bar {
            bar.inc(bytes);
        }
    }

    fn extend(&mut self, bytes: u64) {
        if let Some(bar) = &self.bar {
            bar.inc_length(bytes);
        }
    }

    fn finish(&mut self) {
        if let Some(bar) = self.bar.take() {
            bar.finish_and_clear();
        }
    }
}
