//! Report sinks: CSV (one file per tray), JSON and Markdown.

use crate::report::{Report, SlotMetrics, TrayTable};
use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

/// Suffix marking cells where an image was present but no sample was detected.
pub const NO_SAMPLE_MARKER: &str = "*";

const NOT_AVAILABLE: &str = "N/A";
const METRIC_HEADERS: [&str; 4] = ["%", "INF", "CLR", "ALL"];

/// Renders a computed report somewhere durable.
pub trait ReportSink {
    /// Write the report and return the paths written.
    fn write(&self, report: &Report) -> Result<Vec<PathBuf>>;
}

fn csv_escape(value: &str) -> String {
    if value.contains(',') || value.contains('"') || value.contains('\n') {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

fn cell_values(cell: &SlotMetrics) -> [String; 4] {
    let marker = match cell {
        SlotMetrics::NoSampleDetected => NO_SAMPLE_MARKER,
        _ => "",
    };
    match cell.metrics() {
        Some(m) => [
            format!("{}{marker}", m.infected_percent),
            format!("{}{marker}", m.infected),
            format!("{}{marker}", m.clear),
            format!("{}{marker}", m.analyzed),
        ],
        None => Default::default(),
    }
}

fn ensure_parent_dir(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create directory {}", parent.display()))?;
    }
    Ok(())
}

/// CSV text for one tray: two header rows then one row per slot.
pub fn render_tray_csv(report: &Report, tray: &TrayTable) -> String {
    let mut out = String::new();

    let mut header = vec!["SampleID".to_string()];
    let mut sub_header = vec![String::new()];
    for timepoint in &report.timepoints {
        header.push(csv_escape(timepoint));
        header.extend(std::iter::repeat(String::new()).take(3));
        sub_header.extend(METRIC_HEADERS.iter().map(|h| h.to_string()));
    }
    out.push_str(&header.join(","));
    out.push('\n');
    out.push_str(&sub_header.join(","));
    out.push('\n');

    for row in &tray.rows {
        let mut fields = vec![csv_escape(row.sample_id.as_deref().unwrap_or(NOT_AVAILABLE))];
        for cell in &row.cells {
            fields.extend(cell_values(cell));
        }
        out.push_str(&fields.join(","));
        out.push('\n');
    }

    out
}

/// Writes `<tray>.csv` for every tray into a directory.
pub struct CsvReportSink {
    pub dir: PathBuf,
}

impl ReportSink for CsvReportSink {
    fn write(&self, report: &Report) -> Result<Vec<PathBuf>> {
        fs::create_dir_all(&self.dir)
            .with_context(|| format!("Failed to create directory {}", self.dir.display()))?;

        let mut written = Vec::with_capacity(report.trays.len());
        for tray in &report.trays {
            let path = self.dir.join(format!("{}.csv", tray.name));
            fs::write(&path, render_tray_csv(report, tray))
                .with_context(|| format!("Failed to write {}", path.display()))?;
            written.push(path);
        }
        Ok(written)
    }
}

/// Writes the whole report as pretty JSON.
pub struct JsonReportSink {
    pub path: PathBuf,
}

impl ReportSink for JsonReportSink {
    fn write(&self, report: &Report) -> Result<Vec<PathBuf>> {
        ensure_parent_dir(&self.path)?;
        let json = serde_json::to_string_pretty(report).context("Failed to serialize report")?;
        fs::write(&self.path, json)
            .with_context(|| format!("Failed to write {}", self.path.display()))?;
        Ok(vec![self.path.clone()])
    }
}

/// Generate a Markdown document with one table per tray.
pub fn render_markdown(report: &Report) -> String {
    let mut output = String::new();

    output.push_str("# Blackbird Report\n\n");
    output.push_str(&format!(
        "- **Thresholds:** low {} / high {}\n",
        report.thresholds.low(),
        report.thresholds.high()
    ));
    output.push_str(&format!("- **Timepoints:** {}\n", report.timepoints.join(", ")));
    output.push_str(&format!(
        "- **Samples processed:** {}\n\n",
        report.samples_processed()
    ));
    output.push_str(&format!(
        "Columns per timepoint: `%` infected percent, `INF` infected tiles, `CLR` clear tiles, \
         `ALL` analyzed tiles. Values marked `{NO_SAMPLE_MARKER}` had no sample detected. \
         Slots without any image are omitted.\n\n"
    ));

    for tray in &report.trays {
        output.push_str(&format!("## {}\n\n", tray.name));

        output.push_str("| Slot | SampleID |");
        for timepoint in &report.timepoints {
            for metric in METRIC_HEADERS {
                output.push_str(&format!(" {timepoint} {metric} |"));
            }
        }
        output.push('\n');
        output.push_str("|---:|---|");
        for _ in 0..report.timepoints.len() * METRIC_HEADERS.len() {
            output.push_str("---:|");
        }
        output.push('\n');

        for row in tray.rows.iter().filter(|r| r.sample_id.is_some()) {
            output.push_str(&format!(
                "| {} | {} |",
                row.slot,
                row.sample_id.as_deref().unwrap_or(NOT_AVAILABLE)
            ));
            for cell in &row.cells {
                for value in cell_values(cell) {
                    output.push_str(&format!(" {value} |"));
                }
            }
            output.push('\n');
        }
        output.push('\n');
    }

    output
}

pub struct MarkdownReportSink {
    pub path: PathBuf,
}

impl ReportSink for MarkdownReportSink {
    fn write(&self, report: &Report) -> Result<Vec<PathBuf>> {
        ensure_parent_dir(&self.path)?;
        fs::write(&self.path, render_markdown(report))
            .with_context(|| format!("Failed to write {}", self.path.display()))?;
        Ok(vec![self.path.clone()])
    }
}
