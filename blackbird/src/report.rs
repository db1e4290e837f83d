//! Thresholding of stored score maps into per-tray report tables.

use crate::catalog::SLOTS_PER_TRAY;
use crate::error::ThresholdError;
use crate::result_store::ResultStore;
use crate::score_map::ScoreMap;
use serde::Serialize;

/// Probability cut-offs. Cells `>= high` count as infected, cells `< low` as
/// clear; the band in between is ignored.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Thresholds {
    low: f32,
    high: f32,
}

impl Thresholds {
    pub fn new(low: f32, high: f32) -> Result<Self, ThresholdError> {
        for value in [low, high] {
            if !(0.0..=1.0).contains(&value) {
                return Err(ThresholdError::OutOfBounds(value));
            }
        }
        if low > high {
            return Err(ThresholdError::InvalidRange { low, high });
        }
        Ok(Self { low, high })
    }

    pub fn low(&self) -> f32 {
        self.low
    }

    pub fn high(&self) -> f32 {
        self.high
    }
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            low: 0.5,
            high: 0.5,
        }
    }
}

/// The four per-sample figures of a report cell.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Metrics {
    pub infected_percent: u32,
    pub infected: usize,
    pub clear: usize,
    pub analyzed: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SlotMetrics {
    /// No image occupied the slot at this timepoint.
    NotAvailable,
    /// An image was there but no sample was found in it. Metrics are all zero.
    NoSampleDetected,
    Measured(Metrics),
}

impl SlotMetrics {
    /// Figures to display, `None` for slots without an entry.
    pub fn metrics(&self) -> Option<Metrics> {
        match self {
            SlotMetrics::NotAvailable => None,
            SlotMetrics::NoSampleDetected => Some(Metrics::default()),
            SlotMetrics::Measured(m) => Some(*m),
        }
    }
}

/// Count infected and clear tiles of one score map.
pub fn compute_metrics(score_map: &ScoreMap, thresholds: &Thresholds) -> Metrics {
    let mut metrics = Metrics::default();
    for value in score_map.cells().filter(|v| !v.is_nan()) {
        metrics.analyzed += 1;
        if value >= thresholds.high {
            metrics.infected += 1;
        } else if value < thresholds.low {
            metrics.clear += 1;
        }
    }

    let decided = metrics.infected + metrics.clear;
    if decided > 0 {
        metrics.infected_percent =
            (metrics.infected as f64 / decided as f64 * 100.0).round() as u32;
    }
    metrics
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReportRow {
    /// 1-based slot number.
    pub slot: usize,
    /// Identifier from the latest timepoint that had a sample in this slot.
    pub sample_id: Option<String>,
    /// One entry per report timepoint.
    pub cells: Vec<SlotMetrics>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrayTable {
    pub name: String,
    pub rows: Vec<ReportRow>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Report {
    pub thresholds: Thresholds,
    pub timepoints: Vec<String>,
    pub trays: Vec<TrayTable>,
}

impl Report {
    /// Number of cells that hold an entry.
    pub fn samples_processed(&self) -> usize {
        self.trays
            .iter()
            .flat_map(|t| t.rows.iter())
            .flat_map(|r| r.cells.iter())
            .filter(|c| !matches!(c, SlotMetrics::NotAvailable))
            .count()
    }
}

/// Aggregate a result store into per-tray tables.
pub fn build_report(store: &ResultStore, thresholds: Thresholds) -> Report {
    let timepoints: Vec<String> = store.timepoints.iter().map(|t| t.name.clone()).collect();

    let trays = store
        .tray_names()
        .into_iter()
        .map(|tray_name| {
            let mut rows: Vec<ReportRow> = (1..=SLOTS_PER_TRAY)
                .map(|slot| ReportRow {
                    slot,
                    sample_id: None,
                    cells: vec![SlotMetrics::NotAvailable; timepoints.len()],
                })
                .collect();

            for (column, timepoint) in store.timepoints.iter().enumerate() {
                let Some(tray) = timepoint.trays.iter().find(|t| t.name == tray_name) else {
                    continue;
                };
                for (row, entry) in rows.iter_mut().zip(tray.slots.iter()) {
                    let Some(entry) = entry else {
                        continue;
                    };
                    row.sample_id = Some(entry.sample_id.clone());
                    row.cells[column] = match &entry.score_map {
                        Some(map) => SlotMetrics::Measured(compute_metrics(map, &thresholds)),
                        None => SlotMetrics::NoSampleDetected,
                    };
                }
            }

            TrayTable {
                name: tray_name.to_string(),
                rows,
            }
        })
        .collect();

    Report {
        thresholds,
        timepoints,
        trays,
    }
}
