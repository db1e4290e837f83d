//! Catalog-shaped grid of per-sample results, persisted as JSON.
//!
//! Ordered arrays are used all the way down (timepoints, trays, 351 slots) so
//! the catalog order survives a save/load round-trip.

use crate::catalog::{Experiment, SLOTS_PER_TRAY};
use crate::classifier::ClassIndex;
use crate::error::StoreError;
use crate::score_map::ScoreMap;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Default results file name, written in the experiment root.
pub const RESULTS_FILE_NAME: &str = "results.json";

/// Outcome for one populated slot. `score_map` is `None` when no sample was
/// detected in the image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultEntry {
    pub sample_id: String,
    pub score_map: Option<ScoreMap>,
}

impl ResultEntry {
    /// Build an entry whose sample id is the file stem of `file_name`.
    pub fn for_file(file_name: &str, score_map: Option<ScoreMap>) -> Self {
        let sample_id = Path::new(file_name)
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| file_name.to_string());
        Self {
            sample_id,
            score_map,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrayResults {
    pub name: String,
    pub slots: Vec<Option<ResultEntry>>,
}

impl TrayResults {
    pub fn empty(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            slots: vec![None; SLOTS_PER_TRAY],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TimepointResults {
    pub name: String,
    pub trays: Vec<TrayResults>,
}

/// Per-run counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunCounters {
    /// Samples that were attempted, whatever the outcome.
    pub processed: usize,
    pub scored: usize,
    pub no_sample: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunMetadata {
    pub experiment: String,
    pub model: String,
    pub infected_index: Option<ClassIndex>,
    pub created_at: DateTime<Utc>,
    pub tool_version: String,
    pub counters: RunCounters,
}

impl RunMetadata {
    pub fn new(experiment: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            experiment: experiment.into(),
            model: model.into(),
            infected_index: None,
            created_at: Utc::now(),
            tool_version: env!("CARGO_PKG_VERSION").to_string(),
            counters: RunCounters::default(),
        }
    }
}

/// The durable outcome of an analysis run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResultStore {
    pub metadata: RunMetadata,
    pub timepoints: Vec<TimepointResults>,
}

impl ResultStore {
    /// An all-empty store with the same timepoint/tray shape as `experiment`.
    pub fn from_experiment(experiment: &Experiment, metadata: RunMetadata) -> Self {
        let timepoints = experiment
            .timepoints
            .iter()
            .map(|tp| TimepointResults {
                name: tp.name.clone(),
                trays: tp.trays.iter().map(|t| TrayResults::empty(&t.name)).collect(),
            })
            .collect();
        Self {
            metadata,
            timepoints,
        }
    }

    pub fn default_path(experiment_root: &Path) -> PathBuf {
        experiment_root.join(RESULTS_FILE_NAME)
    }

    /// Store an entry. Indices follow the catalog the store was built from.
    pub fn set(&mut self, timepoint: usize, tray: usize, slot: usize, entry: ResultEntry) {
        self.timepoints[timepoint].trays[tray].slots[slot] = Some(entry);
    }

    pub fn entry(&self, timepoint: usize, tray: usize, slot: usize) -> Option<&ResultEntry> {
        self.timepoints
            .get(timepoint)?
            .trays
            .get(tray)?
            .slots
            .get(slot)?
            .as_ref()
    }

    pub fn timepoint_names(&self) -> Vec<&str> {
        self.timepoints.iter().map(|t| t.name.as_str()).collect()
    }

    /// Unique tray names across timepoints, in first-appearance order.
    pub fn tray_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = Vec::new();
        for tray in self.timepoints.iter().flat_map(|t| t.trays.iter()) {
            if !names.contains(&tray.name.as_str()) {
                names.push(&tray.name);
            }
        }
        names
    }

    /// Number of non-empty slots.
    pub fn populated_count(&self) -> usize {
        self.timepoints
            .iter()
            .flat_map(|t| t.trays.iter())
            .flat_map(|t| t.slots.iter())
            .filter(|s| s.is_some())
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.populated_count() == 0
    }

    fn validate(&self) -> Result<(), StoreError> {
        for timepoint in &self.timepoints {
            for tray in &timepoint.trays {
                if tray.slots.len() != SLOTS_PER_TRAY {
                    return Err(StoreError::Format(format!(
                        "tray '{}' of timepoint '{}' has {} slots, expected {}",
                        tray.name,
                        timepoint.name,
                        tray.slots.len(),
                        SLOTS_PER_TRAY
                    )));
                }
            }
        }
        Ok(())
    }

    /// Write the store as pretty JSON. Refuses to replace an existing file
    /// unless `force` is set. The file is written next to its final location
    /// and renamed into place.
    pub fn save(&self, path: &Path, force: bool) -> Result<(), StoreError> {
        if path.exists() && !force {
            return Err(StoreError::AlreadyExists(path.to_path_buf()));
        }
        self.validate()?;

        let json = serde_json::to_string_pretty(self)?;

        let mut tmp_name = path.file_name().unwrap_or_default().to_os_string();
        tmp_name.push(".tmp");
        let tmp_path = path.with_file_name(tmp_name);

        fs::write(&tmp_path, json).map_err(|source| StoreError::Io {
            path: tmp_path.clone(),
            source,
        })?;
        fs::rename(&tmp_path, path).map_err(|source| StoreError::Io {
            path: path.to_path_buf(),
            source,
        })?;

        log::debug!("Wrote results to {}", path.display());
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self, StoreError> {
        let json = fs::read_to_string(path).map_err(|source| StoreError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let store: Self = serde_json::from_str(&json)?;
        store.validate()?;
        Ok(store)
    }
}
