//! Experiment catalog: maps an experiment directory onto a
//! timepoint × tray × slot grid.
//!
//! Expected layout:
//!
//! ```text
//! <experiment>/
//!     03-14-2025_dpi3/        timepoint, named "<MM-DD-YYYY>_<anything>"
//!         tray_A/             tray
//!             1-wt.png        sample for slot 1
//!             2-mutant.png    sample for slot 2
//! ```

use crate::error::CatalogError;
use chrono::NaiveDate;
use std::fs;
use std::path::{Path, PathBuf};

/// Number of sample positions in a tray.
pub const SLOTS_PER_TRAY: usize = 351;

const DATE_FORMAT: &str = "%m-%d-%Y";

/// Folder that `threshold` writes CSV reports into by default. It sits next
/// to the results file in the experiment root and is never a timepoint.
pub const REPORT_DIR_NAME: &str = "report";

/// Fixed-length array of sample file names, indexed by `slot number - 1`.
pub type SlotArray = Vec<Option<String>>;

/// One tray within a timepoint.
#[derive(Debug, Clone, PartialEq)]
pub struct Tray {
    pub name: String,
    pub slots: SlotArray,
}

impl Tray {
    fn empty(name: String) -> Self {
        Self {
            name,
            slots: vec![None; SLOTS_PER_TRAY],
        }
    }

    /// Number of populated slots.
    pub fn populated(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }
}

/// One capture session: a dated folder holding one folder per tray.
#[derive(Debug, Clone, PartialEq)]
pub struct Timepoint {
    pub name: String,
    pub date: NaiveDate,
    pub trays: Vec<Tray>,
}

/// A scanned experiment. Immutable after construction.
#[derive(Debug, Clone)]
pub struct Experiment {
    pub name: String,
    pub root: PathBuf,
    pub image_count: usize,
    pub timepoints: Vec<Timepoint>,
}

impl Experiment {
    /// Full path of the image occupying a slot.
    pub fn image_path(&self, timepoint: &Timepoint, tray: &Tray, file_name: &str) -> PathBuf {
        self.root.join(&timepoint.name).join(&tray.name).join(file_name)
    }

    /// Unique tray names across all timepoints, in first-appearance order.
    pub fn tray_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = Vec::new();
        for timepoint in &self.timepoints {
            for tray in &timepoint.trays {
                if !names.contains(&tray.name.as_str()) {
                    names.push(&tray.name);
                }
            }
        }
        names
    }

    /// One-line description used by the CLI.
    pub fn summary(&self) -> String {
        format!(
            "{}: {} image(s), {} tray(s), {} timepoint(s)",
            self.name,
            self.image_count,
            self.tray_names().len(),
            self.timepoints.len()
        )
    }
}

/// Check if a file is a supported image format
/// Supports: jpg, jpeg, png, webp, bmp, tiff, tif
pub fn is_supported_image_file(path: &Path) -> bool {
    if let Some(ext) = path.extension() {
        let ext_lower = ext.to_string_lossy().to_lowercase();
        matches!(
            ext_lower.as_str(),
            "jpg" | "jpeg" | "png" | "webp" | "bmp" | "tiff" | "tif"
        )
    } else {
        false
    }
}

/// Parse the leading 1-based slot number of a sample file name
/// (`"12-plantA.png"` -> `Some(12)`).
pub fn parse_slot_number(file_name: &str) -> Option<usize> {
    let digits: String = file_name
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    digits.parse().ok()
}

/// Parse the date prefix (everything before the first `_`) of a timepoint folder.
pub fn parse_timepoint_date(folder: &str) -> Result<NaiveDate, CatalogError> {
    let prefix = folder.split('_').next().unwrap_or(folder);
    NaiveDate::parse_from_str(prefix, DATE_FORMAT).map_err(|_| CatalogError::DateParse {
        folder: folder.to_string(),
        prefix: prefix.to_string(),
    })
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> CatalogError + '_ {
    move |source| CatalogError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Immediate subdirectory names of `dir`, sorted for a stable discovery order.
fn list_subdirectories(dir: &Path) -> Result<Vec<String>, CatalogError> {
    let mut names = Vec::new();
    for entry in fs::read_dir(dir).map_err(io_error(dir))? {
        let entry = entry.map_err(io_error(dir))?;
        if entry.path().is_dir() {
            names.push(entry.file_name().to_string_lossy().to_string());
        }
    }
    names.sort();
    Ok(names)
}

/// Fill a tray's slots from the images in `dir`. Returns how many slots went
/// from empty to populated.
fn scan_tray(dir: &Path, tray: &mut Tray) -> Result<usize, CatalogError> {
    let mut files = Vec::new();
    for entry in fs::read_dir(dir).map_err(io_error(dir))? {
        let entry = entry.map_err(io_error(dir))?;
        let path = entry.path();
        if path.is_file() && is_supported_image_file(&path) {
            files.push(entry.file_name().to_string_lossy().to_string());
        }
    }
    files.sort();

    let mut added = 0;
    for file_name in files {
        let slot = match parse_slot_number(&file_name) {
            Some(n) if (1..=SLOTS_PER_TRAY).contains(&n) => n - 1,
            _ => {
                log::warn!(
                    "Skipping {}: name does not start with a slot number in 1..={}",
                    dir.join(&file_name).display(),
                    SLOTS_PER_TRAY
                );
                continue;
            }
        };

        // Last file claiming a slot wins.
        if tray.slots[slot].replace(file_name).is_none() {
            added += 1;
        }
    }

    Ok(added)
}

/// Scan an experiment directory into a catalog.
pub fn scan_experiment(root: &Path) -> Result<Experiment, CatalogError> {
    let folders: Vec<String> = list_subdirectories(root)?
        .into_iter()
        .filter(|folder| {
            let is_report = folder == REPORT_DIR_NAME;
            if is_report {
                log::debug!("Skipping report folder {folder}");
            }
            !is_report
        })
        .collect();
    if folders.is_empty() {
        return Err(CatalogError::NoTimepoints(root.to_path_buf()));
    }

    // Parse every date before touching any tray so a bad folder aborts the
    // scan without a partial result.
    let mut dated = Vec::with_capacity(folders.len());
    for folder in folders {
        let date = parse_timepoint_date(&folder)?;
        dated.push((folder, date));
    }
    dated.sort_by_key(|(_, date)| *date);

    let mut image_count = 0;
    let mut timepoints = Vec::with_capacity(dated.len());
    for (folder, date) in dated {
        let timepoint_dir = root.join(&folder);
        let mut trays = Vec::new();
        for tray_name in list_subdirectories(&timepoint_dir)? {
            let mut tray = Tray::empty(tray_name);
            image_count += scan_tray(&timepoint_dir.join(&tray.name), &mut tray)?;
            trays.push(tray);
        }

        if trays.is_empty() {
            log::debug!("Timepoint {folder} has no tray folders");
        }

        timepoints.push(Timepoint {
            name: folder,
            date,
            trays,
        });
    }

    let name = root
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| root.display().to_string());

    Ok(Experiment {
        name,
        root: root.to_path_buf(),
        image_count,
        timepoints,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn touch(path: &Path) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, b"fake image").unwrap();
    }

    #[test]
    fn test_is_supported_image_file() {
        assert!(is_supported_image_file(Path::new("1-a.png")));
        assert!(is_supported_image_file(Path::new("1-a.JPG")));
        assert!(is_supported_image_file(Path::new("1-a.tif")));
        assert!(!is_supported_image_file(Path::new("1-a.txt")));
        assert!(!is_supported_image_file(Path::new("results")));
    }

    #[test]
    fn test_parse_slot_number() {
        assert_eq!(parse_slot_number("12-plantA.png"), Some(12));
        assert_eq!(parse_slot_number("351.png"), Some(351));
        assert_eq!(parse_slot_number("007_x.png"), Some(7));
        assert_eq!(parse_slot_number("plant-12.png"), None);
    }

    #[test]
    fn test_parse_timepoint_date() {
        let date = parse_timepoint_date("03-14-2025_dpi3").unwrap();
        assert_eq!(date, NaiveDate::from_ymd_opt(2025, 3, 14).unwrap());
        assert!(parse_timepoint_date("03-14-2025").is_ok());
        assert!(matches!(
            parse_timepoint_date("2025-03-14_x"),
            Err(CatalogError::DateParse { .. })
        ));
    }

    #[test]
    fn test_scan_sorts_timepoints_by_date() {
        let temp_dir = tempdir().unwrap();
        let root = temp_dir.path();
        touch(&root.join("12-01-2024_late/trayA/1-a.png"));
        touch(&root.join("01-15-2024_early/trayA/1-a.png"));
        touch(&root.join("06-30-2024_mid/trayA/1-a.png"));

        let experiment = scan_experiment(root).unwrap();
        let names: Vec<_> = experiment.timepoints.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["01-15-2024_early", "06-30-2024_mid", "12-01-2024_late"]);
    }

    #[test]
    fn test_scan_same_date_keeps_discovery_order() {
        let temp_dir = tempdir().unwrap();
        let root = temp_dir.path();
        fs::create_dir_all(root.join("05-01-2024_b")).unwrap();
        fs::create_dir_all(root.join("05-01-2024_a")).unwrap();
        fs::create_dir_all(root.join("04-01-2024_z")).unwrap();

        let experiment = scan_experiment(root).unwrap();
        let names: Vec<_> = experiment.timepoints.iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["04-01-2024_z", "05-01-2024_a", "05-01-2024_b"]);
    }

    #[test]
    fn test_scan_places_images_in_slots() {
        let temp_dir = tempdir().unwrap();
        let root = temp_dir.path();
        touch(&root.join("01-01-2024/trayA/1-first.png"));
        touch(&root.join("01-01-2024/trayA/351-last.png"));
        touch(&root.join("01-01-2024/trayA/notes.txt"));
        touch(&root.join("01-01-2024/trayB/10-x.jpg"));

        let experiment = scan_experiment(root).unwrap();
        assert_eq!(experiment.image_count, 3);

        let timepoint = &experiment.timepoints[0];
        assert_eq!(timepoint.trays.len(), 2);
        let tray_a = &timepoint.trays[0];
        assert_eq!(tray_a.name, "trayA");
        assert_eq!(tray_a.slots.len(), SLOTS_PER_TRAY);
        assert_eq!(tray_a.slots[0].as_deref(), Some("1-first.png"));
        assert_eq!(tray_a.slots[350].as_deref(), Some("351-last.png"));
        assert_eq!(timepoint.trays[1].slots[9].as_deref(), Some("10-x.jpg"));
    }

    #[test]
    fn test_scan_duplicate_slot_last_write_wins() {
        let temp_dir = tempdir().unwrap();
        let root = temp_dir.path();
        touch(&root.join("01-01-2024/trayA/5-a.png"));
        touch(&root.join("01-01-2024/trayA/5-b.png"));

        let experiment = scan_experiment(root).unwrap();
        let tray = &experiment.timepoints[0].trays[0];
        assert_eq!(tray.slots[4].as_deref(), Some("5-b.png"));
        assert_eq!(experiment.image_count, 1);
    }

    #[test]
    fn test_scan_skips_out_of_range_slots() {
        let temp_dir = tempdir().unwrap();
        let root = temp_dir.path();
        touch(&root.join("01-01-2024/trayA/0-zero.png"));
        touch(&root.join("01-01-2024/trayA/352-over.png"));
        touch(&root.join("01-01-2024/trayA/plant.png"));

        let experiment = scan_experiment(root).unwrap();
        assert_eq!(experiment.image_count, 0);
    }

    #[test]
    fn test_image_count_matches_populated_slots() {
        let temp_dir = tempdir().unwrap();
        let root = temp_dir.path();
        for (tp, tray, file) in [
            ("01-01-2024", "t1", "1-a.png"),
            ("01-01-2024", "t1", "2-a.png"),
            ("01-01-2024", "t2", "2-a.png"),
            ("02-01-2024", "t1", "1-a.png"),
            ("02-01-2024", "t1", "1-b.png"),
            ("02-01-2024", "t3", "300-a.png"),
        ] {
            touch(&root.join(tp).join(tray).join(file));
        }

        let experiment = scan_experiment(root).unwrap();
        let populated: usize = experiment
            .timepoints
            .iter()
            .flat_map(|t| t.trays.iter())
            .map(Tray::populated)
            .sum();
        assert_eq!(experiment.image_count, populated);
        assert_eq!(experiment.image_count, 5);
        assert_eq!(experiment.tray_names(), vec!["t1", "t2", "t3"]);
    }

    #[test]
    fn test_scan_empty_timepoint_is_kept() {
        let temp_dir = tempdir().unwrap();
        let root = temp_dir.path();
        fs::create_dir_all(root.join("01-01-2024_empty")).unwrap();

        let experiment = scan_experiment(root).unwrap();
        assert_eq!(experiment.timepoints.len(), 1);
        assert!(experiment.timepoints[0].trays.is_empty());
        assert_eq!(experiment.image_count, 0);
    }

    #[test]
    fn test_scan_without_timepoints_fails() {
        let temp_dir = tempdir().unwrap();
        fs::write(temp_dir.path().join("stray.png"), b"x").unwrap();

        let result = scan_experiment(temp_dir.path());
        assert!(matches!(result, Err(CatalogError::NoTimepoints(_))));
    }

    #[test]
    fn test_scan_bad_date_aborts() {
        let temp_dir = tempdir().unwrap();
        let root = temp_dir.path();
        touch(&root.join("01-01-2024/trayA/1-a.png"));
        fs::create_dir_all(root.join("scoremaps")).unwrap();

        let result = scan_experiment(root);
        assert!(matches!(result, Err(CatalogError::DateParse { .. })));
    }

    #[test]
    fn test_scan_ignores_report_folder() {
        let temp_dir = tempdir().unwrap();
        let root = temp_dir.path();
        touch(&root.join("01-01-2024/trayA/1-a.png"));
        touch(&root.join(REPORT_DIR_NAME).join("trayA.csv"));

        let experiment = scan_experiment(root).unwrap();
        assert_eq!(experiment.timepoints.len(), 1);
        assert_eq!(experiment.timepoints[0].name, "01-01-2024");
        assert_eq!(experiment.image_count, 1);
    }

    #[test]
    fn test_scan_report_folder_alone_has_no_timepoints() {
        let temp_dir = tempdir().unwrap();
        fs::create_dir_all(temp_dir.path().join(REPORT_DIR_NAME)).unwrap();

        let result = scan_experiment(temp_dir.path());
        assert!(matches!(result, Err(CatalogError::NoTimepoints(_))));
    }
}
