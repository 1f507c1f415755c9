//! Job configuration and window/path derivation.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::grid::{TimeGrid, TimeGridError};
use crate::ingest::SourceCandidate;
use crate::rechunk::ChunkPlan;
use crate::varmap::VarMap;

/// A configuration load error.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error(transparent)]
    Io(#[from] std::io::Error),
    /// The configuration file could not be parsed.
    #[error(transparent)]
    Parse(#[from] toml::de::Error),
}

/// The store paths of one weekly window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorePaths {
    /// The assembled, ingest-chunked store.
    pub assembly: PathBuf,
    /// The rechunker's temporary store.
    pub staging: PathBuf,
    /// The rechunked archive store.
    pub archive: PathBuf,
}

/// Archiving job configuration.
///
/// The defaults mirror the operational COAWST job: hourly steps, forecast
/// files every 12 hours carrying 12 new steps, 14 files per 7-day window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ArchiveConfig {
    /// Root of the source forecast files, laid out as
    /// `<source_root>/<YYYY>/coawst_us_<YYYYMMDD_HH>.nc`.
    pub source_root: PathBuf,
    /// Where the assembly, staging and archive stores are created.
    pub output_root: PathBuf,
    /// Where exported NetCDF files are written.
    pub export_root: PathBuf,
    /// The first timestamp of window 0.
    pub series_start: DateTime<Utc>,
    /// Hours between consecutive time steps.
    pub step_hours: u64,
    /// Trailing time steps taken from each source file.
    pub steps_per_file: u64,
    /// Source files per window.
    pub files_per_window: u64,
    /// The time dimension name.
    pub time_dim: String,
    /// Time-axis chunk length of the assembly store.
    pub time_chunk: u64,
    /// Memory budget for the rechunker, in bytes.
    pub max_mem_bytes: usize,
    /// Retries per rechunk copy step.
    pub rechunk_retries: usize,
    /// The archive chunk plan.
    pub rechunk_plan: ChunkPlan,
    /// The variable rename/drop table.
    pub varmap: VarMap,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            source_root: PathBuf::from("."),
            output_root: PathBuf::from("."),
            export_root: PathBuf::from("."),
            series_start: DateTime::UNIX_EPOCH,
            step_hours: 1,
            steps_per_file: 12,
            files_per_window: 14,
            time_dim: "ocean_time".to_string(),
            time_chunk: 12,
            max_mem_bytes: 12 * 1024 * 1024 * 1024,
            rechunk_retries: 10,
            rechunk_plan: ChunkPlan::coawst(),
            varmap: VarMap::coawst(),
        }
    }
}

impl ArchiveConfig {
    /// Load a configuration from a TOML file.
    ///
    /// # Errors
    /// Returns a [`ConfigError`] if the file cannot be read or parsed.
    pub fn from_toml(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path)?;
        Ok(toml::from_str(&text)?)
    }

    /// The step length.
    #[must_use]
    pub fn step(&self) -> Duration {
        Duration::hours(self.step_hours as i64)
    }

    /// Time steps per window.
    #[must_use]
    pub fn window_len(&self) -> u64 {
        self.steps_per_file * self.files_per_window
    }

    /// The first timestamp of window `index`.
    #[must_use]
    pub fn window_start(&self, index: u64) -> DateTime<Utc> {
        self.series_start + self.step() * (self.window_len() * index) as i32
    }

    /// The time grid of window `index`.
    ///
    /// # Errors
    /// Returns a [`TimeGridError`] if the configured step is not positive.
    pub fn window_grid(&self, index: u64) -> Result<TimeGrid, TimeGridError> {
        TimeGrid::new(self.window_start(index), self.step(), self.window_len())
    }

    /// The store paths of window `index`.
    #[must_use]
    pub fn store_paths(&self, index: u64) -> StorePaths {
        let date = self.window_start(index).format("%Y-%m-%d");
        StorePaths {
            assembly: self.output_root.join(format!("dst_{index}.zarr")),
            staging: self.output_root.join(format!("tmp_{index}.zarr")),
            archive: self.output_root.join(format!("rechunk_{date}_{index:04}.zarr")),
        }
    }

    /// The source candidates of window `index`, one per forecast run, in
    /// run order.
    #[must_use]
    pub fn candidates(&self, index: u64) -> Vec<SourceCandidate> {
        (0..self.files_per_window)
            .map(|slot| {
                let expected_start =
                    self.window_start(index) + self.step() * (slot * self.steps_per_file) as i32;
                SourceCandidate {
                    path: self.source_path(expected_start),
                    expected_start,
                }
            })
            .collect()
    }

    /// The source file path for the run starting at `date`.
    #[must_use]
    pub fn source_path(&self, date: DateTime<Utc>) -> PathBuf {
        self.source_root
            .join(date.format("%Y").to_string())
            .join(format!("coawst_us_{}.nc", date.format("%Y%m%d_%H")))
    }
}
