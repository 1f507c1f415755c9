//! Region-indexed ingestion of source files into a templated store.

use std::ops::Range;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use thiserror::Error;
use tracing::{info, warn};
use zarrs::array::{Array, ArrayCreateError, ArrayError};
use zarrs::storage::ReadableWritableStorageTraits;

use crate::dataset::Dataset;
use crate::grid::TimeGrid;
use crate::source::{SourceError, SourceOpener};
use crate::varmap::VarMap;

/// An ingestion failure that fails the whole run.
///
/// Per-source open and alignment problems are not errors; they are recorded
/// as skips in the [`IngestReport`]. Only destination-side problems surface
/// here, since a write failure can leave a region partially written.
#[derive(Debug, Error)]
pub enum IngestError {
    /// A destination array could not be opened.
    #[error(transparent)]
    ArrayCreate(#[from] ArrayCreateError),
    /// A region write failed.
    #[error(transparent)]
    Array(#[from] ArrayError),
    /// A source variable has no matching destination array.
    #[error("source variable {name} is not declared in the destination store")]
    UndeclaredVariable {
        /// The variable name, after renaming.
        name: String,
    },
}

/// A source file nominated for one slot of the window.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceCandidate {
    /// The file path.
    pub path: PathBuf,
    /// The grid timestamp its first retained step must carry.
    pub expected_start: DateTime<Utc>,
}

/// What happened to one candidate.
#[derive(Debug)]
pub enum IngestOutcome {
    /// The candidate's trailing steps were written.
    Written {
        /// The written index range on the time axis.
        range: Range<u64>,
    },
    /// The candidate could not be opened or decoded and was skipped.
    SkippedUnreadable {
        /// The failure.
        error: SourceError,
    },
    /// The candidate's timestamps do not align with the grid and it was
    /// skipped.
    SkippedMisaligned {
        /// The timestamp the slot requires.
        expected: DateTime<Utc>,
        /// The first retained timestamp the source actually carries, if it
        /// could be determined.
        actual: Option<DateTime<Utc>>,
    },
}

impl IngestOutcome {
    /// Returns true for the written outcome.
    #[must_use]
    pub fn is_written(&self) -> bool {
        matches!(self, IngestOutcome::Written { .. })
    }
}

/// The outcome of every candidate of one ingestion run.
#[derive(Debug, Default)]
pub struct IngestReport {
    /// One entry per candidate, in input order.
    pub outcomes: Vec<(PathBuf, IngestOutcome)>,
}

impl IngestReport {
    /// The index ranges that were written.
    #[must_use]
    pub fn written_ranges(&self) -> Vec<Range<u64>> {
        self.outcomes
            .iter()
            .filter_map(|(_, outcome)| match outcome {
                IngestOutcome::Written { range } => Some(range.clone()),
                _ => None,
            })
            .collect()
    }

    /// The number of skipped candidates.
    #[must_use]
    pub fn skipped(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|(_, outcome)| !outcome.is_written())
            .count()
    }
}

/// Ingest `candidates` into the store scaffolded by
/// [`build_template`](crate::template::build_template).
///
/// For each candidate the destination offset on the time axis is the grid
/// index of its `expected_start`; candidates are independent, so the result
/// does not depend on their order, and rewriting a candidate writes the same
/// values to the same region. Each source is reduced to its trailing
/// `steps_per_file` time steps and `varmap` is applied before writing.
///
/// A candidate is skipped (and the skip recorded) when it cannot be opened
/// or decoded, when its `expected_start` is not a grid point, when the
/// retained steps would run past the end of the grid, or when the first
/// retained timestamp in the file is not exactly `expected_start`.
///
/// # Errors
/// Returns an [`IngestError`] on destination-side failures, which can leave
/// a region partially written.
pub fn ingest<TStorage, O>(
    store: &Arc<TStorage>,
    grid: &TimeGrid,
    opener: &O,
    candidates: &[SourceCandidate],
    steps_per_file: u64,
    varmap: &VarMap,
    time_dim: &str,
) -> Result<IngestReport, IngestError>
where
    TStorage: ?Sized + ReadableWritableStorageTraits + 'static,
    O: SourceOpener,
{
    let mut report = IngestReport::default();
    for candidate in candidates {
        let outcome = ingest_one(store, grid, opener, candidate, steps_per_file, varmap, time_dim)?;
        report.outcomes.push((candidate.path.clone(), outcome));
    }
    info!(
        written = report.written_ranges().len(),
        skipped = report.skipped(),
        "ingestion finished"
    );
    Ok(report)
}

fn ingest_one<TStorage, O>(
    store: &Arc<TStorage>,
    grid: &TimeGrid,
    opener: &O,
    candidate: &SourceCandidate,
    steps_per_file: u64,
    varmap: &VarMap,
    time_dim: &str,
) -> Result<IngestOutcome, IngestError>
where
    TStorage: ?Sized + ReadableWritableStorageTraits + 'static,
    O: SourceOpener,
{
    let path = &candidate.path;
    let expected = candidate.expected_start;

    let Some(start) = grid.index_of(expected) else {
        warn!(path = %path.display(), %expected, "candidate timestamp is not on the grid, skipping");
        return Ok(IngestOutcome::SkippedMisaligned {
            expected,
            actual: None,
        });
    };
    if start + steps_per_file > grid.len() {
        warn!(path = %path.display(), %expected, "candidate region runs past the grid, skipping");
        return Ok(IngestOutcome::SkippedMisaligned {
            expected,
            actual: None,
        });
    }

    let dataset = match opener.open(path) {
        Ok(dataset) => dataset,
        Err(error) => {
            warn!(path = %path.display(), %error, "candidate is unreadable, skipping");
            return Ok(IngestOutcome::SkippedUnreadable { error });
        }
    };
    let dataset = varmap.apply(dataset);
    let dataset = dataset.tail(time_dim, steps_per_file as usize);

    let Some(actual) = dataset.first_timestamp(time_dim) else {
        let error = SourceError::MissingTimeCoordinate {
            path: path.clone(),
        };
        warn!(path = %path.display(), %error, "candidate is unreadable, skipping");
        return Ok(IngestOutcome::SkippedUnreadable { error });
    };
    if actual != expected {
        let delta = actual.signed_duration_since(expected);
        warn!(
            path = %path.display(),
            %expected,
            %actual,
            delta_seconds = delta.num_seconds(),
            "candidate does not align with its slot, skipping"
        );
        return Ok(IngestOutcome::SkippedMisaligned {
            expected,
            actual: Some(actual),
        });
    }

    write_region(store, &dataset, start, time_dim)?;

    let steps = dataset
        .time_values(time_dim)
        .map_or(steps_per_file, |t| t.len() as u64);
    let range = start..start + steps;
    info!(path = %path.display(), ?range, "wrote candidate region");
    Ok(IngestOutcome::Written { range })
}

fn write_region<TStorage>(
    store: &Arc<TStorage>,
    dataset: &Dataset,
    start: u64,
    time_dim: &str,
) -> Result<(), IngestError>
where
    TStorage: ?Sized + ReadableWritableStorageTraits + 'static,
{
    for (name, variable) in dataset.time_varying(time_dim) {
        // The time coordinate was written in full by the template.
        if name == time_dim {
            continue;
        }
        let Some(axis) = variable.axis_of(time_dim) else {
            continue;
        };
        let array = Array::open(store.clone(), &format!("/{name}")).map_err(|err| match err {
            ArrayCreateError::MissingMetadata => IngestError::UndeclaredVariable {
                name: name.clone(),
            },
            other => IngestError::ArrayCreate(other),
        })?;
        let mut offset = vec![0u64; variable.values.ndim()];
        offset[axis] = start;
        variable.values.store_at(&array, &offset)?;
    }
    Ok(())
}
