//! The canonical time axis of a weekly archive window.

use chrono::{DateTime, Duration, Utc};
use thiserror::Error;

/// A [`TimeGrid`] creation error.
#[derive(Debug, Error)]
pub enum TimeGridError {
    /// The step length is zero or negative.
    #[error("time grid step must be positive, got {0}")]
    NonPositiveStep(Duration),
}

/// An evenly spaced sequence of timestamps.
///
/// The grid is the authority on which destination index a source timestamp
/// addresses. [`TimeGrid::index_of`] only accepts timestamps that fall
/// exactly on a grid point; anything between grid points has no index.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimeGrid {
    start: DateTime<Utc>,
    step: Duration,
    len: u64,
}

impl TimeGrid {
    /// Create a grid of `len` timestamps starting at `start`, `step` apart.
    ///
    /// # Errors
    /// Returns [`TimeGridError::NonPositiveStep`] if `step` is not positive.
    pub fn new(start: DateTime<Utc>, step: Duration, len: u64) -> Result<Self, TimeGridError> {
        if step <= Duration::zero() {
            return Err(TimeGridError::NonPositiveStep(step));
        }
        Ok(Self { start, step, len })
    }

    /// The first timestamp of the grid.
    #[must_use]
    pub fn start(&self) -> DateTime<Utc> {
        self.start
    }

    /// The spacing between consecutive timestamps.
    #[must_use]
    pub fn step(&self) -> Duration {
        self.step
    }

    /// The number of timestamps.
    #[must_use]
    pub fn len(&self) -> u64 {
        self.len
    }

    /// Returns true if the grid holds no timestamps.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The timestamp at `index`, or [`None`] if `index` is out of range.
    #[must_use]
    pub fn timestamp(&self, index: u64) -> Option<DateTime<Utc>> {
        if index >= self.len {
            return None;
        }
        let offset = self
            .step
            .checked_mul(i32::try_from(index).ok()?)?;
        self.start.checked_add_signed(offset)
    }

    /// The index whose timestamp is exactly `t`, or [`None`] if `t` is
    /// before the grid, past its end, or between grid points.
    #[must_use]
    pub fn index_of(&self, t: DateTime<Utc>) -> Option<u64> {
        let elapsed = t.signed_duration_since(self.start).num_seconds();
        let step = self.step.num_seconds();
        if elapsed < 0 || elapsed % step != 0 {
            return None;
        }
        let index = u64::try_from(elapsed / step).ok()?;
        (index < self.len).then_some(index)
    }

    /// All grid timestamps as seconds since the Unix epoch.
    #[must_use]
    pub fn epoch_seconds(&self) -> Vec<i64> {
        let step = self.step.num_seconds();
        let start = self.start.timestamp();
        (0..i64::try_from(self.len).unwrap_or(i64::MAX))
            .map(|i| start + i * step)
            .collect()
    }
}
