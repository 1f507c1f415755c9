//! `coawst-archive` assembles per-run COAWST ocean model forecast files into
//! weekly [Zarr V3](https://zarr-specs.readthedocs.io/en/latest/v3/core/index.html)
//! stores and exports them as single compressed NetCDF-4 archive files.
//!
//! The pipeline has four stages, run in order for one weekly window:
//! 1. [`template::build_template`] declares the store schema on a uniform
//!    hourly time axis without writing any time-varying data.
//! 2. [`ingest::ingest`] writes the trailing steps of each forecast file into
//!    the region of the time axis its timestamp addresses, skipping sources
//!    that cannot be read or do not align with the grid.
//! 3. [`rechunk::rechunk`] repartitions the assembled store for archival
//!    access patterns under a bounded memory budget.
//! 4. [`export::export_netcdf`] writes the rechunked store as one NetCDF-4
//!    file (requires the `netcdf` feature).
//!
//! Stores are accessed through the [`zarrs`] storage API, so every stage
//! works against both filesystem and in-memory stores.

pub mod config;
pub mod dataset;
pub mod export;
pub mod grid;
pub mod ingest;
pub mod rechunk;
pub mod source;
pub mod template;
pub mod varmap;

pub use config::{ArchiveConfig, StorePaths};
pub use dataset::{Dataset, Values, Variable};
pub use grid::TimeGrid;
pub use ingest::{IngestOutcome, IngestReport, SourceCandidate};
pub use rechunk::{ChunkPlan, RechunkOptions};
pub use source::SourceOpener;
pub use varmap::{VarMap, VarRule};
