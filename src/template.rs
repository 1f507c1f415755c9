//! Store schema scaffolding.
//!
//! The template declares the full weekly store up front so that ingestion
//! can write disjoint regions independently: every time-varying array exists
//! with its final shape, chunking and fill value before any source is read.

use std::num::NonZeroU64;
use std::sync::Arc;

use ndarray::ArrayD;
use thiserror::Error;
use tracing::debug;
use zarrs::array::chunk_grid::{RegularChunkGrid, RegularChunkGridCreateError};
use zarrs::array::{ArrayBuilder, ArrayCreateError, ArrayError, data_type};
use zarrs::group::{GroupBuilder, GroupCreateError};
use zarrs::storage::{ReadableWritableStorageTraits, StorageError};

use crate::dataset::{Dataset, Values, Variable};
use crate::grid::TimeGrid;

/// A template construction error.
#[derive(Debug, Error)]
pub enum TemplateError {
    /// The reference dataset has no time coordinate variable.
    #[error("reference dataset has no time coordinate variable {time_dim:?}")]
    MissingTimeCoordinate {
        /// The time dimension name.
        time_dim: String,
    },
    /// A variable has a zero-length dimension, which cannot be chunked.
    #[error("variable {name} has a zero-length dimension")]
    ZeroSizedDimension {
        /// The variable name.
        name: String,
    },
    /// A chunk grid could not be constructed.
    #[error(transparent)]
    ChunkGrid(#[from] RegularChunkGridCreateError),
    /// The root group could not be created.
    #[error(transparent)]
    GroupCreate(#[from] GroupCreateError),
    /// An array could not be created.
    #[error(transparent)]
    ArrayCreate(#[from] ArrayCreateError),
    /// An array write failed.
    #[error(transparent)]
    Array(#[from] ArrayError),
    /// A store operation failed.
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Scaffold the weekly store from a reference dataset.
///
/// The root group carries the reference's global attributes. Each
/// time-varying variable of the reference becomes an array at `/<name>`
/// with the time axis re-expanded to `grid.len()`, chunked
/// `min(time_chunk, grid.len())` along time and full-length elsewhere.
/// Only metadata is written for these arrays; their data stays at the fill
/// value until ingestion. Static variables and the time coordinate are
/// written eagerly since no source supplies them region by region.
///
/// # Errors
/// Returns a [`TemplateError`] if the reference has no time coordinate or
/// a store operation fails.
pub fn build_template<TStorage>(
    store: &Arc<TStorage>,
    reference: &Dataset,
    grid: &TimeGrid,
    time_dim: &str,
    time_chunk: u64,
) -> Result<(), TemplateError>
where
    TStorage: ?Sized + ReadableWritableStorageTraits + 'static,
{
    if reference.time_values(time_dim).is_none() {
        return Err(TemplateError::MissingTimeCoordinate {
            time_dim: time_dim.to_string(),
        });
    }

    GroupBuilder::new()
        .attributes(reference.attributes.clone())
        .build(store.clone(), "/")?
        .store_metadata()?;

    for (name, variable) in reference.time_varying(time_dim) {
        if name == time_dim {
            continue;
        }
        declare_time_varying(store, name, variable, grid, time_dim, time_chunk)?;
    }

    for (name, variable) in reference.statics(time_dim) {
        write_static(store, name, variable)?;
    }

    write_time_coordinate(store, grid, time_dim, time_chunk)?;
    Ok(())
}

fn declare_time_varying<TStorage>(
    store: &Arc<TStorage>,
    name: &str,
    variable: &Variable,
    grid: &TimeGrid,
    time_dim: &str,
    time_chunk: u64,
) -> Result<(), TemplateError>
where
    TStorage: ?Sized + ReadableWritableStorageTraits + 'static,
{
    // time_varying() only yields variables that carry the time dimension
    let axis = variable.axis_of(time_dim).unwrap_or_default();

    let mut shape: Vec<u64> = variable.values.shape().iter().map(|&s| s as u64).collect();
    shape[axis] = grid.len();

    let mut chunks = shape.clone();
    chunks[axis] = time_chunk.min(grid.len());
    let chunk_shape = nonzero_chunks(&chunks, name)?;
    debug!(name, ?shape, ?chunks, "declaring time-varying array");

    ArrayBuilder::new_with_chunk_grid(
        RegularChunkGrid::new(shape, chunk_shape)?,
        variable.values.data_type(),
        variable.values.fill_value(),
    )
    .dimension_names(Some(variable.dims.clone()))
    .attributes(variable.attributes.clone())
    .build(store.clone(), &format!("/{name}"))?
    .store_metadata()?;
    Ok(())
}

fn write_static<TStorage>(
    store: &Arc<TStorage>,
    name: &str,
    variable: &Variable,
) -> Result<(), TemplateError>
where
    TStorage: ?Sized + ReadableWritableStorageTraits + 'static,
{
    let shape: Vec<u64> = variable.values.shape().iter().map(|&s| s as u64).collect();
    let chunk_shape = nonzero_chunks(&shape, name)?;
    debug!(name, ?shape, "writing static array");

    let array = ArrayBuilder::new_with_chunk_grid(
        RegularChunkGrid::new(shape, chunk_shape)?,
        variable.values.data_type(),
        variable.values.fill_value(),
    )
    .dimension_names(Some(variable.dims.clone()))
    .attributes(variable.attributes.clone())
    .build(store.clone(), &format!("/{name}"))?;
    array.store_metadata()?;

    let offset = vec![0u64; variable.values.ndim()];
    variable.values.store_at(&array, &offset)?;
    Ok(())
}

fn write_time_coordinate<TStorage>(
    store: &Arc<TStorage>,
    grid: &TimeGrid,
    time_dim: &str,
    time_chunk: u64,
) -> Result<(), TemplateError>
where
    TStorage: ?Sized + ReadableWritableStorageTraits + 'static,
{
    let shape = vec![grid.len()];
    let chunk_shape = nonzero_chunks(&[time_chunk.min(grid.len())], time_dim)?;

    let mut attributes = serde_json::Map::new();
    attributes.insert(
        "units".to_string(),
        "seconds since 1970-01-01 00:00:00".into(),
    );

    let array = ArrayBuilder::new_with_chunk_grid(
        RegularChunkGrid::new(shape, chunk_shape)?,
        data_type::int64(),
        0i64,
    )
    .dimension_names(Some([time_dim.to_string()]))
    .attributes(attributes)
    .build(store.clone(), &format!("/{time_dim}"))?;
    array.store_metadata()?;

    let seconds = grid.epoch_seconds();
    let values = Values::Int64(
        ArrayD::from_shape_vec(vec![seconds.len()], seconds)
            .map_err(|_| TemplateError::ZeroSizedDimension {
                name: time_dim.to_string(),
            })?,
    );
    values.store_at(&array, &[0])?;
    Ok(())
}

fn nonzero_chunks(chunks: &[u64], name: &str) -> Result<Vec<NonZeroU64>, TemplateError> {
    chunks
        .iter()
        .map(|&c| NonZeroU64::new(c))
        .collect::<Option<Vec<_>>>()
        .ok_or_else(|| TemplateError::ZeroSizedDimension {
            name: name.to_string(),
        })
}
