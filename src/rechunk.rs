//! Bounded-memory repartitioning of an assembled store.
//!
//! The assembled store is chunked for ingestion (small on the time axis,
//! full spatial planes). Archival access wants the opposite, so the store
//! is copied into a destination store under a new chunk plan. Variables
//! whose destination chunks can be assembled within the memory budget are
//! copied directly; the rest are staged through a temporary store with an
//! intermediate chunking so that no copy step ever needs more than the
//! budget at once.

use std::collections::BTreeMap;
use std::num::NonZeroU64;
use std::path::Path;
use std::sync::Arc;

use rayon::iter::{IntoParallelIterator, ParallelIterator};
use rayon_iter_concurrent_limit::iter_concurrent_limit;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};
use zarrs::array::chunk_grid::{RegularChunkGrid, RegularChunkGridCreateError};
use zarrs::array::{
    Array, ArrayBuilder, ArrayBytes, ArrayCreateError, ArrayError, ArrayIndicesTinyVec,
    ArraySubset, DataTypeSize, DimensionName,
};
use zarrs::filesystem::{FilesystemStore, FilesystemStoreCreateError};
use zarrs::hierarchy::{Node, NodeCreateError, NodeMetadata, NodePath};
use zarrs::node::get_child_nodes;
use zarrs::storage::{Bytes, StorageError, StoreKey, StoreKeyError};

/// Requested chunk sizes by dimension name.
///
/// The effective chunk size of a dimension is `min(requested, dim_len)`;
/// dimensions absent from the plan (or unnamed) keep the full dimension
/// length.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChunkPlan(BTreeMap<String, u64>);

impl ChunkPlan {
    /// Create a plan from requested sizes by dimension name.
    #[must_use]
    pub fn new(requested: BTreeMap<String, u64>) -> Self {
        Self(requested)
    }

    /// The plan used by the COAWST archiving job: whole-week time chunks,
    /// 168 x 224 spatial tiles, single vertical layers.
    #[must_use]
    pub fn coawst() -> Self {
        let mut plan = BTreeMap::new();
        plan.insert("ocean_time".to_string(), 168);
        for eta in ["eta_rho", "eta_u", "eta_v", "eta_psi"] {
            plan.insert(eta.to_string(), 168);
        }
        for xi in ["xi_rho", "xi_u", "xi_v", "xi_psi"] {
            plan.insert(xi.to_string(), 224);
        }
        for vertical in ["s_rho", "s_w", "Nbed"] {
            plan.insert(vertical.to_string(), 1);
        }
        Self(plan)
    }

    /// The requested size for `dim`, if any.
    #[must_use]
    pub fn requested(&self, dim: &str) -> Option<u64> {
        self.0.get(dim).copied()
    }

    /// The effective chunk shape for an array with the given dimension
    /// names and shape.
    #[must_use]
    pub fn effective_for(
        &self,
        dimension_names: &Option<Vec<DimensionName>>,
        shape: &[u64],
    ) -> Vec<u64> {
        shape
            .iter()
            .enumerate()
            .map(|(axis, &len)| {
                let requested = dimension_names
                    .as_ref()
                    .and_then(|names| names.get(axis))
                    .and_then(|name| name.as_deref())
                    .and_then(|name| self.requested(name));
                match requested {
                    Some(requested) => requested.min(len).max(1),
                    None => len.max(1),
                }
            })
            .collect()
    }
}

impl FromIterator<(String, u64)> for ChunkPlan {
    fn from_iter<I: IntoIterator<Item = (String, u64)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Rechunking limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RechunkOptions {
    /// The memory budget in bytes for in-flight copy data.
    pub max_bytes: usize,
    /// How many times a failed copy step is retried before giving up.
    pub retries: usize,
}

impl Default for RechunkOptions {
    fn default() -> Self {
        Self {
            max_bytes: 2 * 1024 * 1024 * 1024,
            retries: 10,
        }
    }
}

/// A rechunking error.
#[derive(Debug, Error)]
pub enum RechunkError {
    /// A filesystem operation failed.
    #[error(transparent)]
    Io(#[from] std::io::Error),
    /// A store could not be opened.
    #[error(transparent)]
    StoreCreate(#[from] FilesystemStoreCreateError),
    /// A destination chunk grid could not be constructed.
    #[error(transparent)]
    ChunkGrid(#[from] RegularChunkGridCreateError),
    /// The store hierarchy could not be read.
    #[error(transparent)]
    Node(#[from] NodeCreateError),
    /// An array could not be opened or created.
    #[error(transparent)]
    ArrayCreate(#[from] ArrayCreateError),
    /// An array read or write failed.
    #[error(transparent)]
    Array(#[from] ArrayError),
    /// A store operation failed.
    #[error(transparent)]
    Storage(#[from] StorageError),
    /// An invalid store key was constructed.
    #[error(transparent)]
    StoreKey(#[from] StoreKeyError),
    /// Store metadata could not be parsed or serialised.
    #[error(transparent)]
    Json(#[from] serde_json::Error),
    /// The source store has no root group metadata.
    #[error("source store has no root zarr.json")]
    MissingRootMetadata,
    /// An array has a variable-sized data type, which the copier cannot
    /// budget for.
    #[error("array {path} has a variable-sized data type")]
    UnsupportedDataType {
        /// The array path.
        path: String,
    },
    /// A single chunk cannot be copied within the memory budget.
    #[error("array {path} needs {required} bytes for one chunk, budget is {budget}")]
    BudgetTooSmall {
        /// The array path.
        path: String,
        /// Bytes needed for the smallest possible copy step.
        required: u64,
        /// The configured budget.
        budget: usize,
    },
}

/// Rechunk the store at `source` into `dest` under `plan`.
///
/// Pre-existing `dest` and `temp` directories are deleted first, so a
/// restarted run starts clean. On success the destination's metadata is
/// consolidated into its root `zarr.json`. The temporary store is deleted
/// whether or not the copy succeeds; on failure the destination is deleted
/// too, so `dest` is only ever absent or fully valid.
///
/// # Errors
/// Returns a [`RechunkError`] if any copy step fails after retries, a
/// single chunk cannot fit the budget, or a store operation fails.
pub fn rechunk(
    source: &Path,
    dest: &Path,
    temp: &Path,
    plan: &ChunkPlan,
    options: &RechunkOptions,
) -> Result<(), RechunkError> {
    remove_if_exists(dest)?;
    remove_if_exists(temp)?;

    let result = rechunk_inner(source, dest, temp, plan, options);
    let cleanup = remove_if_exists(temp);
    if result.is_err() {
        // dest must be absent or fully valid
        let _ = remove_if_exists(dest);
    }
    result?;
    cleanup?;
    Ok(())
}

fn collect_array_paths(nodes: &[Node], arrays: &mut Vec<String>) {
    for node in nodes {
        if matches!(node.metadata(), NodeMetadata::Array(_)) {
            arrays.push(node.path().as_str().to_string());
        }
        collect_array_paths(node.children(), arrays);
    }
}

fn remove_if_exists(path: &Path) -> std::io::Result<()> {
    match std::fs::remove_dir_all(path) {
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

fn rechunk_inner(
    source: &Path,
    dest: &Path,
    temp: &Path,
    plan: &ChunkPlan,
    options: &RechunkOptions,
) -> Result<(), RechunkError> {
    let src_store = Arc::new(FilesystemStore::new(source)?);
    let dst_store = Arc::new(FilesystemStore::new(dest)?);

    copy_root_metadata(&src_store, &dst_store)?;

    let nodes = get_child_nodes(&src_store, &NodePath::root(), true)?;
    let mut arrays: Vec<String> = Vec::new();
    collect_array_paths(&nodes, &mut arrays);

    for path in &arrays {
        rechunk_array(&src_store, &dst_store, temp, path, plan, options)?;
    }

    consolidate_metadata(&dst_store)?;
    info!(source = %source.display(), dest = %dest.display(), "rechunk complete");
    Ok(())
}

fn rechunk_array(
    src_store: &Arc<FilesystemStore>,
    dst_store: &Arc<FilesystemStore>,
    temp: &Path,
    path: &str,
    plan: &ChunkPlan,
    options: &RechunkOptions,
) -> Result<(), RechunkError> {
    let array_in = Array::open(src_store.clone(), path)?;
    let shape = array_in.shape().to_vec();
    let ndim = shape.len();

    let element_size = match array_in.data_type().size() {
        DataTypeSize::Fixed(size) => size as u64,
        DataTypeSize::Variable => {
            return Err(RechunkError::UnsupportedDataType {
                path: path.to_string(),
            });
        }
    };

    let dst_chunks = plan.effective_for(array_in.dimension_names(), &shape);
    let array_out = build_like(&array_in, &shape, &dst_chunks, dst_store, path)?;
    array_out.store_metadata()?;

    if shape.contains(&0) || ndim == 0 {
        // scalar or empty arrays have nothing to copy beyond metadata
        if ndim == 0 {
            let bytes: ArrayBytes<'static> = array_in.retrieve_array_subset(&array_in.subset_all())?;
            array_out.store_array_subset(&array_out.subset_all(), bytes)?;
        }
        return Ok(());
    }

    let src_chunks = to_u64(&array_in.chunk_shape(&vec![0; ndim])?);
    let dst_chunk_bytes = dst_chunks.iter().product::<u64>() * element_size;
    let covering_bytes = covering_read_bytes(&shape, &src_chunks, &dst_chunks) * element_size;

    if dst_chunk_bytes > options.max_bytes as u64 {
        return Err(RechunkError::BudgetTooSmall {
            path: path.to_string(),
            required: dst_chunk_bytes,
            budget: options.max_bytes,
        });
    }

    if covering_bytes <= options.max_bytes as u64 {
        debug!(path, ?dst_chunks, "direct copy");
        let limit = concurrency_limit(options.max_bytes as u64, covering_bytes);
        copy_chunks(&array_in, &array_out, limit, options.retries)?;
    } else {
        debug!(path, ?dst_chunks, "staged copy");
        staged_copy(
            &array_in,
            &array_out,
            temp,
            path,
            &shape,
            &src_chunks,
            &dst_chunks,
            element_size,
            options,
        )?;
    }
    Ok(())
}

/// Copy through a temporary store under the elementwise
/// `min(source_chunk, dest_chunk)` chunking. The first stage reads one
/// source chunk at a time sequentially, so partial intermediate chunks are
/// never written concurrently; the second stage assembles destination
/// chunks from the intermediate store in parallel.
#[allow(clippy::too_many_arguments)]
fn staged_copy(
    array_in: &Array<FilesystemStore>,
    array_out: &Array<FilesystemStore>,
    temp: &Path,
    path: &str,
    shape: &[u64],
    src_chunks: &[u64],
    dst_chunks: &[u64],
    element_size: u64,
    options: &RechunkOptions,
) -> Result<(), RechunkError> {
    let src_chunk_bytes = src_chunks.iter().product::<u64>() * element_size;
    if src_chunk_bytes > options.max_bytes as u64 {
        return Err(RechunkError::BudgetTooSmall {
            path: path.to_string(),
            required: src_chunk_bytes,
            budget: options.max_bytes,
        });
    }

    let mid_chunks: Vec<u64> = src_chunks
        .iter()
        .zip(dst_chunks)
        .map(|(&s, &d)| s.min(d))
        .collect();

    let temp_store = Arc::new(FilesystemStore::new(temp)?);
    let array_mid = build_like(array_in, shape, &mid_chunks, &temp_store, path)?;
    array_mid.store_metadata()?;

    // stage one: source chunks into the intermediate store, sequentially
    let src_grid = ArraySubset::new_with_shape(array_in.chunk_grid_shape().to_vec());
    for chunk_indices in &src_grid.indices() {
        let subset = array_in.chunk_subset_bounded(&chunk_indices)?;
        with_retries(options.retries, || {
            let bytes: ArrayBytes<'static> = array_in.retrieve_array_subset(&subset)?;
            array_mid.store_array_subset(&subset, bytes)
        })?;
    }

    // stage two: destination chunks from the intermediate store
    let dst_chunk_bytes = dst_chunks.iter().product::<u64>() * element_size;
    let limit = concurrency_limit(options.max_bytes as u64, dst_chunk_bytes);
    copy_chunks(&array_mid, array_out, limit, options.retries)?;
    Ok(())
}

/// Copy every destination chunk from `array_in`, at most `limit` chunks in
/// flight.
fn copy_chunks(
    array_in: &Array<FilesystemStore>,
    array_out: &Array<FilesystemStore>,
    limit: usize,
    retries: usize,
) -> Result<(), RechunkError> {
    let chunk_grid = ArraySubset::new_with_shape(array_out.chunk_grid_shape().to_vec());
    let copy_chunk = |chunk_indices: ArrayIndicesTinyVec| {
        let subset = array_out.chunk_subset_bounded(&chunk_indices)?;
        with_retries(retries, || {
            let bytes: ArrayBytes<'static> = array_in.retrieve_array_subset(&subset)?;
            array_out.store_array_subset(&subset, bytes)
        })
    };
    let indices = chunk_grid.indices();
    iter_concurrent_limit!(limit, indices, try_for_each, copy_chunk)?;
    Ok(())
}

fn with_retries(
    retries: usize,
    mut step: impl FnMut() -> Result<(), ArrayError>,
) -> Result<(), ArrayError> {
    let mut attempt = 0;
    loop {
        match step() {
            Ok(()) => return Ok(()),
            Err(err) if attempt < retries => {
                attempt += 1;
                warn!(%err, attempt, "copy step failed, retrying");
            }
            Err(err) => return Err(err),
        }
    }
}

/// A new array at `path` with `chunks`, carrying over everything else from
/// `existing`.
fn build_like<TIn: ?Sized, TOut: ?Sized>(
    existing: &Array<TIn>,
    shape: &[u64],
    chunks: &[u64],
    store: &Arc<TOut>,
    path: &str,
) -> Result<Array<TOut>, RechunkError> {
    let chunk_shape: Vec<NonZeroU64> = chunks
        .iter()
        .map(|&c| NonZeroU64::new(c.max(1)))
        .collect::<Option<Vec<_>>>()
        .unwrap_or_default();
    let grid = RegularChunkGrid::new(shape.to_vec(), chunk_shape)?;
    let mut builder = ArrayBuilder::from_array(existing);
    builder.chunk_grid(grid);
    Ok(builder.build(store.clone(), path)?)
}

/// The worst-case number of elements read to assemble one destination
/// chunk from source chunks, accounting for chunk boundary overhang.
fn covering_read_bytes(shape: &[u64], src_chunks: &[u64], dst_chunks: &[u64]) -> u64 {
    shape
        .iter()
        .zip(src_chunks.iter().zip(dst_chunks))
        .map(|(&len, (&s, &d))| {
            let spanning = d.div_ceil(s) + u64::from(d % s != 0);
            (spanning * s).min(len.max(1))
        })
        .product()
}

fn concurrency_limit(budget: u64, step_bytes: u64) -> usize {
    usize::try_from(budget / step_bytes.max(1)).unwrap_or(usize::MAX).max(1)
}

fn to_u64(chunk_shape: &[NonZeroU64]) -> Vec<u64> {
    chunk_shape.iter().map(|c| c.get()).collect()
}

fn copy_root_metadata(
    src_store: &Arc<FilesystemStore>,
    dst_store: &Arc<FilesystemStore>,
) -> Result<(), RechunkError> {
    use zarrs::storage::{ReadableStorageTraits, WritableStorageTraits};
    let key = StoreKey::new("zarr.json")?;
    let metadata = src_store
        .get(&key)?
        .ok_or(RechunkError::MissingRootMetadata)?;
    dst_store.set(&key, metadata)?;
    Ok(())
}

/// Inline every node's metadata into the root `zarr.json` so readers can
/// open the store with a single fetch.
fn consolidate_metadata(store: &Arc<FilesystemStore>) -> Result<(), RechunkError> {
    use zarrs::storage::{ListableStorageTraits, ReadableStorageTraits, WritableStorageTraits};

    let root_key = StoreKey::new("zarr.json")?;
    let root_bytes = store
        .get(&root_key)?
        .ok_or(RechunkError::MissingRootMetadata)?;
    let mut root: serde_json::Value = serde_json::from_slice(&root_bytes)?;

    let mut metadata = serde_json::Map::new();
    for key in store.list()? {
        if key == root_key {
            continue;
        }
        let Some(node_path) = key.as_str().strip_suffix("/zarr.json") else {
            continue;
        };
        let Some(bytes) = store.get(&key)? else {
            continue;
        };
        metadata.insert(node_path.to_string(), serde_json::from_slice(&bytes)?);
    }

    root["consolidated_metadata"] = serde_json::json!({
        "kind": "inline",
        "must_understand": false,
        "metadata": metadata,
    });
    store.set(&root_key, Bytes::from(serde_json::to_vec_pretty(&root)?))?;
    Ok(())
}
