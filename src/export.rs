//! NetCDF-4 export of a rechunked store.

use std::path::{Path, PathBuf};

use thiserror::Error;

/// An export error.
#[derive(Debug, Error)]
pub enum ExportError {
    /// The store path does not follow the `rechunk_<date>_<index>.zarr`
    /// naming scheme.
    #[error("store name {0} does not match rechunk_<date>_<index>.zarr")]
    BadStoreName(PathBuf),
    /// The store hierarchy could not be read.
    #[cfg(feature = "netcdf")]
    #[error(transparent)]
    Node(#[from] zarrs::hierarchy::NodeCreateError),
    /// A store could not be opened.
    #[cfg(feature = "netcdf")]
    #[error(transparent)]
    StoreCreate(#[from] zarrs::filesystem::FilesystemStoreCreateError),
    /// An array could not be opened.
    #[cfg(feature = "netcdf")]
    #[error(transparent)]
    ArrayCreate(#[from] zarrs::array::ArrayCreateError),
    /// An array read failed.
    #[cfg(feature = "netcdf")]
    #[error(transparent)]
    Array(#[from] zarrs::array::ArrayError),
    /// The NetCDF library reported an error.
    #[cfg(feature = "netcdf")]
    #[error(transparent)]
    Netcdf(#[from] netcdf::Error),
    /// An array lacks the dimension names the NetCDF data model requires.
    #[cfg(feature = "netcdf")]
    #[error("array {path} has unnamed dimensions")]
    UnnamedDimensions {
        /// The array path.
        path: String,
    },
    /// Two arrays disagree on the length of a shared dimension.
    #[cfg(feature = "netcdf")]
    #[error("dimension {name} has conflicting lengths {first} and {second}")]
    InconsistentDimension {
        /// The dimension name.
        name: String,
        /// The length seen first.
        first: u64,
        /// The conflicting length.
        second: u64,
    },
    /// An array has a data type the exporter does not handle.
    #[cfg(feature = "netcdf")]
    #[error("array {path} has unsupported data type {data_type}")]
    UnsupportedDataType {
        /// The array path.
        path: String,
        /// The data type name.
        data_type: String,
    },
}

/// Per-variable NetCDF-4 encoding.
///
/// Mirrors the store's chunking so a reader of the NetCDF file sees the
/// same access pattern the rechunker produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExportEncoding {
    /// zlib deflate level.
    pub deflate_level: i32,
    /// Whether the byte shuffle filter is applied before deflate.
    pub shuffle: bool,
    /// NetCDF chunk sizes, one per dimension.
    pub chunk_sizes: Vec<usize>,
}

/// The encoding for a variable with the given store chunk shape.
#[must_use]
pub fn export_encoding(chunk_shape: &[u64]) -> ExportEncoding {
    ExportEncoding {
        deflate_level: 5,
        shuffle: true,
        chunk_sizes: chunk_shape.iter().map(|&c| c as usize).collect(),
    }
}

/// Derive the export file path from a `rechunk_<date>_<index>.zarr` store
/// path, as `<nc_root>/coawst_<date>_<index>.nc`.
///
/// # Errors
/// Returns [`ExportError::BadStoreName`] if the store name does not follow
/// the scheme.
pub fn export_path(store_path: &Path, nc_root: &Path) -> Result<PathBuf, ExportError> {
    let bad = || ExportError::BadStoreName(store_path.to_path_buf());
    let stem = store_path
        .file_stem()
        .and_then(|s| s.to_str())
        .ok_or_else(bad)?;
    let rest = stem.strip_prefix("rechunk_").ok_or_else(bad)?;
    let (date, index) = rest.rsplit_once('_').ok_or_else(bad)?;
    if date.is_empty() || index.is_empty() {
        return Err(bad());
    }
    Ok(nc_root.join(format!("coawst_{date}_{index}.nc")))
}

#[cfg(feature = "netcdf")]
pub use writer::export_netcdf;

#[cfg(feature = "netcdf")]
mod writer {
    use std::collections::BTreeMap;
    use std::path::Path;
    use std::sync::Arc;

    use tracing::{debug, info};
    use zarrs::array::{Array, ArrayBytes, DimensionName};
    use zarrs::array_subset::ArraySubset;
    use zarrs::filesystem::FilesystemStore;
    use zarrs::hierarchy::{NodeMetadata, NodePath, get_all_nodes_of};
    use zarrs::plugin::ExtensionName;

    use super::{ExportError, export_encoding};

    /// Export the store at `store_path` as a single NetCDF-4 file.
    ///
    /// Dimensions come from the arrays' `dimension_names` and shapes; every
    /// array must have fully named dimensions and shared dimensions must
    /// agree on their length. Each variable is written with deflate level 5,
    /// shuffle, and NetCDF chunk sizes equal to its store chunk shape. Data
    /// is copied in whole-chunk stripes along the first axis.
    ///
    /// Any error leaves a partial file behind; the caller must treat the
    /// output as invalid unless this returns `Ok`.
    ///
    /// # Errors
    /// Returns an [`ExportError`] if the store cannot be read, its layout
    /// does not fit the NetCDF data model, or a write fails.
    pub fn export_netcdf(store_path: &Path, nc_path: &Path) -> Result<(), ExportError> {
        let store = Arc::new(FilesystemStore::new(store_path)?);
        let nodes = get_all_nodes_of(&store, &NodePath::root())?;

        let mut arrays = Vec::new();
        for node in &nodes {
            if matches!(node.metadata(), NodeMetadata::Array(_)) {
                arrays.push(Array::open(store.clone(), node.path().as_str())?);
            }
        }

        let dimensions = collect_dimensions(&arrays)?;

        let mut file = netcdf::create(nc_path)?;
        for (name, len) in &dimensions {
            file.add_dimension(name, *len as usize)?;
        }
        for (name, value) in root_attributes(&store) {
            put_json_attribute(&mut file, &name, &value)?;
        }

        for array in &arrays {
            write_variable(&mut file, array)?;
        }
        info!(store = %store_path.display(), nc = %nc_path.display(), "export complete");
        Ok(())
    }

    fn root_attributes(store: &Arc<FilesystemStore>) -> serde_json::Map<String, serde_json::Value> {
        use zarrs::storage::{ReadableStorageTraits, StoreKey};
        StoreKey::new("zarr.json")
            .ok()
            .and_then(|key| store.get(&key).ok().flatten())
            .and_then(|bytes| serde_json::from_slice::<serde_json::Value>(&bytes).ok())
            .and_then(|mut root| match root.get_mut("attributes") {
                Some(serde_json::Value::Object(attributes)) => Some(std::mem::take(attributes)),
                _ => None,
            })
            .unwrap_or_default()
    }

    fn collect_dimensions(
        arrays: &[Array<FilesystemStore>],
    ) -> Result<BTreeMap<String, u64>, ExportError> {
        let mut dimensions = BTreeMap::new();
        for array in arrays {
            let names = dimension_names(array)?;
            for (name, &len) in names.iter().zip(array.shape()) {
                match dimensions.get(name.as_str()) {
                    None => {
                        dimensions.insert(name.clone(), len);
                    }
                    Some(&first) if first != len => {
                        return Err(ExportError::InconsistentDimension {
                            name: name.clone(),
                            first,
                            second: len,
                        });
                    }
                    Some(_) => {}
                }
            }
        }
        Ok(dimensions)
    }

    fn dimension_names(array: &Array<FilesystemStore>) -> Result<Vec<String>, ExportError> {
        let unnamed = || ExportError::UnnamedDimensions {
            path: array.path().as_str().to_string(),
        };
        let names = array.dimension_names().as_ref().ok_or_else(unnamed)?;
        names
            .iter()
            .map(|name| {
                DimensionName::as_str(name)
                    .map(str::to_string)
                    .ok_or_else(unnamed)
            })
            .collect()
    }

    fn write_variable(
        file: &mut netcdf::FileMut,
        array: &Array<FilesystemStore>,
    ) -> Result<(), ExportError> {
        let name = array
            .path()
            .as_str()
            .trim_start_matches('/')
            .to_string();
        let dims = dimension_names(array)?;
        let dim_refs: Vec<&str> = dims.iter().map(String::as_str).collect();
        let ndim = array.shape().len();

        let chunk_shape = if ndim == 0 {
            Vec::new()
        } else {
            array
                .chunk_shape(&vec![0; ndim])?
                .iter()
                .map(|c| c.get())
                .collect()
        };
        let encoding = export_encoding(&chunk_shape);
        debug!(name, ?encoding, "writing variable");

        let data_type = array.data_type().name_v3();
        let data_type = data_type.as_deref().unwrap_or_default();
        let mut variable = match data_type {
            "float32" => file.add_variable::<f32>(&name, &dim_refs)?,
            "float64" => file.add_variable::<f64>(&name, &dim_refs)?,
            "int32" => file.add_variable::<i32>(&name, &dim_refs)?,
            "int64" => file.add_variable::<i64>(&name, &dim_refs)?,
            other => {
                return Err(ExportError::UnsupportedDataType {
                    path: array.path().as_str().to_string(),
                    data_type: other.to_string(),
                });
            }
        };
        if ndim > 0 {
            variable.set_compression(encoding.deflate_level, encoding.shuffle)?;
            variable.set_chunking(&encoding.chunk_sizes)?;
        }
        for (attr, value) in array.attributes() {
            put_variable_json_attribute(&mut variable, attr, value)?;
        }

        copy_stripes(array, &mut variable, data_type)?;
        Ok(())
    }

    /// Copy whole-chunk stripes along the first axis so at most one stripe
    /// is in memory.
    fn copy_stripes(
        array: &Array<FilesystemStore>,
        variable: &mut netcdf::VariableMut<'_>,
        data_type: &str,
    ) -> Result<(), ExportError> {
        let shape = array.shape().to_vec();
        if shape.contains(&0) {
            return Ok(());
        }
        if shape.is_empty() {
            return write_stripe(array, variable, &array.subset_all(), data_type);
        }

        let stripe_len = array.chunk_shape(&vec![0; shape.len()])?[0].get();
        let mut start = 0;
        while start < shape[0] {
            let end = (start + stripe_len).min(shape[0]);
            let mut ranges: Vec<std::ops::Range<u64>> =
                shape.iter().map(|&len| 0..len).collect();
            ranges[0] = start..end;
            let subset = ArraySubset::new_with_ranges(&ranges);
            write_stripe(array, variable, &subset, data_type)?;
            start = end;
        }
        Ok(())
    }

    fn write_stripe(
        array: &Array<FilesystemStore>,
        variable: &mut netcdf::VariableMut<'_>,
        subset: &ArraySubset,
        data_type: &str,
    ) -> Result<(), ExportError> {
        let extents: Vec<std::ops::Range<usize>> = subset
            .start()
            .iter()
            .zip(subset.shape())
            .map(|(&start, &len)| start as usize..(start + len) as usize)
            .collect();
        match data_type {
            "float32" => {
                let data = array.retrieve_array_subset_ndarray::<f32>(subset)?;
                variable.put(data.view(), extents.as_slice())?;
            }
            "float64" => {
                let data = array.retrieve_array_subset_ndarray::<f64>(subset)?;
                variable.put(data.view(), extents.as_slice())?;
            }
            "int32" => {
                let data = array.retrieve_array_subset_ndarray::<i32>(subset)?;
                variable.put(data.view(), extents.as_slice())?;
            }
            "int64" => {
                let data = array.retrieve_array_subset_ndarray::<i64>(subset)?;
                variable.put(data.view(), extents.as_slice())?;
            }
            other => {
                return Err(ExportError::UnsupportedDataType {
                    path: array.path().as_str().to_string(),
                    data_type: other.to_string(),
                });
            }
        }
        Ok(())
    }

    fn put_json_attribute(
        file: &mut netcdf::FileMut,
        name: &str,
        value: &serde_json::Value,
    ) -> Result<(), ExportError> {
        use serde_json::Value;
        match value {
            Value::String(s) => file.add_attribute(name, s.as_str())?,
            Value::Number(n) if n.is_i64() => {
                file.add_attribute(name, n.as_i64().unwrap_or_default())?
            }
            Value::Number(n) => file.add_attribute(name, n.as_f64().unwrap_or_default())?,
            Value::Bool(b) => file.add_attribute(name, i32::from(*b))?,
            // arrays, objects and nulls have no NetCDF attribute mapping
            _ => return Ok(()),
        };
        Ok(())
    }

    fn put_variable_json_attribute(
        variable: &mut netcdf::VariableMut<'_>,
        name: &str,
        value: &serde_json::Value,
    ) -> Result<(), ExportError> {
        use serde_json::Value;
        match value {
            Value::String(s) => variable.put_attribute(name, s.as_str())?,
            Value::Number(n) if n.is_i64() => {
                variable.put_attribute(name, n.as_i64().unwrap_or_default())?
            }
            Value::Number(n) => variable.put_attribute(name, n.as_f64().unwrap_or_default())?,
            Value::Bool(b) => variable.put_attribute(name, i32::from(*b))?,
            _ => return Ok(()),
        };
        Ok(())
    }
}
