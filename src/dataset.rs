//! In-memory representation of one source unit (one forecast file).

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use ndarray::{ArrayD, Axis, Slice};
use zarrs::array::{
    Array, ArrayError, ArraySubset, DataType,
    builder::ArrayBuilderFillValue,
    data_type::{float32, float64, int32, int64},
};
use zarrs::storage::ReadableWritableStorageTraits;

/// Variable data, one arm per data type COAWST output uses.
#[derive(Debug, Clone, PartialEq)]
pub enum Values {
    /// 32-bit floats.
    Float32(ArrayD<f32>),
    /// 64-bit floats.
    Float64(ArrayD<f64>),
    /// 32-bit signed integers.
    Int32(ArrayD<i32>),
    /// 64-bit signed integers.
    Int64(ArrayD<i64>),
}

impl Values {
    /// The shape of the underlying array.
    #[must_use]
    pub fn shape(&self) -> &[usize] {
        match self {
            Values::Float32(a) => a.shape(),
            Values::Float64(a) => a.shape(),
            Values::Int32(a) => a.shape(),
            Values::Int64(a) => a.shape(),
        }
    }

    /// The number of dimensions.
    #[must_use]
    pub fn ndim(&self) -> usize {
        self.shape().len()
    }

    /// The corresponding Zarr data type.
    #[must_use]
    pub fn data_type(&self) -> DataType {
        match self {
            Values::Float32(_) => float32(),
            Values::Float64(_) => float64(),
            Values::Int32(_) => int32(),
            Values::Int64(_) => int64(),
        }
    }

    /// The fill value marking unwritten elements: NaN for floats, 0 for
    /// integers.
    #[must_use]
    pub fn fill_value(&self) -> ArrayBuilderFillValue {
        match self {
            Values::Float32(_) => f32::NAN.into(),
            Values::Float64(_) => f64::NAN.into(),
            Values::Int32(_) => 0i32.into(),
            Values::Int64(_) => 0i64.into(),
        }
    }

    /// The trailing `n` elements along `axis` (all of them if the axis is
    /// shorter than `n`).
    #[must_use]
    pub fn tail(&self, axis: usize, n: usize) -> Values {
        let len = self.shape()[axis];
        let from = isize::try_from(len.saturating_sub(n)).unwrap_or(isize::MAX);
        let slice = Slice::from(from..);
        match self {
            Values::Float32(a) => {
                Values::Float32(a.slice_axis(Axis(axis), slice).to_owned())
            }
            Values::Float64(a) => {
                Values::Float64(a.slice_axis(Axis(axis), slice).to_owned())
            }
            Values::Int32(a) => Values::Int32(a.slice_axis(Axis(axis), slice).to_owned()),
            Values::Int64(a) => Values::Int64(a.slice_axis(Axis(axis), slice).to_owned()),
        }
    }

    /// Write the values into `array` with the element at `start`.
    ///
    /// # Errors
    /// Returns an [`ArrayError`] if the subset is incompatible with the
    /// array or the write fails.
    pub fn store_at<TStorage: ?Sized + ReadableWritableStorageTraits + 'static>(
        &self,
        array: &Array<TStorage>,
        start: &[u64],
    ) -> Result<(), ArrayError> {
        let shape: Vec<u64> = self.shape().iter().map(|&s| s as u64).collect();
        let subset = ArraySubset::new_with_start_shape(start.to_vec(), shape)
            .map_err(ArrayError::from)?;
        match self {
            Values::Float32(a) => array.store_array_subset(&subset, a.clone()),
            Values::Float64(a) => array.store_array_subset(&subset, a.clone()),
            Values::Int32(a) => array.store_array_subset(&subset, a.clone()),
            Values::Int64(a) => array.store_array_subset(&subset, a.clone()),
        }
    }
}

/// A named array with dimension names and attributes.
#[derive(Debug, Clone, PartialEq)]
pub struct Variable {
    /// Dimension names, one per axis of `values`.
    pub dims: Vec<String>,
    /// Variable attributes.
    pub attributes: serde_json::Map<String, serde_json::Value>,
    /// The data.
    pub values: Values,
}

impl Variable {
    /// The axis carrying `dim`, if any.
    #[must_use]
    pub fn axis_of(&self, dim: &str) -> Option<usize> {
        self.dims.iter().position(|d| d == dim)
    }
}

/// One source unit: global attributes plus named variables.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Dataset {
    /// Global attributes.
    pub attributes: serde_json::Map<String, serde_json::Value>,
    /// Variables by name.
    pub variables: BTreeMap<String, Variable>,
}

impl Dataset {
    /// Variables that carry the time dimension.
    pub fn time_varying<'a>(
        &'a self,
        time_dim: &'a str,
    ) -> impl Iterator<Item = (&'a String, &'a Variable)> {
        self.variables
            .iter()
            .filter(move |(_, v)| v.axis_of(time_dim).is_some())
    }

    /// Variables that do not carry the time dimension, e.g. grid geometry.
    pub fn statics<'a>(
        &'a self,
        time_dim: &'a str,
    ) -> impl Iterator<Item = (&'a String, &'a Variable)> {
        self.variables
            .iter()
            .filter(move |(_, v)| v.axis_of(time_dim).is_none())
    }

    /// Restrict every time-varying variable to its trailing `n` time steps.
    ///
    /// Static variables are unchanged. Each forecast file carries spin-up
    /// steps that overlap the previous run; only the trailing steps are new.
    #[must_use]
    pub fn tail(&self, time_dim: &str, n: usize) -> Dataset {
        let variables = self
            .variables
            .iter()
            .map(|(name, var)| {
                let var = match var.axis_of(time_dim) {
                    Some(axis) => Variable {
                        dims: var.dims.clone(),
                        attributes: var.attributes.clone(),
                        values: var.values.tail(axis, n),
                    },
                    None => var.clone(),
                };
                (name.clone(), var)
            })
            .collect();
        Dataset {
            attributes: self.attributes.clone(),
            variables,
        }
    }

    /// The time coordinate values as epoch seconds, if present.
    ///
    /// The time coordinate is the 1-D `int64` variable named after the time
    /// dimension.
    #[must_use]
    pub fn time_values(&self, time_dim: &str) -> Option<&ArrayD<i64>> {
        let var = self.variables.get(time_dim)?;
        if var.dims.len() != 1 || var.dims[0] != time_dim {
            return None;
        }
        match &var.values {
            Values::Int64(a) => Some(a),
            _ => None,
        }
    }

    /// The first timestamp of the time coordinate, if present.
    #[must_use]
    pub fn first_timestamp(&self, time_dim: &str) -> Option<DateTime<Utc>> {
        let seconds = *self.time_values(time_dim)?.first()?;
        DateTime::from_timestamp(seconds, 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::ArrayD;

    fn dataset() -> Dataset {
        let mut variables = BTreeMap::new();
        variables.insert(
            "ocean_time".to_string(),
            Variable {
                dims: vec!["ocean_time".to_string()],
                attributes: serde_json::Map::new(),
                values: Values::Int64(
                    ArrayD::from_shape_vec(vec![4], vec![0, 3600, 7200, 10800]).unwrap(),
                ),
            },
        );
        variables.insert(
            "zeta".to_string(),
            Variable {
                dims: vec!["ocean_time".to_string(), "eta_rho".to_string()],
                attributes: serde_json::Map::new(),
                values: Values::Float64(
                    ArrayD::from_shape_vec(vec![4, 3], (0..12).map(f64::from).collect()).unwrap(),
                ),
            },
        );
        variables.insert(
            "h".to_string(),
            Variable {
                dims: vec!["eta_rho".to_string()],
                attributes: serde_json::Map::new(),
                values: Values::Float32(
                    ArrayD::from_shape_vec(vec![3], vec![5.0, 10.0, 20.0]).unwrap(),
                ),
            },
        );
        Dataset {
            attributes: serde_json::Map::new(),
            variables,
        }
    }

    #[test]
    fn partitions_by_time_dimension() {
        let ds = dataset();
        let time_varying: Vec<_> = ds.time_varying("ocean_time").map(|(n, _)| n.clone()).collect();
        let statics: Vec<_> = ds.statics("ocean_time").map(|(n, _)| n.clone()).collect();
        assert_eq!(time_varying, ["ocean_time", "zeta"]);
        assert_eq!(statics, ["h"]);
    }

    #[test]
    fn tail_selects_trailing_steps() {
        let ds = dataset().tail("ocean_time", 2);
        assert_eq!(ds.variables["zeta"].values.shape(), [2, 3]);
        assert_eq!(
            ds.time_values("ocean_time").unwrap().as_slice().unwrap(),
            [7200, 10800]
        );
        // statics untouched
        assert_eq!(ds.variables["h"].values.shape(), [3]);
    }

    #[test]
    fn tail_shorter_than_axis_keeps_everything() {
        let ds = dataset().tail("ocean_time", 10);
        assert_eq!(ds.variables["zeta"].values.shape(), [4, 3]);
    }

    #[test]
    fn first_timestamp_reads_the_time_coordinate() {
        let ds = dataset();
        assert_eq!(
            ds.first_timestamp("ocean_time"),
            DateTime::from_timestamp(0, 0)
        );
        assert_eq!(ds.first_timestamp("missing"), None);
    }
}
