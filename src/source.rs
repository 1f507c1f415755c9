//! Opening source forecast files.

use std::path::{Path, PathBuf};

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use thiserror::Error;

use crate::dataset::Dataset;

/// A source file failure.
#[derive(Debug, Error)]
pub enum SourceError {
    /// The file could not be opened.
    #[error("failed to open source {path}: {message}")]
    Open {
        /// The source path.
        path: PathBuf,
        /// The underlying reason.
        message: String,
    },
    /// The file opened but its contents could not be decoded.
    #[error("failed to decode source {path}: {message}")]
    Decode {
        /// The source path.
        path: PathBuf,
        /// The underlying reason.
        message: String,
    },
    /// The file has no usable time coordinate variable.
    #[error("source {path} has no time coordinate")]
    MissingTimeCoordinate {
        /// The source path.
        path: PathBuf,
    },
}

/// Opens a source path as an in-memory [`Dataset`].
///
/// The production implementation is [`NetcdfOpener`]; tests substitute
/// in-memory openers.
pub trait SourceOpener {
    /// Open the source at `path`.
    ///
    /// # Errors
    /// Returns a [`SourceError`] if the source cannot be opened or decoded.
    fn open(&self, path: &Path) -> Result<Dataset, SourceError>;
}

/// A parsed CF-style time unit, e.g. `"seconds since 1858-11-17 00:00:00"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CfTimeUnits {
    /// Seconds per unit step.
    pub unit_seconds: i64,
    /// The reference instant the offsets count from.
    pub epoch: DateTime<Utc>,
}

impl CfTimeUnits {
    /// Parse a `"<unit> since <datetime>"` units string.
    ///
    /// Recognises `seconds`, `minutes`, `hours` and `days`, and reference
    /// datetimes of the form `YYYY-MM-DD` or `YYYY-MM-DD HH:MM:SS` with an
    /// optional fractional part and `T` separator.
    #[must_use]
    pub fn parse(units: &str) -> Option<Self> {
        let (unit, reference) = units.split_once(" since ")?;
        let unit_seconds = match unit.trim() {
            "seconds" | "second" => 1,
            "minutes" | "minute" => 60,
            "hours" | "hour" => 3600,
            "days" | "day" => 86400,
            _ => return None,
        };
        let reference = reference.trim().trim_end_matches(" UTC");
        let naive = parse_reference(reference)?;
        Some(Self {
            unit_seconds,
            epoch: naive.and_utc(),
        })
    }

    /// Convert a raw offset in these units to seconds since the Unix epoch.
    #[must_use]
    pub fn to_epoch_seconds(&self, offset: f64) -> i64 {
        self.epoch.timestamp() + (offset * self.unit_seconds as f64).round() as i64
    }
}

fn parse_reference(reference: &str) -> Option<NaiveDateTime> {
    const FORMATS: [&str; 4] = [
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%dT%H:%M:%S%.f",
        "%Y-%m-%d %H:%M",
        "%Y-%m-%dT%H:%M",
    ];
    for format in FORMATS {
        if let Ok(t) = NaiveDateTime::parse_from_str(reference, format) {
            return Some(t);
        }
    }
    NaiveDate::parse_from_str(reference, "%Y-%m-%d")
        .ok()
        .and_then(|d| d.and_hms_opt(0, 0, 0))
}

#[cfg(feature = "netcdf")]
pub use netcdf_opener::NetcdfOpener;

#[cfg(feature = "netcdf")]
mod netcdf_opener {
    use std::collections::BTreeMap;
    use std::path::Path;

    use ndarray::ArrayD;
    use netcdf::types::{FloatType, IntType, NcVariableType};

    use super::{CfTimeUnits, SourceError, SourceOpener};
    use crate::dataset::{Dataset, Values, Variable};

    /// Reads NetCDF sources, converting the time coordinate to epoch
    /// seconds.
    ///
    /// The time coordinate variable (named after the time dimension) is
    /// decoded through its CF `units` attribute and stored as `int64`
    /// seconds since the Unix epoch. Variables with data types outside the
    /// COAWST set (`f32`/`f64`/`i32`/`i64`) are decode errors.
    #[derive(Debug, Clone)]
    pub struct NetcdfOpener {
        time_dim: String,
    }

    impl NetcdfOpener {
        /// Create an opener that treats `time_dim` as the time coordinate.
        #[must_use]
        pub fn new(time_dim: impl Into<String>) -> Self {
            Self {
                time_dim: time_dim.into(),
            }
        }
    }

    impl SourceOpener for NetcdfOpener {
        fn open(&self, path: &Path) -> Result<Dataset, SourceError> {
            let file = netcdf::open(path).map_err(|err| SourceError::Open {
                path: path.to_path_buf(),
                message: err.to_string(),
            })?;
            let decode_err = |message: String| SourceError::Decode {
                path: path.to_path_buf(),
                message,
            };

            let mut attributes = serde_json::Map::new();
            for attribute in file.attributes() {
                let value = attribute
                    .value()
                    .map_err(|err| decode_err(err.to_string()))?;
                if let Some(value) = attribute_to_json(&value) {
                    attributes.insert(attribute.name().to_string(), value);
                }
            }

            let mut variables = BTreeMap::new();
            for variable in file.variables() {
                let name = variable.name().to_string();
                let dims: Vec<String> = variable
                    .dimensions()
                    .iter()
                    .map(|dim| dim.name().to_string())
                    .collect();
                let shape: Vec<usize> =
                    variable.dimensions().iter().map(netcdf::Dimension::len).collect();

                let mut var_attributes = serde_json::Map::new();
                for attribute in variable.attributes() {
                    let value = attribute
                        .value()
                        .map_err(|err| decode_err(err.to_string()))?;
                    if let Some(value) = attribute_to_json(&value) {
                        var_attributes.insert(attribute.name().to_string(), value);
                    }
                }

                let values = if name == self.time_dim {
                    decode_time(&variable, &shape, &mut var_attributes)
                        .map_err(decode_err)?
                } else {
                    read_values(&variable, &shape).map_err(decode_err)?
                };

                variables.insert(
                    name,
                    Variable {
                        dims,
                        attributes: var_attributes,
                        values,
                    },
                );
            }

            Ok(Dataset {
                attributes,
                variables,
            })
        }
    }

    fn read_values(
        variable: &netcdf::Variable<'_>,
        shape: &[usize],
    ) -> Result<Values, String> {
        fn array<T: netcdf::NcTypeDescriptor + Copy>(
            variable: &netcdf::Variable<'_>,
            shape: &[usize],
        ) -> Result<ArrayD<T>, String> {
            let data = variable
                .get_values::<T, _>(..)
                .map_err(|err| err.to_string())?;
            ArrayD::from_shape_vec(shape.to_vec(), data).map_err(|err| err.to_string())
        }

        match variable.vartype() {
            NcVariableType::Float(FloatType::F32) => {
                Ok(Values::Float32(array::<f32>(variable, shape)?))
            }
            NcVariableType::Float(FloatType::F64) => {
                Ok(Values::Float64(array::<f64>(variable, shape)?))
            }
            NcVariableType::Int(IntType::I32) => {
                Ok(Values::Int32(array::<i32>(variable, shape)?))
            }
            NcVariableType::Int(IntType::I64) => {
                Ok(Values::Int64(array::<i64>(variable, shape)?))
            }
            other => Err(format!(
                "variable {} has unsupported data type {other:?}",
                variable.name()
            )),
        }
    }

    fn decode_time(
        variable: &netcdf::Variable<'_>,
        shape: &[usize],
        attributes: &mut serde_json::Map<String, serde_json::Value>,
    ) -> Result<Values, String> {
        let units = attributes
            .get("units")
            .and_then(serde_json::Value::as_str)
            .ok_or_else(|| format!("time variable {} has no units", variable.name()))?;
        let cf = CfTimeUnits::parse(units)
            .ok_or_else(|| format!("unrecognised time units {units:?}"))?;
        let offsets = variable
            .get_values::<f64, _>(..)
            .map_err(|err| err.to_string())?;
        let seconds: Vec<i64> = offsets.iter().map(|&o| cf.to_epoch_seconds(o)).collect();
        attributes.insert(
            "units".to_string(),
            "seconds since 1970-01-01 00:00:00".into(),
        );
        ArrayD::from_shape_vec(shape.to_vec(), seconds)
            .map(Values::Int64)
            .map_err(|err| err.to_string())
    }

    fn attribute_to_json(value: &netcdf::AttributeValue) -> Option<serde_json::Value> {
        use netcdf::AttributeValue as A;
        use serde_json::Value;
        match value {
            A::Str(s) => Some(Value::from(s.clone())),
            A::Strs(s) => Some(Value::from(s.clone())),
            A::Uchar(v) => Some(Value::from(*v)),
            A::Schar(v) => Some(Value::from(*v)),
            A::Ushort(v) => Some(Value::from(*v)),
            A::Short(v) => Some(Value::from(*v)),
            A::Uint(v) => Some(Value::from(*v)),
            A::Int(v) => Some(Value::from(*v)),
            A::Ulonglong(v) => Some(Value::from(*v)),
            A::Longlong(v) => Some(Value::from(*v)),
            A::Float(v) => Some(Value::from(*v)),
            A::Double(v) => Some(Value::from(*v)),
            A::Ints(v) => Some(Value::from(v.clone())),
            A::Floats(v) => Some(Value::from(v.clone())),
            A::Doubles(v) => Some(Value::from(v.clone())),
            _ => None,
        }
    }
}
