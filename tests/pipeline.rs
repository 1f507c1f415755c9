//! End-to-end pipeline tests against in-memory and filesystem stores.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Duration, TimeZone, Utc};
use ndarray::ArrayD;
use zarrs::array::Array;
use zarrs::filesystem::FilesystemStore;
use zarrs::storage::store::MemoryStore;

use coawst_archive::dataset::{Dataset, Values, Variable};
use coawst_archive::grid::TimeGrid;
use coawst_archive::ingest::{IngestOutcome, SourceCandidate, ingest};
use coawst_archive::rechunk::{ChunkPlan, RechunkError, RechunkOptions, rechunk};
use coawst_archive::source::{SourceError, SourceOpener};
use coawst_archive::template::build_template;
use coawst_archive::varmap::VarMap;

const TIME_DIM: &str = "ocean_time";
const ETA: usize = 2;
const XI: usize = 3;

fn series_start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2023, 3, 6, 0, 0, 0).unwrap()
}

fn temp_value(hour: i64, e: usize, x: usize) -> f32 {
    (hour * 100) as f32 + (e * 10 + x) as f32
}

fn zeta_value(hour: i64, e: usize) -> f64 {
    (hour * 1000) as f64 + e as f64
}

/// A forecast dataset whose retained steps start at `start`. `spinup`
/// leading steps overlap the previous run, as in real forecast files.
fn forecast(start: DateTime<Utc>, steps: usize, spinup: usize) -> Dataset {
    let total = spinup + steps;
    let first = start - Duration::hours(spinup as i64);
    let hours: Vec<i64> = (0..total)
        .map(|i| (first + Duration::hours(i as i64) - series_start()).num_hours())
        .collect();

    let times: Vec<i64> = (0..total)
        .map(|i| (first + Duration::hours(i as i64)).timestamp())
        .collect();
    let temp: Vec<f32> = hours
        .iter()
        .flat_map(|&hour| {
            (0..ETA).flat_map(move |e| (0..XI).map(move |x| temp_value(hour, e, x)))
        })
        .collect();
    let zeta: Vec<f64> = hours
        .iter()
        .flat_map(|&hour| (0..ETA).map(move |e| zeta_value(hour, e)))
        .collect();

    let mut variables = BTreeMap::new();
    variables.insert(
        TIME_DIM.to_string(),
        Variable {
            dims: vec![TIME_DIM.to_string()],
            attributes: serde_json::Map::new(),
            values: Values::Int64(ArrayD::from_shape_vec(vec![total], times).unwrap()),
        },
    );
    let mut temp_attributes = serde_json::Map::new();
    temp_attributes.insert("units".to_string(), "Celsius".into());
    variables.insert(
        "temp".to_string(),
        Variable {
            dims: vec![TIME_DIM.to_string(), "eta_rho".to_string(), "xi_rho".to_string()],
            attributes: temp_attributes,
            values: Values::Float32(
                ArrayD::from_shape_vec(vec![total, ETA, XI], temp).unwrap(),
            ),
        },
    );
    variables.insert(
        "zeta".to_string(),
        Variable {
            dims: vec![TIME_DIM.to_string(), "eta_rho".to_string()],
            attributes: serde_json::Map::new(),
            values: Values::Float64(ArrayD::from_shape_vec(vec![total, ETA], zeta).unwrap()),
        },
    );
    variables.insert(
        "h".to_string(),
        Variable {
            dims: vec!["eta_rho".to_string()],
            attributes: serde_json::Map::new(),
            values: Values::Float32(
                ArrayD::from_shape_vec(vec![ETA], (0..ETA).map(|e| e as f32 * 2.0).collect())
                    .unwrap(),
            ),
        },
    );
    variables.insert(
        "lon_rho".to_string(),
        Variable {
            dims: vec!["eta_rho".to_string(), "xi_rho".to_string()],
            attributes: serde_json::Map::new(),
            values: Values::Float64(
                ArrayD::from_shape_vec(
                    vec![ETA, XI],
                    (0..ETA)
                        .flat_map(|e| (0..XI).map(move |x| e as f64 + x as f64 / 10.0))
                        .collect(),
                )
                .unwrap(),
            ),
        },
    );

    let mut attributes = serde_json::Map::new();
    attributes.insert("title".to_string(), "COAWST weekly archive".into());
    Dataset {
        attributes,
        variables,
    }
}

/// An opener over a fixed path-to-dataset map.
#[derive(Default)]
struct MapOpener {
    datasets: HashMap<PathBuf, Dataset>,
}

impl MapOpener {
    fn insert(&mut self, path: impl Into<PathBuf>, dataset: Dataset) {
        self.datasets.insert(path.into(), dataset);
    }
}

impl SourceOpener for MapOpener {
    fn open(&self, path: &Path) -> Result<Dataset, SourceError> {
        self.datasets
            .get(path)
            .cloned()
            .ok_or_else(|| SourceError::Open {
                path: path.to_path_buf(),
                message: "no such file".to_string(),
            })
    }
}

fn week_grid() -> TimeGrid {
    TimeGrid::new(series_start(), Duration::hours(1), 168).unwrap()
}

/// The 14 candidates of the week, every 12 hours.
fn week_candidates() -> Vec<SourceCandidate> {
    (0..14)
        .map(|slot| SourceCandidate {
            path: PathBuf::from(format!("run_{slot:02}.nc")),
            expected_start: series_start() + Duration::hours(12 * slot),
        })
        .collect()
}

/// An opener covering all 14 slots. Slot 6 is one hour late and slot 9 is
/// missing when `with_defects` is set.
fn week_opener(with_defects: bool) -> MapOpener {
    let mut opener = MapOpener::default();
    for (slot, candidate) in week_candidates().iter().enumerate() {
        if with_defects && slot == 9 {
            continue;
        }
        let start = if with_defects && slot == 6 {
            candidate.expected_start + Duration::hours(1)
        } else {
            candidate.expected_start
        };
        // the first run carries extra spin-up steps to exercise tailing
        let spinup = if slot == 0 { 2 } else { 0 };
        opener.insert(&candidate.path, forecast(start, 12, spinup));
    }
    opener
}

fn scaffold(store: &Arc<MemoryStore>, grid: &TimeGrid) {
    let reference = forecast(series_start(), 12, 0);
    build_template(store, &reference, grid, TIME_DIM, 12).unwrap();
}

fn read_f32(store: &Arc<MemoryStore>, path: &str) -> ArrayD<f32> {
    let array = Array::open(store.clone(), path).unwrap();
    array
        .retrieve_array_subset_ndarray::<f32>(&array.subset_all())
        .unwrap()
}

#[test]
fn template_declares_without_filling() {
    let store = Arc::new(MemoryStore::new());
    let grid = week_grid();
    scaffold(&store, &grid);

    let temp = Array::open(store.clone(), "/temp").unwrap();
    assert_eq!(temp.shape(), [168, ETA as u64, XI as u64]);
    assert_eq!(
        temp.chunk_shape(&[0, 0, 0])
            .unwrap()
            .iter()
            .map(|c| c.get())
            .collect::<Vec<_>>(),
        [12, ETA as u64, XI as u64]
    );
    assert_eq!(
        temp.dimension_names()
            .as_ref()
            .unwrap()
            .iter()
            .filter_map(|d| d.as_deref())
            .collect::<Vec<_>>(),
        [TIME_DIM, "eta_rho", "xi_rho"]
    );
    assert_eq!(temp.attributes()["units"], "Celsius");

    // no time-varying data yet, everything is at fill
    let data = read_f32(&store, "/temp");
    assert!(data.iter().all(|v| v.is_nan()));

    // statics are written eagerly
    let h = read_f32(&store, "/h");
    assert_eq!(h.as_slice().unwrap(), [0.0, 2.0]);

    // the time coordinate holds the whole grid
    let time = Array::open(store.clone(), &format!("/{TIME_DIM}")).unwrap();
    let seconds = time
        .retrieve_array_subset_ndarray::<i64>(&time.subset_all())
        .unwrap();
    assert_eq!(seconds.as_slice().unwrap(), grid.epoch_seconds());
    assert_eq!(
        time.attributes()["units"],
        "seconds since 1970-01-01 00:00:00"
    );
}

#[test]
fn week_assembly_with_late_and_missing_runs() {
    let store = Arc::new(MemoryStore::new());
    let grid = week_grid();
    scaffold(&store, &grid);

    let candidates = week_candidates();
    let opener = week_opener(true);
    let report = ingest(
        &store,
        &grid,
        &opener,
        &candidates,
        12,
        &VarMap::default(),
        TIME_DIM,
    )
    .unwrap();

    assert_eq!(report.written_ranges().len(), 12);
    assert_eq!(report.skipped(), 2);
    assert!(matches!(
        report.outcomes[6].1,
        IngestOutcome::SkippedMisaligned {
            actual: Some(actual),
            ..
        } if actual == series_start() + Duration::hours(73)
    ));
    assert!(matches!(
        report.outcomes[9].1,
        IngestOutcome::SkippedUnreadable { .. }
    ));

    let data = read_f32(&store, "/temp");
    for t in 0..168 {
        for e in 0..ETA {
            for x in 0..XI {
                let value = data[[t, e, x]];
                let slot = t / 12;
                if slot == 6 || slot == 9 {
                    assert!(value.is_nan(), "expected fill at t={t}");
                } else {
                    assert_eq!(value, temp_value(t as i64, e, x), "at t={t} e={e} x={x}");
                }
            }
        }
    }
}

#[test]
fn ingestion_is_idempotent_and_order_independent() {
    let grid = week_grid();
    let candidates = week_candidates();
    let opener = week_opener(false);

    let run = |candidates: &[SourceCandidate], repeats: usize| {
        let store = Arc::new(MemoryStore::new());
        scaffold(&store, &grid);
        for _ in 0..repeats {
            ingest(
                &store,
                &grid,
                &opener,
                candidates,
                12,
                &VarMap::default(),
                TIME_DIM,
            )
            .unwrap();
        }
        read_f32(&store, "/temp")
    };

    let once = run(&candidates, 1);
    let twice = run(&candidates, 2);
    let mut reversed_candidates = candidates.clone();
    reversed_candidates.reverse();
    let reversed = run(&reversed_candidates, 1);

    let bits = |data: &ArrayD<f32>| data.iter().map(|v| v.to_bits()).collect::<Vec<_>>();
    assert_eq!(bits(&once), bits(&twice));
    assert_eq!(bits(&once), bits(&reversed));
}

#[test]
fn varmap_applies_during_ingestion() {
    let grid = week_grid();

    // rename zeta on the way in; the destination array must exist under
    // the new name, so scaffold from a renamed reference
    let varmap = VarMap {
        rename: BTreeMap::from([("zeta".to_string(), "zeta2".to_string())]),
        drop: Default::default(),
    };
    let renamed_store = Arc::new(MemoryStore::new());
    let reference = varmap.apply(forecast(series_start(), 12, 0));
    build_template(&renamed_store, &reference, &grid, TIME_DIM, 12).unwrap();

    let candidates = week_candidates();
    let opener = week_opener(false);
    ingest(
        &renamed_store,
        &grid,
        &opener,
        &candidates,
        12,
        &varmap,
        TIME_DIM,
    )
    .unwrap();

    let zeta2 = Array::open(renamed_store.clone(), "/zeta2").unwrap();
    let data = zeta2
        .retrieve_array_subset_ndarray::<f64>(&zeta2.subset_all())
        .unwrap();
    assert_eq!(data[[100, 1]], zeta_value(100, 1));
}

/// Assemble a small filesystem-backed store for the rechunk tests.
fn assemble_fs_store(root: &Path) -> PathBuf {
    let path = root.join("dst_0.zarr");
    let store = Arc::new(FilesystemStore::new(&path).unwrap());
    let grid = TimeGrid::new(series_start(), Duration::hours(1), 24).unwrap();
    let reference = forecast(series_start(), 12, 0);
    build_template(&store, &reference, &grid, TIME_DIM, 3).unwrap();

    let candidates: Vec<SourceCandidate> = (0..2)
        .map(|slot| SourceCandidate {
            path: PathBuf::from(format!("run_{slot:02}.nc")),
            expected_start: series_start() + Duration::hours(12 * slot),
        })
        .collect();
    let mut opener = MapOpener::default();
    for candidate in &candidates {
        opener.insert(&candidate.path, forecast(candidate.expected_start, 12, 0));
    }
    ingest(&store, &grid, &opener, &candidates, 12, &VarMap::default(), TIME_DIM).unwrap();
    path
}

fn archive_plan() -> ChunkPlan {
    ChunkPlan::from_iter([
        (TIME_DIM.to_string(), 4u64),
        ("eta_rho".to_string(), 1),
        ("xi_rho".to_string(), 100),
    ])
}

#[test]
fn rechunk_repartitions_and_consolidates() {
    let dir = tempfile::TempDir::new().unwrap();
    let source = assemble_fs_store(dir.path());
    let dest = dir.path().join("rechunk_2023-03-06_0000.zarr");
    let temp = dir.path().join("tmp_0.zarr");

    rechunk(
        &source,
        &dest,
        &temp,
        &archive_plan(),
        &RechunkOptions::default(),
    )
    .unwrap();

    let dst_store = Arc::new(FilesystemStore::new(&dest).unwrap());
    let temp_out = Array::open(dst_store.clone(), "/temp").unwrap();
    assert_eq!(temp_out.shape(), [24, ETA as u64, XI as u64]);
    // requested sizes capped at the dimension lengths
    assert_eq!(
        temp_out
            .chunk_shape(&[0, 0, 0])
            .unwrap()
            .iter()
            .map(|c| c.get())
            .collect::<Vec<_>>(),
        [4, 1, XI as u64]
    );
    assert_eq!(temp_out.attributes()["units"], "Celsius");

    // data and fill pattern survive the copy
    let src_store = Arc::new(FilesystemStore::new(&source).unwrap());
    let temp_in = Array::open(src_store.clone(), "/temp").unwrap();
    let before = temp_in
        .retrieve_array_subset_ndarray::<f32>(&temp_in.subset_all())
        .unwrap();
    let after = temp_out
        .retrieve_array_subset_ndarray::<f32>(&temp_out.subset_all())
        .unwrap();
    assert_eq!(
        before.iter().map(|v| v.to_bits()).collect::<Vec<_>>(),
        after.iter().map(|v| v.to_bits()).collect::<Vec<_>>()
    );

    // statics come along too
    let h = Array::open(dst_store.clone(), "/h").unwrap();
    let h_data = h
        .retrieve_array_subset_ndarray::<f32>(&h.subset_all())
        .unwrap();
    assert_eq!(h_data.as_slice().unwrap(), [0.0, 2.0]);

    // staging is gone, metadata is consolidated
    assert!(!temp.exists());
    let root: serde_json::Value =
        serde_json::from_slice(&std::fs::read(dest.join("zarr.json")).unwrap()).unwrap();
    assert_eq!(root["consolidated_metadata"]["kind"], "inline");
    assert!(root["consolidated_metadata"]["metadata"].get("temp").is_some());
    assert!(root["consolidated_metadata"]["metadata"].get("h").is_some());
}

#[test]
fn rechunk_stages_under_a_tight_budget() {
    let dir = tempfile::TempDir::new().unwrap();
    let source = assemble_fs_store(dir.path());
    let dest = dir.path().join("rechunk_tight.zarr");
    let temp = dir.path().join("tmp_tight.zarr");

    // large enough for single chunks, too small for covering reads of the
    // bigger variables, so the staged path runs
    let options = RechunkOptions {
        max_bytes: 128,
        retries: 0,
    };
    rechunk(&source, &dest, &temp, &archive_plan(), &options).unwrap();

    let dst_store = Arc::new(FilesystemStore::new(&dest).unwrap());
    let temp_out = Array::open(dst_store.clone(), "/temp").unwrap();
    let after = temp_out
        .retrieve_array_subset_ndarray::<f32>(&temp_out.subset_all())
        .unwrap();
    for t in 0..24 {
        assert_eq!(after[[t, 1, 2]], temp_value(t as i64, 1, 2));
    }
    assert!(!temp.exists());
}

#[test]
fn rechunk_restart_replaces_previous_output() {
    let dir = tempfile::TempDir::new().unwrap();
    let source = assemble_fs_store(dir.path());
    let dest = dir.path().join("rechunk_restart.zarr");
    let temp = dir.path().join("tmp_restart.zarr");

    rechunk(&source, &dest, &temp, &archive_plan(), &RechunkOptions::default()).unwrap();
    // a second run over the same paths must succeed from scratch
    rechunk(&source, &dest, &temp, &archive_plan(), &RechunkOptions::default()).unwrap();
    assert!(dest.join("zarr.json").exists());
    assert!(!temp.exists());
}

#[test]
fn failed_rechunk_leaves_no_destination() {
    let dir = tempfile::TempDir::new().unwrap();
    let source = assemble_fs_store(dir.path());
    let dest = dir.path().join("rechunk_failed.zarr");
    let temp = dir.path().join("tmp_failed.zarr");

    // one-byte budget cannot fit any chunk
    let options = RechunkOptions {
        max_bytes: 1,
        retries: 0,
    };
    let err = rechunk(&source, &dest, &temp, &archive_plan(), &options).unwrap_err();
    assert!(matches!(err, RechunkError::BudgetTooSmall { .. }));
    assert!(!dest.exists());
    assert!(!temp.exists());
}

#[test]
fn rechunk_of_missing_source_fails_cleanly() {
    let dir = tempfile::TempDir::new().unwrap();
    let source = dir.path().join("does_not_exist.zarr");
    let dest = dir.path().join("rechunk_missing.zarr");
    let temp = dir.path().join("tmp_missing.zarr");

    let err = rechunk(
        &source,
        &dest,
        &temp,
        &archive_plan(),
        &RechunkOptions::default(),
    )
    .unwrap_err();
    assert!(matches!(err, RechunkError::MissingRootMetadata));
    assert!(!dest.exists());
    assert!(!temp.exists());
}
