//! Assembles one weekly COAWST window, rechunks it, and exports it as
//! NetCDF-4.
//!
//! Usage:
//!   coawst-archive --config archive.toml --window 3
//!   coawst-archive --config archive.toml        # window from SLURM_ARRAY_TASK_ID

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;
use walkdir::WalkDir;

use coawst_archive::config::ArchiveConfig;
use coawst_archive::export::{export_netcdf, export_path};
use coawst_archive::ingest::ingest;
use coawst_archive::rechunk::{RechunkOptions, rechunk};
use coawst_archive::source::{NetcdfOpener, SourceOpener};
use coawst_archive::template::build_template;
use zarrs::filesystem::FilesystemStore;

#[derive(Parser)]
#[command(name = "coawst-archive", about = "COAWST weekly archive builder", version)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// The weekly window to build. Defaults to the SLURM array task index,
    /// or 0 for interactive runs.
    #[arg(long, env = "SLURM_ARRAY_TASK_ID", default_value_t = 0)]
    window: u64,

    /// Source file to take the schema from. Defaults to a recent forecast
    /// discovered under the source root.
    #[arg(long)]
    reference: Option<PathBuf>,

    /// Stop after rechunking, skipping the NetCDF export.
    #[arg(long)]
    skip_export: bool,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => ArchiveConfig::from_toml(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => ArchiveConfig::default(),
    };

    run(&config, &cli)
}

fn run(config: &ArchiveConfig, cli: &Cli) -> anyhow::Result<()> {
    let window = cli.window;
    let grid = config.window_grid(window)?;
    let paths = config.store_paths(window);
    info!(window, start = %grid.start(), "building window");

    let opener = NetcdfOpener::new(&config.time_dim);
    let reference_path = match &cli.reference {
        Some(path) => path.clone(),
        None => discover_reference(config)?,
    };
    let reference = opener
        .open(&reference_path)
        .with_context(|| format!("opening reference {}", reference_path.display()))?;
    info!(reference = %reference_path.display(), "schema reference");

    std::fs::create_dir_all(&config.output_root)?;
    remove_if_exists(&paths.assembly)?;
    let store = Arc::new(FilesystemStore::new(&paths.assembly)?);
    build_template(&store, &reference, &grid, &config.time_dim, config.time_chunk)?;

    let candidates = config.candidates(window);
    let report = ingest(
        &store,
        &grid,
        &opener,
        &candidates,
        config.steps_per_file,
        &config.varmap,
        &config.time_dim,
    )?;
    anyhow::ensure!(
        !report.written_ranges().is_empty(),
        "no candidate of window {window} could be ingested"
    );

    let options = RechunkOptions {
        max_bytes: config.max_mem_bytes,
        retries: config.rechunk_retries,
    };
    rechunk(
        &paths.assembly,
        &paths.archive,
        &paths.staging,
        &config.rechunk_plan,
        &options,
    )?;
    // the assembly store is scratch once the archive store exists
    remove_if_exists(&paths.assembly)?;

    if cli.skip_export {
        info!("export skipped");
        return Ok(());
    }
    std::fs::create_dir_all(&config.export_root)?;
    let nc_path = export_path(&paths.archive, &config.export_root)?;
    export_netcdf(&paths.archive, &nc_path)?;
    Ok(())
}

/// Pick a recent forecast file as the schema reference, skipping the very
/// newest runs in case they are still being written.
fn discover_reference(config: &ArchiveConfig) -> anyhow::Result<PathBuf> {
    let mut sources: Vec<PathBuf> = WalkDir::new(&config.source_root)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_file())
        .map(|entry| entry.into_path())
        .filter(|path| {
            path.file_name()
                .and_then(|name| name.to_str())
                .is_some_and(|name| name.starts_with("coawst_us_") && name.ends_with(".nc"))
        })
        .collect();
    sources.sort();
    anyhow::ensure!(
        !sources.is_empty(),
        "no coawst_us_*.nc sources under {}",
        config.source_root.display()
    );
    let pick = sources.len().saturating_sub(5);
    Ok(sources[pick.min(sources.len() - 1)].clone())
}

fn remove_if_exists(path: &std::path::Path) -> std::io::Result<()> {
    match std::fs::remove_dir_all(path) {
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}
