//! Solver output conversion.
//!
//! Produces, under the output directory:
//! - `{slug}.zip`: one `depth/T{seconds}.asc` grid per output time plus
//!   `metadata.json`
//! - `{slug}.asc`: maximum depth grid, with a `{slug}.prj` naming the EPSG
//!   code
//!
//! Solver tables are point lists (`x y depth ...`) rasterized onto the
//! terrain grid. Blocking; call from `spawn_blocking`.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;
use serde_json::json;
use thiserror::Error;
use tracing::{debug, info};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use crate::grid::{AsciiGrid, GridError};
use crate::models::JobConfig;
use crate::solver::SolverOutput;
use crate::spatial::Terrain;

#[derive(Debug, Error)]
pub enum ConvertError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("grid error: {0}")]
    Grid(#[from] GridError),
    #[error("zip error: {0}")]
    Zip(#[from] zip::result::ZipError),
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("malformed solver table {path}: line {line}")]
    Malformed { path: PathBuf, line: usize },
    #[error("maximum depth table missing: {0}")]
    MissingMaxDepth(PathBuf),
}

/// Files written for one job.
#[derive(Debug, Clone, PartialEq)]
pub struct Artifacts {
    pub archive: PathBuf,
    pub max_depth: PathBuf,
    pub projection: PathBuf,
    pub timesteps: usize,
}

/// `R1_C1_T{seconds}_{minutes}min.csv`
static SURFACE_MAP: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^R1_C1_T(\d+)_\d+min\.csv$").unwrap());

/// Per-timestep surface maps in `dir`, ordered by simulated seconds.
pub fn list_surface_maps(dir: &Path) -> std::io::Result<Vec<(u64, PathBuf)>> {
    let mut maps = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if let Some(secs) = SURFACE_MAP
            .captures(name)
            .and_then(|c| c[1].parse::<u64>().ok())
        {
            maps.push((secs, entry.path()));
        }
    }
    maps.sort();
    Ok(maps)
}

/// Parse `x y value ...` rows, skipping blank lines and a header.
fn read_points(path: &Path) -> Result<Vec<(f64, f64, f64)>, ConvertError> {
    let text = std::fs::read_to_string(path)?;
    let mut points = Vec::new();

    for (index, line) in text.lines().enumerate() {
        let fields: Vec<&str> = line
            .split(|c: char| c == ',' || c.is_whitespace())
            .filter(|f| !f.is_empty())
            .collect();
        if fields.is_empty() {
            continue;
        }
        let parsed: Option<Vec<f64>> = fields.iter().take(3).map(|f| f.parse().ok()).collect();
        match parsed {
            Some(v) if v.len() == 3 => points.push((v[0], v[1], v[2])),
            None if index == 0 => continue,
            _ => {
                return Err(ConvertError::Malformed {
                    path: path.to_path_buf(),
                    line: index + 1,
                })
            }
        }
    }
    Ok(points)
}

/// Zero everywhere the terrain has data, nodata elsewhere.
fn blank_like(terrain: &AsciiGrid) -> AsciiGrid {
    let mut grid = terrain.filled_like(0.0);
    for row in 0..terrain.nrows {
        for col in 0..terrain.ncols {
            if terrain.get(col, row) == Some(terrain.nodata) {
                grid.set(col, row, terrain.nodata);
            }
        }
    }
    grid
}

fn rasterize(path: &Path, terrain: &AsciiGrid) -> Result<AsciiGrid, ConvertError> {
    let mut grid = blank_like(terrain);
    for (x, y, value) in read_points(path)? {
        if let Some((col, row)) = grid.cell_of(x, y) {
            grid.set(col, row, value);
        }
    }
    Ok(grid)
}

pub struct OutputConverter {
    out_path: PathBuf,
}

impl OutputConverter {
    pub fn new(out_path: impl Into<PathBuf>) -> Self {
        Self {
            out_path: out_path.into(),
        }
    }

    pub fn out_path(&self) -> &Path {
        &self.out_path
    }

    /// Convert raw solver output for `config` into distributable files.
    pub fn convert(
        &self,
        output: &SolverOutput,
        terrain: &Terrain,
        config: &JobConfig,
    ) -> Result<Artifacts, ConvertError> {
        if !output.max_depth.is_file() {
            return Err(ConvertError::MissingMaxDepth(output.max_depth.clone()));
        }
        std::fs::create_dir_all(&self.out_path)?;

        let slug = config.slug();
        let crs = format!("EPSG:{}", terrain.srid);
        let maps = list_surface_maps(&output.surface_maps)?;
        debug!(job_id = %config.run_id, count = maps.len(), "Found surface maps");

        let archive = self.out_path.join(format!("{}.zip", slug));
        self.write_archive(&archive, &maps, terrain, config, &crs)?;

        let max_depth = self.out_path.join(format!("{}.asc", slug));
        let grid = rasterize(&output.max_depth, &terrain.grid)?;
        grid.write(BufWriter::new(File::create(&max_depth)?))?;

        let projection = self.out_path.join(format!("{}.prj", slug));
        std::fs::write(&projection, &crs)?;

        info!(
            job_id = %config.run_id,
            stage = "convert",
            archive = %archive.display(),
            timesteps = maps.len(),
            "Wrote output artifacts"
        );

        Ok(Artifacts {
            archive,
            max_depth,
            projection,
            timesteps: maps.len(),
        })
    }

    fn write_archive(
        &self,
        path: &Path,
        maps: &[(u64, PathBuf)],
        terrain: &Terrain,
        config: &JobConfig,
        crs: &str,
    ) -> Result<(), ConvertError> {
        let partial = path.with_extension("zip.part");
        let mut zip = ZipWriter::new(BufWriter::new(File::create(&partial)?));
        let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);

        for (secs, map) in maps {
            let grid = rasterize(map, &terrain.grid)?;
            zip.start_file(format!("depth/T{:08}.asc", secs), options)?;
            zip.write_all(grid.to_text().as_bytes())?;
        }

        let grid = &terrain.grid;
        let metadata = json!({
            "job": config.metadata(),
            "crs": crs,
            "units": "m",
            "times": maps.iter().map(|(secs, _)| *secs).collect::<Vec<_>>(),
            "grid": {
                "ncols": grid.ncols,
                "nrows": grid.nrows,
                "xllcorner": grid.xll,
                "yllcorner": grid.yll,
                "dx": grid.dx,
                "dy": grid.dy,
                "nodata": grid.nodata,
            },
        });
        zip.start_file("metadata.json", options)?;
        serde_json::to_writer_pretty(&mut zip, &metadata)?;

        let mut inner = zip.finish()?;
        inner.flush()?;
        drop(inner);
        std::fs::rename(&partial, path)?;
        Ok(())
    }
}
