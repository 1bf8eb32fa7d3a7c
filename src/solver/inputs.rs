//! Solver input file writers.
//!
//! Blocking; call from `spawn_blocking`.

use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::Path;

use crate::assemble::SimulationInput;
use crate::rainfall::RainfallSeries;
use crate::spatial::Polygon;

pub const DEM_FILE: &str = "Domain_DEM.asc";
pub const RAINFALL_FILE: &str = "Rainfall_Data_1.txt";
pub const CONFIG_FILE: &str = "CityCat_Config_1.txt";
pub const SPATIAL_RAINFALL_FILE: &str = "Spatial_Rainfall_1.txt";
pub const BUILDINGS_FILE: &str = "Buildings.txt";
pub const GREEN_AREAS_FILE: &str = "GreenAreas.txt";

/// Write every input file for `input` into `dir`.
pub fn write_inputs(dir: &Path, input: &SimulationInput) -> io::Result<()> {
    let dem = BufWriter::new(File::create(dir.join(DEM_FILE))?);
    input
        .terrain
        .grid
        .write(dem)
        .map_err(|e| io::Error::other(e.to_string()))?;

    write_rainfall(
        BufWriter::new(File::create(dir.join(RAINFALL_FILE))?),
        &input.rainfall,
    )?;

    if !input.rain_zones.is_empty() {
        let mut out = BufWriter::new(File::create(dir.join(SPATIAL_RAINFALL_FILE))?);
        writeln!(out, "{}", input.rain_zones.len())?;
        for (index, zone) in input.rain_zones.iter().enumerate() {
            write!(out, "{} ", index + 1)?;
            write_polygon(&mut out, zone)?;
        }
        out.flush()?;
    }

    if let Some(buildings) = &input.buildings {
        write_polygons(
            BufWriter::new(File::create(dir.join(BUILDINGS_FILE))?),
            buildings,
        )?;
    }
    if let Some(green_areas) = &input.green_areas {
        write_polygons(
            BufWriter::new(File::create(dir.join(GREEN_AREAS_FILE))?),
            green_areas,
        )?;
    }

    write_config(BufWriter::new(File::create(dir.join(CONFIG_FILE))?), input)
}

pub fn write_rainfall<W: Write>(mut out: W, series: &RainfallSeries) -> io::Result<()> {
    writeln!(out, "* * *")?;
    writeln!(out, "* * * rainfall ***")?;
    writeln!(out, "* * *")?;
    writeln!(out, "{}", series.rows())?;
    writeln!(out, "* * *")?;
    for (index, elapsed) in series.elapsed().iter().enumerate() {
        write!(out, "{}", elapsed)?;
        for rate in series.row(index).unwrap_or_default() {
            write!(out, " {}", rate)?;
        }
        writeln!(out)?;
    }
    out.flush()
}

fn write_polygon<W: Write>(out: &mut W, polygon: &Polygon) -> io::Result<()> {
    write!(out, "{}", polygon.exterior.len())?;
    for (x, _) in &polygon.exterior {
        write!(out, " {}", x)?;
    }
    for (_, y) in &polygon.exterior {
        write!(out, " {}", y)?;
    }
    writeln!(out)
}

/// Count line, then one `nverts xs... ys...` line per polygon.
pub fn write_polygons<W: Write>(mut out: W, polygons: &[Polygon]) -> io::Result<()> {
    writeln!(out, "{}", polygons.len())?;
    for polygon in polygons {
        write_polygon(&mut out, polygon)?;
    }
    out.flush()
}

pub fn write_config<W: Write>(mut out: W, input: &SimulationInput) -> io::Result<()> {
    let flag = |present: bool| u8::from(present);
    writeln!(out, "{:<12} ! Simulation duration (s)", input.duration_secs)?;
    writeln!(out, "{:<12} ! Output interval (s)", input.output_frequency)?;
    writeln!(out, "{:<12} ! Rainfall sources", input.rainfall.locations())?;
    writeln!(
        out,
        "{:<12} ! Spatially varying rainfall",
        flag(!input.rain_zones.is_empty())
    )?;
    writeln!(out, "{:<12} ! Manning's n", input.friction)?;
    writeln!(
        out,
        "{:<12} ! Buildings",
        flag(input.buildings.as_ref().is_some_and(|b| !b.is_empty()))
    )?;
    writeln!(
        out,
        "{:<12} ! Green areas",
        flag(input.green_areas.as_ref().is_some_and(|g| !g.is_empty()))
    )?;
    out.flush()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::grid::AsciiGrid;
    use crate::spatial::Terrain;

    fn triangle(id: i64) -> Polygon {
        Polygon {
            id,
            exterior: vec![(0.0, 0.0), (10.0, 0.0), (0.0, 5.0)],
        }
    }

    fn input() -> SimulationInput {
        SimulationInput {
            terrain: Terrain {
                grid: AsciiGrid::filled(2, 2, 0.0, 0.0, 5.0, 1.5),
                srid: 27700,
            },
            rainfall: RainfallSeries::uniform(100.0, 500),
            rain_zones: Vec::new(),
            duration_secs: 3600,
            output_frequency: 600,
            friction: 0.03,
            boundary: None,
            buildings: Some(vec![triangle(1), triangle(2)]),
            green_areas: None,
        }
    }

    #[test]
    fn test_rainfall_file_layout() {
        let mut out = Vec::new();
        write_rainfall(&mut out, &RainfallSeries::uniform(100.0, 500)).unwrap();
        let text = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = text.lines().collect();

        assert_eq!(lines[1], "* * * rainfall ***");
        assert_eq!(lines[3], "4");
        let first: Vec<f64> = lines[5]
            .split_whitespace()
            .map(|v| v.parse().unwrap())
            .collect();
        assert_eq!(first.len(), 2);
        assert!((first[1] - 0.0002).abs() < 1e-12);
        assert_eq!(lines[8], "502 0");
    }

    #[test]
    fn test_polygon_file_layout() {
        let mut out = Vec::new();
        write_polygons(&mut out, &[triangle(1)]).unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), "1\n3 0 10 0 0 0 5\n");
    }

    #[test]
    fn test_write_inputs_creates_files() {
        let dir = tempfile::tempdir().unwrap();
        write_inputs(dir.path(), &input()).unwrap();

        for name in [DEM_FILE, RAINFALL_FILE, CONFIG_FILE, BUILDINGS_FILE] {
            assert!(dir.path().join(name).exists(), "missing {}", name);
        }
        assert!(!dir.path().join(GREEN_AREAS_FILE).exists());
        assert!(!dir.path().join(SPATIAL_RAINFALL_FILE).exists());

        let dem = std::fs::read_to_string(dir.path().join(DEM_FILE)).unwrap();
        assert_eq!(AsciiGrid::parse(&dem).unwrap().get(1, 1), Some(1.5));
    }
}
