//! ESRI ASCII grid reading and writing.
//!
//! Terrain arrives from the spatial store in this format and depth rasters
//! leave the converter in it. Values are stored row-major starting at the
//! top (northernmost) row, as in the file.

use std::fmt::Write as _;
use std::io::Write;

use thiserror::Error;

pub const DEFAULT_NODATA: f64 = -9999.0;

#[derive(Debug, Error)]
pub enum GridError {
    #[error("missing grid header: {0}")]
    MissingHeader(&'static str),
    #[error("invalid grid header line: {0}")]
    InvalidHeader(String),
    #[error("invalid grid value: {0}")]
    InvalidValue(String),
    #[error("grid has {found} values, expected {expected}")]
    Size { expected: usize, found: usize },
    #[error("grid is not valid UTF-8")]
    Encoding,
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A regular raster grid with lower-left origin.
#[derive(Debug, Clone, PartialEq)]
pub struct AsciiGrid {
    pub ncols: usize,
    pub nrows: usize,
    /// X of the lower-left corner.
    pub xll: f64,
    /// Y of the lower-left corner.
    pub yll: f64,
    pub dx: f64,
    pub dy: f64,
    pub nodata: f64,
    values: Vec<f64>,
}

#[derive(Default)]
struct Header {
    ncols: Option<usize>,
    nrows: Option<usize>,
    xllcorner: Option<f64>,
    yllcorner: Option<f64>,
    xllcenter: Option<f64>,
    yllcenter: Option<f64>,
    cellsize: Option<f64>,
    dx: Option<f64>,
    dy: Option<f64>,
    nodata: Option<f64>,
}

fn header_value<T: std::str::FromStr>(line: &str, value: &str) -> Result<T, GridError> {
    value
        .parse()
        .map_err(|_| GridError::InvalidHeader(line.to_string()))
}

impl AsciiGrid {
    /// Build a grid with every cell set to `value`.
    pub fn filled(
        ncols: usize,
        nrows: usize,
        xll: f64,
        yll: f64,
        cellsize: f64,
        value: f64,
    ) -> Self {
        Self {
            ncols,
            nrows,
            xll,
            yll,
            dx: cellsize,
            dy: cellsize,
            nodata: DEFAULT_NODATA,
            values: vec![value; ncols * nrows],
        }
    }

    /// Same georeferencing as `self`, every cell set to `value`.
    pub fn filled_like(&self, value: f64) -> Self {
        Self {
            values: vec![value; self.ncols * self.nrows],
            ..self.clone()
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, GridError> {
        let text = std::str::from_utf8(bytes).map_err(|_| GridError::Encoding)?;
        Self::parse(text)
    }

    /// Parse ESRI ASCII grid text.
    ///
    /// Accepts `cellsize` or GDAL's `dx`/`dy` pair, and corner or centre
    /// registration. `NODATA_value` is optional.
    pub fn parse(text: &str) -> Result<Self, GridError> {
        let mut header = Header::default();
        let mut lines = text.lines().peekable();

        while let Some(line) = lines.peek() {
            let trimmed = line.trim();
            if trimmed.is_empty() {
                lines.next();
                continue;
            }
            let mut parts = trimmed.split_whitespace();
            let key = match parts.next() {
                Some(k) if k.starts_with(|c: char| c.is_ascii_alphabetic()) => {
                    k.to_ascii_lowercase()
                }
                _ => break,
            };
            let value = parts
                .next()
                .ok_or_else(|| GridError::InvalidHeader(trimmed.to_string()))?;

            match key.as_str() {
                "ncols" => header.ncols = Some(header_value(trimmed, value)?),
                "nrows" => header.nrows = Some(header_value(trimmed, value)?),
                "xllcorner" => header.xllcorner = Some(header_value(trimmed, value)?),
                "yllcorner" => header.yllcorner = Some(header_value(trimmed, value)?),
                "xllcenter" => header.xllcenter = Some(header_value(trimmed, value)?),
                "yllcenter" => header.yllcenter = Some(header_value(trimmed, value)?),
                "cellsize" => header.cellsize = Some(header_value(trimmed, value)?),
                "dx" => header.dx = Some(header_value(trimmed, value)?),
                "dy" => header.dy = Some(header_value(trimmed, value)?),
                "nodata_value" => header.nodata = Some(header_value(trimmed, value)?),
                _ => return Err(GridError::InvalidHeader(trimmed.to_string())),
            }
            lines.next();
        }

        let ncols = header.ncols.ok_or(GridError::MissingHeader("ncols"))?;
        let nrows = header.nrows.ok_or(GridError::MissingHeader("nrows"))?;
        let (dx, dy) = match (header.cellsize, header.dx, header.dy) {
            (Some(size), _, _) => (size, size),
            (None, Some(dx), Some(dy)) => (dx, dy),
            _ => return Err(GridError::MissingHeader("cellsize")),
        };
        let xll = match (header.xllcorner, header.xllcenter) {
            (Some(x), _) => x,
            (None, Some(x)) => x - dx / 2.0,
            _ => return Err(GridError::MissingHeader("xllcorner")),
        };
        let yll = match (header.yllcorner, header.yllcenter) {
            (Some(y), _) => y,
            (None, Some(y)) => y - dy / 2.0,
            _ => return Err(GridError::MissingHeader("yllcorner")),
        };

        let values = lines
            .flat_map(|line| line.split_whitespace())
            .map(|token| {
                token
                    .parse::<f64>()
                    .map_err(|_| GridError::InvalidValue(token.to_string()))
            })
            .collect::<Result<Vec<f64>, GridError>>()?;

        let expected = ncols * nrows;
        if values.len() != expected {
            return Err(GridError::Size {
                expected,
                found: values.len(),
            });
        }

        Ok(Self {
            ncols,
            nrows,
            xll,
            yll,
            dx,
            dy,
            nodata: header.nodata.unwrap_or(DEFAULT_NODATA),
            values,
        })
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    /// Value at (`col`, `row`), row 0 being the top row.
    pub fn get(&self, col: usize, row: usize) -> Option<f64> {
        if col >= self.ncols || row >= self.nrows {
            return None;
        }
        self.values.get(row * self.ncols + col).copied()
    }

    pub fn set(&mut self, col: usize, row: usize, value: f64) -> bool {
        if col >= self.ncols || row >= self.nrows {
            return false;
        }
        self.values[row * self.ncols + col] = value;
        true
    }

    /// Cell containing the point, if inside the grid extent.
    pub fn cell_of(&self, x: f64, y: f64) -> Option<(usize, usize)> {
        let fx = ((x - self.xll) / self.dx).floor();
        let fy = ((y - self.yll) / self.dy).floor();
        if fx < 0.0 || fy < 0.0 {
            return None;
        }
        let (col, from_bottom) = (fx as usize, fy as usize);
        if col >= self.ncols || from_bottom >= self.nrows {
            return None;
        }
        Some((col, self.nrows - 1 - from_bottom))
    }

    /// Centre coordinates of a cell.
    pub fn cell_centre(&self, col: usize, row: usize) -> (f64, f64) {
        let x = self.xll + (col as f64 + 0.5) * self.dx;
        let y = self.yll + ((self.nrows - 1 - row) as f64 + 0.5) * self.dy;
        (x, y)
    }

    /// Maximum non-nodata value.
    pub fn max_value(&self) -> Option<f64> {
        self.values
            .iter()
            .copied()
            .filter(|v| *v != self.nodata)
            .fold(None, |acc, v| Some(acc.map_or(v, |a: f64| a.max(v))))
    }

    pub fn to_text(&self) -> String {
        let mut out = String::with_capacity(self.values.len() * 8 + 128);
        let _ = writeln!(out, "ncols        {}", self.ncols);
        let _ = writeln!(out, "nrows        {}", self.nrows);
        let _ = writeln!(out, "xllcorner    {}", self.xll);
        let _ = writeln!(out, "yllcorner    {}", self.yll);
        if self.dx == self.dy {
            let _ = writeln!(out, "cellsize     {}", self.dx);
        } else {
            let _ = writeln!(out, "dx           {}", self.dx);
            let _ = writeln!(out, "dy           {}", self.dy);
        }
        let _ = writeln!(out, "NODATA_value {}", self.nodata);
        for row in self.values.chunks(self.ncols.max(1)) {
            let line: Vec<String> = row.iter().map(|v| v.to_string()).collect();
            out.push_str(&line.join(" "));
            out.push('\n');
        }
        out
    }

    pub fn write<W: Write>(&self, mut writer: W) -> Result<(), GridError> {
        writer.write_all(self.to_text().as_bytes())?;
        Ok(())
    }
}
