/*
Copyright 2021 Jakub Lewandowski

This file is part of Hydrologic Ensemble Assimilation System (HEAS).

Hydrologic Ensemble Assimilation System (HEAS) is a free software: you can redistribute it and/or modify
it under the terms of the GNU General Public License as published by
the Free Software Foundation; either version 3 of the License, or
(at your option) any later version.

Hydrologic Ensemble Assimilation System (HEAS) is distributed in the hope that it will be useful,
but WITHOUT ANY WARRANTY; without even the implied warranty of
MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
GNU General Public License for more details.

You should have received a copy of the GNU General Public License
along with Hydrologic Ensemble Assimilation System (HEAS). If not, see https://www.gnu.org/licenses/.
*/

//! Module describing the geospatial store holding every raster
//! the system reads and writes.
//!
//! The store is seen as a set of raster tables. A raster table keeps
//! rows of (id, tile id, date, optional layer, optional ensemble, raster),
//! where each raster is one tile of a dated image. Besides raster tables
//! every simulation name owns a schema with the `basin` domain table
//! and the `state` table listing saved model state files.

mod archive;
mod memory;

pub use memory::MemoryStore;

use super::domain::{Extent, TimeWindow};
use crate::errors::StoreError;
use crate::Float;
use chrono::NaiveDate;
use ndarray::{s, Array2};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};

/// Affine georeference of a north-up raster.
#[derive(Copy, Clone, PartialEq, PartialOrd, Debug, Serialize, Deserialize)]
pub struct GeoTransform {
    pub upper_left_x: Float,
    pub upper_left_y: Float,
    pub scale_x: Float,
    pub scale_y: Float,
}

impl GeoTransform {
    /// Raster (column, row) of a geographic point, possibly outside the raster.
    pub fn world_to_raster(&self, lon: Float, lat: Float) -> (isize, isize) {
        let col = ((lon - self.upper_left_x) / self.scale_x).floor() as isize;
        let row = ((lat - self.upper_left_y) / self.scale_y).floor() as isize;

        (col, row)
    }

    /// Geographic coordinates of a cell centre.
    pub fn cell_centre(&self, col: usize, row: usize) -> (Float, Float) {
        (
            self.upper_left_x + (col as Float + 0.5) * self.scale_x,
            self.upper_left_y + (row as Float + 0.5) * self.scale_y,
        )
    }

    fn shifted(&self, col_offset: usize, row_offset: usize) -> GeoTransform {
        GeoTransform {
            upper_left_x: self.upper_left_x + col_offset as Float * self.scale_x,
            upper_left_y: self.upper_left_y + row_offset as Float * self.scale_y,
            ..*self
        }
    }
}

/// Single-band georeferenced image.
#[derive(Clone, PartialEq, Debug)]
pub struct Raster {
    pub transform: GeoTransform,
    pub data: Array2<f32>,
    pub nodata: f32,
}

impl Raster {
    pub fn new(transform: GeoTransform, data: Array2<f32>, nodata: f32) -> Self {
        Raster {
            transform,
            data,
            nodata,
        }
    }

    /// Cell (column, row) containing the point.
    pub fn cell(&self, lon: Float, lat: Float) -> Option<(usize, usize)> {
        let (col, row) = self.transform.world_to_raster(lon, lat);
        let (nrows, ncols) = self.data.dim();

        if col < 0 || row < 0 || col as usize >= ncols || row as usize >= nrows {
            return None;
        }

        Some((col as usize, row as usize))
    }

    /// Value of a cell, `None` when outside the raster or without data.
    pub fn value(&self, col: usize, row: usize) -> Option<f32> {
        self.data
            .get((row, col))
            .copied()
            .filter(|v| !v.is_nan() && *v != self.nodata)
    }

    /// Nearest cell with data to the point, as the value
    /// and the squared distance (in degrees) to that cell centre.
    pub fn nearest_value(&self, lon: Float, lat: Float) -> Option<(f32, Float)> {
        let mut nearest: Option<(f32, Float)> = None;

        for ((row, col), _) in self.data.indexed_iter() {
            if let Some(value) = self.value(col, row) {
                let (x, y) = self.transform.cell_centre(col, row);
                let distance = (x - lon).powi(2) + (y - lat).powi(2);

                if nearest.map_or(true, |(_, d)| distance < d) {
                    nearest = Some((value, distance));
                }
            }
        }

        nearest
    }

    /// Splits the raster into tiles of at most `cols` × `rows` cells,
    /// in row-major order of tiles.
    pub fn split(&self, cols: usize, rows: usize) -> Vec<Raster> {
        let (nrows, ncols) = self.data.dim();
        let (cols, rows) = (cols.max(1), rows.max(1));
        let mut tiles = vec![];

        for row_start in (0..nrows).step_by(rows) {
            for col_start in (0..ncols).step_by(cols) {
                let row_end = (row_start + rows).min(nrows);
                let col_end = (col_start + cols).min(ncols);

                tiles.push(Raster {
                    transform: self.transform.shifted(col_start, row_start),
                    data: self
                        .data
                        .slice(s![row_start..row_end, col_start..col_end])
                        .to_owned(),
                    nodata: self.nodata,
                });
            }
        }

        tiles
    }
}

/// Schema-qualified table name, like `precip.chirps` or `basin_a.soil_moist`.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Serialize, Deserialize)]
pub struct TableName {
    pub schema: String,
    pub table: String,
}

impl TableName {
    pub fn new(schema: &str, table: &str) -> Self {
        TableName {
            schema: schema.to_string(),
            table: table.to_string(),
        }
    }

    /// Parses `schema.table`, without a dot the whole name is the table
    /// in the `public` schema.
    pub fn parse(name: &str) -> Self {
        match name.split_once('.') {
            Some((schema, table)) => TableName::new(schema.trim(), table.trim()),
            None => TableName::new("public", name.trim()),
        }
    }
}

impl fmt::Display for TableName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.schema, self.table)
    }
}

/// Row of a raster table.
#[derive(Clone, PartialEq, Debug)]
pub struct RasterRow {
    /// Serial id assigned by the store on insert.
    pub id: u64,
    /// Tile id within the dated image.
    pub rid: i32,
    pub date: NaiveDate,
    pub layer: Option<i32>,
    pub ensemble: Option<i32>,
    pub raster: Raster,
}

/// Tile produced by a bulk load, before it is moved into its table.
#[derive(Clone, PartialEq, Debug)]
pub struct StagedRaster {
    /// Tile id assigned by the loader.
    pub rid: i32,
    /// Index of the loaded image this tile was cut from.
    pub source: usize,
    pub raster: Raster,
}

/// Soil catalog row: geometry of one cell and its model soil parameter line.
#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
pub struct SoilRecord {
    pub gid: i64,
    pub lat: Float,
    pub lon: Float,
    pub elev: Float,
    pub depths: Vec<Float>,
    pub line: String,
}

/// Model parameter files available at one resolution.
#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
pub struct ParameterSet {
    pub resolution: Float,
    pub veglib: String,
    pub vegparam: String,
    pub snowbands: String,
    pub root_zones: u32,
}

/// Raster-table interface of the geospatial store.
///
/// Implementations have to be safe to share between threads, as tile
/// readers query the store in parallel. Creation operations are
/// create-if-absent and report whether anything was created.
pub trait RasterStore: Send + Sync + fmt::Debug {
    fn parameter_sets(&self) -> Result<Vec<ParameterSet>, StoreError>;

    /// Soil catalog rows at given resolution with their point inside the extent.
    fn soils(&self, resolution: Float, extent: &Extent) -> Result<Vec<SoilRecord>, StoreError>;

    fn basin(&self, schema: &str) -> Result<Option<Vec<SoilRecord>>, StoreError>;

    fn create_basin(&self, schema: &str, records: Vec<SoilRecord>) -> Result<bool, StoreError>;

    fn table_exists(&self, table: &TableName) -> Result<bool, StoreError>;

    fn has_ensemble_column(&self, table: &TableName) -> Result<bool, StoreError>;

    fn create_raster_table(
        &self,
        table: &TableName,
        layered: bool,
        ensemble: bool,
    ) -> Result<bool, StoreError>;

    /// Adds the ensemble column and sets it to 0 on all existing rows.
    fn add_ensemble_column(&self, table: &TableName) -> Result<bool, StoreError>;

    /// All rows of a date.
    fn rasters(&self, table: &TableName, date: NaiveDate) -> Result<Vec<RasterRow>, StoreError>;

    /// Rows of a single tile within the window, ordered by date.
    fn tile(
        &self,
        table: &TableName,
        rid: i32,
        window: &TimeWindow,
    ) -> Result<Vec<RasterRow>, StoreError>;

    fn dates(&self, table: &TableName) -> Result<Vec<NaiveDate>, StoreError>;

    fn delete_rasters(&self, table: &TableName, date: NaiveDate) -> Result<usize, StoreError>;

    /// Tiles images with the store tile size, assigning serial tile ids
    /// across the whole batch starting from 1.
    fn bulk_load(&self, images: Vec<Raster>) -> Result<Vec<StagedRaster>, StoreError>;

    /// Inserts all rows in one transaction.
    fn insert_rasters(&self, table: &TableName, rows: Vec<RasterRow>) -> Result<usize, StoreError>;

    fn rebuild_indices(&self, table: &TableName) -> Result<(), StoreError>;

    fn record_state(&self, schema: &str, date: NaiveDate, path: &Path) -> Result<(), StoreError>;

    fn state_file(&self, schema: &str, date: NaiveDate) -> Result<Option<PathBuf>, StoreError>;
}
