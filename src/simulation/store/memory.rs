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

//! In-process implementation of the raster store.
//!
//! All tables live in memory behind a single `RwLock`, so parallel
//! readers never block each other and every write operation is
//! applied completely or not at all. The store can be backed by an
//! archive directory (see [`archive`](super::archive)) to persist
//! it between runs.

use super::{ParameterSet, Raster, RasterRow, RasterStore, SoilRecord, StagedRaster, TableName};
use crate::errors::StoreError;
use crate::simulation::domain::{same_resolution, Extent, TimeWindow};
use crate::Float;
use chrono::NaiveDate;
use log::debug;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Soil parameter rows available at one resolution.
#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
pub(super) struct SoilCatalog {
    pub resolution: Float,
    pub records: Vec<SoilRecord>,
}

/// Per-simulation tables.
#[derive(Clone, PartialEq, Debug, Default, Serialize, Deserialize)]
pub(super) struct Schema {
    #[serde(default)]
    pub basin: Option<Vec<SoilRecord>>,
    #[serde(default)]
    pub states: BTreeMap<NaiveDate, PathBuf>,
}

/// Raster table with its rows grouped by date.
#[derive(Clone, PartialEq, Debug, Default)]
pub(super) struct RasterTable {
    pub layered: bool,
    pub ensemble: bool,
    pub rows: BTreeMap<NaiveDate, Vec<RasterRow>>,
}

#[derive(Clone, PartialEq, Debug, Default)]
pub(super) struct Catalog {
    pub parameter_sets: Vec<ParameterSet>,
    pub soils: Vec<SoilCatalog>,
    pub schemas: FxHashMap<String, Schema>,
    pub tables: FxHashMap<TableName, RasterTable>,
    pub next_id: u64,
}

/// Raster store kept in memory.
#[derive(Debug)]
pub struct MemoryStore {
    pub(super) catalog: RwLock<Catalog>,
    pub(super) tile_size: (usize, usize),
    pub(super) root: Option<PathBuf>,
}

impl MemoryStore {
    /// Empty store cutting loaded images into tiles
    /// of at most `tile_size` (columns, rows).
    pub fn new(tile_size: (usize, usize)) -> Self {
        MemoryStore {
            catalog: RwLock::new(Catalog {
                next_id: 1,
                ..Catalog::default()
            }),
            tile_size,
            root: None,
        }
    }

    pub(super) fn read(&self) -> Result<RwLockReadGuard<'_, Catalog>, StoreError> {
        self.catalog.read().map_err(|_| StoreError::Poisoned)
    }

    pub(super) fn write(&self) -> Result<RwLockWriteGuard<'_, Catalog>, StoreError> {
        self.catalog.write().map_err(|_| StoreError::Poisoned)
    }

    pub fn add_parameter_set(&self, set: ParameterSet) -> Result<(), StoreError> {
        self.write()?.parameter_sets.push(set);
        Ok(())
    }

    /// Adds soil catalog rows at a resolution.
    pub fn add_soils(&self, resolution: Float, records: Vec<SoilRecord>) -> Result<(), StoreError> {
        let mut catalog = self.write()?;

        match catalog
            .soils
            .iter_mut()
            .find(|c| same_resolution(c.resolution, resolution))
        {
            Some(existing) => existing.records.extend(records),
            None => catalog.soils.push(SoilCatalog {
                resolution,
                records,
            }),
        }

        Ok(())
    }

    /// Tiles a full dated raster and inserts it into a dataset table,
    /// creating the table if needed. Tile ids run from 1 in row-major order.
    pub fn ingest(&self, table: &TableName, date: NaiveDate, raster: &Raster) -> Result<(), StoreError> {
        self.create_raster_table(table, false, false)?;

        let rows = raster
            .split(self.tile_size.0, self.tile_size.1)
            .into_iter()
            .enumerate()
            .map(|(i, tile)| RasterRow {
                id: 0,
                rid: i as i32 + 1,
                date,
                layer: None,
                ensemble: None,
                raster: tile,
            })
            .collect();

        self.insert_rasters(table, rows)?;
        Ok(())
    }
}

impl RasterStore for MemoryStore {
    fn parameter_sets(&self) -> Result<Vec<ParameterSet>, StoreError> {
        Ok(self.read()?.parameter_sets.clone())
    }

    fn soils(&self, resolution: Float, extent: &Extent) -> Result<Vec<SoilRecord>, StoreError> {
        let catalog = self.read()?;

        Ok(catalog
            .soils
            .iter()
            .filter(|c| same_resolution(c.resolution, resolution))
            .flat_map(|c| c.records.iter())
            .filter(|r| extent.contains(r.lon, r.lat))
            .cloned()
            .collect())
    }

    fn basin(&self, schema: &str) -> Result<Option<Vec<SoilRecord>>, StoreError> {
        Ok(self
            .read()?
            .schemas
            .get(schema)
            .and_then(|s| s.basin.clone()))
    }

    fn create_basin(&self, schema: &str, records: Vec<SoilRecord>) -> Result<bool, StoreError> {
        let mut catalog = self.write()?;
        let schema = catalog.schemas.entry(schema.to_string()).or_default();

        if schema.basin.is_some() {
            return Ok(false);
        }

        schema.basin = Some(records);
        Ok(true)
    }

    fn table_exists(&self, table: &TableName) -> Result<bool, StoreError> {
        Ok(self.read()?.tables.contains_key(table))
    }

    fn has_ensemble_column(&self, table: &TableName) -> Result<bool, StoreError> {
        self.read()?
            .tables
            .get(table)
            .map(|t| t.ensemble)
            .ok_or_else(|| StoreError::MissingTable(table.to_string()))
    }

    fn create_raster_table(
        &self,
        table: &TableName,
        layered: bool,
        ensemble: bool,
    ) -> Result<bool, StoreError> {
        let mut catalog = self.write()?;

        if catalog.tables.contains_key(table) {
            return Ok(false);
        }

        debug!("Creating raster table {}", table);
        catalog.tables.insert(
            table.clone(),
            RasterTable {
                layered,
                ensemble,
                rows: BTreeMap::new(),
            },
        );

        Ok(true)
    }

    fn add_ensemble_column(&self, table: &TableName) -> Result<bool, StoreError> {
        let mut catalog = self.write()?;
        let raster_table = catalog
            .tables
            .get_mut(table)
            .ok_or_else(|| StoreError::MissingTable(table.to_string()))?;

        if raster_table.ensemble {
            return Ok(false);
        }

        raster_table.ensemble = true;
        raster_table
            .rows
            .values_mut()
            .flat_map(|rows| rows.iter_mut())
            .for_each(|row| row.ensemble = Some(0));

        Ok(true)
    }

    fn rasters(&self, table: &TableName, date: NaiveDate) -> Result<Vec<RasterRow>, StoreError> {
        let catalog = self.read()?;
        let raster_table = catalog
            .tables
            .get(table)
            .ok_or_else(|| StoreError::MissingTable(table.to_string()))?;

        Ok(raster_table.rows.get(&date).cloned().unwrap_or_default())
    }

    fn tile(
        &self,
        table: &TableName,
        rid: i32,
        window: &TimeWindow,
    ) -> Result<Vec<RasterRow>, StoreError> {
        let catalog = self.read()?;
        let raster_table = catalog
            .tables
            .get(table)
            .ok_or_else(|| StoreError::MissingTable(table.to_string()))?;

        Ok(raster_table
            .rows
            .range(window.start..=window.end)
            .flat_map(|(_, rows)| rows.iter())
            .filter(|row| row.rid == rid)
            .cloned()
            .collect())
    }

    fn dates(&self, table: &TableName) -> Result<Vec<NaiveDate>, StoreError> {
        let catalog = self.read()?;
        let raster_table = catalog
            .tables
            .get(table)
            .ok_or_else(|| StoreError::MissingTable(table.to_string()))?;

        Ok(raster_table
            .rows
            .iter()
            .filter(|(_, rows)| !rows.is_empty())
            .map(|(date, _)| *date)
            .collect())
    }

    fn delete_rasters(&self, table: &TableName, date: NaiveDate) -> Result<usize, StoreError> {
        let mut catalog = self.write()?;
        let raster_table = catalog
            .tables
            .get_mut(table)
            .ok_or_else(|| StoreError::MissingTable(table.to_string()))?;

        Ok(raster_table.rows.remove(&date).map_or(0, |rows| rows.len()))
    }

    fn bulk_load(&self, images: Vec<Raster>) -> Result<Vec<StagedRaster>, StoreError> {
        let mut staged = vec![];

        for (source, image) in images.iter().enumerate() {
            for tile in image.split(self.tile_size.0, self.tile_size.1) {
                staged.push(StagedRaster {
                    rid: staged.len() as i32 + 1,
                    source,
                    raster: tile,
                });
            }
        }

        debug!("Staged {} tiles from {} images", staged.len(), images.len());

        Ok(staged)
    }

    fn insert_rasters(&self, table: &TableName, rows: Vec<RasterRow>) -> Result<usize, StoreError> {
        let mut catalog = self.write()?;
        let mut next_id = catalog.next_id;

        let raster_table = catalog
            .tables
            .get_mut(table)
            .ok_or_else(|| StoreError::MissingTable(table.to_string()))?;

        let count = rows.len();

        for mut row in rows {
            row.id = next_id;
            next_id += 1;

            if !raster_table.layered {
                row.layer = None;
            }

            if !raster_table.ensemble {
                row.ensemble = None;
            }

            raster_table.rows.entry(row.date).or_default().push(row);
        }

        catalog.next_id = next_id;

        Ok(count)
    }

    fn rebuild_indices(&self, table: &TableName) -> Result<(), StoreError> {
        let mut catalog = self.write()?;
        let raster_table = catalog
            .tables
            .get_mut(table)
            .ok_or_else(|| StoreError::MissingTable(table.to_string()))?;

        raster_table.rows.retain(|_, rows| !rows.is_empty());

        for rows in raster_table.rows.values_mut() {
            rows.sort_by_key(|row| (row.ensemble, row.layer, row.rid, row.id));
        }

        Ok(())
    }

    fn record_state(&self, schema: &str, date: NaiveDate, path: &Path) -> Result<(), StoreError> {
        self.write()?
            .schemas
            .entry(schema.to_string())
            .or_default()
            .states
            .insert(date, path.to_path_buf());

        Ok(())
    }

    fn state_file(&self, schema: &str, date: NaiveDate) -> Result<Option<PathBuf>, StoreError> {
        Ok(self
            .read()?
            .schemas
            .get(schema)
            .and_then(|s| s.states.get(&date).cloned()))
    }
}

#[cfg(test)]
mod tests {
    use super::MemoryStore;
    use crate::simulation::domain::TimeWindow;
    use crate::simulation::store::{GeoTransform, Raster, RasterRow, RasterStore, TableName};
    use chrono::NaiveDate;
    use ndarray::Array2;

    fn date(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2021, 5, day).unwrap()
    }

    fn raster(value: f32) -> Raster {
        let transform = GeoTransform {
            upper_left_x: 0.0,
            upper_left_y: 4.0,
            scale_x: 1.0,
            scale_y: -1.0,
        };

        Raster::new(transform, Array2::from_elem((4, 4), value), -9999.0)
    }

    #[test]
    fn ingest_tiles_and_queries() {
        let store = MemoryStore::new((2, 2));
        let table = TableName::new("precip", "test");

        store.ingest(&table, date(1), &raster(1.0)).unwrap();
        store.ingest(&table, date(2), &raster(2.0)).unwrap();

        assert_eq!(store.rasters(&table, date(1)).unwrap().len(), 4);
        assert_eq!(store.dates(&table).unwrap(), vec![date(1), date(2)]);

        let window = TimeWindow::new(date(1), date(3));
        let tile = store.tile(&table, 3, &window).unwrap();
        assert_eq!(tile.len(), 2);
        assert_eq!(tile[1].raster.data[[0, 0]], 2.0);

        assert_eq!(store.delete_rasters(&table, date(1)).unwrap(), 4);
        assert_eq!(store.dates(&table).unwrap(), vec![date(2)]);
    }

    #[test]
    fn ensemble_column_backfills_zero() {
        let store = MemoryStore::new((4, 4));
        let table = TableName::new("basin", "runoff");

        assert!(store.create_raster_table(&table, false, false).unwrap());
        assert!(!store.create_raster_table(&table, false, false).unwrap());

        let row = RasterRow {
            id: 0,
            rid: 1,
            date: date(1),
            layer: None,
            ensemble: None,
            raster: raster(0.5),
        };
        store.insert_rasters(&table, vec![row]).unwrap();

        assert!(store.add_ensemble_column(&table).unwrap());
        assert!(!store.add_ensemble_column(&table).unwrap());
        assert_eq!(store.rasters(&table, date(1)).unwrap()[0].ensemble, Some(0));
    }

    #[test]
    fn bulk_load_numbers_serially() {
        let store = MemoryStore::new((2, 2));
        let staged = store.bulk_load(vec![raster(1.0), raster(2.0)]).unwrap();

        assert_eq!(staged.len(), 8);
        assert_eq!(
            staged.iter().map(|s| s.rid).collect::<Vec<_>>(),
            (1..=8).collect::<Vec<_>>()
        );
        assert_eq!(staged[4].source, 1);
    }

    #[test]
    fn missing_table_is_reported() {
        let store = MemoryStore::new((2, 2));
        assert!(store
            .rasters(&TableName::new("wind", "none"), date(1))
            .is_err());
    }

    #[test]
    fn state_table_updates_in_place() {
        let store = MemoryStore::new((2, 2));

        store.record_state("basin", date(3), "/tmp/a".as_ref()).unwrap();
        store.record_state("basin", date(3), "/tmp/b".as_ref()).unwrap();

        assert_eq!(
            store.state_file("basin", date(3)).unwrap(),
            Some("/tmp/b".into())
        );
        assert_eq!(store.state_file("basin", date(4)).unwrap(), None);
    }
}
