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

//! Pixel-to-tile join and the per-tile reader.

use crate::errors::StoreError;
use crate::simulation::domain::{Domain, TimeWindow};
use crate::simulation::store::{RasterStore, TableName};
use crate::Float;
use chrono::NaiveDate;
use log::debug;
use rustc_hash::FxHashMap;
use std::sync::Arc;

/// Position of a domain pixel inside a store tile.
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct TileCell {
    pub gid: i64,
    pub col: usize,
    pub row: usize,
}

/// Join of domain pixels with the tiles of one raster table,
/// keyed by tile id.
#[derive(Clone, PartialEq, Debug, Default)]
pub struct TileIndex {
    cells: FxHashMap<i32, Vec<TileCell>>,
}

impl TileIndex {
    /// Builds the index from the tiles of the first date
    /// within the window that has any rows in the table.
    pub fn build(
        store: &dyn RasterStore,
        table: &TableName,
        domain: &Domain,
        window: &TimeWindow,
    ) -> Result<Self, StoreError> {
        let reference = store
            .dates(table)?
            .into_iter()
            .find(|date| window.contains(*date));

        let reference = match reference {
            Some(date) => date,
            None => {
                debug!("No rasters of {} within {:?}", table, window);
                return Ok(TileIndex::default());
            }
        };

        let mut rows = store.rasters(table, reference)?;
        rows.sort_by_key(|row| row.rid);

        let mut cells: FxHashMap<i32, Vec<TileCell>> = FxHashMap::default();

        for pixel in domain.pixels() {
            let hit = rows
                .iter()
                .find_map(|row| row.raster.cell(pixel.lon, pixel.lat).map(|c| (row.rid, c)));

            if let Some((rid, (col, row))) = hit {
                cells.entry(rid).or_default().push(TileCell {
                    gid: pixel.gid,
                    col,
                    row,
                });
            }
        }

        debug!(
            "Indexed {} pixels of {} in {} tiles",
            cells.values().map(Vec::len).sum::<usize>(),
            table,
            cells.len()
        );

        Ok(TileIndex { cells })
    }

    /// Distinct tiles touching the domain, in ascending order.
    pub fn tiles(&self) -> Vec<i32> {
        let mut tiles: Vec<i32> = self.cells.keys().copied().collect();
        tiles.sort_unstable();
        tiles
    }

    pub fn cells(&self, tile: i32) -> &[TileCell] {
        self.cells.get(&tile).map_or(&[], Vec::as_slice)
    }
}

/// Reads values of indexed pixels from one tile at a time.
///
/// The reader holds no mutable state, so clones of it
/// can be sent to any number of workers.
#[derive(Clone)]
pub struct TileReader {
    store: Arc<dyn RasterStore>,
    table: TableName,
    window: TimeWindow,
    index: Arc<TileIndex>,
}

impl TileReader {
    pub fn new(
        store: Arc<dyn RasterStore>,
        table: TableName,
        window: TimeWindow,
        index: Arc<TileIndex>,
    ) -> Self {
        TileReader {
            store,
            table,
            window,
            index,
        }
    }

    /// (grid id, date, value) of every indexed pixel of the tile with
    /// data in the window. A tile without rows gives an empty list.
    pub fn read(&self, tile: i32) -> Result<Vec<(i64, NaiveDate, Float)>, StoreError> {
        let cells = self.index.cells(tile);

        if cells.is_empty() {
            return Ok(vec![]);
        }

        let rows = self.store.tile(&self.table, tile, &self.window)?;
        let mut values = Vec::with_capacity(rows.len() * cells.len());

        for row in &rows {
            for cell in cells {
                if let Some(value) = row.raster.value(cell.col, cell.row) {
                    values.push((cell.gid, row.date, Float::from(value)));
                }
            }
        }

        Ok(values)
    }
}

#[cfg(test)]
mod tests {
    use super::{TileIndex, TileReader};
    use crate::simulation::domain::{Domain, Pixel, TimeWindow};
    use crate::simulation::store::{GeoTransform, MemoryStore, Raster, RasterStore, TableName};
    use chrono::NaiveDate;
    use ndarray::Array2;
    use std::sync::Arc;

    fn pixel(gid: i64, lat: f64, lon: f64) -> Pixel {
        Pixel {
            gid,
            lat,
            lon,
            elev: 0.0,
            depths: vec![],
        }
    }

    #[test]
    fn tiles_read_independently() {
        let store = Arc::new(MemoryStore::new((2, 2)));
        let table = TableName::new("wind", "ncep");
        let start = NaiveDate::from_ymd_opt(2020, 1, 1).unwrap();
        let window = TimeWindow::new(start, NaiveDate::from_ymd_opt(2020, 1, 3).unwrap());

        let transform = GeoTransform {
            upper_left_x: 0.0,
            upper_left_y: 4.0,
            scale_x: 1.0,
            scale_y: -1.0,
        };

        for date in window.dates() {
            let mut data = Array2::from_shape_fn((4, 4), |(r, c)| (r * 4 + c) as f32);
            if date == start {
                data[[3, 3]] = -9999.0;
            }
            store
                .ingest(&table, date, &Raster::new(transform, data, -9999.0))
                .unwrap();
        }

        let domain = Domain::new(
            vec![pixel(1, 3.5, 0.5), pixel(2, 0.5, 3.5), pixel(3, 10.0, 10.0)],
            1.0,
        );

        let index = Arc::new(TileIndex::build(store.as_ref(), &table, &domain, &window).unwrap());
        assert_eq!(index.tiles(), vec![1, 4]);

        let store: Arc<dyn RasterStore> = store;
        let reader = TileReader::new(store, table, window, index);

        let first = reader.read(1).unwrap();
        assert_eq!(first.len(), 3);
        assert!(first.iter().all(|(gid, _, value)| *gid == 1 && *value == 0.0));

        let last = reader.read(4).unwrap();
        assert_eq!(last.len(), 2);
        assert!(last.iter().all(|(_, date, value)| *date != start && *value == 15.0));

        assert!(reader.read(2).unwrap().is_empty());
    }
}
