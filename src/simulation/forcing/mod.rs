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

//! Module retrieving meteorological forcing of the domain from the store.
//!
//! Every forcing variable is a raster table tiled by the store. Retrieval
//! starts with joining domain pixels to tiles ([`TileIndex`]), then every
//! tile of every variable is read in parallel on the shared thread pool
//! by a [`TileReader`] and the results are collected through a channel.
//! Worker completion order does not matter, as values are placed into
//! pixel × day grids by grid id and date.
//!
//! Retrieved series are always complete. Pixels the tile join misses
//! (usually due to clipping at tile edges) are looked up with a nearest
//! value search over whole rasters, and the remaining gaps are filled
//! in time (see [`gaps`]). Filled values are only reported in logs and
//! in the returned [`GapReport`].

pub mod gaps;
mod tiles;

pub use tiles::{TileIndex, TileReader};

use self::gaps::VariableGaps;
use crate::errors::ForcingError;
use crate::simulation::configuration::ForcingOptions;
use crate::simulation::domain::{Domain, TimeWindow};
use crate::simulation::store::{RasterStore, TableName};
use crate::Float;
use log::{debug, warn};
use ndarray::Array2;
use rayon::ThreadPool;
use std::sync::{mpsc, Arc};

/// Forcing variables in the order of columns in weather files.
pub const FORCING_VARIABLES: [&str; 4] = ["precip", "tmax", "tmin", "wind"];

/// Datasets forcing is read from.
#[derive(Clone, PartialEq, Debug)]
pub struct ForcingSources {
    pub precip: Vec<String>,
    pub temperature: String,
    pub wind: String,
}

impl ForcingSources {
    /// Checks that every forcing variable has a dataset.
    pub fn from_options(options: &ForcingOptions) -> Result<Self, ForcingError> {
        if options.precip.is_empty() {
            return Err(ForcingError::NoDatasets("precipitation"));
        }

        let temperature = options
            .temperature
            .clone()
            .ok_or(ForcingError::NoDatasets("temperature"))?;

        let wind = options
            .wind
            .clone()
            .ok_or(ForcingError::NoDatasets("wind"))?;

        Ok(ForcingSources {
            precip: options.precip.iter().map(|p| p.trim().to_string()).collect(),
            temperature,
            wind,
        })
    }

    /// Store tables of all forcing variables, with the chosen precipitation dataset.
    pub fn tables(&self, precip: &str) -> [TableName; 4] {
        [
            TableName::new("precip", precip),
            TableName::new("tmax", &self.temperature),
            TableName::new("tmin", &self.temperature),
            TableName::new("wind", &self.wind),
        ]
    }
}

/// Complete daily forcing of every domain pixel.
///
/// Arrays are indexed by (pixel position in the domain, day of the window).
#[derive(Clone, PartialEq, Debug)]
pub struct ForcingSeries {
    pub window: TimeWindow,
    pub gids: Vec<i64>,
    pub precip: Array2<Float>,
    pub tmax: Array2<Float>,
    pub tmin: Array2<Float>,
    pub wind: Array2<Float>,
}

impl ForcingSeries {
    /// Number of (pixel, day) entries of the series.
    pub fn len(&self) -> usize {
        self.precip.len()
    }

    pub fn is_empty(&self) -> bool {
        self.precip.is_empty()
    }

    /// Values of one pixel-day in weather file column order.
    pub fn day(&self, position: usize, day: usize) -> [Float; 4] {
        [
            self.precip[[position, day]],
            self.tmax[[position, day]],
            self.tmin[[position, day]],
            self.wind[[position, day]],
        ]
    }

    /// Moves the series onto another window of the same length.
    pub fn relabel(mut self, window: TimeWindow) -> Result<Self, ForcingError> {
        if window.days() != self.window.days() {
            return Err(ForcingError::WindowMismatch(
                self.window.days(),
                window.days(),
            ));
        }

        self.window = window;
        Ok(self)
    }
}

/// Pixel-days filled while completing each forcing variable.
#[derive(Clone, PartialEq, Debug, Default)]
pub struct GapReport {
    pub variables: Vec<(TableName, VariableGaps)>,
}

impl GapReport {
    pub fn is_complete(&self) -> bool {
        self.variables.iter().all(|(_, gaps)| gaps.is_complete())
    }
}

/// Retrieves forcing series of one domain.
pub struct ForcingFetcher {
    store: Arc<dyn RasterStore>,
    domain: Arc<Domain>,
    threadpool: Arc<ThreadPool>,
}

impl ForcingFetcher {
    pub fn new(store: Arc<dyn RasterStore>, domain: Arc<Domain>, threadpool: Arc<ThreadPool>) -> Self {
        ForcingFetcher {
            store,
            domain,
            threadpool,
        }
    }

    /// Fetches complete series of all four variables over the window.
    pub fn fetch(
        &self,
        sources: &ForcingSources,
        precip: &str,
        window: &TimeWindow,
    ) -> Result<(ForcingSeries, GapReport), ForcingError> {
        let tables = sources.tables(precip);
        let raw = self.read_tiles(&tables, window)?;

        let mut report = GapReport::default();
        let mut grids = Vec::with_capacity(tables.len());

        for (table, values) in tables.iter().zip(raw) {
            let (grid, gaps) = self.complete(table, &values, window)?;
            report.variables.push((table.clone(), gaps));
            grids.push(grid);
        }

        let mut grids = grids.into_iter();
        let mut next = || grids.next().ok_or(ForcingError::WorkerLost);

        let series = ForcingSeries {
            window: *window,
            gids: self.domain.pixels().iter().map(|p| p.gid).collect(),
            precip: next()?,
            tmax: next()?,
            tmin: next()?,
            wind: next()?,
        };

        Ok((series, report))
    }

    /// Reads every tile of every table on the thread pool.
    fn read_tiles(
        &self,
        tables: &[TableName],
        window: &TimeWindow,
    ) -> Result<Vec<Vec<(i64, chrono::NaiveDate, Float)>>, ForcingError> {
        let (tx, rx) = mpsc::channel();
        let mut jobs = 0;

        for (variable, table) in tables.iter().enumerate() {
            let index = TileIndex::build(self.store.as_ref(), table, &self.domain, window)?;
            let tiles = index.tiles();
            let reader = TileReader::new(
                Arc::clone(&self.store),
                table.clone(),
                *window,
                Arc::new(index),
            );

            debug!("Reading {} tiles of {}", tiles.len(), table);

            for tile in tiles {
                let tx = tx.clone();
                let reader = reader.clone();
                jobs += 1;

                self.threadpool.spawn(move || {
                    // receiver is gone only when fetching already failed
                    let _ = tx.send((variable, reader.read(tile)));
                });
            }
        }

        drop(tx);

        let mut values = vec![vec![]; tables.len()];

        for _ in 0..jobs {
            let (variable, result) = rx.recv().map_err(|_| ForcingError::WorkerLost)?;
            values[variable].extend(result?);
        }

        Ok(values)
    }

    /// Turns raw tile values into a complete pixel × day grid.
    fn complete(
        &self,
        table: &TableName,
        values: &[(i64, chrono::NaiveDate, Float)],
        window: &TimeWindow,
    ) -> Result<(Array2<Float>, VariableGaps), ForcingError> {
        let mut grid = gaps::empty_grid(&self.domain, window);
        let placed = gaps::place(&mut grid, values, &self.domain, window);
        let mut filled = VariableGaps::default();

        if placed == grid.len() {
            return Ok((grid, filled));
        }

        let missing = gaps::empty_pixels(&grid);

        if !missing.is_empty() {
            warn!(
                "Missing meteorological data for {} pixels of {}. Filling with nearest values",
                missing.len(),
                table
            );
            filled.nearest = self.nearest_values(table, &mut grid, &missing, window)?;
        }

        gaps::fill(&mut grid, &mut filled);

        if filled.forward + filled.backward > 0 {
            warn!(
                "Filled {} missing days of {} from neighbouring days",
                filled.forward + filled.backward,
                table
            );
        }

        if filled.empty_pixels > 0 {
            warn!(
                "No data of {} for {} pixels, their forcing is set to no-data",
                table, filled.empty_pixels
            );
        }

        Ok((grid, filled))
    }

    /// Fills pixels with the nearest valid value of whole rasters.
    fn nearest_values(
        &self,
        table: &TableName,
        grid: &mut Array2<Float>,
        missing: &[usize],
        window: &TimeWindow,
    ) -> Result<usize, ForcingError> {
        let mut filled = 0;

        for (day, date) in window.dates().into_iter().enumerate() {
            let rows = self.store.rasters(table, date)?;

            if rows.is_empty() {
                continue;
            }

            for &position in missing {
                let pixel = &self.domain.pixels()[position];

                let nearest = rows
                    .iter()
                    .filter_map(|row| row.raster.nearest_value(pixel.lon, pixel.lat))
                    .min_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(std::cmp::Ordering::Equal));

                if let Some((value, _)) = nearest {
                    grid[[position, day]] = Float::from(value);
                    filled += 1;
                }
            }
        }

        Ok(filled)
    }
}
