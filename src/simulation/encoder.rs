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

//! Module persisting output variables as dated raster rows.
//!
//! Every (date, layer) slice of an output variable is rendered into an
//! image georeferenced from the domain bounding box. All images of one
//! save are bulk loaded as a single batch, which numbers tiles serially
//! across the whole batch. Since every image of a domain has the same
//! shape, the tile ids are folded back onto the per-image tiling with
//! [`reconcile_tile_id`] before the rows are inserted.

use crate::constants::NODATA;
use crate::errors::EncoderError;
use crate::simulation::domain::{Domain, TimeWindow};
use crate::simulation::instance::OutputVariable;
use crate::simulation::store::{Raster, RasterRow, RasterStore, TableName};
use chrono::NaiveDate;
use log::{debug, info};
use ndarray::{s, Array2};
use std::collections::BTreeMap;

/// Options of a single save.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Default)]
pub struct SaveOptions {
    /// Replace rows already stored for the saved dates.
    pub initialize: bool,
    /// Days at the beginning of the variable left out.
    pub skip_days: usize,
    /// Ensemble index the rows are tagged with.
    pub ensemble: Option<i32>,
}

/// Maps a tile id assigned by a bulk load onto the tiling of a single image.
pub fn reconcile_tile_id(rid: i32, ntiles: i32) -> i32 {
    ((rid + ntiles) % ntiles) + 1
}

/// Writes output variables of one simulation into its store schema.
pub struct OutputEncoder<'a> {
    store: &'a dyn RasterStore,
    schema: &'a str,
}

impl<'a> OutputEncoder<'a> {
    pub fn new(store: &'a dyn RasterStore, schema: &'a str) -> Self {
        OutputEncoder { store, schema }
    }

    /// Saves the variable into the table of the same name,
    /// returning the number of inserted rows.
    pub fn save(
        &self,
        variable: &OutputVariable,
        domain: &Domain,
        options: &SaveOptions,
    ) -> Result<usize, EncoderError> {
        let table = TableName::new(self.schema, &variable.name);
        let layered = variable.layers() > 1;

        if options.skip_days >= variable.days() {
            return Err(EncoderError::NothingToSave(variable.name.clone()));
        }

        if self.store.table_exists(&table)? {
            if options.ensemble.is_some() && self.store.add_ensemble_column(&table)? {
                debug!("Added ensemble column to {}", table);
            }

            if options.initialize {
                for date in variable.dates() {
                    self.store.delete_rasters(&table, date)?;
                }
            }
        } else {
            self.store
                .create_raster_table(&table, layered, options.ensemble.is_some())?;
        }

        let dates = variable.dates();
        let transform = domain.geotransform();
        let mut images = vec![];
        let mut keys: Vec<(NaiveDate, usize)> = vec![];

        for t in options.skip_days..variable.days() {
            for layer in 0..variable.layers() {
                let data = variable.data.slice(s![t, layer, .., ..]).to_owned();
                images.push(Raster::new(transform, data, NODATA));
                keys.push((dates[t], layer));
            }
        }

        let nimages = images.len();
        let staged = self.store.bulk_load(images)?;

        if staged.is_empty() {
            return Err(EncoderError::EmptyLoad(nimages));
        }

        let ntiles = (staged.len() / nimages).max(1) as i32;

        let rows: Vec<RasterRow> = staged
            .into_iter()
            .map(|tile| {
                let (date, layer) = keys[tile.source];

                RasterRow {
                    id: 0,
                    rid: reconcile_tile_id(tile.rid, ntiles),
                    date,
                    layer: layered.then(|| layer as i32 + 1),
                    ensemble: options.ensemble,
                    raster: tile.raster,
                }
            })
            .collect();

        let inserted = self.store.insert_rasters(&table, rows)?;
        self.store.rebuild_indices(&table)?;

        info!(
            "Saved {} days of {} ({} rows)",
            variable.days() - options.skip_days,
            table,
            inserted
        );

        Ok(inserted)
    }

    /// Writes the mean and standard deviation across ensemble members
    /// of a variable into `<variable>_mean` and `<variable>_stddev`
    /// for every date of the window.
    pub fn summarize(&self, variable: &str, window: &TimeWindow) -> Result<(), EncoderError> {
        let source = TableName::new(self.schema, variable);
        let mean_table = TableName::new(self.schema, &format!("{}_mean", variable));
        let stddev_table = TableName::new(self.schema, &format!("{}_stddev", variable));

        let dates: Vec<NaiveDate> = self
            .store
            .dates(&source)?
            .into_iter()
            .filter(|date| window.contains(*date))
            .collect();

        let mut means = vec![];
        let mut stddevs = vec![];
        let mut layered = false;

        for date in &dates {
            let mut groups: BTreeMap<(Option<i32>, i32), Vec<RasterRow>> = BTreeMap::new();

            for row in self.store.rasters(&source, *date)? {
                if row.ensemble.map_or(true, |e| e > 0) {
                    layered |= row.layer.is_some();
                    groups.entry((row.layer, row.rid)).or_default().push(row);
                }
            }

            for ((layer, rid), members) in groups {
                let (mean, stddev) = ensemble_statistics(&members);
                let template = &members[0];

                let row = |data: Array2<f32>| RasterRow {
                    id: 0,
                    rid,
                    date: *date,
                    layer,
                    ensemble: None,
                    raster: Raster::new(template.raster.transform, data, NODATA),
                };

                means.push(row(mean));
                stddevs.push(row(stddev));
            }
        }

        for (table, rows) in [(mean_table, means), (stddev_table, stddevs)] {
            self.store.create_raster_table(&table, layered, false)?;

            for date in &dates {
                self.store.delete_rasters(&table, *date)?;
            }

            self.store.insert_rasters(&table, rows)?;
            self.store.rebuild_indices(&table)?;
        }

        debug!("Summarized {} dates of {}", dates.len(), source);
        Ok(())
    }
}

/// Cell-wise mean and population standard deviation of member tiles,
/// skipping cells without data.
fn ensemble_statistics(members: &[RasterRow]) -> (Array2<f32>, Array2<f32>) {
    let shape = members[0].raster.data.dim();
    let mut mean = Array2::from_elem(shape, NODATA);
    let mut stddev = Array2::from_elem(shape, NODATA);

    for ((row, col), cell) in mean.indexed_iter_mut() {
        let values: Vec<f64> = members
            .iter()
            .filter_map(|m| m.raster.value(col, row))
            .map(f64::from)
            .collect();

        if values.is_empty() {
            continue;
        }

        let n = values.len() as f64;
        let average = values.iter().sum::<f64>() / n;
        let variance = values.iter().map(|v| (v - average).powi(2)).sum::<f64>() / n;

        *cell = average as f32;
        stddev[[row, col]] = variance.sqrt() as f32;
    }

    (mean, stddev)
}

#[cfg(test)]
mod tests {
    use super::{reconcile_tile_id, OutputEncoder, SaveOptions};
    use crate::simulation::domain::{Domain, Pixel, TimeWindow};
    use crate::simulation::instance::OutputVariable;
    use crate::simulation::store::{MemoryStore, RasterStore, TableName};
    use chrono::{Duration, NaiveDate};
    use float_cmp::approx_eq;
    use ndarray::Array4;
    use rustc_hash::FxHashSet;

    fn domain() -> Domain {
        let pixels = [(1, 0.375, 30.125), (2, 0.375, 30.375), (3, 0.125, 30.125), (4, 0.125, 30.375)]
            .iter()
            .map(|&(gid, lat, lon)| Pixel {
                gid,
                lat,
                lon,
                elev: 0.0,
                depths: vec![],
            })
            .collect();

        Domain::new(pixels, 0.25)
    }

    fn start() -> NaiveDate {
        NaiveDate::from_ymd_opt(2021, 2, 1).unwrap()
    }

    fn variable(name: &str, layers: usize, value: f32) -> OutputVariable {
        OutputVariable {
            name: name.to_string(),
            start: start(),
            data: Array4::from_elem((3, layers, 2, 2), value),
        }
    }

    #[test]
    fn reconciliation_is_bijective() {
        for ntiles in 1..20 {
            for image in 0..3 {
                let ids: FxHashSet<i32> = (1..=ntiles)
                    .map(|rid| reconcile_tile_id(image * ntiles + rid, ntiles))
                    .collect();

                assert_eq!(ids, (1..=ntiles).collect());
            }
        }
    }

    #[test]
    fn initialized_save_replaces_rows() {
        let store = MemoryStore::new((1, 1));
        let encoder = OutputEncoder::new(&store, "basin");
        let options = SaveOptions {
            initialize: true,
            ..SaveOptions::default()
        };

        assert_eq!(encoder.save(&variable("runoff", 1, 1.0), &domain(), &options).unwrap(), 12);
        assert_eq!(encoder.save(&variable("runoff", 1, 2.0), &domain(), &options).unwrap(), 12);

        let rows = store.rasters(&TableName::new("basin", "runoff"), start()).unwrap();
        assert_eq!(rows.len(), 4);
        assert!(rows.iter().all(|row| row.raster.data[[0, 0]] == 2.0));

        let rids: FxHashSet<i32> = rows.iter().map(|row| row.rid).collect();
        assert_eq!(rids, (1..=4).collect());
    }

    #[test]
    fn layers_and_skipped_days() {
        let store = MemoryStore::new((2, 2));
        let encoder = OutputEncoder::new(&store, "basin");
        let options = SaveOptions {
            skip_days: 1,
            ..SaveOptions::default()
        };

        encoder
            .save(&variable("soil_moist", 3, 0.3), &domain(), &options)
            .unwrap();

        let table = TableName::new("basin", "soil_moist");
        assert!(store.rasters(&table, start()).unwrap().is_empty());

        let rows = store.rasters(&table, start() + Duration::days(1)).unwrap();
        let layers: Vec<Option<i32>> = rows.iter().map(|row| row.layer).collect();
        assert_eq!(layers, vec![Some(1), Some(2), Some(3)]);

        let everything = SaveOptions {
            initialize: true,
            skip_days: 3,
            ..SaveOptions::default()
        };
        assert!(encoder
            .save(&variable("soil_moist", 3, 0.3), &domain(), &everything)
            .is_err());

        // rejected save leaves earlier rows in place
        let rows = store.rasters(&table, start() + Duration::days(2)).unwrap();
        assert_eq!(rows.len(), 3);
    }

    #[test]
    fn ensemble_rows_and_summaries() {
        let store = MemoryStore::new((2, 2));
        let encoder = OutputEncoder::new(&store, "basin");
        let table = TableName::new("basin", "evap");

        // deterministic row saved before the ensemble
        encoder
            .save(&variable("evap", 1, 9.0), &domain(), &SaveOptions::default())
            .unwrap();

        for member in 0..3 {
            let options = SaveOptions {
                initialize: member == 0,
                skip_days: 0,
                ensemble: Some(member + 1),
            };
            encoder
                .save(&variable("evap", 1, member as f32), &domain(), &options)
                .unwrap();
        }

        assert!(store.has_ensemble_column(&table).unwrap());

        let rows = store.rasters(&table, start()).unwrap();
        let mut members: Vec<i32> = rows.iter().filter_map(|row| row.ensemble).collect();
        members.sort_unstable();
        assert_eq!(members, vec![1, 2, 3]);

        let window = TimeWindow::new(start(), start() + Duration::days(2));
        encoder.summarize("evap", &window).unwrap();

        let mean = store
            .rasters(&TableName::new("basin", "evap_mean"), start())
            .unwrap();
        let stddev = store
            .rasters(&TableName::new("basin", "evap_stddev"), start())
            .unwrap();

        assert_eq!(mean.len(), 1);
        assert!(approx_eq!(f32, mean[0].raster.data[[1, 1]], 1.0));
        assert!(approx_eq!(
            f32,
            stddev[0].raster.data[[0, 1]],
            (2.0f32 / 3.0).sqrt(),
            epsilon = 1.0e-6
        ));
    }
}
