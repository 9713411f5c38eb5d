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

//! On-disk archive of the [`MemoryStore`].
//!
//! The archive is a directory with `catalog.yaml` describing every table
//! and a `rasters/<schema>/<table>/<id>.tif` single-band Float32 image
//! for every raster row. Row ids are never reused, so an image already
//! present on disk is never rewritten.

use super::memory::{Catalog, RasterTable, Schema, SoilCatalog};
use super::{GeoTransform, MemoryStore, ParameterSet, Raster, RasterRow, TableName};
use crate::errors::StoreError;
use chrono::NaiveDate;
use log::{debug, info};
use ndarray::Array2;
use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use tiff::decoder::{Decoder, DecodingResult};
use tiff::encoder::{colortype, TiffEncoder};

const CATALOG_FILE: &str = "catalog.yaml";
const RASTER_DIR: &str = "rasters";

#[derive(Serialize, Deserialize)]
struct CatalogFile {
    tile_size: (usize, usize),
    next_id: u64,
    #[serde(default)]
    parameter_sets: Vec<ParameterSet>,
    #[serde(default)]
    soils: Vec<SoilCatalog>,
    #[serde(default)]
    schemas: BTreeMap<String, Schema>,
    #[serde(default)]
    tables: Vec<TableFile>,
}

#[derive(Serialize, Deserialize)]
struct TableFile {
    name: TableName,
    layered: bool,
    ensemble: bool,
    rows: Vec<RowFile>,
}

#[derive(Serialize, Deserialize)]
struct RowFile {
    id: u64,
    rid: i32,
    date: NaiveDate,
    layer: Option<i32>,
    ensemble: Option<i32>,
    transform: GeoTransform,
    nodata: f32,
    file: PathBuf,
}

impl MemoryStore {
    /// Opens the store archived in `dir`, or an empty store
    /// archived there when the directory has no catalog yet.
    pub fn open(dir: &Path, tile_size: (usize, usize)) -> Result<Self, StoreError> {
        let catalog_path = dir.join(CATALOG_FILE);

        if !catalog_path.exists() {
            info!("No store catalog in {:?}, starting an empty store", dir);
            fs::create_dir_all(dir)?;

            let mut store = MemoryStore::new(tile_size);
            store.root = Some(dir.to_path_buf());
            return Ok(store);
        }

        debug!("Reading store catalog from {:?}", catalog_path);
        let file: CatalogFile = serde_yaml::from_reader(BufReader::new(File::open(&catalog_path)?))?;

        let mut tables = rustc_hash::FxHashMap::default();

        for table in file.tables {
            let mut rows: BTreeMap<NaiveDate, Vec<RasterRow>> = BTreeMap::new();

            for row in table.rows {
                let data = read_image(&dir.join(&row.file))?;

                rows.entry(row.date).or_default().push(RasterRow {
                    id: row.id,
                    rid: row.rid,
                    date: row.date,
                    layer: row.layer,
                    ensemble: row.ensemble,
                    raster: Raster::new(row.transform, data, row.nodata),
                });
            }

            tables.insert(
                table.name,
                RasterTable {
                    layered: table.layered,
                    ensemble: table.ensemble,
                    rows,
                },
            );
        }

        let catalog = Catalog {
            parameter_sets: file.parameter_sets,
            soils: file.soils,
            schemas: file.schemas.into_iter().collect(),
            tables,
            next_id: file.next_id,
        };

        Ok(MemoryStore {
            catalog: RwLock::new(catalog),
            tile_size: file.tile_size,
            root: Some(dir.to_path_buf()),
        })
    }

    /// Writes new raster images and the catalog to the archive directory,
    /// removing images of deleted rows. Does nothing for a store
    /// without an archive.
    pub fn flush(&self) -> Result<(), StoreError> {
        let root = match &self.root {
            Some(root) => root,
            None => return Ok(()),
        };

        let catalog = self.read()?;
        let mut referenced = FxHashSet::default();
        let mut tables = vec![];

        let mut names: Vec<&TableName> = catalog.tables.keys().collect();
        names.sort();

        for name in names {
            let table = &catalog.tables[name];
            let dir = Path::new(RASTER_DIR).join(&name.schema).join(&name.table);
            fs::create_dir_all(root.join(&dir))?;

            let mut rows = vec![];

            for row in table.rows.values().flatten() {
                let file = dir.join(format!("{}.tif", row.id));
                let path = root.join(&file);

                if !path.exists() {
                    write_image(&path, &row.raster.data)?;
                }

                referenced.insert(path);
                rows.push(RowFile {
                    id: row.id,
                    rid: row.rid,
                    date: row.date,
                    layer: row.layer,
                    ensemble: row.ensemble,
                    transform: row.raster.transform,
                    nodata: row.raster.nodata,
                    file,
                });
            }

            tables.push(TableFile {
                name: name.clone(),
                layered: table.layered,
                ensemble: table.ensemble,
                rows,
            });
        }

        remove_orphans(&root.join(RASTER_DIR), &referenced)?;

        let file = CatalogFile {
            tile_size: self.tile_size,
            next_id: catalog.next_id,
            parameter_sets: catalog.parameter_sets.clone(),
            soils: catalog.soils.clone(),
            schemas: catalog
                .schemas
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            tables,
        };

        // catalog is replaced only once complete
        let partial = root.join(format!("{}.partial", CATALOG_FILE));
        serde_yaml::to_writer(BufWriter::new(File::create(&partial)?), &file)?;
        fs::rename(&partial, root.join(CATALOG_FILE))?;

        debug!("Store flushed to {:?}", root);
        Ok(())
    }
}

fn write_image(path: &Path, data: &Array2<f32>) -> Result<(), StoreError> {
    let (height, width) = data.dim();
    let samples: Vec<f32> = data.iter().copied().collect();

    let mut encoder = TiffEncoder::new(BufWriter::new(File::create(path)?))?;
    encoder.write_image::<colortype::Gray32Float>(width as u32, height as u32, &samples)?;

    Ok(())
}

fn read_image(path: &Path) -> Result<Array2<f32>, StoreError> {
    let mut decoder = Decoder::new(BufReader::new(File::open(path)?))?;
    let (width, height) = decoder.dimensions()?;

    match decoder.read_image()? {
        DecodingResult::F32(samples) => Ok(Array2::from_shape_vec(
            (height as usize, width as usize),
            samples,
        )?),
        _ => Err(StoreError::UnsupportedRaster(path.display().to_string())),
    }
}

fn remove_orphans(dir: &Path, referenced: &FxHashSet<PathBuf>) -> Result<(), StoreError> {
    if !dir.is_dir() {
        return Ok(());
    }

    for entry in fs::read_dir(dir)? {
        let path = entry?.path();

        if path.is_dir() {
            remove_orphans(&path, referenced)?;
        } else if path.extension().map_or(false, |ext| ext == "tif") && !referenced.contains(&path) {
            debug!("Removing deleted raster {:?}", path);
            fs::remove_file(&path)?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use crate::simulation::domain::{Extent, TimeWindow};
    use crate::simulation::store::{
        GeoTransform, MemoryStore, ParameterSet, Raster, RasterStore, SoilRecord, TableName,
    };
    use chrono::NaiveDate;
    use ndarray::Array2;

    #[test]
    fn archive_survives_reopening() {
        let dir = tempfile::tempdir().unwrap();
        let table = TableName::new("precip", "chirps");
        let date = NaiveDate::from_ymd_opt(2019, 7, 1).unwrap();

        let transform = GeoTransform {
            upper_left_x: 30.0,
            upper_left_y: 2.0,
            scale_x: 0.5,
            scale_y: -0.5,
        };
        let data = Array2::from_shape_fn((4, 3), |(r, c)| (r * 3 + c) as f32 * 0.5);

        {
            let store = MemoryStore::open(dir.path(), (2, 2)).unwrap();
            store
                .add_parameter_set(ParameterSet {
                    resolution: 0.5,
                    veglib: "veglib".to_string(),
                    vegparam: "vegparam".to_string(),
                    snowbands: "snowbands".to_string(),
                    root_zones: 2,
                })
                .unwrap();
            store
                .add_soils(
                    0.5,
                    vec![SoilRecord {
                        gid: 7,
                        lat: 1.25,
                        lon: 30.25,
                        elev: 1200.0,
                        depths: vec![0.1, 0.3, 1.0],
                        line: "1 7 1.25 30.25".to_string(),
                    }],
                )
                .unwrap();
            store
                .ingest(&table, date, &Raster::new(transform, data.clone(), -9999.0))
                .unwrap();
            store.flush().unwrap();

            store.delete_rasters(&table, date).unwrap();
            store
                .ingest(&table, date, &Raster::new(transform, data.clone(), -9999.0))
                .unwrap();
            store.flush().unwrap();
        }

        let store = MemoryStore::open(dir.path(), (8, 8)).unwrap();
        let window = TimeWindow::new(date, date);

        assert_eq!(store.rasters(&table, date).unwrap().len(), 4);
        assert_eq!(store.tile(&table, 4, &window).unwrap()[0].raster.data[[1, 0]], 5.5);
        assert_eq!(store.parameter_sets().unwrap().len(), 1);

        let extent = Extent {
            west: 30.0,
            east: 31.0,
            south: 1.0,
            north: 2.0,
        };
        assert_eq!(store.soils(0.5, &extent).unwrap().len(), 1);

        let images = std::fs::read_dir(dir.path().join("rasters/precip/chirps"))
            .unwrap()
            .count();
        assert_eq!(images, 4);
    }
}
