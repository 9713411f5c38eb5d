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

//! Spatial and temporal frame shared by all ensemble members.
//!
//! The domain is an ordered set of pixels read once from the store
//! and then shared (through `Arc`) by every member of a run, so pixel
//! set and ordering are identical across the ensemble. The grid id
//! of a pixel is the join key between its geometry and every time series.

use super::store::{GeoTransform, ParameterSet};
use crate::errors::ConfigError;
use crate::Float;
use chrono::{Duration, NaiveDate};
use float_cmp::approx_eq;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

/// Geographic bounding box in degrees.
#[derive(Copy, Clone, PartialEq, PartialOrd, Debug, Default, Serialize, Deserialize)]
pub struct Extent {
    pub west: Float,
    pub east: Float,
    pub south: Float,
    pub north: Float,
}

impl Extent {
    pub fn contains(&self, lon: Float, lat: Float) -> bool {
        (self.west..=self.east).contains(&lon) && (self.south..=self.north).contains(&lat)
    }

    /// Checks if extent follows conventions and limits.
    pub fn check_bounds(&self) -> Result<(), ConfigError> {
        if !(-90.0..=90.0).contains(&self.south) || !(-90.0..=90.0).contains(&self.north) {
            return Err(ConfigError::OutOfBounds(
                "Domain latitudes must be within -90 and 90",
            ));
        }

        if !(-180.0..=180.0).contains(&self.west) || !(-180.0..=180.0).contains(&self.east) {
            return Err(ConfigError::OutOfBounds(
                "Domain longitudes must be within -180 and 180",
            ));
        }

        if self.west >= self.east || self.south >= self.north {
            return Err(ConfigError::OutOfBounds(
                "Domain west/south edges must be smaller than east/north edges",
            ));
        }

        Ok(())
    }
}

/// Inclusive range of simulated days.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Serialize, Deserialize)]
pub struct TimeWindow {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl TimeWindow {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Self {
        TimeWindow { start, end }
    }

    /// Number of days in the window, both ends included.
    pub fn days(&self) -> usize {
        ((self.end - self.start).num_days() + 1).max(0) as usize
    }

    /// Every date of the window in chronological order.
    pub fn dates(&self) -> Vec<NaiveDate> {
        (0..self.days())
            .map(|offset| self.start + Duration::days(offset as i64))
            .collect()
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        (self.start..=self.end).contains(&date)
    }

    /// Position of a date counted from the window start.
    pub fn offset(&self, date: NaiveDate) -> Option<usize> {
        if self.contains(date) {
            Some((date - self.start).num_days() as usize)
        } else {
            None
        }
    }

    pub fn check_bounds(&self) -> Result<(), ConfigError> {
        if self.start > self.end {
            return Err(ConfigError::OutOfBounds(
                "Simulation end date cannot precede its start date",
            ));
        }

        Ok(())
    }
}

/// Single simulated grid cell.
#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
pub struct Pixel {
    pub gid: i64,
    pub lat: Float,
    pub lon: Float,
    pub elev: Float,
    pub depths: Vec<Float>,
}

/// Ordered set of pixels simulated by all members of a run.
#[derive(Clone, Debug)]
pub struct Domain {
    pixels: Vec<Pixel>,
    resolution: Float,
    grid_decimal: usize,
    positions: FxHashMap<i64, usize>,
    bounds: Extent,
}

impl Domain {
    /// Domain constructor, pixels are ordered by grid id.
    pub fn new(mut pixels: Vec<Pixel>, resolution: Float) -> Self {
        pixels.sort_by_key(|p| p.gid);

        let positions = pixels
            .iter()
            .enumerate()
            .map(|(i, p)| (p.gid, i))
            .collect();

        let bounds = pixel_bounds(&pixels);

        Domain {
            pixels,
            resolution,
            grid_decimal: grid_decimal(resolution),
            positions,
            bounds,
        }
    }

    pub fn pixels(&self) -> &[Pixel] {
        &self.pixels
    }

    pub fn len(&self) -> usize {
        self.pixels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pixels.is_empty()
    }

    pub fn resolution(&self) -> Float {
        self.resolution
    }

    pub fn grid_decimal(&self) -> usize {
        self.grid_decimal
    }

    /// Position of the pixel with given grid id in the domain ordering.
    pub fn position(&self, gid: i64) -> Option<usize> {
        self.positions.get(&gid).copied()
    }

    pub fn pixel(&self, gid: i64) -> Option<&Pixel> {
        self.position(gid).map(|i| &self.pixels[i])
    }

    /// Per-pixel file name at the domain coordinate precision,
    /// shared by soil, weather and output files.
    pub fn pixel_file_name(&self, prefix: &str, pixel: &Pixel) -> String {
        format!(
            "{}_{:.*}_{:.*}",
            prefix, self.grid_decimal, pixel.lat, self.grid_decimal, pixel.lon
        )
    }

    /// Bounding box of pixel centres.
    pub fn bounds(&self) -> Extent {
        self.bounds
    }

    /// Number of raster rows and columns covering the domain.
    pub fn shape(&self) -> (usize, usize) {
        if self.pixels.is_empty() {
            return (0, 0);
        }

        let bounds = &self.bounds;
        let nrows = ((bounds.north - bounds.south) / self.resolution).round() as usize + 1;
        let ncols = ((bounds.east - bounds.west) / self.resolution).round() as usize + 1;

        (nrows, ncols)
    }

    /// Raster cell (row, column) of a pixel, rows counted from the north.
    pub fn cell(&self, pixel: &Pixel) -> (usize, usize) {
        let bounds = &self.bounds;
        let half = self.resolution / 2.0;

        let row = ((bounds.north + half - pixel.lat) / self.resolution).floor() as usize;
        let col = ((pixel.lon - bounds.west + half) / self.resolution).floor() as usize;

        (row, col)
    }

    /// Georeference of images rendered over the domain.
    pub fn geotransform(&self) -> GeoTransform {
        let bounds = &self.bounds;
        let half = self.resolution / 2.0;

        GeoTransform {
            upper_left_x: bounds.west - half,
            upper_left_y: bounds.north + half,
            scale_x: self.resolution,
            scale_y: -self.resolution,
        }
    }
}

/// Bounding box of pixel centres, infinite for no pixels.
fn pixel_bounds(pixels: &[Pixel]) -> Extent {
    let mut extent = Extent {
        west: Float::INFINITY,
        east: Float::NEG_INFINITY,
        south: Float::INFINITY,
        north: Float::NEG_INFINITY,
    };

    for p in pixels {
        extent.west = extent.west.min(p.lon);
        extent.east = extent.east.max(p.lon);
        extent.south = extent.south.min(p.lat);
        extent.north = extent.north.max(p.lat);
    }

    extent
}

/// Number of decimals used for pixel coordinates in file names:
/// the precision of the resolution itself plus one.
pub fn grid_decimal(resolution: Float) -> usize {
    let repr = format!("{}", resolution);
    let decimals = repr.split('.').nth(1).map_or(0, str::len);

    decimals.max(1) + 1
}

/// Picks the parameter set with resolution nearest to the requested one.
pub fn select_parameter_set(
    sets: &[ParameterSet],
    resolution: Float,
) -> Result<ParameterSet, ConfigError> {
    sets.iter()
        .filter(|set| set.resolution > 0.0)
        .min_by(|a, b| {
            let da = (a.resolution - resolution).abs();
            let db = (b.resolution - resolution).abs();
            da.partial_cmp(&db).unwrap_or(std::cmp::Ordering::Equal)
        })
        .cloned()
        .ok_or(ConfigError::NoResolution(resolution))
}

/// Checks if two resolutions describe the same grid.
pub fn same_resolution(a: Float, b: Float) -> bool {
    approx_eq!(Float, a, b, epsilon = 1.0e-9)
}

#[cfg(test)]
mod tests {
    use super::{grid_decimal, select_parameter_set, Domain, Pixel, TimeWindow};
    use crate::simulation::store::ParameterSet;
    use chrono::NaiveDate;
    use float_cmp::approx_eq;

    fn pixel(gid: i64, lat: f64, lon: f64) -> Pixel {
        Pixel {
            gid,
            lat,
            lon,
            elev: 100.0,
            depths: vec![0.1, 0.4, 1.0],
        }
    }

    fn parameters(resolution: f64) -> ParameterSet {
        ParameterSet {
            resolution,
            veglib: "veglib".to_string(),
            vegparam: "vegparam".to_string(),
            snowbands: "snowbands".to_string(),
            root_zones: 2,
        }
    }

    #[test]
    fn coordinate_precision() {
        assert_eq!(grid_decimal(0.25), 3);
        assert_eq!(grid_decimal(0.1), 2);
        assert_eq!(grid_decimal(1.0), 2);
        assert_eq!(grid_decimal(0.0625), 5);
    }

    #[test]
    fn resolution_snaps_to_nearest() {
        let sets = vec![parameters(0.25), parameters(0.0625), parameters(0.5)];

        let chosen = select_parameter_set(&sets, 0.3).unwrap();
        assert!(approx_eq!(f64, chosen.resolution, 0.25));

        let chosen = select_parameter_set(&sets, 0.05).unwrap();
        assert!(approx_eq!(f64, chosen.resolution, 0.0625));

        assert!(select_parameter_set(&[], 0.25).is_err());
    }

    #[test]
    fn pixels_map_to_cells() {
        let domain = Domain::new(
            vec![
                pixel(3, 10.125, 20.375),
                pixel(1, 10.375, 20.125),
                pixel(2, 10.125, 20.125),
            ],
            0.25,
        );

        assert_eq!(domain.pixels()[0].gid, 1);
        assert_eq!(domain.shape(), (2, 2));

        let bounds = domain.bounds();
        assert!(approx_eq!(f64, bounds.west, 20.125));
        assert!(approx_eq!(f64, bounds.north, 10.375));

        assert_eq!(domain.cell(domain.pixel(1).unwrap()), (0, 0));
        assert_eq!(domain.cell(domain.pixel(2).unwrap()), (1, 0));
        assert_eq!(domain.cell(domain.pixel(3).unwrap()), (1, 1));
        assert_eq!(
            domain.pixel_file_name("data", domain.pixel(3).unwrap()),
            "data_10.125_20.375"
        );

        let transform = domain.geotransform();
        assert!(approx_eq!(f64, transform.upper_left_x, 20.0));
        assert!(approx_eq!(f64, transform.upper_left_y, 10.5));

        let empty = Domain::new(vec![], 0.25);
        assert_eq!(empty.shape(), (0, 0));
    }

    #[test]
    fn window_days() {
        let window = TimeWindow::new(
            NaiveDate::from_ymd_opt(2020, 2, 27).unwrap(),
            NaiveDate::from_ymd_opt(2020, 3, 2).unwrap(),
        );

        assert_eq!(window.days(), 5);
        assert_eq!(window.dates()[2], NaiveDate::from_ymd_opt(2020, 2, 29).unwrap());
        assert_eq!(window.offset(NaiveDate::from_ymd_opt(2020, 3, 2).unwrap()), Some(4));
        assert_eq!(window.offset(NaiveDate::from_ymd_opt(2020, 3, 3).unwrap()), None);
    }
}
