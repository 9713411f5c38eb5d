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

//! Per-cell vegetation and snow band parameters needed to aggregate
//! the tiles of a state file to cell values.

use crate::constants::LAI_MONTHS;
use crate::errors::AssimilationError;
use crate::Float;
use rustc_hash::FxHashMap;
use std::fs;
use std::path::Path;

/// Vegetation class of a cell with its area fraction.
#[derive(Clone, Copy, PartialEq, Debug)]
pub struct VegetationTile {
    pub class: i32,
    pub cv: Float,
}

/// Vegetation classes and snow band area fractions of a cell.
#[derive(Clone, PartialEq, Debug, Default)]
pub struct CellParameters {
    pub vegetation: Vec<VegetationTile>,
    pub bands: Vec<Float>,
}

impl CellParameters {
    /// Area fractions of every vegetation tile in state file order,
    /// the bare soil remainder last.
    pub fn tile_fractions(&self) -> Vec<Float> {
        let covered: Float = self.vegetation.iter().map(|v| v.cv).sum();

        self.vegetation
            .iter()
            .map(|v| v.cv)
            .chain(std::iter::once((1.0 - covered).max(0.0)))
            .collect()
    }
}

/// Parameter tables of all cells, by grid id.
#[derive(Clone, PartialEq, Debug, Default)]
pub struct StateTables {
    cells: FxHashMap<i64, CellParameters>,
}

impl StateTables {
    /// Reads the vegetation parameter and snow band files of a parameter set.
    pub fn read(vegparam: &Path, snowbands: &Path) -> Result<Self, AssimilationError> {
        let vegetation = fs::read_to_string(vegparam)?;
        let bands = fs::read_to_string(snowbands)?;

        StateTables::parse(&vegetation, &bands)
    }

    pub fn parse(vegparam: &str, snowbands: &str) -> Result<Self, AssimilationError> {
        let mut cells: FxHashMap<i64, CellParameters> = FxHashMap::default();

        for (gid, vegetation) in parse_vegetation(vegparam)? {
            cells.entry(gid).or_default().vegetation = vegetation;
        }

        for (gid, bands) in parse_snow_bands(snowbands)? {
            cells.entry(gid).or_default().bands = bands;
        }

        Ok(StateTables { cells })
    }

    pub fn cell(&self, gid: i64) -> Option<&CellParameters> {
        self.cells.get(&gid)
    }
}

fn malformed(table: &str, reason: &'static str) -> AssimilationError {
    AssimilationError::MalformedTable(table.to_string(), reason)
}

fn numbers(line: &str) -> Option<Vec<Float>> {
    line.split_whitespace().map(|f| f.parse().ok()).collect()
}

/// Vegetation table: a `gid nveg` line per cell, followed by a
/// `class cv root...` line and a monthly LAI line for every class.
fn parse_vegetation(text: &str) -> Result<Vec<(i64, Vec<VegetationTile>)>, AssimilationError> {
    let mut lines = text.lines().filter(|l| !l.trim().is_empty());
    let mut cells = vec![];

    while let Some(header) = lines.next() {
        let header = numbers(header).ok_or_else(|| malformed("vegetation", "non-numeric cell header"))?;

        if header.len() < 2 {
            return Err(malformed("vegetation", "cell header needs a grid id and class count"));
        }

        let (gid, nveg) = (header[0] as i64, header[1] as usize);
        let mut vegetation = Vec::with_capacity(nveg);

        for _ in 0..nveg {
            let class = lines
                .next()
                .and_then(numbers)
                .filter(|f| f.len() >= 2)
                .ok_or_else(|| malformed("vegetation", "missing vegetation class line"))?;

            let lai = lines.next().and_then(numbers).map_or(0, |f| f.len());
            if lai != LAI_MONTHS {
                return Err(malformed("vegetation", "vegetation class needs a monthly LAI line"));
            }

            vegetation.push(VegetationTile {
                class: class[0] as i32,
                cv: class[1],
            });
        }

        cells.push((gid, vegetation));
    }

    Ok(cells)
}

/// Snow band table: `gid` followed by area fractions,
/// elevations and precipitation factors of every band.
fn parse_snow_bands(text: &str) -> Result<Vec<(i64, Vec<Float>)>, AssimilationError> {
    text.lines()
        .filter(|l| !l.trim().is_empty())
        .map(|line| {
            let fields = numbers(line).ok_or_else(|| malformed("snow band", "non-numeric value"))?;

            if fields.len() < 4 || (fields.len() - 1) % 3 != 0 {
                return Err(malformed("snow band", "line needs three values per band"));
            }

            let nbands = (fields.len() - 1) / 3;
            Ok((fields[0] as i64, fields[1..=nbands].to_vec()))
        })
        .collect()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::StateTables;
    use float_cmp::approx_eq;

    pub const VEGPARAM: &str = "\
1 2
4 0.6 0.1 0.6 1.0 0.4
0.5 0.5 0.6 0.8 1.2 1.6 1.8 1.6 1.2 0.8 0.6 0.5
10 0.3 0.1 0.6 1.0 0.4
0.2 0.2 0.3 0.4 0.6 0.8 0.9 0.8 0.6 0.4 0.3 0.2
2 0
";

    pub const SNOWBANDS: &str = "\
1 0.25 0.75 500 900 1.0 1.0
2 0.5 0.5 600 700 1.0 1.0
";

    #[test]
    fn cells_and_bare_soil() {
        let tables = StateTables::parse(VEGPARAM, SNOWBANDS).unwrap();

        let first = tables.cell(1).unwrap();
        assert_eq!(first.vegetation.len(), 2);
        assert_eq!(first.vegetation[1].class, 10);
        assert_eq!(first.bands, vec![0.25, 0.75]);

        let fractions = first.tile_fractions();
        assert_eq!(fractions.len(), 3);
        assert!(approx_eq!(f64, fractions[2], 0.1, epsilon = 1.0e-12));

        let bare = tables.cell(2).unwrap();
        assert!(bare.vegetation.is_empty());
        assert_eq!(bare.tile_fractions(), vec![1.0]);
        assert!(tables.cell(3).is_none());
    }

    #[test]
    fn missing_lai_is_malformed() {
        let truncated = "1 1\n4 1.0 0.1 0.6 1.0 0.4\n";
        assert!(StateTables::parse(truncated, SNOWBANDS).is_err());
        assert!(StateTables::parse(VEGPARAM, "1 0.5 0.5\n").is_err());
    }
}
