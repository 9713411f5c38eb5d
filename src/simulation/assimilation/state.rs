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

//! Text snapshot of model state written at the end of a window.
//!
//! Layout of the snapshot:
//!
//! ```text
//! <date line>
//! nlayer nnodes
//! gid nveg nbands                      (for every cell)
//! <node thickness line>
//! <node depth line>
//! veg band moist×nlayer ice×nlayer     (for every tile: nveg + 1 vegetation
//! veg band <11 snow values>             tiles, bare soil last, times nbands)
//! veg band T×nnodes
//! ```
//!
//! Only lines holding corrected values are rendered again when the
//! snapshot is written, every other line is kept byte for byte.

use super::tables::StateTables;
use crate::constants::{SNOW_RECORD_LEN, SWQ_POSITION};
use crate::errors::{AssimilationError, ConfigError};
use crate::Float;
use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

/// Fields labelling a tile line (vegetation and band index).
const TILE_LABELS: usize = 2;

/// State variable observations can correct.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum StateVariable {
    /// Liquid soil moisture of a 1-based soil layer.
    SoilMoisture { layer: usize },
    /// Snow water equivalent of the ground snowpack.
    Swe,
}

impl StateVariable {
    pub fn new(variable: &str, layer: usize) -> Result<Self, ConfigError> {
        match variable.trim().to_lowercase().as_str() {
            "soil_moist" | "soil_moisture" => Ok(StateVariable::SoilMoisture { layer }),
            "swq" | "swe" => Ok(StateVariable::Swe),
            other => Err(ConfigError::UnknownStateVariable(other.to_string())),
        }
    }

    pub fn layer(&self) -> Option<usize> {
        match self {
            StateVariable::SoilMoisture { layer } => Some(*layer),
            StateVariable::Swe => None,
        }
    }
}

/// Line numbers of one vegetation tile in one snow band.
#[derive(Clone, Copy, PartialEq, Debug)]
struct Tile {
    veg: usize,
    band: usize,
    soil: usize,
    snow: usize,
}

#[derive(Clone, PartialEq, Debug)]
struct CellState {
    gid: i64,
    header: usize,
    nveg: usize,
    nbands: usize,
    tiles: Vec<Tile>,
}

/// Parsed state snapshot of one ensemble member.
#[derive(Clone, PartialEq, Debug)]
pub struct StateFile {
    lines: Vec<String>,
    nlayers: usize,
    nnodes: usize,
    cells: Vec<CellState>,
    dirty: BTreeSet<usize>,
}

fn malformed(line: usize, reason: &'static str) -> AssimilationError {
    AssimilationError::MalformedState(line + 1, reason)
}

fn integers(line: &str) -> Option<Vec<i64>> {
    line.split_whitespace().map(|f| f.parse().ok()).collect()
}

impl StateFile {
    pub fn read(path: &Path) -> Result<Self, AssimilationError> {
        StateFile::parse(&fs::read_to_string(path)?)
    }

    pub fn parse(text: &str) -> Result<Self, AssimilationError> {
        let lines: Vec<String> = text.split('\n').map(String::from).collect();

        let dimensions = lines
            .get(1)
            .and_then(|l| integers(l))
            .filter(|d| d.len() == 2 && d.iter().all(|v| *v > 0))
            .ok_or_else(|| malformed(1, "expected soil layer and node counts"))?;

        let (nlayers, nnodes) = (dimensions[0] as usize, dimensions[1] as usize);

        let mut state = StateFile {
            lines,
            nlayers,
            nnodes,
            cells: vec![],
            dirty: BTreeSet::new(),
        };

        let mut cursor = 2;

        while cursor < state.lines.len() {
            if state.lines[cursor].trim().is_empty() {
                cursor += 1;
                continue;
            }

            let cell = state.parse_cell(cursor)?;
            cursor = cell.header + 3 + (cell.nveg + 1) * cell.nbands * 3;
            state.cells.push(cell);
        }

        Ok(state)
    }

    /// Cell starting at the header line, with its node lines and tiles.
    fn parse_cell(&self, header: usize) -> Result<CellState, AssimilationError> {
        let fields = integers(&self.lines[header])
            .filter(|f| f.len() == 3 && f[1] >= 0 && f[2] > 0)
            .ok_or_else(|| malformed(header, "expected cell id, vegetation and band counts"))?;

        let (gid, nveg, nbands) = (fields[0], fields[1] as usize, fields[2] as usize);
        let mut tiles = Vec::with_capacity((nveg + 1) * nbands);
        let mut line = header + 3;

        for veg in 0..=nveg {
            for band in 0..nbands {
                self.check_tile_line(line, veg, band, TILE_LABELS + 2 * self.nlayers)?;
                self.check_tile_line(line + 1, veg, band, TILE_LABELS + SNOW_RECORD_LEN)?;
                self.check_tile_line(line + 2, veg, band, TILE_LABELS + self.nnodes)?;

                tiles.push(Tile {
                    veg,
                    band,
                    soil: line,
                    snow: line + 1,
                });

                line += 3;
            }
        }

        Ok(CellState {
            gid,
            header,
            nveg,
            nbands,
            tiles,
        })
    }

    fn check_tile_line(&self, line: usize, veg: usize, band: usize, len: usize) -> Result<(), AssimilationError> {
        let fields: Vec<&str> = self
            .lines
            .get(line)
            .ok_or_else(|| malformed(line, "state ends inside a cell"))?
            .split_whitespace()
            .collect();

        if fields.len() < len {
            return Err(malformed(line, "tile record is too short"));
        }

        if fields[0].parse::<usize>().ok() != Some(veg) || fields[1].parse::<usize>().ok() != Some(band) {
            return Err(malformed(line, "tile labels out of order"));
        }

        Ok(())
    }

    pub fn nlayers(&self) -> usize {
        self.nlayers
    }

    pub fn gids(&self) -> Vec<i64> {
        self.cells.iter().map(|c| c.gid).collect()
    }

    /// Line and field holding the variable in a tile.
    fn locate(&self, tile: &Tile, variable: StateVariable) -> (usize, usize) {
        match variable {
            StateVariable::SoilMoisture { layer } => (tile.soil, TILE_LABELS + layer - 1),
            StateVariable::Swe => (tile.snow, TILE_LABELS + SWQ_POSITION),
        }
    }

    fn field(&self, line: usize, field: usize) -> Result<Float, AssimilationError> {
        self.lines[line]
            .split_whitespace()
            .nth(field)
            .and_then(|v| v.parse().ok())
            .ok_or_else(|| malformed(line, "non-numeric state value"))
    }

    fn set_field(&mut self, line: usize, field: usize, value: Float) {
        let mut fields: Vec<String> = self.lines[line]
            .split_whitespace()
            .map(String::from)
            .collect();

        if let Some(slot) = fields.get_mut(field) {
            *slot = format!("{:.4}", value);
        }

        self.lines[line] = fields.join(" ");
        self.dirty.insert(line);
    }

    /// Area-weighted value of the variable over the cell.
    pub fn cell_value(
        &self,
        gid: i64,
        variable: StateVariable,
        tables: &StateTables,
    ) -> Result<Float, AssimilationError> {
        let (cell, weights) = self.cell_weights(gid, variable, tables)?;
        let mut total = 0.0;

        for (tile, weight) in cell.tiles.iter().zip(weights) {
            let (line, field) = self.locate(tile, variable);
            total += weight * self.field(line, field)?;
        }

        Ok(total)
    }

    /// Tiles of a cell with their area weights (vegetation × band fraction).
    fn cell_weights(
        &self,
        gid: i64,
        variable: StateVariable,
        tables: &StateTables,
    ) -> Result<(&CellState, Vec<Float>), AssimilationError> {
        let cell = self
            .cells
            .iter()
            .find(|c| c.gid == gid)
            .ok_or(AssimilationError::UnknownCell(gid, "state"))?;

        let parameters = tables
            .cell(gid)
            .ok_or(AssimilationError::UnknownCell(gid, "vegetation"))?;

        if parameters.vegetation.len() != cell.nveg {
            return Err(AssimilationError::LayoutMismatch(
                gid,
                cell.nveg,
                parameters.vegetation.len(),
            ));
        }

        if parameters.bands.len() != cell.nbands {
            return Err(malformed(cell.header, "band count differs from the snow band table"));
        }

        if let Some(layer) = variable.layer() {
            if layer == 0 || layer > self.nlayers {
                return Err(malformed(1, "corrected soil layer is not in the state"));
            }
        }

        let fractions = parameters.tile_fractions();
        let weights = cell
            .tiles
            .iter()
            .map(|t| fractions[t.veg] * parameters.bands[t.band])
            .collect();

        Ok((cell, weights))
    }

    /// Moves the cell value of the variable to the target by adding the
    /// same increment to every tile, keeping tiles non-negative.
    pub fn correct(
        &mut self,
        gid: i64,
        variable: StateVariable,
        target: Float,
        tables: &StateTables,
    ) -> Result<(), AssimilationError> {
        let (cell, weights) = self.cell_weights(gid, variable, tables)?;
        let total: Float = weights.iter().sum();

        if total <= 0.0 {
            return Ok(());
        }

        let mut current = Vec::with_capacity(cell.tiles.len());
        let mut aggregate = 0.0;

        for (tile, weight) in cell.tiles.iter().zip(&weights) {
            let (line, field) = self.locate(tile, variable);
            let value = self.field(line, field)?;

            aggregate += weight * value;
            current.push((line, field, value));
        }

        let increment = (target - aggregate) / total;

        for (line, field, value) in current {
            self.set_field(line, field, (value + increment).max(0.0));
        }

        Ok(())
    }

    pub fn is_modified(&self) -> bool {
        !self.dirty.is_empty()
    }

    pub fn render(&self) -> String {
        self.lines.join("\n")
    }

    pub fn write(&self, path: &Path) -> Result<(), AssimilationError> {
        fs::write(path, self.render())?;
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::{StateFile, StateVariable};
    use crate::simulation::assimilation::tables::tests::{SNOWBANDS, VEGPARAM};
    use crate::simulation::assimilation::tables::StateTables;
    use float_cmp::approx_eq;

    /// Snapshot of cells 1 (two classes, two bands) and 2 (bare, two bands)
    /// with two soil layers and three nodes.
    pub fn snapshot() -> String {
        let mut text = String::from("2021 01 05\n2 3\n");

        for (gid, nveg) in [(1, 2), (2, 0)] {
            text.push_str(&format!("{} {} 2\n0.1 0.3 0.6\n0.1 0.4 1.0\n", gid, nveg));

            for veg in 0..=nveg {
                for band in 0..2 {
                    text.push_str(&format!("{} {} 0.25 0.30 0.0 0.0\n", veg, band));
                    text.push_str(&format!("{} {} 0 0 0.5 40.0 0 0 0 0 0 0 0\n", veg, band));
                    text.push_str(&format!("{} {} 5.0 4.0 3.0\n", veg, band));
                }
            }
        }

        text
    }

    #[test]
    fn snapshot_round_trips_untouched() {
        let text = snapshot();
        let state = StateFile::parse(&text).unwrap();

        assert_eq!(state.nlayers(), 2);
        assert_eq!(state.gids(), vec![1, 2]);
        assert!(!state.is_modified());
        assert_eq!(state.render(), text);
    }

    #[test]
    fn correction_reaches_cell_target() {
        let tables = StateTables::parse(VEGPARAM, SNOWBANDS).unwrap();
        let mut state = StateFile::parse(&snapshot()).unwrap();
        let layer = StateVariable::SoilMoisture { layer: 1 };

        assert!(approx_eq!(f64, state.cell_value(1, layer, &tables).unwrap(), 0.25, epsilon = 1.0e-9));

        state.correct(1, layer, 0.35, &tables).unwrap();
        assert!(approx_eq!(f64, state.cell_value(1, layer, &tables).unwrap(), 0.35, epsilon = 1.0e-9));

        // other layers, variables and cells are unchanged
        let second = StateVariable::SoilMoisture { layer: 2 };
        assert!(approx_eq!(f64, state.cell_value(1, second, &tables).unwrap(), 0.30, epsilon = 1.0e-9));
        assert!(approx_eq!(f64, state.cell_value(2, layer, &tables).unwrap(), 0.25, epsilon = 1.0e-9));

        let rendered = state.render();
        assert!(rendered.contains("\n0 0 0.3500 0.30 0.0 0.0\n"));
        assert!(rendered.contains("\n0 0 0 0 0.5 40.0 0 0 0 0 0 0 0\n"));
    }

    #[test]
    fn snow_is_clamped_at_zero() {
        let tables = StateTables::parse(VEGPARAM, SNOWBANDS).unwrap();
        let mut state = StateFile::parse(&snapshot()).unwrap();

        state.correct(2, StateVariable::Swe, -3.0, &tables).unwrap();
        assert!(approx_eq!(f64, state.cell_value(2, StateVariable::Swe, &tables).unwrap(), 0.0));
    }

    #[test]
    fn layout_must_match_tables() {
        let tables = StateTables::parse("1 1\n4 1.0 0.1 0.6 1.0 0.4\n1 1 1 1 1 1 1 1 1 1 1 1\n", SNOWBANDS).unwrap();
        let mut state = StateFile::parse(&snapshot()).unwrap();

        assert!(state
            .correct(1, StateVariable::Swe, 1.0, &tables)
            .is_err());
        assert!(StateFile::parse("2021 01 05\n2 3\n1 0 1\n").is_err());
        assert!(StateVariable::new("runoff", 1).is_err());
    }
}
