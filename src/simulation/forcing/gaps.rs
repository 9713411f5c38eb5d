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

//! Completion of pixel × day forcing grids.
//!
//! Missing entries are `NaN` until filled. Filling never fails:
//! gaps are carried forward from the last known day, leading gaps
//! take the first known value and a pixel without any value holds
//! the no-data sentinel.

use crate::constants::NODATA;
use crate::simulation::domain::{Domain, TimeWindow};
use crate::Float;
use chrono::NaiveDate;
use ndarray::Array2;

/// Pixel-days filled by each completion step of one variable.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Default)]
pub struct VariableGaps {
    pub nearest: usize,
    pub forward: usize,
    pub backward: usize,
    pub empty_pixels: usize,
}

impl VariableGaps {
    pub fn is_complete(&self) -> bool {
        *self == VariableGaps::default()
    }
}

/// Empty (all `NaN`) grid with one row per domain pixel
/// and one column per window day.
pub fn empty_grid(domain: &Domain, window: &TimeWindow) -> Array2<Float> {
    Array2::from_elem((domain.len(), window.days()), Float::NAN)
}

/// Places values into the grid, ignoring pixels and dates outside it.
/// When a pixel-day is present more than once the first value is kept.
/// Returns the number of filled pixel-days.
pub fn place(
    grid: &mut Array2<Float>,
    values: &[(i64, NaiveDate, Float)],
    domain: &Domain,
    window: &TimeWindow,
) -> usize {
    let mut placed = 0;

    for (gid, date, value) in values {
        let cell = domain
            .position(*gid)
            .zip(window.offset(*date))
            .and_then(|(p, d)| grid.get_mut((p, d)));

        if let Some(cell) = cell {
            if cell.is_nan() && !value.is_nan() {
                *cell = *value;
                placed += 1;
            }
        }
    }

    placed
}

/// Positions of pixels without a single value.
pub fn empty_pixels(grid: &Array2<Float>) -> Vec<usize> {
    grid.outer_iter()
        .enumerate()
        .filter(|(_, series)| series.iter().all(|v| v.is_nan()))
        .map(|(i, _)| i)
        .collect()
}

/// Fills every remaining gap in place.
pub fn fill(grid: &mut Array2<Float>, gaps: &mut VariableGaps) {
    for mut series in grid.outer_iter_mut() {
        let first = series.iter().position(|v| !v.is_nan());

        let first = match first {
            Some(first) => first,
            None => {
                series.fill(Float::from(NODATA));
                gaps.empty_pixels += 1;
                continue;
            }
        };

        let leading = series[first];
        for value in series.iter_mut().take(first) {
            *value = leading;
            gaps.backward += 1;
        }

        let mut last = leading;
        for value in series.iter_mut().skip(first) {
            if value.is_nan() {
                *value = last;
                gaps.forward += 1;
            } else {
                last = *value;
            }
        }
    }
}
