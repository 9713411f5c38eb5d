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

//! Module containing constants used by the model.

/// Sentinel stored in rasters and arrays for cells without data.
pub const NODATA: f32 = -9999.0;

/// Output variables the model reports once per soil layer.
pub const LAYERED_VARIABLES: [&str; 4] = ["soil_moist", "soil_temp", "smliqfrac", "smfrozfrac"];

/// Number of leading date columns (year, month, day) in daily model output files.
pub const OUTPUT_DATE_COLUMNS: usize = 3;

/// Name of the model global control file inside a working directory.
pub const CONTROL_FILE: &str = "global.txt";

/// Name of the soil parameter file inside a working directory.
pub const SOIL_FILE: &str = "soil.txt";

/// Sub-directory holding per-pixel weather files.
pub const FORCING_DIR: &str = "forcings";

/// Prefix of per-pixel weather files.
pub const FORCING_PREFIX: &str = "data";

/// Sub-directory the model writes its per-pixel output files to.
pub const OUTPUT_DIR: &str = "output";

/// Prefix the model adds to saved state files, followed by `_YYYYMMDD`.
pub const STATE_PREFIX: &str = "state";

/// Number of monthly LAI values following each vegetation class line.
pub const LAI_MONTHS: usize = 12;

/// Number of values in a snow record of a state file (without the tile labels).
pub const SNOW_RECORD_LEN: usize = 11;

/// Position of snow water equivalent inside a snow record.
pub const SWQ_POSITION: usize = 3;
