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

//! Hydrologic Ensemble Assimilation System (HEAS) orchestrates
//! ensembles of a distributed land-surface hydrology model
//! over a basin domain.
//!
//! Each ensemble member is driven with daily meteorological forcing
//! retrieved tile by tile from a geospatial raster store, runs the
//! land-surface model as an external process, can have observation-derived
//! corrections injected into its saved state between update windows, and
//! has its time-varying output encoded back into dated raster tables.
//!
//! The model physics are not part of this program: the land-surface
//! model is an executable consuming and producing flat files.

mod constants;
mod errors;
mod simulation;


use cap::Cap;
use env_logger::Env;
use log::{error, info};
use std::alloc;

type Float = f64;

/// Global allocator used by the program.
///
/// Use of static global allocator allows for capping the memory to the limit set by user
/// in configuration file and in effect provide better [OOM error](https://en.wikipedia.org/wiki/Out_of_memory) handling.
#[global_allocator]
static ALLOCATOR: Cap<alloc::System> = Cap::new(alloc::System, usize::MAX);

/// The main program function.
/// Prepares the runtime environment and calls the [`simulation::main`].
///
/// To provide meaningful and high-quality error messages the `env_logger`
/// needs to be initiated before any log messages are possible to occur.
fn main() {
    #[cfg(not(feature = "debug"))]
    let logger_env = Env::new().filter_or("HEAS_LOG_LEVEL", "info");

    #[cfg(feature = "debug")]
    let logger_env = Env::new().filter_or("HEAS_LOG_LEVEL", "debug");

    env_logger::Builder::from_env(logger_env)
        .format_timestamp_millis()
        .init();

    match simulation::main() {
        Ok(_) => info!("Simulation finished. Check the store and the output directory."),
        Err(err) => {
            error!("Simulation failed with error: {}", err);
            std::process::exit(1);
        }
    }
}
