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

//! Module containing the ensemble simulation engine.
//!
//! The engine reads the configuration, opens the geospatial store and
//! picks the model parameter set matching the requested resolution.
//! Depending on the configuration it then runs a single deterministic
//! simulation, an ensemble of simulations or an ensemble with state
//! assimilation (see [`nowcast`]), and finally writes the store back to disk.

pub mod assimilation;
pub mod configuration;
pub mod domain;
pub mod encoder;
pub mod ensemble;
pub mod forcing;
pub mod instance;
mod nowcast;
pub mod store;

use crate::{errors::ModelError, Float, ALLOCATOR};
use configuration::{Config, ModelOptions, Paths};
use domain::{same_resolution, select_parameter_set, Extent};
use ensemble::{ForecastGenerator, Generators};
use forcing::ForcingSources;
use instance::DroughtIndex;
use log::{debug, info, warn};
use rayon::{ThreadPool, ThreadPoolBuilder};
use std::path::Path;
use std::sync::Arc;
use store::{MemoryStore, ParameterSet, RasterStore};

/// Main simulation function, responsible for all run steps.
///
/// Output and state saved before a failing step stay in the store.
pub fn main() -> Result<(), ModelError> {
    info!("Preparing the simulation core");

    let core = Core::new()?;
    let outcome = run(&core);

    debug!("Writing store archive");
    core.store.flush()?;

    outcome
}

/// Runs the deterministic, ensemble or assimilation simulation of the core.
pub fn run(core: &Core) -> Result<(), ModelError> {
    nowcast::run(core)
}

/// Everything a simulation instance needs to know about its run.
#[derive(Debug)]
pub struct RunContext {
    /// Simulation name, also the schema of its store tables.
    pub name: String,
    pub store: Arc<dyn RasterStore>,
    pub parameters: ParameterSet,
    pub paths: Paths,
    pub model: ModelOptions,
    pub extent: Extent,
    pub threadpool: Arc<ThreadPool>,
}

impl RunContext {
    /// Resolution of the model parameters in degrees.
    pub fn resolution(&self) -> Float {
        self.parameters.resolution
    }
}

/// Structure containing the prepared run.
///
/// Before the simulation can start the configuration has to be
/// checked, the store opened and forcing datasets resolved.
///
/// No forecast generator or drought index is built in. They have to be
/// registered with [`Core::register_generator`] and [`Core::add_drought_index`]
/// before the run, otherwise the `external` forcing strategy fails and
/// drought index variables are skipped.
pub struct Core {
    pub config: Config,
    pub store: Arc<MemoryStore>,
    pub context: Arc<RunContext>,
    pub sources: ForcingSources,
    pub generators: Generators,
    pub drought: Vec<Box<dyn DroughtIndex>>,
}

impl Core {
    /// Model [`Core`] constructor reading `config.yaml`
    /// and limiting the heap memory.
    pub fn new() -> Result<Self, ModelError> {
        debug!("Reading configuration from config.yaml");
        let config = Config::new_from_file(Path::new("config.yaml"))?;

        debug!("Setting memory limit");
        ALLOCATOR
            .set_limit(config.resources.memory * 1024 * 1024)
            .map_err(|_| ModelError::MemoryLimit(config.resources.memory))?;

        debug!("Opening store in {:?}", config.store.path);
        let store = MemoryStore::open(&config.store.path, config.store.tile_size)?;

        Core::with_store(config, Arc::new(store))
    }

    pub fn with_store(config: Config, store: Arc<MemoryStore>) -> Result<Self, ModelError> {
        let sources = ForcingSources::from_options(&config.forcing)?;

        debug!("Setting up ThreadPool");
        let threadpool = ThreadPoolBuilder::new()
            .num_threads(config.resources.threads as usize)
            .stack_size(2 * 1024 * 1024)
            .build()?;

        let resolution = config.domain.resolution.degrees()?;
        let parameters = select_parameter_set(&store.parameter_sets()?, resolution)?;

        if !same_resolution(parameters.resolution, resolution) {
            warn!(
                "No parameters at resolution {}, using nearest available {}",
                resolution, parameters.resolution
            );
        }

        let context = Arc::new(RunContext {
            name: config.name.clone(),
            store: Arc::clone(&store) as Arc<dyn RasterStore>,
            parameters,
            paths: config.paths.clone(),
            model: config.model.clone(),
            extent: config.domain.extent,
            threadpool: Arc::new(threadpool),
        });

        Ok(Core {
            config,
            store,
            context,
            sources,
            generators: Generators::default(),
            drought: vec![],
        })
    }

    /// Makes a generator available to the `external` forcing strategy under a name.
    pub fn register_generator(&mut self, name: &str, generator: Box<dyn ForecastGenerator>) {
        self.generators.register(name, generator);
    }

    /// Drought index saved when its name is among the output variables.
    pub fn add_drought_index(&mut self, index: Box<dyn DroughtIndex>) {
        self.drought.push(index);
    }
}
