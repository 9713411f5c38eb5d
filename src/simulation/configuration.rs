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

//! Module responsible for parsing and checking the configuration file.
//!
//! The configuration file uses [YAML](https://en.wikipedia.org/wiki/YAML)
//! and `serde` to enforce strong typing and automatic type checking.
//! Every option the system recognises is a field of one of the structures
//! below, optional fields have explicit defaults and all values are
//! checked once, right after the file is read.
//!
//! The structures and their fields in this module directly correspond to
//! the fields inside `config.yaml` so you can check this documentation
//! for more details how to set the config file.

use super::assimilation::StateVariable;
use super::domain::{Extent, TimeWindow};
use crate::errors::ConfigError;
use crate::Float;
use serde::Deserialize;
use std::{
    fs,
    path::{Path, PathBuf},
};

/// Location and tiling of the geospatial store.
#[derive(Clone, PartialEq, Debug, Deserialize)]
pub struct Store {
    /// Archive directory of the store. Created if it does not exist.
    pub path: PathBuf,

    /// _(Optional)_ Size (columns, rows) of tiles images are cut into
    /// when loaded into the store.
    ///
    /// Defaults to `(100, 100)`. Cannot be smaller than `1`.
    #[serde(default = "Store::default_tile_size")]
    pub tile_size: (usize, usize),
}

impl Store {
    fn default_tile_size() -> (usize, usize) {
        (100, 100)
    }

    pub fn check_bounds(&self) -> Result<(), ConfigError> {
        if self.tile_size.0 < 1 || self.tile_size.1 < 1 {
            return Err(ConfigError::OutOfBounds(
                "Store tile size cannot be smaller than 1",
            ));
        }

        Ok(())
    }
}

/// Filesystem locations used by every component.
#[derive(Clone, PartialEq, Debug, Deserialize)]
pub struct Paths {
    /// Land-surface model executable.
    pub executable: PathBuf,

    /// Directory with the model parameter files
    /// (vegetation library, vegetation parameters, snow bands).
    pub data: PathBuf,

    /// _(Optional)_ Directory in which member working directories are created.
    ///
    /// Defaults to the current directory.
    #[serde(default = "Paths::default_work")]
    pub work: PathBuf,
}

impl Paths {
    fn default_work() -> PathBuf {
        PathBuf::from(".")
    }
}

/// Spatial resolution, either in degrees or as a distance
/// like `5km` or `500m` converted with 110 km per degree.
#[derive(Clone, PartialEq, Debug, Deserialize)]
#[serde(untagged)]
pub enum Resolution {
    Degrees(Float),
    Distance(String),
}

impl Resolution {
    /// Resolution in degrees.
    pub fn degrees(&self) -> Result<Float, ConfigError> {
        let degrees = match self {
            Resolution::Degrees(degrees) => *degrees,
            Resolution::Distance(text) => parse_distance(text).ok_or(ConfigError::OutOfBounds(
                "Resolution must be a number of degrees or a distance in km or m",
            ))?,
        };

        if degrees <= 0.0 {
            return Err(ConfigError::OutOfBounds("Resolution must be positive"));
        }

        Ok(degrees)
    }
}

fn parse_distance(text: &str) -> Option<Float> {
    let text = text.trim().to_lowercase();
    let split = text.find(|c: char| !c.is_ascii_digit() && c != '.')?;
    let (value, unit) = text.split_at(split);
    let value: Float = value.parse().ok()?;

    let scale = match unit.chars().next()? {
        'k' => 1.0,
        'm' => 1000.0,
        _ => return None,
    };

    Some(value / (110.0 * scale))
}

/// Fields with simulated domain information.
#[derive(Clone, PartialEq, Debug, Deserialize)]
pub struct DomainOptions {
    /// Requested resolution, snapped to the nearest resolution
    /// with parameter files in the store.
    pub resolution: Resolution,

    /// Bounding box of the simulated basin. Every soil catalog cell
    /// with its centre inside the box is simulated.
    pub extent: Extent,
}

/// Datasets (store tables) meteorological forcing is read from.
#[derive(Clone, PartialEq, Debug, Default, Deserialize)]
pub struct ForcingOptions {
    /// Precipitation dataset names (tables of the `precip` schema).
    /// More than one dataset turns a nowcast into an ensemble.
    #[serde(default)]
    pub precip: Vec<String>,

    /// Temperature dataset, read from both `tmax` and `tmin` schemas.
    #[serde(default)]
    pub temperature: Option<String>,

    /// Wind dataset (table of the `wind` schema).
    #[serde(default)]
    pub wind: Option<String>,
}

/// Land-surface model settings.
#[derive(Clone, PartialEq, Debug, Deserialize)]
pub struct ModelOptions {
    /// _(Optional)_ Number of soil layers. Defaults to `3`.
    #[serde(default = "ModelOptions::default_nlayers")]
    pub nlayers: usize,

    /// _(Optional)_ Number of soil thermal nodes. Defaults to `3`.
    #[serde(default = "ModelOptions::default_nodes")]
    pub nodes: usize,

    /// _(Optional)_ Model time step in hours. Values below 24
    /// switch on full energy balance and frozen soil.
    ///
    /// Defaults to `24`. Must be within `1` and `24`.
    #[serde(default = "ModelOptions::default_time_step")]
    pub time_step: u32,

    /// _(Optional)_ Warm-up years excluded from saved output. Defaults to `0`.
    #[serde(default)]
    pub skip_years: u32,

    /// _(Optional)_ Seconds after which a model process is killed.
    /// Without it the process is waited for indefinitely.
    #[serde(default)]
    pub timeout: Option<u64>,
}

impl ModelOptions {
    fn default_nlayers() -> usize {
        3
    }

    fn default_nodes() -> usize {
        3
    }

    fn default_time_step() -> u32 {
        24
    }

    pub fn check_bounds(&self) -> Result<(), ConfigError> {
        if self.nlayers < 1 || self.nodes < 1 {
            return Err(ConfigError::OutOfBounds(
                "Number of soil layers and thermal nodes cannot be less than 1",
            ));
        }

        if !(1..=24).contains(&self.time_step) {
            return Err(ConfigError::OutOfBounds(
                "Model time step must be within 1 and 24 hours",
            ));
        }

        if self.timeout == Some(0) {
            return Err(ConfigError::OutOfBounds(
                "Model timeout cannot be 0 seconds",
            ));
        }

        Ok(())
    }
}

impl Default for ModelOptions {
    fn default() -> Self {
        ModelOptions {
            nlayers: ModelOptions::default_nlayers(),
            nodes: ModelOptions::default_nodes(),
            time_step: ModelOptions::default_time_step(),
            skip_years: 0,
            timeout: None,
        }
    }
}

/// Model state handling.
#[derive(Clone, PartialEq, Debug, Default, Deserialize)]
pub struct StateOptions {
    /// _(Optional)_ Directory the model state at the end date is saved to.
    /// Saved states are recorded in the store state table.
    #[serde(default)]
    pub save: Option<PathBuf>,

    /// _(Optional)_ Start from the state recorded in the store
    /// for the start date. Defaults to `false`.
    #[serde(default)]
    pub initialize: bool,

    /// _(Optional)_ Explicit initial state file, takes precedence over `initialize`.
    #[serde(default)]
    pub initial: Option<PathBuf>,
}

/// Where simulation output goes.
#[derive(Clone, PartialEq, Debug, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SaveTarget {
    /// Raster tables of the simulation schema.
    Store,
    /// Copy of the model working directory.
    Directory(PathBuf),
}

/// Output selection.
#[derive(Clone, PartialEq, Debug, Deserialize)]
pub struct OutputOptions {
    /// _(Optional)_ Output destination. Nothing is saved when not set.
    #[serde(default)]
    pub save_to: Option<SaveTarget>,

    /// _(Optional)_ Variables or variable groups to save.
    #[serde(default)]
    pub variables: Vec<String>,

    /// _(Optional)_ Days at the beginning of the window left out
    /// of saved output. Defaults to `0`.
    #[serde(default)]
    pub skip_days: usize,
}

impl Default for OutputOptions {
    fn default() -> Self {
        OutputOptions {
            save_to: None,
            variables: vec![],
            skip_days: 0,
        }
    }
}

/// Forcing generation strategy of an ensemble.
#[derive(Clone, PartialEq, Debug, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ForcingStrategy {
    /// Each member reads one of the precipitation datasets.
    Deterministic,
    /// Each member is forced with a resampled historical year.
    Esp,
    /// Forcing is written by a named forecast generator.
    External(String),
}

/// Ensemble settings.
#[derive(Clone, PartialEq, Debug, Default, Deserialize)]
pub struct EnsembleOptions {
    /// _(Optional)_ Number of members. Defaults to the number of
    /// precipitation datasets, or `20` for assimilation runs.
    #[serde(default)]
    pub size: Option<usize>,

    /// _(Optional)_ Forcing strategy. Defaults to `esp` when the
    /// size is set or observations are assimilated, otherwise to `deterministic`.
    #[serde(default)]
    pub strategy: Option<ForcingStrategy>,

    /// _(Optional)_ Seed of the random generator used for
    /// dataset and year resampling, for reproducible ensembles.
    #[serde(default)]
    pub seed: Option<u64>,
}

impl EnsembleOptions {
    pub fn check_bounds(&self) -> Result<(), ConfigError> {
        if self.size == Some(0) {
            return Err(ConfigError::OutOfBounds(
                "Ensemble size cannot be less than 1",
            ));
        }

        Ok(())
    }
}

/// Observation dataset assimilated into a state variable.
#[derive(Clone, PartialEq, Debug, Deserialize)]
pub struct Observation {
    /// Store table with the observations, like `soilmoist.smos`.
    pub table: String,

    /// Updated state variable: `soil_moist` or `swq`.
    pub variable: String,

    /// _(Optional)_ Updated soil layer (1-based) for `soil_moist`. Defaults to `1`.
    #[serde(default = "Observation::default_layer")]
    pub layer: usize,
}

impl Observation {
    fn default_layer() -> usize {
        1
    }
}

/// Data assimilation settings.
#[derive(Clone, PartialEq, Debug, Deserialize)]
pub struct AssimilationOptions {
    pub observations: Vec<Observation>,

    /// _(Optional)_ Length of the ensemble spin-up before
    /// the start date in months. Defaults to `3`.
    #[serde(default = "AssimilationOptions::default_spinup_months")]
    pub spinup_months: u32,
}

impl AssimilationOptions {
    fn default_spinup_months() -> u32 {
        3
    }

    pub fn check_bounds(&self) -> Result<(), ConfigError> {
        if self.observations.is_empty() {
            return Err(ConfigError::OutOfBounds(
                "Assimilation needs at least one observation dataset",
            ));
        }

        if self.observations.iter().any(|o| o.layer < 1) {
            return Err(ConfigError::OutOfBounds(
                "Observed soil layers are counted from 1",
            ));
        }

        for observation in &self.observations {
            StateVariable::new(&observation.variable, observation.layer)?;
        }

        if self.spinup_months < 1 {
            return Err(ConfigError::OutOfBounds(
                "Spin-up cannot be shorter than 1 month",
            ));
        }

        Ok(())
    }
}

/// _(Optional)_ Fields with information about
/// resources available for the system.
#[derive(Clone, PartialEq, Debug, Deserialize)]
pub struct Resources {
    /// _(Optional)_ Worker count of the pool reading forcing tiles.
    ///
    /// Cannot be less than `1`. Defaults to the number of available cores.
    #[serde(default = "Resources::default_threads")]
    pub threads: u16,

    /// _(Optional)_ Heap memory limit in MB.
    /// Useful for enabling meaningful Out-of-memory error messages.
    ///
    /// Cannot be less than `128`. Defaults to whole addressable-space.
    #[serde(default = "Resources::default_memory")]
    pub memory: usize,
}

impl Resources {
    fn default_threads() -> u16 {
        std::thread::available_parallelism()
            .map(|n| n.get().min(u16::MAX as usize) as u16)
            .unwrap_or(1)
    }

    fn default_memory() -> usize {
        usize::MAX / (1024 * 1024)
    }

    /// Checks if thread count and memory limit are
    /// above limits.
    pub fn check_bounds(&self) -> Result<(), ConfigError> {
        if self.threads < 1 {
            return Err(ConfigError::OutOfBounds(
                "Available threads cannot be less than 1",
            ));
        }

        if self.memory < 128 {
            return Err(ConfigError::OutOfBounds(
                "Available memory cannot be less than 128 MB",
            ));
        }

        Ok(())
    }
}

impl Default for Resources {
    fn default() -> Self {
        Resources {
            threads: Resources::default_threads(),
            memory: Resources::default_memory(),
        }
    }
}

/// Main config structure representing the fields in
/// configuration file.
#[derive(Clone, PartialEq, Debug, Deserialize)]
pub struct Config {
    /// Simulation name, also the store schema of its tables.
    pub name: String,

    pub store: Store,

    pub paths: Paths,

    pub window: TimeWindow,

    pub domain: DomainOptions,

    #[serde(default)]
    pub forcing: ForcingOptions,

    #[serde(default)]
    pub model: ModelOptions,

    #[serde(default)]
    pub state: StateOptions,

    #[serde(default)]
    pub output: OutputOptions,

    #[serde(default)]
    pub ensemble: Option<EnsembleOptions>,

    #[serde(default)]
    pub assimilation: Option<AssimilationOptions>,

    #[serde(default)]
    pub resources: Resources,
}

impl Config {
    /// Config structure constructor, responsible for
    /// deserializing configuration and checking it.
    pub fn new_from_file(file_path: &Path) -> Result<Config, ConfigError> {
        let data = fs::read(file_path)?;
        Config::new_from_slice(data.as_slice())
    }

    pub fn new_from_slice(data: &[u8]) -> Result<Config, ConfigError> {
        let mut config: Config = serde_yaml::from_slice(data)?;
        config.name = config.name.trim().to_lowercase();

        config.check_bounds()?;

        Ok(config)
    }

    fn check_bounds(&self) -> Result<(), ConfigError> {
        if self.name.is_empty() {
            return Err(ConfigError::OutOfBounds("Simulation name cannot be empty"));
        }

        self.store.check_bounds()?;
        self.window.check_bounds()?;
        self.domain.resolution.degrees()?;
        self.domain.extent.check_bounds()?;
        self.model.check_bounds()?;
        self.resources.check_bounds()?;

        if let Some(ensemble) = &self.ensemble {
            ensemble.check_bounds()?;
        }

        if let Some(assimilation) = &self.assimilation {
            assimilation.check_bounds()?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{Config, ForcingStrategy, Resolution, SaveTarget};
    use float_cmp::approx_eq;
    use std::path::PathBuf;

    const CONFIG: &str = "
name: Basin_A
store:
  path: ./store
paths:
  executable: /opt/vic/vicNl
  data: /opt/vic/data
window:
  start: 2021-03-01
  end: 2021-03-31
domain:
  resolution: 0.25
  extent: {west: 30.0, east: 32.0, south: -2.0, north: 0.5}
forcing:
  precip: [chirps, trmm]
  temperature: ncep
  wind: ncep
output:
  save_to: {directory: ./out}
  variables: [soil_moist, runoff]
ensemble:
  strategy: esp
  seed: 7
";

    #[test]
    fn full_config_parses() {
        let config = Config::new_from_slice(CONFIG.as_bytes()).unwrap();

        assert_eq!(config.name, "basin_a");
        assert_eq!(config.store.tile_size, (100, 100));
        assert_eq!(config.window.days(), 31);
        assert_eq!(config.model.nlayers, 3);
        assert_eq!(config.model.timeout, None);
        assert_eq!(
            config.output.save_to,
            Some(SaveTarget::Directory(PathBuf::from("./out")))
        );

        let ensemble = config.ensemble.unwrap();
        assert_eq!(ensemble.strategy, Some(ForcingStrategy::Esp));
        assert_eq!(ensemble.size, None);
        assert!(config.assimilation.is_none());
    }

    #[test]
    fn distance_resolutions() {
        let km = Resolution::Distance("5km".to_string()).degrees().unwrap();
        assert!(approx_eq!(f64, km, 5.0 / 110.0));

        let m = Resolution::Distance("500m".to_string()).degrees().unwrap();
        assert!(approx_eq!(f64, m, 500.0 / 110_000.0));

        assert!(Resolution::Distance("far".to_string()).degrees().is_err());
        assert!(Resolution::Degrees(-0.25).degrees().is_err());
    }

    #[test]
    fn bounds_are_checked() {
        let reversed = CONFIG.replace("end: 2021-03-31", "end: 2021-02-01");
        assert!(Config::new_from_slice(reversed.as_bytes()).is_err());

        let zero_members = CONFIG.replace("seed: 7", "size: 0");
        assert!(Config::new_from_slice(zero_members.as_bytes()).is_err());

        let hourly = format!("{}model:\n  time_step: 36\n", CONFIG);
        assert!(Config::new_from_slice(hourly.as_bytes()).is_err());
    }
}
