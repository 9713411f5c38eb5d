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

//! Run drivers of the three kinds of simulation.
//!
//! A deterministic run simulates the window once with the first
//! precipitation dataset. An ensemble run simulates it with many members
//! and summarizes their output. An assimilation run spins an ensemble up
//! before the window, then simulates the window piece by piece, stopping
//! at every observation date to correct the member states.

use super::assimilation::{AssimilationBridge, DirectInsertion, ObservationSource, StateTables};
use super::configuration::{Config, EnsembleOptions, ForcingStrategy, SaveTarget};
use super::domain::TimeWindow;
use super::encoder::OutputEncoder;
use super::ensemble::Ensemble;
use super::forcing::ForcingFetcher;
use super::instance::{expand_variable_groups, ControlOptions, SimulationInstance};
use super::store::TableName;
use super::Core;
use crate::errors::{ForcingError, InstanceError, ModelError};
use chrono::{Datelike, Duration, NaiveDate};
use log::{info, warn};
use std::collections::BTreeSet;
use std::sync::Arc;

/// Ensemble size used for assimilation when none is configured.
const ASSIMILATION_MEMBERS: usize = 20;

/// Runs the simulation the configuration asks for.
///
/// More than one precipitation dataset makes an ensemble
/// even without ensemble options.
pub(super) fn run(core: &Core) -> Result<(), ModelError> {
    let ensemble = core.config.ensemble.is_some() || core.config.assimilation.is_some();

    if let ForcingStrategy::External(name) = ensemble_strategy(&core.config) {
        if ensemble {
            core.generators.get(&name)?;
        }
    }

    if core.config.assimilation.is_some() {
        run_assimilation(core)
    } else if core.config.ensemble.is_some() || core.config.forcing.precip.len() > 1 {
        run_ensemble(core)
    } else {
        run_deterministic(core)
    }
}

/// Number of members: configured size, the default for assimilation
/// or one member per precipitation dataset.
pub(super) fn ensemble_size(config: &Config) -> usize {
    let options = config.ensemble.clone().unwrap_or_default();

    match options.size {
        Some(size) => size,
        None if config.assimilation.is_some() => ASSIMILATION_MEMBERS,
        None => config.forcing.precip.len().max(1),
    }
}

/// Configured strategy, otherwise resampling when the size is set
/// or observations are assimilated and dataset drawing otherwise.
pub(super) fn ensemble_strategy(config: &Config) -> ForcingStrategy {
    let options: EnsembleOptions = config.ensemble.clone().unwrap_or_default();

    match options.strategy {
        Some(strategy) => strategy,
        None if options.size.is_some() || config.assimilation.is_some() => ForcingStrategy::Esp,
        None => ForcingStrategy::Deterministic,
    }
}

/// Same day of month `months` earlier, moved to the end of a shorter month.
pub(super) fn months_before(date: NaiveDate, months: u32) -> NaiveDate {
    let total = date.year() * 12 + date.month0() as i32 - months as i32;
    let (year, month) = (total.div_euclid(12), total.rem_euclid(12) as u32 + 1);

    (1..=date.day())
        .rev()
        .find_map(|day| NaiveDate::from_ymd_opt(year, month, day))
        .unwrap_or(date)
}

fn run_deterministic(core: &Core) -> Result<(), ModelError> {
    let config = &core.config;
    let context = &core.context;

    info!("Running deterministic simulation {}", config.name);

    let mut instance = SimulationInstance::new(Arc::clone(context), config.window)?;
    let domain = instance.write_soil_file(&context.extent)?;

    let control = ControlOptions {
        save_state: config.state.save.clone(),
        record_state: config.state.save.is_some(),
        initialize: config.state.initialize,
        initial_state: config.state.initial.clone(),
    };
    instance.write_param_file(&control)?;

    let precip = core
        .sources
        .precip
        .first()
        .ok_or(ForcingError::NoDatasets("precipitation"))?;

    let fetcher = ForcingFetcher::new(
        Arc::clone(&context.store),
        domain,
        Arc::clone(&context.threadpool),
    );
    let (series, report) = fetcher.fetch(&core.sources, precip, &config.window)?;

    if !report.is_complete() {
        warn!("Forcing of {} has been gap-filled", config.name);
    }

    instance.write_forcings(&series)?;
    instance.run(&context.paths.executable)?;

    if let Some(target) = &config.output.save_to {
        let variables = expand_variable_groups(&config.output.variables);
        instance.save(
            target,
            &variables,
            true,
            config.output.skip_days,
            None,
            &core.drought,
        )?;
    }

    Ok(())
}

fn run_ensemble(core: &Core) -> Result<(), ModelError> {
    let config = &core.config;
    let context = &core.context;
    let seed = config.ensemble.as_ref().and_then(|e| e.seed);
    let strategy = ensemble_strategy(config);

    info!("Running ensemble simulation {} with {:?} forcing", config.name, strategy);

    let mut ensemble = Ensemble::new(ensemble_size(config), Arc::clone(context), config.window, seed)?;

    ensemble.write_soil_files(&context.extent)?;
    ensemble.write_param_files(false, true, config.state.initial.as_deref())?;
    ensemble.write_forcings(&strategy, &core.sources, &core.generators)?;

    let outcome = ensemble.run(&context.paths.executable);

    if let Some(target) = &config.output.save_to {
        let variables = expand_variable_groups(&config.output.variables);
        ensemble.save(target, &variables, true, config.output.skip_days, &core.drought)?;

        if ensemble.failed().len() < ensemble.len() {
            summarize(core, target, &variables, &config.window)?;
        }
    }

    Ok(outcome?)
}

/// Mean and standard deviation of ensemble output saved to the store.
fn summarize(
    core: &Core,
    target: &SaveTarget,
    variables: &[String],
    window: &TimeWindow,
) -> Result<(), ModelError> {
    if *target != SaveTarget::Store {
        return Ok(());
    }

    let store = core.context.store.as_ref();
    let encoder = OutputEncoder::new(store, &core.config.name);

    for variable in variables {
        if store.table_exists(&TableName::new(&core.config.name, variable))? {
            encoder.summarize(variable, window)?;
        }
    }

    Ok(())
}

/// Observation dates strictly before the end of the window,
/// followed by the end date itself.
fn update_dates(
    sources: &[Box<dyn ObservationSource>],
    window: &TimeWindow,
) -> Result<Vec<NaiveDate>, ModelError> {
    let mut dates = BTreeSet::new();

    for source in sources {
        dates.extend(source.dates(window)?.into_iter().filter(|d| *d < window.end));
    }

    dates.insert(window.end);
    Ok(dates.into_iter().collect())
}

fn run_assimilation(core: &Core) -> Result<(), ModelError> {
    let config = &core.config;
    let context = &core.context;
    let executable = &context.paths.executable;

    let assimilation = match &config.assimilation {
        Some(assimilation) => assimilation,
        None => return run_ensemble(core),
    };

    let sources = assimilation
        .observations
        .iter()
        .map(|o| {
            DirectInsertion::new(Arc::clone(&context.store), o)
                .map(|s| Box::new(s) as Box<dyn ObservationSource>)
        })
        .collect::<Result<Vec<_>, _>>()?;

    let tables = StateTables::read(
        &context.paths.data.join(&context.parameters.vegparam),
        &context.paths.data.join(&context.parameters.snowbands),
    )?;

    let size = ensemble_size(config);
    let strategy = ensemble_strategy(config);
    let seed = config.ensemble.as_ref().and_then(|e| e.seed);

    let start = config.window.start;
    let spinup = TimeWindow::new(
        months_before(start, assimilation.spinup_months),
        start - Duration::days(1),
    );

    info!("Running assimilation {} with {} members", config.name, size);

    let mut ensemble = Ensemble::new(size, Arc::clone(context), spinup, seed)?;
    ensemble.initialize(&strategy, &core.sources, &core.generators, &context.extent, executable)?;

    let domain = ensemble
        .domain()
        .cloned()
        .ok_or(InstanceError::MissingDomain("assimilating observations"))?;

    let mut bridge = AssimilationBridge::new(tables, size);
    let variables = expand_variable_groups(&config.output.variables);
    let mut window_start = start;

    for date in update_dates(&sources, &config.window)? {
        let window = TimeWindow::new(window_start, date);
        let first = window_start == start;

        info!("Assimilation window {} - {}", window.start, window.end);

        ensemble.set_window(window);
        bridge.begin_window()?;

        let initialize = first || config.output.save_to == Some(SaveTarget::Store);
        let skip_days = if first { config.output.skip_days } else { 0 };

        ensemble.write_param_files(true, false, None)?;
        ensemble.write_forcings(&strategy, &core.sources, &core.generators)?;

        // members without state cannot continue, survivors of the window are kept
        if let Err(err) = ensemble.run(executable) {
            if let Some(target) = &config.output.save_to {
                ensemble.save(target, &variables, initialize, skip_days, &core.drought)?;

                if ensemble.failed().len() < ensemble.len() {
                    summarize(core, target, &variables, &config.window)?;
                }
            }

            return Err(err.into());
        }

        ensemble.collect_state_files()?;
        bridge.window_finished()?;

        let mut corrections = vec![];
        for source in &sources {
            corrections.extend(source.corrections(date, &domain, size)?);
        }

        ensemble.update_state_files(&mut bridge, &corrections)?;

        if let Some(target) = &config.output.save_to {
            ensemble.save(target, &variables, initialize, skip_days, &core.drought)?;
        }

        window_start = date + Duration::days(1);
    }

    bridge.finish()?;

    if let Some(target) = &config.output.save_to {
        summarize(core, target, &variables, &config.window)?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{ensemble_size, ensemble_strategy, months_before};
    use crate::simulation::configuration::{Config, ForcingStrategy};
    use chrono::NaiveDate;

    const CONFIG: &str = "
name: basin
store:
  path: ./store
paths:
  executable: ./model
  data: ./data
window:
  start: 2021-03-01
  end: 2021-03-31
domain:
  resolution: 0.25
  extent: {west: 30.0, east: 32.0, south: -2.0, north: 0.5}
forcing:
  precip: [chirps, trmm, persiann]
  temperature: ncep
  wind: ncep
";

    fn config(extra: &str) -> Config {
        Config::new_from_slice(format!("{}{}", CONFIG, extra).as_bytes()).unwrap()
    }

    #[test]
    fn ensemble_defaults() {
        let plain = config("ensemble: {}\n");
        assert_eq!(ensemble_size(&plain), 3);
        assert_eq!(ensemble_strategy(&plain), ForcingStrategy::Deterministic);

        let sized = config("ensemble: {size: 8}\n");
        assert_eq!(ensemble_size(&sized), 8);
        assert_eq!(ensemble_strategy(&sized), ForcingStrategy::Esp);

        let assimilating =
            config("assimilation:\n  observations:\n    - {table: soilmoist.smos, variable: soil_moist}\n");
        assert_eq!(ensemble_size(&assimilating), 20);
        assert_eq!(ensemble_strategy(&assimilating), ForcingStrategy::Esp);
    }

    #[test]
    fn spinup_months() {
        let date = |y, m, d| NaiveDate::from_ymd_opt(y, m, d).unwrap();

        assert_eq!(months_before(date(2021, 3, 1), 3), date(2020, 12, 1));
        assert_eq!(months_before(date(2021, 5, 31), 3), date(2021, 2, 28));
        assert_eq!(months_before(date(2021, 1, 15), 13), date(2019, 12, 15));
    }
}
