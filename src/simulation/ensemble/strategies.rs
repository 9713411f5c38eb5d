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

//! Forcing generation strategies of an ensemble.

use super::Ensemble;
use crate::errors::EnsembleError;
use crate::simulation::domain::TimeWindow;
use crate::simulation::forcing::{ForcingFetcher, ForcingSeries, ForcingSources};
use chrono::{Datelike, Duration, NaiveDate};
use log::{debug, info};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rustc_hash::{FxHashMap, FxHashSet};

/// External generator writing forcing of a whole ensemble,
/// for example from a seasonal forecast product.
pub trait ForecastGenerator: Send + Sync {
    fn generate(
        &self,
        ensemble: &mut Ensemble,
        sources: &ForcingSources,
        fetcher: &ForcingFetcher,
    ) -> Result<(), EnsembleError>;
}

/// Forecast generators available to ensembles, by name.
#[derive(Default)]
pub struct Generators {
    generators: FxHashMap<String, Box<dyn ForecastGenerator>>,
}

impl Generators {
    pub fn register(&mut self, name: &str, generator: Box<dyn ForecastGenerator>) {
        self.generators.insert(name.to_lowercase(), generator);
    }

    pub fn get(&self, name: &str) -> Result<&dyn ForecastGenerator, EnsembleError> {
        self.generators
            .get(&name.to_lowercase())
            .map(|g| g.as_ref())
            .ok_or_else(|| EnsembleError::UnknownGenerator(name.to_string()))
    }
}

/// Precipitation dataset of every member, drawn with replacement.
pub fn draw_datasets(datasets: &[String], members: usize, rng: &mut StdRng) -> Vec<String> {
    (0..members)
        .filter_map(|_| datasets.choose(rng).cloned())
        .collect()
}

/// Checks if a month falls between the start and end months,
/// wrapping over the new year when the start month is not before the end month.
fn in_season(month: u32, window: &TimeWindow) -> bool {
    let (first, last) = (window.start.month(), window.end.month());

    if first < last {
        (first..=last).contains(&month)
    } else {
        month >= first || month <= last
    }
}

/// Historical start date of the window moved to another year.
pub fn shifted_window(window: &TimeWindow, year: i32) -> Option<TimeWindow> {
    let start = NaiveDate::from_ymd_opt(year, window.start.month(), window.start.day())?;
    let end = start + Duration::days(window.days() as i64 - 1);

    Some(TimeWindow::new(start, end))
}

/// Picks a historical year for each member.
///
/// Candidate years have data in the months of the window, a valid
/// shifted start date and a record on the shifted end date. They are
/// shuffled and repeated when there are fewer of them than members.
pub fn select_esp_years(
    dates: &[NaiveDate],
    window: &TimeWindow,
    members: usize,
    rng: &mut StdRng,
) -> Result<Vec<i32>, EnsembleError> {
    let recorded: FxHashSet<NaiveDate> = dates.iter().copied().collect();

    let mut years: Vec<i32> = dates
        .iter()
        .filter(|date| in_season(date.month(), window))
        .map(|date| date.year())
        .collect::<FxHashSet<i32>>()
        .into_iter()
        .filter(|year| {
            shifted_window(window, *year).map_or(false, |shifted| recorded.contains(&shifted.end))
        })
        .collect();

    if years.is_empty() {
        return Err(EnsembleError::NoResampleYears(window.start, window.end));
    }

    // hash set order is not deterministic, shuffling is
    years.sort_unstable();
    years.shuffle(rng);

    debug!("Resampling from years {:?}", years);

    Ok(years.iter().copied().cycle().take(members).collect())
}

impl Ensemble {
    /// Each member reads forcing of its precipitation dataset, series of
    /// a dataset drawn by more than one member are fetched only once.
    pub(super) fn deterministic_forcings(
        &mut self,
        sources: &ForcingSources,
        fetcher: &ForcingFetcher,
    ) -> Result<(), EnsembleError> {
        let datasets = draw_datasets(&sources.precip, self.len(), &mut self.rng);
        let mut fetched: FxHashMap<&str, ForcingSeries> = FxHashMap::default();

        for (member, dataset) in self.members.iter().zip(&datasets) {
            if !fetched.contains_key(dataset.as_str()) {
                info!("Fetching forcing with precipitation from {}", dataset);
                let (series, _) = fetcher.fetch(sources, dataset, &member.window())?;
                fetched.insert(dataset.as_str(), series);
            }

            if let Some(series) = fetched.get(dataset.as_str()) {
                member.write_forcings(series)?;
            }
        }

        Ok(())
    }

    /// Ensemble streamflow prediction: every member is forced with
    /// the weather of a historical year moved onto the ensemble window.
    pub(super) fn esp_forcings(
        &mut self,
        sources: &ForcingSources,
        fetcher: &ForcingFetcher,
    ) -> Result<(), EnsembleError> {
        let dataset = sources
            .precip
            .first()
            .ok_or(crate::errors::ForcingError::NoDatasets("precipitation"))?;

        let table = sources.tables(dataset)[0].clone();
        let dates = self.context.store.dates(&table)?;
        let years = select_esp_years(&dates, &self.window, self.len(), &mut self.rng)?;

        let mut fetched: FxHashMap<i32, ForcingSeries> = FxHashMap::default();

        for (member, year) in self.members.iter().zip(years) {
            if !fetched.contains_key(&year) {
                let shifted = shifted_window(&self.window, year)
                    .ok_or(EnsembleError::NoResampleYears(self.window.start, self.window.end))?;

                info!("Fetching {} - {} for resampled forcing", shifted.start, shifted.end);
                let (series, _) = fetcher.fetch(sources, dataset, &shifted)?;
                fetched.insert(year, series);
            }

            if let Some(series) = fetched.get(&year) {
                let series = series.clone().relabel(member.window())?;
                member.write_forcings(&series)?;
            }
        }

        Ok(())
    }
}
