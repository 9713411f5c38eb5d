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

//! Module coordinating an ensemble of model runs.
//!
//! All members simulate the same domain over the same window and differ
//! in their forcing (and, during assimilation, in their state). Members
//! run concurrently, one model process each, and a failure of one member
//! does not stop the others.

mod strategies;

pub use strategies::{select_esp_years, shifted_window, ForecastGenerator, Generators};

use super::assimilation::{AssimilationBridge, Correction};
use super::configuration::{ForcingStrategy, SaveTarget};
use super::domain::{Domain, Extent, TimeWindow};
use super::forcing::{ForcingFetcher, ForcingSources};
use super::instance::{ControlOptions, DroughtIndex, SimulationInstance};
use super::RunContext;
use crate::constants::SOIL_FILE;
use crate::errors::{EnsembleError, InstanceError};
use indicatif::{ProgressBar, ProgressStyle};
use log::{error, info, warn};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{mpsc, Arc};
use std::thread;

/// Set of simulation instances run together.
#[derive(Debug)]
pub struct Ensemble {
    context: Arc<RunContext>,
    members: Vec<SimulationInstance>,
    window: TimeWindow,
    statefiles: Vec<PathBuf>,
    failed: BTreeSet<usize>,
    rng: StdRng,
}

impl Ensemble {
    /// Creates `size` members, each with its own working directory.
    /// The random generator is seeded when `seed` is given.
    pub fn new(
        size: usize,
        context: Arc<RunContext>,
        window: TimeWindow,
        seed: Option<u64>,
    ) -> Result<Self, EnsembleError> {
        if size == 0 {
            return Err(EnsembleError::Empty);
        }

        let members = (0..size)
            .map(|_| SimulationInstance::new(Arc::clone(&context), window))
            .collect::<Result<Vec<_>, _>>()?;

        let rng = match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        info!("Created ensemble of {} members", size);

        Ok(Ensemble {
            context,
            members,
            window,
            statefiles: vec![],
            failed: BTreeSet::new(),
            rng,
        })
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    pub fn members(&self) -> &[SimulationInstance] {
        &self.members
    }

    pub fn window(&self) -> TimeWindow {
        self.window
    }

    pub fn context(&self) -> &RunContext {
        &self.context
    }

    /// Domain shared by all members, once soil files are written.
    pub fn domain(&self) -> Option<&Arc<Domain>> {
        self.members.first().and_then(|m| m.domain())
    }

    /// Members that failed in the last run.
    pub fn failed(&self) -> &BTreeSet<usize> {
        &self.failed
    }

    /// State files members start from in their next run.
    pub fn statefiles(&self) -> &[PathBuf] {
        &self.statefiles
    }

    pub fn set_window(&mut self, window: TimeWindow) {
        self.window = window;

        for member in &mut self.members {
            member.set_window(window);
        }
    }

    /// Writes the control file of every member.
    ///
    /// Members start from their own state file when the ensemble holds
    /// state files, otherwise from the explicit state or the store state
    /// table. Saved states stay in the member working directory.
    pub fn write_param_files(
        &mut self,
        save_state: bool,
        initialize: bool,
        initial_state: Option<&Path>,
    ) -> Result<(), EnsembleError> {
        for (e, member) in self.members.iter_mut().enumerate() {
            let options = ControlOptions {
                save_state: save_state.then(|| member.path().to_path_buf()),
                record_state: false,
                initialize,
                initial_state: self
                    .statefiles
                    .get(e)
                    .cloned()
                    .or_else(|| initial_state.map(Path::to_path_buf)),
            };

            member.write_param_file(&options)?;
        }

        Ok(())
    }

    /// The first member builds the domain, the rest share its soil file.
    pub fn write_soil_files(&mut self, extent: &Extent) -> Result<Arc<Domain>, EnsembleError> {
        let (first, others) = self.members.split_first_mut().ok_or(EnsembleError::Empty)?;

        let domain = first.write_soil_file(extent)?;
        let soil_file = first.path().join(SOIL_FILE);

        for member in others {
            member.share_domain(Arc::clone(&domain), &soil_file)?;
        }

        Ok(domain)
    }

    /// Writes forcing files of every member with the given strategy.
    pub fn write_forcings(
        &mut self,
        strategy: &ForcingStrategy,
        sources: &ForcingSources,
        generators: &Generators,
    ) -> Result<(), EnsembleError> {
        let domain = self
            .members
            .first()
            .and_then(|m| m.domain())
            .cloned()
            .ok_or(InstanceError::MissingDomain("writing forcings"))?;

        let fetcher = ForcingFetcher::new(
            Arc::clone(&self.context.store),
            domain,
            Arc::clone(&self.context.threadpool),
        );

        match strategy {
            ForcingStrategy::Deterministic => self.deterministic_forcings(sources, &fetcher),
            ForcingStrategy::Esp => self.esp_forcings(sources, &fetcher),
            ForcingStrategy::External(name) => generators.get(name)?.generate(self, sources, &fetcher),
        }
    }

    /// Runs all members concurrently and waits for every one of them.
    ///
    /// Failed members are remembered (and left out of saving),
    /// their errors are returned together once all members finished.
    pub fn run(&mut self, executable: &Path) -> Result<(), EnsembleError> {
        info!(
            "Running {} members for {} - {}",
            self.len(),
            self.window.start,
            self.window.end
        );

        let members_bar = ProgressBar::new(self.members.len() as u64);
        members_bar.set_style(
            ProgressStyle::default_bar()
                .template("{prefix} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {pos}/{len} {msg}")
                .progress_chars("#>-"),
        );
        members_bar.set_prefix("Ensemble members");

        let (tx, rx) = mpsc::channel();
        let mut failures = vec![];
        let members = &self.members;

        thread::scope(|scope| {
            for (e, member) in members.iter().enumerate() {
                let tx = tx.clone();

                scope.spawn(move || {
                    // receiver lives until every member has reported
                    let _ = tx.send((e, member.run(executable)));
                });
            }

            drop(tx);

            for (e, result) in rx.iter() {
                members_bar.inc(1);

                if let Err(err) = result {
                    error!("Ensemble member {} failed: {}", e + 1, err);
                    failures.push((e, err));
                }
            }
        });

        members_bar.finish_with_message("done");

        failures.sort_by_key(|(e, _)| *e);
        self.failed = failures.iter().map(|(e, _)| *e).collect();

        if failures.is_empty() {
            Ok(())
        } else {
            Err(EnsembleError::MembersFailed(failures))
        }
    }

    /// Saves output of the members that did not fail.
    ///
    /// Store rows are tagged with 1-based member numbers and only the
    /// first saved member replaces existing rows. Directory copies go to
    /// numbered subdirectories of a destination reset beforehand.
    pub fn save(
        &self,
        target: &SaveTarget,
        variables: &[String],
        initialize: bool,
        skip_days: usize,
        drought: &[Box<dyn DroughtIndex>],
    ) -> Result<(), EnsembleError> {
        for e in &self.failed {
            warn!("Not saving output of failed ensemble member {}", e + 1);
        }

        let saved = self
            .members
            .iter()
            .enumerate()
            .filter(|(e, _)| !self.failed.contains(e));

        match target {
            SaveTarget::Store => {
                for (i, (e, member)) in saved.enumerate() {
                    member.save(
                        target,
                        variables,
                        initialize && i == 0,
                        skip_days,
                        Some(e as i32 + 1),
                        drought,
                    )?;
                }
            }
            SaveTarget::Directory(dest) => {
                if initialize {
                    if dest.is_dir() {
                        fs::remove_dir_all(dest)?;
                    } else if dest.exists() {
                        fs::remove_file(dest)?;
                    }
                }
                fs::create_dir_all(dest)?;

                for (e, member) in saved {
                    let target = SaveTarget::Directory(dest.join((e + 1).to_string()));
                    member.save(&target, variables, false, skip_days, None, drought)?;
                }
            }
        }

        Ok(())
    }

    /// Runs the ensemble saving model state at the end of the window
    /// and returns the state files every member produced.
    pub fn initialize(
        &mut self,
        strategy: &ForcingStrategy,
        sources: &ForcingSources,
        generators: &Generators,
        extent: &Extent,
        executable: &Path,
    ) -> Result<Vec<PathBuf>, EnsembleError> {
        info!("Spinning up ensemble for {} - {}", self.window.start, self.window.end);

        self.write_param_files(true, true, None)?;
        self.write_soil_files(extent)?;
        self.write_forcings(strategy, sources, generators)?;
        self.run(executable)?;
        self.collect_state_files()?;

        Ok(self.statefiles.clone())
    }

    /// Takes over the state files written by the last run
    /// as the initial states of the next one.
    pub fn collect_state_files(&mut self) -> Result<(), EnsembleError> {
        let statefiles = self
            .members
            .iter()
            .enumerate()
            .map(|(e, member)| match member.state_file() {
                Some(path) if path.is_file() => Ok(path.to_path_buf()),
                _ => Err(EnsembleError::NoStateFile(e + 1)),
            })
            .collect::<Result<Vec<_>, _>>()?;

        self.statefiles = statefiles;
        Ok(())
    }

    /// Applies corrections to the state files of the members.
    pub fn update_state_files(
        &self,
        bridge: &mut AssimilationBridge,
        corrections: &[Correction],
    ) -> Result<usize, EnsembleError> {
        Ok(bridge.correct(&self.statefiles, corrections)?)
    }
}

#[cfg(test)]
mod tests {
    use super::Ensemble;
    use crate::simulation::configuration::SaveTarget;
    use crate::simulation::instance::tests::{test_context, window};
    use crate::simulation::store::MemoryStore;
    use std::fs;
    use std::sync::Arc;

    #[test]
    fn members_share_one_domain() {
        let root = tempfile::tempdir().unwrap();
        let context = test_context(root.path(), Arc::new(MemoryStore::new((10, 10))));
        let mut ensemble = Ensemble::new(3, Arc::clone(&context), window(), Some(1)).unwrap();

        let domain = ensemble.write_soil_files(&context.extent).unwrap();

        for member in ensemble.members() {
            assert!(Arc::ptr_eq(member.domain().unwrap(), &domain));
            assert!(member.path().join("soil.txt").is_file());
        }

        let paths: Vec<_> = ensemble.members().iter().map(|m| m.path()).collect();
        assert_ne!(paths[0], paths[1]);
    }

    #[test]
    fn member_state_files_take_precedence() {
        let root = tempfile::tempdir().unwrap();
        let context = test_context(root.path(), Arc::new(MemoryStore::new((10, 10))));
        let mut ensemble = Ensemble::new(2, context, window(), None).unwrap();

        let explicit = root.path().join("explicit_state");
        ensemble.write_param_files(true, false, Some(&explicit)).unwrap();

        for member in ensemble.members() {
            let text = fs::read_to_string(member.path().join("global.txt")).unwrap();
            assert!(text.contains(&format!("INIT_STATE\t{}", explicit.display())));
            assert!(text.contains(&format!("STATENAME\t{}", member.path().join("state").display())));
        }

        ensemble.statefiles = vec![root.path().join("a"), root.path().join("b")];
        ensemble.write_param_files(false, false, Some(&explicit)).unwrap();

        let second = fs::read_to_string(ensemble.members()[1].path().join("global.txt")).unwrap();
        assert!(second.contains(&format!("INIT_STATE\t{}", root.path().join("b").display())));
        assert!(!second.contains("STATENAME"));
    }

    #[test]
    fn failed_members_are_not_saved() {
        let root = tempfile::tempdir().unwrap();
        let context = test_context(root.path(), Arc::new(MemoryStore::new((10, 10))));
        let mut ensemble = Ensemble::new(3, context, window(), None).unwrap();

        let dest = root.path().join("copies");
        fs::create_dir_all(dest.join("stale")).unwrap();

        ensemble.failed.insert(1);
        ensemble
            .save(&SaveTarget::Directory(dest.clone()), &[], true, 0, &[])
            .unwrap();

        assert!(!dest.join("stale").exists());
        assert!(dest.join("1").is_dir());
        assert!(!dest.join("2").exists());
        assert!(dest.join("3").is_dir());
    }

    #[test]
    fn empty_ensemble_is_rejected() {
        let root = tempfile::tempdir().unwrap();
        let context = test_context(root.path(), Arc::new(MemoryStore::new((10, 10))));

        assert!(Ensemble::new(0, context, window(), None).is_err());
    }
}
