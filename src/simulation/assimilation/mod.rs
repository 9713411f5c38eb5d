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

//! Module injecting observation-derived corrections into the
//! state snapshots of ensemble members between update windows.
//!
//! Every member moves through a fixed sequence of phases:
//! spun up, running, awaiting an update, corrected, running again
//! and finally finished. The [`AssimilationBridge`] tracks the phases
//! and refuses corrections out of that order.

mod state;
mod tables;

pub use state::{StateFile, StateVariable};
pub use tables::StateTables;

use super::configuration::Observation;
use super::domain::{Domain, TimeWindow};
use super::store::{RasterStore, TableName};
use crate::errors::{AssimilationError, ConfigError};
use crate::Float;
use chrono::NaiveDate;
use log::{debug, info, warn};
use rustc_hash::FxHashMap;
use std::path::PathBuf;
use std::sync::Arc;

/// Phase of an ensemble member during assimilation.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum MemberPhase {
    Spunup,
    Running,
    AwaitingUpdate,
    Corrected,
    Finished,
}

impl MemberPhase {
    fn can_move_to(self, next: MemberPhase) -> bool {
        use MemberPhase::*;

        matches!(
            (self, next),
            (Spunup, Running)
                | (Running, AwaitingUpdate)
                | (AwaitingUpdate, Corrected)
                | (Corrected, Running)
                | (AwaitingUpdate, Finished)
                | (Corrected, Finished)
        )
    }
}

/// Target cell value of a state variable for one member.
#[derive(Clone, Copy, PartialEq, Debug)]
pub struct Correction {
    pub member: usize,
    pub gid: i64,
    pub variable: StateVariable,
    pub value: Float,
}

/// Source of corrections, for example a satellite product in the store.
pub trait ObservationSource: Send + Sync {
    /// Dates with observations inside the window.
    fn dates(&self, window: &TimeWindow) -> Result<Vec<NaiveDate>, AssimilationError>;

    /// Corrections of every member for a date.
    fn corrections(
        &self,
        date: NaiveDate,
        domain: &Domain,
        members: usize,
    ) -> Result<Vec<Correction>, AssimilationError>;
}

/// Inserts the observed value of the nearest raster cell into every member.
#[derive(Debug)]
pub struct DirectInsertion {
    store: Arc<dyn RasterStore>,
    table: TableName,
    variable: StateVariable,
}

impl DirectInsertion {
    pub fn new(store: Arc<dyn RasterStore>, observation: &Observation) -> Result<Self, ConfigError> {
        Ok(DirectInsertion {
            store,
            table: TableName::parse(&observation.table),
            variable: StateVariable::new(&observation.variable, observation.layer)?,
        })
    }
}

impl ObservationSource for DirectInsertion {
    fn dates(&self, window: &TimeWindow) -> Result<Vec<NaiveDate>, AssimilationError> {
        Ok(self
            .store
            .dates(&self.table)?
            .into_iter()
            .filter(|date| window.contains(*date))
            .collect())
    }

    fn corrections(
        &self,
        date: NaiveDate,
        domain: &Domain,
        members: usize,
    ) -> Result<Vec<Correction>, AssimilationError> {
        let layer = self.variable.layer();
        let rows: Vec<_> = self
            .store
            .rasters(&self.table, date)?
            .into_iter()
            .filter(|row| row.layer.map_or(true, |l| Some(l as usize) == layer))
            .collect();

        // squared distance of an observation still belonging to a pixel
        let reach = domain.resolution().powi(2);
        let mut corrections = vec![];

        for pixel in domain.pixels() {
            let nearest = rows
                .iter()
                .filter_map(|row| row.raster.nearest_value(pixel.lon, pixel.lat))
                .fold(None, |best: Option<(f32, Float)>, candidate| match best {
                    Some(b) if b.1 <= candidate.1 => Some(b),
                    _ => Some(candidate),
                });

            if let Some((value, distance)) = nearest {
                if distance <= reach {
                    corrections.extend((0..members).map(|member| Correction {
                        member,
                        gid: pixel.gid,
                        variable: self.variable,
                        value: Float::from(value),
                    }));
                }
            }
        }

        debug!("{} has {} corrections on {}", self.table, corrections.len(), date);
        Ok(corrections)
    }
}

/// Applies corrections to member state files in phase order.
#[derive(Debug)]
pub struct AssimilationBridge {
    tables: StateTables,
    phases: Vec<MemberPhase>,
}

impl AssimilationBridge {
    /// Bridge of a freshly spun-up ensemble.
    pub fn new(tables: StateTables, members: usize) -> Self {
        AssimilationBridge {
            tables,
            phases: vec![MemberPhase::Spunup; members],
        }
    }

    pub fn phase(&self, member: usize) -> Option<MemberPhase> {
        self.phases.get(member).copied()
    }

    fn transition(&mut self, member: usize, next: MemberPhase) -> Result<(), AssimilationError> {
        let phase = self
            .phases
            .get_mut(member)
            .ok_or(AssimilationError::UnknownMember(member + 1))?;

        if !phase.can_move_to(next) {
            return Err(AssimilationError::Transition(member + 1, *phase, next));
        }

        *phase = next;
        Ok(())
    }

    fn transition_all(&mut self, next: MemberPhase) -> Result<(), AssimilationError> {
        (0..self.phases.len()).try_for_each(|member| self.transition(member, next))
    }

    /// Members start simulating a window.
    pub fn begin_window(&mut self) -> Result<(), AssimilationError> {
        self.transition_all(MemberPhase::Running)
    }

    /// Members finished a window and wrote their state.
    pub fn window_finished(&mut self) -> Result<(), AssimilationError> {
        self.transition_all(MemberPhase::AwaitingUpdate)
    }

    /// Rewrites state files of members with corrections, returning the
    /// number of corrected cells. Files of members without corrections
    /// are not touched.
    pub fn correct(
        &mut self,
        statefiles: &[PathBuf],
        corrections: &[Correction],
    ) -> Result<usize, AssimilationError> {
        let mut by_member: FxHashMap<usize, Vec<&Correction>> = FxHashMap::default();

        for correction in corrections {
            if correction.member >= statefiles.len() {
                return Err(AssimilationError::UnknownMember(correction.member + 1));
            }
            by_member.entry(correction.member).or_default().push(correction);
        }

        self.transition_all(MemberPhase::Corrected)?;

        let mut corrected = 0;

        for (member, corrections) in by_member {
            let path = &statefiles[member];
            let mut state = StateFile::read(path)?;

            for correction in corrections {
                match state.correct(correction.gid, correction.variable, correction.value, &self.tables) {
                    Ok(()) => corrected += 1,
                    Err(AssimilationError::UnknownCell(gid, table)) => {
                        warn!("Cell {} missing from the {} table, not corrected", gid, table);
                    }
                    Err(err) => return Err(err),
                }
            }

            if state.is_modified() {
                state.write(path)?;
                debug!("Updated state file {:?}", path);
            }
        }

        info!("Corrected {} cell states", corrected);
        Ok(corrected)
    }

    /// Closes assimilation, no correction is accepted afterwards.
    pub fn finish(&mut self) -> Result<(), AssimilationError> {
        self.transition_all(MemberPhase::Finished)
    }
}

#[cfg(test)]
mod tests {
    use super::state::tests::snapshot;
    use super::tables::tests::{SNOWBANDS, VEGPARAM};
    use super::{AssimilationBridge, Correction, MemberPhase, StateTables, StateVariable};
    use std::fs;

    fn bridge(members: usize) -> AssimilationBridge {
        AssimilationBridge::new(StateTables::parse(VEGPARAM, SNOWBANDS).unwrap(), members)
    }

    #[test]
    fn phases_follow_windows() {
        let mut bridge = bridge(2);

        assert!(bridge.window_finished().is_err());
        bridge.begin_window().unwrap();
        assert!(bridge.begin_window().is_err());
        bridge.window_finished().unwrap();
        assert_eq!(bridge.correct(&[], &[]).unwrap(), 0);
        assert_eq!(bridge.phase(1), Some(MemberPhase::Corrected));
        bridge.begin_window().unwrap();
        assert_eq!(bridge.phase(0), Some(MemberPhase::Running));
        assert!(bridge.finish().is_err());
    }

    #[test]
    fn corrections_after_finish_fail() {
        let root = tempfile::tempdir().unwrap();
        let files: Vec<_> = (0..2).map(|e| root.path().join(format!("state_{}", e))).collect();
        for file in &files {
            fs::write(file, snapshot()).unwrap();
        }

        let mut bridge = bridge(2);
        bridge.begin_window().unwrap();
        bridge.window_finished().unwrap();

        let correction = Correction {
            member: 1,
            gid: 2,
            variable: StateVariable::Swe,
            value: 10.0,
        };

        assert_eq!(bridge.correct(&files, &[correction]).unwrap(), 1);
        assert_eq!(bridge.phase(0), Some(MemberPhase::Corrected));
        assert_eq!(fs::read_to_string(&files[0]).unwrap(), snapshot());
        assert_ne!(fs::read_to_string(&files[1]).unwrap(), snapshot());

        bridge.finish().unwrap();
        assert!(bridge.correct(&files, &[correction]).is_err());
    }
}
