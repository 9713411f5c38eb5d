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

//! Global control file of the land-surface model.
//!
//! The model reads a flat file of `KEYWORD<TAB>value` lines. Every keyword
//! appears once, apart from the four forcing types and the output file
//! declarations closing the file.

use super::SimulationInstance;
use crate::constants::{CONTROL_FILE, FORCING_DIR, FORCING_PREFIX, OUTPUT_DIR, SOIL_FILE, STATE_PREFIX};
use crate::errors::InstanceError;
use crate::simulation::domain::grid_decimal;
use chrono::Datelike;
use log::{debug, info};
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};

/// Output file groups declared in the control file, with their variables.
pub const OUTPUT_GROUPS: [(&str, &[&str]); 6] = [
    (
        "eb",
        &["net_short", "net_long", "latent", "sensible", "grnd_flux", "surf_temp"],
    ),
    (
        "wb",
        &["runoff", "baseflow", "evap", "soil_moist", "swe", "snow_depth", "rootmoist"],
    ),
    ("sub", &["soil_temp", "smliqfrac", "smfrozfrac"]),
    ("sur", &["albedo", "snow_cover", "surf_frost_frac"]),
    ("csp", &["snow_canopy", "sub_canop", "sub_snow"]),
    ("eva", &["evap_canop", "transp_veg", "evap_bare", "pet_natveg"]),
];

/// State handling requested from a single run.
#[derive(Clone, PartialEq, Debug, Default)]
pub struct ControlOptions {
    /// Directory the state at the end date is written to.
    pub save_state: Option<PathBuf>,
    /// Record the saved state in the store state table.
    pub record_state: bool,
    /// Start from the state recorded in the store for the start date.
    pub initialize: bool,
    /// Explicit initial state, takes precedence over `initialize`.
    pub initial_state: Option<PathBuf>,
}

/// Replaces output group names with the variables of the group,
/// keeping the first occurrence of every variable.
pub fn expand_variable_groups(names: &[String]) -> Vec<String> {
    let mut variables: Vec<String> = vec![];

    for name in names {
        let name = name.trim().to_lowercase();
        let group = OUTPUT_GROUPS.iter().find(|(group, _)| *group == name);

        let expanded: Vec<String> = match group {
            Some((_, members)) => members.iter().map(|v| v.to_string()).collect(),
            None => vec![name],
        };

        for variable in expanded {
            if !variables.contains(&variable) {
                variables.push(variable);
            }
        }
    }

    variables
}

/// Output file declarations of all groups.
fn output_template() -> String {
    let mut template = String::new();

    for (group, variables) in OUTPUT_GROUPS.iter() {
        let _ = writeln!(template, "OUTFILE\t{}\t{}", group, variables.len());

        for variable in variables.iter() {
            let _ = writeln!(template, "OUTVAR\tOUT_{}", variable.to_uppercase());
        }
    }

    template
}

/// Number of snow elevation bands: the first line of the
/// snow band file holds a cell id and three values per band.
fn snow_band_count(path: &Path) -> Result<usize, InstanceError> {
    let text = fs::read_to_string(path)?;
    let fields = text.lines().next().map_or(0, |l| l.split_whitespace().count());

    if fields < 4 || (fields - 1) % 3 != 0 {
        return Err(InstanceError::MalformedFile(
            path.display().to_string(),
            "snow band line must hold a cell id and three values per band",
        ));
    }

    Ok((fields - 1) / 3)
}

impl SimulationInstance {
    /// Writes the global control file of the run.
    pub fn write_param_file(&mut self, options: &ControlOptions) -> Result<(), InstanceError> {
        let context = &self.context;
        let model = &context.model;
        let parameters = &context.parameters;
        let (start, end) = (self.window.start, self.window.end);
        let path = self.workdir.path();

        let mut out = String::new();
        let mut line = |key: &str, value: &dyn std::fmt::Display| {
            let _ = writeln!(out, "{}\t{}", key, value);
        };

        line("NLAYER", &model.nlayers);
        line("NODES", &model.nodes);

        if model.time_step < 24 {
            line("TIME_STEP", &model.time_step);
            line("SNOW_STEP", &model.time_step);
            line("FULL_ENERGY", &"TRUE");
            line("FROZEN_SOIL", &"TRUE");
        } else {
            line("TIME_STEP", &24);
            line("SNOW_STEP", &3);
            line("FULL_ENERGY", &"FALSE");
            line("FROZEN_SOIL", &"FALSE");
        }

        line("STARTYEAR", &format!("{:04}", start.year()));
        line("STARTMONTH", &format!("{:02}", start.month()));
        line("STARTDAY", &format!("{:02}", start.day()));
        line("ENDYEAR", &format!("{:04}", end.year()));
        line("ENDMONTH", &format!("{:02}", end.month()));
        line("ENDDAY", &format!("{:02}", end.day()));
        line("SKIPYEAR", &model.skip_years);
        line("IMPLICIT", &"FALSE");
        line("TFALLBACK", &"TRUE");
        line("SNOW_ALBEDO", &"USACE");
        line("SNOW_DENSITY", &"DENS_SNTHRM");
        line("BLOWING", &"FALSE");
        line("COMPUTE_TREELINE", &"FALSE");
        line("DIST_PRCP", &"FALSE");
        line("PREC_EXPT", &0.6);
        line("CORRPREC", &"FALSE");
        line("MAX_SNOW_TEMP", &0.5);
        line("MIN_RAIN_TEMP", &-0.5);
        line("MIN_WIND_SPEED", &0.1);
        line("AERO_RESIST_CANSNOW", &"AR_406_FULL");

        let initial_state = match &options.initial_state {
            Some(state) => Some(state.clone()),
            None if options.initialize => context.store.state_file(&context.name, start)?,
            None => None,
        };

        if let Some(state) = initial_state {
            info!("Initializing model from state {:?}", state);
            line("INIT_STATE", &state.display());
        }

        self.state_file = None;

        if let Some(dir) = &options.save_state {
            fs::create_dir_all(dir)?;

            line("STATENAME", &dir.join(STATE_PREFIX).display());
            line("STATEYEAR", &format!("{:04}", end.year()));
            line("STATEMONTH", &format!("{:02}", end.month()));
            line("STATEDAY", &format!("{:02}", end.day()));

            let state_file = dir.join(format!("{}_{}", STATE_PREFIX, end.format("%Y%m%d")));

            if options.record_state {
                context.store.record_state(&context.name, end, &state_file)?;
            }

            self.state_file = Some(state_file);
        }

        line("BINARY_STATE_FILE", &"FALSE");
        line(
            "FORCING1",
            &format!("{}/{}_", path.join(FORCING_DIR).display(), FORCING_PREFIX),
        );
        line("FORCE_FORMAT", &"ASCII");
        line("FORCE_ENDIAN", &"LITTLE");
        line("N_TYPES", &4);

        for force_type in ["PREC", "TMAX", "TMIN", "WIND"] {
            line("FORCE_TYPE", &force_type);
        }

        line("FORCE_DT", &24);
        line("FORCEYEAR", &format!("{:04}", start.year()));
        line("FORCEMONTH", &format!("{:02}", start.month()));
        line("FORCEDAY", &format!("{:02}", start.day()));
        line("FORCEHOUR", &0);
        line("GRID_DECIMAL", &grid_decimal(context.resolution()));
        line("WIND_H", &"10.0");
        line("MEASURE_H", &"2.0");
        line("ALMA_INPUT", &"FALSE");
        line("SOIL", &path.join(SOIL_FILE).display());
        line("VEGLIB", &context.paths.data.join(&parameters.veglib).display());
        line("VEGPARAM", &context.paths.data.join(&parameters.vegparam).display());
        line("VEGPARAM_LAI", &"TRUE");
        line("ROOT_ZONES", &parameters.root_zones);
        line("LAI_SRC", &"LAI_FROM_VEGPARAM");

        let snowbands = context.paths.data.join(&parameters.snowbands);
        line(
            "SNOW_BAND",
            &format!("{}\t{}", snow_band_count(&snowbands)?, snowbands.display()),
        );

        line("RESULT_DIR", &path.join(OUTPUT_DIR).display());
        line("OUT_STEP", &24);
        line("BINARY_OUTPUT", &"FALSE");
        line("MOISTFRACT", &"FALSE");
        line("COMPRESS", &"FALSE");
        line("ALMA_OUTPUT", &"FALSE");
        line("PTR_HEADER", &"FALSE");
        line("PRT_SNOW_BAND", &"FALSE");

        out.push_str(&output_template());

        debug!("Writing control file of {} - {}", start, end);
        fs::write(path.join(CONTROL_FILE), out)?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{expand_variable_groups, ControlOptions};
    use crate::simulation::instance::tests::{test_context, window};
    use crate::simulation::instance::SimulationInstance;
    use crate::simulation::store::{MemoryStore, RasterStore};
    use rustc_hash::FxHashMap;
    use std::fs;
    use std::sync::Arc;

    fn keywords(text: &str) -> FxHashMap<String, Vec<String>> {
        let mut keywords: FxHashMap<String, Vec<String>> = FxHashMap::default();

        for line in text.lines() {
            let mut fields = line.splitn(2, '\t');
            let key = fields.next().unwrap().to_string();
            let value = fields.next().unwrap_or_default().to_string();
            keywords.entry(key).or_default().push(value);
        }

        keywords
    }

    #[test]
    fn keywords_appear_once() {
        let root = tempfile::tempdir().unwrap();
        let context = test_context(root.path(), Arc::new(MemoryStore::new((10, 10))));
        let mut instance = SimulationInstance::new(context, window()).unwrap();

        instance.write_param_file(&ControlOptions::default()).unwrap();

        let text = fs::read_to_string(instance.path().join("global.txt")).unwrap();
        let keywords = keywords(&text);

        for (key, values) in &keywords {
            match key.as_str() {
                "FORCE_TYPE" => assert_eq!(values, &["PREC", "TMAX", "TMIN", "WIND"]),
                "OUTFILE" => assert_eq!(values.len(), 6),
                "OUTVAR" => assert!(values.len() > 6),
                _ => assert_eq!(values.len(), 1, "{} repeated", key),
            }
        }

        assert_eq!(keywords["STARTMONTH"], ["01"]);
        assert_eq!(keywords["ENDDAY"], ["05"]);
        assert_eq!(keywords["FULL_ENERGY"], ["FALSE"]);
        assert_eq!(keywords["GRID_DECIMAL"], ["3"]);
        assert!(keywords["SNOW_BAND"][0].starts_with("2\t"));
        assert!(!keywords.contains_key("INIT_STATE"));
        assert!(!keywords.contains_key("STATENAME"));
        assert!(instance.state_file().is_none());
    }

    #[test]
    fn state_options() {
        let root = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new((10, 10)));
        let context = test_context(root.path(), Arc::clone(&store));
        let mut instance = SimulationInstance::new(context, window()).unwrap();

        let recorded = root.path().join("states/state_20201231");
        store
            .record_state("basin", window().start, &recorded)
            .unwrap();

        let options = ControlOptions {
            save_state: Some(root.path().join("saved")),
            record_state: true,
            initialize: true,
            initial_state: None,
        };
        instance.write_param_file(&options).unwrap();

        let text = fs::read_to_string(instance.path().join("global.txt")).unwrap();
        let keywords = keywords(&text);

        assert_eq!(keywords["INIT_STATE"], [recorded.display().to_string()]);
        assert_eq!(keywords["STATEYEAR"], ["2021"]);
        assert!(root.path().join("saved").is_dir());

        let produced = root.path().join("saved/state_20210105");
        assert_eq!(instance.state_file(), Some(produced.as_path()));
        assert_eq!(
            store.state_file("basin", window().end).unwrap(),
            Some(produced)
        );
    }

    #[test]
    fn groups_expand() {
        let names = vec!["sub".to_string(), "Soil_Temp".to_string(), "rainf".to_string()];

        assert_eq!(
            expand_variable_groups(&names),
            vec!["soil_temp", "smliqfrac", "smfrozfrac", "rainf"]
        );
    }
}
