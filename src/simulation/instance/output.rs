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

//! Decoding and saving of the model output.
//!
//! The model writes one text file per output group and pixel, a line
//! per day starting with year, month and day columns followed by the
//! declared variables. Columns of a variable are found by replaying the
//! output declarations of the control file; soil-layered variables take
//! one column per layer. Forcing variables are read back from the
//! weather files.

use super::SimulationInstance;
use crate::constants::{
    CONTROL_FILE, FORCING_DIR, FORCING_PREFIX, LAYERED_VARIABLES, NODATA, OUTPUT_DATE_COLUMNS,
    OUTPUT_DIR,
};
use crate::errors::InstanceError;
use crate::simulation::configuration::SaveTarget;
use crate::simulation::encoder::{OutputEncoder, SaveOptions};
use chrono::{Datelike, Duration, NaiveDate};
use csv::{ReaderBuilder, Trim};
use log::{debug, info, warn};
use ndarray::{s, Array4};
use rustc_hash::{FxHashMap, FxHashSet};
use std::fs;
use std::path::Path;

/// Drought index computed from the daily series of one output variable.
///
/// Formulas of the indices are provided by implementors, this program
/// only feeds them with series of simulated pixels.
pub trait DroughtIndex: Send + Sync {
    /// Name the index is saved under.
    fn name(&self) -> &str;

    /// Output variable the index is computed from.
    fn source(&self) -> &str;

    /// Index series of the same length as the input,
    /// `None` when it cannot be computed.
    fn compute(&self, series: &[f32]) -> Option<Vec<f32>>;
}

/// Output variable of all pixels over the saved days.
#[derive(Clone, PartialEq, Debug)]
pub struct OutputVariable {
    pub name: String,
    /// Date of the first time step.
    pub start: NaiveDate,
    /// Values indexed by (day, layer, row, column).
    pub data: Array4<f32>,
}

impl OutputVariable {
    pub fn days(&self) -> usize {
        self.data.dim().0
    }

    pub fn layers(&self) -> usize {
        self.data.dim().1
    }

    pub fn dates(&self) -> Vec<NaiveDate> {
        (0..self.days())
            .map(|t| self.start + Duration::days(t as i64))
            .collect()
    }
}

/// Source file and first column of every output variable.
#[derive(Clone, PartialEq, Debug, Default)]
pub struct OutputLayout {
    columns: FxHashMap<String, (String, usize)>,
    pub skip_years: u32,
}

impl OutputLayout {
    /// Replays the output declarations of a control file.
    pub fn parse(control: &str, nlayers: usize) -> Self {
        let mut layout = OutputLayout::default();
        let mut prefix: Option<String> = None;
        let mut column = OUTPUT_DATE_COLUMNS;

        for line in control.lines() {
            let fields: Vec<&str> = line.split_whitespace().collect();

            match fields.as_slice() {
                ["OUTFILE", name, ..] => {
                    prefix = Some(format!("{}/{}", OUTPUT_DIR, name));
                    column = OUTPUT_DATE_COLUMNS;
                }
                ["SKIPYEAR", years, ..] => {
                    layout.skip_years = years.parse().unwrap_or(0);
                }
                ["OUTVAR", variable, ..] => {
                    if let Some(prefix) = &prefix {
                        let name = variable.trim_start_matches("OUT_").to_lowercase();
                        let width = if LAYERED_VARIABLES.contains(&name.as_str()) {
                            nlayers
                        } else {
                            1
                        };

                        layout.columns.insert(name, (prefix.clone(), column));
                        column += width;
                    }
                }
                _ => {}
            }
        }

        let forcing = format!("{}/{}", FORCING_DIR, FORCING_PREFIX);
        for (column, name) in ["rainf", "tmax", "tmin"].iter().enumerate() {
            layout
                .columns
                .insert(name.to_string(), (forcing.clone(), column));
        }

        layout
    }

    /// File prefix and first column of a variable.
    pub fn column(&self, variable: &str) -> Option<(&str, usize)> {
        self.columns
            .get(variable)
            .map(|(prefix, column)| (prefix.as_str(), *column))
    }
}

fn is_forcing_prefix(prefix: &str) -> bool {
    prefix.starts_with(FORCING_DIR)
}

/// Same calendar day some years later, or the first of March
/// for 29 February moved to a common year.
fn shift_years(date: NaiveDate, years: u32) -> NaiveDate {
    let year = date.year() + years as i32;

    date.with_year(year)
        .or_else(|| NaiveDate::from_ymd_opt(year, 3, 1))
        .unwrap_or(date)
}

/// Parsed rows of a pixel file, `None` when the file does not exist.
///
/// Columns are separated by any run of tabs and spaces.
fn read_rows(path: &Path) -> Result<Option<Vec<Vec<f64>>>, InstanceError> {
    if !path.is_file() {
        return Ok(None);
    }

    let mut reader = ReaderBuilder::new()
        .has_headers(false)
        .delimiter(b'\t')
        .trim(Trim::All)
        .flexible(true)
        .from_path(path)?;

    let mut rows = vec![];

    for record in reader.records() {
        let record = record?;
        let row = record
            .iter()
            .flat_map(|field| field.split_whitespace())
            .map(|field| field.parse::<f64>())
            .collect::<Result<Vec<_>, _>>()
            .map_err(|_| {
                InstanceError::MalformedFile(path.display().to_string(), "non-numeric value")
            })?;

        if !row.is_empty() {
            rows.push(row);
        }
    }

    Ok(Some(rows))
}

/// Date of an output row from its leading year, month and day columns.
fn row_date(row: &[f64]) -> Option<NaiveDate> {
    match row {
        [year, month, day, ..] => NaiveDate::from_ymd_opt(*year as i32, *month as u32, *day as u32),
        _ => None,
    }
}

impl SimulationInstance {
    /// Output layout of the control file written for this run.
    pub fn output_layout(&self) -> Result<OutputLayout, InstanceError> {
        let control = fs::read_to_string(self.path().join(CONTROL_FILE))?;
        Ok(OutputLayout::parse(&control, self.context.model.nlayers))
    }

    /// Reads the selected variables of every pixel into
    /// (day, layer, row, column) arrays covering the window after
    /// the warm-up years. Cells without output hold the no-data value.
    pub fn read_output(
        &self,
        variables: &[String],
        drought: &[Box<dyn DroughtIndex>],
    ) -> Result<Vec<OutputVariable>, InstanceError> {
        let domain = self.require_domain("reading output")?;
        let layout = self.output_layout()?;
        let nlayers = self.context.model.nlayers;

        let start = shift_years(self.window.start, layout.skip_years);
        let days = (self.window.end - start).num_days() + 1;

        if days < 1 {
            warn!("Warm-up covers the whole simulation, no output to read");
            return Ok(vec![]);
        }

        let days = days as usize;
        let offset = (start - self.window.start).num_days();
        let (nrows, ncols) = domain.shape();

        let indices: FxHashMap<&str, &dyn DroughtIndex> =
            drought.iter().map(|d| (d.name(), d.as_ref())).collect();

        // model variables to decode, including sources of drought indices
        let mut decoded: Vec<String> = vec![];
        let mut requested: Vec<String> = vec![];

        for variable in variables {
            let source = match indices.get(variable.as_str()) {
                Some(index) => index.source().to_string(),
                None => variable.clone(),
            };

            if layout.column(&source).is_none() {
                warn!("Variable {} not found in output files. Skipping import", variable);
                continue;
            }

            requested.push(variable.clone());
            if !decoded.contains(&source) {
                decoded.push(source);
            }
        }

        let mut data: FxHashMap<String, Array4<f32>> = decoded
            .iter()
            .map(|v| {
                let layers = if LAYERED_VARIABLES.contains(&v.as_str()) { nlayers } else { 1 };
                (v.clone(), Array4::from_elem((days, layers, nrows, ncols), NODATA))
            })
            .collect();

        let prefixes: FxHashSet<&str> = decoded
            .iter()
            .filter_map(|v| layout.column(v).map(|(prefix, _)| prefix))
            .collect();

        let mut simulated = vec![];

        for pixel in domain.pixels() {
            let (row, col) = domain.cell(pixel);
            let mut found = false;

            for prefix in &prefixes {
                let path = self.path().join(domain.pixel_file_name(prefix, pixel));
                let forcing = is_forcing_prefix(prefix);

                let lines = match read_rows(&path)? {
                    Some(lines) => lines,
                    None => {
                        warn!("Missing output file {:?}", path);
                        continue;
                    }
                };
                found = true;

                for (i, line) in lines.iter().enumerate() {
                    let t = if forcing {
                        i as i64 - offset
                    } else {
                        match row_date(line) {
                            Some(date) => (date - start).num_days(),
                            None => continue,
                        }
                    };

                    if t < 0 || t as usize >= days {
                        continue;
                    }

                    for variable in &decoded {
                        let column = match layout.column(variable) {
                            Some((file, column)) if file == *prefix => column,
                            _ => continue,
                        };

                        if let Some(values) = data.get_mut(variable) {
                            for layer in 0..values.dim().1 {
                                if let Some(value) = line.get(column + layer) {
                                    values[[t as usize, layer, row, col]] = *value as f32;
                                }
                            }
                        }
                    }
                }
            }

            if found {
                simulated.push((row, col));
                debug!("Read output for {}|{}", pixel.lat, pixel.lon);
            }
        }

        let mut outputs = vec![];

        for variable in requested {
            let values = match indices.get(variable.as_str()) {
                Some(index) => {
                    match drought_index(*index, &data, &simulated, days, nrows, ncols) {
                        Some(values) => values,
                        None => {
                            warn!("Drought index {} could not be computed, not saving it", variable);
                            continue;
                        }
                    }
                }
                None => match data.get(&variable) {
                    Some(values) => values.clone(),
                    None => continue,
                },
            };

            outputs.push(OutputVariable {
                name: variable,
                start,
                data: values,
            });
        }

        Ok(outputs)
    }

    /// Saves selected output variables to the store (optionally tagged
    /// with an ensemble index) or copies the working directory,
    /// without text parameter files, to a directory.
    pub fn save(
        &self,
        target: &SaveTarget,
        variables: &[String],
        initialize: bool,
        skip_days: usize,
        ensemble: Option<i32>,
        drought: &[Box<dyn DroughtIndex>],
    ) -> Result<(), InstanceError> {
        match target {
            SaveTarget::Store => {
                let domain = self.require_domain("saving output")?;

                if domain.is_empty() {
                    info!("No pixels simulated, not saving any output");
                    return Ok(());
                }

                let encoder = OutputEncoder::new(self.context.store.as_ref(), &self.context.name);
                let options = SaveOptions {
                    initialize,
                    skip_days,
                    ensemble,
                };

                for output in self.read_output(variables, drought)? {
                    encoder.save(&output, domain, &options)?;
                }
            }
            SaveTarget::Directory(dest) => {
                if initialize && dest.is_dir() {
                    fs::remove_dir_all(dest)?;
                }

                copy_without_text(self.path(), dest)?;
                info!("Copied simulation files to {:?}", dest);
            }
        }

        Ok(())
    }
}

/// Drought index of every simulated pixel from its source series.
fn drought_index(
    index: &dyn DroughtIndex,
    data: &FxHashMap<String, Array4<f32>>,
    simulated: &[(usize, usize)],
    days: usize,
    nrows: usize,
    ncols: usize,
) -> Option<Array4<f32>> {
    let source = data.get(index.source())?;
    let mut values = Array4::from_elem((days, 1, nrows, ncols), NODATA);

    for &(row, col) in simulated {
        let series = source.slice(s![.., 0, row, col]).to_vec();
        let computed = index.compute(&series)?;

        if computed.len() != days {
            return None;
        }

        for (t, value) in computed.into_iter().enumerate() {
            values[[t, 0, row, col]] = value;
        }
    }

    Some(values)
}

/// Recursively copies a directory, leaving out `*.txt` files.
fn copy_without_text(from: &Path, to: &Path) -> Result<(), InstanceError> {
    fs::create_dir_all(to)?;

    for entry in fs::read_dir(from)? {
        let path = entry?.path();
        let target = match path.file_name() {
            Some(name) => to.join(name),
            None => continue,
        };

        if path.is_dir() {
            copy_without_text(&path, &target)?;
        } else if path.extension().map_or(true, |ext| ext != "txt") {
            fs::copy(&path, &target)?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{read_rows, row_date, shift_years, OutputLayout};
    use chrono::NaiveDate;
    use std::fs;

    const CONTROL: &str = "NLAYER\t3\nSKIPYEAR\t1\nRESULT_DIR\t/tmp/out\n\
        OUTFILE\teb\t2\nOUTVAR\tOUT_LATENT\nOUTVAR\tOUT_SURF_TEMP\n\
        OUTFILE\twb\t3\nOUTVAR\tOUT_RUNOFF\nOUTVAR\tOUT_SOIL_MOIST\nOUTVAR\tOUT_SWE\n";

    #[test]
    fn layout_counts_layers() {
        let layout = OutputLayout::parse(CONTROL, 3);

        assert_eq!(layout.skip_years, 1);
        assert_eq!(layout.column("latent"), Some(("output/eb", 3)));
        assert_eq!(layout.column("surf_temp"), Some(("output/eb", 4)));
        assert_eq!(layout.column("runoff"), Some(("output/wb", 3)));
        assert_eq!(layout.column("soil_moist"), Some(("output/wb", 4)));
        assert_eq!(layout.column("swe"), Some(("output/wb", 7)));
        assert_eq!(layout.column("tmin"), Some(("forcings/data", 2)));
        assert_eq!(layout.column("evap"), None);
    }

    #[test]
    fn leap_day_warm_up() {
        let leap = NaiveDate::from_ymd_opt(2020, 2, 29).unwrap();

        assert_eq!(shift_years(leap, 4), NaiveDate::from_ymd_opt(2024, 2, 29).unwrap());
        assert_eq!(shift_years(leap, 1), NaiveDate::from_ymd_opt(2021, 3, 1).unwrap());
    }

    #[test]
    fn rows_split_on_any_whitespace() {
        let root = tempfile::tempdir().unwrap();
        let path = root.path().join("wb_0.125_30.375");
        fs::write(&path, "2021\t1\t1\t0.5\t0.3\n2021  1   2    1.5 0.25\n\n 2021 1 3\t2.5  \t0.2\n").unwrap();

        let rows = read_rows(&path).unwrap().unwrap();

        assert_eq!(rows.len(), 3);
        assert_eq!(rows[1], vec![2021.0, 1.0, 2.0, 1.5, 0.25]);
        assert_eq!(rows[2][3], 2.5);
        assert_eq!(row_date(&rows[2]), NaiveDate::from_ymd_opt(2021, 1, 3));

        assert!(read_rows(&root.path().join("missing")).unwrap().is_none());

        fs::write(&path, "2021 1 1 n/a\n").unwrap();
        assert!(read_rows(&path).is_err());
    }
}
