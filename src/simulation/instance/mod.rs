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

//! Module containing a single run of the land-surface model.
//!
//! A [`SimulationInstance`] owns a temporary working directory in which
//! it writes every file the model reads: the soil parameter file, one
//! weather file per pixel and the global control file. It then runs the
//! model executable against the control file and decodes the per-pixel
//! output files it produced. The working directory is removed when the
//! instance is dropped.
//!
//! Soil, weather and output file names all carry pixel coordinates
//! formatted with the same precision ([`Domain::pixel_file_name`]),
//! otherwise the instance would not find its own output.

mod control;
mod output;

pub use control::{expand_variable_groups, ControlOptions};
pub use output::{DroughtIndex, OutputLayout, OutputVariable};

use super::domain::{Domain, Extent, Pixel, TimeWindow};
use super::forcing::ForcingSeries;
use super::RunContext;
use crate::constants::{CONTROL_FILE, FORCING_DIR, FORCING_PREFIX, OUTPUT_DIR, SOIL_FILE};
use crate::errors::{InstanceError, StoreError};
use log::{debug, info};
use std::fs;
use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tempfile::TempDir;

/// Interval of checking whether the model process has exited.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// One model run with its working directory.
#[derive(Debug)]
pub struct SimulationInstance {
    context: Arc<RunContext>,
    workdir: TempDir,
    window: TimeWindow,
    domain: Option<Arc<Domain>>,
    state_file: Option<PathBuf>,
}

impl SimulationInstance {
    /// Creates the instance with a fresh working directory.
    pub fn new(context: Arc<RunContext>, window: TimeWindow) -> Result<Self, InstanceError> {
        fs::create_dir_all(&context.paths.work)?;
        let work = fs::canonicalize(&context.paths.work)?;

        let workdir = tempfile::Builder::new().prefix("heas").tempdir_in(work)?;

        debug!("Created model working directory {:?}", workdir.path());

        Ok(SimulationInstance {
            context,
            workdir,
            window,
            domain: None,
            state_file: None,
        })
    }

    pub fn path(&self) -> &Path {
        self.workdir.path()
    }

    pub fn window(&self) -> TimeWindow {
        self.window
    }

    pub fn set_window(&mut self, window: TimeWindow) {
        self.window = window;
    }

    pub fn domain(&self) -> Option<&Arc<Domain>> {
        self.domain.as_ref()
    }

    /// State file the model writes at the end of the window,
    /// known once the control file requested it.
    pub fn state_file(&self) -> Option<&Path> {
        self.state_file.as_deref()
    }

    pub fn context(&self) -> &RunContext {
        &self.context
    }

    fn require_domain(&self, operation: &'static str) -> Result<&Arc<Domain>, InstanceError> {
        self.domain
            .as_ref()
            .ok_or(InstanceError::MissingDomain(operation))
    }

    /// Writes the soil parameter file of the basin and sets the instance domain.
    ///
    /// The first call for a simulation name builds its persistent domain
    /// table from soil catalog cells within the extent, later calls
    /// (also from other runs) reuse that table.
    pub fn write_soil_file(&mut self, extent: &Extent) -> Result<Arc<Domain>, InstanceError> {
        let store = &self.context.store;
        let name = &self.context.name;

        let mut records = match store.basin(name)? {
            Some(records) => records,
            None => {
                let soils = store.soils(self.context.resolution(), extent)?;

                if soils.is_empty() {
                    return Err(InstanceError::EmptyDomain(name.clone()));
                }

                if store.create_basin(name, soils)? {
                    info!("Created domain table of {}", name);
                }

                store
                    .basin(name)?
                    .ok_or_else(|| StoreError::MissingBasin(name.clone()))?
            }
        };

        records.sort_by_key(|r| r.gid);

        let mut soil = String::new();
        for record in &records {
            soil.push_str(record.line.trim_end());
            soil.push('\n');
        }
        fs::write(self.path().join(SOIL_FILE), soil)?;

        let pixels = records
            .into_iter()
            .map(|r| Pixel {
                gid: r.gid,
                lat: r.lat,
                lon: r.lon,
                elev: r.elev,
                depths: r.depths,
            })
            .collect();

        let domain = Arc::new(Domain::new(pixels, self.context.resolution()));
        debug!("Domain of {} has {} pixels", name, domain.len());

        self.domain = Some(Arc::clone(&domain));
        Ok(domain)
    }

    /// Reuses the domain and soil file written by another instance.
    pub fn share_domain(&mut self, domain: Arc<Domain>, soil_file: &Path) -> Result<(), InstanceError> {
        fs::copy(soil_file, self.path().join(SOIL_FILE))?;
        self.domain = Some(domain);

        Ok(())
    }

    /// Writes one weather file per pixel, a line per day
    /// with precipitation, maximum and minimum temperature and wind.
    pub fn write_forcings(&self, series: &ForcingSeries) -> Result<(), InstanceError> {
        let domain = self.require_domain("writing forcings")?;
        let dir = self.path().join(FORCING_DIR);
        fs::create_dir_all(&dir)?;

        for (position, pixel) in domain.pixels().iter().enumerate() {
            let filename = domain.pixel_file_name(FORCING_PREFIX, pixel);
            debug!("Writing {}", filename);

            let mut writer = csv::WriterBuilder::new()
                .delimiter(b' ')
                .has_headers(false)
                .from_path(dir.join(&filename))?;

            for day in 0..series.window.days() {
                let [precip, tmax, tmin, wind] = series.day(position, day);

                writer.write_record(&[
                    format!("{:.6}", precip),
                    format!("{:.2}", tmax),
                    format!("{:.2}", tmin),
                    format!("{:.1}", wind),
                ])?;
            }

            writer.flush()?;
        }

        Ok(())
    }

    /// Runs the model executable and waits for it to exit.
    ///
    /// Both output streams of the process are logged line by line.
    /// When the model has a timeout set the process is killed after it.
    pub fn run(&self, executable: &Path) -> Result<(), InstanceError> {
        info!("Running model in {:?}", self.path());
        fs::create_dir_all(self.path().join(OUTPUT_DIR))?;

        let mut child = Command::new(executable)
            .arg("-g")
            .arg(self.path().join(CONTROL_FILE))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        let loggers: Vec<_> = [
            child.stdout.take().map(|s| Box::new(s) as Box<dyn Read + Send>),
            child.stderr.take().map(|s| Box::new(s) as Box<dyn Read + Send>),
        ]
        .into_iter()
        .flatten()
        .map(|stream| {
            thread::spawn(move || {
                for line in BufReader::new(stream).lines().map_while(Result::ok) {
                    debug!("{}", line.trim());
                }
            })
        })
        .collect();

        let started = Instant::now();
        let timeout = self.context.model.timeout;

        let status = loop {
            if let Some(status) = child.try_wait()? {
                break Some(status);
            }

            if let Some(limit) = timeout {
                if started.elapsed() >= Duration::from_secs(limit) {
                    child.kill()?;
                    child.wait()?;
                    break None;
                }
            }

            thread::sleep(POLL_INTERVAL);
        };

        for logger in loggers {
            // a panicking logger loses only log lines
            let _ = logger.join();
        }

        match status {
            Some(status) if status.success() => Ok(()),
            Some(status) => Err(InstanceError::ProcessFailed(status.code())),
            None => Err(InstanceError::TimedOut(timeout.unwrap_or_default())),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::SimulationInstance;
    use crate::simulation::configuration::{ModelOptions, Paths};
    use crate::simulation::domain::{Extent, TimeWindow};
    use crate::simulation::forcing::ForcingSeries;
    use crate::simulation::store::{MemoryStore, ParameterSet, RasterStore, SoilRecord};
    use crate::simulation::RunContext;
    use chrono::NaiveDate;
    use ndarray::Array2;
    use rayon::ThreadPoolBuilder;
    use std::fs;
    use std::path::Path;
    use std::sync::Arc;

    /// Store with a 2 × 2 basin at 0.25 degree and parameter files in `data`.
    pub fn test_context(root: &Path, store: Arc<MemoryStore>) -> Arc<RunContext> {
        let data = root.join("data");
        fs::create_dir_all(&data).unwrap();
        fs::write(data.join("snowbands"), "1 0.5 0.5 100 200 1 1\n").unwrap();

        let parameters = ParameterSet {
            resolution: 0.25,
            veglib: "veglib".to_string(),
            vegparam: "vegparam".to_string(),
            snowbands: "snowbands".to_string(),
            root_zones: 2,
        };
        store.add_parameter_set(parameters.clone()).unwrap();

        let soils = [(1, 0.375, 30.125), (2, 0.375, 30.375), (3, 0.125, 30.125), (4, 0.125, 30.375)]
            .iter()
            .map(|&(gid, lat, lon)| SoilRecord {
                gid,
                lat,
                lon,
                elev: 1000.0,
                depths: vec![0.1, 0.3, 1.0],
                line: format!("1 {} {} {}", gid, lat, lon),
            })
            .collect();
        store.add_soils(0.25, soils).unwrap();

        Arc::new(RunContext {
            name: "basin".to_string(),
            store,
            parameters,
            paths: Paths {
                executable: root.join("model.sh"),
                data,
                work: root.join("work"),
            },
            model: ModelOptions::default(),
            extent: Extent {
                west: 30.0,
                east: 30.5,
                south: 0.0,
                north: 0.5,
            },
            threadpool: Arc::new(ThreadPoolBuilder::new().num_threads(2).build().unwrap()),
        })
    }

    pub fn window() -> TimeWindow {
        TimeWindow::new(
            NaiveDate::from_ymd_opt(2021, 1, 1).unwrap(),
            NaiveDate::from_ymd_opt(2021, 1, 5).unwrap(),
        )
    }

    #[test]
    fn soil_file_builds_domain_once() {
        let root = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new((10, 10)));
        let context = test_context(root.path(), Arc::clone(&store));

        let mut first = SimulationInstance::new(Arc::clone(&context), window()).unwrap();
        let domain = first.write_soil_file(&context.extent).unwrap();

        assert_eq!(domain.len(), 4);
        assert!(store.basin("basin").unwrap().is_some());

        let soil = fs::read_to_string(first.path().join("soil.txt")).unwrap();
        assert_eq!(soil.lines().count(), 4);
        assert!(soil.starts_with("1 1 0.375 30.125\n"));

        let mut second = SimulationInstance::new(context, window()).unwrap();
        second
            .share_domain(domain, &first.path().join("soil.txt"))
            .unwrap();
        assert_eq!(
            fs::read_to_string(second.path().join("soil.txt")).unwrap(),
            soil
        );

        let path = first.path().to_path_buf();
        drop(first);
        assert!(!path.exists());
    }

    #[test]
    fn forcing_files_follow_pixel_names() {
        let root = tempfile::tempdir().unwrap();
        let context = test_context(root.path(), Arc::new(MemoryStore::new((10, 10))));

        let mut instance = SimulationInstance::new(Arc::clone(&context), window()).unwrap();
        assert!(instance.write_forcings(&series(4)).is_err());

        instance.write_soil_file(&context.extent).unwrap();
        instance.write_forcings(&series(4)).unwrap();

        let text =
            fs::read_to_string(instance.path().join("forcings/data_0.375_30.375")).unwrap();
        let lines: Vec<&str> = text.lines().collect();

        assert_eq!(lines.len(), 5);
        assert_eq!(lines[2], "2.500000 22.00 12.00 3.0");
    }

    pub fn series(pixels: usize) -> ForcingSeries {
        let days = window().days();

        ForcingSeries {
            window: window(),
            gids: (1..=pixels as i64).collect(),
            precip: Array2::from_shape_fn((pixels, days), |(_, d)| d as f64 * 1.25),
            tmax: Array2::from_shape_fn((pixels, days), |(_, d)| 20.0 + d as f64),
            tmin: Array2::from_shape_fn((pixels, days), |(_, d)| 10.0 + d as f64),
            wind: Array2::from_elem((pixels, days), 3.0),
        }
    }
}
