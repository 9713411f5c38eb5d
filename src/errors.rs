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

//! Error types of every part of the system.
//!
//! Each layer has its own enum and converts the errors of the layers
//! below it with `#[from]`, so that the final message printed by `main`
//! tells both where and why the run stopped.

use chrono::NaiveDate;
use thiserror::Error;

use crate::simulation::assimilation::MemberPhase;
use crate::Float;

#[derive(Error, Debug)]
pub enum ModelError {
    #[error("Error while reading config.yaml: {0}")]
    Config(#[from] ConfigError),

    #[error("Error while creating ThreadPool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),

    #[error("Cannot limit the heap memory to {0} MB")]
    MemoryLimit(usize),

    #[error("Geospatial store operation failed: {0}")]
    Store(#[from] StoreError),

    #[error("Forcing retrieval failed: {0}")]
    Forcing(#[from] ForcingError),

    #[error("Simulation instance failed: {0}")]
    Instance(#[from] InstanceError),

    #[error("Output encoding failed: {0}")]
    Encoder(#[from] EncoderError),

    #[error("Ensemble simulation failed: {0}")]
    Ensemble(#[from] EnsembleError),

    #[error("State assimilation failed: {0}")]
    Assimilation(#[from] AssimilationError),
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Cannot open config.yaml: {0}")]
    CantOpenFile(#[from] std::io::Error),

    #[error("Cannot deserialize config.yaml: {0}")]
    CantDeserialize(#[from] serde_yaml::Error),

    #[error("Configuration component is out of bounds {0}")]
    OutOfBounds(&'static str),

    #[error("No model parameter set available in the store near resolution {0}")]
    NoResolution(Float),

    #[error("Unknown state variable {0}")]
    UnknownStateVariable(String),
}

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Cannot access the store archive: {0}")]
    Io(#[from] std::io::Error),

    #[error("Cannot read or write raster image: {0}")]
    Tiff(#[from] tiff::TiffError),

    #[error("Cannot read or write store catalog: {0}")]
    Catalog(#[from] serde_yaml::Error),

    #[error("Raster data does not match its shape: {0}")]
    Shape(#[from] ndarray::ShapeError),

    #[error("Table {0} does not exist in the store")]
    MissingTable(String),

    #[error("Domain table of simulation {0} does not exist in the store")]
    MissingBasin(String),

    #[error("Raster image {0} has unsupported sample format")]
    UnsupportedRaster(String),

    #[error("Store lock has been poisoned by a panicking thread")]
    Poisoned,
}

#[derive(Error, Debug)]
pub enum ForcingError {
    #[error("No data source provided for the {0} forcing")]
    NoDatasets(&'static str),

    #[error("Store query failed: {0}")]
    Store(#[from] StoreError),

    #[error("Tile worker stopped before sending its result")]
    WorkerLost,

    #[error("Cannot move a {0}-day series onto a {1}-day window")]
    WindowMismatch(usize, usize),
}

#[derive(Error, Debug)]
pub enum InstanceError {
    #[error("Cannot access simulation files: {0}")]
    Io(#[from] std::io::Error),

    #[error("Cannot read or write flat file: {0}")]
    Csv(#[from] csv::Error),

    #[error("Store operation failed: {0}")]
    Store(#[from] StoreError),

    #[error("Cannot persist output: {0}")]
    Encoder(#[from] EncoderError),

    #[error("Soil file has to be written before {0}")]
    MissingDomain(&'static str),

    #[error("No soil parameters found in the store for simulation {0}")]
    EmptyDomain(String),

    #[error("Model process exited abnormally (exit code {0:?})")]
    ProcessFailed(Option<i32>),

    #[error("Model process did not finish within {0} s and has been killed")]
    TimedOut(u64),

    #[error("Malformed model file {0}: {1}")]
    MalformedFile(String, &'static str),
}

#[derive(Error, Debug)]
pub enum EncoderError {
    #[error("Store operation failed: {0}")]
    Store(#[from] StoreError),

    #[error("Bulk load of {0} images returned no tiles")]
    EmptyLoad(usize),

    #[error("Output variable {0} has no days left to save")]
    NothingToSave(String),
}

#[derive(Error, Debug)]
pub enum EnsembleError {
    #[error("Cannot access ensemble output: {0}")]
    Io(#[from] std::io::Error),

    #[error("Member operation failed: {0}")]
    Instance(#[from] InstanceError),

    #[error("Forcing retrieval failed: {0}")]
    Forcing(#[from] ForcingError),

    #[error("Store operation failed: {0}")]
    Store(#[from] StoreError),

    #[error("State update failed: {0}")]
    Assimilation(#[from] AssimilationError),

    #[error("Not enough years in climatology to resample forcings for {0} - {1}")]
    NoResampleYears(NaiveDate, NaiveDate),

    #[error("No forecast generator registered under name {0}")]
    UnknownGenerator(String),

    #[error("Ensemble members failed: {}", describe_failures(.0))]
    MembersFailed(Vec<(usize, InstanceError)>),

    #[error("Ensemble member {0} did not write its state file")]
    NoStateFile(usize),

    #[error("Ensemble has no members")]
    Empty,
}

#[derive(Error, Debug)]
pub enum AssimilationError {
    #[error("Cannot access state or parameter file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed state file at line {0}: {1}")]
    MalformedState(usize, &'static str),

    #[error("Malformed parameter table {0}: {1}")]
    MalformedTable(String, &'static str),

    #[error("Cell {0} has {1} vegetation tiles in state file but {2} in vegetation table")]
    LayoutMismatch(i64, usize, usize),

    #[error("Cell {0} is missing from the {1} table")]
    UnknownCell(i64, &'static str),

    #[error("Ensemble has no member {0}")]
    UnknownMember(usize),

    #[error("Member {0} cannot move from {1:?} to {2:?}")]
    Transition(usize, MemberPhase, MemberPhase),

    #[error("Observation store query failed: {0}")]
    Store(#[from] StoreError),
}

/// Lists failed ensemble members with their 1-based labels.
fn describe_failures(failures: &[(usize, InstanceError)]) -> String {
    failures
        .iter()
        .map(|(member, err)| format!("[{}] {}", member + 1, err))
        .collect::<Vec<_>>()
        .join("; ")
}
