// sysfile - reading and writing SPSS system files.
// Copyright (C) 2025 Free Software Foundation, Inc.
//
// This program is free software: you can redistribute it and/or modify it under
// the terms of the GNU General Public License as published by the Free Software
// Foundation, either version 3 of the License, or (at your option) any later
// version.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE.  See the GNU General Public License for more
// details.
//
// You should have received a copy of the GNU General Public License along with
// this program.  If not, see <http://www.gnu.org/licenses/>.

//! Reading and writing system files.
//!
//! This crate reads and writes "system files", the binary `.sav` format for
//! SPSS data files.  A system file is a self-describing container holding
//! typed, labeled statistical variables and row-oriented case data,
//! byte-compressed and optionally wrapped in ZLIB blocks (`.zsav`).
//!
//! The layers, bottom up:
//!
//! - [endian], [data], [format], [dictionary]: primitives and the logical
//!   model ([dictionary::Metadata] and its [dictionary::Variable]s).
//! - [raw]: records as they exist in the file, including the compression
//!   bytecode and the ZLIB block container.
//! - [cooked]: assembles raw records into the logical model and types the
//!   rows; start at [cooked::ReadOptions] or [cooked::DataSet::read].
//! - [write]: the inverse; start at [write::WriteOptions] or
//!   [cooked::DataSet]'s `write`.
//!
//! To read a file in the simplest way:
//!
//! ```no_run
//! use std::{fs::File, io::BufReader};
//! use sysfile::DataSet;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let data_set = DataSet::read(BufReader::new(File::open("data.sav")?))?;
//! for variable in &data_set.metadata.variables {
//!     println!("{}", variable.name);
//! }
//! # Ok(())
//! # }
//! ```

// Warn about missing docs, but not for items declared with `#[cfg(test)]`.
#![cfg_attr(not(test), warn(missing_docs))]

pub mod calendar;
pub mod codepage;
pub mod cooked;
pub mod data;
pub mod dictionary;
pub mod endian;
pub mod format;
pub mod raw;
pub mod write;

pub use cooked::{Cases, DataSet, FileInfo, ReadOptions, SystemFile};
pub use data::{Datum, RawString, Value};
pub use dictionary::{
    Alignment, Measure, Metadata, MissingValueRange, MissingValues, VarWidth, Variable,
};
pub use format::{Format, Type};
pub use raw::records::Compression;
pub use write::{WriteOptions, Writer};

#[cfg(test)]
mod tests;
