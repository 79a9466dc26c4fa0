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

//! Reading system files as the logical model.
//!
//! [crate::raw] reads a system file as a sequence of records; this module
//! reconciles those records into [Metadata] and typed rows.  The division of
//! labor matters because metadata for one variable is spread over several
//! record kinds that must be combined, and because none of the text in those
//! records can be decoded until the character encoding is known, which may
//! be declared *after* the text it applies to.

use std::{cell::RefCell, io::BufRead, io::Seek, ops::Range};

use binrw::Endian;
use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use encoding_rs::Encoding;
use itertools::zip_eq;
use thiserror::Error as ThisError;

use crate::{
    calendar::seconds_to_date_time,
    data::{Datum, Value},
    dictionary::{Metadata, MissingValues, MissingValuesError, VarWidth, Variable},
    format::Format,
    raw::{
        self, infer_encodings,
        records::{
            Compression, DocumentRecord, EncodingRecord, Extension, FileHeader, FloatInfoRecord,
            IntegerInfoRecord, LongName, LongNamesRecord, LongStringMissingValueRecord,
            LongStringValueLabelRecord, ValueLabel, ValueLabelRecord, VarDisplayRecord,
            VariableRecord, VeryLongStringsRecord, ZHeader, ZTrailer,
        },
        DecodedRecord, Decoder, RawCases, RawWidth,
    },
};

/// An error (or warning) encountered while assembling the logical model.
///
/// Structural errors abort the read; the rest are reported through the
/// warning callback and reading continues.
#[derive(ThisError, Debug)]
pub enum Error {
    /// Error from the record layer.
    #[error(transparent)]
    Raw(#[from] raw::Error),

    /// Bad creation date.
    #[error("File creation date {creation_date} is not in the expected \"DD MMM YY\" format.  Using 01 Jan 1970.")]
    InvalidCreationDate {
        /// The unparseable date.
        creation_date: String,
    },

    /// Bad creation time.
    #[error("File creation time {creation_time} is not in the expected \"HH:MM:SS\" format.  Using midnight.")]
    InvalidCreationTime {
        /// The unparseable time.
        creation_time: String,
    },

    /// Duplicate variable name.
    #[error("Renaming variable with duplicate name {duplicate_name:?} to {new_name:?}.")]
    DuplicateVariableName {
        /// The name appearing a second time.
        duplicate_name: String,
        /// Replacement name.
        new_name: String,
    },

    /// Invalid output format.
    #[error("Substituting {new_format} for invalid output format on variable {variable:?}.")]
    InvalidFormat {
        /// Substituted format.
        new_format: Format,
        /// The affected variable.
        variable: String,
    },

    /// Declared missing values don't match their kind.
    #[error("Invalid missing values on variable {variable:?}: {source}")]
    InvalidMissingValueArity {
        /// The affected variable.
        variable: String,
        /// Details.
        source: MissingValuesError,
    },

    /// A wide string's continuation records are absent.
    #[error("Variable record at index {start_index} is a {width} that should be followed by long string continuation records through index {end_index} (inclusive), but index {error_index} is not a continuation")]
    MissingLongStringContinuation {
        /// The width of the bad record.
        width: RawWidth,
        /// Record index of the string.
        start_index: usize,
        /// Expected record index of the final continuation.
        end_index: usize,
        /// Record index where a continuation was missing.
        error_index: usize,
    },

    /// Header's variable position count disagrees with the variable records.
    #[error("File header claims {expected} variable positions but {actual} were read from file.")]
    WrongVariablePositions {
        /// Number of variable positions actually read.
        actual: usize,
        /// Number claimed by the header.
        expected: usize,
    },

    /// Wrong number of display parameter entries.
    #[error("Variable display record contains {count} entries but the file has {expected} named variable records.")]
    WrongDisplayParameterCount {
        /// Number of entries.
        count: usize,
        /// Number expected.
        expected: usize,
    },

    /// Compact value labels attached to long string variables.
    #[error("At offsets {:#x}...{:#x}, record types 3 and 4 may not add value labels to one or more long string variables: {variables:?}", .offsets.start, .offsets.end)]
    InvalidLongStringValueLabels {
        /// Offsets of the record.
        offsets: Range<u64>,
        /// The long string variables.
        variables: Vec<String>,
    },

    /// Duplicate value labels.
    #[error("{variable:?} has duplicate value labels for {n_duplicates} value(s).")]
    DuplicateValueLabels {
        /// The affected variable.
        variable: String,
        /// How many values were labeled more than once.
        n_duplicates: usize,
    },

    /// Very long string override for an unknown or too-short variable.
    #[error("Variable with short name {short_name:?} listed in very long string record with width {width}, which requires only one segment.")]
    ShortVeryLongString {
        /// The short name.
        short_name: String,
        /// The declared width.
        width: u16,
    },

    /// Very long string override runs off the end of the variable list.
    #[error("Variable with short name {short_name:?} listed in very long string record with width {width} requires {n_segments} segments, but only {available} variables follow it.")]
    VeryLongStringOverflow {
        /// The short name.
        short_name: String,
        /// The declared width.
        width: u16,
        /// Number of segments required.
        n_segments: usize,
        /// Number of variables available.
        available: usize,
    },

    /// Very long string segment has the wrong width.
    #[error("Variable with short name {short_name:?} listed in very long string record with width {width} has segment {index} of width {actual} (expected {expected}).")]
    VeryLongStringInvalidSegmentWidth {
        /// The short name.
        short_name: String,
        /// The declared width.
        width: u16,
        /// Segment index.
        index: usize,
        /// Actual segment width.
        actual: usize,
        /// Expected segment width.
        expected: usize,
    },

    /// A record referenced a variable that doesn't exist.
    #[error("Unknown variable name {name:?} in {record}.")]
    UnknownVariable {
        /// The record kind doing the referencing.
        record: &'static str,
        /// The name that didn't resolve.
        name: String,
    },

    /// Long string record applied to a variable of the wrong shape.
    #[error("Ignoring {record} for variable {name:?}, which is not a long string variable.")]
    NotALongString {
        /// The record kind.
        record: &'static str,
        /// The variable.
        name: String,
    },

    /// Duplicate long variable name.
    #[error("Duplicate long variable name {0:?}.")]
    DuplicateLongName(String),

    /// Unknown extension subtype (skipped, not fatal).
    #[error("Unknown extension record with subtype {subtype} at offset {offset:#x}, consisting of {count} {size}-byte units.")]
    UnknownExtensionRecord {
        /// Offset of the record's payload.
        offset: u64,
        /// Subtype.
        subtype: u32,
        /// Element size.
        size: u32,
        /// Element count.
        count: u32,
    },

    /// Unexpected floating-point representation.
    #[error("Floating-point representation indicated by system file ({0}) differs from expected (1).")]
    UnexpectedFloatFormat(i32),

    /// Integer info endianness disagrees with the detected byte order.
    #[error("Integer format indicated by system file ({actual}) differs from expected ({expected}).")]
    UnexpectedEndianness {
        /// Value in the file.
        actual: i32,
        /// Value implied by the detected byte order.
        expected: i32,
    },
}

/// A warning while reading a system file: either a raw record problem or an
/// assembly problem.
#[derive(ThisError, Debug)]
pub enum Warning {
    /// Record-level warning.
    #[error(transparent)]
    Raw(#[from] raw::Warning),

    /// Assembly-level warning.
    #[error(transparent)]
    Decode(#[from] Error),
}

/// The decoded records of a system file, sorted into one bucket per record
/// kind.
pub struct Headers {
    /// File header.
    pub header: FileHeader<String>,

    /// Variable records, continuations included, in order.
    pub variable: Vec<VariableRecord<String>>,

    /// Value label records.
    pub value_label: Vec<ValueLabelRecord<String>>,

    /// Document records.
    pub document: Vec<DocumentRecord<String>>,

    /// Machine integer info record.
    pub integer_info: Option<IntegerInfoRecord>,

    /// Machine floating-point info record.
    pub float_info: Option<FloatInfoRecord>,

    /// Variable display parameters.
    pub var_display: Option<VarDisplayRecord>,

    /// Long variable name records.
    pub long_names: Vec<LongNamesRecord>,

    /// Very long string records.
    pub very_long_strings: Vec<VeryLongStringsRecord>,

    /// Character encoding record.
    pub encoding: Option<EncodingRecord>,

    /// Long string value label records.
    pub long_string_value_labels: Vec<LongStringValueLabelRecord<String>>,

    /// Long string missing value records.
    pub long_string_missing_values: Vec<LongStringMissingValueRecord<String>>,

    /// Unrecognized extension records.
    pub other_extension: Vec<Extension>,

    /// End-of-headers record.
    pub end_of_headers: Option<u32>,

    /// ZLIB data header.
    pub z_header: Option<ZHeader>,

    /// ZLIB data trailer.
    pub z_trailer: Option<ZTrailer>,
}

fn take_first<T>(mut vec: Vec<T>) -> Option<T> {
    vec.drain(..).next()
}

impl Headers {
    /// Sorts `records` into buckets under `header`.
    pub fn new(header: FileHeader<String>, records: Vec<DecodedRecord>) -> Headers {
        let mut variable = Vec::new();
        let mut value_label = Vec::new();
        let mut document = Vec::new();
        let mut integer_info = Vec::new();
        let mut float_info = Vec::new();
        let mut var_display = Vec::new();
        let mut long_names = Vec::new();
        let mut very_long_strings = Vec::new();
        let mut encoding = Vec::new();
        let mut long_string_value_labels = Vec::new();
        let mut long_string_missing_values = Vec::new();
        let mut other_extension = Vec::new();
        let mut end_of_headers = Vec::new();
        let mut z_header = Vec::new();
        let mut z_trailer = Vec::new();

        for record in records {
            match record {
                DecodedRecord::Variable(record) => variable.push(record),
                DecodedRecord::ValueLabel(record) => value_label.push(record),
                DecodedRecord::Document(record) => document.push(record),
                DecodedRecord::IntegerInfo(record) => integer_info.push(record),
                DecodedRecord::FloatInfo(record) => float_info.push(record),
                DecodedRecord::VarDisplay(record) => var_display.push(record),
                DecodedRecord::LongNames(record) => long_names.push(record),
                DecodedRecord::VeryLongStrings(record) => very_long_strings.push(record),
                DecodedRecord::Encoding(record) => encoding.push(record),
                DecodedRecord::LongStringValueLabels(record) => {
                    long_string_value_labels.push(record)
                }
                DecodedRecord::LongStringMissingValues(record) => {
                    long_string_missing_values.push(record)
                }
                DecodedRecord::OtherExtension(record) => other_extension.push(record),
                DecodedRecord::EndOfHeaders(record) => end_of_headers.push(record),
                DecodedRecord::ZHeader(record) => z_header.push(record),
                DecodedRecord::ZTrailer(record) => z_trailer.push(record),
            }
        }

        Headers {
            header,
            variable,
            value_label,
            document,
            integer_info: take_first(integer_info),
            float_info: take_first(float_info),
            var_display: take_first(var_display),
            long_names,
            very_long_strings,
            encoding: take_first(encoding),
            long_string_value_labels,
            long_string_missing_values,
            other_extension,
            end_of_headers: take_first(end_of_headers),
            z_header: take_first(z_header),
            z_trailer: take_first(z_trailer),
        }
    }

    /// Assembles these records into [Metadata] plus file-level info, and
    /// rewires `cases` to the merged variable widths.
    ///
    /// `warn` receives non-fatal problems.
    pub fn decode(
        mut self,
        mut cases: RawCases,
        header_encoding: &'static Encoding,
        data_encoding: &'static Encoding,
        mut warn: impl FnMut(Error),
    ) -> Result<(Metadata, FileInfo, RawCases), Error> {
        if let Some(integer_info) = &self.integer_info {
            let floating_point_rep = integer_info.inner.floating_point_rep;
            if floating_point_rep != 1 {
                warn(Error::UnexpectedFloatFormat(floating_point_rep));
            }

            let expected = match self.header.endian {
                Endian::Big => 1,
                Endian::Little => 2,
            };
            let actual = integer_info.inner.endianness;
            if actual != 0 && actual != expected {
                warn(Error::UnexpectedEndianness { actual, expected });
            }
        }

        // Build one variable per named record.  Segments of very long
        // strings stay separate for now; they are merged further down, after
        // the positional records that still refer to them have been applied.
        let mut variables = Vec::new();
        let mut n_generated_names = 0;
        let mut var_index_map = std::collections::BTreeMap::new();
        let mut value_index = 0;
        for (index, input) in self
            .variable
            .iter()
            .enumerate()
            .filter(|(_index, record)| record.width != RawWidth::Continuation)
        {
            let name = input.name.trim_end().to_string();
            let name = if !name.is_empty()
                && !variables.iter().any(|v: &Variable| v.name == name)
            {
                name
            } else {
                let new_name = generate_name(&variables, &mut n_generated_names);
                warn(Error::DuplicateVariableName {
                    duplicate_name: name,
                    new_name: new_name.clone(),
                });
                new_name
            };

            let width = VarWidth::try_from(input.width).unwrap();
            let mut variable = Variable::new(name, width);

            variable.label = input
                .label
                .as_ref()
                .map(|label| label.trim_end().to_string())
                .filter(|label| !label.is_empty());

            match input.missing_values.decode() {
                Ok(missing_values) => variable.missing_values = missing_values,
                Err(source) => warn(Error::InvalidMissingValueArity {
                    variable: variable.name.clone(),
                    source,
                }),
            }

            // The write format decides how the variable's data is typed.
            variable.format = match Format::try_from(input.write_format) {
                Ok(format) => format,
                Err(_) => {
                    let new_format = Format::default_for_width(width);
                    warn(Error::InvalidFormat {
                        new_format,
                        variable: variable.name.clone(),
                    });
                    new_format
                }
            };

            // Check for the continuation records the width promises.
            let n_chunks = input.width.n_chunks().unwrap();
            for offset in 1..n_chunks {
                if self
                    .variable
                    .get(index + offset)
                    .is_none_or(|record| record.width != RawWidth::Continuation)
                {
                    warn(Error::MissingLongStringContinuation {
                        width: input.width,
                        start_index: index,
                        end_index: index + n_chunks - 1,
                        error_index: index + offset,
                    });
                    break;
                }
            }

            var_index_map.insert(value_index, variables.len());
            variables.push(variable);
            value_index += n_chunks;
        }

        if let Some(nominal_case_size) = self.header.nominal_case_size {
            if value_index != nominal_case_size as usize {
                warn(Error::WrongVariablePositions {
                    actual: value_index,
                    expected: nominal_case_size as usize,
                });
            }
        }

        // Value labels, correlated through 1-based value positions.
        for record in self.value_label.drain(..) {
            let mut positions = Vec::with_capacity(record.dict_indexes.len());
            let mut long_string_variables = Vec::new();
            for dict_index in &record.dict_indexes {
                let position = var_index_map[&(*dict_index as usize - 1)];
                if variables[position].width.is_long_string() {
                    long_string_variables.push(variables[position].name.clone());
                } else {
                    positions.push(position);
                }
            }
            if !long_string_variables.is_empty() {
                warn(Error::InvalidLongStringValueLabels {
                    offsets: record.offsets.clone(),
                    variables: long_string_variables,
                });
            }

            for position in positions {
                let variable = &mut variables[position];
                let mut n_duplicates = 0;
                for ValueLabel { datum, label } in record.labels.iter() {
                    let mut datum = datum.decode(variable.width);
                    datum.trim_end();
                    if variable
                        .value_labels
                        .insert(datum, label.clone())
                        .is_some()
                    {
                        n_duplicates += 1;
                    }
                }
                if n_duplicates > 0 {
                    warn(Error::DuplicateValueLabels {
                        variable: variable.name.clone(),
                        n_duplicates,
                    });
                }
            }
        }

        // Display parameters apply positionally, one entry per named record,
        // so segment entries are consumed here and discarded with their
        // segments in the merge below.
        if let Some(display) = &self.var_display {
            if display.0.len() != variables.len() {
                warn(Error::WrongDisplayParameterCount {
                    count: display.0.len(),
                    expected: variables.len(),
                });
            }
            for (display, variable) in display.0.iter().zip(variables.iter_mut()) {
                if let Some(measure) = display.measure {
                    variable.measure = measure;
                }
                if let Some(width) = display.width {
                    variable.display_width = width;
                }
                if let Some(alignment) = display.alignment {
                    variable.alignment = alignment;
                }
            }
        }

        // Merge very long strings: absorb each head's trailing segments and
        // restore its true width.
        let mut merged_any = false;
        for record in self
            .very_long_strings
            .drain(..)
            .flat_map(|record| record.0.into_iter())
        {
            let Some(index) = variables
                .iter()
                .position(|variable| variable.name == record.short_name)
            else {
                warn(Error::UnknownVariable {
                    record: "very long string record",
                    name: record.short_name,
                });
                continue;
            };
            let width = VarWidth::String(record.length);
            let n_segments = width.n_segments();
            if n_segments == 1 {
                warn(Error::ShortVeryLongString {
                    short_name: record.short_name,
                    width: record.length,
                });
                continue;
            }
            if index + n_segments > variables.len() {
                warn(Error::VeryLongStringOverflow {
                    short_name: record.short_name,
                    width: record.length,
                    n_segments,
                    available: variables.len() - index,
                });
                continue;
            }
            let mut bad_segment = None;
            for i in 0..n_segments {
                let alloc_width = width.segment_alloc_width(i);
                let segment_width = variables[index + i].width.as_string_width().unwrap_or(0);
                if segment_width.next_multiple_of(8) != alloc_width.next_multiple_of(8) {
                    bad_segment = Some((i, segment_width, alloc_width));
                    break;
                }
            }
            if let Some((i, actual, expected)) = bad_segment {
                warn(Error::VeryLongStringInvalidSegmentWidth {
                    short_name: record.short_name,
                    width: record.length,
                    index: i,
                    actual,
                    expected,
                });
                continue;
            }
            variables.drain(index + 1..index + n_segments);
            variables[index].resize(width);
            merged_any = true;
        }
        if merged_any {
            cases = cases.with_widths(variables.iter().map(|variable| variable.width));
        }

        // Long variable names.
        for LongName {
            short_name,
            long_name,
        } in self
            .long_names
            .drain(..)
            .flat_map(|record| record.0.into_iter())
        {
            let Some(index) = variables
                .iter()
                .position(|variable| variable.name == short_name)
            else {
                warn(Error::UnknownVariable {
                    record: "long variable names record",
                    name: short_name,
                });
                continue;
            };
            if variables
                .iter()
                .enumerate()
                .any(|(i, variable)| i != index && variable.name == long_name)
            {
                warn(Error::DuplicateLongName(long_name));
                continue;
            }
            variables[index].name = long_name;
        }

        // Long string value labels, decoded with the data encoding since the
        // labeled values are case data.
        for set in self
            .long_string_value_labels
            .drain(..)
            .flat_map(|record| record.labels.into_iter())
        {
            let Some(variable) = variables
                .iter_mut()
                .find(|variable| variable.name == set.var_name)
            else {
                warn(Error::UnknownVariable {
                    record: "long string value labels record",
                    name: set.var_name,
                });
                continue;
            };
            if !variable.width.is_long_string() {
                warn(Error::NotALongString {
                    record: "long string value labels record",
                    name: set.var_name,
                });
                continue;
            }
            for (value, label) in set.labels {
                let mut datum = Datum::String(value);
                datum.trim_end();
                variable.value_labels.insert(datum, label);
            }
        }

        // Long string missing values.
        for set in self
            .long_string_missing_values
            .drain(..)
            .flat_map(|record| record.values.into_iter())
        {
            let Some(variable) = variables
                .iter_mut()
                .find(|variable| variable.name == set.var_name)
            else {
                warn(Error::UnknownVariable {
                    record: "long string missing values record",
                    name: set.var_name,
                });
                continue;
            };
            if !variable.width.is_long_string() {
                warn(Error::NotALongString {
                    record: "long string missing values record",
                    name: set.var_name,
                });
                continue;
            }
            let values = set
                .missing_values
                .into_iter()
                .map(|value| {
                    let mut datum = Datum::String(value.as_slice().into());
                    datum.trim_end();
                    datum
                })
                .collect();
            match MissingValues::new(values, None) {
                Ok(missing_values) => variable.missing_values = missing_values,
                Err(source) => warn(Error::InvalidMissingValueArity {
                    variable: variable.name.clone(),
                    source,
                }),
            }
        }

        for record in self.other_extension.drain(..) {
            warn(Error::UnknownExtensionRecord {
                offset: record.offsets.start,
                subtype: record.subtype,
                size: record.size,
                count: record.count,
            });
        }

        let file_info = FileInfo::decode(&self, &mut warn);

        let mut metadata = Metadata::new(variables);
        metadata.bias = self.header.bias;
        metadata.n_cases = self.header.n_cases;
        metadata.header_encoding = header_encoding;
        metadata.data_encoding = data_encoding;
        metadata.documents = self
            .document
            .drain(..)
            .flat_map(|record| record.lines)
            .map(|line| line.trim_end().to_string())
            .collect();

        if let Some(n_cases) = metadata.n_cases {
            cases = cases.with_expected_cases(n_cases as u64);
        }
        Ok((metadata, file_info, cases))
    }
}

fn generate_name(variables: &[Variable], n_generated_names: &mut usize) -> String {
    loop {
        *n_generated_names += 1;
        let name = format!("VAR{:03}", *n_generated_names);
        if !variables.iter().any(|variable| variable.name == name) {
            return name;
        }
    }
}

/// File-level information that is not part of [Metadata]: who wrote the file,
/// when, and how.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileInfo {
    /// Date and time the file says it was written.
    pub creation: NaiveDateTime,

    /// Byte order of the file.
    pub endian: Endian,

    /// Compression format.
    pub compression: Compression,

    /// Product that wrote the file.
    pub product: String,

    /// Version of that product, from the integer info record.
    pub version: Option<(i32, i32, i32)>,
}

impl FileInfo {
    fn decode(headers: &Headers, warn: &mut impl FnMut(Error)) -> Self {
        let header = &headers.header;
        let creation_date = NaiveDate::parse_from_str(header.creation_date.trim(), "%e %b %y")
            .unwrap_or_else(|_| {
                warn(Error::InvalidCreationDate {
                    creation_date: header.creation_date.clone(),
                });
                Default::default()
            });
        let creation_time = NaiveTime::parse_from_str(header.creation_time.trim(), "%H:%M:%S")
            .unwrap_or_else(|_| {
                warn(Error::InvalidCreationTime {
                    creation_time: header.creation_time.clone(),
                });
                Default::default()
            });

        Self {
            creation: NaiveDateTime::new(creation_date, creation_time),
            endian: header.endian,
            compression: header.compression,
            product: header
                .eye_catcher
                .trim_start_matches("@(#) SPSS DATA FILE")
                .trim()
                .to_string(),
            version: headers.integer_info.as_ref().map(|info| {
                (
                    info.inner.version_major,
                    info.inner.version_minor,
                    info.inner.version_revision,
                )
            }),
        }
    }
}

/// How one column's raw data converts to [Value]s.  Chosen once per variable
/// from its width and format type.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum ColumnType {
    Number,
    String,
    DateTime,
}

impl ColumnType {
    fn new(variable: &Variable) -> Self {
        if variable.width.is_string() {
            Self::String
        } else if variable.format.type_().is_date() {
            Self::DateTime
        } else {
            Self::Number
        }
    }
}

/// Iterator over the typed rows of a system file.
///
/// Each item is one row, with one [Value] per variable, in variable order.
/// Dropping the iterator mid-file is the way to stop early; the underlying
/// stream is left for the caller to close.
pub struct Cases {
    raw: RawCases,
    columns: Vec<ColumnType>,
    data_encoding: &'static Encoding,
}

impl Cases {
    fn new(raw: RawCases, metadata: &Metadata) -> Self {
        Self {
            raw,
            columns: metadata.variables.iter().map(ColumnType::new).collect(),
            data_encoding: metadata.data_encoding,
        }
    }

    fn decode_datum(&self, datum: Datum, column: ColumnType) -> Value {
        match (column, datum) {
            (ColumnType::Number, Datum::Number(number)) => Value::Number(number),
            (ColumnType::DateTime, Datum::Number(number)) => {
                Value::DateTime(number.and_then(seconds_to_date_time))
            }
            (_, Datum::String(mut s)) => {
                s.trim_end();
                Value::String(s.decode(self.data_encoding).into_owned())
            }
            // A numeric datum under a string column (or vice versa) cannot
            // happen: the column table and the case reader are built from
            // the same widths.
            (_, datum) => Value::Number(datum.as_number().flatten()),
        }
    }
}

impl Iterator for Cases {
    type Item = Result<Vec<Value>, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        match self.raw.next()? {
            Ok(case) => Some(Ok(zip_eq(case.0, self.columns.iter())
                .map(|(datum, column)| self.decode_datum(datum, *column))
                .collect())),
            Err(error) => Some(Err(error.into())),
        }
    }
}

/// A read system file: its metadata, file-level info, and a row iterator.
pub struct SystemFile {
    /// The logical model.
    pub metadata: Metadata,

    /// File-level information.
    pub file_info: FileInfo,

    /// The rows.
    pub cases: Cases,
}

/// Options for reading a system file.
pub struct ReadOptions<'a> {
    warn: Box<dyn FnMut(Warning) + 'a>,
}

impl<'a> ReadOptions<'a> {
    /// Constructs read options that report warnings through `warn`.
    pub fn new(warn: impl FnMut(Warning) + 'a) -> Self {
        Self {
            warn: Box::new(warn),
        }
    }

    /// Reads the headers of a system file from `reader`, returning a
    /// [SystemFile] whose `cases` iterator reads rows on demand.
    pub fn open_reader<R>(self, reader: R) -> Result<SystemFile, Error>
    where
        R: BufRead + Seek + 'static,
    {
        let warn = RefCell::new(self.warn);

        let mut reader = raw::Reader::new(reader, |warning: raw::Warning| {
            (warn.borrow_mut().as_mut())(Warning::Raw(warning))
        })?;
        let mut records = Vec::new();
        for record in reader.records() {
            records.push(record?);
        }

        let mut warn_raw = |warning: raw::Warning| {
            (warn.borrow_mut().as_mut())(Warning::Raw(warning))
        };
        let (header_encoding, data_encoding) = infer_encodings(&records, &mut warn_raw)?;

        let mut decoder = Decoder::new(header_encoding, |warning: raw::Warning| {
            (warn.borrow_mut().as_mut())(Warning::Raw(warning))
        });
        let header = reader.header().clone().decode(&mut decoder);
        let records: Vec<DecodedRecord> = records
            .into_iter()
            .map(|record| record.decode(&mut decoder))
            .collect();
        drop(decoder);

        let headers = Headers::new(header, records);
        let (metadata, file_info, cases) =
            headers.decode(reader.cases(), header_encoding, data_encoding, |error| {
                (warn.borrow_mut().as_mut())(Warning::Decode(error))
            })?;

        let cases = Cases::new(cases, &metadata);
        Ok(SystemFile {
            metadata,
            file_info,
            cases,
        })
    }
}

/// A fully materialized system file: metadata plus every row.
#[derive(Clone, Debug)]
pub struct DataSet {
    /// The logical model.
    pub metadata: Metadata,

    /// All rows, one `Vec<Value>` per case.
    pub cases: Vec<Vec<Value>>,
}

impl DataSet {
    /// Reads an entire system file from `reader`, discarding warnings.
    pub fn read<R>(reader: R) -> Result<Self, Error>
    where
        R: BufRead + Seek + 'static,
    {
        Self::read_with_warnings(reader, |_| ())
    }

    /// Reads an entire system file from `reader`, reporting warnings through
    /// `warn`.
    pub fn read_with_warnings<R>(reader: R, warn: impl FnMut(Warning)) -> Result<Self, Error>
    where
        R: BufRead + Seek + 'static,
    {
        let system_file = ReadOptions::new(warn).open_reader(reader)?;
        let mut cases = Vec::new();
        for case in system_file.cases {
            cases.push(case?);
        }
        Ok(Self {
            metadata: system_file.metadata,
            cases,
        })
    }
}
