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

//! Writing system files.
//!
//! The writing path inverts [crate::cooked]'s assembly: from the logical
//! [Metadata] it generates unique 8-byte short names, splits very long
//! strings into segments with continuation records, and emits the info
//! records a reader needs to reassemble the original shape.  Files are
//! always written little-endian and always compressed (bytecode, optionally
//! inside ZLIB blocks).

use std::{
    borrow::Cow,
    collections::HashSet,
    fs::File,
    io::{BufWriter, Error as IoError, ErrorKind, Seek, SeekFrom, Write},
    path::Path,
};

use binrw::{BinResult, BinWrite, Endian, Error as BinError};
use chrono::{Local, NaiveDateTime};
use encoding_rs::Encoding;
use flate2::write::ZlibEncoder;
use smallvec::SmallVec;
use thiserror::Error as ThisError;

use crate::{
    calendar::date_time_to_seconds,
    codepage::codepage_from_encoding,
    cooked::DataSet,
    data::{Datum, Value},
    dictionary::{
        Alignment, Measure, Metadata, Variable, VarWidth, MAX_LABEL_LEN, MAX_NAME_LEN,
        MAX_VALUE_LABEL_LEN,
    },
    format::{Format, RawFormat},
    raw::{
        records::{
            Compression, FloatInfoRecord, RawHeader, RawIntegerInfoRecord, RawVariableRecord,
            RawZHeader, RawZTrailer, ZBlock,
        },
        Magic,
    },
};

/// An error encountered writing a system file.
#[derive(ThisError, Debug)]
pub enum Error {
    /// I/O error.
    #[error("I/O error ({0})")]
    Io(#[from] IoError),

    /// The 8-byte short name space ran out.
    #[error("Short name space exhausted for variable {0:?}.")]
    NamingSpaceExhausted(String),

    /// A case value doesn't match its column's type.
    #[error("Can't write {actual} value to {expected} variable {variable:?}.")]
    WrongValueType {
        /// The variable.
        variable: String,
        /// What the column holds.
        expected: &'static str,
        /// What the caller passed.
        actual: &'static str,
    },

    /// A case had the wrong number of values.
    #[error("Case has {actual} values but the file has {expected} variables.")]
    WrongCaseLength {
        /// Number of variables.
        expected: usize,
        /// Number of values passed.
        actual: usize,
    },
}

impl From<BinError> for Error {
    fn from(error: BinError) -> Self {
        match error {
            BinError::Io(error) => Error::Io(error),
            other => Error::Io(IoError::new(ErrorKind::Other, other.to_string())),
        }
    }
}

/// Options for writing a system file.
#[derive(Clone, Debug)]
pub struct WriteOptions {
    /// How to compress the case data.
    pub compression: Compression,

    /// Date and time to record in the header.
    pub timestamp: NaiveDateTime,

    /// Product name recorded in the header (only the first 40 bytes or so
    /// fit).
    pub product_name: Cow<'static, str>,

    /// Product version triple for the integer info record.
    pub version: (i32, i32, i32),
}

impl Default for WriteOptions {
    fn default() -> Self {
        Self {
            compression: Compression::Simple,
            timestamp: Local::now().naive_local(),
            product_name: Cow::from(concat!("sysfile ", env!("CARGO_PKG_VERSION"))),
            version: (
                env!("CARGO_PKG_VERSION_MAJOR").parse().unwrap_or(0),
                env!("CARGO_PKG_VERSION_MINOR").parse().unwrap_or(0),
                env!("CARGO_PKG_VERSION_PATCH").parse().unwrap_or(0),
            ),
        }
    }
}

impl WriteOptions {
    /// Constructs a new set of default options.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns `self` with the compression format set to `compression`.
    pub fn with_compression(self, compression: Compression) -> Self {
        Self {
            compression,
            ..self
        }
    }

    /// Returns `self` with the header timestamp set to `timestamp`.
    pub fn with_timestamp(self, timestamp: NaiveDateTime) -> Self {
        Self { timestamp, ..self }
    }

    /// Returns `self` with the product name set to `product_name`.
    pub fn with_product_name(self, product_name: impl Into<Cow<'static, str>>) -> Self {
        Self {
            product_name: product_name.into(),
            ..self
        }
    }

    /// Writes `metadata` to a new file at `path`.  Returns a [Writer] for
    /// writing the cases.
    pub fn write_file(
        self,
        metadata: &Metadata,
        path: impl AsRef<Path>,
    ) -> Result<Writer<BufWriter<File>>, Error> {
        self.write_writer(metadata, BufWriter::new(File::create(path)?))
    }

    /// Writes `metadata` to `writer`.  Returns a [Writer] for writing the
    /// cases.
    pub fn write_writer<W>(self, metadata: &Metadata, mut writer: W) -> Result<Writer<W>, Error>
    where
        W: Write + Seek,
    {
        let mut metadata_writer = MetadataWriter::new(&self, &mut writer, metadata)?;
        metadata_writer.write()?;
        let MetadataWriter { case_vars, .. } = metadata_writer;
        let columns = metadata.variables.iter().map(ColumnKind::new).collect();
        Writer::new(&self, metadata, case_vars, columns, writer)
    }

    /// Returns options with fixed timestamp and product so that the written
    /// bytes don't depend on when or by what the test ran.
    #[cfg(test)]
    pub(crate) fn reproducible(compression: Compression) -> Self {
        use chrono::{NaiveDate, NaiveTime};
        WriteOptions::new()
            .with_compression(compression)
            .with_timestamp(NaiveDateTime::new(
                NaiveDate::from_ymd_opt(2024, 11, 5).unwrap(),
                NaiveTime::from_hms_opt(13, 14, 15).unwrap(),
            ))
            .with_product_name("SYSFILE TEST DATA FILE")
    }
}

fn encode_fixed_string<const N: usize>(s: &str, encoding: &'static Encoding) -> [u8; N] {
    let mut encoded = encoding.encode(s).0.into_owned();
    encoded.truncate(N);
    encoded.resize(N, b' ');
    encoded.try_into().unwrap()
}

/// Shortens `s` so that its encoded form fits in `max` bytes, never
/// splitting a character.
fn truncate_encoded(s: &str, encoding: &'static Encoding, max: usize) -> String {
    let mut s = s.to_string();
    while encoding.encode(&s).0.len() > max {
        s.pop();
    }
    s
}

/// Generates the short names written to variable records: for each variable
/// one 8-byte head name plus one per additional very-long-string segment.
///
/// The head name is the variable's name, uppercased and truncated to 8
/// encoded bytes; on collision, `V{index}_{letter}` with letters A-Z.
/// Segment names share the head name's first 5 bytes followed by a
/// zero-padded 3-digit sequence number unique within that prefix; more than
/// 999 collisions cannot be represented.
fn generate_short_names(metadata: &Metadata) -> Result<Vec<SmallVec<[String; 1]>>, Error> {
    let encoding = metadata.header_encoding;
    let mut used: HashSet<String> = HashSet::new();
    let mut short_names = Vec::with_capacity(metadata.variables.len());
    for (index, variable) in metadata.variables.iter().enumerate() {
        let n_segments = variable.width.n_segments();
        let mut names = SmallVec::with_capacity(n_segments);

        let first_choice = truncate_encoded(&variable.name.to_uppercase(), encoding, 8);
        let head = if !first_choice.is_empty() && used.insert(first_choice.clone()) {
            first_choice
        } else {
            ('A'..='Z')
                .map(|letter| format!("V{index}_{letter}"))
                .find(|candidate| used.insert(candidate.clone()))
                .ok_or_else(|| Error::NamingSpaceExhausted(variable.name.clone()))?
        };
        names.push(head.clone());

        if n_segments > 1 {
            let prefix = truncate_encoded(&head, encoding, 5);
            let mut sequence = 0u32;
            for _ in 1..n_segments {
                let name = loop {
                    if sequence > 999 {
                        return Err(Error::NamingSpaceExhausted(variable.name.clone()));
                    }
                    let candidate = format!("{prefix}{sequence:03}");
                    sequence += 1;
                    if used.insert(candidate.clone()) {
                        break candidate;
                    }
                };
                names.push(name);
            }
        }
        short_names.push(names);
    }
    Ok(short_names)
}

/// Writes `n` copies of one pad byte.
struct Pad {
    n: usize,
    byte: u8,
}

impl Pad {
    fn zeros(n: usize) -> Self {
        Self { n, byte: 0 }
    }
}

impl BinWrite for Pad {
    type Args<'a> = ();

    fn write_options<W: Write + Seek>(
        &self,
        writer: &mut W,
        _endian: Endian,
        _args: Self::Args<'_>,
    ) -> BinResult<()> {
        for _ in 0..self.n {
            writer.write_all(&[self.byte])?;
        }
        Ok(())
    }
}

/// Writes at most `length` bytes of a slice, padded to exactly `length`.
struct Padded<'a> {
    bytes: &'a [u8],
    padding: Pad,
}

impl<'a> Padded<'a> {
    fn exact(bytes: &'a [u8], length: usize, byte: u8) -> Self {
        let n = bytes.len().min(length);
        Self {
            bytes: &bytes[..n],
            padding: Pad {
                n: length - n,
                byte,
            },
        }
    }
}

impl<'a> BinWrite for Padded<'a> {
    type Args<'b> = ();

    fn write_options<W: Write + Seek>(
        &self,
        writer: &mut W,
        endian: Endian,
        _args: Self::Args<'_>,
    ) -> BinResult<()> {
        self.bytes.write_options(writer, endian, ())?;
        self.padding.write_options(writer, endian, ())
    }
}

#[derive(Debug)]
struct StringSegment {
    data_bytes: usize,
    padding_bytes: usize,
}

/// How one variable's cells are laid out within a case.
enum CaseVar {
    Numeric,
    String(SmallVec<[StringSegment; 1]>),
}

impl CaseVar {
    fn new(width: VarWidth) -> Self {
        match width {
            VarWidth::Numeric => Self::Numeric,
            VarWidth::String(w) => {
                let mut segments = SmallVec::<[StringSegment; 1]>::new();
                let mut remaining = w as usize;
                for segment in width.segments() {
                    let alloc = segment.as_string_width().unwrap().next_multiple_of(8);
                    let data_bytes = remaining.min(alloc).min(255);
                    let padding_bytes = alloc - data_bytes;
                    if data_bytes > 0 {
                        segments.push(StringSegment {
                            data_bytes,
                            padding_bytes,
                        });
                        remaining -= data_bytes;
                    } else {
                        segments.last_mut().unwrap().padding_bytes += padding_bytes;
                    }
                }
                CaseVar::String(segments)
            }
        }
    }

    fn n_chunks(&self) -> usize {
        match self {
            CaseVar::Numeric => 1,
            CaseVar::String(segments) => segments
                .iter()
                .map(|segment| (segment.data_bytes + segment.padding_bytes) / 8)
                .sum(),
        }
    }
}

/// How one column's [Value]s convert to cells.
#[derive(Clone, Debug)]
enum ColumnKind {
    Number,
    DateTime,
    String { name: String, width: usize },
}

impl ColumnKind {
    fn new(variable: &Variable) -> Self {
        match variable.width {
            VarWidth::String(width) => Self::String {
                name: variable.name.clone(),
                width: width as usize,
            },
            VarWidth::Numeric if variable.format.type_().is_date() => Self::DateTime,
            VarWidth::Numeric => Self::Number,
        }
    }
}

struct MetadataWriter<'a, W> {
    options: &'a WriteOptions,
    metadata: &'a Metadata,
    short_names: Vec<SmallVec<[String; 1]>>,
    case_vars: Vec<CaseVar>,
    writer: &'a mut W,
}

impl<'a, W> MetadataWriter<'a, W>
where
    W: Write + Seek,
{
    fn new(
        options: &'a WriteOptions,
        writer: &'a mut W,
        metadata: &'a Metadata,
    ) -> Result<Self, Error> {
        Ok(Self {
            options,
            short_names: generate_short_names(metadata)?,
            case_vars: metadata
                .variables
                .iter()
                .map(|variable| CaseVar::new(variable.width))
                .collect(),
            writer,
            metadata,
        })
    }

    fn write(&mut self) -> Result<(), Error> {
        self.write_header()?;
        self.write_variables()?;
        self.write_value_labels()?;
        self.write_documents()?;
        self.write_integer_info()?;
        self.write_float_info()?;
        self.write_display_parameters()?;
        self.write_long_variable_names()?;
        self.write_very_long_strings()?;
        self.write_encoding()?;
        self.write_long_string_value_labels()?;
        self.write_long_string_missing_values()?;
        (999u32, 0u32).write_le(self.writer)?;
        Ok(())
    }

    fn write_header(&mut self) -> Result<(), Error> {
        fn as_byte_array<const N: usize>(s: String) -> [u8; N] {
            let mut bytes = s.into_bytes();
            bytes.resize(N, b' ');
            bytes.try_into().unwrap()
        }

        let nominal_case_size = self.case_vars.iter().map(CaseVar::n_chunks).sum::<usize>();
        let header = RawHeader {
            magic: match self.options.compression {
                Compression::ZLib => Magic::Zsav,
                Compression::Simple => Magic::Sav,
            }
            .into(),
            eye_catcher: encode_fixed_string(
                &format!("@(#) SPSS DATA FILE {}", &self.options.product_name),
                self.metadata.header_encoding,
            ),
            layout_code: 2,
            nominal_case_size: nominal_case_size as u32,
            compression_code: match self.options.compression {
                Compression::Simple => 1,
                Compression::ZLib => 2,
            },
            weight_index: 0,
            n_cases: self.metadata.n_cases.unwrap_or(u32::MAX),
            bias: self.metadata.bias,
            creation_date: as_byte_array(self.options.timestamp.format("%d %b %y").to_string()),
            creation_time: as_byte_array(self.options.timestamp.format("%H:%M:%S").to_string()),
            file_label: [b' '; 64],
        };
        header.write_le(self.writer)?;
        Ok(())
    }

    fn write_variables(&mut self) -> Result<(), Error> {
        fn write_continuation_records<W>(writer: &mut W, width: VarWidth) -> Result<(), Error>
        where
            W: Write + Seek,
        {
            let continuation = (
                2u32,
                RawVariableRecord {
                    width: -1,
                    has_variable_label: 0,
                    missing_value_code: 0,
                    print_format: RawFormat(0),
                    write_format: RawFormat(0),
                    name: [b' '; 8],
                },
            );
            for _ in 1..width.n_chunks().unwrap() {
                continuation.write_le(writer)?;
            }
            Ok(())
        }

        let encoding = self.metadata.header_encoding;
        for (variable, short_names) in self
            .metadata
            .variables
            .iter()
            .zip(self.short_names.iter())
        {
            let mut segments = variable.width.segments();
            let mut short_names = short_names.iter();
            let seg0_width = segments.next().unwrap();
            let name0 = short_names.next().unwrap();

            let format = RawFormat::from(variable.format.resized(seg0_width));
            let record = RawVariableRecord {
                width: seg0_width.as_string_width().unwrap_or(0) as i32,
                has_variable_label: variable.label.is_some() as u32,
                missing_value_code: if !variable.width.is_long_string() {
                    variable.missing_values.code()
                } else {
                    0
                },
                print_format: format,
                write_format: format,
                name: encode_fixed_string(name0, encoding),
            };
            (2u32, record).write_le(self.writer)?;

            // Variable label, length-prefixed and padded to 4 bytes.
            if let Some(label) = &variable.label {
                let label = encoding
                    .encode(&truncate_encoded(label, encoding, MAX_LABEL_LEN))
                    .0
                    .into_owned();
                let len = label.len() as u32;
                let padding = len.next_multiple_of(4) - len;
                (len, label, Pad::zeros(padding as usize)).write_le(self.writer)?;
            }

            // Missing values; long strings use the subtype-22 record instead.
            if !variable.width.is_long_string() {
                if let Some(range) = variable.missing_values.range() {
                    (
                        range.low().unwrap_or(f64::MIN),
                        range.high().unwrap_or(f64::MAX),
                    )
                        .write_le(self.writer)?;
                }
                for value in variable.missing_values.values() {
                    write_datum_cell(self.writer, value)?;
                }
            }
            write_continuation_records(self.writer, seg0_width)?;

            // Additional segments for very long strings.
            for (width, name) in segments.zip(short_names) {
                let format = RawFormat::from(Format::default_for_width(width));
                (
                    2u32,
                    RawVariableRecord {
                        width: width.as_string_width().unwrap() as i32,
                        has_variable_label: 0,
                        missing_value_code: 0,
                        print_format: format,
                        write_format: format,
                        name: encode_fixed_string(name, encoding),
                    },
                )
                    .write_le(self.writer)?;
                write_continuation_records(self.writer, width)?;
            }
        }
        Ok(())
    }

    /// Writes value label records for numeric and short string variables.
    /// Variables with identical label sets share one record pair.
    fn write_value_labels(&mut self) -> Result<(), Error> {
        let encoding = self.metadata.header_encoding;
        let mut sets: Vec<(&crate::dictionary::ValueLabels, Vec<u32>)> = Vec::new();
        let mut index = 1u32;
        for (variable, case_var) in self.metadata.variables.iter().zip(self.case_vars.iter()) {
            if !variable.width.is_long_string() && !variable.value_labels.is_empty() {
                match sets
                    .iter_mut()
                    .find(|(labels, _)| **labels == variable.value_labels)
                {
                    Some((_, indexes)) => indexes.push(index),
                    None => sets.push((&variable.value_labels, vec![index])),
                }
            }
            index += case_var.n_chunks() as u32;
        }

        for (value_labels, indexes) in sets {
            (3u32, value_labels.len() as u32).write_le(self.writer)?;
            for (datum, label) in value_labels {
                write_datum_cell(self.writer, datum)?;
                let label = encoding
                    .encode(&truncate_encoded(label, encoding, MAX_VALUE_LABEL_LEN))
                    .0
                    .into_owned();
                let padding = (1 + label.len()).next_multiple_of(8) - (1 + label.len());
                (label.len() as u8, label, Pad::zeros(padding)).write_le(self.writer)?;
            }
            (4u32, indexes.len() as u32, indexes).write_le(self.writer)?;
        }
        Ok(())
    }

    fn write_documents(&mut self) -> Result<(), Error> {
        if !self.metadata.documents.is_empty() {
            (6u32, self.metadata.documents.len() as u32).write_le(self.writer)?;
            for line in &self.metadata.documents {
                Padded::exact(&self.metadata.header_encoding.encode(line).0, 80, b' ')
                    .write_le(self.writer)?;
            }
        }
        Ok(())
    }

    fn write_integer_info(&mut self) -> Result<(), Error> {
        (
            7u32,
            3u32,
            4u32,
            8u32,
            RawIntegerInfoRecord {
                version_major: self.options.version.0,
                version_minor: self.options.version.1,
                version_revision: self.options.version.2,
                machine_code: -1,
                floating_point_rep: 1,
                compression_code: 1,
                // Files are always written little-endian.
                endianness: 2,
                character_code: codepage_from_encoding(self.metadata.header_encoding),
            },
        )
            .write_le(self.writer)?;
        Ok(())
    }

    fn write_float_info(&mut self) -> Result<(), Error> {
        (
            7u32,
            4u32,
            8u32,
            3u32,
            FloatInfoRecord {
                sysmis: -f64::MAX,
                highest: f64::MAX,
                lowest: f64::from_bits(0xffef_ffff_ffff_fffe),
            },
        )
            .write_le(self.writer)?;
        Ok(())
    }

    /// Writes one (measure, columns, alignment) triple per segment of every
    /// variable, so that the count matches the named variable records.
    fn write_display_parameters(&mut self) -> Result<(), Error> {
        let n_segments = self
            .metadata
            .variables
            .iter()
            .map(|variable| variable.width.n_segments())
            .sum::<usize>();
        (7u32, 11u32, 4u32, (n_segments * 3) as u32).write_le(self.writer)?;
        for variable in &self.metadata.variables {
            let measure: u32 = match variable.measure {
                Measure::Nominal => 1,
                Measure::Ordinal => 2,
                Measure::Scale => 3,
            };
            let alignment: u32 = match variable.alignment {
                Alignment::Left => 0,
                Alignment::Right => 1,
                Alignment::Center => 2,
            };
            for (index, segment) in variable.width.segments().enumerate() {
                let display_width = match index {
                    0 => variable.display_width,
                    _ => segment.default_display_width(),
                };
                (measure, display_width, alignment).write_le(self.writer)?;
            }
        }
        Ok(())
    }

    fn write_long_variable_names(&mut self) -> Result<(), Error> {
        let mut s = String::new();
        for (index, variable) in self.metadata.variables.iter().enumerate() {
            if index > 0 {
                s.push('\t');
            }
            s.push_str(&self.short_names[index][0]);
            s.push('=');
            s.push_str(&truncate_encoded(
                &variable.name,
                self.metadata.header_encoding,
                MAX_NAME_LEN,
            ));
        }
        self.write_string_record(13, &s)
    }

    fn write_very_long_strings(&mut self) -> Result<(), Error> {
        let mut s = String::new();
        for (index, variable) in self.metadata.variables.iter().enumerate() {
            if variable.width.is_very_long_string() {
                let width = variable.width.as_string_width().unwrap();
                s.push_str(&format!("{}={width:05}\0\t", &self.short_names[index][0]));
            }
        }
        self.write_string_record(14, &s)
    }

    fn write_encoding(&mut self) -> Result<(), Error> {
        self.write_string_record(20, self.metadata.data_encoding.name())
    }

    fn write_long_string_value_labels(&mut self) -> Result<(), Error> {
        let encoding = self.metadata.header_encoding;
        let mut body = Vec::new();
        for variable in &self.metadata.variables {
            if variable.value_labels.is_empty() || !variable.width.is_long_string() {
                continue;
            }
            let width = variable.width.as_string_width().unwrap();
            let name = encoding.encode(&variable.name).0;
            body.extend_from_slice(&(name.len() as u32).to_le_bytes());
            body.extend_from_slice(&name);
            body.extend_from_slice(&(width as u32).to_le_bytes());
            body.extend_from_slice(&(variable.value_labels.len() as u32).to_le_bytes());

            for (value, label) in &variable.value_labels {
                let mut value = value
                    .as_string()
                    .map_or_else(Vec::new, |s| s.as_bytes().to_vec());
                value.resize(width, b' ');
                let label = encoding
                    .encode(&truncate_encoded(label, encoding, MAX_VALUE_LABEL_LEN))
                    .0
                    .into_owned();
                body.extend_from_slice(&(value.len() as u32).to_le_bytes());
                body.extend_from_slice(&value);
                body.extend_from_slice(&(label.len() as u32).to_le_bytes());
                body.extend_from_slice(&label);
            }
        }
        self.write_bytes_record(21, &body)
    }

    fn write_long_string_missing_values(&mut self) -> Result<(), Error> {
        let encoding = self.metadata.header_encoding;
        let mut body = Vec::new();
        for variable in &self.metadata.variables {
            if variable.missing_values.is_empty() || !variable.width.is_long_string() {
                continue;
            }
            let name = encoding.encode(&variable.name).0;
            body.extend_from_slice(&(name.len() as u32).to_le_bytes());
            body.extend_from_slice(&name);
            body.push(variable.missing_values.values().len() as u8);
            body.extend_from_slice(&8u32.to_le_bytes());

            for value in variable.missing_values.values() {
                let bytes = value.as_string().map_or(&[] as &[u8], |s| s.as_bytes());
                let n = bytes.len().min(8);
                body.extend_from_slice(&bytes[..n]);
                body.extend(std::iter::repeat(b' ').take(8 - n));
            }
        }
        self.write_bytes_record(22, &body)
    }

    fn write_bytes_record(&mut self, subtype: u32, bytes: &[u8]) -> Result<(), Error> {
        if !bytes.is_empty() {
            (7u32, subtype, 1u32, bytes.len() as u32, bytes).write_le(self.writer)?;
        }
        Ok(())
    }

    fn write_string_record(&mut self, subtype: u32, s: &str) -> Result<(), Error> {
        let bytes = self.metadata.header_encoding.encode(s).0.into_owned();
        self.write_bytes_record(subtype, &bytes)
    }
}

/// Writes one 8-byte cell for `datum`: a little-endian double for numbers
/// (system-missing as `-f64::MAX`), space-padded bytes for strings.
fn write_datum_cell<W: Write>(writer: &mut W, datum: &Datum) -> Result<(), Error> {
    match datum {
        Datum::Number(number) => {
            writer.write_all(&number.unwrap_or(-f64::MAX).to_le_bytes())?;
        }
        Datum::String(s) => {
            let n = s.len().min(8);
            writer.write_all(&s.as_bytes()[..n])?;
            for _ in n..8 {
                writer.write_all(b" ")?;
            }
        }
    }
    Ok(())
}

enum Sink<W>
where
    W: Write + Seek,
{
    Plain(W),
    Zlib(ZlibWriter<W>),
}

impl<W> Write for Sink<W>
where
    W: Write + Seek,
{
    fn write(&mut self, buf: &[u8]) -> Result<usize, IoError> {
        match self {
            Sink::Plain(w) => w.write(buf),
            Sink::Zlib(w) => w.write(buf),
        }
    }

    fn flush(&mut self) -> Result<(), IoError> {
        match self {
            Sink::Plain(w) => w.flush(),
            Sink::Zlib(w) => w.flush(),
        }
    }
}

/// System file case writer, from [WriteOptions::write_writer].
///
/// Write each case with [write_case](Self::write_case), then call
/// [finish](Self::finish).  Dropping the writer also finishes the file, so
/// the final partial compression block is flushed exactly once either way.
pub struct Writer<W>
where
    W: Write + Seek,
{
    bias: f64,
    data_encoding: &'static Encoding,
    case_vars: Vec<CaseVar>,
    columns: Vec<ColumnKind>,
    opcodes: Vec<u8>,
    data: Vec<u8>,
    sink: Option<Sink<W>>,
    n_cases: u64,
}

impl<W> Writer<W>
where
    W: Write + Seek,
{
    fn new(
        options: &WriteOptions,
        metadata: &Metadata,
        case_vars: Vec<CaseVar>,
        columns: Vec<ColumnKind>,
        writer: W,
    ) -> Result<Self, Error> {
        Ok(Self {
            bias: metadata.bias,
            data_encoding: metadata.data_encoding,
            case_vars,
            columns,
            opcodes: Vec::with_capacity(8),
            data: Vec::with_capacity(64),
            sink: Some(match options.compression {
                Compression::Simple => Sink::Plain(writer),
                Compression::ZLib => {
                    Sink::Zlib(ZlibWriter::new(writer)?.with_bias(metadata.bias))
                }
            }),
            n_cases: 0,
        })
    }

    fn flush_compressed(&mut self) -> Result<(), Error> {
        if !self.opcodes.is_empty() {
            let sink = self.sink.as_mut().unwrap();
            self.opcodes.resize(8, 0);
            sink.write_all(&self.opcodes)?;
            sink.write_all(&self.data)?;
            self.opcodes.clear();
            self.data.clear();
        }
        Ok(())
    }

    fn put_opcode(&mut self, opcode: u8) -> Result<(), Error> {
        if self.opcodes.len() >= 8 {
            self.flush_compressed()?;
        }
        self.opcodes.push(opcode);
        Ok(())
    }

    fn put_number(&mut self, number: Option<f64>) -> Result<(), Error> {
        match number {
            None => self.put_opcode(255),
            Some(number) => {
                let biased = number + self.bias;
                if number == number.trunc() && biased > 0.0 && biased < 252.0 {
                    self.put_opcode(biased as u8)
                } else {
                    self.put_opcode(253)?;
                    self.data.extend_from_slice(&number.to_le_bytes());
                    Ok(())
                }
            }
        }
    }

    fn put_string(&mut self, bytes: &[u8], case_var_index: usize) -> Result<(), Error> {
        // Swap the segment list out so `self` stays free for put_opcode.
        let case_var = std::mem::replace(&mut self.case_vars[case_var_index], CaseVar::Numeric);
        let CaseVar::String(ref segments) = case_var else {
            unreachable!();
        };
        let mut s = bytes;
        for segment in segments {
            let excess = segment.data_bytes.saturating_sub(s.len());
            let data_bytes = segment.data_bytes - excess;
            let padding_bytes = segment.padding_bytes + excess;

            let data;
            (data, s) = s.split_at(data_bytes);

            let mut chunks = data.chunks_exact(8);
            for chunk in &mut chunks {
                if chunk.iter().all(|c| *c == b' ') {
                    self.put_opcode(254)?;
                } else {
                    self.put_opcode(253)?;
                    self.data.extend_from_slice(chunk);
                }
            }
            let remainder = chunks.remainder();
            if !remainder.is_empty() {
                if remainder.iter().all(|c| *c == b' ') {
                    self.put_opcode(254)?;
                } else {
                    self.put_opcode(253)?;
                    self.data.extend_from_slice(remainder);
                    self.data
                        .extend(std::iter::repeat(b' ').take(8 - remainder.len()));
                }
            }
            for _ in 0..padding_bytes / 8 {
                self.put_opcode(254)?;
            }
        }
        self.case_vars[case_var_index] = case_var;
        Ok(())
    }

    /// Writes one case.  `case` must yield exactly one [Value] per variable,
    /// in variable order, each matching its column's type.
    pub fn write_case(
        &mut self,
        case: impl IntoIterator<Item = Value>,
    ) -> Result<(), Error> {
        let expected = self.columns.len();
        let mut case = case.into_iter();
        for index in 0..expected {
            let Some(value) = case.next() else {
                return Err(Error::WrongCaseLength {
                    expected,
                    actual: index,
                });
            };
            let column = self.columns[index].clone();
            match (&column, value) {
                (ColumnKind::Number, Value::Number(number)) => self.put_number(number)?,
                (ColumnKind::DateTime, Value::DateTime(date_time)) => {
                    self.put_number(date_time.map(date_time_to_seconds))?
                }
                (ColumnKind::DateTime, Value::Number(number)) => self.put_number(number)?,
                (ColumnKind::String { width, .. }, Value::String(s)) => {
                    let mut bytes = self
                        .data_encoding
                        .encode(s.trim_end_matches(' '))
                        .0
                        .into_owned();
                    bytes.truncate(*width);
                    self.put_string(&bytes, index)?;
                }
                (_, value) => {
                    let (variable, expected) = match &column {
                        ColumnKind::Number => (String::new(), "numeric"),
                        ColumnKind::DateTime => (String::new(), "date"),
                        ColumnKind::String { name, .. } => (name.clone(), "string"),
                    };
                    return Err(Error::WrongValueType {
                        variable,
                        expected,
                        actual: match value {
                            Value::Number(_) => "numeric",
                            Value::String(_) => "string",
                            Value::DateTime(_) => "date",
                        },
                    });
                }
            }
        }
        let extra = case.count();
        if extra > 0 {
            return Err(Error::WrongCaseLength {
                expected,
                actual: expected + extra,
            });
        }
        self.n_cases += 1;
        Ok(())
    }

    /// Finishes writing the file: flushes the final partial compression
    /// block, completes the ZLIB container if one is in use, and patches the
    /// case count into the header.  Returns the underlying writer.
    pub fn finish(mut self) -> Result<Option<W>, Error> {
        self.try_finish()
    }

    fn try_finish(&mut self) -> Result<Option<W>, Error> {
        let Some(sink) = self.sink.take() else {
            return Ok(None);
        };
        self.sink = Some(sink);
        self.flush_compressed()?;

        let mut inner = match self.sink.take().unwrap() {
            Sink::Plain(inner) => inner,
            Sink::Zlib(zlib_writer) => zlib_writer.finish()?,
        };
        if let Ok(n_cases) = u32::try_from(self.n_cases) {
            if inner.seek(SeekFrom::Start(80)).is_ok() {
                let _ = inner.write_all(&n_cases.to_le_bytes());
                let _ = inner.seek(SeekFrom::End(0));
            }
        }
        Ok(Some(inner))
    }
}

impl<W> Drop for Writer<W>
where
    W: Write + Seek,
{
    fn drop(&mut self) {
        let _ = self.try_finish();
    }
}

const ZBLOCK_SIZE: u64 = 0x3ff000;

/// Writes the ZLIB container of a `$FL3` file: the 24-byte data header (back
/// patched on finish), the compressed blocks, and the trailer with one
/// descriptor per block.
struct ZlibWriter<W>
where
    W: Write + Seek,
{
    header: RawZHeader,
    trailer: RawZTrailer,
    encoder: ZlibEncoder<Vec<u8>>,
    inner: W,
}

impl<W> ZlibWriter<W>
where
    W: Write + Seek,
{
    fn new(mut inner: W) -> Result<Self, Error> {
        let header = RawZHeader {
            zheader_offset: inner.stream_position()?,
            ztrailer_offset: 0,
            ztrailer_len: 0,
        };
        header.write_le(&mut inner)?;
        Ok(Self {
            header,
            trailer: RawZTrailer {
                int_bias: -100,
                zero: 0,
                block_size: ZBLOCK_SIZE as u32,
                blocks: Vec::new(),
            },
            encoder: ZlibEncoder::new(Vec::new(), flate2::Compression::new(1)),
            inner,
        })
    }

    fn with_bias(mut self, bias: f64) -> Self {
        self.trailer.int_bias = -bias as i64;
        self
    }

    fn flush_block(&mut self) -> Result<(), IoError> {
        let total_in = self.encoder.total_in();
        if total_in > 0 {
            let buf = self.encoder.reset(Vec::new())?;
            self.inner.write_all(&buf)?;

            self.trailer.blocks.push(ZBlock {
                uncompressed_ofs: match self.trailer.blocks.last() {
                    Some(prev) => prev.uncompressed_ofs + prev.uncompressed_size as u64,
                    None => self.header.zheader_offset,
                },
                compressed_ofs: match self.trailer.blocks.last() {
                    Some(prev) => prev.compressed_ofs + prev.compressed_size as u64,
                    None => self.header.zheader_offset + 24,
                },
                uncompressed_size: total_in as u32,
                compressed_size: buf.len() as u32,
            });
        }
        Ok(())
    }

    fn finish(mut self) -> Result<W, Error> {
        self.flush_block()?;
        let ztrailer_offset = self.inner.stream_position()?;
        self.trailer.write_le(&mut self.inner)?;
        let header = RawZHeader {
            zheader_offset: self.header.zheader_offset,
            ztrailer_offset,
            ztrailer_len: self.trailer.len() as u64,
        };
        self.inner.seek(SeekFrom::Start(header.zheader_offset))?;
        header.write_le(&mut self.inner)?;
        self.inner.seek(SeekFrom::End(0))?;
        Ok(self.inner)
    }
}

impl<W> Write for ZlibWriter<W>
where
    W: Write + Seek,
{
    fn write(&mut self, mut buf: &[u8]) -> Result<usize, IoError> {
        let n = buf.len();
        while !buf.is_empty() {
            if self.encoder.total_in() >= ZBLOCK_SIZE {
                self.flush_block()?;
            }

            let chunk = buf
                .len()
                .min((ZBLOCK_SIZE - self.encoder.total_in()) as usize);
            self.encoder.write_all(&buf[..chunk])?;
            buf = &buf[chunk..];
        }
        Ok(n)
    }

    fn flush(&mut self) -> Result<(), IoError> {
        Ok(())
    }
}

impl DataSet {
    /// Writes the whole data set to `writer` with default options, returning
    /// the underlying writer.
    pub fn write<W>(&self, writer: W) -> Result<W, Error>
    where
        W: Write + Seek,
    {
        self.write_with_options(WriteOptions::new(), writer)
    }

    /// Writes the whole data set to `writer` with `options`.
    pub fn write_with_options<W>(&self, options: WriteOptions, writer: W) -> Result<W, Error>
    where
        W: Write + Seek,
    {
        let mut writer = options.write_writer(&self.metadata, writer)?;
        for case in &self.cases {
            writer.write_case(case.iter().cloned())?;
        }
        Ok(writer.finish()?.unwrap())
    }
}

#[cfg(test)]
mod tests {
    use super::{generate_short_names, Error};
    use crate::dictionary::{Metadata, VarWidth, Variable};

    fn names_of(metadata: &Metadata) -> Vec<Vec<String>> {
        generate_short_names(metadata)
            .unwrap()
            .into_iter()
            .map(|names| names.into_vec())
            .collect()
    }

    #[test]
    fn short_names_uppercase_and_dodge_collisions() {
        let metadata = Metadata::new(vec![
            Variable::new("age", VarWidth::Numeric),
            Variable::new("AGE", VarWidth::String(4)),
            Variable::new("customer_id", VarWidth::Numeric),
            Variable::new("customer_idx", VarWidth::Numeric),
        ]);
        assert_eq!(
            names_of(&metadata),
            vec![
                vec!["AGE".to_string()],
                vec!["V1_A".to_string()],
                vec!["CUSTOMER".to_string()],
                vec!["V3_A".to_string()],
            ]
        );
    }

    #[test]
    fn segment_names_share_five_byte_prefix() {
        let metadata = Metadata::new(vec![Variable::new("longstr", VarWidth::String(1000))]);
        assert_eq!(
            names_of(&metadata),
            vec![vec![
                "LONGSTR".to_string(),
                "LONGS000".to_string(),
                "LONGS001".to_string(),
                "LONGS002".to_string(),
            ]]
        );
    }

    #[test]
    fn segment_sequence_skips_taken_names() {
        let metadata = Metadata::new(vec![
            Variable::new("longs000", VarWidth::Numeric),
            Variable::new("longstr", VarWidth::String(1000)),
        ]);
        assert_eq!(
            names_of(&metadata),
            vec![
                vec!["LONGS000".to_string()],
                vec![
                    "LONGSTR".to_string(),
                    "LONGS001".to_string(),
                    "LONGS002".to_string(),
                    "LONGS003".to_string(),
                ],
            ]
        );
    }

    #[test]
    fn segment_name_space_exhausts_at_999() {
        // Eight maximal very long strings whose short names share their
        // first five bytes need 130 segment names each, more than the 1000
        // the shared prefix can provide.
        let metadata = Metadata::new(
            (0..8)
                .map(|i| {
                    Variable::new(
                        format!("PREFIX_{}", (b'A' + i) as char),
                        VarWidth::String(VarWidth::MAX_STRING),
                    )
                })
                .collect(),
        );
        assert!(matches!(
            generate_short_names(&metadata),
            Err(Error::NamingSpaceExhausted(_))
        ));
    }
}
