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

//! Raw records.
//!
//! One type per record kind, each knowing how to read itself from the byte
//! stream.  Text fields stay as raw bytes here; decoding waits until the
//! file's character encoding is known, which may not be until an info record
//! that comes after the text did.

use std::{
    fmt::Debug,
    io::{Cursor, ErrorKind, Read, Seek, SeekFrom},
    num::NonZeroU8,
    ops::Range,
};

use binrw::{binrw, BinRead, BinWrite, Endian};
use serde::Serialize;
use thiserror::Error as ThisError;

use crate::{
    data::{Datum, RawString},
    dictionary::{Alignment, Measure, MissingValueRange, MissingValues, VarType},
    endian::FromBytes,
    format::RawFormat,
    raw::{
        read_bytes, read_string, read_vec, Decoder, Error, ErrorDetails, Magic, RawDatum,
        RawWidth, Record, UntypedDatum, VarTypes, Warning, WarningDetails,
    },
};

/// Type of compression used for case data.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize)]
pub enum Compression {
    /// The bytecode compression scheme.
    Simple,

    /// Bytecode compression wrapped in ZLIB blocks.
    ZLib,
}

/// A warning for a file header.
#[derive(ThisError, Debug)]
pub enum HeaderWarning {
    /// Unexpected compression bias.
    #[error("Compression bias is {0} instead of the usual values of 0 or 100.")]
    UnexpectedBias(f64),
}

/// Raw file header, in the fixed 176-byte layout.
#[derive(BinRead, BinWrite)]
pub struct RawHeader {
    /// Magic number.
    pub magic: [u8; 4],

    /// Eye-catcher string and product name, space padded.
    pub eye_catcher: [u8; 60],

    /// Layout code, always 2.  Reading this field in the wrong byte order
    /// yields 0x02000000, which is how the reader detects a byte-swapped
    /// file.
    pub layout_code: u32,

    /// Claimed number of 8-byte units per case (not always accurate).
    pub nominal_case_size: u32,

    /// Compression code.
    pub compression_code: u32,

    /// 1-based index of the weight variable, or 0 if unweighted.
    pub weight_index: u32,

    /// Claimed number of cases, or [u32::MAX] if unknown.
    pub n_cases: u32,

    /// Compression bias, usually 100.0.
    pub bias: f64,

    /// `dd mmm yy` in the file's encoding.
    pub creation_date: [u8; 9],

    /// `HH:MM:SS` in the file's encoding.
    pub creation_time: [u8; 8],

    /// File label, space padded, followed by 3 reserved bytes.
    #[brw(pad_after = 3)]
    pub file_label: [u8; 64],
}

/// A file header record.
#[derive(Clone, Debug, Serialize)]
pub struct FileHeader<S>
where
    S: Debug + Serialize,
{
    /// Magic number.
    pub magic: Magic,

    /// Eye-catcher string, product name, space padded.
    pub eye_catcher: S,

    /// Number of variable positions claimed by the header, if trustworthy.
    pub nominal_case_size: Option<u32>,

    /// Compression type.
    pub compression: Compression,

    /// 1-based variable position of the weight variable, or `None` if the
    /// file is unweighted.  (Recorded but otherwise ignored.)
    pub weight_index: Option<u32>,

    /// Claimed number of cases, if known.
    pub n_cases: Option<u32>,

    /// Compression bias, usually 100.0.
    pub bias: f64,

    /// `dd mmm yy` in the file's encoding.
    pub creation_date: S,

    /// `HH:MM:SS` in the file's encoding.
    pub creation_time: S,

    /// File label, space padded.
    pub file_label: S,

    /// Byte order of the file.
    #[serde(skip)]
    pub endian: Endian,
}

impl FileHeader<RawString> {
    /// Reads a file header from `r`, reporting any warnings via `warn`.
    ///
    /// The header is parsed in both byte orders; whichever yields layout
    /// code 2 decides the endianness of everything that follows.
    pub fn read<R>(r: &mut R, warn: &mut dyn FnMut(Warning)) -> Result<Self, Error>
    where
        R: Read + Seek,
    {
        let header_bytes = read_vec(r, 176).map_err(|e| {
            Error::new(
                None,
                if e.kind() == ErrorKind::UnexpectedEof {
                    ErrorDetails::NotASystemFile
                } else {
                    e.into()
                },
            )
        })?;
        Self::read_inner(&header_bytes, warn).map_err(|details| Error::new(Some(0..176), details))
    }

    fn read_inner(
        header_bytes: &[u8],
        warn: &mut dyn FnMut(Warning),
    ) -> Result<Self, ErrorDetails> {
        let be_header = RawHeader::read_be(&mut Cursor::new(&header_bytes)).unwrap();
        let le_header = RawHeader::read_le(&mut Cursor::new(&header_bytes)).unwrap();

        let magic: Magic = be_header
            .magic
            .try_into()
            .map_err(|_| ErrorDetails::NotASystemFile)?;
        if magic == Magic::Ebcdic {
            return Err(ErrorDetails::UnsupportedEncoding);
        }

        let (endian, header) = if be_header.layout_code == 2 {
            (Endian::Big, &be_header)
        } else if le_header.layout_code == 2 {
            (Endian::Little, &le_header)
        } else {
            return Err(ErrorDetails::NotASystemFile);
        };

        let compression = match (magic, header.compression_code) {
            (Magic::Zsav, 2) => Compression::ZLib,
            (Magic::Zsav, code) => return Err(ErrorDetails::InvalidZsavCompression(code)),
            (_, 1) => Compression::Simple,
            (_, code) => return Err(ErrorDetails::UnsupportedCompression(code)),
        };

        if header.bias != 100.0 && header.bias != 0.0 {
            warn(Warning::new(
                Some(84..92),
                HeaderWarning::UnexpectedBias(header.bias),
            ));
        }

        Ok(FileHeader {
            magic,
            eye_catcher: header.eye_catcher.as_slice().into(),
            nominal_case_size: (1..u32::MAX / 16)
                .contains(&header.nominal_case_size)
                .then_some(header.nominal_case_size),
            compression,
            weight_index: (header.weight_index > 0).then_some(header.weight_index),
            n_cases: (header.n_cases <= u32::MAX / 2).then_some(header.n_cases),
            bias: header.bias,
            creation_date: header.creation_date.as_slice().into(),
            creation_time: header.creation_time.as_slice().into(),
            file_label: header.file_label.as_slice().into(),
            endian,
        })
    }

    /// Decodes the header's text fields with `decoder`.
    pub fn decode(self, decoder: &mut Decoder) -> FileHeader<String> {
        FileHeader {
            magic: self.magic,
            eye_catcher: decoder.decode(&self.eye_catcher).into_owned(),
            nominal_case_size: self.nominal_case_size,
            compression: self.compression,
            weight_index: self.weight_index,
            n_cases: self.n_cases,
            bias: self.bias,
            creation_date: decoder.decode(&self.creation_date).into_owned(),
            creation_time: decoder.decode(&self.creation_time).into_owned(),
            file_label: decoder.decode(&self.file_label).into_owned(),
            endian: self.endian,
        }
    }
}

/// Warning for a variable record.
#[derive(ThisError, Debug)]
pub enum VariableWarning {
    /// Missing value range not allowed for string variable.
    #[error("Missing value record with range not allowed for string variable.")]
    MissingValueStringRange,

    /// Missing value not allowed on continuation record.
    #[error("Missing value not allowed for long string continuation.")]
    MissingValueContinuation,
}

/// Missing values as read from a variable record, before the character
/// encoding is known.
#[derive(Clone, Debug, Default, Serialize)]
pub struct RawMissingValues {
    /// Individual missing values, up to 3 of them.
    pub values: Vec<Datum>,

    /// Optional range of missing values.
    pub range: Option<MissingValueRange>,
}

impl RawMissingValues {
    fn read<R>(
        r: &mut R,
        offsets: Range<u64>,
        raw_width: RawWidth,
        code: i32,
        endian: Endian,
        warn: &mut dyn FnMut(Warning),
    ) -> Result<Self, Error>
    where
        R: Read + Seek,
    {
        let (n_values, has_range) = match code {
            0 => return Ok(Self::default()),
            1..=3 => (code as usize, false),
            -2 => (0, true),
            -3 => (1, true),
            _ => {
                return Err(Error::new(
                    Some(offsets),
                    ErrorDetails::BadMissingValueCode(code),
                ))
            }
        };

        let range = if has_range {
            let low = read_bytes::<8, _>(r)?;
            let high = read_bytes::<8, _>(r)?;
            Some((low, high))
        } else {
            None
        };
        let mut values = Vec::with_capacity(n_values);
        for _ in 0..n_values {
            values.push(read_bytes::<8, _>(r)?);
        }

        match raw_width {
            RawWidth::Numeric => Ok(Self {
                values: values
                    .into_iter()
                    .map(|v| Datum::Number(endian.parse(v)))
                    .collect(),
                range: range.map(|(low, high)| {
                    MissingValueRange::new(endian.parse(low), endian.parse(high))
                }),
            }),
            RawWidth::String(width) => {
                if range.is_some() {
                    warn(Warning::new(
                        Some(offsets),
                        VariableWarning::MissingValueStringRange,
                    ));
                }
                let width = (width.get() as usize).min(8);
                Ok(Self {
                    values: values
                        .into_iter()
                        .map(|v| Datum::String(RawString::from(&v[..width])))
                        .collect(),
                    range: None,
                })
            }
            RawWidth::Continuation => {
                warn(Warning::new(
                    Some(offsets),
                    VariableWarning::MissingValueContinuation,
                ));
                Ok(Self::default())
            }
        }
    }

    /// Converts to a validated [MissingValues].
    pub fn decode(&self) -> Result<MissingValues, crate::dictionary::MissingValuesError> {
        MissingValues::new(self.values.clone(), self.range)
    }
}

/// Raw variable record, in the fixed 28-byte layout (there is one more
/// 4-byte record-type word in front of it in the file).
#[derive(BinRead, BinWrite)]
pub struct RawVariableRecord {
    /// Variable width: 0 numeric, 1..=255 string, -1 continuation.
    pub width: i32,

    /// 1 if the variable has a label, 0 otherwise.
    pub has_variable_label: u32,

    /// Missing value code: 0, 1..=3 for discrete values, -2 for a range, -3
    /// for a range plus a discrete value.
    pub missing_value_code: i32,

    /// Print format.
    pub print_format: RawFormat,

    /// Write format.
    pub write_format: RawFormat,

    /// Short variable name, space padded.
    pub name: [u8; 8],
}

/// A variable record.
///
/// Each numeric variable has one variable record.  A string variable has one
/// record per 8 bytes of storage: a real record for the first 8 bytes and a
/// continuation record for each 8 bytes after that.  A very long string has
/// one such group per segment.
#[derive(Clone, Debug, Serialize)]
pub struct VariableRecord<S>
where
    S: Debug + Serialize,
{
    /// Range of file offsets occupied by the record.
    pub offsets: Range<u64>,

    /// Variable width.
    pub width: RawWidth,

    /// Variable name, space padded.
    pub name: S,

    /// Print format.
    pub print_format: RawFormat,

    /// Write format.
    pub write_format: RawFormat,

    /// Missing values.
    pub missing_values: RawMissingValues,

    /// Optional variable label.
    pub label: Option<S>,
}

impl VariableRecord<RawString> {
    /// Reads a variable record from `r` (the record-type word has already
    /// been consumed).
    pub fn read<R>(r: &mut R, endian: Endian, warn: &mut dyn FnMut(Warning)) -> Result<Self, Error>
    where
        R: Read + Seek,
    {
        let start_offset = r.stream_position()?;
        let offsets = start_offset..start_offset + 28;
        let raw = read_vec(r, 28).map_err(|e| Error::new(Some(offsets.clone()), e.into()))?;
        let raw = RawVariableRecord::read_options(&mut Cursor::new(&raw), endian, ()).unwrap();

        let width: RawWidth = raw.width.try_into().map_err(|_| {
            Error::new(
                Some(offsets.clone()),
                ErrorDetails::BadVariableWidth(raw.width),
            )
        })?;

        let label = match raw.has_variable_label {
            0 => None,
            1 => {
                let len: u32 = endian.parse(read_bytes(r)?);
                let len = len.min(65535) as usize;
                let label = read_vec(r, len)?;
                let padding = len.next_multiple_of(4) - len;
                read_vec(r, padding)?;
                Some(label.into())
            }
            code => {
                return Err(Error::new(
                    Some(offsets),
                    ErrorDetails::BadVariableLabelCode(code),
                ));
            }
        };

        let missing_values =
            RawMissingValues::read(r, offsets, width, raw.missing_value_code, endian, warn)?;

        let end_offset = r.stream_position()?;
        Ok(Self {
            offsets: start_offset..end_offset,
            width,
            name: raw.name.as_slice().into(),
            print_format: raw.print_format,
            write_format: raw.write_format,
            missing_values,
            label,
        })
    }

    /// Decodes the record's text fields with `decoder`.
    pub fn decode(self, decoder: &mut Decoder) -> VariableRecord<String> {
        VariableRecord {
            offsets: self.offsets.clone(),
            width: self.width,
            name: decoder.decode(&self.name).into_owned(),
            print_format: self.print_format,
            write_format: self.write_format,
            missing_values: self.missing_values,
            label: self
                .label
                .as_ref()
                .map(|label| decoder.decode(label).into_owned()),
        }
    }
}

/// Warning for a value label record.
#[derive(ThisError, Debug)]
pub enum ValueLabelWarning {
    /// No variable indexes.
    #[error("At least one valid variable index is required but none were specified.")]
    NoVarIndexes,

    /// Mixed variable types.
    #[error("First variable index is for a {var_type} variable but the following variable indexes are for variables of the other type: {wrong_types:?}")]
    MixedVarTypes {
        /// Type of the first referenced variable.
        var_type: VarType,
        /// Indexes of variables of the other type.
        wrong_types: Vec<u32>,
    },

    /// Invalid variable indexes.
    #[error("One or more variable indexes were not in the valid range [1,{max}] or referred to string continuations: {invalid:?}")]
    InvalidVarIndexes {
        /// Maximum valid index.
        max: usize,
        /// The invalid indexes.
        invalid: Vec<u32>,
    },
}

/// A value and its label.
#[derive(Clone, Debug, Serialize)]
pub struct ValueLabel<S>
where
    S: Debug + Serialize,
{
    /// The value being labeled.
    pub datum: RawDatum,

    /// The label.
    pub label: S,
}

/// A value label record.
///
/// This combines a type-3 record with the type-4 record that always follows
/// it and names the variables the labels apply to, by 1-based variable
/// position ("block index").
#[derive(Clone, Debug, Serialize)]
pub struct ValueLabelRecord<S>
where
    S: Debug + Serialize,
{
    /// Range of file offsets occupied by the record.
    pub offsets: Range<u64>,

    /// The labels.
    pub labels: Vec<ValueLabel<S>>,

    /// 1-based variable positions of the variables that use this label set.
    pub dict_indexes: Vec<u32>,

    /// The type of those variables.
    pub var_type: VarType,
}

impl<S> ValueLabelRecord<S>
where
    S: Debug + Serialize,
{
    /// Maximum number of value labels in one record.
    pub const MAX_LABELS: u32 = u32::MAX / 8;

    /// Maximum number of variable indexes in one record.
    pub const MAX_INDEXES: u32 = u32::MAX / 8;
}

impl ValueLabelRecord<RawString> {
    /// Reads a value label record (types 3 and 4 together) from `r`.
    pub fn read<R: Read + Seek>(
        r: &mut R,
        endian: Endian,
        var_types: &VarTypes,
        warn: &mut dyn FnMut(Warning),
    ) -> Result<Option<Self>, Error> {
        let label_offset = r.stream_position()?;
        let n: u32 = endian.parse(read_bytes(r)?);
        if n > Self::MAX_LABELS {
            return Err(Error::new(
                Some(label_offset..label_offset + 4),
                ErrorDetails::BadNumberOfValueLabels {
                    n,
                    max: Self::MAX_LABELS,
                },
            ));
        }

        let mut labels = Vec::new();
        for _ in 0..n {
            let value = UntypedDatum(read_bytes(r)?);
            let label_len: u8 = endian.parse(read_bytes(r)?);
            let label_len = label_len as usize;
            let padded_len = (label_len + 1).next_multiple_of(8);

            let mut label = read_vec(r, padded_len - 1)?;
            label.truncate(label_len);
            labels.push((value, RawString::from(label)));
        }

        let index_offset = r.stream_position()?;
        let rec_type: u32 = endian.parse(read_bytes(r)?);
        if rec_type != 4 {
            return Err(Error::new(
                Some(index_offset..index_offset + 4),
                ErrorDetails::ExpectedVarIndexRecord(rec_type),
            ));
        }

        let n: u32 = endian.parse(read_bytes(r)?);
        let n_offsets = index_offset + 4..index_offset + 8;
        if n > Self::MAX_INDEXES {
            return Err(Error::new(
                Some(n_offsets),
                ErrorDetails::TooManyVarIndexes {
                    n,
                    max: Self::MAX_INDEXES,
                },
            ));
        } else if n == 0 {
            warn(Warning::new(
                Some(n_offsets),
                ValueLabelWarning::NoVarIndexes,
            ));
            return Ok(None);
        }

        let index_offset = r.stream_position()?;
        let mut dict_indexes = Vec::with_capacity(n as usize);
        let mut invalid_indexes = Vec::new();
        for _ in 0..n {
            let index: u32 = endian.parse(read_bytes(r)?);
            if var_types.is_valid_index(index as usize) {
                dict_indexes.push(index);
            } else {
                invalid_indexes.push(index);
            }
        }
        let index_offsets = index_offset..r.stream_position()?;
        if !invalid_indexes.is_empty() {
            warn(Warning::new(
                Some(index_offsets.clone()),
                ValueLabelWarning::InvalidVarIndexes {
                    max: var_types.n_values(),
                    invalid: invalid_indexes,
                },
            ));
        }

        let Some(&first_index) = dict_indexes.first() else {
            return Ok(None);
        };
        let var_type = var_types.var_type_at(first_index as usize).unwrap();
        let mut wrong_type_indexes = Vec::new();
        dict_indexes.retain(|&index| {
            if var_types.var_type_at(index as usize) != Some(var_type) {
                wrong_type_indexes.push(index);
                false
            } else {
                true
            }
        });
        if !wrong_type_indexes.is_empty() {
            warn(Warning::new(
                Some(index_offsets),
                ValueLabelWarning::MixedVarTypes {
                    var_type,
                    wrong_types: wrong_type_indexes,
                },
            ));
        }

        let labels = labels
            .into_iter()
            .map(|(value, label)| ValueLabel {
                // Interpret the raw value through the file's byte order, so
                // that numeric labels from byte-swapped files come out right.
                datum: RawDatum::from_raw(&value, var_type, endian),
                label,
            })
            .collect();

        let end_offset = r.stream_position()?;
        Ok(Some(ValueLabelRecord {
            offsets: label_offset..end_offset,
            labels,
            dict_indexes,
            var_type,
        }))
    }

    /// Decodes the labels with `decoder`.
    pub fn decode(self, decoder: &mut Decoder) -> ValueLabelRecord<String> {
        ValueLabelRecord {
            offsets: self.offsets,
            labels: self
                .labels
                .into_iter()
                .map(|ValueLabel { datum, label }| ValueLabel {
                    datum,
                    label: decoder.decode(&label).into_owned(),
                })
                .collect(),
            dict_indexes: self.dict_indexes,
            var_type: self.var_type,
        }
    }
}

/// Length of a document line.  Lines are fixed length, right padded with
/// spaces.
pub const DOC_LINE_LEN: usize = 80;

/// A document record.
#[derive(Clone, Debug, Serialize)]
pub struct DocumentRecord<S>
where
    S: Debug + Serialize,
{
    /// Range of file offsets occupied by the record.
    pub offsets: Range<u64>,

    /// The document lines.
    pub lines: Vec<S>,
}

impl DocumentRecord<RawString> {
    /// Maximum number of lines we accept in a document.
    pub const MAX_LINES: usize = i32::MAX as usize / DOC_LINE_LEN;

    /// Reads a document record from `r`.
    pub fn read<R>(r: &mut R, endian: Endian) -> Result<Self, Error>
    where
        R: Read + Seek,
    {
        let start_offset = r.stream_position()?;
        let n: u32 = endian.parse(read_bytes(r)?);
        let n = n as usize;
        if n > Self::MAX_LINES {
            return Err(Error::new(
                Some(start_offset..start_offset + 4),
                ErrorDetails::BadDocumentLength {
                    n,
                    max: Self::MAX_LINES,
                },
            ));
        }
        let offsets = start_offset..start_offset.saturating_add((4 + n * DOC_LINE_LEN) as u64);
        let mut lines = Vec::with_capacity(n);
        for _ in 0..n {
            lines.push(RawString::from(
                read_bytes::<DOC_LINE_LEN, _>(r)
                    .map_err(|e| Error::new(Some(offsets.clone()), e.into()))?
                    .as_slice(),
            ));
        }
        Ok(DocumentRecord { offsets, lines })
    }

    /// Decodes the document lines with `decoder`.
    pub fn decode(self, decoder: &mut Decoder) -> DocumentRecord<String> {
        DocumentRecord {
            offsets: self.offsets,
            lines: self
                .lines
                .iter()
                .map(|line| decoder.decode(line).into_owned())
                .collect(),
        }
    }
}

/// Warning for an info (extension) record.
#[derive(ThisError, Debug)]
pub enum ExtensionWarning {
    /// Unexpected end of data.
    #[error("Unexpected end of data.")]
    UnexpectedEndOfData,

    /// Invalid element size.
    #[error("{record} has bad size {size} bytes instead of the expected {expected_size}.")]
    BadRecordSize {
        /// Name of the record.
        record: &'static str,
        /// Element size found.
        size: u32,
        /// Element size expected.
        expected_size: u32,
    },

    /// Invalid element count.
    #[error("{record} has bad count {count} instead of the expected {expected_count}.")]
    BadRecordCount {
        /// Name of the record.
        record: &'static str,
        /// Element count found.
        count: u32,
        /// Element count expected.
        expected_count: u32,
    },
}

/// An info record whose subtype this crate doesn't interpret, kept as raw
/// bytes.  Skipping these is not an error: the subtype header declares the
/// payload size.
#[derive(Clone, Debug, Serialize)]
pub struct Extension {
    /// File offsets of the `data` portion of the record.
    pub offsets: Range<u64>,

    /// Record subtype.
    pub subtype: u32,

    /// Size of each data element.
    pub size: u32,

    /// Number of data elements.
    pub count: u32,

    /// `size * count` bytes of data.
    pub data: Vec<u8>,
}

impl Extension {
    /// Checks that this extension has `size`-byte elements and `count`
    /// elements total, using `name` for error reporting.
    pub fn check_size(
        &self,
        size: Option<u32>,
        count: Option<u32>,
        name: &'static str,
    ) -> Result<(), WarningDetails> {
        if let Some(expected_size) = size {
            if self.size != expected_size {
                return Err(ExtensionWarning::BadRecordSize {
                    record: name,
                    size: self.size,
                    expected_size,
                }
                .into());
            }
        }
        if let Some(expected_count) = count {
            if self.count != expected_count {
                return Err(ExtensionWarning::BadRecordCount {
                    record: name,
                    count: self.count,
                    expected_count,
                }
                .into());
            }
        }
        Ok(())
    }

    /// Reads an info record from `r` and dispatches on its subtype.
    ///
    /// Returns `Ok(None)` if the record was recognized but malformed, in
    /// which case a warning has been issued and the payload consumed.
    pub fn read<R: Read + Seek>(
        r: &mut R,
        endian: Endian,
        var_types: &VarTypes,
        warn: &mut dyn FnMut(Warning),
    ) -> Result<Option<Record>, Error> {
        let subtype = endian.parse(read_bytes(r)?);
        let header_offset = r.stream_position()?;
        let size: u32 = endian.parse(read_bytes(r)?);
        let count = endian.parse(read_bytes(r)?);
        let Some(product) = size.checked_mul(count) else {
            return Err(Error::new(
                Some(header_offset..header_offset + 8),
                ErrorDetails::ExtensionRecordTooLarge {
                    subtype,
                    size,
                    count,
                },
            ));
        };
        let start_offset = r.stream_position()?;
        let data = read_vec(r, product as usize)?;
        let offsets = start_offset..start_offset + product as u64;
        let extension = Extension {
            offsets: offsets.clone(),
            subtype,
            size,
            count,
            data,
        };
        let result = match subtype {
            3 => IntegerInfoRecord::parse(&extension, endian),
            4 => FloatInfoRecord::parse(&extension, endian),
            11 => VarDisplayRecord::parse(&extension, var_types, endian, warn),
            13 => TextRecord::parse(extension, "long variable names record")
                .map(|text| Record::LongNames(RawLongNamesRecord(text))),
            14 => TextRecord::parse(extension, "very long strings record")
                .map(|text| Record::VeryLongStrings(RawVeryLongStringsRecord(text))),
            20 => EncodingRecord::parse(&extension),
            21 => LongStringValueLabelRecord::parse(&extension, endian),
            22 => LongStringMissingValueRecord::parse(&extension, endian, warn),
            _ => Ok(Record::OtherExtension(extension)),
        };
        match result {
            Ok(result) => Ok(Some(result)),
            Err(details) => {
                warn(Warning::new(Some(offsets), details));
                Ok(None)
            }
        }
    }
}

/// Machine integer info record (subtype 3) in [mod@binrw] form.
#[derive(Clone, Debug, BinRead, BinWrite, Serialize)]
pub struct RawIntegerInfoRecord {
    /// Major version of the writing software.
    pub version_major: i32,

    /// Minor version.
    pub version_minor: i32,

    /// Revision.
    pub version_revision: i32,

    /// Machine code; mostly useless, -1 here.
    pub machine_code: i32,

    /// Floating-point representation (1 for IEEE 754).
    pub floating_point_rep: i32,

    /// Compression code.
    pub compression_code: i32,

    /// Endianness: 1 big, 2 little.
    pub endianness: i32,

    /// Character code: normally a code page number.
    pub character_code: i32,
}

/// Machine integer info record (subtype 3).
#[derive(Clone, Debug, Serialize)]
pub struct IntegerInfoRecord {
    /// File offsets occupied by the record.
    pub offsets: Range<u64>,

    /// The fields.
    #[serde(flatten)]
    pub inner: RawIntegerInfoRecord,
}

impl IntegerInfoRecord {
    fn parse(ext: &Extension, endian: Endian) -> Result<Record, WarningDetails> {
        ext.check_size(Some(4), Some(8), "integer info record")?;

        let inner =
            RawIntegerInfoRecord::read_options(&mut Cursor::new(ext.data.as_slice()), endian, ())
                .unwrap();
        Ok(Record::IntegerInfo(IntegerInfoRecord {
            offsets: ext.offsets.clone(),
            inner,
        }))
    }
}

/// Machine floating-point info record (subtype 4).
#[derive(Clone, Debug, BinRead, BinWrite, Serialize)]
pub struct FloatInfoRecord {
    /// Value used for system-missing values (`-f64::MAX`).
    pub sysmis: f64,

    /// Highest numeric value (`f64::MAX`).
    pub highest: f64,

    /// Lowest numeric value.
    pub lowest: f64,
}

impl FloatInfoRecord {
    fn parse(ext: &Extension, endian: Endian) -> Result<Record, WarningDetails> {
        ext.check_size(Some(8), Some(3), "floating-point info record")?;

        let inner = FloatInfoRecord::read_options(&mut Cursor::new(ext.data.as_slice()), endian, ())
            .unwrap();
        Ok(Record::FloatInfo(inner))
    }
}

/// Warning for a variable display record.
#[derive(ThisError, Debug)]
pub enum VariableDisplayWarning {
    /// Wrong item count.
    #[error("Record contains {count} items but should contain either {two} or {three}.")]
    InvalidVariableDisplayCount {
        /// Count found.
        count: usize,
        /// Valid count without display widths.
        two: usize,
        /// Valid count with display widths.
        three: usize,
    },

    /// Invalid measurement level value.
    #[error("Invalid variable measurement level value {0}.")]
    InvalidMeasurement(u32),

    /// Invalid alignment value.
    #[error("Invalid variable display alignment value {0}.")]
    InvalidAlignment(u32),
}

fn decode_measure(source: u32) -> Result<Option<Measure>, WarningDetails> {
    match source {
        0 => Ok(None),
        1 => Ok(Some(Measure::Nominal)),
        2 => Ok(Some(Measure::Ordinal)),
        3 => Ok(Some(Measure::Scale)),
        _ => Err(VariableDisplayWarning::InvalidMeasurement(source).into()),
    }
}

fn decode_alignment(source: u32) -> Result<Option<Alignment>, WarningDetails> {
    match source {
        0 => Ok(Some(Alignment::Left)),
        1 => Ok(Some(Alignment::Right)),
        2 => Ok(Some(Alignment::Center)),
        _ => Err(VariableDisplayWarning::InvalidAlignment(source).into()),
    }
}

/// Display settings for one named variable record.
#[derive(Clone, Debug, Serialize)]
pub struct VarDisplay {
    /// Measurement level.
    pub measure: Option<Measure>,

    /// Display column width, present only in the 3-items-per-variable
    /// layout.
    pub width: Option<u32>,

    /// Alignment.
    pub alignment: Option<Alignment>,
}

/// A variable display parameter record (subtype 11).
///
/// Contains one entry per named variable record, that is, one per segment of
/// every variable, in order.
#[derive(Clone, Debug, Serialize)]
pub struct VarDisplayRecord(pub Vec<VarDisplay>);

impl VarDisplayRecord {
    fn parse(
        ext: &Extension,
        var_types: &VarTypes,
        endian: Endian,
        warn: &mut dyn FnMut(Warning),
    ) -> Result<Record, WarningDetails> {
        ext.check_size(Some(4), None, "variable display record")?;

        let n_vars = var_types.n_vars();
        let has_width = if ext.count as usize == 3 * n_vars {
            true
        } else if ext.count as usize == 2 * n_vars {
            false
        } else {
            return Err(VariableDisplayWarning::InvalidVariableDisplayCount {
                count: ext.count as usize,
                two: 2 * n_vars,
                three: 3 * n_vars,
            }
            .into());
        };

        let mut var_displays = Vec::with_capacity(n_vars);
        let mut input = &ext.data[..];
        for _ in 0..n_vars {
            let measure = match decode_measure(endian.parse(read_bytes(&mut input).unwrap())) {
                Ok(measure) => measure,
                Err(details) => {
                    warn(Warning::new(Some(ext.offsets.clone()), details));
                    None
                }
            };
            let width = if has_width {
                Some(endian.parse(read_bytes(&mut input).unwrap()))
            } else {
                None
            };
            let alignment = match decode_alignment(endian.parse(read_bytes(&mut input).unwrap())) {
                Ok(alignment) => alignment,
                Err(details) => {
                    warn(Warning::new(Some(ext.offsets.clone()), details));
                    None
                }
            };
            var_displays.push(VarDisplay {
                measure,
                width,
                alignment,
            });
        }
        Ok(Record::VarDisplay(VarDisplayRecord(var_displays)))
    }
}

/// An info record whose payload is one text blob.
#[derive(Clone, Debug, Serialize)]
pub struct TextRecord {
    /// File offsets of the record's payload.
    pub offsets: Range<u64>,

    /// The text, in the file's encoding.
    pub text: RawString,
}

impl TextRecord {
    fn parse(extension: Extension, name: &'static str) -> Result<TextRecord, WarningDetails> {
        extension.check_size(Some(1), None, name)?;
        Ok(Self {
            offsets: extension.offsets,
            text: extension.data.into(),
        })
    }
}

/// Warning for a long variable names record.
#[derive(ThisError, Debug)]
pub enum LongNameWarning {
    /// Missing `=`.
    #[error("Missing `=` separator in {0:?}.")]
    MissingEquals(String),
}

/// One `short=long` pair from a long variable names record.
#[derive(Clone, Debug, Serialize)]
pub struct LongName {
    /// The variable's short name.
    pub short_name: String,

    /// The variable's long name.
    pub long_name: String,
}

/// A long variable names record (subtype 13), as raw text.
#[derive(Clone, Debug, Serialize)]
pub struct RawLongNamesRecord(pub TextRecord);

/// A decoded long variable names record.
#[derive(Clone, Debug, Serialize)]
pub struct LongNamesRecord(pub Vec<LongName>);

impl RawLongNamesRecord {
    /// Decodes the tab-separated `short=long` pairs with `decoder`.
    pub fn decode(self, decoder: &mut Decoder) -> LongNamesRecord {
        let input = decoder.decode(&self.0.text).into_owned();
        let mut names = Vec::new();
        for pair in input.split('\t').filter(|s| !s.is_empty()) {
            match pair.split_once('=') {
                Some((short_name, long_name)) => names.push(LongName {
                    short_name: short_name.trim_end().into(),
                    long_name: long_name.into(),
                }),
                None => decoder.warn(Warning::new(
                    Some(self.0.offsets.clone()),
                    LongNameWarning::MissingEquals(pair.into()),
                )),
            }
        }
        LongNamesRecord(names)
    }
}

/// Warning for a very long strings record.
#[derive(ThisError, Debug)]
pub enum VeryLongStringWarning {
    /// Missing `=`.
    #[error("Missing delimiter in {0:?}.")]
    MissingDelimiter(String),

    /// Invalid length.
    #[error("Invalid length in {0:?}.")]
    InvalidLength(String),
}

/// One `short=length` pair from a very long strings record.
#[derive(Clone, Debug, Serialize)]
pub struct VeryLongString {
    /// Short name of the very long string variable.
    pub short_name: String,

    /// True width of the variable, overriding the nominal width in its
    /// variable record.
    pub length: u16,
}

/// A very long strings record (subtype 14), as raw text.
#[derive(Clone, Debug, Serialize)]
pub struct RawVeryLongStringsRecord(pub TextRecord);

/// A decoded very long strings record.
#[derive(Clone, Debug, Serialize)]
pub struct VeryLongStringsRecord(pub Vec<VeryLongString>);

impl RawVeryLongStringsRecord {
    /// Decodes the NUL/tab-separated `short=length` pairs with `decoder`.
    pub fn decode(self, decoder: &mut Decoder) -> VeryLongStringsRecord {
        let input = decoder.decode(&self.0.text).into_owned();
        let mut very_long_strings = Vec::new();
        for tuple in input
            .split('\0')
            .map(|s| s.trim_start_matches('\t'))
            .filter(|s| !s.is_empty())
        {
            match tuple.split_once('=') {
                Some((short_name, length)) => match length.trim_end().parse() {
                    Ok(length) => very_long_strings.push(VeryLongString {
                        short_name: short_name.trim_end().into(),
                        length,
                    }),
                    Err(_) => decoder.warn(Warning::new(
                        Some(self.0.offsets.clone()),
                        VeryLongStringWarning::InvalidLength(tuple.into()),
                    )),
                },
                None => decoder.warn(Warning::new(
                    Some(self.0.offsets.clone()),
                    VeryLongStringWarning::MissingDelimiter(tuple.into()),
                )),
            }
        }
        VeryLongStringsRecord(very_long_strings)
    }
}

/// A character encoding record (subtype 20).
#[derive(Clone, Debug, Serialize)]
pub struct EncodingRecord(
    /// The encoding name.
    pub String,
);

impl EncodingRecord {
    fn parse(ext: &Extension) -> Result<Record, WarningDetails> {
        ext.check_size(Some(1), None, "encoding record")?;

        Ok(Record::Encoding(EncodingRecord(
            String::from_utf8(ext.data.clone()).map_err(|_| WarningDetails::BadEncodingName)?,
        )))
    }
}

/// Value labels for one long string variable.
#[derive(Clone, Debug, Serialize)]
pub struct LongStringValueLabels<S>
where
    S: Debug + Serialize,
{
    /// The variable being labeled.
    pub var_name: S,

    /// The variable's width (greater than 8, since it's a long string).
    pub width: u32,

    /// `(value, label)` pairs, where each value is `width` bytes.
    pub labels: Vec<(RawString, S)>,
}

/// A long string value labels record (subtype 21).
///
/// Holds value labels for variables whose width exceeds 8 bytes, which the
/// compact type-3 record cannot represent.
#[derive(Clone, Debug, Serialize)]
pub struct LongStringValueLabelRecord<S>
where
    S: Debug + Serialize,
{
    /// File offsets occupied by the record.
    pub offsets: Range<u64>,

    /// Per-variable label sets.
    pub labels: Vec<LongStringValueLabels<S>>,
}

impl LongStringValueLabelRecord<RawString> {
    fn parse(ext: &Extension, endian: Endian) -> Result<Record, WarningDetails> {
        ext.check_size(Some(1), None, "long string value labels record")?;

        let mut input = &ext.data[..];
        let mut label_set = Vec::new();
        while !input.is_empty() {
            let var_name = read_string(&mut input, endian)?;
            let width: u32 = endian.parse(read_bytes(&mut input)?);
            let n_labels: u32 = endian.parse(read_bytes(&mut input)?);
            let mut labels = Vec::new();
            for _ in 0..n_labels {
                let value = read_string(&mut input, endian)?;
                let label = read_string(&mut input, endian)?;
                labels.push((value, label));
            }
            label_set.push(LongStringValueLabels {
                var_name,
                width,
                labels,
            });
        }
        Ok(Record::LongStringValueLabels(LongStringValueLabelRecord {
            offsets: ext.offsets.clone(),
            labels: label_set,
        }))
    }

    /// Decodes variable names and labels with `decoder`.  The label values
    /// themselves stay raw: they are case data and use the data encoding,
    /// resolved later.
    pub fn decode(self, decoder: &mut Decoder) -> LongStringValueLabelRecord<String> {
        LongStringValueLabelRecord {
            offsets: self.offsets,
            labels: self
                .labels
                .into_iter()
                .map(|set| LongStringValueLabels {
                    var_name: decoder.decode(&set.var_name).trim_end().to_string(),
                    width: set.width,
                    labels: set
                        .labels
                        .into_iter()
                        .map(|(value, label)| (value, decoder.decode(&label).into_owned()))
                        .collect(),
                })
                .collect(),
        }
    }
}

/// Warning for a long string missing values record.
#[derive(ThisError, Debug)]
pub enum LongStringMissingValuesWarning {
    /// Invalid value length.
    #[error("Value length at offset {offset:#x} is {value_len} instead of the expected 8.")]
    BadValueLength {
        /// Offset of the length field.
        offset: u64,
        /// Actual value length.
        value_len: u32,
    },
}

/// Missing values for one long string variable.
#[derive(Clone, Debug, Serialize)]
pub struct LongStringMissingValues<S>
where
    S: Debug + Serialize,
{
    /// Variable name.
    pub var_name: S,

    /// Missing values, 8 bytes each.
    pub missing_values: Vec<[u8; 8]>,
}

/// A long string missing values record (subtype 22).
#[derive(Clone, Debug, Serialize)]
pub struct LongStringMissingValueRecord<S>
where
    S: Debug + Serialize,
{
    /// File offsets occupied by the record.
    pub offsets: Range<u64>,

    /// Per-variable missing value sets.
    pub values: Vec<LongStringMissingValues<S>>,
}

impl LongStringMissingValueRecord<RawString> {
    fn parse(
        ext: &Extension,
        endian: Endian,
        warn: &mut dyn FnMut(Warning),
    ) -> Result<Record, WarningDetails> {
        ext.check_size(Some(1), None, "long string missing values record")?;

        let mut input = &ext.data[..];
        let mut missing_value_set = Vec::new();
        while !input.is_empty() {
            let var_name = read_string(&mut input, endian)?;
            let n_missing_values: u8 = endian.parse(read_bytes(&mut input)?);
            let value_len: u32 = endian.parse(read_bytes(&mut input)?);
            if value_len != 8 {
                let offset = (ext.data.len() - input.len() - 4) as u64 + ext.offsets.start;
                warn(Warning::new(
                    Some(ext.offsets.clone()),
                    LongStringMissingValuesWarning::BadValueLength { offset, value_len },
                ));
                read_vec(&mut input, value_len as usize * n_missing_values as usize)?;
                continue;
            }
            let mut missing_values = Vec::new();
            for i in 0..n_missing_values {
                if i > 0 {
                    // Tolerate files written by old, buggy software that
                    // repeated the value length before each missing value.
                    let mut peek = input;
                    let number: u32 = endian.parse(read_bytes(&mut peek)?);
                    if number == 8 {
                        input = peek;
                    }
                }
                missing_values.push(read_bytes::<8, _>(&mut input)?);
            }
            missing_value_set.push(LongStringMissingValues {
                var_name,
                missing_values,
            });
        }
        Ok(Record::LongStringMissingValues(
            LongStringMissingValueRecord {
                offsets: ext.offsets.clone(),
                values: missing_value_set,
            },
        ))
    }

    /// Decodes variable names with `decoder`.
    pub fn decode(self, decoder: &mut Decoder) -> LongStringMissingValueRecord<String> {
        LongStringMissingValueRecord {
            offsets: self.offsets,
            values: self
                .values
                .into_iter()
                .map(|set| LongStringMissingValues {
                    var_name: decoder.decode(&set.var_name).trim_end().to_string(),
                    missing_values: set.missing_values,
                })
                .collect(),
        }
    }
}

/// Error reading a [ZHeader].
#[derive(ThisError, Debug)]
pub enum ZHeaderError {
    /// Truncated header.
    #[error("Unexpected end of file reading ZLIB header.")]
    Truncated,

    /// Impossible trailer offset.
    #[error("Impossible ztrailer_offset {0:#x}.")]
    ImpossibleZTrailerOffset(u64),

    /// Header offset disagrees with its own position.
    #[error("zheader_offset is {actual:#x} instead of expected {expected:#x}.")]
    UnexpectedZHeaderOffset {
        /// Value found.
        actual: u64,
        /// Value expected.
        expected: u64,
    },

    /// Invalid trailer length.
    #[error("Invalid ZLIB trailer length {0}.")]
    InvalidZTrailerLength(u64),
}

/// The fixed 24-byte ZLIB data header that replaces case data in a `$FL3`
/// file, locating the trailer.
#[derive(Clone, Debug, BinRead, BinWrite, Serialize)]
pub struct RawZHeader {
    /// File offset to the start of this header.
    pub zheader_offset: u64,

    /// File offset to the ZLIB trailer.
    pub ztrailer_offset: u64,

    /// Length of the ZLIB trailer in bytes.
    pub ztrailer_len: u64,
}

/// A ZLIB data header together with its position.
#[derive(Clone, Debug, Serialize)]
pub struct ZHeader {
    /// File offset to the start of the record.
    pub offset: u64,

    /// The raw header.
    #[serde(flatten)]
    pub inner: RawZHeader,
}

impl ZHeader {
    /// Reads a ZLIB data header from `r`.
    pub fn read<R>(r: &mut R, endian: Endian) -> Result<ZHeader, Error>
    where
        R: Read + Seek,
    {
        let offset = r.stream_position()?;
        let inner = RawZHeader::read_options(r, endian, ()).map_err(|_| {
            Error::new(Some(offset..offset + 24), ZHeaderError::Truncated.into())
        })?;

        if inner.zheader_offset != offset {
            Err(ZHeaderError::UnexpectedZHeaderOffset {
                actual: inner.zheader_offset,
                expected: offset,
            })
        } else if inner.ztrailer_offset < offset {
            Err(ZHeaderError::ImpossibleZTrailerOffset(inner.ztrailer_offset))
        } else if inner.ztrailer_len < 24 || inner.ztrailer_len % 24 != 0 {
            Err(ZHeaderError::InvalidZTrailerLength(inner.ztrailer_len))
        } else {
            Ok(ZHeader { offset, inner })
        }
        .map_err(|details| Error::new(Some(offset..offset + 24), details.into()))
    }
}

/// Error reading a [ZTrailer].
#[derive(ThisError, Debug)]
pub enum ZTrailerError {
    /// Truncated trailer.
    #[error("Unexpected end of file reading ZLIB trailer.")]
    Truncated,

    /// Trailer bias doesn't match the header bias.
    #[error("Trailer bias {actual} is not {expected} as expected from file header.")]
    WrongBias {
        /// Value found.
        actual: i64,
        /// Value expected.
        expected: f64,
    },

    /// Nonzero zero field.
    #[error("Expected zero field has nonzero value {0}.")]
    WrongZero(u64),

    /// Wrong block count.
    #[error("Block count {n_blocks} differs from expected block count {expected_n_blocks} calculated from trailer length {ztrailer_len}.")]
    BadNBlocks {
        /// Number of blocks in the trailer.
        n_blocks: usize,
        /// Expected number of blocks.
        expected_n_blocks: u64,
        /// Trailer length in bytes.
        ztrailer_len: u64,
    },

    /// Inconsistent compressed block offset.
    #[error("Block descriptor {index} reported compressed data offset {actual:#x}, when {expected:#x} was expected.")]
    WrongCompressedOffset {
        /// Block descriptor index.
        index: usize,
        /// Offset found.
        actual: u64,
        /// Offset expected.
        expected: u64,
    },

    /// Inconsistent uncompressed block offset.
    #[error("Block descriptor {index} reported uncompressed data offset {actual:#x}, when {expected:#x} was expected.")]
    WrongUncompressedOffset {
        /// Block descriptor index.
        index: usize,
        /// Offset found.
        actual: u64,
        /// Offset expected.
        expected: u64,
    },

    /// Trailer at unexpected offset.
    #[error("ZLIB trailer is at offset {actual:#x} but {expected:#x} would be expected from block descriptors.")]
    OffsetInconsistency {
        /// Offset expected.
        expected: u64,
        /// Offset found.
        actual: u64,
    },
}

/// Warning for a ZLIB trailer record.
#[derive(ThisError, Debug)]
pub enum ZlibTrailerWarning {
    /// Wrong block size.
    #[error("Block descriptor {index} reported block size {actual:#x}, when {expected:#x} was expected.")]
    BlockWrongSize {
        /// Block descriptor index.
        index: usize,
        /// Size found.
        actual: u32,
        /// Size expected.
        expected: u32,
    },

    /// Unexpected overall block size.
    #[error("Unexpected {0:#x}-byte block size (expected 0x3ff000).")]
    WrongBlockSize(u32),
}

/// One ZLIB block descriptor.
#[derive(Clone, Debug, BinRead, BinWrite, Serialize)]
pub struct ZBlock {
    /// Offset this block of data would have in an equivalent `$FL2` file.
    pub uncompressed_ofs: u64,

    /// Actual file offset of this compressed data block.
    pub compressed_ofs: u64,

    /// Size of this data block after decompression.
    pub uncompressed_size: u32,

    /// Size of this data block as stored in the file.
    pub compressed_size: u32,
}

/// The ZLIB data trailer: bias confirmation plus one descriptor per
/// compressed block.
#[binrw]
#[derive(Clone, Debug, Serialize)]
pub struct RawZTrailer {
    /// Compression bias as a negative integer, e.g. -100.
    pub int_bias: i64,

    /// Always zero.
    pub zero: u64,

    /// Uncompressed size of each block except possibly the last.
    pub block_size: u32,

    /// Number of blocks.
    #[bw(calc(blocks.len() as u32))]
    pub n_blocks: u32,

    /// The block descriptors.
    #[br(count = n_blocks)]
    pub blocks: Vec<ZBlock>,
}

impl RawZTrailer {
    /// Returns the length of the trailer when written, in bytes.
    #[allow(clippy::len_without_is_empty)]
    pub fn len(&self) -> usize {
        24 + self.blocks.len() * 24
    }
}

/// A ZLIB trailer together with its position.
#[derive(Clone, Debug, Serialize)]
pub struct ZTrailer {
    /// File offset to the start of the record.
    pub offset: u64,

    /// The raw trailer.
    #[serde(flatten)]
    pub inner: RawZTrailer,
}

impl ZTrailer {
    /// Reads the ZLIB trailer located by `zheader`, seeking backward to it
    /// and restoring the stream position afterward.  Returns `Ok(None)` if
    /// the trailer offset cannot be reached.
    pub fn read<R>(
        reader: &mut R,
        endian: Endian,
        bias: f64,
        zheader: &RawZHeader,
        warn: &mut dyn FnMut(Warning),
    ) -> Result<Option<ZTrailer>, Error>
    where
        R: Read + Seek,
    {
        let start_offset = reader.stream_position()?;
        if reader
            .seek(SeekFrom::Start(zheader.ztrailer_offset))
            .is_err()
        {
            return Ok(None);
        }
        let trailer_offsets = zheader.ztrailer_offset..zheader.ztrailer_offset + zheader.ztrailer_len;
        let inner = RawZTrailer::read_options(reader, endian, ()).map_err(|_| {
            Error::new(Some(trailer_offsets.clone()), ZTrailerError::Truncated.into())
        })?;

        if inner.int_bias as f64 != -bias {
            Err(ZTrailerError::WrongBias {
                actual: inner.int_bias,
                expected: -bias,
            })
        } else if inner.zero != 0 {
            Err(ZTrailerError::WrongZero(inner.zero))
        } else {
            let expected_n_blocks = (zheader.ztrailer_len - 24) / 24;
            if inner.blocks.len() as u64 != expected_n_blocks {
                Err(ZTrailerError::BadNBlocks {
                    n_blocks: inner.blocks.len(),
                    expected_n_blocks,
                    ztrailer_len: zheader.ztrailer_len,
                })
            } else {
                Ok(())
            }
        }
        .map_err(|details| Error::new(Some(trailer_offsets.clone()), details.into()))?;

        if inner.block_size != 0x3ff000 {
            warn(Warning::new(
                Some(trailer_offsets.clone()),
                ZlibTrailerWarning::WrongBlockSize(inner.block_size),
            ));
        }

        let mut expected_uncmp_ofs = zheader.zheader_offset;
        let mut expected_cmp_ofs = zheader.zheader_offset + 24;
        for (index, block) in inner.blocks.iter().enumerate() {
            let block_start = zheader.ztrailer_offset + 24 + 24 * index as u64;
            let block_offsets = block_start..block_start + 24;

            if block.uncompressed_ofs != expected_uncmp_ofs {
                Err(ZTrailerError::WrongUncompressedOffset {
                    index,
                    actual: block.uncompressed_ofs,
                    expected: expected_uncmp_ofs,
                })
            } else if block.compressed_ofs != expected_cmp_ofs {
                Err(ZTrailerError::WrongCompressedOffset {
                    index,
                    actual: block.compressed_ofs,
                    expected: expected_cmp_ofs,
                })
            } else {
                Ok(())
            }
            .map_err(|details| Error::new(Some(block_offsets.clone()), details.into()))?;

            if index < inner.blocks.len() - 1 && block.uncompressed_size != inner.block_size {
                warn(Warning::new(
                    Some(block_offsets),
                    ZlibTrailerWarning::BlockWrongSize {
                        index,
                        actual: block.uncompressed_size,
                        expected: inner.block_size,
                    },
                ));
            }

            expected_cmp_ofs += block.compressed_size as u64;
            expected_uncmp_ofs += block.uncompressed_size as u64;
        }

        if expected_cmp_ofs != zheader.ztrailer_offset {
            return Err(Error::new(
                Some(trailer_offsets),
                ZTrailerError::OffsetInconsistency {
                    expected: expected_cmp_ofs,
                    actual: zheader.ztrailer_offset,
                }
                .into(),
            ));
        }

        reader.seek(SeekFrom::Start(start_offset))?;
        Ok(Some(ZTrailer {
            offset: zheader.ztrailer_offset,
            inner,
        }))
    }
}

impl TryFrom<i32> for RawWidth {
    type Error = ();

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        match value {
            -1 => Ok(Self::Continuation),
            0 => Ok(Self::Numeric),
            1..=255 => Ok(Self::String(NonZeroU8::new(value as u8).unwrap())),
            _ => Err(()),
        }
    }
}
