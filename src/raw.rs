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

//! Raw system file record reader.
//!
//! This module reads records from system files in all of their raw details.
//! Most callers will want the higher-level interface in [crate::cooked],
//! which assembles these records into the logical model.
//!
//! Reading is strictly forward-sequential.  The only backward movement is
//! the one-time seek to the ZLIB trailer in a `$FL3` file; skipping unknown
//! info records moves forward by their declared size.

use std::{
    borrow::Cow,
    collections::VecDeque,
    fmt::{Debug, Display, Formatter, Result as FmtResult},
    io::{empty, BufRead, Error as IoError, ErrorKind, Read, Seek, SeekFrom},
    mem::take,
    num::NonZeroU8,
    ops::Range,
};

use binrw::Endian;
use encoding_rs::Encoding;
use flate2::bufread::ZlibDecoder;
use smallvec::SmallVec;
use thiserror::Error as ThisError;

use crate::{
    codepage::{self, default_encoding},
    data::{Datum, RawString},
    dictionary::{VarType, VarWidth},
    endian::{FromBytes, ToBytes},
    raw::records::{
        Compression, DocumentRecord, EncodingRecord, Extension, ExtensionWarning, FileHeader,
        FloatInfoRecord, HeaderWarning, IntegerInfoRecord, LongNameWarning,
        LongStringMissingValueRecord, LongStringMissingValuesWarning, LongStringValueLabelRecord,
        RawLongNamesRecord, RawVeryLongStringsRecord, ValueLabelRecord, ValueLabelWarning,
        VarDisplayRecord, VariableDisplayWarning, VariableRecord, VariableWarning,
        VeryLongStringWarning, ZHeader, ZHeaderError, ZTrailer, ZTrailerError,
        ZlibTrailerWarning,
    },
};

pub mod records;

/// An error encountered reading raw system file records.
///
/// Any error prevents reading further data from the system file: there is no
/// partial-success mode.
#[derive(Debug)]
pub struct Error {
    /// Range of file offsets where the error was detected.
    pub offsets: Option<Range<u64>>,

    /// Details of the error.
    pub details: ErrorDetails,
}

impl std::error::Error for Error {}

impl Error {
    /// Constructs an error from `offsets` and `details`.
    pub fn new(offsets: Option<Range<u64>>, details: ErrorDetails) -> Self {
        Self { offsets, details }
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        if let Some(offsets) = &self.offsets {
            if !offsets.is_empty() {
                if offsets.end > offsets.start.wrapping_add(1) {
                    write!(
                        f,
                        "Error at file offsets {:#x} to {:#x}: ",
                        offsets.start, offsets.end
                    )?;
                } else {
                    write!(f, "Error at file offset {:#x}: ", offsets.start)?;
                }
            }
        }
        write!(f, "{}", &self.details)
    }
}

impl From<IoError> for Error {
    fn from(value: IoError) -> Self {
        Self::new(None, value.into())
    }
}

/// Details of an [Error].
#[derive(ThisError, Debug)]
pub enum ErrorDetails {
    /// Not a system file.
    #[error("Not an SPSS system file")]
    NotASystemFile,

    /// EBCDIC header.
    #[error("File is encoded in EBCDIC, which is not supported.")]
    UnsupportedEncoding,

    /// Truncated file.
    #[error("Unexpected end of stream")]
    UnexpectedEndOfStream,

    /// I/O error.
    #[error("I/O error ({0})")]
    Io(IoError),

    /// Uncompressed or otherwise unsupported compression code in a `$FL2`
    /// header.
    #[error("Unsupported compression code {0} (only compressed files can be read).")]
    UnsupportedCompression(u32),

    /// Invalid compression code in a `$FL3` header.
    #[error("Invalid ZSAV compression code {0}")]
    InvalidZsavCompression(u32),

    /// Unrecognized record type.  Fatal, since record boundaries cannot be
    /// inferred without knowing the type.
    #[error("Unrecognized record type {0}.")]
    UnknownRecordType(u32),

    /// Overlong document record.
    #[error("Document record has document line count ({n}) greater than the maximum number {max}.")]
    BadDocumentLength {
        /// Number of lines.
        n: usize,
        /// Maximum number of lines.
        max: usize,
    },

    /// Variable width out of range.
    #[error("Variable width {0} in variable record is not in the valid range -1 to 255.")]
    BadVariableWidth(i32),

    /// Bad variable label code.
    #[error("In variable record, variable label code {0} is not 0 or 1.")]
    BadVariableLabelCode(u32),

    /// Bad missing value code.
    #[error("Missing value code ({0}) is not -3, -2, 0, 1, 2, or 3.")]
    BadMissingValueCode(i32),

    /// Too many value labels.
    #[error("Number of value labels ({n}) is greater than the maximum number {max}.")]
    BadNumberOfValueLabels {
        /// Number of value labels.
        n: u32,
        /// Maximum number of value labels.
        max: u32,
    },

    /// Missing type-4 record after a type-3 record.
    #[error("Following value label record, found record type {0} instead of expected type 4 for variable index record")]
    ExpectedVarIndexRecord(u32),

    /// Too many variable indexes for value labels.
    #[error("Number of variable indexes for value labels ({n}) is greater than the maximum number ({max}).")]
    TooManyVarIndexes {
        /// Number of variable indexes.
        n: u32,
        /// Maximum number of variable indexes.
        max: u32,
    },

    /// Extension record too large.
    #[error("Record type 7 subtype {subtype} is too large with element size {size} and {count} elements.")]
    ExtensionRecordTooLarge {
        /// Subtype.
        subtype: u32,
        /// Element size in bytes.
        size: u32,
        /// Number of elements.
        count: u32,
    },

    /// End of file in the middle of a compressed case.
    #[error("Unexpected end of file {case_ofs} bytes and {n_chunks} compression chunks into compressed case {case_number}.")]
    EofInCompressedCase {
        /// Offset into the case in bytes.
        case_ofs: u64,
        /// Number of compression chunks consumed.
        n_chunks: usize,
        /// 1-based case number in file.
        case_number: u64,
    },

    /// Error reading a [ZHeader].
    #[error("Error reading ZLIB header: {0}")]
    ZHeader(#[from] ZHeaderError),

    /// Error reading a [ZTrailer].
    #[error("Error reading ZLIB trailer: {0}")]
    ZTrailer(#[from] ZTrailerError),

    /// Case count mismatch.
    #[error("File metadata says it contains {expected} cases, but {actual} cases were read.")]
    WrongNumberOfCases {
        /// Expected number of cases.
        expected: u64,
        /// Actual number of cases.
        actual: u64,
    },

    /// Fatal encoding resolution error (EBCDIC code page).
    #[error(transparent)]
    Encoding(#[from] codepage::Error),
}

impl From<IoError> for ErrorDetails {
    fn from(value: IoError) -> Self {
        if value.kind() == ErrorKind::UnexpectedEof {
            Self::UnexpectedEndOfStream
        } else {
            Self::Io(value)
        }
    }
}

/// A warning reading a raw system file record.
///
/// Warnings indicate that something may be amiss, but they do not prevent
/// reading further records.
#[derive(Debug)]
pub struct Warning {
    /// Range of file offsets where the warning occurred.
    pub offsets: Option<Range<u64>>,

    /// Details of the warning.
    pub details: WarningDetails,
}

impl std::error::Error for Warning {}

impl Warning {
    /// Constructs a new [Warning] from `offsets` and `details`.
    pub fn new(offsets: Option<Range<u64>>, details: impl Into<WarningDetails>) -> Self {
        Self {
            offsets,
            details: details.into(),
        }
    }
}

impl Display for Warning {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        if let Some(offsets) = &self.offsets {
            if !offsets.is_empty() {
                write!(f, "Warning at file offset {:#x}: ", offsets.start)?;
            }
        }
        write!(f, "{}", &self.details)
    }
}

/// Details of a [Warning].
#[derive(ThisError, Debug)]
pub enum WarningDetails {
    /// Warning for the file header.
    #[error("In file header: {0}")]
    Header(#[from] HeaderWarning),

    /// Warning for variable records.
    #[error("In variable record: {0}")]
    Variable(#[from] VariableWarning),

    /// Warning for info records.
    #[error("In extension record: {0}")]
    Extension(#[from] ExtensionWarning),

    /// Warning for value labels.
    #[error("In value label record: {0}")]
    ValueLabel(#[from] ValueLabelWarning),

    /// Warning for variable display parameters.
    #[error("In variable display record: {0}")]
    VariableDisplay(#[from] VariableDisplayWarning),

    /// Warning for long variable names.
    #[error("In long variable name record: {0}")]
    LongName(#[from] LongNameWarning),

    /// Warning for very long strings.
    #[error("In very long string record: {0}")]
    VeryLongString(#[from] VeryLongStringWarning),

    /// Warning for long string missing values.
    #[error("In long string missing values record: {0}")]
    LongStringMissingValues(#[from] LongStringMissingValuesWarning),

    /// Warning for the ZLIB trailer.
    #[error("In ZLIB trailer: {0}")]
    ZlibTrailer(#[from] ZlibTrailerWarning),

    /// Bad encoding name.
    #[error("Encoding record contains an encoding name that is not valid UTF-8.")]
    BadEncodingName,

    /// Mis-encoded bytes in a string.
    #[error("Text string contains invalid bytes for {encoding} encoding: {text:?}")]
    MalformedString {
        /// The encoding.
        encoding: String,
        /// The problematic string.
        text: String,
    },

    /// Non-fatal encoding resolution problem.
    #[error(transparent)]
    Encoding(#[from] codepage::Error),
}

impl From<IoError> for WarningDetails {
    fn from(_source: IoError) -> Self {
        Self::Extension(ExtensionWarning::UnexpectedEndOfData)
    }
}

/// System file type, inferred from its "magic number", the first four bytes
/// of the file.
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub enum Magic {
    /// Regular system file.
    Sav,

    /// System file with ZLIB-compressed data.
    Zsav,

    /// EBCDIC-encoded system file (rejected).
    Ebcdic,
}

impl Magic {
    /// Magic number for a regular system file.
    pub const SAV: [u8; 4] = *b"$FL2";

    /// Magic number for a system file that contains ZLIB-compressed data.
    pub const ZSAV: [u8; 4] = *b"$FL3";

    /// Magic number for an EBCDIC-encoded system file: `$FL2` in EBCDIC.
    pub const EBCDIC: [u8; 4] = [0x5b, 0xc6, 0xd3, 0xf2];
}

impl Debug for Magic {
    fn fmt(&self, f: &mut Formatter) -> FmtResult {
        let s = match *self {
            Magic::Sav => "$FL2",
            Magic::Zsav => "$FL3",
            Magic::Ebcdic => "($FL2 in EBCDIC)",
        };
        write!(f, "{s}")
    }
}

impl serde::Serialize for Magic {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&format!("{self:?}"))
    }
}

impl From<Magic> for [u8; 4] {
    fn from(value: Magic) -> Self {
        match value {
            Magic::Sav => Magic::SAV,
            Magic::Zsav => Magic::ZSAV,
            Magic::Ebcdic => Magic::EBCDIC,
        }
    }
}

impl TryFrom<[u8; 4]> for Magic {
    type Error = ();

    fn try_from(value: [u8; 4]) -> Result<Self, ()> {
        match value {
            Magic::SAV => Ok(Magic::Sav),
            Magic::ZSAV => Ok(Magic::Zsav),
            Magic::EBCDIC => Ok(Magic::Ebcdic),
            _ => Err(()),
        }
    }
}

/// Width of a variable record.
#[derive(Copy, Clone, Debug, PartialEq, Eq, serde::Serialize)]
pub enum RawWidth {
    /// String continuation.
    ///
    /// One variable record of this type is present for each 8 bytes after
    /// the first 8 bytes of a string variable, as a kind of placeholder.
    Continuation,

    /// Numeric.
    Numeric,

    /// String, 1 to 255 bytes wide.
    String(NonZeroU8),
}

impl RawWidth {
    /// Returns the number of 8-byte value positions a variable with this
    /// width occupies, or `None` for a continuation.
    pub fn n_chunks(&self) -> Option<usize> {
        match self {
            RawWidth::Numeric => Some(1),
            RawWidth::String(width) => Some((width.get() as usize).div_ceil(8)),
            RawWidth::Continuation => None,
        }
    }
}

impl Display for RawWidth {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            RawWidth::Continuation => write!(f, "long string continuation"),
            RawWidth::Numeric => write!(f, "numeric"),
            RawWidth::String(width) => write!(f, "{width}-byte string"),
        }
    }
}

/// 8 bytes that represent a number or a string, but that's all we know: not
/// which of the two, nor the numeric byte order, nor the character encoding.
#[derive(Copy, Clone)]
pub struct UntypedDatum(pub [u8; 8]);

impl Debug for UntypedDatum {
    fn fmt(&self, f: &mut Formatter) -> FmtResult {
        let number: f64 = Endian::Little.parse(self.0);
        write!(f, "{number:?}/{:?}", RawString::from(self.0.as_slice()))
    }
}

/// An 8-byte datum whose type is known but whose string width and character
/// encoding are not.
#[derive(Copy, Clone)]
pub enum RawDatum {
    /// A number, or `None` for system-missing.
    Number(Option<f64>),

    /// Eight bytes of string content.
    String([u8; 8]),
}

impl Debug for RawDatum {
    fn fmt(&self, f: &mut Formatter) -> FmtResult {
        match self {
            RawDatum::Number(Some(number)) => write!(f, "{number:?}"),
            RawDatum::Number(None) => write!(f, "SYSMIS"),
            RawDatum::String(s) => write!(f, "{:?}", RawString::from(s.as_slice())),
        }
    }
}

impl serde::Serialize for RawDatum {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        match self {
            RawDatum::Number(number) => number.serialize(serializer),
            RawDatum::String(s) => RawString::from(s.as_slice()).serialize(serializer),
        }
    }
}

impl RawDatum {
    /// Constructs a `RawDatum` from `raw` given that the variable type and
    /// byte order are now known.
    pub fn from_raw(raw: &UntypedDatum, var_type: VarType, endian: Endian) -> Self {
        match var_type {
            VarType::String => RawDatum::String(raw.0),
            VarType::Numeric => RawDatum::Number(endian.parse(raw.0)),
        }
    }

    /// Converts to a [Datum] given the variable's string width.
    pub fn decode(&self, width: VarWidth) -> Datum {
        match self {
            Self::Number(x) => Datum::Number(*x),
            Self::String(s) => {
                let width = width.as_string_width().unwrap_or(8).min(8);
                Datum::String(RawString::from(&s[..width]))
            }
        }
    }
}

/// An [Encoding] along with a function to report decoding problems, used to
/// decode the raw records once the file's encoding is known.
pub struct Decoder<'a> {
    /// The character encoding to use.
    pub encoding: &'static Encoding,

    warn: Box<dyn FnMut(Warning) + 'a>,
}

impl<'de> Decoder<'de> {
    /// Constructs a decoder using `encoding`, reporting warnings through
    /// `warn`.
    pub fn new<F>(encoding: &'static Encoding, warn: F) -> Self
    where
        F: FnMut(Warning) + 'de,
    {
        Self {
            encoding,
            warn: Box::new(warn),
        }
    }

    /// Reports `warning`.
    pub fn warn(&mut self, warning: Warning) {
        (self.warn)(warning)
    }

    /// Decodes `input` with our encoding, warning about (and replacing)
    /// malformed sequences rather than failing: label text is not considered
    /// format-critical.
    pub fn decode<'a>(&mut self, input: &'a RawString) -> Cow<'a, str> {
        let (output, malformed) = self.encoding.decode_without_bom_handling(&input.0);
        if malformed {
            let text = output.clone().into_owned();
            self.warn(Warning::new(
                None,
                WarningDetails::MalformedString {
                    encoding: self.encoding.name().into(),
                    text,
                },
            ));
        }
        output
    }
}

/// A raw record in a system file.
#[derive(Clone, Debug, serde::Serialize)]
pub enum Record {
    /// Variable record.
    Variable(VariableRecord<RawString>),

    /// Value labels for numeric and short string variables.
    ValueLabel(ValueLabelRecord<RawString>),

    /// Document record.
    Document(DocumentRecord<RawString>),

    /// Machine integer info record.
    IntegerInfo(IntegerInfoRecord),

    /// Machine floating-point info record.
    FloatInfo(FloatInfoRecord),

    /// Variable display parameters.
    VarDisplay(VarDisplayRecord),

    /// Long variable names.
    LongNames(RawLongNamesRecord),

    /// Very long string widths.
    VeryLongStrings(RawVeryLongStringsRecord),

    /// Character encoding record.
    Encoding(EncodingRecord),

    /// Value labels for long string variables.
    LongStringValueLabels(LongStringValueLabelRecord<RawString>),

    /// Missing values for long string variables.
    LongStringMissingValues(LongStringMissingValueRecord<RawString>),

    /// Info records with unrecognized subtypes, skipped by declared size.
    OtherExtension(Extension),

    /// End of headers.
    EndOfHeaders(u32),

    /// Header record for ZLIB-compressed data.
    ZHeader(ZHeader),

    /// Trailer record for ZLIB-compressed data.
    ZTrailer(ZTrailer),
}

impl Record {
    fn read<R>(
        reader: &mut R,
        endian: Endian,
        var_types: &VarTypes,
        warn: &mut dyn FnMut(Warning),
    ) -> Result<Option<Record>, Error>
    where
        R: BufRead + Seek,
    {
        let rec_type: u32 = endian.parse(read_bytes(reader)?);
        match rec_type {
            2 => Ok(Some(Record::Variable(VariableRecord::read(
                reader, endian, warn,
            )?))),
            3 => Ok(
                ValueLabelRecord::read(reader, endian, var_types, warn)?.map(Record::ValueLabel)
            ),
            6 => Ok(Some(Record::Document(DocumentRecord::read(
                reader, endian,
            )?))),
            7 => Extension::read(reader, endian, var_types, warn),
            999 => Ok(Some(Record::EndOfHeaders(
                endian.parse(read_bytes(reader)?),
            ))),
            _ => Err(Error::new(
                {
                    let offset = reader.stream_position()?;
                    Some(offset - 4..offset)
                },
                ErrorDetails::UnknownRecordType(rec_type),
            )),
        }
    }

    /// Decodes this record's text with `decoder`.
    pub fn decode(self, decoder: &mut Decoder) -> DecodedRecord {
        match self {
            Record::Variable(record) => DecodedRecord::Variable(record.decode(decoder)),
            Record::ValueLabel(record) => DecodedRecord::ValueLabel(record.decode(decoder)),
            Record::Document(record) => DecodedRecord::Document(record.decode(decoder)),
            Record::IntegerInfo(record) => DecodedRecord::IntegerInfo(record),
            Record::FloatInfo(record) => DecodedRecord::FloatInfo(record),
            Record::VarDisplay(record) => DecodedRecord::VarDisplay(record),
            Record::LongNames(record) => DecodedRecord::LongNames(record.decode(decoder)),
            Record::VeryLongStrings(record) => {
                DecodedRecord::VeryLongStrings(record.decode(decoder))
            }
            Record::Encoding(record) => DecodedRecord::Encoding(record),
            Record::LongStringValueLabels(record) => {
                DecodedRecord::LongStringValueLabels(record.decode(decoder))
            }
            Record::LongStringMissingValues(record) => {
                DecodedRecord::LongStringMissingValues(record.decode(decoder))
            }
            Record::OtherExtension(record) => DecodedRecord::OtherExtension(record),
            Record::EndOfHeaders(record) => DecodedRecord::EndOfHeaders(record),
            Record::ZHeader(record) => DecodedRecord::ZHeader(record),
            Record::ZTrailer(record) => DecodedRecord::ZTrailer(record),
        }
    }
}

/// A [Record] with its text decoded.
#[derive(Clone, Debug, serde::Serialize)]
pub enum DecodedRecord {
    /// Variable record.
    Variable(VariableRecord<String>),

    /// Value labels for numeric and short string variables.
    ValueLabel(ValueLabelRecord<String>),

    /// Document record.
    Document(DocumentRecord<String>),

    /// Machine integer info record.
    IntegerInfo(IntegerInfoRecord),

    /// Machine floating-point info record.
    FloatInfo(FloatInfoRecord),

    /// Variable display parameters.
    VarDisplay(VarDisplayRecord),

    /// Long variable names.
    LongNames(records::LongNamesRecord),

    /// Very long string widths.
    VeryLongStrings(records::VeryLongStringsRecord),

    /// Character encoding record.
    Encoding(EncodingRecord),

    /// Value labels for long string variables.
    LongStringValueLabels(LongStringValueLabelRecord<String>),

    /// Missing values for long string variables.
    LongStringMissingValues(LongStringMissingValueRecord<String>),

    /// Info records with unrecognized subtypes.
    OtherExtension(Extension),

    /// End of headers.
    EndOfHeaders(u32),

    /// Header record for ZLIB-compressed data.
    ZHeader(ZHeader),

    /// Trailer record for ZLIB-compressed data.
    ZTrailer(ZTrailer),
}

/// Infers the header and data encodings from `records`.
///
/// The machine integer info record's character code (if any) determines the
/// header encoding, and with it the default data encoding; a character
/// encoding record overrides the data encoding by name.  EBCDIC is a fatal
/// error; anything else unrecognized warns and falls back to the default.
pub fn infer_encodings(
    records: &[Record],
    warn: &mut dyn FnMut(Warning),
) -> Result<(&'static Encoding, &'static Encoding), Error> {
    let codepage = records
        .iter()
        .find_map(|record| match record {
            Record::IntegerInfo(info) => Some(info.inner.character_code),
            _ => None,
        });
    let header_encoding = match codepage {
        Some(codepage) => match codepage::encoding_from_codepage(codepage) {
            Ok(encoding) => encoding,
            Err(err @ codepage::Error::Ebcdic) => return Err(Error::new(None, err.into())),
            Err(err) => {
                warn(Warning::new(None, err));
                default_encoding()
            }
        },
        None => default_encoding(),
    };

    let name = records.iter().find_map(|record| match record {
        Record::Encoding(EncodingRecord(name)) => Some(name.as_str()),
        _ => None,
    });
    let data_encoding = match name {
        Some(name) => match codepage::encoding_from_name(name) {
            Ok(encoding) => encoding,
            Err(err) => {
                warn(Warning::new(None, err));
                header_encoding
            }
        },
        None => header_encoding,
    };

    Ok((header_encoding, data_encoding))
}

/// A collection of variable widths indexed the way the rest of a system file
/// refers to variables.
///
/// Value label records (and the header's weight index) identify variables by
/// 1-based positions that count every 8-byte storage unit: a string variable
/// of width 9..=16 occupies two positions, and only a reference to its first
/// position is valid.
#[derive(Default)]
pub struct VarTypes {
    types: Vec<Option<VarWidth>>,
}

impl VarTypes {
    /// Constructs a new, empty [VarTypes].
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a variable of width `width`.
    pub fn push(&mut self, width: VarWidth) {
        self.types.push(Some(width));
        for _ in 1..width.n_chunks().unwrap_or(1) {
            self.types.push(None);
        }
    }

    /// Returns the number of value positions spanned by these variables.
    pub fn n_values(&self) -> usize {
        self.types.len()
    }

    /// Returns true if 1-based `index` refers to the first position of a
    /// variable.
    pub fn is_valid_index(&self, index: usize) -> bool {
        self.var_type_at(index).is_some()
    }

    /// Returns the type of the variable at 1-based `index`, if that is the
    /// first position of a variable.
    pub fn var_type_at(&self, index: usize) -> Option<VarType> {
        self.types
            .get(index.checked_sub(1)?)?
            .map(VarType::from)
    }

    /// Returns the number of named variable records pushed (real variables
    /// plus very-long-string segments, but not continuations).
    pub fn n_vars(&self) -> usize {
        self.types.iter().flatten().count()
    }
}

pub(crate) fn try_read_bytes_into<R: Read>(r: &mut R, buf: &mut [u8]) -> Result<bool, IoError> {
    let n = r.read(buf)?;
    if n > 0 {
        if n < buf.len() {
            r.read_exact(&mut buf[n..])?;
        }
        Ok(true)
    } else {
        Ok(false)
    }
}

pub(crate) fn try_read_bytes<const N: usize, R: Read>(
    r: &mut R,
) -> Result<Option<[u8; N]>, IoError> {
    let mut buf = [0; N];
    match try_read_bytes_into(r, &mut buf)? {
        true => Ok(Some(buf)),
        false => Ok(None),
    }
}

pub(crate) fn read_bytes<const N: usize, R: Read>(r: &mut R) -> Result<[u8; N], IoError> {
    let mut buf = [0; N];
    r.read_exact(&mut buf)?;
    Ok(buf)
}

pub(crate) fn read_vec<R: Read>(r: &mut R, n: usize) -> Result<Vec<u8>, IoError> {
    let mut vec = vec![0; n];
    r.read_exact(&mut vec)?;
    Ok(vec)
}

pub(crate) fn read_string<R: Read>(r: &mut R, endian: Endian) -> Result<RawString, IoError> {
    let length: u32 = endian.parse(read_bytes(r)?);
    Ok(read_vec(r, length as usize)?.into())
}

/// Reads the next 8-byte cell from the compressed data stream.
///
/// `codes` holds the compression codes remaining from the current 8-byte
/// instruction block; when it runs dry, the next instruction block is read.
/// Returns `Ok(None)` at end of stream (opcode 252 or physical end of
/// input).
fn read_compressed_chunk<R: Read>(
    reader: &mut R,
    codes: &mut VecDeque<u8>,
    endian: Endian,
    bias: f64,
) -> Result<Option<[u8; 8]>, Error> {
    loop {
        match codes.pop_front() {
            Some(0) => (),
            Some(252) => return Ok(None),
            Some(253) => return Ok(Some(read_bytes(reader)?)),
            Some(254) => return Ok(Some([b' '; 8])),
            Some(255) => return Ok(Some(endian.to_bytes(-f64::MAX))),
            Some(code) => return Ok(Some(endian.to_bytes(code as f64 - bias))),
            None => match try_read_bytes::<8, _>(reader)? {
                Some(new_codes) => codes.extend(new_codes),
                None => return Ok(None),
            },
        };
    }
}

/// Transparently decompresses the sequence of ZLIB blocks between the ZLIB
/// header and trailer of a `$FL3` file, presenting it as the flat stream of
/// compressed-case bytes a `$FL2` file would hold.
///
/// Each block is an independent zlib stream.  When one is exhausted, the
/// decompressor restarts on the following bytes, until the underlying stream
/// reaches `limit` (the trailer offset).  A single `read` call crosses block
/// boundaries without the caller noticing.
struct ZlibDecodeMultiple<R>
where
    R: BufRead + Seek,
{
    reader: Option<ZlibDecoder<R>>,
    limit: u64,
    at_start: bool,
}

impl<R> ZlibDecodeMultiple<R>
where
    R: BufRead + Seek,
{
    fn new(reader: R, limit: u64) -> ZlibDecodeMultiple<R> {
        ZlibDecodeMultiple {
            reader: Some(ZlibDecoder::new(reader)),
            limit,
            at_start: true,
        }
    }
}

impl<R> Read for ZlibDecodeMultiple<R>
where
    R: BufRead + Seek,
{
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, IoError> {
        if self.at_start {
            // A file with no case data has no blocks at all; don't try to
            // inflate the trailer.
            self.at_start = false;
            let inner = self.reader.as_mut().unwrap().get_mut();
            if inner.stream_position()? >= self.limit {
                return Ok(0);
            }
        }
        loop {
            match self.reader.as_mut().unwrap().read(buf) {
                Err(error) => return Err(error),
                Ok(0) => {
                    // Zero inflated bytes: either the end of one block or
                    // the end of the data region.  Not an error either way.
                    let mut inner = self.reader.take().unwrap().into_inner();
                    let position = inner.stream_position();
                    self.reader = Some(ZlibDecoder::new(inner));
                    if position? >= self.limit {
                        return Ok(0);
                    }
                }
                Ok(n) => return Ok(n),
            };
        }
    }
}

impl<R> Seek for ZlibDecodeMultiple<R>
where
    R: BufRead + Seek,
{
    fn seek(&mut self, pos: SeekFrom) -> Result<u64, IoError> {
        self.reader.as_mut().unwrap().get_mut().seek(pos)
    }
}

enum ReaderState {
    Headers,
    ZlibHeader,
    ZlibTrailer(ZHeader),
    End,
}

/// Reads records from a system file in their raw form.
pub struct Reader<'a, R>
where
    R: BufRead + Seek + 'static,
{
    reader: Option<R>,
    warn: Box<dyn FnMut(Warning) + 'a>,

    header: FileHeader<RawString>,
    var_types: VarTypes,

    state: ReaderState,
    cases: Option<RawCases>,
}

impl<'a, R> Reader<'a, R>
where
    R: BufRead + Seek + 'static,
{
    /// Constructs a new [Reader] from the underlying `reader`.  Any warnings
    /// encountered while reading the system file will be reported with
    /// `warn`.
    pub fn new(mut reader: R, mut warn: impl FnMut(Warning) + 'a) -> Result<Self, Error> {
        let header = FileHeader::read(&mut reader, &mut warn)?;
        Ok(Self {
            reader: Some(reader),
            warn: Box::new(warn),
            header,
            var_types: VarTypes::new(),
            state: ReaderState::Headers,
            cases: None,
        })
    }

    /// Returns the file header.
    pub fn header(&self) -> &FileHeader<RawString> {
        &self.header
    }

    /// Returns an iterator over the file's records.
    pub fn records<'b>(&'b mut self) -> Records<'a, 'b, R> {
        Records(self)
    }

    /// Returns a reader for the file's cases.
    ///
    /// The cases are only available once all of the records have been read;
    /// calling this earlier, or after an error, yields an empty [RawCases].
    pub fn cases(self) -> RawCases {
        self.cases.unwrap_or_default()
    }
}

/// Iterator over the records of a system file.
pub struct Records<'a, 'b, R>(&'b mut Reader<'a, R>)
where
    R: BufRead + Seek + 'static;

impl<'a, 'b, R> Records<'a, 'b, R>
where
    R: BufRead + Seek + 'static,
{
    fn cases(&mut self, ztrailer_offset: Option<u64>) {
        self.0.state = ReaderState::End;
        self.0.cases = Some(RawCases::new(
            self.0.reader.take().unwrap(),
            take(&mut self.0.var_types),
            &self.0.header,
            ztrailer_offset,
        ));
    }

    fn next_inner(&mut self) -> Option<<Self as Iterator>::Item> {
        match self.0.state {
            ReaderState::Headers => {
                let record = loop {
                    match Record::read(
                        self.0.reader.as_mut().unwrap(),
                        self.0.header.endian,
                        &self.0.var_types,
                        &mut self.0.warn,
                    ) {
                        Ok(Some(record)) => break record,
                        Ok(None) => (),
                        Err(error) => return Some(Err(error)),
                    }
                };
                match record {
                    Record::Variable(VariableRecord { width, .. }) => {
                        if let Ok(width) = VarWidth::try_from(width) {
                            self.0.var_types.push(width);
                        }
                    }
                    Record::EndOfHeaders(_) => {
                        self.0.state = if self.0.header.compression == Compression::ZLib {
                            ReaderState::ZlibHeader
                        } else {
                            self.cases(None);
                            ReaderState::End
                        };
                    }
                    _ => (),
                };
                Some(Ok(record))
            }
            ReaderState::ZlibHeader => {
                let zheader =
                    match ZHeader::read(self.0.reader.as_mut().unwrap(), self.0.header.endian) {
                        Ok(zheader) => zheader,
                        Err(error) => return Some(Err(error)),
                    };
                self.0.state = ReaderState::ZlibTrailer(zheader.clone());
                Some(Ok(Record::ZHeader(zheader)))
            }
            ReaderState::ZlibTrailer(ref zheader) => {
                match ZTrailer::read(
                    self.0.reader.as_mut().unwrap(),
                    self.0.header.endian,
                    self.0.header.bias,
                    &zheader.inner,
                    &mut self.0.warn,
                ) {
                    Ok(None) => {
                        self.cases(Some(zheader.inner.ztrailer_offset));
                        None
                    }
                    Ok(Some(ztrailer)) => {
                        self.cases(Some(ztrailer.offset));
                        Some(Ok(Record::ZTrailer(ztrailer)))
                    }
                    Err(error) => Some(Err(error)),
                }
            }
            ReaderState::End => None,
        }
    }
}

impl<'a, 'b, R> Iterator for Records<'a, 'b, R>
where
    R: BufRead + Seek + 'static,
{
    type Item = Result<Record, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        let retval = self.next_inner();
        if let Some(Err(_)) = &retval {
            self.0.state = ReaderState::End;
        }
        retval
    }
}

impl TryFrom<RawWidth> for VarWidth {
    type Error = ();

    fn try_from(value: RawWidth) -> Result<Self, ()> {
        match value {
            RawWidth::Continuation => Err(()),
            RawWidth::Numeric => Ok(Self::Numeric),
            RawWidth::String(width) => Ok(Self::String(width.get() as u16)),
        }
    }
}

trait ReadSeek: Read + Seek {}
impl<T> ReadSeek for T where T: Read + Seek {}

#[derive(Debug)]
struct StringSegment {
    data_bytes: usize,
    padding_bytes: usize,
}

/// How one variable's cells are laid out within a case.
enum CaseVar {
    Numeric,
    String {
        width: usize,
        segments: SmallVec<[StringSegment; 1]>,
    },
}

impl CaseVar {
    fn new(width: VarWidth) -> Self {
        match width {
            VarWidth::Numeric => Self::Numeric,
            VarWidth::String(width) => {
                let width = width as usize;
                let mut segments = SmallVec::<[StringSegment; 1]>::new();
                let mut remaining = width;
                for segment in VarWidth::String(width as u16).segments() {
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
                CaseVar::String { width, segments }
            }
        }
    }
}

/// One case (row) of raw data, one [Datum] per logical variable.
#[derive(Clone, Debug, serde::Serialize)]
pub struct RawCase(pub Vec<Datum>);

fn read_case<R: Read + Seek>(
    reader: &mut R,
    case_number: u64,
    case_vars: &[CaseVar],
    codes: &mut VecDeque<u8>,
    endian: Endian,
    bias: f64,
) -> Result<Option<RawCase>, Error> {
    fn eof<R: Seek>(
        reader: &mut R,
        case_number: u64,
        case_start: u64,
        n_chunks: usize,
    ) -> Result<Option<RawCase>, Error> {
        let offset = reader.stream_position()?;
        if n_chunks > 0 {
            Err(Error::new(
                Some(case_start..offset),
                ErrorDetails::EofInCompressedCase {
                    case_ofs: offset - case_start,
                    n_chunks,
                    case_number,
                },
            ))
        } else {
            Ok(None)
        }
    }

    let case_start = reader.stream_position()?;
    let mut n_chunks = 0;
    let mut values = Vec::with_capacity(case_vars.len());
    for var in case_vars {
        match var {
            CaseVar::Numeric => {
                let Some(raw) = read_compressed_chunk(reader, codes, endian, bias)? else {
                    return eof(reader, case_number, case_start, n_chunks);
                };
                n_chunks += 1;
                values.push(Datum::Number(endian.parse(raw)));
            }
            CaseVar::String { width, segments } => {
                let mut datum = Vec::with_capacity(*width);
                for segment in segments {
                    let mut data_bytes = segment.data_bytes;
                    let mut padding_bytes = segment.padding_bytes;
                    while data_bytes > 0 || padding_bytes > 0 {
                        let Some(raw) = read_compressed_chunk(reader, codes, endian, bias)? else {
                            return eof(reader, case_number, case_start, n_chunks);
                        };
                        let n_data = data_bytes.min(8);
                        datum.extend_from_slice(&raw[..n_data]);
                        data_bytes -= n_data;
                        padding_bytes -= 8 - n_data;
                        n_chunks += 1;
                    }
                }
                values.push(Datum::String(datum.into()));
            }
        }
    }
    Ok(Some(RawCase(values)))
}

/// Reader for the cases in a system file.
///
/// From [Reader::cases], very long string variables are still in their raw
/// form, divided into multiple adjacent string variables.  Use
/// [RawCases::with_widths] with the merged widths (as
/// [crate::cooked] does) to read each logical variable as one [Datum].
pub struct RawCases {
    reader: Box<dyn ReadSeek>,
    case_vars: Vec<CaseVar>,
    bias: f64,
    endian: Endian,
    codes: VecDeque<u8>,
    eof: bool,
    expected_cases: Option<u64>,
    read_cases: u64,
}

impl Debug for RawCases {
    fn fmt(&self, f: &mut Formatter) -> FmtResult {
        write!(f, "RawCases")
    }
}

impl Default for RawCases {
    fn default() -> Self {
        Self {
            reader: Box::new(empty()),
            case_vars: Vec::new(),
            bias: 100.0,
            endian: Endian::Little,
            codes: VecDeque::with_capacity(8),
            eof: false,
            expected_cases: None,
            read_cases: 0,
        }
    }
}

impl RawCases {
    fn new<R>(
        reader: R,
        var_types: VarTypes,
        header: &FileHeader<RawString>,
        ztrailer_offset: Option<u64>,
    ) -> Self
    where
        R: BufRead + Seek + 'static,
    {
        Self {
            reader: if header.compression == Compression::ZLib {
                Box::new(ZlibDecodeMultiple::new(reader, ztrailer_offset.unwrap()))
            } else {
                Box::new(reader)
            },
            case_vars: var_types
                .types
                .iter()
                .flatten()
                .copied()
                .map(CaseVar::new)
                .collect(),
            bias: header.bias,
            endian: header.endian,
            codes: VecDeque::with_capacity(8),
            eof: false,
            expected_cases: None,
            read_cases: 0,
        }
    }

    /// Returns this [RawCases] with its notion of variable widths replaced
    /// by `widths`.  Used after merging very long strings, so that each
    /// logical variable reads as one value.
    pub fn with_widths(self, widths: impl IntoIterator<Item = VarWidth>) -> Self {
        Self {
            case_vars: widths.into_iter().map(CaseVar::new).collect(),
            ..self
        }
    }

    /// Returns this [RawCases] updated to expect `expected_cases`.  If the
    /// actual number of cases in the file differs, reading the final case
    /// reports an error.
    pub fn with_expected_cases(self, expected_cases: u64) -> Self {
        Self {
            expected_cases: Some(expected_cases),
            ..self
        }
    }
}

impl Iterator for RawCases {
    type Item = Result<RawCase, Error>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.eof {
            return None;
        }

        let retval = if self.case_vars.is_empty() {
            None
        } else {
            read_case(
                &mut self.reader,
                self.read_cases + 1,
                &self.case_vars,
                &mut self.codes,
                self.endian,
                self.bias,
            )
            .transpose()
        };
        match &retval {
            None => {
                self.eof = true;
                if let Some(expected_cases) = self.expected_cases {
                    if expected_cases != self.read_cases {
                        return Some(Err(Error::new(
                            None,
                            ErrorDetails::WrongNumberOfCases {
                                expected: expected_cases,
                                actual: self.read_cases,
                            },
                        )));
                    }
                }
                None
            }
            Some(Ok(_)) => {
                self.read_cases += 1;
                retval
            }
            Some(Err(_)) => {
                self.eof = true;
                retval
            }
        }
    }
}
