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

//! Output formats.
//!
//! Every variable carries an output format, a triple of format type, field
//! width, and decimal count packed into one 32-bit word in the file.  The
//! format type decides how this crate types a column: string formats read and
//! write text, date-like formats convert through the SPSS calendar, and
//! everything else is numeric.

use std::fmt::{Debug, Display, Formatter, Result as FmtResult};

use binrw::{BinRead, BinWrite};
use serde::Serialize;
use thiserror::Error as ThisError;

use crate::dictionary::VarWidth;

/// A format type, with its system-file type code.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize)]
pub enum Type {
    /// Alphanumeric string.
    A,
    /// Hex-encoded string.
    AHex,
    /// Number with comma grouping.
    Comma,
    /// Currency.
    Dollar,
    /// Basic numeric.
    F,
    /// Integer binary.
    IB,
    /// Positive integer binary, hex digits.
    PIBHex,
    /// Packed decimal.
    P,
    /// Positive integer binary.
    PIB,
    /// Unsigned packed decimal.
    PK,
    /// Real binary.
    RB,
    /// Real binary, hex digits.
    RBHex,
    /// Zoned decimal.
    Z,
    /// Numeric with leading zeros.
    N,
    /// Scientific notation.
    E,
    /// `dd-mmm-yyyy` date.
    Date,
    /// Time interval.
    Time,
    /// Date and time.
    DateTime,
    /// `mm/dd/yyyy` date.
    ADate,
    /// Julian date.
    JDate,
    /// Time interval with days.
    DTime,
    /// Day of the week.
    WkDay,
    /// Month name.
    Month,
    /// Month and year.
    MoYr,
    /// Quarter and year.
    QYr,
    /// Week and year.
    WkYr,
    /// Percentage.
    Pct,
    /// Number with dot grouping.
    Dot,
    /// Custom currency A-E.
    CC(u8),
    /// `dd.mm.yyyy` date.
    EDate,
    /// `yyyy/mm/dd` date.
    SDate,
    /// Time interval in minutes.
    MTime,
    /// `yyyy-mm-dd hh:mm:ss` date and time.
    YmdHms,
}

/// An unknown format type code.
#[derive(Copy, Clone, Debug, PartialEq, Eq, ThisError)]
#[error("Unknown format type code {0}.")]
pub struct UnknownType(pub u16);

impl From<Type> for u16 {
    fn from(type_: Type) -> Self {
        match type_ {
            Type::A => 1,
            Type::AHex => 2,
            Type::Comma => 3,
            Type::Dollar => 4,
            Type::F => 5,
            Type::IB => 6,
            Type::PIBHex => 7,
            Type::P => 8,
            Type::PIB => 9,
            Type::PK => 10,
            Type::RB => 11,
            Type::RBHex => 12,
            Type::Z => 15,
            Type::N => 16,
            Type::E => 17,
            Type::Date => 20,
            Type::Time => 21,
            Type::DateTime => 22,
            Type::ADate => 23,
            Type::JDate => 24,
            Type::DTime => 25,
            Type::WkDay => 26,
            Type::Month => 27,
            Type::MoYr => 28,
            Type::QYr => 29,
            Type::WkYr => 30,
            Type::Pct => 31,
            Type::Dot => 32,
            Type::CC(n) => 33 + n as u16,
            Type::EDate => 38,
            Type::SDate => 39,
            Type::MTime => 40,
            Type::YmdHms => 41,
        }
    }
}

impl TryFrom<u16> for Type {
    type Error = UnknownType;

    fn try_from(code: u16) -> Result<Self, Self::Error> {
        match code {
            1 => Ok(Type::A),
            2 => Ok(Type::AHex),
            3 => Ok(Type::Comma),
            4 => Ok(Type::Dollar),
            5 => Ok(Type::F),
            6 => Ok(Type::IB),
            7 => Ok(Type::PIBHex),
            8 => Ok(Type::P),
            9 => Ok(Type::PIB),
            10 => Ok(Type::PK),
            11 => Ok(Type::RB),
            12 => Ok(Type::RBHex),
            15 => Ok(Type::Z),
            16 => Ok(Type::N),
            17 => Ok(Type::E),
            20 => Ok(Type::Date),
            21 => Ok(Type::Time),
            22 => Ok(Type::DateTime),
            23 => Ok(Type::ADate),
            24 => Ok(Type::JDate),
            25 => Ok(Type::DTime),
            26 => Ok(Type::WkDay),
            27 => Ok(Type::Month),
            28 => Ok(Type::MoYr),
            29 => Ok(Type::QYr),
            30 => Ok(Type::WkYr),
            31 => Ok(Type::Pct),
            32 => Ok(Type::Dot),
            33..=37 => Ok(Type::CC((code - 33) as u8)),
            38 => Ok(Type::EDate),
            39 => Ok(Type::SDate),
            40 => Ok(Type::MTime),
            41 => Ok(Type::YmdHms),
            _ => Err(UnknownType(code)),
        }
    }
}

impl Type {
    /// Returns true for string format types.
    pub fn is_string(self) -> bool {
        matches!(self, Type::A | Type::AHex)
    }

    /// Returns true for the format types whose stored double is a count of
    /// seconds from the SPSS epoch and which therefore read and write as
    /// calendar dates.
    pub fn is_date(self) -> bool {
        matches!(
            self,
            Type::Date | Type::ADate | Type::EDate | Type::JDate | Type::SDate | Type::DateTime
        )
    }

    /// Returns the format's name as it appears in SPSS syntax.
    pub fn as_str(&self) -> &'static str {
        match self {
            Type::A => "A",
            Type::AHex => "AHEX",
            Type::Comma => "COMMA",
            Type::Dollar => "DOLLAR",
            Type::F => "F",
            Type::IB => "IB",
            Type::PIBHex => "PIBHEX",
            Type::P => "P",
            Type::PIB => "PIB",
            Type::PK => "PK",
            Type::RB => "RB",
            Type::RBHex => "RBHEX",
            Type::Z => "Z",
            Type::N => "N",
            Type::E => "E",
            Type::Date => "DATE",
            Type::Time => "TIME",
            Type::DateTime => "DATETIME",
            Type::ADate => "ADATE",
            Type::JDate => "JDATE",
            Type::DTime => "DTIME",
            Type::WkDay => "WKDAY",
            Type::Month => "MONTH",
            Type::MoYr => "MOYR",
            Type::QYr => "QYR",
            Type::WkYr => "WKYR",
            Type::Pct => "PCT",
            Type::Dot => "DOT",
            Type::CC(0) => "CCA",
            Type::CC(1) => "CCB",
            Type::CC(2) => "CCC",
            Type::CC(3) => "CCD",
            Type::CC(_) => "CCE",
            Type::EDate => "EDATE",
            Type::SDate => "SDATE",
            Type::MTime => "MTIME",
            Type::YmdHms => "YMDHMS",
        }
    }
}

impl Display for Type {
    fn fmt(&self, f: &mut Formatter) -> FmtResult {
        write!(f, "{}", self.as_str())
    }
}

/// An output format: type, field width, decimal places.
#[derive(Copy, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct Format {
    type_: Type,
    w: u8,
    d: u8,
}

impl Format {
    /// `F8.2`, the default numeric format.
    pub const F8_2: Format = Format {
        type_: Type::F,
        w: 8,
        d: 2,
    };

    /// `DATETIME20.0`.
    pub const DATETIME20: Format = Format {
        type_: Type::DateTime,
        w: 20,
        d: 0,
    };

    /// Constructs a format from its parts.
    pub fn new(type_: Type, w: u8, d: u8) -> Self {
        Self { type_, w, d }
    }

    /// The format type.
    pub fn type_(&self) -> Type {
        self.type_
    }

    /// The field width.
    pub fn w(&self) -> u8 {
        self.w
    }

    /// The number of decimal places.
    pub fn d(&self) -> u8 {
        self.d
    }

    /// The default format for a variable of the given width: `F8.2` for
    /// numeric variables, `A` at the storage width for strings.
    pub fn default_for_width(width: VarWidth) -> Self {
        match width {
            VarWidth::Numeric => Self::F8_2,
            VarWidth::String(w) => Self::new(Type::A, w.min(255) as u8, 0),
        }
    }

    /// Adjusts the field width for a string segment of the given width.
    pub fn resized(self, width: VarWidth) -> Self {
        match width {
            VarWidth::Numeric => self,
            VarWidth::String(w) => Self::new(self.type_, w.min(255) as u8, self.d),
        }
    }
}

impl Debug for Format {
    fn fmt(&self, f: &mut Formatter) -> FmtResult {
        write!(f, "{}{}.{}", self.type_, self.w, self.d)
    }
}

impl Display for Format {
    fn fmt(&self, f: &mut Formatter) -> FmtResult {
        write!(f, "{}{}.{}", self.type_, self.w, self.d)
    }
}

/// [Format] as represented in a system file: the type code in bits 16-23, the
/// field width in bits 8-15, and the decimal count in bits 0-7.
#[derive(Copy, Clone, PartialEq, Eq, Hash, BinRead, BinWrite, Serialize)]
pub struct RawFormat(pub u32);

impl From<Format> for RawFormat {
    fn from(format: Format) -> Self {
        let type_ = u16::from(format.type_) as u32;
        RawFormat((type_ << 16) | ((format.w as u32) << 8) | format.d as u32)
    }
}

impl TryFrom<RawFormat> for Format {
    type Error = UnknownType;

    fn try_from(raw: RawFormat) -> Result<Self, Self::Error> {
        let type_ = Type::try_from((raw.0 >> 16) as u16)?;
        Ok(Format {
            type_,
            w: (raw.0 >> 8) as u8,
            d: raw.0 as u8,
        })
    }
}

impl Debug for RawFormat {
    fn fmt(&self, f: &mut Formatter) -> FmtResult {
        match Format::try_from(*self) {
            Ok(format) => write!(f, "{:06x} ({format})", self.0),
            Err(_) => write!(f, "{:06x}", self.0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Format, RawFormat, Type};

    #[test]
    fn type_codes_round_trip() {
        for code in 1..=41u16 {
            if let Ok(type_) = Type::try_from(code) {
                assert_eq!(u16::from(type_), code);
            }
        }
        assert!(Type::try_from(13).is_err());
        assert!(Type::try_from(42).is_err());
    }

    #[test]
    fn raw_format_packing() {
        let format = Format::new(Type::F, 8, 2);
        let raw = RawFormat::from(format);
        assert_eq!(raw.0, 0x00050802);
        assert_eq!(Format::try_from(raw).unwrap(), format);

        let a10 = Format::new(Type::A, 10, 0);
        assert_eq!(RawFormat::from(a10).0, 0x00010a00);
    }

    #[test]
    fn date_kinds() {
        assert!(Type::Date.is_date());
        assert!(Type::ADate.is_date());
        assert!(Type::DateTime.is_date());
        assert!(!Type::Time.is_date());
        assert!(!Type::F.is_date());
        assert!(!Type::A.is_date());
    }
}
