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

//! Character encodings in system files.
//!
//! A system file can identify its encoding two ways: as a code page number in
//! the machine integer info record, or by name in the character encoding
//! record.  Either one resolves to an [encoding_rs] encoding here.  Only
//! byte-unit, ASCII-compatible encodings are supported; in particular EBCDIC
//! files are rejected outright.

use encoding_rs::{
    Encoding, BIG5, EUC_JP, EUC_KR, GB18030, GBK, IBM866, ISO_8859_2, ISO_8859_3, ISO_8859_4,
    ISO_8859_5, ISO_8859_6, ISO_8859_7, ISO_8859_8, ISO_8859_13, ISO_8859_15, KOI8_R, KOI8_U,
    MACINTOSH, SHIFT_JIS, UTF_8, WINDOWS_874, WINDOWS_1250, WINDOWS_1251, WINDOWS_1252,
    WINDOWS_1253, WINDOWS_1254, WINDOWS_1255, WINDOWS_1256, WINDOWS_1257, WINDOWS_1258,
};
use thiserror::Error as ThisError;

/// An error resolving a system file's character encoding.
#[derive(Clone, ThisError, Debug, PartialEq, Eq)]
pub enum Error {
    /// The file does not say.
    #[error("This system file does not indicate its own character encoding.")]
    NoEncoding,

    /// Unknown code page number.
    #[error("This system file encodes text strings with unknown code page {0}.")]
    UnknownCodepage(i32),

    /// Unknown encoding name.
    #[error("This system file encodes text strings with unknown encoding {0:?}.")]
    UnknownEncoding(String),

    /// EBCDIC.
    #[error("This system file is encoded in EBCDIC, which is not supported.")]
    Ebcdic,
}

/// Windows code page numbers and the encodings they name.
///
/// The first entry for an encoding is the code page number written for it.
static CODEPAGES: &[(i32, &'static Encoding)] = &[
    (65001, UTF_8),
    (874, WINDOWS_874),
    (932, SHIFT_JIS),
    (936, GBK),
    (949, EUC_KR),
    (950, BIG5),
    (866, IBM866),
    (1250, WINDOWS_1250),
    (1251, WINDOWS_1251),
    (1252, WINDOWS_1252),
    (1253, WINDOWS_1253),
    (1254, WINDOWS_1254),
    (1255, WINDOWS_1255),
    (1256, WINDOWS_1256),
    (1257, WINDOWS_1257),
    (1258, WINDOWS_1258),
    (10000, MACINTOSH),
    (20866, KOI8_R),
    (21866, KOI8_U),
    (20932, EUC_JP),
    (51932, EUC_JP),
    (54936, GB18030),
    (28591, WINDOWS_1252),
    (28592, ISO_8859_2),
    (28593, ISO_8859_3),
    (28594, ISO_8859_4),
    (28595, ISO_8859_5),
    (28596, ISO_8859_6),
    (28597, ISO_8859_7),
    (28598, ISO_8859_8),
    (28603, ISO_8859_13),
    (28605, ISO_8859_15),
];

/// The encoding assumed when the file does not identify one.
pub fn default_encoding() -> &'static Encoding {
    UTF_8
}

/// Returns the encoding for the given code page number.
pub fn encoding_from_codepage(codepage: i32) -> Result<&'static Encoding, Error> {
    match codepage {
        1 => Err(Error::Ebcdic),
        2 | 3 => {
            // These ostensibly mean "7-bit ASCII" and "8-bit ASCII"[sic]
            // respectively.  However, many files have character code 2 but
            // data which are clearly not ASCII.  Therefore, ignore these
            // values.
            Err(Error::NoEncoding)
        }
        4 => Ok(SHIFT_JIS),
        _ => CODEPAGES
            .iter()
            .find(|(number, _)| *number == codepage)
            .map(|(_, encoding)| *encoding)
            .ok_or(Error::UnknownCodepage(codepage)),
    }
}

/// Returns the encoding for the given encoding name.
///
/// If `name` is not a recognized encoding label, falls back to interpreting
/// any digits embedded in the name as a code page number, so that e.g.
/// `CP1252` or `MSWIN-1252` still resolve.
pub fn encoding_from_name(name: &str) -> Result<&'static Encoding, Error> {
    if let Some(encoding) = Encoding::for_label(name.trim().as_bytes()) {
        return Ok(encoding);
    }
    let digits: String = name.chars().filter(char::is_ascii_digit).collect();
    if let Ok(codepage) = digits.parse::<i32>() {
        if let Ok(encoding) = encoding_from_codepage(codepage) {
            return Ok(encoding);
        }
    }
    Err(Error::UnknownEncoding(name.into()))
}

/// Returns the code page number to record for `encoding`.
pub fn codepage_from_encoding(encoding: &'static Encoding) -> i32 {
    CODEPAGES
        .iter()
        .find(|(_, e)| *e == encoding)
        .map(|(number, _)| *number)
        .unwrap_or(65001)
}

/// Resolves the encoding indicated by a system file, given the name from its
/// character encoding record (if any) and the code page number from its
/// machine integer info record (if any).  Newer writers emit both; the name
/// takes precedence.
pub fn get_encoding(
    name: Option<&str>,
    codepage: Option<i32>,
) -> Result<&'static Encoding, Error> {
    if let Some(name) = name {
        encoding_from_name(name)
    } else if let Some(codepage) = codepage {
        encoding_from_codepage(codepage)
    } else {
        Err(Error::NoEncoding)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codepage_lookup() {
        assert_eq!(encoding_from_codepage(65001), Ok(UTF_8));
        assert_eq!(encoding_from_codepage(1252), Ok(WINDOWS_1252));
        assert_eq!(encoding_from_codepage(1), Err(Error::Ebcdic));
        assert_eq!(encoding_from_codepage(2), Err(Error::NoEncoding));
        assert_eq!(
            encoding_from_codepage(12345),
            Err(Error::UnknownCodepage(12345))
        );
    }

    #[test]
    fn name_lookup_with_numeric_fallback() {
        assert_eq!(encoding_from_name("UTF-8"), Ok(UTF_8));
        assert_eq!(encoding_from_name("windows-1251"), Ok(WINDOWS_1251));
        // Not an encoding_rs label, but carries a code page number.
        assert_eq!(encoding_from_name("MSWIN-1252"), Ok(WINDOWS_1252));
        assert!(matches!(
            encoding_from_name("klingon"),
            Err(Error::UnknownEncoding(_))
        ));
    }

    #[test]
    fn round_trip_codepage() {
        for encoding in [UTF_8, WINDOWS_1252, SHIFT_JIS, KOI8_R] {
            let codepage = codepage_from_encoding(encoding);
            assert_eq!(encoding_from_codepage(codepage), Ok(encoding));
        }
    }
}
