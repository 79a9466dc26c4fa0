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

//! Individual pieces of data.
//!
//! [Datum] is one cell as it exists on disk: a number or a string of raw
//! bytes whose character encoding is determined elsewhere.  [Value] is one
//! cell as presented to callers, with strings decoded and date formats
//! converted to calendar form.

use std::{
    borrow::Cow,
    fmt::{Debug, Display, Formatter},
    hash::Hash,
    str::from_utf8,
};

use chrono::NaiveDateTime;
use encoding_rs::{mem::decode_latin1, Encoding};
use ordered_float::OrderedFloat;
use serde::Serialize;

/// An owned string in an unspecified character encoding.
///
/// A [RawString] is usually associated with a variable and uses the
/// variable's character encoding.  We assume that the encoding is one
/// supported by [encoding_rs] with byte units, all of which have basic ASCII
/// compatibility.
#[derive(Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct RawString(pub Vec<u8>);

impl RawString {
    /// Creates a [RawString] of `n` ASCII spaces.
    pub fn spaces(n: usize) -> Self {
        Self(vec![b' '; n])
    }

    /// Extends or shortens this string to exactly `len` bytes, padding with
    /// spaces if it needs to grow.
    pub fn resize(&mut self, len: usize) {
        self.0.resize(len, b' ');
    }

    /// Removes trailing ASCII spaces.
    pub fn trim_end(&mut self) {
        while self.0.last() == Some(&b' ') {
            self.0.pop();
        }
    }

    /// Returns the string's contents as a byte slice.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Returns the string's length in bytes.
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns true if the string is empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Decodes the contents as `encoding`, substituting the replacement
    /// character for malformed sequences.
    pub fn decode(&self, encoding: &'static Encoding) -> Cow<'_, str> {
        encoding.decode_without_bom_handling(&self.0).0
    }
}

impl From<Vec<u8>> for RawString {
    fn from(source: Vec<u8>) -> Self {
        Self(source)
    }
}

impl From<&[u8]> for RawString {
    fn from(source: &[u8]) -> Self {
        Self(source.into())
    }
}

impl From<&str> for RawString {
    fn from(source: &str) -> Self {
        Self(source.as_bytes().into())
    }
}

impl From<Cow<'_, [u8]>> for RawString {
    fn from(source: Cow<'_, [u8]>) -> Self {
        Self(source.into_owned())
    }
}

impl Debug for RawString {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        let s = from_utf8(&self.0).map_or_else(|_| decode_latin1(&self.0), Cow::from);
        write!(f, "{s:?}")
    }
}

/// The undecoded value of one cell.
#[derive(Clone, Serialize)]
#[serde(untagged)]
pub enum Datum {
    /// A numeric value.
    Number(
        /// A number, or `None` for the system-missing value.
        Option<f64>,
    ),
    /// A string value, in the data encoding.
    String(RawString),
}

impl Datum {
    /// Returns the system-missing value.
    pub fn sysmis() -> Self {
        Self::Number(None)
    }

    /// Returns the inner number, if this is a number.
    pub fn as_number(&self) -> Option<Option<f64>> {
        match self {
            Datum::Number(number) => Some(*number),
            Datum::String(_) => None,
        }
    }

    /// Returns the inner string, if this is a string.
    pub fn as_string(&self) -> Option<&RawString> {
        match self {
            Datum::Number(_) => None,
            Datum::String(s) => Some(s),
        }
    }

    /// Removes trailing spaces from a string datum.  Numbers are unchanged.
    pub fn trim_end(&mut self) {
        if let Datum::String(s) = self {
            s.trim_end();
        }
    }

    /// Compares for equality, ignoring trailing spaces in string data.
    pub fn eq_ignore_trailing_spaces(&self, other: &Datum) -> bool {
        match (self, other) {
            (Datum::String(a), Datum::String(b)) => {
                let mut a = a.0.iter();
                let mut b = b.0.iter();
                loop {
                    match (a.next(), b.next()) {
                        (Some(x), Some(y)) if x == y => (),
                        (Some(_), Some(_)) => return false,
                        (None, None) => return true,
                        (Some(b' '), None) => return a.all(|c| *c == b' '),
                        (None, Some(b' ')) => return b.all(|c| *c == b' '),
                        (Some(_), None) | (None, Some(_)) => return false,
                    }
                }
            }
            _ => self == other,
        }
    }
}

impl Debug for Datum {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        match self {
            Datum::Number(Some(number)) => write!(f, "{number:?}"),
            Datum::Number(None) => write!(f, "SYSMIS"),
            Datum::String(s) => write!(f, "{s:?}"),
        }
    }
}

impl PartialEq for Datum {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Number(a), Self::Number(b)) => {
                a.map(OrderedFloat) == b.map(OrderedFloat)
            }
            (Self::String(a), Self::String(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for Datum {}

impl Hash for Datum {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        match self {
            Datum::Number(number) => number.map(OrderedFloat).hash(state),
            Datum::String(string) => string.hash(state),
        }
    }
}

/// The decoded value of one cell, as presented to callers.
///
/// Which variant a column produces is fixed by its variable's format: string
/// formats always yield [Value::String], date-like formats yield
/// [Value::DateTime], everything else yields [Value::Number].
#[derive(Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Value {
    /// A number, or `None` for system-missing.
    Number(Option<f64>),

    /// A string, decoded and with trailing spaces removed.
    String(String),

    /// A date and time, or `None` for system-missing.
    DateTime(Option<NaiveDateTime>),
}

impl Value {
    /// Returns the value as a number, if it is one.
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Number(number) => *number,
            _ => None,
        }
    }

    /// Returns the value as an integer if it is a number with no fractional
    /// part.
    pub fn as_integer(&self) -> Option<i64> {
        match self.as_number() {
            Some(number) if number == number.trunc() => Some(number as i64),
            _ => None,
        }
    }

    /// Returns the value as a string, if it is one.
    pub fn as_string(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    /// Returns the value as a date and time, if it is one.
    pub fn as_date_time(&self) -> Option<NaiveDateTime> {
        match self {
            Value::DateTime(date_time) => *date_time,
            _ => None,
        }
    }

    /// Returns true for the system-missing value (in either numeric or date
    /// form).
    pub fn is_sysmis(&self) -> bool {
        matches!(self, Value::Number(None) | Value::DateTime(None))
    }
}

impl Debug for Value {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        match self {
            Value::Number(Some(number)) => write!(f, "{number:?}"),
            Value::Number(None) | Value::DateTime(None) => write!(f, "SYSMIS"),
            Value::String(s) => write!(f, "{s:?}"),
            Value::DateTime(Some(date_time)) => write!(f, "{date_time}"),
        }
    }
}

impl Display for Value {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        match self {
            Value::Number(Some(number)) => write!(f, "{number}"),
            Value::Number(None) | Value::DateTime(None) => write!(f, "."),
            Value::String(s) => write!(f, "{s}"),
            Value::DateTime(Some(date_time)) => write!(f, "{date_time}"),
        }
    }
}

impl From<f64> for Value {
    fn from(number: f64) -> Self {
        Self::Number(Some(number))
    }
}

impl From<Option<f64>> for Value {
    fn from(number: Option<f64>) -> Self {
        Self::Number(number)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Self::String(s.into())
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl From<NaiveDateTime> for Value {
    fn from(date_time: NaiveDateTime) -> Self {
        Self::DateTime(Some(date_time))
    }
}

#[cfg(test)]
mod tests {
    use super::{Datum, RawString, Value};

    #[test]
    fn trailing_space_equality() {
        let a = Datum::String(RawString::from("AB"));
        let b = Datum::String(RawString::from("AB      "));
        assert!(a.eq_ignore_trailing_spaces(&b));
        assert!(b.eq_ignore_trailing_spaces(&a));
        assert_ne!(a, b);

        let c = Datum::String(RawString::from("AC"));
        assert!(!a.eq_ignore_trailing_spaces(&c));
    }

    #[test]
    fn integer_access() {
        assert_eq!(Value::from(5.0).as_integer(), Some(5));
        assert_eq!(Value::from(5.3).as_integer(), None);
        assert_eq!(Value::Number(None).as_integer(), None);
        assert!(Value::Number(None).is_sysmis());
    }
}
