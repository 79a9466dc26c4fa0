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

//! Converting big- and little-endian `[u8]` arrays to and from primitive types.
//!
//! The byte order of a system file is not known until its header has been
//! (partially) parsed, so it has to be a runtime value, [binrw::Endian] here.
//! These traits cover the loose field reads that don't go through a
//! [binrw]-derived record struct.

use binrw::Endian;

/// Converts a primitive type into a big- or little-endian `[u8]` array.
pub trait ToBytes<T, const N: usize> {
    /// Returns `value` as bytes in this byte order.
    fn to_bytes(self, value: T) -> [u8; N];
}

impl ToBytes<f64, 8> for Endian {
    fn to_bytes(self, value: f64) -> [u8; 8] {
        match self {
            Endian::Big => f64::to_be_bytes(value),
            Endian::Little => f64::to_le_bytes(value),
        }
    }
}

impl ToBytes<u64, 8> for Endian {
    fn to_bytes(self, value: u64) -> [u8; 8] {
        match self {
            Endian::Big => u64::to_be_bytes(value),
            Endian::Little => u64::to_le_bytes(value),
        }
    }
}

impl ToBytes<u32, 4> for Endian {
    fn to_bytes(self, value: u32) -> [u8; 4] {
        match self {
            Endian::Big => u32::to_be_bytes(value),
            Endian::Little => u32::to_le_bytes(value),
        }
    }
}

/// Parses a `[u8]` array as a big- or little-endian primitive type.
pub trait FromBytes<T, const N: usize> {
    /// Given `bytes`, returns `T`.
    fn parse(self, bytes: [u8; N]) -> T;
}

impl FromBytes<u8, 1> for Endian {
    fn parse(self, bytes: [u8; 1]) -> u8 {
        bytes[0]
    }
}

impl FromBytes<u32, 4> for Endian {
    fn parse(self, bytes: [u8; 4]) -> u32 {
        match self {
            Endian::Big => u32::from_be_bytes(bytes),
            Endian::Little => u32::from_le_bytes(bytes),
        }
    }
}

impl FromBytes<i32, 4> for Endian {
    fn parse(self, bytes: [u8; 4]) -> i32 {
        match self {
            Endian::Big => i32::from_be_bytes(bytes),
            Endian::Little => i32::from_le_bytes(bytes),
        }
    }
}

impl FromBytes<u64, 8> for Endian {
    fn parse(self, bytes: [u8; 8]) -> u64 {
        match self {
            Endian::Big => u64::from_be_bytes(bytes),
            Endian::Little => u64::from_le_bytes(bytes),
        }
    }
}

impl FromBytes<i64, 8> for Endian {
    fn parse(self, bytes: [u8; 8]) -> i64 {
        match self {
            Endian::Big => i64::from_be_bytes(bytes),
            Endian::Little => i64::from_le_bytes(bytes),
        }
    }
}

impl FromBytes<f64, 8> for Endian {
    fn parse(self, bytes: [u8; 8]) -> f64 {
        match self {
            Endian::Big => f64::from_be_bytes(bytes),
            Endian::Little => f64::from_le_bytes(bytes),
        }
    }
}

/// The system-missing value is stored as `-f64::MAX` (bit pattern
/// `0xFFEFFFFFFFFFFFFF`), which parses to `None` here.
impl FromBytes<Option<f64>, 8> for Endian {
    fn parse(self, bytes: [u8; 8]) -> Option<f64> {
        let number: f64 = self.parse(bytes);
        (number != -f64::MAX).then_some(number)
    }
}

#[cfg(test)]
mod tests {
    use super::{FromBytes, ToBytes};
    use binrw::Endian;

    #[test]
    fn sysmis_bit_pattern() {
        let le: Option<f64> = Endian::Little.parse([0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xef, 0xff]);
        assert_eq!(le, None);
        let be: Option<f64> = Endian::Big.parse([0xff, 0xef, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff]);
        assert_eq!(be, None);
        let five: Option<f64> = Endian::Little.parse(Endian::Little.to_bytes(5.0));
        assert_eq!(five, Some(5.0));
    }

    #[test]
    fn round_trip_both_orders() {
        for endian in [Endian::Little, Endian::Big] {
            let parsed: f64 = endian.parse(endian.to_bytes(5.3));
            assert_eq!(parsed, 5.3);
            let parsed: u32 = endian.parse(endian.to_bytes(0xdeadbeefu32));
            assert_eq!(parsed, 0xdeadbeef);
        }
    }
}
