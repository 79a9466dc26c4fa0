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

//! The SPSS calendar.
//!
//! Dates and times in a system file are stored as a count of seconds from
//! midnight, 14 Oct 1582, the start of the Gregorian calendar.

use chrono::{NaiveDate, NaiveDateTime, NaiveTime, TimeDelta};

/// Midnight, 14 Oct 1582.
pub const EPOCH: NaiveDate = match NaiveDate::from_ymd_opt(1582, 10, 14) {
    Some(date) => date,
    None => unreachable!(),
};

const EPOCH_DATETIME: NaiveDateTime = EPOCH.and_time(NaiveTime::MIN);

/// Converts `date_time` into a count of seconds from the epoch.
pub fn date_time_to_seconds(date_time: NaiveDateTime) -> f64 {
    (date_time - EPOCH_DATETIME).as_seconds_f64()
}

/// Converts a count of seconds from the epoch back into a date and time, if it
/// is in the representable range.  Fractional seconds are rounded to the
/// nearest millisecond.
pub fn seconds_to_date_time(seconds: f64) -> Option<NaiveDateTime> {
    if !seconds.is_finite() {
        return None;
    }
    let milliseconds = (seconds * 1000.0).round();
    if milliseconds < i64::MIN as f64 || milliseconds > i64::MAX as f64 {
        return None;
    }
    EPOCH_DATETIME.checked_add_signed(TimeDelta::milliseconds(milliseconds as i64))
}

#[cfg(test)]
mod tests {
    use super::{date_time_to_seconds, seconds_to_date_time, EPOCH};
    use chrono::{NaiveDate, NaiveTime};

    #[test]
    fn epoch_is_zero() {
        assert_eq!(date_time_to_seconds(EPOCH.and_time(NaiveTime::MIN)), 0.0);
        assert_eq!(
            seconds_to_date_time(0.0),
            Some(EPOCH.and_time(NaiveTime::MIN))
        );
    }

    #[test]
    fn round_trip() {
        let date_time = NaiveDate::from_ymd_opt(2001, 2, 3)
            .unwrap()
            .and_hms_opt(4, 5, 6)
            .unwrap();
        let seconds = date_time_to_seconds(date_time);
        assert_eq!(seconds_to_date_time(seconds), Some(date_time));
    }

    #[test]
    fn out_of_range() {
        assert_eq!(seconds_to_date_time(f64::INFINITY), None);
        assert_eq!(seconds_to_date_time(f64::NAN), None);
        assert_eq!(seconds_to_date_time(1e300), None);
    }
}
