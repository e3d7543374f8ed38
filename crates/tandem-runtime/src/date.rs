//! Date conversion between engine components and host date/times
//!
//! The engine's Date accessors report local-time components, so dates cross
//! the boundary as seven separate fields instead of an epoch value. This
//! avoids floating-point drift and keeps millisecond precision exact.

use chrono::{Datelike, NaiveDate, NaiveDateTime, Timelike};

use crate::error::{HostError, HostResult};

/// Components as reported by `getFullYear` .. `getMilliseconds`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EngineDateFields {
    pub year: i32,
    /// 0-based month, as the engine reports it
    pub month0: u32,
    pub day: u32,
    pub hour: u32,
    pub minute: u32,
    pub second: u32,
    pub millisecond: u32,
}

impl EngineDateFields {
    /// Build from the raw numbers returned by the engine getters, in order.
    ///
    /// An invalid Date reports NaN for every component.
    pub fn from_engine(raw: [f64; 7]) -> HostResult<Self> {
        if raw.iter().any(|v| !v.is_finite()) {
            return Err(HostError::marshal("date", "invalid Date"));
        }
        let [year, month0, day, hour, minute, second, millisecond] = raw;
        if year < i32::MIN as f64 || year > i32::MAX as f64 {
            return Err(HostError::marshal("date", format!("year {} out of range", year)));
        }
        Ok(Self {
            year: year as i32,
            month0: month0 as u32,
            day: day as u32,
            hour: hour as u32,
            minute: minute as u32,
            second: second as u32,
            millisecond: millisecond as u32,
        })
    }

    /// Convert to a host date/time. Milliseconds become microseconds.
    pub fn to_naive(&self) -> HostResult<NaiveDateTime> {
        NaiveDate::from_ymd_opt(self.year, self.month0 + 1, self.day)
            .and_then(|d| {
                d.and_hms_micro_opt(self.hour, self.minute, self.second, self.millisecond * 1000)
            })
            .ok_or_else(|| HostError::marshal("date", format!("{:?} is not a valid date", self)))
    }

    /// Decompose a host date/time. Sub-millisecond precision is truncated.
    pub fn from_naive(dt: &NaiveDateTime) -> Self {
        // chrono encodes a leap second as nanosecond >= 1_000_000_000
        let millisecond = (dt.nanosecond() / 1_000_000).min(999);
        Self {
            year: dt.year(),
            month0: dt.month0(),
            day: dt.day(),
            hour: dt.hour(),
            minute: dt.minute(),
            second: dt.second(),
            millisecond,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_month_is_shifted() {
        let fields = EngineDateFields::from_engine([2024.0, 0.0, 31.0, 8.0, 5.0, 3.0, 250.0]).unwrap();
        let dt = fields.to_naive().unwrap();
        assert_eq!(dt.month(), 1);
        assert_eq!(dt.day(), 31);
        assert_eq!(dt.nanosecond(), 250_000_000);
        assert_eq!(EngineDateFields::from_naive(&dt), fields);
    }

    #[test]
    fn test_millisecond_precision_survives() {
        let dt = NaiveDate::from_ymd_opt(2024, 2, 29)
            .unwrap()
            .and_hms_milli_opt(23, 59, 59, 999)
            .unwrap();
        let fields = EngineDateFields::from_naive(&dt);
        assert_eq!(fields.month0, 1);
        assert_eq!(fields.millisecond, 999);
        assert_eq!(fields.to_naive().unwrap(), dt);
    }

    #[test]
    fn test_sub_millisecond_truncated() {
        let dt = NaiveDate::from_ymd_opt(1999, 12, 31)
            .unwrap()
            .and_hms_micro_opt(1, 2, 3, 456_789)
            .unwrap();
        assert_eq!(EngineDateFields::from_naive(&dt).millisecond, 456);
    }

    #[test]
    fn test_invalid_date_rejected() {
        let nan = f64::NAN;
        assert!(EngineDateFields::from_engine([nan; 7]).is_err());
        let fields = EngineDateFields::from_engine([2023.0, 1.0, 30.0, 0.0, 0.0, 0.0, 0.0]).unwrap();
        assert!(fields.to_naive().is_err());
    }
}
