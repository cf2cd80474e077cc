//! Layer 0: Time primitives
//!
//! Directory file-time (100 ns ticks since 1601-01-01 UTC) conversion
//! with never-sentinels, and ASN.1 GeneralizedTime parsing for
//! `whenCreated`.

use serde::{Deserialize, Serialize};
use time::{Date, Month, OffsetDateTime, PrimitiveDateTime, Time};

use super::error::{CoreError, ParseError};

/// Seconds between 1601-01-01 and 1970-01-01.
const FILETIME_UNIX_EPOCH_SECS: i64 = 11_644_473_600;
/// Ticks are 100 ns.
const TICKS_PER_SEC: i64 = 10_000_000;
/// `accountExpires` uses this (and 0) to mean "never".
const FILETIME_NEVER: i64 = 0x7FFF_FFFF_FFFF_FFFF;

/// A directory timestamp: either a concrete instant or a never-sentinel.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DirTimestamp(Option<OffsetDateTime>);

impl DirTimestamp {
    pub const NEVER: DirTimestamp = DirTimestamp(None);

    pub fn at(instant: OffsetDateTime) -> Self {
        Self(Some(instant))
    }

    /// Convert a raw file-time value. `0` and `0x7FFFFFFFFFFFFFFF` are
    /// sentinels meaning "not set" / "never".
    pub fn from_filetime(ticks: i64) -> Result<Self, CoreError> {
        if ticks == 0 || ticks == FILETIME_NEVER {
            return Ok(Self::NEVER);
        }
        if ticks < 0 {
            return Err(ParseError::Timestamp {
                attr: "filetime",
                reason: format!("negative tick value {ticks}"),
            }
            .into());
        }
        let secs = ticks / TICKS_PER_SEC - FILETIME_UNIX_EPOCH_SECS;
        let sub_nanos = (ticks % TICKS_PER_SEC) * 100;
        let nanos = i128::from(secs) * 1_000_000_000 + i128::from(sub_nanos);
        let instant =
            OffsetDateTime::from_unix_timestamp_nanos(nanos).map_err(|e| ParseError::Timestamp {
                attr: "filetime",
                reason: e.to_string(),
            })?;
        Ok(Self(Some(instant)))
    }

    /// The raw file-time value, for snapshot encoding. `NEVER` encodes as 0.
    pub fn to_filetime(self) -> i64 {
        match self.0 {
            None => 0,
            Some(instant) => {
                let nanos = instant.unix_timestamp_nanos();
                let ticks = nanos / 100 + i128::from(FILETIME_UNIX_EPOCH_SECS) * i128::from(TICKS_PER_SEC);
                i64::try_from(ticks).unwrap_or(0)
            }
        }
    }

    pub fn instant(self) -> Option<OffsetDateTime> {
        self.0
    }

    pub fn is_never(self) -> bool {
        self.0.is_none()
    }
}

/// Parse a file-time value as delivered in text form.
pub fn parse_filetime_text(attr: &'static str, raw: &str) -> Result<DirTimestamp, CoreError> {
    let ticks: i64 = raw.trim().parse().map_err(|_| ParseError::Timestamp {
        attr,
        reason: format!("`{raw}` is not an integer"),
    })?;
    DirTimestamp::from_filetime(ticks)
}

/// Parse ASN.1 GeneralizedTime as the directory renders it:
/// `YYYYMMDDHHMMSS.0Z`.
pub fn parse_generalized_time(attr: &'static str, raw: &str) -> Result<DirTimestamp, CoreError> {
    let s = raw.trim();
    if s.len() < 14 || !s[..14].bytes().all(|b| b.is_ascii_digit()) {
        return Err(ParseError::Timestamp {
            attr,
            reason: format!("`{raw}` is not generalized time"),
        }
        .into());
    }
    let num = |range: std::ops::Range<usize>| -> i32 {
        s[range].parse().unwrap_or(0)
    };
    let month = Month::try_from(num(4..6) as u8).map_err(|e| ParseError::Timestamp {
        attr,
        reason: e.to_string(),
    })?;
    let date = Date::from_calendar_date(num(0..4), month, num(6..8) as u8).map_err(|e| {
        ParseError::Timestamp {
            attr,
            reason: e.to_string(),
        }
    })?;
    let clock = Time::from_hms(num(8..10) as u8, num(10..12) as u8, num(12..14) as u8).map_err(
        |e| ParseError::Timestamp {
            attr,
            reason: e.to_string(),
        },
    )?;
    Ok(DirTimestamp::at(
        PrimitiveDateTime::new(date, clock).assume_utc(),
    ))
}
