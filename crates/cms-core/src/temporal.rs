//! # Dispatch Timestamps
//!
//! `DispatchTimestamp` is the wall-clock moment a consignment left its
//! sender. Sub-millisecond precision is dropped at construction, never at
//! formatting time, so a value read back from the ledger compares equal to
//! the one that was published.
//!
//! Three textual forms exist, all zone-less:
//!
//! | Form | Used for | `10:00:00.000` | `10:00:05.500` |
//! |------|----------|----------------|----------------|
//! | [`canonical`](DispatchTimestamp::canonical) | storage, JSON | `10:00:00.000` | `10:00:05.500` |
//! | [`id_form`](DispatchTimestamp::id_form) | id derivation | `10:00` | `10:00:05.500` |
//! | [`iso_local`](DispatchTimestamp::iso_local) | ledger metadata | `10:00:00` | `10:00:05.5` |
//!
//! `id_form` drops zero seconds and a zero fraction; `iso_local` always
//! keeps seconds and strips trailing fraction zeros. Ids and metadata
//! published by earlier deployments depend on both exactly.

use std::fmt;

use chrono::{DateTime, NaiveDateTime, Timelike, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::ValidationError;

/// Storage and JSON layout, always with three fraction digits.
pub const DISPATCH_TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.3f";

/// A zone-less timestamp truncated to millisecond precision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct DispatchTimestamp(NaiveDateTime);

impl DispatchTimestamp {
    /// Build from a naive local date-time, truncating to milliseconds.
    pub fn from_naive(dt: NaiveDateTime) -> Self {
        Self(truncate_to_millis(dt))
    }

    /// Build from a UTC instant, dropping the zone and truncating.
    pub fn from_utc(dt: DateTime<Utc>) -> Self {
        Self::from_naive(dt.naive_utc())
    }

    /// Parse an ISO-8601 local date-time.
    ///
    /// Accepts any fractional precision (including none) and truncates to
    /// milliseconds. Zone suffixes are rejected: dispatch times are local.
    pub fn parse(s: &str) -> Result<Self, ValidationError> {
        NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f")
            .or_else(|_| NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M"))
            .map(Self::from_naive)
            .map_err(|e| ValidationError::InvalidTimestamp {
                value: s.to_string(),
                reason: e.to_string(),
            })
    }

    /// The storage and JSON form.
    pub fn canonical(&self) -> String {
        self.0.format(DISPATCH_TIMESTAMP_FORMAT).to_string()
    }

    /// The form hashed into ids: `HH:MM`, then `:SS` only when seconds or
    /// millis are non-zero, then `.mmm` only when millis are non-zero.
    pub fn id_form(&self) -> String {
        let mut out = self.0.format("%Y-%m-%dT%H:%M").to_string();
        let (seconds, millis) = (self.0.second(), self.0.nanosecond() / 1_000_000);
        if seconds > 0 || millis > 0 {
            out.push_str(&format!(":{seconds:02}"));
            if millis > 0 {
                out.push_str(&format!(".{millis:03}"));
            }
        }
        out
    }

    /// The form written into ledger metadata: seconds always present,
    /// fraction only when non-zero and without trailing zeros.
    pub fn iso_local(&self) -> String {
        let mut out = self.0.format("%Y-%m-%dT%H:%M:%S").to_string();
        let millis = self.0.nanosecond() / 1_000_000;
        if millis > 0 {
            let fraction = format!("{millis:03}");
            out.push('.');
            out.push_str(fraction.trim_end_matches('0'));
        }
        out
    }

    /// Access the inner value.
    pub fn as_naive(&self) -> &NaiveDateTime {
        &self.0
    }
}

fn truncate_to_millis(dt: NaiveDateTime) -> NaiveDateTime {
    let millis_only = (dt.nanosecond() / 1_000_000) * 1_000_000;
    dt.with_nanosecond(millis_only).unwrap_or(dt)
}

impl fmt::Display for DispatchTimestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.canonical())
    }
}

impl Serialize for DispatchTimestamp {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.canonical())
    }
}

impl<'de> Deserialize<'de> for DispatchTimestamp {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::parse(&raw).map_err(serde::de::Error::custom)
    }
}
