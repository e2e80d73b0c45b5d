//! Serde helpers for `Duration` <-> f64 millisecond serialization.
//!
//! The result-fetch JSON carries durations as fractional milliseconds
//! (`duration_milliseconds: 12.5`). Internally every timing is a
//! `Duration` so accounting (`duration - sum(children)`) stays exact
//! integer nanosecond arithmetic.

use std::time::Duration;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Convert a `Duration` to f64 milliseconds.
pub fn to_millis(dur: Duration) -> f64 {
    dur.as_nanos() as f64 / 1_000_000.0
}

/// Convert f64 milliseconds to a `Duration`, rounding to the nearest nanosecond.
///
/// Negative and non-finite inputs clamp to zero.
pub fn from_millis(ms: f64) -> Duration {
    if !ms.is_finite() || ms <= 0.0 {
        return Duration::ZERO;
    }
    Duration::from_nanos((ms * 1_000_000.0).round() as u64)
}

/// Serialize a `Duration` as f64 milliseconds.
pub fn serialize<S: Serializer>(dur: &Duration, s: S) -> Result<S::Ok, S::Error> {
    to_millis(*dur).serialize(s)
}

/// Deserialize f64 milliseconds into a `Duration`.
pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
    let ms = f64::deserialize(d)?;
    Ok(from_millis(ms))
}

/// Serializes `Option<Duration>` as `Option<f64>` milliseconds.
///
/// Client point events (e.g. "Dom Interactive") have no duration and map
/// to JSON `null`.
pub mod option {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(dur: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match dur {
            Some(d) => s.serialize_some(&super::to_millis(*d)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        let opt = Option::<f64>::deserialize(d)?;
        Ok(opt.map(super::from_millis))
    }
}
