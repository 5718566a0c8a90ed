//! Serde adapters for durations in configuration files
//!
//! Intervals and long timeouts are written as whole seconds, probe timeouts
//! and short delays as milliseconds. Use them with `#[serde(with = "...")]`.

use serde::{Deserialize, Deserializer, Serializer};
use std::time::Duration;

fn write_units<S: Serializer>(units: u128, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u64(u64::try_from(units).unwrap_or(u64::MAX))
}

fn read_units<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
    u64::deserialize(deserializer)
}

/// `Duration` as whole seconds
pub mod duration_secs {
    use super::*;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        write_units(u128::from(duration.as_secs()), serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        read_units(deserializer).map(Duration::from_secs)
    }
}

/// `Duration` as milliseconds
pub mod duration_millis {
    use super::*;

    pub fn serialize<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        write_units(duration.as_millis(), serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        read_units(deserializer).map(Duration::from_millis)
    }
}
