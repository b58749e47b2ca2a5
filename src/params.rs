//! Timing and capacity parameters shared by every connection of an endpoint

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::types::{LspError, Result};

/// Default epoch length.
pub const DEFAULT_EPOCH_INTERVAL: Duration = Duration::from_millis(2000);
/// Default number of idle epochs tolerated before a connection is dropped.
pub const DEFAULT_EPOCH_LIMIT: u32 = 5;
/// Default capacity, in packets, of the inbound and outbound queues.
pub const DEFAULT_QUEUE_CAPACITY: usize = 50;

/// Endpoint parameters.
///
/// Immutable once handed to a [`Server`](crate::udp::Server) or
/// [`Client`](crate::udp::Client); every connection monitor reads the same
/// copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Params {
    /// Time between two epoch ticks
    #[serde(rename = "epoch_interval_ms", with = "millis")]
    pub epoch_interval: Duration,
    /// Consecutive idle epochs before a connection is closed, and the
    /// number of CONNECT attempts a client makes
    pub epoch_limit: u32,
    /// Capacity of the inbound and outbound packet queues
    pub queue_capacity: usize,
}

impl Default for Params {
    fn default() -> Self {
        Self {
            epoch_interval: DEFAULT_EPOCH_INTERVAL,
            epoch_limit: DEFAULT_EPOCH_LIMIT,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

impl Params {
    /// Create parameters with default values
    pub fn new() -> Self {
        Self::default()
    }

    /// Parameters from an epoch length in milliseconds and an epoch limit
    pub fn with_millis(epoch_ms: u64, epoch_limit: u32) -> Self {
        Self::default()
            .epoch_interval(Duration::from_millis(epoch_ms))
            .epoch_limit(epoch_limit)
    }

    /// Set the epoch length
    pub fn epoch_interval(mut self, interval: Duration) -> Self {
        self.epoch_interval = interval;
        self
    }

    /// Set the epoch limit
    pub fn epoch_limit(mut self, limit: u32) -> Self {
        self.epoch_limit = limit;
        self
    }

    /// Set the queue capacity
    pub fn queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    /// Total silence after which a connection is considered lost
    pub fn idle_timeout(&self) -> Duration {
        self.epoch_interval * self.epoch_limit
    }

    /// Load parameters from JSON; missing fields take their defaults
    pub fn from_json(json: &str) -> Result<Self> {
        let params: Params = serde_json::from_str(json)
            .map_err(|e| LspError::InvalidParams(e.to_string()))?;
        params.validate()?;
        Ok(params)
    }

    /// Validate parameters
    pub fn validate(&self) -> Result<()> {
        if self.epoch_interval.is_zero() {
            return Err(LspError::InvalidParams(
                "epoch interval must be greater than 0".into(),
            ));
        }

        if self.epoch_limit == 0 {
            return Err(LspError::InvalidParams(
                "epoch limit must be greater than 0".into(),
            ));
        }

        if self.queue_capacity == 0 {
            return Err(LspError::InvalidParams(
                "queue capacity must be greater than 0".into(),
            ));
        }

        Ok(())
    }
}

mod millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let params = Params::default();
        assert_eq!(params.epoch_interval, Duration::from_millis(2000));
        assert_eq!(params.epoch_limit, 5);
        assert_eq!(params.queue_capacity, 50);
        assert_eq!(params.idle_timeout(), Duration::from_secs(10));
        assert!(params.validate().is_ok());
    }

    #[test]
    fn builder() {
        let params = Params::with_millis(500, 4).queue_capacity(8);
        assert_eq!(params.epoch_interval, Duration::from_millis(500));
        assert_eq!(params.epoch_limit, 4);
        assert_eq!(params.queue_capacity, 8);
    }

    #[test]
    fn validation_rejects_zero_values() {
        assert!(Params::with_millis(0, 4).validate().is_err());
        assert!(Params::with_millis(100, 0).validate().is_err());
        assert!(Params::new().queue_capacity(0).validate().is_err());
    }

    #[test]
    fn json_round_trip_and_defaults() {
        let params = Params::from_json(r#"{"epoch_interval_ms": 250, "epoch_limit": 3}"#).unwrap();
        assert_eq!(params, Params::with_millis(250, 3));

        let json = serde_json::to_string(&params).unwrap();
        assert!(json.contains("\"epoch_interval_ms\":250"));

        assert!(matches!(
            Params::from_json(r#"{"epoch_limit": 0}"#),
            Err(LspError::InvalidParams(_))
        ));
    }
}
