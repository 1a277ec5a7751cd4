//! Engine configuration. Durations travel as milliseconds.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Live subscription settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Interval between keepalive pings while syncing.
    #[serde(with = "duration_ms", rename = "ping_interval_ms")]
    pub ping_interval: Duration,
    /// How long a ping may wait for its pong.
    #[serde(with = "duration_ms", rename = "pong_timeout_ms")]
    pub pong_timeout: Duration,
    /// Unit of the resubscription backoff.
    #[serde(with = "duration_ms", rename = "retry_base_ms")]
    pub retry_base: Duration,
    /// The retry counter stops growing here, capping the backoff at
    /// `retry_base * 2^max_retry_exponent`.
    pub max_retry_exponent: u32,
    /// Unit of the per-stream re-add backoff after a node goes down.
    #[serde(with = "duration_ms", rename = "stream_down_base_ms")]
    pub stream_down_base: Duration,
    /// Ceiling of the per-stream re-add backoff.
    #[serde(with = "duration_ms", rename = "stream_down_max_ms")]
    pub stream_down_max: Duration,
    /// Budget for each phase of a stop.
    #[serde(with = "duration_ms", rename = "stop_timeout_ms")]
    pub stop_timeout: Duration,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            ping_interval: Duration::from_secs(5 * 60),
            pong_timeout: Duration::from_secs(30),
            retry_base: Duration::from_secs(1),
            max_retry_exponent: 7,
            stream_down_base: Duration::from_secs(1),
            stream_down_max: Duration::from_secs(60),
            stop_timeout: Duration::from_secs(5),
        }
    }
}

/// Bulk loading settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BootstrapConfig {
    /// Ceiling of the shared concurrency limiter.
    pub concurrency_limit: usize,
}

impl Default for BootstrapConfig {
    fn default() -> Self {
        Self {
            concurrency_limit: 50,
        }
    }
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        u64::deserialize(d).map(Duration::from_millis)
    }
}
