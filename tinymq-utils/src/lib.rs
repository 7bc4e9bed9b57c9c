//! Small helpers shared by the tinymq crates.
//!
//! - [`Counter`]: an atomic gauge with a high-water mark, used for broker statistics
//! - duration parsing for configuration values such as `"1m30s"` or `"500ms"`
//! - millisecond timestamps for stored packets
//!
//! ```
//! use tinymq_utils::to_duration;
//!
//! assert_eq!(to_duration("1h30m15s").as_secs(), 5415);
//! assert_eq!(to_duration("250ms").as_millis(), 250);
//! ```

#![deny(unsafe_code)]

use std::net::SocketAddr;
use std::time::Duration;

use serde::de::{self, Deserialize, Deserializer};

mod counter;

pub use counter::Counter;

/// Milliseconds since the unix epoch.
pub type TimestampMillis = i64;

pub fn deserialize_duration<'de, D>(deserializer: D) -> std::result::Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let v = String::deserialize(deserializer)?;
    Ok(to_duration(&v))
}

/// Parses `"1h30m"`, `"2s"`, `"100ms"` style strings. Unknown units count as zero.
pub fn to_duration(text: &str) -> Duration {
    let text = text.to_lowercase().replace("ms", "Y");
    let ms: u64 = text
        .split_inclusive(['s', 'm', 'h', 'd', 'Y'])
        .map(|x| {
            let mut chars = x.chars();
            let u = match chars.nth_back(0) {
                None => return 0,
                Some(u) => u,
            };
            let v = match chars.as_str().trim().parse::<u64>() {
                Err(_e) => return 0,
                Ok(v) => v,
            };
            match u {
                'Y' => v,
                's' => v * 1000,
                'm' => v * 60000,
                'h' => v * 3600000,
                'd' => v * 86400000,
                _ => 0,
            }
        })
        .sum();
    Duration::from_millis(ms)
}

pub fn deserialize_addr<'de, D>(deserializer: D) -> std::result::Result<SocketAddr, D::Error>
where
    D: Deserializer<'de>,
{
    let addr = String::deserialize(deserializer)?
        .parse::<SocketAddr>()
        .map_err(|e| de::Error::custom(format!("invalid socket address, {e}")))?;
    Ok(addr)
}

#[inline]
pub fn timestamp_millis() -> TimestampMillis {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|t| t.as_millis() as i64)
        .unwrap_or_else(|_| chrono::Local::now().timestamp_millis())
}
