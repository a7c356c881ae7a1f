use std::env;
use std::str::FromStr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use log::{debug, warn};

pub struct TimeUtility;
pub struct EnvUtility;

impl TimeUtility {
    fn since_epoch() -> Duration {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
    }

    pub fn get_timestamp_ms() -> u64 {
        Self::since_epoch().as_millis() as u64
    }

    pub fn get_timestamp_us() -> u64 {
        Self::since_epoch().as_micros() as u64
    }

    /// Saturates at `u32::MAX`, which is what fits in a frame trailer.
    pub fn duration_us_u32(duration: Duration) -> u32 {
        u32::try_from(duration.as_micros()).unwrap_or(u32::MAX)
    }
}

impl EnvUtility {
    /// Reads and parses `name`, falling back to `default` when unset or unparsable.
    pub fn parse_or<T>(name: &str, default: T) -> T
    where
        T: FromStr + std::fmt::Debug,
    {
        match env::var(name) {
            Ok(raw) => match raw.trim().parse::<T>() {
                Ok(value) => {
                    debug!("{} = {:?}", name, value);
                    value
                }
                Err(_) => {
                    warn!("Ignoring unparsable {}={:?}, using {:?}", name, raw, default);
                    default
                }
            },
            Err(_) => default,
        }
    }

    pub fn string_or(name: &str, default: &str) -> String {
        env::var(name).unwrap_or_else(|_| default.to_string())
    }

    pub fn duration_ms_or(name: &str, default: Duration) -> Duration {
        Duration::from_millis(Self::parse_or(name, default.as_millis() as u64))
    }
}
