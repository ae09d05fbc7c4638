use std::time::Duration;

use crate::error::Error;
use crate::link::link_reserved_len;

/// A request deadline: the config default, no deadline at all, or an
/// explicit duration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timeout {
    /// Use `Config::default_request_timeout`.
    Default,
    /// Wait forever.
    Never,
    After(Duration),
}

impl Timeout {
    /// Resolve against the configured default. `None` means no deadline.
    pub fn resolve(self, config: &Config) -> Option<Duration> {
        match self {
            Timeout::Default => match config.default_request_timeout {
                Timeout::Default => Some(Config::FALLBACK_REQUEST_TIMEOUT),
                Timeout::Never => None,
                Timeout::After(d) => Some(d),
            },
            Timeout::Never => None,
            Timeout::After(d) => Some(d),
        }
    }
}

/// Transport configuration. Immutable once handed to a `Transport`.
#[derive(Debug, Clone)]
pub struct Config {
    /// Heap capacity of each outbound arena this side creates.
    pub output_arena_size: u64,
    /// Pause between redial attempts in an accessor's reconnect loop.
    pub reconnect_timeout: Duration,
    /// Deadline applied to invocations that pass `Timeout::Default`.
    pub default_request_timeout: Timeout,
}

impl Config {
    const FALLBACK_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

    pub fn validate(&self) -> Result<(), Error> {
        if self.output_arena_size == 0 {
            return Err(Error::InvalidConfig("output_arena_size must be > 0"));
        }
        if self.output_arena_size > u32::MAX as u64 {
            return Err(Error::InvalidConfig("output_arena_size must fit in 32 bits"));
        }
        Ok(())
    }

    /// Total segment size one outbound arena occupies, header and ring
    /// included.
    pub fn segment_estimate(&self) -> u64 {
        self.output_arena_size + link_reserved_len() as u64
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            output_arena_size: 1 << 20,
            reconnect_timeout: Duration::from_millis(100),
            default_request_timeout: Timeout::After(Self::FALLBACK_REQUEST_TIMEOUT),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn zero_arena_size_rejected() {
        let config = Config {
            output_arena_size: 0,
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn timeout_resolution() {
        let config = Config {
            default_request_timeout: Timeout::After(Duration::from_secs(2)),
            ..Config::default()
        };
        assert_eq!(
            Timeout::Default.resolve(&config),
            Some(Duration::from_secs(2))
        );
        assert_eq!(Timeout::Never.resolve(&config), None);
        assert_eq!(
            Timeout::After(Duration::from_millis(10)).resolve(&config),
            Some(Duration::from_millis(10))
        );

        let infinite = Config {
            default_request_timeout: Timeout::Never,
            ..Config::default()
        };
        assert_eq!(Timeout::Default.resolve(&infinite), None);
    }
}
