use std::env;

use crate::error::Error;

/// Environment variable carrying the shared memory id to the instrumentation.
pub const SHM_ENV_VAR: &str = "__AFL_SHM_ID";

/// Environment variable telling dynamically sized instrumentation how large the map is.
pub const MAP_SIZE_ENV_VAR: &str = "AFL_MAP_SIZE";

/// If set (to anything), stdout and stderr of the target go to `/dev/null`.
pub const SINK_OUTPUT_ENV_VAR: &str = "AFL_SINK_OUTPUT";

/// Control pipe read end in the target. The status pipe write end is `FORKSRV_FD + 1`.
///
/// This is fixed by the instrumentation and must never change.
pub const FORKSRV_FD: i32 = 198;

/// Every message of the handshake has exactly this many bytes.
pub const HANDSHAKE_TOKEN_LEN: usize = 4;

pub const MAP_SIZE_POW2: u32 = 14;
pub const MAP_SIZE: usize = 1 << MAP_SIZE_POW2;

pub const MAP_SIZE_MIN: usize = 8;
pub const MAP_SIZE_MAX: usize = 1 << 28;

/// Settings of a single harness invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub map_size: usize,
    pub sink_output: bool,
    /// Report raw hit counts instead of bucket markers
    pub raw: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            map_size: MAP_SIZE,
            sink_output: false,
            raw: false,
        }
    }
}

impl Config {
    /// Defaults overridden by `AFL_MAP_SIZE` and `AFL_SINK_OUTPUT`.
    pub fn from_env() -> Result<Self, Error> {
        let map_size = match env::var(MAP_SIZE_ENV_VAR) {
            Ok(value) => value.trim().parse::<usize>().map_err(|err| {
                Error::Config(format!("{MAP_SIZE_ENV_VAR}={value:?} is not a size: {err}"))
            })?,
            Err(_) => MAP_SIZE,
        };

        Self {
            map_size,
            sink_output: env::var_os(SINK_OUTPUT_ENV_VAR).is_some(),
            raw: false,
        }
        .validate()
    }

    pub fn with_map_size(mut self, map_size: usize) -> Result<Self, Error> {
        self.map_size = map_size;
        self.validate()
    }

    pub fn validate(self) -> Result<Self, Error> {
        if !self.map_size.is_power_of_two()
            || self.map_size < MAP_SIZE_MIN
            || self.map_size > MAP_SIZE_MAX
        {
            return Err(Error::Config(format!(
                "map size {} must be a power of two between {} and {}",
                self.map_size, MAP_SIZE_MIN, MAP_SIZE_MAX
            )));
        }

        Ok(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_log::test]
    fn default_map_size_matches_instrumentation() {
        assert_eq!(MAP_SIZE, 16384);
        assert_eq!(Config::default().map_size, MAP_SIZE);
        assert!(Config::default().validate().is_ok());
    }

    #[test_log::test]
    fn rejects_map_sizes_that_are_not_powers_of_two() {
        let config = Config::default();
        assert!(matches!(
            config.clone().with_map_size(1000),
            Err(Error::Config(_))
        ));
        assert!(matches!(config.clone().with_map_size(4), Err(Error::Config(_))));
        assert!(matches!(
            config.clone().with_map_size(MAP_SIZE_MAX * 2),
            Err(Error::Config(_))
        ));
        assert_eq!(config.with_map_size(8).unwrap().map_size, 8);
    }
}
