// Timing and limit profiles for the protocol core.
//
// Hosts normally run on the built-in defaults. A TOML file named by
// `EMBERLINK_CONFIG` overrides individual knobs per link profile, and
// `EMBERLINK_PROFILE` picks which profile drives the session.

use std::{env, fmt, fs, io, path::Path};

use serde::Deserialize;
use thiserror::Error;

use crate::wire::QUEUE_SIZE;

/// Function arguments share the staging buffer with the frame envelope.
const MAX_ARG_CAPACITY: usize = QUEUE_SIZE - 18;

#[derive(Debug, Error)]
pub enum ConfigError {
    /// The override file could not be read.
    #[error("cannot read config file '{path}': {source}")]
    Read {
        path: String,
        #[source]
        source: io::Error,
    },
    /// The override file is not well-formed TOML.
    #[error("malformed config: {0}")]
    Toml(#[from] toml::de::Error),
    /// `EMBERLINK_PROFILE` named a profile that does not exist.
    #[error("unknown profile '{0}', expected wifi or cellular")]
    UnknownProfile(String),
    /// A profile violates a protocol constraint.
    #[error("profile '{profile}': {reason}")]
    Invalid {
        profile: ProfileName,
        reason: String,
    },
}

/// Which link profile drives the session timings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProfileName {
    /// Always-on links where traffic is cheap.
    Wifi,
    /// Metered links where keep-alive traffic costs money.
    Cellular,
}

impl ProfileName {
    pub const ALL: [ProfileName; 2] = [ProfileName::Wifi, ProfileName::Cellular];

    /// Accepts the canonical names plus common link-type aliases.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value.to_ascii_lowercase().as_str() {
            "wifi" | "lan" => Some(ProfileName::Wifi),
            "cellular" | "lte" => Some(ProfileName::Cellular),
            _ => None,
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            ProfileName::Wifi => "wifi",
            ProfileName::Cellular => "cellular",
        }
    }
}

impl fmt::Display for ProfileName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One profile table per link type, every knob individually overridable.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub wifi: Profile,
    pub cellular: Profile,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            wifi: Profile::default(),
            cellular: Profile::cellular(),
        }
    }
}

impl Config {
    /// Parses a TOML document and checks every profile against the protocol
    /// constraints.
    pub fn parse(input: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(input)?;
        for name in ProfileName::ALL {
            config.profile(name).check(name)?;
        }
        Ok(config)
    }

    /// Reads and parses an override file.
    pub fn read<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::parse(&contents)
    }

    /// Profile registered under `name`.
    #[must_use]
    pub fn profile(&self, name: ProfileName) -> &Profile {
        match name {
            ProfileName::Wifi => &self.wifi,
            ProfileName::Cellular => &self.cellular,
        }
    }
}

/// Resolves the profile to run with at startup: overrides from
/// `EMBERLINK_CONFIG` when set, the profile named by `EMBERLINK_PROFILE`,
/// `fallback` otherwise. Naming a profile that does not exist is an error,
/// not a silent fallback.
pub fn startup_profile(fallback: ProfileName) -> Result<(ProfileName, Profile), ConfigError> {
    let config = match env::var_os("EMBERLINK_CONFIG") {
        Some(path) => Config::read(path)?,
        None => Config::default(),
    };
    let name = match env::var_os("EMBERLINK_PROFILE") {
        Some(choice) => {
            let choice = choice.to_string_lossy();
            ProfileName::parse(&choice)
                .ok_or_else(|| ConfigError::UnknownProfile(choice.into_owned()))?
        }
        None => fallback,
    };
    Ok((name, *config.profile(name)))
}

/// Timing and limit knobs for one link type.
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct Profile {
    /// Idle period after which a keep-alive ping is sent.
    pub keep_alive_ms: u32,
    /// Grace period for the ping acknowledgment before disconnecting.
    pub ping_ack_timeout_ms: u32,
    /// Silence during an update after which a retransmit is requested.
    pub chunk_missed_ms: u32,
    /// Zero-progress window tolerated by the blocking I/O helpers.
    pub io_stall_timeout_ms: u32,
    /// Upper bound on a cloud function argument.
    pub max_function_arg_length: usize,
    /// Whether a firmware chunk with a bad CRC is rejected.
    pub enforce_chunk_crc: bool,
}

impl Default for Profile {
    fn default() -> Self {
        Self {
            keep_alive_ms: 15_000,
            ping_ack_timeout_ms: 10_000,
            chunk_missed_ms: 3_000,
            io_stall_timeout_ms: 20_000,
            max_function_arg_length: 64,
            enforce_chunk_crc: true,
        }
    }
}

impl Profile {
    /// Cellular defaults: ping rarely, wait longer for the ack.
    #[must_use]
    pub fn cellular() -> Self {
        Self {
            keep_alive_ms: 1_380_000,
            ping_ack_timeout_ms: 30_000,
            ..Self::default()
        }
    }

    /// Checks the knobs against the protocol constraints, blaming `name`
    /// in any error.
    pub fn check(&self, name: ProfileName) -> Result<(), ConfigError> {
        let fail = |reason: String| ConfigError::Invalid {
            profile: name,
            reason,
        };

        for (label, value) in [
            ("keep_alive_ms", self.keep_alive_ms),
            ("ping_ack_timeout_ms", self.ping_ack_timeout_ms),
            ("chunk_missed_ms", self.chunk_missed_ms),
            ("io_stall_timeout_ms", self.io_stall_timeout_ms),
        ] {
            if value == 0 {
                return Err(fail(format!("{label} must be non-zero")));
            }
        }
        if self.ping_ack_timeout_ms >= self.keep_alive_ms {
            return Err(fail(format!(
                "ping_ack_timeout_ms ({}) must stay below keep_alive_ms ({})",
                self.ping_ack_timeout_ms, self.keep_alive_ms
            )));
        }
        if self.max_function_arg_length == 0 || self.max_function_arg_length > MAX_ARG_CAPACITY {
            return Err(fail(format!(
                "max_function_arg_length ({}) outside 1..={MAX_ARG_CAPACITY}",
                self.max_function_arg_length
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_pass_the_checks() {
        let config = Config::parse("").unwrap();
        assert_eq!(config.wifi.keep_alive_ms, 15_000);
        assert_eq!(config.wifi.io_stall_timeout_ms, 20_000);
        assert!(config.cellular.keep_alive_ms > config.wifi.keep_alive_ms);
    }

    #[test]
    fn partial_overrides_keep_remaining_defaults() {
        let config = Config::parse(
            r#"
            [wifi]
            keep_alive_ms = 30000
            enforce_chunk_crc = false
            "#,
        )
        .unwrap();
        assert_eq!(config.wifi.keep_alive_ms, 30_000);
        assert!(!config.wifi.enforce_chunk_crc);
        assert_eq!(config.wifi.ping_ack_timeout_ms, 10_000);
        assert_eq!(config.cellular.keep_alive_ms, 1_380_000);
    }

    #[test]
    fn inverted_timeouts_blame_the_offending_profile() {
        let err = Config::parse(
            r#"
            [wifi]
            keep_alive_ms = 5000
            ping_ack_timeout_ms = 9000
            "#,
        )
        .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid {
                profile: ProfileName::Wifi,
                ..
            }
        ));
    }

    #[test]
    fn zero_timing_is_rejected() {
        let err = Config::parse("[cellular]\nchunk_missed_ms = 0\n").unwrap_err();
        assert!(matches!(
            err,
            ConfigError::Invalid {
                profile: ProfileName::Cellular,
                ..
            }
        ));
    }

    #[test]
    fn function_arg_limit_is_bounded_by_the_staging_buffer() {
        let err = Config::parse("[wifi]\nmax_function_arg_length = 10000\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));
    }

    #[test]
    fn malformed_toml_is_reported_as_such() {
        assert!(matches!(Config::parse("[wifi"), Err(ConfigError::Toml(_))));
    }

    #[test]
    fn profile_names_accept_link_aliases() {
        assert_eq!(ProfileName::parse("wifi"), Some(ProfileName::Wifi));
        assert_eq!(ProfileName::parse("LTE"), Some(ProfileName::Cellular));
        assert_eq!(ProfileName::parse("dialup"), None);
        assert_eq!(ProfileName::Cellular.to_string(), "cellular");
    }
}
