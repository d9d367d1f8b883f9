//! Runtime configuration.
//!
//! Only two environment variables influence launch geometry:
//!
//! - `OMP_TEAM_LIMIT` lowers every device's grid ceiling.
//! - `OMP_NUM_TEAMS` replaces the library default team count and disables
//!   trip-count driven team sizing.
//!
//! Both are read once, when the runtime is constructed.

use serde::{Deserialize, Serialize};

use crate::error::{OffloadError, Result};
use crate::validator::EM_CUDA;

/// Environment variable capping the number of teams per launch.
pub const ENV_TEAM_LIMIT: &str = "OMP_TEAM_LIMIT";

/// Environment variable setting the default number of teams.
pub const ENV_NUM_TEAMS: &str = "OMP_NUM_TEAMS";

/// Team-count overrides taken from the environment.
///
/// `None` means the variable was not set (or did not parse) and the library
/// default applies.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnvOverrides {
    /// `OMP_TEAM_LIMIT`: ceiling for blocks per grid.
    pub team_limit: Option<u32>,
    /// `OMP_NUM_TEAMS`: default team count.
    pub num_teams: Option<u32>,
}

impl EnvOverrides {
    /// No overrides.
    #[must_use]
    pub fn none() -> Self {
        Self::default()
    }

    /// Read overrides from the process environment.
    #[must_use]
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read overrides through an arbitrary lookup function.
    ///
    /// Values that do not parse are logged and treated as unset.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let read = |key: &str| -> Option<u32> {
            let raw = lookup(key)?;
            match parse_override(key, &raw) {
                Ok(value) => {
                    tracing::debug!(variable = key, value, "Parsed environment override");
                    Some(value)
                }
                Err(e) => {
                    tracing::warn!(variable = key, value = %raw, error = %e, "Ignoring environment override");
                    None
                }
            }
        };

        Self {
            team_limit: read(ENV_TEAM_LIMIT),
            num_teams: read(ENV_NUM_TEAMS),
        }
    }

    /// Builder method to set the team limit.
    #[must_use]
    pub fn with_team_limit(mut self, limit: u32) -> Self {
        self.team_limit = Some(limit);
        self
    }

    /// Builder method to set the default team count.
    #[must_use]
    pub fn with_num_teams(mut self, teams: u32) -> Self {
        self.num_teams = Some(teams);
        self
    }

    /// Team limit that actually lowers the grid ceiling (zero is ignored).
    #[must_use]
    pub fn effective_team_limit(&self) -> Option<u32> {
        self.team_limit.filter(|&limit| limit > 0)
    }

    /// Default team count that replaces the library default (zero is ignored).
    #[must_use]
    pub fn effective_num_teams(&self) -> Option<u32> {
        self.num_teams.filter(|&teams| teams > 0)
    }

    /// Whether `OMP_NUM_TEAMS` was given at all.
    ///
    /// Any value, including zero, pins the team count and disables
    /// trip-count driven sizing.
    #[must_use]
    pub fn pins_team_count(&self) -> bool {
        self.num_teams.is_some()
    }
}

/// Parse a non-negative integer override.
pub fn parse_override(name: &str, raw: &str) -> Result<u32> {
    let trimmed = raw.trim();
    trimmed.parse::<u32>().map_err(|e| {
        OffloadError::InvalidConfig(format!(
            "{} must be a non-negative integer, got '{}': {}",
            name, trimmed, e
        ))
    })
}

/// Scheduling policy requested when creating device contexts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContextSchedule {
    /// Let the driver decide.
    Auto,
    /// Spin while waiting for device results.
    Spin,
    /// Yield the CPU while waiting.
    Yield,
    /// Block on a synchronization primitive while waiting.
    #[default]
    BlockingSync,
}

impl ContextSchedule {
    /// Driver flag bits for this policy (CUDA `CU_CTX_SCHED_*` values).
    #[must_use]
    pub const fn flag_bits(self) -> u32 {
        match self {
            Self::Auto => 0x0,
            Self::Spin => 0x1,
            Self::Yield => 0x2,
            Self::BlockingSync => 0x4,
        }
    }
}

/// Configuration for an [`crate::OffloadRuntime`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Team-count overrides.
    pub overrides: EnvOverrides,
    /// Context scheduling policy.
    pub context_schedule: ContextSchedule,
    /// ELF machine id accepted by the default image validator.
    pub machine: u16,
    /// Run the image validator inside `load_binary` as well.
    pub validate_on_load: bool,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            overrides: EnvOverrides::none(),
            context_schedule: ContextSchedule::BlockingSync,
            machine: EM_CUDA,
            validate_on_load: false,
        }
    }
}

impl RuntimeConfig {
    /// Default configuration with overrides read from the process environment.
    #[must_use]
    pub fn from_env() -> Self {
        Self {
            overrides: EnvOverrides::from_env(),
            ..Self::default()
        }
    }
}

/// Builder for RuntimeConfig.
#[derive(Debug, Default)]
pub struct RuntimeConfigBuilder {
    config: RuntimeConfig,
}

impl RuntimeConfigBuilder {
    /// Creates a new builder with default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a builder seeded from the process environment.
    #[must_use]
    pub fn from_env() -> Self {
        Self {
            config: RuntimeConfig::from_env(),
        }
    }

    /// Sets the environment overrides.
    #[must_use]
    pub fn with_overrides(mut self, overrides: EnvOverrides) -> Self {
        self.config.overrides = overrides;
        self
    }

    /// Sets the `OMP_TEAM_LIMIT` equivalent.
    #[must_use]
    pub fn with_team_limit(mut self, limit: u32) -> Self {
        self.config.overrides.team_limit = Some(limit);
        self
    }

    /// Sets the `OMP_NUM_TEAMS` equivalent.
    #[must_use]
    pub fn with_num_teams(mut self, teams: u32) -> Self {
        self.config.overrides.num_teams = Some(teams);
        self
    }

    /// Sets the context scheduling policy.
    #[must_use]
    pub fn with_context_schedule(mut self, schedule: ContextSchedule) -> Self {
        self.config.context_schedule = schedule;
        self
    }

    /// Sets the ELF machine id accepted by the default validator.
    #[must_use]
    pub fn with_machine(mut self, machine: u16) -> Self {
        self.config.machine = machine;
        self
    }

    /// Enables or disables validation inside `load_binary`.
    #[must_use]
    pub fn with_validate_on_load(mut self, enabled: bool) -> Self {
        self.config.validate_on_load = enabled;
        self
    }

    /// Builds the configuration.
    #[must_use]
    pub fn build(self) -> RuntimeConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_overrides_unset() {
        let overrides = EnvOverrides::from_lookup(lookup(&[]));
        assert_eq!(overrides, EnvOverrides::none());
        assert!(!overrides.pins_team_count());
        assert_eq!(overrides.effective_team_limit(), None);
    }

    #[test]
    fn test_overrides_parsed() {
        let overrides = EnvOverrides::from_lookup(lookup(&[
            ("OMP_TEAM_LIMIT", "256"),
            ("OMP_NUM_TEAMS", " 64 "),
        ]));
        assert_eq!(overrides.team_limit, Some(256));
        assert_eq!(overrides.num_teams, Some(64));
        assert!(overrides.pins_team_count());
    }

    #[test]
    fn test_overrides_invalid_values_ignored() {
        let overrides = EnvOverrides::from_lookup(lookup(&[
            ("OMP_TEAM_LIMIT", "-4"),
            ("OMP_NUM_TEAMS", "lots"),
        ]));
        assert_eq!(overrides, EnvOverrides::none());
    }

    #[test]
    fn test_zero_num_teams_pins_but_keeps_default() {
        let overrides = EnvOverrides::none().with_num_teams(0).with_team_limit(0);
        assert!(overrides.pins_team_count());
        assert_eq!(overrides.effective_num_teams(), None);
        assert_eq!(overrides.effective_team_limit(), None);
    }

    #[test]
    fn test_parse_override_error() {
        let err = parse_override("OMP_NUM_TEAMS", "x").unwrap_err();
        assert!(matches!(err, OffloadError::InvalidConfig(_)));
        assert!(err.to_string().contains("OMP_NUM_TEAMS"));
    }

    #[test]
    fn test_context_schedule_flags() {
        assert_eq!(ContextSchedule::default(), ContextSchedule::BlockingSync);
        assert_eq!(ContextSchedule::BlockingSync.flag_bits(), 0x4);
        assert_eq!(ContextSchedule::Auto.flag_bits(), 0x0);
    }

    #[test]
    fn test_runtime_config_builder() {
        let config = RuntimeConfigBuilder::new()
            .with_team_limit(1024)
            .with_num_teams(32)
            .with_context_schedule(ContextSchedule::Yield)
            .with_validate_on_load(true)
            .build();

        assert_eq!(config.overrides.team_limit, Some(1024));
        assert_eq!(config.overrides.num_teams, Some(32));
        assert_eq!(config.context_schedule, ContextSchedule::Yield);
        assert_eq!(config.machine, EM_CUDA);
        assert!(config.validate_on_load);
    }

    #[test]
    fn test_runtime_config_from_toml() {
        let config: RuntimeConfig = toml::from_str(
            r#"
            context_schedule = "spin"
            validate_on_load = true

            [overrides]
            team_limit = 4096
            "#,
        )
        .unwrap();

        assert_eq!(config.context_schedule, ContextSchedule::Spin);
        assert!(config.validate_on_load);
        assert_eq!(config.overrides.team_limit, Some(4096));
        assert_eq!(config.overrides.num_teams, None);
        assert_eq!(config.machine, EM_CUDA);
    }
}
