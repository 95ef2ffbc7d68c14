//! Configuration descriptors and the typed configs built from them.
//!
//! Every recognized option is declared once as an [`OptionDescriptor`]. A
//! config file (the `[inventory_sync]` table of a TOML document) and any
//! command-line overrides are checked against those descriptors and then
//! turned into a plain struct that callers pass around explicitly.

use crate::chunker::DEFAULT_CHUNK_SIZE;
use crate::error::{Result, SyncError};
use std::collections::BTreeMap;
use std::time::Duration;

/// Name of the TOML table holding the options.
pub const CONFIG_TABLE: &str = "inventory_sync";

/// Declaration of one numeric option: where it lives, its default and its bounds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OptionDescriptor {
    pub name: &'static str,
    pub title: &'static str,
    pub description: &'static str,
    pub default: u64,
    pub min: u64,
    pub max: u64,
}

impl OptionDescriptor {
    pub fn validate(&self, value: u64) -> Result<u64> {
        if value < self.min || value > self.max {
            return Err(SyncError::Config(format!(
                "{} must be between {} and {}, got {}",
                self.name, self.min, self.max, value
            )));
        }
        Ok(value)
    }
}

pub const CONTROLLER_OPTIONS: &[OptionDescriptor] = &[
    OptionDescriptor {
        name: "player_lock_timeout",
        title: "Player Lock Timeout",
        description: "Time in seconds before the lock on a player inventory expires after an instance stops or is disconnected",
        default: 60,
        min: 1,
        max: 86_400,
    },
    OptionDescriptor {
        name: "max_lock_timeout",
        title: "Maximum Lock Timeout",
        description: "Largest lock lifetime in seconds an instance may request",
        default: 3600,
        min: 1,
        max: 86_400,
    },
    OptionDescriptor {
        name: "lock_sweep_interval_ms",
        title: "Lock Sweep Interval",
        description: "Milliseconds between scans for expired locks",
        default: 1000,
        min: 10,
        max: 60_000,
    },
    OptionDescriptor {
        name: "transfer_timeout",
        title: "Transfer Timeout",
        description: "Seconds before an incomplete upload is abandoned",
        default: 30,
        min: 1,
        max: 3600,
    },
    OptionDescriptor {
        name: "autosave_interval",
        title: "Autosave Interval",
        description: "Seconds between saves of the inventory database",
        default: 60,
        min: 1,
        max: 86_400,
    },
];

pub const INSTANCE_OPTIONS: &[OptionDescriptor] = &[
    OptionDescriptor {
        name: "rcon_chunk_size",
        title: "Rcon inventory chunk size",
        description: "Divide inventories into multiple chunks before sending with rcon to prevent blocking the pipe",
        default: DEFAULT_CHUNK_SIZE as u64,
        min: 1,
        max: 32_768,
    },
    OptionDescriptor {
        name: "request_timeout_ms",
        title: "Request Timeout",
        description: "Milliseconds to wait for the controller to answer a single request",
        default: 2000,
        min: 10,
        max: 120_000,
    },
    OptionDescriptor {
        name: "transfer_timeout",
        title: "Transfer Timeout",
        description: "Seconds to wait for a download to complete",
        default: 30,
        min: 1,
        max: 3600,
    },
    OptionDescriptor {
        name: "bridge_timeout",
        title: "Bridge Timeout",
        description: "Seconds to wait for the game to apply or export an inventory",
        default: 10,
        min: 1,
        max: 600,
    },
    OptionDescriptor {
        name: "max_attempts",
        title: "Maximum Attempts",
        description: "Attempts made for a retryable operation before giving up",
        default: 5,
        min: 1,
        max: 100,
    },
    OptionDescriptor {
        name: "retry_base_delay_ms",
        title: "Retry Base Delay",
        description: "Milliseconds to wait before the first retry, doubled on every further attempt",
        default: 200,
        min: 1,
        max: 60_000,
    },
    OptionDescriptor {
        name: "retry_max_delay_ms",
        title: "Retry Maximum Delay",
        description: "Upper bound for the delay between retries in milliseconds",
        default: 5000,
        min: 1,
        max: 600_000,
    },
    OptionDescriptor {
        name: "heartbeat_interval",
        title: "Heartbeat Interval",
        description: "Seconds between lock renewals for players online on this instance",
        default: 20,
        min: 1,
        max: 3600,
    },
];

/// Resolved option values, one per descriptor.
#[derive(Debug, Clone)]
pub struct OptionValues {
    values: BTreeMap<&'static str, u64>,
}

impl OptionValues {
    /// Resolves every descriptor from the table and overrides, falling back to defaults.
    ///
    /// Overrides win over the table. Unknown keys in the table are rejected so
    /// typos do not silently fall back to defaults.
    pub fn resolve(
        descriptors: &[OptionDescriptor],
        table: Option<&toml::Table>,
        overrides: &[(&str, u64)],
    ) -> Result<Self> {
        if let Some(table) = table {
            for key in table.keys() {
                if !descriptors.iter().any(|d| d.name == key.as_str()) {
                    return Err(SyncError::Config(format!("unknown option {}", key)));
                }
            }
        }

        let mut values = BTreeMap::new();
        for descriptor in descriptors {
            let from_table = match table.and_then(|t| t.get(descriptor.name)) {
                Some(toml::Value::Integer(value)) if *value >= 0 => Some(*value as u64),
                Some(other) => {
                    return Err(SyncError::Config(format!(
                        "{} must be a non-negative integer, got {}",
                        descriptor.name, other
                    )))
                }
                None => None,
            };
            let from_override = overrides
                .iter()
                .rev()
                .find(|(name, _)| *name == descriptor.name)
                .map(|(_, value)| *value);

            let value = from_override.or(from_table).unwrap_or(descriptor.default);
            values.insert(descriptor.name, descriptor.validate(value)?);
        }

        for (name, _) in overrides {
            if !values.contains_key(*name) {
                return Err(SyncError::Config(format!("unknown option {}", name)));
            }
        }

        Ok(Self { values })
    }

    pub fn get(&self, name: &str) -> u64 {
        self.values.get(name).copied().unwrap_or_default()
    }
}

/// Extracts the `[inventory_sync]` table from a TOML document.
pub fn parse_table(contents: &str) -> Result<Option<toml::Table>> {
    let document = contents
        .parse::<toml::Table>()
        .map_err(|e| SyncError::Config(e.to_string()))?;

    match document.get(CONFIG_TABLE) {
        Some(toml::Value::Table(table)) => Ok(Some(table.clone())),
        Some(_) => Err(SyncError::Config(format!("{} must be a table", CONFIG_TABLE))),
        None => Ok(None),
    }
}

/// Human readable listing of a descriptor table, used by `--list-options`.
pub fn describe(descriptors: &[OptionDescriptor]) -> String {
    descriptors
        .iter()
        .map(|d| {
            format!(
                "{} (default {}, {}..={})\n    {}: {}",
                d.name, d.default, d.min, d.max, d.title, d.description
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Controller side settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerConfig {
    pub player_lock_timeout: u64,
    pub max_lock_timeout: u64,
    pub lock_sweep_interval: Duration,
    pub transfer_timeout: Duration,
    pub autosave_interval: Duration,
}

impl ControllerConfig {
    pub fn from_values(values: &OptionValues) -> Result<Self> {
        let config = Self {
            player_lock_timeout: values.get("player_lock_timeout"),
            max_lock_timeout: values.get("max_lock_timeout"),
            lock_sweep_interval: Duration::from_millis(values.get("lock_sweep_interval_ms")),
            transfer_timeout: Duration::from_secs(values.get("transfer_timeout")),
            autosave_interval: Duration::from_secs(values.get("autosave_interval")),
        };

        if config.player_lock_timeout > config.max_lock_timeout {
            return Err(SyncError::Config(format!(
                "player_lock_timeout ({}) exceeds max_lock_timeout ({})",
                config.player_lock_timeout, config.max_lock_timeout
            )));
        }
        Ok(config)
    }

    pub fn load(contents: Option<&str>, overrides: &[(&str, u64)]) -> Result<Self> {
        let table = match contents {
            Some(contents) => parse_table(contents)?,
            None => None,
        };
        let values = OptionValues::resolve(CONTROLLER_OPTIONS, table.as_ref(), overrides)?;
        Self::from_values(&values)
    }
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            player_lock_timeout: 60,
            max_lock_timeout: 3600,
            lock_sweep_interval: Duration::from_millis(1000),
            transfer_timeout: Duration::from_secs(30),
            autosave_interval: Duration::from_secs(60),
        }
    }
}

/// Instance side settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceConfig {
    pub rcon_chunk_size: usize,
    pub request_timeout: Duration,
    pub transfer_timeout: Duration,
    pub bridge_timeout: Duration,
    pub max_attempts: u32,
    pub retry_base_delay: Duration,
    pub retry_max_delay: Duration,
    pub heartbeat_interval: Duration,
}

impl InstanceConfig {
    pub fn from_values(values: &OptionValues) -> Result<Self> {
        let config = Self {
            rcon_chunk_size: values.get("rcon_chunk_size") as usize,
            request_timeout: Duration::from_millis(values.get("request_timeout_ms")),
            transfer_timeout: Duration::from_secs(values.get("transfer_timeout")),
            bridge_timeout: Duration::from_secs(values.get("bridge_timeout")),
            max_attempts: values.get("max_attempts") as u32,
            retry_base_delay: Duration::from_millis(values.get("retry_base_delay_ms")),
            retry_max_delay: Duration::from_millis(values.get("retry_max_delay_ms")),
            heartbeat_interval: Duration::from_secs(values.get("heartbeat_interval")),
        };

        if config.retry_base_delay > config.retry_max_delay {
            return Err(SyncError::Config(
                "retry_base_delay_ms exceeds retry_max_delay_ms".to_string(),
            ));
        }
        Ok(config)
    }

    pub fn load(contents: Option<&str>, overrides: &[(&str, u64)]) -> Result<Self> {
        let table = match contents {
            Some(contents) => parse_table(contents)?,
            None => None,
        };
        let values = OptionValues::resolve(INSTANCE_OPTIONS, table.as_ref(), overrides)?;
        Self::from_values(&values)
    }
}

impl Default for InstanceConfig {
    fn default() -> Self {
        Self {
            rcon_chunk_size: DEFAULT_CHUNK_SIZE,
            request_timeout: Duration::from_millis(2000),
            transfer_timeout: Duration::from_secs(30),
            bridge_timeout: Duration::from_secs(10),
            max_attempts: 5,
            retry_base_delay: Duration::from_millis(200),
            retry_max_delay: Duration::from_millis(5000),
            heartbeat_interval: Duration::from_secs(20),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_descriptors() {
        assert_eq!(
            ControllerConfig::load(None, &[]).unwrap(),
            ControllerConfig::default()
        );
        assert_eq!(
            InstanceConfig::load(None, &[]).unwrap(),
            InstanceConfig::default()
        );
    }

    #[test]
    fn test_reads_table_values() {
        let contents = r#"
            [inventory_sync]
            player_lock_timeout = 120
            transfer_timeout = 5
        "#;
        let config = ControllerConfig::load(Some(contents), &[]).unwrap();
        assert_eq!(config.player_lock_timeout, 120);
        assert_eq!(config.transfer_timeout, Duration::from_secs(5));
        assert_eq!(config.max_lock_timeout, 3600);
    }

    #[test]
    fn test_override_wins_over_file() {
        let contents = "[inventory_sync]\nrcon_chunk_size = 500\n";
        let config = InstanceConfig::load(Some(contents), &[("rcon_chunk_size", 250)]).unwrap();
        assert_eq!(config.rcon_chunk_size, 250);
    }

    #[test]
    fn test_rejects_zero_chunk_size() {
        let contents = "[inventory_sync]\nrcon_chunk_size = 0\n";
        assert!(matches!(
            InstanceConfig::load(Some(contents), &[]),
            Err(SyncError::Config(_))
        ));
    }

    #[test]
    fn test_rejects_unknown_and_mistyped_options() {
        let unknown = "[inventory_sync]\nplayer_lock_timout = 10\n";
        assert!(ControllerConfig::load(Some(unknown), &[]).is_err());

        let mistyped = "[inventory_sync]\nplayer_lock_timeout = \"ten\"\n";
        assert!(ControllerConfig::load(Some(mistyped), &[]).is_err());

        assert!(ControllerConfig::load(None, &[("no_such_option", 1)]).is_err());
    }

    #[test]
    fn test_lock_timeout_cannot_exceed_maximum() {
        let result = ControllerConfig::load(
            None,
            &[("player_lock_timeout", 600), ("max_lock_timeout", 300)],
        );
        assert!(matches!(result, Err(SyncError::Config(_))));
    }

    #[test]
    fn test_missing_table_uses_defaults() {
        let config = ControllerConfig::load(Some("[other]\nkey = 1\n"), &[]).unwrap();
        assert_eq!(config, ControllerConfig::default());
    }

    #[test]
    fn test_describe_lists_every_option() {
        let listing = describe(INSTANCE_OPTIONS);
        for descriptor in INSTANCE_OPTIONS {
            assert!(listing.contains(descriptor.name));
        }
    }
}
