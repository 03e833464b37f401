// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration for flowmaster-master.

use std::str::FromStr;
use std::time::Duration;

use crate::failover::FailoverConfig;
use crate::intake::CommandIntakeConfig;
use crate::state_wheel::StateWheelConfig;

/// Master configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct MasterConfig {
    /// SQLite database path or `sqlite:` URL.
    pub database_url: String,
    /// This master's address; registry identity and ownership marker.
    pub host: String,
    /// Command page size per intake cycle.
    pub fetch_command_num: i64,
    /// Size of the bounded conversion pool.
    pub exec_threads: usize,
    /// Sleep between idle intake cycles.
    pub poll_interval: Duration,
    /// CPU usage fraction above which intake skips a cycle.
    pub max_cpu_usage: f32,
    /// Memory usage fraction above which intake skips a cycle.
    pub max_memory_usage: f32,
    /// Whether the overload check runs at all.
    pub load_protection_enabled: bool,
    /// Timing wheel tick.
    pub state_wheel_interval: Duration,
    /// Buckets per timing wheel.
    pub state_wheel_size: usize,
    /// Period of the failover sweep.
    pub failover_interval: Duration,
    /// Registry lock acquisition timeout.
    pub lock_timeout: Duration,
    /// Timeout for dispatch, kill and notify calls.
    pub dispatch_timeout: Duration,
}

impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            database_url: String::new(),
            host: "127.0.0.1:5678".to_string(),
            fetch_command_num: 10,
            exec_threads: 10,
            poll_interval: Duration::from_millis(1000),
            max_cpu_usage: 0.7,
            max_memory_usage: 0.7,
            load_protection_enabled: true,
            state_wheel_interval: Duration::from_millis(1000),
            state_wheel_size: 60,
            failover_interval: Duration::from_secs(10),
            lock_timeout: Duration::from_millis(5000),
            dispatch_timeout: Duration::from_millis(5000),
        }
    }
}

impl MasterConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Load configuration from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let database_url = lookup("FLOWMASTER_DATABASE_URL")
            .ok_or(ConfigError::MissingEnvVar("FLOWMASTER_DATABASE_URL"))?;

        Ok(Self {
            database_url,
            host: lookup("FLOWMASTER_HOST").unwrap_or(defaults.host),
            fetch_command_num: parse(&lookup, "FLOWMASTER_FETCH_COMMAND_NUM")?
                .unwrap_or(defaults.fetch_command_num),
            exec_threads: parse(&lookup, "FLOWMASTER_EXEC_THREADS")?
                .unwrap_or(defaults.exec_threads),
            poll_interval: parse(&lookup, "FLOWMASTER_POLL_INTERVAL_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.poll_interval),
            max_cpu_usage: parse(&lookup, "FLOWMASTER_MAX_CPU_USAGE")?
                .unwrap_or(defaults.max_cpu_usage),
            max_memory_usage: parse(&lookup, "FLOWMASTER_MAX_MEMORY_USAGE")?
                .unwrap_or(defaults.max_memory_usage),
            load_protection_enabled: lookup("FLOWMASTER_LOAD_PROTECTION_ENABLED")
                .map(|v| v == "true" || v == "1")
                .unwrap_or(defaults.load_protection_enabled),
            state_wheel_interval: parse(&lookup, "FLOWMASTER_STATE_WHEEL_INTERVAL_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.state_wheel_interval),
            state_wheel_size: parse(&lookup, "FLOWMASTER_STATE_WHEEL_SIZE")?
                .unwrap_or(defaults.state_wheel_size),
            failover_interval: parse(&lookup, "FLOWMASTER_FAILOVER_INTERVAL_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.failover_interval),
            lock_timeout: parse(&lookup, "FLOWMASTER_LOCK_TIMEOUT_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.lock_timeout),
            dispatch_timeout: parse(&lookup, "FLOWMASTER_DISPATCH_TIMEOUT_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.dispatch_timeout),
        })
    }

    /// Settings for the command intake loop.
    pub fn intake_config(&self) -> CommandIntakeConfig {
        CommandIntakeConfig {
            page_size: self.fetch_command_num,
            exec_threads: self.exec_threads.max(1),
            poll_interval: self.poll_interval,
            max_cpu_usage: self.max_cpu_usage,
            max_memory_usage: self.max_memory_usage,
            load_protection_enabled: self.load_protection_enabled,
        }
    }

    /// Settings for the failover sweep.
    pub fn failover_config(&self) -> FailoverConfig {
        FailoverConfig {
            interval: self.failover_interval,
            lock_timeout: self.lock_timeout,
            rpc_timeout: self.dispatch_timeout,
        }
    }

    /// Settings for the timeout wheels.
    pub fn state_wheel_config(&self) -> StateWheelConfig {
        StateWheelConfig {
            tick_interval: self.state_wheel_interval,
            wheel_size: self.state_wheel_size.max(1),
        }
    }
}

fn parse<T, F>(lookup: &F, name: &'static str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(name) {
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue { name, value: raw }),
        None => Ok(None),
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(&'static str),
    /// A variable is set but cannot be parsed.
    #[error("Invalid value for {name}: '{value}'")]
    InvalidValue {
        /// Variable name.
        name: &'static str,
        /// Raw value.
        value: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn test_defaults_with_only_database() {
        let config =
            MasterConfig::from_lookup(lookup(&[("FLOWMASTER_DATABASE_URL", "fm.db")])).unwrap();

        assert_eq!(config.database_url, "fm.db");
        assert_eq!(config.host, "127.0.0.1:5678");
        assert_eq!(config.fetch_command_num, 10);
        assert_eq!(config.exec_threads, 10);
        assert_eq!(config.state_wheel_size, 60);
        assert_eq!(config.failover_interval, Duration::from_secs(10));
        assert!(config.load_protection_enabled);
    }

    #[test]
    fn test_missing_database_url() {
        let err = MasterConfig::from_lookup(lookup(&[])).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::MissingEnvVar("FLOWMASTER_DATABASE_URL")
        ));
    }

    #[test]
    fn test_overrides_and_component_configs() {
        let config = MasterConfig::from_lookup(lookup(&[
            ("FLOWMASTER_DATABASE_URL", "sqlite::memory:"),
            ("FLOWMASTER_HOST", "10.0.0.5:5678"),
            ("FLOWMASTER_FETCH_COMMAND_NUM", "25"),
            ("FLOWMASTER_EXEC_THREADS", "4"),
            ("FLOWMASTER_LOAD_PROTECTION_ENABLED", "false"),
            ("FLOWMASTER_STATE_WHEEL_INTERVAL_MS", "250"),
            ("FLOWMASTER_LOCK_TIMEOUT_MS", "100"),
        ]))
        .unwrap();

        let intake = config.intake_config();
        assert_eq!(intake.page_size, 25);
        assert_eq!(intake.exec_threads, 4);
        assert!(!intake.load_protection_enabled);

        let wheel = config.state_wheel_config();
        assert_eq!(wheel.tick_interval, Duration::from_millis(250));

        let failover = config.failover_config();
        assert_eq!(failover.lock_timeout, Duration::from_millis(100));
        assert_eq!(config.host, "10.0.0.5:5678");
    }

    #[test]
    fn test_invalid_number() {
        let err = MasterConfig::from_lookup(lookup(&[
            ("FLOWMASTER_DATABASE_URL", "fm.db"),
            ("FLOWMASTER_EXEC_THREADS", "many"),
        ]))
        .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidValue {
                name: "FLOWMASTER_EXEC_THREADS",
                ..
            }
        ));
    }
}
