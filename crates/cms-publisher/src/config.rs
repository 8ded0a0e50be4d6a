//! Publisher configuration.
//!
//! Every value has a production default and an environment override under
//! the `CMS_` prefix. [`PublisherConfig::from_lookup`] takes the variable
//! source as a closure so tests never touch the process environment.

use std::time::Duration;

/// Metadata label the batch is published under.
pub const DEFAULT_METADATA_LABEL: u64 = 1448;

/// Hard ceiling on the encoded batch size.
pub const DEFAULT_MAX_TX_BYTES: usize = 16_000;

/// What to do when a transaction hash was obtained but confirmation timed out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConfirmationTimeoutPolicy {
    /// Record the submission; the watchdog decides between visible and rolled back.
    #[default]
    KeepSubmitted,
    /// Treat as a failed submission; the records stay STORED for the next cycle.
    RevertToStored,
}

impl std::str::FromStr for ConfirmationTimeoutPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "keep_submitted" => Ok(Self::KeepSubmitted),
            "revert_to_stored" => Ok(Self::RevertToStored),
            other => Err(format!(
                "expected keep_submitted or revert_to_stored, got {other:?}"
            )),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Records selected per organisation per cycle.
    pub pull_batch_size: usize,
    pub max_tx_bytes: usize,
    pub initial_delay: Duration,
    pub fixed_delay: Duration,
    /// Only the highest version in a version group is eligible for dispatch.
    pub latest_version_only: bool,
    /// Address that pays for published transactions.
    pub source_address: String,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            pull_batch_size: 50,
            max_tx_bytes: DEFAULT_MAX_TX_BYTES,
            initial_delay: Duration::from_secs(15),
            fixed_delay: Duration::from_secs(10),
            latest_version_only: true,
            source_address: String::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SubmissionConfig {
    /// Zero disables the confirmation wait.
    pub confirmation_timeout: Duration,
    pub poll_interval: Duration,
    pub timeout_policy: ConfirmationTimeoutPolicy,
    pub metadata_label: u64,
}

impl Default for SubmissionConfig {
    fn default() -> Self {
        Self {
            confirmation_timeout: Duration::from_secs(300),
            poll_interval: Duration::from_secs(5),
            timeout_policy: ConfirmationTimeoutPolicy::default(),
            metadata_label: DEFAULT_METADATA_LABEL,
        }
    }
}

#[derive(Debug, Clone)]
pub struct WatchdogConfig {
    /// Records examined per run, across all organisations.
    pub tx_limit: usize,
    pub rollback_grace_minutes: u64,
    /// Wall-clock length of one ledger slot.
    pub slot_duration: Duration,
    pub initial_delay: Duration,
    pub fixed_delay: Duration,
}

impl WatchdogConfig {
    /// Grace period expressed in slots.
    pub fn rollback_grace_slots(&self) -> u64 {
        let slot_secs = self.slot_duration.as_secs().max(1);
        self.rollback_grace_minutes.saturating_mul(60) / slot_secs
    }
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            tx_limit: 1000,
            rollback_grace_minutes: 15,
            slot_duration: Duration::from_secs(1),
            initial_delay: Duration::from_secs(60),
            fixed_delay: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EventConfig {
    /// Status updates per emitted event.
    pub chunk_size: usize,
    /// Receipt type attached to status updates.
    pub chain_type: String,
}

impl Default for EventConfig {
    fn default() -> Self {
        Self {
            chunk_size: 100,
            chain_type: "CARDANO_L1".to_string(),
        }
    }
}

/// Full publisher configuration.
#[derive(Debug, Clone, Default)]
pub struct PublisherConfig {
    pub dispatcher: DispatcherConfig,
    pub submission: SubmissionConfig,
    pub watchdog: WatchdogConfig,
    pub events: EventConfig,
}

impl PublisherConfig {
    /// Load configuration from environment variables.
    ///
    /// Variables (defaults in parentheses):
    /// - `CMS_DISPATCHER_PULL_BATCH_SIZE` (50)
    /// - `CMS_DISPATCHER_MAX_TX_BYTES` (16000)
    /// - `CMS_DISPATCHER_INITIAL_DELAY_SECS` (15)
    /// - `CMS_DISPATCHER_FIXED_DELAY_SECS` (10)
    /// - `CMS_DISPATCHER_LATEST_VERSION_ONLY` (true)
    /// - `CMS_SOURCE_ADDRESS` (required)
    /// - `CMS_SUBMISSION_TIMEOUT_SECS` (300)
    /// - `CMS_SUBMISSION_POLL_INTERVAL_SECS` (5)
    /// - `CMS_SUBMISSION_TIMEOUT_POLICY` (keep_submitted)
    /// - `CMS_METADATA_LABEL` (1448)
    /// - `CMS_WATCHDOG_TX_LIMIT` (1000)
    /// - `CMS_WATCHDOG_ROLLBACK_GRACE_MINUTES` (15)
    /// - `CMS_WATCHDOG_SLOT_DURATION_SECS` (1)
    /// - `CMS_WATCHDOG_INITIAL_DELAY_SECS` (60)
    /// - `CMS_WATCHDOG_FIXED_DELAY_SECS` (60)
    /// - `CMS_EVENTS_CHUNK_SIZE` (100)
    /// - `CMS_EVENTS_CHAIN_TYPE` (CARDANO_L1)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Load configuration from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let d = Self::default();
        let env = Env { lookup: &lookup };

        let config = Self {
            dispatcher: DispatcherConfig {
                pull_batch_size: env.parse(
                    "CMS_DISPATCHER_PULL_BATCH_SIZE",
                    d.dispatcher.pull_batch_size,
                )?,
                max_tx_bytes: env.parse("CMS_DISPATCHER_MAX_TX_BYTES", d.dispatcher.max_tx_bytes)?,
                initial_delay: env.secs(
                    "CMS_DISPATCHER_INITIAL_DELAY_SECS",
                    d.dispatcher.initial_delay,
                )?,
                fixed_delay: env.secs("CMS_DISPATCHER_FIXED_DELAY_SECS", d.dispatcher.fixed_delay)?,
                latest_version_only: env.parse(
                    "CMS_DISPATCHER_LATEST_VERSION_ONLY",
                    d.dispatcher.latest_version_only,
                )?,
                source_address: lookup("CMS_SOURCE_ADDRESS").ok_or(ConfigError::MissingVar(
                    "CMS_SOURCE_ADDRESS",
                ))?,
            },
            submission: SubmissionConfig {
                confirmation_timeout: env.secs(
                    "CMS_SUBMISSION_TIMEOUT_SECS",
                    d.submission.confirmation_timeout,
                )?,
                poll_interval: env.secs(
                    "CMS_SUBMISSION_POLL_INTERVAL_SECS",
                    d.submission.poll_interval,
                )?,
                timeout_policy: env.parse(
                    "CMS_SUBMISSION_TIMEOUT_POLICY",
                    d.submission.timeout_policy,
                )?,
                metadata_label: env.parse("CMS_METADATA_LABEL", d.submission.metadata_label)?,
            },
            watchdog: WatchdogConfig {
                tx_limit: env.parse("CMS_WATCHDOG_TX_LIMIT", d.watchdog.tx_limit)?,
                rollback_grace_minutes: env.parse(
                    "CMS_WATCHDOG_ROLLBACK_GRACE_MINUTES",
                    d.watchdog.rollback_grace_minutes,
                )?,
                slot_duration: env.secs(
                    "CMS_WATCHDOG_SLOT_DURATION_SECS",
                    d.watchdog.slot_duration,
                )?,
                initial_delay: env.secs(
                    "CMS_WATCHDOG_INITIAL_DELAY_SECS",
                    d.watchdog.initial_delay,
                )?,
                fixed_delay: env.secs("CMS_WATCHDOG_FIXED_DELAY_SECS", d.watchdog.fixed_delay)?,
            },
            events: EventConfig {
                chunk_size: env.parse("CMS_EVENTS_CHUNK_SIZE", d.events.chunk_size)?,
                chain_type: lookup("CMS_EVENTS_CHAIN_TYPE").unwrap_or(d.events.chain_type),
            },
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject values the pipeline cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("dispatcher.pull_batch_size", self.dispatcher.pull_batch_size),
            ("dispatcher.max_tx_bytes", self.dispatcher.max_tx_bytes),
            ("watchdog.tx_limit", self.watchdog.tx_limit),
            ("events.chunk_size", self.events.chunk_size),
        ];
        if let Some((field, _)) = positive.iter().find(|(_, v)| *v == 0) {
            return Err(ConfigError::Zero(*field));
        }
        if self.watchdog.slot_duration.is_zero() {
            return Err(ConfigError::Zero("watchdog.slot_duration"));
        }
        if self.submission.poll_interval.is_zero() && !self.submission.confirmation_timeout.is_zero()
        {
            return Err(ConfigError::Zero("submission.poll_interval"));
        }
        if self.dispatcher.source_address.trim().is_empty() {
            return Err(ConfigError::MissingVar("CMS_SOURCE_ADDRESS"));
        }
        Ok(())
    }
}

struct Env<'a, F> {
    lookup: &'a F,
}

impl<'a, F> Env<'a, F>
where
    F: Fn(&str) -> Option<String>,
{
    fn parse<T>(&self, var: &'static str, default: T) -> Result<T, ConfigError>
    where
        T: std::str::FromStr,
        T::Err: std::fmt::Display,
    {
        match (self.lookup)(var) {
            None => Ok(default),
            Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
                var,
                value: raw,
                reason: e.to_string(),
            }),
        }
    }

    fn secs(&self, var: &'static str, default: Duration) -> Result<Duration, ConfigError> {
        self.parse(var, default.as_secs()).map(Duration::from_secs)
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} environment variable is required")]
    MissingVar(&'static str),
    #[error("invalid value {value:?} for {var}: {reason}")]
    InvalidValue {
        var: &'static str,
        value: String,
        reason: String,
    },
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |var| map.get(var).cloned()
    }

    #[test]
    fn defaults_match_production_values() {
        let config =
            PublisherConfig::from_lookup(lookup(&[("CMS_SOURCE_ADDRESS", "addr_test1"),])).unwrap();
        assert_eq!(config.dispatcher.pull_batch_size, 50);
        assert_eq!(config.dispatcher.max_tx_bytes, 16_000);
        assert_eq!(config.dispatcher.fixed_delay, Duration::from_secs(10));
        assert_eq!(config.dispatcher.initial_delay, Duration::from_secs(15));
        assert!(config.dispatcher.latest_version_only);
        assert_eq!(config.submission.confirmation_timeout, Duration::from_secs(300));
        assert_eq!(config.submission.poll_interval, Duration::from_secs(5));
        assert_eq!(
            config.submission.timeout_policy,
            ConfirmationTimeoutPolicy::KeepSubmitted
        );
        assert_eq!(config.submission.metadata_label, 1448);
        assert_eq!(config.watchdog.tx_limit, 1000);
        assert_eq!(config.watchdog.rollback_grace_slots(), 900);
        assert_eq!(config.events.chunk_size, 100);
    }

    #[test]
    fn overrides_are_applied() {
        let config = PublisherConfig::from_lookup(lookup(&[
            ("CMS_SOURCE_ADDRESS", "addr_test1"),
            ("CMS_DISPATCHER_PULL_BATCH_SIZE", "7"),
            ("CMS_SUBMISSION_TIMEOUT_POLICY", "revert_to_stored"),
            ("CMS_WATCHDOG_ROLLBACK_GRACE_MINUTES", "2"),
            ("CMS_WATCHDOG_SLOT_DURATION_SECS", "20"),
            ("CMS_DISPATCHER_LATEST_VERSION_ONLY", "false"),
        ]))
        .unwrap();
        assert_eq!(config.dispatcher.pull_batch_size, 7);
        assert!(!config.dispatcher.latest_version_only);
        assert_eq!(
            config.submission.timeout_policy,
            ConfirmationTimeoutPolicy::RevertToStored
        );
        assert_eq!(config.watchdog.rollback_grace_slots(), 6);
    }

    #[test]
    fn missing_source_address_is_rejected() {
        assert!(matches!(
            PublisherConfig::from_lookup(lookup(&[])),
            Err(ConfigError::MissingVar("CMS_SOURCE_ADDRESS"))
        ));
    }

    #[test]
    fn unparseable_and_zero_values_are_rejected() {
        let bad = PublisherConfig::from_lookup(lookup(&[
            ("CMS_SOURCE_ADDRESS", "addr"),
            ("CMS_EVENTS_CHUNK_SIZE", "lots"),
        ]));
        assert!(matches!(bad, Err(ConfigError::InvalidValue { .. })));

        let zero = PublisherConfig::from_lookup(lookup(&[
            ("CMS_SOURCE_ADDRESS", "addr"),
            ("CMS_DISPATCHER_MAX_TX_BYTES", "0"),
        ]));
        assert!(matches!(zero, Err(ConfigError::Zero("dispatcher.max_tx_bytes"))));

        let policy = PublisherConfig::from_lookup(lookup(&[
            ("CMS_SOURCE_ADDRESS", "addr"),
            ("CMS_SUBMISSION_TIMEOUT_POLICY", "retry"),
        ]));
        assert!(matches!(policy, Err(ConfigError::InvalidValue { .. })));
    }
}
