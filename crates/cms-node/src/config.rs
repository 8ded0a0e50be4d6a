//! Node-level settings that sit outside the publisher pipeline.
//!
//! Variables (defaults in parentheses):
//! - `CMS_HTTP_PORT` (8080)
//! - `CMS_ORGANISATIONS` (unset: discover senders from the store)
//! - `CMS_LOG_FORMAT` (`text`; `json` for one JSON object per line)
//! - `DATABASE_URL` (unset: in-memory store)
//! - `CMS_DB_MAX_CONNECTIONS` (20), `CMS_DB_MIN_CONNECTIONS` (2)
//! - `CMS_DB_ACQUIRE_TIMEOUT_SECS` (5)

use std::time::Duration;

use cms_core::OrganisationId;
use cms_publisher::{ConfigError, OrganisationSource};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Postgres pool settings. Present only when `DATABASE_URL` is set.
#[derive(Clone, PartialEq, Eq)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub acquire_timeout: Duration,
}

impl std::fmt::Debug for DatabaseConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // The URL usually carries the password.
        f.debug_struct("DatabaseConfig")
            .field("url", &"[REDACTED]")
            .field("max_connections", &self.max_connections)
            .field("min_connections", &self.min_connections)
            .field("acquire_timeout", &self.acquire_timeout)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct NodeConfig {
    pub http_port: u16,
    pub organisations: OrganisationSource,
    pub log_format: LogFormat,
    pub database: Option<DatabaseConfig>,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            http_port: 8080,
            organisations: OrganisationSource::Discovered,
            log_format: LogFormat::Text,
            database: None,
        }
    }
}

fn parse_var<F, T>(lookup: &F, var: &'static str, default: T) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(var) {
        None => Ok(default),
        Some(raw) => raw.trim().parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            var,
            value: raw.clone(),
            reason: e.to_string(),
        }),
    }
}

impl NodeConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        config.http_port = parse_var(&lookup, "CMS_HTTP_PORT", config.http_port)?;

        if let Some(raw) = lookup("CMS_ORGANISATIONS") {
            let ids = raw
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(|s| {
                    OrganisationId::new(s).map_err(|e| ConfigError::InvalidValue {
                        var: "CMS_ORGANISATIONS",
                        value: raw.clone(),
                        reason: e.to_string(),
                    })
                })
                .collect::<Result<Vec<_>, _>>()?;
            if !ids.is_empty() {
                config.organisations = OrganisationSource::Static(ids);
            }
        }

        config.log_format = match lookup("CMS_LOG_FORMAT").as_deref().map(str::trim) {
            None | Some("") | Some("text") => LogFormat::Text,
            Some("json") => LogFormat::Json,
            Some(other) => {
                return Err(ConfigError::InvalidValue {
                    var: "CMS_LOG_FORMAT",
                    value: other.to_string(),
                    reason: "expected text or json".into(),
                })
            }
        };

        if let Some(url) = lookup("DATABASE_URL").filter(|url| !url.trim().is_empty()) {
            let database = DatabaseConfig {
                url,
                max_connections: parse_var(&lookup, "CMS_DB_MAX_CONNECTIONS", 20)?,
                min_connections: parse_var(&lookup, "CMS_DB_MIN_CONNECTIONS", 2)?,
                acquire_timeout: Duration::from_secs(parse_var(
                    &lookup,
                    "CMS_DB_ACQUIRE_TIMEOUT_SECS",
                    5,
                )?),
            };
            if database.max_connections == 0 || database.min_connections > database.max_connections
            {
                return Err(ConfigError::InvalidValue {
                    var: "CMS_DB_MIN_CONNECTIONS",
                    value: database.min_connections.to_string(),
                    reason: format!(
                        "must not exceed a non-zero CMS_DB_MAX_CONNECTIONS ({})",
                        database.max_connections
                    ),
                });
            }
            config.database = Some(database);
        }

        Ok(config)
    }
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
    fn defaults_discover_organisations() {
        let config = NodeConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.http_port, 8080);
        assert!(matches!(config.organisations, OrganisationSource::Discovered));
        assert_eq!(config.log_format, LogFormat::Text);
        assert!(config.database.is_none());
    }

    #[test]
    fn database_settings_follow_the_url() {
        let config = NodeConfig::from_lookup(lookup(&[
            ("DATABASE_URL", "postgres://cms:hunter2@db/cms"),
            ("CMS_DB_MAX_CONNECTIONS", "8"),
        ]))
        .unwrap();
        let database = config.database.unwrap();
        assert_eq!(database.max_connections, 8);
        assert_eq!(database.min_connections, 2);
        assert_eq!(database.acquire_timeout, Duration::from_secs(5));
        assert!(!format!("{database:?}").contains("hunter2"));

        // Pool settings without a URL are ignored.
        let config =
            NodeConfig::from_lookup(lookup(&[("CMS_DB_MAX_CONNECTIONS", "8")])).unwrap();
        assert!(config.database.is_none());
    }

    #[test]
    fn organisation_list_is_trimmed() {
        let config = NodeConfig::from_lookup(lookup(&[
            ("CMS_ORGANISATIONS", " org-a, org-b ,,"),
            ("CMS_HTTP_PORT", "9100"),
            ("CMS_LOG_FORMAT", "json"),
        ]))
        .unwrap();
        assert_eq!(config.http_port, 9100);
        assert_eq!(config.log_format, LogFormat::Json);
        match config.organisations {
            OrganisationSource::Static(ids) => {
                let names: Vec<_> = ids.iter().map(|id| id.as_str()).collect();
                assert_eq!(names, ["org-a", "org-b"]);
            }
            other => panic!("expected a static list, got {other:?}"),
        }
    }

    #[test]
    fn invalid_values_are_rejected() {
        assert!(NodeConfig::from_lookup(lookup(&[("CMS_HTTP_PORT", "http")])).is_err());
        assert!(NodeConfig::from_lookup(lookup(&[("CMS_ORGANISATIONS", "a::b")])).is_err());
        assert!(NodeConfig::from_lookup(lookup(&[("CMS_LOG_FORMAT", "xml")])).is_err());
        assert!(NodeConfig::from_lookup(lookup(&[
            ("DATABASE_URL", "postgres://db/cms"),
            ("CMS_DB_MIN_CONNECTIONS", "30"),
        ]))
        .is_err());
    }
}
