// Layered runtime configuration.
//
// Precedence, lowest to highest: built-in defaults, a TOML file with nested
// sections, then environment variables of the form JOBMON__SECTION__KEY.
// The env overlay merges with the file rather than replacing sections, and
// a nested env assignment shadows a primitive file value for the same key.

use std::path::Path;

use figment::providers::{Format, Serialized, Toml};
use figment::value::{Dict, Map, Tag, Value};
use figment::{Figment, Metadata, Profile, Provider};
use serde::{Deserialize, Serialize};

use crate::error::{JobmonError, Result};

pub const ENV_PREFIX: &str = "JOBMON__";
pub const DEFAULT_CONFIG_FILE: &str = "jobmon.toml";

/// The API version the distributor targets. Every deployment must expose it.
pub const AUTHORITATIVE_API_VERSION: &str = "v3";

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerConfig {
    pub bind_address: String,
    /// API versions to mount, e.g. ["v2", "v3"]. Must include v3.
    pub api_versions: Vec<String>,
    /// Conflict retry policy advertised to clients
    pub retry_attempts: u32,
    pub retry_jitter_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:9100".to_string(),
            api_versions: vec![AUTHORITATIVE_API_VERSION.to_string()],
            retry_attempts: 3,
            retry_jitter_ms: 250,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DbConfig {
    pub database_uri: String,
    pub pool_size: u32,
    pub max_overflow: u32,
    pub pool_timeout_seconds: u64,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            database_uri: "postgres://localhost/jobmon".to_string(),
            pool_size: 10,
            max_overflow: 5,
            pool_timeout_seconds: 30,
        }
    }
}

impl DbConfig {
    /// The pool is sized as base + overflow; sqlx has a single ceiling.
    pub fn max_connections(&self) -> u32 {
        self.pool_size + self.max_overflow
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AuthConfig {
    /// When disabled, every request runs as "anonymous" and nothing is gated.
    pub enabled: bool,
    /// Identities allowed to act on workflows they do not own.
    pub admin_group: Vec<String>,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            admin_group: Vec::new(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ReaperConfig {
    pub enabled: bool,
    /// Minutes between sweeps; minimum 1.
    pub poll_interval_minutes: u64,
    /// Grace = multiplier x poll interval; minimum 2.
    pub grace_period_multiplier: u64,
}

impl Default for ReaperConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            poll_interval_minutes: 5,
            grace_period_multiplier: 3,
        }
    }
}

impl ReaperConfig {
    pub fn poll_interval(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.poll_interval_minutes * 60)
    }

    /// How stale a workflow-run heartbeat may be before the run is reaped.
    pub fn grace_period(&self) -> chrono::Duration {
        chrono::Duration::minutes((self.poll_interval_minutes * self.grace_period_multiplier) as i64)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DistributorConfig {
    /// Seconds the parent waits for the readiness marker on stdout.
    pub startup_timeout_seconds: u64,
    pub poll_interval_seconds: u64,
    pub heartbeat_interval_seconds: u64,
    /// Per-call ceiling on cluster plugin RPCs.
    pub submit_timeout_seconds: u64,
    /// Maximum ids per bulk API call.
    pub task_instance_batch_size: usize,
    /// Worker heartbeat allowance handed to launched instances, in seconds.
    pub report_by_buffer_seconds: i64,
}

impl Default for DistributorConfig {
    fn default() -> Self {
        Self {
            startup_timeout_seconds: 60,
            poll_interval_seconds: 10,
            heartbeat_interval_seconds: 30,
            submit_timeout_seconds: 120,
            task_instance_batch_size: 500,
            report_by_buffer_seconds: 300,
        }
    }
}

/// Root configuration for every jobmon binary.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct JobmonConfig {
    pub server: ServerConfig,
    pub db: DbConfig,
    pub auth: AuthConfig,
    pub reaper: ReaperConfig,
    pub distributor: DistributorConfig,
}

impl JobmonConfig {
    /// Load configuration: defaults, then the TOML file (if present), then
    /// the JOBMON__SECTION__KEY environment overlay.
    pub fn load(config_path: Option<&Path>) -> Result<Self> {
        let file = config_path
            .map(Toml::file)
            .unwrap_or_else(|| Toml::file(DEFAULT_CONFIG_FILE));

        let config: JobmonConfig = Figment::from(Serialized::defaults(JobmonConfig::default()))
            .merge(file)
            .merge(EnvOverlay)
            .extract()
            .map_err(|e| JobmonError::config(e.to_string()))?;

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<()> {
        if self.reaper.poll_interval_minutes < 1 {
            return Err(JobmonError::config(
                "reaper.poll_interval_minutes must be at least 1",
            ));
        }
        if self.reaper.grace_period_multiplier < 2 {
            return Err(JobmonError::config(
                "reaper.grace_period_multiplier must be at least 2",
            ));
        }
        if !self
            .server
            .api_versions
            .iter()
            .any(|v| v == AUTHORITATIVE_API_VERSION)
        {
            return Err(JobmonError::config(format!(
                "server.api_versions must include {}",
                AUTHORITATIVE_API_VERSION
            )));
        }
        Ok(())
    }
}

/// Environment overlay for JOBMON__SECTION__KEY variables.
///
/// Keys are processed in sorted order, so a nested assignment always lands
/// after the primitive it conflicts with: the primitive is promoted to a
/// mapping and the nested value wins.
struct EnvOverlay;

impl Provider for EnvOverlay {
    fn metadata(&self) -> Metadata {
        Metadata::named("JOBMON__ environment variables")
    }

    fn data(&self) -> std::result::Result<Map<Profile, Dict>, figment::Error> {
        let mut vars: Vec<(String, String)> = std::env::vars()
            .filter_map(|(key, value)| {
                key.strip_prefix(ENV_PREFIX)
                    .map(|rest| (rest.to_lowercase(), value))
            })
            .collect();
        vars.sort();

        let mut root = Dict::new();
        for (key, raw) in vars {
            let path: Vec<&str> = key.split("__").collect();
            let value: Value = raw.parse().expect("scalar parsing is infallible");
            insert_path(&mut root, &path, value);
        }

        Ok(Map::from([(Profile::Default, root)]))
    }
}

fn insert_path(dict: &mut Dict, path: &[&str], value: Value) {
    match path {
        [] => {}
        [leaf] => {
            dict.insert((*leaf).to_string(), value);
        }
        [head, rest @ ..] => {
            let entry = dict
                .entry((*head).to_string())
                .or_insert_with(|| Value::Dict(Tag::Default, Dict::new()));
            // A primitive in the way of a nested assignment is promoted to
            // a mapping; the nested value wins.
            if !matches!(entry, Value::Dict(..)) {
                *entry = Value::Dict(Tag::Default, Dict::new());
            }
            if let Value::Dict(_, inner) = entry {
                insert_path(inner, rest, value);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_validate() {
        let config = JobmonConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.db.max_connections(), 15);
    }

    #[test]
    fn env_overlay_merges_with_file_values() {
        // File sets auth.enabled and db.database_uri; env overrides one auth
        // key and adds a db key. Both sources must survive in the merge.
        figment::Jail::expect_with(|jail| {
            jail.create_file(
                "jobmon.toml",
                r#"
                [auth]
                enabled = true

                [db]
                database_uri = "postgres://db-host/jobmon"
                "#,
            )?;
            jail.set_env("JOBMON__AUTH__ENABLED", "false");
            jail.set_env("JOBMON__DB__POOL_SIZE", "20");

            let config = JobmonConfig::load(None).expect("config should load");
            assert!(!config.auth.enabled);
            assert_eq!(config.db.database_uri, "postgres://db-host/jobmon");
            // integer, not a string, after the env overlay
            assert_eq!(config.db.pool_size, 20);
            Ok(())
        });
    }

    #[test]
    fn file_integers_stay_integers() {
        figment::Jail::expect_with(|jail| {
            jail.create_file(
                "jobmon.toml",
                r#"
                [db]
                pool_size = 7
                pool_timeout_seconds = 12

                [reaper]
                poll_interval_minutes = 2
                grace_period_multiplier = 4
                "#,
            )?;

            let config = JobmonConfig::load(None).expect("config should load");
            assert_eq!(config.db.pool_size, 7);
            assert_eq!(config.db.pool_timeout_seconds, 12);
            assert_eq!(config.reaper.grace_period(), chrono::Duration::minutes(8));
            Ok(())
        });
    }

    #[test]
    fn nested_env_assignment_wins_over_primitive() {
        figment::Jail::expect_with(|jail| {
            // A primitive assignment to the whole section followed by a
            // nested key: the nested one must win and extraction succeed.
            jail.set_env("JOBMON__AUTH", "foo");
            jail.set_env("JOBMON__AUTH__ENABLED", "true");

            let config = JobmonConfig::load(None).expect("config should load");
            assert!(config.auth.enabled);
            Ok(())
        });
    }

    #[test]
    fn reaper_bounds_are_enforced() {
        figment::Jail::expect_with(|jail| {
            jail.set_env("JOBMON__REAPER__GRACE_PERIOD_MULTIPLIER", "1");
            assert!(JobmonConfig::load(None).is_err());
            Ok(())
        });
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        figment::Jail::expect_with(|_jail| {
            let config = JobmonConfig::load(None).expect("config should load");
            assert_eq!(config.server.api_versions, vec!["v3".to_string()]);
            assert!(config.auth.enabled);
            Ok(())
        });
    }
}
