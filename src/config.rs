//! Configuration for the consolidation daemon.
//!
//! Loaded with precedence: CLI overrides > `CUSTMASTER_`-prefixed environment
//! variables > config file > defaults.
//!
//! # Example config file (custmaster.toml)
//! ```toml
//! listen = "0.0.0.0:50051"
//! crm_listen = "0.0.0.0:8081"
//! phone_region = "AT"
//!
//! [database]
//! path = "/var/lib/custmaster"
//! lock_ttl_secs = 300
//!
//! [priorities]
//! user = 2
//! vetinf = 1
//! carddav = 0
//! ```

use figment::providers::{Env, Format, Serialized, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;

/// Main daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// gRPC listen address.
    pub listen: SocketAddr,
    /// HTTP listen address for the CRM lookup endpoint.
    pub crm_listen: SocketAddr,
    /// Default region for phone numbers written without a country prefix.
    pub phone_region: String,
    /// Origins allowed to call the HTTP surface.
    pub allowed_origins: Vec<String>,
    /// When set, the authentication layer is bypassed. Also enabled by a
    /// non-empty `DEBUG` environment variable.
    pub debug: bool,
    pub database: DatabaseConfig,
    /// Importer priority ranks; higher wins. Unlisted importers rank 0.
    pub priorities: HashMap<String, i32>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:50051".parse().unwrap(),
            crm_listen: "0.0.0.0:8081".parse().unwrap(),
            phone_region: "AT".to_string(),
            allowed_origins: Vec::new(),
            debug: false,
            database: DatabaseConfig::default(),
            priorities: HashMap::from([
                ("user".to_string(), 2),
                ("vetinf".to_string(), 1),
                ("carddav".to_string(), 0),
            ]),
        }
    }
}

/// Persistence settings. Without a path the daemon runs on the in-memory
/// backend and data is lost across restarts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: Option<PathBuf>,
    /// Advisory locks older than this are reclaimed.
    pub lock_ttl_secs: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: None,
            lock_ttl_secs: 300,
        }
    }
}

/// CLI overrides applied on top of file and environment.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConfigOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub listen: Option<SocketAddr>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub crm_listen: Option<SocketAddr>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phone_region: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub debug: Option<bool>,
}

impl Config {
    /// Load configuration with precedence: CLI args > Env > File > Defaults.
    pub fn load(config_path: Option<&str>, overrides: ConfigOverrides) -> Result<Self, ConfigError> {
        let mut figment = Figment::new().merge(Serialized::defaults(Config::default()));

        if let Some(path) = config_path {
            figment = figment.merge(Toml::file(path));
        }

        // Double underscore separates nesting levels so that field names may
        // themselves contain underscores (CUSTMASTER_DATABASE__PATH).
        figment = figment.merge(Env::prefixed("CUSTMASTER_").split("__"));
        figment = figment.merge(Serialized::defaults(overrides));

        let mut config: Config = figment.extract().map_err(ConfigError::from)?;

        // The plain DEBUG variable bypasses auth when non-empty.
        if std::env::var("DEBUG").map(|v| !v.is_empty()).unwrap_or(false) {
            config.debug = true;
        }

        Ok(config)
    }

    /// Load from environment and optional config file only.
    pub fn from_env(config_path: Option<&str>) -> Result<Self, ConfigError> {
        Self::load(config_path, ConfigOverrides::default())
    }

    pub fn lock_ttl(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.database.lock_ttl_secs)
    }
}

/// Configuration error.
#[derive(Debug)]
pub struct ConfigError {
    pub message: String,
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "configuration error: {}", self.message)
    }
}

impl std::error::Error for ConfigError {}

impl From<figment::Error> for ConfigError {
    fn from(e: figment::Error) -> Self {
        Self {
            message: e.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = Config::default();

        assert_eq!(config.phone_region, "AT");
        assert!(config.database.path.is_none());
        assert_eq!(config.priorities.get("user"), Some(&2));
        assert_eq!(config.priorities.get("carddav"), Some(&0));
    }

    #[test]
    fn test_file_and_overrides_layering() {
        figment::Jail::expect_with(|jail| {
            jail.create_file(
                "custmaster.toml",
                r#"
                    phone_region = "DE"

                    [database]
                    path = "/tmp/db"
                    lock_ttl_secs = 60
                "#,
            )?;

            let overrides = ConfigOverrides {
                phone_region: Some("CH".to_string()),
                ..Default::default()
            };
            let config = Config::load(Some("custmaster.toml"), overrides).expect("load");

            // CLI override beats the file, file beats defaults.
            assert_eq!(config.phone_region, "CH");
            assert_eq!(config.database.path, Some(PathBuf::from("/tmp/db")));
            assert_eq!(config.lock_ttl().as_secs(), 60);

            Ok(())
        });
    }

    #[test]
    fn test_debug_env_variable() {
        figment::Jail::expect_with(|jail| {
            jail.set_env("DEBUG", "1");
            let config = Config::from_env(None).expect("load");
            assert!(config.debug);
            Ok(())
        });
    }
}
