//! Server configuration loaded from environment variables.

use std::str::FromStr;
use std::time::Duration;

use actors::RegistryConfig;
use db::DbConfig;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{var} must be {expected}, got '{value}'")]
    Invalid {
        var: &'static str,
        expected: &'static str,
        value: String,
    },

    #[error("{0} is set but {1} is not")]
    Incomplete(&'static str, &'static str),
}

/// Everything `fleetd` needs to start.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub db: DbConfig,
    pub registry: RegistryConfig,
}

impl ServerConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                   | Default    |
    /// |---------------------------|------------|
    /// | `FLEET_DB_ENDPOINT`       | `mem://`   |
    /// | `FLEET_DB_NAMESPACE`      | `fleet`    |
    /// | `FLEET_DB_DATABASE`       | `catalog`  |
    /// | `FLEET_DB_USERNAME`       | unset      |
    /// | `FLEET_DB_PASSWORD`       | unset      |
    /// | `FLEET_TICK_SECS`         | `10`       |
    /// | `FLEET_LOOP_SECS`         | `5`        |
    /// | `FLEET_DISPATCH_ATTEMPTS` | `10`       |
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut db = DbConfig::default();
        if let Some(endpoint) = lookup("FLEET_DB_ENDPOINT") {
            db = db.with_endpoint(endpoint);
        }
        if let Some(namespace) = lookup("FLEET_DB_NAMESPACE") {
            db = db.with_namespace(namespace);
        }
        if let Some(database) = lookup("FLEET_DB_DATABASE") {
            db = db.with_database(database);
        }
        match (lookup("FLEET_DB_USERNAME"), lookup("FLEET_DB_PASSWORD")) {
            (Some(user), Some(pass)) => db = db.with_credentials(user, pass),
            (Some(_), None) => {
                return Err(ConfigError::Incomplete("FLEET_DB_USERNAME", "FLEET_DB_PASSWORD"));
            }
            (None, Some(_)) => {
                return Err(ConfigError::Incomplete("FLEET_DB_PASSWORD", "FLEET_DB_USERNAME"));
            }
            (None, None) => {}
        }

        let mut registry = RegistryConfig::default();
        if let Some(secs) = parse::<u64>(&lookup, "FLEET_TICK_SECS", "a whole number of seconds")? {
            registry = registry.with_tick_interval(Duration::from_secs(secs.max(1)));
        }
        if let Some(secs) = parse::<u64>(&lookup, "FLEET_LOOP_SECS", "a whole number of seconds")? {
            registry = registry.with_loop_interval(Duration::from_secs(secs.max(1)));
        }
        if let Some(attempts) =
            parse::<usize>(&lookup, "FLEET_DISPATCH_ATTEMPTS", "a positive integer")?
        {
            registry = registry.with_dispatch_attempts(attempts);
        }

        Ok(Self { db, registry })
    }
}

fn parse<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    var: &'static str,
    expected: &'static str,
) -> Result<Option<T>, ConfigError> {
    let Some(value) = lookup(var) else {
        return Ok(None);
    };
    value
        .trim()
        .parse()
        .map(Some)
        .map_err(|_| ConfigError::Invalid {
            var,
            expected,
            value,
        })
}
