//! Layered configuration
//!
//! Values come from, lowest precedence first: built-in defaults, an optional
//! TOML file (with `${VAR}` / `${VAR:-default}` substituted before parsing),
//! then `HTTPMQ__SECTION__KEY` environment variables. Command line flags are
//! applied on top by the binary.

use std::fmt;
use std::net::{Ipv6Addr, SocketAddr};
use std::path::Path;
use std::sync::OnceLock;

use config::{Environment, File, FileFormat};
use regex::{Captures, Regex};
use serde::Deserialize;

pub use broker::{BrokerConfig, BrokerTlsConfig};
pub use metrics::MetricsConfig;

mod broker;
mod metrics;

#[cfg(test)]
mod tests;

const ENV_PREFIX: &str = "HTTPMQ";

fn cached(cell: &'static OnceLock<Regex>, pattern: &str) -> &'static Regex {
    cell.get_or_init(|| Regex::new(pattern).expect("pattern is a valid regex"))
}

/// `${VAR}` and `${VAR:-default}` inside a config file
fn substitute_env_vars(content: &str) -> String {
    static PLACEHOLDER: OnceLock<Regex> = OnceLock::new();
    let re = cached(&PLACEHOLDER, r"\$\{([^}:]+)(?::-([^}]*))?\}");
    re.replace_all(content, |caps: &Captures| {
        std::env::var(&caps[1])
            .unwrap_or_else(|_| caps.get(2).map_or("", |m| m.as_str()).to_string())
    })
    .into_owned()
}

/// Shell-style `$VAR` / `${VAR}` expansion for paths; unset names become ""
pub fn expand_env(value: &str) -> String {
    static REFERENCE: OnceLock<Regex> = OnceLock::new();
    let re = cached(&REFERENCE, r"\$(?:\{([^}]*)\}|([A-Za-z0-9_]+))");
    re.replace_all(value, |caps: &Captures| {
        let name = caps.get(1).or_else(|| caps.get(2)).map_or("", |m| m.as_str());
        std::env::var(name).unwrap_or_default()
    })
    .into_owned()
}

#[derive(Debug)]
pub enum ConfigError {
    /// Config or password file could not be read
    Io(std::io::Error),
    /// `Config::parse` input is not valid TOML
    Parse(toml::de::Error),
    /// Layered load failed (bad file syntax, env value of the wrong type)
    Config(config::ConfigError),
    /// Values parsed but are inconsistent or out of range
    Validation(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "cannot read file: {}", e),
            ConfigError::Parse(e) => write!(f, "invalid TOML: {}", e),
            ConfigError::Config(e) => write!(f, "{}", e),
            ConfigError::Validation(msg) => f.write_str(msg),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::Io(e) => Some(e),
            ConfigError::Parse(e) => Some(e),
            ConfigError::Config(e) => Some(e),
            ConfigError::Validation(_) => None,
        }
    }
}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<toml::de::Error> for ConfigError {
    fn from(e: toml::de::Error) -> Self {
        ConfigError::Parse(e)
    }
}

impl From<config::ConfigError> for ConfigError {
    fn from(e: config::ConfigError) -> Self {
        ConfigError::Config(e)
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub log: LogConfig,
    pub http: HttpConfig,
    pub broker: BrokerConfig,
    pub metrics: MetricsConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// error, warn, info, debug or trace; `RUST_LOG` overrides it
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

/// Front-end listener
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HttpConfig {
    pub bind: SocketAddr,
    /// Joined in front of the request path to build the topic
    pub prefix: String,
    /// Largest body accepted, in bytes; 0 accepts any size
    pub max_body_size: usize,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from((Ipv6Addr::LOCALHOST, 8080)),
            prefix: "/".to_string(),
            max_body_size: 0,
        }
    }
}

const LOG_LEVELS: [&str; 5] = ["error", "warn", "info", "debug", "trace"];

impl Config {
    /// Build the layered configuration from `path` and the environment.
    ///
    /// Environment keys use `__` both after the prefix and between
    /// sections, so single underscores stay inside field names:
    /// `HTTPMQ__BROKER__PUBLISH_TIMEOUT=5s` sets `broker.publish_timeout`.
    ///
    /// A missing file leaves the defaults in place.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder();

        match std::fs::read_to_string(path.as_ref()) {
            Ok(content) => {
                let content = substitute_env_vars(&content);
                builder = builder.add_source(File::from_str(&content, FileFormat::Toml));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        let env = Environment::with_prefix(ENV_PREFIX)
            .prefix_separator("__")
            .separator("__")
            .try_parsing(true);

        let config: Config = builder.add_source(env).build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults plus environment overrides
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(Path::new(""))
    }

    /// Parse TOML text directly, without substitution or environment layers
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.broker.validate()?;

        let level = self.log.level.to_lowercase();
        if !LOG_LEVELS.contains(&level.as_str()) {
            return Err(ConfigError::Validation(format!(
                "log.level must be one of {}, got '{}'",
                LOG_LEVELS.join(", "),
                self.log.level
            )));
        }
        Ok(())
    }
}
