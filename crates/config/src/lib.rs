//! Configuration for the dynamic TLS listener.
//!
//! The configuration is a TOML file with four sections:
//!
//! ```toml
//! [listener]
//! address = "0.0.0.0:8443"
//! sans = ["localhost", "127.0.0.1"]
//!
//! [ca]
//! cert_file = "/var/lib/dynlistener/ca.crt"
//! key_file = "/var/lib/dynlistener/ca.key"
//!
//! [storage]
//! type = "file"
//! path = "/var/lib/dynlistener/serving.json"
//!
//! [logging]
//! level = "info"
//! format = "json"
//! ```
//!
//! Parsing only checks syntax; call [`Config::validate_all`] for schema
//! rules, cross-field checks, CA file checks and lints.

use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;
use validator::Validate;

pub mod validate;

pub use validate::{ErrorCategory, ValidationError, ValidationResult, ValidationWarning};

/// Default serving certificate common name
pub const DEFAULT_COMMON_NAME: &str = "dynamic";
/// Default serving certificate organization
pub const DEFAULT_ORGANIZATION: &str = "dynamic";
/// Default CA common name
pub const DEFAULT_CA_COMMON_NAME: &str = "dynamiclistener-ca";
/// Default CA organization
pub const DEFAULT_CA_ORGANIZATION: &str = "dynamiclistener-org";
/// Default renewal window in days
pub const DEFAULT_EXPIRATION_DAYS_CHECK: u32 = 30;

/// Errors raised while loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration: {}", format_errors(.0))]
    Invalid(Vec<ValidationError>),
}

fn format_errors(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct Config {
    #[validate(nested)]
    pub listener: ListenerConfig,

    #[serde(default)]
    #[validate(nested)]
    pub ca: CaConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    #[validate(nested)]
    pub logging: LoggingConfig,
}

/// HTTPS listener and serving certificate settings.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct ListenerConfig {
    /// Socket address to bind, e.g. `0.0.0.0:8443`
    #[validate(custom(function = "validate_socket_addr"))]
    pub address: String,

    #[serde(default = "default_common_name")]
    #[validate(length(min = 1, max = 64))]
    pub common_name: String,

    #[serde(default = "default_organization")]
    pub organization: Vec<String>,

    /// Names and IPs always present on the serving certificate
    #[serde(default)]
    pub sans: Vec<String>,

    /// Cap on accumulated SANs; 0 means unlimited
    #[serde(default)]
    pub max_sans: usize,

    /// Renew when the certificate expires within this many days; 0 disables
    #[serde(default = "default_expiration_days_check")]
    #[validate(range(max = 3650))]
    pub expiration_days_check: u32,

    #[serde(default)]
    pub close_conn_on_cert_change: bool,

    /// Names allowed onto the certificate besides `sans`; empty allows all
    #[serde(default)]
    pub allowed_names: Vec<String>,

    /// Plaintext listener redirecting to HTTPS
    #[serde(default)]
    #[validate(custom(function = "validate_socket_addr"))]
    pub redirect_address: Option<String>,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            address: "0.0.0.0:8443".to_string(),
            common_name: default_common_name(),
            organization: default_organization(),
            sans: Vec::new(),
            max_sans: 0,
            expiration_days_check: DEFAULT_EXPIRATION_DAYS_CHECK,
            close_conn_on_cert_change: false,
            allowed_names: Vec::new(),
            redirect_address: None,
        }
    }
}

/// Certificate authority settings.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct CaConfig {
    #[serde(default = "default_ca_common_name")]
    #[validate(length(min = 1, max = 64))]
    pub common_name: String,

    #[serde(default = "default_ca_organization")]
    #[validate(length(min = 1))]
    pub organization: String,

    /// CA certificate PEM; generated here when missing
    #[serde(default)]
    pub cert_file: Option<PathBuf>,

    /// CA private key PEM; generated here when missing
    #[serde(default)]
    pub key_file: Option<PathBuf>,
}

impl Default for CaConfig {
    fn default() -> Self {
        Self {
            common_name: default_ca_common_name(),
            organization: default_ca_organization(),
            cert_file: None,
            key_file: None,
        }
    }
}

/// Where the serving record is persisted.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum StorageConfig {
    /// Process memory only; lost on restart
    #[default]
    Memory,
    /// JSON file on local disk
    File { path: PathBuf },
    /// Kubernetes `kubernetes.io/tls` Secret
    Kubernetes { namespace: String, name: String },
}

/// Log output settings.
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(deny_unknown_fields)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    #[validate(custom(function = "validate_log_level"))]
    pub level: String,

    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

fn default_common_name() -> String {
    DEFAULT_COMMON_NAME.to_string()
}

fn default_organization() -> Vec<String> {
    vec![DEFAULT_ORGANIZATION.to_string()]
}

fn default_ca_common_name() -> String {
    DEFAULT_CA_COMMON_NAME.to_string()
}

fn default_ca_organization() -> String {
    DEFAULT_CA_ORGANIZATION.to_string()
}

fn default_expiration_days_check() -> u32 {
    DEFAULT_EXPIRATION_DAYS_CHECK
}

fn default_log_level() -> String {
    "info".to_string()
}

fn validate_socket_addr(address: &str) -> Result<(), validator::ValidationError> {
    address.parse::<SocketAddr>().map(|_| ()).map_err(|_| {
        let mut err = validator::ValidationError::new("socket_addr");
        err.message = Some(format!("'{}' is not a socket address", address).into());
        err
    })
}

fn validate_log_level(level: &str) -> Result<(), validator::ValidationError> {
    match level.to_ascii_lowercase().as_str() {
        "trace" | "debug" | "info" | "warn" | "error" => Ok(()),
        _ => {
            let mut err = validator::ValidationError::new("log_level");
            err.message = Some(format!("unknown log level '{}'", level).into());
            Err(err)
        }
    }
}

impl Config {
    /// Parse configuration from TOML text.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(content)?)
    }

    /// Read and parse a configuration file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_toml_str(&content)?;
        debug!(path = %path.display(), "Loaded configuration");
        Ok(config)
    }

    /// Read a configuration file and reject it if validation finds errors.
    pub fn load(path: impl AsRef<Path>) -> Result<(Self, Vec<ValidationWarning>), ConfigError> {
        let config = Self::from_file(path)?;
        let result = config.validate_all();
        if result.has_errors() {
            return Err(ConfigError::Invalid(result.errors));
        }
        Ok((config, result.warnings))
    }

    /// Run every validation pass and collect the findings.
    pub fn validate_all(&self) -> ValidationResult {
        let mut result = ValidationResult::new();
        result.merge(validate::schema::validate_schema(self));
        result.merge(validate::schema::validate_cross_field(self));
        result.merge(validate::certs::validate_ca_files(self));
        result.merge(validate::lint::lint_config(self));
        result
    }
}
