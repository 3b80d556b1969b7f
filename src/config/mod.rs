//! Client configuration
//!
//! Two immutable records are resolved from a single flat key-value source:
//! the control-plane config (discovery/assignment HTTP) and the combiner
//! config (gRPC channel). The source is typically a flat TOML file; unknown
//! keys are ignored.
//!
//! ## Keys
//!
//! Required: `discover_host`, `client_id`, `name`.
//! Optional: `token`, `auth_scheme` (`"Bearer"` | `"Token"`), `insecure`
//! (`"true"` | `"false"`), `package`, `preferred_combiner`, `combiner`
//! (pre-pins the combiner host, bypassing assignment), `proxy_server`.

use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::str::FromStr;

/// Flat key-value configuration source.
pub type ConfigMap = BTreeMap<String, String>;

/// Configuration validation errors. Fatal to startup.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("missing required config key '{0}'")]
    MissingKey(&'static str),
    #[error("config key '{key}' has invalid value '{value}': {reason}")]
    InvalidValue {
        key: &'static str,
        value: String,
        reason: &'static str,
    },
    #[error("config key 'token' is present but empty")]
    EmptyToken,
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: toml::de::Error,
    },
}

/// Authorization scheme used for both the assignment request and the
/// per-call gRPC metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AuthScheme {
    #[default]
    Bearer,
    Token,
}

impl FromStr for AuthScheme {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Bearer" => Ok(Self::Bearer),
            "Token" => Ok(Self::Token),
            _ => Err(()),
        }
    }
}

impl fmt::Display for AuthScheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Bearer => write!(f, "Bearer"),
            Self::Token => write!(f, "Token"),
        }
    }
}

/// Control-plane configuration. Immutable after resolution.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// HTTP(S) origin of the discovery service, derived from `discover_host`.
    pub api_url: String,
    /// Auth token, possibly empty.
    pub token: String,
    /// Stable opaque client identifier.
    pub client_id: String,
    /// Human label, not unique.
    pub name: String,
    /// Package selector forwarded to the controller.
    pub package: String,
    /// Optional combiner routing hint.
    pub preferred_combiner: String,
    /// Plaintext mode; also selects the `http` scheme for `api_url`.
    pub insecure: bool,
}

impl ControllerConfig {
    /// Resolve the control-plane record from a flat config source.
    pub fn resolve(map: &ConfigMap) -> Result<Self, ConfigError> {
        let insecure = parse_flag(map, "insecure")?.unwrap_or(false);

        let discover_host = required(map, "discover_host")?;
        let scheme = if insecure { "http" } else { "https" };
        let api_url = format!("{scheme}://{discover_host}");

        Ok(Self {
            api_url,
            token: optional_token(map)?,
            client_id: required(map, "client_id")?,
            name: required(map, "name")?,
            package: map
                .get("package")
                .cloned()
                .unwrap_or_else(|| "remote".to_string()),
            preferred_combiner: map.get("preferred_combiner").cloned().unwrap_or_default(),
            insecure,
        })
    }
}

/// Combiner channel configuration. Mutable only through
/// [`CombinerConfig::apply_assignment`].
#[derive(Debug, Clone)]
pub struct CombinerConfig {
    /// Target endpoint: `host:port` in insecure mode, bare host for TLS.
    /// Empty until pre-pinned via the `combiner` key or assignment.
    pub host: String,
    /// When set, the channel dials this host while the true combiner host
    /// travels in the `grpc-server` metadata.
    pub proxy_host: Option<String>,
    /// Auth token shared with the control-plane config.
    pub token: String,
    /// Scheme for the `authorization` metadata value.
    pub auth_scheme: AuthScheme,
    /// Plaintext channel, no credentials.
    pub insecure: bool,
}

impl CombinerConfig {
    /// Resolve the combiner record from a flat config source.
    pub fn resolve(map: &ConfigMap) -> Result<Self, ConfigError> {
        let auth_scheme = match map.get("auth_scheme") {
            Some(raw) => raw.parse().map_err(|()| ConfigError::InvalidValue {
                key: "auth_scheme",
                value: raw.clone(),
                reason: "expected \"Bearer\" or \"Token\"",
            })?,
            None => AuthScheme::default(),
        };

        Ok(Self {
            host: map.get("combiner").cloned().unwrap_or_default(),
            proxy_host: non_empty(map.get("proxy_server")),
            token: optional_token(map)?,
            auth_scheme,
            insecure: parse_flag(map, "insecure")?.unwrap_or(false),
        })
    }

    /// Whether a combiner host is already known (pre-pinned or assigned).
    pub fn is_assigned(&self) -> bool {
        !self.host.is_empty()
    }

    /// Apply a controller assignment. In insecure mode the endpoint carries
    /// an explicit port; for TLS the bare host is dialed on the default
    /// port. An empty `fqdn` leaves the proxy unset.
    pub fn apply_assignment(&mut self, host: &str, fqdn: Option<&str>, port: Option<u16>) {
        self.host = match (self.insecure, port) {
            (true, Some(port)) => format!("{host}:{port}"),
            _ => host.to_string(),
        };
        self.proxy_host = non_empty(fqdn.map(str::to_string).as_ref());
    }
}

/// Load a flat config map from a TOML file. Only top-level scalar values
/// participate; nested tables, arrays and unknown keys are ignored.
pub fn load_config_map(path: &Path) -> Result<ConfigMap, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.display().to_string(),
        source,
    })?;
    let value: toml::Value = raw.parse().map_err(|source| ConfigError::Parse {
        path: path.display().to_string(),
        source,
    })?;

    let mut map = ConfigMap::new();
    if let toml::Value::Table(table) = value {
        for (key, val) in table {
            let rendered = match val {
                toml::Value::String(s) => s,
                toml::Value::Boolean(b) => b.to_string(),
                toml::Value::Integer(i) => i.to_string(),
                toml::Value::Float(f) => f.to_string(),
                _ => continue,
            };
            map.insert(key, rendered);
        }
    }
    Ok(map)
}

fn required(map: &ConfigMap, key: &'static str) -> Result<String, ConfigError> {
    match map.get(key) {
        Some(value) if !value.is_empty() => Ok(value.clone()),
        _ => Err(ConfigError::MissingKey(key)),
    }
}

/// The `token` key may be absent (empty token), but if present it must be
/// non-empty.
fn optional_token(map: &ConfigMap) -> Result<String, ConfigError> {
    match map.get("token") {
        Some(token) if token.is_empty() => Err(ConfigError::EmptyToken),
        Some(token) => Ok(token.clone()),
        None => Ok(String::new()),
    }
}

fn parse_flag(map: &ConfigMap, key: &'static str) -> Result<Option<bool>, ConfigError> {
    match map.get(key).map(String::as_str) {
        None => Ok(None),
        Some("true") => Ok(Some(true)),
        Some("false") => Ok(Some(false)),
        Some(other) => Err(ConfigError::InvalidValue {
            key,
            value: other.to_string(),
            reason: "expected \"true\" or \"false\"",
        }),
    }
}

fn non_empty(value: Option<&String>) -> Option<String> {
    value.filter(|v| !v.is_empty()).cloned()
}
