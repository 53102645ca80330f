//! Connection configuration: target resolution and driver option defaults.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use mongodb::options::{ClientOptions, ConnectionString, HostInfo};
use serde::Deserialize;

use crate::error::ConfigError;

pub const SCHEME: &str = "mongodb";
pub const DEFAULT_HOST: &str = "localhost";
pub const DEFAULT_PORT: u16 = 27017;
pub const DEFAULT_DB: &str = "default";
pub const DEFAULT_AUTH_SOURCE: &str = "admin";

/// Driver options applied to every connection.
///
/// Starts from [`DriverOptions::default`] and is overlaid key by key with a
/// [`DriverOptionsOverride`]; keys the caller leaves out keep their default.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriverOptions {
    pub use_new_url_parser: bool,
    pub use_create_index: bool,
    pub use_unified_topology: bool,
    /// Reconnect attempts, `u64::MAX` retries forever.
    pub reconnect_tries: u64,
    /// Milliseconds between reconnect attempts.
    pub reconnect_interval: u64,
    pub pool_size: u32,
    /// Zero fails operations immediately while disconnected.
    pub buffer_max_entries: u64,
    pub connect_timeout_ms: u64,
    pub socket_timeout_ms: u64,
}

impl Default for DriverOptions {
    fn default() -> Self {
        Self {
            use_new_url_parser: true,
            use_create_index: true,
            use_unified_topology: true,
            reconnect_tries: u64::MAX,
            reconnect_interval: 500,
            pool_size: 10,
            buffer_max_entries: 0,
            connect_timeout_ms: 10_000,
            socket_timeout_ms: 45_000,
        }
    }
}

/// Caller-supplied driver options. Every field is optional.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DriverOptionsOverride {
    pub use_new_url_parser: Option<bool>,
    pub use_create_index: Option<bool>,
    pub use_unified_topology: Option<bool>,
    pub reconnect_tries: Option<u64>,
    pub reconnect_interval: Option<u64>,
    pub pool_size: Option<u32>,
    pub buffer_max_entries: Option<u64>,
    #[serde(rename = "connectTimeoutMS")]
    pub connect_timeout_ms: Option<u64>,
    #[serde(rename = "socketTimeoutMS")]
    pub socket_timeout_ms: Option<u64>,
}

impl DriverOptions {
    /// Shallow merge, the override wins per key.
    pub fn overlay(&self, over: &DriverOptionsOverride) -> DriverOptions {
        DriverOptions {
            use_new_url_parser: over.use_new_url_parser.unwrap_or(self.use_new_url_parser),
            use_create_index: over.use_create_index.unwrap_or(self.use_create_index),
            use_unified_topology: over.use_unified_topology.unwrap_or(self.use_unified_topology),
            reconnect_tries: over.reconnect_tries.unwrap_or(self.reconnect_tries),
            reconnect_interval: over.reconnect_interval.unwrap_or(self.reconnect_interval),
            pool_size: over.pool_size.unwrap_or(self.pool_size),
            buffer_max_entries: over.buffer_max_entries.unwrap_or(self.buffer_max_entries),
            connect_timeout_ms: over.connect_timeout_ms.unwrap_or(self.connect_timeout_ms),
            socket_timeout_ms: over.socket_timeout_ms.unwrap_or(self.socket_timeout_ms),
        }
    }

    /// Copy these options onto parsed driver client options.
    ///
    /// The parser, index and topology flags have no driver counterpart.
    pub fn apply(&self, opts: &mut ClientOptions) {
        let connect_timeout = Duration::from_millis(self.connect_timeout_ms);

        opts.max_pool_size = Some(self.pool_size);
        opts.connect_timeout = Some(connect_timeout);
        opts.max_idle_time = Some(Duration::from_millis(self.socket_timeout_ms));
        // the driver rejects heartbeat intervals below 500ms
        opts.heartbeat_freq = Some(Duration::from_millis(self.reconnect_interval.max(500)));
        opts.retry_reads = Some(self.reconnect_tries > 0);
        opts.retry_writes = Some(self.reconnect_tries > 0);
        if self.buffer_max_entries == 0 {
            opts.server_selection_timeout = Some(connect_timeout);
        }
    }
}

/// Data part of the registry configuration.
///
/// Model schemas and event listeners are code, so they are registered on
/// [`crate::RegistryBuilder`] instead.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MongoConfig {
    pub uri: Option<String>,
    pub url: Option<String>,
    pub host: String,
    pub port: u16,
    pub user: Option<String>,
    pub pass: Option<String>,
    pub db: String,
    pub auth_source: Option<String>,
    pub mongo_options: DriverOptionsOverride,
    pub use_default_error_handler: bool,
}

impl Default for MongoConfig {
    fn default() -> Self {
        Self {
            uri: None,
            url: None,
            host: DEFAULT_HOST.to_string(),
            port: DEFAULT_PORT,
            user: None,
            pass: None,
            db: DEFAULT_DB.to_string(),
            auth_source: Some(DEFAULT_AUTH_SOURCE.to_string()),
            mongo_options: DriverOptionsOverride::default(),
            use_default_error_handler: true,
        }
    }
}

/// Where to connect, plus the logical database name used for the
/// database handle and in error messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionTarget {
    pub uri: String,
    pub database: String,
    redacted: String,
}

impl ConnectionTarget {
    /// Parse `uri` with the driver's connection string parser. The database
    /// name is the decoded path of the URI, else `fallback_db`.
    pub fn parse(uri: &str, fallback_db: &str) -> Result<Self, ConfigError> {
        let parsed = ConnectionString::parse(uri).map_err(ConfigError::InvalidUri)?;
        let database = parsed
            .default_database
            .clone()
            .unwrap_or_else(|| fallback_db.to_string());

        Ok(Self {
            uri: uri.to_string(),
            redacted: redact(&parsed, &database),
            database,
        })
    }

    /// The target with any password masked, safe to log.
    pub fn redacted(&self) -> String {
        self.redacted.clone()
    }
}

impl fmt::Display for ConnectionTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.redacted())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedConfig {
    pub target: ConnectionTarget,
    pub options: DriverOptions,
}

impl MongoConfig {
    /// Resolve the connection target and the merged driver options.
    ///
    /// A target the driver cannot parse is a [`ConfigError::InvalidUri`].
    pub fn resolve(&self) -> Result<ResolvedConfig, ConfigError> {
        let target = match non_empty(&self.uri).or_else(|| non_empty(&self.url)) {
            Some(uri) => ConnectionTarget::parse(uri, &self.db)?,
            None => {
                let credentials = match (
                    non_empty(&self.user),
                    non_empty(&self.pass),
                    non_empty(&self.auth_source),
                ) {
                    (Some(user), Some(pass), Some(auth_source)) => Some((user, pass, auth_source)),
                    _ => None,
                };

                let uri = match credentials {
                    Some((user, pass, auth_source)) => format!(
                        "{SCHEME}://{user}:{pass}@{}:{}/{}?authSource={auth_source}",
                        self.host, self.port, self.db
                    ),
                    None => format!("{SCHEME}://{}:{}/{}", self.host, self.port, self.db),
                };

                ConnectionTarget::parse(&uri, &self.db)?
            }
        };

        Ok(ResolvedConfig {
            target,
            options: DriverOptions::default().overlay(&self.mongo_options),
        })
    }

    /// Build a configuration from `MONGO_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a configuration from `MONGO_*` keys read through `lookup`.
    ///
    /// Unset or empty keys keep their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.is_empty());
        let mut config = MongoConfig::default();

        config.uri = get("MONGO_URI");
        config.url = get("MONGO_URL");
        if let Some(host) = get("MONGO_HOST") {
            config.host = host;
        }
        if let Some(port) = parse_value("MONGO_PORT", get("MONGO_PORT"))? {
            config.port = port;
        }
        config.user = get("MONGO_USER");
        config.pass = get("MONGO_PASS");
        if let Some(db) = get("MONGO_DB") {
            config.db = db;
        }
        if let Some(auth_source) = get("MONGO_AUTH_SOURCE") {
            config.auth_source = Some(auth_source);
        }

        config.mongo_options.pool_size = parse_value("MONGO_POOL_SIZE", get("MONGO_POOL_SIZE"))?;
        config.mongo_options.connect_timeout_ms =
            parse_value("MONGO_CONNECT_TIMEOUT_MS", get("MONGO_CONNECT_TIMEOUT_MS"))?;
        config.mongo_options.socket_timeout_ms =
            parse_value("MONGO_SOCKET_TIMEOUT_MS", get("MONGO_SOCKET_TIMEOUT_MS"))?;

        let flag = get("MONGO_DEFAULT_ERROR_HANDLER");
        if let Some(flag) = parse_value::<bool>("MONGO_DEFAULT_ERROR_HANDLER", flag)? {
            config.use_default_error_handler = flag;
        }

        Ok(config)
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|v| !v.is_empty())
}

fn parse_value<T: FromStr>(key: &str, raw: Option<String>) -> Result<Option<T>, ConfigError> {
    match raw {
        Some(raw) => raw
            .trim()
            .to_lowercase()
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue {
                key: key.to_string(),
                value: raw,
            }),
        None => Ok(None),
    }
}

/// Rebuild a loggable form of a parsed connection string, password masked.
fn redact(parsed: &ConnectionString, database: &str) -> String {
    let (scheme, hosts) = match &parsed.host_info {
        HostInfo::HostIdentifiers(addresses) => (
            SCHEME,
            addresses
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(","),
        ),
        HostInfo::DnsRecord(host) => ("mongodb+srv", host.clone()),
        _ => (SCHEME, String::new()),
    };

    let user_info = match &parsed.credential {
        Some(credential) => match (&credential.username, &credential.password) {
            (Some(user), Some(_)) => format!("{user}:****@"),
            (Some(user), None) => format!("{user}@"),
            (None, _) => String::new(),
        },
        None => String::new(),
    };

    format!("{scheme}://{user_info}{hosts}/{database}")
}
