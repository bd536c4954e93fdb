//! Ambient configuration loader: env vars layered over an optional TOML
//! file, using the teacher's `config`/`toml` crates rather than hand
//! rolled `std::env::var` parsing.

use serde::Deserialize;

use crate::error::Result;

fn default_port() -> u16 {
    3001
}

fn default_max_history() -> usize {
    1000
}

fn default_reconnect_interval_ms() -> u64 {
    3000
}

fn default_max_reconnect_attempts() -> u32 {
    10
}

fn default_heartbeat_interval_ms() -> u64 {
    30000
}

fn default_auth_timeout_ms() -> u64 {
    10000
}

/// Server-side configuration (spec §3/§6).
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub allowed_origins: Vec<String>,
    #[serde(default = "default_max_history")]
    pub max_operations_history: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            allowed_origins: Vec::new(),
            max_operations_history: default_max_history(),
        }
    }
}

impl ServerConfig {
    /// Layer `config` sources: defaults, then an optional `collab.toml`
    /// in the current directory, then environment variables
    /// (`COLLAB_PORT`, `COLLAB_ALLOWED_ORIGINS` comma-separated).
    pub fn load() -> Result<Self> {
        let builder = config::Config::builder()
            .set_default("port", default_port() as i64)?
            .set_default("max_operations_history", default_max_history() as i64)?
            .add_source(config::File::with_name("collab").required(false))
            .add_source(
                config::Environment::with_prefix("COLLAB")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("allowed_origins"),
            );

        let raw: RawServerConfig = builder.build()?.try_deserialize()?;

        Ok(Self {
            port: raw.port,
            allowed_origins: raw.allowed_origins,
            max_operations_history: raw.max_operations_history,
        })
    }

    /// Allow when origin is absent, matches an entry, or the allow-list
    /// contains `*` (spec §4.5).
    pub fn origin_allowed(&self, origin: Option<&str>) -> bool {
        match origin {
            None => true,
            Some(origin) => {
                self.allowed_origins.iter().any(|o| o == "*") || self.allowed_origins.iter().any(|o| o == origin)
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawServerConfig {
    #[serde(default = "default_port")]
    port: u16,
    #[serde(default)]
    allowed_origins: Vec<String>,
    #[serde(default = "default_max_history")]
    max_operations_history: usize,
}

/// Client-side configuration (spec §4.6), field-for-field.
#[derive(Debug, Clone, Deserialize)]
pub struct ClientConfig {
    pub url: String,
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default = "default_true")]
    pub auto_connect: bool,
    #[serde(default = "default_reconnect_interval_ms")]
    pub reconnect_interval_ms: u64,
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,
    #[serde(default = "default_auth_timeout_ms")]
    pub auth_timeout_ms: u64,
}

fn default_true() -> bool {
    true
}

impl ClientConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            token: None,
            auto_connect: true,
            reconnect_interval_ms: default_reconnect_interval_ms(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            auth_timeout_ms: default_auth_timeout_ms(),
        }
    }
}
