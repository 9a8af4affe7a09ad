//! Server configuration.
//!
//! Configuration is loaded from environment variables. The auth secret is
//! redacted in Debug output.

use std::collections::HashMap;
use std::env;
use std::fmt;
use thiserror::Error;

/// Default HTTP/WebSocket bind address.
pub const DEFAULT_BIND_ADDRESS: &str = "0.0.0.0:4000";

/// Default per-connection outbound event queue depth.
pub const DEFAULT_OUTBOUND_QUEUE_DEPTH: usize = 64;

/// Default instance id prefix.
pub const DEFAULT_INSTANCE_ID_PREFIX: &str = "signal";

/// Signaling server configuration.
#[derive(Clone)]
pub struct Config {
    /// HTTP listener bind address for ws, health and metrics
    /// (default: "0.0.0.0:4000").
    pub bind_address: String,

    /// Shared HS256 secret for identity token validation.
    pub auth_secret: String,

    /// Unique identifier for this server instance.
    pub instance_id: String,

    /// Per-connection outbound event queue depth; a connection that falls
    /// this far behind starts losing events (best-effort delivery).
    pub outbound_queue_depth: usize,
}

/// Custom Debug implementation that redacts the auth secret.
impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("bind_address", &self.bind_address)
            .field("auth_secret", &"[REDACTED]")
            .field("instance_id", &self.instance_id)
            .field("outbound_queue_depth", &self.outbound_queue_depth)
            .finish()
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value: {0}")]
    InvalidValue(String),
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_vars(&env::vars().collect())
    }

    /// Load configuration from a `HashMap` (for testing).
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let auth_secret = vars
            .get("SIGNAL_AUTH_SECRET")
            .ok_or_else(|| ConfigError::MissingEnvVar("SIGNAL_AUTH_SECRET".to_string()))?
            .clone();

        if auth_secret.len() < 16 {
            return Err(ConfigError::InvalidValue(
                "SIGNAL_AUTH_SECRET must be at least 16 bytes".to_string(),
            ));
        }

        let bind_address = vars
            .get("SIGNAL_BIND_ADDRESS")
            .cloned()
            .unwrap_or_else(|| DEFAULT_BIND_ADDRESS.to_string());

        let outbound_queue_depth = match vars.get("SIGNAL_OUTBOUND_QUEUE_DEPTH") {
            Some(raw) => raw.parse().map_err(|_| {
                ConfigError::InvalidValue(format!(
                    "SIGNAL_OUTBOUND_QUEUE_DEPTH must be a positive integer, got {raw:?}"
                ))
            })?,
            None => DEFAULT_OUTBOUND_QUEUE_DEPTH,
        };

        let instance_id = vars.get("SIGNAL_INSTANCE_ID").cloned().unwrap_or_else(|| {
            let hostname = std::env::var("HOSTNAME").unwrap_or_else(|_| "unknown".to_string());
            let uuid_suffix = uuid::Uuid::new_v4().to_string();
            let short_suffix = uuid_suffix.get(..8).unwrap_or("00000000");
            format!("{DEFAULT_INSTANCE_ID_PREFIX}-{hostname}-{short_suffix}")
        });

        Ok(Config {
            bind_address,
            auth_secret,
            instance_id,
            outbound_queue_depth,
        })
    }
}
