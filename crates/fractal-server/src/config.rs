//! Server configuration.
//!
//! Loaded from a JSON file named by `FRACTAL_CONFIG` (optional), with
//! environment variables taking precedence for the server-level options.
//! The `memory` section is passed through to the agent verbatim; unknown
//! keys inside it are tolerated there.

use serde::Deserialize;
use serde_json::Value;
use std::path::PathBuf;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// TCP bind address
    pub bind_addr: String,
    /// CORS allowed origins. Empty refuses cross-origin requests.
    pub allowed_origins: Vec<String>,
    /// Arbitrary memory options payload handed to the agent
    pub memory: Value,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8087".into(),
            allowed_origins: Vec::new(),
            memory: Value::Object(serde_json::Map::new()),
        }
    }
}

impl ServerConfig {
    pub fn load() -> anyhow::Result<Self> {
        let mut config = match std::env::var("FRACTAL_CONFIG") {
            Ok(path) => {
                let path = PathBuf::from(path);
                let raw = std::fs::read_to_string(&path)?;
                serde_json::from_str(&raw)?
            }
            Err(_) => Self::default(),
        };

        if let Ok(addr) = std::env::var("FRACTAL_BIND_ADDR") {
            config.bind_addr = addr;
        }
        if let Ok(origins) = std::env::var("FRACTAL_ALLOWED_ORIGINS") {
            config.allowed_origins = origins
                .split(',')
                .map(|o| o.trim().to_string())
                .filter(|o| !o.is_empty())
                .collect();
        }

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_refuse_cross_origin() {
        let config = ServerConfig::default();
        assert!(config.allowed_origins.is_empty());
        assert_eq!(config.bind_addr, "127.0.0.1:8087");
    }

    #[test]
    fn parses_file_shape() {
        let raw = r#"{
            "bind_addr": "0.0.0.0:9000",
            "allowed_origins": ["http://localhost:5173"],
            "memory": {"user_id": "ops", "batch_size": 10, "unknown_key": true}
        }"#;
        let config: ServerConfig = serde_json::from_str(raw).unwrap();
        assert_eq!(config.bind_addr, "0.0.0.0:9000");
        assert_eq!(config.allowed_origins.len(), 1);
        assert_eq!(config.memory["user_id"], "ops");
    }
}
