// ABOUTME: Daemon configuration loaded from environment variables
// ABOUTME: Numeric values are validated; invalid input is an error, not a silent default

use std::env;
use std::num::ParseIntError;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid port number: {0}")]
    InvalidPort(#[from] ParseIntError),

    #[error("port {0} is out of valid range (1-65535)")]
    PortOutOfRange(u16),

    #[error("port range start {0} is greater than end {1}")]
    InvalidPortRange(u16, u16),
}

#[derive(Debug, Clone)]
pub struct Config {
    /// Port the orchestrator's own HTTP surface binds.
    pub port: u16,
    /// Base URL of the UI process receiving advisory PATCH callbacks.
    pub main_app_url: String,
    /// Inclusive host port range handed out to runtime containers.
    pub port_range_start: u16,
    pub port_range_end: u16,
    /// Base directory for per-run workspaces.
    pub workspace_base: PathBuf,
    /// Deployer-supplied project scaffold overlaid with generated files.
    pub template_dir: PathBuf,
    /// Name of the bridge network runtime containers are confined to.
    pub isolation_network: String,
    /// Domain the reverse proxy serves previews under.
    pub preview_domain: String,
    /// Host part of internal URLs handed to the proxy and health probe.
    pub public_host: String,
    /// Image used for both build and runtime containers.
    pub runtime_image: String,
    pub codegen_gateway_url: String,
    pub codegen_gateway_api_key: Option<String>,
    pub cors_origin: String,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let port = parse_port("ORCHESTRATOR_PORT", 8080)?;
        let port_range_start = parse_port("PORT_RANGE_START", 3001)?;
        let port_range_end = parse_port("PORT_RANGE_END", 4000)?;
        if port_range_start > port_range_end {
            return Err(ConfigError::InvalidPortRange(
                port_range_start,
                port_range_end,
            ));
        }

        Ok(Config {
            port,
            main_app_url: env_or("MAIN_APP_URL", "http://localhost:3000"),
            port_range_start,
            port_range_end,
            workspace_base: PathBuf::from(env_or("WORKSPACE_BASE", "/tmp/arena-workspaces")),
            template_dir: PathBuf::from(env_or("TEMPLATE_DIR", "./template")),
            isolation_network: env_or("ISOLATION_NETWORK_NAME", "arena-isolation"),
            preview_domain: env_or("PREVIEW_DOMAIN", "localhost"),
            public_host: env_or("PUBLIC_HOST", "localhost"),
            runtime_image: env_or("RUNTIME_IMAGE", "node:20-alpine"),
            codegen_gateway_url: env_or("CODEGEN_GATEWAY_URL", "http://localhost:9090"),
            codegen_gateway_api_key: env::var("CODEGEN_GATEWAY_API_KEY").ok(),
            cors_origin: env_or("CORS_ORIGIN", "http://localhost:3000"),
        })
    }
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn parse_port(key: &str, default: u16) -> Result<u16, ConfigError> {
    let port = match env::var(key) {
        Ok(raw) => raw.parse::<u16>()?,
        Err(_) => default,
    };
    if port == 0 {
        return Err(ConfigError::PortOutOfRange(port));
    }
    Ok(port)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // These tests mutate process-wide env vars; serialize them.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn test_defaults() {
        let _guard = ENV_LOCK.lock().unwrap();
        let config = Config::from_env().unwrap();
        assert_eq!(config.port_range_start, 3001);
        assert_eq!(config.port_range_end, 4000);
        assert_eq!(config.isolation_network, "arena-isolation");
        assert_eq!(
            config.workspace_base,
            PathBuf::from("/tmp/arena-workspaces")
        );
    }

    #[test]
    fn test_invalid_port_rejected() {
        let _guard = ENV_LOCK.lock().unwrap();
        env::set_var("ORCHESTRATOR_PORT", "not-a-port");
        let result = Config::from_env();
        env::remove_var("ORCHESTRATOR_PORT");
        assert!(matches!(result, Err(ConfigError::InvalidPort(_))));
    }

    #[test]
    fn test_inverted_range_rejected() {
        let _guard = ENV_LOCK.lock().unwrap();
        env::set_var("PORT_RANGE_START", "5000");
        env::set_var("PORT_RANGE_END", "4000");
        let result = Config::from_env();
        env::remove_var("PORT_RANGE_START");
        env::remove_var("PORT_RANGE_END");
        assert!(matches!(
            result,
            Err(ConfigError::InvalidPortRange(5000, 4000))
        ));
    }
}
