//! Environment-driven agent configuration, loaded once at startup and turned
//! into the reconciler [`Settings`].

use std::collections::BTreeMap;
use std::env;
use std::path::PathBuf;

use shepherd_reconciler::Settings;

const PROXY_VARS: &[&str] = &["http_proxy", "https_proxy", "NO_PROXY"];

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub home: PathBuf,
    pub control_url: String,
    pub api_proxy_port: u16,
    pub worker_count: usize,
    pub storage_sock_dir: PathBuf,
    pub resolv_conf: PathBuf,
}

impl Default for AgentConfig {
    fn default() -> Self {
        AgentConfig {
            home: PathBuf::from("/var/lib/shepherd"),
            control_url: String::new(),
            api_proxy_port: 9342,
            worker_count: 50,
            storage_sock_dir: PathBuf::from("/var/run/shepherd/storage"),
            resolv_conf: PathBuf::from("/etc/resolv.conf"),
        }
    }
}

impl AgentConfig {
    pub fn from_env() -> Self {
        // .env is a development convenience; absence is the normal case
        let _ = dotenvy::dotenv();
        let defaults = AgentConfig::default();
        AgentConfig {
            home: env::var("SHEPHERD_HOME").map(PathBuf::from).unwrap_or(defaults.home),
            control_url: env::var("SHEPHERD_URL").unwrap_or(defaults.control_url),
            api_proxy_port: parse_var("SHEPHERD_API_PROXY_PORT", defaults.api_proxy_port),
            worker_count: parse_var("SHEPHERD_WORKERS", defaults.worker_count),
            storage_sock_dir: env::var("SHEPHERD_STORAGE_SOCK_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.storage_sock_dir),
            resolv_conf: env::var("SHEPHERD_RESOLV_CONF")
                .map(PathBuf::from)
                .unwrap_or(defaults.resolv_conf),
        }
    }

    pub fn settings(&self) -> Settings {
        let mut host_proxy_env = BTreeMap::new();
        for var in PROXY_VARS {
            if let Ok(value) = env::var(var) {
                if !value.is_empty() {
                    host_proxy_env.insert(var.to_string(), value);
                }
            }
        }
        Settings {
            state_dir: self.home.join("containers"),
            control_url: self.control_url.clone(),
            api_proxy_port: self.api_proxy_port,
            storage_sock_dir: self.storage_sock_dir.clone(),
            resolv_conf: self.resolv_conf.clone(),
            host_proxy_env,
        }
    }
}

fn parse_var<T: std::str::FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|raw| raw.parse().ok())
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settings_derive_the_state_dir() {
        let config = AgentConfig { home: PathBuf::from("/tmp/shepherd-test"), ..Default::default() };
        let settings = config.settings();
        assert_eq!(settings.state_dir, PathBuf::from("/tmp/shepherd-test/containers"));
        assert_eq!(settings.api_proxy_port, 9342);
    }
}
