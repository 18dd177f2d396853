//! TOML configuration, loaded once at startup. Paths resolve against the
//! process's data directory the way `guard-core::paths` resolves
//! `AppPaths`; kept as a flat key set rather than a nested schema.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::ConfigError;

fn default_max_cache_size() -> usize {
    1024
}

fn default_subprocess_timeout_secs() -> u64 {
    30
}

/// Every key the pipeline needs at startup: RSA key/cert paths, Obelisk
/// OAuth2 credentials, models/cache/status paths, and subprocess binaries.
#[derive(Debug, Clone, Deserialize)]
pub struct PartyConfig {
    pub results_dir: PathBuf,
    pub port: u16,
    pub ca_cert: PathBuf,
    pub server_cert: PathBuf,
    pub server_key: PathBuf,
    pub party_index: u8,
    pub party_certs: [PathBuf; 3],

    pub server_id: String,
    pub server_secret: String,
    pub obelisk_base_url: String,

    pub models_dir: PathBuf,
    pub cache_dir: PathBuf,
    pub status_db_path: PathBuf,

    #[serde(default = "default_max_cache_size")]
    pub max_cache_size: usize,

    #[serde(default = "default_subprocess_timeout_secs")]
    pub subprocess_timeout_secs: u64,

    /// Hostfile/party-list string passed to the inference binary's `-ip` flag.
    pub mpc_hosts: String,

    /// `./malicious-rep-ring-party.x`; resolved against `results_dir` when
    /// relative.
    pub inference_binary: PathBuf,
    /// MPC-AES subprocess binary and its TOML config.
    pub aes_bridge_binary: PathBuf,
    pub aes_bridge_config: PathBuf,
    /// Offline preprocessing generator and the peers it distributes to.
    pub offline_binary: PathBuf,
    #[serde(default)]
    pub offline_scp_destinations: Vec<String>,
}

impl PartyConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let mut config: Self = toml::from_str(&raw).map_err(|source| ConfigError::Toml {
            path: path.display().to_string(),
            source,
        })?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// `PARTY_*` env overrides for the handful of values worth overriding in
    /// containerized deployments without rewriting the TOML file.
    fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("PARTY_PORT") {
            if let Ok(port) = v.parse() {
                self.port = port;
            }
        }
        if let Ok(v) = std::env::var("PARTY_RESULTS_DIR") {
            self.results_dir = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("PARTY_OBELISK_BASE_URL") {
            self.obelisk_base_url = v;
        }
        if let Ok(v) = std::env::var("PARTY_SERVER_SECRET") {
            self.server_secret = v;
        }
        if let Ok(v) = std::env::var("PARTY_MAX_CACHE_SIZE") {
            if let Ok(n) = v.parse() {
                self.max_cache_size = n;
            }
        }
    }

    pub fn shares_path(&self, analysis_id: &str) -> PathBuf {
        self.results_dir.join(format!("{analysis_id}.shares"))
    }

    pub fn timing_log_path(&self) -> PathBuf {
        self.results_dir
            .join(format!("analysis_times_{}.log", self.party_index))
    }

    pub fn weights_dir(&self, analysis_type: &str) -> PathBuf {
        self.models_dir.join(analysis_type)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn sample_toml() -> &'static str {
        r#"
        results_dir = "/tmp/party/results"
        port = 8443
        ca_cert = "/tmp/party/ca.pem"
        server_cert = "/tmp/party/server.pem"
        server_key = "/tmp/party/server.key"
        party_index = 1
        party_certs = ["/tmp/p0.pem", "/tmp/p1.pem", "/tmp/p2.pem"]
        server_id = "party-1"
        server_secret = "shh"
        obelisk_base_url = "https://obelisk.example/api"
        models_dir = "/tmp/party/models"
        cache_dir = "/tmp/party/cache"
        status_db_path = "/tmp/party/status.db"
        mpc_hosts = "10.0.0.1,10.0.0.2,10.0.0.3"
        inference_binary = "/tmp/party/malicious-rep-ring-party.x"
        aes_bridge_binary = "/tmp/party/rep3-aes-mozaik"
        aes_bridge_config = "/tmp/party/rep3aes.toml"
        offline_binary = "/tmp/party/Fake-Offline.x"
        offline_scp_destinations = ["party1:/tmp", "party2:/tmp"]
        "#
    }

    #[test]
    fn loads_required_fields() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(sample_toml().as_bytes()).unwrap();
        let config = PartyConfig::load(f.path()).unwrap();
        assert_eq!(config.party_index, 1);
        assert_eq!(config.max_cache_size, 1024);
        assert_eq!(config.port, 8443);
    }

    #[test]
    fn env_override_wins() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(sample_toml().as_bytes()).unwrap();
        std::env::set_var("PARTY_PORT", "9000");
        let config = PartyConfig::load(f.path()).unwrap();
        std::env::remove_var("PARTY_PORT");
        assert_eq!(config.port, 9000);
    }

    #[test]
    fn missing_file_is_io_error() {
        let err = PartyConfig::load("/nonexistent/party.toml").unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
