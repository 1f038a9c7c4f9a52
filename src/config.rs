//! Configuration: loaded from a TOML file, merged with `DOCKBRIDGE_*`
//! environment variables and CLI flags, in that precedence order
//! (CLI > env > file > default).

use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::constants::{
    DEFAULT_CONNECTION_TIMEOUT_SECS, DEFAULT_GRACE_PERIOD_SECS, DEFAULT_IDLE_TIMEOUT_SECS,
    DEFAULT_LOCATION, DEFAULT_SERVER_TYPE, DEFAULT_SOCKET_PATH, DEFAULT_SSH_KEY_PATH,
    DEFAULT_SSH_PORT, DEFAULT_VOLUME_SIZE_GIB,
};
use crate::error::Error;
use crate::ssh::HostKeyPolicy;

/// Mirrors the TOML shape on disk; every field is optional so a partial
/// file, env overrides, and CLI flags can each fill in the rest.
#[derive(Debug, Default, Deserialize)]
struct FileConfig {
    socket_path: Option<String>,
    api_token: Option<String>,
    server_type: Option<String>,
    location: Option<String>,
    volume_size_gib: Option<u32>,
    preferred_images: Option<Vec<String>>,
    idle_timeout_secs: Option<u64>,
    connection_timeout_secs: Option<u64>,
    grace_period_secs: Option<u64>,
    ssh: Option<SshFileConfig>,
    #[allow(dead_code)]
    docker: Option<DockerFileConfig>,
    log: Option<LogFileConfig>,
}

#[derive(Debug, Default, Deserialize)]
struct SshFileConfig {
    key_path: Option<String>,
    port: Option<u16>,
    user: Option<String>,
    trust_on_first_use: Option<bool>,
    host_key_fingerprint: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct LogFileConfig {
    level: Option<String>,
    format: Option<String>,
}

/// `proxy_port` is recognised but unused by the pure byte-relay design —
/// reserved for a possible future HTTP-proxying frontend.
#[derive(Debug, Default, Deserialize)]
struct DockerFileConfig {
    #[allow(dead_code)]
    proxy_port: Option<u16>,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub socket_path: PathBuf,
    pub api_token: String,
    pub server_type: String,
    pub location: String,
    pub volume_size_gib: u32,
    pub preferred_images: Vec<String>,
    pub idle_timeout_secs: u64,
    pub connection_timeout_secs: u64,
    pub grace_period_secs: u64,
    pub ssh_key_path: PathBuf,
    pub ssh_port: u16,
    pub ssh_user: String,
    pub ssh_trust_on_first_use: bool,
    pub ssh_host_key_fingerprint: Option<String>,
    pub log_level: String,
    pub log_format: String,
}

/// CLI-supplied overrides, highest precedence. Each `Option::None`
/// leaves the env/file/default value untouched.
#[derive(Debug, Default)]
pub struct ConfigOverrides {
    pub socket_path: Option<PathBuf>,
    pub api_token: Option<String>,
    pub server_type: Option<String>,
    pub location: Option<String>,
}

impl Config {
    pub fn load(config_path: &Path, overrides: ConfigOverrides) -> Result<Self, Error> {
        let file = if config_path.exists() {
            let raw = std::fs::read_to_string(config_path)
                .map_err(|e| Error::Config(format!("failed to read {}: {e}", config_path.display())))?;
            toml::from_str::<FileConfig>(&raw)
                .map_err(|e| Error::Config(format!("failed to parse {}: {e}", config_path.display())))?
        } else {
            FileConfig::default()
        };

        let ssh = file.ssh.unwrap_or_default();
        let log = file.log.unwrap_or_default();

        let socket_path = overrides
            .socket_path
            .or_else(|| env_path("DOCKBRIDGE_SOCKET_PATH"))
            .or_else(|| file.socket_path.map(PathBuf::from))
            .unwrap_or_else(|| PathBuf::from(DEFAULT_SOCKET_PATH));

        if !socket_path.is_absolute() {
            return Err(Error::Config(format!(
                "socket_path must be absolute, got {}",
                socket_path.display()
            )));
        }

        let api_token = overrides
            .api_token
            .or_else(|| std::env::var("DOCKBRIDGE_API_TOKEN").ok())
            .or(file.api_token)
            .ok_or_else(|| Error::Config("api_token is required".into()))?;

        let server_type = overrides
            .server_type
            .or_else(|| std::env::var("DOCKBRIDGE_SERVER_TYPE").ok())
            .or(file.server_type)
            .unwrap_or_else(|| DEFAULT_SERVER_TYPE.to_string());

        let location = overrides
            .location
            .or_else(|| std::env::var("DOCKBRIDGE_LOCATION").ok())
            .or(file.location)
            .unwrap_or_else(|| DEFAULT_LOCATION.to_string());

        let ssh_key_path = env_path("DOCKBRIDGE_SSH_KEY_PATH")
            .or_else(|| ssh.key_path.map(PathBuf::from))
            .unwrap_or_else(|| expand_tilde(DEFAULT_SSH_KEY_PATH));

        Ok(Config {
            socket_path,
            api_token,
            server_type,
            location,
            volume_size_gib: file.volume_size_gib.unwrap_or(DEFAULT_VOLUME_SIZE_GIB),
            preferred_images: file.preferred_images.unwrap_or_default(),
            idle_timeout_secs: file.idle_timeout_secs.unwrap_or(DEFAULT_IDLE_TIMEOUT_SECS),
            connection_timeout_secs: file
                .connection_timeout_secs
                .unwrap_or(DEFAULT_CONNECTION_TIMEOUT_SECS),
            grace_period_secs: file.grace_period_secs.unwrap_or(DEFAULT_GRACE_PERIOD_SECS),
            ssh_key_path,
            ssh_port: ssh.port.unwrap_or(DEFAULT_SSH_PORT),
            ssh_user: ssh.user.unwrap_or_else(|| "root".to_string()),
            ssh_trust_on_first_use: ssh.trust_on_first_use.unwrap_or(false),
            ssh_host_key_fingerprint: ssh.host_key_fingerprint,
            log_level: log.level.unwrap_or_else(|| "info".to_string()),
            log_format: log.format.unwrap_or_else(|| "pretty".to_string()),
        })
    }

    pub fn default_path() -> PathBuf {
        dirs::home_dir()
            .map(|home| home.join(".dockbridge/config.toml"))
            .unwrap_or_else(|| expand_tilde("~/.dockbridge/config.toml"))
    }

    pub fn control_socket_path(&self) -> PathBuf {
        let mut path = self.socket_path.clone().into_os_string();
        path.push(".ctl");
        PathBuf::from(path)
    }

    pub fn local_tunnel_bind(&self) -> SocketAddr {
        "127.0.0.1:0".parse().expect("hardcoded loopback address is valid")
    }

    /// A configured fingerprint always selects `Pinned` verification,
    /// regardless of `ssh_trust_on_first_use` — per spec, a configured
    /// fingerprint must never be silently bypassed.
    pub fn host_key_policy(&self) -> HostKeyPolicy {
        match &self.ssh_host_key_fingerprint {
            Some(fingerprint) => HostKeyPolicy::Pinned { fingerprint: fingerprint.clone() },
            None => HostKeyPolicy::TrustOnFirstUse,
        }
    }
}

fn env_path(key: &str) -> Option<PathBuf> {
    std::env::var(key).ok().map(PathBuf::from)
}

fn expand_tilde(path: &str) -> PathBuf {
    shellexpand::tilde(path).into_owned().into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_api_token_is_a_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = Config::load(&dir.path().join("missing.toml"), ConfigOverrides::default());
        match result {
            Err(Error::Config(_)) => {}
            other => panic!("expected Config error, got {other:?}"),
        }
    }

    #[test]
    fn relative_socket_path_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "api_token = \"t\"\nsocket_path = \"relative/path\"\n").unwrap();
        let result = Config::load(&path, ConfigOverrides::default());
        assert!(matches!(result, Err(Error::Config(_))));
    }

    #[test]
    fn volume_size_and_preferred_images_are_parsed_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            "api_token = \"t\"\nvolume_size_gib = 50\npreferred_images = [\"docker-ce\", \"ubuntu-22.04\"]\n",
        )
        .unwrap();
        let config = Config::load(&path, ConfigOverrides::default()).unwrap();
        assert_eq!(config.volume_size_gib, 50);
        assert_eq!(config.preferred_images, vec!["docker-ce", "ubuntu-22.04"]);
    }

    #[test]
    fn volume_size_defaults_when_absent() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "api_token = \"t\"\n").unwrap();
        let config = Config::load(&path, ConfigOverrides::default()).unwrap();
        assert_eq!(config.volume_size_gib, DEFAULT_VOLUME_SIZE_GIB);
        assert!(config.preferred_images.is_empty());
    }

    #[test]
    fn host_key_policy_defaults_to_trust_on_first_use() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "api_token = \"t\"\n").unwrap();
        let config = Config::load(&path, ConfigOverrides::default()).unwrap();
        assert!(matches!(config.host_key_policy(), HostKeyPolicy::TrustOnFirstUse));
    }

    #[test]
    fn configured_fingerprint_selects_pinned_policy_regardless_of_trust_on_first_use() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            "api_token = \"t\"\n[ssh]\ntrust_on_first_use = true\nhost_key_fingerprint = \"SHA256:abc\"\n",
        )
        .unwrap();
        let config = Config::load(&path, ConfigOverrides::default()).unwrap();
        match config.host_key_policy() {
            HostKeyPolicy::Pinned { fingerprint } => assert_eq!(fingerprint, "SHA256:abc"),
            other => panic!("expected pinned policy, got {other:?}"),
        }
    }

    #[test]
    fn cli_override_wins_over_file_value() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "api_token = \"file-token\"\n").unwrap();
        let overrides = ConfigOverrides {
            api_token: Some("cli-token".into()),
            ..Default::default()
        };
        let config = Config::load(&path, overrides).unwrap();
        assert_eq!(config.api_token, "cli-token");
    }
}
