//! Configuration system for the tftpsim CLI.

use serde::{Deserialize, Serialize};
use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tftpsim_core::{ClientConfig, Mode, ServerConfig, SocketConfig};
use tftpsim_faults::{FaultSpec, RelayConfig};

/// tftpsim configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Client configuration
    #[serde(default)]
    pub client: ClientSection,
    /// Server configuration
    #[serde(default)]
    pub server: ServerSection,
    /// Relay configuration
    #[serde(default)]
    pub relay: RelaySection,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientSection {
    /// Server address
    #[serde(default = "default_server_addr")]
    pub server: String,
    /// Relay address used with `--via-relay`
    #[serde(default = "default_relay_addr")]
    pub relay: String,
    /// Transfer mode named in requests
    #[serde(default = "default_mode")]
    pub mode: String,
    /// Per-attempt timeout in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Receive attempts before giving up
    #[serde(default = "default_attempts")]
    pub attempts: u32,
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSection {
    /// Listen address
    #[serde(default = "default_server_listen")]
    pub listen_addr: String,
    /// Served directory
    #[serde(default = "default_directory")]
    pub directory: PathBuf,
    /// Per-attempt timeout in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Receive attempts before giving up
    #[serde(default = "default_attempts")]
    pub attempts: u32,
    /// Cap on concurrent transfers
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_transfers: Option<usize>,
    /// Overwrite existing files on write requests
    #[serde(default)]
    pub allow_overwrite: bool,
}

/// Relay configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelaySection {
    /// Listen address
    #[serde(default = "default_relay_listen")]
    pub listen_addr: String,
    /// Server requests are forwarded to
    #[serde(default = "default_server_addr")]
    pub server: String,
    /// Session idle timeout in milliseconds
    #[serde(default = "default_idle_ms")]
    pub idle_timeout_ms: u64,
    /// Quiet period after a transfer's final exchange, in milliseconds
    #[serde(default = "default_linger_ms")]
    pub linger_ms: u64,
    /// Fault armed at startup (e.g. `drop:3`)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fault: Option<String>,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Default values

fn default_server_addr() -> String {
    "127.0.0.1:69".to_string()
}

fn default_relay_addr() -> String {
    "127.0.0.1:68".to_string()
}

fn default_server_listen() -> String {
    "0.0.0.0:69".to_string()
}

fn default_relay_listen() -> String {
    "0.0.0.0:68".to_string()
}

fn default_mode() -> String {
    "octet".to_string()
}

fn default_directory() -> PathBuf {
    PathBuf::from(".")
}

fn default_timeout_ms() -> u64 {
    2400
}

fn default_attempts() -> u32 {
    5
}

fn default_idle_ms() -> u64 {
    15_000
}

fn default_linger_ms() -> u64 {
    3_000
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ClientSection {
    fn default() -> Self {
        Self {
            server: default_server_addr(),
            relay: default_relay_addr(),
            mode: default_mode(),
            timeout_ms: default_timeout_ms(),
            attempts: default_attempts(),
        }
    }
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            listen_addr: default_server_listen(),
            directory: default_directory(),
            timeout_ms: default_timeout_ms(),
            attempts: default_attempts(),
            max_transfers: None,
            allow_overwrite: false,
        }
    }
}

impl Default for RelaySection {
    fn default() -> Self {
        Self {
            listen_addr: default_relay_listen(),
            server: default_server_addr(),
            idle_timeout_ms: default_idle_ms(),
            linger_ms: default_linger_ms(),
            fault: None,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Load configuration from file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let contents = fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Save configuration to file
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be written.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> anyhow::Result<()> {
        let contents = toml::to_string_pretty(self)?;

        if let Some(parent) = path.as_ref().parent() {
            fs::create_dir_all(parent)?;
        }

        fs::write(path, contents)?;
        Ok(())
    }

    /// Get default config path
    #[must_use]
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("/tmp"))
            .join("tftpsim/config.toml")
    }

    /// Load config from default path, or create default if it doesn't exist
    ///
    /// # Errors
    ///
    /// Returns an error if reading or creating the config fails.
    pub fn load_or_default() -> anyhow::Result<Self> {
        let path = Self::default_path();

        if path.exists() {
            Self::load(&path)
        } else {
            let config = Self::default();
            config.save(&path)?;
            Ok(config)
        }
    }

    /// Validate configuration
    ///
    /// # Errors
    ///
    /// Returns an error if configuration is invalid.
    pub fn validate(&self) -> anyhow::Result<()> {
        parse_addr(&self.client.server, "client.server")?;
        parse_addr(&self.client.relay, "client.relay")?;
        parse_addr(&self.server.listen_addr, "server.listen_addr")?;
        parse_addr(&self.relay.listen_addr, "relay.listen_addr")?;
        parse_addr(&self.relay.server, "relay.server")?;

        self.client
            .mode
            .parse::<Mode>()
            .map_err(|e| anyhow::anyhow!("client.mode: {e}"))?;

        for (name, attempts) in [
            ("client.attempts", self.client.attempts),
            ("server.attempts", self.server.attempts),
        ] {
            if attempts == 0 || attempts > 100 {
                anyhow::bail!("{name} must be between 1 and 100, got {attempts}");
            }
        }

        for (name, ms) in [
            ("client.timeout_ms", self.client.timeout_ms),
            ("server.timeout_ms", self.server.timeout_ms),
            ("relay.idle_timeout_ms", self.relay.idle_timeout_ms),
        ] {
            if ms == 0 {
                anyhow::bail!("{name} must be greater than zero");
            }
        }

        if self.server.max_transfers == Some(0) {
            anyhow::bail!("server.max_transfers must be at least 1 when set");
        }

        if let Some(fault) = &self.relay.fault {
            fault.parse::<FaultSpec>()?;
        }

        let valid_log_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_log_levels.contains(&self.logging.level.to_lowercase().as_str()) {
            anyhow::bail!(
                "Invalid log level: {}. Must be one of: {}",
                self.logging.level,
                valid_log_levels.join(", ")
            );
        }

        Ok(())
    }

    /// Client settings, optionally pointed at the relay instead of the server
    ///
    /// # Errors
    ///
    /// Returns an error if an address or the mode does not parse.
    pub fn client_config(&self, server: Option<&str>, via_relay: bool) -> anyhow::Result<ClientConfig> {
        let target = match (server, via_relay) {
            (Some(addr), _) => addr,
            (None, true) => self.client.relay.as_str(),
            (None, false) => self.client.server.as_str(),
        };
        Ok(ClientConfig {
            server: parse_addr(target, "server")?,
            socket: socket_config(self.client.timeout_ms, self.client.attempts),
            mode: self
                .client
                .mode
                .parse()
                .map_err(|e| anyhow::anyhow!("client.mode: {e}"))?,
        })
    }

    /// Server settings with command-line overrides applied
    ///
    /// # Errors
    ///
    /// Returns an error if the listen address does not parse.
    pub fn server_config(&self, bind: Option<&str>, dir: Option<&Path>) -> anyhow::Result<ServerConfig> {
        Ok(ServerConfig {
            bind_addr: parse_addr(bind.unwrap_or(&self.server.listen_addr), "bind")?,
            root: dir.map_or_else(|| self.server.directory.clone(), Path::to_path_buf),
            socket: socket_config(self.server.timeout_ms, self.server.attempts),
            max_transfers: self.server.max_transfers,
            allow_overwrite: self.server.allow_overwrite,
        })
    }

    /// Relay settings with command-line overrides applied
    ///
    /// # Errors
    ///
    /// Returns an error if an address or the fault does not parse.
    pub fn relay_config(
        &self,
        bind: Option<&str>,
        server: Option<&str>,
        fault: Option<&str>,
    ) -> anyhow::Result<RelayConfig> {
        let fault = fault
            .or(self.relay.fault.as_deref())
            .map(str::parse::<FaultSpec>)
            .transpose()?;
        Ok(RelayConfig {
            bind_addr: parse_addr(bind.unwrap_or(&self.relay.listen_addr), "bind")?,
            server_addr: parse_addr(server.unwrap_or(&self.relay.server), "server")?,
            idle_timeout: Duration::from_millis(self.relay.idle_timeout_ms),
            linger: Duration::from_millis(self.relay.linger_ms),
            fault,
        })
    }
}

fn socket_config(timeout_ms: u64, attempts: u32) -> SocketConfig {
    SocketConfig {
        timeout: Duration::from_millis(timeout_ms),
        attempts,
    }
}

fn parse_addr(addr: &str, name: &str) -> anyhow::Result<SocketAddr> {
    addr.parse()
        .map_err(|_| anyhow::anyhow!("{name} '{addr}' is not a valid host:port address"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.server.listen_addr, "0.0.0.0:69");
        assert_eq!(config.relay.listen_addr, "0.0.0.0:68");
        assert_eq!(config.client.timeout_ms, 2400);
        assert_eq!(config.client.attempts, 5);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = Config::default();

        config.client.attempts = 0;
        assert!(config.validate().is_err());
        config.client.attempts = 5;

        config.client.mode = "mail".to_string();
        assert!(config.validate().is_err());
        config.client.mode = "NetAscii".to_string();
        assert!(config.validate().is_ok());

        config.relay.fault = Some("explode:1".to_string());
        assert!(config.validate().is_err());
        config.relay.fault = Some("drop:3".to_string());
        assert!(config.validate().is_ok());

        config.server.listen_addr = "nowhere".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_toml_serialization() {
        let config = Config::default();
        let toml_str = toml::to_string(&config).unwrap();
        let deserialized: Config = toml::from_str(&toml_str).unwrap();

        assert_eq!(config.server.listen_addr, deserialized.server.listen_addr);
        assert_eq!(config.client.timeout_ms, deserialized.client.timeout_ms);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let config: Config = toml::from_str("[relay]\nfault = \"delay:2:100\"\n").unwrap();
        assert_eq!(config.relay.fault.as_deref(), Some("delay:2:100"));
        assert_eq!(config.client.server, "127.0.0.1:69");
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/config.toml");
        let mut config = Config::default();
        config.server.max_transfers = Some(4);
        config.save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.server.max_transfers, Some(4));
    }

    #[test]
    fn test_overrides() {
        let config = Config::default();

        let client = config.client_config(None, true).unwrap();
        assert_eq!(client.server, "127.0.0.1:68".parse::<SocketAddr>().unwrap());
        let client = config.client_config(Some("10.0.0.1:6969"), true).unwrap();
        assert_eq!(client.server.port(), 6969);

        let server = config
            .server_config(Some("127.0.0.1:0"), Some(Path::new("/srv")))
            .unwrap();
        assert_eq!(server.root, PathBuf::from("/srv"));

        let relay = config.relay_config(None, None, Some("wrong-sender:2")).unwrap();
        assert_eq!(relay.fault.unwrap().packet, 2);
    }
}
