use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Global configuration for the router
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Listener configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Forwarding behaviour
    #[serde(default)]
    pub proxy: ProxyConfig,

    /// Docker event source
    #[serde(default)]
    pub docker: DockerConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Proxy port (default: 80)
    #[serde(default = "default_listen_port")]
    pub port: u16,

    /// Bind address (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Port for the status API, always bound to 127.0.0.1 (0 disables it)
    #[serde(default = "default_admin_port")]
    pub admin_port: u16,

    /// Bearer token for the status API.
    /// If not set, a random token is generated at startup and logged
    pub admin_token: Option<String>,

    /// Maximum idle connections per backend (default: 10)
    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,

    /// Idle connection timeout in seconds (default: 90)
    #[serde(default = "default_pool_idle_timeout")]
    pub pool_idle_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_listen_port(),
            bind: default_bind_address(),
            admin_port: default_admin_port(),
            admin_token: None,
            pool_max_idle_per_host: default_pool_max_idle_per_host(),
            pool_idle_timeout_secs: default_pool_idle_timeout(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct ProxyConfig {
    /// Max time to wait for a backend response in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Max time to establish a TCP connection to a backend in milliseconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,

    /// Max time for the backend to answer a WebSocket handshake in seconds
    #[serde(default = "default_upgrade_timeout")]
    pub upgrade_timeout_secs: u64,

    /// Upper bound on the life of an upgraded connection (unset = unlimited)
    pub upgrade_max_lifetime_secs: Option<u64>,

    /// Rewrite the Host header to the backend address (default: true)
    #[serde(default = "default_true")]
    pub change_origin: bool,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: default_request_timeout(),
            connect_timeout_ms: default_connect_timeout(),
            upgrade_timeout_secs: default_upgrade_timeout(),
            upgrade_max_lifetime_secs: None,
            change_origin: true,
        }
    }
}

impl ProxyConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn upgrade_timeout(&self) -> Duration {
        Duration::from_secs(self.upgrade_timeout_secs)
    }

    pub fn upgrade_max_lifetime(&self) -> Option<Duration> {
        self.upgrade_max_lifetime_secs.map(Duration::from_secs)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct DockerConfig {
    /// Docker host URL (default: DOCKER_HOST, then common socket paths)
    pub host: Option<String>,

    /// Network whose address is used when a container has no bridge address
    pub network: Option<String>,

    /// Container label that pins the routed port
    #[serde(default = "default_port_label")]
    pub port_label: String,

    /// Max time for a container inspect call in milliseconds
    #[serde(default = "default_inspect_timeout")]
    pub inspect_timeout_ms: u64,

    /// First delay before resubscribing to events in milliseconds
    #[serde(default = "default_resubscribe_base")]
    pub resubscribe_base_ms: u64,

    /// Cap on the resubscribe delay in milliseconds
    #[serde(default = "default_resubscribe_max")]
    pub resubscribe_max_ms: u64,

    /// Consecutive failed resubscribes before giving up (0 = retry forever)
    #[serde(default = "default_max_resubscribe_attempts")]
    pub max_resubscribe_attempts: u32,
}

impl Default for DockerConfig {
    fn default() -> Self {
        Self {
            host: None,
            network: None,
            port_label: default_port_label(),
            inspect_timeout_ms: default_inspect_timeout(),
            resubscribe_base_ms: default_resubscribe_base(),
            resubscribe_max_ms: default_resubscribe_max(),
            max_resubscribe_attempts: default_max_resubscribe_attempts(),
        }
    }
}

impl DockerConfig {
    pub fn inspect_timeout(&self) -> Duration {
        Duration::from_millis(self.inspect_timeout_ms)
    }
}

// Default value functions
fn default_listen_port() -> u16 {
    80
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_admin_port() -> u16 {
    9999
}

fn default_pool_max_idle_per_host() -> usize {
    10
}

fn default_pool_idle_timeout() -> u64 {
    90
}

fn default_request_timeout() -> u64 {
    30
}

fn default_connect_timeout() -> u64 {
    5000
}

fn default_upgrade_timeout() -> u64 {
    10
}

fn default_true() -> bool {
    true
}

fn default_port_label() -> String {
    "subroute.port".to_string()
}

fn default_inspect_timeout() -> u64 {
    5000
}

fn default_resubscribe_base() -> u64 {
    500
}

fn default_resubscribe_max() -> u64 {
    30_000
}

fn default_max_resubscribe_attempts() -> u32 {
    10
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> anyhow::Result<Self> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if self.server.admin_port != 0 && self.server.admin_port == self.server.port {
            errors.push(format!(
                "server.admin_port ({}) must differ from server.port",
                self.server.admin_port
            ));
        }
        if self.proxy.request_timeout_secs == 0 {
            errors.push("proxy.request_timeout_secs must be greater than 0".to_string());
        }
        if self.proxy.connect_timeout_ms == 0 {
            errors.push("proxy.connect_timeout_ms must be greater than 0".to_string());
        }
        if self.proxy.upgrade_timeout_secs == 0 {
            errors.push("proxy.upgrade_timeout_secs must be greater than 0".to_string());
        }
        if self.proxy.upgrade_max_lifetime_secs == Some(0) {
            errors.push("proxy.upgrade_max_lifetime_secs must be greater than 0 when set".to_string());
        }
        if self.docker.inspect_timeout_ms == 0 {
            errors.push("docker.inspect_timeout_ms must be greater than 0".to_string());
        }
        if self.docker.resubscribe_base_ms > self.docker.resubscribe_max_ms {
            errors.push(format!(
                "docker.resubscribe_base_ms ({}) must not exceed docker.resubscribe_max_ms ({})",
                self.docker.resubscribe_base_ms, self.docker.resubscribe_max_ms
            ));
        }
        if self.docker.port_label.trim().is_empty() {
            errors.push("docker.port_label must not be empty".to_string());
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_parse_config() {
        let toml = r#"
[server]
port = 8080
bind = "127.0.0.1"
admin_port = 9000
admin_token = "secret"

[proxy]
request_timeout_secs = 60
change_origin = false
upgrade_max_lifetime_secs = 3600

[docker]
host = "unix:///var/run/docker.sock"
network = "apps"
inspect_timeout_ms = 2000
max_resubscribe_attempts = 0
"#;

        let config = Config::from_toml(toml).unwrap();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.server.admin_token.as_deref(), Some("secret"));
        assert_eq!(config.proxy.request_timeout(), Duration::from_secs(60));
        assert!(!config.proxy.change_origin);
        assert_eq!(config.proxy.upgrade_max_lifetime(), Some(Duration::from_secs(3600)));
        assert_eq!(config.docker.network.as_deref(), Some("apps"));
        assert_eq!(config.docker.inspect_timeout(), Duration::from_millis(2000));
        assert_eq!(config.docker.max_resubscribe_attempts, 0);
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = Config::from_toml("").unwrap();
        assert_eq!(config.server.port, 80);
        assert_eq!(config.server.bind, "0.0.0.0");
        assert_eq!(config.server.admin_port, 9999);
        assert_eq!(config.server.pool_max_idle_per_host, 10);
        assert_eq!(config.proxy.request_timeout_secs, 30);
        assert_eq!(config.proxy.connect_timeout(), Duration::from_secs(5));
        assert!(config.proxy.change_origin);
        assert!(config.proxy.upgrade_max_lifetime().is_none());
        assert_eq!(config.docker.port_label, "subroute.port");
        assert_eq!(config.docker.resubscribe_base_ms, 500);
        assert_eq!(config.docker.max_resubscribe_attempts, 10);
    }

    #[test]
    fn test_validation_collects_errors() {
        let toml = r#"
[server]
port = 8080
admin_port = 8080

[proxy]
request_timeout_secs = 0

[docker]
resubscribe_base_ms = 5000
resubscribe_max_ms = 100
"#;
        let err = Config::from_toml(toml).unwrap_err().to_string();
        assert!(err.contains("admin_port"));
        assert!(err.contains("request_timeout_secs"));
        assert!(err.contains("resubscribe_base_ms"));
    }

    #[test]
    fn test_admin_disabled_does_not_conflict() {
        let toml = r#"
[server]
port = 0
admin_port = 0
"#;
        assert!(Config::from_toml(toml).is_ok());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[server]\nport = 8081").unwrap();
        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.server.port, 8081);

        assert!(Config::load("/nonexistent/subroute.toml").is_err());
    }
}
