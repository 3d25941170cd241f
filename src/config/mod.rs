//! Configuration management

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Default number of concurrent streams per session
pub const DEFAULT_MAX_CONN: usize = 16;

/// Default cipher for pre-shared key transports
pub const DEFAULT_CIPHER: &str = "aes";

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config: {0}")]
    Read(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("Invalid port range: {0}")]
    InvalidPortRange(String),

    #[error("Missing {field} for server {server}")]
    MissingMaterial { server: String, field: &'static str },

    #[error("Unknown crypt mode: {0}")]
    UnknownCryptMode(String),

    #[error("No [{0}] section in config file")]
    MissingSection(&'static str),

    #[error("No servers configured")]
    NoServers,

    #[error("No proxy listener configured (socks, http or transparent)")]
    NoListener,

    #[error("Invalid logging setup: {0}")]
    Logging(String),
}

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Client configuration
    pub client: Option<ClientConfig>,
    /// Server configuration
    pub server: Option<ServerConfig>,
    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    /// Parse configuration from a TOML string
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let mut config: Config = toml::from_str(content)?;
        if let Some(client) = config.client.as_mut() {
            client.apply_defaults();
        }
        Ok(config)
    }

    /// Save configuration to file
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

/// Encryption applied to the raw connection before the tunnel handshake
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CryptMode {
    /// TLS handshake against configured trust roots
    Tls,
    /// Pre-shared key stream cipher with the named algorithm
    Cipher(String),
}

/// One remote server candidate
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerDefine {
    /// `host:port` or `host:low-high`
    pub server: String,
    /// `tls` or `cipher`
    #[serde(default = "default_crypt_mode")]
    pub crypt_mode: String,
    /// Cipher name (`aes`, `chacha20`); empty means the default
    #[serde(default)]
    pub cipher: String,
    /// Pre-shared key for cipher mode
    #[serde(default)]
    pub key: String,
    /// PEM trust roots for tls mode
    pub root_cas: Option<String>,
    /// PEM client certificate for mutual TLS
    pub cert_file: Option<String>,
    /// PEM client key for mutual TLS
    pub cert_key_file: Option<String>,
    /// TLS server name; defaults to the host part of `server`
    pub server_name: Option<String>,
    /// Tunnel credentials
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
}

fn default_crypt_mode() -> String {
    "cipher".to_string()
}

impl ServerDefine {
    /// Cipher-mode server definition with the default cipher
    pub fn with_key(server: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            server: server.into(),
            crypt_mode: default_crypt_mode(),
            cipher: String::new(),
            key: key.into(),
            root_cas: None,
            cert_file: None,
            cert_key_file: None,
            server_name: None,
            username: String::new(),
            password: String::new(),
        }
    }

    /// Set tunnel credentials
    pub fn credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.username = username.into();
        self.password = password.into();
        self
    }

    /// Resolved crypt mode
    pub fn crypt_mode(&self) -> Result<CryptMode, ConfigError> {
        match self.crypt_mode.to_lowercase().as_str() {
            "tls" => Ok(CryptMode::Tls),
            "cipher" | "" => {
                let cipher = if self.cipher.is_empty() {
                    DEFAULT_CIPHER.to_string()
                } else {
                    self.cipher.to_lowercase()
                };
                Ok(CryptMode::Cipher(cipher))
            }
            other => Err(ConfigError::UnknownCryptMode(other.to_string())),
        }
    }

    /// Host part of the server address
    pub fn host(&self) -> Result<&str, ConfigError> {
        split_host_port(&self.server).map(|(host, _)| host)
    }

    /// Pick the address for one connection attempt.
    ///
    /// A single port is returned unchanged. A `low-high` range yields a
    /// uniformly random port in `[low, high)`.
    pub fn server_addr<R: Rng + ?Sized>(&self, rng: &mut R) -> Result<String, ConfigError> {
        let (host, port) = split_host_port(&self.server)?;

        let Some((low, high)) = port.split_once('-') else {
            return Ok(self.server.clone());
        };

        let invalid = || ConfigError::InvalidPortRange(self.server.clone());
        let low: u16 = low.trim().parse().map_err(|_| invalid())?;
        let high: u16 = high.trim().parse().map_err(|_| invalid())?;
        if high <= low {
            return Err(invalid());
        }

        let port = rng.gen_range(low..high);
        if host.contains(':') {
            Ok(format!("[{}]:{}", host, port))
        } else {
            Ok(format!("{}:{}", host, port))
        }
    }

    fn validate(&self) -> Result<(), ConfigError> {
        split_host_port(&self.server)?;
        match self.crypt_mode()? {
            CryptMode::Tls => {
                if self.cert_file.is_some() != self.cert_key_file.is_some() {
                    return Err(ConfigError::MissingMaterial {
                        server: self.server.clone(),
                        field: "cert_file/cert_key_file pair",
                    });
                }
            }
            CryptMode::Cipher(_) => {
                if self.key.is_empty() {
                    return Err(ConfigError::MissingMaterial {
                        server: self.server.clone(),
                        field: "key",
                    });
                }
            }
        }
        Ok(())
    }
}

/// Split `host:port`, accepting `[v6]:port`
pub fn split_host_port(addr: &str) -> Result<(&str, &str), ConfigError> {
    let invalid = || ConfigError::InvalidAddress(addr.to_string());

    if let Some(rest) = addr.strip_prefix('[') {
        let (host, port) = rest.split_once("]:").ok_or_else(invalid)?;
        if port.is_empty() {
            return Err(invalid());
        }
        return Ok((host, port));
    }

    let (host, port) = addr.rsplit_once(':').ok_or_else(invalid)?;
    if host.contains(':') || port.is_empty() {
        return Err(invalid());
    }
    Ok((host, port))
}

/// Static port forward through the tunnel
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortMap {
    /// Local listen address
    pub listen: String,
    /// Destination reached through the tunnel
    pub target: String,
}

/// Timeouts in seconds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Timeouts {
    /// TCP connect
    pub connect: u64,
    /// Encrypted transport + tunnel handshake, and stream-open replies
    pub handshake: u64,
    /// Session closed after this long without inbound frames
    pub idle: u64,
    /// Keepalive ping interval
    pub keepalive: u64,
    /// Pool maintenance interval
    pub maintenance: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            connect: 10,
            handshake: crate::protocol::HANDSHAKE_TIMEOUT,
            idle: crate::protocol::IDLE_TIMEOUT,
            keepalive: crate::protocol::KEEPALIVE_INTERVAL,
            maintenance: 5,
        }
    }
}

impl Timeouts {
    pub fn connect(&self) -> Duration {
        Duration::from_secs(self.connect)
    }

    pub fn handshake(&self) -> Duration {
        Duration::from_secs(self.handshake)
    }

    pub fn idle(&self) -> Duration {
        Duration::from_secs(self.idle)
    }

    pub fn keepalive(&self) -> Duration {
        Duration::from_secs(self.keepalive)
    }

    pub fn maintenance(&self) -> Duration {
        Duration::from_secs(self.maintenance)
    }
}

/// Client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// SOCKS5 listen address
    pub socks: Option<String>,
    pub socks_user: Option<String>,
    pub socks_pwd: Option<String>,
    /// HTTP proxy listen address
    pub http: Option<String>,
    pub http_user: Option<String>,
    pub http_pwd: Option<String>,
    /// Transparent (NAT redirect) listen address
    pub transparent: Option<String>,
    /// Rule file of destinations dialed directly
    pub direct_routes: Option<String>,
    /// Rule file of destinations that are refused
    pub prohibited_routes: Option<String>,
    /// Sessions kept warm
    pub min_sess: usize,
    /// Streams per session before another session is created
    pub max_conn: usize,
    /// Local UDP DNS listener
    pub dns_server: Option<String>,
    /// Upstream DNS server reached through the tunnel
    pub dns_upstream: String,
    /// `system` or `internal` (resolve through the tunnel)
    pub dns_net: String,
    /// Candidate servers, tried in order
    pub servers: Vec<ServerDefine>,
    /// Static port forwards
    pub portmaps: Vec<PortMap>,
    pub timeouts: Timeouts,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            socks: None,
            socks_user: None,
            socks_pwd: None,
            http: None,
            http_user: None,
            http_pwd: None,
            transparent: None,
            direct_routes: None,
            prohibited_routes: None,
            min_sess: 0,
            max_conn: DEFAULT_MAX_CONN,
            dns_server: None,
            dns_upstream: "8.8.8.8:53".to_string(),
            dns_net: "system".to_string(),
            servers: Vec::new(),
            portmaps: Vec::new(),
            timeouts: Timeouts::default(),
        }
    }
}

impl ClientConfig {
    fn apply_defaults(&mut self) {
        if self.max_conn == 0 {
            self.max_conn = DEFAULT_MAX_CONN;
        }
    }

    /// Check the settings that are fatal at startup
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.socks.is_none() && self.http.is_none() && self.transparent.is_none() {
            return Err(ConfigError::NoListener);
        }
        if self.servers.is_empty() {
            return Err(ConfigError::NoServers);
        }
        for server in &self.servers {
            server.validate()?;
        }
        Ok(())
    }

    /// Whether DNS lookups should go through the tunnel
    pub fn internal_dns(&self) -> bool {
        self.dns_net.eq_ignore_ascii_case("internal")
    }
}

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen address
    pub listen: String,
    /// `tls` or `cipher`
    pub crypt_mode: String,
    pub cipher: String,
    pub key: String,
    /// PEM certificate chain and key for tls mode
    pub cert_file: Option<String>,
    pub cert_key_file: Option<String>,
    /// PEM roots used to verify client certificates; enables mutual TLS
    pub root_cas: Option<String>,
    /// Accepted tunnel credentials
    pub users: HashMap<String, String>,
    /// Concurrent streams accepted per session
    pub max_streams: usize,
    pub timeouts: Timeouts,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:5233".to_string(),
            crypt_mode: default_crypt_mode(),
            cipher: String::new(),
            key: String::new(),
            cert_file: None,
            cert_key_file: None,
            root_cas: None,
            users: HashMap::new(),
            max_streams: 1024,
            timeouts: Timeouts::default(),
        }
    }
}

impl ServerConfig {
    /// Resolved crypt mode
    pub fn crypt_mode(&self) -> Result<CryptMode, ConfigError> {
        match self.crypt_mode.to_lowercase().as_str() {
            "tls" => Ok(CryptMode::Tls),
            "cipher" | "" => Ok(CryptMode::Cipher(if self.cipher.is_empty() {
                DEFAULT_CIPHER.to_string()
            } else {
                self.cipher.to_lowercase()
            })),
            other => Err(ConfigError::UnknownCryptMode(other.to_string())),
        }
    }

    /// Check the settings that are fatal at startup
    pub fn validate(&self) -> Result<(), ConfigError> {
        split_host_port(&self.listen)?;
        let missing = |field| ConfigError::MissingMaterial {
            server: self.listen.clone(),
            field,
        };
        match self.crypt_mode()? {
            CryptMode::Tls => {
                if self.cert_file.is_none() {
                    return Err(missing("cert_file"));
                }
                if self.cert_key_file.is_none() {
                    return Err(missing("cert_key_file"));
                }
            }
            CryptMode::Cipher(_) => {
                if self.key.is_empty() {
                    return Err(missing("key"));
                }
            }
        }
        Ok(())
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error) or an EnvFilter directive
    pub level: String,
    /// Log format (pretty, json, compact)
    pub format: String,
    /// Log file path (optional)
    pub file: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file: None,
        }
    }
}

/// Generate example configuration
pub fn generate_example_config() -> Config {
    let mut client = ClientConfig {
        socks: Some("127.0.0.1:1080".to_string()),
        http: Some("127.0.0.1:8080".to_string()),
        ..ClientConfig::default()
    };
    client.servers.push(
        ServerDefine::with_key("proxy.example.com:5233-5243", "change-me").credentials("user", "pass"),
    );
    let mut server = ServerConfig {
        key: "change-me".to_string(),
        ..ServerConfig::default()
    };
    server.users.insert("user".to_string(), "pass".to_string());

    Config {
        client: Some(client),
        server: Some(server),
        logging: LoggingConfig::default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_single_port_unchanged() {
        let sd = ServerDefine::with_key("example.com:443", "k");
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..10 {
            assert_eq!(sd.server_addr(&mut rng).unwrap(), "example.com:443");
        }
    }

    #[test]
    fn test_port_range_stays_in_bounds() {
        let sd = ServerDefine::with_key("10.1.1.1:5000-5010", "k");
        let mut rng = StdRng::seed_from_u64(42);
        let mut seen = std::collections::HashSet::new();
        for _ in 0..500 {
            let addr = sd.server_addr(&mut rng).unwrap();
            let port: u16 = addr.rsplit_once(':').unwrap().1.parse().unwrap();
            assert!((5000..5010).contains(&port), "port {} out of range", port);
            seen.insert(port);
        }
        // high bound is exclusive
        assert!(!seen.contains(&5010));
        assert!(seen.len() > 1);
    }

    #[test]
    fn test_port_range_deterministic_with_seed() {
        let sd = ServerDefine::with_key("host:1000-2000", "k");
        let a = sd.server_addr(&mut StdRng::seed_from_u64(1)).unwrap();
        let b = sd.server_addr(&mut StdRng::seed_from_u64(1)).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_malformed_port_range() {
        let mut rng = StdRng::seed_from_u64(0);
        for bad in ["host:abc-10", "host:10-xyz", "host:20-10", "host:5-5"] {
            let sd = ServerDefine::with_key(bad, "k");
            assert!(matches!(
                sd.server_addr(&mut rng),
                Err(ConfigError::InvalidPortRange(_))
            ));
        }
        let sd = ServerDefine::with_key("no-port", "k");
        assert!(matches!(sd.server_addr(&mut rng), Err(ConfigError::InvalidAddress(_))));
    }

    #[test]
    fn test_ipv6_range() {
        let sd = ServerDefine::with_key("[::1]:7000-7001", "k");
        let addr = sd.server_addr(&mut StdRng::seed_from_u64(3)).unwrap();
        assert_eq!(addr, "[::1]:7000");
    }

    #[test]
    fn test_parse_client_config_defaults() {
        let config = Config::parse(
            r#"
            [client]
            socks = "127.0.0.1:1080"
            min_sess = 2
            max_conn = 0

            [[client.servers]]
            server = "1.2.3.4:443"
            key = "secret"
            username = "u"
            password = "p"
            "#,
        )
        .unwrap();

        let client = config.client.unwrap();
        assert_eq!(client.max_conn, DEFAULT_MAX_CONN);
        assert_eq!(client.min_sess, 2);
        assert_eq!(
            client.servers[0].crypt_mode().unwrap(),
            CryptMode::Cipher("aes".to_string())
        );
        assert!(client.validate().is_ok());
        assert_eq!(config.logging.level, "info");
    }

    #[test]
    fn test_validate_requires_listener() {
        let client = ClientConfig {
            servers: vec![ServerDefine::with_key("1.2.3.4:1", "k")],
            ..ClientConfig::default()
        };
        assert!(matches!(client.validate(), Err(ConfigError::NoListener)));
    }

    #[test]
    fn test_validate_requires_key() {
        let client = ClientConfig {
            socks: Some("127.0.0.1:0".to_string()),
            servers: vec![ServerDefine::with_key("1.2.3.4:1", "")],
            ..ClientConfig::default()
        };
        assert!(matches!(
            client.validate(),
            Err(ConfigError::MissingMaterial { field: "key", .. })
        ));
    }

    #[test]
    fn test_port_range_not_validated_at_load() {
        let client = ClientConfig {
            http: Some("127.0.0.1:0".to_string()),
            servers: vec![ServerDefine::with_key("1.2.3.4:x-y", "k")],
            ..ClientConfig::default()
        };
        assert!(client.validate().is_ok());
    }

    #[test]
    fn test_example_config_roundtrip() {
        let config = generate_example_config();
        let text = toml::to_string_pretty(&config).unwrap();
        let parsed = Config::parse(&text).unwrap();
        assert_eq!(parsed.client.unwrap().servers.len(), 1);
        assert_eq!(parsed.server.unwrap().users.get("user").unwrap(), "pass");
    }
}
