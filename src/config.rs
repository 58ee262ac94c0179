use crate::error::{Result, RoveError};
use crate::models::ProxyScheme;
use std::env;
use url::Url;

/// Default User-Agent substituted when a client request carries none
pub const DEFAULT_USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) \
     Chrome/120.0.0.0 Safari/537.36";

const DEFAULT_LIST_URL: &str =
    "https://api.proxyscrape.com/v2/?request=displayproxies&protocol=http&timeout=10000";

/// Application configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    /// Gateway listener and forwarding behavior
    pub gateway: GatewayConfig,
    /// Proxy-list source and refresh cycle
    pub list: ListSourceConfig,
    /// Domain-affinity cache
    pub affinity: AffinityConfig,
    /// Logging configuration
    pub log: LogConfig,
}

#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Port for the gateway listener (default: 8080)
    pub port: u16,
    /// Host to bind to (default: 0.0.0.0)
    pub host: String,
    /// Maximum retry attempts for failed requests
    pub max_retries: u32,
    /// Connection timeout in seconds
    pub connect_timeout: u64,
    /// Request timeout in seconds (plain-HTTP forwarding path)
    pub request_timeout: u64,
    /// User-Agent substituted on outbound requests that carry none
    pub user_agent: String,
}

#[derive(Debug, Clone)]
pub struct ListSourceConfig {
    /// URL serving the plaintext proxy list, one `address:port[:extra]` per line
    pub url: String,
    /// Refresh interval in seconds; also drives the affinity-cache flush
    pub refresh_interval: u64,
    /// Scheme spoken toward every proxy in the pool
    pub upstream_scheme: ProxyScheme,
}

#[derive(Debug, Clone)]
pub struct AffinityConfig {
    /// Time-to-live for a domain's remembered proxy, in seconds
    pub ttl: u64,
}

#[derive(Debug, Clone)]
pub struct LogConfig {
    /// Log level (debug, info, warn, error)
    pub level: String,
    /// Output format (json, pretty)
    pub format: String,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let list_url = get_env_or("PROXY_LIST_URL", DEFAULT_LIST_URL);
        Url::parse(&list_url).map_err(|e| {
            RoveError::InvalidConfig(format!("PROXY_LIST_URL must be a valid URL: {}", e))
        })?;

        let upstream_scheme = {
            let raw = get_env_or("PROXY_UPSTREAM_SCHEME", "http");
            ProxyScheme::from_str(&raw).ok_or_else(|| {
                RoveError::InvalidConfig(format!(
                    "PROXY_UPSTREAM_SCHEME must be http or https, got: {}",
                    raw
                ))
            })?
        };

        Ok(Config {
            gateway: GatewayConfig {
                port: get_env_or("PROXY_PORT", "8080").parse().map_err(|_| {
                    RoveError::InvalidConfig("PROXY_PORT must be a valid port number".into())
                })?,
                host: get_env_or("PROXY_HOST", "0.0.0.0"),
                max_retries: get_env_or("PROXY_MAX_RETRIES", "3").parse().unwrap_or(3),
                connect_timeout: get_env_or("PROXY_CONNECT_TIMEOUT", "10")
                    .parse()
                    .unwrap_or(10),
                request_timeout: get_env_or("PROXY_REQUEST_TIMEOUT", "10")
                    .parse()
                    .unwrap_or(10),
                user_agent: get_env_or("PROXY_USER_AGENT", DEFAULT_USER_AGENT),
            },
            list: ListSourceConfig {
                url: list_url,
                refresh_interval: get_env_or("PROXY_LIST_REFRESH", "300")
                    .parse()
                    .unwrap_or(300),
                upstream_scheme,
            },
            affinity: AffinityConfig {
                ttl: get_env_or("AFFINITY_TTL", "300").parse().unwrap_or(300),
            },
            log: LogConfig {
                level: get_env_or("LOG_LEVEL", "info"),
                format: get_env_or("LOG_FORMAT", "pretty"),
            },
        })
    }

    /// Get the gateway listener address
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.gateway.host, self.gateway.port)
    }
}

/// Get environment variable with a default value
fn get_env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::sync::Mutex;

    static ENV_LOCK: Mutex<()> = Mutex::new(());

    const CONFIG_ENV_KEYS: &[&str] = &[
        "PROXY_PORT",
        "PROXY_HOST",
        "PROXY_MAX_RETRIES",
        "PROXY_CONNECT_TIMEOUT",
        "PROXY_REQUEST_TIMEOUT",
        "PROXY_USER_AGENT",
        "PROXY_LIST_URL",
        "PROXY_LIST_REFRESH",
        "PROXY_UPSTREAM_SCHEME",
        "AFFINITY_TTL",
        "LOG_LEVEL",
        "LOG_FORMAT",
    ];

    struct EnvGuard {
        saved: Vec<(String, Option<String>)>,
    }

    impl EnvGuard {
        fn new(keys: &[&str]) -> Self {
            let saved = keys
                .iter()
                .map(|&key| {
                    let old = env::var(key).ok();
                    env::remove_var(key);
                    (key.to_string(), old)
                })
                .collect();

            Self { saved }
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            for (key, value) in self.saved.drain(..) {
                match value {
                    Some(v) => env::set_var(key, v),
                    None => env::remove_var(key),
                }
            }
        }
    }

    #[test]
    fn test_config_from_env_defaults() {
        let _lock = ENV_LOCK.lock().unwrap();
        let _guard = EnvGuard::new(CONFIG_ENV_KEYS);

        let config = Config::from_env().unwrap();

        assert_eq!(config.gateway.port, 8080);
        assert_eq!(config.gateway.host, "0.0.0.0");
        assert_eq!(config.gateway.max_retries, 3);
        assert_eq!(config.gateway.request_timeout, 10);
        assert_eq!(config.gateway.user_agent, DEFAULT_USER_AGENT);

        assert_eq!(config.list.url, DEFAULT_LIST_URL);
        assert_eq!(config.list.refresh_interval, 300);
        assert_eq!(config.list.upstream_scheme, ProxyScheme::Http);

        assert_eq!(config.affinity.ttl, 300);
        assert_eq!(config.log.level, "info");
    }

    #[test]
    fn test_config_from_env_overrides() {
        let _lock = ENV_LOCK.lock().unwrap();
        let _guard = EnvGuard::new(CONFIG_ENV_KEYS);

        env::set_var("PROXY_PORT", "9090");
        env::set_var("PROXY_HOST", "127.0.0.1");
        env::set_var("PROXY_MAX_RETRIES", "5");
        env::set_var("PROXY_LIST_URL", "https://lists.example/proxies.txt");
        env::set_var("PROXY_LIST_REFRESH", "60");
        env::set_var("PROXY_UPSTREAM_SCHEME", "https");
        env::set_var("AFFINITY_TTL", "120");

        let config = Config::from_env().unwrap();

        assert_eq!(config.gateway.port, 9090);
        assert_eq!(config.gateway.host, "127.0.0.1");
        assert_eq!(config.gateway.max_retries, 5);
        assert_eq!(config.list.url, "https://lists.example/proxies.txt");
        assert_eq!(config.list.refresh_interval, 60);
        assert_eq!(config.list.upstream_scheme, ProxyScheme::Https);
        assert_eq!(config.affinity.ttl, 120);
        assert_eq!(config.listen_addr(), "127.0.0.1:9090");
    }

    #[test]
    fn test_config_from_env_invalid_port() {
        let _lock = ENV_LOCK.lock().unwrap();
        let _guard = EnvGuard::new(CONFIG_ENV_KEYS);

        env::set_var("PROXY_PORT", "not-a-port");
        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, RoveError::InvalidConfig(_)));
    }

    #[test]
    fn test_config_from_env_invalid_list_url() {
        let _lock = ENV_LOCK.lock().unwrap();
        let _guard = EnvGuard::new(CONFIG_ENV_KEYS);

        env::set_var("PROXY_LIST_URL", "not a url");
        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, RoveError::InvalidConfig(_)));
    }

    #[test]
    fn test_config_from_env_invalid_upstream_scheme() {
        let _lock = ENV_LOCK.lock().unwrap();
        let _guard = EnvGuard::new(CONFIG_ENV_KEYS);

        env::set_var("PROXY_UPSTREAM_SCHEME", "socks5");
        let err = Config::from_env().unwrap_err();
        assert!(matches!(err, RoveError::InvalidConfig(_)));
    }
}
