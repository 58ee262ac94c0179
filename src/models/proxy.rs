/// Wire scheme spoken toward an upstream proxy
///
/// Fixed per process: every endpoint in the pool is treated as the same type,
/// either plaintext HTTP or TLS.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProxyScheme {
    #[default]
    Http,
    Https,
}

impl ProxyScheme {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProxyScheme::Http => "http",
            ProxyScheme::Https => "https",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "http" => Some(ProxyScheme::Http),
            "https" => Some(ProxyScheme::Https),
            _ => None,
        }
    }

    pub fn is_tls(&self) -> bool {
        matches!(self, ProxyScheme::Https)
    }
}

impl std::fmt::Display for ProxyScheme {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// An upstream proxy endpoint
///
/// Immutable once constructed; the pool replaces its whole sequence of these
/// on every refresh instead of mutating entries in place.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamProxy {
    pub scheme: ProxyScheme,
    pub host: String,
    pub port: u16,
}

impl UpstreamProxy {
    pub fn new(scheme: ProxyScheme, host: impl Into<String>, port: u16) -> Self {
        Self {
            scheme,
            host: host.into(),
            port,
        }
    }

    /// Parse one proxy-list line of the form `address:port[:extra-fields...]`.
    ///
    /// Only the first two colon-delimited fields are used; lines that do not
    /// yield a usable address and port are discarded.
    pub fn from_list_line(line: &str, scheme: ProxyScheme) -> Option<Self> {
        let mut fields = line.trim().split(':');
        let host = fields.next()?.trim();
        let port = fields.next()?.trim().parse::<u16>().ok()?;

        if host.is_empty() {
            return None;
        }

        Some(Self::new(scheme, host, port))
    }

    /// The `host:port` form used for dialing and for CONNECT targets
    pub fn authority(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl std::fmt::Display for UpstreamProxy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}://{}:{}", self.scheme, self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_proxy_scheme_parsing_and_helpers() {
        assert_eq!(ProxyScheme::from_str("HTTP"), Some(ProxyScheme::Http));
        assert_eq!(ProxyScheme::from_str("https"), Some(ProxyScheme::Https));
        assert_eq!(ProxyScheme::from_str("socks5"), None);

        assert!(ProxyScheme::Https.is_tls());
        assert!(!ProxyScheme::Http.is_tls());

        assert_eq!(ProxyScheme::Https.to_string(), "https");
    }

    #[test]
    fn test_from_list_line_with_extra_fields() {
        let proxy = UpstreamProxy::from_list_line("1.2.3.4:8080:US", ProxyScheme::Http).unwrap();
        assert_eq!(proxy.host, "1.2.3.4");
        assert_eq!(proxy.port, 8080);
        assert_eq!(proxy.scheme, ProxyScheme::Http);
    }

    #[test]
    fn test_from_list_line_rejects_unusable_lines() {
        assert!(UpstreamProxy::from_list_line("", ProxyScheme::Http).is_none());
        assert!(UpstreamProxy::from_list_line("just-a-host", ProxyScheme::Http).is_none());
        assert!(UpstreamProxy::from_list_line("1.2.3.4:notaport", ProxyScheme::Http).is_none());
        assert!(UpstreamProxy::from_list_line(":8080", ProxyScheme::Http).is_none());
        assert!(UpstreamProxy::from_list_line("1.2.3.4:99999", ProxyScheme::Http).is_none());
    }

    #[test]
    fn test_from_list_line_trims_whitespace() {
        let proxy =
            UpstreamProxy::from_list_line("  5.6.7.8:3128  ", ProxyScheme::Https).unwrap();
        assert_eq!(proxy.authority(), "5.6.7.8:3128");
        assert_eq!(proxy.to_string(), "https://5.6.7.8:3128");
    }

    #[test]
    fn test_endpoint_equality_is_by_value() {
        let a = UpstreamProxy::new(ProxyScheme::Http, "1.2.3.4", 8080);
        let b = UpstreamProxy::new(ProxyScheme::Http, "1.2.3.4", 8080);
        let c = UpstreamProxy::new(ProxyScheme::Http, "1.2.3.4", 8081);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
