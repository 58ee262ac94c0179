//! Tunneling adapters for reaching targets through upstream proxies
//!
//! Covers the four combinations of {http, https} target × {plaintext, TLS}
//! upstream proxy, plus the `CONNECT` handshake both the forwarder and the
//! tunnel engine speak.

use std::sync::Arc;

use hyper::Uri;
use rustls::pki_types::ServerName;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::debug;

use crate::error::{Result, RoveError};
use crate::models::UpstreamProxy;

/// Trait for connections established through an upstream proxy
pub trait ProxyConnection: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> ProxyConnection for T {}

pub type BoxedConnection = Box<dyn ProxyConnection>;

/// Scheme of the destination the client asked for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetScheme {
    Http,
    Https,
}

/// A parsed forwarding destination
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Target {
    pub scheme: TargetScheme,
    pub host: String,
    pub port: u16,
}

impl Target {
    /// Parse a fully-qualified target URL from a proxy-style request line
    pub fn from_uri(uri: &Uri) -> Result<Self> {
        let scheme = match uri.scheme_str() {
            Some("http") => TargetScheme::Http,
            Some("https") => TargetScheme::Https,
            Some(other) => {
                return Err(RoveError::InvalidRequest(format!(
                    "Unsupported target scheme: {}",
                    other
                )))
            }
            None => {
                return Err(RoveError::InvalidRequest(
                    "Request target must be an absolute URL".to_string(),
                ))
            }
        };

        let host = uri
            .host()
            .ok_or_else(|| RoveError::InvalidRequest("Missing host in target URL".to_string()))?
            .to_string();

        let port = uri.port_u16().unwrap_or(match scheme {
            TargetScheme::Http => 80,
            TargetScheme::Https => 443,
        });

        Ok(Self { scheme, host, port })
    }

    /// The Host header value recomputed for the outbound request
    pub fn host_header(&self) -> String {
        if self.is_default_port() {
            self.host.clone()
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    fn is_default_port(&self) -> bool {
        matches!(
            (self.scheme, self.port),
            (TargetScheme::Http, 80) | (TargetScheme::Https, 443)
        )
    }
}

/// Parse `host:port` from a CONNECT request target, defaulting to 443 when
/// the port segment is missing or invalid
pub fn parse_authority(authority: &str) -> (String, u16) {
    match authority.rsplit_once(':') {
        Some((host, port)) => match port.parse::<u16>() {
            Ok(port) => (host.to_string(), port),
            Err(_) => (host.to_string(), 443),
        },
        None => (authority.to_string(), 443),
    }
}

/// Builds tunneling adapters for (target scheme, upstream proxy) pairs
///
/// All TLS toward upstream proxies (and toward targets reached through them)
/// skips certificate verification: these are third-party proxies reached by
/// bare address with no trust chain. This is a deliberate compatibility
/// trade-off, not an oversight; the list-source fetch uses normal
/// verification.
pub struct TunnelAgentFactory {
    tls: TlsConnector,
}

impl TunnelAgentFactory {
    pub fn new() -> Self {
        let config = rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoVerifier))
            .with_no_client_auth();

        Self {
            tls: TlsConnector::from(Arc::new(config)),
        }
    }

    /// Open a connection to the upstream proxy itself: plain TCP, or a TLS
    /// handshake for a TLS-speaking proxy.
    ///
    /// `ServerName` parses IP literals as addresses, for which rustls omits
    /// SNI; hostnames get SNI as usual.
    pub async fn dial_proxy(&self, proxy: &UpstreamProxy) -> Result<BoxedConnection> {
        debug!("Dialing upstream proxy {}", proxy);

        let stream = TcpStream::connect((proxy.host.as_str(), proxy.port))
            .await
            .map_err(|e| RoveError::ProxyConnectionFailed(format!("TCP connect failed: {}", e)))?;

        if !proxy.scheme.is_tls() {
            return Ok(Box::new(stream));
        }

        let name = ServerName::try_from(proxy.host.clone()).map_err(|e| {
            RoveError::ProxyConnectionFailed(format!("Invalid proxy host for TLS: {}", e))
        })?;
        let stream = self.tls.connect(name, stream).await.map_err(|e| {
            RoveError::ProxyConnectionFailed(format!("TLS handshake with proxy failed: {}", e))
        })?;

        Ok(Box::new(stream))
    }

    /// Open a stream ready to carry the outbound request for `target`.
    ///
    /// An http target rides the proxy stream directly (the proxy forwards the
    /// absolute-URL request). An https target needs a `CONNECT` tunnel through
    /// the proxy first, then a TLS session to the target layered on top.
    pub async fn open(&self, target: &Target, proxy: &UpstreamProxy) -> Result<BoxedConnection> {
        let mut stream = self.dial_proxy(proxy).await?;

        match target.scheme {
            TargetScheme::Http => Ok(stream),
            TargetScheme::Https => {
                connect_handshake(&mut stream, &target.host, target.port).await?;

                let name = ServerName::try_from(target.host.clone()).map_err(|e| {
                    RoveError::InvalidRequest(format!("Invalid target host for TLS: {}", e))
                })?;
                let stream = self.tls.connect(name, stream).await.map_err(|e| {
                    RoveError::ProxyConnectionFailed(format!(
                        "TLS handshake with {} failed: {}",
                        target.host, e
                    ))
                })?;

                Ok(Box::new(stream))
            }
        }
    }
}

impl Default for TunnelAgentFactory {
    fn default() -> Self {
        Self::new()
    }
}

/// Perform the `CONNECT` handshake over an already-open proxy stream.
///
/// The tunnel is accepted iff the first reply chunk contains the token `200`;
/// anything else, or a connection closed before data arrives, is a failure.
pub async fn connect_handshake<S>(stream: &mut S, host: &str, port: u16) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + ?Sized,
{
    let request = format!(
        "CONNECT {host}:{port} HTTP/1.1\r\nHost: {host}:{port}\r\nProxy-Connection: Keep-Alive\r\n\r\n"
    );

    stream
        .write_all(request.as_bytes())
        .await
        .map_err(|e| RoveError::ConnectFailed(format!("Failed to send CONNECT: {}", e)))?;

    let mut reply = vec![0u8; 1024];
    let n = stream
        .read(&mut reply)
        .await
        .map_err(|e| RoveError::ConnectFailed(format!("Failed to read CONNECT reply: {}", e)))?;

    if n == 0 {
        return Err(RoveError::ConnectFailed(
            "Proxy closed the connection before replying".to_string(),
        ));
    }

    let reply = String::from_utf8_lossy(&reply[..n]);
    if reply.contains("200") {
        debug!("CONNECT tunnel to {}:{} accepted", host, port);
        Ok(())
    } else {
        Err(RoveError::ConnectFailed(
            reply.lines().next().unwrap_or("Unknown reply").to_string(),
        ))
    }
}

/// Accepts any certificate an upstream proxy presents.
///
/// Public rotating proxies have no verifiable identity; refusing their
/// self-signed or mismatched certificates would make the TLS upstream mode
/// unusable. Kept deliberately, flagged as a security trade-off.
#[derive(Debug)]
struct NoVerifier;

impl rustls::client::danger::ServerCertVerifier for NoVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![
            rustls::SignatureScheme::RSA_PKCS1_SHA256,
            rustls::SignatureScheme::RSA_PKCS1_SHA384,
            rustls::SignatureScheme::RSA_PKCS1_SHA512,
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
            rustls::SignatureScheme::ECDSA_NISTP521_SHA512,
            rustls::SignatureScheme::RSA_PSS_SHA256,
            rustls::SignatureScheme::RSA_PSS_SHA384,
            rustls::SignatureScheme::RSA_PSS_SHA512,
            rustls::SignatureScheme::ED25519,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_target_from_uri() {
        let uri: Uri = "http://example.com/path?q=1".parse().unwrap();
        let target = Target::from_uri(&uri).unwrap();
        assert_eq!(target.scheme, TargetScheme::Http);
        assert_eq!(target.host, "example.com");
        assert_eq!(target.port, 80);
        assert_eq!(target.host_header(), "example.com");

        let uri: Uri = "https://example.com:8443/".parse().unwrap();
        let target = Target::from_uri(&uri).unwrap();
        assert_eq!(target.scheme, TargetScheme::Https);
        assert_eq!(target.port, 8443);
        assert_eq!(target.host_header(), "example.com:8443");
    }

    #[test]
    fn test_target_from_uri_rejects_non_absolute() {
        let uri: Uri = "/relative/path".parse().unwrap();
        assert!(matches!(
            Target::from_uri(&uri),
            Err(RoveError::InvalidRequest(_))
        ));

        let uri: Uri = "ftp://example.com/".parse().unwrap();
        assert!(matches!(
            Target::from_uri(&uri),
            Err(RoveError::InvalidRequest(_))
        ));
    }

    #[test]
    fn test_parse_authority_defaults() {
        assert_eq!(
            parse_authority("example.com:8443"),
            ("example.com".to_string(), 8443)
        );
        assert_eq!(
            parse_authority("example.com"),
            ("example.com".to_string(), 443)
        );
        assert_eq!(
            parse_authority("example.com:bogus"),
            ("example.com".to_string(), 443)
        );
    }

    #[tokio::test]
    async fn test_connect_handshake_accepts_200() {
        let (mut client, mut server) = tokio::io::duplex(1024);

        let server_task = tokio::spawn(async move {
            let mut buf = vec![0u8; 1024];
            let n = server.read(&mut buf).await.unwrap();
            let request = String::from_utf8_lossy(&buf[..n]).to_string();
            server
                .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
                .await
                .unwrap();
            request
        });

        connect_handshake(&mut client, "example.com", 443)
            .await
            .unwrap();

        let request = server_task.await.unwrap();
        assert!(request.starts_with("CONNECT example.com:443 HTTP/1.1\r\n"));
        assert!(request.contains("Host: example.com:443\r\n"));
        assert!(request.contains("Proxy-Connection: Keep-Alive\r\n"));
    }

    #[tokio::test]
    async fn test_connect_handshake_rejects_non_200() {
        let (mut client, mut server) = tokio::io::duplex(1024);

        tokio::spawn(async move {
            let mut buf = vec![0u8; 1024];
            let _ = server.read(&mut buf).await.unwrap();
            server
                .write_all(b"HTTP/1.1 407 Proxy Authentication Required\r\n\r\n")
                .await
                .unwrap();
        });

        let err = connect_handshake(&mut client, "example.com", 443)
            .await
            .unwrap_err();
        assert!(matches!(err, RoveError::ConnectFailed(_)));
        assert!(err.to_string().contains("407"));
    }

    #[tokio::test]
    async fn test_connect_handshake_rejects_early_close() {
        let (mut client, mut server) = tokio::io::duplex(1024);

        tokio::spawn(async move {
            let mut buf = vec![0u8; 1024];
            let _ = server.read(&mut buf).await.unwrap();
            // Drop without replying
        });

        let err = connect_handshake(&mut client, "example.com", 443)
            .await
            .unwrap_err();
        assert!(matches!(err, RoveError::ConnectFailed(_)));
    }
}
