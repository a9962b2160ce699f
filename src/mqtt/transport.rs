//! Broker transport: URI parsing, TCP and TLS streams

use std::fmt;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::rustls::pki_types::pem::PemObject;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use tokio_rustls::rustls::{ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;
use tracing::{debug, warn};

use super::ConnectError;
use crate::config::BrokerTlsConfig;

const DEFAULT_TCP_PORT: u16 = 1883;
const DEFAULT_TLS_PORT: u16 = 8883;

/// A byte stream to the broker, plain or TLS
pub trait BrokerStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> BrokerStream for T {}

/// Parsed broker address
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerAddr {
    /// Host name or IP literal, without brackets
    pub host: String,
    pub port: u16,
    pub tls: bool,
}

impl BrokerAddr {
    /// Parse a broker URI such as `tcp://[::1]:1883` or `mqtts://broker`.
    ///
    /// Accepted schemes are tcp/mqtt for plain TCP and ssl/tls/mqtts/tcps
    /// for TLS. Any path component is ignored.
    pub fn parse(uri: &str) -> Result<Self, ConnectError> {
        let invalid = |msg: &str| ConnectError::InvalidUri(format!("{}: {}", msg, uri));

        let (scheme, rest) = uri
            .split_once("://")
            .ok_or_else(|| invalid("missing scheme"))?;

        let tls = match scheme.to_ascii_lowercase().as_str() {
            "tcp" | "mqtt" => false,
            "ssl" | "tls" | "mqtts" | "tcps" => true,
            _ => return Err(invalid("unsupported scheme")),
        };
        let default_port = if tls { DEFAULT_TLS_PORT } else { DEFAULT_TCP_PORT };

        let authority = rest.split('/').next().unwrap_or("");
        if authority.contains('@') {
            return Err(invalid("credentials in URI are not supported"));
        }

        let (host, port) = if let Some(bracketed) = authority.strip_prefix('[') {
            let (host, after) = bracketed
                .split_once(']')
                .ok_or_else(|| invalid("unterminated IPv6 literal"))?;
            let port = match after {
                "" => None,
                _ => Some(
                    after
                        .strip_prefix(':')
                        .ok_or_else(|| invalid("unexpected characters after IPv6 literal"))?,
                ),
            };
            (host, port)
        } else {
            match authority.split_once(':') {
                Some((host, port)) => {
                    if port.contains(':') {
                        return Err(invalid("IPv6 literals must be enclosed in brackets"));
                    }
                    (host, Some(port))
                }
                None => (authority, None),
            }
        };

        if host.is_empty() {
            return Err(invalid("missing host"));
        }

        let port = match port {
            Some(p) => p.parse::<u16>().map_err(|_| invalid("invalid port"))?,
            None => default_port,
        };

        Ok(Self {
            host: host.to_string(),
            port,
            tls,
        })
    }
}

impl fmt::Display for BrokerAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let scheme = if self.tls { "tls" } else { "tcp" };
        if self.host.contains(':') {
            write!(f, "{}://[{}]:{}", scheme, self.host, self.port)
        } else {
            write!(f, "{}://{}:{}", scheme, self.host, self.port)
        }
    }
}

/// Open a stream to the broker, performing the TLS handshake when required
pub(crate) async fn open(
    addr: &BrokerAddr,
    tls: Option<&TlsConnector>,
) -> Result<Box<dyn BrokerStream>, ConnectError> {
    let stream = TcpStream::connect((addr.host.as_str(), addr.port)).await?;
    stream.set_nodelay(true)?;
    debug!("TCP connected to {}", addr);

    if !addr.tls {
        return Ok(Box::new(stream));
    }

    let connector = tls.ok_or_else(|| {
        ConnectError::Tls(TlsError::Setup("no TLS connector for a TLS URI".to_string()))
    })?;
    let server_name = ServerName::try_from(addr.host.clone())
        .map_err(|e| TlsError::Setup(format!("invalid server name: {}", e)))?;
    let stream = connector.connect(server_name, stream).await?;
    debug!("TLS handshake with {} complete", addr);

    Ok(Box::new(stream))
}

/// TLS material could not be loaded or combined
#[derive(Debug)]
pub enum TlsError {
    Read(PathBuf, std::io::Error),
    /// PEM file holds no usable certificate
    Certificate(PathBuf, String),
    PrivateKey(PathBuf, String),
    /// rustls refused the assembled configuration
    Setup(String),
}

impl fmt::Display for TlsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TlsError::Read(path, e) => write!(f, "cannot read {}: {}", path.display(), e),
            TlsError::Certificate(path, why) => {
                write!(f, "bad certificate in {}: {}", path.display(), why)
            }
            TlsError::PrivateKey(path, why) => {
                write!(f, "bad private key in {}: {}", path.display(), why)
            }
            TlsError::Setup(why) => write!(f, "TLS setup failed: {}", why),
        }
    }
}

impl std::error::Error for TlsError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TlsError::Read(_, e) => Some(e),
            _ => None,
        }
    }
}

fn open_pem(path: &Path) -> Result<BufReader<File>, TlsError> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|e| TlsError::Read(path.to_path_buf(), e))
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let bad = |why: String| TlsError::Certificate(path.to_path_buf(), why);

    let certs = CertificateDer::pem_reader_iter(open_pem(path)?)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| bad(e.to_string()))?;
    if certs.is_empty() {
        return Err(bad("no PEM certificate found".to_string()));
    }
    Ok(certs)
}

fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, TlsError> {
    PrivateKeyDer::from_pem_reader(open_pem(path)?)
        .map_err(|e| TlsError::PrivateKey(path.to_path_buf(), e.to_string()))
}

/// Build a TLS connector trusting the platform roots plus any configured CA
pub(crate) fn build_connector(config: &BrokerTlsConfig) -> Result<TlsConnector, TlsError> {
    let mut roots = RootCertStore::empty();

    let native = rustls_native_certs::load_native_certs();
    for e in &native.errors {
        warn!("Failed to load a platform root certificate: {}", e);
    }
    let (added, ignored) = roots.add_parsable_certificates(native.certs);
    debug!("Loaded {} platform root certificates ({} ignored)", added, ignored);

    if let Some(ref ca_file) = config.ca_file {
        for cert in load_certs(ca_file)? {
            roots
                .add(cert)
                .map_err(|e| TlsError::Certificate(ca_file.clone(), e.to_string()))?;
        }
    }

    if roots.is_empty() {
        return Err(TlsError::Setup("no trusted root certificates".to_string()));
    }

    let builder = ClientConfig::builder().with_root_certificates(roots);
    let client_config = match (&config.client_cert, &config.client_key) {
        (Some(cert), Some(key)) => builder
            .with_client_auth_cert(load_certs(cert)?, load_private_key(key)?)
            .map_err(|e| TlsError::Setup(e.to_string()))?,
        _ => builder.with_no_client_auth(),
    };

    Ok(TlsConnector::from(Arc::new(client_config)))
}
