//! TLS credentials.

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rustls::ServerConfig;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};

use super::Protocol;
use crate::config::Config;
use crate::error::{Error, Result};

const DEFAULT_KEY: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/ssl/private-key.pem");
const DEFAULT_CERT: &str = concat!(env!("CARGO_MANIFEST_DIR"), "/ssl/cert.pem");

/// Where the key and certificate chain come from.
#[derive(Debug, Clone, PartialEq)]
pub(crate) enum Credentials {
    Pair { key: PathBuf, cert: PathBuf },
    /// One PEM file holding both.
    Bundle(PathBuf),
}

impl Credentials {
    pub(crate) fn from_config(config: &Config) -> Self {
        match (&config.key, &config.cert, &config.pfx) {
            (_, _, Some(pfx)) => Self::Bundle(pfx.clone()),
            (Some(key), Some(cert), None) => Self::Pair { key: key.clone(), cert: cert.clone() },
            _ => Self::Pair { key: DEFAULT_KEY.into(), cert: DEFAULT_CERT.into() },
        }
    }

    fn read(&self) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
        let (key_path, cert_path) = match self {
            Self::Pair { key, cert } => (key.as_path(), cert.as_path()),
            Self::Bundle(path) => (path.as_path(), path.as_path()),
        };
        let certs = rustls_pemfile::certs(&mut reader(cert_path)?)
            .collect::<std::io::Result<Vec<_>>>()
            .map_err(|e| Error::Config(format!("{}: {e}", cert_path.display())))?;
        if certs.is_empty() {
            return Err(Error::Config(format!("{}: no certificates found", cert_path.display())));
        }
        let key = rustls_pemfile::private_key(&mut reader(key_path)?)
            .map_err(|e| Error::Config(format!("{}: {e}", key_path.display())))?
            .ok_or_else(|| Error::Config(format!("{}: no private key found", key_path.display())))?;
        Ok((certs, key))
    }
}

fn reader(path: &Path) -> Result<BufReader<File>> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|e| Error::Config(format!("{}: {e}", path.display())))
}

/// A rustls server config for `protocol`, advertising `h2` for HTTP/2 and
/// `http/1.1` otherwise.
pub(crate) fn server_config(credentials: &Credentials, protocol: Protocol) -> Result<Arc<ServerConfig>> {
    let (certs, key) = credentials.read()?;
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let mut config = ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()?
        .with_no_client_auth()
        .with_single_cert(certs, key)?;
    config.alpn_protocols = match protocol {
        Protocol::Http2 => vec![b"h2".to_vec()],
        _ => vec![b"http/1.1".to_vec()],
    };
    Ok(Arc::new(config))
}
