use std::path::Path;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use rustls_pemfile::{certs, private_key};
use tokio_rustls::TlsAcceptor;

/// Build a server-side TLS acceptor from PEM files.
pub fn acceptor(certs_path: &Path, key_path: &Path) -> Result<TlsAcceptor> {
    let loaded_certs = certs(&mut std::io::BufReader::new(std::fs::File::open(
        certs_path,
    )?))
    .collect::<Result<Vec<_>, _>>()?;
    let loaded_key = private_key(&mut std::io::BufReader::new(std::fs::File::open(
        key_path,
    )?))?
    .ok_or(anyhow!("no private key in {:?}", key_path))?;

    let tls_config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(loaded_certs, loaded_key)?;
    Ok(TlsAcceptor::from(Arc::new(tls_config)))
}

/// Erased bidirectional stream, so a connection can be upgraded to TLS
/// mid-flight (STARTTLS, STLS) behind one type.
pub trait AnyStream: tokio::io::AsyncRead + tokio::io::AsyncWrite + Send + Unpin {}
impl<T: tokio::io::AsyncRead + tokio::io::AsyncWrite + Send + Unpin> AnyStream for T {}

pub type BoxStream = Box<dyn AnyStream>;
