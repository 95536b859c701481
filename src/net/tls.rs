use std::{
    fs::File,
    io::BufReader,
    path::{Path, PathBuf},
};

use rustls::{Certificate, PrivateKey, RootCertStore};
use tracing::debug;

use super::Error;

/// Where the server's certificate and key come from.
#[derive(Clone, Debug)]
pub enum TlsSource {
    /// Generate a fresh self-signed certificate for these hostnames on every
    /// start. Clients have to be handed the resulting DER to trust it.
    SelfSigned(Vec<String>),
    /// PEM files on disk. The key must be pkcs8 or rsa.
    Pem { cert: PathBuf, key: PathBuf },
}

impl Default for TlsSource {
    fn default() -> Self {
        TlsSource::SelfSigned(vec!["localhost".into()])
    }
}

/// A certificate chain with the key for its leaf.
pub struct Identity {
    pub chain: Vec<Certificate>,
    pub key: PrivateKey,
}

impl Identity {
    /// DER of the leaf certificate, which is what a client pins.
    pub fn leaf_der(&self) -> &[u8] {
        self.chain.first().map(|cert| cert.0.as_slice()).unwrap_or_default()
    }
}

impl TlsSource {
    pub fn load(&self) -> Result<Identity, Error> {
        match self {
            TlsSource::SelfSigned(hostnames) => {
                let cert = rcgen::generate_simple_self_signed(hostnames.clone())?;
                debug!(?hostnames, "generated self-signed certificate");
                Ok(Identity {
                    chain: vec![Certificate(cert.serialize_der()?)],
                    key: PrivateKey(cert.serialize_private_key_der()),
                })
            }
            TlsSource::Pem { cert, key } => {
                let chain = read_certs(cert)?;
                let key = read_key(key)?;
                debug!(path = %cert.display(), certs = chain.len(), "loaded certificate chain");
                Ok(Identity { chain, key })
            }
        }
    }
}

fn read_certs(path: &Path) -> Result<Vec<Certificate>, Error> {
    let certs = rustls_pemfile::certs(&mut BufReader::new(File::open(path)?))?;
    if certs.is_empty() {
        return Err(Error::MissingCertificate(path.to_owned()));
    }
    Ok(certs.into_iter().map(Certificate).collect())
}

fn read_key(path: &Path) -> Result<PrivateKey, Error> {
    let mut keys = rustls_pemfile::pkcs8_private_keys(&mut BufReader::new(File::open(path)?))?;
    if keys.is_empty() {
        keys = rustls_pemfile::rsa_private_keys(&mut BufReader::new(File::open(path)?))?;
    }
    match keys.into_iter().next() {
        Some(key) => Ok(PrivateKey(key)),
        None => Err(Error::MissingKey(path.to_owned())),
    }
}

/// Client crypto that trusts exactly one server certificate.
pub fn client_config(trusted_cert_der: &[u8]) -> Result<quinn::ClientConfig, Error> {
    let mut roots = RootCertStore::empty();
    roots.add(&Certificate(trusted_cert_der.to_vec()))?;
    let mut config = quinn::ClientConfig::with_root_certificates(roots);
    config.transport_config(super::transport_config(Some(super::DEFAULT_KEEP_ALIVE)));
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn self_signed_identity_has_a_leaf() {
        let identity = TlsSource::default().load().unwrap();
        assert_eq!(identity.chain.len(), 1);
        assert!(!identity.leaf_der().is_empty());
        assert!(client_config(identity.leaf_der()).is_ok());
    }

    #[test]
    fn missing_pem_files_are_io_errors() {
        let source = TlsSource::Pem {
            cert: "/nonexistent/cert.pem".into(),
            key: "/nonexistent/key.pem".into(),
        };
        assert!(matches!(source.load(), Err(Error::Io(_))));
    }
}
