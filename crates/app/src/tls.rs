//! Secure transport for listeners, backed by rustls.
//!
//! Key material is read from PEM files. Options that only make sense for
//! OpenSSL are accepted but have no effect: DH parameters are ignored, since
//! rustls only offers (EC)DHE groups it ships itself.

use std::fmt;
use std::fs::File;
use std::io::{self, BufReader};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::{ServerSessionMemoryCache, WebPkiClientVerifier};
use rustls::{RootCertStore, ServerConfig, SupportedCipherSuite};
use thiserror::Error;
use tokio_rustls::TlsAcceptor;
use tracing::debug;

const LOW_MEMORY_SESSION_CACHE: usize = 32;

/// Where a secure app gets its key material from.
#[derive(Debug, Clone, Default)]
pub struct SslOptions {
    pub key_file_name: Option<PathBuf>,
    pub cert_file_name: Option<PathBuf>,
    /// encrypted keys are not supported, setting this is an error
    pub passphrase: Option<String>,
    pub dh_params_file_name: Option<PathBuf>,
    /// when set, clients must present a certificate signed by one of these CAs
    pub ca_file_name: Option<PathBuf>,
    /// `:` or `,` separated rustls cipher suite names, e.g. `TLS13_AES_128_GCM_SHA256`
    pub ssl_ciphers: Option<String>,
    pub prefer_low_memory_usage: bool,
}

#[derive(Debug, Error)]
pub enum TlsError {
    #[error("{0} is required")]
    Missing(&'static str),

    #[error("can't read {path:?}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("no certificate found in {0:?}")]
    NoCertificate(PathBuf),

    #[error("no private key found in {0:?}")]
    NoPrivateKey(PathBuf),

    #[error("encrypted private keys are not supported, provide a decrypted key instead of a passphrase")]
    EncryptedKey,

    #[error("unknown cipher suite: {0}")]
    UnknownCipher(String),

    #[error("client verifier error: {source}")]
    Verifier {
        #[from]
        source: rustls::server::VerifierBuilderError,
    },

    #[error("tls error: {source}")]
    Rustls {
        #[from]
        source: rustls::Error,
    },
}

impl TlsError {
    fn read(path: &Path, source: io::Error) -> Self {
        Self::Read { path: path.to_path_buf(), source }
    }
}

/// A validated server configuration, cheap to clone.
#[derive(Clone)]
pub struct SecureContext {
    config: Arc<ServerConfig>,
}

impl fmt::Debug for SecureContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SecureContext").field("alpn", &self.config.alpn_protocols).finish_non_exhaustive()
    }
}

impl SecureContext {
    pub fn new(options: &SslOptions) -> Result<Self, TlsError> {
        if options.passphrase.is_some() {
            return Err(TlsError::EncryptedKey);
        }
        if let Some(dh_params) = &options.dh_params_file_name {
            debug!(path = ?dh_params, "dh params are not used by rustls, ignoring");
        }

        let cert_path = options.cert_file_name.as_deref().ok_or(TlsError::Missing("cert_file_name"))?;
        let key_path = options.key_file_name.as_deref().ok_or(TlsError::Missing("key_file_name"))?;
        let certs = load_certs(cert_path)?;
        let key = load_key(key_path)?;

        let mut provider = rustls::crypto::ring::default_provider();
        if let Some(ciphers) = &options.ssl_ciphers {
            provider.cipher_suites = select_ciphers(&provider, ciphers)?;
        }
        let provider = Arc::new(provider);

        let builder = ServerConfig::builder_with_provider(Arc::clone(&provider)).with_safe_default_protocol_versions()?;
        let builder = match &options.ca_file_name {
            Some(ca_path) => {
                let mut roots = RootCertStore::empty();
                for cert in load_certs(ca_path)? {
                    roots.add(cert)?;
                }
                let verifier = WebPkiClientVerifier::builder_with_provider(Arc::new(roots), provider).build()?;
                builder.with_client_cert_verifier(verifier)
            }
            None => builder.with_no_client_auth(),
        };

        let mut config = builder.with_single_cert(certs, key)?;
        config.alpn_protocols = vec![b"http/1.1".to_vec()];
        if options.prefer_low_memory_usage {
            config.session_storage = ServerSessionMemoryCache::new(LOW_MEMORY_SESSION_CACHE);
        }

        Ok(Self { config: Arc::new(config) })
    }

    pub fn acceptor(&self) -> TlsAcceptor {
        TlsAcceptor::from(Arc::clone(&self.config))
    }
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let file = File::open(path).map_err(|e| TlsError::read(path, e))?;
    let certs = rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TlsError::read(path, e))?;
    if certs.is_empty() {
        return Err(TlsError::NoCertificate(path.to_path_buf()));
    }
    Ok(certs)
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>, TlsError> {
    let file = File::open(path).map_err(|e| TlsError::read(path, e))?;
    rustls_pemfile::private_key(&mut BufReader::new(file))
        .map_err(|e| TlsError::read(path, e))?
        .ok_or_else(|| TlsError::NoPrivateKey(path.to_path_buf()))
}

fn select_ciphers(provider: &CryptoProvider, names: &str) -> Result<Vec<SupportedCipherSuite>, TlsError> {
    names
        .split([':', ','])
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(|name| {
            provider
                .cipher_suites
                .iter()
                .find(|suite| suite.suite().as_str() == Some(name))
                .copied()
                .ok_or_else(|| TlsError::UnknownCipher(name.to_string()))
        })
        .collect()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    /// A self signed `localhost` certificate written to a temp dir.
    pub(crate) struct TestCert {
        pub(crate) dir: TempDir,
        pub(crate) cert_pem: String,
    }

    impl TestCert {
        pub(crate) fn generate() -> Self {
            let certified = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
            let dir = tempfile::tempdir().unwrap();
            let cert_pem = certified.cert.pem();
            fs::write(dir.path().join("cert.pem"), &cert_pem).unwrap();
            fs::write(dir.path().join("key.pem"), certified.key_pair.serialize_pem()).unwrap();
            Self { dir, cert_pem }
        }

        pub(crate) fn options(&self) -> SslOptions {
            SslOptions {
                cert_file_name: Some(self.dir.path().join("cert.pem")),
                key_file_name: Some(self.dir.path().join("key.pem")),
                ..SslOptions::default()
            }
        }
    }

    #[test]
    fn builds_from_pem_files() {
        let cert = TestCert::generate();
        let context = SecureContext::new(&cert.options()).unwrap();
        assert_eq!(context.config.alpn_protocols, vec![b"http/1.1".to_vec()]);
    }

    #[test]
    fn dh_params_and_low_memory_are_accepted() {
        let cert = TestCert::generate();
        let options = SslOptions {
            dh_params_file_name: Some(PathBuf::from("/nonexistent/dhparams.pem")),
            prefer_low_memory_usage: true,
            ..cert.options()
        };
        assert!(SecureContext::new(&options).is_ok());
    }

    #[test]
    fn passphrase_is_rejected() {
        let cert = TestCert::generate();
        let options = SslOptions { passphrase: Some("secret".to_string()), ..cert.options() };
        assert!(matches!(SecureContext::new(&options), Err(TlsError::EncryptedKey)));
    }

    #[test]
    fn missing_files_are_reported() {
        let cert = TestCert::generate();
        let options = SslOptions { key_file_name: None, ..cert.options() };
        assert!(matches!(SecureContext::new(&options), Err(TlsError::Missing("key_file_name"))));

        let options = SslOptions { key_file_name: Some(cert.dir.path().join("missing.pem")), ..cert.options() };
        assert!(matches!(SecureContext::new(&options), Err(TlsError::Read { .. })));

        // a certificate file holds no private key
        let options = SslOptions { key_file_name: cert.options().cert_file_name, ..cert.options() };
        assert!(matches!(SecureContext::new(&options), Err(TlsError::NoPrivateKey(_))));
    }

    #[test]
    fn cipher_selection() {
        let cert = TestCert::generate();
        let options = SslOptions {
            ssl_ciphers: Some("TLS13_AES_128_GCM_SHA256:TLS13_CHACHA20_POLY1305_SHA256".to_string()),
            ..cert.options()
        };
        assert!(SecureContext::new(&options).is_ok());

        let options = SslOptions { ssl_ciphers: Some("ECDHE-RSA-RC4-SHA".to_string()), ..cert.options() };
        match SecureContext::new(&options) {
            Err(TlsError::UnknownCipher(name)) => assert_eq!(name, "ECDHE-RSA-RC4-SHA"),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn client_ca_enables_verification() {
        let cert = TestCert::generate();
        let options = SslOptions { ca_file_name: cert.options().cert_file_name, ..cert.options() };
        assert!(SecureContext::new(&options).is_ok());
    }
}
