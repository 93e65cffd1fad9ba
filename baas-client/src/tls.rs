//! TLS connector for `baass://` connections.

use crate::error::ClientError;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, RootCertStore, SignatureScheme};
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_rustls::TlsConnector;

/// TLS settings for client connections.
#[derive(Debug, Clone)]
pub struct TlsClientConfig {
    /// PEM CA bundle used to verify the server. Falls back to the webpki
    /// roots when unset.
    pub ca_cert_path: Option<PathBuf>,
    /// Verify the server certificate. Turning this off accepts self-signed
    /// certificates and must stay limited to development.
    pub reject_unauthorized: bool,
    /// SNI name; defaults to the host being dialed.
    pub server_name: Option<String>,
}

impl Default for TlsClientConfig {
    fn default() -> Self {
        Self {
            ca_cert_path: None,
            reject_unauthorized: true,
            server_name: None,
        }
    }
}

/// Builds a connector and the server name to present for `host`.
pub fn create_tls_connector(
    config: &TlsClientConfig,
    host: &str,
) -> Result<(TlsConnector, ServerName<'static>), ClientError> {
    let client_config = if config.reject_unauthorized {
        rustls::ClientConfig::builder()
            .with_root_certificates(root_store(config.ca_cert_path.as_deref())?)
            .with_no_client_auth()
    } else {
        tracing::warn!("TLS certificate verification disabled");
        rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyCert))
            .with_no_client_auth()
    };

    let name = config.server_name.as_deref().unwrap_or(host);
    let server_name = ServerName::try_from(name.to_string())
        .map_err(|_| ClientError::TlsConfig(format!("invalid server name: {}", name)))?;

    Ok((TlsConnector::from(Arc::new(client_config)), server_name))
}

fn root_store(ca_path: Option<&Path>) -> Result<RootCertStore, ClientError> {
    let mut store = RootCertStore::empty();
    match ca_path {
        Some(path) => {
            for cert in load_certs(path)? {
                store
                    .add(cert)
                    .map_err(|e| ClientError::TlsConfig(format!("invalid CA cert: {}", e)))?;
            }
            if store.is_empty() {
                return Err(ClientError::TlsConfig(format!(
                    "no certificates found in {:?}",
                    path
                )));
            }
        }
        None => store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned()),
    }
    Ok(store)
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, ClientError> {
    let file = File::open(path)
        .map_err(|e| ClientError::TlsConfig(format!("cannot open cert file {:?}: {}", path, e)))?;
    rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ClientError::TlsConfig(format!("invalid cert file {:?}: {}", path, e)))
}

/// Verifier used when `reject_unauthorized` is off.
#[derive(Debug)]
struct AcceptAnyCert;

impl ServerCertVerifier for AcceptAnyCert {
    fn verify_server_cert(
        &self,
        _: &CertificateDer<'_>,
        _: &[CertificateDer<'_>],
        _: &ServerName<'_>,
        _: &[u8],
        _: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _: &[u8],
        _: &CertificateDer<'_>,
        _: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _: &[u8],
        _: &CertificateDer<'_>,
        _: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ECDSA_NISTP521_SHA512,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::ED25519,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_verifies() {
        let config = TlsClientConfig::default();
        assert!(config.reject_unauthorized);

        let (_, name) = create_tls_connector(&config, "localhost").unwrap();
        assert!(matches!(name, ServerName::DnsName(ref d) if d.as_ref() == "localhost"));
    }

    #[test]
    fn test_server_name_override() {
        let config = TlsClientConfig {
            reject_unauthorized: false,
            server_name: Some("baas.internal".into()),
            ..Default::default()
        };
        let (_, name) = create_tls_connector(&config, "10.0.0.1").unwrap();
        assert!(matches!(name, ServerName::DnsName(ref d) if d.as_ref() == "baas.internal"));
    }

    #[test]
    fn test_missing_ca_file() {
        let config = TlsClientConfig {
            ca_cert_path: Some("/nonexistent/ca.pem".into()),
            ..Default::default()
        };
        match create_tls_connector(&config, "localhost") {
            Err(e) => assert!(e.to_string().contains("cannot open cert file")),
            Ok(_) => panic!("expected error"),
        }
    }

    #[test]
    fn test_empty_ca_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"nothing here").unwrap();
        let config = TlsClientConfig {
            ca_cert_path: Some(file.path().to_path_buf()),
            ..Default::default()
        };
        match create_tls_connector(&config, "localhost") {
            Err(e) => assert!(e.to_string().contains("no certificates found")),
            Ok(_) => panic!("expected error"),
        }
    }
}
