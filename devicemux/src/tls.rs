//! TLS client configuration for the mid-stream socket upgrade.
//!
//! Devices present a self-signed certificate that is vouched for by the
//! pair record rather than a CA, so peer verification is disabled unless
//! the caller supplies explicit trust anchors. The host certificate and
//! key from the pair record become the client identity.

use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, SignatureScheme};
use tokio_rustls::TlsConnector;

use crate::{DeviceMuxError, ReadWrite};

/// Host identity presented during the TLS client handshake, in PEM form
/// as stored in the pair record.
#[derive(Debug, Clone)]
pub struct TlsIdentity {
    pub certificate_pem: Vec<u8>,
    pub private_key_pem: Vec<u8>,
}

/// Parameters for upgrading an established connection to TLS.
#[derive(Debug, Clone, Default)]
pub struct TlsUpgrade {
    /// Client identity; lockdown requires it, bare service sockets may not.
    pub identity: Option<TlsIdentity>,
    /// PEM trust anchors. When absent the peer certificate is accepted
    /// unverified.
    pub trust_anchors: Option<Vec<Vec<u8>>>,
}

impl TlsUpgrade {
    pub fn with_identity(certificate_pem: &[u8], private_key_pem: &[u8]) -> Self {
        Self {
            identity: Some(TlsIdentity {
                certificate_pem: certificate_pem.to_vec(),
                private_key_pem: private_key_pem.to_vec(),
            }),
            trust_anchors: None,
        }
    }
}

fn ensure_crypto_provider() -> Arc<CryptoProvider> {
    if CryptoProvider::get_default().is_none() {
        // Installing twice can race and report an error; the provider is
        // in place either way.
        if let Err(e) = CryptoProvider::install_default(rustls::crypto::aws_lc_rs::default_provider())
        {
            log::error!("failed to install default crypto provider: {e:?}");
        }
    }
    CryptoProvider::get_default()
        .cloned()
        .unwrap_or_else(|| Arc::new(rustls::crypto::aws_lc_rs::default_provider()))
}

/// Runs the TLS client handshake over an established stream and returns
/// the secured stream.
pub(crate) async fn connect(
    stream: Box<dyn ReadWrite>,
    upgrade: &TlsUpgrade,
) -> Result<Box<dyn ReadWrite>, DeviceMuxError> {
    let config = client_config(upgrade)?;
    let connector = TlsConnector::from(Arc::new(config));
    // The device certificate carries no usable name and verification is
    // driven by the pair record; any SNI value works.
    let name = ServerName::try_from("Device").unwrap();
    let stream = connector.connect(name, stream).await?;
    Ok(Box::new(stream))
}

pub(crate) fn client_config(upgrade: &TlsUpgrade) -> Result<rustls::ClientConfig, DeviceMuxError> {
    let provider = ensure_crypto_provider();

    let builder = rustls::ClientConfig::builder();
    let builder = match &upgrade.trust_anchors {
        Some(anchors) => {
            let mut roots = rustls::RootCertStore::empty();
            for pem in anchors {
                for cert in CertificateDer::pem_slice_iter(pem) {
                    roots.add(cert?)?;
                }
            }
            builder.with_root_certificates(roots)
        }
        None => builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert { provider })),
    };

    match &upgrade.identity {
        Some(identity) => {
            let certs = CertificateDer::pem_slice_iter(&identity.certificate_pem)
                .collect::<Result<Vec<_>, _>>()?;
            let key = PrivateKeyDer::from_pem_slice(&identity.private_key_pem)?;
            Ok(builder.with_client_auth_cert(certs, key)?)
        }
        None => Ok(builder.with_no_client_auth()),
    }
}

/// Accepts whatever certificate the device presents; the pair record is
/// the actual trust decision. Signature checks still run.
#[derive(Debug)]
struct AcceptAnyServerCert {
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}
