//! TLS material loading and rustls client configuration.
//!
//! Native root certificates are loaded once per process and cached; an empty
//! OS store falls back to the bundled webpki roots.

use crate::config::TlsConfig;
use crate::error::FetchError;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::{DigitallySignedStruct, RootCertStore, SignatureScheme};
use rustls_pki_types::pem::PemObject;
use rustls_pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use std::path::Path;
use std::sync::{Arc, OnceLock};

/// Cached native root certificates.
/// Always stores Ok; empty vec means no certs found (warned, not errored).
static NATIVE_ROOTS_CACHE: OnceLock<Vec<CertificateDer<'static>>> = OnceLock::new();

/// Counter for test verification that the loader only runs once.
#[cfg(test)]
static LOAD_COUNT: std::sync::atomic::AtomicUsize = std::sync::atomic::AtomicUsize::new(0);

fn load_native_certs_inner() -> Vec<CertificateDer<'static>> {
    #[cfg(test)]
    LOAD_COUNT.fetch_add(1, std::sync::atomic::Ordering::SeqCst);

    let result = rustls_native_certs::load_native_certs();
    for err in &result.errors {
        tracing::warn!(error = %err, "error loading native root certificate");
    }

    if result.certs.is_empty() {
        tracing::warn!("no native root CA certificates found");
    } else {
        tracing::debug!(count = result.certs.len(), "loaded native root certificates");
    }

    result.certs
}

/// Cached native root certificates (may be empty).
pub(crate) fn native_root_certs() -> &'static [CertificateDer<'static>] {
    NATIVE_ROOTS_CACHE
        .get_or_init(load_native_certs_inner)
        .as_slice()
}

/// Globally installed crypto provider, or a fresh aws-lc-rs one.
///
/// Never installs a provider globally.
pub(crate) fn get_crypto_provider() -> Arc<CryptoProvider> {
    CryptoProvider::get_default()
        .cloned()
        .unwrap_or_else(|| Arc::new(rustls::crypto::aws_lc_rs::default_provider()))
}

/// PEM material resolved from inline bytes or files.
#[derive(Debug, Default)]
pub(crate) struct TlsMaterial {
    pub ca_cert: Option<Vec<u8>>,
    pub cert: Option<Vec<u8>>,
    pub key: Option<Vec<u8>>,
    pub insecure_skip_verify: bool,
}

/// Read file-referenced material that was not given inline.
pub(crate) async fn load_material(tls: &TlsConfig) -> Result<TlsMaterial, FetchError> {
    Ok(TlsMaterial {
        ca_cert: inline_or_file(tls.ca_cert.as_ref(), tls.ca_cert_file.as_deref()).await?,
        cert: inline_or_file(tls.cert.as_ref(), tls.cert_file.as_deref()).await?,
        key: inline_or_file(tls.key.as_ref(), tls.key_file.as_deref()).await?,
        insecure_skip_verify: tls.insecure_skip_verify,
    })
}

async fn inline_or_file(
    inline: Option<&Vec<u8>>,
    path: Option<&Path>,
) -> Result<Option<Vec<u8>>, FetchError> {
    if let Some(bytes) = inline {
        return Ok(Some(bytes.clone()));
    }
    let Some(path) = path else {
        return Ok(None);
    };
    tokio::fs::read(path)
        .await
        .map(Some)
        .map_err(|source| FetchError::TlsMaterial {
            path: path.to_path_buf(),
            source,
        })
}

/// Build the rustls client config for `material`.
///
/// A custom CA replaces the platform roots. The client certificate is used
/// only when both certificate and key are present.
pub(crate) fn client_config(material: &TlsMaterial) -> Result<rustls::ClientConfig, FetchError> {
    let provider = get_crypto_provider();

    let builder = rustls::ClientConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()
        .map_err(|e| FetchError::Tls(Box::new(e)))?;

    let builder = if material.insecure_skip_verify {
        tracing::warn!(
            target: "modkit_fetch::security",
            "TLS certificate verification disabled (insecure_skip_verify); \
             use only against trusted test servers"
        );
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert { provider }))
    } else {
        builder.with_root_certificates(root_store(material.ca_cert.as_deref())?)
    };

    let config = match (&material.cert, &material.key) {
        (Some(cert), Some(key)) => {
            let chain = parse_certificates(cert)?;
            let key = PrivateKeyDer::from_pem_slice(key).map_err(|e| FetchError::Tls(Box::new(e)))?;
            builder
                .with_client_auth_cert(chain, key)
                .map_err(|e| FetchError::Tls(Box::new(e)))?
        }
        _ => builder.with_no_client_auth(),
    };

    Ok(config)
}

fn parse_certificates(pem: &[u8]) -> Result<Vec<CertificateDer<'static>>, FetchError> {
    let certs = CertificateDer::pem_slice_iter(pem)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| FetchError::Tls(Box::new(e)))?;
    if certs.is_empty() {
        return Err(FetchError::Tls("no certificates found in PEM data".into()));
    }
    Ok(certs)
}

fn root_store(ca_cert: Option<&[u8]>) -> Result<RootCertStore, FetchError> {
    let mut roots = RootCertStore::empty();

    if let Some(pem) = ca_cert {
        for cert in parse_certificates(pem)? {
            roots.add(cert).map_err(|e| FetchError::Tls(Box::new(e)))?;
        }
        return Ok(roots);
    }

    let (added, ignored) = roots.add_parsable_certificates(native_root_certs().iter().cloned());
    if ignored > 0 {
        tracing::warn!(
            added = added,
            ignored = ignored,
            "some native root certificates could not be parsed"
        );
    }
    if added == 0 {
        tracing::debug!("falling back to bundled webpki root certificates");
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
    }

    Ok(roots)
}

/// Verifier behind `insecure_skip_verify`: accepts any certificate but still
/// checks handshake signatures.
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
