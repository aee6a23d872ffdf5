//! rustls integration and certificate helpers
//!
//! [`PinningServerVerifier`] plugs a [`CompositeValidator`] into a rustls
//! `ClientConfig`; every handshake goes through the pin check. The client
//! certificate side is left untouched: [`PassThroughClientVerifier`] and
//! [`client_config_with_cert_resolver`] only forward to the fallbacks and
//! to the caller's resolver.

use std::sync::Arc;

use der::asn1::ObjectIdentifier;
use der::Decode;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::ResolvesClientCert;
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::{ClientConfig, DigitallySignedStruct, DistinguishedName, ServerConfig, SignatureScheme};
use sha2::{Digest, Sha256};
use x509_cert::Certificate;

use crate::error::{Error, Result};
use crate::validator::{ChainRequest, ChainValidator, CompositeValidator};

const PEM_PREAMBLE: &[u8] = b"-----BEGIN";

const RSA_ENCRYPTION: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.113549.1.1.1");
const RSASSA_PSS: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.113549.1.1.10");
const EC_PUBLIC_KEY: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.2.840.10045.2.1");
const ED25519: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.3.101.112");
const ED448: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.3.101.113");

/// Compute the SHA256 fingerprint of a whole certificate, hex-encoded
pub fn cert_fingerprint(cert: &CertificateDer<'_>) -> String {
    hex::encode(Sha256::digest(cert.as_ref()))
}

/// Decode DER or a single PEM `CERTIFICATE` block into a checked DER certificate
///
/// The returned bytes are the original DER; nothing is re-encoded, so the
/// result can be compared byte-for-byte with what a server presents.
pub(crate) fn parse_certificate(bytes: &[u8]) -> std::result::Result<CertificateDer<'static>, String> {
    let start = bytes
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(bytes.len());
    let trimmed = &bytes[start..];

    let der_bytes = if trimmed.starts_with(PEM_PREAMBLE) {
        let (label, der_bytes) =
            der::pem::decode_vec(trimmed).map_err(|e| format!("invalid PEM: {}", e))?;
        if label != "CERTIFICATE" {
            return Err(format!("unexpected PEM label {:?}", label));
        }
        der_bytes
    } else {
        bytes.to_vec()
    };

    Certificate::from_der(&der_bytes).map_err(|e| format!("invalid X.509 certificate: {}", e))?;
    Ok(CertificateDer::from(der_bytes))
}

/// Key algorithm of a certificate: "RSA", "EC", "EdDSA" or "UNKNOWN"
///
/// Unparseable certificates yield "UNKNOWN"; the chain decision is left to
/// the validators.
pub fn auth_type(cert: &CertificateDer<'_>) -> &'static str {
    let Ok(cert) = Certificate::from_der(cert.as_ref()) else {
        return "UNKNOWN";
    };

    let oid = cert.tbs_certificate.subject_public_key_info.algorithm.oid;
    if oid == RSA_ENCRYPTION || oid == RSASSA_PSS {
        "RSA"
    } else if oid == EC_PUBLIC_KEY {
        "EC"
    } else if oid == ED25519 || oid == ED448 {
        "EdDSA"
    } else {
        "UNKNOWN"
    }
}

/// The process-wide crypto provider, installing aws-lc-rs if none is set
pub fn crypto_provider() -> Arc<CryptoProvider> {
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();
    CryptoProvider::get_default()
        .cloned()
        .unwrap_or_else(|| Arc::new(rustls::crypto::aws_lc_rs::default_provider()))
}

fn hostname_of(server_name: &ServerName<'_>) -> Option<String> {
    match server_name {
        ServerName::DnsName(name) => Some(name.as_ref().to_string()),
        ServerName::IpAddress(ip) => Some(std::net::IpAddr::from(*ip).to_string()),
        _ => None,
    }
}

fn borrowed_chain<'a>(
    end_entity: &'a CertificateDer<'a>,
    intermediates: &'a [CertificateDer<'a>],
) -> Vec<CertificateDer<'a>> {
    std::iter::once(end_entity)
        .chain(intermediates)
        .map(|cert| CertificateDer::from(cert.as_ref()))
        .collect()
}

/// Server certificate verifier that enforces hostname pins
#[derive(Debug)]
pub struct PinningServerVerifier {
    validator: Arc<CompositeValidator>,
    provider: Arc<CryptoProvider>,
}

impl PinningServerVerifier {
    pub fn new(validator: Arc<CompositeValidator>) -> Self {
        Self {
            validator,
            provider: crypto_provider(),
        }
    }
}

impl ServerCertVerifier for PinningServerVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        let hostname = hostname_of(server_name);
        let chain = borrowed_chain(end_entity, intermediates);
        let request = ChainRequest {
            hostname: hostname.as_deref(),
            chain: &chain,
            auth_type: auth_type(end_entity),
            ocsp_response,
            now,
        };

        self.validator.check_server_trusted(&request)?;
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
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
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider.signature_verification_algorithms.supported_schemes()
    }
}

/// Client certificate verifier that forwards to the fallback validators
///
/// Pins are not consulted for client certificates.
#[derive(Debug)]
pub struct PassThroughClientVerifier {
    validator: Arc<CompositeValidator>,
    provider: Arc<CryptoProvider>,
    root_hints: Vec<DistinguishedName>,
}

impl PassThroughClientVerifier {
    pub fn new(validator: Arc<CompositeValidator>) -> Self {
        let root_hints = validator.accepted_issuers();
        Self {
            validator,
            provider: crypto_provider(),
            root_hints,
        }
    }
}

impl ClientCertVerifier for PassThroughClientVerifier {
    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        &self.root_hints
    }

    fn verify_client_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        now: UnixTime,
    ) -> std::result::Result<ClientCertVerified, rustls::Error> {
        let chain = borrowed_chain(end_entity, intermediates);
        let request = ChainRequest::new(None, &chain, auth_type(end_entity)).at(now);

        self.validator.check_client_trusted(&request)?;
        Ok(ClientCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
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
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider.signature_verification_algorithms.supported_schemes()
    }
}

/// Build a rustls client config whose server verification is pinned
pub fn client_config(validator: Arc<CompositeValidator>) -> ClientConfig {
    let verifier = PinningServerVerifier::new(validator);

    ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(verifier))
        .with_no_client_auth()
}

/// Same as [`client_config`], presenting client certificates from `resolver`
pub fn client_config_with_cert_resolver(
    validator: Arc<CompositeValidator>,
    resolver: Arc<dyn ResolvesClientCert>,
) -> ClientConfig {
    let verifier = PinningServerVerifier::new(validator);

    ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(verifier))
        .with_client_cert_resolver(resolver)
}

/// Build a server config that requires client certificates trusted by the
/// validator's fallbacks
pub fn server_config_with_client_auth(
    validator: Arc<CompositeValidator>,
    cert_chain: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
) -> Result<ServerConfig> {
    let _ = crypto_provider();
    let verifier = PassThroughClientVerifier::new(validator);

    ServerConfig::builder()
        .with_client_cert_verifier(Arc::new(verifier))
        .with_single_cert(cert_chain, key)
        .map_err(|e| Error::Tls(format!("Failed to build server config: {}", e)))
}

/// Create a reqwest client with hostname pinning
///
/// Pinned hosts only connect when they present a pinned certificate; all
/// other hosts are checked by the validator's fallbacks.
pub fn create_pinned_client(validator: Arc<CompositeValidator>) -> Result<reqwest::Client> {
    let config = client_config(validator);

    let client = reqwest::Client::builder()
        .use_preconfigured_tls(config)
        .build()?;

    Ok(client)
}
