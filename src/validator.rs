//! Certificate chain validation
//!
//! [`CompositeValidator`] is the single decision point for a handshake:
//! hosts with a registered pin are accepted only when the presented chain
//! contains one of their pinned certificates, every other host is handed
//! to an ordered list of fallback validators (normally [`WebPkiValidator`]).
//!
//! Pinning is strict. A chain that is validly signed by a public authority
//! but does not contain the pinned certificate is rejected, the fallbacks
//! are never asked.

use std::fmt;
use std::sync::Arc;

use rustls::client::danger::ServerCertVerifier;
use rustls::client::WebPkiServerVerifier;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::server::danger::ClientCertVerifier;
use rustls::server::WebPkiClientVerifier;
use rustls::{DistinguishedName, RootCertStore};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::registry::{self, PinRegistry};
use crate::tls;

/// Inputs of a single validation call
///
/// Everything a handshake contributes is passed here, validators keep no
/// per-handshake state.
#[derive(Debug, Clone, Copy)]
pub struct ChainRequest<'a> {
    /// Negotiated server name (SNI / authority), `None` when unknown
    pub hostname: Option<&'a str>,
    /// Presented chain, leaf first
    pub chain: &'a [CertificateDer<'a>],
    /// Key algorithm of the leaf, e.g. "RSA" or "EC"
    pub auth_type: &'a str,
    pub ocsp_response: &'a [u8],
    pub now: UnixTime,
}

impl<'a> ChainRequest<'a> {
    pub fn new(hostname: Option<&'a str>, chain: &'a [CertificateDer<'a>], auth_type: &'a str) -> Self {
        Self {
            hostname,
            chain,
            auth_type,
            ocsp_response: &[],
            now: UnixTime::now(),
        }
    }

    pub fn at(mut self, now: UnixTime) -> Self {
        self.now = now;
        self
    }

    fn leaf_and_intermediates(&self) -> std::result::Result<(&'a CertificateDer<'a>, &'a [CertificateDer<'a>]), rustls::Error> {
        self.chain
            .split_first()
            .ok_or(rustls::Error::NoCertificatesPresented)
    }
}

/// Why a chain was rejected
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum RejectReason {
    #[error("host is not pinned and every fallback validator rejected the chain")]
    NoPinAndAllFallbacksRejected,
    #[error("presented chain does not contain a certificate pinned for this host")]
    PinMismatch,
    #[error("no certificates presented")]
    ChainEmpty,
    #[error("hostname of the connection could not be resolved")]
    HostnameUnresolvable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationOutcome {
    Accepted,
    Rejected(RejectReason),
}

impl ValidationOutcome {
    pub fn is_accepted(&self) -> bool {
        matches!(self, ValidationOutcome::Accepted)
    }

    /// Convert into the error rustls reports for an aborted handshake
    pub fn into_tls_result(self) -> std::result::Result<(), rustls::Error> {
        match self {
            ValidationOutcome::Accepted => Ok(()),
            ValidationOutcome::Rejected(RejectReason::ChainEmpty) => {
                Err(rustls::Error::NoCertificatesPresented)
            }
            ValidationOutcome::Rejected(RejectReason::PinMismatch) => Err(
                rustls::Error::InvalidCertificate(rustls::CertificateError::ApplicationVerificationFailure),
            ),
            ValidationOutcome::Rejected(reason) => Err(rustls::Error::General(reason.to_string())),
        }
    }
}

/// A trust decision for certificate chains
///
/// Implementations are installed in an ordered list; a chain is trusted as
/// soon as one of them accepts it.
pub trait ChainValidator: fmt::Debug + Send + Sync {
    /// Decide whether a server chain is trusted for `request.hostname`
    fn check_server_trusted(&self, request: &ChainRequest<'_>) -> std::result::Result<(), rustls::Error>;

    /// Decide whether a client chain is trusted
    fn check_client_trusted(&self, request: &ChainRequest<'_>) -> std::result::Result<(), rustls::Error> {
        let _ = request;
        Err(rustls::Error::General("client certificates are not supported by this validator".into()))
    }

    /// Subjects of the authorities this validator trusts
    fn accepted_issuers(&self) -> Vec<DistinguishedName> {
        Vec::new()
    }
}

/// Pin-aware validator composed with fallback validators
pub struct CompositeValidator {
    registry: PinRegistry,
    fallbacks: Arc<[Arc<dyn ChainValidator>]>,
}

impl fmt::Debug for CompositeValidator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompositeValidator")
            .field("pins", &self.registry.len())
            .field("fallbacks", &self.fallbacks)
            .finish()
    }
}

impl CompositeValidator {
    /// Create a validator with no pins
    pub fn new(fallbacks: impl Into<Arc<[Arc<dyn ChainValidator>]>>) -> Self {
        Self::with_registry(PinRegistry::new(), fallbacks)
    }

    pub fn with_registry(
        registry: PinRegistry,
        fallbacks: impl Into<Arc<[Arc<dyn ChainValidator>]>>,
    ) -> Self {
        Self {
            registry,
            fallbacks: fallbacks.into(),
        }
    }

    /// Validator falling back to the Mozilla root program
    pub fn with_webpki_roots() -> Result<Self> {
        let fallback: Arc<dyn ChainValidator> = Arc::new(WebPkiValidator::with_webpki_roots()?);
        Ok(Self::new(vec![fallback]))
    }

    /// Pin `certificate` (DER or PEM) to `hostname`
    ///
    /// Must be done before the validator is shared with a TLS config.
    pub fn add_certificate(&mut self, hostname: &str, certificate: impl AsRef<[u8]>) -> Result<()> {
        self.registry.register(hostname, certificate)
    }

    pub fn registry(&self) -> &PinRegistry {
        &self.registry
    }

    pub fn fallbacks(&self) -> &[Arc<dyn ChainValidator>] {
        &self.fallbacks
    }

    /// Accept or reject a server chain presented for `request.hostname`
    pub fn validate_server_chain(&self, request: &ChainRequest<'_>) -> ValidationOutcome {
        let outcome = self.decide_server_chain(request);
        if let ValidationOutcome::Rejected(reason) = outcome {
            warn!(
                host = request.hostname.unwrap_or("<unknown>"),
                chain_len = request.chain.len(),
                %reason,
                "rejected server certificate chain"
            );
        }
        outcome
    }

    fn decide_server_chain(&self, request: &ChainRequest<'_>) -> ValidationOutcome {
        if request.chain.is_empty() {
            return ValidationOutcome::Rejected(RejectReason::ChainEmpty);
        }

        let hostname = match request.hostname.map(registry::normalize) {
            Some(host) if !host.is_empty() => host,
            _ => return ValidationOutcome::Rejected(RejectReason::HostnameUnresolvable),
        };

        let pins = self.registry.lookup(&hostname);
        if !pins.is_empty() {
            let matched = pins
                .iter()
                .find(|pin| request.chain.iter().any(|cert| pin.matches(cert)));

            return match matched {
                Some(pin) => {
                    debug!(host = %hostname, fingerprint = pin.fingerprint(), "pinned certificate matched");
                    ValidationOutcome::Accepted
                }
                None => ValidationOutcome::Rejected(RejectReason::PinMismatch),
            };
        }

        if self.any_fallback_accepts(request, |v, r| v.check_server_trusted(r)) {
            ValidationOutcome::Accepted
        } else {
            ValidationOutcome::Rejected(RejectReason::NoPinAndAllFallbacksRejected)
        }
    }

    /// Accept or reject a client chain
    ///
    /// No pinning applies to client certificates, the fallbacks decide.
    pub fn validate_client_chain(&self, request: &ChainRequest<'_>) -> ValidationOutcome {
        if request.chain.is_empty() {
            return ValidationOutcome::Rejected(RejectReason::ChainEmpty);
        }
        if self.any_fallback_accepts(request, |v, r| v.check_client_trusted(r)) {
            ValidationOutcome::Accepted
        } else {
            warn!(chain_len = request.chain.len(), "rejected client certificate chain");
            ValidationOutcome::Rejected(RejectReason::NoPinAndAllFallbacksRejected)
        }
    }

    fn any_fallback_accepts<F>(&self, request: &ChainRequest<'_>, check: F) -> bool
    where
        F: Fn(&dyn ChainValidator, &ChainRequest<'_>) -> std::result::Result<(), rustls::Error>,
    {
        for (index, fallback) in self.fallbacks.iter().enumerate() {
            match check(fallback.as_ref(), request) {
                Ok(()) => {
                    debug!(host = request.hostname, fallback = index, "fallback validator accepted chain");
                    return true;
                }
                Err(e) => {
                    debug!(host = request.hostname, fallback = index, error = %e, "fallback validator rejected chain");
                }
            }
        }
        false
    }
}

impl ChainValidator for CompositeValidator {
    fn check_server_trusted(&self, request: &ChainRequest<'_>) -> std::result::Result<(), rustls::Error> {
        self.validate_server_chain(request).into_tls_result()
    }

    fn check_client_trusted(&self, request: &ChainRequest<'_>) -> std::result::Result<(), rustls::Error> {
        self.validate_client_chain(request).into_tls_result()
    }

    /// Union of the fallbacks' issuers, first occurrence wins
    fn accepted_issuers(&self) -> Vec<DistinguishedName> {
        let mut issuers: Vec<DistinguishedName> = Vec::new();
        for fallback in self.fallbacks.iter() {
            for issuer in fallback.accepted_issuers() {
                if !issuers.iter().any(|known| known.as_ref() == issuer.as_ref()) {
                    issuers.push(issuer);
                }
            }
        }
        issuers
    }
}

/// Standard WebPKI validation against a root store
///
/// This is the platform-default fallback: chain building, signatures,
/// validity period and name checks are all done by rustls/webpki.
pub struct WebPkiValidator {
    server: Arc<WebPkiServerVerifier>,
    client: Arc<dyn ClientCertVerifier>,
    roots: usize,
}

impl fmt::Debug for WebPkiValidator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebPkiValidator").field("roots", &self.roots).finish()
    }
}

impl WebPkiValidator {
    /// Create a validator trusting `roots`
    pub fn new(roots: RootCertStore) -> Result<Self> {
        let count = roots.len();
        let roots = Arc::new(roots);
        let provider = tls::crypto_provider();

        let server = WebPkiServerVerifier::builder_with_provider(roots.clone(), provider.clone())
            .build()
            .map_err(|e| Error::Tls(format!("Failed to build server verifier: {}", e)))?;
        let client = WebPkiClientVerifier::builder_with_provider(roots, provider)
            .build()
            .map_err(|e| Error::Tls(format!("Failed to build client verifier: {}", e)))?;

        Ok(Self {
            server,
            client,
            roots: count,
        })
    }

    /// Trust the Mozilla root program shipped with webpki-roots
    pub fn with_webpki_roots() -> Result<Self> {
        Self::new(webpki_root_store())
    }

    /// Trust the Mozilla roots plus additional DER or PEM roots
    pub fn with_extra_roots<I, B>(extra: I) -> Result<Self>
    where
        I: IntoIterator<Item = B>,
        B: AsRef<[u8]>,
    {
        let mut roots = webpki_root_store();
        add_roots(&mut roots, extra)?;
        Self::new(roots)
    }

    /// Trust only the given DER or PEM roots
    pub fn with_roots<I, B>(certificates: I) -> Result<Self>
    where
        I: IntoIterator<Item = B>,
        B: AsRef<[u8]>,
    {
        let mut roots = RootCertStore::empty();
        add_roots(&mut roots, certificates)?;
        Self::new(roots)
    }
}

fn webpki_root_store() -> RootCertStore {
    RootCertStore {
        roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
    }
}

fn add_roots<I, B>(store: &mut RootCertStore, certificates: I) -> Result<()>
where
    I: IntoIterator<Item = B>,
    B: AsRef<[u8]>,
{
    for bytes in certificates {
        let cert = tls::parse_certificate(bytes.as_ref())
            .map_err(|e| Error::Tls(format!("Invalid root certificate: {}", e)))?;
        store
            .add(cert)
            .map_err(|e| Error::Tls(format!("Failed to add root certificate: {}", e)))?;
    }
    Ok(())
}

impl ChainValidator for WebPkiValidator {
    fn check_server_trusted(&self, request: &ChainRequest<'_>) -> std::result::Result<(), rustls::Error> {
        let (leaf, intermediates) = request.leaf_and_intermediates()?;
        let hostname = request
            .hostname
            .ok_or_else(|| rustls::Error::General("server name required".into()))?;
        let server_name = ServerName::try_from(hostname.to_string())
            .map_err(|_| rustls::Error::General(format!("invalid server name: {}", hostname)))?;

        self.server
            .verify_server_cert(leaf, intermediates, &server_name, request.ocsp_response, request.now)
            .map(|_| ())
    }

    fn check_client_trusted(&self, request: &ChainRequest<'_>) -> std::result::Result<(), rustls::Error> {
        let (leaf, intermediates) = request.leaf_and_intermediates()?;
        self.client
            .verify_client_cert(leaf, intermediates, request.now)
            .map(|_| ())
    }

    fn accepted_issuers(&self) -> Vec<DistinguishedName> {
        self.client.root_hint_subjects().to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug)]
    struct Fixed {
        accept: bool,
        calls: AtomicUsize,
    }

    impl Fixed {
        fn new(accept: bool) -> Arc<Self> {
            Arc::new(Self {
                accept,
                calls: AtomicUsize::new(0),
            })
        }
    }

    impl ChainValidator for Fixed {
        fn check_server_trusted(&self, _: &ChainRequest<'_>) -> std::result::Result<(), rustls::Error> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.accept {
                Ok(())
            } else {
                Err(rustls::Error::InvalidCertificate(rustls::CertificateError::UnknownIssuer))
            }
        }

        fn check_client_trusted(&self, request: &ChainRequest<'_>) -> std::result::Result<(), rustls::Error> {
            self.check_server_trusted(request)
        }
    }

    fn cert(name: &str) -> CertificateDer<'static> {
        rcgen::generate_simple_self_signed(vec![name.to_string()])
            .unwrap()
            .cert
            .der()
            .clone()
    }

    fn validator(fallbacks: Vec<Arc<dyn ChainValidator>>) -> CompositeValidator {
        CompositeValidator::new(fallbacks)
    }

    #[test]
    fn test_empty_chain_rejected_before_pins() {
        let pinned = cert("leroymerlin.com");
        let mut v = validator(vec![Fixed::new(true)]);
        v.add_certificate("leroymerlin.com", &pinned).unwrap();

        let outcome = v.validate_server_chain(&ChainRequest::new(Some("leroymerlin.com"), &[], "RSA"));
        assert_eq!(outcome, ValidationOutcome::Rejected(RejectReason::ChainEmpty));
    }

    #[test]
    fn test_missing_hostname_rejected() {
        let chain = [cert("leroymerlin.com")];
        let v = validator(vec![Fixed::new(true)]);

        for host in [None, Some(""), Some("   "), Some(".")] {
            let outcome = v.validate_server_chain(&ChainRequest::new(host, &chain, "RSA"));
            assert_eq!(outcome, ValidationOutcome::Rejected(RejectReason::HostnameUnresolvable));
        }
    }

    #[test]
    fn test_pinned_leaf_accepted() {
        let pinned = cert("leroymerlin.com");
        let mut v = validator(vec![]);
        v.add_certificate("leroymerlin.com", &pinned).unwrap();

        let chain = [pinned];
        let outcome = v.validate_server_chain(&ChainRequest::new(Some("leroymerlin.com"), &chain, "EC"));
        assert!(outcome.is_accepted());
    }

    #[test]
    fn test_pinned_intermediate_accepted() {
        let pinned = cert("Pinned Intermediate");
        let mut v = validator(vec![]);
        v.add_certificate("leroymerlin.com", &pinned).unwrap();

        let chain = [cert("leroymerlin.com"), pinned];
        let outcome = v.validate_server_chain(&ChainRequest::new(Some("leroymerlin.com"), &chain, "EC"));
        assert!(outcome.is_accepted());
    }

    #[test]
    fn test_pin_mismatch_ignores_fallbacks() {
        let fallback = Fixed::new(true);
        let mut v = validator(vec![fallback.clone()]);
        v.add_certificate("leroymerlin.com", cert("leroymerlin.com")).unwrap();

        let chain = [cert("leroymerlin.com")];
        let outcome = v.validate_server_chain(&ChainRequest::new(Some("leroymerlin.com"), &chain, "EC"));
        assert_eq!(outcome, ValidationOutcome::Rejected(RejectReason::PinMismatch));
        assert_eq!(fallback.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_rotation_any_pin_matches() {
        let old = cert("api.example.com");
        let new = cert("api.example.com");
        let mut v = validator(vec![]);
        v.add_certificate("api.example.com", &old).unwrap();
        v.add_certificate("api.example.com", &new).unwrap();

        for presented in [old, new] {
            let chain = [presented];
            let outcome = v.validate_server_chain(&ChainRequest::new(Some("api.example.com"), &chain, "EC"));
            assert!(outcome.is_accepted());
        }
    }

    #[test]
    fn test_hostname_matching_case_insensitive() {
        let pinned = cert("example.com");
        let mut v = validator(vec![]);
        v.add_certificate("Example.com", &pinned).unwrap();

        let chain = [pinned];
        let outcome = v.validate_server_chain(&ChainRequest::new(Some("example.COM"), &chain, "EC"));
        assert!(outcome.is_accepted());
    }

    #[test]
    fn test_unpinned_host_uses_fallbacks_in_order() {
        let first = Fixed::new(false);
        let second = Fixed::new(true);
        let third = Fixed::new(true);
        let v = validator(vec![first.clone(), second.clone(), third.clone()]);

        let chain = [cert("other.com")];
        let outcome = v.validate_server_chain(&ChainRequest::new(Some("other.com"), &chain, "EC"));
        assert!(outcome.is_accepted());
        assert_eq!(first.calls.load(Ordering::SeqCst), 1);
        assert_eq!(second.calls.load(Ordering::SeqCst), 1);
        assert_eq!(third.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_unpinned_host_all_fallbacks_reject() {
        let chain = [cert("other.com")];
        let request = ChainRequest::new(Some("other.com"), &chain, "EC");

        let v = validator(vec![Fixed::new(false), Fixed::new(false)]);
        assert_eq!(
            v.validate_server_chain(&request),
            ValidationOutcome::Rejected(RejectReason::NoPinAndAllFallbacksRejected)
        );

        let empty = validator(vec![]);
        assert_eq!(
            empty.validate_server_chain(&request),
            ValidationOutcome::Rejected(RejectReason::NoPinAndAllFallbacksRejected)
        );
    }

    #[test]
    fn test_malformed_chain_entry_is_rejection() {
        let garbage = [CertificateDer::from(vec![0x30, 0x03, 0x02])];
        let mut v = validator(vec![Arc::new(WebPkiValidator::with_webpki_roots().unwrap())]);
        v.add_certificate("leroymerlin.com", cert("leroymerlin.com")).unwrap();

        let pinned = v.validate_server_chain(&ChainRequest::new(Some("leroymerlin.com"), &garbage, "UNKNOWN"));
        assert_eq!(pinned, ValidationOutcome::Rejected(RejectReason::PinMismatch));

        let unpinned = v.validate_server_chain(&ChainRequest::new(Some("other.com"), &garbage, "UNKNOWN"));
        assert_eq!(unpinned, ValidationOutcome::Rejected(RejectReason::NoPinAndAllFallbacksRejected));
    }

    #[test]
    fn test_client_chain_is_pass_through() {
        let presented = cert("client");
        let mut v = validator(vec![Fixed::new(true)]);
        // pins never apply to client chains
        v.add_certificate("client", cert("client")).unwrap();

        let chain = [presented];
        assert!(v.validate_client_chain(&ChainRequest::new(None, &chain, "EC")).is_accepted());
        assert_eq!(
            v.validate_client_chain(&ChainRequest::new(None, &[], "EC")),
            ValidationOutcome::Rejected(RejectReason::ChainEmpty)
        );
    }

    #[test]
    fn test_rejections_map_to_tls_errors() {
        assert!(ValidationOutcome::Accepted.into_tls_result().is_ok());
        assert_eq!(
            ValidationOutcome::Rejected(RejectReason::ChainEmpty).into_tls_result(),
            Err(rustls::Error::NoCertificatesPresented)
        );
        assert!(matches!(
            ValidationOutcome::Rejected(RejectReason::PinMismatch).into_tls_result(),
            Err(rustls::Error::InvalidCertificate(rustls::CertificateError::ApplicationVerificationFailure))
        ));
        assert!(matches!(
            ValidationOutcome::Rejected(RejectReason::HostnameUnresolvable).into_tls_result(),
            Err(rustls::Error::General(_))
        ));
    }

    #[test]
    fn test_accepted_issuers_union() {
        let ca = rcgen::generate_simple_self_signed(vec!["ca.test".to_string()]).unwrap();
        let a: Arc<dyn ChainValidator> = Arc::new(WebPkiValidator::with_roots([ca.cert.der()]).unwrap());
        let b: Arc<dyn ChainValidator> = Arc::new(WebPkiValidator::with_roots([ca.cert.der()]).unwrap());

        assert_eq!(a.accepted_issuers().len(), 1);
        let v = validator(vec![a, b, Fixed::new(true)]);
        assert_eq!(v.accepted_issuers().len(), 1);
    }
}
