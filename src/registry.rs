//! Hostname to certificate pins
//!
//! The registry is filled once during startup and only read afterwards.
//! It is owned by [`CompositeValidator`](crate::validator::CompositeValidator),
//! so once the validator is shared the registry can no longer change.

use std::collections::HashMap;

use rustls::pki_types::CertificateDer;
use tracing::debug;

use crate::error::{Error, Result};
use crate::tls;

/// A certificate pinned to a hostname
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PinEntry {
    /// Lowercased hostname the pin applies to
    hostname: String,
    /// DER encoding compared byte-for-byte against presented chains
    certificate: CertificateDer<'static>,
    /// SHA-256 of the DER, hex-encoded (display only)
    fingerprint: String,
}

impl PinEntry {
    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn certificate(&self) -> &CertificateDer<'static> {
        &self.certificate
    }

    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    /// Whether `cert` is exactly the pinned certificate
    pub fn matches(&self, cert: &CertificateDer<'_>) -> bool {
        self.certificate.as_ref() == cert.as_ref()
    }
}

/// Pins keyed by lowercased hostname, kept in registration order
#[derive(Debug, Clone, Default)]
pub struct PinRegistry {
    pins: HashMap<String, Vec<PinEntry>>,
}

impl PinRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pin a certificate (DER or PEM) to `hostname`
    ///
    /// A host may carry several pins, e.g. while a certificate is being
    /// rotated; any of them is accepted. Registering the same certificate
    /// twice for a host is a no-op.
    pub fn register(&mut self, hostname: &str, certificate: impl AsRef<[u8]>) -> Result<()> {
        let hostname = normalize(hostname);
        if hostname.is_empty() {
            return Err(Error::InvalidHostname(hostname));
        }

        let certificate = tls::parse_certificate(certificate.as_ref()).map_err(|reason| {
            Error::CertificateParse {
                hostname: hostname.clone(),
                reason,
            }
        })?;
        let fingerprint = tls::cert_fingerprint(&certificate);

        let entries = self.pins.entry(hostname.clone()).or_default();
        if entries.iter().any(|e| e.matches(&certificate)) {
            debug!(host = %hostname, %fingerprint, "certificate already pinned");
            return Ok(());
        }

        debug!(host = %hostname, %fingerprint, "pinned certificate");
        entries.push(PinEntry {
            hostname,
            certificate,
            fingerprint,
        });
        Ok(())
    }

    /// Pins for `hostname`, empty when the host is not pinned
    pub fn lookup(&self, hostname: &str) -> &[PinEntry] {
        self.pins
            .get(&normalize(hostname))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn is_pinned(&self, hostname: &str) -> bool {
        !self.lookup(hostname).is_empty()
    }

    /// Pinned hostnames, in no particular order
    pub fn hosts(&self) -> impl Iterator<Item = &str> {
        self.pins.keys().map(String::as_str)
    }

    /// Total number of pins across all hosts
    pub fn len(&self) -> usize {
        self.pins.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.pins.is_empty()
    }
}

/// Canonical form of a DNS name: trimmed, lowercased, without the root dot
///
/// `leroymerlin.com.` and `leroymerlin.com` name the same host and must hit
/// the same pins.
pub(crate) fn normalize(hostname: &str) -> String {
    let hostname = hostname.trim();
    hostname
        .strip_suffix('.')
        .unwrap_or(hostname)
        .to_ascii_lowercase()
}
