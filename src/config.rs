//! Pin configuration
//!
//! A [`PinningConfig`] describes the fallback trust roots and the hostname
//! pins of an application, typically shipped as JSON next to the binary:
//!
//! ```json
//! {
//!   "webpki_roots": true,
//!   "extra_roots": [{ "file": "certs/corp-root.pem" }],
//!   "pins": [
//!     { "hostname": "leroymerlin.com", "certificate": { "file": "certs/lmfr.pem" } }
//!   ]
//! }
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;

use base64::Engine;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{Error, Result};
use crate::validator::{ChainValidator, CompositeValidator, WebPkiValidator};

/// Where the bytes of a certificate come from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CertificateSource {
    /// Inline PEM text
    Pem(String),
    /// Inline DER, standard base64
    DerBase64(String),
    /// DER or PEM file; relative paths resolve against the config file
    File(PathBuf),
}

impl CertificateSource {
    fn load(&self, base_dir: Option<&Path>) -> Result<Vec<u8>> {
        match self {
            CertificateSource::Pem(pem) => Ok(pem.as_bytes().to_vec()),
            CertificateSource::DerBase64(encoded) => {
                Ok(base64::engine::general_purpose::STANDARD.decode(encoded.trim())?)
            }
            CertificateSource::File(path) => {
                let path = match base_dir {
                    Some(dir) if path.is_relative() => dir.join(path),
                    _ => path.clone(),
                };
                std::fs::read(&path).map_err(|e| {
                    Error::Config(format!("Failed to read certificate {}: {}", path.display(), e))
                })
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PinSpec {
    pub hostname: String,
    pub certificate: CertificateSource,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PinningConfig {
    /// Trust the Mozilla root program for unpinned hosts
    #[serde(default = "default_webpki_roots")]
    pub webpki_roots: bool,

    /// Additional roots trusted for unpinned hosts
    #[serde(default)]
    pub extra_roots: Vec<CertificateSource>,

    #[serde(default)]
    pub pins: Vec<PinSpec>,

    #[serde(skip)]
    base_dir: Option<PathBuf>,
}

fn default_webpki_roots() -> bool {
    true
}

impl Default for PinningConfig {
    fn default() -> Self {
        Self {
            webpki_roots: default_webpki_roots(),
            extra_roots: Vec::new(),
            pins: Vec::new(),
            base_dir: None,
        }
    }
}

impl PinningConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Load a JSON config; relative certificate paths resolve against its directory
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)?;
        let mut config = Self::from_json(&json)?;
        config.base_dir = path.parent().map(Path::to_path_buf);
        Ok(config)
    }

    pub fn pin(mut self, hostname: impl Into<String>, certificate: CertificateSource) -> Self {
        self.pins.push(PinSpec {
            hostname: hostname.into(),
            certificate,
        });
        self
    }

    /// Build the validator described by this config
    ///
    /// Every pin must load and parse; the first broken pin aborts the build
    /// so a typo never silently leaves a host unpinned.
    pub fn build_validator(&self) -> Result<CompositeValidator> {
        let base_dir = self.base_dir.as_deref();

        let mut fallbacks: Vec<Arc<dyn ChainValidator>> = Vec::new();
        if self.webpki_roots || !self.extra_roots.is_empty() {
            let extra = self
                .extra_roots
                .iter()
                .map(|source| source.load(base_dir))
                .collect::<Result<Vec<_>>>()?;

            let fallback = if self.webpki_roots {
                WebPkiValidator::with_extra_roots(extra)?
            } else {
                WebPkiValidator::with_roots(extra)?
            };
            fallbacks.push(Arc::new(fallback));
        }

        let mut validator = CompositeValidator::new(fallbacks);
        for pin in &self.pins {
            let bytes = pin.certificate.load(base_dir)?;
            validator.add_certificate(&pin.hostname, bytes)?;
        }

        info!(
            pins = validator.registry().len(),
            fallbacks = validator.fallbacks().len(),
            "certificate validator ready"
        );
        Ok(validator)
    }
}
