//! # certpin
//!
//! Hostname-pinned TLS certificate validation for rustls clients.
//!
//! A small set of first-party hosts can be pinned to specific certificates.
//! For those hosts a handshake only succeeds when the server presents a
//! pinned certificate somewhere in its chain, so a rogue certificate issued
//! by a compromised or coerced authority is rejected even though it would
//! pass ordinary validation. Every other host is validated normally by an
//! ordered list of fallback validators (Mozilla roots by default).
//!
//! ## Pieces
//!
//! - [`PinRegistry`]: hostname → pinned certificates, filled at startup
//! - [`CompositeValidator`]: the per-handshake decision, pins first and
//!   fallbacks for unpinned hosts
//! - [`tls`]: rustls verifiers and config builders wrapping the validator
//! - [`config`]: JSON pin configuration
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use certpin::{tls, CompositeValidator};
//!
//! let mut validator = CompositeValidator::with_webpki_roots()?;
//! validator.add_certificate("leroymerlin.com", include_bytes!("../certs/lmfr.pem"))?;
//!
//! // Registration is over once the validator is shared
//! let client = tls::create_pinned_client(Arc::new(validator))?;
//! ```

pub mod config;
pub mod error;
pub mod registry;
pub mod tls;
pub mod validator;

pub use config::{CertificateSource, PinningConfig};
pub use error::Error;
pub use registry::{PinEntry, PinRegistry};
pub use validator::{
    ChainRequest, ChainValidator, CompositeValidator, RejectReason, ValidationOutcome, WebPkiValidator,
};
