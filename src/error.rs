//! Error types for certpin

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Certificate for {hostname} could not be parsed: {reason}")]
    CertificateParse { hostname: String, reason: String },

    #[error("Invalid hostname: {0:?}")]
    InvalidHostname(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("JSON parsing failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Base64 decoding failed: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
