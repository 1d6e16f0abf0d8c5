//! Minimal HTTP Archive model for the bundle's `network.har` component.
//!
//! Only the fields the gate consumes are modeled; unknown HAR fields are
//! preserved-by-ignoring on read (the component hash covers the raw bytes,
//! not this projection).

use std::fs;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors reading or interpreting a HAR file.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum HarError {
    /// The file could not be read.
    #[error("failed to read HAR file: {0}")]
    Io(#[from] std::io::Error),

    /// The file is not valid HAR JSON.
    #[error("malformed HAR: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// A name/value pair as HAR represents headers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HarHeader {
    /// Header name.
    pub name: String,
    /// Header value.
    pub value: String,
}

/// The request half of a HAR entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HarRequest {
    /// HTTP method.
    pub method: String,
    /// Absolute URL.
    pub url: String,
    /// Request headers.
    #[serde(default)]
    pub headers: Vec<HarHeader>,
}

/// The response half of a HAR entry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HarResponse {
    /// HTTP status code.
    #[serde(default)]
    pub status: u16,
    /// Response headers.
    #[serde(default)]
    pub headers: Vec<HarHeader>,
    /// SHA-256 of the response body, when the recorder captured it.
    #[serde(rename = "bodySha256", skip_serializing_if = "Option::is_none")]
    pub body_sha256: Option<String>,
}

/// One request/response pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HarEntry {
    /// The recorded request.
    pub request: HarRequest,
    /// The recorded response.
    #[serde(default)]
    pub response: HarResponse,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct HarLog {
    #[serde(default)]
    entries: Vec<HarEntry>,
}

/// The outer HAR document.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Har {
    log: HarLog,
}

impl Har {
    /// Loads a HAR document from disk.
    ///
    /// # Errors
    ///
    /// Returns [`HarError`] if the file is unreadable or not HAR JSON.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, HarError> {
        let raw = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }

    /// Builds a HAR document from entries.
    #[must_use]
    pub fn from_entries(entries: Vec<HarEntry>) -> Self {
        Self {
            log: HarLog { entries },
        }
    }

    /// The recorded entries in capture order.
    #[must_use]
    pub fn entries(&self) -> &[HarEntry] {
        &self.log.entries
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_har() {
        let raw = r#"{"log":{"entries":[
            {"request":{"method":"POST","url":"https://example.com/api"},
             "response":{"status":200}}
        ]}}"#;
        let har: Har = serde_json::from_str(raw).unwrap();
        assert_eq!(har.entries().len(), 1);
        assert_eq!(har.entries()[0].request.method, "POST");
        assert_eq!(har.entries()[0].response.status, 200);
    }

    #[test]
    fn tolerates_missing_response() {
        let raw = r#"{"log":{"entries":[{"request":{"method":"GET","url":"https://x.test/"}}]}}"#;
        let har: Har = serde_json::from_str(raw).unwrap();
        assert_eq!(har.entries()[0].response.status, 0);
    }
}
