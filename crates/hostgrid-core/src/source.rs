//! Source archive location parsing.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum SourceUri {
    /// http(s)://releases.example.com/app_default_v1_3.zip
    Http { url: String },
    /// file:///path/to/archive.zip or an absolute path
    File { path: PathBuf },
}

#[derive(Debug, Error)]
pub enum SourceUriError {
    #[error("unsupported source scheme: {0}")]
    UnsupportedScheme(String),
    #[error("invalid source URI: {0}")]
    InvalidUri(String),
}

impl SourceUri {
    pub fn parse(uri: &str) -> Result<Self, SourceUriError> {
        let uri = uri.trim();
        if uri.starts_with("https://") || uri.starts_with("http://") {
            Ok(SourceUri::Http {
                url: uri.to_string(),
            })
        } else if let Some(path) = uri.strip_prefix("file://") {
            if path.is_empty() {
                return Err(SourceUriError::InvalidUri(uri.to_string()));
            }
            Ok(SourceUri::File {
                path: PathBuf::from(path),
            })
        } else if uri.starts_with('/') {
            Ok(SourceUri::File {
                path: PathBuf::from(uri),
            })
        } else {
            Err(SourceUriError::UnsupportedScheme(uri.to_string()))
        }
    }

    pub fn scheme(&self) -> &'static str {
        match self {
            SourceUri::Http { .. } => "http",
            SourceUri::File { .. } => "file",
        }
    }
}
