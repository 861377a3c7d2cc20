use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Email headers the ingestion collaborator extracted. All optional.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmailHeaders {
    pub subject: Option<String>,
    pub from: Option<String>,
    pub to: Option<String>,
    pub date: Option<String>,
}

/// Immutable unit of work. Read-only to the classification core.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    pub id: String,
    pub content_hash: String,
    pub text: String,
    #[serde(default)]
    pub headers: EmailHeaders,
}

impl Document {
    /// Build a document, deriving its content hash from the body.
    pub fn from_text(id: impl Into<String>, text: impl Into<String>, headers: EmailHeaders) -> Self {
        let text = text.into();
        Self {
            id: id.into(),
            content_hash: content_hash(&text),
            text,
            headers,
        }
    }
}

/// Lowercase hex SHA-256 of the document body.
pub fn content_hash(text: &str) -> String {
    format!("{:x}", Sha256::digest(text.as_bytes()))
}
