//! Read-only email snapshots handed to diagnosis by the mail provider layer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mailbox {
    pub email: String,
    pub name: Option<String>,
}

impl Mailbox {
    pub fn new(email: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            name: None,
        }
    }

    pub fn named(name: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            name: Some(name.into()),
        }
    }

    /// Parse a header value such as `David <david@hello.com>` or a bare address.
    pub fn parse(raw: &str) -> Self {
        let raw = raw.trim();
        if let (Some(open), Some(close)) = (raw.rfind('<'), raw.rfind('>')) {
            if open < close {
                let email = raw[open + 1..close].trim().to_string();
                let name = raw[..open].trim().trim_matches('"').trim();
                return Self {
                    email,
                    name: (!name.is_empty()).then(|| name.to_string()),
                };
            }
        }
        Self::new(raw)
    }

    pub fn display(&self) -> String {
        match self.name.as_deref() {
            Some(name) if !name.trim().is_empty() => format!("{name} <{}>", self.email),
            _ => self.email.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    pub name: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentMeta {
    pub filename: String,
    pub mime_type: String,
    pub size: u64,
}

/// Immutable view of one email for the duration of a diagnosis session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmailSnapshot {
    pub id: String,
    pub thread_id: Option<String>,
    pub message_id: Option<String>,
    pub references: Option<String>,
    pub from: Mailbox,
    #[serde(default)]
    pub to: Vec<Mailbox>,
    #[serde(default)]
    pub cc: Vec<Mailbox>,
    pub subject: Option<String>,
    pub date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub headers: Vec<Header>,
    pub body_plain: Option<String>,
    pub body_html: Option<String>,
    #[serde(default)]
    pub attachments: Vec<AttachmentMeta>,
}

impl EmailSnapshot {
    pub fn sender_email(&self) -> &str {
        self.from.email.trim()
    }

    pub fn sender_domain(&self) -> Option<&str> {
        extract_domain(self.sender_email())
    }

    pub fn subject(&self) -> &str {
        self.subject.as_deref().unwrap_or("")
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|header| header.name.eq_ignore_ascii_case(name))
            .map(|header| header.value.as_str())
    }
}

pub fn extract_domain(email: &str) -> Option<&str> {
    let at_index = email.rfind('@')?;
    let domain = &email[at_index + 1..];
    if domain.is_empty() { None } else { Some(domain) }
}

/// True when `domain` equals `candidate` or is one of its parent domains.
/// Both sides are expected in lower case.
pub fn domain_matches(candidate: &str, domain: &str) -> bool {
    candidate == domain || candidate.ends_with(&format!(".{domain}"))
}

/// Lowercased, trimmed form used as the key of sender-scoped state.
pub fn normalize_address(email: &str) -> String {
    Mailbox::parse(email).email.trim().to_lowercase()
}
