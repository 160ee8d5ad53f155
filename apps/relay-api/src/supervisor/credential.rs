//! Operator credential: the opaque secret identifying one platform session.

use std::fmt;

/// Number of leading characters shown when a credential is logged.
const VISIBLE_PREFIX: usize = 8;

/// An opaque platform credential.
///
/// Both `Debug` and `Display` print only a short prefix so a credential can
/// be used as a tracing field without leaking the secret. Use
/// [`Credential::expose`] when the full value is needed (authenticating
/// against the platform).
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Credential(String);

impl Credential {
    /// Wrap a raw credential, trimming surrounding whitespace.
    ///
    /// Returns `None` for an empty credential.
    pub fn new(raw: impl Into<String>) -> Option<Self> {
        let raw = raw.into();
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return None;
        }
        Some(Self(trimmed.to_string()))
    }

    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn redacted(&self) -> String {
        let prefix: String = self.0.chars().take(VISIBLE_PREFIX).collect();
        format!("{prefix}…")
    }
}

impl fmt::Display for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.redacted())
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Credential").field(&self.redacted()).finish()
    }
}
