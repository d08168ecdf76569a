//! Secret wrapper for credential material
//!
//! All credential material in the gateway (API keys, bearer tokens, AWS
//! signing keys, OAuth refresh tokens) is stored as a `SecretString`. The
//! value is redacted in Debug/Display so it cannot leak through logs or
//! error messages, and the backing memory is zeroized on drop.

use std::fmt;
use zeroize::Zeroize;

/// A string whose value is redacted everywhere except `expose()`.
#[derive(Clone)]
pub struct SecretString(String);

impl SecretString {
    /// Wrap a sensitive string.
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Expose the inner value. Call sites should be limited to the point
    /// where the value is written into an outbound header or signing input.
    pub fn expose(&self) -> &str {
        &self.0
    }

    /// Whether the wrapped value is empty.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<String> for SecretString {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Debug for SecretString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[REDACTED]")
    }
}

impl fmt::Display for SecretString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[REDACTED]")
    }
}

impl Drop for SecretString {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

impl<'de> serde::Deserialize<'de> for SecretString {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        String::deserialize(deserializer).map(SecretString)
    }
}
