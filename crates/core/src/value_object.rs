//! Value objects: equality by value, validated on construction.

use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};

/// Marker trait for value objects.
///
/// Value objects have no identity; two instances with the same values are
/// equal. They are immutable once constructed, so every constructor here
/// validates up front and the type can be trusted afterwards.
pub trait ValueObject: Clone + PartialEq + core::fmt::Debug {}

const MAX_QUEUE_NAME_LEN: usize = 64;
const MAX_DEDUPE_KEY_LEN: usize = 255;

/// Name of a queue (`pdf-processing`, `payments`, ...).
///
/// Lowercase ASCII letters, digits, `-`, `_` and `.`; 1 to 64 characters.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct QueueName(String);

impl QueueName {
    pub fn new(name: impl Into<String>) -> DomainResult<Self> {
        let name = name.into();
        if name.is_empty() || name.len() > MAX_QUEUE_NAME_LEN {
            return Err(DomainError::validation(format!(
                "queue name must be 1..={MAX_QUEUE_NAME_LEN} characters, got {}",
                name.len()
            )));
        }
        if let Some(c) = name
            .chars()
            .find(|c| !(c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '-' | '_' | '.')))
        {
            return Err(DomainError::validation(format!(
                "queue name '{name}' contains invalid character '{c}'"
            )));
        }
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl ValueObject for QueueName {}

impl core::fmt::Display for QueueName {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for QueueName {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<QueueName> for String {
    fn from(value: QueueName) -> Self {
        value.0
    }
}

impl AsRef<str> for QueueName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Caller-supplied idempotency key.
///
/// At most one outstanding job exists per `(queue, dedupe key)`; a second
/// enqueue returns the existing job instead of inserting.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DedupeKey(String);

impl DedupeKey {
    pub fn new(key: impl Into<String>) -> DomainResult<Self> {
        let key = key.into();
        if key.trim().is_empty() {
            return Err(DomainError::validation("dedupe key must not be blank"));
        }
        if key.len() > MAX_DEDUPE_KEY_LEN {
            return Err(DomainError::validation(format!(
                "dedupe key must be at most {MAX_DEDUPE_KEY_LEN} bytes, got {}",
                key.len()
            )));
        }
        if key.chars().any(char::is_control) {
            return Err(DomainError::validation(
                "dedupe key must not contain control characters",
            ));
        }
        Ok(Self(key))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_inner(self) -> String {
        self.0
    }
}

impl ValueObject for DedupeKey {}

impl core::fmt::Display for DedupeKey {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for DedupeKey {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<DedupeKey> for String {
    fn from(value: DedupeKey) -> Self {
        value.0
    }
}
