#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Maximum accepted message length after trimming, in characters.
pub const MAX_MESSAGE_CHARS: usize = 2000;
/// Maximum accepted display name length, in characters.
pub const MAX_DISPLAY_NAME_CHARS: usize = 64;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum DomainError {
    #[error("user id is invalid")]
    InvalidUserId,
    #[error("display name is invalid")]
    InvalidDisplayName,
    #[error("message content is invalid")]
    InvalidMessageContent,
    #[error("room is invalid")]
    InvalidRoom,
    #[error("message kind is invalid")]
    InvalidMessageKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UserId(Ulid);

impl UserId {
    #[must_use]
    pub fn new() -> Self {
        Self(Ulid::new())
    }
}

impl Default for UserId {
    fn default() -> Self {
        Self::new()
    }
}

impl TryFrom<String> for UserId {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        let parsed = Ulid::from_string(&value).map_err(|_| DomainError::InvalidUserId)?;
        Ok(Self(parsed))
    }
}

impl core::fmt::Display for UserId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DisplayName(String);

impl DisplayName {
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for DisplayName {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        let trimmed = value.trim();
        let chars = trimmed.chars().count();
        if chars == 0 || chars > MAX_DISPLAY_NAME_CHARS {
            return Err(DomainError::InvalidDisplayName);
        }
        if trimmed.chars().any(char::is_control) {
            return Err(DomainError::InvalidDisplayName);
        }
        Ok(Self(trimmed.to_owned()))
    }
}

/// Chat message body. Construction trims surrounding whitespace and
/// enforces the 1..=2000 character bound, so a held value is always
/// sendable as-is.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MessageContent(String);

impl MessageContent {
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    #[must_use]
    pub fn into_inner(self) -> String {
        self.0
    }
}

impl TryFrom<String> for MessageContent {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        let trimmed = value.trim();
        let chars = trimmed.chars().count();
        if chars == 0 || chars > MAX_MESSAGE_CHARS {
            return Err(DomainError::InvalidMessageContent);
        }
        Ok(Self(trimmed.to_owned()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    User,
    System,
}

impl MessageKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::System => "system",
        }
    }
}

impl TryFrom<String> for MessageKind {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.as_str() {
            "user" => Ok(Self::User),
            "system" => Ok(Self::System),
            _ => Err(DomainError::InvalidMessageKind),
        }
    }
}

/// Broadcast scope a connection can belong to. `Global` admits every
/// authenticated identity; `Members` admits privileged identities only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Room {
    Global,
    Members,
}

impl Room {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Global => "global",
            Self::Members => "members",
        }
    }

    /// Fan-out bus topic carrying this room's events.
    #[must_use]
    pub const fn topic(self) -> &'static str {
        self.as_str()
    }

    #[must_use]
    pub const fn is_privileged(self) -> bool {
        matches!(self, Self::Members)
    }
}

impl TryFrom<String> for Room {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        match value.as_str() {
            "global" => Ok(Self::Global),
            "members" => Ok(Self::Members),
            _ => Err(DomainError::InvalidRoom),
        }
    }
}

impl core::fmt::Display for Room {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}
