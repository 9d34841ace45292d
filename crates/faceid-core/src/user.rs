//! User identifiers and upload file names.
//!
//! User ids become path components (`faces/{id}`, `models/{id}.bin`), so
//! they are validated once at the boundary and carried as [`UserId`].

use std::fmt;
use thiserror::Error;

/// Directory names under `faces/` that are not users.
const RESERVED_IDS: [&str; 1] = ["probes"];

#[derive(Error, Debug, PartialEq, Eq)]
pub enum InvalidUserId {
    #[error("user id is empty")]
    Empty,
    #[error("user id {0:?} contains a path separator or control character")]
    IllegalCharacter(String),
    #[error("user id {0:?} may not start with '.'")]
    LeadingDot(String),
    #[error("user id {0:?} is reserved")]
    Reserved(String),
}

/// A validated, path-safe user id.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct UserId(String);

impl UserId {
    pub fn parse(raw: &str) -> Result<Self, InvalidUserId> {
        if raw.is_empty() {
            return Err(InvalidUserId::Empty);
        }
        if raw
            .chars()
            .any(|c| c == '/' || c == '\\' || c == '\0' || c.is_control())
        {
            return Err(InvalidUserId::IllegalCharacter(raw.to_string()));
        }
        // Also rules out "." and "..".
        if raw.starts_with('.') {
            return Err(InvalidUserId::LeadingDot(raw.to_string()));
        }
        if RESERVED_IDS.contains(&raw) {
            return Err(InvalidUserId::Reserved(raw.to_string()));
        }
        Ok(Self(raw.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for UserId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Reduce an uploaded file name to a safe single path component.
///
/// Path separators become spaces, runs of whitespace become `_`, anything
/// outside `[A-Za-z0-9._-]` is dropped, and leading/trailing `.`/`_` are
/// trimmed. Falls back to `"upload"` when nothing survives.
pub fn secure_filename(name: &str) -> String {
    let spaced: String = name
        .chars()
        .map(|c| if c == '/' || c == '\\' { ' ' } else { c })
        .collect();
    let joined = spaced.split_whitespace().collect::<Vec<_>>().join("_");
    let kept: String = joined
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
        .collect();
    let trimmed = kept.trim_matches(|c| c == '.' || c == '_');
    if trimmed.is_empty() {
        "upload".to_string()
    } else {
        trimmed.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_accepts_plain_ids() {
        assert_eq!(UserId::parse("alice").unwrap().as_str(), "alice");
        assert_eq!(UserId::parse("user-42_b.c").unwrap().as_str(), "user-42_b.c");
    }

    #[test]
    fn test_parse_rejects_traversal() {
        assert_eq!(UserId::parse(""), Err(InvalidUserId::Empty));
        assert!(matches!(UserId::parse("../etc"), Err(InvalidUserId::IllegalCharacter(_))));
        assert!(matches!(UserId::parse(".."), Err(InvalidUserId::LeadingDot(_))));
        assert!(matches!(UserId::parse(".hidden"), Err(InvalidUserId::LeadingDot(_))));
        assert!(matches!(UserId::parse("a/b"), Err(InvalidUserId::IllegalCharacter(_))));
        assert!(matches!(UserId::parse("a\\b"), Err(InvalidUserId::IllegalCharacter(_))));
        assert!(matches!(UserId::parse("a\nb"), Err(InvalidUserId::IllegalCharacter(_))));
    }

    #[test]
    fn test_parse_rejects_reserved() {
        assert!(matches!(UserId::parse("probes"), Err(InvalidUserId::Reserved(_))));
    }

    #[test]
    fn test_secure_filename() {
        assert_eq!(secure_filename("My cool movie.mov"), "My_cool_movie.mov");
        assert_eq!(secure_filename("../../../etc/passwd"), "etc_passwd");
        assert_eq!(secure_filename("alice.mp4"), "alice.mp4");
        assert_eq!(secure_filename("..."), "upload");
        assert_eq!(secure_filename("selfie (1).jpg"), "selfie_1.jpg");
    }
}
