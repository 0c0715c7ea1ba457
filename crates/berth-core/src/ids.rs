//! Hierarchical application ids.
//!
//! An `AppId` is an absolute, case-sensitive path (`/a/b/c`). The root group
//! is the empty path and renders as `/`. Relative ids appear only in user
//! input and are resolved against a base via [`AppId::canonicalize`].

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{ValidationError, ValidationResult};

/// An absolute application path. Immutable value type.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AppId {
    segments: Vec<String>,
}

impl AppId {
    /// The root path (empty, renders as `/`).
    pub fn root() -> Self {
        AppId { segments: Vec::new() }
    }

    /// Parse an absolute path. Rejects relative paths, empty segments,
    /// `.` and `..`. At most one trailing slash is tolerated; `//` is not.
    pub fn parse(raw: &str) -> ValidationResult<Self> {
        if !raw.starts_with('/') {
            return Err(ValidationError::InvalidAppId(
                raw.to_string(),
                "path must be absolute".to_string(),
            ));
        }
        let trimmed = raw.strip_suffix('/').unwrap_or(raw);
        let mut segments = Vec::new();
        for seg in trimmed.split('/').skip(1) {
            if seg.is_empty() {
                return Err(ValidationError::InvalidAppId(
                    raw.to_string(),
                    "path may not contain empty segments".to_string(),
                ));
            }
            if seg == "." || seg == ".." {
                return Err(ValidationError::InvalidAppId(
                    raw.to_string(),
                    "path may not contain `.` or `..`".to_string(),
                ));
            }
            segments.push(seg.to_string());
        }
        Ok(AppId { segments })
    }

    /// Resolve a possibly-relative path against `base`.
    pub fn canonicalize(raw: &str, base: &AppId) -> ValidationResult<Self> {
        if raw.starts_with('/') {
            Self::parse(raw)
        } else if base.is_root() {
            Self::parse(&format!("/{raw}"))
        } else {
            Self::parse(&format!("{base}/{raw}"))
        }
    }

    /// The parent path; the root is its own parent.
    pub fn parent(&self) -> AppId {
        let mut segments = self.segments.clone();
        segments.pop();
        AppId { segments }
    }

    /// Append a single segment.
    pub fn join(&self, segment: &str) -> ValidationResult<AppId> {
        if self.is_root() {
            Self::parse(&format!("/{segment}"))
        } else {
            Self::parse(&format!("{self}/{segment}"))
        }
    }

    pub fn is_root(&self) -> bool {
        self.segments.is_empty()
    }

    /// True when `self` is a strict or equal descendant of `ancestor`.
    pub fn is_descendant_of(&self, ancestor: &AppId) -> bool {
        self.segments.len() >= ancestor.segments.len()
            && self.segments[..ancestor.segments.len()] == ancestor.segments[..]
    }
}

impl fmt::Display for AppId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.segments.is_empty() {
            write!(f, "/")
        } else {
            for seg in &self.segments {
                write!(f, "/{seg}")?;
            }
            Ok(())
        }
    }
}

impl TryFrom<String> for AppId {
    type Error = ValidationError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        AppId::parse(&value)
    }
}

impl From<AppId> for String {
    fn from(id: AppId) -> String {
        id.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_absolute_paths() {
        let id = AppId::parse("/prod/db/postgres").unwrap();
        assert_eq!(id.to_string(), "/prod/db/postgres");
    }

    #[test]
    fn root_renders_as_slash() {
        assert_eq!(AppId::root().to_string(), "/");
        assert_eq!(AppId::parse("/").unwrap(), AppId::root());
    }

    #[test]
    fn rejects_relative_and_dot_segments() {
        assert!(AppId::parse("prod/db").is_err());
        assert!(AppId::parse("/prod/./db").is_err());
        assert!(AppId::parse("/prod/../db").is_err());
    }

    #[test]
    fn tolerates_trailing_slash() {
        assert_eq!(
            AppId::parse("/prod/db/").unwrap(),
            AppId::parse("/prod/db").unwrap()
        );
    }

    #[test]
    fn rejects_empty_segments() {
        assert!(AppId::parse("/prod//db").is_err());
        assert!(AppId::parse("//").is_err());
        assert!(AppId::parse("//prod").is_err());
    }

    #[test]
    fn canonicalize_resolves_relative_against_base() {
        let base = AppId::parse("/prod").unwrap();
        let id = AppId::canonicalize("db/postgres", &base).unwrap();
        assert_eq!(id.to_string(), "/prod/db/postgres");

        let abs = AppId::canonicalize("/other", &base).unwrap();
        assert_eq!(abs.to_string(), "/other");

        let from_root = AppId::canonicalize("db", &AppId::root()).unwrap();
        assert_eq!(from_root.to_string(), "/db");
    }

    #[test]
    fn parent_and_descendants() {
        let id = AppId::parse("/prod/db/postgres").unwrap();
        assert_eq!(id.parent().to_string(), "/prod/db");
        assert!(id.is_descendant_of(&AppId::parse("/prod").unwrap()));
        assert!(id.is_descendant_of(&id));
        assert!(id.is_descendant_of(&AppId::root()));
        assert!(!id.is_descendant_of(&AppId::parse("/dev").unwrap()));
        assert_eq!(AppId::root().parent(), AppId::root());
    }

    #[test]
    fn serde_round_trips_as_string() {
        let id = AppId::parse("/prod/web").unwrap();
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"/prod/web\"");
        let back: AppId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }
}
