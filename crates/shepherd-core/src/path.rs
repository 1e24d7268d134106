//! Object/instance/resource paths.
//!
//! Paths are accepted in numeric form (`/3/0/1`) or with a well-known object
//! name in the first segment (`/device/0/1`). Requests always go out in the
//! numeric form.

use crate::error::{DomainError, DomainResult};
use std::fmt;

/// Reserved path devices publish their heartbeat on.
pub const HEARTBEAT_PATH: &str = "/heartbeat";

/// Core LWM2M object names and their ids.
const OBJECT_NAMES: [(&str, &str); 8] = [
    ("lwm2mSecurity", "0"),
    ("lwm2mServer", "1"),
    ("accessControl", "2"),
    ("device", "3"),
    ("connMonitor", "4"),
    ("firmware", "5"),
    ("location", "6"),
    ("connStatistics", "7"),
];

/// How deep a path reaches into the resource tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PathKind {
    Root,
    Object,
    Instance,
    Resource,
}

/// A parsed resource path.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ResourcePath {
    segments: Vec<String>,
}

impl ResourcePath {
    /// Parses `/oid[/iid[/rid]]`.
    ///
    /// Leading and trailing slashes are optional. The reserved heartbeat path
    /// parses to a single `heartbeat` segment.
    pub fn parse(raw: &str) -> DomainResult<Self> {
        let trimmed = raw.split('?').next().unwrap_or_default();
        let segments: Vec<String> = trimmed
            .split('/')
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();

        if segments.len() > 3 {
            return Err(DomainError::invalid_path(raw, "more than three segments"));
        }

        if segments.first().map(String::as_str) == Some("heartbeat") {
            if segments.len() > 1 {
                return Err(DomainError::invalid_path(raw, "heartbeat has no children"));
            }
            return Ok(Self { segments });
        }

        let mut normalized = Vec::with_capacity(segments.len());
        for (idx, segment) in segments.into_iter().enumerate() {
            let numeric = if idx == 0 {
                object_number(&segment).unwrap_or(segment)
            } else {
                segment
            };
            if numeric.parse::<u16>().is_err() {
                return Err(DomainError::invalid_path(
                    raw,
                    format!("segment {numeric} is not a numeric id"),
                ));
            }
            normalized.push(numeric);
        }

        Ok(Self {
            segments: normalized,
        })
    }

    /// The reserved heartbeat path.
    pub fn heartbeat() -> Self {
        Self {
            segments: vec!["heartbeat".to_string()],
        }
    }

    /// Path of a whole object.
    pub fn object(oid: impl Into<String>) -> Self {
        Self {
            segments: vec![oid.into()],
        }
    }

    #[must_use]
    pub fn is_heartbeat(&self) -> bool {
        self.segments.first().map(String::as_str) == Some("heartbeat")
    }

    pub fn kind(&self) -> PathKind {
        match self.segments.len() {
            0 => PathKind::Root,
            1 => PathKind::Object,
            2 => PathKind::Instance,
            _ => PathKind::Resource,
        }
    }

    pub fn oid(&self) -> Option<&str> {
        self.segments.first().map(String::as_str)
    }

    pub fn iid(&self) -> Option<&str> {
        self.segments.get(1).map(String::as_str)
    }

    pub fn rid(&self) -> Option<&str> {
        self.segments.get(2).map(String::as_str)
    }

    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// Requires the path to reach at least `kind`.
    pub fn require(&self, kind: PathKind, reason: &str) -> DomainResult<()> {
        if self.is_heartbeat() || self.kind() < kind {
            return Err(DomainError::invalid_path(self.to_string(), reason));
        }
        Ok(())
    }
}

impl fmt::Display for ResourcePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.segments.is_empty() {
            return f.write_str("/");
        }
        for segment in &self.segments {
            write!(f, "/{segment}")?;
        }
        Ok(())
    }
}

/// Maps a well-known object name to its numeric id.
fn object_number(name: &str) -> Option<String> {
    OBJECT_NAMES
        .iter()
        .find(|(key, _)| *key == name)
        .map(|(_, id)| (*id).to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_numeric_path() {
        let path = ResourcePath::parse("/3/0/1").unwrap();
        assert_eq!(path.kind(), PathKind::Resource);
        assert_eq!(path.oid(), Some("3"));
        assert_eq!(path.iid(), Some("0"));
        assert_eq!(path.rid(), Some("1"));
        assert_eq!(path.to_string(), "/3/0/1");
    }

    #[test]
    fn test_parse_named_object() {
        let path = ResourcePath::parse("device/0").unwrap();
        assert_eq!(path.to_string(), "/3/0");
        assert_eq!(path.kind(), PathKind::Instance);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(ResourcePath::parse("/3/x").is_err());
        assert!(ResourcePath::parse("/1/2/3/4").is_err());
        assert!(ResourcePath::parse("/heartbeat/0").is_err());
    }

    #[test]
    fn test_heartbeat_path() {
        let path = ResourcePath::parse(HEARTBEAT_PATH).unwrap();
        assert!(path.is_heartbeat());
        assert_eq!(path.to_string(), HEARTBEAT_PATH);
        assert_eq!(path, ResourcePath::heartbeat());
    }

    #[test]
    fn test_require_depth() {
        let path = ResourcePath::parse("/3").unwrap();
        assert!(path.require(PathKind::Instance, "needs an instance").is_err());
        assert!(path.require(PathKind::Object, "needs an object").is_ok());
        assert_eq!(ResourcePath::parse("/").unwrap().kind(), PathKind::Root);
    }
}
