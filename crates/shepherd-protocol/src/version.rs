//! LWM2M enabler versions announced at registration (`lwm2m=`).

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// LWM2M enabler version.
///
/// Devices announce `major.minor` or `major.minor.patch` ("1.0", "1.0.0").
/// - Major version bump: incompatible registration interface
/// - Minor/patch bump: backward compatible
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Lwm2mVersion {
    pub major: u16,
    pub minor: u16,
    pub patch: u16,
}

impl Lwm2mVersion {
    /// Version this server implements.
    pub const CURRENT: Lwm2mVersion = Lwm2mVersion {
        major: 1,
        minor: 0,
        patch: 0,
    };

    pub const fn new(major: u16, minor: u16, patch: u16) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    /// Parses "1.0" or "1.0.0".
    pub fn parse(s: &str) -> Result<Self, VersionError> {
        let parts: Vec<&str> = s.split('.').collect();
        if parts.len() != 2 && parts.len() != 3 {
            return Err(VersionError::InvalidFormat(s.to_string()));
        }

        let number = |idx: usize| -> Result<u16, VersionError> {
            match parts.get(idx) {
                Some(part) => part
                    .parse::<u16>()
                    .map_err(|_| VersionError::InvalidFormat(s.to_string())),
                None => Ok(0),
            }
        };

        Ok(Self {
            major: number(0)?,
            minor: number(1)?,
            patch: number(2)?,
        })
    }

    /// Returns true if this server can talk to a device of this version.
    pub fn is_compatible_with(&self, other: &Lwm2mVersion) -> bool {
        self.major == other.major
    }

    /// Parses and checks compatibility with [`Lwm2mVersion::CURRENT`].
    pub fn check_supported(s: &str) -> Result<Self, VersionError> {
        let version = Self::parse(s)?;
        if !Self::CURRENT.is_compatible_with(&version) {
            return Err(VersionError::Incompatible {
                got: version.to_string(),
                expected: Self::CURRENT.to_string(),
            });
        }
        Ok(version)
    }
}

impl Default for Lwm2mVersion {
    fn default() -> Self {
        Self::CURRENT
    }
}

impl fmt::Display for Lwm2mVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Errors that can occur with version handling.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum VersionError {
    #[error("Invalid version format: {0}")]
    InvalidFormat(String),

    #[error("Incompatible version: got {got}, expected {expected}")]
    Incompatible { got: String, expected: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_parse() {
        let v = Lwm2mVersion::parse("1.0").unwrap();
        assert_eq!(v, Lwm2mVersion::new(1, 0, 0));
        let v = Lwm2mVersion::parse("1.1.2").unwrap();
        assert_eq!(v.patch, 2);
    }

    #[test]
    fn test_version_parse_invalid() {
        assert!(Lwm2mVersion::parse("1").is_err());
        assert!(Lwm2mVersion::parse("1.0.0.0").is_err());
        assert!(Lwm2mVersion::parse("abc").is_err());
    }

    #[test]
    fn test_version_compatibility() {
        assert!(Lwm2mVersion::check_supported("1.1").is_ok());
        assert!(matches!(
            Lwm2mVersion::check_supported("2.0"),
            Err(VersionError::Incompatible { .. })
        ));
    }

    #[test]
    fn test_version_display() {
        assert_eq!(Lwm2mVersion::new(1, 2, 0).to_string(), "1.2.0");
    }
}
