// API versions
// Parsing, formatting and ordering of the v<major>.<minor> version tags

use std::fmt;
use std::str::FromStr;

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};

/// An NMOS API version, e.g. `v1.3`.
///
/// Versions are ordered by major then minor component, which drives both
/// registry version selection and query downgrade decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ApiVersion {
    pub major: u32,
    pub minor: u32,
}

impl ApiVersion {
    pub const fn new(major: u32, minor: u32) -> Self {
        ApiVersion { major, minor }
    }

    /// Whether a resource created against this version may be returned to a
    /// client that requested `request_version`, given the permitted
    /// `downgrade_version`.
    ///
    /// Downgrade is only ever permitted within a major version; a resource
    /// from a later minor version is hidden unless the downgrade bound
    /// reaches it.
    pub fn is_permitted_downgrade(self, request_version: ApiVersion, downgrade_version: ApiVersion) -> bool {
        if self.major != request_version.major {
            return false;
        }
        self.minor <= request_version.minor
            || (self.major == downgrade_version.major && self.minor <= downgrade_version.minor)
    }
}

/// The IS-04 versions this implementation supports.
pub const IS04_VERSIONS: &[ApiVersion] = &[
    ApiVersion::new(1, 0),
    ApiVersion::new(1, 1),
    ApiVersion::new(1, 2),
    ApiVersion::new(1, 3),
];

/// The IS-05 versions this implementation supports.
pub const IS05_VERSIONS: &[ApiVersion] = &[ApiVersion::new(1, 0), ApiVersion::new(1, 1)];

/// The IS-08 versions this implementation supports.
pub const IS08_VERSIONS: &[ApiVersion] = &[ApiVersion::new(1, 0)];

/// The IS-10 versions this implementation supports.
pub const IS10_VERSIONS: &[ApiVersion] = &[ApiVersion::new(1, 0)];

impl fmt::Display for ApiVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}.{}", self.major, self.minor)
    }
}

impl FromStr for ApiVersion {
    type Err = ParseApiVersionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.strip_prefix('v').ok_or(ParseApiVersionError)?;
        let (major, minor) = s.split_once('.').ok_or(ParseApiVersionError)?;
        Ok(ApiVersion {
            major: major.parse().map_err(|_| ParseApiVersionError)?,
            minor: minor.parse().map_err(|_| ParseApiVersionError)?,
        })
    }
}

/// Error returned when a string is not a valid `v<major>.<minor>` tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParseApiVersionError;

impl fmt::Display for ParseApiVersionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid API version")
    }
}

impl std::error::Error for ParseApiVersionError {}

impl Serialize for ApiVersion {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for ApiVersion {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_display() {
        let version: ApiVersion = "v1.3".parse().unwrap();
        assert_eq!(version, ApiVersion::new(1, 3));
        assert_eq!(version.to_string(), "v1.3");

        assert!("1.3".parse::<ApiVersion>().is_err());
        assert!("v1".parse::<ApiVersion>().is_err());
    }

    #[test]
    fn test_ordering() {
        assert!(ApiVersion::new(1, 2) < ApiVersion::new(1, 3));
        assert!(ApiVersion::new(1, 3) < ApiVersion::new(2, 0));
    }

    #[test]
    fn test_permitted_downgrade() {
        let v1_2 = ApiVersion::new(1, 2);
        let v1_3 = ApiVersion::new(1, 3);
        let v2_0 = ApiVersion::new(2, 0);

        // a v1.2 resource is visible to a v1.3 request
        assert!(v1_2.is_permitted_downgrade(v1_3, v1_3));
        // a v1.3 resource is hidden from a v1.2 request by default
        assert!(!v1_3.is_permitted_downgrade(v1_2, v1_2));
        // unless downgrade to v1.3 is permitted
        assert!(v1_3.is_permitted_downgrade(v1_2, v1_3));
        // never across major versions
        assert!(!v2_0.is_permitted_downgrade(v1_3, v2_0));
    }
}
