use crate::RemoteError;
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

/// Three-component release number. Missing trailing components read as `0`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Version([u64; 3]);

impl Version {
    pub fn new(major: u64, minor: u64, patch: u64) -> Self {
        Self([major, minor, patch])
    }
}

impl FromStr for Version {
    type Err = RemoteError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || RemoteError::InvalidVersion(s.to_owned());
        let mut parts = [0u64; 3];
        for (i, part) in s.trim().split('.').enumerate() {
            let slot = parts.get_mut(i).ok_or_else(invalid)?;
            *slot = part.parse().map_err(|_| invalid())?;
        }
        Ok(Self(parts))
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.0[0], self.0[1], self.0[2])
    }
}

/// Numeric component-wise comparison: `1.10.0` is newer than `1.2.0`.
pub fn compare_versions(a: &str, b: &str) -> Result<Ordering, RemoteError> {
    Ok(a.parse::<Version>()?.cmp(&b.parse::<Version>()?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn components_compare_numerically() {
        assert_eq!(
            compare_versions("1.2.0", "1.10.0").unwrap(),
            Ordering::Less
        );
        assert_eq!(
            compare_versions("1.10.0", "1.2.0").unwrap(),
            Ordering::Greater
        );
        assert_eq!(compare_versions("2.0.0", "2.0.0").unwrap(), Ordering::Equal);
    }

    #[test]
    fn major_dominates() {
        assert_eq!(
            compare_versions("2.0.0", "1.99.99").unwrap(),
            Ordering::Greater
        );
    }

    #[test]
    fn short_versions_pad_with_zero() {
        assert_eq!(compare_versions("1.2", "1.2.0").unwrap(), Ordering::Equal);
        assert_eq!("3".parse::<Version>().unwrap(), Version::new(3, 0, 0));
    }

    #[test]
    fn malformed_versions_rejected() {
        assert!(matches!(
            compare_versions("1.x.0", "1.0.0"),
            Err(RemoteError::InvalidVersion(_))
        ));
        assert!("".parse::<Version>().is_err());
        assert!("1.2.3.4".parse::<Version>().is_err());
        assert!("1..2".parse::<Version>().is_err());
    }

    #[test]
    fn display_is_canonical() {
        assert_eq!("1.4".parse::<Version>().unwrap().to_string(), "1.4.0");
    }
}
