//! Newtype wrappers for container-engine identifiers.
//!
//! All of them serialize as plain strings so `config.json` stays readable.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Deref;

macro_rules! engine_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(s: impl Into<String>) -> Self {
                Self(s.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn into_inner(self) -> String {
                self.0
            }

            /// First 12 characters, the way `docker ps` abbreviates ids.
            pub fn short(&self) -> &str {
                let end = self.0.char_indices().nth(12).map_or(self.0.len(), |(i, _)| i);
                &self.0[..end]
            }
        }

        impl Deref for $name {
            type Target = str;
            fn deref(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }

        impl PartialEq<str> for $name {
            fn eq(&self, other: &str) -> bool {
                self.0 == other
            }
        }

        impl PartialEq<&str> for $name {
            fn eq(&self, other: &&str) -> bool {
                self.0 == *other
            }
        }

        impl From<String> for $name {
            fn from(s: String) -> Self {
                Self(s)
            }
        }

        impl From<&str> for $name {
            fn from(s: &str) -> Self {
                Self(s.to_owned())
            }
        }
    };
}

engine_id!(
    /// Runtime identifier of a created container.
    ContainerId
);

engine_id!(
    /// Runtime identifier of a pulled or built image.
    ImageId
);

engine_id!(
    /// Runtime identifier of a network.
    NetworkId
);

engine_id!(
    /// Runtime identifier of a named volume.
    VolumeId
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn container_id_display_and_as_ref() {
        let id = ContainerId::new("abc123");
        assert_eq!(id.to_string(), "abc123");
        assert_eq!(id.as_str(), "abc123");
        assert_eq!(AsRef::<str>::as_ref(&id), "abc123");
    }

    #[test]
    fn image_id_serializes_as_plain_string() {
        let id = ImageId::new("sha256:deadbeef");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"sha256:deadbeef\"");
        let back: ImageId = serde_json::from_str(&json).unwrap();
        assert_eq!(back, id);
    }

    #[test]
    fn short_truncates_long_ids_only() {
        let long = NetworkId::new("0123456789abcdef0123");
        assert_eq!(long.short(), "0123456789ab");
        let short = VolumeId::new("data");
        assert_eq!(short.short(), "data");
    }

    #[test]
    fn compares_against_str() {
        let id = VolumeId::from("db_data");
        assert!(id == "db_data");
        assert_eq!(id.into_inner(), "db_data");
    }
}
