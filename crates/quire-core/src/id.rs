//! Strongly-typed identifiers for Quire entities.
//!
//! Project and document ids are opaque strings assigned by the surrounding
//! application (typically 24-character hex object ids). They are validated
//! once at the boundary so that they can be embedded in storage paths.
//!
//! Range ids (tracked changes and comments) are derived from an [`IdSeed`]
//! plus a per-seed increment, so that collaborators editing concurrently with
//! different seeds never collide.
//!
//! # Example
//!
//! ```rust
//! use quire_core::id::{DocId, IdSeed, RangeIdGenerator};
//!
//! let doc = DocId::new("5f1d6e2a9c0b").unwrap();
//! let mut ids = RangeIdGenerator::new(IdSeed::from("s1"));
//! assert_eq!(ids.next_id(), "s1000001");
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use ulid::Ulid;

use crate::error::{Error, Result};

/// Maximum accepted length for project and document ids.
const MAX_ID_LEN: usize = 128;

fn validate_id(kind: &str, id: &str) -> Result<()> {
    if id.is_empty() {
        return Err(Error::InvalidId {
            message: format!("{kind} ID cannot be empty"),
        });
    }

    if id.len() > MAX_ID_LEN {
        return Err(Error::InvalidId {
            message: format!("{kind} ID '{id}' is too long (maximum {MAX_ID_LEN} characters)"),
        });
    }

    if !id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(Error::InvalidId {
            message: format!(
                "{kind} ID '{id}' contains invalid characters (only letters, digits, '-' and '_' allowed)"
            ),
        });
    }

    Ok(())
}

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident, $kind:literal) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(try_from = "String", into = "String")]
        pub struct $name(String);

        impl $name {
            #[doc = concat!("Creates a ", $kind, " ID after validating the format.")]
            ///
            /// # Errors
            ///
            /// Returns an error if the ID is empty, too long, or contains
            /// characters that are not safe in storage paths.
            pub fn new(id: impl Into<String>) -> Result<Self> {
                let id = id.into();
                validate_id($kind, &id)?;
                Ok(Self(id))
            }

            /// Returns the ID as a string slice.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl FromStr for $name {
            type Err = Error;

            fn from_str(s: &str) -> Result<Self> {
                Self::new(s)
            }
        }

        impl TryFrom<String> for $name {
            type Error = Error;

            fn try_from(value: String) -> Result<Self> {
                Self::new(value)
            }
        }

        impl From<$name> for String {
            fn from(value: $name) -> Self {
                value.0
            }
        }

        impl AsRef<str> for $name {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

string_id!(
    /// Identifier of a project (the owner of a set of documents).
    ProjectId,
    "project"
);

string_id!(
    /// Identifier of a single collaboratively edited document.
    DocId,
    "document"
);

/// Seed for range ids.
///
/// Generated seeds follow the object-id layout: 8 hex digits of unix seconds
/// followed by 10 random hex digits, leaving room for a 6-digit increment.
/// Track-changes sessions supply their own seed so that ids are predictable
/// for the client that created them.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdSeed(String);

impl IdSeed {
    /// Generates a fresh seed.
    #[must_use]
    pub fn generate() -> Self {
        let ulid = Ulid::new();
        let seconds = ulid.timestamp_ms() / 1000;
        let random = ulid.random() & 0xff_ffff_ffff;
        Self(format!("{:08x}{random:010x}", seconds & 0xffff_ffff))
    }

    /// Returns the seed as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for IdSeed {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for IdSeed {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for IdSeed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Produces `seed + zero-padded hex increment` ids.
#[derive(Debug, Clone)]
pub struct RangeIdGenerator {
    seed: IdSeed,
    increment: u32,
}

impl RangeIdGenerator {
    /// Creates a generator starting at increment zero.
    #[must_use]
    pub fn new(seed: IdSeed) -> Self {
        Self { seed, increment: 0 }
    }

    /// Replaces the seed and resets the increment.
    pub fn reseed(&mut self, seed: IdSeed) {
        self.seed = seed;
        self.increment = 0;
    }

    /// Returns the current seed.
    #[must_use]
    pub fn seed(&self) -> &IdSeed {
        &self.seed
    }

    /// Returns the next id for the current seed.
    pub fn next_id(&mut self) -> String {
        self.increment += 1;
        format!("{}{:06x}", self.seed, self.increment)
    }
}

impl Default for RangeIdGenerator {
    fn default() -> Self {
        Self::new(IdSeed::generate())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_doc_ids() {
        assert!(DocId::new("5f1d6e2a9c0b1e0012345678").is_ok());
        assert!(DocId::new("doc_1-a").is_ok());
        assert!(ProjectId::new("p").is_ok());
    }

    #[test]
    fn invalid_doc_ids() {
        assert!(DocId::new("").is_err());
        assert!(DocId::new("has/slash").is_err());
        assert!(DocId::new("has space").is_err());
        assert!(DocId::new("x".repeat(MAX_ID_LEN + 1)).is_err());
    }

    #[test]
    fn doc_id_serde_validates() {
        let id: DocId = serde_json::from_str("\"abc\"").expect("valid");
        assert_eq!(id.as_str(), "abc");
        assert!(serde_json::from_str::<DocId>("\"a/b\"").is_err());
    }

    #[test]
    fn generated_seed_has_object_id_prefix_shape() {
        let seed = IdSeed::generate();
        assert_eq!(seed.as_str().len(), 18);
        assert!(seed.as_str().chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn range_ids_increment_per_seed() {
        let mut ids = RangeIdGenerator::new(IdSeed::from("587357bd35e64f6157"));
        assert_eq!(ids.next_id(), "587357bd35e64f6157000001");
        assert_eq!(ids.next_id(), "587357bd35e64f6157000002");

        ids.reseed(IdSeed::from("s1"));
        assert_eq!(ids.next_id(), "s1000001");
    }
}
