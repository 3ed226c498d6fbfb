//! Chunk identity.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A chunk of a database family.
///
/// Replication operates on whole chunks, and chunks of all databases of one
/// family are collocated, so the family name (not a database name) is part
/// of the identity. Ordering is lexicographic over `(family, number)`.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Chunk {
    /// The database family the chunk belongs to.
    pub family: String,
    /// The chunk number within the family's partitioning.
    pub number: u32,
}

impl Chunk {
    /// Create a new chunk identity.
    pub fn new(family: impl Into<String>, number: u32) -> Self {
        Self {
            family: family.into(),
            number,
        }
    }
}

impl fmt::Display for Chunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.family, self.number)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordering_is_lexicographic_over_family_then_number() {
        let a = Chunk::new("alpha", 10);
        let b = Chunk::new("alpha", 11);
        let c = Chunk::new("beta", 1);

        assert!(a < b);
        assert!(b < c);
        assert_eq!(a, Chunk::new("alpha", 10));
    }

    #[test]
    fn display() {
        assert_eq!(Chunk::new("test", 123).to_string(), "test:123");
    }
}
