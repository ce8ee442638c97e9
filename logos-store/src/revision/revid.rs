use std::fmt;
use std::str::FromStr;

use crate::error::StoreError;

/// A revision identifier of the form `<generation>-<digest>`, e.g. `2-def`.
///
/// Ordering is by generation first, then by digest compared bytewise. This
/// is the tie-break used when choosing among conflicting leaves.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RevId {
    generation: u32,
    digest: String,
}

impl RevId {
    pub fn new(generation: u32, digest: impl Into<String>) -> Result<Self, StoreError> {
        let digest = digest.into();
        if generation == 0 {
            return Err(StoreError::BadRequest("revision generation must be >= 1".into()));
        }
        if digest.is_empty() {
            return Err(StoreError::BadRequest("revision digest must not be empty".into()));
        }
        Ok(Self { generation, digest })
    }

    pub fn generation(&self) -> u32 {
        self.generation
    }

    pub fn digest(&self) -> &str {
        &self.digest
    }
}

impl FromStr for RevId {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || StoreError::BadRequest(format!("invalid revision ID '{s}'"));
        let (generation, digest) = s.split_once('-').ok_or_else(invalid)?;
        if generation.is_empty() || !generation.bytes().all(|b| b.is_ascii_digit()) {
            return Err(invalid());
        }
        let generation: u32 = generation.parse().map_err(|_| invalid())?;
        Self::new(generation, digest).map_err(|_| invalid())
    }
}

impl fmt::Display for RevId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.generation, self.digest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rev(s: &str) -> RevId {
        s.parse().unwrap()
    }

    #[test]
    fn test_parse_and_display() {
        let r = rev("12-abcdef");
        assert_eq!(r.generation(), 12);
        assert_eq!(r.digest(), "abcdef");
        assert_eq!(r.to_string(), "12-abcdef");
        // Only the first dash separates generation from digest
        assert_eq!(rev("3-a-b").digest(), "a-b");
    }

    #[test]
    fn test_rejects_malformed() {
        for bad in ["", "abc", "-abc", "0-abc", "1-", "x-abc", "+1-abc", "99999999999-a"] {
            let err = bad.parse::<RevId>().unwrap_err();
            assert!(matches!(err, StoreError::BadRequest(_)), "{bad:?} accepted");
        }
    }

    #[test]
    fn test_ordering_generation_then_digest() {
        assert!(rev("2-aaa") > rev("1-zzz"));
        assert!(rev("10-a") > rev("9-z"));
        assert!(rev("2-xyz") > rev("2-def"));
        assert!(rev("2-B") < rev("2-a"));
    }
}
