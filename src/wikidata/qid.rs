//! Defines a custom type for Wikidata entity ids and associated parsing/validation logic.

use std::fmt;
use std::marker::PhantomData;

use arrayvec::ArrayString;
use serde::de::{self, Visitor};
use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

/// Represents errors that can occur when parsing or validating a Wikidata entity id.
#[derive(Error, Debug)]
pub enum QidError {
    /// The candidate string does not start with the `Q` prefix.
    #[error("entity id does not start with 'Q'")]
    MissingPrefix,
    /// The part after the prefix is empty, zero, non-numeric, or too long.
    #[error("entity id has an invalid numeric part")]
    InvalidNumber,
}

/// A validated Wikidata item id (`Q` followed by a positive integer).
///
/// Stores both the original string representation and the parsed integer
/// value for efficient hashing and comparison.
///
/// Note: Equality comparison is based solely on the `int` field. The string
/// representation is canonical by construction (no leading zeros accepted).
#[derive(Debug, Clone)]
pub struct Qid {
    /// The integer value after the `Q` prefix.
    int: u64,
    /// The original string representation. The buffer holds `Q` plus the 20
    /// digits of the largest `u64`, so every valid id fits.
    string: ArrayString<21>,
}

impl Serialize for Qid {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(self.string.as_str())
    }
}

impl<'de> Deserialize<'de> for Qid {
    /// Deserializes a string value into a validated `Qid`.
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let visitor = QidVisitor(PhantomData);
        deserializer.deserialize_str(visitor)
    }
}

/// A visitor for deserializing a string into a `Qid`.
struct QidVisitor(PhantomData<fn() -> Qid>);
impl Visitor<'_> for QidVisitor {
    type Value = Qid;

    fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(formatter, "a Wikidata item id such as \"Q8684\"")
    }

    fn visit_str<E>(self, qid_str: &str) -> Result<Qid, E>
    where
        E: de::Error,
    {
        Qid::try_from(qid_str).map_err(|e| de::Error::custom(format!("invalid qid: {e}")))
    }
}

impl TryFrom<&str> for Qid {
    type Error = QidError;

    /// Attempts to create a `Qid` from a string slice.
    ///
    /// Validates the `Q` prefix, that the remainder is a decimal number
    /// fitting a `u64` without leading zeros, and that it is non-zero.
    fn try_from(qid_str: &str) -> Result<Self, Self::Error> {
        let digits = qid_str.strip_prefix('Q').ok_or(QidError::MissingPrefix)?;

        // Leading zeros are rejected so the string form stays canonical and
        // int-based equality cannot alias two distinct strings.
        if digits.is_empty()
            || digits.len() > 20
            || digits.starts_with('0')
            || !digits.bytes().all(|b| b.is_ascii_digit())
        {
            return Err(QidError::InvalidNumber);
        }

        // Twenty digits can still exceed u64::MAX; parse catches overflow.
        let int: u64 = digits.parse().map_err(|_| QidError::InvalidNumber)?;
        Ok(Qid {
            int,
            // Safe because the length was checked above
            string: ArrayString::from(qid_str).unwrap(),
        })
    }
}

impl From<u64> for Qid {
    /// Creates a `Qid` from its numeric value.
    ///
    /// # Example
    ///
    /// ```ignore
    /// let id = Qid::from(8684u64);
    /// assert_eq!(id.as_ref(), "Q8684");
    /// ```
    fn from(int: u64) -> Self {
        let mut string = ArrayString::<21>::new();
        // The buffer fits `Q` plus any u64, so this write cannot fail.
        fmt::Write::write_fmt(&mut string, format_args!("Q{int}"))
            .expect("qid buffer holds every u64");
        Qid { int, string }
    }
}

impl AsRef<str> for Qid {
    fn as_ref(&self) -> &str {
        self.string.as_str()
    }
}

impl PartialEq for Qid {
    /// Compares two `Qid` instances based only on their integer value.
    fn eq(&self, other: &Self) -> bool {
        self.int == other.int
    }
}

impl Eq for Qid {}

impl PartialOrd for Qid {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Qid {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.int.cmp(&other.int)
    }
}

impl std::hash::Hash for Qid {
    /// Implements hashing for `Qid` based on its integer value.
    fn hash<H: std::hash::Hasher>(&self, hasher: &mut H) {
        hasher.write_u64(self.int)
    }
}

/// Enables the use of `Qid` with `nohash_hasher::NoHashHasher`.
impl nohash_hasher::IsEnabled for Qid {}

impl fmt::Display for Qid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.string.as_str())
    }
}

impl Qid {
    /// Returns the numeric value of this entity id.
    pub fn as_u64(&self) -> u64 {
        self.int
    }
}
