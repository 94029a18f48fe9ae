//! Transaction fingerprints.
//!
//! A fingerprint is a SHA-256 digest over a canonical rendering of the
//! identifying fields of a transaction. Two transactions with the same
//! description, timestamp (to the second), author, household and amount (to
//! the cent) always produce the same fingerprint.

use crate::error::HashError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;
use tally_core::{HouseholdId, UserId};

/// Hex-encoded deduplication key of a transaction.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    /// Wraps a previously computed fingerprint, e.g. one read from storage.
    #[must_use]
    pub fn from_stored(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Returns the hex digest.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Computes the fingerprint of a transaction.
///
/// Fields are rendered in a fixed order: Unix seconds, author id, household
/// id, amount with two decimals, then the description. The description goes
/// last so that separator characters inside it cannot shift other fields.
///
/// # Errors
///
/// Returns `HashError::MissingAttribution` when both `author_id` and
/// `household_id` are absent.
pub fn fingerprint(
    description: &str,
    transaction_date: DateTime<Utc>,
    author_id: Option<UserId>,
    household_id: Option<HouseholdId>,
    amount: f64,
) -> Result<Fingerprint, HashError> {
    if author_id.is_none() && household_id.is_none() {
        return Err(HashError::MissingAttribution);
    }

    let canonical = format!(
        "{}|{}|{}|{:.2}|{}",
        transaction_date.timestamp(),
        author_id.map(|id| id.to_string()).unwrap_or_default(),
        household_id.map(|id| id.to_string()).unwrap_or_default(),
        amount,
        description,
    );

    let digest = Sha256::digest(canonical.as_bytes());
    Ok(Fingerprint(hex::encode(digest)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn date() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 9, 27, 22, 0, 0).unwrap()
    }

    #[test]
    fn same_inputs_same_fingerprint() {
        let author = UserId::new();
        let a = fingerprint("groceries", date(), Some(author), None, 42.5).unwrap();
        let b = fingerprint("groceries", date(), Some(author), None, 42.5).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.as_str().len(), 64);
    }

    #[test]
    fn each_field_changes_fingerprint() {
        let author = UserId::new();
        let household = HouseholdId::new();
        let base = fingerprint("rent", date(), Some(author), Some(household), 1200.0).unwrap();

        let variants = [
            fingerprint("Rent", date(), Some(author), Some(household), 1200.0),
            fingerprint(
                "rent",
                date() + chrono::Duration::seconds(1),
                Some(author),
                Some(household),
                1200.0,
            ),
            fingerprint("rent", date(), Some(UserId::new()), Some(household), 1200.0),
            fingerprint("rent", date(), Some(author), Some(HouseholdId::new()), 1200.0),
            fingerprint("rent", date(), Some(author), None, 1200.0),
            fingerprint("rent", date(), Some(author), Some(household), 1200.01),
        ];

        for variant in variants {
            assert_ne!(variant.unwrap(), base);
        }
    }

    #[test]
    fn amount_is_rounded_to_cents() {
        let author = UserId::new();
        let a = fingerprint("coffee", date(), Some(author), None, 3.5).unwrap();
        let b = fingerprint("coffee", date(), Some(author), None, 3.500_000_1).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn sub_second_precision_is_ignored() {
        let author = UserId::new();
        let later = date() + chrono::Duration::milliseconds(400);
        let a = fingerprint("coffee", date(), Some(author), None, 3.5).unwrap();
        let b = fingerprint("coffee", later, Some(author), None, 3.5).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn household_only_is_attributable() {
        assert!(fingerprint("utilities", date(), None, Some(HouseholdId::new()), 80.0).is_ok());
    }

    #[test]
    fn missing_attribution_fails() {
        let err = fingerprint("utilities", date(), None, None, 80.0).unwrap_err();
        assert_eq!(err, HashError::MissingAttribution);
    }
}
