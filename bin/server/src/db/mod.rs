//! Postgres repositories for tally.
//!
//! This module provides data access for:
//! - Ledger transactions, behind `TransactionRepository`
//! - Conversation sessions and messages, behind `SessionRepository`
//! - User and household profiles

pub mod session;
pub mod transaction;
pub mod user;

pub use session::PgSessionRepository;
pub use transaction::PgTransactionRepository;
pub use user::{HouseholdRecord, UserRecord, UserRepository};

use std::fmt::Display;
use std::str::FromStr;

/// Parses a stored id column, reporting failures as decode errors.
fn decode_id<T>(kind: &str, value: &str) -> Result<T, sqlx::Error>
where
    T: FromStr,
    T::Err: Display,
{
    T::from_str(value).map_err(|e| {
        sqlx::Error::Decode(Box::new(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("invalid {kind} id '{value}': {e}"),
        )))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tally_core::UserId;

    #[test]
    fn decode_id_accepts_prefixed_ids() {
        let id = UserId::new();
        let parsed: UserId = decode_id("user", &id.to_string()).unwrap();
        assert_eq!(parsed, id);
    }

    #[test]
    fn decode_id_reports_decode_error() {
        let err = decode_id::<UserId>("user", "garbage").unwrap_err();
        assert!(matches!(err, sqlx::Error::Decode(_)));
        assert!(err.to_string().contains("invalid user id 'garbage'"));
    }
}
