//! Database repository for users and households.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::PgPool;
use tally_core::{HouseholdId, UserId};

/// A household as stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HouseholdRecord {
    pub id: HouseholdId,
    pub name: String,
}

/// A user as stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserRecord {
    pub id: UserId,
    /// Name shown to the model in the sender block.
    pub display_name: String,
    pub household: Option<HouseholdRecord>,
    pub created_at: DateTime<Utc>,
}

/// Repository for user and household registration.
pub struct UserRepository {
    pool: PgPool,
}

impl UserRepository {
    /// Creates a new user repository.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Creates or updates a user together with their household.
    pub async fn upsert(&self, user: &UserRecord) -> Result<(), sqlx::Error> {
        let mut tx = self.pool.begin().await?;

        if let Some(household) = &user.household {
            sqlx::query(
                r#"
                INSERT INTO households (id, name)
                VALUES ($1, $2)
                ON CONFLICT (id) DO UPDATE SET name = EXCLUDED.name
                "#,
            )
            .bind(household.id.to_string())
            .bind(&household.name)
            .execute(&mut *tx)
            .await?;
        }

        sqlx::query(
            r#"
            INSERT INTO users (id, display_name, household_id, created_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (id) DO UPDATE
            SET display_name = EXCLUDED.display_name,
                household_id = EXCLUDED.household_id
            "#,
        )
        .bind(user.id.to_string())
        .bind(&user.display_name)
        .bind(user.household.as_ref().map(|h| h.id.to_string()))
        .bind(user.created_at)
        .execute(&mut *tx)
        .await?;

        tx.commit().await
    }
}
