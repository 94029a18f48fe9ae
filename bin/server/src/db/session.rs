//! Postgres storage for conversation sessions and messages.

use super::decode_id;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rootcause::Report;
use sqlx::{FromRow, PgPool, Postgres, Transaction as PgTransaction};
use tally_conversation::{
    AuthorProfile, HouseholdProfile, Message, MessageRole, Part, Session, SessionRepository,
    SessionState, SessionStoreError,
};
use tally_core::{ChannelId, ConversationSessionId, MessageId, Result, UserId};
use tracing::{debug, instrument};

/// Row type for session queries.
#[derive(FromRow)]
struct SessionRow {
    id: String,
    channel_id: String,
    user_id: String,
    state: String,
    created_at: DateTime<Utc>,
}

impl SessionRow {
    fn try_into_session(self) -> std::result::Result<Session, sqlx::Error> {
        Ok(Session {
            id: decode_id("session", &self.id)?,
            channel_id: ChannelId::new(self.channel_id),
            user_id: decode_id("user", &self.user_id)?,
            state: SessionState::from_str_value(&self.state),
            created_at: self.created_at,
        })
    }
}

/// Row type for message queries.
#[derive(FromRow)]
struct MessageRow {
    id: String,
    session_id: String,
    role: String,
    parts: serde_json::Value,
    author_id: String,
    parent_id: Option<String>,
    created_at: DateTime<Utc>,
}

impl MessageRow {
    fn try_into_message(self) -> std::result::Result<Message, sqlx::Error> {
        let role = MessageRole::from_str_value(&self.role).ok_or_else(|| {
            sqlx::Error::Decode(Box::new(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("invalid message role '{}'", self.role),
            )))
        })?;
        let parts: Vec<Part> =
            serde_json::from_value(self.parts).map_err(|e| sqlx::Error::Decode(Box::new(e)))?;

        Ok(Message {
            id: decode_id("message", &self.id)?,
            session_id: decode_id("session", &self.session_id)?,
            role,
            parts,
            author_id: decode_id("user", &self.author_id)?,
            parent_id: self
                .parent_id
                .as_deref()
                .map(|id| decode_id("message", id))
                .transpose()?,
            created_at: self.created_at,
        })
    }
}

/// Row type for author profile queries.
#[derive(FromRow)]
struct AuthorRow {
    id: String,
    display_name: String,
    household_id: Option<String>,
    household_name: Option<String>,
}

impl AuthorRow {
    fn try_into_profile(self) -> std::result::Result<AuthorProfile, sqlx::Error> {
        let household = match (self.household_id, self.household_name) {
            (Some(id), Some(name)) => Some(HouseholdProfile {
                id: decode_id("household", &id)?,
                name,
            }),
            _ => None,
        };
        Ok(AuthorProfile {
            user_id: decode_id("user", &self.id)?,
            name: self.display_name,
            household,
        })
    }
}

fn persistence(e: sqlx::Error) -> Report<SessionStoreError> {
    SessionStoreError::persistence(e).into()
}

fn parts_json(parts: &[Part]) -> Result<serde_json::Value, SessionStoreError> {
    serde_json::to_value(parts).map_err(|e| {
        SessionStoreError::InvalidInput {
            reason: format!("message parts are not serializable: {e}"),
        }
        .into()
    })
}

/// Session storage backed by `conversation_sessions` and
/// `conversation_messages`.
///
/// Session creation runs in a transaction holding a per-channel advisory
/// lock, and the partial unique index on active sessions backs it up, so
/// concurrent first messages on a channel resolve to one session.
pub struct PgSessionRepository {
    pool: PgPool,
}

impl PgSessionRepository {
    /// Creates a new repository.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn lock_channel(
        tx: &mut PgTransaction<'_, Postgres>,
        channel_id: &ChannelId,
    ) -> std::result::Result<(), sqlx::Error> {
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(channel_id.as_str())
            .execute(&mut **tx)
            .await?;
        Ok(())
    }

    async fn insert_session(
        tx: &mut PgTransaction<'_, Postgres>,
        session: &Session,
    ) -> std::result::Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO conversation_sessions (id, channel_id, user_id, state, created_at)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(session.id.to_string())
        .bind(session.channel_id.as_str())
        .bind(session.user_id.to_string())
        .bind(session.state.as_str())
        .bind(session.created_at)
        .execute(&mut **tx)
        .await?;
        Ok(())
    }
}

#[async_trait]
impl SessionRepository for PgSessionRepository {
    #[instrument(skip(self), fields(channel_id = %channel_id))]
    async fn get_or_create_active(
        &self,
        channel_id: &ChannelId,
        user_id: UserId,
    ) -> Result<Session, SessionStoreError> {
        let mut tx = self.pool.begin().await.map_err(persistence)?;
        Self::lock_channel(&mut tx, channel_id)
            .await
            .map_err(persistence)?;

        let existing: Option<SessionRow> = sqlx::query_as(
            r#"
            SELECT id, channel_id, user_id, state, created_at
            FROM conversation_sessions
            WHERE channel_id = $1 AND state = 'active'
            "#,
        )
        .bind(channel_id.as_str())
        .fetch_optional(&mut *tx)
        .await
        .map_err(persistence)?;

        let session = match existing {
            Some(row) => row.try_into_session().map_err(persistence)?,
            None => {
                let session = Session::new(channel_id.clone(), user_id);
                Self::insert_session(&mut tx, &session)
                    .await
                    .map_err(persistence)?;
                debug!(session_id = %session.id, "created session");
                session
            }
        };

        tx.commit().await.map_err(persistence)?;
        Ok(session)
    }

    #[instrument(skip(self), fields(channel_id = %channel_id))]
    async fn start_new(
        &self,
        channel_id: &ChannelId,
        user_id: UserId,
    ) -> Result<Session, SessionStoreError> {
        let mut tx = self.pool.begin().await.map_err(persistence)?;
        Self::lock_channel(&mut tx, channel_id)
            .await
            .map_err(persistence)?;

        let superseded = sqlx::query(
            r#"
            UPDATE conversation_sessions
            SET state = $2
            WHERE channel_id = $1 AND state = 'active'
            "#,
        )
        .bind(channel_id.as_str())
        .bind(SessionState::Superseded.as_str())
        .execute(&mut *tx)
        .await
        .map_err(persistence)?;

        let session = Session::new(channel_id.clone(), user_id);
        Self::insert_session(&mut tx, &session)
            .await
            .map_err(persistence)?;
        tx.commit().await.map_err(persistence)?;

        debug!(
            session_id = %session.id,
            superseded = superseded.rows_affected(),
            "started session"
        );
        Ok(session)
    }

    #[instrument(skip(self, message), fields(message_id = %message.id))]
    async fn insert_message(&self, message: &Message) -> Result<(), SessionStoreError> {
        let parts = parts_json(&message.parts)?;
        let result = sqlx::query(
            r#"
            INSERT INTO conversation_messages
                (id, session_id, role, parts, author_id, parent_id, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(message.id.to_string())
        .bind(message.session_id.to_string())
        .bind(message.role.as_str())
        .bind(&parts)
        .bind(message.author_id.to_string())
        .bind(message.parent_id.map(|id| id.to_string()))
        .bind(message.created_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(()),
            Err(sqlx::Error::Database(db)) if db.is_foreign_key_violation() => {
                Err(SessionStoreError::NotFound {
                    what: format!("session {}", message.session_id),
                }
                .into())
            }
            Err(e) => Err(persistence(e)),
        }
    }

    async fn list_messages(
        &self,
        session_id: ConversationSessionId,
    ) -> Result<Vec<Message>, SessionStoreError> {
        let rows: Vec<MessageRow> = sqlx::query_as(
            r#"
            SELECT id, session_id, role, parts, author_id, parent_id, created_at
            FROM conversation_messages
            WHERE session_id = $1
            ORDER BY seq
            "#,
        )
        .bind(session_id.to_string())
        .fetch_all(&self.pool)
        .await
        .map_err(persistence)?;

        rows.into_iter()
            .map(|r| r.try_into_message().map_err(persistence))
            .collect()
    }

    async fn swap_parts(
        &self,
        id: MessageId,
        expected: &[Part],
        replacement: &[Part],
    ) -> Result<bool, SessionStoreError> {
        let expected = parts_json(expected)?;
        let replacement = parts_json(replacement)?;
        let result = sqlx::query(
            r#"
            UPDATE conversation_messages
            SET parts = $3
            WHERE id = $1 AND parts = $2
            "#,
        )
        .bind(id.to_string())
        .bind(&expected)
        .bind(&replacement)
        .execute(&self.pool)
        .await
        .map_err(persistence)?;

        Ok(result.rows_affected() == 1)
    }

    async fn author_profile(
        &self,
        user_id: UserId,
    ) -> Result<Option<AuthorProfile>, SessionStoreError> {
        let row: Option<AuthorRow> = sqlx::query_as(
            r#"
            SELECT u.id, u.display_name, h.id AS household_id, h.name AS household_name
            FROM users u
            LEFT JOIN households h ON h.id = u.household_id
            WHERE u.id = $1
            "#,
        )
        .bind(user_id.to_string())
        .fetch_optional(&self.pool)
        .await
        .map_err(persistence)?;

        row.map(|r| r.try_into_profile().map_err(persistence))
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tally_core::HouseholdId;

    #[test]
    fn message_row_decodes_parts() {
        let session_id = ConversationSessionId::new();
        let author = UserId::new();
        let row = MessageRow {
            id: MessageId::new().to_string(),
            session_id: session_id.to_string(),
            role: "user".to_string(),
            parts: json!([{ "kind": "text", "text": "hello" }]),
            author_id: author.to_string(),
            parent_id: None,
            created_at: Utc::now(),
        };

        let message = row.try_into_message().unwrap();
        assert_eq!(message.session_id, session_id);
        assert_eq!(message.role, MessageRole::User);
        assert_eq!(message.text(), "hello");
    }

    #[test]
    fn unknown_role_is_a_decode_error() {
        let row = MessageRow {
            id: MessageId::new().to_string(),
            session_id: ConversationSessionId::new().to_string(),
            role: "system".to_string(),
            parts: json!([]),
            author_id: UserId::new().to_string(),
            parent_id: None,
            created_at: Utc::now(),
        };
        assert!(matches!(
            row.try_into_message(),
            Err(sqlx::Error::Decode(_))
        ));
    }

    #[test]
    fn author_without_household() {
        let user = UserId::new();
        let profile = AuthorRow {
            id: user.to_string(),
            display_name: "Ana".to_string(),
            household_id: None,
            household_name: None,
        }
        .try_into_profile()
        .unwrap();
        assert_eq!(profile.user_id, user);
        assert!(profile.household.is_none());
    }

    #[test]
    fn author_with_household() {
        let household = HouseholdId::new();
        let profile = AuthorRow {
            id: UserId::new().to_string(),
            display_name: "Ana".to_string(),
            household_id: Some(household.to_string()),
            household_name: Some("Home".to_string()),
        }
        .try_into_profile()
        .unwrap();
        assert_eq!(profile.household.map(|h| h.id), Some(household));
    }

    #[test]
    fn session_row_round_trips_state() {
        let row = SessionRow {
            id: ConversationSessionId::new().to_string(),
            channel_id: "general".to_string(),
            user_id: UserId::new().to_string(),
            state: "superseded".to_string(),
            created_at: Utc::now(),
        };
        let session = row.try_into_session().unwrap();
        assert_eq!(session.state, SessionState::Superseded);
        assert_eq!(session.channel_id.as_str(), "general");
    }
}
