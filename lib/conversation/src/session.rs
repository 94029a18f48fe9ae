//! Conversation sessions and their storage.
//!
//! A channel has at most one active session. Sessions are never deleted;
//! starting a new one supersedes the previous active session.

use crate::error::SessionStoreError;
use crate::message::{Message, Part};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use tally_core::{ChannelId, ConversationSessionId, HouseholdId, MessageId, Result, UserId};

/// The state of a conversation session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Session receives new messages for its channel.
    Active,
    /// A newer session took over the channel.
    Superseded,
}

impl SessionState {
    /// Returns the stored name of the state.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Superseded => "superseded",
        }
    }

    /// Parses a stored state name, defaulting to superseded.
    #[must_use]
    pub fn from_str_value(s: &str) -> Self {
        match s {
            "active" => Self::Active,
            _ => Self::Superseded,
        }
    }
}

/// A conversation session bound to a channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    /// Unique session identifier.
    pub id: ConversationSessionId,
    /// The chat channel the session belongs to.
    pub channel_id: ChannelId,
    /// The user whose message created the session.
    pub user_id: UserId,
    pub state: SessionState,
    /// When the session was created.
    pub created_at: DateTime<Utc>,
}

impl Session {
    /// Creates a new active session.
    #[must_use]
    pub fn new(channel_id: ChannelId, user_id: UserId) -> Self {
        Self {
            id: ConversationSessionId::new(),
            channel_id,
            user_id,
            state: SessionState::Active,
            created_at: Utc::now(),
        }
    }

    /// Returns true if the session is the active one for its channel.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.state == SessionState::Active
    }
}

/// The household a user belongs to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HouseholdProfile {
    pub id: HouseholdId,
    pub name: String,
}

/// Who a user is, as shown to the model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorProfile {
    pub user_id: UserId,
    /// Display name.
    pub name: String,
    pub household: Option<HouseholdProfile>,
}

/// Trait for session and message storage.
#[async_trait]
pub trait SessionRepository: Send + Sync {
    /// Returns the active session for a channel, creating it if none exists.
    ///
    /// The lookup and the creation must be atomic: concurrent callers for the
    /// same channel all receive the same session.
    async fn get_or_create_active(
        &self,
        channel_id: &ChannelId,
        user_id: UserId,
    ) -> Result<Session, SessionStoreError>;

    /// Supersedes the channel's active session, if any, and creates a new one.
    async fn start_new(
        &self,
        channel_id: &ChannelId,
        user_id: UserId,
    ) -> Result<Session, SessionStoreError>;

    /// Appends a message to its session.
    async fn insert_message(&self, message: &Message) -> Result<(), SessionStoreError>;

    /// Lists a session's messages in insertion order.
    async fn list_messages(
        &self,
        session_id: ConversationSessionId,
    ) -> Result<Vec<Message>, SessionStoreError>;

    /// Replaces a message's parts if they still equal `expected`.
    ///
    /// Returns false when the stored parts changed in the meantime.
    async fn swap_parts(
        &self,
        id: MessageId,
        expected: &[Part],
        replacement: &[Part],
    ) -> Result<bool, SessionStoreError>;

    /// Loads the profile of a user.
    async fn author_profile(
        &self,
        user_id: UserId,
    ) -> Result<Option<AuthorProfile>, SessionStoreError>;
}

#[derive(Default)]
struct MemoryState {
    sessions: HashMap<ConversationSessionId, Session>,
    active: HashMap<ChannelId, ConversationSessionId>,
    messages: Vec<Message>,
    authors: HashMap<UserId, AuthorProfile>,
}

/// In-memory session storage.
#[derive(Default)]
pub struct MemorySessionRepository {
    state: Mutex<MemoryState>,
}

impl MemorySessionRepository {
    /// Creates an empty repository.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the profile returned for a user.
    pub fn register_author(&self, profile: AuthorProfile) -> Result<(), SessionStoreError> {
        self.lock()?.authors.insert(profile.user_id, profile);
        Ok(())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, MemoryState>, SessionStoreError> {
        self.state.lock().map_err(|e| {
            SessionStoreError::persistence(format!("session state poisoned: {e}")).into()
        })
    }
}

impl MemoryState {
    fn create_active(&mut self, channel_id: &ChannelId, user_id: UserId) -> Session {
        let session = Session::new(channel_id.clone(), user_id);
        self.active.insert(channel_id.clone(), session.id);
        self.sessions.insert(session.id, session.clone());
        session
    }
}

#[async_trait]
impl SessionRepository for MemorySessionRepository {
    async fn get_or_create_active(
        &self,
        channel_id: &ChannelId,
        user_id: UserId,
    ) -> Result<Session, SessionStoreError> {
        let mut state = self.lock()?;
        if let Some(session) = state
            .active
            .get(channel_id)
            .and_then(|id| state.sessions.get(id))
            .filter(|session| session.is_active())
        {
            return Ok(session.clone());
        }
        Ok(state.create_active(channel_id, user_id))
    }

    async fn start_new(
        &self,
        channel_id: &ChannelId,
        user_id: UserId,
    ) -> Result<Session, SessionStoreError> {
        let mut state = self.lock()?;
        if let Some(previous) = state.active.remove(channel_id)
            && let Some(session) = state.sessions.get_mut(&previous)
        {
            session.state = SessionState::Superseded;
        }
        Ok(state.create_active(channel_id, user_id))
    }

    async fn insert_message(&self, message: &Message) -> Result<(), SessionStoreError> {
        let mut state = self.lock()?;
        if !state.sessions.contains_key(&message.session_id) {
            return Err(SessionStoreError::NotFound {
                what: format!("session {}", message.session_id),
            }
            .into());
        }
        state.messages.push(message.clone());
        Ok(())
    }

    async fn list_messages(
        &self,
        session_id: ConversationSessionId,
    ) -> Result<Vec<Message>, SessionStoreError> {
        let state = self.lock()?;
        Ok(state
            .messages
            .iter()
            .filter(|m| m.session_id == session_id)
            .cloned()
            .collect())
    }

    async fn swap_parts(
        &self,
        id: MessageId,
        expected: &[Part],
        replacement: &[Part],
    ) -> Result<bool, SessionStoreError> {
        let mut state = self.lock()?;
        match state.messages.iter_mut().find(|m| m.id == id) {
            Some(message) if message.parts == expected => {
                message.parts = replacement.to_vec();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn author_profile(
        &self,
        user_id: UserId,
    ) -> Result<Option<AuthorProfile>, SessionStoreError> {
        Ok(self.lock()?.authors.get(&user_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::MessageRole;

    #[tokio::test]
    async fn get_or_create_reuses_active_session() {
        let repo = MemorySessionRepository::new();
        let channel = ChannelId::from("general");
        let user = UserId::new();

        let first = repo.get_or_create_active(&channel, user).await.unwrap();
        let second = repo
            .get_or_create_active(&channel, UserId::new())
            .await
            .unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(second.user_id, user);
        assert!(first.is_active());
    }

    #[tokio::test]
    async fn start_new_supersedes_previous() {
        let repo = MemorySessionRepository::new();
        let channel = ChannelId::from("general");
        let user = UserId::new();

        let old = repo.get_or_create_active(&channel, user).await.unwrap();
        let new = repo.start_new(&channel, user).await.unwrap();
        let current = repo.get_or_create_active(&channel, user).await.unwrap();

        assert_ne!(old.id, new.id);
        assert_eq!(current.id, new.id);
    }

    #[tokio::test]
    async fn swap_parts_is_compare_and_swap() {
        let repo = MemorySessionRepository::new();
        let session = repo
            .get_or_create_active(&ChannelId::from("c"), UserId::new())
            .await
            .unwrap();
        let original = vec![Part::media("image/png", "https://x/y.png")];
        let message = Message {
            id: MessageId::new(),
            session_id: session.id,
            role: MessageRole::User,
            parts: original.clone(),
            author_id: session.user_id,
            parent_id: None,
            created_at: Utc::now(),
        };
        repo.insert_message(&message).await.unwrap();

        let archived = vec![Part::media("image/png", "file:///blobs/y.png")];
        assert!(repo.swap_parts(message.id, &original, &archived).await.unwrap());
        assert!(!repo.swap_parts(message.id, &original, &archived).await.unwrap());

        let stored = repo.list_messages(session.id).await.unwrap();
        assert_eq!(stored[0].parts, archived);
    }

    #[tokio::test]
    async fn insert_into_unknown_session_fails() {
        let repo = MemorySessionRepository::new();
        let message = Message {
            id: MessageId::new(),
            session_id: ConversationSessionId::new(),
            role: MessageRole::User,
            parts: vec![Part::text("hi")],
            author_id: UserId::new(),
            parent_id: None,
            created_at: Utc::now(),
        };

        assert!(repo.insert_message(&message).await.is_err());
    }
}
