//! The session store.
//!
//! Wraps a `SessionRepository` with the operations the chat agent uses:
//! resolving the channel's session, persisting turns, archiving media in the
//! background and rebuilding provider-facing history.

use crate::error::SessionStoreError;
use crate::history::{HistoryMessage, to_history};
use crate::media::MediaArchiver;
use crate::message::{Message, MessageRole, NewMessage};
use crate::session::{AuthorProfile, Session, SessionRepository};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use tally_core::{ChannelId, MessageId, Result, UserId};
use tokio_util::task::TaskTracker;
use tracing::{debug, info, instrument};

/// Conversation persistence for the chat agent.
pub struct SessionStore {
    repository: Arc<dyn SessionRepository>,
    archiver: Option<Arc<MediaArchiver>>,
    background: TaskTracker,
}

impl SessionStore {
    /// Creates a store without media archiving.
    pub fn new(repository: Arc<dyn SessionRepository>) -> Self {
        Self {
            repository,
            archiver: None,
            background: TaskTracker::new(),
        }
    }

    /// Enables background archiving of remote media.
    #[must_use]
    pub fn with_media_archiver(mut self, archiver: MediaArchiver) -> Self {
        self.archiver = Some(Arc::new(archiver));
        self
    }

    /// Returns the active session for a channel, creating one if needed.
    ///
    /// # Errors
    ///
    /// Returns `SessionStoreError::Persistence` if storage fails.
    #[instrument(skip(self), fields(channel_id = %channel_id))]
    pub async fn get_or_create_active_session(
        &self,
        channel_id: &ChannelId,
        user_id: UserId,
    ) -> Result<Session, SessionStoreError> {
        let session = self
            .repository
            .get_or_create_active(channel_id, user_id)
            .await?;
        debug!(session_id = %session.id, "resolved active session");
        Ok(session)
    }

    /// Starts a fresh session for a channel, superseding the active one.
    ///
    /// # Errors
    ///
    /// Returns `SessionStoreError::Persistence` if storage fails.
    #[instrument(skip(self), fields(channel_id = %channel_id))]
    pub async fn start_new_session(
        &self,
        channel_id: &ChannelId,
        user_id: UserId,
    ) -> Result<Session, SessionStoreError> {
        let session = self.repository.start_new(channel_id, user_id).await?;
        info!(session_id = %session.id, "started new session");
        Ok(session)
    }

    /// Persists a message and returns its id.
    ///
    /// The write is synchronous. Remote media parts are archived afterwards
    /// by a background task that never affects the result of this call.
    ///
    /// # Errors
    ///
    /// Returns `SessionStoreError::InvalidInput` for a message without
    /// parts and `SessionStoreError::Persistence` if storage fails.
    #[instrument(skip(self, session, message), fields(session_id = %session.id, role = message.role.as_str()))]
    pub async fn store_message(
        &self,
        session: &Session,
        message: NewMessage,
        author_id: UserId,
        parent_id: Option<MessageId>,
    ) -> Result<MessageId, SessionStoreError> {
        if message.parts.is_empty() {
            return Err(SessionStoreError::InvalidInput {
                reason: "message has no content".to_string(),
            }
            .into());
        }

        let stored = Message {
            id: MessageId::new(),
            session_id: session.id,
            role: message.role,
            parts: message.parts,
            author_id,
            parent_id,
            created_at: Utc::now(),
        };
        self.repository.insert_message(&stored).await?;
        let id = stored.id;

        if let Some(archiver) = &self.archiver
            && archiver.needs_archiving(&stored)
        {
            let archiver = Arc::clone(archiver);
            let repository = Arc::clone(&self.repository);
            self.background.spawn(async move {
                archiver.archive(repository.as_ref(), &stored).await;
            });
        }

        Ok(id)
    }

    /// Lists the stored messages of a session.
    ///
    /// # Errors
    ///
    /// Returns `SessionStoreError::Persistence` if storage fails.
    pub async fn messages(&self, session: &Session) -> Result<Vec<Message>, SessionStoreError> {
        self.repository.list_messages(session.id).await
    }

    /// Rebuilds the provider-facing history of a session.
    ///
    /// Calling this twice without intervening writes yields identical
    /// output.
    ///
    /// # Errors
    ///
    /// Returns `SessionStoreError::NotFound` if a user message's author has
    /// no profile, and `SessionStoreError::Persistence` if storage fails.
    #[instrument(skip(self, session), fields(session_id = %session.id))]
    pub async fn get_message_history(
        &self,
        session: &Session,
    ) -> Result<Vec<HistoryMessage>, SessionStoreError> {
        let messages = self.repository.list_messages(session.id).await?;

        let mut authors: HashMap<UserId, AuthorProfile> = HashMap::new();
        for message in messages.iter().filter(|m| m.role == MessageRole::User) {
            if authors.contains_key(&message.author_id) {
                continue;
            }
            let profile = self
                .repository
                .author_profile(message.author_id)
                .await?
                .ok_or_else(|| SessionStoreError::NotFound {
                    what: format!("author profile {}", message.author_id),
                })?;
            authors.insert(message.author_id, profile);
        }

        Ok(messages
            .iter()
            .map(|m| to_history(m, authors.get(&m.author_id)))
            .collect())
    }

    /// Waits for every background task spawned so far.
    pub async fn drain_background(&self) {
        self.background.close();
        self.background.wait().await;
        self.background.reopen();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::MediaError;
    use crate::media::{BlobStore, FetchedMedia, MediaConfig, MediaFetcher};
    use crate::message::Part;
    use crate::session::{HouseholdProfile, MemorySessionRepository};
    use async_trait::async_trait;
    use std::collections::HashSet;
    use tally_core::HouseholdId;

    struct OneImage;

    #[async_trait]
    impl MediaFetcher for OneImage {
        async fn fetch(&self, _url: &str) -> std::result::Result<FetchedMedia, MediaError> {
            Ok(FetchedMedia {
                bytes: vec![1, 2, 3],
                content_type: Some("image/png".to_string()),
            })
        }
    }

    struct MemoryBlobs;

    #[async_trait]
    impl BlobStore for MemoryBlobs {
        async fn put(
            &self,
            object_name: &str,
            _bytes: &[u8],
        ) -> std::result::Result<String, MediaError> {
            Ok(format!("mem://{object_name}"))
        }

        fn is_durable(&self, uri: &str) -> bool {
            uri.starts_with("mem://")
        }
    }

    fn setup() -> (Arc<MemorySessionRepository>, AuthorProfile) {
        let repo = Arc::new(MemorySessionRepository::new());
        let author = AuthorProfile {
            user_id: UserId::new(),
            name: "Luis".to_string(),
            household: Some(HouseholdProfile {
                id: HouseholdId::new(),
                name: "Depa".to_string(),
            }),
        };
        repo.register_author(author.clone()).unwrap();
        (repo, author)
    }

    #[tokio::test]
    async fn concurrent_first_messages_share_one_session() {
        let (repo, author) = setup();
        let store = Arc::new(SessionStore::new(repo));
        let channel = ChannelId::from("family-chat");
        let user_id = author.user_id;

        let handles: Vec<_> = (0..10)
            .map(|_| {
                let store = Arc::clone(&store);
                let channel = channel.clone();
                tokio::spawn(async move {
                    store
                        .get_or_create_active_session(&channel, user_id)
                        .await
                        .unwrap()
                        .id
                })
            })
            .collect();

        let mut ids = HashSet::new();
        for handle in handles {
            ids.insert(handle.await.unwrap());
        }
        assert_eq!(ids.len(), 1);
    }

    #[tokio::test]
    async fn history_round_trip() {
        let (repo, author) = setup();
        let store = SessionStore::new(repo);
        let session = store
            .get_or_create_active_session(&ChannelId::from("c1"), author.user_id)
            .await
            .unwrap();

        store
            .store_message(
                &session,
                NewMessage::user(vec![Part::text("hello")]),
                author.user_id,
                None,
            )
            .await
            .unwrap();
        store
            .store_message(
                &session,
                NewMessage::model(vec![Part::text("hi")]),
                author.user_id,
                None,
            )
            .await
            .unwrap();

        let history = store.get_message_history(&session).await.unwrap();

        assert_eq!(history.len(), 2);
        assert_eq!(history[0].role, MessageRole::User);
        let preamble = history[0].parts[0].as_text().unwrap();
        assert!(preamble.contains(&author.user_id.to_string()));
        assert!(preamble.contains("hello"));
        assert_eq!(history[1].role, MessageRole::Model);
        assert_eq!(history[1].parts, vec![Part::text("hi")]);

        let again = store.get_message_history(&session).await.unwrap();
        assert_eq!(
            serde_json::to_vec(&history).unwrap(),
            serde_json::to_vec(&again).unwrap()
        );
    }

    #[tokio::test]
    async fn history_requires_author_profile() {
        let (repo, _) = setup();
        let store = SessionStore::new(repo);
        let stranger = UserId::new();
        let session = store
            .get_or_create_active_session(&ChannelId::from("c2"), stranger)
            .await
            .unwrap();
        store
            .store_message(
                &session,
                NewMessage::user(vec![Part::text("who am i")]),
                stranger,
                None,
            )
            .await
            .unwrap();

        let err = store.get_message_history(&session).await.unwrap_err();
        assert!(err.to_string().contains("author profile"));
    }

    #[tokio::test]
    async fn empty_message_is_rejected() {
        let (repo, author) = setup();
        let store = SessionStore::new(repo);
        let session = store
            .get_or_create_active_session(&ChannelId::from("c3"), author.user_id)
            .await
            .unwrap();

        let result = store
            .store_message(&session, NewMessage::user(Vec::new()), author.user_id, None)
            .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn store_message_archives_media_in_background() {
        let (repo, author) = setup();
        let store = SessionStore::new(repo).with_media_archiver(MediaArchiver::new(
            Arc::new(OneImage),
            Arc::new(MemoryBlobs),
            MediaConfig {
                environment: "prod".to_string(),
            },
        ));
        let session = store
            .get_or_create_active_session(&ChannelId::from("c4"), author.user_id)
            .await
            .unwrap();

        let id = store
            .store_message(
                &session,
                NewMessage::user(vec![Part::media("image/png", "https://cdn/x.png")]),
                author.user_id,
                None,
            )
            .await
            .unwrap();
        store.drain_background().await;

        let messages = store.messages(&session).await.unwrap();
        assert_eq!(messages[0].id, id);
        let Part::Media { url, .. } = &messages[0].parts[0] else {
            panic!("expected media part");
        };
        assert!(url.starts_with(&format!("mem://prod/{}/{}-", session.id, author.user_id)));
        assert!(url.ends_with("-0.png"));
    }

    #[tokio::test]
    async fn new_session_command_supersedes() {
        let (repo, author) = setup();
        let store = SessionStore::new(repo);
        let channel = ChannelId::from("c5");

        let first = store
            .get_or_create_active_session(&channel, author.user_id)
            .await
            .unwrap();
        let fresh = store
            .start_new_session(&channel, author.user_id)
            .await
            .unwrap();

        assert_ne!(first.id, fresh.id);
        assert!(store.messages(&fresh).await.unwrap().is_empty());
    }
}
