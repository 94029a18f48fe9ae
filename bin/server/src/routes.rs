//! HTTP routes standing in for a chat-platform connector.
//!
//! - `POST /channels/{channel}/messages`: runs the agent on an inbound
//!   message. `?mode=messages` (default) answers with one JSON document,
//!   `?mode=chunks` streams newline-delimited JSON updates.
//! - `POST /channels/{channel}/sessions`: starts a fresh session.
//! - `PUT /users/{user_id}`: registers a user and their household.
//! - `GET /usage`: token usage since start-up.

use crate::db::{HouseholdRecord, UserRecord, UserRepository};
use crate::error::ApiError;
use axum::{
    Json, Router,
    body::Body,
    extract::{Path, Query, State},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post, put},
};
use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::sync::Arc;
use tally_ai::{
    AgentError, AgentUpdate, Attachment, ChatAgent, DeliveryMode, InboundMessage, TokenUsage,
};
use tally_core::{ChannelId, ConversationSessionId, HouseholdId, UserId};
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::info;

/// Shared application state.
pub struct AppState {
    /// The orchestration loop.
    pub agent: ChatAgent,
    /// User and household registration.
    pub users: UserRepository,
}

impl AppState {
    /// Creates a new application state.
    pub fn new(agent: ChatAgent, users: UserRepository) -> Self {
        Self { agent, users }
    }
}

/// Builds the application router.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/channels/{channel}/messages", post(post_message))
        .route("/channels/{channel}/sessions", post(start_session))
        .route("/users/{user_id}", put(put_user))
        .route("/usage", get(usage))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Query parameters for the message route.
#[derive(Debug, Default, Deserialize)]
pub struct MessageQuery {
    #[serde(default)]
    mode: DeliveryMode,
}

/// Body of an inbound message.
#[derive(Debug, Deserialize)]
pub struct MessageBody {
    author_id: UserId,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    attachments: Vec<Attachment>,
}

/// An agent update as written on the wire.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UpdateBody {
    Text {
        text: String,
    },
    ToolCall {
        name: String,
        input: JsonValue,
        #[serde(skip_serializing_if = "Option::is_none")]
        text: Option<String>,
    },
    ToolResponse {
        name: String,
        output: JsonValue,
    },
    Error {
        /// Text suitable for showing to the end user.
        message: String,
        details: String,
    },
}

impl From<AgentUpdate> for UpdateBody {
    fn from(update: AgentUpdate) -> Self {
        match update {
            AgentUpdate::Text(text) => Self::Text { text },
            AgentUpdate::ToolCall { name, input, text } => Self::ToolCall { name, input, text },
            AgentUpdate::ToolResponse { name, output } => Self::ToolResponse { name, output },
            AgentUpdate::Error(e) => Self::error(&e),
        }
    }
}

impl UpdateBody {
    fn error(e: &AgentError) -> Self {
        Self::Error {
            message: e.user_message().to_string(),
            details: e.to_string(),
        }
    }
}

/// Aggregated answer for `mode=messages`.
#[derive(Debug, Serialize)]
pub struct MessageResponse {
    /// Text replies in delivery order.
    pub replies: Vec<String>,
    pub updates: Vec<UpdateBody>,
}

fn ndjson_line(update: AgentUpdate) -> Result<String, serde_json::Error> {
    let mut line = serde_json::to_string(&UpdateBody::from(update))?;
    line.push('\n');
    Ok(line)
}

async fn post_message(
    State(state): State<Arc<AppState>>,
    Path(channel): Path<String>,
    Query(query): Query<MessageQuery>,
    Json(body): Json<MessageBody>,
) -> Result<Response, ApiError> {
    let inbound = InboundMessage {
        channel_id: ChannelId::new(channel),
        author_id: body.author_id,
        text: body.text,
        attachments: body.attachments,
    };

    // Dropping the guard (client gone, response finished) cancels the run.
    let cancel = CancellationToken::new();
    let guard = cancel.clone().drop_guard();
    let rx = state.agent.run(inbound, query.mode, cancel)?;

    match query.mode {
        DeliveryMode::Chunks => {
            let stream = UnboundedReceiverStream::new(rx).map(move |update| {
                let _guard = &guard;
                ndjson_line(update)
            });
            let response = (
                [(header::CONTENT_TYPE, "application/x-ndjson")],
                Body::from_stream(stream),
            )
                .into_response();
            Ok(response)
        }
        DeliveryMode::Messages => {
            let updates: Vec<AgentUpdate> = UnboundedReceiverStream::new(rx).collect().await;
            drop(guard);

            let replies = updates
                .iter()
                .filter_map(|u| match u {
                    AgentUpdate::Text(text) => Some(text.clone()),
                    AgentUpdate::ToolCall {
                        text: Some(text), ..
                    } => Some(text.clone()),
                    _ => None,
                })
                .collect();
            let updates = updates.into_iter().map(UpdateBody::from).collect();
            Ok(Json(MessageResponse { replies, updates }).into_response())
        }
    }
}

/// Body of the new-session route.
#[derive(Debug, Deserialize)]
pub struct StartSessionBody {
    user_id: UserId,
}

/// A freshly started session.
#[derive(Debug, Serialize)]
pub struct SessionResponse {
    pub session_id: ConversationSessionId,
    pub channel_id: ChannelId,
    pub created_at: DateTime<Utc>,
}

async fn start_session(
    State(state): State<Arc<AppState>>,
    Path(channel): Path<String>,
    Json(body): Json<StartSessionBody>,
) -> Result<impl IntoResponse, ApiError> {
    let session = state
        .agent
        .sessions()
        .start_new_session(&ChannelId::new(channel), body.user_id)
        .await
        .map_err(ApiError::database)?;

    info!(session_id = %session.id, channel_id = %session.channel_id, "new session requested");
    Ok((
        StatusCode::CREATED,
        Json(SessionResponse {
            session_id: session.id,
            channel_id: session.channel_id,
            created_at: session.created_at,
        }),
    ))
}

/// Household part of a user registration.
#[derive(Debug, Deserialize)]
pub struct HouseholdBody {
    #[serde(default)]
    id: Option<HouseholdId>,
    name: String,
}

/// Body of the user registration route.
#[derive(Debug, Deserialize)]
pub struct UserBody {
    name: String,
    #[serde(default)]
    household: Option<HouseholdBody>,
}

async fn put_user(
    State(state): State<Arc<AppState>>,
    Path(user_id): Path<UserId>,
    Json(body): Json<UserBody>,
) -> Result<impl IntoResponse, ApiError> {
    if body.name.trim().is_empty() {
        return Err(ApiError::Validation {
            reason: "name must not be empty".to_string(),
        });
    }

    let user = UserRecord {
        id: user_id,
        display_name: body.name.trim().to_string(),
        household: body.household.map(|h| HouseholdRecord {
            id: h.id.unwrap_or_else(HouseholdId::new),
            name: h.name,
        }),
        created_at: Utc::now(),
    };
    state.users.upsert(&user).await.map_err(ApiError::database)?;

    Ok(Json(user))
}

async fn usage(State(state): State<Arc<AppState>>) -> Json<TokenUsage> {
    Json(state.agent.usage().snapshot())
}
