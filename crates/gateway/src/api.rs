//! v1 HTTP API: streaming chat, tool listing, conversation lookup.

use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::sse::{Event as SseEvent, Sse},
    routing::{get, post},
};
use chrono::{DateTime, Utc};
use futures::{Stream, StreamExt};
use loopwire_agent::{AgentLoop, LoopRequest};
use loopwire_core::message::{ConversationId, ConversationTurn};
use serde::{Deserialize, Serialize};
use tokio::sync::{RwLock, mpsc};
use tracing::{debug, info};

use crate::emitter;

/// Conversations kept in memory before the least recently used is evicted.
const MAX_CONVERSATIONS: usize = 1000;

/// Buffered events between the loop task and the SSE writer.
const EVENT_BUFFER: usize = 64;

/// Shared state for the v1 API.
pub struct ApiState {
    pub agent: Arc<AgentLoop>,
    pub conversations: RwLock<HashMap<String, StoredConversation>>,
    pub heartbeat_interval: Duration,
    pub request_timeout: Duration,
    pub start_time: DateTime<Utc>,
}

pub type SharedApiState = Arc<ApiState>;

impl ApiState {
    pub fn new(agent: Arc<AgentLoop>, config: &loopwire_config::GatewayConfig) -> Self {
        Self {
            agent,
            conversations: RwLock::new(HashMap::new()),
            heartbeat_interval: config.heartbeat_interval(),
            request_timeout: config.request_timeout(),
            start_time: Utc::now(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct StoredConversation {
    pub turns: Vec<ConversationTurn>,
    pub updated_at: DateTime<Utc>,
}

/// Build the v1 router (mounted under `/v1`).
pub fn v1_router(state: SharedApiState) -> Router {
    Router::new()
        .route("/chat/stream", post(chat_stream_handler))
        .route("/tools", get(list_tools_handler))
        .route("/conversations/{id}", get(get_conversation_handler))
        .with_state(state)
}

// ── DTOs ──────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRequest {
    #[serde(default)]
    pub conversation_id: Option<String>,
    pub message: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ToolDto {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ToolListResponse {
    pub tools: Vec<ToolDto>,
    pub count: usize,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationResponse {
    pub id: String,
    pub turns: Vec<ConversationTurn>,
    pub updated_at: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn bad_request(message: impl Into<String>) -> ApiError {
    (
        StatusCode::BAD_REQUEST,
        Json(ErrorResponse {
            error: message.into(),
        }),
    )
}

// ── Handlers ──────────────────────────────────────────────────────────────

/// `POST /v1/chat/stream`: run the agent loop and relay its events as SSE.
///
/// The loop runs in its own task; the response stream ends when the loop
/// drops its sender. A client that disconnects drops the receiver, which
/// stops the loop at its next emission.
///
/// Only the turns a run added are written back, appended to whatever is
/// stored by then. Two overlapping requests on one conversation both start
/// from the same history and land in completion order.
async fn chat_stream_handler(
    State(state): State<SharedApiState>,
    Json(payload): Json<ChatRequest>,
) -> Result<Sse<impl Stream<Item = Result<SseEvent, Infallible>>>, ApiError> {
    if payload.message.trim().is_empty() {
        return Err(bad_request("message must not be empty"));
    }

    let conversation_id = payload
        .conversation_id
        .filter(|id| !id.is_empty())
        .map(|id| ConversationId::from(&id))
        .unwrap_or_default();
    info!(conversation_id = %conversation_id, "v1/chat/stream SSE request");

    let history = state
        .conversations
        .read()
        .await
        .get(&conversation_id.0)
        .map(|c| c.turns.clone())
        .unwrap_or_default();

    let base_len = history.len();
    let (tx, rx) = mpsc::channel(EVENT_BUFFER);
    let request = LoopRequest {
        conversation_id,
        history,
        message: payload.message,
    };

    let task_state = Arc::clone(&state);
    tokio::spawn(async move {
        let outcome = task_state
            .agent
            .run_with_deadline(request, &tx, task_state.request_timeout)
            .await;
        drop(tx);
        if outcome.is_completed() {
            let added = outcome.turns.into_iter().skip(base_len).collect();
            store_conversation(&task_state, outcome.conversation_id.0, added).await;
        } else {
            debug!(status = ?outcome.status, "Run did not complete; history unchanged");
        }
    });

    let frames = emitter::with_heartbeat(rx, state.heartbeat_interval)
        .map(|frame| Ok::<_, Infallible>(frame.into_sse()));
    Ok(Sse::new(frames))
}

async fn store_conversation(state: &ApiState, id: String, added: Vec<ConversationTurn>) {
    let mut conversations = state.conversations.write().await;

    if conversations.len() >= MAX_CONVERSATIONS && !conversations.contains_key(&id) {
        if let Some(oldest) = conversations
            .iter()
            .min_by_key(|(_, c)| c.updated_at)
            .map(|(k, _)| k.clone())
        {
            conversations.remove(&oldest);
        }
    }

    let entry = conversations
        .entry(id)
        .or_insert_with(|| StoredConversation {
            turns: Vec::new(),
            updated_at: Utc::now(),
        });
    entry.turns.extend(added);
    entry.updated_at = Utc::now();
}

/// `GET /v1/tools`
async fn list_tools_handler(State(state): State<SharedApiState>) -> Json<ToolListResponse> {
    let defs = state.agent.tools().definitions();
    let count = defs.len();

    Json(ToolListResponse {
        tools: defs
            .into_iter()
            .map(|d| ToolDto {
                name: d.name,
                description: d.description,
                parameters: d.parameters,
            })
            .collect(),
        count,
    })
}

/// `GET /v1/conversations/{id}`
async fn get_conversation_handler(
    State(state): State<SharedApiState>,
    Path(id): Path<String>,
) -> Result<Json<ConversationResponse>, StatusCode> {
    let conversations = state.conversations.read().await;
    let conversation = conversations.get(&id).ok_or(StatusCode::NOT_FOUND)?;

    Ok(Json(ConversationResponse {
        id,
        turns: conversation.turns.clone(),
        updated_at: conversation.updated_at.to_rfc3339(),
    }))
}
