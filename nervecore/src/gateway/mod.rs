/*!
HTTP gateway.

A thin translation layer: requests become bus signals through the API
sense, responses are drained from the SSE hub. The gateway holds no kernel
state and makes no decisions beyond auth and correlation matching.

Routes:
- `POST /message`: emit `api.message_received`, wait up to the configured
  window for the correlated outbound, return it synchronously.
- `GET /events?channel_target=...`: SSE stream of outbound messages for one
  target.
- `POST /status` / `POST /timed-signals`: synchronous request signals.

When `API_TOKEN` is set, every route requires the `X-Agent-API-Token`
header.
*/

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use async_stream::stream;
use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::Stream;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::watch;
use uuid::Uuid;

use crate::extremities::SseHub;
use crate::runtime::NerveConfig;
use crate::senses::ApiIngress;
use crate::signal::{types, NormalizedOutboundMessage, Signal};

pub const AUTH_HEADER: &str = "x-agent-api-token";

#[derive(Clone)]
pub struct GatewayState {
    pub ingress: ApiIngress,
    pub sse: Arc<SseHub>,
    pub config: Arc<NerveConfig>,
}

#[derive(Debug, Deserialize)]
pub struct MessageRequest {
    pub channel: String,
    pub text: String,
    #[serde(default)]
    pub metadata: Value,
    #[serde(default)]
    pub correlation_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct MessageResponse {
    pub correlation_id: String,
    pub reply: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct AdminRequest {
    #[serde(default)]
    pub channel: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct EventsQuery {
    pub channel_target: String,
}

pub fn router(state: GatewayState) -> Router {
    Router::new()
        .route("/message", post(post_message))
        .route("/events", get(get_events))
        .route("/status", post(post_status))
        .route("/timed-signals", post(post_timed_signals))
        .with_state(state)
}

/// Bind and serve until shutdown flips.
pub async fn serve(
    state: GatewayState,
    bind: &str,
    mut shutdown: watch::Receiver<bool>,
) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(bind).await?;
    tracing::info!(bind = %bind, "gateway listening");
    axum::serve(listener, router(state).into_make_service())
        .with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
        })
        .await
}

fn authorized(state: &GatewayState, headers: &HeaderMap) -> bool {
    match &state.config.api_token {
        None => true,
        Some(expected) => headers
            .get(AUTH_HEADER)
            .and_then(|value| value.to_str().ok())
            .is_some_and(|token| token == expected),
    }
}

async fn post_message(
    State(state): State<GatewayState>,
    headers: HeaderMap,
    Json(request): Json<MessageRequest>,
) -> Result<Json<MessageResponse>, StatusCode> {
    if !authorized(&state, &headers) {
        return Err(StatusCode::UNAUTHORIZED);
    }
    let correlation_id = request
        .correlation_id
        .filter(|id| !id.is_empty())
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    // Subscribe before emitting so the reply cannot race past us.
    let replies = state.sse.subscribe_all();

    let signal = Signal::new(
        types::API_MESSAGE_RECEIVED,
        "api",
        json!({
            "text": request.text,
            "channel_type": "api",
            "channel_target": request.channel,
            "user_id": request.channel,
            "metadata": request.metadata,
        }),
    )
    .with_correlation_id(correlation_id.clone())
    .durable();
    if !state.ingress.submit(signal) {
        return Err(StatusCode::SERVICE_UNAVAILABLE);
    }

    let reply = wait_for_reply(replies, &correlation_id, state.config.api_message_wait).await;
    Ok(Json(MessageResponse {
        correlation_id,
        reply,
    }))
}

async fn wait_for_reply(
    replies: flume::Receiver<NormalizedOutboundMessage>,
    correlation_id: &str,
    window: Duration,
) -> Option<String> {
    let wait = async {
        loop {
            match replies.recv_async().await {
                Ok(message) if message.correlation_id == correlation_id => {
                    return Some(message.message)
                }
                Ok(_) => continue,
                Err(_) => return None,
            }
        }
    };
    tokio::time::timeout(window, wait).await.ok().flatten()
}

async fn get_events(
    State(state): State<GatewayState>,
    headers: HeaderMap,
    Query(query): Query<EventsQuery>,
) -> Result<Sse<impl Stream<Item = Result<SseEvent, Infallible>>>, StatusCode> {
    if !authorized(&state, &headers) {
        return Err(StatusCode::UNAUTHORIZED);
    }
    let rx = state.sse.subscribe_target(&query.channel_target);
    let events = stream! {
        while let Ok(message) = rx.recv_async().await {
            let payload = json!({
                "message": message.message,
                "channel_type": message.channel_type,
                "channel_target": message.channel_target,
                "correlation_id": message.correlation_id,
                "metadata": message.metadata,
            });
            match SseEvent::default().json_data(&payload) {
                Ok(event) => yield Ok(event),
                Err(err) => {
                    tracing::warn!(error = %err, "sse frame encode failed");
                }
            }
        }
    };
    Ok(Sse::new(events).keep_alive(KeepAlive::default()))
}

async fn post_status(
    State(state): State<GatewayState>,
    headers: HeaderMap,
    Json(request): Json<AdminRequest>,
) -> Result<Json<Value>, StatusCode> {
    admin_request(state, headers, request, types::API_STATUS_REQUESTED).await
}

async fn post_timed_signals(
    State(state): State<GatewayState>,
    headers: HeaderMap,
    Json(request): Json<AdminRequest>,
) -> Result<Json<Value>, StatusCode> {
    admin_request(state, headers, request, types::API_TIMED_SIGNALS_REQUESTED).await
}

async fn admin_request(
    state: GatewayState,
    headers: HeaderMap,
    request: AdminRequest,
    signal_type: &'static str,
) -> Result<Json<Value>, StatusCode> {
    if !authorized(&state, &headers) {
        return Err(StatusCode::UNAUTHORIZED);
    }
    let correlation_id = Uuid::new_v4().to_string();
    let channel_target = request.channel.unwrap_or_else(|| "admin".to_string());
    let replies = state.sse.subscribe_all();

    let signal = Signal::new(
        signal_type,
        "api",
        json!({
            "channel_type": "api",
            "channel_target": channel_target,
        }),
    )
    .with_correlation_id(correlation_id.clone())
    .durable();
    if !state.ingress.submit(signal) {
        return Err(StatusCode::SERVICE_UNAVAILABLE);
    }

    match wait_for_reply(replies, &correlation_id, state.config.api_message_wait).await {
        Some(reply) => Ok(Json(json!({
            "correlation_id": correlation_id,
            "response": reply,
        }))),
        None => Err(StatusCode::GATEWAY_TIMEOUT),
    }
}
