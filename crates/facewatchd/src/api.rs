//! HTTP and WebSocket surface.

use crate::capture::CaptureSupervisor;
use crate::control::{ControlError, ControlPath, DashboardStats, PersonSummary};
use crate::events::{ClientEvent, ServerEvent};
use crate::publisher::Publisher;
use axum::extract::rejection::JsonRejection;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{DefaultBodyLimit, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use uuid::Uuid;

const BODY_LIMIT: usize = 50 * 1024 * 1024;

pub struct AppState {
    pub control: ControlPath,
    pub publisher: Publisher,
    pub capture: Arc<CaptureSupervisor>,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/dashboard", get(dashboard_handler))
        .route("/api/people", get(people_handler))
        .route("/api/register", post(register_handler))
        .route("/health", get(health_handler))
        .route("/ws", get(ws_handler))
        .layer(DefaultBodyLimit::max(BODY_LIMIT))
        .layer(CorsLayer::new().allow_origin(Any).allow_methods(Any).allow_headers(Any))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    Internal(String),
}

impl From<ControlError> for ApiError {
    fn from(e: ControlError) -> Self {
        match e {
            ControlError::MissingInput | ControlError::NoFaceDetected => Self::BadRequest(e.to_string()),
            other => {
                tracing::error!(error = %other, "request failed");
                Self::Internal(other.to_string())
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            Self::BadRequest(message) => (StatusCode::BAD_REQUEST, message),
            Self::Internal(message) => (StatusCode::INTERNAL_SERVER_ERROR, message),
        };
        (status, Json(json!({ "error": message }))).into_response()
    }
}

#[derive(Debug, Deserialize)]
struct RegisterRequest {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    photos: Option<Vec<PhotoPayload>>,
}

#[derive(Debug, Deserialize)]
struct PhotoPayload {
    #[serde(default)]
    src: Option<String>,
}

async fn dashboard_handler(State(state): State<Arc<AppState>>) -> Result<Json<DashboardStats>, ApiError> {
    Ok(Json(state.control.dashboard().await?))
}

async fn people_handler(State(state): State<Arc<AppState>>) -> Result<Json<Vec<PersonSummary>>, ApiError> {
    Ok(Json(state.control.people().await?))
}

async fn register_handler(
    State(state): State<Arc<AppState>>,
    body: Result<Json<RegisterRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let Json(request) = body.map_err(|rejection| ApiError::BadRequest(rejection.body_text()))?;
    let name = request.name.unwrap_or_default();
    // Entries without a `src` count as absent.
    let photos: Vec<String> = request
        .photos
        .unwrap_or_default()
        .into_iter()
        .filter_map(|photo| photo.src)
        .collect();

    state.control.register_person(&name, photos).await?;
    Ok((
        StatusCode::CREATED,
        Json(json!({ "message": format!("Successfully registered {}", name.trim()) })),
    ))
}

async fn health_handler(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "people": state.control.cached_people(),
        "capture": if state.capture.is_started() { "started" } else { "idle" },
    }))
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    ws.on_upgrade(move |socket| live_session(socket, state))
}

/// One viewer: forward broadcast events out, answer `reload_faces` in.
async fn live_session(mut socket: WebSocket, state: Arc<AppState>) {
    let session = Uuid::new_v4();
    // Subscribe before starting the loop so an immediate stream_error reaches us.
    let mut events = state.publisher.subscribe();
    if state.capture.ensure_started() {
        tracing::info!(%session, "first viewer, capture started");
    }
    tracing::info!(%session, viewers = state.publisher.subscribers(), "viewer connected");

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => {
                    if send_event(&mut socket, &event).await.is_err() {
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::debug!(%session, skipped, "viewer lagging, dropped events");
                }
                Err(RecvError::Closed) => break,
            },
            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    if let Some(reply) = client_reply(&state, &text).await {
                        if send_event(&mut socket, &reply).await.is_err() {
                            break;
                        }
                    }
                }
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }

    tracing::info!(%session, "viewer disconnected");
}

async fn client_reply(state: &AppState, text: &str) -> Option<ServerEvent> {
    match serde_json::from_str::<ClientEvent>(text) {
        Ok(ClientEvent::ReloadFaces) => Some(match state.control.reload().await {
            Ok(count) => ServerEvent::FacesReloaded { count },
            Err(e) => {
                tracing::warn!(error = %e, "client reload failed");
                ServerEvent::ReloadFailed { message: e.to_string() }
            }
        }),
        Ok(ClientEvent::Connect) => None,
        Err(e) => {
            tracing::debug!(error = %e, "ignoring unrecognized client message");
            None
        }
    }
}

async fn send_event(socket: &mut WebSocket, event: &ServerEvent) -> Result<(), axum::Error> {
    match event.to_json() {
        Ok(text) => socket.send(Message::Text(text)).await,
        Err(e) => {
            tracing::warn!(error = %e, "failed to serialize event");
            Ok(())
        }
    }
}
