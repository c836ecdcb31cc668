//! HTTP request handlers: control endpoints and the SSE event stream.

use std::convert::Infallible;
use std::sync::atomic::Ordering;

use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use tracing::{error, info, warn};

use cbsrt_core::config::{KEEPALIVE_INTERVAL, SessionConfig};

use crate::broadcast::Frame;
use crate::session::{SessionError, SessionStatus};
use crate::state::{AppState, SSE_CONNECTIONS};

impl IntoResponse for SessionError {
    fn into_response(self) -> Response {
        let status = match &self {
            SessionError::AlreadyRunning => StatusCode::CONFLICT,
            SessionError::DeviceMissing(_) => StatusCode::SERVICE_UNAVAILABLE,
            SessionError::Setup(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, self.to_string()).into_response()
    }
}

// ============================================================
// Control surface
// ============================================================

pub(crate) async fn handle_start(
    State(session): AppState,
    Json(cfg): Json<SessionConfig>,
) -> Result<&'static str, SessionError> {
    session.start(cfg).inspect_err(|e| warn!(error = %e, "start rejected"))?;
    Ok("ok")
}

pub(crate) async fn handle_stop(State(session): AppState) -> &'static str {
    session.stop();
    "ok"
}

pub(crate) async fn handle_apply(
    State(session): AppState,
    Json(cfg): Json<SessionConfig>,
) -> Result<&'static str, SessionError> {
    let result = tokio::task::spawn_blocking(move || session.apply(cfg)).await;
    match result {
        Ok(Ok(())) => {
            info!("board configuration applied");
            Ok("ok")
        }
        Ok(Err(e)) => {
            warn!(error = %e, "apply failed");
            Err(e)
        }
        Err(e) => {
            error!(error = %e, "apply panicked in spawn_blocking");
            Err(SessionError::Setup(std::io::Error::other(e.to_string()).into()))
        }
    }
}

pub(crate) async fn handle_status(State(session): AppState) -> Json<SessionStatus> {
    Json(session.status())
}

// ============================================================
// SSE streaming
// ============================================================

struct SseGuard;

impl Drop for SseGuard {
    fn drop(&mut self) {
        let active = SSE_CONNECTIONS.fetch_sub(1, Ordering::Relaxed) - 1;
        info!(active_connections = active, "SSE client disconnected");
    }
}

/// One `data:` event per record in production order; a `keep-alive`
/// comment after every idle interval.
pub(crate) async fn handle_events(
    State(session): AppState,
) -> Sse<impl futures_core::Stream<Item = Result<Event, Infallible>>> {
    let active = SSE_CONNECTIONS.fetch_add(1, Ordering::Relaxed) + 1;
    info!(active_connections = active, "SSE client connected");

    let mut sub = session.broadcaster().subscribe();

    let stream = async_stream::stream! {
        let _guard = SseGuard;
        while let Some(frame) = sub.recv_timeout(KEEPALIVE_INTERVAL).await {
            match frame {
                Frame::Record(record) => match serde_json::to_string(record.as_ref()) {
                    Ok(json) => yield Ok(Event::default().data(json)),
                    Err(e) => error!(error = %e, "failed to serialize record"),
                },
                Frame::KeepAlive => yield Ok(Event::default().comment("keep-alive")),
            }
        }
    };

    Sse::new(stream)
}
