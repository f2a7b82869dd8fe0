//! HTTP control server.

use std::convert::Infallible;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post, put};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;
use tokio_stream::StreamExt as _;
use tokio_stream::wrappers::WatchStream;
use tower_http::trace::TraceLayer;

use crate::control::{ControlRequest, ControlSurface, DEFAULT_EVENT_COUNT};
use crate::error::{CapabilityError, Error, HeartbeatError};
use crate::transport::Reply;

type AppState = Arc<ControlSurface>;

/// Error type for HTTP responses.
#[derive(Debug)]
pub struct ApiError(pub Error);

impl<E: Into<Error>> From<E> for ApiError {
    fn from(err: E) -> Self {
        Self(err.into())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            Error::Validation(_) | Error::Config(_) | Error::UnknownMethod { .. } => {
                StatusCode::BAD_REQUEST
            }
            Error::Capability(CapabilityError::NotFound { .. }) => StatusCode::NOT_FOUND,
            Error::Capability(CapabilityError::Unsupported { .. }) => StatusCode::NOT_IMPLEMENTED,
            Error::Heartbeat(HeartbeatError::Shutdown) => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = json!({ "error": self.0.to_string() });
        (status, Json(body)).into_response()
    }
}

/// Build the control router.
pub fn router(surface: Arc<ControlSurface>) -> Router {
    Router::new()
        .route("/status", get(get_status))
        .route("/status/stream", get(status_stream))
        .route("/events", get(recent_events))
        .route("/settings", get(get_settings))
        .route("/settings/interval", put(put_interval))
        .route("/routes", get(list_routes).post(add_route))
        .route("/routes/{action}", delete(remove_route))
        .route("/health", get(health))
        .route("/reply", post(post_reply))
        .route("/rpc", post(rpc))
        .layer(TraceLayer::new_for_http())
        .with_state(surface)
}

/// Serve the control router until `shutdown` resolves.
pub async fn serve(
    surface: Arc<ControlSurface>,
    addr: SocketAddr,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(addr = %listener.local_addr()?, "Control server listening");
    axum::serve(listener, router(surface))
        .with_graceful_shutdown(shutdown)
        .await
}

async fn get_status(State(app): State<AppState>) -> impl IntoResponse {
    Json(app.get_status())
}

/// GET /status/stream: one `status` event per state change.
async fn status_stream(State(app): State<AppState>) -> impl IntoResponse {
    let stream = WatchStream::new(app.scheduler().watch_status()).map(|state| {
        let event = Event::default().event("status");
        Ok::<Event, Infallible>(
            event
                .json_data(&state)
                .unwrap_or_else(|_| Event::default().event("status").data("{}")),
        )
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}

async fn get_settings(State(app): State<AppState>) -> impl IntoResponse {
    Json(app.get_settings())
}

#[derive(Debug, Deserialize)]
struct IntervalBody {
    seconds: u64,
}

async fn put_interval(
    State(app): State<AppState>,
    Json(body): Json<IntervalBody>,
) -> Result<impl IntoResponse, ApiError> {
    Ok(Json(app.set_interval(body.seconds).await?))
}

#[derive(Debug, Deserialize)]
struct EventsQuery {
    count: Option<usize>,
}

/// GET /events?count=N: the newest tick outcomes, oldest first.
async fn recent_events(
    State(app): State<AppState>,
    Query(query): Query<EventsQuery>,
) -> Result<impl IntoResponse, ApiError> {
    let count = query.count.unwrap_or(DEFAULT_EVENT_COUNT);
    Ok(Json(app.recent_events(count).await?))
}

async fn list_routes(State(app): State<AppState>) -> impl IntoResponse {
    Json(app.action_routes())
}

#[derive(Debug, Deserialize)]
struct RouteBody {
    action: String,
    path: String,
}

async fn add_route(
    State(app): State<AppState>,
    Json(body): Json<RouteBody>,
) -> Result<impl IntoResponse, ApiError> {
    let routes = app.add_action_route(&body.action, &body.path)?;
    Ok((StatusCode::CREATED, Json(routes)))
}

async fn remove_route(State(app): State<AppState>, Path(action): Path<String>) -> StatusCode {
    if app.remove_action_route(&action) {
        StatusCode::NO_CONTENT
    } else {
        StatusCode::NOT_FOUND
    }
}

async fn health(State(app): State<AppState>) -> impl IntoResponse {
    let report = app.check_health().await;
    let status = if report.overall {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(report))
}

async fn post_reply(State(app): State<AppState>, Json(reply): Json<Reply>) -> impl IntoResponse {
    let delivered = app.deliver_reply(reply);
    let status = if delivered {
        StatusCode::ACCEPTED
    } else {
        StatusCode::NOT_FOUND
    };
    (status, Json(json!({ "delivered": delivered })))
}

async fn rpc(State(app): State<AppState>, Json(request): Json<ControlRequest>) -> impl IntoResponse {
    Json(app.dispatch(request).await)
}
