use std::convert::Infallible;
use std::time::Duration;

use shuttle_axum::axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{
        sse::{Event as SseEvent, KeepAlive},
        IntoResponse, Response, Sse,
    },
    routing::{get, post},
    Json, Router,
};
use tokio_stream::{wrappers::BroadcastStream, Stream, StreamExt};
use tower_http::cors::CorsLayer;

use crate::acquire::{ItemView, SchedulerHandle, StatusView};
use crate::fanout::LiveMessage;
use crate::merge::{self, UpdatesPage};
use crate::upstream::ItemId;

#[derive(Clone)]
pub struct AppState {
    pub scheduler: SchedulerHandle,
    pub merge_threshold: usize,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { "OK" }))
        .route("/status", get(status))
        .route("/items/{id}/events", get(item_events))
        .route("/items/{id}/request", post(request_item))
        .route("/hints", post(push_hints))
        .route("/updates", post(updates))
        .route("/live", get(live))
        .layer(CorsLayer::very_permissive())
        .with_state(state)
}

/// Any handle error means the acquisition loop is gone.
struct ApiError(anyhow::Error);

impl From<anyhow::Error> for ApiError {
    fn from(e: anyhow::Error) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        tracing::warn!(error = ?self.0, "request failed");
        (StatusCode::SERVICE_UNAVAILABLE, format!("{:#}", self.0)).into_response()
    }
}

async fn status(State(state): State<AppState>) -> Result<Json<StatusView>, ApiError> {
    Ok(Json(state.scheduler.status().await?))
}

async fn item_events(
    State(state): State<AppState>,
    Path(id): Path<ItemId>,
) -> Result<Json<ItemView>, ApiError> {
    Ok(Json(state.scheduler.item(id).await?))
}

#[derive(serde::Deserialize)]
struct RequestBody {
    #[serde(default = "default_urgent")]
    urgent: bool,
    #[serde(default = "default_weight")]
    weight: u32,
}

impl Default for RequestBody {
    fn default() -> Self {
        Self {
            urgent: default_urgent(),
            weight: default_weight(),
        }
    }
}

fn default_urgent() -> bool {
    true
}

fn default_weight() -> u32 {
    1
}

#[derive(serde::Serialize)]
struct Accepted {
    item_id: ItemId,
    queued_as: &'static str,
}

async fn request_item(
    State(state): State<AppState>,
    Path(id): Path<ItemId>,
    body: Option<Json<RequestBody>>,
) -> Result<(StatusCode, Json<Accepted>), ApiError> {
    let req = body.map(|Json(b)| b).unwrap_or_default();
    let queued_as = if req.urgent {
        state.scheduler.request_now(id).await?;
        "direct"
    } else {
        state
            .scheduler
            .enqueue(id, u64::from(req.weight))
            .await?;
        "overlay"
    };
    Ok((
        StatusCode::ACCEPTED,
        Json(Accepted {
            item_id: id,
            queued_as,
        }),
    ))
}

#[derive(serde::Deserialize)]
struct HintsBody {
    item_ids: Vec<ItemId>,
}

async fn push_hints(
    State(state): State<AppState>,
    Json(body): Json<HintsBody>,
) -> Result<StatusCode, ApiError> {
    state.scheduler.push_hint(body.item_ids).await?;
    Ok(StatusCode::ACCEPTED)
}

#[derive(serde::Deserialize)]
struct UpdatesBody {
    item_ids: Vec<ItemId>,
    #[serde(default = "default_page_size")]
    page_size: usize,
    #[serde(default)]
    offset: usize,
}

fn default_page_size() -> usize {
    50
}

async fn updates(
    State(state): State<AppState>,
    Json(body): Json<UpdatesBody>,
) -> Result<Json<UpdatesPage>, ApiError> {
    let lists = state.scheduler.events_for(body.item_ids).await?;
    let page =
        merge::page_updates(lists, body.page_size, body.offset, state.merge_threshold).await?;
    Ok(Json(page))
}

async fn live(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<SseEvent, Infallible>>> {
    let receiver = state.scheduler.fanout().subscribe();
    let stream = BroadcastStream::new(receiver).filter_map(|item| match item {
        Ok(msg) => live_event(&msg).map(Ok),
        Err(err) => {
            // lagged: the skipped messages are gone, carry on with the next one
            tracing::debug!(target: "fanout", "live subscriber fell behind: {err}");
            None
        }
    });
    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("keep-alive"),
    )
}

fn live_event(msg: &LiveMessage) -> Option<SseEvent> {
    serde_json::to_string(msg)
        .map_err(|e| tracing::warn!(target: "fanout", error = %e, "failed to encode live message"))
        .ok()
        .map(|data| SseEvent::default().event(msg.event_name()).data(data))
}
