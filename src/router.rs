use std::{convert::Infallible, sync::Arc};

use axum::{
    Json, Router,
    extract::{Path, Query, State},
    http::StatusCode,
    response::{
        IntoResponse, Response,
        sse::{Event, KeepAlive, Sse},
    },
    routing::{get, post},
};
use futures_util::{Stream, StreamExt, stream};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tower_http::{services::ServeDir, trace::TraceLayer};

use crate::downloader::{
    BroadcastNotifier, Chunk, Engine, StatusCount, Transfer, TransferError, TransferRequest,
    TransferStatus,
};

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<Engine>,
    pub events: Arc<BroadcastNotifier>,
    /// Ends open event streams so graceful shutdown can finish
    pub shutdown: CancellationToken,
}

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Transfer(#[from] TransferError),
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let Error::Transfer(e) = &self;
        let status = match e {
            TransferError::NotFound(_) => StatusCode::NOT_FOUND,
            TransferError::InvalidState { .. } => StatusCode::CONFLICT,
            TransferError::InvalidUrl(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            tracing::error!(error = %e, "Request failed");
        }
        let body = Json(ErrorBody {
            error: self.to_string(),
        });
        (status, body).into_response()
    }
}

type ApiResult<T> = Result<T, Error>;

#[derive(Debug, Deserialize)]
struct ListQuery {
    status: Option<TransferStatus>,
    domain: Option<String>,
}

#[derive(Debug, Serialize)]
struct TransferDetail {
    #[serde(flatten)]
    transfer: Transfer,
    percentage: Option<f32>,
    chunks: Vec<Chunk>,
}

async fn create_transfer(
    State(state): State<AppState>,
    Json(request): Json<TransferRequest>,
) -> ApiResult<(StatusCode, Json<Transfer>)> {
    let transfer = state.engine.enqueue(request).await?;
    Ok((StatusCode::CREATED, Json(transfer)))
}

async fn list_transfers(
    State(state): State<AppState>,
    Query(query): Query<ListQuery>,
) -> ApiResult<Json<Vec<Transfer>>> {
    let transfers =
        Transfer::list(state.engine.db(), query.status, query.domain.as_deref()).await?;
    Ok(Json(transfers))
}

async fn get_transfer(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> ApiResult<Json<TransferDetail>> {
    let transfer = Transfer::require(state.engine.db(), &key).await?;
    let chunks = Chunk::for_transfer(state.engine.db(), &key).await?;
    Ok(Json(TransferDetail {
        percentage: transfer.percentage(),
        transfer,
        chunks,
    }))
}

async fn cancel_transfer(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> ApiResult<Json<Transfer>> {
    Ok(Json(state.engine.cancel(&key).await?))
}

async fn pause_transfer(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> ApiResult<Json<Transfer>> {
    Ok(Json(state.engine.pause(&key).await?))
}

async fn resume_transfer(
    State(state): State<AppState>,
    Path(key): Path<String>,
) -> ApiResult<Json<Transfer>> {
    Ok(Json(state.engine.resume(&key).await?))
}

async fn stats(State(state): State<AppState>) -> ApiResult<Json<Vec<StatusCount>>> {
    Ok(Json(Transfer::stats(state.engine.db()).await?))
}

/// Server-sent stream of progress and finished events
async fn events(State(state): State<AppState>) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let rx = state.events.subscribe();
    let stream = stream::unfold(rx, |mut rx| async move {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    let Ok(data) = serde_json::to_string(&event) else {
                        continue;
                    };
                    let sse = Event::default().event(event.name()).data(data);
                    return Some((Ok(sse), rx));
                }
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Event subscriber lagging, dropped events");
                }
                Err(RecvError::Closed) => return None,
            }
        }
    });
    Sse::new(stream.take_until(state.shutdown.cancelled_owned())).keep_alive(KeepAlive::default())
}

pub fn create_router(state: AppState) -> Router {
    let storage_root = state.engine.settings().storage_root.clone();
    Router::new()
        .route("/transfers", post(create_transfer).get(list_transfers))
        .route("/transfers/{key}", get(get_transfer))
        .route("/transfers/{key}/cancel", post(cancel_transfer))
        .route("/transfers/{key}/pause", post(pause_transfer))
        .route("/transfers/{key}/resume", post(resume_transfer))
        .route("/stats", get(stats))
        .route("/events", get(events))
        // Placed artifacts and thumbnails
        .nest_service("/storage", ServeDir::new(storage_root))
        .fallback(|| async {
            (
                StatusCode::NOT_FOUND,
                Json(ErrorBody {
                    error: "Not Found".to_string(),
                }),
            )
        })
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
