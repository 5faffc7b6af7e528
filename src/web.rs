use crate::service::{DedupError, DedupService, SubmitOutcome};
use axum::{
    extract::State,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::sync::Arc;
use tokio::signal;

#[derive(Clone)]
struct SharedState {
    service: Arc<DedupService>,
}

async fn start_app(service: Arc<DedupService>, bind: String) {
    let shared_state = Arc::new(SharedState {
        service: service.clone(),
    });

    async fn shutdown_signal() {
        let ctrl_c = async {
            signal::ctrl_c()
                .await
                .expect("failed to install Ctrl+C handler");
        };

        let terminate = async {
            signal::unix::signal(signal::unix::SignalKind::terminate())
                .expect("failed to install signal handler")
                .recv()
                .await;
        };

        tokio::select! {
            _ = ctrl_c => {},
            _ = terminate => {},
        }
    }

    let app = router(shared_state);

    let listener = tokio::net::TcpListener::bind(&bind).await.unwrap();
    log::info!("listening on {bind}");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .unwrap();

    // in-flight submits have drained; run the final flush
    log::warn!("shutting down, flushing pending admissions");
    tokio::task::block_in_place(move || service.shutdown());
}

fn router(state: Arc<SharedState>) -> Router {
    Router::new()
        .route("/api/similarity", post(similarity))
        .route("/api/stats", get(stats))
        .layer(
            tower_http::trace::TraceLayer::new_for_http()
                .make_span_with(
                    tower_http::trace::DefaultMakeSpan::new().level(tracing::Level::INFO),
                )
                .on_response(
                    tower_http::trace::DefaultOnResponse::new().level(tracing::Level::INFO),
                ),
        )
        .with_state(state)
}

pub fn start_daemon(service: Arc<DedupService>, bind: String) {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .unwrap()
        .block_on(async { start_app(service, bind).await });
}

// Wrapper so axum knows how to convert `DedupError` into a response.
#[derive(Debug)]
struct HttpError(DedupError);

impl IntoResponse for HttpError {
    fn into_response(self) -> axum::response::Response {
        let body = json!({"error": self.0.to_string()}).to_string();
        match self.0 {
            DedupError::EmbeddingUnavailable(_) => {
                log::error!("{self:?}");
                (axum::http::StatusCode::SERVICE_UNAVAILABLE, body)
            }
            DedupError::EmptyInput => (axum::http::StatusCode::BAD_REQUEST, body),
            DedupError::Index(_) => {
                log::error!("{self:?}");
                (axum::http::StatusCode::UNPROCESSABLE_ENTITY, body)
            }
            DedupError::Snapshot(_)
            | DedupError::StartupDimensionMismatch { .. }
            | DedupError::Internal(_) => {
                log::error!("{self:?}");
                (axum::http::StatusCode::INTERNAL_SERVER_ERROR, body)
            }
        }
        .into_response()
    }
}

impl From<DedupError> for HttpError {
    fn from(err: DedupError) -> Self {
        Self(err)
    }
}

#[derive(Debug, Deserialize)]
pub struct SimilarityRequest {
    pub text: String,
}

#[derive(Debug, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum SimilarityResponse {
    Duplicate { matched_text: String, score: f32 },
    Admitted { id: String },
}

impl From<SubmitOutcome> for SimilarityResponse {
    fn from(outcome: SubmitOutcome) -> Self {
        match outcome {
            SubmitOutcome::Duplicate {
                matched_text,
                distance,
            } => SimilarityResponse::Duplicate {
                matched_text,
                score: distance,
            },
            SubmitOutcome::Admitted { id } => SimilarityResponse::Admitted { id: id.to_string() },
        }
    }
}

async fn similarity(
    State(state): State<Arc<SharedState>>,
    Json(payload): Json<SimilarityRequest>,
) -> Result<axum::Json<SimilarityResponse>, HttpError> {
    let service = state.service.clone();

    // the core is sync and may block on the lock or on a flush
    tokio::task::block_in_place(move || {
        service
            .submit(&payload.text)
            .map(SimilarityResponse::from)
            .map(Into::into)
            .map_err(Into::into)
    })
}

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub entries: usize,
    pub pending: u64,
    pub dimensions: usize,
}

async fn stats(
    State(state): State<Arc<SharedState>>,
) -> Result<axum::Json<StatsResponse>, HttpError> {
    let service = state.service.clone();

    tokio::task::block_in_place(move || {
        service
            .stats()
            .map(|s| {
                StatsResponse {
                    entries: s.entries,
                    pending: s.pending,
                    dimensions: s.dimensions,
                }
                .into()
            })
            .map_err(Into::into)
    })
}
