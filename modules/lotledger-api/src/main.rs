use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json},
    routing::{get, post},
    Router,
};
use serde::Deserialize;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use lotledger_common::{Config, LotLedgerError};
use lotledger_ingest::collaborators::{
    HttpCommentIngestor, HttpImageBackfiller, LogNotifier, NoopBackfiller, NoopCommentIngestor,
};
use lotledger_ingest::fetch::TieredFetcher;
use lotledger_ingest::health::{AuditOptions, RequeueMonitor};
use lotledger_ingest::outbox::OutboxDrain;
use lotledger_ingest::pipeline::{IngestPipeline, IngestRequest};
use lotledger_ingest::traits::{CommentIngestor, ImageBackfiller, LotStore};
use lotledger_store::LotWriter;

const OUTBOX_DRAIN_INTERVAL: Duration = Duration::from_secs(10);
const OUTBOX_DRAIN_BATCH: i64 = 20;

pub struct AppState {
    pipeline: IngestPipeline,
    monitor: RequeueMonitor,
    config: Config,
}

#[derive(Debug, Deserialize, Default)]
struct RequeueParams {
    batch_size: Option<i64>,
    dry_run: Option<bool>,
    min_age_hours: Option<i64>,
    requeue_priority: Option<i32>,
    cooldown_hours: Option<i64>,
    vehicle_id: Option<Uuid>,
}

async fn ingest_handler(
    State(state): State<Arc<AppState>>,
    Json(body): Json<IngestRequest>,
) -> impl IntoResponse {
    match state.pipeline.ingest(&body).await {
        Ok(report) => (StatusCode::OK, Json(serde_json::json!(report))).into_response(),
        Err(LotLedgerError::Validation(message)) => (
            StatusCode::BAD_REQUEST,
            Json(serde_json::json!({ "error": message })),
        )
            .into_response(),
        Err(e) => {
            error!(url = body.url, error = %e, "Ingestion failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({ "error": e.to_string() })),
            )
                .into_response()
        }
    }
}

async fn requeue_handler(
    State(state): State<Arc<AppState>>,
    Json(body): Json<RequeueParams>,
) -> impl IntoResponse {
    let defaults = AuditOptions::default();
    let opts = AuditOptions {
        batch_size: body.batch_size.unwrap_or(state.config.audit_batch_size),
        dry_run: body.dry_run.unwrap_or(false),
        min_age_hours: body.min_age_hours.unwrap_or(state.config.audit_min_age_hours),
        requeue_priority: body.requeue_priority.unwrap_or(defaults.requeue_priority),
        cooldown_hours: body
            .cooldown_hours
            .unwrap_or(state.config.requeue_cooldown_hours),
        vehicle_id: body.vehicle_id,
    };

    match state.monitor.run(&opts).await {
        Ok(counters) => (StatusCode::OK, Json(serde_json::json!(counters))).into_response(),
        Err(e) => {
            error!(error = %e, "Audit run failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(serde_json::json!({ "error": e.to_string() })),
            )
                .into_response()
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("lotledger=info".parse()?))
        .init();

    let config = Config::from_env();

    let writer = LotWriter::connect(&config.database_url).await?;
    writer.run_migrations().await?;
    let store: Arc<dyn LotStore> = Arc::new(writer);

    let fetcher = Arc::new(TieredFetcher::new(
        &config.render_base_url,
        config.render_token.as_deref(),
        config.fetch_timeout(),
    ));

    let backfiller: Arc<dyn ImageBackfiller> = match &config.image_service_url {
        Some(url) => Arc::new(HttpImageBackfiller::new(
            url,
            config.fetch_timeout(),
            config.image_batch_size,
        )),
        None => Arc::new(NoopBackfiller),
    };
    let comments: Arc<dyn CommentIngestor> = match &config.comment_service_url {
        Some(url) => Arc::new(HttpCommentIngestor::new(url, config.fetch_timeout())),
        None => Arc::new(NoopCommentIngestor),
    };

    let pipeline = IngestPipeline::new(
        fetcher,
        store.clone(),
        backfiller.clone(),
        comments.clone(),
        config.allow_fuzzy_match,
    );
    let monitor = RequeueMonitor::new(store.clone(), config.requeue_enabled)
        .with_notifier(Arc::new(LogNotifier));

    // Background drain of the side-effect outbox.
    let drain = OutboxDrain::new(store, backfiller, comments);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(OUTBOX_DRAIN_INTERVAL);
        loop {
            ticker.tick().await;
            if let Err(e) = drain.drain(OUTBOX_DRAIN_BATCH).await {
                warn!(error = %e, "Outbox drain pass failed");
            }
        }
    });

    let addr = format!("{}:{}", config.web_host, config.web_port);
    let state = Arc::new(AppState { pipeline, monitor, config });

    let app = Router::new()
        .route("/ingest", post(ingest_handler))
        .route("/audit/requeue", post(requeue_handler))
        .route("/healthz", get(|| async { "ok" }))
        .with_state(state)
        .layer(
            tower_http::trace::TraceLayer::new_for_http().make_span_with(
                |request: &axum::http::Request<_>| {
                    tracing::info_span!(
                        "http_request",
                        method = %request.method(),
                        path = %request.uri().path(),
                    )
                },
            ),
        );

    info!("LotLedger API starting on {addr}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
