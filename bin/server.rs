// Property Sync - Region Server
// HTTP request boundary over the conditional write path, plus lag and health
// probes. Routes are region-prefixed like the upstream load balancer expects;
// the path region is informational, identity comes from configuration.

use anyhow::{Context, Result};
use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, put},
    Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use tower_http::cors::CorsLayer;
use tracing::{error, info};

use property_sync::{
    open_database, seed_demo_properties, setup_database, MemoryLog, Region, RegionConfig,
    WriteError, WriteRequest,
};

/// Shared application state
#[derive(Clone)]
struct AppState {
    region: Arc<Region>,
}

#[derive(Deserialize)]
struct UpdateBody {
    price: f64,
    version: i64,
}

#[derive(Serialize)]
struct UpdateResponse {
    id: i64,
    price: f64,
    version: i64,
    updated_at: DateTime<Utc>,
}

#[derive(Serialize)]
struct LagResponse {
    lag_seconds: f64,
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

fn error_json(status: StatusCode, message: &str) -> Response {
    (
        status,
        Json(ErrorBody {
            error: message.to_string(),
        }),
    )
        .into_response()
}

// ============================================================================
// API Handlers
// ============================================================================

/// GET /:region/health
async fn health_check() -> impl IntoResponse {
    "OK"
}

/// PUT /:region/properties/:id - conditional price update
async fn update_property(
    State(state): State<AppState>,
    Path((_req_region, id)): Path<(String, i64)>,
    headers: HeaderMap,
    Json(body): Json<UpdateBody>,
) -> Response {
    let request_id = match headers.get("x-request-id").and_then(|v| v.to_str().ok()) {
        Some(value) if !value.is_empty() => value.to_string(),
        _ => return error_json(StatusCode::BAD_REQUEST, "X-Request-ID header is required"),
    };

    let request = WriteRequest {
        id,
        request_id,
        price: body.price,
        expected_version: body.version,
    };

    let region = Arc::clone(&state.region);
    let result = tokio::task::spawn_blocking(move || region.write(&request)).await;

    match result {
        Ok(Ok(updated)) => {
            // Publish after the response value exists: the client's answer
            // never waits on, or fails because of, the shared log
            let publisher_region = Arc::clone(&state.region);
            let row = updated.clone();
            tokio::task::spawn_blocking(move || publisher_region.publish_committed(&row));

            (
                StatusCode::OK,
                Json(UpdateResponse {
                    id: updated.id,
                    price: updated.price,
                    version: updated.version,
                    updated_at: updated.updated_at,
                }),
            )
                .into_response()
        }
        Ok(Err(WriteError::DuplicateRequest(_))) => {
            error_json(StatusCode::UNPROCESSABLE_ENTITY, "Duplicate request detected")
        }
        Ok(Err(WriteError::NotFound(_))) => {
            error_json(StatusCode::NOT_FOUND, "Property not found")
        }
        Ok(Err(WriteError::VersionConflict { .. })) => {
            error_json(StatusCode::CONFLICT, "Conflict: version mismatch")
        }
        Ok(Err(WriteError::Storage(e))) => {
            error!(error = %e, "storage failure on write path");
            error_json(StatusCode::INTERNAL_SERVER_ERROR, "Internal server error")
        }
        Err(e) => {
            error!(error = %e, "write task panicked");
            error_json(StatusCode::INTERNAL_SERVER_ERROR, "Internal server error")
        }
    }
}

/// GET /:region/replication-lag
async fn replication_lag(State(state): State<AppState>) -> impl IntoResponse {
    Json(LagResponse {
        lag_seconds: state.region.lag_seconds(),
    })
}

// ============================================================================
// Main Server
// ============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let config = RegionConfig::from_env()?;
    info!(region = %config.region, "starting region server");

    let conn = open_database(config.database_path.as_deref())?;
    setup_database(&conn)?;
    let seeded = seed_demo_properties(&conn, &config.region)?;
    if seeded > 0 {
        info!(seeded, "seeded demo listings into empty database");
    }

    // In-process log: every region task in this process shares it. A
    // networked deployment swaps in a SharedLog backed by a real broker.
    let log = Arc::new(MemoryLog::new());
    let port = config.port;
    let region = Arc::new(Region::new(config, Arc::new(Mutex::new(conn)), log));

    // Bounded-retry subscribe; a region that cannot reach the log must not
    // serve traffic at all
    let _consumer = region
        .spawn_consumer()
        .context("could not subscribe to the shared log")?;

    let state = AppState {
        region: Arc::clone(&region),
    };

    let app = Router::new()
        .route("/:region/health", get(health_check))
        .route("/:region/properties/:id", put(update_property))
        .route("/:region/replication-lag", get(replication_lag))
        .with_state(state)
        .layer(CorsLayer::permissive());

    let addr = format!("0.0.0.0:{port}");
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;

    info!(region = %region.name(), %addr, "region server listening");
    axum::serve(listener, app).await.context("server exited")?;

    Ok(())
}
