#![forbid(unsafe_code)]

use std::{sync::Arc, time::Duration};

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use pulse_adapter::{
    config::AdapterConfig, AdapterError, AdapterRuntime, CanRedeemAdapterRequest, ErrorResponse,
    RedeemAdapterRequest, RedeemAmountAdapterRequest, StoreGrantAdapterRequest,
};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

type SharedRuntime = Arc<AdapterRuntime>;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("PULSE_LOG").unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = AdapterConfig::from_env()?;
    let runtime: SharedRuntime = Arc::new(AdapterRuntime::from_config(&config)?);

    let worker_enabled = config.distribution_worker_enabled;
    let interval_ms = config.distribution_worker_interval_ms;
    if worker_enabled {
        let runtime_for_worker = runtime.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_millis(interval_ms));
            loop {
                ticker.tick().await;
                let rt = runtime_for_worker.clone();
                match tokio::task::spawn_blocking(move || rt.run_distribution(None)).await {
                    Ok(Ok(out)) => tracing::debug!(
                        users_checked = out.report.users_checked,
                        users_distributing = out.report.users_distributing,
                        "distribution worker pass finished"
                    ),
                    Ok(Err(err)) => tracing::error!(error = %err, "distribution worker pass failed"),
                    Err(err) => tracing::error!(error = %err, "distribution worker task panicked"),
                }
            }
        });
    }

    let app = Router::new()
        .route("/health", get(health))
        .route("/api/permissions/store", post(store_grant))
        .route(
            "/api/permissions/:user",
            get(get_grants).delete(deactivate_all_grants),
        )
        .route("/api/permissions/:user/allowances", get(allowance_summary))
        .route("/api/permissions/:user/redemptions", get(redemptions))
        .route(
            "/api/permissions/:user/redemptions/:asset/:period_start",
            get(redemptions_in_period),
        )
        .route("/api/permissions/:user/can-redeem", post(can_redeem))
        .route("/api/permissions/:user/:asset", delete(deactivate_grant))
        .route("/api/distribution/run", post(run_distribution))
        .route("/api/distribution/status", get(all_statuses))
        .route("/api/distribution/status/:user", get(status))
        .route("/api/distribution/redeem", post(redeem_now))
        .route("/api/distribution/redeem-amount", post(redeem_partial))
        .with_state(runtime);

    tracing::info!(
        bind = %config.bind,
        store = %config.store_path.display(),
        worker_enabled,
        interval_ms,
        "pulse_adapter_http listening"
    );
    let listener = tokio::net::TcpListener::bind(config.bind).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

/// Runs engine work off the async executor; store and collaborator calls block.
async fn blocking<T, F>(runtime: SharedRuntime, op: F) -> Response
where
    T: Serialize + Send + 'static,
    F: FnOnce(&AdapterRuntime) -> Result<T, AdapterError> + Send + 'static,
{
    match tokio::task::spawn_blocking(move || op(runtime.as_ref())).await {
        Ok(Ok(body)) => (StatusCode::OK, Json(body)).into_response(),
        Ok(Err(err)) => error_response(&err),
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorResponse::new(format!("adapter task failed: {err}"))),
        )
            .into_response(),
    }
}

fn error_response(err: &AdapterError) -> Response {
    let code = match err {
        AdapterError::BadRequest(_) => StatusCode::BAD_REQUEST,
        AdapterError::NotFound(_) => StatusCode::NOT_FOUND,
        AdapterError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if code == StatusCode::INTERNAL_SERVER_ERROR {
        tracing::error!(error = %err, "request failed");
    }
    (code, Json(ErrorResponse::new(err.to_string()))).into_response()
}

async fn health(State(runtime): State<SharedRuntime>) -> Response {
    blocking(runtime, |rt| rt.health_report(None)).await
}

async fn store_grant(
    State(runtime): State<SharedRuntime>,
    Json(request): Json<StoreGrantAdapterRequest>,
) -> Response {
    blocking(runtime, move |rt| rt.store_grant(request, None)).await
}

async fn get_grants(State(runtime): State<SharedRuntime>, Path(user): Path<String>) -> Response {
    blocking(runtime, move |rt| rt.grants(&user)).await
}

async fn allowance_summary(
    State(runtime): State<SharedRuntime>,
    Path(user): Path<String>,
) -> Response {
    blocking(runtime, move |rt| rt.allowance_summary(&user, None)).await
}

async fn redemptions(State(runtime): State<SharedRuntime>, Path(user): Path<String>) -> Response {
    blocking(runtime, move |rt| rt.redemptions(&user)).await
}

async fn redemptions_in_period(
    State(runtime): State<SharedRuntime>,
    Path((user, asset, period_start)): Path<(String, String, u64)>,
) -> Response {
    blocking(runtime, move |rt| {
        rt.redemptions_in_period(&user, &asset, period_start)
    })
    .await
}

async fn can_redeem(
    State(runtime): State<SharedRuntime>,
    Path(user): Path<String>,
    Json(request): Json<CanRedeemAdapterRequest>,
) -> Response {
    blocking(runtime, move |rt| rt.can_redeem_amount(&user, request, None)).await
}

async fn deactivate_all_grants(
    State(runtime): State<SharedRuntime>,
    Path(user): Path<String>,
) -> Response {
    blocking(runtime, move |rt| rt.deactivate_all_grants(&user, None)).await
}

async fn deactivate_grant(
    State(runtime): State<SharedRuntime>,
    Path((user, asset)): Path<(String, String)>,
) -> Response {
    blocking(runtime, move |rt| rt.deactivate_grant(&user, &asset, None)).await
}

async fn run_distribution(State(runtime): State<SharedRuntime>) -> Response {
    blocking(runtime, |rt| rt.run_distribution(None)).await
}

async fn all_statuses(State(runtime): State<SharedRuntime>) -> Response {
    blocking(runtime, |rt| rt.all_statuses(None)).await
}

async fn status(State(runtime): State<SharedRuntime>, Path(user): Path<String>) -> Response {
    blocking(runtime, move |rt| rt.status(&user, None)).await
}

async fn redeem_now(
    State(runtime): State<SharedRuntime>,
    Json(request): Json<RedeemAdapterRequest>,
) -> Response {
    blocking(runtime, move |rt| rt.redeem_now(request, None)).await
}

async fn redeem_partial(
    State(runtime): State<SharedRuntime>,
    Json(request): Json<RedeemAmountAdapterRequest>,
) -> Response {
    blocking(runtime, move |rt| rt.redeem_partial(request, None)).await
}
