//! HTTP ingestion surface
//!
//! Three endpoints: `GET /ping` for liveness, `POST /put?topic=NAME` for
//! producing one message, `GET /stats` for the topic listing. On shutdown
//! the server stops accepting and in-flight handlers get a bounded grace
//! period to drain.

use std::time::Duration;

use anyhow::Result;
use axum::Router;
use axum::body::Bytes;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use serde::Deserialize;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;

use crate::broker::Registry;
use crate::core::constants::HTTP_SHUTDOWN_GRACE_SECS;
use crate::core::shutdown::ShutdownService;
use crate::protocol;

/// Build the router.
pub fn router(registry: Registry) -> Router {
    Router::new()
        .route("/ping", get(ping))
        .route("/put", post(put_message))
        .route("/stats", get(stats))
        .with_state(registry)
}

/// Serve until shutdown, then give in-flight handlers a grace period.
pub async fn serve(
    listener: TcpListener,
    registry: Registry,
    shutdown: ShutdownService,
) -> Result<()> {
    tracing::info!(addr = %listener.local_addr()?, "listening for http requests");

    let app = router(registry).layer(TraceLayer::new_for_http());
    let serve = axum::serve(listener, app).with_graceful_shutdown(shutdown.wait());
    let mut server = tokio::spawn(async move { serve.await });

    tokio::select! {
        served = &mut server => return Ok(served??),
        _ = shutdown.wait() => {}
    }

    match tokio::time::timeout(Duration::from_secs(HTTP_SHUTDOWN_GRACE_SECS), &mut server).await
    {
        Ok(served) => Ok(served??),
        Err(_) => {
            server.abort();
            tracing::warn!(
                grace_secs = HTTP_SHUTDOWN_GRACE_SECS,
                "timed out waiting for http connections to drain"
            );
            Ok(())
        }
    }
}

async fn ping() -> &'static str {
    "ok"
}

#[derive(Deserialize)]
struct PutParams {
    topic: Option<String>,
}

async fn put_message(
    State(registry): State<Registry>,
    Query(params): Query<PutParams>,
    body: Bytes,
) -> Response {
    let topic = params.topic.unwrap_or_default();
    match protocol::publish(&registry, &topic, &body).await {
        Ok(()) => (StatusCode::OK, "ok").into_response(),
        Err(e) => {
            tracing::debug!(topic = %topic, error = %e, "rejected publish");
            (StatusCode::BAD_REQUEST, e.to_string()).into_response()
        }
    }
}

async fn stats(State(registry): State<Registry>) -> Response {
    match registry.topics().await {
        Ok(names) => {
            let mut body = String::new();
            for name in names {
                body.push_str(&name);
                body.push('\n');
            }
            (StatusCode::OK, body).into_response()
        }
        Err(e) => (StatusCode::SERVICE_UNAVAILABLE, e.to_string()).into_response(),
    }
}
