use std::future::ready;
use std::time::Instant;

use axum::{
    body::Body,
    extract::MatchedPath,
    http::{Request, StatusCode},
    middleware::Next,
    response::IntoResponse,
    routing::get,
    Router,
};
use metrics_exporter_prometheus::{BuildError, PrometheusBuilder, PrometheusHandle};
use tokio_util::sync::CancellationToken;

use crate::health::HealthRegistry;

/// Bind a `TcpListener` on the provided bind address to serve a `Router` on it,
/// until `shutdown` is cancelled.
pub async fn serve(
    router: Router,
    bind: &str,
    shutdown: CancellationToken,
) -> Result<(), std::io::Error> {
    let listener = tokio::net::TcpListener::bind(bind).await?;

    serve_listener(router, listener, shutdown).await
}

/// Serve a `Router` on an already bound listener until `shutdown` is cancelled.
pub async fn serve_listener(
    router: Router,
    listener: tokio::net::TcpListener,
    shutdown: CancellationToken,
) -> Result<(), std::io::Error> {
    axum::serve(listener, router)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    Ok(())
}

/// Build the operational router: liveness, readiness and, when a recorder is
/// installed, the prometheus endpoint.
pub fn setup_status_router(
    service: &'static str,
    liveness: HealthRegistry,
    shutdown: CancellationToken,
    recorder_handle: Option<PrometheusHandle>,
) -> Router {
    let router = Router::new()
        .route("/", get(move || ready(service)))
        .route(
            "/_liveness",
            get(move || ready(liveness.get_status())),
        )
        .route(
            "/_readiness",
            get(move || {
                ready(match shutdown.is_cancelled() {
                    true => (StatusCode::SERVICE_UNAVAILABLE, "shutting down"),
                    false => (StatusCode::OK, "ok"),
                })
            }),
        );

    let router = match recorder_handle {
        Some(recorder_handle) => router.route(
            "/metrics",
            get(move || ready(recorder_handle.render())),
        ),
        None => router,
    };

    router.layer(axum::middleware::from_fn(track_metrics))
}

pub fn setup_metrics_recorder() -> Result<PrometheusHandle, BuildError> {
    const EXPONENTIAL_SECONDS: &[f64] = &[
        0.0005, 0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
    ];

    PrometheusBuilder::new()
        .set_buckets(EXPONENTIAL_SECONDS)?
        .install_recorder()
}

/// Middleware to record some common HTTP metrics
pub async fn track_metrics(req: Request<Body>, next: Next) -> impl IntoResponse {
    let start = Instant::now();

    let path = if let Some(matched_path) = req.extensions().get::<MatchedPath>() {
        matched_path.as_str().to_owned()
    } else {
        req.uri().path().to_owned()
    };

    let method = req.method().clone();

    let response = next.run(req).await;

    let latency = start.elapsed().as_secs_f64();
    let status = response.status().as_u16().to_string();

    let labels = [
        ("method", method.to_string()),
        ("path", path),
        ("status", status),
    ];

    metrics::counter!("http_requests_total", &labels).increment(1);
    metrics::histogram!("http_requests_duration_seconds", &labels).record(latency);

    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use http_body_util::BodyExt; // for `collect`
    use std::time::Duration;
    use tower::ServiceExt; // for `oneshot`

    async fn get(router: Router, uri: &str) -> (StatusCode, String) {
        let response = router
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let body = response.into_body().collect().await.unwrap().to_bytes();

        (status, String::from_utf8_lossy(&body).into_owned())
    }

    #[tokio::test]
    async fn test_index_names_the_service() {
        let router = setup_status_router(
            "iot test",
            HealthRegistry::new("liveness"),
            CancellationToken::new(),
            None,
        );

        assert_eq!(get(router, "/").await, (StatusCode::OK, "iot test".to_owned()));
    }

    #[tokio::test]
    async fn test_readiness_flips_on_shutdown() {
        let shutdown = CancellationToken::new();
        let router = setup_status_router(
            "iot test",
            HealthRegistry::new("liveness"),
            shutdown.clone(),
            None,
        );

        assert_eq!(get(router.clone(), "/_readiness").await.0, StatusCode::OK);
        shutdown.cancel();
        assert_eq!(
            get(router, "/_readiness").await.0,
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[tokio::test]
    async fn test_liveness_follows_registry() {
        let registry = HealthRegistry::new("liveness");
        let router = setup_status_router(
            "iot test",
            registry.clone(),
            CancellationToken::new(),
            None,
        );

        let handle = registry.register("consumer", Duration::from_secs(30));
        assert_eq!(
            get(router.clone(), "/_liveness").await.0,
            StatusCode::INTERNAL_SERVER_ERROR
        );

        handle.report_healthy();
        assert_eq!(get(router.clone(), "/_liveness").await.0, StatusCode::OK);

        assert_eq!(get(router, "/metrics").await.0, StatusCode::NOT_FOUND);
    }
}
