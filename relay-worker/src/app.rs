use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use axum::http::StatusCode;
use axum::{routing, Router};
use health::HealthRegistry;

/// Probe routes. `/_readiness` succeeds while the consumer group is running.
pub fn app(liveness: HealthRegistry, ready: Arc<AtomicBool>) -> Router {
    Router::new()
        .route("/", routing::get(index))
        .route(
            "/_readiness",
            routing::get(move || {
                let ready = ready.load(Ordering::SeqCst);
                async move {
                    if ready {
                        (StatusCode::OK, "ready")
                    } else {
                        (StatusCode::SERVICE_UNAVAILABLE, "not ready")
                    }
                }
            }),
        )
        .route(
            "/_liveness",
            routing::get(move || std::future::ready(liveness.get_status())),
        )
}

pub async fn index() -> &'static str {
    "relay worker"
}
