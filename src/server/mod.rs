//! HTTP surfaces: the video server (WebSocket MSE + HLS static files) and
//! the control API, both axum routers behind shared CORS/trace layers.

pub mod api;
pub mod video;
pub mod ws;

use axum::http::{HeaderName, HeaderValue, Method};
use axum::Router;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::config::CorsConfiguration;
use crate::error::Result;

/// Translate the CORS section of the configuration into a layer. A `*`
/// origin (or an empty list) allows any origin; credentials are only
/// honored with explicit origins.
pub fn cors_layer(config: &CorsConfiguration) -> CorsLayer {
    let wildcard = config.allow_origins.is_empty() || config.allow_origins.iter().any(|o| o == "*");
    let mut layer = CorsLayer::new();

    if wildcard {
        layer = layer.allow_origin(Any);
    } else {
        let origins: Vec<HeaderValue> = config
            .allow_origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();
        layer = layer.allow_origin(AllowOrigin::list(origins));
    }
    if config.allow_methods.is_empty() {
        layer = layer.allow_methods(Any);
    } else {
        let methods: Vec<Method> = config
            .allow_methods
            .iter()
            .filter_map(|m| m.parse().ok())
            .collect();
        layer = layer.allow_methods(methods);
    }
    if config.allow_headers.is_empty() {
        layer = layer.allow_headers(Any);
    } else {
        let headers: Vec<HeaderName> = config
            .allow_headers
            .iter()
            .filter_map(|h| h.parse().ok())
            .collect();
        layer = layer.allow_headers(headers);
    }
    if !config.expose_headers.is_empty() {
        let headers: Vec<HeaderName> = config
            .expose_headers
            .iter()
            .filter_map(|h| h.parse().ok())
            .collect();
        layer = layer.expose_headers(headers);
    }
    if config.allow_credentials && !wildcard {
        layer = layer.allow_credentials(true);
    }
    layer
}

/// Bind and serve a router until the token is cancelled.
pub async fn serve(addr: String, router: Router, cancel: CancellationToken) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!(addr = %addr, "http server listening");
    let router = router.layer(TraceLayer::new_for_http());
    axum::serve(listener, router)
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await?;
    Ok(())
}
