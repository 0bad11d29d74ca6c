//! HTTP listeners for the admission check service and the admin surface.

use axum::extract::{Path, Request, State};
use axum::http::{HeaderName, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::routing::{any, get};
use axum::{Json, Router};
use serde::Serialize;
use std::future::Future;
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use super::middleware::{RateLimit, RequestParts};
use super::response::{denied, write_headers};
use crate::error::Result;

/// Original request URI, as forwarded by the fronting proxy.
pub const X_ORIGINAL_URI: HeaderName = HeaderName::from_static("x-original-uri");
/// Original request method, as forwarded by the fronting proxy.
pub const X_ORIGINAL_METHOD: HeaderName = HeaderName::from_static("x-original-method");

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub service: &'static str,
    pub version: &'static str,
}

/// Routes: `GET /health` and `ANY /check/:action`.
///
/// A proxy calls `/check/:action` with the original request's headers
/// before forwarding it; 200 means forward, 429 is returned to the client.
pub fn check_router(limit: RateLimit) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/check/:action", any(check))
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
        .with_state(limit)
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy",
        service: env!("CARGO_PKG_NAME"),
        version: env!("CARGO_PKG_VERSION"),
    })
}

async fn check(
    State(limit): State<RateLimit>,
    Path(action): Path<String>,
    request: Request,
) -> Response {
    let admission = {
        let original_uri = request
            .headers()
            .get(X_ORIGINAL_URI)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<Uri>().ok());
        let original_method = request
            .headers()
            .get(X_ORIGINAL_METHOD)
            .and_then(|v| Method::from_bytes(v.as_bytes()).ok());

        let mut parts = RequestParts::from_request(&request);
        if let Some(uri) = &original_uri {
            parts.uri = uri;
        }
        if let Some(method) = &original_method {
            parts.method = method;
        }
        limit.admission_for(action, &parts)
    };

    let decision = limit.admit(&admission).await;
    if !decision.allowed {
        return denied(&decision, admission.is_api);
    }

    let mut response = (StatusCode::OK, Json(&decision)).into_response();
    write_headers(response.headers_mut(), &decision);
    response
}

/// A bound HTTP listener serving one router.
pub struct HttpServer {
    name: &'static str,
    listener: TcpListener,
    router: Router,
}

impl HttpServer {
    /// Bind `addr` for `router`. `name` labels the listener in logs.
    pub async fn bind(name: &'static str, addr: SocketAddr, router: Router) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self {
            name,
            listener,
            router,
        })
    }

    /// The address actually bound, useful when binding port 0.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Serve until `signal` resolves, then drain in-flight requests.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let addr = self.local_addr()?;
        info!(server = self.name, addr = %addr, "Starting HTTP server");

        axum::serve(
            self.listener,
            self.router
                .into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(signal)
        .await
        .map_err(|e| {
            error!(server = self.name, error = %e, "HTTP server failed");
            e
        })?;

        info!(server = self.name, "HTTP server stopped");
        Ok(())
    }
}
