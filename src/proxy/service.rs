//! Main proxy entry point and axum integration
//!
//! A [`Proxy`] wraps one upstream configuration. Mount it as a whole-router
//! fallback (`proxy.into_router()`), nest it under a path prefix
//! (`Router::new().nest_service("/api", proxy.into_router())`), or call
//! [`Proxy::handle`] directly from a host that wants to see errors itself
//! (the `next(err)` style): `handle` returns the error instead of
//! synthesizing a response, so the caller decides what the client sees.
//!
//! ## Service Lifecycle
//!
//! ```rust,ignore
//! use facade::{Proxy, ProxyConfig};
//!
//! let proxy = Proxy::new("http://localhost:4000/")?;
//! let app = proxy.into_router();
//!
//! let listener = tokio::net::TcpListener::bind("0.0.0.0:8080").await?;
//! axum::serve(
//!     listener,
//!     app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
//! )
//! .await?;
//! ```

use axum::body::Body;
use axum::extract::{ConnectInfo, Request, State};
use axum::response::{IntoResponse, Response};
use axum::Router;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::error;

use crate::proxy::context::ClientMeta;
use crate::proxy::forward::Forwarder;
use crate::proxy::types::{ProxyConfig, ProxyError, ProxyResult};

/// A configured reverse proxy, cheap to clone and share
#[derive(Clone)]
pub struct Proxy {
    forwarder: Arc<Forwarder>,
}

impl Proxy {
    /// Proxy for a URL-string target with default options
    pub fn new(url: &str) -> ProxyResult<Self> {
        Self::from_config(ProxyConfig::new(url)?)
    }

    /// Proxy from a full configuration
    pub fn from_config(config: ProxyConfig) -> ProxyResult<Self> {
        Ok(Self {
            forwarder: Arc::new(Forwarder::new(config)?),
        })
    }

    pub fn config(&self) -> &ProxyConfig {
        self.forwarder.config()
    }

    /// One round trip. The error is returned, not rendered, so callers can
    /// install their own fallback handling; the axum integration below is
    /// the no-fallback path.
    pub async fn handle(
        &self,
        request: Request<Body>,
        meta: ClientMeta,
    ) -> ProxyResult<Response<Body>> {
        self.forwarder.forward(request, meta).await
    }

    /// An axum router forwarding every request to the upstream.
    ///
    /// Serve it with `into_make_service_with_connect_info::<SocketAddr>()`
    /// so the peer address reaches `X-Forwarded-For`. The axum integration
    /// treats the client connection as plaintext; a TLS-terminating layer in
    /// front should announce itself with `x-forwarded-proto` and the
    /// `is_forwarded` option.
    pub fn into_router(self) -> Router {
        Router::new()
            .fallback(proxy_handler)
            .with_state(self)
            .layer(TraceLayer::new_for_http())
    }
}

async fn proxy_handler(
    State(proxy): State<Proxy>,
    request: Request<Body>,
) -> Result<Response<Body>, ProxyError> {
    let remote_addr = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip());
    proxy
        .handle(request, ClientMeta::new(remote_addr, false))
        .await
}

/// The no-fallback error path: a bare status, no body.
impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        error!(error = %self, status = %self.status_code(), "proxy request failed");
        self.status_code().into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;
    use http::StatusCode;
    use std::time::Duration;
    use tower::ServiceExt;

    #[test]
    fn proxy_from_url() {
        let proxy = Proxy::new("http://localhost:4000/base").unwrap();
        assert_eq!(proxy.config().upstream.port, Some(4000));
        assert_eq!(proxy.config().upstream.path, "/base");
    }

    #[tokio::test]
    async fn unreachable_upstream_yields_bare_503() {
        // nothing listens on port 9; connection is refused immediately
        let mut config = ProxyConfig::new("http://127.0.0.1:9/").unwrap();
        config.timeout = Duration::from_secs(2);
        let app = Proxy::from_config(config).unwrap().into_router();

        let response = app
            .oneshot(
                http::Request::builder()
                    .uri("/anything")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert!(body.is_empty());
    }
}
