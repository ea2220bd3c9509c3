//! Upstream round trip and response pipeline assembly
//!
//! One [`Forwarder`] per proxy: it owns the shared HTTP(S) client and turns
//! an inbound request into exactly one upstream request, guarded by the
//! configured timeout. On response it rewrites headers and cookies, decides
//! which body transforms apply, runs the response hook, and chains
//! `upstream body -> [decompress] -> [html rewrite] -> client` as streaming
//! adapters. Bodies are never buffered whole.

use axum::body::Body;
use bytes::Bytes;
use futures_util::stream::BoxStream;
use futures_util::{StreamExt, TryStreamExt};
use http::header::{CONTENT_ENCODING, CONTENT_LENGTH};
use http_body_util::BodyExt;
use hyper::{Request, Response};
use hyper_rustls::{HttpsConnector, HttpsConnectorBuilder};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::io;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::proxy::context::{ClientMeta, RequestContext};
use crate::proxy::cookies::rewrite_cookies;
use crate::proxy::decompress::{body_is_nonempty, content_encoding, decompress_body};
use crate::proxy::headers::{is_secure, rewrite_location};
use crate::proxy::html::{should_rewrite, HtmlRewriteStream, HtmlRewriter};
use crate::proxy::types::{ProxyConfig, ProxyError, ProxyResult};

/// Performs upstream round trips for one proxy configuration
pub struct Forwarder {
    config: Arc<ProxyConfig>,
    client: Client<HttpsConnector<HttpConnector>, Body>,
    /// Upstream base URL, precomputed once; the prefix every rewrite stage
    /// substitutes
    href: String,
}

impl Forwarder {
    pub fn new(config: ProxyConfig) -> ProxyResult<Self> {
        let href = config.href();
        let client = build_client(&config)?;
        Ok(Self {
            config: Arc::new(config),
            client,
            href,
        })
    }

    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    /// One upstream round trip: resolves to the outbound response exactly
    /// once, or to an error the caller turns into a 503 or hands to its own
    /// fallback.
    pub async fn forward(
        &self,
        request: Request<Body>,
        meta: ClientMeta,
    ) -> ProxyResult<Response<Body>> {
        let (parts, body) = request.into_parts();
        let ctx = RequestContext::new(&self.config, &parts, &meta)?;

        debug!(method = %ctx.method, uri = %ctx.uri, "forwarding request");
        let mut upstream_request = Request::builder()
            .method(ctx.method.clone())
            .uri(ctx.uri.clone())
            // the inbound body streams straight through
            .body(body)
            .map_err(ProxyError::Http)?;
        *upstream_request.headers_mut() = ctx.headers.clone();

        let response = tokio::time::timeout(self.config.timeout, self.client.request(upstream_request))
            .await
            .map_err(|_| {
                // dropping the response future aborts the in-flight request
                warn!(timeout = ?self.config.timeout, uri = %ctx.uri, "upstream timed out");
                ProxyError::UpstreamTimeout(self.config.timeout)
            })?
            .map_err(|e| {
                warn!(error = %e, uri = %ctx.uri, "upstream request failed");
                ProxyError::Upstream(e)
            })?;

        debug!(status = %response.status(), "upstream response");
        let (mut outbound, upstream_body) = response.into_parts();
        let upstream_parts = outbound.clone();

        let secure = is_secure(ctx.encrypted, &ctx.client_headers);
        rewrite_location(
            &mut outbound.headers,
            &ctx.client_headers,
            ctx.encrypted,
            &self.href,
            &ctx.base_url,
        );
        rewrite_cookies(
            &mut outbound.headers,
            secure,
            &self.config.cookie_domains,
            &self.config.cookie_paths,
        );

        let do_rewrite = !self.config.no_html_rewrite && should_rewrite(&outbound.headers);
        let encoding = content_encoding(&outbound.headers);
        let do_unzip = do_rewrite
            && encoding.is_compressed()
            && body_is_nonempty(outbound.status, &outbound.headers);
        if do_unzip {
            // the body length changes under decompression and rewriting
            outbound.headers.remove(CONTENT_ENCODING);
            outbound.headers.remove(CONTENT_LENGTH);
        }

        if let Some(hook) = &self.config.on_response {
            hook(&upstream_parts, &mut outbound);
        }

        let body = if do_rewrite {
            let stream = upstream_body
                .into_data_stream()
                .map_err(|e| io::Error::new(io::ErrorKind::Other, e));
            let stream: BoxStream<'static, io::Result<Bytes>> = if do_unzip {
                decompress_body(stream, encoding)
            } else {
                stream.boxed()
            };
            let rewriter =
                HtmlRewriter::new(ctx.doc_url.clone(), self.href.clone(), ctx.base_url.clone());
            Body::from_stream(HtmlRewriteStream::new(stream, rewriter))
        } else {
            Body::new(upstream_body)
        };

        Ok(Response::from_parts(outbound, body))
    }
}

/// Build the shared upstream client: HTTPS-capable, HTTP/1, with either the
/// platform trust roots or the configured replacement CA.
fn build_client(
    config: &ProxyConfig,
) -> ProxyResult<Client<HttpsConnector<HttpConnector>, Body>> {
    let builder = HttpsConnectorBuilder::new();
    let connector = match &config.tls_root_ca {
        Some(pem) => {
            let mut roots = rustls::RootCertStore::empty();
            for cert in rustls_pemfile::certs(&mut pem.as_slice()) {
                let cert = cert.map_err(ProxyError::Io)?;
                roots.add(cert).map_err(|e| {
                    ProxyError::InvalidUpstream(format!("invalid root certificate: {e}"))
                })?;
            }
            let tls = rustls::ClientConfig::builder()
                .with_root_certificates(roots)
                .with_no_client_auth();
            builder
                .with_tls_config(tls)
                .https_or_http()
                .enable_http1()
                .build()
        }
        None => builder
            .with_native_roots()
            .map_err(ProxyError::Io)?
            .https_or_http()
            .enable_http1()
            .build(),
    };
    Ok(Client::builder(TokioExecutor::new()).build(connector))
}
