//! Per-request merge of proxy configuration and inbound request
//!
//! A [`RequestContext`] is built once per inbound request and owns everything
//! the forwarder and the rewrite stages need: the composed upstream URI, the
//! merged outbound headers, and the client-side view (host, forwarded
//! headers, encryption) that header and cookie rewriting read from. It is
//! dropped when the request ends and never shared.

use axum::extract::OriginalUri;
use http::header::{HeaderValue, CONNECTION, HOST, TRANSFER_ENCODING};
use http::{HeaderMap, Method, Uri};
use std::net::IpAddr;
use url::Url;

use crate::proxy::headers::{X_FORWARDED_FOR, X_FORWARDED_HOST, X_FORWARDED_PROTO};
use crate::proxy::path::{forwarded_for, join_path};
use crate::proxy::types::{ProxyConfig, ProxyError, ProxyResult};

/// Connection facts the routing layer knows about the client
#[derive(Debug, Clone, Copy, Default)]
pub struct ClientMeta {
    /// Peer address, appended to `X-Forwarded-For`
    pub remote_addr: Option<IpAddr>,
    /// Whether the client connection is TLS-terminated here
    pub encrypted: bool,
}

impl ClientMeta {
    pub fn new(remote_addr: Option<IpAddr>, encrypted: bool) -> Self {
        Self {
            remote_addr,
            encrypted,
        }
    }
}

/// Everything derived from one inbound request
#[derive(Debug)]
pub struct RequestContext {
    /// Method forwarded upstream (the inbound method)
    pub method: Method,
    /// Fully composed upstream URI (scheme, authority, path, query)
    pub uri: Uri,
    /// Outbound request headers
    pub headers: HeaderMap,
    /// Inbound headers after the forwarded-header trust gate; location and
    /// cookie rewriting read the client's host/proto from here
    pub client_headers: HeaderMap,
    /// Effective public mount path for this request
    pub base_url: String,
    /// Whether the client connection is encrypted
    pub encrypted: bool,
    /// Upstream URL of the requested document, query stripped; the HTML
    /// rewrite stage resolves relative links against this
    pub doc_url: Url,
}

impl RequestContext {
    pub fn new(
        config: &ProxyConfig,
        parts: &http::request::Parts,
        meta: &ClientMeta,
    ) -> ProxyResult<Self> {
        let mut client_headers = parts.headers.clone();
        if !config.is_forwarded {
            // do not let clients spoof their way into the rewrite bases
            client_headers.remove(X_FORWARDED_HOST);
            client_headers.remove(X_FORWARDED_PROTO);
        }

        // a routing-layer mount prefix wins over the configured one
        let router_prefix = parts
            .extensions
            .get::<OriginalUri>()
            .and_then(|orig| mount_prefix(orig.0.path(), parts.uri.path()))
            .filter(|prefix| !prefix.is_empty());
        let routed = router_prefix.is_some();
        let base_url = router_prefix.unwrap_or_else(|| config.base_url.clone());

        let mut inbound_path = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        // mounted without a router that strips the prefix for us
        if !routed && !base_url.is_empty() {
            if let Some(stripped) = inbound_path.strip_prefix(&base_url) {
                inbound_path = stripped;
            }
        }
        let upstream_path = join_path(&config.upstream.path, inbound_path);

        let mut headers = client_headers.clone();
        // hyper renegotiates connection management and framing itself
        headers.remove(CONNECTION);
        headers.remove(TRANSFER_ENCODING);
        for (name, value) in &config.headers {
            headers.insert(name, value.clone());
        }
        if !config.preserve_host {
            headers.insert(
                HOST,
                HeaderValue::from_str(&config.upstream.authority()).map_err(http::Error::from)?,
            );
        }
        if !config.no_x_forwarded_for {
            let existing = client_headers
                .get(X_FORWARDED_FOR)
                .and_then(|v| v.to_str().ok());
            let peer = meta.remote_addr.map(|ip| ip.to_string());
            let value = forwarded_for(existing, peer.as_deref());
            if !value.is_empty() {
                headers.insert(
                    X_FORWARDED_FOR,
                    HeaderValue::from_str(&value).map_err(http::Error::from)?,
                );
            }
        }

        let uri = Uri::builder()
            .scheme(config.upstream.scheme.clone())
            .authority(config.upstream.authority())
            .path_and_query(upstream_path.clone())
            .build()
            .map_err(ProxyError::Http)?;

        let path_only = upstream_path
            .split_once('?')
            .map_or(upstream_path.as_str(), |(path, _)| path);
        let doc_url = Url::parse(&format!("{}{}", config.upstream.origin(), path_only))
            .map_err(|e| ProxyError::InvalidUpstream(e.to_string()))?;

        Ok(Self {
            method: parts.method.clone(),
            uri,
            headers,
            client_headers,
            base_url,
            encrypted: meta.encrypted,
            doc_url,
        })
    }
}

/// The mount prefix: the original path minus the (already stripped) inbound
/// path suffix.
fn mount_prefix(original_path: &str, inbound_path: &str) -> Option<String> {
    if inbound_path == "/" && !original_path.ends_with('/') {
        return Some(original_path.to_string());
    }
    original_path
        .strip_suffix(inbound_path)
        .map(|prefix| prefix.to_string())
}
