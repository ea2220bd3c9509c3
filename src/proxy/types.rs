//! Type definitions for the proxy module

use http::uri::Scheme;
use http::{HeaderMap, Method, StatusCode};
use regex::Regex;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use url::Url;

use crate::proxy::path::trim_path;

/// Default upstream timeout in milliseconds
pub const DEFAULT_TIMEOUT_MS: u64 = 5000;

/// Hook invoked with the upstream response parts and the outbound response
/// parts after header/cookie rewriting but before the response is returned.
pub type OnResponseFn = dyn Fn(&http::response::Parts, &mut http::response::Parts) + Send + Sync;

/// The upstream target the proxy forwards to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Upstream {
    /// `http` or `https`
    pub scheme: Scheme,
    /// Upstream host name or address
    pub host: String,
    /// Explicit port; `None` means the scheme default
    pub port: Option<u16>,
    /// Base path prepended to every forwarded request path
    pub path: String,
}

impl Upstream {
    /// Parse an upstream target from a URL string
    pub fn from_url(url: &str) -> ProxyResult<Self> {
        let parsed = Url::parse(url)
            .map_err(|e| ProxyError::InvalidUpstream(format!("{url}: {e}")))?;
        let scheme = match parsed.scheme() {
            "http" => Scheme::HTTP,
            "https" => Scheme::HTTPS,
            other => {
                return Err(ProxyError::InvalidUpstream(format!(
                    "unsupported scheme '{other}'"
                )))
            }
        };
        let host = parsed
            .host_str()
            .ok_or_else(|| ProxyError::InvalidUpstream(format!("{url}: missing host")))?
            .to_string();
        Ok(Self {
            scheme,
            host,
            port: parsed.port(),
            path: parsed.path().to_string(),
        })
    }

    /// `host` or `host:port` when an explicit port is set
    pub fn authority(&self) -> String {
        match self.port {
            Some(port) => format!("{}:{port}", self.host),
            None => self.host.clone(),
        }
    }

    /// `scheme://authority`
    pub fn origin(&self) -> String {
        format!("{}://{}", self.scheme, self.authority())
    }

    /// The upstream base URL with trailing slashes trimmed from the path.
    ///
    /// This is the prefix the header and HTML rewrite stages substitute with
    /// the proxy's own base.
    pub fn href(&self) -> String {
        format!("{}{}", self.origin(), trim_path(&self.path))
    }

    pub fn is_https(&self) -> bool {
        self.scheme == Scheme::HTTPS
    }
}

impl Default for Upstream {
    fn default() -> Self {
        Self {
            scheme: Scheme::HTTP,
            host: "localhost".to_string(),
            port: None,
            path: "/".to_string(),
        }
    }
}

/// An ordered match/replacement rule for cookie Domain/Path rewriting.
///
/// Rules are scanned in order; the first one that matches wins. A pattern
/// must match the full attribute value and may reference capture groups in
/// its replacement template (`$1`, `$2`, ..., `$$` for a literal dollar).
#[derive(Debug, Clone)]
pub enum RewriteRule {
    /// Full-string equality match with a literal replacement
    Exact(String, String),
    /// Full-string pattern match with a capture-group template replacement
    Pattern(Regex, String),
}

impl RewriteRule {
    pub fn exact(matcher: impl Into<String>, replacement: impl Into<String>) -> Self {
        Self::Exact(matcher.into(), replacement.into())
    }

    pub fn pattern(
        pattern: &str,
        template: impl Into<String>,
    ) -> Result<Self, regex::Error> {
        Ok(Self::Pattern(Regex::new(pattern)?, template.into()))
    }

    /// Apply this rule to `value`, returning the replacement on a match.
    pub fn apply(&self, value: &str) -> Option<String> {
        match self {
            Self::Exact(matcher, replacement) => {
                (value == matcher).then(|| replacement.clone())
            }
            Self::Pattern(pattern, template) => {
                let caps = pattern.captures(value)?;
                let whole = caps.get(0).expect("capture group 0 always present");
                if whole.start() != 0 || whole.end() != value.len() {
                    return None;
                }
                Some(expand_template(&caps, template))
            }
        }
    }
}

/// Expand `$n` capture references in a replacement template.
///
/// `$nn` is preferred over `$n` when the two-digit group exists; a reference
/// to a group that did not participate expands to the empty string; `$$`
/// yields a literal `$`.
fn expand_template(caps: &regex::Captures<'_>, template: &str) -> String {
    let mut out = String::with_capacity(template.len());
    let mut chars = template.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '$' {
            out.push(c);
            continue;
        }
        match chars.peek().copied() {
            Some('$') => {
                chars.next();
                out.push('$');
            }
            Some(d) if d.is_ascii_digit() => {
                chars.next();
                let mut group = d as usize - '0' as usize;
                if let Some(d2) = chars.peek().copied().filter(char::is_ascii_digit) {
                    let two = group * 10 + (d2 as usize - '0' as usize);
                    if two < caps.len() {
                        group = two;
                        chars.next();
                    }
                }
                if let Some(m) = caps.get(group) {
                    out.push_str(m.as_str());
                }
            }
            _ => out.push('$'),
        }
    }
    out
}

/// Proxy configuration, immutable after construction and shared across
/// requests behind an `Arc`.
#[derive(Clone)]
pub struct ProxyConfig {
    /// Upstream target
    pub upstream: Upstream,
    /// Default method; overridden per-request by the inbound method
    pub method: Method,
    /// Upstream response timeout
    pub timeout: Duration,
    /// Public path prefix the proxy is mounted at; a routing-layer-supplied
    /// prefix takes precedence at request time
    pub base_url: String,
    /// Forward the inbound Host header instead of the upstream authority
    pub preserve_host: bool,
    /// Trust inbound `x-forwarded-host`/`x-forwarded-proto` headers
    pub is_forwarded: bool,
    /// Do not set an `X-Forwarded-For` header
    pub no_x_forwarded_for: bool,
    /// Do not rewrite HTML response bodies
    pub no_html_rewrite: bool,
    /// Ordered rules for `Set-Cookie` Domain rewriting
    pub cookie_domains: Vec<RewriteRule>,
    /// Ordered rules for `Set-Cookie` Path rewriting
    pub cookie_paths: Vec<RewriteRule>,
    /// Extra headers set on the upstream request, overriding inbound ones
    pub headers: HeaderMap,
    /// PEM-encoded root certificates trusted for the upstream TLS connection
    /// (replaces the default roots)
    pub tls_root_ca: Option<Vec<u8>>,
    /// Response hook, invoked once per upstream response
    pub on_response: Option<Arc<OnResponseFn>>,
}

impl ProxyConfig {
    /// Configuration for a URL-string target with default options
    pub fn new(url: &str) -> ProxyResult<Self> {
        Ok(Self {
            upstream: Upstream::from_url(url)?,
            ..Self::default()
        })
    }

    /// The upstream base URL used as the rewrite prefix
    pub fn href(&self) -> String {
        self.upstream.href()
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            upstream: Upstream::default(),
            method: Method::GET,
            timeout: Duration::from_millis(DEFAULT_TIMEOUT_MS),
            base_url: String::new(),
            preserve_host: false,
            is_forwarded: false,
            no_x_forwarded_for: false,
            no_html_rewrite: false,
            cookie_domains: Vec::new(),
            cookie_paths: Vec::new(),
            headers: HeaderMap::new(),
            tls_root_ca: None,
            on_response: None,
        }
    }
}

impl fmt::Debug for ProxyConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProxyConfig")
            .field("upstream", &self.upstream)
            .field("method", &self.method)
            .field("timeout", &self.timeout)
            .field("base_url", &self.base_url)
            .field("preserve_host", &self.preserve_host)
            .field("is_forwarded", &self.is_forwarded)
            .field("no_x_forwarded_for", &self.no_x_forwarded_for)
            .field("no_html_rewrite", &self.no_html_rewrite)
            .field("cookie_domains", &self.cookie_domains)
            .field("cookie_paths", &self.cookie_paths)
            .field("headers", &self.headers)
            .field("tls_root_ca", &self.tls_root_ca.as_ref().map(|_| "<pem>"))
            .field("on_response", &self.on_response.as_ref().map(|_| "<hook>"))
            .finish()
    }
}

/// Errors that can occur in the proxy
#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("upstream timeout after {0:?}")]
    UpstreamTimeout(Duration),

    #[error("upstream request failed: {0}")]
    Upstream(#[from] hyper_util::client::legacy::Error),

    #[error("inbound stream error: {0}")]
    InboundStream(#[from] axum::Error),

    #[error("decode error: {0}")]
    Decode(#[source] std::io::Error),

    #[error("markup parse error: {0}")]
    Parse(String),

    #[error("invalid upstream target: {0}")]
    InvalidUpstream(String),

    #[error("HTTP error: {0}")]
    Http(#[from] http::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProxyError {
    /// The status synthesized when the error reaches the client.
    ///
    /// Everything that can fail on the request path maps to 503; only a
    /// misconfigured upstream target (a construction-time error) is an
    /// internal error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidUpstream(_) => StatusCode::INTERNAL_SERVER_ERROR,
            _ => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

/// Result type for proxy operations
pub type ProxyResult<T> = Result<T, ProxyError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upstream_from_url() {
        let upstream = Upstream::from_url("http://localhost:3000/test").unwrap();
        assert_eq!(upstream.scheme, Scheme::HTTP);
        assert_eq!(upstream.host, "localhost");
        assert_eq!(upstream.port, Some(3000));
        assert_eq!(upstream.path, "/test");
        assert_eq!(upstream.authority(), "localhost:3000");
        assert_eq!(upstream.href(), "http://localhost:3000/test");
    }

    #[test]
    fn upstream_default_port_is_elided() {
        let upstream = Upstream::from_url("https://proxy.my/").unwrap();
        assert_eq!(upstream.port, None);
        assert_eq!(upstream.authority(), "proxy.my");
        // a bare "/" path is trimmed from the href
        assert_eq!(upstream.href(), "https://proxy.my");
    }

    #[test]
    fn upstream_rejects_other_schemes() {
        assert!(matches!(
            Upstream::from_url("ftp://example.com/"),
            Err(ProxyError::InvalidUpstream(_))
        ));
        assert!(matches!(
            Upstream::from_url("not a url"),
            Err(ProxyError::InvalidUpstream(_))
        ));
    }

    #[test]
    fn exact_rule_requires_full_equality() {
        let rule = RewriteRule::exact("/", "/api");
        assert_eq!(rule.apply("/").as_deref(), Some("/api"));
        assert_eq!(rule.apply("/path"), None);
    }

    #[test]
    fn pattern_rule_expands_captures() {
        let rule = RewriteRule::pattern(r"^(\w+\.)?proxy(\.my)", "$1server$2").unwrap();
        assert_eq!(rule.apply("proxy.my").as_deref(), Some("server.my"));
        assert_eq!(rule.apply("www.proxy.my").as_deref(), Some("www.server.my"));
        assert_eq!(rule.apply("api.proxy.my").as_deref(), Some("api.server.my"));
    }

    #[test]
    fn pattern_rule_requires_full_match() {
        let rule = RewriteRule::pattern(r"^/proxied(/.*)$", "$1").unwrap();
        assert_eq!(rule.apply("/proxied/path/to").as_deref(), Some("/path/to"));
        assert_eq!(rule.apply("/proxied"), None);
        // the pattern matches a prefix only, so the rule does not apply
        let prefix = RewriteRule::pattern(r"^/api", "/").unwrap();
        assert_eq!(prefix.apply("/api/deep"), None);
    }

    #[test]
    fn template_dollar_escapes() {
        let rule = RewriteRule::pattern(r"^(\d+)$", "$$$1").unwrap();
        assert_eq!(rule.apply("42").as_deref(), Some("$42"));
    }

    #[test]
    fn default_config_matches_documented_defaults() {
        let config = ProxyConfig::default();
        assert_eq!(config.method, Method::GET);
        assert_eq!(config.timeout, Duration::from_millis(5000));
        assert_eq!(config.base_url, "");
        assert!(!config.preserve_host);
        assert!(!config.is_forwarded);
        assert!(!config.no_x_forwarded_for);
        assert!(!config.no_html_rewrite);
        assert!(config.cookie_domains.is_empty());
        assert!(config.cookie_paths.is_empty());
        assert!(config.on_response.is_none());
    }
}
