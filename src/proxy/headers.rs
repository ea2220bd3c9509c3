//! Location-style response-header rewriting
//!
//! Upstream servers answer with `Location` (and friends) pointing at
//! themselves. This module resolves those values against the upstream base
//! URL and swaps the upstream prefix for the address the client actually
//! talked to, so redirects keep flowing through the proxy.

use http::header::{HeaderName, HeaderValue, CONTENT_LOCATION, HOST, LOCATION};
use http::HeaderMap;
use url::Url;

/// Headers carrying upstream-relative URLs, rewritten regardless of status
/// code (non-redirect responses may legitimately carry these too).
/// See RFC 4229 for `destination` (WebDAV).
const REWRITE_HEADERS: [HeaderName; 3] = [
    LOCATION,
    CONTENT_LOCATION,
    HeaderName::from_static("destination"),
];

pub(crate) const X_FORWARDED_FOR: HeaderName = HeaderName::from_static("x-forwarded-for");
pub(crate) const X_FORWARDED_HOST: HeaderName = HeaderName::from_static("x-forwarded-host");
pub(crate) const X_FORWARDED_PROTO: HeaderName = HeaderName::from_static("x-forwarded-proto");

/// Whether the client connection should be treated as encrypted: either the
/// transport itself is, or a trusted `x-forwarded-proto` says so.
pub fn is_secure(encrypted: bool, client_headers: &HeaderMap) -> bool {
    encrypted
        || client_headers
            .get(X_FORWARDED_PROTO)
            .and_then(|v| v.to_str().ok())
            == Some("https")
}

/// The host the client addressed: `x-forwarded-host` when trusted, else the
/// `Host` header.
pub fn effective_host(client_headers: &HeaderMap) -> Option<&str> {
    client_headers
        .get(X_FORWARDED_HOST)
        .or_else(|| client_headers.get(HOST))
        .and_then(|v| v.to_str().ok())
}

/// Rewrite `location`/`content-location`/`destination` on a response.
///
/// Each value is resolved against the upstream `href` (undoing relative
/// references), then an exact `href` prefix is replaced with the
/// client-facing base: `scheme://host` + `base_url` when the client host is
/// known, or `base_url` alone (yielding client-relative URLs) when it is
/// not. Values pointing at a different origin pass through resolved but
/// otherwise untouched.
pub fn rewrite_location(
    headers: &mut HeaderMap,
    client_headers: &HeaderMap,
    encrypted: bool,
    href: &str,
    base_url: &str,
) {
    let proto = if is_secure(encrypted, client_headers) {
        "https:"
    } else {
        "http:"
    };
    let base = match effective_host(client_headers) {
        Some(host) => format!("{proto}//{host}{base_url}"),
        None => base_url.to_string(),
    };

    for field in REWRITE_HEADERS {
        let Some(value) = headers.get(&field).and_then(|v| v.to_str().ok()) else {
            continue;
        };
        if let Some(rewritten) = rewrite_url(value, href, &base) {
            if let Ok(value) = HeaderValue::from_str(&rewritten) {
                headers.insert(field, value);
            }
        }
    }
}

/// Resolve `value` against `href` and substitute an exact `href` prefix with
/// `base`. Returns `None` when `href` does not parse or `value` cannot be
/// resolved (the header is then left alone).
fn rewrite_url(value: &str, href: &str, base: &str) -> Option<String> {
    let resolved = Url::parse(href).ok()?.join(value).ok()?;
    let resolved = resolved.as_str();
    match resolved.strip_prefix(href) {
        Some(rest) => Some(format!("{base}{rest}")),
        None => Some(resolved.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client_headers(host: Option<&str>, forwarded: Option<(&str, &str)>) -> HeaderMap {
        let mut headers = HeaderMap::new();
        if let Some(host) = host {
            headers.insert(HOST, host.parse().unwrap());
        }
        if let Some((fwd_host, fwd_proto)) = forwarded {
            headers.insert(X_FORWARDED_HOST, fwd_host.parse().unwrap());
            headers.insert(X_FORWARDED_PROTO, fwd_proto.parse().unwrap());
        }
        headers
    }

    fn response_headers(field: HeaderName, value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(field, value.parse().unwrap());
        headers
    }

    #[test]
    fn replaces_location_header() {
        let href = "http://proxy.my/proxied";
        let client = client_headers(Some("server.my"), None);
        let mut headers = response_headers(LOCATION, "http://proxy.my/proxied/path");
        rewrite_location(&mut headers, &client, false, href, "");
        assert_eq!(headers[LOCATION], "http://server.my/path");
    }

    #[test]
    fn replaces_content_location_without_host() {
        let href = "http://proxy.my/proxied";
        let client = HeaderMap::new();
        let mut headers = response_headers(CONTENT_LOCATION, "http://proxy.my/proxied/path");
        rewrite_location(&mut headers, &client, false, href, "");
        // no client host known, so the result is client-relative
        assert_eq!(headers[CONTENT_LOCATION], "/path");
    }

    #[test]
    fn replaces_location_with_base_url_over_tls() {
        let href = "http://proxy.my/proxied";
        let client = client_headers(Some("server.my"), None);
        let mut headers = response_headers(LOCATION, "http://proxy.my/proxied/path");
        rewrite_location(&mut headers, &client, true, href, "/api");
        assert_eq!(headers[LOCATION], "https://server.my/api/path");
    }

    #[test]
    fn resolves_relative_location() {
        let href = "http://proxy.my/proxied";
        let client = client_headers(Some("server.my"), None);
        let mut headers = response_headers(LOCATION, "../proxied/path");
        rewrite_location(&mut headers, &client, true, href, "/api");
        assert_eq!(headers[LOCATION], "https://server.my/api/path");
    }

    #[test]
    fn keeps_location_when_upstream_switches_origin() {
        let href = "http://proxy.my/proxied";
        let client = client_headers(Some("server.my"), None);
        let mut headers = response_headers(LOCATION, "https://proxy.my/proxied/path");
        rewrite_location(&mut headers, &client, true, href, "/api");
        assert_eq!(headers[LOCATION], "https://proxy.my/proxied/path");
    }

    #[test]
    fn forwarded_headers_win_for_host_and_proto() {
        let href = "http://proxy.my/proxied";
        let client = client_headers(Some("ignored.my"), Some(("server.my", "https")));
        let mut headers = response_headers(LOCATION, "http://proxy.my/proxied/path");
        rewrite_location(&mut headers, &client, false, href, "");
        assert_eq!(headers[LOCATION], "https://server.my/path");
    }

    #[test]
    fn destination_header_is_rewritten() {
        let href = "http://proxy.my/dav";
        let client = client_headers(Some("server.my"), None);
        let mut headers = response_headers(
            HeaderName::from_static("destination"),
            "http://proxy.my/dav/file.txt",
        );
        rewrite_location(&mut headers, &client, false, href, "");
        assert_eq!(headers["destination"], "http://server.my/file.txt");
    }
}
