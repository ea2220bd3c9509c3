//! Set-Cookie Domain/Path rewriting
//!
//! Rewrites cookie attributes with ordered match/replacement rules so that
//! cookies scoped to the upstream stick to the proxy's own name and mount
//! path. Attribute splicing is regex-based on the raw cookie string, which
//! keeps the original attribute spelling (`path=` vs `Path=`) and everything
//! not matched by a rule byte-for-byte intact.

use http::header::SET_COOKIE;
use http::{HeaderMap, HeaderValue};
use regex::Regex;
use std::sync::LazyLock;

use crate::proxy::types::RewriteRule;

static DOMAIN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)(Domain=)([^;]*?)(;|$)").expect("valid domain regex"));
static PATH: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)(Path=)([^;]*?)(;|$)").expect("valid path regex"));
static SECURE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i);\s*(Secure)").expect("valid secure regex"));

/// Rewrite every `set-cookie` value on the response. A no-op unless at least
/// one rule list is non-empty.
///
/// Per cookie: Domain rules are scanned first (first match wins); Path rules
/// run only when no Domain attribute gated them out (a cookie whose Domain
/// matched no configured rule is left entirely alone). When a rewrite
/// happened, the Secure flag is aligned with the client connection: stripped
/// over plaintext, added over TLS.
pub fn rewrite_cookies(
    headers: &mut HeaderMap,
    secure: bool,
    domains: &[RewriteRule],
    paths: &[RewriteRule],
) {
    if domains.is_empty() && paths.is_empty() {
        return;
    }

    let cookies: Vec<HeaderValue> = headers.get_all(SET_COOKIE).iter().cloned().collect();
    if cookies.is_empty() {
        return;
    }

    headers.remove(SET_COOKIE);
    for value in cookies {
        let rewritten = match value.to_str() {
            Ok(cookie) => rewrite_cookie(cookie, secure, domains, paths)
                .and_then(|c| HeaderValue::from_str(&c).ok())
                .unwrap_or(value),
            // opaque bytes pass through untouched
            Err(_) => value,
        };
        headers.append(SET_COOKIE, rewritten);
    }
}

/// Rewrite a single cookie string; `None` means "leave the original alone".
fn rewrite_cookie(
    cookie: &str,
    secure: bool,
    domains: &[RewriteRule],
    paths: &[RewriteRule],
) -> Option<String> {
    let has_domain = !domains.is_empty() && DOMAIN.is_match(cookie);
    let mut domain_rewritten = false;
    let mut path_rewritten = false;

    let mut cookie = cookie.to_string();
    if !domains.is_empty() {
        cookie = DOMAIN
            .replace(&cookie, |caps: &regex::Captures<'_>| {
                match apply_rules(domains, &caps[2]) {
                    Some(domain) => {
                        domain_rewritten = true;
                        format!("{}{}{}", &caps[1], domain, &caps[3])
                    }
                    None => caps[0].to_string(),
                }
            })
            .into_owned();
    }
    if !paths.is_empty() && (!has_domain || domain_rewritten) {
        cookie = PATH
            .replace(&cookie, |caps: &regex::Captures<'_>| {
                match apply_rules(paths, &caps[2]) {
                    Some(path) => {
                        path_rewritten = true;
                        format!("{}{}{}", &caps[1], path, &caps[3])
                    }
                    None => caps[0].to_string(),
                }
            })
            .into_owned();
    }

    if !domain_rewritten && !path_rewritten {
        return None;
    }

    // only cookies a rule actually touched get their Secure flag aligned
    if !secure {
        cookie = SECURE.replace(&cookie, "").into_owned();
    } else if !SECURE.is_match(&cookie) {
        cookie.push_str("; Secure");
    }
    Some(cookie)
}

fn apply_rules(rules: &[RewriteRule], value: &str) -> Option<String> {
    rules.iter().find_map(|rule| rule.apply(value))
}
