//! Path composition and X-Forwarded-For helpers
//!
//! Pure functions shared by the request-context builder. `join_path`
//! concatenates the upstream base path with an inbound path+query without
//! producing double slashes, while keeping a query string that is attached
//! directly to the mount point (`/?q=1`) intact.

/// Join the upstream base path with an inbound path (query included).
///
/// The leading slash of `p2` is dropped when `p2` is exactly `/`, when it
/// starts with `/?`, or when `p1` already ends with a slash. An empty result
/// normalizes to `/`.
pub fn join_path(p1: &str, p2: &str) -> String {
    let p2 = if p2 == "/" || p2.starts_with("/?") || (p1.ends_with('/') && p2.starts_with('/')) {
        &p2[1..]
    } else {
        p2
    };
    let joined = format!("{p1}{p2}");
    if joined.is_empty() {
        "/".to_string()
    } else {
        joined
    }
}

/// Strip trailing slashes from a path
pub fn trim_path(p: &str) -> &str {
    p.trim_end_matches('/')
}

/// Compose an `X-Forwarded-For` value from the inbound header and the peer
/// address: entries are trimmed, empty ones dropped, and the peer appended
/// last.
pub fn forwarded_for(existing: Option<&str>, peer: Option<&str>) -> String {
    existing
        .unwrap_or("")
        .split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .chain(peer)
        .collect::<Vec<_>>()
        .join(", ")
}
