//! Facade - a non-transparent HTTP(S) reverse proxy
//!
//! Forwards inbound requests to a configured upstream and streams the
//! response back while rewriting redirect targets, cookies, and embedded
//! HTML links, so the client perceives the proxy as the origin.

pub mod config;
pub mod error;
pub mod proxy;

pub use error::{Error, Result};
pub use proxy::{ClientMeta, Proxy, ProxyConfig, ProxyError, ProxyResult, RewriteRule, Upstream};
