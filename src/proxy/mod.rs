//! Non-transparent reverse-proxy engine
//!
//! Forwards inbound requests to a single configured upstream and rewrites
//! everything that encodes the upstream's identity on the way back:
//! - `Location`/`Content-Location`/`Destination` headers ([`headers`])
//! - `Set-Cookie` Domain/Path attributes ([`cookies`])
//! - `href`/`src` links in HTML bodies ([`html`]), decompressing first when
//!   needed ([`decompress`])
//!
//! so the client perceives the proxy as the origin. Response bodies stream
//! through transform stages and are never buffered whole.

pub mod context;
pub mod cookies;
pub mod decompress;
pub mod forward;
pub mod headers;
pub mod html;
pub mod path;
pub mod service;
pub mod types;


pub use context::ClientMeta;
pub use service::Proxy;
pub use types::{ProxyConfig, ProxyError, ProxyResult, RewriteRule, Upstream};
