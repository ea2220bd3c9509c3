use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::time::Duration;

use crate::proxy::{ProxyConfig, ProxyError, RewriteRule};

#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    pub server: ServerSettings,
    pub upstream: UpstreamSettings,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerSettings {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Deserialize, Clone)]
pub struct UpstreamSettings {
    /// Upstream base URL, e.g. `http://localhost:4000/app`
    pub url: String,
    pub timeout_ms: u64,
    /// Public mount path of the proxy
    pub base_url: String,
    pub preserve_host: bool,
    pub is_forwarded: bool,
    pub no_x_forwarded_for: bool,
    pub no_html_rewrite: bool,
    pub cookie_domains: Vec<CookieRule>,
    pub cookie_paths: Vec<CookieRule>,
    /// PEM file with the root certificates trusted for the upstream TLS
    /// connection
    pub ca_file: Option<String>,
}

/// A cookie rewrite rule: `pattern` is a regex that must match the whole
/// attribute value, `replacement` may reference capture groups (`$1`).
#[derive(Debug, Deserialize, Clone)]
pub struct CookieRule {
    pub pattern: String,
    pub replacement: String,
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        let config = Config::builder()
            // Start with default values
            .set_default("server.host", "0.0.0.0")?
            .set_default("server.port", 8080)?
            .set_default("upstream.url", "http://localhost:4000/")?
            .set_default("upstream.timeout_ms", 5000)?
            .set_default("upstream.base_url", "")?
            .set_default("upstream.preserve_host", false)?
            .set_default("upstream.is_forwarded", false)?
            .set_default("upstream.no_x_forwarded_for", false)?
            .set_default("upstream.no_html_rewrite", false)?
            .set_default("upstream.cookie_domains", Vec::<String>::new())?
            .set_default("upstream.cookie_paths", Vec::<String>::new())?
            // Add configuration file if it exists
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name("config/local").required(false))
            // Add environment variables with prefix
            .add_source(Environment::with_prefix("FACADE").separator("__"))
            .build()?;

        config.try_deserialize()
    }

    /// Build the proxy configuration these settings describe.
    pub fn proxy_config(&self) -> crate::Result<ProxyConfig> {
        let mut config = ProxyConfig::new(&self.upstream.url)?;
        config.timeout = Duration::from_millis(self.upstream.timeout_ms);
        config.base_url = self.upstream.base_url.clone();
        config.preserve_host = self.upstream.preserve_host;
        config.is_forwarded = self.upstream.is_forwarded;
        config.no_x_forwarded_for = self.upstream.no_x_forwarded_for;
        config.no_html_rewrite = self.upstream.no_html_rewrite;
        config.cookie_domains = compile_rules(&self.upstream.cookie_domains)?;
        config.cookie_paths = compile_rules(&self.upstream.cookie_paths)?;
        if let Some(ca_file) = &self.upstream.ca_file {
            config.tls_root_ca = Some(std::fs::read(ca_file)?);
        }
        Ok(config)
    }
}

fn compile_rules(rules: &[CookieRule]) -> crate::Result<Vec<RewriteRule>> {
    rules
        .iter()
        .map(|rule| {
            RewriteRule::pattern(&rule.pattern, rule.replacement.clone()).map_err(|e| {
                ProxyError::InvalidUpstream(format!(
                    "invalid cookie rule '{}': {e}",
                    rule.pattern
                ))
                .into()
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settings_can_be_loaded() {
        let settings = Settings::new();
        assert!(settings.is_ok());
    }

    #[test]
    fn test_settings_build_a_proxy_config() {
        let settings = Settings::new().unwrap();
        let config = settings.proxy_config().unwrap();
        assert_eq!(config.timeout, Duration::from_millis(5000));
        assert!(!config.preserve_host);
    }

    #[test]
    fn test_invalid_cookie_rule_is_rejected() {
        let mut settings = Settings::new().unwrap();
        settings.upstream.cookie_domains.push(CookieRule {
            pattern: "(".to_string(),
            replacement: "x".to_string(),
        });
        assert!(settings.proxy_config().is_err());
    }
}
