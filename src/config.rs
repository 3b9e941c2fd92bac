//! Command-line and environment configuration

use anyhow::{Context, Result};
use clap::Parser;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::PathBuf;

use cdn_broker_control::DEFAULT_SCHEDULE;

#[derive(Parser, Debug, Clone)]
pub struct BrokerArgs {
    /// Database URL (postgres://... or sqlite://...)
    #[arg(long, env = "DATABASE_URL", default_value = "sqlite://cdn-broker.db?mode=rwc")]
    pub database_url: String,

    /// Username the platform authenticates with
    #[arg(long, env = "BROKER_USERNAME", default_value = "")]
    pub broker_username: String,

    /// Password the platform authenticates with
    #[arg(long, env = "BROKER_PASSWORD", default_value = "", hide_env_values = true)]
    pub broker_password: String,

    /// Origin used when a provision request does not name one
    #[arg(long, env = "DEFAULT_ORIGIN", default_value = "")]
    pub default_origin: String,

    /// Default cache TTL in seconds
    #[arg(long, env = "DEFAULT_TTL", default_value = "86400")]
    pub default_ttl: i64,

    /// AWS region; falls back to the SDK's own resolution
    #[arg(long, env = "AWS_REGION")]
    pub aws_region: Option<String>,

    /// HTTP server bind address
    #[arg(long, env = "BIND_ADDR", default_value = "0.0.0.0:3000")]
    pub bind_addr: SocketAddr,

    /// Port override for platforms that only hand out `PORT`
    #[arg(long, env = "PORT")]
    pub port: Option<u16>,

    /// TLS certificate file path (PEM format)
    #[arg(long, env = "TLS_CERT")]
    pub tls_cert: Option<PathBuf>,

    /// TLS private key file path (PEM format)
    #[arg(long, env = "TLS_KEY")]
    pub tls_key: Option<PathBuf>,

    /// Six-field cron expression for the reconciliation sweeps
    #[arg(long, env = "SCHEDULE", default_value = DEFAULT_SCHEDULE)]
    pub schedule: String,

    /// JSON object of headers the CDN adds to every origin request
    #[arg(long, env = "EXTRA_REQUEST_HEADERS")]
    pub extra_request_headers: Option<String>,

    /// Tag value marking certificates this broker owns
    #[arg(long, env = "BROKER_TAG", default_value = "cdn-broker")]
    pub broker_tag: String,

    /// Catalog service id
    #[arg(long, env = "SERVICE_ID", default_value = "cdn-route")]
    pub service_id: String,

    /// Catalog plan id
    #[arg(long, env = "PLAN_ID", default_value = "cdn-route")]
    pub plan_id: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    pub log_level: String,
}

impl BrokerArgs {
    pub fn listen_addr(&self) -> SocketAddr {
        match self.port {
            Some(port) => SocketAddr::new(self.bind_addr.ip(), port),
            None => self.bind_addr,
        }
    }

    pub fn origin_headers(&self) -> Result<BTreeMap<String, String>> {
        match self.extra_request_headers.as_deref() {
            Some(raw) => parse_extra_headers(raw),
            None => Ok(BTreeMap::new()),
        }
    }

    /// Settings `serve` cannot run without
    pub fn validate_for_serve(&self) -> Result<()> {
        if self.broker_username.is_empty() || self.broker_password.is_empty() {
            anyhow::bail!("BROKER_USERNAME and BROKER_PASSWORD must be set");
        }
        if self.default_origin.trim().is_empty() {
            anyhow::bail!("DEFAULT_ORIGIN must be set");
        }
        if self.default_ttl < 0 {
            anyhow::bail!("DEFAULT_TTL must not be negative");
        }
        if self.tls_cert.is_some() != self.tls_key.is_some() {
            anyhow::bail!("TLS_CERT and TLS_KEY must be set together");
        }
        Ok(())
    }
}

/// Parse `{"X-Name": "value", ...}`; blank input means no headers
pub fn parse_extra_headers(raw: &str) -> Result<BTreeMap<String, String>> {
    if raw.trim().is_empty() {
        return Ok(BTreeMap::new());
    }

    serde_json::from_str(raw).context("EXTRA_REQUEST_HEADERS must be a JSON object of strings")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(extra: &[&str]) -> BrokerArgs {
        let mut argv = vec!["cdn-broker"];
        argv.extend_from_slice(extra);
        BrokerArgs::parse_from(argv)
    }

    #[test]
    fn test_extra_headers() {
        let headers = parse_extra_headers(r#"{"X-Cdn-Secret": "abc", "X-Env": "prod"}"#).unwrap();
        assert_eq!(headers.len(), 2);
        assert_eq!(headers["X-Cdn-Secret"], "abc");

        assert!(parse_extra_headers("").unwrap().is_empty());
        assert!(parse_extra_headers(r#"["not", "an", "object"]"#).is_err());
        assert!(parse_extra_headers(r#"{"X-Count": 3}"#).is_err());
    }

    #[test]
    fn test_port_overrides_bind_port() {
        let parsed = args(&["--bind-addr", "127.0.0.1:3000", "--port", "8443"]);
        assert_eq!(parsed.listen_addr(), "127.0.0.1:8443".parse().unwrap());

        let parsed = args(&["--bind-addr", "127.0.0.1:3000"]);
        assert_eq!(parsed.listen_addr(), "127.0.0.1:3000".parse().unwrap());
    }

    #[test]
    fn test_serve_requires_credentials_and_origin() {
        let parsed = args(&[
            "--broker-username",
            "broker",
            "--broker-password",
            "secret",
            "--default-origin",
            "origin.example.com",
        ]);
        assert!(parsed.validate_for_serve().is_ok());

        let parsed = args(&["--default-origin", "origin.example.com"]);
        assert!(parsed.validate_for_serve().is_err());

        let parsed = args(&[
            "--broker-username",
            "broker",
            "--broker-password",
            "secret",
            "--default-origin",
            "origin.example.com",
            "--tls-cert",
            "cert.pem",
        ]);
        assert!(parsed.validate_for_serve().is_err());
    }
}
