// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Gateway configuration: everything the HTTP/WebSocket surface needs that
//! doesn't belong in [`relay_config::Config`] (which describes a single
//! agent, not a gateway serving many of them).

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default)]
    pub http: HttpConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    /// Address the HTTP server binds to.
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Path to the persisted bearer-token hash. Defaults to
    /// `~/.config/relay/gateway/token.yaml`.
    pub token_file: Option<PathBuf>,
    /// Skip TLS entirely and serve plain HTTP. Only meant for loopback
    /// development — the gateway warns loudly if this is set on a
    /// non-loopback bind address.
    #[serde(default)]
    pub insecure_dev_mode: bool,
    /// Path to a PEM certificate chain. Required unless `insecure_dev_mode`.
    pub tls_cert_file: Option<PathBuf>,
    /// Path to the matching PEM private key.
    pub tls_key_file: Option<PathBuf>,
    /// Failed-auth attempts per minute before an IP is locked out.
    #[serde(default = "default_auth_rate_limit")]
    pub auth_rate_limit_per_minute: u32,
    /// Burst allowance on top of the per-minute auth rate limit.
    #[serde(default = "default_auth_rate_burst")]
    pub auth_rate_burst: u32,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            token_file: None,
            insecure_dev_mode: false,
            tls_cert_file: None,
            tls_key_file: None,
            auth_rate_limit_per_minute: default_auth_rate_limit(),
            auth_rate_burst: default_auth_rate_burst(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:8787".to_string()
}

fn default_auth_rate_limit() -> u32 {
    5
}

fn default_auth_rate_burst() -> u32 {
    2
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_binds_loopback() {
        let cfg = GatewayConfig::default();
        assert_eq!(cfg.http.bind, "127.0.0.1:8787");
        assert!(!cfg.http.insecure_dev_mode);
    }

    #[test]
    fn parses_minimal_yaml() {
        let cfg: GatewayConfig = serde_yaml::from_str("http:\n  bind: \"0.0.0.0:9000\"\n").unwrap();
        assert_eq!(cfg.http.bind, "0.0.0.0:9000");
        assert_eq!(cfg.http.auth_rate_limit_per_minute, 5);
    }

    #[test]
    fn parses_empty_yaml_as_defaults() {
        let cfg: GatewayConfig = serde_yaml::from_str("{}").unwrap();
        assert_eq!(cfg.http.bind, default_bind());
    }
}
