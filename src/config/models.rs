//! Process-level settings.
//!
//! These types map directly to a TOML (also JSON / YAML) settings file with
//! environment-variable overrides. They describe how the process runs —
//! listen addresses, the control-plane connection, ACME identity, timer
//! cadences. Everything about *what is routed* lives in the control-plane
//! store and is loaded at runtime, never from this file.
use std::collections::HashMap;

use serde::{Deserialize, Serialize};

fn default_http_addr() -> String {
    "0.0.0.0:80".to_string()
}

fn default_https_addr() -> String {
    "0.0.0.0:443".to_string()
}

fn default_reload_interval() -> u64 {
    30
}

fn default_health_interval() -> u64 {
    30
}

fn default_metrics_interval() -> u64 {
    60
}

fn default_shutdown_grace() -> u64 {
    10
}

/// ACME account identity and certificate storage.
#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct AcmeSettings {
    /// Contact email registered with the CA.
    pub email: String,
    /// Directory owning the account key, certificate chains, and challenge
    /// material. Created with mode 0700.
    pub data_dir: String,
    /// Use the Let's Encrypt production directory (staging when false).
    pub production: bool,
    /// Answer TLS-ALPN-01 challenges on the TLS listener instead of HTTP-01
    /// on port 80.
    pub tls_alpn: bool,
}

impl Default for AcmeSettings {
    fn default() -> Self {
        Self {
            email: String::new(),
            data_dir: "/root/.local/share/certmagic".to_string(),
            production: true,
            tls_alpn: false,
        }
    }
}

/// Log output format for the `serve` command.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Json,
    Console,
}

/// Top-level process settings.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Settings {
    /// Plain HTTP listener (ACME HTTP-01, HTTPS redirect, non-SSL serving).
    #[serde(default = "default_http_addr")]
    pub http_addr: String,
    /// TLS listener.
    #[serde(default = "default_https_addr")]
    pub https_addr: String,
    /// Control-plane store connection string (`postgres://...`). Falls back
    /// to the `DATABASE_URL` environment variable when empty.
    #[serde(default)]
    pub database_url: String,
    #[serde(default)]
    pub acme: AcmeSettings,
    /// Raw TCP listeners: protocol name -> port (e.g. `minecraft = 25565`).
    #[serde(default)]
    pub tcp_protocols: HashMap<String, u16>,
    /// Loader cadence in seconds.
    #[serde(default = "default_reload_interval")]
    pub reload_interval_secs: u64,
    /// Health checker cadence in seconds.
    #[serde(default = "default_health_interval")]
    pub health_check_interval_secs: u64,
    /// Metrics flush cadence in seconds.
    #[serde(default = "default_metrics_interval")]
    pub metrics_flush_interval_secs: u64,
    /// How long shutdown waits for in-flight work to drain.
    #[serde(default = "default_shutdown_grace")]
    pub shutdown_grace_secs: u64,
    #[serde(default)]
    pub log_format: LogFormat,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            http_addr: default_http_addr(),
            https_addr: default_https_addr(),
            database_url: String::new(),
            acme: AcmeSettings::default(),
            tcp_protocols: HashMap::new(),
            reload_interval_secs: default_reload_interval(),
            health_check_interval_secs: default_health_interval(),
            metrics_flush_interval_secs: default_metrics_interval(),
            shutdown_grace_secs: default_shutdown_grace(),
            log_format: LogFormat::Json,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_ports() {
        let s = Settings::default();
        assert_eq!(s.http_addr, "0.0.0.0:80");
        assert_eq!(s.https_addr, "0.0.0.0:443");
        assert_eq!(s.reload_interval_secs, 30);
        assert_eq!(s.health_check_interval_secs, 30);
        assert_eq!(s.metrics_flush_interval_secs, 60);
        assert_eq!(s.shutdown_grace_secs, 10);
    }

    #[test]
    fn acme_defaults() {
        let a = AcmeSettings::default();
        assert!(a.production);
        assert!(!a.tls_alpn);
        assert_eq!(a.data_dir, "/root/.local/share/certmagic");
    }
}
