//! Server configuration from environment.

use std::env;

use utm_dss::DssOAuthConfig;

#[derive(Debug, Clone)]
pub struct Config {
    pub server_port: u16,
    pub database_path: String,
    pub database_max_connections: u32,
    pub admin_token: String,

    pub dss_base_url: String,
    pub dss_auth_url: String,
    pub dss_auth_token_endpoint: String,
    pub dss_client_id: String,
    pub dss_client_secret: String,
    pub dss_self_audience: String,
    pub blender_fqdn: String,

    pub heartbeat_rate_secs: u64,
    pub enable_conformance_monitoring: bool,
    pub ussp_network_enabled: bool,
    pub lock_watchdog_secs: u64,

    pub allowed_origins: Vec<String>,
    pub rate_limit_enabled: bool,
    pub rate_limit_rps: u32,

    pub tls_cert_path: Option<String>,
    pub tls_key_path: Option<String>,
    pub require_tls: bool,
}

fn env_flag(key: &str, default: bool) -> bool {
    env::var(key).ok().map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "yes")).unwrap_or(default)
}

impl Config {
    pub fn from_env() -> Self {
        Self {
            server_port: env::var("UTM_PORT").ok().and_then(|s| s.parse().ok()).unwrap_or(3000),
            database_path: env::var("UTM_DATABASE_PATH").unwrap_or_else(|_| "data/utm.db".to_string()),
            database_max_connections: env::var("UTM_DATABASE_MAX_CONNECTIONS")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(5),
            admin_token: env::var("UTM_ADMIN_TOKEN").unwrap_or_else(|_| "change-me-admin".to_string()),

            dss_base_url: env::var("DSS_BASE_URL").unwrap_or_else(|_| "http://localhost:8082".to_string()),
            dss_auth_url: env::var("DSS_AUTH_URL").unwrap_or_else(|_| "http://localhost:8085".to_string()),
            dss_auth_token_endpoint: env::var("DSS_AUTH_TOKEN_ENDPOINT")
                .unwrap_or_else(|_| "/oauth/token".to_string()),
            dss_client_id: env::var("AUTH_DSS_CLIENT_ID").unwrap_or_default(),
            dss_client_secret: env::var("AUTH_DSS_CLIENT_SECRET").unwrap_or_default(),
            dss_self_audience: env::var("DSS_SELF_AUDIENCE").unwrap_or_else(|_| "localhost".to_string()),
            blender_fqdn: env::var("BLENDER_FQDN").unwrap_or_else(|_| "localhost".to_string()),

            heartbeat_rate_secs: env::var("HEARTBEAT_RATE_SECS").ok().and_then(|s| s.parse().ok()).unwrap_or(5),
            enable_conformance_monitoring: env_flag("ENABLE_CONFORMANCE_MONITORING", true),
            ussp_network_enabled: env_flag("USSP_NETWORK_ENABLED", false),
            lock_watchdog_secs: env::var("UTM_LOCK_WATCHDOG_SECS").ok().and_then(|s| s.parse().ok()).unwrap_or(30),

            allowed_origins: env::var("UTM_ALLOWED_ORIGINS")
                .ok()
                .map(|raw| raw.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect())
                .unwrap_or_default(),
            rate_limit_enabled: env_flag("UTM_RATE_LIMIT_ENABLED", true),
            rate_limit_rps: env::var("UTM_RATE_LIMIT_RPS").ok().and_then(|s| s.parse().ok()).unwrap_or(20),

            tls_cert_path: env::var("UTM_TLS_CERT_PATH").ok(),
            tls_key_path: env::var("UTM_TLS_KEY_PATH").ok(),
            require_tls: env_flag("UTM_REQUIRE_TLS", false),
        }
    }

    /// `None` when no client id/secret are configured — the DSS client then
    /// only issues tokens for localhost/test audiences (see `is_test_audience`).
    pub fn dss_oauth_config(&self) -> Option<DssOAuthConfig> {
        if self.dss_client_id.is_empty() || self.dss_client_secret.is_empty() {
            return None;
        }
        Some(DssOAuthConfig {
            token_url: format!("{}{}", self.dss_auth_url, self.dss_auth_token_endpoint),
            client_id: self.dss_client_id.clone(),
            client_secret: self.dss_client_secret.clone(),
        })
    }
}
