// Realtime server configuration.
//
// Centralizes environment variable parsing with defaults for local
// development. The DB pool reads its own sizing vars; this module
// covers the core server settings.

use std::net::SocketAddr;

/// Core realtime server configuration.
///
/// Constructed via [`RealtimeConfig::from_env`] which reads environment
/// variables and falls back to sensible development defaults.
#[derive(Debug, Clone)]
pub struct RealtimeConfig {
    /// Listen address (host:port).
    pub listen_addr: SocketAddr,
    /// JWT signing secret for session tokens.
    pub jwt_secret: String,
    /// Base URL for WebSocket connections (e.g. `ws://localhost:8080`).
    pub ws_base_url: String,
    /// PostgreSQL connection string.
    pub database_url: Option<String>,
    /// Log filter directive (e.g. `info`, `agora_realtime=debug`).
    pub log_filter: String,
}

impl RealtimeConfig {
    /// Parse configuration from environment variables.
    ///
    /// | Variable | Default |
    /// |---|---|
    /// | `AGORA_REALTIME_HOST` | `0.0.0.0` |
    /// | `AGORA_REALTIME_PORT` | `8080` |
    /// | `AGORA_REALTIME_JWT_SECRET` | dev-only placeholder |
    /// | `AGORA_REALTIME_WS_BASE_URL` | `ws://{host}:{port}` |
    /// | `AGORA_REALTIME_DATABASE_URL` | *(none; stores fall back to memory)* |
    /// | `AGORA_REALTIME_LOG_FILTER` | `info` |
    pub fn from_env() -> Self {
        Self::from_env_fn(|key| std::env::var(key))
    }

    /// Testable constructor that accepts an environment lookup function.
    fn from_env_fn<F>(env: F) -> Self
    where
        F: Fn(&str) -> Result<String, std::env::VarError>,
    {
        let host = env("AGORA_REALTIME_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let port: u16 = env("AGORA_REALTIME_PORT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(8080);
        let listen_addr = format!("{host}:{port}")
            .parse()
            .unwrap_or_else(|_| SocketAddr::from(([0, 0, 0, 0], port)));

        let jwt_secret = env("AGORA_REALTIME_JWT_SECRET").unwrap_or_else(|_| {
            "agora_local_development_jwt_secret_must_be_32_chars".into()
        });

        let ws_base_url = env("AGORA_REALTIME_WS_BASE_URL")
            .unwrap_or_else(|_| format!("ws://{listen_addr}"));

        let database_url = env("AGORA_REALTIME_DATABASE_URL").ok();

        let log_filter =
            env("AGORA_REALTIME_LOG_FILTER").unwrap_or_else(|_| "info".into());

        Self { listen_addr, jwt_secret, ws_base_url, database_url, log_filter }
    }

    /// Returns true when using the development-only JWT secret.
    pub fn is_dev_jwt_secret(&self) -> bool {
        self.jwt_secret == "agora_local_development_jwt_secret_must_be_32_chars"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn env_from_map(
        map: HashMap<&'static str, &'static str>,
    ) -> impl Fn(&str) -> Result<String, std::env::VarError> {
        move |key: &str| {
            map.get(key)
                .map(|v| v.to_string())
                .ok_or(std::env::VarError::NotPresent)
        }
    }

    #[test]
    fn defaults_when_no_env_vars() {
        let cfg = RealtimeConfig::from_env_fn(env_from_map(HashMap::new()));
        assert_eq!(cfg.listen_addr.port(), 8080);
        assert_eq!(cfg.listen_addr.ip().to_string(), "0.0.0.0");
        assert!(cfg.is_dev_jwt_secret());
        assert_eq!(cfg.ws_base_url, "ws://0.0.0.0:8080");
        assert!(cfg.database_url.is_none());
        assert_eq!(cfg.log_filter, "info");
    }

    #[test]
    fn custom_host_and_port() {
        let mut m = HashMap::new();
        m.insert("AGORA_REALTIME_HOST", "127.0.0.1");
        m.insert("AGORA_REALTIME_PORT", "3000");
        let cfg = RealtimeConfig::from_env_fn(env_from_map(m));
        assert_eq!(cfg.listen_addr.to_string(), "127.0.0.1:3000");
        assert_eq!(cfg.ws_base_url, "ws://127.0.0.1:3000");
    }

    #[test]
    fn custom_jwt_secret_is_not_dev() {
        let mut m = HashMap::new();
        m.insert("AGORA_REALTIME_JWT_SECRET", "production_secret_at_least_32_chars!!");
        let cfg = RealtimeConfig::from_env_fn(env_from_map(m));
        assert!(!cfg.is_dev_jwt_secret());
    }

    #[test]
    fn ws_base_url_override() {
        let mut m = HashMap::new();
        m.insert("AGORA_REALTIME_WS_BASE_URL", "wss://realtime.agora.dev");
        let cfg = RealtimeConfig::from_env_fn(env_from_map(m));
        assert_eq!(cfg.ws_base_url, "wss://realtime.agora.dev");
    }

    #[test]
    fn database_url_from_env() {
        let mut m = HashMap::new();
        m.insert("AGORA_REALTIME_DATABASE_URL", "postgres://u:p@host/db");
        let cfg = RealtimeConfig::from_env_fn(env_from_map(m));
        assert_eq!(cfg.database_url.as_deref(), Some("postgres://u:p@host/db"));
    }

    #[test]
    fn invalid_port_uses_default() {
        let mut m = HashMap::new();
        m.insert("AGORA_REALTIME_PORT", "not_a_number");
        let cfg = RealtimeConfig::from_env_fn(env_from_map(m));
        assert_eq!(cfg.listen_addr.port(), 8080);
    }

    #[test]
    fn log_filter_override() {
        let mut m = HashMap::new();
        m.insert("AGORA_REALTIME_LOG_FILTER", "debug,tower_http=trace");
        let cfg = RealtimeConfig::from_env_fn(env_from_map(m));
        assert_eq!(cfg.log_filter, "debug,tower_http=trace");
    }
}
