use std::net::SocketAddr;
use std::time::Duration;

use anyhow::Context;
use pqwatch_core::AuditMode;

const DEV_JWT_SECRET: &str = "dev-insecure-change-me";

#[derive(Debug, Clone)]
pub struct ControlConfig {
    pub database_url: String,
    pub bind_addr: SocketAddr,
    pub audit_mode: AuditMode,
    pub read_only: bool,
    pub jwt_secret: Vec<u8>,
    pub rate_limit_max_hits: usize,
    pub rate_limit_window: Duration,
    pub allowed_origins: Vec<String>,
}

fn truthy(raw: &str) -> bool {
    matches!(
        raw.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

impl ControlConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the config from any key lookup, so tests need not touch the
    /// process environment.
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let database_url = get("DATABASE_URL")
            .filter(|v| !v.trim().is_empty())
            .ok_or_else(|| anyhow::anyhow!("DATABASE_URL is required"))?;

        let bind_addr = get("PQWATCH_BIND_ADDR")
            .unwrap_or_else(|| "0.0.0.0:8080".to_string())
            .parse::<SocketAddr>()
            .context("PQWATCH_BIND_ADDR must be host:port")?;

        let audit_mode = match get("PQWATCH_AUDIT_MODE") {
            Some(raw) => raw
                .parse::<AuditMode>()
                .map_err(|e| anyhow::anyhow!("PQWATCH_AUDIT_MODE: {e}"))?,
            None => AuditMode::default(),
        };

        let jwt_secret = match get("PQWATCH_JWT_SECRET") {
            Some(s) if !s.is_empty() => s.into_bytes(),
            _ => {
                tracing::warn!("PQWATCH_JWT_SECRET not set, using the development secret");
                DEV_JWT_SECRET.as_bytes().to_vec()
            }
        };

        let rate_limit_max_hits = get("PQWATCH_RATE_LIMIT_MAX_HITS")
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(30)
            .clamp(1, 10_000);
        let window_ms = get("PQWATCH_RATE_LIMIT_WINDOW_MS")
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(10_000)
            .clamp(1000, 600_000);

        // Dev-friendly defaults. Production should set PQWATCH_ALLOWED_ORIGINS.
        let allowed_origins = get("PQWATCH_ALLOWED_ORIGINS")
            .unwrap_or_else(|| "http://localhost:5173,http://127.0.0.1:5173".to_string())
            .split(',')
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .map(|s| s.to_string())
            .collect();

        Ok(Self {
            database_url,
            bind_addr,
            audit_mode,
            read_only: get("PQWATCH_READ_ONLY").is_some_and(|v| truthy(&v)),
            jwt_secret,
            rate_limit_max_hits,
            rate_limit_window: Duration::from_millis(window_ms),
            allowed_origins,
        })
    }
}
