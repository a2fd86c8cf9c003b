use std::sync::Arc;

use axum::extract::State;
use axum::middleware;
use axum::{Json, Router, routing::get};
use pqwatch_control::auth::{self, AuthUser};
use pqwatch_control::config::ControlConfig;
use pqwatch_control::request_meta::RequestMeta;
use pqwatch_control::rpc::{self, RateLimiter};
use pqwatch_control::security;
use pqwatch_control::state::AppState;
use pqwatch_core::EventGroupingService;
use pqwatch_db::SeaOrmStore;
use sea_orm_migration::MigratorTrait;
use serde::Serialize;

#[derive(Debug, Serialize)]
struct HealthzResponse {
    status: &'static str,
    version: &'static str,
    read_only: bool,
    audit_mode: String,
    database_ok: bool,
    database_error: Option<String>,
}

async fn healthz(State(state): State<AppState>) -> Json<HealthzResponse> {
    let ping = state.db.ping().await;
    Json(HealthzResponse {
        status: if ping.is_ok() { "ok" } else { "degraded" },
        version: env!("CARGO_PKG_VERSION"),
        read_only: state.config.read_only,
        audit_mode: state.config.audit_mode.to_string(),
        database_ok: ping.is_ok(),
        database_error: ping.err().map(|e| e.to_string()),
    })
}

async fn init_db_and_migrate(config: ControlConfig) -> anyhow::Result<AppState> {
    let db = pqwatch_db::connect(&config.database_url).await?;

    // Apply migrations on boot (idempotent).
    pqwatch_migration::Migrator::up(&db, None).await?;

    let db = Arc::new(db);
    let store = Arc::new(SeaOrmStore::new(db.clone()));
    let service = EventGroupingService::new(store.clone(), store.clone())
        .with_actor_directory(store)
        .with_audit_mode(config.audit_mode);

    Ok(AppState {
        db,
        service: Arc::new(service),
        limiter: Arc::new(RateLimiter::from_config(&config)),
        config: Arc::new(config),
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config = ControlConfig::from_env()?;
    let addr = config.bind_addr;
    let state = init_db_and_migrate(config).await?;
    tracing::info!(
        audit_mode = %state.config.audit_mode,
        read_only = state.config.read_only,
        "database ready"
    );

    let router = rpc::router();
    let (procedures, _types) = router
        .build()
        .map_err(|errs| anyhow::anyhow!("rspc build failed: {errs:?}"))?;

    // Queries are open; mutations need an identity and an allowed Origin.
    let rspc_router = rspc_axum::endpoint(
        procedures,
        |axum::extract::State(state): axum::extract::State<AppState>,
         axum::extract::Extension(meta): axum::extract::Extension<RequestMeta>,
         user: Option<axum::Extension<AuthUser>>| {
            rpc::Ctx {
                service: state.service.clone(),
                config: state.config.clone(),
                limiter: state.limiter.clone(),
                user: user.map(|axum::Extension(u)| u),
                request_id: meta.request_id,
            }
        },
    )
    .layer(middleware::from_fn_with_state(
        state.clone(),
        security::rspc_auth_guard,
    ));

    let app = Router::new()
        .route("/healthz", get(healthz))
        .route("/auth/whoami", get(auth::whoami))
        .nest("/rspc", rspc_router)
        .layer(middleware::from_fn(security::request_id))
        .with_state(state);
    tracing::info!(%addr, "pqwatch-control HTTP listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
