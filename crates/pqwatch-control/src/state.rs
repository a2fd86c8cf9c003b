use std::sync::Arc;

use pqwatch_core::EventGroupingService;
use pqwatch_db::sea_orm::DatabaseConnection;

use crate::config::ControlConfig;
use crate::rpc::RateLimiter;

#[derive(Clone)]
pub struct AppState {
    pub db: Arc<DatabaseConnection>,
    pub service: Arc<EventGroupingService>,
    pub config: Arc<ControlConfig>,
    pub limiter: Arc<RateLimiter>,
}
