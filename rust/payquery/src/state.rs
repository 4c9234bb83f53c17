use crate::{
    config::AppConfig,
    query::{QueryEngine, QueryExecutor},
};
use std::sync::Arc;

/// Shared by every handler. The engine owns the pagination store, so clones see the same cursors.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub engine: QueryEngine,
}

impl AppState {
    pub fn new(config: AppConfig, executor: Arc<dyn QueryExecutor>) -> Self {
        let config = Arc::new(config);
        let engine = QueryEngine::new(Arc::clone(&config), executor);
        Self { config, engine }
    }
}
