use crate::{
    config::AppConfig,
    conversation::TurnRequest,
    db,
    error::{Result, ServiceError},
    query::{
        ExecutionEnvelope, PageRequestBody, PgExecutor, QueryExecutor, SqlRequest,
        TranslateResponse, TurnResponse,
    },
    state::AppState,
};
use axum::{
    extract::State,
    http::HeaderMap,
    routing::{get, post},
    Json, Router,
};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::info;

pub struct Server {
    state: AppState,
}

impl Server {
    pub async fn new(config: AppConfig) -> anyhow::Result<Self> {
        let pools = db::connect_pools(&config).await?;
        let executor = Arc::new(PgExecutor::new(pools, config.request_timeout));
        Ok(Self::with_executor(config, executor))
    }

    /// Builds a server over any executor; tests use this with an in-memory one.
    pub fn with_executor(config: AppConfig, executor: Arc<dyn QueryExecutor>) -> Self {
        Self {
            state: AppState::new(config, executor),
        }
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/healthz", get(Self::health))
            .route("/api/query", post(Self::query))
            .route("/api/query/page", post(Self::page))
            .route("/api/sql", post(Self::sql))
            .route("/api/translate", post(Self::translate))
            .route("/api/chat/turn", post(Self::turn))
            .with_state(self.state.clone())
            .layer(TraceLayer::new_for_http())
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let addr = self.state.config.listen_addr;
        let listener = TcpListener::bind(addr).await?;
        info!(%addr, "payquery listening");
        axum::serve(listener, self.router()).await?;
        Ok(())
    }

    async fn health() -> Json<Value> {
        Json(json!({ "status": "ok" }))
    }

    async fn query(
        State(state): State<AppState>,
        headers: HeaderMap,
        Json(plan): Json<Value>,
    ) -> Result<Json<ExecutionEnvelope>> {
        enforce_api_key(&headers, &state.config)?;
        Ok(Json(state.engine.start(&plan).await?))
    }

    async fn page(
        State(state): State<AppState>,
        headers: HeaderMap,
        Json(request): Json<PageRequestBody>,
    ) -> Result<Json<ExecutionEnvelope>> {
        enforce_api_key(&headers, &state.config)?;
        Ok(Json(state.engine.page(request).await?))
    }

    async fn sql(
        State(state): State<AppState>,
        headers: HeaderMap,
        Json(request): Json<SqlRequest>,
    ) -> Result<Json<ExecutionEnvelope>> {
        enforce_api_key(&headers, &state.config)?;
        Ok(Json(state.engine.execute_sql(request).await?))
    }

    async fn translate(
        State(state): State<AppState>,
        headers: HeaderMap,
        Json(plan): Json<Value>,
    ) -> Result<Json<TranslateResponse>> {
        enforce_api_key(&headers, &state.config)?;
        Ok(Json(state.engine.translate(&plan)?))
    }

    async fn turn(
        State(state): State<AppState>,
        headers: HeaderMap,
        Json(request): Json<TurnRequest>,
    ) -> Result<Json<TurnResponse>> {
        enforce_api_key(&headers, &state.config)?;
        Ok(Json(state.engine.handle_turn(request).await?))
    }
}

fn enforce_api_key(headers: &HeaderMap, config: &AppConfig) -> Result<()> {
    if let Some(expected) = &config.api_key {
        let provided = headers
            .get("x-api-key")
            .and_then(|value| value.to_str().ok());

        if provided != Some(expected.as_str()) {
            return Err(ServiceError::Auth);
        }
    }

    Ok(())
}
