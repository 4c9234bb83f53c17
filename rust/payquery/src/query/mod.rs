mod builder;
mod executor;

pub use builder::{quote_ident, BindParam, CompiledQuery, QueryBuilder};
pub use executor::{PgExecutor, QueryExecutor};

use crate::{
    config::AppConfig,
    conversation::{
        amount::{format_won, DirectAnswer},
        Accumulator, ConversationTurn, LocalResult, Resolution, ResultSummary, TargetSelection,
        TurnQuery, TurnRequest,
    },
    error::{Result, ServiceError},
    pagination::{PaginationMeta, PaginationStore},
    plan::{QueryDescriptor, QueryIntent, QueryPlan, RenderType},
    registry::FieldRegistry,
    safety::{LimitAction, SqlSafetyGate},
    validator::PlanValidator,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use serde_with::skip_serializing_none;
use std::{sync::Arc, time::Instant};
use tracing::{debug, info};

#[derive(Clone)]
pub struct QueryEngine {
    config: Arc<AppConfig>,
    executor: Arc<dyn QueryExecutor>,
    validator: PlanValidator,
    builder: QueryBuilder,
    gate: SqlSafetyGate,
    cursors: Arc<PaginationStore>,
    accumulator: Accumulator,
}

impl QueryEngine {
    pub fn new(config: Arc<AppConfig>, executor: Arc<dyn QueryExecutor>) -> Self {
        let registry = FieldRegistry::global();
        Self {
            validator: PlanValidator::new(registry, config.default_limit, config.max_limit),
            builder: QueryBuilder::new(registry, config.max_limit),
            gate: SqlSafetyGate::new(config.freeform_max_limit),
            cursors: Arc::new(PaginationStore::new(
                config.cursor_ttl,
                config.cursor_capacity,
            )),
            accumulator: Accumulator::new(config.ambiguity_policy),
            config,
            executor,
        }
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// Validates a raw plan and returns its first page.
    pub async fn start(&self, raw: &Value) -> Result<ExecutionEnvelope> {
        let plan = self
            .validator
            .validate_json(raw)
            .map_err(ServiceError::Validation)?;
        self.execute_plan(plan).await
    }

    pub async fn execute_plan(&self, plan: QueryPlan) -> Result<ExecutionEnvelope> {
        let started = Instant::now();
        let page_size = self.builder.page_size(&plan);

        let count = self.builder.count_query(&plan)?;
        let total_rows = self.executor.count_rows(&count).await?;
        let data = self.builder.data_query(&plan, 0)?;
        let rows = self.executor.fetch_rows(&data).await?;

        let pagination =
            (total_rows > page_size).then(|| self.cursors.mint(plan.clone(), total_rows, page_size));
        let elapsed = elapsed_ms(started);
        info!(
            entity = %plan.entity,
            rows = rows.len(),
            total_rows,
            elapsed_ms = elapsed,
            paginated = pagination.is_some(),
            "plan executed"
        );

        Ok(ExecutionEnvelope::new(
            rows,
            total_rows,
            elapsed,
            pagination,
            plan.preferred_render_type,
        ))
    }

    /// Re-runs the stored plan behind `token` for `page`, or the page after the last one served.
    pub async fn page(&self, request: PageRequestBody) -> Result<ExecutionEnvelope> {
        let started = Instant::now();
        let resolved = self
            .cursors
            .resolve(&request.query_token, request.page_number)
            .map_err(ServiceError::Pagination)?;

        let data = self.builder.data_query(&resolved.plan, resolved.offset)?;
        let rows = self.executor.fetch_rows(&data).await?;
        self.cursors.mark_served(resolved.id, resolved.page);

        let elapsed = elapsed_ms(started);
        info!(
            entity = %resolved.plan.entity,
            page = resolved.page,
            rows = rows.len(),
            total_rows = resolved.meta.total_rows,
            elapsed_ms = elapsed,
            "page served"
        );

        let total_rows = resolved.meta.total_rows;
        Ok(ExecutionEnvelope::new(
            rows,
            total_rows,
            elapsed,
            Some(resolved.meta),
            resolved.plan.preferred_render_type,
        ))
    }

    /// Runs freeform SQL through the safety gate on the read-only path.
    pub async fn execute_sql(&self, request: SqlRequest) -> Result<ExecutionEnvelope> {
        let started = Instant::now();
        let safe = self.gate.check(&request.sql).map_err(ServiceError::Rejected)?;
        debug!(sql = %safe.sql, limit = safe.limit, "freeform sql accepted");

        let rows = self.executor.fetch_freeform(&safe.sql).await?;
        let elapsed = elapsed_ms(started);
        info!(rows = rows.len(), elapsed_ms = elapsed, "freeform sql executed");

        let total_rows = rows.len() as i64;
        let mut envelope = ExecutionEnvelope::new(rows, total_rows, elapsed, None, None);
        envelope.metadata.limit_action = Some(safe.limit_action);
        Ok(envelope)
    }

    /// Compiles a plan without executing it.
    pub fn translate(&self, raw: &Value) -> Result<TranslateResponse> {
        let plan = self
            .validator
            .validate_json(raw)
            .map_err(ServiceError::Validation)?;
        let data = self.builder.data_query(&plan, 0)?;
        let count = self.builder.count_query(&plan)?;
        Ok(TranslateResponse {
            sql: data.sql,
            params: data.params,
            count_sql: count.sql,
            count_params: count.params,
            plan,
        })
    }

    /// Resolves a chat turn against its history and runs whatever it resolves to.
    pub async fn handle_turn(&self, request: TurnRequest) -> Result<TurnResponse> {
        let resolution = self.accumulator.resolve(&request)?;
        let effective_intent = resolution.intent();

        match resolution {
            Resolution::Execute {
                descriptor,
                intent,
                target,
            } => {
                let mut plan = self
                    .validator
                    .validate(&descriptor)
                    .map_err(ServiceError::Validation)?;
                plan.query_intent = intent;
                let result = self.execute_plan(plan.clone()).await?;
                let summary = ResultSummary::for_plan(
                    &plan,
                    &result.data.rows,
                    result.metadata.total_rows,
                );
                let content = match summary.aggregate_scalar {
                    Some(scalar) => format!("{}: {}", plan.entity, format_won(scalar)),
                    None => format!(
                        "{}: {} of {} rows",
                        plan.entity, summary.row_count, result.metadata.total_rows
                    ),
                };
                let refines = target.as_ref().map(|target| target.turn_index);
                let history_entry = ConversationTurn::assistant(
                    content,
                    Some(TurnQuery::Plan(QueryDescriptor::from(&plan))),
                    summary,
                    refines.filter(|_| intent == QueryIntent::RefinePrevious),
                );
                Ok(TurnResponse {
                    effective_intent,
                    target,
                    preferred_render_type: plan.preferred_render_type,
                    plan: Some(plan),
                    result: Some(result),
                    answer: None,
                    history_entry,
                })
            }
            Resolution::Freeform { sql } => {
                let result = self.execute_sql(SqlRequest { sql: sql.clone() }).await?;
                let summary = ResultSummary::for_sql(&result.data.rows);
                let history_entry = ConversationTurn::assistant(
                    format!("{} rows", summary.row_count),
                    Some(TurnQuery::Sql(sql)),
                    summary,
                    None,
                );
                Ok(TurnResponse {
                    effective_intent,
                    target: None,
                    preferred_render_type: render_type(&request),
                    plan: None,
                    result: Some(result),
                    answer: None,
                    history_entry,
                })
            }
            Resolution::Local {
                result: local,
                target,
                ..
            } => Ok(local_response(effective_intent, local, target, &request)),
            Resolution::Direct { answer, target } => {
                Ok(direct_response(answer, target, &request))
            }
        }
    }
}

fn local_response(
    effective_intent: QueryIntent,
    local: LocalResult,
    target: TargetSelection,
    request: &TurnRequest,
) -> TurnResponse {
    let started = Instant::now();
    let summary = ResultSummary {
        entity: local.entity.clone(),
        row_count: local.rows.len() as i64,
        total_rows: Some(local.rows.len() as i64),
        filters: local.filters,
        is_aggregation: local.is_aggregation,
        aggregate_scalar: local.aggregate_scalar,
        rows: local.rows.clone(),
    };
    let content = match (local.aggregate_scalar, local.rows.first()) {
        (Some(scalar), Some(Value::Object(row))) => {
            let alias = row.keys().next().cloned().unwrap_or_default();
            format!("{alias}: {}", format_won(scalar))
        }
        _ => format!("{} rows", summary.row_count),
    };
    info!(
        intent = effective_intent.as_str(),
        turn = target.turn_index,
        rows = local.rows.len(),
        "computed from earlier rows"
    );

    let total_rows = local.rows.len() as i64;
    let result = ExecutionEnvelope::new(
        local.rows,
        total_rows,
        elapsed_ms(started),
        None,
        None,
    );
    TurnResponse {
        effective_intent,
        target: Some(target),
        preferred_render_type: render_type(request),
        plan: None,
        result: Some(result),
        answer: None,
        history_entry: ConversationTurn::assistant(content, None, summary, None),
    }
}

fn direct_response(answer: DirectAnswer, target: TargetSelection, request: &TurnRequest) -> TurnResponse {
    info!(
        turn = target.turn_index,
        operation = ?answer.operation,
        "direct answer computed"
    );
    let summary = ResultSummary {
        row_count: 1,
        is_aggregation: true,
        aggregate_scalar: Some(answer.value),
        ..ResultSummary::default()
    };
    TurnResponse {
        effective_intent: QueryIntent::DirectAnswer,
        target: Some(target),
        preferred_render_type: render_type(request),
        plan: None,
        result: None,
        history_entry: ConversationTurn::assistant(answer.formatted.clone(), None, summary, None),
        answer: Some(answer),
    }
}

fn render_type(request: &TurnRequest) -> Option<RenderType> {
    request
        .preferred_render_type
        .as_deref()
        .and_then(|raw| raw.parse().ok())
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}

#[derive(Debug, Clone, Serialize)]
pub struct ResultData {
    pub rows: Vec<Value>,
}

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionMetadata {
    pub execution_time_ms: u64,
    pub rows_returned: i64,
    pub total_rows: i64,
    pub limit_action: Option<LimitAction>,
    pub preferred_render_type: Option<RenderType>,
}

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionEnvelope {
    pub data: ResultData,
    pub metadata: ExecutionMetadata,
    pub pagination: Option<PaginationMeta>,
}

impl ExecutionEnvelope {
    fn new(
        rows: Vec<Value>,
        total_rows: i64,
        execution_time_ms: u64,
        pagination: Option<PaginationMeta>,
        preferred_render_type: Option<RenderType>,
    ) -> Self {
        Self {
            metadata: ExecutionMetadata {
                execution_time_ms,
                rows_returned: rows.len() as i64,
                total_rows,
                limit_action: None,
                preferred_render_type,
            },
            data: ResultData { rows },
            pagination,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PageRequestBody {
    pub query_token: String,
    #[serde(default)]
    pub page_number: Option<i64>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct SqlRequest {
    pub sql: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TranslateResponse {
    pub sql: String,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub params: Vec<BindParam>,
    pub count_sql: String,
    #[serde(skip_serializing_if = "Vec::is_empty", default)]
    pub count_params: Vec<BindParam>,
    pub plan: QueryPlan,
}

#[skip_serializing_none]
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnResponse {
    pub effective_intent: QueryIntent,
    pub target: Option<TargetSelection>,
    pub plan: Option<QueryPlan>,
    pub preferred_render_type: Option<RenderType>,
    pub result: Option<ExecutionEnvelope>,
    pub answer: Option<DirectAnswer>,
    /// Ready to append to the caller's history.
    pub history_entry: ConversationTurn,
}
