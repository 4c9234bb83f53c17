//! Conversation state: deciding what a new turn runs against, given the turns before it.
//!
//! History is supplied by the caller on every request; nothing here is stored server side. The
//! predicate state of a turn is derived by replaying the structured plans up to it, so a
//! `REFINE_PREVIOUS` turn keeps every earlier predicate it did not restate.

pub mod amount;
pub mod local;

use crate::{
    config::AmbiguityPolicy,
    error::{Result, ServiceError},
    plan::{
        AggregationDescriptor, FilterDescriptor, Operation, QueryDescriptor, QueryIntent,
        QueryPlan, TimeRangeDescriptor,
    },
    time::{parse_datetime, parse_preset},
    validator::{ValidationCode, ValidationError, ValidationErrors},
};
use amount::{DirectAnswer, DirectAnswerRequest};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::str::FromStr;
use tracing::debug;

const EXCERPT_CHARS: usize = 80;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TurnRole {
    User,
    #[default]
    Assistant,
}

/// What a turn executed: a structured plan or gate-checked freeform SQL.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(untagged)]
pub enum TurnQuery {
    Sql(String),
    Plan(QueryDescriptor),
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultSummary {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity: Option<String>,
    #[serde(default)]
    pub row_count: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_rows: Option<i64>,
    #[serde(default)]
    pub filters: Vec<FilterDescriptor>,
    #[serde(default)]
    pub is_aggregation: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aggregate_scalar: Option<Decimal>,
    /// Rows materialized for this turn; FILTER_LOCAL and AGGREGATE_LOCAL run over these.
    #[serde(default)]
    pub rows: Vec<Value>,
}

impl ResultSummary {
    pub fn for_plan(plan: &QueryPlan, rows: &[Value], total_rows: i64) -> Self {
        let is_aggregation = plan.operation == Operation::Aggregate;
        let aggregate_scalar = match (is_aggregation, rows, plan.aggregations.first()) {
            (true, [row], Some(first)) if plan.group_by.is_empty() => {
                row.get(&first.alias).and_then(local::as_decimal)
            }
            _ => None,
        };
        Self {
            entity: Some(plan.entity.clone()),
            row_count: rows.len() as i64,
            total_rows: Some(total_rows),
            filters: plan.filters.iter().map(FilterDescriptor::from).collect(),
            is_aggregation,
            aggregate_scalar,
            rows: rows.to_vec(),
        }
    }

    pub fn for_sql(rows: &[Value]) -> Self {
        Self {
            row_count: rows.len() as i64,
            total_rows: Some(rows.len() as i64),
            rows: rows.to_vec(),
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationTurn {
    #[serde(default)]
    pub role: TurnRole,
    #[serde(default)]
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query_plan_or_sql: Option<TurnQuery>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_summary: Option<ResultSummary>,
    /// History index of the turn this one refined, when it refined anything.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refines: Option<usize>,
}

impl ConversationTurn {
    pub fn assistant(
        content: impl Into<String>,
        query: Option<TurnQuery>,
        summary: ResultSummary,
        refines: Option<usize>,
    ) -> Self {
        Self {
            role: TurnRole::Assistant,
            content: content.into(),
            query_plan_or_sql: query,
            result_summary: Some(summary),
            refines,
        }
    }

    fn plan(&self) -> Option<&QueryDescriptor> {
        match &self.query_plan_or_sql {
            Some(TurnQuery::Plan(descriptor)) => Some(descriptor),
            _ => None,
        }
    }

    fn structured_intent(&self) -> Option<QueryIntent> {
        let intent = self
            .plan()?
            .query_intent
            .as_deref()
            .and_then(|raw| QueryIntent::from_str(raw).ok())
            .unwrap_or_default();
        matches!(intent, QueryIntent::NewQuery | QueryIntent::RefinePrevious).then_some(intent)
    }

    fn has_rows(&self) -> bool {
        self.result_summary
            .as_ref()
            .is_some_and(|summary| !summary.rows.is_empty())
    }

    fn reported_amount(&self) -> Option<(Decimal, amount::AmountSource)> {
        if let Some(scalar) = self
            .result_summary
            .as_ref()
            .and_then(|summary| summary.aggregate_scalar)
        {
            return Some((scalar, amount::AmountSource::AggregateScalar));
        }
        if self.role == TurnRole::Assistant {
            return amount::extract_amount(&self.content);
        }
        None
    }
}

/// Explicit pointer to an earlier turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TurnRef {
    Latest,
    /// Position in the supplied history.
    Index { index: usize },
    /// Candidates counted back from the most recent one; `0` is the most recent.
    Offset { back: usize },
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnRequest {
    #[serde(default)]
    pub history: Vec<ConversationTurn>,
    #[serde(default)]
    pub content: Option<String>,
    #[serde(default)]
    pub query_intent: Option<String>,
    #[serde(default)]
    pub plan: Option<QueryDescriptor>,
    #[serde(default)]
    pub sql: Option<String>,
    #[serde(default)]
    pub target: Option<TurnRef>,
    #[serde(default)]
    pub local_filters: Vec<FilterDescriptor>,
    #[serde(default)]
    pub local_aggregations: Vec<AggregationDescriptor>,
    #[serde(default)]
    pub direct_answer: Option<DirectAnswerRequest>,
    #[serde(default)]
    pub preferred_render_type: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetCandidate {
    pub turn_index: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entity: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub row_count: Option<i64>,
    pub excerpt: String,
}

/// The earlier turn a request was resolved against.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TargetSelection {
    pub turn_index: usize,
    pub explicit: bool,
    pub disclosure: String,
}

/// Rows computed in memory from an earlier turn.
#[derive(Debug, Clone, PartialEq)]
pub struct LocalResult {
    pub rows: Vec<Value>,
    pub entity: Option<String>,
    pub filters: Vec<FilterDescriptor>,
    pub is_aggregation: bool,
    pub aggregate_scalar: Option<Decimal>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// A structured plan to validate and run.
    Execute {
        descriptor: QueryDescriptor,
        intent: QueryIntent,
        target: Option<TargetSelection>,
    },
    Freeform {
        sql: String,
    },
    Local {
        intent: QueryIntent,
        result: LocalResult,
        target: TargetSelection,
    },
    Direct {
        answer: DirectAnswer,
        target: TargetSelection,
    },
}

impl Resolution {
    pub fn intent(&self) -> QueryIntent {
        match self {
            Resolution::Execute { intent, .. } | Resolution::Local { intent, .. } => *intent,
            Resolution::Freeform { .. } => QueryIntent::NewQuery,
            Resolution::Direct { .. } => QueryIntent::DirectAnswer,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Accumulator {
    policy: AmbiguityPolicy,
}

impl Accumulator {
    pub fn new(policy: AmbiguityPolicy) -> Self {
        Self { policy }
    }

    pub fn resolve(&self, request: &TurnRequest) -> Result<Resolution> {
        let intent = requested_intent(request)?;
        let history = request.history.as_slice();
        debug!(intent = intent.as_str(), turns = history.len(), "resolving turn");

        match intent {
            QueryIntent::NewQuery => new_query(request),
            QueryIntent::RefinePrevious => {
                if request.sql.is_some() {
                    return Err(ServiceError::InvalidRequest(
                        "freeform sql cannot refine a previous result; send a plan".into(),
                    ));
                }
                let candidates = candidates(history, |turn| turn.structured_intent().is_some());
                let target = self.select(history, &candidates, request.target, true)?;
                let base = replay(history, target.turn_index).ok_or_else(|| {
                    ServiceError::TargetNotFound(format!(
                        "turn {} has no structured query to refine",
                        target.turn_index
                    ))
                })?;
                let delta = with_render_type(request.plan.clone().unwrap_or_default(), request);
                let (descriptor, intent) = refine(&base, &delta);
                Ok(Resolution::Execute {
                    descriptor,
                    intent,
                    target: Some(target),
                })
            }
            QueryIntent::FilterLocal | QueryIntent::AggregateLocal => {
                let candidates = candidates(history, ConversationTurn::has_rows);
                let target = self.select(history, &candidates, request.target, false)?;
                let result = run_local(intent, &history[target.turn_index], request)?;
                Ok(Resolution::Local {
                    intent,
                    result,
                    target,
                })
            }
            QueryIntent::DirectAnswer => {
                let candidates = candidates(history, |turn| turn.reported_amount().is_some());
                let target = self.select(history, &candidates, request.target, false)?;
                let (base, source) = history[target.turn_index]
                    .reported_amount()
                    .ok_or_else(|| ServiceError::TargetNotFound("no amount to work from".into()))?;
                let direct = request.direct_answer.as_ref().ok_or_else(|| {
                    ServiceError::InvalidRequest("DIRECT_ANSWER requires directAnswer".into())
                })?;
                Ok(Resolution::Direct {
                    answer: amount::answer(base, source, direct)?,
                    target,
                })
            }
        }
    }

    fn select(
        &self,
        history: &[ConversationTurn],
        candidates: &[usize],
        reference: Option<TurnRef>,
        implicit_is_latest: bool,
    ) -> Result<TargetSelection> {
        if let Some(reference) = reference {
            let index = match reference {
                TurnRef::Latest => candidates.last().copied(),
                TurnRef::Index { index } => candidates.contains(&index).then_some(index),
                TurnRef::Offset { back } => back
                    .checked_add(1)
                    .and_then(|depth| candidates.len().checked_sub(depth))
                    .and_then(|position| candidates.get(position).copied()),
            }
            .ok_or_else(|| {
                ServiceError::TargetNotFound(format!(
                    "{reference:?} does not point at a usable turn"
                ))
            })?;
            return Ok(TargetSelection {
                turn_index: index,
                explicit: true,
                disclosure: format!("Using {} as referenced.", describe(history, index)),
            });
        }

        let latest = *candidates.last().ok_or_else(|| {
            ServiceError::TargetNotFound("no earlier turn has a result this turn can use".into())
        })?;
        if candidates.len() > 1
            && !implicit_is_latest
            && self.policy == AmbiguityPolicy::RequireExplicit
        {
            return Err(ServiceError::Ambiguous {
                message: format!(
                    "{} earlier results could be meant; reference one of them",
                    candidates.len()
                ),
                candidates: candidates
                    .iter()
                    .map(|index| candidate(history, *index))
                    .collect(),
            });
        }

        Ok(TargetSelection {
            turn_index: latest,
            explicit: false,
            disclosure: format!(
                "Using {}, the most recent result. Reference another turn to change this.",
                describe(history, latest)
            ),
        })
    }
}

fn requested_intent(request: &TurnRequest) -> Result<QueryIntent> {
    let raw = request.query_intent.as_deref().or_else(|| {
        request
            .plan
            .as_ref()
            .and_then(|plan| plan.query_intent.as_deref())
    });
    match raw {
        None => Ok(QueryIntent::NewQuery),
        Some(raw) => QueryIntent::from_str(raw).map_err(|()| {
            ServiceError::Validation(ValidationErrors::single(ValidationError::new(
                ValidationCode::UnknownQueryIntent,
                "queryIntent",
                format!("unknown queryIntent '{raw}'"),
            )))
        }),
    }
}

fn new_query(request: &TurnRequest) -> Result<Resolution> {
    match (&request.sql, &request.plan) {
        (Some(_), Some(_)) => Err(ServiceError::InvalidRequest(
            "send either a plan or sql, not both".into(),
        )),
        (Some(sql), None) => Ok(Resolution::Freeform { sql: sql.clone() }),
        (None, Some(plan)) => Ok(Resolution::Execute {
            descriptor: with_render_type(standalone(plan), request),
            intent: QueryIntent::NewQuery,
            target: None,
        }),
        (None, None) => Err(ServiceError::InvalidRequest(
            "NEW_QUERY requires a plan or sql".into(),
        )),
    }
}

fn run_local(
    intent: QueryIntent,
    turn: &ConversationTurn,
    request: &TurnRequest,
) -> Result<LocalResult> {
    let summary = turn.result_summary.clone().unwrap_or_default();
    let filtered = if request.local_filters.is_empty() {
        if intent == QueryIntent::FilterLocal {
            return Err(ServiceError::InvalidRequest(
                "FILTER_LOCAL requires localFilters".into(),
            ));
        }
        summary.rows
    } else {
        local::filter_rows(&summary.rows, &request.local_filters)
            .map_err(ServiceError::Validation)?
    };
    let filters = merge_filters(&summary.filters, &request.local_filters);

    if intent == QueryIntent::FilterLocal {
        return Ok(LocalResult {
            rows: filtered,
            entity: summary.entity,
            filters,
            is_aggregation: false,
            aggregate_scalar: None,
        });
    }

    let aggregate = local::aggregate_rows(&filtered, &request.local_aggregations)
        .map_err(ServiceError::Validation)?;
    Ok(LocalResult {
        rows: vec![aggregate.row],
        entity: summary.entity,
        filters,
        is_aggregation: true,
        aggregate_scalar: aggregate.scalar,
    })
}

fn candidates(history: &[ConversationTurn], usable: impl Fn(&ConversationTurn) -> bool) -> Vec<usize> {
    history
        .iter()
        .enumerate()
        .filter(|(_, turn)| usable(turn))
        .map(|(index, _)| index)
        .collect()
}

fn describe(history: &[ConversationTurn], index: usize) -> String {
    let summary = history.get(index).and_then(|turn| turn.result_summary.as_ref());
    match summary {
        Some(ResultSummary {
            entity: Some(entity),
            row_count,
            ..
        }) => format!("turn {index} ({entity}, {row_count} rows)"),
        Some(summary) => format!("turn {index} ({} rows)", summary.row_count),
        None => format!("turn {index}"),
    }
}

fn candidate(history: &[ConversationTurn], index: usize) -> TargetCandidate {
    let turn = &history[index];
    let summary = turn.result_summary.as_ref();
    TargetCandidate {
        turn_index: index,
        entity: summary.and_then(|summary| summary.entity.clone()),
        row_count: summary.map(|summary| summary.row_count),
        excerpt: turn.content.chars().take(EXCERPT_CHARS).collect(),
    }
}

/// Effective descriptor of the structured turn at `upto`, replaying every plan before it.
pub fn replay(history: &[ConversationTurn], upto: usize) -> Option<QueryDescriptor> {
    let mut states: Vec<Option<QueryDescriptor>> = Vec::with_capacity(upto + 1);
    let mut last_structured = None;

    for (index, turn) in history.iter().enumerate().take(upto + 1) {
        let state = match (turn.plan(), turn.structured_intent()) {
            (Some(descriptor), Some(QueryIntent::RefinePrevious)) => {
                let base = turn
                    .refines
                    .filter(|target| *target < index)
                    .or(last_structured)
                    .and_then(|target| states.get(target).cloned().flatten());
                Some(match base {
                    Some(base) => refine(&base, descriptor).0,
                    None => standalone(descriptor),
                })
            }
            (Some(descriptor), Some(_)) => Some(standalone(descriptor)),
            _ => None,
        };
        if state.is_some() {
            last_structured = Some(index);
        }
        states.push(state);
    }

    states.into_iter().nth(upto).flatten()
}

fn standalone(descriptor: &QueryDescriptor) -> QueryDescriptor {
    QueryDescriptor {
        query_intent: Some(QueryIntent::NewQuery.as_str().to_string()),
        ..descriptor.clone()
    }
}

fn with_render_type(mut descriptor: QueryDescriptor, request: &TurnRequest) -> QueryDescriptor {
    if request.preferred_render_type.is_some() {
        descriptor.preferred_render_type = request.preferred_render_type.clone();
    }
    descriptor
}

/// Applies a refinement to the effective descriptor of its target turn.
///
/// A new entity or a newly stated time scope starts over instead of merging, and the returned
/// intent says so.
pub fn refine(base: &QueryDescriptor, delta: &QueryDescriptor) -> (QueryDescriptor, QueryIntent) {
    let entity_changed = match (&base.entity, &delta.entity) {
        (Some(old), Some(new)) => !old.trim().eq_ignore_ascii_case(new.trim()),
        _ => false,
    };
    if entity_changed {
        return (standalone(delta), QueryIntent::NewQuery);
    }

    let time_changed = delta.time_range.as_ref().is_some_and(|new| {
        !base
            .time_range
            .as_ref()
            .is_some_and(|old| same_time_scope(old, new))
    });
    if time_changed {
        let mut fresh = standalone(delta);
        fresh.entity = fresh.entity.or_else(|| base.entity.clone());
        fresh.operation = fresh.operation.or_else(|| base.operation.clone());
        return (fresh, QueryIntent::NewQuery);
    }

    let mut merged = base.clone();
    let operation_changed = match (&base.operation, &delta.operation) {
        (Some(old), Some(new)) => !old.trim().eq_ignore_ascii_case(new.trim()),
        (None, Some(_)) => true,
        _ => false,
    };
    if operation_changed {
        merged.operation = delta.operation.clone();
        merged.fields.clear();
        merged.group_by.clear();
        merged.aggregations.clear();
        merged.order_by.clear();
    }
    if !delta.fields.is_empty() {
        merged.fields = delta.fields.clone();
    }
    if !delta.group_by.is_empty() {
        merged.group_by = delta.group_by.clone();
    }
    if !delta.aggregations.is_empty() {
        merged.aggregations = delta.aggregations.clone();
    }
    if !delta.order_by.is_empty() {
        merged.order_by = delta.order_by.clone();
    }
    if delta.limit.is_some() {
        merged.limit = delta.limit.clone();
    }
    merged.filters = merge_filters(&base.filters, &delta.filters);
    merged.preferred_render_type = delta.preferred_render_type.clone();
    merged.query_intent = Some(QueryIntent::RefinePrevious.as_str().to_string());
    (merged, QueryIntent::RefinePrevious)
}

/// Field-level replace, cross-field union: `{old minus fields present in new} ∪ new`.
///
/// The result holds at most one predicate per field; within `new` the last one wins.
pub fn merge_filters(old: &[FilterDescriptor], new: &[FilterDescriptor]) -> Vec<FilterDescriptor> {
    let mut merged: Vec<FilterDescriptor> = Vec::with_capacity(old.len() + new.len());
    for filter in old.iter().chain(new) {
        match merged
            .iter_mut()
            .find(|existing| same_field(existing, filter))
        {
            Some(existing) => *existing = filter.clone(),
            None => merged.push(filter.clone()),
        }
    }
    merged
}

fn same_field(left: &FilterDescriptor, right: &FilterDescriptor) -> bool {
    match (left.field.as_deref(), right.field.as_deref()) {
        (Some(left), Some(right)) => left.trim().eq_ignore_ascii_case(right.trim()),
        _ => false,
    }
}

fn same_time_scope(old: &TimeRangeDescriptor, new: &TimeRangeDescriptor) -> bool {
    if let (Some(old_field), Some(new_field)) = (&old.field, &new.field) {
        if !old_field.trim().eq_ignore_ascii_case(new_field.trim()) {
            return false;
        }
    }
    match (old.preset.as_deref(), new.preset.as_deref()) {
        (Some(old_preset), Some(new_preset)) => match (parse_preset(old_preset), parse_preset(new_preset)) {
            (Some(left), Some(right)) => left == right,
            _ => old_preset.trim().eq_ignore_ascii_case(new_preset.trim()),
        },
        (None, Some(_)) => false,
        (_, None) => {
            let bound = |raw: &Option<String>| raw.as_deref().and_then(parse_datetime);
            bound(&old.start) == bound(&new.start) && bound(&old.end) == bound(&new.end)
        }
    }
}
