//! Query descriptors as supplied by the language layer and the validated plans derived from them.
//!
//! A [`QueryDescriptor`] is lenient: every field is optional and values are kept as raw JSON so
//! the validator can report exactly which token is wrong. A [`QueryPlan`] only exists after
//! validation and carries registry-canonical names and typed filter values. Both serialize to the
//! same camelCase JSON shape, so an executed plan stored in conversation history reads back as a
//! descriptor.

use crate::time::TimeBounds;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryDescriptor {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operation: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub filters: Vec<FilterDescriptor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time_range: Option<TimeRangeDescriptor>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub group_by: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub aggregations: Vec<AggregationDescriptor>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub order_by: Vec<OrderDescriptor>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query_intent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preferred_render_type: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct FilterDescriptor {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub operator: Option<String>,
    #[serde(default)]
    pub value: Value,
}

impl FilterDescriptor {
    pub fn new(field: &str, operator: &str, value: Value) -> Self {
        Self {
            field: Some(field.to_string()),
            operator: Some(operator.to_string()),
            value,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct TimeRangeDescriptor {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preset: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct AggregationDescriptor {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize, Serialize)]
pub struct OrderDescriptor {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub direction: Option<String>,
}

/// Database operation requested by a plan. Never mixed with [`QueryIntent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    List,
    Aggregate,
    Search,
}

impl FromStr for Operation {
    type Err = ();

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_lowercase().as_str() {
            "list" => Ok(Operation::List),
            "aggregate" => Ok(Operation::Aggregate),
            "search" => Ok(Operation::Search),
            _ => Err(()),
        }
    }
}

/// How a conversational turn relates to earlier results.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QueryIntent {
    #[default]
    NewQuery,
    RefinePrevious,
    FilterLocal,
    AggregateLocal,
    DirectAnswer,
}

impl FromStr for QueryIntent {
    type Err = ();

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_uppercase().as_str() {
            "NEW_QUERY" => Ok(QueryIntent::NewQuery),
            "REFINE_PREVIOUS" => Ok(QueryIntent::RefinePrevious),
            "FILTER_LOCAL" => Ok(QueryIntent::FilterLocal),
            "AGGREGATE_LOCAL" => Ok(QueryIntent::AggregateLocal),
            "DIRECT_ANSWER" => Ok(QueryIntent::DirectAnswer),
            _ => Err(()),
        }
    }
}

impl QueryIntent {
    pub fn as_str(self) -> &'static str {
        match self {
            QueryIntent::NewQuery => "NEW_QUERY",
            QueryIntent::RefinePrevious => "REFINE_PREVIOUS",
            QueryIntent::FilterLocal => "FILTER_LOCAL",
            QueryIntent::AggregateLocal => "AGGREGATE_LOCAL",
            QueryIntent::DirectAnswer => "DIRECT_ANSWER",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RenderType {
    Table,
    Chart,
    Text,
}

impl FromStr for RenderType {
    type Err = ();

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_lowercase().as_str() {
            "table" => Ok(RenderType::Table),
            "chart" => Ok(RenderType::Chart),
            "text" => Ok(RenderType::Text),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FilterOperator {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
    In,
    Like,
    Between,
}

impl FilterOperator {
    pub fn as_str(self) -> &'static str {
        match self {
            FilterOperator::Eq => "eq",
            FilterOperator::Ne => "ne",
            FilterOperator::Gt => "gt",
            FilterOperator::Gte => "gte",
            FilterOperator::Lt => "lt",
            FilterOperator::Lte => "lte",
            FilterOperator::In => "in",
            FilterOperator::Like => "like",
            FilterOperator::Between => "between",
        }
    }

    pub fn is_ordering(self) -> bool {
        matches!(
            self,
            FilterOperator::Gt
                | FilterOperator::Gte
                | FilterOperator::Lt
                | FilterOperator::Lte
                | FilterOperator::Between
        )
    }
}

impl FromStr for FilterOperator {
    type Err = ();

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_lowercase().as_str() {
            "eq" => Ok(FilterOperator::Eq),
            "ne" => Ok(FilterOperator::Ne),
            "gt" => Ok(FilterOperator::Gt),
            "gte" => Ok(FilterOperator::Gte),
            "lt" => Ok(FilterOperator::Lt),
            "lte" => Ok(FilterOperator::Lte),
            "in" => Ok(FilterOperator::In),
            "like" => Ok(FilterOperator::Like),
            "between" => Ok(FilterOperator::Between),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AggregateFunction {
    Count,
    Sum,
    Avg,
    Min,
    Max,
}

impl AggregateFunction {
    pub fn as_str(self) -> &'static str {
        match self {
            AggregateFunction::Count => "count",
            AggregateFunction::Sum => "sum",
            AggregateFunction::Avg => "avg",
            AggregateFunction::Min => "min",
            AggregateFunction::Max => "max",
        }
    }

    pub fn sql_name(self) -> &'static str {
        match self {
            AggregateFunction::Count => "COUNT",
            AggregateFunction::Sum => "SUM",
            AggregateFunction::Avg => "AVG",
            AggregateFunction::Min => "MIN",
            AggregateFunction::Max => "MAX",
        }
    }
}

impl FromStr for AggregateFunction {
    type Err = ();

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_lowercase().as_str() {
            "count" => Ok(AggregateFunction::Count),
            "sum" => Ok(AggregateFunction::Sum),
            "avg" | "average" | "mean" => Ok(AggregateFunction::Avg),
            "min" => Ok(AggregateFunction::Min),
            "max" => Ok(AggregateFunction::Max),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    Asc,
    Desc,
}

impl SortDirection {
    pub fn sql(self) -> &'static str {
        match self {
            SortDirection::Asc => "ASC",
            SortDirection::Desc => "DESC",
        }
    }
}

impl FromStr for SortDirection {
    type Err = ();

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        match raw.trim().to_lowercase().as_str() {
            "asc" | "ascending" => Ok(SortDirection::Asc),
            "desc" | "descending" => Ok(SortDirection::Desc),
            _ => Err(()),
        }
    }
}

/// A filter value coerced to the registered kind of its field.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ScalarValue {
    Text(String),
    Integer(i64),
    Decimal(Decimal),
    Timestamp(DateTime<Utc>),
    Boolean(bool),
}

impl fmt::Display for ScalarValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScalarValue::Text(value) => f.write_str(value),
            ScalarValue::Integer(value) => write!(f, "{value}"),
            ScalarValue::Decimal(value) => write!(f, "{value}"),
            ScalarValue::Timestamp(value) => f.write_str(&value.to_rfc3339()),
            ScalarValue::Boolean(value) => write!(f, "{value}"),
        }
    }
}

impl ScalarValue {
    pub fn to_json(&self) -> Value {
        match self {
            ScalarValue::Text(value) => Value::String(value.clone()),
            ScalarValue::Integer(value) => Value::from(*value),
            ScalarValue::Decimal(value) => Value::String(value.normalize().to_string()),
            ScalarValue::Timestamp(value) => Value::String(value.to_rfc3339()),
            ScalarValue::Boolean(value) => Value::Bool(*value),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum FilterValue {
    Scalar(ScalarValue),
    List(Vec<ScalarValue>),
    Range(ScalarValue, ScalarValue),
}

impl FilterValue {
    pub fn to_json(&self) -> Value {
        match self {
            FilterValue::Scalar(value) => value.to_json(),
            FilterValue::List(values) => Value::Array(values.iter().map(ScalarValue::to_json).collect()),
            FilterValue::Range(low, high) => Value::Array(vec![low.to_json(), high.to_json()]),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Filter {
    pub field: String,
    pub operator: FilterOperator,
    pub value: FilterValue,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TimeRange {
    pub field: String,
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    /// Preset the bounds were resolved from, kept so a restated preset reads as the same scope.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preset: Option<String>,
}

impl TimeRange {
    pub fn bounds(&self) -> TimeBounds {
        TimeBounds {
            start: self.start,
            end: self.end,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Aggregation {
    pub function: AggregateFunction,
    /// Logical field, or `*` for `count`.
    pub field: String,
    pub alias: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct OrderClause {
    /// Logical field or, for aggregate plans, an aggregation alias.
    pub field: String,
    pub direction: SortDirection,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryPlan {
    /// Registry-canonical entity name.
    pub entity: String,
    pub operation: Operation,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<String>,
    pub filters: Vec<Filter>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub time_range: Option<TimeRange>,
    pub group_by: Vec<String>,
    pub aggregations: Vec<Aggregation>,
    pub order_by: Vec<OrderClause>,
    pub limit: i64,
    pub query_intent: QueryIntent,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub preferred_render_type: Option<RenderType>,
}

impl From<&Filter> for FilterDescriptor {
    fn from(filter: &Filter) -> Self {
        Self {
            field: Some(filter.field.clone()),
            operator: Some(filter.operator.as_str().to_string()),
            value: filter.value.to_json(),
        }
    }
}

impl From<&QueryPlan> for QueryDescriptor {
    fn from(plan: &QueryPlan) -> Self {
        Self {
            entity: Some(plan.entity.clone()),
            operation: Some(
                match plan.operation {
                    Operation::List => "list",
                    Operation::Aggregate => "aggregate",
                    Operation::Search => "search",
                }
                .to_string(),
            ),
            fields: plan.fields.clone(),
            filters: plan.filters.iter().map(FilterDescriptor::from).collect(),
            time_range: plan.time_range.as_ref().map(|range| TimeRangeDescriptor {
                field: Some(range.field.clone()),
                start: Some(range.start.to_rfc3339()),
                end: Some(range.end.to_rfc3339()),
                preset: range.preset.clone(),
            }),
            group_by: plan.group_by.clone(),
            aggregations: plan
                .aggregations
                .iter()
                .map(|agg| AggregationDescriptor {
                    function: Some(agg.function.as_str().to_string()),
                    field: Some(agg.field.clone()),
                    alias: Some(agg.alias.clone()),
                })
                .collect(),
            order_by: plan
                .order_by
                .iter()
                .map(|clause| OrderDescriptor {
                    field: Some(clause.field.clone()),
                    direction: Some(
                        match clause.direction {
                            SortDirection::Asc => "asc",
                            SortDirection::Desc => "desc",
                        }
                        .to_string(),
                    ),
                })
                .collect(),
            limit: Some(Value::from(plan.limit)),
            query_intent: Some(plan.query_intent.as_str().to_string()),
            preferred_render_type: plan.preferred_render_type.map(|render| {
                match render {
                    RenderType::Table => "table",
                    RenderType::Chart => "chart",
                    RenderType::Text => "text",
                }
                .to_string()
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn descriptor_accepts_camel_case_json() {
        let descriptor: QueryDescriptor = serde_json::from_value(json!({
            "entity": "Payment",
            "operation": "aggregate",
            "filters": [{"field": "status", "operator": "eq", "value": "DONE"}],
            "timeRange": {"preset": "last_3_months"},
            "groupBy": ["merchantId"],
            "aggregations": [{"function": "sum", "field": "amount", "alias": "totalAmount"}],
            "orderBy": [{"field": "totalAmount", "direction": "desc"}],
            "limit": 10,
            "queryIntent": "NEW_QUERY",
            "preferredRenderType": "chart"
        }))
        .expect("descriptor should deserialize");

        assert_eq!(descriptor.entity.as_deref(), Some("Payment"));
        assert_eq!(descriptor.group_by, vec!["merchantId".to_string()]);
        assert_eq!(
            descriptor.time_range.unwrap().preset.as_deref(),
            Some("last_3_months")
        );
        assert_eq!(descriptor.limit, Some(json!(10)));
    }

    #[test]
    fn intent_and_operation_parse_independently() {
        assert_eq!("list".parse::<Operation>(), Ok(Operation::List));
        assert!("REFINE_PREVIOUS".parse::<Operation>().is_err());
        assert_eq!(
            "refine_previous".parse::<QueryIntent>(),
            Ok(QueryIntent::RefinePrevious)
        );
        assert!("aggregate".parse::<QueryIntent>().is_err());
    }

    #[test]
    fn plan_converts_back_into_descriptor() {
        let start = DateTime::parse_from_rfc3339("2025-01-01T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        let plan = QueryPlan {
            entity: "Payment".into(),
            operation: Operation::List,
            fields: vec![],
            filters: vec![Filter {
                field: "amount".into(),
                operator: FilterOperator::Between,
                value: FilterValue::Range(
                    ScalarValue::Decimal(Decimal::new(1000, 0)),
                    ScalarValue::Decimal(Decimal::new(5000, 0)),
                ),
            }],
            time_range: Some(TimeRange {
                field: "requestedAt".into(),
                start,
                end: start,
                preset: None,
            }),
            group_by: vec![],
            aggregations: vec![],
            order_by: vec![],
            limit: 10,
            query_intent: QueryIntent::RefinePrevious,
            preferred_render_type: Some(RenderType::Table),
        };

        let descriptor = QueryDescriptor::from(&plan);
        assert_eq!(descriptor.operation.as_deref(), Some("list"));
        assert_eq!(descriptor.filters[0].value, json!(["1000", "5000"]));
        assert_eq!(
            descriptor.time_range.unwrap().start.as_deref(),
            Some("2025-01-01T00:00:00+00:00")
        );
        assert_eq!(descriptor.query_intent.as_deref(), Some("REFINE_PREVIOUS"));
    }
}
