//! Compiles validated plans into parameterized PostgreSQL.
//!
//! Every identifier the builder emits is double-quoted: physical columns are qualified as
//! `"table"."column"` and every output column carries a quoted alias, so mixed-case logical
//! names such as `totalAmount` survive case folding and come back exactly as requested.

use crate::{
    error::{Result, ServiceError},
    plan::{
        Aggregation, Filter, FilterOperator, FilterValue, Operation, QueryPlan, ScalarValue,
        TimeRange,
    },
    registry::{EntityMapping, FieldDef, FieldRegistry},
};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "t", content = "v", rename_all = "snake_case")]
pub enum BindParam {
    Text(String),
    Int(i64),
    /// Bound as text and cast to `numeric` in the statement.
    Decimal(Decimal),
    Bool(bool),
    Timestamptz(DateTime<Utc>),
}

/// A statement with `$n` placeholders and its positional binds.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CompiledQuery {
    pub sql: String,
    pub params: Vec<BindParam>,
}

impl CompiledQuery {
    pub fn raw(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            params: Vec::new(),
        }
    }
}

/// Extra output column numbering data-query rows in their ORDER BY sequence. Aliases cannot
/// contain `#`, so it never collides with a requested column.
pub const POSITION_COLUMN: &str = "#position";

#[derive(Debug, Clone, Copy)]
pub struct QueryBuilder {
    registry: &'static FieldRegistry,
    max_limit: i64,
}

impl QueryBuilder {
    pub fn new(registry: &'static FieldRegistry, max_limit: i64) -> Self {
        Self {
            registry,
            max_limit: max_limit.max(1),
        }
    }

    /// Window size actually emitted for a plan.
    pub fn page_size(&self, plan: &QueryPlan) -> i64 {
        plan.limit.clamp(1, self.max_limit)
    }

    pub fn data_query(&self, plan: &QueryPlan, offset: i64) -> Result<CompiledQuery> {
        let entity = self.entity(plan)?;
        let mut binds = Vec::new();

        let select = match plan.operation {
            Operation::List | Operation::Search => list_select(entity, plan)?,
            Operation::Aggregate => aggregate_select(entity, plan)?,
        };

        let order = order_by(entity, plan)?;
        let position = format!(
            "row_number() OVER ({}) AS {}",
            window_order(&order),
            quote_ident(POSITION_COLUMN)
        );

        let mut sql = format!(
            "SELECT {select}, {position}\nFROM {}",
            quote_ident(entity.table)
        );
        push_where(&mut sql, entity, plan, &mut binds)?;

        if plan.operation == Operation::Aggregate && !plan.group_by.is_empty() {
            sql.push_str("\nGROUP BY ");
            sql.push_str(&group_columns(entity, plan)?.join(", "));
        }

        if !order.is_empty() {
            sql.push_str("\nORDER BY ");
            sql.push_str(
                &order
                    .iter()
                    .map(|term| term.output.as_str())
                    .collect::<Vec<_>>()
                    .join(", "),
            );
        }

        sql.push_str("\nLIMIT ? OFFSET ?");
        binds.push(BindParam::Int(self.page_size(plan)));
        binds.push(BindParam::Int(offset.max(0)));

        Ok(CompiledQuery {
            sql: rewrite_placeholders(&sql),
            params: binds,
        })
    }

    /// Counts the rows the unpaginated data query would produce.
    pub fn count_query(&self, plan: &QueryPlan) -> Result<CompiledQuery> {
        let entity = self.entity(plan)?;
        let mut binds = Vec::new();

        let sql = match plan.operation {
            Operation::List | Operation::Search => {
                let mut sql = format!(
                    "SELECT COUNT(*) AS \"total\"\nFROM {}",
                    quote_ident(entity.table)
                );
                push_where(&mut sql, entity, plan, &mut binds)?;
                sql
            }
            Operation::Aggregate => {
                let mut inner = format!("SELECT 1\nFROM {}", quote_ident(entity.table));
                push_where(&mut inner, entity, plan, &mut binds)?;
                if !plan.group_by.is_empty() {
                    inner.push_str("\nGROUP BY ");
                    inner.push_str(&group_columns(entity, plan)?.join(", "));
                }
                format!("SELECT COUNT(*) AS \"total\"\nFROM (\n{inner}\n) AS \"groups\"")
            }
        };

        Ok(CompiledQuery {
            sql: rewrite_placeholders(&sql),
            params: binds,
        })
    }

    fn entity(&self, plan: &QueryPlan) -> Result<&'static EntityMapping> {
        self.registry
            .resolve_entity(&plan.entity)
            .map_err(|err| internal(format!("builder received unvalidated plan: {err}")))
    }
}

fn internal(message: String) -> ServiceError {
    ServiceError::Internal(anyhow::anyhow!(message))
}

fn field(entity: &EntityMapping, logical: &str) -> Result<&'static FieldDef> {
    entity.field(logical).ok_or_else(|| {
        internal(format!(
            "builder received unregistered field '{logical}' for {}",
            entity.name
        ))
    })
}

fn column(entity: &EntityMapping, def: &FieldDef) -> String {
    format!("{}.{}", quote_ident(entity.table), quote_ident(def.column))
}

fn list_select(entity: &EntityMapping, plan: &QueryPlan) -> Result<String> {
    let defs: Vec<&FieldDef> = if plan.fields.is_empty() {
        entity.fields.iter().collect()
    } else {
        plan.fields
            .iter()
            .map(|name| field(entity, name))
            .collect::<Result<_>>()?
    };

    Ok(defs
        .into_iter()
        .map(|def| format!("{} AS {}", column(entity, def), quote_ident(def.logical)))
        .collect::<Vec<_>>()
        .join(", "))
}

fn aggregate_select(entity: &EntityMapping, plan: &QueryPlan) -> Result<String> {
    if plan.aggregations.is_empty() {
        return Err(internal("aggregate plan without aggregations".into()));
    }

    let mut parts = Vec::with_capacity(plan.group_by.len() + plan.aggregations.len());
    for name in &plan.group_by {
        let def = field(entity, name)?;
        parts.push(format!("{} AS {}", column(entity, def), quote_ident(def.logical)));
    }
    for agg in &plan.aggregations {
        parts.push(format!(
            "{} AS {}",
            aggregate_expr(entity, agg)?,
            quote_ident(&agg.alias)
        ));
    }
    Ok(parts.join(", "))
}

fn aggregate_expr(entity: &EntityMapping, agg: &Aggregation) -> Result<String> {
    if agg.field == "*" {
        return Ok(format!("{}(*)", agg.function.sql_name()));
    }
    let def = field(entity, &agg.field)?;
    Ok(format!("{}({})", agg.function.sql_name(), column(entity, def)))
}

fn group_columns(entity: &EntityMapping, plan: &QueryPlan) -> Result<Vec<String>> {
    plan.group_by
        .iter()
        .map(|name| field(entity, name).map(|def| column(entity, def)))
        .collect()
}

fn push_where(
    sql: &mut String,
    entity: &EntityMapping,
    plan: &QueryPlan,
    binds: &mut Vec<BindParam>,
) -> Result<()> {
    let mut clauses = Vec::new();

    match plan.time_range.as_ref() {
        Some(range) => {
            let (clause, mut values) = time_clause(entity, range)?;
            clauses.push(clause);
            binds.append(&mut values);
        }
        None if entity.time_range_required => {
            return Err(internal(format!(
                "{} plan reached the builder without its mandatory time range",
                entity.name
            )));
        }
        None => {}
    }

    for filter in &plan.filters {
        let (clause, mut values) = filter_clause(entity, filter)?;
        clauses.push(clause);
        binds.append(&mut values);
    }

    if !clauses.is_empty() {
        sql.push_str("\nWHERE ");
        sql.push_str(&clauses.join(" AND "));
    }
    Ok(())
}

fn time_clause(entity: &EntityMapping, range: &TimeRange) -> Result<(String, Vec<BindParam>)> {
    let def = field(entity, &range.field)?;
    let col = column(entity, def);
    Ok((
        format!("{col} >= ? AND {col} <= ?"),
        vec![
            BindParam::Timestamptz(range.start),
            BindParam::Timestamptz(range.end),
        ],
    ))
}

fn filter_clause(entity: &EntityMapping, filter: &Filter) -> Result<(String, Vec<BindParam>)> {
    let def = field(entity, &filter.field)?;
    let col = column(entity, def);

    let comparison = |op: &str| -> Result<(String, Vec<BindParam>)> {
        let value = scalar(filter)?;
        Ok((
            format!("{col} {op} {}", placeholder(value)),
            vec![bind(value)],
        ))
    };

    match filter.operator {
        FilterOperator::Eq => comparison("="),
        FilterOperator::Ne => comparison("<>"),
        FilterOperator::Gt => comparison(">"),
        FilterOperator::Gte => comparison(">="),
        FilterOperator::Lt => comparison("<"),
        FilterOperator::Lte => comparison("<="),
        FilterOperator::Like => {
            let ScalarValue::Text(value) = scalar(filter)? else {
                return Err(internal(format!("like on non-text value for '{}'", filter.field)));
            };
            Ok((
                format!("{col} LIKE ?"),
                vec![BindParam::Text(format!("%{}%", escape_like(value)))],
            ))
        }
        FilterOperator::In => {
            let FilterValue::List(values) = &filter.value else {
                return Err(internal(format!("in without a value list for '{}'", filter.field)));
            };
            if values.is_empty() {
                return Err(internal(format!("in with an empty list for '{}'", filter.field)));
            }
            let placeholders: Vec<&str> = values.iter().map(placeholder).collect();
            Ok((
                format!("{col} IN ({})", placeholders.join(", ")),
                values.iter().map(bind).collect(),
            ))
        }
        FilterOperator::Between => {
            let FilterValue::Range(low, high) = &filter.value else {
                return Err(internal(format!("between without two bounds for '{}'", filter.field)));
            };
            Ok((
                format!("{col} BETWEEN {} AND {}", placeholder(low), placeholder(high)),
                vec![bind(low), bind(high)],
            ))
        }
    }
}

fn scalar(filter: &Filter) -> Result<&ScalarValue> {
    match &filter.value {
        FilterValue::Scalar(value) => Ok(value),
        _ => Err(internal(format!(
            "{} expects a scalar value for '{}'",
            filter.operator.as_str(),
            filter.field
        ))),
    }
}

fn placeholder(value: &ScalarValue) -> &'static str {
    match value {
        ScalarValue::Decimal(_) => "CAST(? AS numeric)",
        _ => "?",
    }
}

fn bind(value: &ScalarValue) -> BindParam {
    match value {
        ScalarValue::Text(value) => BindParam::Text(value.clone()),
        ScalarValue::Integer(value) => BindParam::Int(*value),
        ScalarValue::Decimal(value) => BindParam::Decimal(*value),
        ScalarValue::Timestamp(value) => BindParam::Timestamptz(*value),
        ScalarValue::Boolean(value) => BindParam::Bool(*value),
    }
}

/// One sort key, spelled for the ORDER BY clause and for the window that numbers the rows.
/// They differ for aggregate aliases: the window cannot see output names.
struct OrderTerm {
    output: String,
    window: String,
}

impl OrderTerm {
    fn column(expr: String, direction: &str) -> Self {
        let term = format!("{expr} {direction}");
        Self {
            output: term.clone(),
            window: term,
        }
    }
}

fn window_order(order: &[OrderTerm]) -> String {
    if order.is_empty() {
        return String::new();
    }
    let terms: Vec<&str> = order.iter().map(|term| term.window.as_str()).collect();
    format!("ORDER BY {}", terms.join(", "))
}

fn order_by(entity: &EntityMapping, plan: &QueryPlan) -> Result<Vec<OrderTerm>> {
    let mut order = Vec::with_capacity(plan.order_by.len() + 1);
    let mut ordered: Vec<&str> = Vec::new();

    for clause in &plan.order_by {
        let direction = clause.direction.sql();
        let alias = match plan.operation {
            Operation::Aggregate => plan.aggregations.iter().find(|agg| agg.alias == clause.field),
            _ => None,
        };
        match alias {
            Some(agg) => order.push(OrderTerm {
                output: format!("{} {direction}", quote_ident(&clause.field)),
                window: format!("{} {direction}", aggregate_expr(entity, agg)?),
            }),
            None => {
                let def = field(entity, &clause.field)?;
                order.push(OrderTerm::column(column(entity, def), direction));
            }
        }
        ordered.push(clause.field.as_str());
    }

    match plan.operation {
        Operation::List | Operation::Search => {
            let key = entity.primary_key_def();
            if !ordered.contains(&key.logical) {
                order.push(OrderTerm::column(column(entity, key), "ASC"));
            }
        }
        Operation::Aggregate => {
            for name in &plan.group_by {
                if !ordered.contains(&name.as_str()) {
                    let def = field(entity, name)?;
                    order.push(OrderTerm::column(column(entity, def), "ASC"));
                }
            }
        }
    }

    Ok(order)
}

pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn escape_like(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for ch in value.chars() {
        if matches!(ch, '%' | '_' | '\\') {
            escaped.push('\\');
        }
        escaped.push(ch);
    }
    escaped
}

fn rewrite_placeholders(sql: &str) -> String {
    let mut result = String::with_capacity(sql.len());
    let mut index = 1;
    for ch in sql.chars() {
        if ch == '?' {
            result.push('$');
            result.push_str(&index.to_string());
            index += 1;
        } else {
            result.push(ch);
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{plan::QueryDescriptor, validator::PlanValidator};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn now() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2025-06-30T00:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn plan(raw: serde_json::Value) -> QueryPlan {
        let descriptor: QueryDescriptor = serde_json::from_value(raw).unwrap();
        PlanValidator::new(FieldRegistry::global(), 20, 1000)
            .validate_at(&descriptor, now())
            .expect("fixture plan should validate")
    }

    fn builder() -> QueryBuilder {
        QueryBuilder::new(FieldRegistry::global(), 1000)
    }

    #[test]
    fn filters_use_physical_columns() {
        let compiled = builder()
            .data_query(
                &plan(json!({
                    "entity": "Payment",
                    "operation": "list",
                    "fields": ["paymentKey", "amount"],
                    "filters": [{"field": "status", "operator": "eq", "value": "DONE"}],
                    "timeRange": {"start": "2025-04-01", "end": "2025-06-30"},
                    "limit": 10
                })),
                0,
            )
            .unwrap();

        assert_eq!(
            compiled.sql,
            "SELECT \"payments\".\"payment_key\" AS \"paymentKey\", \"payments\".\"total_amount\" AS \"amount\", \
             row_number() OVER (ORDER BY \"payments\".\"payment_key\" ASC) AS \"#position\"\n\
             FROM \"payments\"\n\
             WHERE \"payments\".\"requested_at\" >= $1 AND \"payments\".\"requested_at\" <= $2 AND \"payments\".\"status\" = $3\n\
             ORDER BY \"payments\".\"payment_key\" ASC\n\
             LIMIT $4 OFFSET $5"
        );
        assert_eq!(compiled.params[2], BindParam::Text("DONE".into()));
        assert_eq!(compiled.params[3], BindParam::Int(10));
        assert_eq!(compiled.params[4], BindParam::Int(0));
    }

    #[test]
    fn aggregation_aliases_stay_quoted_and_case_exact() {
        let compiled = builder()
            .data_query(
                &plan(json!({
                    "entity": "Payment",
                    "operation": "aggregate",
                    "groupBy": ["merchantId"],
                    "aggregations": [{"function": "sum", "field": "amount", "alias": "totalAmount"}],
                    "orderBy": [{"field": "totalAmount", "direction": "desc"}],
                    "timeRange": {"preset": "last_3_months"}
                })),
                0,
            )
            .unwrap();

        assert!(
            compiled
                .sql
                .contains("SUM(\"payments\".\"total_amount\") AS \"totalAmount\""),
            "alias must be quoted: {}",
            compiled.sql
        );
        assert!(!compiled.sql.contains("AS totalAmount"));
        assert!(compiled.sql.contains("GROUP BY \"payments\".\"merchant_id\""));
        assert!(compiled
            .sql
            .contains("ORDER BY \"totalAmount\" DESC, \"payments\".\"merchant_id\" ASC"));
        assert!(
            compiled.sql.contains(
                "row_number() OVER (ORDER BY SUM(\"payments\".\"total_amount\") DESC, \
                 \"payments\".\"merchant_id\" ASC) AS \"#position\""
            ),
            "window must repeat the sort with expressions: {}",
            compiled.sql
        );
    }

    #[test]
    fn operators_translate_with_typed_binds() {
        let compiled = builder()
            .data_query(
                &plan(json!({
                    "entity": "Payment",
                    "operation": "search",
                    "filters": [
                        {"field": "method", "operator": "in", "value": ["CARD", "TRANSFER"]},
                        {"field": "amount", "operator": "between", "value": [1000, 5000]},
                        {"field": "orderName", "operator": "like", "value": "50%_off"},
                        {"field": "installmentMonths", "operator": "gte", "value": 3}
                    ],
                    "timeRange": {"preset": "last_7d"}
                })),
                40,
            )
            .unwrap();

        assert!(compiled.sql.contains("\"payments\".\"method\" IN ($3, $4)"));
        assert!(compiled.sql.contains(
            "\"payments\".\"total_amount\" BETWEEN CAST($5 AS numeric) AND CAST($6 AS numeric)"
        ));
        assert!(compiled.sql.contains("\"payments\".\"order_name\" LIKE $7"));
        assert!(compiled.sql.contains("\"payments\".\"installment_plan_months\" >= $8"));
        assert_eq!(compiled.params[4], BindParam::Decimal(Decimal::new(1000, 0)));
        assert_eq!(compiled.params[6], BindParam::Text("%50\\%\\_off%".into()));
        assert_eq!(compiled.params[7], BindParam::Int(3));
        assert_eq!(compiled.params.last(), Some(&BindParam::Int(40)));
    }

    #[test]
    fn limit_never_exceeds_max() {
        let mut plan = plan(json!({"entity": "Merchant", "operation": "list", "limit": 1000}));
        plan.limit = 5000;
        let compiled = QueryBuilder::new(FieldRegistry::global(), 100)
            .data_query(&plan, 0)
            .unwrap();
        assert_eq!(compiled.params[0], BindParam::Int(100));
        assert!(compiled.sql.ends_with("LIMIT $1 OFFSET $2"));
    }

    #[test]
    fn missing_mandatory_time_range_is_an_internal_fault() {
        let mut plan = plan(json!({
            "entity": "Payment",
            "operation": "list",
            "timeRange": {"preset": "today"}
        }));
        plan.time_range = None;
        let err = builder().data_query(&plan, 0).unwrap_err();
        assert!(matches!(err, ServiceError::Internal(_)));
    }

    #[test]
    fn unregistered_field_is_an_internal_fault() {
        let mut plan = plan(json!({"entity": "Merchant", "operation": "list"}));
        plan.fields = vec!["ghost".into()];
        assert!(matches!(
            builder().data_query(&plan, 0),
            Err(ServiceError::Internal(_))
        ));
    }

    #[test]
    fn count_query_shares_predicates_without_window() {
        let plan = plan(json!({
            "entity": "Payment",
            "operation": "list",
            "filters": [{"field": "merchantId", "operator": "eq", "value": "mer_001"}],
            "timeRange": {"start": "2025-04-01", "end": "2025-06-30"}
        }));
        let count = builder().count_query(&plan).unwrap();
        assert_eq!(
            count.sql,
            "SELECT COUNT(*) AS \"total\"\n\
             FROM \"payments\"\n\
             WHERE \"payments\".\"requested_at\" >= $1 AND \"payments\".\"requested_at\" <= $2 AND \"payments\".\"merchant_id\" = $3"
        );
        assert_eq!(count.params.len(), 3);
    }

    #[test]
    fn aggregate_count_counts_groups() {
        let plan = plan(json!({
            "entity": "Merchant",
            "operation": "aggregate",
            "groupBy": ["category"],
            "aggregations": [{"function": "count"}]
        }));
        let count = builder().count_query(&plan).unwrap();
        assert!(count.sql.contains("GROUP BY \"merchants\".\"category\"\n) AS \"groups\""));

        let data = builder().data_query(&plan, 0).unwrap();
        assert!(data.sql.contains("COUNT(*) AS \"countAll\""));
    }

    #[test]
    fn quote_ident_escapes_embedded_quotes() {
        assert_eq!(quote_ident("totalAmount"), "\"totalAmount\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
    }
}
