//! FILTER_LOCAL and AGGREGATE_LOCAL: predicates and aggregates over rows a previous turn already
//! materialized. Rows are JSON objects keyed by output alias, so fields are matched by key and
//! values are compared by what they look like (number, timestamp, text or boolean).

use crate::{
    plan::{AggregateFunction, AggregationDescriptor, FilterDescriptor, FilterOperator},
    time::parse_datetime,
    validator::{
        default_alias, is_valid_alias, parse_decimal, ValidationCode, ValidationError,
        ValidationErrors,
    },
};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde_json::{Map, Value};
use std::{cmp::Ordering, collections::HashSet, str::FromStr};

const AVG_SCALE: u32 = 2;

#[derive(Debug, Clone)]
struct LocalPredicate {
    field: String,
    operator: FilterOperator,
    operands: Vec<Value>,
}

/// Keeps the rows matching every filter.
pub fn filter_rows(rows: &[Value], filters: &[FilterDescriptor]) -> Result<Vec<Value>, ValidationErrors> {
    let predicates = parse_predicates(rows, filters)?;
    Ok(rows
        .iter()
        .filter(|row| predicates.iter().all(|predicate| predicate.matches(row)))
        .cloned()
        .collect())
}

/// A single-row aggregate over local rows plus the first aggregate as a scalar.
#[derive(Debug, Clone, PartialEq)]
pub struct LocalAggregate {
    pub row: Value,
    pub scalar: Option<Decimal>,
}

pub fn aggregate_rows(
    rows: &[Value],
    aggregations: &[AggregationDescriptor],
) -> Result<LocalAggregate, ValidationErrors> {
    if aggregations.is_empty() {
        return Err(ValidationErrors::single(ValidationError::new(
            ValidationCode::OperationClauseMismatch,
            "localAggregations",
            "AGGREGATE_LOCAL requires at least one aggregation",
        )));
    }

    let mut output = Map::new();
    let mut scalar = None;
    let mut seen = HashSet::new();
    for (index, raw) in aggregations.iter().enumerate() {
        let path = format!("localAggregations[{index}]");
        let function = raw
            .function
            .as_deref()
            .and_then(|name| AggregateFunction::from_str(name).ok())
            .ok_or_else(|| {
                single(
                    ValidationCode::InvalidAggregationFunction,
                    format!("{path}.function"),
                    format!(
                        "unsupported aggregation function '{}'",
                        raw.function.as_deref().unwrap_or_default()
                    ),
                )
            })?;

        let field = raw
            .field
            .as_deref()
            .map(str::trim)
            .filter(|field| !field.is_empty())
            .unwrap_or("*")
            .to_string();
        if field == "*" && function != AggregateFunction::Count {
            return Err(single(
                ValidationCode::MissingField,
                format!("{path}.field"),
                format!("{} requires a field", function.as_str()),
            ));
        }
        if field != "*" {
            ensure_known_field(rows, &field, &format!("{path}.field"))?;
        }

        let alias = raw
            .alias
            .clone()
            .unwrap_or_else(|| default_alias(function, &field));
        if !is_valid_alias(&alias) {
            return Err(single(
                ValidationCode::InvalidAlias,
                format!("{path}.alias"),
                format!("alias '{alias}' is not a valid identifier"),
            ));
        }
        if !seen.insert(alias.clone()) {
            return Err(single(
                ValidationCode::DuplicateAlias,
                format!("{path}.alias"),
                format!("alias '{alias}' is used more than once"),
            ));
        }

        let value = compute(function, &field, rows).ok_or_else(|| {
            single(
                ValidationCode::AggregateOverflow,
                path.clone(),
                format!("{} of '{field}' exceeds the representable range", function.as_str()),
            )
        })?;
        if scalar.is_none() {
            scalar = value;
        }
        output.insert(alias, value.map(decimal_to_json).unwrap_or(Value::Null));
    }

    Ok(LocalAggregate {
        row: Value::Object(output),
        scalar,
    })
}

/// `None` when the sum leaves the decimal range; `Some(None)` when the field has no numeric values.
fn compute(function: AggregateFunction, field: &str, rows: &[Value]) -> Option<Option<Decimal>> {
    if function == AggregateFunction::Count {
        let count = if field == "*" {
            rows.len()
        } else {
            rows.iter()
                .filter(|row| row.get(field).is_some_and(|value| !value.is_null()))
                .count()
        };
        return Some(Some(Decimal::from(count)));
    }

    let values: Vec<Decimal> = rows
        .iter()
        .filter_map(|row| row.get(field).and_then(as_decimal))
        .collect();
    if values.is_empty() {
        return Some(None);
    }
    let total = || {
        values
            .iter()
            .try_fold(Decimal::ZERO, |acc, value| acc.checked_add(*value))
    };
    let value = match function {
        AggregateFunction::Sum => total()?,
        AggregateFunction::Avg => total()?
            .checked_div(Decimal::from(values.len()))?
            .round_dp(AVG_SCALE),
        AggregateFunction::Min => return Some(values.iter().copied().min()),
        AggregateFunction::Max => return Some(values.iter().copied().max()),
        AggregateFunction::Count => return Some(None),
    };
    Some(Some(value))
}

fn decimal_to_json(value: Decimal) -> Value {
    let value = value.normalize();
    if value.fract().is_zero() {
        if let Some(integer) = value.to_i64() {
            return Value::from(integer);
        }
    }
    value
        .to_f64()
        .map(Value::from)
        .unwrap_or_else(|| Value::String(value.to_string()))
}

fn parse_predicates(
    rows: &[Value],
    filters: &[FilterDescriptor],
) -> Result<Vec<LocalPredicate>, ValidationErrors> {
    let mut predicates = Vec::with_capacity(filters.len());
    for (index, raw) in filters.iter().enumerate() {
        let path = format!("localFilters[{index}]");
        let field = raw
            .field
            .as_deref()
            .map(str::trim)
            .filter(|field| !field.is_empty())
            .ok_or_else(|| {
                single(
                    ValidationCode::MissingField,
                    format!("{path}.field"),
                    "filter field is required",
                )
            })?;
        ensure_known_field(rows, field, &format!("{path}.field"))?;

        let operator = match raw.operator.as_deref() {
            None => {
                return Err(single(
                    ValidationCode::MissingField,
                    format!("{path}.operator"),
                    "filter operator is required",
                ))
            }
            Some(name) => FilterOperator::from_str(name).map_err(|_| {
                single(
                    ValidationCode::InvalidOperator,
                    format!("{path}.operator"),
                    format!("unsupported operator '{name}'"),
                )
            })?,
        };

        let operands = match (operator, &raw.value) {
            (FilterOperator::In, Value::Array(values)) if !values.is_empty() => values.clone(),
            (FilterOperator::Between, Value::Array(values)) if values.len() == 2 => values.clone(),
            (FilterOperator::In | FilterOperator::Between, _) => {
                return Err(single(
                    ValidationCode::OperatorArityMismatch,
                    format!("{path}.value"),
                    format!("operator {} needs a list value", operator.as_str()),
                ))
            }
            (_, Value::Array(_) | Value::Object(_) | Value::Null) => {
                return Err(single(
                    ValidationCode::OperatorArityMismatch,
                    format!("{path}.value"),
                    format!("operator {} needs a single value", operator.as_str()),
                ))
            }
            (_, value) => vec![value.clone()],
        };

        predicates.push(LocalPredicate {
            field: field.to_string(),
            operator,
            operands,
        });
    }
    Ok(predicates)
}

fn ensure_known_field(rows: &[Value], field: &str, path: &str) -> Result<(), ValidationErrors> {
    if rows.is_empty() || rows.iter().any(|row| row.get(field).is_some()) {
        return Ok(());
    }
    Err(single(
        ValidationCode::UnknownField,
        path,
        format!("field '{field}' is not present in the previous result"),
    ))
}

fn single(code: ValidationCode, path: impl Into<String>, message: impl Into<String>) -> ValidationErrors {
    ValidationErrors::single(ValidationError::new(code, path, message))
}

impl LocalPredicate {
    fn matches(&self, row: &Value) -> bool {
        let Some(actual) = row.get(&self.field).filter(|value| !value.is_null()) else {
            return false;
        };
        let first = &self.operands[0];
        match self.operator {
            FilterOperator::Eq => compare(actual, first) == Some(Ordering::Equal),
            FilterOperator::Ne => matches!(compare(actual, first), Some(ord) if ord != Ordering::Equal),
            FilterOperator::Gt => compare(actual, first) == Some(Ordering::Greater),
            FilterOperator::Gte => matches!(
                compare(actual, first),
                Some(Ordering::Greater | Ordering::Equal)
            ),
            FilterOperator::Lt => compare(actual, first) == Some(Ordering::Less),
            FilterOperator::Lte => matches!(
                compare(actual, first),
                Some(Ordering::Less | Ordering::Equal)
            ),
            FilterOperator::In => self
                .operands
                .iter()
                .any(|operand| compare(actual, operand) == Some(Ordering::Equal)),
            FilterOperator::Between => {
                let high = &self.operands[1];
                matches!(
                    compare(actual, first),
                    Some(Ordering::Greater | Ordering::Equal)
                ) && matches!(compare(actual, high), Some(Ordering::Less | Ordering::Equal))
            }
            FilterOperator::Like => match (actual.as_str(), first.as_str()) {
                (Some(text), Some(needle)) => text.contains(needle),
                _ => false,
            },
        }
    }
}

fn compare(actual: &Value, expected: &Value) -> Option<Ordering> {
    if let (Value::Bool(left), Value::Bool(right)) = (actual, expected) {
        return Some(left.cmp(right));
    }
    if let (Some(left), Some(right)) = (as_decimal(actual), as_decimal(expected)) {
        return Some(left.cmp(&right));
    }
    let (left, right) = (actual.as_str()?, expected.as_str()?);
    if let (Some(left), Some(right)) = (parse_datetime(left), parse_datetime(right)) {
        return Some(left.cmp(&right));
    }
    Some(left.cmp(right))
}

pub(crate) fn as_decimal(value: &Value) -> Option<Decimal> {
    match value {
        Value::Number(number) => parse_decimal(&number.to_string()),
        Value::String(text) if text.chars().any(|ch| ch.is_ascii_digit()) => parse_decimal(text),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn rows() -> Vec<Value> {
        vec![
            json!({"paymentKey": "pk_1", "status": "DONE", "method": "CARD", "amount": 10000}),
            json!({"paymentKey": "pk_2", "status": "CANCELED", "method": "CARD", "amount": "25000.50"}),
            json!({"paymentKey": "pk_3", "status": "DONE", "method": "TRANSFER", "amount": 4000}),
            json!({"paymentKey": "pk_4", "status": "DONE", "method": "CARD", "amount": null}),
        ]
    }

    fn keys(rows: &[Value]) -> Vec<&str> {
        rows.iter()
            .filter_map(|row| row["paymentKey"].as_str())
            .collect()
    }

    #[test]
    fn filters_rows_in_memory() {
        let rows = rows();
        let done_cards = filter_rows(
            &rows,
            &[
                FilterDescriptor::new("status", "eq", json!("DONE")),
                FilterDescriptor::new("method", "eq", json!("CARD")),
            ],
        )
        .unwrap();
        assert_eq!(keys(&done_cards), vec!["pk_1", "pk_4"]);

        let large = filter_rows(&rows, &[FilterDescriptor::new("amount", "gte", json!("10,000"))]).unwrap();
        assert_eq!(keys(&large), vec!["pk_1", "pk_2"]);

        let ranged = filter_rows(
            &rows,
            &[FilterDescriptor::new("amount", "between", json!([3000, 12000]))],
        )
        .unwrap();
        assert_eq!(keys(&ranged), vec!["pk_1", "pk_3"]);

        let listed = filter_rows(
            &rows,
            &[FilterDescriptor::new("paymentKey", "in", json!(["pk_2", "pk_3"]))],
        )
        .unwrap();
        assert_eq!(keys(&listed), vec!["pk_2", "pk_3"]);
    }

    #[test]
    fn rejects_fields_missing_from_the_result() {
        let err = filter_rows(&rows(), &[FilterDescriptor::new("cardCompany", "eq", json!("KB"))])
            .unwrap_err();
        assert_eq!(err.primary().code, ValidationCode::UnknownField);
        assert_eq!(err.primary().path, "localFilters[0].field");
    }

    #[test]
    fn rejects_bad_operator_arity() {
        let err = filter_rows(&rows(), &[FilterDescriptor::new("amount", "between", json!([1]))])
            .unwrap_err();
        assert_eq!(err.primary().code, ValidationCode::OperatorArityMismatch);

        let err = filter_rows(&rows(), &[FilterDescriptor::new("amount", "approx", json!(1))])
            .unwrap_err();
        assert_eq!(err.primary().code, ValidationCode::InvalidOperator);
    }

    #[test]
    fn aggregates_over_fetched_rows() {
        let aggregate = aggregate_rows(
            &rows(),
            &[
                AggregationDescriptor {
                    function: Some("sum".into()),
                    field: Some("amount".into()),
                    alias: None,
                },
                AggregationDescriptor {
                    function: Some("count".into()),
                    field: None,
                    alias: None,
                },
                AggregationDescriptor {
                    function: Some("avg".into()),
                    field: Some("amount".into()),
                    alias: Some("avgAmount".into()),
                },
                AggregationDescriptor {
                    function: Some("max".into()),
                    field: Some("amount".into()),
                    alias: None,
                },
            ],
        )
        .unwrap();

        assert_eq!(aggregate.scalar, Some(Decimal::from_str("39000.50").unwrap()));
        assert_eq!(aggregate.row["sumAmount"], json!(39000.5));
        assert_eq!(aggregate.row["countAll"], json!(4));
        let avg = aggregate.row["avgAmount"].as_f64().unwrap();
        assert!((avg - 13000.17).abs() < 1e-9, "avg rounds to two places, got {avg}");
        assert_eq!(aggregate.row["maxAmount"], json!(25000.5));
    }

    #[test]
    fn aggregates_of_no_values_are_null() {
        let empty: Vec<Value> = Vec::new();
        let aggregate = aggregate_rows(
            &empty,
            &[AggregationDescriptor {
                function: Some("sum".into()),
                field: Some("amount".into()),
                alias: None,
            }],
        )
        .unwrap();
        assert_eq!(aggregate.row, json!({"sumAmount": null}));
        assert_eq!(aggregate.scalar, None);
    }

    #[test]
    fn rejects_duplicate_local_aliases() {
        let sum = AggregationDescriptor {
            function: Some("sum".into()),
            field: Some("amount".into()),
            alias: None,
        };
        let err = aggregate_rows(&rows(), &[sum.clone(), sum]).unwrap_err();
        assert_eq!(err.primary().code, ValidationCode::DuplicateAlias);
    }

    #[test]
    fn overflowing_sums_are_reported_not_computed() {
        let huge = vec![
            json!({"amount": "50000000000000000000000000000"}),
            json!({"amount": "50000000000000000000000000000"}),
        ];
        let over = |function: &str| AggregationDescriptor {
            function: Some(function.into()),
            field: Some("amount".into()),
            alias: None,
        };

        for function in ["sum", "avg"] {
            let err = aggregate_rows(&huge, &[over(function)]).unwrap_err();
            assert_eq!(err.primary().code, ValidationCode::AggregateOverflow, "{function}");
            assert_eq!(err.primary().path, "localAggregations[0]");
        }

        let max = aggregate_rows(&huge, &[over("max")]).unwrap();
        assert_eq!(
            max.scalar,
            Some(Decimal::from_str("50000000000000000000000000000").unwrap())
        );
    }
}
