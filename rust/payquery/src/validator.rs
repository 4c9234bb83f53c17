//! Structural and semantic validation of query descriptors against the field registry.

use crate::{
    plan::{
        AggregateFunction, Aggregation, AggregationDescriptor, Filter, FilterDescriptor,
        FilterOperator, FilterValue, Operation, OrderClause, QueryDescriptor, QueryIntent,
        QueryPlan, RenderType, ScalarValue, SortDirection, TimeRange, TimeRangeDescriptor,
    },
    registry::{EntityMapping, FieldDef, FieldKind, FieldRegistry, RegistryError},
    time::{parse_datetime, parse_preset},
};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use serde_json::Value;
use std::{collections::HashSet, fmt, str::FromStr};

const MAX_FILTER_LIST_VALUES: usize = 200;
const MAX_ALIAS_LEN: usize = 63;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ValidationCode {
    MissingField,
    UnknownEntity,
    EmptyEntity,
    UnknownOperation,
    LimitOutOfRange,
    UnknownField,
    InvalidOperator,
    OperatorArityMismatch,
    InvalidSortDirection,
    InvalidAggregationFunction,
    TimeRangeRequired,
    TimeRangeIncomplete,
    InvalidTimeRange,
    InvalidFilterValue,
    NonNumericAggregation,
    InvalidAlias,
    DuplicateAlias,
    OperationClauseMismatch,
    UnknownQueryIntent,
    UnknownRenderType,
    MalformedDescriptor,
    AggregateOverflow,
}

impl ValidationCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ValidationCode::MissingField => "MISSING_FIELD",
            ValidationCode::UnknownEntity => "UNKNOWN_ENTITY",
            ValidationCode::EmptyEntity => "EMPTY_ENTITY",
            ValidationCode::UnknownOperation => "UNKNOWN_OPERATION",
            ValidationCode::LimitOutOfRange => "LIMIT_OUT_OF_RANGE",
            ValidationCode::UnknownField => "UNKNOWN_FIELD",
            ValidationCode::InvalidOperator => "INVALID_OPERATOR",
            ValidationCode::OperatorArityMismatch => "OPERATOR_ARITY_MISMATCH",
            ValidationCode::InvalidSortDirection => "INVALID_SORT_DIRECTION",
            ValidationCode::InvalidAggregationFunction => "INVALID_AGGREGATION_FUNCTION",
            ValidationCode::TimeRangeRequired => "TIME_RANGE_REQUIRED",
            ValidationCode::TimeRangeIncomplete => "TIME_RANGE_INCOMPLETE",
            ValidationCode::InvalidTimeRange => "INVALID_TIME_RANGE",
            ValidationCode::InvalidFilterValue => "INVALID_FILTER_VALUE",
            ValidationCode::NonNumericAggregation => "NON_NUMERIC_AGGREGATION",
            ValidationCode::InvalidAlias => "INVALID_ALIAS",
            ValidationCode::DuplicateAlias => "DUPLICATE_ALIAS",
            ValidationCode::OperationClauseMismatch => "OPERATION_CLAUSE_MISMATCH",
            ValidationCode::UnknownQueryIntent => "UNKNOWN_QUERY_INTENT",
            ValidationCode::UnknownRenderType => "UNKNOWN_RENDER_TYPE",
            ValidationCode::MalformedDescriptor => "MALFORMED_DESCRIPTOR",
            ValidationCode::AggregateOverflow => "AGGREGATE_OVERFLOW",
        }
    }
}

impl fmt::Display for ValidationCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationError {
    pub code: ValidationCode,
    /// JSON path of the offending token, e.g. `filters[1].operator`.
    pub path: String,
    pub message: String,
}

impl ValidationError {
    pub fn new(code: ValidationCode, path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code,
            path: path.into(),
            message: message.into(),
        }
    }
}

/// Non-empty, ordered collection of validation failures.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationErrors(Vec<ValidationError>);

impl ValidationErrors {
    fn from_vec(errors: Vec<ValidationError>) -> Option<Self> {
        if errors.is_empty() {
            None
        } else {
            Some(Self(errors))
        }
    }

    pub fn single(error: ValidationError) -> Self {
        Self(vec![error])
    }

    pub fn primary(&self) -> &ValidationError {
        &self.0[0]
    }

    pub fn as_slice(&self) -> &[ValidationError] {
        &self.0
    }

    pub fn has(&self, code: ValidationCode) -> bool {
        self.0.iter().any(|error| error.code == code)
    }
}

impl fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let primary = self.primary();
        write!(f, "{}: {}", primary.path, primary.message)?;
        if self.0.len() > 1 {
            write!(f, " (and {} more)", self.0.len() - 1)?;
        }
        Ok(())
    }
}

impl std::error::Error for ValidationErrors {}

#[derive(Debug, Clone, Copy)]
pub struct PlanValidator {
    registry: &'static FieldRegistry,
    default_limit: i64,
    max_limit: i64,
}

impl PlanValidator {
    pub fn new(registry: &'static FieldRegistry, default_limit: i64, max_limit: i64) -> Self {
        let max_limit = max_limit.max(1);
        Self {
            registry,
            default_limit: default_limit.clamp(1, max_limit),
            max_limit,
        }
    }

    pub fn registry(&self) -> &'static FieldRegistry {
        self.registry
    }

    pub fn max_limit(&self) -> i64 {
        self.max_limit
    }

    /// Validates an untyped JSON descriptor, reporting structural decode failures as
    /// `MALFORMED_DESCRIPTOR`.
    pub fn validate_json(&self, raw: &Value) -> Result<QueryPlan, ValidationErrors> {
        let descriptor: QueryDescriptor = serde_json::from_value(raw.clone()).map_err(|err| {
            ValidationErrors::single(ValidationError::new(
                ValidationCode::MalformedDescriptor,
                "$",
                format!("descriptor is not a valid query plan object: {err}"),
            ))
        })?;
        self.validate(&descriptor)
    }

    pub fn validate(&self, descriptor: &QueryDescriptor) -> Result<QueryPlan, ValidationErrors> {
        self.validate_at(descriptor, Utc::now())
    }

    /// Validates against a fixed clock so relative time presets resolve deterministically.
    pub fn validate_at(
        &self,
        descriptor: &QueryDescriptor,
        now: DateTime<Utc>,
    ) -> Result<QueryPlan, ValidationErrors> {
        let mut errors = Vec::new();

        let entity = match descriptor.entity.as_deref() {
            None => {
                errors.push(ValidationError::new(
                    ValidationCode::MissingField,
                    "entity",
                    "entity is required",
                ));
                None
            }
            Some(raw) if raw.trim().is_empty() => {
                errors.push(ValidationError::new(
                    ValidationCode::EmptyEntity,
                    "entity",
                    "entity must not be empty",
                ));
                None
            }
            Some(raw) => match self.registry.resolve_entity(raw) {
                Ok(entity) => Some(entity),
                Err(err) => {
                    errors.push(ValidationError::new(
                        ValidationCode::UnknownEntity,
                        "entity",
                        err.to_string(),
                    ));
                    None
                }
            },
        };

        let operation = match descriptor.operation.as_deref() {
            None => {
                errors.push(ValidationError::new(
                    ValidationCode::MissingField,
                    "operation",
                    "operation is required",
                ));
                None
            }
            Some(raw) => match Operation::from_str(raw) {
                Ok(operation) => Some(operation),
                Err(()) => {
                    errors.push(ValidationError::new(
                        ValidationCode::UnknownOperation,
                        "operation",
                        format!("unsupported operation '{raw}' (use list|aggregate|search)"),
                    ));
                    None
                }
            },
        };

        let limit = self.validate_limit(descriptor.limit.as_ref(), &mut errors);
        let query_intent = validate_intent(descriptor.query_intent.as_deref(), &mut errors);
        let preferred_render_type =
            validate_render_type(descriptor.preferred_render_type.as_deref(), &mut errors);

        // Without a resolved entity no field-level check is meaningful.
        let Some(entity) = entity else {
            return Err(ValidationErrors(errors));
        };

        let filters: Vec<Filter> = descriptor
            .filters
            .iter()
            .enumerate()
            .filter_map(|(idx, raw)| match coerce_filter(entity, &format!("filters[{idx}]"), raw) {
                Ok(filter) => Some(filter),
                Err(err) => {
                    errors.push(err);
                    None
                }
            })
            .collect();

        let time_range = validate_time_range(entity, descriptor.time_range.as_ref(), now, &mut errors);

        let is_aggregate = matches!(operation, Some(Operation::Aggregate));

        let mut fields = Vec::with_capacity(descriptor.fields.len());
        for (idx, raw) in descriptor.fields.iter().enumerate() {
            if let Some(def) = resolve_field(entity, &format!("fields[{idx}]"), raw, &mut errors) {
                fields.push(def.logical.to_string());
            }
        }
        if is_aggregate && !fields.is_empty() {
            errors.push(ValidationError::new(
                ValidationCode::OperationClauseMismatch,
                "fields",
                "aggregate plans select groupBy fields and aggregations only",
            ));
        }

        let mut group_by = Vec::with_capacity(descriptor.group_by.len());
        for (idx, raw) in descriptor.group_by.iter().enumerate() {
            if let Some(def) = resolve_field(entity, &format!("groupBy[{idx}]"), raw, &mut errors) {
                group_by.push(def.logical.to_string());
            }
        }

        let aggregations = validate_aggregations(entity, &descriptor.aggregations, &group_by, &mut errors);

        if operation.is_some() && !is_aggregate {
            if !group_by.is_empty() || !descriptor.group_by.is_empty() {
                errors.push(ValidationError::new(
                    ValidationCode::OperationClauseMismatch,
                    "groupBy",
                    "groupBy requires operation 'aggregate'",
                ));
            }
            if !descriptor.aggregations.is_empty() {
                errors.push(ValidationError::new(
                    ValidationCode::OperationClauseMismatch,
                    "aggregations",
                    "aggregations require operation 'aggregate'",
                ));
            }
        }
        if is_aggregate && descriptor.aggregations.is_empty() {
            errors.push(ValidationError::new(
                ValidationCode::OperationClauseMismatch,
                "aggregations",
                "aggregate plans need at least one aggregation",
            ));
        }

        let order_by = validate_order(entity, descriptor, is_aggregate, &group_by, &aggregations, &mut errors);

        if let Some(errors) = ValidationErrors::from_vec(errors) {
            return Err(errors);
        }

        Ok(QueryPlan {
            entity: entity.name.to_string(),
            operation: operation.unwrap_or(Operation::List),
            fields,
            filters,
            time_range,
            group_by,
            aggregations,
            order_by,
            limit,
            query_intent,
            preferred_render_type,
        })
    }

    fn validate_limit(&self, raw: Option<&Value>, errors: &mut Vec<ValidationError>) -> i64 {
        let Some(raw) = raw.filter(|value| !value.is_null()) else {
            return self.default_limit;
        };

        let parsed = match raw {
            Value::Number(number) => number.as_i64(),
            Value::String(text) => text.trim().parse::<i64>().ok(),
            _ => None,
        };

        match parsed {
            Some(limit) if (1..=self.max_limit).contains(&limit) => limit,
            Some(limit) => {
                errors.push(ValidationError::new(
                    ValidationCode::LimitOutOfRange,
                    "limit",
                    format!("limit {limit} must be between 1 and {}", self.max_limit),
                ));
                self.default_limit
            }
            None => {
                errors.push(ValidationError::new(
                    ValidationCode::LimitOutOfRange,
                    "limit",
                    format!("limit must be an integer between 1 and {}", self.max_limit),
                ));
                self.default_limit
            }
        }
    }
}

fn validate_intent(raw: Option<&str>, errors: &mut Vec<ValidationError>) -> QueryIntent {
    match raw {
        None => QueryIntent::default(),
        Some(raw) => QueryIntent::from_str(raw).unwrap_or_else(|()| {
            errors.push(ValidationError::new(
                ValidationCode::UnknownQueryIntent,
                "queryIntent",
                format!("unsupported queryIntent '{raw}'"),
            ));
            QueryIntent::default()
        }),
    }
}

fn validate_render_type(raw: Option<&str>, errors: &mut Vec<ValidationError>) -> Option<RenderType> {
    let raw = raw?;
    match RenderType::from_str(raw) {
        Ok(render) => Some(render),
        Err(()) => {
            errors.push(ValidationError::new(
                ValidationCode::UnknownRenderType,
                "preferredRenderType",
                format!("unsupported render type '{raw}' (use table|chart|text)"),
            ));
            None
        }
    }
}

fn resolve_field(
    entity: &EntityMapping,
    path: &str,
    raw: &str,
    errors: &mut Vec<ValidationError>,
) -> Option<&'static FieldDef> {
    match entity.field(raw.trim()) {
        Some(def) => Some(def),
        None => {
            errors.push(unknown_field(entity, path, raw));
            None
        }
    }
}

fn unknown_field(entity: &EntityMapping, path: &str, raw: &str) -> ValidationError {
    let err = RegistryError::UnknownField {
        entity: entity.name.to_string(),
        field: raw.to_string(),
    };
    ValidationError::new(ValidationCode::UnknownField, path, err.to_string())
}

/// Validates one filter and coerces its value to the field's registered kind.
pub fn coerce_filter(
    entity: &EntityMapping,
    path: &str,
    raw: &FilterDescriptor,
) -> Result<Filter, ValidationError> {
    let field_name = raw.field.as_deref().map(str::trim).unwrap_or_default();
    if field_name.is_empty() {
        return Err(ValidationError::new(
            ValidationCode::MissingField,
            format!("{path}.field"),
            "filter field is required",
        ));
    }
    let def = entity
        .field(field_name)
        .ok_or_else(|| unknown_field(entity, &format!("{path}.field"), field_name))?;

    let operator = match raw.operator.as_deref() {
        None => {
            return Err(ValidationError::new(
                ValidationCode::MissingField,
                format!("{path}.operator"),
                "filter operator is required",
            ))
        }
        Some(op) => FilterOperator::from_str(op).map_err(|()| {
            ValidationError::new(
                ValidationCode::InvalidOperator,
                format!("{path}.operator"),
                format!("unsupported operator '{op}'"),
            )
        })?,
    };

    if operator == FilterOperator::Like && def.kind != FieldKind::Text {
        return Err(ValidationError::new(
            ValidationCode::InvalidOperator,
            format!("{path}.operator"),
            format!("like is only supported on text fields, '{}' is not", def.logical),
        ));
    }
    if operator.is_ordering() && !def.kind.is_ordered() {
        return Err(ValidationError::new(
            ValidationCode::InvalidOperator,
            format!("{path}.operator"),
            format!("{} cannot compare boolean field '{}'", operator.as_str(), def.logical),
        ));
    }

    let value_path = format!("{path}.value");
    let value = match operator {
        FilterOperator::In => {
            let items = raw.value.as_array().ok_or_else(|| {
                arity(&value_path, "in requires an array value")
            })?;
            if items.is_empty() || items.len() > MAX_FILTER_LIST_VALUES {
                return Err(arity(
                    &value_path,
                    &format!("in requires between 1 and {MAX_FILTER_LIST_VALUES} values"),
                ));
            }
            let coerced = items
                .iter()
                .map(|item| coerce_scalar(def, item, &value_path))
                .collect::<Result<Vec<_>, _>>()?;
            FilterValue::List(coerced)
        }
        FilterOperator::Between => {
            let items = raw
                .value
                .as_array()
                .filter(|items| items.len() == 2)
                .ok_or_else(|| arity(&value_path, "between requires a 2-element array"))?;
            FilterValue::Range(
                coerce_scalar(def, &items[0], &value_path)?,
                coerce_scalar(def, &items[1], &value_path)?,
            )
        }
        _ => {
            if raw.value.is_array() || raw.value.is_object() || raw.value.is_null() {
                return Err(arity(
                    &value_path,
                    &format!("{} requires a single scalar value", operator.as_str()),
                ));
            }
            FilterValue::Scalar(coerce_scalar(def, &raw.value, &value_path)?)
        }
    };

    Ok(Filter {
        field: def.logical.to_string(),
        operator,
        value,
    })
}

fn arity(path: &str, message: &str) -> ValidationError {
    ValidationError::new(ValidationCode::OperatorArityMismatch, path, message)
}

/// Whole floats inside the `i64` range. `i64::MAX as f64` rounds up to 2^63, hence the strict bound.
fn integral(value: f64) -> Option<i64> {
    (value.fract() == 0.0 && value >= i64::MIN as f64 && value < i64::MAX as f64)
        .then_some(value as i64)
}

fn coerce_scalar(def: &FieldDef, raw: &Value, path: &str) -> Result<ScalarValue, ValidationError> {
    let coerced = match def.kind {
        FieldKind::Text => match raw {
            Value::String(text) => Some(ScalarValue::Text(text.clone())),
            Value::Number(number) => Some(ScalarValue::Text(number.to_string())),
            Value::Bool(flag) => Some(ScalarValue::Text(flag.to_string())),
            _ => None,
        },
        FieldKind::Integer => match raw {
            Value::Number(number) => number
                .as_i64()
                .or_else(|| number.as_f64().and_then(integral))
                .map(ScalarValue::Integer),
            Value::String(text) => text
                .trim()
                .replace(',', "")
                .parse::<i64>()
                .ok()
                .map(ScalarValue::Integer),
            _ => None,
        },
        FieldKind::Decimal => match raw {
            Value::Number(number) => parse_decimal(&number.to_string()).map(ScalarValue::Decimal),
            Value::String(text) => parse_decimal(text).map(ScalarValue::Decimal),
            _ => None,
        },
        FieldKind::Timestamp => match raw {
            Value::String(text) => parse_datetime(text).map(ScalarValue::Timestamp),
            _ => None,
        },
        FieldKind::Boolean => match raw {
            Value::Bool(flag) => Some(ScalarValue::Boolean(*flag)),
            Value::String(text) => match text.trim().to_lowercase().as_str() {
                "true" => Some(ScalarValue::Boolean(true)),
                "false" => Some(ScalarValue::Boolean(false)),
                _ => None,
            },
            _ => None,
        },
    };

    coerced.ok_or_else(|| {
        ValidationError::new(
            ValidationCode::InvalidFilterValue,
            path,
            format!("value {raw} is not a valid {:?} for '{}'", def.kind, def.logical),
        )
    })
}

/// Parses a monetary or numeric literal, tolerating thousands separators and won markers.
pub fn parse_decimal(raw: &str) -> Option<Decimal> {
    let cleaned: String = raw
        .trim()
        .trim_start_matches('₩')
        .trim_end_matches('원')
        .chars()
        .filter(|ch| *ch != ',' && !ch.is_whitespace())
        .collect();
    if cleaned.is_empty() {
        return None;
    }
    Decimal::from_str(&cleaned)
        .or_else(|_| Decimal::from_scientific(&cleaned))
        .ok()
}

fn validate_time_range(
    entity: &EntityMapping,
    raw: Option<&TimeRangeDescriptor>,
    now: DateTime<Utc>,
    errors: &mut Vec<ValidationError>,
) -> Option<TimeRange> {
    let Some(raw) = raw else {
        if entity.time_range_required {
            errors.push(ValidationError::new(
                ValidationCode::TimeRangeRequired,
                "timeRange",
                format!("{} queries require a timeRange with start and end", entity.name),
            ));
        }
        return None;
    };

    let def = match raw.field.as_deref() {
        None => entity.time_field_def(),
        Some(name) => resolve_field(entity, "timeRange.field", name, errors)?,
    };
    if def.kind != FieldKind::Timestamp {
        errors.push(ValidationError::new(
            ValidationCode::InvalidTimeRange,
            "timeRange.field",
            format!("'{}' is not a timestamp field", def.logical),
        ));
        return None;
    }

    let bounds = if let Some(preset) = raw.preset.as_deref() {
        match parse_preset(preset).and_then(|parsed| parsed.resolve(now)) {
            Some(bounds) => (bounds.start, bounds.end),
            None => {
                errors.push(ValidationError::new(
                    ValidationCode::InvalidTimeRange,
                    "timeRange.preset",
                    format!("unsupported time preset '{preset}'"),
                ));
                return None;
            }
        }
    } else {
        match (raw.start.as_deref(), raw.end.as_deref()) {
            (Some(start), Some(end)) => {
                match (parse_datetime(start), parse_datetime(end)) {
                    (Some(start), Some(end)) => (start, end),
                    (None, _) => {
                        errors.push(invalid_literal("timeRange.start", start));
                        return None;
                    }
                    (_, None) => {
                        errors.push(invalid_literal("timeRange.end", end));
                        return None;
                    }
                }
            }
            (start, end) => {
                let missing = if start.is_none() { "start" } else { "end" };
                errors.push(ValidationError::new(
                    ValidationCode::TimeRangeIncomplete,
                    format!("timeRange.{missing}"),
                    "timeRange requires both start and end (or a preset)",
                ));
                return None;
            }
        }
    };

    if bounds.0 > bounds.1 {
        errors.push(ValidationError::new(
            ValidationCode::InvalidTimeRange,
            "timeRange",
            "time range start must be before end",
        ));
        return None;
    }

    Some(TimeRange {
        field: def.logical.to_string(),
        start: bounds.0,
        end: bounds.1,
        preset: raw.preset.as_deref().map(|preset| preset.trim().to_string()),
    })
}

fn invalid_literal(path: &str, value: &str) -> ValidationError {
    ValidationError::new(
        ValidationCode::InvalidTimeRange,
        path,
        format!("invalid time literal '{value}'"),
    )
}

fn validate_aggregations(
    entity: &EntityMapping,
    raw: &[AggregationDescriptor],
    group_by: &[String],
    errors: &mut Vec<ValidationError>,
) -> Vec<Aggregation> {
    let mut seen: HashSet<String> = group_by.iter().cloned().collect();
    let mut aggregations = Vec::with_capacity(raw.len());

    for (idx, agg) in raw.iter().enumerate() {
        let path = format!("aggregations[{idx}]");
        let function = match agg.function.as_deref() {
            None => {
                errors.push(ValidationError::new(
                    ValidationCode::MissingField,
                    format!("{path}.function"),
                    "aggregation function is required",
                ));
                continue;
            }
            Some(name) => match AggregateFunction::from_str(name) {
                Ok(function) => function,
                Err(()) => {
                    errors.push(ValidationError::new(
                        ValidationCode::InvalidAggregationFunction,
                        format!("{path}.function"),
                        format!("unsupported aggregation '{name}' (use count|sum|avg|min|max)"),
                    ));
                    continue;
                }
            },
        };

        let raw_field = agg.field.as_deref().map(str::trim).filter(|f| !f.is_empty());
        let field = match (function, raw_field) {
            (AggregateFunction::Count, None | Some("*")) => "*".to_string(),
            (_, None) => {
                errors.push(ValidationError::new(
                    ValidationCode::MissingField,
                    format!("{path}.field"),
                    format!("{} requires a field", function.as_str()),
                ));
                continue;
            }
            (_, Some(name)) => {
                let Some(def) = resolve_field(entity, &format!("{path}.field"), name, errors) else {
                    continue;
                };
                if matches!(function, AggregateFunction::Sum | AggregateFunction::Avg)
                    && !def.kind.is_numeric()
                {
                    errors.push(ValidationError::new(
                        ValidationCode::NonNumericAggregation,
                        format!("{path}.field"),
                        format!("{} requires a numeric field, '{}' is not", function.as_str(), def.logical),
                    ));
                    continue;
                }
                def.logical.to_string()
            }
        };

        let alias = agg
            .alias
            .as_deref()
            .map(str::trim)
            .filter(|alias| !alias.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| default_alias(function, &field));

        if !is_valid_alias(&alias) {
            errors.push(ValidationError::new(
                ValidationCode::InvalidAlias,
                format!("{path}.alias"),
                format!("alias '{alias}' must be an identifier of at most {MAX_ALIAS_LEN} characters"),
            ));
            continue;
        }
        if !seen.insert(alias.clone()) {
            errors.push(ValidationError::new(
                ValidationCode::DuplicateAlias,
                format!("{path}.alias"),
                format!("alias '{alias}' is already used by another output column"),
            ));
            continue;
        }

        aggregations.push(Aggregation {
            function,
            field,
            alias,
        });
    }

    aggregations
}

pub(crate) fn default_alias(function: AggregateFunction, field: &str) -> String {
    if field == "*" {
        return format!("{}All", function.as_str());
    }
    let mut chars = field.chars();
    match chars.next() {
        Some(first) => format!("{}{}{}", function.as_str(), first.to_uppercase(), chars.as_str()),
        None => function.as_str().to_string(),
    }
}

pub(crate) fn is_valid_alias(alias: &str) -> bool {
    let mut chars = alias.chars();
    let Some(first) = chars.next() else {
        return false;
    };
    alias.len() <= MAX_ALIAS_LEN
        && (first.is_ascii_alphabetic() || first == '_')
        && chars.all(|ch| ch.is_ascii_alphanumeric() || ch == '_')
}

fn validate_order(
    entity: &EntityMapping,
    descriptor: &QueryDescriptor,
    is_aggregate: bool,
    group_by: &[String],
    aggregations: &[Aggregation],
    errors: &mut Vec<ValidationError>,
) -> Vec<OrderClause> {
    let mut order = Vec::with_capacity(descriptor.order_by.len());

    for (idx, raw) in descriptor.order_by.iter().enumerate() {
        let path = format!("orderBy[{idx}]");
        let direction = match raw.direction.as_deref() {
            None => SortDirection::Asc,
            Some(dir) => match SortDirection::from_str(dir) {
                Ok(direction) => direction,
                Err(()) => {
                    errors.push(ValidationError::new(
                        ValidationCode::InvalidSortDirection,
                        format!("{path}.direction"),
                        format!("unsupported sort direction '{dir}' (use asc|desc)"),
                    ));
                    continue;
                }
            },
        };

        let Some(name) = raw.field.as_deref().map(str::trim).filter(|f| !f.is_empty()) else {
            errors.push(ValidationError::new(
                ValidationCode::MissingField,
                format!("{path}.field"),
                "orderBy field is required",
            ));
            continue;
        };

        if is_aggregate {
            if let Some(agg) = aggregations.iter().find(|agg| agg.alias == name) {
                order.push(OrderClause {
                    field: agg.alias.clone(),
                    direction,
                });
                continue;
            }
        }

        let Some(def) = resolve_field(entity, &format!("{path}.field"), name, errors) else {
            continue;
        };
        if is_aggregate && !group_by.iter().any(|g| g == def.logical) {
            errors.push(ValidationError::new(
                ValidationCode::OperationClauseMismatch,
                format!("{path}.field"),
                format!(
                    "aggregate plans can only order by groupBy fields or aggregation aliases, not '{}'",
                    def.logical
                ),
            ));
            continue;
        }
        order.push(OrderClause {
            field: def.logical.to_string(),
            direction,
        });
    }

    order
}
