//! DIRECT_ANSWER support: recovering a previously reported amount and applying arithmetic to it.

use crate::error::{Result, ServiceError};
use crate::validator::parse_decimal;
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use rust_decimal::{Decimal, RoundingStrategy};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

const NUMBER: &str = r"\d{1,3}(?:,\d{3})+(?:\.\d+)?|\d+(?:\.\d+)?";

static PARENTHESIZED: Lazy<Regex> = Lazy::new(|| {
    Regex::new(&format!(r"\(\s*(₩\s*)?({NUMBER})\s*(원)?\s*\)"))
        .expect("parenthesized amount pattern is valid")
});

static EOK: Lazy<Regex> = Lazy::new(|| {
    Regex::new(&format!(r"({NUMBER})\s*억(?:\s*({NUMBER})\s*만)?"))
        .expect("eok amount pattern is valid")
});

static MAN: Lazy<Regex> =
    Lazy::new(|| Regex::new(&format!(r"({NUMBER})\s*만")).expect("man amount pattern is valid"));

static COMPACT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(\d+(?:\.\d+)?)\s*([KkMB])(?:[^A-Za-z]|$)").expect("compact amount pattern is valid")
});

static PLAIN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(&format!(r"₩\s*({NUMBER})|({NUMBER})\s*원")).expect("plain amount pattern is valid")
});

static GROUPED: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\b\d{1,3}(?:,\d{3})+(?:\.\d+)?\b").expect("grouped number pattern is valid")
});

/// Where a base amount was recovered from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AmountSource {
    AggregateScalar,
    Parenthesized,
    KoreanUnit,
    CompactSuffix,
    Plain,
}

/// Finds the amount a reply reported, trying the most explicit notation first.
pub fn extract_amount(text: &str) -> Option<(Decimal, AmountSource)> {
    parenthesized(text)
        .map(|value| (value, AmountSource::Parenthesized))
        .or_else(|| korean_unit(text).map(|value| (value, AmountSource::KoreanUnit)))
        .or_else(|| compact_suffix(text).map(|value| (value, AmountSource::CompactSuffix)))
        .or_else(|| plain(text).map(|value| (value, AmountSource::Plain)))
}

fn parenthesized(text: &str) -> Option<Decimal> {
    PARENTHESIZED.captures_iter(text).find_map(|caps| {
        let number = caps.get(2)?.as_str();
        let marked = caps.get(1).is_some() || caps.get(3).is_some() || number.contains(',');
        if marked {
            parse_decimal(number)
        } else {
            None
        }
    })
}

fn korean_unit(text: &str) -> Option<Decimal> {
    if let Some(caps) = EOK.captures(text) {
        let eok = number_at(&caps, 1)?.checked_mul(Decimal::from(100_000_000))?;
        let man = number_at(&caps, 2)
            .unwrap_or_default()
            .checked_mul(Decimal::from(10_000))?;
        return eok.checked_add(man);
    }
    MAN.captures(text)
        .and_then(|caps| number_at(&caps, 1))
        .and_then(|value| value.checked_mul(Decimal::from(10_000)))
}

fn compact_suffix(text: &str) -> Option<Decimal> {
    let caps = COMPACT.captures(text)?;
    let scale = match caps.get(2)?.as_str() {
        "K" | "k" => 1_000i64,
        "M" => 1_000_000,
        "B" => 1_000_000_000,
        _ => return None,
    };
    number_at(&caps, 1).and_then(|value| value.checked_mul(Decimal::from(scale)))
}

fn plain(text: &str) -> Option<Decimal> {
    if let Some(caps) = PLAIN.captures(text) {
        return number_at(&caps, 1).or_else(|| number_at(&caps, 2));
    }
    GROUPED
        .find(text)
        .and_then(|found| parse_decimal(found.as_str()))
}

fn number_at(caps: &Captures<'_>, index: usize) -> Option<Decimal> {
    caps.get(index).and_then(|found| parse_decimal(found.as_str()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DirectOperation {
    Percentage,
    Vat,
    WithVat,
    Multiply,
    Divide,
    Add,
    Subtract,
}

impl FromStr for DirectOperation {
    type Err = ();

    fn from_str(raw: &str) -> std::result::Result<Self, Self::Err> {
        match raw.trim().to_lowercase().replace('-', "_").as_str() {
            "percentage" | "percent" | "fee" => Ok(DirectOperation::Percentage),
            "vat" => Ok(DirectOperation::Vat),
            "with_vat" | "including_vat" => Ok(DirectOperation::WithVat),
            "multiply" | "times" => Ok(DirectOperation::Multiply),
            "divide" => Ok(DirectOperation::Divide),
            "add" | "plus" => Ok(DirectOperation::Add),
            "subtract" | "minus" => Ok(DirectOperation::Subtract),
            _ => Err(()),
        }
    }
}

impl DirectOperation {
    fn needs_operand(self) -> bool {
        !matches!(self, DirectOperation::Vat | DirectOperation::WithVat)
    }

    /// Applies the operation and rounds half away from zero to whole won.
    pub fn apply(self, base: Decimal, operand: Option<Decimal>) -> Result<Decimal> {
        let operand = match (self.needs_operand(), operand) {
            (true, None) => {
                return Err(ServiceError::InvalidRequest(format!(
                    "operation {self:?} requires an operand"
                )))
            }
            (_, operand) => operand.unwrap_or_default(),
        };

        let overflow = || ServiceError::InvalidRequest("arithmetic overflow".to_string());
        let raw = match self {
            DirectOperation::Percentage => base
                .checked_mul(operand)
                .and_then(|value| value.checked_div(Decimal::ONE_HUNDRED)),
            DirectOperation::Vat => base.checked_mul(Decimal::new(1, 1)),
            DirectOperation::WithVat => base.checked_mul(Decimal::new(11, 1)),
            DirectOperation::Multiply => base.checked_mul(operand),
            DirectOperation::Divide => {
                if operand.is_zero() {
                    return Err(ServiceError::InvalidRequest(
                        "cannot divide by zero".to_string(),
                    ));
                }
                base.checked_div(operand)
            }
            DirectOperation::Add => base.checked_add(operand),
            DirectOperation::Subtract => base.checked_sub(operand),
        }
        .ok_or_else(overflow)?;

        Ok(raw.round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero))
    }
}

/// What the client sends for a DIRECT_ANSWER turn.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectAnswerRequest {
    #[serde(default)]
    pub operation: Option<String>,
    /// Accepts a JSON number or a numeric string such as `"0.6"`.
    #[serde(default)]
    pub operand: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DirectAnswer {
    pub operation: DirectOperation,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub operand: Option<Decimal>,
    pub base: Decimal,
    pub base_formatted: String,
    pub base_source: AmountSource,
    pub value: Decimal,
    pub formatted: String,
}

/// Computes a direct answer over an already recovered base amount.
pub fn answer(
    base: Decimal,
    source: AmountSource,
    request: &DirectAnswerRequest,
) -> Result<DirectAnswer> {
    let operation = request
        .operation
        .as_deref()
        .ok_or_else(|| ServiceError::InvalidRequest("directAnswer.operation is required".into()))?;
    let operation = DirectOperation::from_str(operation).map_err(|_| {
        ServiceError::InvalidRequest(format!("unsupported direct answer operation '{operation}'"))
    })?;
    let operand = request
        .operand
        .as_ref()
        .map(|raw| {
            let text = match raw {
                serde_json::Value::String(text) => text.clone(),
                other => other.to_string(),
            };
            parse_decimal(&text).ok_or_else(|| {
                ServiceError::InvalidRequest(format!("operand {raw} is not a number"))
            })
        })
        .transpose()?;

    let value = operation.apply(base, operand)?;
    Ok(DirectAnswer {
        operation,
        operand,
        base,
        base_formatted: format_won(base),
        base_source: source,
        value,
        formatted: format_won(value),
    })
}

/// Formats an amount as whole won with thousands separators, e.g. `₩86,862`.
pub fn format_won(value: Decimal) -> String {
    let rounded = value.round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero);
    let digits = rounded.abs().trunc().to_string();
    let mut grouped = String::with_capacity(digits.len() + digits.len() / 3);
    for (index, ch) in digits.chars().enumerate() {
        if index > 0 && (digits.len() - index) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(ch);
    }
    if rounded.is_sign_negative() && !rounded.is_zero() {
        format!("-₩{grouped}")
    } else {
        format!("₩{grouped}")
    }
}
