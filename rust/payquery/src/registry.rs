//! Static logical-to-physical schema mapping for the payment gateway tables.

use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FieldKind {
    Text,
    Integer,
    Decimal,
    Timestamp,
    Boolean,
}

impl FieldKind {
    pub fn is_numeric(self) -> bool {
        matches!(self, FieldKind::Integer | FieldKind::Decimal)
    }

    pub fn is_ordered(self) -> bool {
        !matches!(self, FieldKind::Boolean)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldDef {
    pub logical: &'static str,
    pub column: &'static str,
    pub kind: FieldKind,
}

const fn field(logical: &'static str, column: &'static str, kind: FieldKind) -> FieldDef {
    FieldDef {
        logical,
        column,
        kind,
    }
}

#[derive(Debug)]
pub struct EntityMapping {
    pub name: &'static str,
    pub table: &'static str,
    pub aliases: &'static [&'static str],
    /// Logical field used when a time range omits `field`.
    pub time_field: &'static str,
    pub time_range_required: bool,
    /// Logical field appended as the final ORDER BY tie-breaker.
    pub primary_key: &'static str,
    pub fields: &'static [FieldDef],
}

impl EntityMapping {
    pub fn field(&self, logical: &str) -> Option<&'static FieldDef> {
        self.fields
            .iter()
            .find(|def| def.logical == logical)
            .or_else(|| {
                self.fields
                    .iter()
                    .find(|def| def.logical.eq_ignore_ascii_case(logical))
            })
    }

    pub fn time_field_def(&self) -> &'static FieldDef {
        self.field(self.time_field).unwrap_or(&self.fields[0])
    }

    pub fn primary_key_def(&self) -> &'static FieldDef {
        self.field(self.primary_key).unwrap_or(&self.fields[0])
    }
}

const PAYMENT_FIELDS: &[FieldDef] = &[
    field("paymentKey", "payment_key", FieldKind::Text),
    field("orderId", "order_id", FieldKind::Text),
    field("orderName", "order_name", FieldKind::Text),
    field("merchantId", "merchant_id", FieldKind::Text),
    field("status", "status", FieldKind::Text),
    field("method", "method", FieldKind::Text),
    field("amount", "total_amount", FieldKind::Decimal),
    field("balanceAmount", "balance_amount", FieldKind::Decimal),
    field("suppliedAmount", "supplied_amount", FieldKind::Decimal),
    field("vat", "vat", FieldKind::Decimal),
    field("currency", "currency", FieldKind::Text),
    field("cardCompany", "card_company", FieldKind::Text),
    field("installmentMonths", "installment_plan_months", FieldKind::Integer),
    field("customerName", "customer_name", FieldKind::Text),
    field("isPartialCancelable", "is_partial_cancelable", FieldKind::Boolean),
    field("requestedAt", "requested_at", FieldKind::Timestamp),
    field("approvedAt", "approved_at", FieldKind::Timestamp),
];

const REFUND_FIELDS: &[FieldDef] = &[
    field("refundId", "refund_id", FieldKind::Text),
    field("paymentKey", "payment_key", FieldKind::Text),
    field("merchantId", "merchant_id", FieldKind::Text),
    field("cancelAmount", "cancel_amount", FieldKind::Decimal),
    field("cancelReason", "cancel_reason", FieldKind::Text),
    field("refundStatus", "refund_status", FieldKind::Text),
    field("canceledAt", "canceled_at", FieldKind::Timestamp),
];

const SETTLEMENT_FIELDS: &[FieldDef] = &[
    field("settlementId", "settlement_id", FieldKind::Text),
    field("merchantId", "merchant_id", FieldKind::Text),
    field("paymentKey", "payment_key", FieldKind::Text),
    field("method", "method", FieldKind::Text),
    field("amount", "amount", FieldKind::Decimal),
    field("fee", "fee", FieldKind::Decimal),
    field("payOutAmount", "pay_out_amount", FieldKind::Decimal),
    field("soldDate", "sold_date", FieldKind::Timestamp),
    field("settledAt", "settled_at", FieldKind::Timestamp),
];

const MERCHANT_FIELDS: &[FieldDef] = &[
    field("merchantId", "merchant_id", FieldKind::Text),
    field("merchantName", "merchant_name", FieldKind::Text),
    field("businessNumber", "business_number", FieldKind::Text),
    field("category", "category", FieldKind::Text),
    field("status", "status", FieldKind::Text),
    field("feeRate", "fee_rate", FieldKind::Decimal),
    field("createdAt", "created_at", FieldKind::Timestamp),
];

static ENTITIES: &[EntityMapping] = &[
    EntityMapping {
        name: "Payment",
        table: "payments",
        aliases: &["payments", "payment", "transactions"],
        time_field: "requestedAt",
        time_range_required: true,
        primary_key: "paymentKey",
        fields: PAYMENT_FIELDS,
    },
    EntityMapping {
        name: "Refund",
        table: "refunds",
        aliases: &["refunds", "refund", "cancels"],
        time_field: "canceledAt",
        time_range_required: true,
        primary_key: "refundId",
        fields: REFUND_FIELDS,
    },
    EntityMapping {
        name: "Settlement",
        table: "settlements",
        aliases: &["settlements", "settlement"],
        time_field: "settledAt",
        time_range_required: true,
        primary_key: "settlementId",
        fields: SETTLEMENT_FIELDS,
    },
    EntityMapping {
        name: "Merchant",
        table: "merchants",
        aliases: &["merchants", "merchant"],
        time_field: "createdAt",
        time_range_required: false,
        primary_key: "merchantId",
        fields: MERCHANT_FIELDS,
    },
];

static DEFAULT_REGISTRY: FieldRegistry = FieldRegistry { entities: ENTITIES };

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("unknown entity '{0}'")]
    UnknownEntity(String),
    #[error("unknown field '{field}' for entity {entity}")]
    UnknownField { entity: String, field: String },
}

#[derive(Debug)]
pub struct FieldRegistry {
    entities: &'static [EntityMapping],
}

impl FieldRegistry {
    pub fn global() -> &'static FieldRegistry {
        &DEFAULT_REGISTRY
    }

    pub fn entities(&self) -> impl Iterator<Item = &'static EntityMapping> {
        self.entities.iter()
    }

    pub fn resolve_entity(&self, name: &str) -> Result<&'static EntityMapping, RegistryError> {
        let trimmed = name.trim();
        self.entities
            .iter()
            .find(|entity| entity.name == trimmed)
            .or_else(|| {
                let lowered = trimmed.to_lowercase();
                self.entities.iter().find(|entity| {
                    entity.name.eq_ignore_ascii_case(&lowered)
                        || entity.aliases.iter().any(|alias| *alias == lowered)
                })
            })
            .ok_or_else(|| RegistryError::UnknownEntity(trimmed.to_string()))
    }

    pub fn resolve_field(
        &self,
        entity: &str,
        logical: &str,
    ) -> Result<&'static FieldDef, RegistryError> {
        let mapping = self.resolve_entity(entity)?;
        mapping
            .field(logical)
            .ok_or_else(|| RegistryError::UnknownField {
                entity: mapping.name.to_string(),
                field: logical.to_string(),
            })
    }

    pub fn is_time_range_required(&self, entity: &str) -> Result<bool, RegistryError> {
        Ok(self.resolve_entity(entity)?.time_range_required)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolves_entity_by_name_and_alias() {
        let registry = FieldRegistry::global();
        assert_eq!(registry.resolve_entity("Payment").unwrap().table, "payments");
        assert_eq!(registry.resolve_entity("payments").unwrap().name, "Payment");
        assert_eq!(registry.resolve_entity(" REFUNDS ").unwrap().name, "Refund");
    }

    #[test]
    fn unknown_entity_and_field_are_distinct_errors() {
        let registry = FieldRegistry::global();
        assert!(matches!(
            registry.resolve_entity("Invoice"),
            Err(RegistryError::UnknownEntity(name)) if name == "Invoice"
        ));
        assert!(matches!(
            registry.resolve_field("Payment", "bogus"),
            Err(RegistryError::UnknownField { .. })
        ));
        assert!(matches!(
            registry.resolve_field("Invoice", "status"),
            Err(RegistryError::UnknownEntity(_))
        ));
    }

    #[test]
    fn maps_logical_fields_to_physical_columns() {
        let registry = FieldRegistry::global();
        let amount = registry.resolve_field("Payment", "amount").unwrap();
        assert_eq!(amount.column, "total_amount");
        assert_eq!(amount.kind, FieldKind::Decimal);

        let insensitive = registry.resolve_field("Payment", "MERCHANTID").unwrap();
        assert_eq!(insensitive.logical, "merchantId");
    }

    #[test]
    fn time_range_requirements_follow_entity_metadata() {
        let registry = FieldRegistry::global();
        assert!(registry.is_time_range_required("Payment").unwrap());
        assert!(!registry.is_time_range_required("Merchant").unwrap());
    }

    #[test]
    fn every_entity_declares_its_time_and_key_fields() {
        for entity in FieldRegistry::global().entities() {
            assert!(
                entity.field(entity.time_field).is_some(),
                "{} must register its time field",
                entity.name
            );
            assert!(
                entity.field(entity.primary_key).is_some(),
                "{} must register its primary key",
                entity.name
            );
        }
    }
}
