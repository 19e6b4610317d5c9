use crate::errors::AppError;
use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::FromRow;
use uuid::Uuid;

/// Domain events emitted after a successful write.
///
/// Serialized adjacently tagged so the `event_type` string doubles as the bus topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event_type", content = "payload")]
pub enum DomainEvent {
    #[serde(rename = "site_payments.configured")]
    SitePaymentsConfigured { study_id: Uuid, site_ids: Vec<Uuid> },

    #[serde(rename = "payment.edc_triggered")]
    EdcPaymentTriggered {
        payment_id: Uuid,
        visit_id: Uuid,
        site_id: Uuid,
        study_id: Uuid,
        amount: BigDecimal,
        currency: String,
    },

    #[serde(rename = "contract.amended")]
    ContractAmended {
        parent_contract_id: Uuid,
        amendment_id: Uuid,
        budget_changes_processed: usize,
    },
}

impl DomainEvent {
    pub fn event_type(&self) -> &'static str {
        match self {
            DomainEvent::SitePaymentsConfigured { .. } => "site_payments.configured",
            DomainEvent::EdcPaymentTriggered { .. } => "payment.edc_triggered",
            DomainEvent::ContractAmended { .. } => "contract.amended",
        }
    }

    /// The event body without its type tag.
    pub fn payload(&self) -> Result<Value, AppError> {
        let mut tagged = serde_json::to_value(self)?;
        tagged
            .get_mut("payload")
            .map(Value::take)
            .ok_or_else(|| AppError::InternalError("Event serialized without payload".to_string()))
    }
}

/// What actually goes on the bus, and what the outbox stores.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
pub struct EventEnvelope {
    pub id: Uuid,
    pub event_type: String,
    pub payload: Value,
    pub occurred_at: DateTime<Utc>,
}

impl EventEnvelope {
    pub fn new(event: &DomainEvent) -> Result<Self, AppError> {
        Ok(Self {
            id: Uuid::new_v4(),
            event_type: event.event_type().to_string(),
            payload: event.payload()?,
            occurred_at: Utc::now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn test_payload_strips_type_tag() {
        let study_id = Uuid::new_v4();
        let site = Uuid::new_v4();
        let event = DomainEvent::SitePaymentsConfigured {
            study_id,
            site_ids: vec![site],
        };

        let payload = event.payload().unwrap();
        assert_eq!(payload["study_id"], study_id.to_string());
        assert_eq!(payload["site_ids"][0], site.to_string());
        assert!(payload.get("event_type").is_none());
    }

    #[test]
    fn test_envelope_carries_bus_topic() {
        let event = DomainEvent::EdcPaymentTriggered {
            payment_id: Uuid::new_v4(),
            visit_id: Uuid::new_v4(),
            site_id: Uuid::new_v4(),
            study_id: Uuid::new_v4(),
            amount: BigDecimal::from_str("500.00").unwrap(),
            currency: "USD".to_string(),
        };

        let envelope = EventEnvelope::new(&event).unwrap();
        assert_eq!(envelope.event_type, "payment.edc_triggered");
        assert_eq!(envelope.payload["currency"], "USD");
        assert_eq!(envelope.payload["amount"], "500.00");
    }

    #[test]
    fn test_contract_amended_payload() {
        let event = DomainEvent::ContractAmended {
            parent_contract_id: Uuid::nil(),
            amendment_id: Uuid::nil(),
            budget_changes_processed: 2,
        };

        assert_eq!(event.event_type(), "contract.amended");
        assert_eq!(event.payload().unwrap()["budget_changes_processed"], 2);
    }
}
