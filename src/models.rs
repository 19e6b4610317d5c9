use crate::errors::AppError;
use bigdecimal::BigDecimal;
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use sqlx::FromRow;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Implements `as_str`, `Display` and `FromStr` for a snake_case text enum stored in a TEXT column.
macro_rules! text_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text,)+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = AppError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(AppError::BadRequest(format!(
                        "Unknown {} '{}'",
                        stringify!($name),
                        other
                    ))),
                }
            }
        }
    };
}

// ============ Payment Configuration ============

/// Payment channel accepted in a country.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    BankTransfer,
    Check,
    Wire,
    DigitalWallet,
}

/// Bank account details for a country, site, or split payee.
///
/// Common fields are typed; anything jurisdiction-specific goes in `extra`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BankingDetails {
    pub bank_name: Option<String>,
    pub account_holder: Option<String>,
    pub account_number: Option<String>,
    pub iban: Option<String>,
    pub swift_bic: Option<String>,
    pub routing_code: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// Country-level payment configuration for a study.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CountryPaymentConfig {
    pub currency: String,
    pub exchange_rate: BigDecimal,
    pub vat_rate: Option<BigDecimal>,
    #[serde(default)]
    pub payment_methods: Vec<PaymentMethod>,
    pub banking_details: Option<BankingDetails>,
    #[serde(default)]
    pub regulatory_requirements: Vec<String>,
}

/// Persisted `(study, country)` configuration row.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct GlobalPaymentConfig {
    pub study_id: Uuid,
    pub country_code: String,
    pub currency: String,
    pub exchange_rate: BigDecimal,
    pub vat_rate: Option<BigDecimal>,
    pub payment_methods: Json<Vec<PaymentMethod>>,
    pub banking_details: Option<Json<BankingDetails>>,
    pub regulatory_requirements: Vec<String>,
    pub updated_by: String,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GlobalPaymentConfigResponse {
    pub success: bool,
    pub study_id: Uuid,
    pub countries_configured: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentType {
    VisitBased,
    ProcedureBased,
    MilestoneBased,
}

text_enum!(PaymentType {
    VisitBased => "visit_based",
    ProcedureBased => "procedure_based",
    MilestoneBased => "milestone_based",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VatHandling {
    Inclusive,
    Exclusive,
    Exempt,
}

text_enum!(VatHandling {
    Inclusive => "inclusive",
    Exclusive => "exclusive",
    Exempt => "exempt",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvoiceSubmission {
    Electronic,
    Portal,
    Email,
}

text_enum!(InvoiceSubmission {
    Electronic => "electronic",
    Portal => "portal",
    Email => "email",
});

/// Secondary recipient of a percentage share of a site's payments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SplitPayee {
    pub payee_id: String,
    pub percentage: BigDecimal,
    pub bank_details: Option<BankingDetails>,
}

/// Per-site payment setup for a study.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SitePaymentSetup {
    pub payment_type: PaymentType,
    #[serde(default)]
    pub split_payees: Vec<SplitPayee>,
    pub local_currency: String,
    pub vat_handling: VatHandling,
    pub invoice_submission: InvoiceSubmission,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SitePaymentsResponse {
    pub success: bool,
    pub sites_configured: Vec<Uuid>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerType {
    VisitCompletion,
    ProcedureCompletion,
}

text_enum!(TriggerType {
    VisitCompletion => "visit_completion",
    ProcedureCompletion => "procedure_completion",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CalculationStrategy {
    FixedRatePerVisit,
    RatePerProcedure,
}

text_enum!(CalculationStrategy {
    FixedRatePerVisit => "fixed_rate_per_visit",
    RatePerProcedure => "rate_per_procedure",
});

/// Equality condition on an EDC record, e.g. `visit_status == "completed"`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerCondition {
    pub field: String,
    pub equals: String,
}

/// Which EDC event produces a payment for a site, and how it is priced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentTrigger {
    pub trigger_type: TriggerType,
    pub condition: TriggerCondition,
    pub calculation_strategy: CalculationStrategy,
}

// ============ EDC-Driven Payments ============

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EdcPaymentRequest {
    #[serde(default)]
    pub completed_procedures: Vec<String>,
}

/// Visit left-joined with its site's payment setup; setup columns are NULL when the
/// `(study, site)` pair has never been configured.
#[derive(Debug, Clone, FromRow)]
pub struct VisitPaymentContext {
    pub visit_id: Uuid,
    pub site_id: Uuid,
    pub study_id: Uuid,
    pub visit_type: String,
    pub payment_type: Option<String>,
    pub local_currency: Option<String>,
}

pub const PAYMENT_STATUS_PROCESSING: &str = "processing";

#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct SitePayment {
    pub id: Uuid,
    pub visit_id: Uuid,
    pub site_id: Uuid,
    pub study_id: Uuid,
    pub amount: BigDecimal,
    pub currency: String,
    pub payment_type: String,
    pub completed_procedures: Vec<String>,
    pub triggered_by: String,
    pub status: String,
    pub created_at: DateTime<Utc>,
}

/// Values for a new `SitePayment` row.
#[derive(Debug, Clone)]
pub struct NewSitePayment {
    pub visit_id: Uuid,
    pub site_id: Uuid,
    pub study_id: Uuid,
    pub amount: BigDecimal,
    pub currency: String,
    pub payment_type: PaymentType,
    pub completed_procedures: Vec<String>,
    pub triggered_by: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EdcPaymentResponse {
    pub payment_id: Uuid,
    pub amount: BigDecimal,
    pub currency: String,
    pub status: String,
}

// ============ Forecasting ============

/// Enrollment assumptions for a scenario. Rates are fractions in `[0, 1]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForecastAssumptions {
    pub screen_fail_rate: f64,
    pub dropout_rate: f64,
    pub enrollment_rate: f64,
    pub site_activation_rate: f64,
    #[serde(default)]
    pub holdback_percentage: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VisitFlowEntry {
    pub visit_id: String,
    #[serde(default)]
    pub expected_duration_days: u32,
    #[serde(default)]
    pub procedure_count: u32,
    pub cost_per_visit: BigDecimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Milestone {
    pub id: String,
    /// Likelihood of the milestone being reached, `0..=100`.
    pub probability: f64,
    pub expected_date: NaiveDate,
    pub payment_amount: BigDecimal,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForecastScenario {
    pub name: String,
    pub assumptions: ForecastAssumptions,
    #[serde(default)]
    pub visit_flow: Vec<VisitFlowEntry>,
    #[serde(default)]
    pub milestones: Vec<Milestone>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MonthlyForecast {
    /// Calendar month, `YYYY-MM`.
    pub month: String,
    pub screening: u64,
    pub enrolled: u64,
    pub dropouts: u64,
    pub active: u64,
    pub visit_cost: BigDecimal,
    pub milestone_payments: BigDecimal,
    pub total_cost: BigDecimal,
    pub cumulative_enrollment: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScenarioForecast {
    pub scenario: String,
    pub monthly: Vec<MonthlyForecast>,
    pub total_projected_cost: BigDecimal,
    pub total_projected_enrollment: u64,
    pub projected_holdback: BigDecimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForecastRequest {
    pub scenarios: Vec<ForecastScenario>,
    pub horizon_months: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForecastResult {
    pub id: Uuid,
    pub study_id: Uuid,
    pub horizon_months: u32,
    pub scenarios: Vec<ScenarioForecast>,
    pub generated_at: DateTime<Utc>,
}

/// Persisted forecast snapshot, including the scenario definitions that produced it.
#[derive(Debug, Clone, FromRow)]
pub struct ForecastRecord {
    pub id: Uuid,
    pub study_id: Uuid,
    pub horizon_months: i32,
    pub scenarios: Json<Vec<ForecastScenario>>,
    pub results: Json<Vec<ScenarioForecast>>,
    pub generated_by: String,
    pub generated_at: DateTime<Utc>,
}

impl From<ForecastRecord> for ForecastResult {
    fn from(record: ForecastRecord) -> Self {
        Self {
            id: record.id,
            study_id: record.study_id,
            horizon_months: record.horizon_months.max(0) as u32,
            scenarios: record.results.0,
            generated_at: record.generated_at,
        }
    }
}

// ============ Contract Amendments ============

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AmendmentData {
    pub title: String,
    pub description: Option<String>,
    pub study_id: Uuid,
    pub sponsor_org_id: Option<Uuid>,
    pub site_org_id: Option<Uuid>,
    pub cro_org_id: Option<Uuid>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetChangeType {
    Increase,
    Decrease,
    Reallocation,
    NewLineItem,
}

text_enum!(BudgetChangeType {
    Increase => "increase",
    Decrease => "decrease",
    Reallocation => "reallocation",
    NewLineItem => "new_line_item",
});

/// One budget delta carried by an amendment. `change_amount` is signed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BudgetChange {
    pub original_budget_id: Uuid,
    pub change_type: BudgetChangeType,
    pub change_amount: BigDecimal,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AmendmentRequest {
    pub amendment: AmendmentData,
    #[serde(default)]
    pub budget_changes: Vec<BudgetChange>,
}

pub const CONTRACT_TYPE_AMENDMENT: &str = "amendment";
pub const CONTRACT_STATUS_DRAFT: &str = "draft";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AmendmentResponse {
    pub amendment_id: Uuid,
    pub parent_contract_id: Uuid,
    pub version_number: i32,
    pub budget_changes_processed: usize,
    pub status: String,
}

// ============ Analytics ============

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RollupLevel {
    Portfolio,
    Study,
    Site,
    Country,
}

text_enum!(RollupLevel {
    Portfolio => "portfolio",
    Study => "study",
    Site => "site",
    Country => "country",
});

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnalyticsFilters {
    pub date_from: Option<NaiveDate>,
    pub date_to: Option<NaiveDate>,
    #[serde(default)]
    pub country_codes: Vec<String>,
    #[serde(default)]
    pub site_ids: Vec<Uuid>,
    pub currency: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AnalyticsRequest {
    #[serde(default)]
    pub filters: AnalyticsFilters,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BudgetTracking {
    pub total_budget: BigDecimal,
    pub committed: BigDecimal,
    pub spent: BigDecimal,
    pub remaining: BigDecimal,
    pub variance_percentage: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContractTracking {
    pub total_contracts: i64,
    pub active_contracts: i64,
    pub pending_signature: i64,
    pub amendments: i64,
    pub average_contract_value: BigDecimal,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PaymentTracking {
    pub total_paid: BigDecimal,
    pub pending_amount: BigDecimal,
    pub overdue_count: i64,
    pub average_days_to_pay: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CycleTimeReporting {
    pub contract_execution_days: f64,
    pub budget_approval_days: f64,
    pub site_activation_days: f64,
    pub payment_processing_days: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Kpis {
    pub on_time_payment_rate: f64,
    pub budget_utilization: f64,
    pub enrollment_vs_target: f64,
    pub site_activation_rate: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnalyticsBundle {
    pub budget_tracking: BudgetTracking,
    pub contract_tracking: ContractTracking,
    pub payment_tracking: PaymentTracking,
    pub cycle_time_reporting: CycleTimeReporting,
    pub kpis: Kpis,
}

#[derive(Debug, Clone, FromRow)]
pub struct AnalyticsSnapshotRow {
    pub id: Uuid,
    /// Bundle JSON exactly as checksummed; stored as TEXT so bytes are preserved.
    pub bundle: String,
    pub checksum: String,
    pub created_at: DateTime<Utc>,
}

// ============ Reference Data ============

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExchangeRateInput {
    pub base_currency: String,
    pub target_currency: String,
    pub rate: BigDecimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VisitRateInput {
    pub study_id: Uuid,
    pub site_id: Uuid,
    pub visit_type: String,
    pub rate: BigDecimal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcedureRateInput {
    pub study_id: Uuid,
    pub site_id: Uuid,
    pub procedure_name: String,
    pub rate: BigDecimal,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_text_enums_round_trip_through_db_text() {
        for pt in [
            PaymentType::VisitBased,
            PaymentType::ProcedureBased,
            PaymentType::MilestoneBased,
        ] {
            assert_eq!(pt.as_str().parse::<PaymentType>().unwrap(), pt);
        }
        assert!("weekly".parse::<PaymentType>().is_err());
        assert_eq!(RollupLevel::Country.to_string(), "country");
    }

    #[test]
    fn test_site_setup_deserializes_from_snake_case() {
        let setup: SitePaymentSetup = serde_json::from_value(serde_json::json!({
            "payment_type": "procedure_based",
            "local_currency": "EUR",
            "vat_handling": "exempt",
            "invoice_submission": "portal",
            "split_payees": [
                {"payee_id": "pi-lab", "percentage": "25", "bank_details": null}
            ]
        }))
        .unwrap();

        assert_eq!(setup.payment_type, PaymentType::ProcedureBased);
        assert_eq!(setup.vat_handling, VatHandling::Exempt);
        assert_eq!(setup.split_payees.len(), 1);
    }

    #[test]
    fn test_banking_details_keep_jurisdiction_extras() {
        let details: BankingDetails = serde_json::from_value(serde_json::json!({
            "bank_name": "Banco do Brasil",
            "extra": {"pix_key": "site@example.org"}
        }))
        .unwrap();

        assert_eq!(details.bank_name.as_deref(), Some("Banco do Brasil"));
        assert_eq!(details.extra["pix_key"], "site@example.org");
    }
}
