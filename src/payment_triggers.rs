//! Payment trigger derivation and configuration validation.

use crate::config::is_currency_code;
use crate::errors::AppError;
use crate::models::{
    CalculationStrategy, CountryPaymentConfig, PaymentTrigger, PaymentType, SitePaymentSetup,
    TriggerCondition, TriggerType,
};
use bigdecimal::BigDecimal;

/// The trigger a site's setup registers, if any.
///
/// Milestone-based sites register none; milestone payments only appear in forecasts.
pub fn derive_trigger(setup: &SitePaymentSetup) -> Option<PaymentTrigger> {
    match setup.payment_type {
        PaymentType::VisitBased => Some(PaymentTrigger {
            trigger_type: TriggerType::VisitCompletion,
            condition: TriggerCondition {
                field: "visit_status".to_string(),
                equals: "completed".to_string(),
            },
            calculation_strategy: CalculationStrategy::FixedRatePerVisit,
        }),
        PaymentType::ProcedureBased => Some(PaymentTrigger {
            trigger_type: TriggerType::ProcedureCompletion,
            condition: TriggerCondition {
                field: "procedure_status".to_string(),
                equals: "completed".to_string(),
            },
            calculation_strategy: CalculationStrategy::RatePerProcedure,
        }),
        PaymentType::MilestoneBased => None,
    }
}

pub fn validate_site_setup(setup: &SitePaymentSetup) -> Result<(), AppError> {
    if !is_currency_code(&setup.local_currency) {
        return Err(AppError::BadRequest(format!(
            "Invalid local currency '{}'",
            setup.local_currency
        )));
    }

    let zero = BigDecimal::from(0);
    let hundred = BigDecimal::from(100);
    let mut total = BigDecimal::from(0);
    for payee in &setup.split_payees {
        if payee.percentage <= zero || payee.percentage > hundred {
            return Err(AppError::BadRequest(format!(
                "Split payee '{}' percentage must be in (0, 100], got {}",
                payee.payee_id, payee.percentage
            )));
        }
        total += &payee.percentage;
    }
    if total > hundred {
        return Err(AppError::BadRequest(format!(
            "Split payee percentages sum to {}, more than 100",
            total
        )));
    }

    Ok(())
}

pub fn validate_country_config(
    country_code: &str,
    config: &CountryPaymentConfig,
) -> Result<(), AppError> {
    if country_code.len() != 2 || !country_code.chars().all(|c| c.is_ascii_uppercase()) {
        return Err(AppError::BadRequest(format!(
            "Invalid country code '{}', expected ISO 3166-1 alpha-2",
            country_code
        )));
    }
    if !is_currency_code(&config.currency) {
        return Err(AppError::BadRequest(format!(
            "Invalid currency '{}' for {}",
            config.currency, country_code
        )));
    }
    if config.exchange_rate <= BigDecimal::from(0) {
        return Err(AppError::BadRequest(format!(
            "Exchange rate for {} must be positive",
            country_code
        )));
    }
    if let Some(ref vat) = config.vat_rate {
        if vat < &BigDecimal::from(0) || vat > &BigDecimal::from(1) {
            return Err(AppError::BadRequest(format!(
                "VAT rate for {} must be a fraction in [0, 1]",
                country_code
            )));
        }
    }
    Ok(())
}
