use crate::errors::AppError;
use crate::models::PaymentType;
use bigdecimal::BigDecimal;
use std::collections::{BTreeSet, HashMap};

/// Sum of per-procedure rates for one visit.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcedureTotal {
    pub amount: BigDecimal,
    /// Completed procedures with no rate on file; they contribute zero.
    pub unmatched: Vec<String>,
}

/// Sums the site's rate for each distinct completed procedure.
///
/// Procedure names are matched exactly. A name listed twice is paid once.
pub fn procedure_total(
    completed: &[String],
    rates: &HashMap<String, BigDecimal>,
) -> ProcedureTotal {
    let distinct: BTreeSet<&str> = completed.iter().map(String::as_str).collect();

    let mut amount = BigDecimal::from(0);
    let mut unmatched = Vec::new();
    for name in distinct {
        match rates.get(name) {
            Some(rate) => amount += rate,
            None => unmatched.push(name.to_string()),
        }
    }

    ProcedureTotal { amount, unmatched }
}

/// Rate data looked up for a visit, matching the site's payment type.
#[derive(Debug, Clone)]
pub enum RateLookup {
    Visit(Option<BigDecimal>),
    Procedures(HashMap<String, BigDecimal>),
}

/// Base-currency amount owed for a completed visit.
pub fn base_amount(
    payment_type: PaymentType,
    visit_type: &str,
    completed_procedures: &[String],
    rates: RateLookup,
) -> Result<BigDecimal, AppError> {
    match (payment_type, rates) {
        (PaymentType::VisitBased, RateLookup::Visit(rate)) => rate.ok_or_else(|| {
            AppError::NotFound(format!("No visit rate on file for visit type '{}'", visit_type))
        }),
        (PaymentType::ProcedureBased, RateLookup::Procedures(rates)) => {
            let total = procedure_total(completed_procedures, &rates);
            if !total.unmatched.is_empty() {
                tracing::warn!(
                    "No procedure rate for {:?}; they contribute 0 to the payment",
                    total.unmatched
                );
            }
            Ok(total.amount)
        }
        (PaymentType::MilestoneBased, _) => Err(AppError::BadRequest(
            "Milestone-based sites are not paid from EDC events".to_string(),
        )),
        (payment_type, _) => Err(AppError::InternalError(format!(
            "Rate lookup does not match payment type {}",
            payment_type
        ))),
    }
}
