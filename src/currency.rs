//! Currency conversion for site payments.
//!
//! Amounts are computed in the ledger's base currency and converted into the site's
//! local currency with the most recent `(base -> local)` rate on file. A missing rate
//! is an error, never an implicit 1:1 conversion.

use crate::errors::AppError;
use bigdecimal::BigDecimal;

/// Decimal places kept on every persisted payment amount.
pub const MONEY_SCALE: i64 = 2;

/// Rounds a monetary amount to cents.
pub fn round_money(amount: &BigDecimal) -> BigDecimal {
    amount.round(MONEY_SCALE)
}

/// Converts `amount` from `base` into `local`.
///
/// `rate` is the `(base -> local)` exchange rate, looked up by the caller. It is
/// ignored when the currencies match.
pub fn convert_to_local(
    amount: &BigDecimal,
    base: &str,
    local: &str,
    rate: Option<&BigDecimal>,
) -> Result<BigDecimal, AppError> {
    if base.eq_ignore_ascii_case(local) {
        return Ok(round_money(amount));
    }

    let rate = rate.ok_or_else(|| {
        AppError::NotFound(format!("No exchange rate on file for {} -> {}", base, local))
    })?;

    if rate <= &BigDecimal::from(0) {
        return Err(AppError::BadRequest(format!(
            "Exchange rate for {} -> {} must be positive, got {}",
            base, local, rate
        )));
    }

    Ok(round_money(&(amount * rate)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn dec(s: &str) -> BigDecimal {
        BigDecimal::from_str(s).unwrap()
    }

    #[test]
    fn test_same_currency_is_unchanged() {
        let amount = convert_to_local(&dec("500"), "USD", "USD", None).unwrap();
        assert_eq!(amount, dec("500"));
    }

    #[test]
    fn test_same_currency_ignores_rate() {
        let amount = convert_to_local(&dec("500"), "USD", "usd", Some(&dec("3.5"))).unwrap();
        assert_eq!(amount, dec("500.00"));
    }

    #[test]
    fn test_conversion_applies_rate() {
        let amount = convert_to_local(&dec("500"), "USD", "EUR", Some(&dec("0.92"))).unwrap();
        assert_eq!(amount, dec("460.00"));
    }

    #[test]
    fn test_conversion_rounds_to_cents() {
        let amount = convert_to_local(&dec("100"), "USD", "JPY", Some(&dec("149.12346"))).unwrap();
        assert_eq!(amount, dec("14912.35"));
    }

    #[test]
    fn test_missing_rate_is_explicit_error() {
        let err = convert_to_local(&dec("500"), "USD", "BRL", None).unwrap_err();
        assert!(matches!(err, AppError::NotFound(_)));
    }

    #[test]
    fn test_non_positive_rate_rejected() {
        let err = convert_to_local(&dec("500"), "USD", "BRL", Some(&dec("0"))).unwrap_err();
        assert!(matches!(err, AppError::BadRequest(_)));
    }

    #[test]
    fn test_decimal_math_has_no_binary_rounding() {
        // 0.1 + 0.2 style drift would show up here with f64
        let amount = convert_to_local(&dec("0.30"), "USD", "EUR", Some(&dec("1.1"))).unwrap();
        assert_eq!(amount, dec("0.33"));
    }
}
