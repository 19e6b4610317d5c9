//! Month-by-month enrollment and cost projection.
//!
//! Each scenario is simulated independently from the first day of the start month.
//! Counts are floored at every step, so `enrolled <= screening` and
//! `active = enrolled - dropouts` always hold for rates in `[0, 1]`.

use crate::currency::round_money;
use crate::errors::AppError;
use crate::models::{ForecastScenario, Milestone, MonthlyForecast, ScenarioForecast};
use bigdecimal::{BigDecimal, RoundingMode, ToPrimitive};
use chrono::{Datelike, Months, NaiveDate};
use std::str::FromStr;

/// Participants screened per month at full activation and a 100% enrollment rate.
pub const BASE_SCREENING_RATE: f64 = 10.0;

pub const MAX_HORIZON_MONTHS: u32 = 120;

pub fn validate_request(scenarios: &[ForecastScenario], horizon_months: u32) -> Result<(), AppError> {
    if horizon_months == 0 || horizon_months > MAX_HORIZON_MONTHS {
        return Err(AppError::BadRequest(format!(
            "horizon_months must be between 1 and {}, got {}",
            MAX_HORIZON_MONTHS, horizon_months
        )));
    }
    if scenarios.is_empty() {
        return Err(AppError::BadRequest(
            "At least one forecast scenario is required".to_string(),
        ));
    }
    for scenario in scenarios {
        validate_scenario(scenario)?;
    }
    Ok(())
}

fn validate_scenario(scenario: &ForecastScenario) -> Result<(), AppError> {
    let a = &scenario.assumptions;
    let rates = [
        ("screen_fail_rate", a.screen_fail_rate),
        ("dropout_rate", a.dropout_rate),
        ("enrollment_rate", a.enrollment_rate),
        ("site_activation_rate", a.site_activation_rate),
        ("holdback_percentage", a.holdback_percentage),
    ];
    for (name, value) in rates {
        if !(0.0..=1.0).contains(&value) {
            return Err(AppError::BadRequest(format!(
                "Scenario '{}': {} must be in [0, 1], got {}",
                scenario.name, name, value
            )));
        }
    }

    let zero = BigDecimal::from(0);
    for visit in &scenario.visit_flow {
        if visit.cost_per_visit < zero {
            return Err(AppError::BadRequest(format!(
                "Scenario '{}': visit '{}' has a negative cost",
                scenario.name, visit.visit_id
            )));
        }
    }
    for milestone in &scenario.milestones {
        if !(0.0..=100.0).contains(&milestone.probability) {
            return Err(AppError::BadRequest(format!(
                "Scenario '{}': milestone '{}' probability must be in [0, 100]",
                scenario.name, milestone.id
            )));
        }
        if milestone.payment_amount < zero {
            return Err(AppError::BadRequest(format!(
                "Scenario '{}': milestone '{}' has a negative payment amount",
                scenario.name, milestone.id
            )));
        }
    }
    Ok(())
}

/// Runs every scenario over `horizon_months` starting at the month containing `start`.
pub fn simulate(
    scenarios: &[ForecastScenario],
    horizon_months: u32,
    start: NaiveDate,
) -> Result<Vec<ScenarioForecast>, AppError> {
    validate_request(scenarios, horizon_months)?;
    let months = forecast_months(start, horizon_months)?;

    scenarios
        .iter()
        .map(|scenario| simulate_scenario(scenario, &months))
        .collect()
}

/// First day of each forecast month.
fn forecast_months(start: NaiveDate, horizon_months: u32) -> Result<Vec<NaiveDate>, AppError> {
    let first = start
        .with_day(1)
        .ok_or_else(|| AppError::InternalError(format!("Invalid start date {}", start)))?;

    (0..horizon_months)
        .map(|offset| {
            first
                .checked_add_months(Months::new(offset))
                .ok_or_else(|| AppError::BadRequest("Forecast horizon out of range".to_string()))
        })
        .collect()
}

fn simulate_scenario(
    scenario: &ForecastScenario,
    months: &[NaiveDate],
) -> Result<ScenarioForecast, AppError> {
    let a = &scenario.assumptions;
    let cost_per_participant: BigDecimal = scenario
        .visit_flow
        .iter()
        .map(|visit| visit.cost_per_visit.clone())
        .sum();

    let screen_fail_rate = to_decimal(a.screen_fail_rate)?;
    let dropout_rate = to_decimal(a.dropout_rate)?;
    let activation_rate = to_decimal(a.site_activation_rate)?;
    let full_rate = to_decimal(BASE_SCREENING_RATE)? * to_decimal(a.enrollment_rate)?;
    let one = BigDecimal::from(1);

    let mut monthly = Vec::with_capacity(months.len());
    let mut cumulative_enrollment: u64 = 0;

    for (index, month) in months.iter().enumerate() {
        let ramp = BigDecimal::from(index as u64 + 1) * &activation_rate;
        let activation = if ramp > one { one.clone() } else { ramp };
        let screening = floor_count(&(&full_rate * &activation))?;
        let enrolled = floor_count(&(BigDecimal::from(screening) * (&one - &screen_fail_rate)))?;
        let dropouts = floor_count(&(BigDecimal::from(enrolled) * &dropout_rate))?;
        let active = enrolled.saturating_sub(dropouts);

        // Every visit in the flow is costed against this month's active count.
        let visit_cost = round_money(&(&cost_per_participant * BigDecimal::from(active)));
        let milestone_payments = round_money(&milestones_due(&scenario.milestones, *month)?);
        let total_cost = &visit_cost + &milestone_payments;
        cumulative_enrollment += enrolled;

        monthly.push(MonthlyForecast {
            month: month.format("%Y-%m").to_string(),
            screening,
            enrolled,
            dropouts,
            active,
            visit_cost,
            milestone_payments,
            total_cost,
            cumulative_enrollment,
        });
    }

    let total_projected_cost: BigDecimal = monthly.iter().map(|m| m.total_cost.clone()).sum();
    let total_projected_enrollment = monthly.iter().map(|m| m.enrolled).sum();
    let projected_holdback = round_money(&(&total_projected_cost * to_decimal(a.holdback_percentage)?));

    Ok(ScenarioForecast {
        scenario: scenario.name.clone(),
        monthly,
        total_projected_cost,
        total_projected_enrollment,
        projected_holdback,
    })
}

/// Probability-weighted milestone payments expected in the calendar month of `month`.
fn milestones_due(milestones: &[Milestone], month: NaiveDate) -> Result<BigDecimal, AppError> {
    let hundred = BigDecimal::from(100);
    let mut total = BigDecimal::from(0);
    for milestone in milestones.iter().filter(|m| {
        m.expected_date.year() == month.year() && m.expected_date.month() == month.month()
    }) {
        total += &milestone.payment_amount * to_decimal(milestone.probability)? / &hundred;
    }
    Ok(total)
}

/// Whole participants in `value`, rounded down. Decimal arithmetic keeps exact products
/// like `10 * (1 - 0.9)` from landing just under an integer.
fn floor_count(value: &BigDecimal) -> Result<u64, AppError> {
    value
        .with_scale_round(0, RoundingMode::Floor)
        .to_u64()
        .ok_or_else(|| AppError::BadRequest(format!("Participant count {} out of range", value)))
}

fn to_decimal(value: f64) -> Result<BigDecimal, AppError> {
    BigDecimal::from_str(&value.to_string())
        .map_err(|e| AppError::BadRequest(format!("Invalid numeric value {}: {}", value, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ForecastAssumptions, VisitFlowEntry};

    fn dec(s: &str) -> BigDecimal {
        BigDecimal::from_str(s).unwrap()
    }

    fn jan_2026() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 1, 15).unwrap()
    }

    fn scenario() -> ForecastScenario {
        ForecastScenario {
            name: "base".to_string(),
            assumptions: ForecastAssumptions {
                screen_fail_rate: 0.2,
                dropout_rate: 0.1,
                enrollment_rate: 1.0,
                site_activation_rate: 0.5,
                holdback_percentage: 0.1,
            },
            visit_flow: vec![],
            milestones: vec![],
        }
    }

    #[test]
    fn test_first_month_matches_worked_example() {
        let result = simulate(&[scenario()], 3, jan_2026()).unwrap();
        let first = &result[0].monthly[0];

        assert_eq!(first.screening, 5);
        assert_eq!(first.enrolled, 4);
        assert_eq!(first.dropouts, 0);
        assert_eq!(first.active, 4);
        assert_eq!(first.month, "2026-01");
    }

    #[test]
    fn test_high_screen_fail_rate_keeps_exact_enrollment() {
        let mut s = scenario();
        s.assumptions.screen_fail_rate = 0.9;
        s.assumptions.site_activation_rate = 1.0;

        let result = simulate(&[s], 1, jan_2026()).unwrap();
        let first = &result[0].monthly[0];
        // 10 * (1 - 0.9) is exactly 1, not 0.999...
        assert_eq!(first.screening, 10);
        assert_eq!(first.enrolled, 1);
    }

    #[test]
    fn test_fractional_rates_floor_exact_products() {
        let mut s = scenario();
        s.assumptions.enrollment_rate = 0.7;
        s.assumptions.site_activation_rate = 0.3;
        s.assumptions.screen_fail_rate = 0.0;
        s.assumptions.dropout_rate = 0.3;

        let result = simulate(&[s], 4, jan_2026()).unwrap();
        let screening: Vec<u64> = result[0].monthly.iter().map(|m| m.screening).collect();
        // 7 * 0.3 = 2.1, 7 * 0.6 = 4.2, 7 * 0.9 = 6.3, then capped at 7
        assert_eq!(screening, vec![2, 4, 6, 7]);
        // 7 * 0.3 = 2.1 dropouts in the capped month
        assert_eq!(result[0].monthly[3].dropouts, 2);
    }

    #[test]
    fn test_activation_ramp_caps_at_one() {
        let result = simulate(&[scenario()], 3, jan_2026()).unwrap();
        let screening: Vec<u64> = result[0].monthly.iter().map(|m| m.screening).collect();
        assert_eq!(screening, vec![5, 10, 10]);
    }

    #[test]
    fn test_cumulative_enrollment_is_running_sum() {
        let result = simulate(&[scenario()], 3, jan_2026()).unwrap();
        let cumulative: Vec<u64> = result[0]
            .monthly
            .iter()
            .map(|m| m.cumulative_enrollment)
            .collect();

        assert_eq!(cumulative, vec![4, 12, 20]);
        assert_eq!(result[0].total_projected_enrollment, 20);
    }

    #[test]
    fn test_horizon_sets_month_count() {
        let result = simulate(&[scenario(), scenario()], 7, jan_2026()).unwrap();
        assert_eq!(result.len(), 2);
        assert!(result.iter().all(|s| s.monthly.len() == 7));
        assert_eq!(result[0].monthly[6].month, "2026-07");
    }

    #[test]
    fn test_months_roll_over_year_end() {
        let start = NaiveDate::from_ymd_opt(2025, 11, 30).unwrap();
        let result = simulate(&[scenario()], 3, start).unwrap();
        let labels: Vec<&str> = result[0].monthly.iter().map(|m| m.month.as_str()).collect();
        assert_eq!(labels, vec!["2025-11", "2025-12", "2026-01"]);
    }

    #[test]
    fn test_visit_cost_uses_full_flow_against_active() {
        let mut s = scenario();
        s.visit_flow = vec![
            VisitFlowEntry {
                visit_id: "screening".to_string(),
                expected_duration_days: 1,
                procedure_count: 3,
                cost_per_visit: dec("100"),
            },
            VisitFlowEntry {
                visit_id: "week_4".to_string(),
                expected_duration_days: 1,
                procedure_count: 2,
                cost_per_visit: dec("50.50"),
            },
        ];

        let result = simulate(&[s], 2, jan_2026()).unwrap();
        // month 0: active 4 -> 4 * 150.50
        assert_eq!(result[0].monthly[0].visit_cost, dec("602.00"));
        // month 1: active 8
        assert_eq!(result[0].monthly[1].visit_cost, dec("1204.00"));
    }

    #[test]
    fn test_milestones_weighted_by_probability_in_their_month() {
        let mut s = scenario();
        s.milestones = vec![
            Milestone {
                id: "first_patient_in".to_string(),
                probability: 50.0,
                expected_date: NaiveDate::from_ymd_opt(2026, 2, 20).unwrap(),
                payment_amount: dec("10000"),
            },
            Milestone {
                id: "database_lock".to_string(),
                probability: 90.0,
                expected_date: NaiveDate::from_ymd_opt(2027, 2, 1).unwrap(),
                payment_amount: dec("50000"),
            },
        ];

        let result = simulate(&[s], 3, jan_2026()).unwrap();
        let monthly = &result[0].monthly;

        assert_eq!(monthly[0].milestone_payments, BigDecimal::from(0));
        assert_eq!(monthly[1].milestone_payments, dec("5000"));
        assert_eq!(monthly[1].total_cost, dec("5000"));
        assert_eq!(monthly[2].milestone_payments, BigDecimal::from(0));
    }

    #[test]
    fn test_totals_and_holdback() {
        let mut s = scenario();
        s.visit_flow = vec![VisitFlowEntry {
            visit_id: "baseline".to_string(),
            expected_duration_days: 1,
            procedure_count: 1,
            cost_per_visit: dec("10"),
        }];

        let result = simulate(&[s], 3, jan_2026()).unwrap();
        // active per month: 4, 8, 8
        assert_eq!(result[0].total_projected_cost, dec("200"));
        assert_eq!(result[0].projected_holdback, dec("20"));
    }

    #[test]
    fn test_zero_horizon_rejected() {
        assert!(matches!(
            simulate(&[scenario()], 0, jan_2026()),
            Err(AppError::BadRequest(_))
        ));
    }

    #[test]
    fn test_out_of_range_rate_rejected() {
        let mut s = scenario();
        s.assumptions.dropout_rate = 1.5;
        assert!(simulate(&[s], 3, jan_2026()).is_err());
    }

    #[test]
    fn test_no_scenarios_rejected() {
        assert!(simulate(&[], 3, jan_2026()).is_err());
    }
}
