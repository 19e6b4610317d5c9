use crate::errors::AppError;
use crate::models::{
    AnalyticsBundle, AnalyticsFilters, BudgetTracking, ContractTracking, CycleTimeReporting,
    Kpis, PaymentTracking, RollupLevel,
};
use async_trait::async_trait;
use uuid::Uuid;

/// Data access for the five analytics categories at a rollup level.
#[async_trait]
pub trait AnalyticsSource: Send + Sync {
    async fn budget_tracking(
        &self,
        level: RollupLevel,
        entity_id: Uuid,
        filters: &AnalyticsFilters,
    ) -> Result<BudgetTracking, AppError>;

    async fn contract_tracking(
        &self,
        level: RollupLevel,
        entity_id: Uuid,
        filters: &AnalyticsFilters,
    ) -> Result<ContractTracking, AppError>;

    async fn payment_tracking(
        &self,
        level: RollupLevel,
        entity_id: Uuid,
        filters: &AnalyticsFilters,
    ) -> Result<PaymentTracking, AppError>;

    async fn cycle_time_reporting(
        &self,
        level: RollupLevel,
        entity_id: Uuid,
        filters: &AnalyticsFilters,
    ) -> Result<CycleTimeReporting, AppError>;

    async fn kpis(
        &self,
        level: RollupLevel,
        entity_id: Uuid,
        filters: &AnalyticsFilters,
    ) -> Result<Kpis, AppError>;
}

/// Zero-filled summaries, used until real aggregation queries are wired in.
#[derive(Debug, Clone, Default)]
pub struct PlaceholderAnalytics;

#[async_trait]
impl AnalyticsSource for PlaceholderAnalytics {
    async fn budget_tracking(
        &self,
        _level: RollupLevel,
        _entity_id: Uuid,
        _filters: &AnalyticsFilters,
    ) -> Result<BudgetTracking, AppError> {
        Ok(BudgetTracking::default())
    }

    async fn contract_tracking(
        &self,
        _level: RollupLevel,
        _entity_id: Uuid,
        _filters: &AnalyticsFilters,
    ) -> Result<ContractTracking, AppError> {
        Ok(ContractTracking::default())
    }

    async fn payment_tracking(
        &self,
        _level: RollupLevel,
        _entity_id: Uuid,
        _filters: &AnalyticsFilters,
    ) -> Result<PaymentTracking, AppError> {
        Ok(PaymentTracking::default())
    }

    async fn cycle_time_reporting(
        &self,
        _level: RollupLevel,
        _entity_id: Uuid,
        _filters: &AnalyticsFilters,
    ) -> Result<CycleTimeReporting, AppError> {
        Ok(CycleTimeReporting::default())
    }

    async fn kpis(
        &self,
        _level: RollupLevel,
        _entity_id: Uuid,
        _filters: &AnalyticsFilters,
    ) -> Result<Kpis, AppError> {
        Ok(Kpis::default())
    }
}

/// Fetches all five categories concurrently. Fails if any one of them fails.
pub async fn gather_bundle(
    source: &dyn AnalyticsSource,
    level: RollupLevel,
    entity_id: Uuid,
    filters: &AnalyticsFilters,
) -> Result<AnalyticsBundle, AppError> {
    if let (Some(from), Some(to)) = (filters.date_from, filters.date_to) {
        if from > to {
            return Err(AppError::BadRequest(format!(
                "date_from {} is after date_to {}",
                from, to
            )));
        }
    }

    let (budget_tracking, contract_tracking, payment_tracking, cycle_time_reporting, kpis) = tokio::try_join!(
        source.budget_tracking(level, entity_id, filters),
        source.contract_tracking(level, entity_id, filters),
        source.payment_tracking(level, entity_id, filters),
        source.cycle_time_reporting(level, entity_id, filters),
        source.kpis(level, entity_id, filters),
    )?;

    Ok(AnalyticsBundle {
        budget_tracking,
        contract_tracking,
        payment_tracking,
        cycle_time_reporting,
        kpis,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    struct FailingKpis;

    #[async_trait]
    impl AnalyticsSource for FailingKpis {
        async fn budget_tracking(
            &self,
            l: RollupLevel,
            e: Uuid,
            f: &AnalyticsFilters,
        ) -> Result<BudgetTracking, AppError> {
            PlaceholderAnalytics.budget_tracking(l, e, f).await
        }

        async fn contract_tracking(
            &self,
            _l: RollupLevel,
            _e: Uuid,
            _f: &AnalyticsFilters,
        ) -> Result<ContractTracking, AppError> {
            Ok(ContractTracking {
                total_contracts: 12,
                amendments: 3,
                ..Default::default()
            })
        }

        async fn payment_tracking(
            &self,
            l: RollupLevel,
            e: Uuid,
            f: &AnalyticsFilters,
        ) -> Result<PaymentTracking, AppError> {
            PlaceholderAnalytics.payment_tracking(l, e, f).await
        }

        async fn cycle_time_reporting(
            &self,
            l: RollupLevel,
            e: Uuid,
            f: &AnalyticsFilters,
        ) -> Result<CycleTimeReporting, AppError> {
            PlaceholderAnalytics.cycle_time_reporting(l, e, f).await
        }

        async fn kpis(
            &self,
            _l: RollupLevel,
            _e: Uuid,
            _f: &AnalyticsFilters,
        ) -> Result<Kpis, AppError> {
            Err(AppError::DownstreamUnavailable("kpi warehouse".to_string()))
        }
    }

    #[tokio::test]
    async fn test_placeholder_bundle_is_zeroed() {
        let bundle = gather_bundle(
            &PlaceholderAnalytics,
            RollupLevel::Portfolio,
            Uuid::new_v4(),
            &AnalyticsFilters::default(),
        )
        .await
        .unwrap();

        assert_eq!(bundle, AnalyticsBundle::default());
    }

    #[tokio::test]
    async fn test_any_category_failure_fails_the_bundle() {
        let result = gather_bundle(
            &FailingKpis,
            RollupLevel::Study,
            Uuid::new_v4(),
            &AnalyticsFilters::default(),
        )
        .await;

        assert!(matches!(result, Err(AppError::DownstreamUnavailable(_))));
    }

    #[tokio::test]
    async fn test_inverted_date_range_rejected() {
        let filters = AnalyticsFilters {
            date_from: NaiveDate::from_ymd_opt(2026, 3, 1),
            date_to: NaiveDate::from_ymd_opt(2026, 1, 1),
            ..Default::default()
        };

        let result =
            gather_bundle(&PlaceholderAnalytics, RollupLevel::Site, Uuid::new_v4(), &filters).await;
        assert!(matches!(result, Err(AppError::BadRequest(_))));
    }
}
