use crate::analytics::{gather_bundle, AnalyticsSource};
use crate::cache_validator::{filters_fingerprint, snapshot_key, ValidatedSnapshot};
use crate::currency::convert_to_local;
use crate::db_storage::{self, PaymentStorage};
use crate::errors::{AppError, ResultExt};
use crate::event_bus::EventPublisher;
use crate::events::{DomainEvent, EventEnvelope};
use crate::forecast;
use crate::models::*;
use crate::payment_calculator::{base_amount, RateLookup};
use crate::payment_triggers::{derive_trigger, validate_country_config, validate_site_setup};
use bigdecimal::BigDecimal;
use chrono::Utc;
use moka::future::Cache;
use sqlx::PgPool;
use std::collections::BTreeMap;
use std::sync::Arc;
use uuid::Uuid;

/// Number of newest snapshot rows inspected when the in-process cache misses.
const SNAPSHOT_LOOKBACK: i64 = 5;

/// Failed publishes tolerated before an outbox event is parked.
pub const MAX_PUBLISH_ATTEMPTS: i32 = 10;

/// Payment, forecasting, amendment, and analytics operations for a study portfolio.
///
/// Holds no per-request state; every write opens its own transaction from the pool.
#[derive(Clone)]
pub struct PaymentService {
    storage: PaymentStorage,
    publisher: Arc<dyn EventPublisher>,
    analytics_source: Arc<dyn AnalyticsSource>,
    analytics_cache: Cache<String, AnalyticsBundle>,
    base_currency: String,
}

impl PaymentService {
    pub fn new(
        pool: PgPool,
        publisher: Arc<dyn EventPublisher>,
        analytics_source: Arc<dyn AnalyticsSource>,
        analytics_cache_capacity: u64,
        base_currency: impl Into<String>,
    ) -> Self {
        Self {
            storage: PaymentStorage::new(pool),
            publisher,
            analytics_source,
            // No TTL: entries are replaced by newer snapshots or evicted by size.
            analytics_cache: Cache::builder()
                .max_capacity(analytics_cache_capacity)
                .build(),
            base_currency: base_currency.into(),
        }
    }

    pub fn base_currency(&self) -> &str {
        &self.base_currency
    }

    pub fn storage(&self) -> &PaymentStorage {
        &self.storage
    }

    /// Upserts country configurations for a study in one transaction.
    pub async fn setup_global_payment_config(
        &self,
        study_id: Uuid,
        country_configs: &BTreeMap<String, CountryPaymentConfig>,
        actor: &str,
    ) -> Result<GlobalPaymentConfigResponse, AppError> {
        if country_configs.is_empty() {
            return Err(AppError::BadRequest(
                "At least one country configuration is required".to_string(),
            ));
        }
        for (country, config) in country_configs {
            validate_country_config(country, config)?;
        }

        let mut tx = self.storage.pool().begin().await?;
        for (country, config) in country_configs {
            db_storage::upsert_global_config(&mut *tx, study_id, country, config, actor)
                .await
                .with_context(|| format!("upserting payment config for {}", country))?;
        }
        tx.commit().await?;

        let countries: Vec<String> = country_configs.keys().cloned().collect();
        tracing::info!(
            "Configured global payments for study {}: {:?} (by {})",
            study_id,
            countries,
            actor
        );

        Ok(GlobalPaymentConfigResponse {
            success: true,
            study_id,
            countries_configured: countries,
        })
    }

    /// Upserts site setups and registers their payment triggers.
    ///
    /// The whole batch is one transaction: a failure on any site rolls back every site.
    pub async fn setup_site_payments(
        &self,
        study_id: Uuid,
        site_configs: &BTreeMap<Uuid, SitePaymentSetup>,
        actor: &str,
    ) -> Result<SitePaymentsResponse, AppError> {
        if site_configs.is_empty() {
            return Err(AppError::BadRequest(
                "At least one site configuration is required".to_string(),
            ));
        }
        for setup in site_configs.values() {
            validate_site_setup(setup)?;
        }

        let site_ids: Vec<Uuid> = site_configs.keys().copied().collect();
        let envelope = EventEnvelope::new(&DomainEvent::SitePaymentsConfigured {
            study_id,
            site_ids: site_ids.clone(),
        })?;

        let mut tx = self.storage.pool().begin().await?;
        for (site_id, setup) in site_configs {
            db_storage::upsert_site_setup(&mut *tx, study_id, *site_id, setup, actor)
                .await
                .with_context(|| format!("configuring site {}", site_id))?;

            match derive_trigger(setup) {
                Some(trigger) => {
                    db_storage::insert_payment_trigger(&mut *tx, study_id, *site_id, &trigger, actor)
                        .await?;
                }
                None => tracing::debug!(
                    "Site {} is {}, no EDC trigger registered",
                    site_id,
                    setup.payment_type
                ),
            }
        }
        db_storage::enqueue_event(&mut *tx, &envelope).await?;
        tx.commit().await?;

        tracing::info!(
            "Configured payments for {} site(s) in study {}",
            site_ids.len(),
            study_id
        );
        self.publish_committed(&envelope).await;

        Ok(SitePaymentsResponse {
            success: true,
            sites_configured: site_ids,
        })
    }

    /// Projects enrollment and cost for each scenario and stores the result as one snapshot.
    pub async fn generate_advanced_forecast(
        &self,
        study_id: Uuid,
        scenarios: &[ForecastScenario],
        horizon_months: u32,
        actor: &str,
    ) -> Result<ForecastResult, AppError> {
        let generated_at = Utc::now();
        let projections = forecast::simulate(scenarios, horizon_months, generated_at.date_naive())?;

        let result = ForecastResult {
            id: Uuid::new_v4(),
            study_id,
            horizon_months,
            scenarios: projections,
            generated_at,
        };
        self.storage
            .insert_forecast(&result, scenarios, actor)
            .await
            .context("storing forecast")?;

        tracing::info!(
            "Generated {}-month forecast {} for study {} ({} scenario(s))",
            horizon_months,
            result.id,
            study_id,
            scenarios.len()
        );

        Ok(result)
    }

    pub async fn get_forecast(&self, forecast_id: Uuid) -> Result<ForecastResult, AppError> {
        self.storage
            .forecast(forecast_id)
            .await?
            .map(ForecastResult::from)
            .ok_or_else(|| AppError::NotFound(format!("Forecast {} not found", forecast_id)))
    }

    /// Creates a site payment for a completed visit.
    pub async fn process_edc_driven_payment(
        &self,
        visit_id: Uuid,
        completed_procedures: &[String],
        actor: &str,
    ) -> Result<EdcPaymentResponse, AppError> {
        let mut tx = self.storage.pool().begin().await?;

        let context = db_storage::load_visit_context(&mut *tx, visit_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Visit {} not found", visit_id)))?;
        let (payment_type, local_currency) = match (&context.payment_type, &context.local_currency) {
            (Some(pt), Some(currency)) => (pt.parse::<PaymentType>()?, currency.clone()),
            _ => {
                return Err(AppError::NotFound(format!(
                    "No payment configuration for study {} site {}",
                    context.study_id, context.site_id
                )))
            }
        };

        let rates = match payment_type {
            PaymentType::VisitBased => RateLookup::Visit(
                db_storage::visit_rate(&mut *tx, context.study_id, context.site_id, &context.visit_type)
                    .await?,
            ),
            PaymentType::ProcedureBased => RateLookup::Procedures(
                db_storage::procedure_rates(
                    &mut *tx,
                    context.study_id,
                    context.site_id,
                    completed_procedures,
                )
                .await?,
            ),
            PaymentType::MilestoneBased => RateLookup::Visit(None),
        };
        let amount = base_amount(payment_type, &context.visit_type, completed_procedures, rates)
            .with_context(|| format!("pricing visit {}", visit_id))?;

        let rate = if self.base_currency.eq_ignore_ascii_case(&local_currency) {
            None
        } else {
            db_storage::latest_exchange_rate(&mut *tx, &self.base_currency, &local_currency).await?
        };
        let amount = convert_to_local(&amount, &self.base_currency, &local_currency, rate.as_ref())?;

        let payment = db_storage::insert_site_payment(
            &mut *tx,
            &NewSitePayment {
                visit_id,
                site_id: context.site_id,
                study_id: context.study_id,
                amount,
                currency: local_currency,
                payment_type,
                completed_procedures: completed_procedures.to_vec(),
                triggered_by: actor.to_string(),
            },
        )
        .await?;

        let envelope = EventEnvelope::new(&DomainEvent::EdcPaymentTriggered {
            payment_id: payment.id,
            visit_id,
            site_id: payment.site_id,
            study_id: payment.study_id,
            amount: payment.amount.clone(),
            currency: payment.currency.clone(),
        })?;
        db_storage::enqueue_event(&mut *tx, &envelope).await?;
        tx.commit().await?;

        tracing::info!(
            "Created payment {} for visit {}: {} {}",
            payment.id,
            visit_id,
            payment.amount,
            payment.currency
        );
        self.publish_committed(&envelope).await;

        Ok(EdcPaymentResponse {
            payment_id: payment.id,
            amount: payment.amount,
            currency: payment.currency,
            status: payment.status,
        })
    }

    pub async fn get_site_payment(&self, payment_id: Uuid) -> Result<SitePayment, AppError> {
        self.storage
            .site_payment(payment_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Payment {} not found", payment_id)))
    }

    /// Creates an amendment contract, its budget changes, and the next contract version atomically.
    pub async fn process_contract_amendment(
        &self,
        parent_contract_id: Uuid,
        amendment: &AmendmentData,
        budget_changes: &[BudgetChange],
        actor: &str,
    ) -> Result<AmendmentResponse, AppError> {
        if amendment.title.trim().is_empty() {
            return Err(AppError::BadRequest(
                "Amendment title cannot be empty".to_string(),
            ));
        }

        let mut tx = self.storage.pool().begin().await?;

        if !db_storage::lock_contract(&mut *tx, parent_contract_id).await? {
            return Err(AppError::NotFound(format!(
                "Contract {} not found",
                parent_contract_id
            )));
        }

        let (amendment_id, status) =
            db_storage::insert_amendment_contract(&mut *tx, parent_contract_id, amendment, actor)
                .await
                .context("creating amendment contract")?;

        for change in budget_changes {
            db_storage::insert_budget_amendment(&mut *tx, amendment_id, change)
                .await
                .with_context(|| format!("recording budget change on {}", change.original_budget_id))?;
        }

        let version_number = db_storage::next_contract_version(&mut *tx, parent_contract_id).await?;
        db_storage::insert_contract_version(
            &mut *tx,
            parent_contract_id,
            amendment_id,
            version_number,
            actor,
        )
        .await
        .context("recording contract version")?;

        let envelope = EventEnvelope::new(&DomainEvent::ContractAmended {
            parent_contract_id,
            amendment_id,
            budget_changes_processed: budget_changes.len(),
        })?;
        db_storage::enqueue_event(&mut *tx, &envelope).await?;
        tx.commit().await?;

        tracing::info!(
            "Contract {} amended by {} (version {}, {} budget change(s))",
            parent_contract_id,
            amendment_id,
            version_number,
            budget_changes.len()
        );
        self.publish_committed(&envelope).await;

        Ok(AmendmentResponse {
            amendment_id,
            parent_contract_id,
            version_number,
            budget_changes_processed: budget_changes.len(),
            status,
        })
    }

    /// Gathers the five analytics categories and stores them as a new snapshot.
    pub async fn generate_advanced_analytics(
        &self,
        level: RollupLevel,
        entity_id: Uuid,
        filters: &AnalyticsFilters,
        actor: &str,
    ) -> Result<AnalyticsBundle, AppError> {
        let bundle = gather_bundle(self.analytics_source.as_ref(), level, entity_id, filters).await?;

        let snapshot = ValidatedSnapshot::new(&bundle)?;
        let filters_hash = filters_fingerprint(filters);
        let (snapshot_id, _) = self
            .storage
            .insert_analytics_snapshot(
                level,
                entity_id,
                filters,
                &filters_hash,
                &snapshot.data,
                &snapshot.checksum,
                actor,
            )
            .await
            .context("storing analytics snapshot")?;

        self.analytics_cache
            .insert(snapshot_key(level, entity_id, &filters_hash), bundle.clone())
            .await;
        tracing::info!(
            "Stored analytics snapshot {} for {} {}",
            snapshot_id,
            level,
            entity_id
        );

        Ok(bundle)
    }

    /// Latest stored analytics for `(level, entity, filters)`.
    pub async fn latest_analytics(
        &self,
        level: RollupLevel,
        entity_id: Uuid,
        filters: &AnalyticsFilters,
    ) -> Result<AnalyticsBundle, AppError> {
        let filters_hash = filters_fingerprint(filters);
        let key = snapshot_key(level, entity_id, &filters_hash);

        if let Some(bundle) = self.analytics_cache.get(&key).await {
            tracing::debug!("Analytics cache hit for {}", key);
            return Ok(bundle);
        }

        let rows = self
            .storage
            .recent_analytics_snapshots(level, entity_id, &filters_hash, SNAPSHOT_LOOKBACK)
            .await?;
        let bundle = rows
            .iter()
            .find_map(|row| ValidatedSnapshot::validate(&row.bundle, &row.checksum))
            .ok_or_else(|| {
                AppError::NotFound(format!("No analytics snapshot for {} {}", level, entity_id))
            })?;

        self.analytics_cache.insert(key, bundle.clone()).await;
        Ok(bundle)
    }

    pub async fn upsert_exchange_rate(&self, input: &ExchangeRateInput) -> Result<(), AppError> {
        if input.rate <= BigDecimal::from(0) {
            return Err(AppError::BadRequest(format!(
                "Exchange rate must be positive, got {}",
                input.rate
            )));
        }
        for code in [&input.base_currency, &input.target_currency] {
            if !crate::config::is_currency_code(code) {
                return Err(AppError::BadRequest(format!("Invalid currency '{}'", code)));
            }
        }
        if input.base_currency == input.target_currency {
            return Err(AppError::BadRequest(
                "Base and target currency must differ".to_string(),
            ));
        }
        self.storage.upsert_exchange_rate(input).await?;
        tracing::info!(
            "Exchange rate {} -> {} set to {}",
            input.base_currency,
            input.target_currency,
            input.rate
        );
        Ok(())
    }

    pub async fn upsert_visit_rate(&self, input: &VisitRateInput) -> Result<(), AppError> {
        validate_rate_input(&input.rate)?;
        self.storage.upsert_visit_rate(input).await
    }

    pub async fn upsert_procedure_rate(&self, input: &ProcedureRateInput) -> Result<(), AppError> {
        validate_rate_input(&input.rate)?;
        self.storage.upsert_procedure_rate(input).await
    }

    /// Republishes up to `limit` outbox events that were never confirmed published.
    ///
    /// A rejected event is parked and skipped. Any other failure stops the sweep so
    /// later events keep their order, and parks the event once its attempts run out.
    pub async fn sweep_outbox(&self, limit: i64) -> Result<usize, AppError> {
        let pending = self.storage.pending_events(limit).await?;
        let mut published = 0;

        for envelope in &pending {
            match self.publisher.publish(envelope).await {
                Ok(()) => {
                    self.storage.mark_event_published(envelope.id).await?;
                    published += 1;
                }
                Err(e @ AppError::Rejected(_)) => {
                    self.record_publish_failure(envelope, &e).await?;
                }
                Err(e) => {
                    let parked = self.record_publish_failure(envelope, &e).await?;
                    if !parked {
                        tracing::warn!(
                            "Outbox sweep stopped at {} ({}): {}",
                            envelope.event_type,
                            envelope.id,
                            e
                        );
                        break;
                    }
                }
            }
        }

        if !pending.is_empty() {
            tracing::info!(
                "Outbox sweep published {}/{} event(s)",
                published,
                pending.len()
            );
        }
        Ok(published)
    }

    /// Deletes published outbox events older than `retention_days`.
    pub async fn prune_outbox(&self, retention_days: i32) -> Result<u64, AppError> {
        let pruned = self.storage.prune_published_events(retention_days).await?;
        if pruned > 0 {
            tracing::info!(
                "Pruned {} published outbox event(s) older than {} days",
                pruned,
                retention_days
            );
        }
        Ok(pruned)
    }

    /// Publishes an event whose outbox row is already committed.
    ///
    /// A failure here does not fail the request; the row stays pending for the sweep.
    async fn publish_committed(&self, envelope: &EventEnvelope) {
        match self.publisher.publish(envelope).await {
            Ok(()) => {
                if let Err(e) = self.storage.mark_event_published(envelope.id).await {
                    tracing::warn!("Published {} but could not mark it: {}", envelope.id, e);
                }
            }
            Err(e) => {
                tracing::warn!(
                    "Deferred {} ({}) to outbox sweep: {}",
                    envelope.event_type,
                    envelope.id,
                    e
                );
                if let Err(record_err) = self.record_publish_failure(envelope, &e).await {
                    tracing::warn!(
                        "Could not record publish failure for {}: {}",
                        envelope.id,
                        record_err
                    );
                }
            }
        }
    }

    async fn record_publish_failure(
        &self,
        envelope: &EventEnvelope,
        error: &AppError,
    ) -> Result<bool, AppError> {
        let rejected = matches!(error, AppError::Rejected(_));
        let parked = self
            .storage
            .record_publish_failure(
                envelope.id,
                &error.to_string(),
                rejected,
                MAX_PUBLISH_ATTEMPTS,
            )
            .await?;

        if parked {
            tracing::error!(
                "Parked outbox event {} ({}) after publish failure: {}",
                envelope.event_type,
                envelope.id,
                error
            );
        }
        Ok(parked)
    }
}

fn validate_rate_input(rate: &BigDecimal) -> Result<(), AppError> {
    if rate < &BigDecimal::from(0) {
        return Err(AppError::BadRequest(format!(
            "Rate must not be negative, got {}",
            rate
        )));
    }
    Ok(())
}
