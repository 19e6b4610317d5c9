//! Postgres access for the payments schema (`ctms.*`).
//!
//! Writes that belong to a multi-statement unit of work are free functions taking
//! `&mut PgConnection`, so callers pass `&mut *tx` from an open transaction and the
//! transaction decides commit or rollback. Standalone reads and single-row upserts go
//! through `PaymentStorage`, which owns the pool.

use crate::errors::AppError;
use crate::events::EventEnvelope;
use crate::models::*;
use bigdecimal::BigDecimal;
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::{PgConnection, PgPool};
use std::collections::HashMap;
use uuid::Uuid;

// ============ Transactional writes ============

/// Upsert keyed by `(study_id, country_code)`; every field is overwritten.
pub async fn upsert_global_config(
    conn: &mut PgConnection,
    study_id: Uuid,
    country_code: &str,
    config: &CountryPaymentConfig,
    actor: &str,
) -> Result<(), AppError> {
    sqlx::query(
        r#"
        INSERT INTO ctms.global_payment_configs (
            study_id, country_code, currency, exchange_rate, vat_rate,
            payment_methods, banking_details, regulatory_requirements, updated_by, updated_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, now())
        ON CONFLICT (study_id, country_code) DO UPDATE
        SET currency = EXCLUDED.currency,
            exchange_rate = EXCLUDED.exchange_rate,
            vat_rate = EXCLUDED.vat_rate,
            payment_methods = EXCLUDED.payment_methods,
            banking_details = EXCLUDED.banking_details,
            regulatory_requirements = EXCLUDED.regulatory_requirements,
            updated_by = EXCLUDED.updated_by,
            updated_at = now()
        "#,
    )
    .bind(study_id)
    .bind(country_code)
    .bind(&config.currency)
    .bind(&config.exchange_rate)
    .bind(&config.vat_rate)
    .bind(Json(&config.payment_methods))
    .bind(config.banking_details.as_ref().map(Json))
    .bind(&config.regulatory_requirements)
    .bind(actor)
    .execute(&mut *conn)
    .await?;

    Ok(())
}

/// Upsert keyed by `(study_id, site_id)`.
pub async fn upsert_site_setup(
    conn: &mut PgConnection,
    study_id: Uuid,
    site_id: Uuid,
    setup: &SitePaymentSetup,
    actor: &str,
) -> Result<(), AppError> {
    sqlx::query(
        r#"
        INSERT INTO ctms.site_payment_setups (
            study_id, site_id, payment_type, split_payees, local_currency,
            vat_handling, invoice_submission, updated_by, updated_at
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, now())
        ON CONFLICT (study_id, site_id) DO UPDATE
        SET payment_type = EXCLUDED.payment_type,
            split_payees = EXCLUDED.split_payees,
            local_currency = EXCLUDED.local_currency,
            vat_handling = EXCLUDED.vat_handling,
            invoice_submission = EXCLUDED.invoice_submission,
            updated_by = EXCLUDED.updated_by,
            updated_at = now()
        "#,
    )
    .bind(study_id)
    .bind(site_id)
    .bind(setup.payment_type.as_str())
    .bind(Json(&setup.split_payees))
    .bind(&setup.local_currency)
    .bind(setup.vat_handling.as_str())
    .bind(setup.invoice_submission.as_str())
    .bind(actor)
    .execute(&mut *conn)
    .await?;

    Ok(())
}

/// Appends a trigger row. Re-running site setup appends again; rows are never replaced.
pub async fn insert_payment_trigger(
    conn: &mut PgConnection,
    study_id: Uuid,
    site_id: Uuid,
    trigger: &PaymentTrigger,
    actor: &str,
) -> Result<Uuid, AppError> {
    let row: (Uuid,) = sqlx::query_as(
        r#"
        INSERT INTO ctms.payment_triggers (
            study_id, site_id, trigger_type, trigger_condition, calculation_strategy, created_by
        )
        VALUES ($1, $2, $3, $4, $5, $6)
        RETURNING id
        "#,
    )
    .bind(study_id)
    .bind(site_id)
    .bind(trigger.trigger_type.as_str())
    .bind(Json(&trigger.condition))
    .bind(trigger.calculation_strategy.as_str())
    .bind(actor)
    .fetch_one(&mut *conn)
    .await?;

    Ok(row.0)
}

/// Writes an event to the outbox in the caller's transaction.
pub async fn enqueue_event(
    conn: &mut PgConnection,
    envelope: &EventEnvelope,
) -> Result<(), AppError> {
    sqlx::query(
        r#"
        INSERT INTO ctms.domain_events (id, event_type, payload, created_at)
        VALUES ($1, $2, $3, $4)
        "#,
    )
    .bind(envelope.id)
    .bind(&envelope.event_type)
    .bind(&envelope.payload)
    .bind(envelope.occurred_at)
    .execute(&mut *conn)
    .await?;

    Ok(())
}

pub async fn load_visit_context(
    conn: &mut PgConnection,
    visit_id: Uuid,
) -> Result<Option<VisitPaymentContext>, AppError> {
    let context = sqlx::query_as::<_, VisitPaymentContext>(
        r#"
        SELECT v.id AS visit_id, v.site_id, v.study_id, v.visit_type,
               s.payment_type, s.local_currency
        FROM ctms.visits v
        LEFT JOIN ctms.site_payment_setups s
               ON s.study_id = v.study_id AND s.site_id = v.site_id
        WHERE v.id = $1
        "#,
    )
    .bind(visit_id)
    .fetch_optional(&mut *conn)
    .await?;

    Ok(context)
}

pub async fn visit_rate(
    conn: &mut PgConnection,
    study_id: Uuid,
    site_id: Uuid,
    visit_type: &str,
) -> Result<Option<BigDecimal>, AppError> {
    let row = sqlx::query_as::<_, (BigDecimal,)>(
        r#"
        SELECT rate FROM ctms.visit_rates
        WHERE study_id = $1 AND site_id = $2 AND visit_type = $3
        ORDER BY updated_at DESC
        LIMIT 1
        "#,
    )
    .bind(study_id)
    .bind(site_id)
    .bind(visit_type)
    .fetch_optional(&mut *conn)
    .await?;

    Ok(row.map(|r| r.0))
}

/// Rates for the named procedures at a site. Names without a rate are absent from the map.
pub async fn procedure_rates(
    conn: &mut PgConnection,
    study_id: Uuid,
    site_id: Uuid,
    procedure_names: &[String],
) -> Result<HashMap<String, BigDecimal>, AppError> {
    if procedure_names.is_empty() {
        return Ok(HashMap::new());
    }

    let rows = sqlx::query_as::<_, (String, BigDecimal)>(
        r#"
        SELECT procedure_name, rate FROM ctms.procedure_rates
        WHERE study_id = $1 AND site_id = $2 AND procedure_name = ANY($3)
        "#,
    )
    .bind(study_id)
    .bind(site_id)
    .bind(procedure_names)
    .fetch_all(&mut *conn)
    .await?;

    Ok(rows.into_iter().collect())
}

/// Most recently updated `(base -> target)` rate, if any.
pub async fn latest_exchange_rate(
    conn: &mut PgConnection,
    base_currency: &str,
    target_currency: &str,
) -> Result<Option<BigDecimal>, AppError> {
    let row = sqlx::query_as::<_, (BigDecimal,)>(
        r#"
        SELECT rate FROM ctms.exchange_rates
        WHERE base_currency = $1 AND target_currency = $2
        ORDER BY updated_at DESC
        LIMIT 1
        "#,
    )
    .bind(base_currency)
    .bind(target_currency)
    .fetch_optional(&mut *conn)
    .await?;

    Ok(row.map(|r| r.0))
}

pub async fn insert_site_payment(
    conn: &mut PgConnection,
    payment: &NewSitePayment,
) -> Result<SitePayment, AppError> {
    let created = sqlx::query_as::<_, SitePayment>(
        r#"
        INSERT INTO ctms.site_payments (
            visit_id, site_id, study_id, amount, currency, payment_type,
            completed_procedures, triggered_by, status
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        RETURNING id, visit_id, site_id, study_id, amount, currency, payment_type,
                  completed_procedures, triggered_by, status, created_at
        "#,
    )
    .bind(payment.visit_id)
    .bind(payment.site_id)
    .bind(payment.study_id)
    .bind(&payment.amount)
    .bind(&payment.currency)
    .bind(payment.payment_type.as_str())
    .bind(&payment.completed_procedures)
    .bind(&payment.triggered_by)
    .bind(PAYMENT_STATUS_PROCESSING)
    .fetch_one(&mut *conn)
    .await?;

    Ok(created)
}

/// Locks the parent contract row for the rest of the transaction.
///
/// Concurrent amendments against the same parent queue here, so the version number
/// read afterwards cannot be read twice.
pub async fn lock_contract(conn: &mut PgConnection, contract_id: Uuid) -> Result<bool, AppError> {
    let row = sqlx::query_as::<_, (Uuid,)>("SELECT id FROM ctms.contracts WHERE id = $1 FOR UPDATE")
        .bind(contract_id)
        .fetch_optional(&mut *conn)
        .await?;

    Ok(row.is_some())
}

pub async fn insert_amendment_contract(
    conn: &mut PgConnection,
    parent_contract_id: Uuid,
    data: &AmendmentData,
    actor: &str,
) -> Result<(Uuid, String), AppError> {
    let row: (Uuid, String) = sqlx::query_as(
        r#"
        INSERT INTO ctms.contracts (
            parent_contract_id, contract_type, title, description, study_id,
            sponsor_org_id, site_org_id, cro_org_id, status, created_by
        )
        VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
        RETURNING id, status
        "#,
    )
    .bind(parent_contract_id)
    .bind(CONTRACT_TYPE_AMENDMENT)
    .bind(&data.title)
    .bind(&data.description)
    .bind(data.study_id)
    .bind(data.sponsor_org_id)
    .bind(data.site_org_id)
    .bind(data.cro_org_id)
    .bind(CONTRACT_STATUS_DRAFT)
    .bind(actor)
    .fetch_one(&mut *conn)
    .await?;

    Ok(row)
}

pub async fn insert_budget_amendment(
    conn: &mut PgConnection,
    amendment_id: Uuid,
    change: &BudgetChange,
) -> Result<Uuid, AppError> {
    let row: (Uuid,) = sqlx::query_as(
        r#"
        INSERT INTO ctms.budget_amendments (
            amendment_contract_id, original_budget_id, change_type, change_amount, description
        )
        VALUES ($1, $2, $3, $4, $5)
        RETURNING id
        "#,
    )
    .bind(amendment_id)
    .bind(change.original_budget_id)
    .bind(change.change_type.as_str())
    .bind(&change.change_amount)
    .bind(&change.description)
    .fetch_one(&mut *conn)
    .await?;

    Ok(row.0)
}

/// One more than the highest version recorded for the contract, starting from 1.
pub async fn next_contract_version(
    conn: &mut PgConnection,
    contract_id: Uuid,
) -> Result<i32, AppError> {
    let row: (i32,) = sqlx::query_as(
        "SELECT COALESCE(MAX(version_number), 0) + 1 FROM ctms.contract_versions WHERE contract_id = $1",
    )
    .bind(contract_id)
    .fetch_one(&mut *conn)
    .await?;

    Ok(row.0)
}

/// Fails with `Conflict` if the version already exists (unique `(contract_id, version_number)`).
pub async fn insert_contract_version(
    conn: &mut PgConnection,
    contract_id: Uuid,
    amendment_id: Uuid,
    version_number: i32,
    actor: &str,
) -> Result<(), AppError> {
    sqlx::query(
        r#"
        INSERT INTO ctms.contract_versions (contract_id, amendment_id, version_number, created_by)
        VALUES ($1, $2, $3, $4)
        "#,
    )
    .bind(contract_id)
    .bind(amendment_id)
    .bind(version_number)
    .bind(actor)
    .execute(&mut *conn)
    .await?;

    Ok(())
}

// ============ Pool-backed storage ============

/// Database storage for reads and standalone writes.
#[derive(Clone)]
pub struct PaymentStorage {
    pool: PgPool,
}

impl PaymentStorage {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub async fn global_configs(&self, study_id: Uuid) -> Result<Vec<GlobalPaymentConfig>, AppError> {
        let configs = sqlx::query_as::<_, GlobalPaymentConfig>(
            r#"
            SELECT study_id, country_code, currency, exchange_rate, vat_rate, payment_methods,
                   banking_details, regulatory_requirements, updated_by, updated_at
            FROM ctms.global_payment_configs
            WHERE study_id = $1
            ORDER BY country_code
            "#,
        )
        .bind(study_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(configs)
    }

    pub async fn site_payment(&self, payment_id: Uuid) -> Result<Option<SitePayment>, AppError> {
        let payment = sqlx::query_as::<_, SitePayment>(
            r#"
            SELECT id, visit_id, site_id, study_id, amount, currency, payment_type,
                   completed_procedures, triggered_by, status, created_at
            FROM ctms.site_payments
            WHERE id = $1
            "#,
        )
        .bind(payment_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(payment)
    }

    /// Persists every scenario's forecast, with the definitions that produced it, as one row.
    pub async fn insert_forecast(
        &self,
        result: &ForecastResult,
        scenarios: &[ForecastScenario],
        actor: &str,
    ) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO ctms.forecast_results (
                id, study_id, horizon_months, scenarios, results, generated_by, generated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            "#,
        )
        .bind(result.id)
        .bind(result.study_id)
        .bind(result.horizon_months as i32)
        .bind(Json(scenarios))
        .bind(Json(&result.scenarios))
        .bind(actor)
        .bind(result.generated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn forecast(&self, forecast_id: Uuid) -> Result<Option<ForecastRecord>, AppError> {
        let record = sqlx::query_as::<_, ForecastRecord>(
            r#"
            SELECT id, study_id, horizon_months, scenarios, results, generated_by, generated_at
            FROM ctms.forecast_results
            WHERE id = $1
            "#,
        )
        .bind(forecast_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(record)
    }

    /// Appends a new analytics snapshot. Earlier snapshots for the same key are kept.
    #[allow(clippy::too_many_arguments)]
    pub async fn insert_analytics_snapshot(
        &self,
        level: RollupLevel,
        entity_id: Uuid,
        filters: &AnalyticsFilters,
        filters_hash: &str,
        bundle_json: &str,
        checksum: &str,
        actor: &str,
    ) -> Result<(Uuid, DateTime<Utc>), AppError> {
        let row: (Uuid, DateTime<Utc>) = sqlx::query_as(
            r#"
            INSERT INTO ctms.analytics_snapshots (
                level, entity_id, filters, filters_hash, bundle, checksum, created_by
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING id, created_at
            "#,
        )
        .bind(level.as_str())
        .bind(entity_id)
        .bind(Json(filters))
        .bind(filters_hash)
        .bind(bundle_json)
        .bind(checksum)
        .bind(actor)
        .fetch_one(&self.pool)
        .await?;

        Ok(row)
    }

    /// Newest snapshots first, for the caller to validate.
    pub async fn recent_analytics_snapshots(
        &self,
        level: RollupLevel,
        entity_id: Uuid,
        filters_hash: &str,
        limit: i64,
    ) -> Result<Vec<AnalyticsSnapshotRow>, AppError> {
        let rows = sqlx::query_as::<_, AnalyticsSnapshotRow>(
            r#"
            SELECT id, bundle, checksum, created_at
            FROM ctms.analytics_snapshots
            WHERE level = $1 AND entity_id = $2 AND filters_hash = $3
            ORDER BY created_at DESC
            LIMIT $4
            "#,
        )
        .bind(level.as_str())
        .bind(entity_id)
        .bind(filters_hash)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows)
    }

    /// Oldest unpublished outbox events.
    pub async fn pending_events(&self, limit: i64) -> Result<Vec<EventEnvelope>, AppError> {
        let events = sqlx::query_as::<_, EventEnvelope>(
            r#"
            SELECT id, event_type, payload, created_at AS occurred_at
            FROM ctms.domain_events
            WHERE published_at IS NULL AND parked_at IS NULL
            ORDER BY created_at ASC
            LIMIT $1
            "#,
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(events)
    }

    pub async fn mark_event_published(&self, event_id: Uuid) -> Result<(), AppError> {
        sqlx::query(
            "UPDATE ctms.domain_events SET published_at = now() WHERE id = $1 AND published_at IS NULL",
        )
        .bind(event_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Counts a failed publish against the event and parks it once `park` is set
    /// or the attempt budget is spent. Returns whether the event is now parked.
    pub async fn record_publish_failure(
        &self,
        event_id: Uuid,
        error: &str,
        park: bool,
        max_attempts: i32,
    ) -> Result<bool, AppError> {
        let parked: Option<(bool,)> = sqlx::query_as(
            r#"
            UPDATE ctms.domain_events
            SET attempts = attempts + 1,
                last_error = $2,
                parked_at = CASE WHEN $3 OR attempts + 1 >= $4 THEN now() ELSE NULL END
            WHERE id = $1 AND published_at IS NULL
            RETURNING parked_at IS NOT NULL
            "#,
        )
        .bind(event_id)
        .bind(error)
        .bind(park)
        .bind(max_attempts)
        .fetch_optional(&self.pool)
        .await?;

        Ok(parked.map(|(p,)| p).unwrap_or(false))
    }

    /// Deletes published events older than the retention window.
    pub async fn prune_published_events(&self, older_than_days: i32) -> Result<u64, AppError> {
        let result = sqlx::query(
            r#"
            DELETE FROM ctms.domain_events
            WHERE published_at IS NOT NULL
              AND published_at < now() - make_interval(days => $1)
            "#,
        )
        .bind(older_than_days)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected())
    }

    pub async fn upsert_exchange_rate(&self, input: &ExchangeRateInput) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO ctms.exchange_rates (base_currency, target_currency, rate, updated_at)
            VALUES ($1, $2, $3, now())
            ON CONFLICT (base_currency, target_currency) DO UPDATE
            SET rate = EXCLUDED.rate,
                updated_at = now()
            "#,
        )
        .bind(&input.base_currency)
        .bind(&input.target_currency)
        .bind(&input.rate)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn upsert_visit_rate(&self, input: &VisitRateInput) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO ctms.visit_rates (study_id, site_id, visit_type, rate, updated_at)
            VALUES ($1, $2, $3, $4, now())
            ON CONFLICT (study_id, site_id, visit_type) DO UPDATE
            SET rate = EXCLUDED.rate,
                updated_at = now()
            "#,
        )
        .bind(input.study_id)
        .bind(input.site_id)
        .bind(&input.visit_type)
        .bind(&input.rate)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    pub async fn upsert_procedure_rate(&self, input: &ProcedureRateInput) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO ctms.procedure_rates (study_id, site_id, procedure_name, rate, updated_at)
            VALUES ($1, $2, $3, $4, now())
            ON CONFLICT (study_id, site_id, procedure_name) DO UPDATE
            SET rate = EXCLUDED.rate,
                updated_at = now()
            "#,
        )
        .bind(input.study_id)
        .bind(input.site_id)
        .bind(&input.procedure_name)
        .bind(&input.rate)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
