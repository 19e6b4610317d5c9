use crate::config::Config;
use crate::errors::AppError;
use crate::models::*;
use crate::services::PaymentService;
use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    Json,
};
use chrono::NaiveDate;
use serde::Deserialize;
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::Arc;
use uuid::Uuid;

/// Header carrying the id of the user or system performing a write.
pub const ACTOR_HEADER: &str = "x-actor-id";
const DEFAULT_ACTOR: &str = "system";

/// Shared application state injected into handlers.
#[derive(Clone)]
pub struct AppState {
    pub service: PaymentService,
    /// Application configuration.
    pub config: Config,
}

/// Actor from the `X-Actor-Id` header, `system` when absent or blank.
pub fn actor_from_headers(headers: &HeaderMap) -> String {
    headers
        .get(ACTOR_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .unwrap_or(DEFAULT_ACTOR)
        .to_string()
}

/// Health check endpoint.
pub async fn health(State(state): State<Arc<AppState>>) -> (StatusCode, Json<serde_json::Value>) {
    (
        StatusCode::OK,
        Json(json!({
            "status": "healthy",
            "service": "ctms-payments-api",
            "version": env!("CARGO_PKG_VERSION"),
            "base_currency": state.config.base_currency,
        })),
    )
}

/// PUT /api/v1/studies/:study_id/payment-config
///
/// Body maps ISO country codes to their payment configuration.
pub async fn setup_global_payment_config(
    State(state): State<Arc<AppState>>,
    Path(study_id): Path<Uuid>,
    headers: HeaderMap,
    Json(country_configs): Json<BTreeMap<String, CountryPaymentConfig>>,
) -> Result<Json<GlobalPaymentConfigResponse>, AppError> {
    let actor = actor_from_headers(&headers);
    tracing::info!(
        "PUT payment-config for study {} ({} countries)",
        study_id,
        country_configs.len()
    );

    let response = state
        .service
        .setup_global_payment_config(study_id, &country_configs, &actor)
        .await?;
    Ok(Json(response))
}

/// GET /api/v1/studies/:study_id/payment-config
pub async fn get_global_payment_config(
    State(state): State<Arc<AppState>>,
    Path(study_id): Path<Uuid>,
) -> Result<Json<Vec<GlobalPaymentConfig>>, AppError> {
    let configs = state.service.storage().global_configs(study_id).await?;
    Ok(Json(configs))
}

/// PUT /api/v1/studies/:study_id/site-payments
///
/// Body maps site ids to their payment setup.
pub async fn setup_site_payments(
    State(state): State<Arc<AppState>>,
    Path(study_id): Path<Uuid>,
    headers: HeaderMap,
    Json(site_configs): Json<BTreeMap<Uuid, SitePaymentSetup>>,
) -> Result<Json<SitePaymentsResponse>, AppError> {
    let actor = actor_from_headers(&headers);
    tracing::info!(
        "PUT site-payments for study {} ({} sites)",
        study_id,
        site_configs.len()
    );

    let response = state
        .service
        .setup_site_payments(study_id, &site_configs, &actor)
        .await?;
    Ok(Json(response))
}

/// POST /api/v1/studies/:study_id/forecasts
pub async fn generate_forecast(
    State(state): State<Arc<AppState>>,
    Path(study_id): Path<Uuid>,
    headers: HeaderMap,
    Json(request): Json<ForecastRequest>,
) -> Result<(StatusCode, Json<ForecastResult>), AppError> {
    let actor = actor_from_headers(&headers);
    let result = state
        .service
        .generate_advanced_forecast(study_id, &request.scenarios, request.horizon_months, &actor)
        .await?;
    Ok((StatusCode::CREATED, Json(result)))
}

/// GET /api/v1/forecasts/:id
pub async fn get_forecast(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<ForecastResult>, AppError> {
    Ok(Json(state.service.get_forecast(id).await?))
}

/// POST /api/v1/visits/:visit_id/payments
///
/// Called by the EDC integration when a visit is marked completed.
pub async fn process_edc_payment(
    State(state): State<Arc<AppState>>,
    Path(visit_id): Path<Uuid>,
    headers: HeaderMap,
    Json(request): Json<EdcPaymentRequest>,
) -> Result<(StatusCode, Json<EdcPaymentResponse>), AppError> {
    let actor = actor_from_headers(&headers);
    tracing::info!(
        "POST payment for visit {} ({} procedures)",
        visit_id,
        request.completed_procedures.len()
    );

    let response = state
        .service
        .process_edc_driven_payment(visit_id, &request.completed_procedures, &actor)
        .await?;
    Ok((StatusCode::CREATED, Json(response)))
}

/// GET /api/v1/payments/:id
pub async fn get_payment(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<Json<SitePayment>, AppError> {
    Ok(Json(state.service.get_site_payment(id).await?))
}

/// POST /api/v1/contracts/:id/amendments
pub async fn process_amendment(
    State(state): State<Arc<AppState>>,
    Path(contract_id): Path<Uuid>,
    headers: HeaderMap,
    Json(request): Json<AmendmentRequest>,
) -> Result<(StatusCode, Json<AmendmentResponse>), AppError> {
    let actor = actor_from_headers(&headers);
    tracing::info!(
        "POST amendment on contract {} ({} budget changes)",
        contract_id,
        request.budget_changes.len()
    );

    let response = state
        .service
        .process_contract_amendment(contract_id, &request.amendment, &request.budget_changes, &actor)
        .await?;
    Ok((StatusCode::CREATED, Json(response)))
}

/// POST /api/v1/analytics/:level/:entity_id
pub async fn generate_analytics(
    State(state): State<Arc<AppState>>,
    Path((level, entity_id)): Path<(String, Uuid)>,
    headers: HeaderMap,
    Json(request): Json<AnalyticsRequest>,
) -> Result<Json<AnalyticsBundle>, AppError> {
    let level: RollupLevel = level.parse()?;
    let actor = actor_from_headers(&headers);

    let bundle = state
        .service
        .generate_advanced_analytics(level, entity_id, &request.filters, &actor)
        .await?;
    Ok(Json(bundle))
}

/// Query form of [`AnalyticsFilters`]; list filters are comma separated.
#[derive(Debug, Default, Deserialize)]
pub struct AnalyticsQuery {
    pub date_from: Option<NaiveDate>,
    pub date_to: Option<NaiveDate>,
    pub country_codes: Option<String>,
    pub site_ids: Option<String>,
    pub currency: Option<String>,
}

impl TryFrom<AnalyticsQuery> for AnalyticsFilters {
    type Error = AppError;

    fn try_from(query: AnalyticsQuery) -> Result<Self, Self::Error> {
        let split = |raw: &Option<String>| -> Vec<String> {
            raw.as_deref()
                .unwrap_or_default()
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        };

        let site_ids = split(&query.site_ids)
            .iter()
            .map(|s| {
                Uuid::parse_str(s)
                    .map_err(|_| AppError::BadRequest(format!("Invalid site id '{}'", s)))
            })
            .collect::<Result<Vec<_>, _>>()?;

        Ok(AnalyticsFilters {
            date_from: query.date_from,
            date_to: query.date_to,
            country_codes: split(&query.country_codes),
            site_ids,
            currency: query.currency,
        })
    }
}

/// GET /api/v1/analytics/:level/:entity_id/latest
pub async fn latest_analytics(
    State(state): State<Arc<AppState>>,
    Path((level, entity_id)): Path<(String, Uuid)>,
    Query(query): Query<AnalyticsQuery>,
) -> Result<Json<AnalyticsBundle>, AppError> {
    let level: RollupLevel = level.parse()?;
    let filters = AnalyticsFilters::try_from(query)?;

    let bundle = state
        .service
        .latest_analytics(level, entity_id, &filters)
        .await?;
    Ok(Json(bundle))
}

/// PUT /api/v1/reference/exchange-rates
pub async fn upsert_exchange_rate(
    State(state): State<Arc<AppState>>,
    Json(input): Json<ExchangeRateInput>,
) -> Result<StatusCode, AppError> {
    state.service.upsert_exchange_rate(&input).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// PUT /api/v1/reference/visit-rates
pub async fn upsert_visit_rate(
    State(state): State<Arc<AppState>>,
    Json(input): Json<VisitRateInput>,
) -> Result<StatusCode, AppError> {
    state.service.upsert_visit_rate(&input).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// PUT /api/v1/reference/procedure-rates
pub async fn upsert_procedure_rate(
    State(state): State<Arc<AppState>>,
    Json(input): Json<ProcedureRateInput>,
) -> Result<StatusCode, AppError> {
    state.service.upsert_procedure_rate(&input).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn test_actor_defaults_to_system() {
        let mut headers = HeaderMap::new();
        assert_eq!(actor_from_headers(&headers), "system");

        headers.insert(ACTOR_HEADER, HeaderValue::from_static("  "));
        assert_eq!(actor_from_headers(&headers), "system");

        headers.insert(ACTOR_HEADER, HeaderValue::from_static("cra-042"));
        assert_eq!(actor_from_headers(&headers), "cra-042");
    }

    #[test]
    fn test_analytics_query_splits_lists() {
        let site = Uuid::new_v4();
        let query = AnalyticsQuery {
            country_codes: Some("US, DE,,".to_string()),
            site_ids: Some(site.to_string()),
            ..Default::default()
        };

        let filters = AnalyticsFilters::try_from(query).unwrap();
        assert_eq!(filters.country_codes, vec!["US", "DE"]);
        assert_eq!(filters.site_ids, vec![site]);
    }

    #[test]
    fn test_analytics_query_rejects_bad_site_id() {
        let query = AnalyticsQuery {
            site_ids: Some("not-a-uuid".to_string()),
            ..Default::default()
        };

        assert!(matches!(
            AnalyticsFilters::try_from(query),
            Err(AppError::BadRequest(_))
        ));
    }
}
