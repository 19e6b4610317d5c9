/// Integration tests with a mocked message bus
/// Exercises the HTTP publisher and the service's validation paths without Postgres
use async_trait::async_trait;
use ctms_payments_api::analytics::PlaceholderAnalytics;
use ctms_payments_api::errors::AppError;
use ctms_payments_api::event_bus::{EventPublisher, HttpEventPublisher};
use ctms_payments_api::events::{DomainEvent, EventEnvelope};
use ctms_payments_api::models::*;
use ctms_payments_api::services::PaymentService;
use sqlx::postgres::PgPoolOptions;
use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use uuid::Uuid;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn amended_event() -> EventEnvelope {
    EventEnvelope::new(&DomainEvent::ContractAmended {
        parent_contract_id: Uuid::new_v4(),
        amendment_id: Uuid::new_v4(),
        budget_changes_processed: 2,
    })
    .unwrap()
}

/// Records every envelope it is asked to publish.
#[derive(Default)]
struct RecordingPublisher {
    published: Mutex<Vec<EventEnvelope>>,
}

#[async_trait]
impl EventPublisher for RecordingPublisher {
    async fn publish(&self, envelope: &EventEnvelope) -> Result<(), AppError> {
        self.published.lock().unwrap().push(envelope.clone());
        Ok(())
    }
}

/// Service over a pool that never connects; only paths rejected before any query are usable.
fn offline_service(publisher: Arc<RecordingPublisher>) -> PaymentService {
    let pool = PgPoolOptions::new()
        .connect_lazy("postgres://offline@127.0.0.1:1/none")
        .unwrap();
    PaymentService::new(pool, publisher, Arc::new(PlaceholderAnalytics), 100, "USD")
}

#[tokio::test]
async fn test_publisher_posts_envelope_with_bearer_token() {
    let mock_server = MockServer::start().await;
    let envelope = amended_event();

    Mock::given(method("POST"))
        .and(path("/events"))
        .and(header("authorization", "Bearer bus-token"))
        .and(body_partial_json(serde_json::json!({
            "id": envelope.id,
            "event_type": "contract.amended",
            "payload": { "budget_changes_processed": 2 }
        })))
        .respond_with(ResponseTemplate::new(202))
        .expect(1)
        .mount(&mock_server)
        .await;

    let publisher =
        HttpEventPublisher::new(mock_server.uri(), Some("bus-token".to_string())).unwrap();
    publisher.publish(&envelope).await.unwrap();
}

#[tokio::test]
async fn test_publisher_without_token_sends_no_auth_header() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/events"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&mock_server)
        .await;

    let publisher = HttpEventPublisher::new(format!("{}/", mock_server.uri()), None).unwrap();
    publisher.publish(&amended_event()).await.unwrap();

    let requests = mock_server.received_requests().await.unwrap();
    assert!(requests[0].headers.get("authorization").is_none());
}

#[tokio::test]
async fn test_publisher_surfaces_server_error_as_downstream_unavailable() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/events"))
        .respond_with(ResponseTemplate::new(500).set_body_string("bus down"))
        .mount(&mock_server)
        .await;

    let publisher = HttpEventPublisher::new(mock_server.uri(), None).unwrap();
    let result = publisher.publish(&amended_event()).await;

    assert!(matches!(result, Err(AppError::DownstreamUnavailable(_))));
}

#[tokio::test]
async fn test_publisher_stops_calling_bus_once_circuit_opens() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/events"))
        .respond_with(ResponseTemplate::new(503))
        .expect(5)
        .mount(&mock_server)
        .await;

    let publisher = HttpEventPublisher::new(mock_server.uri(), None).unwrap();
    for _ in 0..8 {
        let result = publisher.publish(&amended_event()).await;
        assert!(matches!(result, Err(AppError::DownstreamUnavailable(_))));
    }
}

#[tokio::test]
async fn test_publisher_reports_unprocessable_event_as_rejected() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/events"))
        .respond_with(ResponseTemplate::new(422).set_body_string("unknown event_type"))
        .mount(&mock_server)
        .await;

    let publisher = HttpEventPublisher::new(mock_server.uri(), None).unwrap();
    let result = publisher.publish(&amended_event()).await;

    assert!(matches!(result, Err(AppError::Rejected(msg)) if msg.contains("unknown event_type")));
}

#[tokio::test]
async fn test_rejected_events_do_not_open_circuit() {
    let mock_server = MockServer::start().await;

    // Every call must reach the bus: refusals say nothing about its health.
    Mock::given(method("POST"))
        .and(path("/events"))
        .respond_with(ResponseTemplate::new(400))
        .expect(8)
        .mount(&mock_server)
        .await;

    let publisher = HttpEventPublisher::new(mock_server.uri(), None).unwrap();
    for _ in 0..8 {
        let result = publisher.publish(&amended_event()).await;
        assert!(matches!(result, Err(AppError::Rejected(_))));
    }
}

#[tokio::test]
async fn test_rate_limited_publish_stays_retryable() {
    let mock_server = MockServer::start().await;

    Mock::given(method("POST"))
        .and(path("/events"))
        .respond_with(ResponseTemplate::new(429))
        .mount(&mock_server)
        .await;

    let publisher = HttpEventPublisher::new(mock_server.uri(), None).unwrap();
    let result = publisher.publish(&amended_event()).await;

    assert!(matches!(result, Err(AppError::DownstreamUnavailable(_))));
}

#[tokio::test]
async fn test_empty_country_config_rejected_before_database() {
    let publisher = Arc::new(RecordingPublisher::default());
    let service = offline_service(publisher.clone());

    let result = service
        .setup_global_payment_config(Uuid::new_v4(), &BTreeMap::new(), "tester")
        .await;

    assert!(matches!(result, Err(AppError::BadRequest(_))));
    assert!(publisher.published.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_split_payees_over_100_percent_rejected() {
    let publisher = Arc::new(RecordingPublisher::default());
    let service = offline_service(publisher.clone());

    let payee = |pct: &str| SplitPayee {
        payee_id: Uuid::new_v4().to_string(),
        percentage: bigdecimal::BigDecimal::from_str(pct).unwrap(),
        bank_details: None,
    };
    let setup = SitePaymentSetup {
        payment_type: PaymentType::VisitBased,
        split_payees: vec![payee("60"), payee("50")],
        local_currency: "EUR".to_string(),
        vat_handling: VatHandling::Exclusive,
        invoice_submission: InvoiceSubmission::Electronic,
    };
    let sites = BTreeMap::from([(Uuid::new_v4(), setup)]);

    let result = service
        .setup_site_payments(Uuid::new_v4(), &sites, "tester")
        .await;

    assert!(matches!(result, Err(AppError::BadRequest(_))));
    assert!(publisher.published.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_forecast_with_zero_horizon_rejected() {
    let service = offline_service(Arc::new(RecordingPublisher::default()));

    let scenario = ForecastScenario {
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
    };

    let result = service
        .generate_advanced_forecast(Uuid::new_v4(), &[scenario], 0, "tester")
        .await;
    assert!(matches!(result, Err(AppError::BadRequest(_))));
}

#[tokio::test]
async fn test_blank_amendment_title_rejected() {
    let service = offline_service(Arc::new(RecordingPublisher::default()));

    let amendment = AmendmentData {
        title: "   ".to_string(),
        description: None,
        study_id: Uuid::new_v4(),
        sponsor_org_id: None,
        site_org_id: None,
        cro_org_id: None,
    };

    let result = service
        .process_contract_amendment(Uuid::new_v4(), &amendment, &[], "tester")
        .await;
    assert!(matches!(result, Err(AppError::BadRequest(_))));
}

#[tokio::test]
async fn test_exchange_rate_with_same_currencies_rejected() {
    let service = offline_service(Arc::new(RecordingPublisher::default()));

    let result = service
        .upsert_exchange_rate(&ExchangeRateInput {
            base_currency: "USD".to_string(),
            target_currency: "USD".to_string(),
            rate: bigdecimal::BigDecimal::from(1),
        })
        .await;
    assert!(matches!(result, Err(AppError::BadRequest(_))));
}
