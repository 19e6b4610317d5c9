use crate::circuit_breaker::{create_bus_circuit_breaker, BusCircuitBreaker};
use crate::errors::AppError;
use crate::events::EventEnvelope;
use async_trait::async_trait;
use failsafe::futures::CircuitBreaker;
use std::time::Duration;

/// Destination for committed domain events.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, envelope: &EventEnvelope) -> Result<(), AppError>;
}

/// Publishes events to the message bus over HTTP.
///
/// Each envelope is POSTed as JSON to `{base_url}/events`. Calls go through a circuit
/// breaker; while it is open, publishes fail with `DownstreamUnavailable` without
/// touching the network.
#[derive(Clone)]
pub struct HttpEventPublisher {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
    breaker: BusCircuitBreaker,
}

impl HttpEventPublisher {
    /// Creates a new `HttpEventPublisher`.
    ///
    /// # Arguments
    ///
    /// * `base_url` - The base URL of the message bus ingestion API.
    /// * `token` - Optional bearer token.
    pub fn new(base_url: String, token: Option<String>) -> Result<Self, AppError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| {
                AppError::InternalError(format!("Failed to create event bus client: {}", e))
            })?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
            breaker: create_bus_circuit_breaker(),
        })
    }

    async fn send(&self, envelope: &EventEnvelope) -> Result<(), AppError> {
        let url = format!("{}/events", self.base_url);

        let mut request = self
            .client
            .post(&url)
            .header("Content-Type", "application/json")
            .json(envelope);
        if let Some(ref token) = self.token {
            request = request.header("Authorization", format!("Bearer {}", token));
        }

        let response = request.send().await.map_err(|e| {
            AppError::DownstreamUnavailable(format!("Event bus request failed: {}", e))
        })?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            let message = format!("Event bus returned {}: {}", status, error_text);
            return Err(if is_permanent_rejection(status) {
                AppError::Rejected(message)
            } else {
                AppError::DownstreamUnavailable(message)
            });
        }

        Ok(())
    }
}

#[async_trait]
impl EventPublisher for HttpEventPublisher {
    async fn publish(&self, envelope: &EventEnvelope) -> Result<(), AppError> {
        tracing::debug!(
            "Publishing {} ({}) to event bus",
            envelope.event_type,
            envelope.id
        );

        // Rejected payloads do not count against the breaker.
        let counts_as_failure = |e: &AppError| !matches!(e, AppError::Rejected(_));

        match self.breaker.call_with(counts_as_failure, self.send(envelope)).await {
            Ok(()) => {
                tracing::info!("✓ Published {} ({})", envelope.event_type, envelope.id);
                Ok(())
            }
            Err(failsafe::Error::Inner(e)) => Err(e),
            Err(failsafe::Error::Rejected) => Err(AppError::DownstreamUnavailable(
                "Event bus circuit open, publish rejected".to_string(),
            )),
        }
    }
}

/// Whether the bus refused the event itself, as opposed to being unavailable.
///
/// 4xx responses are permanent except request timeout and rate limiting.
pub fn is_permanent_rejection(status: reqwest::StatusCode) -> bool {
    status.is_client_error()
        && status != reqwest::StatusCode::REQUEST_TIMEOUT
        && status != reqwest::StatusCode::TOO_MANY_REQUESTS
}

/// Publisher used when no bus is configured: events are written to the log only.
#[derive(Debug, Clone, Default)]
pub struct LogEventPublisher;

#[async_trait]
impl EventPublisher for LogEventPublisher {
    async fn publish(&self, envelope: &EventEnvelope) -> Result<(), AppError> {
        tracing::info!(
            event_id = %envelope.id,
            event_type = %envelope.event_type,
            payload = %envelope.payload,
            "Domain event"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::DomainEvent;
    use uuid::Uuid;

    #[tokio::test]
    async fn test_publisher_creation() {
        let publisher = HttpEventPublisher::new("https://bus.example.com/".to_string(), None);
        assert!(publisher.is_ok());
        assert_eq!(publisher.unwrap().base_url, "https://bus.example.com");
    }

    #[test]
    fn test_permanent_rejection_statuses() {
        use reqwest::StatusCode;

        assert!(is_permanent_rejection(StatusCode::BAD_REQUEST));
        assert!(is_permanent_rejection(StatusCode::UNPROCESSABLE_ENTITY));
        assert!(!is_permanent_rejection(StatusCode::REQUEST_TIMEOUT));
        assert!(!is_permanent_rejection(StatusCode::TOO_MANY_REQUESTS));
        assert!(!is_permanent_rejection(StatusCode::INTERNAL_SERVER_ERROR));
        assert!(!is_permanent_rejection(StatusCode::SERVICE_UNAVAILABLE));
    }

    #[tokio::test]
    async fn test_log_publisher_accepts_everything() {
        let envelope = EventEnvelope::new(&DomainEvent::SitePaymentsConfigured {
            study_id: Uuid::new_v4(),
            site_ids: vec![],
        })
        .unwrap();

        assert!(LogEventPublisher.publish(&envelope).await.is_ok());
    }
}
