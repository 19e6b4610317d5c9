//! CTMS Payments API Library
//!
//! Site payment configuration, EDC-driven payment calculation, enrollment and cost
//! forecasting, contract amendments, and portfolio analytics for clinical trials.
//!
//! # Modules
//!
//! - `api`: API definitions.
//! - `core`: Core business logic.
//! - `data`: Data access layer.
//! - `integrations`: External service integrations.
//! - `obs`: Observability and logging.
//! - `analytics`: Analytics category sources and bundle assembly.
//! - `cache_validator`: Checksummed analytics snapshots.
//! - `circuit_breaker`: Circuit breaker for the message bus.
//! - `config`: Configuration management.
//! - `currency`: Money rounding and currency conversion.
//! - `db`: Database connection and pool management.
//! - `db_storage`: Database storage operations.
//! - `errors`: Error handling types.
//! - `event_bus`: Domain event publishers.
//! - `events`: Domain events and the outbox envelope.
//! - `forecast`: Enrollment and cost simulation.
//! - `handlers`: HTTP request handlers.
//! - `models`: Core data models.
//! - `payment_calculator`: Visit and procedure payment amounts.
//! - `payment_triggers`: Site setup validation and trigger derivation.
//! - `services`: Payment service orchestrating the operations above.

pub mod api;
pub mod core;
pub mod data;
pub mod integrations;
pub mod obs;

// Re-export primary modules for shared use in tests and other binaries
pub mod analytics;
pub mod cache_validator;
pub mod circuit_breaker;
pub mod config;
pub mod currency;
pub mod db;
pub mod db_storage;
pub mod errors;
pub mod event_bus;
pub mod events;
pub mod forecast;
pub mod handlers;
pub mod models;
pub mod payment_calculator;
pub mod payment_triggers;
pub mod services;
