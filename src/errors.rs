use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use std::fmt;

/// Application-specific error types.
#[derive(Debug)]
pub enum AppError {
    /// Database-related errors. Any of these raised inside a transaction rolls it back.
    DatabaseError(sqlx::Error),
    /// A required configuration, rate, or record does not exist.
    NotFound(String),
    /// Input failed validation.
    BadRequest(String),
    /// The write collided with a concurrent writer (e.g. duplicate contract version).
    Conflict(String),
    /// The message bus or another downstream dependency could not be reached.
    DownstreamUnavailable(String),
    /// A downstream dependency refused the request outright; retrying will not help.
    Rejected(String),
    /// Internal server error.
    InternalError(String),
    /// Error with context chain for better debugging.
    WithContext {
        /// The underlying source of the error.
        source: Box<AppError>,
        /// Additional context message.
        context: String,
    },
}

impl AppError {
    /// Returns the innermost error, skipping any context wrappers.
    pub fn root(&self) -> &AppError {
        match self {
            AppError::WithContext { source, .. } => source.root(),
            other => other,
        }
    }

    /// Stable machine-readable code sent alongside the message.
    pub fn code(&self) -> &'static str {
        match self.root() {
            AppError::DatabaseError(_) => "database_error",
            AppError::NotFound(_) => "not_found",
            AppError::BadRequest(_) => "validation_failed",
            AppError::Conflict(_) => "conflict",
            AppError::DownstreamUnavailable(_) => "downstream_unavailable",
            AppError::Rejected(_) => "rejected",
            AppError::InternalError(_) | AppError::WithContext { .. } => "internal_error",
        }
    }
}

impl fmt::Display for AppError {
    /// Formats the error for display.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::DatabaseError(e) => write!(f, "Database error: {}", e),
            AppError::NotFound(msg) => write!(f, "Not found: {}", msg),
            AppError::BadRequest(msg) => write!(f, "Bad request: {}", msg),
            AppError::Conflict(msg) => write!(f, "Conflict: {}", msg),
            AppError::DownstreamUnavailable(msg) => write!(f, "Downstream unavailable: {}", msg),
            AppError::Rejected(msg) => write!(f, "Rejected: {}", msg),
            AppError::InternalError(msg) => write!(f, "Internal error: {}", msg),
            AppError::WithContext { source, context } => {
                write!(f, "{}: {}", context, source)
            }
        }
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    /// Converts the error into an HTTP response.
    ///
    /// Maps each error variant to an appropriate HTTP status code and JSON body.
    /// Logs errors appropriately based on their severity.
    fn into_response(self) -> Response {
        let code = self.code();
        let (status, error_message) = match &self {
            AppError::DatabaseError(e) => {
                tracing::error!("Database error: {:?}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Database error".to_string(),
                )
            }
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, msg.clone()),
            AppError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg.clone()),
            AppError::Conflict(msg) => {
                tracing::warn!("Conflict: {}", msg);
                (StatusCode::CONFLICT, msg.clone())
            }
            AppError::DownstreamUnavailable(msg) => {
                tracing::error!("Downstream unavailable: {}", msg);
                (
                    StatusCode::BAD_GATEWAY,
                    "Downstream service unavailable".to_string(),
                )
            }
            AppError::Rejected(msg) => {
                tracing::warn!("Rejected downstream: {}", msg);
                (StatusCode::UNPROCESSABLE_ENTITY, msg.clone())
            }
            AppError::InternalError(msg) => {
                tracing::error!("Internal error: {}", msg);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Internal server error".to_string(),
                )
            }
            AppError::WithContext { source, context } => {
                tracing::error!("Error with context: {} -> {}", context, source);
                return source.clone().into_response();
            }
        };

        let body = Json(json!({
            "error": error_message,
            "code": code,
        }));

        (status, body).into_response()
    }
}

// Make AppError cloneable for WithContext variant
impl Clone for AppError {
    /// Clones the error.
    ///
    /// Note: `sqlx::Error` is not cloneable, so `DatabaseError` is simplified to `RowNotFound` during cloning.
    fn clone(&self) -> Self {
        match self {
            AppError::DatabaseError(_e) => AppError::DatabaseError(sqlx::Error::RowNotFound),
            AppError::NotFound(msg) => AppError::NotFound(msg.clone()),
            AppError::BadRequest(msg) => AppError::BadRequest(msg.clone()),
            AppError::Conflict(msg) => AppError::Conflict(msg.clone()),
            AppError::DownstreamUnavailable(msg) => AppError::DownstreamUnavailable(msg.clone()),
            AppError::Rejected(msg) => AppError::Rejected(msg.clone()),
            AppError::InternalError(msg) => AppError::InternalError(msg.clone()),
            AppError::WithContext { source, context } => AppError::WithContext {
                source: source.clone(),
                context: context.clone(),
            },
        }
    }
}

impl From<sqlx::Error> for AppError {
    /// Converts a `sqlx::Error` into an `AppError`.
    ///
    /// Unique-constraint violations (SQLSTATE 23505) become `Conflict`.
    fn from(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db_err) = &err {
            if db_err.code().as_deref() == Some("23505") {
                return AppError::Conflict(db_err.message().to_string());
            }
        }
        AppError::DatabaseError(err)
    }
}

impl From<reqwest::Error> for AppError {
    /// Converts a `reqwest::Error` into an `AppError`.
    fn from(err: reqwest::Error) -> Self {
        AppError::DownstreamUnavailable(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::InternalError(format!("JSON serialization failed: {}", err))
    }
}

/// Extension trait for adding context to errors.
/// Similar to `anyhow::Context` but for our `AppError` type.
pub trait ResultExt<T> {
    /// Add context to an error.
    fn context(self, context: impl Into<String>) -> Result<T, AppError>;

    /// Add context lazily (only evaluated on error).
    fn with_context<F>(self, f: F) -> Result<T, AppError>
    where
        F: FnOnce() -> String;
}

impl<T> ResultExt<T> for Result<T, AppError> {
    fn context(self, context: impl Into<String>) -> Result<T, AppError> {
        self.map_err(|e| AppError::WithContext {
            source: Box::new(e),
            context: context.into(),
        })
    }

    fn with_context<F>(self, f: F) -> Result<T, AppError>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| AppError::WithContext {
            source: Box::new(e),
            context: f(),
        })
    }
}

/// Extension for sqlx::Error to add context
impl<T> ResultExt<T> for Result<T, sqlx::Error> {
    fn context(self, context: impl Into<String>) -> Result<T, AppError> {
        self.map_err(|e| AppError::WithContext {
            source: Box::new(AppError::from(e)),
            context: context.into(),
        })
    }

    fn with_context<F>(self, f: F) -> Result<T, AppError>
    where
        F: FnOnce() -> String,
    {
        self.map_err(|e| AppError::WithContext {
            source: Box::new(AppError::from(e)),
            context: f(),
        })
    }
}
