//! Error types for configuration, setup, connection events and per-request
//! model lookups.

use std::sync::Arc;

use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use thiserror::Error;

/// Malformed configuration input.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid connection string: {0}")]
    InvalidUri(#[source] mongodb::error::Error),

    #[error("invalid value for {key}: '{value}'")]
    InvalidValue { key: String, value: String },

    #[error("unknown connection event '{0}'")]
    UnknownEvent(String),
}

/// Failure raised by a schema-construction function.
#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("duplicate field '{0}'")]
    DuplicateField(String),

    #[error("{0}")]
    Invalid(String),
}

/// Failures coming from the underlying connection.
#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("mongodb error: {0}")]
    Driver(#[from] mongodb::error::Error),

    #[error("connection is closed")]
    Closed,

    #[error("no tokio runtime available to open the connection")]
    NoRuntime,

    #[error("{0}")]
    Failure(String),
}

/// Result of a connection event listener that could not handle the event.
#[derive(Debug, Error)]
pub enum ListenerError {
    /// Terminal failure, the connection must not be used any more.
    #[error("fatal connection error: {0}")]
    Fatal(#[source] Arc<ConnectionError>),

    #[error("{0}")]
    Custom(String),
}

/// Setup-time failures of [`crate::RegistryBuilder::connect`].
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("failed to build schema for model '{model}': {source}")]
    Schema {
        model: String,
        #[source]
        source: SchemaError,
    },

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Connection(#[from] ConnectionError),
}

/// Per-request model errors. Every variant renders as a 500.
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("Model name '{name}' not found in '{db}'")]
    NotFound { name: String, db: String },

    #[error("model registry layer is not installed on this route")]
    LayerMissing,

    #[error("model '{0}' has no database handle, the connection is not open")]
    NotConnected(String),

    #[error(transparent)]
    Connection(#[from] ConnectionError),
}

impl From<mongodb::error::Error> for ModelError {
    fn from(err: mongodb::error::Error) -> Self {
        ModelError::Connection(ConnectionError::Driver(err))
    }
}

impl ModelError {
    pub fn status(&self) -> StatusCode {
        StatusCode::INTERNAL_SERVER_ERROR
    }
}

impl IntoResponse for ModelError {
    fn into_response(self) -> Response {
        tracing::error!(error = %self, "model lookup failed");
        let body = Json(json!({
            "error": self.to_string(),
        }));
        (self.status(), body).into_response()
    }
}
