use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    Json, Router,
    extract::Path,
    routing::{get, post},
};
use mongodb::bson::Document;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing_subscriber::EnvFilter;

use mongo_registry::health::health_check;
use mongo_registry::{
    ConnectionEvent, FieldSpec, FieldType, ModelError, Models, MongoConfig, Registry, SchemaOptions,
};

async fn create_document(
    models: Models,
    Path(name): Path<String>,
    Json(fields): Json<Document>,
) -> Result<Json<Document>, ModelError> {
    let document = models.document(&name, fields)?;
    document.save().await?;
    Ok(Json(document.into_document()))
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", err);
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,mongo_registry=debug")),
        )
        .init();

    let config = MongoConfig::from_env().context("Invalid MongoDB configuration")?;

    let registry = Registry::builder(config)
        .schema("users", |s| {
            s.schema(
                [
                    ("name", FieldSpec::new(FieldType::String).required()),
                    ("pets", FieldSpec::new(FieldType::array(FieldType::ObjectId)).reference("pets")),
                ],
                SchemaOptions::collection("users"),
            )
        })
        .schema("pets", |s| {
            s.schema(
                [("type", FieldType::String), ("name", FieldType::String)],
                SchemaOptions::collection("pets"),
            )
        })
        .on(ConnectionEvent::Disconnected, |_| {
            tracing::warn!("MongoDB disconnected, waiting for the driver to reconnect");
            Ok(())
        })
        .connect()
        .context("Failed to set up model registry")?;
    let registry = Arc::new(registry);

    let app = Router::new()
        .route("/models/{name}", post(create_document))
        .layer(registry.layer())
        .route("/health", get(health_check))
        .with_state(Arc::clone(&registry))
        .layer(TraceLayer::new_for_http());

    let addr = std::env::var("BIND_ADDR").unwrap_or_else(|_| "127.0.0.1:3000".to_string());
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    tracing::info!("listening on {}", listener.local_addr()?);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    registry.close();
    Ok(())
}
