//! Attach a MongoDB connection and a set of named models to an axum
//! request pipeline.
//!
//! [`RegistryBuilder`] resolves the connection target, registers model
//! schemas and connection listeners, and opens the connection once.
//! [`Registry::layer`] returns a tower layer that hands every request a
//! [`Models`] view for `model(name)` and `document(name, fields)` lookups.

pub mod config;
pub mod connection;
pub mod error;
pub mod health;
pub mod layer;
pub mod model;
pub mod registry;
pub mod schema;

pub use config::{ConnectionTarget, DriverOptions, DriverOptionsOverride, MongoConfig};
pub use connection::{
    Connection, ConnectionEvent, EventArgs, Listener, MemoryConnection, MongoConnection, ReadyState,
    listener,
};
pub use error::{ConfigError, ConnectionError, ListenerError, ModelError, RegistryError, SchemaError};
pub use layer::{MongoLayer, MongoService};
pub use model::{Model, ModelDocument};
pub use registry::{Models, Registry, RegistryBuilder};
pub use schema::{FieldSpec, FieldType, Schema, SchemaBuilder, SchemaOptions};
