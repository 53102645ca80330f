//! Registry factory: resolves the configuration, opens the connection once
//! and builds the read-only model map shared by every request.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use mongodb::bson::Document;

use crate::config::{ConnectionTarget, MongoConfig};
use crate::connection::{
    Connection, ConnectionEvent, EventArgs, Listener, MongoConnection, ReadyState, listener,
};
use crate::error::{ConfigError, ConnectionError, ListenerError, ModelError, RegistryError, SchemaError};
use crate::layer::MongoLayer;
use crate::model::{Model, ModelDocument};
use crate::schema::{Schema, SchemaBuilder};

type SchemaFn = Box<dyn FnOnce(&SchemaBuilder) -> Result<Schema, SchemaError>>;

/// Collects model schemas and event listeners, then connects.
pub struct RegistryBuilder {
    config: MongoConfig,
    schemas: Vec<(String, SchemaFn)>,
    events: Vec<(ConnectionEvent, Listener)>,
}

impl RegistryBuilder {
    pub fn new(config: MongoConfig) -> Self {
        Self {
            config,
            schemas: Vec::new(),
            events: Vec::new(),
        }
    }

    /// Register a model. Registering a name twice replaces the earlier
    /// schema function.
    pub fn schema<F>(mut self, name: impl Into<String>, build: F) -> Self
    where
        F: FnOnce(&SchemaBuilder) -> Result<Schema, SchemaError> + 'static,
    {
        upsert(&mut self.schemas, name.into(), Box::new(build));
        self
    }

    /// Subscribe a listener to a connection event, one listener per event.
    pub fn on<F>(mut self, event: ConnectionEvent, handler: F) -> Self
    where
        F: Fn(&EventArgs) -> Result<(), ListenerError> + Send + Sync + 'static,
    {
        upsert(&mut self.events, event, listener(handler));
        self
    }

    /// Same as [`RegistryBuilder::on`] with the event given by name.
    pub fn on_named<F>(self, event: &str, handler: F) -> Result<Self, ConfigError>
    where
        F: Fn(&EventArgs) -> Result<(), ListenerError> + Send + Sync + 'static,
    {
        let event = event.parse::<ConnectionEvent>()?;
        Ok(self.on(event, handler))
    }

    /// Connect through the MongoDB driver. Must run inside a tokio runtime.
    pub fn connect(self) -> Result<Registry, RegistryError> {
        self.connect_with(Arc::new(MongoConnection::new()))
    }

    /// Build the registry on top of the given connection.
    ///
    /// The default error handler is subscribed before any caller listener.
    /// A failing schema function aborts setup before the connection opens.
    pub fn connect_with<C: Connection>(self, connection: Arc<C>) -> Result<Registry, RegistryError> {
        let connection: Arc<dyn Connection> = connection;
        let resolved = self.config.resolve()?;
        let database = resolved.target.database.clone();

        tracing::debug!(uri = %resolved.target, db = %database, "Creating model registry");

        if self.config.use_default_error_handler {
            connection.on(
                ConnectionEvent::Error,
                default_error_handler(Arc::downgrade(&connection)),
            );
        }

        let builder = SchemaBuilder::new();
        let mut models = HashMap::with_capacity(self.schemas.len());
        for (name, build) in self.schemas {
            let schema = build(&builder).map_err(|source| RegistryError::Schema {
                model: name.clone(),
                source,
            })?;
            tracing::debug!(model = %name, collection = %schema.collection_name(&name), "Registered model");
            models.insert(name.clone(), Model::new(name, schema, Arc::clone(&connection)));
        }

        for (event, handler) in self.events {
            connection.on(event, handler);
        }

        connection.open(&resolved.target, &resolved.options)?;

        Ok(Registry {
            models: Models {
                inner: Arc::new(ModelsInner { models, database }),
            },
            connection,
            target: resolved.target,
            closed: AtomicBool::new(false),
        })
    }
}

fn upsert<K: PartialEq, V>(entries: &mut Vec<(K, V)>, key: K, value: V) {
    match entries.iter_mut().find(|(existing, _)| *existing == key) {
        Some(entry) => entry.1 = value,
        None => entries.push((key, value)),
    }
}

/// Close the connection, log, then fail with the original cause.
fn default_error_handler(connection: std::sync::Weak<dyn Connection>) -> Listener {
    listener(move |args| {
        if let Some(connection) = connection.upgrade() {
            connection.close();
        }
        tracing::error!("An error occurred with the MongoDB connection");

        let cause = args
            .error
            .clone()
            .unwrap_or_else(|| Arc::new(ConnectionError::Failure("unknown connection error".to_string())));
        Err(ListenerError::Fatal(cause))
    })
}

/// The connection and its models, with an explicit lifecycle.
pub struct Registry {
    models: Models,
    connection: Arc<dyn Connection>,
    target: ConnectionTarget,
    closed: AtomicBool,
}

impl Registry {
    pub fn builder(config: MongoConfig) -> RegistryBuilder {
        RegistryBuilder::new(config)
    }

    pub fn models(&self) -> Models {
        self.models.clone()
    }

    /// Tower layer attaching [`Models`] to every request.
    pub fn layer(&self) -> MongoLayer {
        MongoLayer::new(self.models())
    }

    pub fn target(&self) -> &ConnectionTarget {
        &self.target
    }

    pub fn database_name(&self) -> &str {
        self.models.database()
    }

    pub fn ready_state(&self) -> ReadyState {
        self.connection.ready_state()
    }

    /// Close the connection. Later calls do nothing.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            tracing::info!(db = %self.database_name(), "Closing model registry");
            self.connection.close();
        }
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("target", &self.target.redacted())
            .field("models", &self.models.names())
            .finish_non_exhaustive()
    }
}

/// Read-only view of the registered models, shared across requests.
#[derive(Clone)]
pub struct Models {
    inner: Arc<ModelsInner>,
}

struct ModelsInner {
    models: HashMap<String, Model>,
    database: String,
}

impl Models {
    /// Look up a model by name.
    pub fn model(&self, name: &str) -> Result<Model, ModelError> {
        self.inner
            .models
            .get(name)
            .cloned()
            .ok_or_else(|| ModelError::NotFound {
                name: name.to_string(),
                db: self.inner.database.clone(),
            })
    }

    /// Construct a new document of the named model seeded with `fields`.
    pub fn document(&self, name: &str, fields: Document) -> Result<ModelDocument, ModelError> {
        Ok(self.model(name)?.new_document(fields))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.inner.models.contains_key(name)
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.inner.models.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.inner.models.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.models.is_empty()
    }

    /// Logical database name used in lookup errors.
    pub fn database(&self) -> &str {
        &self.inner.database
    }
}

impl fmt::Debug for Models {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Models")
            .field("database", &self.inner.database)
            .field("names", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::AtomicUsize;

    use mongodb::bson::{Bson, doc};

    use crate::config::DriverOptionsOverride;
    use crate::connection::MemoryConnection;
    use crate::schema::{FieldSpec, FieldType, SchemaOptions};

    fn users_schema(s: &SchemaBuilder) -> Result<Schema, SchemaError> {
        s.schema(
            [
                ("name", FieldSpec::new(FieldType::String)),
                ("pets", FieldSpec::new(FieldType::array(FieldType::ObjectId)).reference("pets")),
            ],
            SchemaOptions::collection("users"),
        )
    }

    fn pets_schema(s: &SchemaBuilder) -> Result<Schema, SchemaError> {
        s.schema(
            [("type", FieldType::String), ("name", FieldType::String)],
            SchemaOptions::collection("pets"),
        )
    }

    #[test]
    fn test_opens_default_target() {
        let conn = Arc::new(MemoryConnection::new());
        let registry = Registry::builder(MongoConfig::default())
            .connect_with(Arc::clone(&conn))
            .unwrap();

        let (target, options) = conn.opened_with().unwrap();
        assert_eq!(target.uri, "mongodb://localhost:27017/default");
        assert_eq!(options, crate::config::DriverOptions::default());
        assert_eq!(registry.database_name(), "default");
        assert_eq!(registry.ready_state(), ReadyState::Connected);
    }

    #[test]
    fn test_opens_with_merged_options() {
        let conn = Arc::new(MemoryConnection::new());
        let config = MongoConfig {
            mongo_options: DriverOptionsOverride {
                pool_size: Some(2),
                ..Default::default()
            },
            ..Default::default()
        };
        Registry::builder(config).connect_with(Arc::clone(&conn)).unwrap();

        let (_, options) = conn.opened_with().unwrap();
        assert_eq!(options.pool_size, 2);
        assert_eq!(options.connect_timeout_ms, 10_000);
    }

    #[test]
    fn test_loads_all_schemas_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let (users_calls, pets_calls) = (Arc::clone(&calls), Arc::clone(&calls));

        let registry = Registry::builder(MongoConfig::default())
            .schema("users", move |s| {
                users_calls.fetch_add(1, Ordering::SeqCst);
                users_schema(s)
            })
            .schema("pets", move |s| {
                pets_calls.fetch_add(1, Ordering::SeqCst);
                pets_schema(s)
            })
            .connect_with(Arc::new(MemoryConnection::new()))
            .unwrap();

        assert_eq!(calls.load(Ordering::SeqCst), 2);

        let models = registry.models();
        assert_eq!(models.len(), 2);
        assert_eq!(models.names(), ["pets", "users"]);

        let users = models.model("users").unwrap();
        assert_eq!(users.collection_name(), "users");
        let names: Vec<&str> = users.schema().fields().map(|(name, _)| name).collect();
        assert_eq!(names, ["name", "pets"]);
        assert_eq!(
            users.schema().field("pets").unwrap().kind,
            FieldType::array(FieldType::ObjectId)
        );
        assert_eq!(models.model("pets").unwrap().schema().fields().count(), 2);
    }

    #[test]
    fn test_duplicate_schema_name_replaces() {
        let registry = Registry::builder(MongoConfig::default())
            .schema("users", users_schema)
            .schema("users", pets_schema)
            .connect_with(Arc::new(MemoryConnection::new()))
            .unwrap();

        let models = registry.models();
        assert_eq!(models.len(), 1);
        assert_eq!(models.model("users").unwrap().collection_name(), "pets");
    }

    #[test]
    fn test_schema_failure_aborts_setup() {
        let conn = Arc::new(MemoryConnection::new());
        let err = Registry::builder(MongoConfig::default())
            .schema("users", users_schema)
            .schema("broken", |_| Err(SchemaError::Invalid("no fields".to_string())))
            .connect_with(Arc::clone(&conn))
            .unwrap_err();

        assert!(matches!(&err, RegistryError::Schema { model, .. } if model == "broken"));
        assert_eq!(err.to_string(), "failed to build schema for model 'broken': no fields");
        assert!(conn.opened_with().is_none());
    }

    #[test]
    fn test_invalid_uri_aborts_setup() {
        let conn = Arc::new(MemoryConnection::new());
        let config = MongoConfig {
            uri: Some("localhost:27017/shop".to_string()),
            ..Default::default()
        };
        let err = Registry::builder(config)
            .schema("users", users_schema)
            .connect_with(Arc::clone(&conn))
            .unwrap_err();

        assert!(matches!(err, RegistryError::Config(ConfigError::InvalidUri(_))));
        assert!(conn.opened_with().is_none());
        assert!(conn.subscriptions().is_empty());
    }

    #[test]
    fn test_encoded_database_name() {
        let config = MongoConfig {
            uri: Some("mongodb://localhost:27017/shop%2Deu".to_string()),
            ..Default::default()
        };
        let registry = Registry::builder(config)
            .connect_with(Arc::new(MemoryConnection::new()))
            .unwrap();

        assert_eq!(registry.database_name(), "shop-eu");
        let err = registry.models().model("users").unwrap_err();
        assert_eq!(err.to_string(), "Model name 'users' not found in 'shop-eu'");
    }

    #[test]
    fn test_loads_all_events() {
        let conn = Arc::new(MemoryConnection::new());
        Registry::builder(MongoConfig {
            use_default_error_handler: false,
            ..Default::default()
        })
        .on(ConnectionEvent::Error, |_| Ok(()))
        .on(ConnectionEvent::Connected, |_| Ok(()))
        .connect_with(Arc::clone(&conn))
        .unwrap();

        assert_eq!(
            conn.subscriptions(),
            [ConnectionEvent::Error, ConnectionEvent::Connected]
        );
    }

    #[test]
    fn test_on_named_rejects_unknown_event() {
        let result = Registry::builder(MongoConfig::default()).on_named("fullsetup", |_| Ok(()));
        assert!(matches!(result, Err(ConfigError::UnknownEvent(_))));

        let conn = Arc::new(MemoryConnection::new());
        Registry::builder(MongoConfig::default())
            .on_named("disconnected", |_| Ok(()))
            .unwrap()
            .connect_with(Arc::clone(&conn))
            .unwrap();
        assert_eq!(conn.listener_count(ConnectionEvent::Disconnected), 1);
    }

    #[test]
    fn test_default_error_handler() {
        let conn = Arc::new(MemoryConnection::new());
        let _registry = Registry::builder(MongoConfig::default())
            .connect_with(Arc::clone(&conn))
            .unwrap();

        assert_eq!(conn.subscriptions(), [ConnectionEvent::Error]);

        let err = conn
            .emit(
                ConnectionEvent::Error,
                Some(ConnectionError::Failure("Some connection error".to_string())),
            )
            .unwrap_err();

        assert_eq!(conn.close_count(), 1);
        match err {
            ListenerError::Fatal(cause) => assert_eq!(cause.to_string(), "Some connection error"),
            other => panic!("unexpected listener error: {other}"),
        }
    }

    #[test]
    fn test_default_error_handler_runs_before_custom() {
        let conn = Arc::new(MemoryConnection::new());
        let seen = Arc::new(Mutex::new(false));
        let flag = Arc::clone(&seen);

        let _registry = Registry::builder(MongoConfig::default())
            .on(ConnectionEvent::Error, move |_| {
                *flag.lock().unwrap() = true;
                Ok(())
            })
            .connect_with(Arc::clone(&conn))
            .unwrap();

        assert_eq!(conn.listener_count(ConnectionEvent::Error), 2);
        assert!(conn.emit(ConnectionEvent::Error, None).is_err());
        // the default handler is fatal, so the custom listener never runs
        assert!(!*seen.lock().unwrap());
        assert_eq!(conn.close_count(), 1);
    }

    #[test]
    fn test_missing_model() {
        let registry = Registry::builder(MongoConfig {
            db: "shop".to_string(),
            ..Default::default()
        })
        .connect_with(Arc::new(MemoryConnection::new()))
        .unwrap();

        let err = registry.models().model("missing").unwrap_err();
        assert_eq!(err.to_string(), "Model name 'missing' not found in 'shop'");

        let err = registry.models().document("missing", doc! {}).unwrap_err();
        assert!(matches!(err, ModelError::NotFound { name, .. } if name == "missing"));
    }

    #[test]
    fn test_document_seeds_fields() {
        let registry = Registry::builder(MongoConfig::default())
            .schema("users", users_schema)
            .connect_with(Arc::new(MemoryConnection::new()))
            .unwrap();

        let document = registry.models().document("users", doc! { "a": 1 }).unwrap();
        assert_eq!(document.get("a"), Some(&Bson::Int32(1)));
        assert_eq!(document.model().name(), "users");
    }

    #[test]
    fn test_close_once() {
        let conn = Arc::new(MemoryConnection::new());
        let registry = Registry::builder(MongoConfig::default())
            .connect_with(Arc::clone(&conn))
            .unwrap();

        registry.close();
        registry.close();
        assert_eq!(conn.close_count(), 1);
        assert_eq!(registry.ready_state(), ReadyState::Disconnected);
    }
}
