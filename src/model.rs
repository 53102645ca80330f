use std::fmt;
use std::sync::Arc;

use mongodb::{
    Collection,
    bson::{Bson, Document, oid::ObjectId},
};

use crate::connection::Connection;
use crate::error::ModelError;
use crate::schema::Schema;

/// A schema registered on the connection under a model name.
///
/// Cheap to clone; every clone shares the same schema and connection.
#[derive(Clone)]
pub struct Model {
    inner: Arc<ModelInner>,
}

struct ModelInner {
    name: String,
    schema: Schema,
    connection: Arc<dyn Connection>,
}

impl Model {
    pub(crate) fn new(name: String, schema: Schema, connection: Arc<dyn Connection>) -> Self {
        Self {
            inner: Arc::new(ModelInner {
                name,
                schema,
                connection,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn schema(&self) -> &Schema {
        &self.inner.schema
    }

    pub fn collection_name(&self) -> &str {
        self.inner.schema.collection_name(&self.inner.name)
    }

    /// Typed collection handle on the connection's database.
    pub fn collection(&self) -> Result<Collection<Document>, ModelError> {
        self.inner
            .connection
            .database()
            .map(|db| db.collection::<Document>(self.collection_name()))
            .ok_or_else(|| ModelError::NotConnected(self.name().to_string()))
    }

    /// New unsaved document of this model seeded with `fields`.
    ///
    /// An `_id` is generated unless `fields` already carries one.
    pub fn new_document(&self, mut fields: Document) -> ModelDocument {
        if !fields.contains_key("_id") {
            fields.insert("_id", ObjectId::new());
        }
        ModelDocument {
            model: self.clone(),
            fields,
        }
    }
}

impl fmt::Debug for Model {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Model")
            .field("name", &self.inner.name)
            .field("collection", &self.collection_name())
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone)]
pub struct ModelDocument {
    model: Model,
    fields: Document,
}

impl ModelDocument {
    pub fn model(&self) -> &Model {
        &self.model
    }

    pub fn id(&self) -> Option<ObjectId> {
        self.fields.get_object_id("_id").ok()
    }

    pub fn get(&self, key: &str) -> Option<&Bson> {
        self.fields.get(key)
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Bson>) {
        self.fields.insert(key, value);
    }

    pub fn fields(&self) -> &Document {
        &self.fields
    }

    pub fn into_document(self) -> Document {
        self.fields
    }

    /// Insert the document into the model's collection.
    pub async fn save(&self) -> Result<(), ModelError> {
        let collection = self.model.collection()?;
        collection.insert_one(&self.fields).await?;
        tracing::debug!(model = %self.model.name(), id = ?self.id(), "document saved");
        Ok(())
    }
}
