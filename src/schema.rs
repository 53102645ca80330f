//! Schema definitions handed to model schema-construction functions.

use std::fmt;

use crate::error::SchemaError;

/// Closed set of field types a schema can declare.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldType {
    String,
    Number,
    Boolean,
    Date,
    /// Document identifier, optionally referencing another model.
    ObjectId,
    /// Any BSON value.
    Mixed,
    Array(Box<FieldType>),
}

impl FieldType {
    pub fn array(of: FieldType) -> Self {
        FieldType::Array(Box::new(of))
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldType::String => f.write_str("String"),
            FieldType::Number => f.write_str("Number"),
            FieldType::Boolean => f.write_str("Boolean"),
            FieldType::Date => f.write_str("Date"),
            FieldType::ObjectId => f.write_str("ObjectId"),
            FieldType::Mixed => f.write_str("Mixed"),
            FieldType::Array(inner) => write!(f, "[{inner}]"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldSpec {
    pub kind: FieldType,
    pub required: bool,
    /// Model name an `ObjectId` field points at.
    pub reference: Option<String>,
}

impl FieldSpec {
    pub fn new(kind: FieldType) -> Self {
        Self {
            kind,
            required: false,
            reference: None,
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn reference(mut self, model: impl Into<String>) -> Self {
        self.reference = Some(model.into());
        self
    }
}

impl From<FieldType> for FieldSpec {
    fn from(kind: FieldType) -> Self {
        FieldSpec::new(kind)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchemaOptions {
    /// Collection name, defaults to the model name.
    pub collection: Option<String>,
}

impl SchemaOptions {
    pub fn collection(name: impl Into<String>) -> Self {
        Self {
            collection: Some(name.into()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schema {
    fields: Vec<(String, FieldSpec)>,
    options: SchemaOptions,
}

impl Schema {
    pub fn fields(&self) -> impl Iterator<Item = (&str, &FieldSpec)> {
        self.fields.iter().map(|(name, spec)| (name.as_str(), spec))
    }

    pub fn field(&self, name: &str) -> Option<&FieldSpec> {
        self.fields
            .iter()
            .find(|(field, _)| field == name)
            .map(|(_, spec)| spec)
    }

    pub fn options(&self) -> &SchemaOptions {
        &self.options
    }

    pub fn collection_name<'a>(&'a self, model_name: &'a str) -> &'a str {
        self.options.collection.as_deref().unwrap_or(model_name)
    }
}

/// Capability passed to every schema-construction function.
#[derive(Debug)]
pub struct SchemaBuilder {
    _priv: (),
}

impl SchemaBuilder {
    pub(crate) fn new() -> Self {
        Self { _priv: () }
    }

    /// Construct a schema from named fields. Field order is kept.
    pub fn schema<I, K, F>(&self, fields: I, options: SchemaOptions) -> Result<Schema, SchemaError>
    where
        I: IntoIterator<Item = (K, F)>,
        K: Into<String>,
        F: Into<FieldSpec>,
    {
        let mut collected: Vec<(String, FieldSpec)> = Vec::new();
        for (name, spec) in fields {
            let name = name.into();
            if name.is_empty() {
                return Err(SchemaError::Invalid("field name must not be empty".to_string()));
            }
            if collected.iter().any(|(existing, _)| *existing == name) {
                return Err(SchemaError::DuplicateField(name));
            }
            collected.push((name, spec.into()));
        }

        Ok(Schema {
            fields: collected,
            options,
        })
    }
}
