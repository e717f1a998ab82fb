//! Field typing for collections.
//!
//! Only the authority checks entries against a schema, once per pushed
//! batch. Replicas store whatever they are given.

use crate::{error::Result, ChangeEntry, CollectionName, Error, Op, Patch, SchemaVersion};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;

/// Value kinds a field can be declared with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    String,
    Int,
    Float,
    Bool,
    /// Milliseconds since the epoch
    Timestamp,
    /// Anything, including nested arrays and objects
    Json,
}

impl FieldType {
    pub fn name(self) -> &'static str {
        match self {
            FieldType::String => "String",
            FieldType::Int => "Int",
            FieldType::Float => "Float",
            FieldType::Bool => "Bool",
            FieldType::Timestamp => "Timestamp",
            FieldType::Json => "Json",
        }
    }

    /// Whether a non-null value fits this type. Integers are valid floats.
    pub fn admits(self, value: &Value) -> bool {
        match self {
            FieldType::String => value.is_string(),
            FieldType::Int | FieldType::Timestamp => value.is_i64() || value.is_u64(),
            FieldType::Float => value.is_number(),
            FieldType::Bool => value.is_boolean(),
            FieldType::Json => true,
        }
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

pub(crate) fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "Null",
        Value::Bool(_) => "Bool",
        Value::Number(n) if n.is_i64() || n.is_u64() => "Int",
        Value::Number(_) => "Float",
        Value::String(_) => "String",
        Value::Array(_) => "Array",
        Value::Object(_) => "Object",
    }
}

/// A declared field.
///
/// A required field must appear in every create and can never be set to
/// null afterwards. Updates may leave it out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldDef {
    pub name: String,
    pub field_type: FieldType,
    pub required: bool,
}

impl FieldDef {
    pub fn required(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            required: true,
        }
    }

    pub fn optional(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            required: false,
            ..Self::required(name, field_type)
        }
    }

    fn check(&self, op: Op, value: Option<&Value>) -> Result<()> {
        let missing = match value {
            None => op == Op::Create,
            Some(Value::Null) => true,
            Some(_) => false,
        };
        if missing {
            return if self.required {
                Err(Error::MissingRequiredField(self.name.clone()))
            } else {
                Ok(())
            };
        }

        match value {
            Some(v) if !self.field_type.admits(v) => Err(Error::TypeMismatch {
                field: self.name.clone(),
                expected: self.field_type.to_string(),
                got: json_type_name(v).to_string(),
            }),
            _ => Ok(()),
        }
    }
}

/// Declared fields of one collection. Undeclared fields pass unchecked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CollectionSchema {
    pub name: CollectionName,
    pub fields: Vec<FieldDef>,
}

impl CollectionSchema {
    pub fn new(name: impl Into<CollectionName>, fields: Vec<FieldDef>) -> Self {
        Self {
            name: name.into(),
            fields,
        }
    }

    /// Check the fields a create or update writes. Deletes carry no fields
    /// worth checking.
    pub fn validate_patch(&self, patch: &Patch, op: Op) -> Result<()> {
        if op == Op::Delete {
            return Ok(());
        }
        self.fields
            .iter()
            .try_for_each(|field| field.check(op, patch.get(&field.name)))
    }
}

/// Every collection the authority knows about.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Schema {
    pub version: SchemaVersion,
    /// When set, entries for unlisted collections are refused.
    #[serde(default)]
    pub strict: bool,
    pub collections: HashMap<CollectionName, CollectionSchema>,
}

impl Schema {
    /// An empty schema that lets unknown collections through.
    pub fn new(version: SchemaVersion) -> Self {
        Self {
            version,
            strict: false,
            collections: HashMap::new(),
        }
    }

    pub fn strict(self) -> Self {
        Self {
            strict: true,
            ..self
        }
    }

    pub fn with_collection(mut self, collection: CollectionSchema) -> Self {
        self.collections.insert(collection.name.clone(), collection);
        self
    }

    pub fn get_collection(&self, name: &str) -> Option<&CollectionSchema> {
        self.collections.get(name)
    }

    /// Structural checks on the entry, then the field rules of its
    /// collection.
    pub fn validate_entry(&self, entry: &ChangeEntry) -> Result<()> {
        entry.validate()?;

        match self.get_collection(&entry.collection) {
            Some(collection) => collection.validate_patch(&entry.patch, entry.op),
            None if self.strict => Err(Error::CollectionNotFound(entry.collection.clone())),
            None => Ok(()),
        }
    }

    /// The ticket tracker's collections.
    pub fn tickets() -> Self {
        use FieldType::{Json, String, Timestamp};

        Schema::new(1)
            .with_collection(CollectionSchema::new(
                "tickets",
                vec![
                    FieldDef::required("title", String),
                    FieldDef::optional("description", String),
                    FieldDef::optional("status", String),
                    FieldDef::optional("priority", String),
                    FieldDef::optional("assignee", String),
                    FieldDef::optional("createdBy", String),
                    FieldDef::optional("createdAt", Timestamp),
                    FieldDef::optional("tags", Json),
                ],
            ))
            .with_collection(CollectionSchema::new(
                "users",
                vec![
                    FieldDef::required("username", String),
                    FieldDef::optional("email", String),
                    FieldDef::optional("role", String),
                ],
            ))
            .with_collection(CollectionSchema::new(
                "messageLogs",
                vec![
                    FieldDef::required("ticketId", String),
                    FieldDef::required("message", String),
                    FieldDef::optional("author", String),
                    FieldDef::optional("timestamp", Timestamp),
                ],
            ))
    }
}
