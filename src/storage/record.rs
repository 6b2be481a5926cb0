//! Row shaping.
//!
//! A canonical record is split into its id, the values of the indexed
//! properties (keyed by column) and the remaining payload. Merging reverses the
//! split. Both backends go through here so a record missing a mandatory indexed
//! property is rejected identically everywhere.

use super::schema::{ColumnType, EntitySchema};
use crate::{Error, Result};
use serde_json::{Map, Value};

/// A record split into storage parts.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    /// Primary key.
    pub id: String,
    /// Indexed property values keyed by column name. Absent optional values are `Null`.
    pub columns: Map<String, Value>,
    /// Everything that is neither the id nor an indexed property.
    pub data: Map<String, Value>,
}

/// Extracts the id of a record.
///
/// # Errors
///
/// Returns `Error::Validation` if the record is not an object or has no
/// non-empty string `id`.
pub fn record_id(record: &Value) -> Result<&str> {
    record
        .as_object()
        .ok_or_else(|| Error::Validation("record must be a JSON object".to_string()))?
        .get("id")
        .and_then(Value::as_str)
        .filter(|id| !id.is_empty())
        .ok_or_else(|| Error::Validation("record has no string id".to_string()))
}

/// Splits a record into a [`Row`].
///
/// # Errors
///
/// Returns `Error::Validation` if the id is missing, a mandatory indexed
/// property is absent or null, or an indexed value has the wrong JSON type.
pub fn split(schema: &EntitySchema, record: &Value) -> Result<Row> {
    let id = record_id(record)?.to_string();
    let mut data = record.as_object().cloned().unwrap_or_default();
    data.remove("id");

    let mut columns = Map::new();
    for property in schema.properties {
        let value = data.remove(property.field).unwrap_or(Value::Null);
        if value.is_null() {
            if !property.optional {
                return Err(Error::Validation(format!(
                    "{} record '{id}' is missing mandatory property '{}'",
                    schema.table, property.field
                )));
            }
            columns.insert(property.column.to_string(), Value::Null);
            continue;
        }

        let type_ok = match property.column_type {
            ColumnType::Text => value.is_string(),
            ColumnType::BigInt => value.is_i64(),
        };
        if !type_ok {
            return Err(Error::Validation(format!(
                "{} record '{id}': property '{}' must be {}",
                schema.table,
                property.field,
                property.column_type.sql_type()
            )));
        }
        columns.insert(property.column.to_string(), value);
    }

    Ok(Row { id, columns, data })
}

/// Reassembles a record from a [`Row`].
///
/// Column values take precedence over payload keys of the same name; null
/// columns leave the field absent.
#[must_use]
pub fn merge(schema: &EntitySchema, row: Row) -> Value {
    let Row {
        id,
        mut columns,
        mut data,
    } = row;

    for property in schema.properties {
        match columns.remove(property.column) {
            Some(Value::Null) | None => {
                data.remove(property.field);
            },
            Some(value) => {
                data.insert(property.field.to_string(), value);
            },
        }
    }
    data.insert("id".to_string(), Value::String(id));
    Value::Object(data)
}

impl Row {
    /// Returns the `_index.json` entry for this row: the id plus every
    /// present indexed property under its record field name.
    #[must_use]
    pub fn index_entry(&self, schema: &EntitySchema) -> Value {
        let mut entry = Map::new();
        entry.insert("id".to_string(), Value::String(self.id.clone()));
        for property in schema.properties {
            if let Some(value) = self.columns.get(property.column).filter(|v| !v.is_null()) {
                entry.insert(property.field.to_string(), value.clone());
            }
        }
        Value::Object(entry)
    }
}
