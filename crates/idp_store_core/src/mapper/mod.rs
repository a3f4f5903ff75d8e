//! Bidirectional mapping between entities and key-value items.
//!
//! # Responsibility
//! - Turn an entity into a flat [`Item`] and back, losslessly.
//! - Reject malformed items with errors naming table, id and attribute.
//!
//! # Invariants
//! - `None` fields are omitted and read back as `None`.
//! - JSON `null` inside payloads is stored as an explicit NULL attribute.
//! - Payloads are nested map/list attributes, never serialized JSON text.
//! - Enums are stored by their canonical name, timestamps as RFC 3339 with
//!   microseconds.
//! - Shadow attributes (`enabledKey`, `isActiveKey`, ...) exist only for
//!   index keys and are ignored on read.

mod entities;

use crate::error::StoreError;
use crate::kv::{AttributeValue, Item};
use crate::model::{format_timestamp, parse_timestamp, Entity, EntityId, Payload};
use chrono::{DateTime, Utc};
use serde_json::{Number, Value};
use std::collections::BTreeMap;
use thiserror::Error;
use uuid::Uuid;

pub use entities::attributes;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MappingError {
    #[error("{table}/{id}: missing attribute `{attribute}`")]
    Missing {
        table: &'static str,
        id: String,
        attribute: &'static str,
    },

    #[error("{table}/{id}: invalid attribute `{attribute}`: {detail}")]
    Invalid {
        table: &'static str,
        id: String,
        attribute: &'static str,
        detail: String,
    },
}

impl From<MappingError> for StoreError {
    fn from(err: MappingError) -> Self {
        StoreError::Validation(err.to_string())
    }
}

pub type MappingResult<T> = Result<T, MappingError>;

/// Entity that can be stored as one key-value item.
pub trait ItemMapper: Entity + Sized {
    /// Base table name, before the configured prefix.
    const TABLE: &'static str;

    fn to_item(&self) -> Item;

    fn from_item(item: &Item) -> MappingResult<Self>;
}

/// Accumulates attributes of one item.
pub(crate) struct ItemWriter {
    item: Item,
}

impl ItemWriter {
    pub(crate) fn new(id: Option<EntityId>) -> Self {
        let mut item = Item::new();
        if let Some(id) = id {
            item.insert(attributes::ID.to_string(), AttributeValue::S(id.to_string()));
        }
        Self { item }
    }

    fn put(mut self, name: &str, value: AttributeValue) -> Self {
        self.item.insert(name.to_string(), value);
        self
    }

    pub(crate) fn string(self, name: &str, value: &str) -> Self {
        self.put(name, AttributeValue::S(value.to_string()))
    }

    pub(crate) fn opt_string(self, name: &str, value: Option<&str>) -> Self {
        match value {
            Some(value) => self.string(name, value),
            None => self,
        }
    }

    pub(crate) fn id(self, name: &str, value: EntityId) -> Self {
        self.put(name, AttributeValue::S(value.to_string()))
    }

    pub(crate) fn opt_id(self, name: &str, value: Option<EntityId>) -> Self {
        match value {
            Some(value) => self.id(name, value),
            None => self,
        }
    }

    /// Writes `value` plus its string shadow used as an index key.
    pub(crate) fn indexed_bool(self, name: &str, shadow: &str, value: bool) -> Self {
        self.put(name, AttributeValue::Bool(value))
            .put(shadow, AttributeValue::S(value.to_string()))
    }

    pub(crate) fn boolean(self, name: &str, value: bool) -> Self {
        self.put(name, AttributeValue::Bool(value))
    }

    pub(crate) fn opt_number(self, name: &str, value: Option<i32>) -> Self {
        match value {
            Some(value) => self.put(name, AttributeValue::N(value.to_string())),
            None => self,
        }
    }

    pub(crate) fn opt_timestamp(self, name: &str, value: Option<&DateTime<Utc>>) -> Self {
        match value {
            Some(value) => self.put(name, AttributeValue::S(format_timestamp(value))),
            None => self,
        }
    }

    pub(crate) fn opt_json(self, name: &str, value: Option<&Value>) -> Self {
        match value {
            Some(value) => self.put(name, json_to_attribute(value)),
            None => self,
        }
    }

    pub(crate) fn opt_payload(self, name: &str, value: Option<&Payload>) -> Self {
        match value {
            Some(map) => self.put(name, payload_to_attribute(map)),
            None => self,
        }
    }

    pub(crate) fn id_list<'a>(self, name: &str, ids: impl IntoIterator<Item = &'a EntityId>) -> Self {
        let values = ids
            .into_iter()
            .map(|id| AttributeValue::S(id.to_string()))
            .collect();
        self.put(name, AttributeValue::L(values))
    }

    /// Adds `createdAt`/`updatedAt` and returns the finished item.
    pub(crate) fn finish<E: Entity>(self, entity: &E) -> Item {
        self.opt_timestamp(attributes::CREATED_AT, entity.created_at().as_ref())
            .opt_timestamp(attributes::UPDATED_AT, entity.updated_at().as_ref())
            .item
    }
}

/// Typed attribute accessors over one stored item.
pub(crate) struct ItemReader<'item> {
    item: &'item Item,
    table: &'static str,
    id_text: String,
}

impl<'item> ItemReader<'item> {
    pub(crate) fn new(item: &'item Item, table: &'static str) -> Self {
        let id_text = item
            .get(attributes::ID)
            .and_then(AttributeValue::as_s)
            .unwrap_or("<unknown>")
            .to_string();
        Self {
            item,
            table,
            id_text,
        }
    }

    fn missing(&self, attribute: &'static str) -> MappingError {
        MappingError::Missing {
            table: self.table,
            id: self.id_text.clone(),
            attribute,
        }
    }

    fn invalid(&self, attribute: &'static str, detail: impl Into<String>) -> MappingError {
        MappingError::Invalid {
            table: self.table,
            id: self.id_text.clone(),
            attribute,
            detail: detail.into(),
        }
    }

    fn opt_s(&self, attribute: &'static str) -> MappingResult<Option<&'item str>> {
        match self.item.get(attribute) {
            None => Ok(None),
            Some(AttributeValue::S(value)) => Ok(Some(value)),
            Some(other) => Err(self.invalid(
                attribute,
                format!("expected S, got {}", other.type_name()),
            )),
        }
    }

    fn s(&self, attribute: &'static str) -> MappingResult<&'item str> {
        self.opt_s(attribute)?.ok_or_else(|| self.missing(attribute))
    }

    fn parse_uuid(&self, attribute: &'static str, text: &str) -> MappingResult<EntityId> {
        Uuid::parse_str(text).map_err(|_| self.invalid(attribute, format!("`{text}` is not a uuid")))
    }

    pub(crate) fn id(&self) -> MappingResult<EntityId> {
        let text = self.s(attributes::ID)?;
        self.parse_uuid(attributes::ID, text)
    }

    pub(crate) fn uuid(&self, attribute: &'static str) -> MappingResult<EntityId> {
        let text = self.s(attribute)?;
        self.parse_uuid(attribute, text)
    }

    pub(crate) fn opt_uuid(&self, attribute: &'static str) -> MappingResult<Option<EntityId>> {
        self.opt_s(attribute)?
            .map(|text| self.parse_uuid(attribute, text))
            .transpose()
    }

    pub(crate) fn string(&self, attribute: &'static str) -> MappingResult<String> {
        self.s(attribute).map(str::to_string)
    }

    pub(crate) fn opt_string(&self, attribute: &'static str) -> MappingResult<Option<String>> {
        Ok(self.opt_s(attribute)?.map(str::to_string))
    }

    pub(crate) fn boolean(&self, attribute: &'static str) -> MappingResult<bool> {
        match self.item.get(attribute) {
            Some(AttributeValue::Bool(value)) => Ok(*value),
            Some(other) => Err(self.invalid(
                attribute,
                format!("expected BOOL, got {}", other.type_name()),
            )),
            None => Err(self.missing(attribute)),
        }
    }

    pub(crate) fn opt_i32(&self, attribute: &'static str) -> MappingResult<Option<i32>> {
        match self.item.get(attribute) {
            None => Ok(None),
            Some(AttributeValue::N(text)) => text
                .parse::<i32>()
                .map(Some)
                .map_err(|_| self.invalid(attribute, format!("`{text}` is not a 32-bit integer"))),
            Some(other) => Err(self.invalid(
                attribute,
                format!("expected N, got {}", other.type_name()),
            )),
        }
    }

    pub(crate) fn timestamp(&self, attribute: &'static str) -> MappingResult<DateTime<Utc>> {
        self.opt_timestamp(attribute)?
            .ok_or_else(|| self.missing(attribute))
    }

    pub(crate) fn opt_timestamp(
        &self,
        attribute: &'static str,
    ) -> MappingResult<Option<DateTime<Utc>>> {
        self.opt_s(attribute)?
            .map(|text| {
                parse_timestamp(text).ok_or_else(|| {
                    self.invalid(attribute, format!("`{text}` is not an RFC 3339 timestamp"))
                })
            })
            .transpose()
    }

    pub(crate) fn stored_enum<T>(
        &self,
        attribute: &'static str,
        parse: fn(&str) -> Option<T>,
    ) -> MappingResult<T> {
        self.opt_stored_enum(attribute, parse)?
            .ok_or_else(|| self.missing(attribute))
    }

    pub(crate) fn opt_stored_enum<T>(
        &self,
        attribute: &'static str,
        parse: fn(&str) -> Option<T>,
    ) -> MappingResult<Option<T>> {
        self.opt_s(attribute)?
            .map(|text| {
                parse(text).ok_or_else(|| self.invalid(attribute, format!("unknown value `{text}`")))
            })
            .transpose()
    }

    pub(crate) fn opt_json(&self, attribute: &'static str) -> MappingResult<Option<Value>> {
        self.item
            .get(attribute)
            .map(|value| attribute_to_json(value).map_err(|detail| self.invalid(attribute, detail)))
            .transpose()
    }

    pub(crate) fn opt_payload(&self, attribute: &'static str) -> MappingResult<Option<Payload>> {
        match self.opt_json(attribute)? {
            Some(Value::Object(map)) => Ok(Some(map)),
            Some(other) => Err(self.invalid(attribute, format!("expected a map, got {other}"))),
            None => Ok(None),
        }
    }

    /// List of identifiers; an absent attribute reads as empty.
    pub(crate) fn id_list(&self, attribute: &'static str) -> MappingResult<Vec<EntityId>> {
        match self.item.get(attribute) {
            None => Ok(Vec::new()),
            Some(AttributeValue::L(values)) => values
                .iter()
                .map(|value| match value {
                    AttributeValue::S(text) => self.parse_uuid(attribute, text),
                    other => Err(self.invalid(
                        attribute,
                        format!("expected list of S, found {}", other.type_name()),
                    )),
                })
                .collect(),
            Some(other) => Err(self.invalid(
                attribute,
                format!("expected L, got {}", other.type_name()),
            )),
        }
    }

    /// Stored `createdAt`/`updatedAt`, both required on read.
    pub(crate) fn audit(&self) -> MappingResult<(DateTime<Utc>, DateTime<Utc>)> {
        Ok((
            self.timestamp(attributes::CREATED_AT)?,
            self.timestamp(attributes::UPDATED_AT)?,
        ))
    }
}

/// Nested attribute form of a JSON value.
pub fn json_to_attribute(value: &Value) -> AttributeValue {
    match value {
        Value::Null => AttributeValue::Null,
        Value::Bool(value) => AttributeValue::Bool(*value),
        Value::Number(number) => AttributeValue::N(number.to_string()),
        Value::String(text) => AttributeValue::S(text.clone()),
        Value::Array(values) => AttributeValue::L(values.iter().map(json_to_attribute).collect()),
        Value::Object(map) => payload_to_attribute(map),
    }
}

fn payload_to_attribute(map: &Payload) -> AttributeValue {
    AttributeValue::M(
        map.iter()
            .map(|(key, value)| (key.clone(), json_to_attribute(value)))
            .collect::<BTreeMap<_, _>>(),
    )
}

/// JSON form of a nested attribute value.
pub fn attribute_to_json(value: &AttributeValue) -> Result<Value, String> {
    Ok(match value {
        AttributeValue::Null => Value::Null,
        AttributeValue::Bool(value) => Value::Bool(*value),
        AttributeValue::N(text) => Value::Number(
            text.parse::<Number>()
                .map_err(|_| format!("`{text}` is not a number"))?,
        ),
        AttributeValue::S(text) => Value::String(text.clone()),
        AttributeValue::L(values) => Value::Array(
            values
                .iter()
                .map(attribute_to_json)
                .collect::<Result<_, _>>()?,
        ),
        AttributeValue::M(map) => Value::Object(
            map.iter()
                .map(|(key, value)| attribute_to_json(value).map(|value| (key.clone(), value)))
                .collect::<Result<_, _>>()?,
        ),
    })
}

#[cfg(test)]
mod tests {
    use super::{attribute_to_json, json_to_attribute, ItemReader, MappingError};
    use crate::kv::{AttributeValue, Item};
    use serde_json::json;

    #[test]
    fn nested_json_keeps_nulls_and_numbers() {
        let value = json!({"a": null, "b": [1, 2.5, {"c": null}], "d": "x", "e": true});
        let attribute = json_to_attribute(&value);
        let AttributeValue::M(map) = &attribute else {
            panic!("object should map to M");
        };
        assert_eq!(map["a"], AttributeValue::Null);
        assert_eq!(attribute_to_json(&attribute).expect("decode"), value);
    }

    #[test]
    fn reader_errors_name_table_id_and_attribute() {
        let mut item = Item::new();
        item.insert("id".to_string(), AttributeValue::S("abc".to_string()));
        item.insert("enabled".to_string(), AttributeValue::S("yes".to_string()));
        let reader = ItemReader::new(&item, "cloud_providers");

        let err = reader.boolean("enabled").expect_err("S is not BOOL");
        assert!(matches!(err, MappingError::Invalid { attribute: "enabled", .. }));
        let message = err.to_string();
        assert!(message.contains("cloud_providers/abc"));

        assert!(matches!(
            reader.string("name"),
            Err(MappingError::Missing { attribute: "name", .. })
        ));
        assert!(reader.id().is_err());
    }

    #[test]
    fn malformed_number_is_invalid() {
        assert!(attribute_to_json(&AttributeValue::N("1e".to_string())).is_err());
    }
}
