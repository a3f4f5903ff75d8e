//! DynamoDB-model attribute values.

use std::collections::BTreeMap;

/// One attribute value. Numbers keep their decimal text form.
#[derive(Debug, Clone, PartialEq)]
pub enum AttributeValue {
    S(String),
    N(String),
    Bool(bool),
    Null,
    M(BTreeMap<String, AttributeValue>),
    L(Vec<AttributeValue>),
}

/// Flat item: attribute name to value. The hash key is always `id`.
pub type Item = BTreeMap<String, AttributeValue>;

/// Name of the hash key attribute of every table.
pub const HASH_KEY: &str = "id";

impl AttributeValue {
    pub fn as_s(&self) -> Option<&str> {
        match self {
            Self::S(value) => Some(value),
            _ => None,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            Self::S(_) => "S",
            Self::N(_) => "N",
            Self::Bool(_) => "BOOL",
            Self::Null => "NULL",
            Self::M(_) => "M",
            Self::L(_) => "L",
        }
    }

    /// Billable size of the value in bytes.
    pub fn size(&self) -> usize {
        match self {
            Self::S(value) => value.len(),
            Self::N(value) => value.len().div_ceil(2) + 1,
            Self::Bool(_) | Self::Null => 1,
            Self::M(map) => {
                3 + map
                    .iter()
                    .map(|(name, value)| name.len() + value.size() + 1)
                    .sum::<usize>()
            }
            Self::L(values) => 3 + values.iter().map(|value| value.size() + 1).sum::<usize>(),
        }
    }
}

/// Billable size of an item: attribute names plus values.
pub fn item_size(item: &Item) -> usize {
    item.iter()
        .map(|(name, value)| name.len() + value.size())
        .sum()
}

/// Reads the hash key of `item`.
pub fn item_id(item: &Item) -> Option<&str> {
    item.get(HASH_KEY).and_then(AttributeValue::as_s)
}
