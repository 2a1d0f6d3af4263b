use crate::proto::google::spanner::v1 as proto;
use crate::Value;
use prost_types::ListValue;

/// A primary key (or index key): one value per key column.
#[derive(Debug, Clone, PartialEq)]
pub struct Key(Vec<Value>);

impl Key {
    pub fn new(values: Vec<Value>) -> Self {
        Self(values)
    }
}

impl From<Value> for Key {
    fn from(v: Value) -> Self {
        Key(vec![v])
    }
}

impl From<(Value, Value)> for Key {
    fn from((a, b): (Value, Value)) -> Self {
        Key(vec![a, b])
    }
}

impl From<Key> for ListValue {
    fn from(key: Key) -> Self {
        key.0.into_iter().collect()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum KeyBound {
    Closed(Key),
    Open(Key),
}

#[derive(Debug, Clone, PartialEq)]
pub struct KeyRange {
    pub start: KeyBound,
    pub end: KeyBound,
}

impl From<KeyRange> for proto::KeyRange {
    fn from(range: KeyRange) -> Self {
        use proto::key_range::{EndKeyType, StartKeyType};
        proto::KeyRange {
            start_key_type: Some(match range.start {
                KeyBound::Closed(key) => StartKeyType::StartClosed(key.into()),
                KeyBound::Open(key) => StartKeyType::StartOpen(key.into()),
            }),
            end_key_type: Some(match range.end {
                KeyBound::Closed(key) => EndKeyType::EndClosed(key.into()),
                KeyBound::Open(key) => EndKeyType::EndOpen(key.into()),
            }),
        }
    }
}

/// The rows of a table or index to read or delete.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct KeySet {
    keys: Vec<Key>,
    ranges: Vec<KeyRange>,
    all: bool,
}

impl KeySet {
    /// Every row of the table.
    pub fn all() -> Self {
        Self {
            all: true,
            ..Default::default()
        }
    }

    pub fn key(mut self, key: Key) -> Self {
        self.keys.push(key);
        self
    }

    pub fn range(mut self, range: KeyRange) -> Self {
        self.ranges.push(range);
        self
    }
}

impl From<Vec<Key>> for KeySet {
    fn from(keys: Vec<Key>) -> Self {
        Self {
            keys,
            ..Default::default()
        }
    }
}

impl From<KeySet> for proto::KeySet {
    fn from(key_set: KeySet) -> Self {
        proto::KeySet {
            keys: key_set.keys.into_iter().map(Into::into).collect(),
            ranges: key_set.ranges.into_iter().map(Into::into).collect(),
            all: key_set.all,
        }
    }
}
