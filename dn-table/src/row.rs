//! Row model for versioned sorted tables.
//!
//! Values are owned and cheaply cloneable (string payloads are `Bytes`).
//! A versioned row carries its key, versioned values sorted by
//! `(column id asc, timestamp desc)` and the write/delete timestamp lists
//! sorted descending.

use std::cmp::Ordering;
use std::fmt;

use bytes::Bytes;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

pub type Timestamp = u64;

pub const NULL_TIMESTAMP: Timestamp = 0;
pub const MIN_TIMESTAMP: Timestamp = 1;
pub const MAX_TIMESTAMP: Timestamp = u64::MAX - 1;
/// Read timestamp requesting every committed version.
pub const ALL_COMMITTED_TIMESTAMP: Timestamp = u64::MAX;

/// Flag bits carried by a versioned value.
pub mod value_flags {
    /// The value payload is hunk-encoded (see the `hunks` module).
    pub const HUNK: u8 = 0x01;
}

#[derive(Debug, Clone)]
pub enum Value {
    Null,
    Int64(i64),
    Uint64(u64),
    Double(f64),
    Boolean(bool),
    String(Bytes),
}

impl Value {
    fn type_rank(&self) -> u8 {
        match self {
            Value::Null => 0,
            Value::Int64(_) => 1,
            Value::Uint64(_) => 2,
            Value::Double(_) => 3,
            Value::Boolean(_) => 4,
            Value::String(_) => 5,
        }
    }

    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            Value::String(payload) => Some(payload),
            _ => None,
        }
    }

    /// Rough byte weight used for data-weight accounting.
    pub fn data_weight(&self) -> u64 {
        match self {
            Value::Null => 1,
            Value::Int64(_) | Value::Uint64(_) | Value::Double(_) => 8,
            Value::Boolean(_) => 1,
            Value::String(payload) => payload.len() as u64,
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Value {}

impl Ord for Value {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (Value::Null, Value::Null) => Ordering::Equal,
            (Value::Int64(a), Value::Int64(b)) => a.cmp(b),
            (Value::Uint64(a), Value::Uint64(b)) => a.cmp(b),
            (Value::Double(a), Value::Double(b)) => a.total_cmp(b),
            (Value::Boolean(a), Value::Boolean(b)) => a.cmp(b),
            (Value::String(a), Value::String(b)) => a.cmp(b),
            _ => self.type_rank().cmp(&other.type_rank()),
        }
    }
}

impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

// String payloads serialize as hex so values can live inside the JSON
// chunk meta document.
impl Serialize for Value {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        #[derive(Serialize)]
        #[serde(rename_all = "kebab-case")]
        enum Repr<'a> {
            Null,
            Int64(i64),
            Uint64(u64),
            Double(f64),
            Boolean(bool),
            String(&'a str),
        }
        let hex_payload;
        let repr = match self {
            Value::Null => Repr::Null,
            Value::Int64(v) => Repr::Int64(*v),
            Value::Uint64(v) => Repr::Uint64(*v),
            Value::Double(v) => Repr::Double(*v),
            Value::Boolean(v) => Repr::Boolean(*v),
            Value::String(payload) => {
                hex_payload = hex::encode(payload);
                Repr::String(&hex_payload)
            }
        };
        repr.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Value {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(rename_all = "kebab-case")]
        enum Repr {
            Null,
            Int64(i64),
            Uint64(u64),
            Double(f64),
            Boolean(bool),
            String(String),
        }
        Ok(match Repr::deserialize(deserializer)? {
            Repr::Null => Value::Null,
            Repr::Int64(v) => Value::Int64(v),
            Repr::Uint64(v) => Value::Uint64(v),
            Repr::Double(v) => Value::Double(v),
            Repr::Boolean(v) => Value::Boolean(v),
            Repr::String(payload) => {
                let raw = hex::decode(&payload).map_err(D::Error::custom)?;
                Value::String(Bytes::from(raw))
            }
        })
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Value::Null => write!(f, "#"),
            Value::Int64(v) => write!(f, "{v}"),
            Value::Uint64(v) => write!(f, "{v}u"),
            Value::Double(v) => write!(f, "{v}"),
            Value::Boolean(v) => write!(f, "{v}"),
            Value::String(payload) => write!(f, "0x{}", hex::encode(payload)),
        }
    }
}

/// A row key: one value per key column, compared lexicographically.
pub type Key = Vec<Value>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionedValue {
    /// Column id: the index of the column in the table schema.
    pub id: u16,
    pub timestamp: Timestamp,
    pub flags: u8,
    pub value: Value,
}

impl VersionedValue {
    pub fn is_hunk(&self) -> bool {
        self.flags & value_flags::HUNK != 0
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VersionedRow {
    pub key: Key,
    /// Sorted by `(id asc, timestamp desc)`.
    pub values: Vec<VersionedValue>,
    /// Sorted descending.
    pub write_timestamps: Vec<Timestamp>,
    /// Sorted descending.
    pub delete_timestamps: Vec<Timestamp>,
}

impl VersionedRow {
    pub fn latest_write_timestamp(&self) -> Timestamp {
        self.write_timestamps.first().copied().unwrap_or(NULL_TIMESTAMP)
    }

    pub fn latest_delete_timestamp(&self) -> Timestamp {
        self.delete_timestamps.first().copied().unwrap_or(NULL_TIMESTAMP)
    }

    pub fn data_weight(&self) -> u64 {
        let key_weight: u64 = self.key.iter().map(Value::data_weight).sum();
        let value_weight: u64 = self
            .values
            .iter()
            .map(|value| value.value.data_weight() + 8)
            .sum();
        key_weight
            + value_weight
            + 8 * (self.write_timestamps.len() + self.delete_timestamps.len()) as u64
    }

    /// Canonical ordering of the value list.
    pub fn normalize(&mut self) {
        self.values
            .sort_by(|a, b| a.id.cmp(&b.id).then(b.timestamp.cmp(&a.timestamp)));
        self.write_timestamps.sort_unstable_by(|a, b| b.cmp(a));
        self.write_timestamps.dedup();
        self.delete_timestamps.sort_unstable_by(|a, b| b.cmp(a));
        self.delete_timestamps.dedup();
    }
}

pub fn compare_keys(lhs: &Key, rhs: &Key) -> Ordering {
    lhs.cmp(rhs)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_value_ordering() {
        assert!(Value::Null < Value::Int64(i64::MIN));
        assert!(Value::Int64(5) < Value::Int64(6));
        assert!(Value::Int64(100) < Value::Uint64(0));
        assert!(Value::String(Bytes::from_static(b"a")) < Value::String(Bytes::from_static(b"b")));
        assert_eq!(Value::Double(1.5), Value::Double(1.5));

        let a: Key = vec![Value::Int64(1), Value::String(Bytes::from_static(b"x"))];
        let b: Key = vec![Value::Int64(1), Value::String(Bytes::from_static(b"y"))];
        assert!(compare_keys(&a, &b) == Ordering::Less);
    }

    #[test]
    fn test_value_serde_roundtrip() {
        let values = vec![
            Value::Null,
            Value::Int64(-7),
            Value::Uint64(7),
            Value::Double(2.25),
            Value::Boolean(true),
            Value::String(Bytes::from_static(b"\x00\xffbinary")),
        ];
        for value in values {
            let json = serde_json::to_string(&value).unwrap();
            let back: Value = serde_json::from_str(&json).unwrap();
            assert_eq!(back, value);
        }
    }

    #[test]
    fn test_row_normalize() {
        let mut row = VersionedRow {
            key: vec![Value::Int64(1)],
            values: vec![
                VersionedValue {
                    id: 2,
                    timestamp: 10,
                    flags: 0,
                    value: Value::Int64(1),
                },
                VersionedValue {
                    id: 1,
                    timestamp: 5,
                    flags: 0,
                    value: Value::Int64(2),
                },
                VersionedValue {
                    id: 1,
                    timestamp: 9,
                    flags: 0,
                    value: Value::Int64(3),
                },
            ],
            write_timestamps: vec![5, 10, 9, 10],
            delete_timestamps: vec![],
        };
        row.normalize();
        assert_eq!(row.values[0].id, 1);
        assert_eq!(row.values[0].timestamp, 9);
        assert_eq!(row.values[2].id, 2);
        assert_eq!(row.write_timestamps, vec![10, 9, 5]);
        assert_eq!(row.latest_write_timestamp(), 10);
        assert_eq!(row.latest_delete_timestamp(), NULL_TIMESTAMP);
    }
}
