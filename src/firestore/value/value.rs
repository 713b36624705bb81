use std::collections::BTreeMap;

use crate::firestore::model::{GeoPoint, Timestamp};
use crate::firestore::value::{ArrayValue, BytesValue, MapValue};

#[derive(Clone, Debug, PartialEq)]
pub struct FirestoreValue {
    kind: ValueKind,
}

/// Placeholder written into a local view for a pending server timestamp
/// transform. Reads may show the local write time or the previous value until
/// the server commits the real timestamp.
#[derive(Clone, Debug, PartialEq)]
pub struct ServerTimestampValue {
    local_write_time: Timestamp,
    previous_value: Option<Box<FirestoreValue>>,
}

impl ServerTimestampValue {
    pub fn local_write_time(&self) -> Timestamp {
        self.local_write_time
    }

    pub fn previous_value(&self) -> Option<&FirestoreValue> {
        self.previous_value.as_deref()
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum ValueKind {
    Null,
    Boolean(bool),
    Integer(i64),
    Double(f64),
    Timestamp(Timestamp),
    ServerTimestamp(ServerTimestampValue),
    String(String),
    Bytes(BytesValue),
    Reference(String),
    GeoPoint(GeoPoint),
    Array(ArrayValue),
    Vector(Vec<f64>),
    Map(MapValue),
}

impl From<ValueKind> for FirestoreValue {
    fn from(kind: ValueKind) -> Self {
        Self { kind }
    }
}

impl FirestoreValue {
    pub fn null() -> Self {
        ValueKind::Null.into()
    }

    pub fn from_bool(value: bool) -> Self {
        ValueKind::Boolean(value).into()
    }

    pub fn from_integer(value: i64) -> Self {
        ValueKind::Integer(value).into()
    }

    pub fn from_double(value: f64) -> Self {
        ValueKind::Double(value).into()
    }

    pub fn from_timestamp(value: Timestamp) -> Self {
        ValueKind::Timestamp(value).into()
    }

    /// Builds the pending server timestamp placeholder. A previous value that
    /// is itself pending is unwrapped so placeholders never nest.
    pub fn server_timestamp(local_write_time: Timestamp, previous: Option<FirestoreValue>) -> Self {
        let previous_value = match previous.map(|value| value.kind) {
            Some(ValueKind::ServerTimestamp(pending)) => pending.previous_value,
            Some(kind) => Some(Box::new(FirestoreValue::from(kind))),
            None => None,
        };
        ValueKind::ServerTimestamp(ServerTimestampValue {
            local_write_time,
            previous_value,
        })
        .into()
    }

    pub fn from_string(value: impl Into<String>) -> Self {
        ValueKind::String(value.into()).into()
    }

    pub fn from_bytes(value: BytesValue) -> Self {
        ValueKind::Bytes(value).into()
    }

    /// `path` is the fully qualified document name.
    pub fn from_reference(path: impl Into<String>) -> Self {
        ValueKind::Reference(path.into()).into()
    }

    pub fn from_geo_point(value: GeoPoint) -> Self {
        ValueKind::GeoPoint(value).into()
    }

    pub fn from_array(values: Vec<FirestoreValue>) -> Self {
        ArrayValue::new(values).into()
    }

    pub fn from_vector(values: Vec<f64>) -> Self {
        ValueKind::Vector(values).into()
    }

    pub fn from_map(fields: BTreeMap<String, FirestoreValue>) -> Self {
        MapValue::new(fields).into()
    }

    pub fn kind(&self) -> &ValueKind {
        &self.kind
    }

    pub fn is_number(&self) -> bool {
        matches!(self.kind, ValueKind::Integer(_) | ValueKind::Double(_))
    }

    pub fn is_nan(&self) -> bool {
        matches!(self.kind, ValueKind::Double(value) if value.is_nan())
    }

    pub fn is_null(&self) -> bool {
        matches!(self.kind, ValueKind::Null)
    }

    pub fn as_map(&self) -> Option<&MapValue> {
        match &self.kind {
            ValueKind::Map(map) => Some(map),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&ArrayValue> {
        match &self.kind {
            ValueKind::Array(array) => Some(array),
            _ => None,
        }
    }
}

impl From<MapValue> for FirestoreValue {
    fn from(value: MapValue) -> Self {
        ValueKind::Map(value).into()
    }
}

impl From<ArrayValue> for FirestoreValue {
    fn from(value: ArrayValue) -> Self {
        ValueKind::Array(value).into()
    }
}
