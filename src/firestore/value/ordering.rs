//! Equality, total ordering and canonical ids for [`FirestoreValue`]s.
//!
//! Values of different types order by type:
//! null < boolean < number < timestamp < server timestamp < string < bytes <
//! reference < geo point < array < vector < map.

use std::cmp::Ordering;

use crate::firestore::value::{FirestoreValue, ValueKind};

fn type_order(value: &FirestoreValue) -> u8 {
    match value.kind() {
        ValueKind::Null => 0,
        ValueKind::Boolean(_) => 1,
        ValueKind::Integer(_) | ValueKind::Double(_) => 2,
        ValueKind::Timestamp(_) => 3,
        ValueKind::ServerTimestamp(_) => 4,
        ValueKind::String(_) => 5,
        ValueKind::Bytes(_) => 6,
        ValueKind::Reference(_) => 7,
        ValueKind::GeoPoint(_) => 8,
        ValueKind::Array(_) => 9,
        ValueKind::Vector(_) => 10,
        ValueKind::Map(_) => 11,
    }
}

/// Protocol equality: integers never equal doubles, NaN equals NaN and
/// `-0.0` differs from `0.0`.
pub fn values_equal(left: &FirestoreValue, right: &FirestoreValue) -> bool {
    match (left.kind(), right.kind()) {
        (ValueKind::Null, ValueKind::Null) => true,
        (ValueKind::Boolean(l), ValueKind::Boolean(r)) => l == r,
        (ValueKind::Integer(l), ValueKind::Integer(r)) => l == r,
        (ValueKind::Double(l), ValueKind::Double(r)) => {
            if l.is_nan() && r.is_nan() {
                true
            } else {
                l == r && l.is_sign_negative() == r.is_sign_negative()
            }
        }
        (ValueKind::Timestamp(l), ValueKind::Timestamp(r)) => l == r,
        (ValueKind::ServerTimestamp(l), ValueKind::ServerTimestamp(r)) => {
            l.local_write_time() == r.local_write_time()
        }
        (ValueKind::String(l), ValueKind::String(r)) => l == r,
        (ValueKind::Bytes(l), ValueKind::Bytes(r)) => l == r,
        (ValueKind::Reference(l), ValueKind::Reference(r)) => l == r,
        (ValueKind::GeoPoint(l), ValueKind::GeoPoint(r)) => l == r,
        (ValueKind::Array(l), ValueKind::Array(r)) => {
            l.values().len() == r.values().len()
                && l
                    .values()
                    .iter()
                    .zip(r.values())
                    .all(|(a, b)| values_equal(a, b))
        }
        (ValueKind::Vector(l), ValueKind::Vector(r)) => l == r,
        (ValueKind::Map(l), ValueKind::Map(r)) => {
            l.fields().len() == r.fields().len()
                && l.fields().iter().all(|(key, value)| {
                    r.fields()
                        .get(key)
                        .is_some_and(|other| values_equal(value, other))
                })
        }
        _ => false,
    }
}

pub fn compare_values(left: &FirestoreValue, right: &FirestoreValue) -> Ordering {
    let by_type = type_order(left).cmp(&type_order(right));
    if by_type != Ordering::Equal {
        return by_type;
    }

    match (left.kind(), right.kind()) {
        (ValueKind::Boolean(l), ValueKind::Boolean(r)) => l.cmp(r),
        (ValueKind::Integer(l), ValueKind::Integer(r)) => l.cmp(r),
        (ValueKind::Integer(l), ValueKind::Double(r)) => compare_doubles(*l as f64, *r),
        (ValueKind::Double(l), ValueKind::Integer(r)) => compare_doubles(*l, *r as f64),
        (ValueKind::Double(l), ValueKind::Double(r)) => compare_doubles(*l, *r),
        (ValueKind::Timestamp(l), ValueKind::Timestamp(r)) => l.cmp(r),
        (ValueKind::ServerTimestamp(l), ValueKind::ServerTimestamp(r)) => {
            l.local_write_time().cmp(&r.local_write_time())
        }
        (ValueKind::String(l), ValueKind::String(r)) => l.cmp(r),
        (ValueKind::Bytes(l), ValueKind::Bytes(r)) => l.cmp(r),
        (ValueKind::Reference(l), ValueKind::Reference(r)) => {
            l.split('/').cmp(r.split('/'))
        }
        (ValueKind::GeoPoint(l), ValueKind::GeoPoint(r)) => l.compare(r),
        (ValueKind::Array(l), ValueKind::Array(r)) => compare_sequences(l.values(), r.values()),
        (ValueKind::Vector(l), ValueKind::Vector(r)) => l.len().cmp(&r.len()).then_with(|| {
            l.iter()
                .zip(r.iter())
                .map(|(a, b)| compare_doubles(*a, *b))
                .find(|ordering| *ordering != Ordering::Equal)
                .unwrap_or(Ordering::Equal)
        }),
        (ValueKind::Map(l), ValueKind::Map(r)) => {
            for ((lk, lv), (rk, rv)) in l.fields().iter().zip(r.fields().iter()) {
                let ordering = lk.cmp(rk).then_with(|| compare_values(lv, rv));
                if ordering != Ordering::Equal {
                    return ordering;
                }
            }
            l.fields().len().cmp(&r.fields().len())
        }
        _ => Ordering::Equal,
    }
}

fn compare_sequences(left: &[FirestoreValue], right: &[FirestoreValue]) -> Ordering {
    for (l, r) in left.iter().zip(right.iter()) {
        let ordering = compare_values(l, r);
        if ordering != Ordering::Equal {
            return ordering;
        }
    }
    left.len().cmp(&right.len())
}

/// NaN sorts before every other number; `-0.0` and `0.0` compare equal.
fn compare_doubles(left: f64, right: f64) -> Ordering {
    match (left.is_nan(), right.is_nan()) {
        (true, true) => Ordering::Equal,
        (true, false) => Ordering::Less,
        (false, true) => Ordering::Greater,
        (false, false) => left.partial_cmp(&right).unwrap_or(Ordering::Equal),
    }
}

pub fn array_contains(array: &[FirestoreValue], needle: &FirestoreValue) -> bool {
    array.iter().any(|candidate| values_equal(candidate, needle))
}

/// Stable textual form used to identify queries and targets structurally.
pub fn canonical_id(value: &FirestoreValue) -> String {
    match value.kind() {
        ValueKind::Null => "null".to_string(),
        ValueKind::Boolean(value) => value.to_string(),
        ValueKind::Integer(value) => value.to_string(),
        ValueKind::Double(value) => format!("{value:?}"),
        ValueKind::Timestamp(ts) => ts.canonical_id(),
        ValueKind::ServerTimestamp(pending) => format!(
            "pending({},{})",
            pending.local_write_time().seconds,
            pending.local_write_time().nanos
        ),
        ValueKind::String(value) => format!("{value:?}"),
        ValueKind::Bytes(bytes) => bytes.canonical_id(),
        ValueKind::Reference(path) => path.clone(),
        ValueKind::GeoPoint(point) => point.canonical_id(),
        ValueKind::Array(array) => {
            let parts: Vec<String> = array.values().iter().map(canonical_id).collect();
            format!("[{}]", parts.join(","))
        }
        ValueKind::Vector(values) => {
            let parts: Vec<String> = values.iter().map(|v| format!("{v:?}")).collect();
            format!("vector[{}]", parts.join(","))
        }
        ValueKind::Map(map) => {
            let parts: Vec<String> = map
                .fields()
                .iter()
                .map(|(key, value)| format!("{key}:{}", canonical_id(value)))
                .collect();
            format!("{{{}}}", parts.join(","))
        }
    }
}
