use std::collections::BTreeSet;

use crate::firestore::core::query::{Filter, Operator, Query};
use crate::firestore::model::{
    Document, DocumentKey, FieldMask, FieldPath, Mutation, MutationResult, ResourcePath, SnapshotVersion, Timestamp,
    TransformOperation,
};
use crate::firestore::value::{FirestoreValue, MapValue};

pub fn key(path: &str) -> DocumentKey {
    DocumentKey::from_string(path).expect("valid document key")
}

pub fn keys(paths: &[&str]) -> BTreeSet<DocumentKey> {
    paths.iter().map(|path| key(path)).collect()
}

pub fn path(path: &str) -> ResourcePath {
    ResourcePath::from_string(path).expect("valid resource path")
}

pub fn field(path: &str) -> FieldPath {
    FieldPath::from_dot_separated(path).expect("valid field path")
}

pub fn version(seconds: i64) -> SnapshotVersion {
    SnapshotVersion::new(Timestamp::new(seconds, 0))
}

/// Map value from dotted field names.
pub fn map(fields: &[(&str, FirestoreValue)]) -> MapValue {
    let mut value = MapValue::empty();
    for (name, field_value) in fields {
        value.set(&field(name), field_value.clone());
    }
    value
}

pub fn int(value: i64) -> FirestoreValue {
    FirestoreValue::from_integer(value)
}

pub fn string(value: &str) -> FirestoreValue {
    FirestoreValue::from_string(value)
}

/// Found document at `seconds`, read at the same version.
pub fn doc(path: &str, seconds: i64, data: MapValue) -> Document {
    let mut document = Document::new_found(key(path), version(seconds), data);
    document.set_read_time(version(seconds));
    document
}

pub fn deleted_doc(path: &str, seconds: i64) -> Document {
    let mut document = Document::new_no_document(key(path), version(seconds));
    document.set_read_time(version(seconds));
    document
}

pub fn set_mutation(path: &str, data: MapValue) -> Mutation {
    Mutation::set(key(path), data)
}

/// Patch writing exactly the fields present in `data`.
pub fn patch_mutation(path: &str, data: MapValue) -> Mutation {
    let mask = FieldMask::from_map_value(&data);
    Mutation::patch(key(path), data, mask)
}

pub fn delete_mutation(path: &str) -> Mutation {
    Mutation::delete(key(path))
}

/// Patch that only increments `field_name` by `by`.
pub fn increment(path: &str, field_name: &str, by: i64) -> Mutation {
    Mutation::patch(key(path), MapValue::empty(), FieldMask::empty())
        .with_transform(field(field_name), TransformOperation::NumericIncrement(int(by)))
}

pub fn mutation_result(seconds: i64) -> MutationResult {
    MutationResult::new(version(seconds))
}

pub fn query(path_str: &str) -> Query {
    Query::new(path(path_str))
}

pub fn filter(field_name: &str, op: Operator, value: FirestoreValue) -> Filter {
    Filter::field(field(field_name), op, value)
}
