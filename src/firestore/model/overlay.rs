use std::collections::BTreeSet;

use crate::firestore::model::{Document, DocumentKey, FieldMask, FieldPath, Mutation, Precondition};
use crate::firestore::value::MapValue;

/// The single mutation that summarizes every pending batch touching one
/// document, tagged with the newest batch it reflects.
#[derive(Clone, Debug, PartialEq)]
pub struct Overlay {
    largest_batch_id: i32,
    mutation: Mutation,
}

impl Overlay {
    pub fn new(largest_batch_id: i32, mutation: Mutation) -> Self {
        Self {
            largest_batch_id,
            mutation,
        }
    }

    pub fn key(&self) -> &DocumentKey {
        self.mutation.key()
    }

    pub fn largest_batch_id(&self) -> i32 {
        self.largest_batch_id
    }

    pub fn mutation(&self) -> &Mutation {
        &self.mutation
    }
}

/// A document with its overlay applied, plus the fields the overlay changed
/// (`None` when the whole document was replaced).
#[derive(Clone, Debug, PartialEq)]
pub struct OverlayedDocument {
    pub document: Document,
    pub mutated_fields: Option<FieldMask>,
}

/// Builds the overlay mutation for a locally mutated document.
///
/// Without a mask the document was replaced (or deleted) wholesale and the
/// overlay is a set or delete. With a mask the overlay is a patch of the
/// final values of the masked fields; a field that no longer exists is
/// patched at its parent when possible so deleted subtrees are captured.
pub fn calculate_overlay_mutation(document: &Document, mask: Option<&FieldMask>) -> Option<Mutation> {
    if !document.has_local_mutations() {
        return None;
    }
    let Some(mask) = mask else {
        return Some(if document.is_no_document() {
            Mutation::delete(document.key().clone())
        } else {
            Mutation::set(document.key().clone(), document.data())
        });
    };
    if mask.is_empty() {
        return None;
    }

    let data = document.data();
    let mut patch = MapValue::empty();
    let mut patched: BTreeSet<FieldPath> = BTreeSet::new();
    for field in mask.fields() {
        if patched.contains(field) {
            continue;
        }
        let mut path = field.clone();
        let mut value = data.get(&path).cloned();
        if value.is_none() {
            if let Some(parent) = path.pop_last() {
                value = data.get(&parent).cloned();
                path = parent;
            }
        }
        match value {
            Some(value) => patch.set(&path, value),
            None => patch.delete(&path),
        }
        patched.insert(path);
    }

    Some(
        Mutation::patch(document.key().clone(), patch, FieldMask::new(patched))
            .with_precondition(Precondition::None),
    )
}
