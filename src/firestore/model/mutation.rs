use std::collections::BTreeSet;

use crate::firestore::model::{Document, DocumentKey, FieldPath, SnapshotVersion, Timestamp};
use crate::firestore::value::{ArrayValue, FirestoreValue, MapValue, ValueKind};

/// Set of field paths touched by a patch or accumulated while computing overlays.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FieldMask {
    fields: BTreeSet<FieldPath>,
}

impl FieldMask {
    pub fn new(fields: impl IntoIterator<Item = FieldPath>) -> Self {
        Self {
            fields: fields.into_iter().collect(),
        }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    /// Mask listing every leaf of `value`. Empty nested maps count as leaves.
    pub fn from_map_value(value: &MapValue) -> Self {
        let mut fields = BTreeSet::new();
        collect_leaf_paths(value, &[], &mut fields);
        Self { fields }
    }

    pub fn fields(&self) -> &BTreeSet<FieldPath> {
        &self.fields
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Whether `path` equals or sits below a field of this mask.
    pub fn covers(&self, path: &FieldPath) -> bool {
        self.fields.iter().any(|field| field.is_prefix_of(path))
    }

    pub fn union_with(mut self, extra: impl IntoIterator<Item = FieldPath>) -> Self {
        self.fields.extend(extra);
        self
    }
}

fn collect_leaf_paths(value: &MapValue, prefix: &[String], out: &mut BTreeSet<FieldPath>) {
    for (name, child) in value.fields() {
        let mut segments = prefix.to_vec();
        segments.push(name.clone());
        match child.kind() {
            ValueKind::Map(map) if !map.is_empty() => collect_leaf_paths(map, &segments, out),
            _ => {
                if let Ok(path) = FieldPath::new(segments) {
                    out.insert(path);
                }
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum TransformOperation {
    ServerTimestamp,
    ArrayUnion(Vec<FirestoreValue>),
    ArrayRemove(Vec<FirestoreValue>),
    NumericIncrement(FirestoreValue),
}

#[derive(Clone, Debug, PartialEq)]
pub struct FieldTransform {
    field: FieldPath,
    operation: TransformOperation,
}

impl FieldTransform {
    pub fn new(field: FieldPath, operation: TransformOperation) -> Self {
        Self { field, operation }
    }

    pub fn field(&self) -> &FieldPath {
        &self.field
    }

    pub fn operation(&self) -> &TransformOperation {
        &self.operation
    }
}

#[derive(Clone, Debug, Default, PartialEq)]
pub enum Precondition {
    #[default]
    None,
    Exists(bool),
    UpdateTime(SnapshotVersion),
}

impl Precondition {
    pub fn is_none(&self) -> bool {
        matches!(self, Precondition::None)
    }

    pub fn is_valid_for(&self, document: &Document) -> bool {
        match self {
            Precondition::None => true,
            Precondition::Exists(exists) => *exists == document.is_found_document(),
            Precondition::UpdateTime(version) => {
                document.is_found_document() && document.version() == *version
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
pub enum MutationKind {
    Set { value: MapValue },
    Patch { value: MapValue, mask: FieldMask },
    Delete,
}

/// A single document write. Transforms run after the set or patch data is applied.
#[derive(Clone, Debug, PartialEq)]
pub struct Mutation {
    key: DocumentKey,
    kind: MutationKind,
    precondition: Precondition,
    field_transforms: Vec<FieldTransform>,
}

/// Server acknowledgement of a single mutation.
#[derive(Clone, Debug, PartialEq)]
pub struct MutationResult {
    pub version: SnapshotVersion,
    pub transform_results: Vec<FirestoreValue>,
}

impl MutationResult {
    pub fn new(version: SnapshotVersion) -> Self {
        Self {
            version,
            transform_results: Vec::new(),
        }
    }
}

impl Mutation {
    pub fn set(key: DocumentKey, value: MapValue) -> Self {
        Self::with_kind(key, MutationKind::Set { value })
    }

    pub fn patch(key: DocumentKey, value: MapValue, mask: FieldMask) -> Self {
        let mut mutation = Self::with_kind(key, MutationKind::Patch { value, mask });
        mutation.precondition = Precondition::Exists(true);
        mutation
    }

    pub fn delete(key: DocumentKey) -> Self {
        Self::with_kind(key, MutationKind::Delete)
    }

    fn with_kind(key: DocumentKey, kind: MutationKind) -> Self {
        Self {
            key,
            kind,
            precondition: Precondition::None,
            field_transforms: Vec::new(),
        }
    }

    pub fn with_precondition(mut self, precondition: Precondition) -> Self {
        self.precondition = precondition;
        self
    }

    pub fn with_transform(mut self, field: FieldPath, operation: TransformOperation) -> Self {
        self.field_transforms.push(FieldTransform::new(field, operation));
        self
    }

    pub fn key(&self) -> &DocumentKey {
        &self.key
    }

    pub fn kind(&self) -> &MutationKind {
        &self.kind
    }

    pub fn precondition(&self) -> &Precondition {
        &self.precondition
    }

    pub fn field_transforms(&self) -> &[FieldTransform] {
        &self.field_transforms
    }

    pub fn is_patch(&self) -> bool {
        matches!(self.kind, MutationKind::Patch { .. })
    }

    /// Fields this mutation writes, or `None` when it replaces or deletes the
    /// whole document.
    pub fn field_mask(&self) -> Option<FieldMask> {
        match &self.kind {
            MutationKind::Patch { mask, .. } => Some(
                mask.clone()
                    .union_with(self.field_transforms.iter().map(|t| t.field.clone())),
            ),
            MutationKind::Set { .. } | MutationKind::Delete => None,
        }
    }

    /// Applies the mutation to the local view of `document`.
    ///
    /// `previous_mask` holds the fields already changed by earlier mutations;
    /// `None` means the whole document was replaced. The returned mask adds
    /// this mutation's fields. A failed precondition leaves the document and
    /// mask untouched.
    pub fn apply_to_local_view(
        &self,
        document: &mut Document,
        previous_mask: Option<FieldMask>,
        local_write_time: Timestamp,
    ) -> Option<FieldMask> {
        if !self.precondition.is_valid_for(document) {
            return previous_mask;
        }

        match &self.kind {
            MutationKind::Set { value } => {
                let transform_results = self.local_transform_results(local_write_time, document);
                let mut data = value.clone();
                data.set_all(transform_results);
                let version = document.version();
                document
                    .convert_to_found(version, data)
                    .set_has_local_mutations();
                None
            }
            MutationKind::Patch { value, mask } => {
                let transform_results = self.local_transform_results(local_write_time, document);
                let mut data = document.data();
                data.set_all(patch_values(value, mask));
                data.set_all(transform_results);
                let version = document.version();
                document
                    .convert_to_found(version, data)
                    .set_has_local_mutations();
                previous_mask.map(|previous| {
                    previous
                        .union_with(mask.fields().iter().cloned())
                        .union_with(self.field_transforms.iter().map(|t| t.field.clone()))
                })
            }
            MutationKind::Delete => {
                let version = document.version();
                document
                    .convert_to_no_document(version)
                    .set_has_local_mutations();
                None
            }
        }
    }

    /// Applies the server-acknowledged result of this mutation to a remote document.
    pub fn apply_to_remote_document(&self, document: &mut Document, result: &MutationResult) {
        match &self.kind {
            MutationKind::Set { value } => {
                let transform_results = self.server_transform_results(document, result);
                let mut data = value.clone();
                data.set_all(transform_results);
                document
                    .convert_to_found(result.version, data)
                    .set_has_committed_mutations();
            }
            MutationKind::Patch { value, mask } => {
                if !self.precondition.is_valid_for(document) {
                    document.convert_to_unknown(result.version);
                    return;
                }
                let transform_results = self.server_transform_results(document, result);
                let mut data = document.data();
                data.set_all(patch_values(value, mask));
                data.set_all(transform_results);
                document
                    .convert_to_found(result.version, data)
                    .set_has_committed_mutations();
            }
            MutationKind::Delete => {
                document
                    .convert_to_no_document(result.version)
                    .set_has_committed_mutations();
            }
        }
    }

    /// Captures the values numeric increments read from `document`, so the
    /// local view can be recomputed against the same base later.
    pub fn extract_transform_base_value(&self, document: &Document) -> Option<MapValue> {
        let mut base: Option<MapValue> = None;
        for transform in &self.field_transforms {
            if let TransformOperation::NumericIncrement(_) = transform.operation {
                let value = increment_base(document.field(&transform.field));
                base.get_or_insert_with(MapValue::empty)
                    .set(&transform.field, value);
            }
        }
        base
    }

    fn local_transform_results(
        &self,
        local_write_time: Timestamp,
        document: &Document,
    ) -> Vec<(FieldPath, Option<FirestoreValue>)> {
        self.field_transforms
            .iter()
            .map(|transform| {
                let previous = document.field(&transform.field).cloned();
                let value = match &transform.operation {
                    TransformOperation::ServerTimestamp => {
                        FirestoreValue::server_timestamp(local_write_time, previous)
                    }
                    TransformOperation::ArrayUnion(elements) => {
                        FirestoreValue::from(coerce_array(previous.as_ref()).union_with(elements))
                    }
                    TransformOperation::ArrayRemove(elements) => {
                        FirestoreValue::from(coerce_array(previous.as_ref()).remove_all(elements))
                    }
                    TransformOperation::NumericIncrement(operand) => {
                        numeric_increment(previous.as_ref(), operand)
                    }
                };
                (transform.field.clone(), Some(value))
            })
            .collect()
    }

    fn server_transform_results(
        &self,
        document: &Document,
        result: &MutationResult,
    ) -> Vec<(FieldPath, Option<FirestoreValue>)> {
        self.field_transforms
            .iter()
            .enumerate()
            .map(|(index, transform)| {
                let previous = document.field(&transform.field);
                let server_value = result.transform_results.get(index).cloned();
                let value = match &transform.operation {
                    TransformOperation::ArrayUnion(elements) => {
                        FirestoreValue::from(coerce_array(previous).union_with(elements))
                    }
                    TransformOperation::ArrayRemove(elements) => {
                        FirestoreValue::from(coerce_array(previous).remove_all(elements))
                    }
                    TransformOperation::ServerTimestamp => server_value.unwrap_or_else(|| {
                        FirestoreValue::from_timestamp(result.version.timestamp())
                    }),
                    TransformOperation::NumericIncrement(operand) => {
                        server_value.unwrap_or_else(|| numeric_increment(previous, operand))
                    }
                };
                (transform.field.clone(), Some(value))
            })
            .collect()
    }
}

fn patch_values(value: &MapValue, mask: &FieldMask) -> Vec<(FieldPath, Option<FirestoreValue>)> {
    mask.fields()
        .iter()
        .map(|path| (path.clone(), value.get(path).cloned()))
        .collect()
}

fn coerce_array(value: Option<&FirestoreValue>) -> ArrayValue {
    value
        .and_then(FirestoreValue::as_array)
        .cloned()
        .unwrap_or_default()
}

fn increment_base(previous: Option<&FirestoreValue>) -> FirestoreValue {
    match previous {
        Some(value) if value.is_number() => value.clone(),
        _ => FirestoreValue::from_integer(0),
    }
}

/// Integer plus integer stays an integer and saturates; any double operand
/// produces a double.
fn numeric_increment(previous: Option<&FirestoreValue>, operand: &FirestoreValue) -> FirestoreValue {
    let base = increment_base(previous);
    match (base.kind(), operand.kind()) {
        (ValueKind::Integer(l), ValueKind::Integer(r)) => FirestoreValue::from_integer(l.saturating_add(*r)),
        _ => FirestoreValue::from_double(as_double(&base) + as_double(operand)),
    }
}

fn as_double(value: &FirestoreValue) -> f64 {
    match value.kind() {
        ValueKind::Integer(value) => *value as f64,
        ValueKind::Double(value) => *value,
        _ => 0.0,
    }
}
