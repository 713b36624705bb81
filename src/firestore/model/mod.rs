mod database_id;
mod document;
mod document_key;
mod field_path;
mod geo_point;
mod index_offset;
mod mutation;
mod mutation_batch;
mod overlay;
mod resource_path;
mod snapshot_version;
mod timestamp;
mod user;

pub use database_id::{DatabaseId, DEFAULT_DATABASE_ID};
pub use document::{Document, DocumentContents, DocumentState};
pub use document_key::DocumentKey;
pub use field_path::FieldPath;
pub use geo_point::GeoPoint;
pub use index_offset::IndexOffset;
pub use mutation::{
    FieldMask, FieldTransform, Mutation, MutationKind, MutationResult, Precondition,
    TransformOperation,
};
pub use mutation_batch::{MutationBatch, MutationBatchResult, BATCH_ID_UNKNOWN};
pub use overlay::{calculate_overlay_mutation, Overlay, OverlayedDocument};
pub use resource_path::ResourcePath;
pub use snapshot_version::SnapshotVersion;
pub use timestamp::Timestamp;
pub use user::User;
