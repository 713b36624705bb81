mod array_value;
mod bytes_value;
mod map_value;
mod ordering;
mod value;

pub use array_value::ArrayValue;
pub use bytes_value::BytesValue;
pub use map_value::MapValue;
pub use ordering::{array_contains, canonical_id, compare_values, values_equal};
pub use value::{FirestoreValue, ServerTimestampValue, ValueKind};
