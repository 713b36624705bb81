use base64::{engine::general_purpose::STANDARD, Engine as _};

/// Opaque blob field. Blobs order as unsigned byte strings.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct BytesValue(Vec<u8>);

impl BytesValue {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self(bytes)
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }

    /// Base64 form used in canonical query ids.
    pub fn canonical_id(&self) -> String {
        STANDARD.encode(&self.0)
    }
}

impl From<Vec<u8>> for BytesValue {
    fn from(value: Vec<u8>) -> Self {
        Self::new(value)
    }
}

impl From<&[u8]> for BytesValue {
    fn from(value: &[u8]) -> Self {
        Self::new(value.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn orders_unsigned_and_shorter_first() {
        let low = BytesValue::from(&[0x01][..]);
        let high = BytesValue::from(&[0xff][..]);
        let longer = BytesValue::from(&[0x01, 0x00][..]);
        assert!(low < high);
        assert!(low < longer);
        assert!(longer < high);
    }

    #[test]
    fn canonical_id_is_padded_base64() {
        assert_eq!(BytesValue::new(vec![1, 2, 3, 4]).canonical_id(), "AQIDBA==");
    }
}
