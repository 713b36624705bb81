use crate::firestore::value::{values_equal, FirestoreValue};

#[derive(Clone, Debug, Default, PartialEq)]
pub struct ArrayValue {
    values: Vec<FirestoreValue>,
}

impl ArrayValue {
    pub fn new(values: Vec<FirestoreValue>) -> Self {
        Self { values }
    }

    pub fn values(&self) -> &[FirestoreValue] {
        &self.values
    }

    /// Appends each element not already present, keeping first occurrences.
    pub fn union_with(&self, elements: &[FirestoreValue]) -> Self {
        let mut values = self.values.clone();
        for element in elements {
            if !values.iter().any(|candidate| values_equal(candidate, element)) {
                values.push(element.clone());
            }
        }
        Self::new(values)
    }

    /// Drops every element equal to one of `elements`.
    pub fn remove_all(&self, elements: &[FirestoreValue]) -> Self {
        let values = self
            .values
            .iter()
            .filter(|candidate| !elements.iter().any(|element| values_equal(candidate, element)))
            .cloned()
            .collect();
        Self::new(values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn union_skips_duplicates() {
        let array = ArrayValue::new(vec![FirestoreValue::from_integer(1)]);
        let merged = array.union_with(&[
            FirestoreValue::from_integer(1),
            FirestoreValue::from_integer(2),
            FirestoreValue::from_integer(2),
        ]);
        assert_eq!(
            merged.values(),
            &[FirestoreValue::from_integer(1), FirestoreValue::from_integer(2)]
        );
    }

    #[test]
    fn remove_drops_every_match() {
        let array = ArrayValue::new(vec![
            FirestoreValue::from_integer(1),
            FirestoreValue::from_string("x"),
            FirestoreValue::from_integer(1),
        ]);
        let remaining = array.remove_all(&[FirestoreValue::from_integer(1)]);
        assert_eq!(remaining.values(), &[FirestoreValue::from_string("x")]);
    }
}
