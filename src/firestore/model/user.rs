/// Identity that scopes the mutation queue and overlays. Unauthenticated
/// clients share a single anonymous queue.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct User {
    uid: Option<String>,
}

impl User {
    pub fn new(uid: impl Into<String>) -> Self {
        Self {
            uid: Some(uid.into()),
        }
    }

    pub fn unauthenticated() -> Self {
        Self { uid: None }
    }

    pub fn uid(&self) -> Option<&str> {
        self.uid.as_deref()
    }

    pub fn is_authenticated(&self) -> bool {
        self.uid.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn anonymous_users_compare_equal() {
        assert_eq!(User::unauthenticated(), User::default());
        assert!(!User::unauthenticated().is_authenticated());
        assert_eq!(User::new("alice").uid(), Some("alice"));
    }
}
