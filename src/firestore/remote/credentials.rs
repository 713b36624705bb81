use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::firestore::error::FirestoreResult;
use crate::firestore::model::User;

/// Access token attached to a stream when it opens.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AuthToken {
    pub value: String,
    pub user: User,
}

pub type UserChangeListener = Box<dyn Fn(User) + Send + Sync>;

#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
pub trait CredentialsProvider: Send + Sync + 'static {
    /// `None` means the requests go out unauthenticated.
    async fn get_token(&self, force_refresh: bool) -> FirestoreResult<Option<AuthToken>>;

    /// Drops the cached token after the backend rejected it.
    fn invalidate_token(&self);

    /// Registers the callback for sign-in and sign-out. It is invoked once
    /// with the current user.
    fn set_change_listener(&self, listener: UserChangeListener);
}

/// Provider for clients that never sign in.
#[derive(Clone, Debug, Default)]
pub struct EmptyCredentialsProvider;

#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
impl CredentialsProvider for EmptyCredentialsProvider {
    async fn get_token(&self, _force_refresh: bool) -> FirestoreResult<Option<AuthToken>> {
        Ok(None)
    }

    fn invalidate_token(&self) {}

    fn set_change_listener(&self, listener: UserChangeListener) {
        listener(User::unauthenticated());
    }
}

/// Provider holding a fixed user and token, switchable with
/// [`StaticCredentialsProvider::change_user`].
#[derive(Clone, Default)]
pub struct StaticCredentialsProvider {
    inner: Arc<Mutex<StaticCredentials>>,
}

#[derive(Default)]
struct StaticCredentials {
    token: Option<AuthToken>,
    listener: Option<Arc<dyn Fn(User) + Send + Sync>>,
    invalidations: usize,
    forced_refreshes: usize,
}

impl StaticCredentialsProvider {
    pub fn new(token: Option<AuthToken>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(StaticCredentials {
                token,
                ..StaticCredentials::default()
            })),
        }
    }

    /// Switches the signed-in user and notifies the listener.
    pub fn change_user(&self, token: Option<AuthToken>) {
        let (listener, user) = {
            let mut inner = self.inner.lock().unwrap();
            let user = token
                .as_ref()
                .map(|token| token.user.clone())
                .unwrap_or_else(User::unauthenticated);
            inner.token = token;
            (inner.listener.clone(), user)
        };
        if let Some(listener) = listener {
            listener(user);
        }
    }

    pub fn invalidations(&self) -> usize {
        self.inner.lock().unwrap().invalidations
    }

    pub fn forced_refreshes(&self) -> usize {
        self.inner.lock().unwrap().forced_refreshes
    }

    fn current_user(&self) -> User {
        self.inner
            .lock()
            .unwrap()
            .token
            .as_ref()
            .map(|token| token.user.clone())
            .unwrap_or_else(User::unauthenticated)
    }
}

#[cfg_attr(target_arch = "wasm32", async_trait(?Send))]
#[cfg_attr(not(target_arch = "wasm32"), async_trait)]
impl CredentialsProvider for StaticCredentialsProvider {
    async fn get_token(&self, force_refresh: bool) -> FirestoreResult<Option<AuthToken>> {
        let mut inner = self.inner.lock().unwrap();
        if force_refresh {
            inner.forced_refreshes += 1;
        }
        Ok(inner.token.clone())
    }

    fn invalidate_token(&self) {
        self.inner.lock().unwrap().invalidations += 1;
    }

    fn set_change_listener(&self, listener: UserChangeListener) {
        let listener: Arc<dyn Fn(User) + Send + Sync> = Arc::from(listener);
        self.inner.lock().unwrap().listener = Some(Arc::clone(&listener));
        listener(self.current_user());
    }
}
