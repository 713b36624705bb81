use std::collections::HashMap;

use crate::firestore::core::query::Query;
use crate::firestore::core::types::OnlineState;
use crate::firestore::core::view_snapshot::{ChangeType, ViewSnapshot};
use crate::firestore::error::{is_retryable_persistence_error, unavailable, FirestoreError, FirestoreResult};

/// Receives every snapshot raised for a listener, or the error that ended it.
pub type QueryObserver = Box<dyn FnMut(FirestoreResult<ViewSnapshot>) + Send>;

/// Where a listener reads from.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ListenSource {
    /// Local cache plus the backend.
    #[default]
    Default,
    /// Local cache only; never starts a watch target.
    Cache,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ListenOptions {
    /// Raise snapshots whose only change is metadata (pending writes or
    /// `from_cache`).
    pub include_metadata_changes: bool,
    /// Hold back the first snapshot until the backend has synced the query,
    /// unless the client is known to be offline.
    pub wait_for_sync_when_online: bool,
    pub source: ListenSource,
}

/// The callbacks the event manager needs from the sync engine.
pub trait ListenHost {
    fn on_listen(&mut self, query: &Query, listen_to_remote: bool) -> FirestoreResult<ViewSnapshot>;

    fn on_unlisten(&mut self, query: &Query, unlisten_from_remote: bool) -> FirestoreResult<()>;

    /// A listener that needs the backend joined cache-only listeners.
    fn on_first_remote_store_listen(&mut self, query: &Query) -> FirestoreResult<()>;

    /// The last listener that needed the backend left.
    fn on_last_remote_store_unlisten(&mut self, query: &Query) -> FirestoreResult<()>;
}

/// One registered listener.
pub struct QueryListener {
    id: u64,
    query: Query,
    options: ListenOptions,
    observer: QueryObserver,
    raised_initial_event: bool,
    snapshot: Option<ViewSnapshot>,
    online_state: OnlineState,
}

impl QueryListener {
    pub fn new(id: u64, query: Query, options: ListenOptions, observer: QueryObserver) -> Self {
        Self {
            id,
            query,
            options,
            observer,
            raised_initial_event: false,
            snapshot: None,
            online_state: OnlineState::Unknown,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn query(&self) -> &Query {
        &self.query
    }

    pub fn listens_to_remote_store(&self) -> bool {
        self.options.source != ListenSource::Cache
    }

    /// Returns whether a snapshot was raised.
    pub fn on_view_snapshot(&mut self, snapshot: ViewSnapshot) -> bool {
        let snapshot = if self.options.include_metadata_changes {
            snapshot
        } else {
            ViewSnapshot {
                doc_changes: snapshot
                    .doc_changes
                    .into_iter()
                    .filter(|change| change.change_type != ChangeType::Metadata)
                    .collect(),
                excludes_metadata_changes: true,
                ..snapshot
            }
        };

        let mut raised = false;
        if !self.raised_initial_event {
            if self.should_raise_initial_event(&snapshot, self.online_state) {
                self.raise_initial_event(&snapshot);
                raised = true;
            }
        } else if self.should_raise_event(&snapshot) {
            (self.observer)(Ok(snapshot.clone()));
            raised = true;
        }
        self.snapshot = Some(snapshot);
        raised
    }

    pub fn on_error(&mut self, error: FirestoreError) {
        (self.observer)(Err(error));
    }

    /// Returns whether the held-back initial snapshot was raised.
    pub fn apply_online_state_change(&mut self, online_state: OnlineState) -> bool {
        self.online_state = online_state;
        let Some(snapshot) = self.snapshot.clone() else {
            return false;
        };
        if !self.raised_initial_event && self.should_raise_initial_event(&snapshot, online_state) {
            self.raise_initial_event(&snapshot);
            return true;
        }
        false
    }

    fn should_raise_initial_event(&self, snapshot: &ViewSnapshot, online_state: OnlineState) -> bool {
        if !snapshot.from_cache || !self.listens_to_remote_store() {
            return true;
        }
        // Unknown counts as online until the tracker decides otherwise.
        let maybe_online = online_state != OnlineState::Offline;
        !(self.options.wait_for_sync_when_online && maybe_online)
    }

    fn should_raise_event(&self, snapshot: &ViewSnapshot) -> bool {
        if !snapshot.doc_changes.is_empty() {
            return true;
        }
        let pending_writes_changed = self
            .snapshot
            .as_ref()
            .is_some_and(|previous| previous.has_pending_writes() != snapshot.has_pending_writes());
        if snapshot.sync_state_changed || pending_writes_changed {
            return self.options.include_metadata_changes;
        }
        // Only stripped metadata changes remained.
        false
    }

    fn raise_initial_event(&mut self, snapshot: &ViewSnapshot) {
        let initial = ViewSnapshot::from_initial_documents(
            snapshot.query.clone(),
            snapshot.docs.clone(),
            snapshot.mutated_keys.clone(),
            snapshot.from_cache,
            snapshot.excludes_metadata_changes,
            snapshot.has_cached_results,
        );
        self.raised_initial_event = true;
        (self.observer)(Ok(initial));
    }
}

#[derive(Default)]
struct QueryListenersInfo {
    view_snapshot: Option<ViewSnapshot>,
    listeners: Vec<QueryListener>,
}

impl QueryListenersInfo {
    fn has_remote_listeners(&self) -> bool {
        self.listeners.iter().any(QueryListener::listens_to_remote_store)
    }
}

enum SetupAction {
    InitializeLocalListen { listen_to_remote: bool },
    RequireWatchConnectionOnly,
    NoActionRequired,
}

enum TeardownAction {
    TerminateLocalListen { unlisten_from_remote: bool },
    RequireWatchDisconnectionOnly,
    NoActionRequired,
}

/// Fans snapshots from the sync engine out to listeners, sharing one
/// sync engine query among all listeners of equal queries.
#[derive(Default)]
pub struct EventManager {
    queries: HashMap<String, QueryListenersInfo>,
    online_state: OnlineState,
}

impl EventManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn listener_count(&self, query: &Query) -> usize {
        self.queries
            .get(&query.canonical_id())
            .map_or(0, |info| info.listeners.len())
    }

    /// Registers `listener`, starting the query in the sync engine if it is
    /// the first for its query. Failures are reported to the listener.
    pub fn listen(&mut self, host: &mut dyn ListenHost, mut listener: QueryListener) {
        let canonical_id = listener.query().canonical_id();
        let action = match self.queries.get(&canonical_id) {
            None => SetupAction::InitializeLocalListen {
                listen_to_remote: listener.listens_to_remote_store(),
            },
            Some(info) if !info.has_remote_listeners() && listener.listens_to_remote_store() => {
                SetupAction::RequireWatchConnectionOnly
            }
            Some(_) => SetupAction::NoActionRequired,
        };

        let result = match action {
            SetupAction::InitializeLocalListen { listen_to_remote } => host
                .on_listen(listener.query(), listen_to_remote)
                .map(Some),
            SetupAction::RequireWatchConnectionOnly => {
                host.on_first_remote_store_listen(listener.query()).map(|_| None)
            }
            SetupAction::NoActionRequired => Ok(None),
        };
        let initial_snapshot = match result {
            Ok(snapshot) => snapshot,
            Err(err) => {
                let err = wrap_in_user_error_if_recoverable(
                    err,
                    &format!("Initialization of query '{canonical_id}' failed"),
                );
                listener.on_error(err);
                return;
            }
        };

        let info = self.queries.entry(canonical_id).or_default();
        if initial_snapshot.is_some() {
            info.view_snapshot = initial_snapshot;
        }
        listener.apply_online_state_change(self.online_state);
        if let Some(snapshot) = info.view_snapshot.clone() {
            listener.on_view_snapshot(snapshot);
        }
        info.listeners.push(listener);
    }

    /// Removes the listener with `listener_id`, stopping the query in the
    /// sync engine once nobody listens to it.
    pub fn unlisten(&mut self, host: &mut dyn ListenHost, query: &Query, listener_id: u64) -> FirestoreResult<()> {
        let canonical_id = query.canonical_id();
        let mut action = TeardownAction::NoActionRequired;
        if let Some(info) = self.queries.get_mut(&canonical_id) {
            if let Some(index) = info.listeners.iter().position(|listener| listener.id() == listener_id) {
                let removed = info.listeners.remove(index);
                if info.listeners.is_empty() {
                    action = TeardownAction::TerminateLocalListen {
                        unlisten_from_remote: removed.listens_to_remote_store(),
                    };
                } else if !info.has_remote_listeners() && removed.listens_to_remote_store() {
                    action = TeardownAction::RequireWatchDisconnectionOnly;
                }
            }
        }

        match action {
            TeardownAction::TerminateLocalListen { unlisten_from_remote } => {
                self.queries.remove(&canonical_id);
                host.on_unlisten(query, unlisten_from_remote)
            }
            TeardownAction::RequireWatchDisconnectionOnly => host.on_last_remote_store_unlisten(query),
            TeardownAction::NoActionRequired => Ok(()),
        }
    }

    pub fn on_watch_change(&mut self, snapshots: Vec<ViewSnapshot>) {
        for snapshot in snapshots {
            let Some(info) = self.queries.get_mut(&snapshot.query.canonical_id()) else {
                continue;
            };
            for listener in &mut info.listeners {
                listener.on_view_snapshot(snapshot.clone());
            }
            info.view_snapshot = Some(snapshot);
        }
    }

    /// The query failed; every listener gets the error and is dropped.
    pub fn on_watch_error(&mut self, query: &Query, error: FirestoreError) {
        if let Some(info) = self.queries.remove(&query.canonical_id()) {
            for mut listener in info.listeners {
                listener.on_error(error.clone());
            }
        }
    }

    pub fn on_online_state_change(&mut self, online_state: OnlineState) {
        self.online_state = online_state;
        for info in self.queries.values_mut() {
            for listener in &mut info.listeners {
                listener.apply_online_state_change(online_state);
            }
        }
    }
}

/// Storage failures that would succeed on retry reach users as
/// `Unavailable`; anything else passes through unchanged.
pub fn wrap_in_user_error_if_recoverable(error: FirestoreError, context: &str) -> FirestoreError {
    if is_retryable_persistence_error(&error) {
        unavailable(format!("{context}: {error}"))
    } else {
        error
    }
}
