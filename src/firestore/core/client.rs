use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::firestore::core::engine::Engine;
use crate::firestore::core::event_manager::{ListenOptions, QueryListener, QueryObserver};
use crate::firestore::core::query::Query;
use crate::firestore::core::view_snapshot::ViewSnapshot;
use crate::firestore::error::{cancelled, FirestoreResult};
use crate::firestore::local::{LocalStore, Persistence};
use crate::firestore::model::{Document, DocumentKey, Mutation, User};
use crate::firestore::remote::{
    Connection, CredentialsProvider, RemoteScheduler, TokenRequest, WatchStreamEvent, WriteStreamEvent,
};
use crate::firestore::settings::SyncSettings;
use crate::platform::runtime;
use crate::util::async_queue::{AsyncQueue, DelayedOperation, TimerId};

/// Runs remote store timers and token fetches on the client's queue.
struct QueueScheduler {
    queue: AsyncQueue<Engine>,
    credentials: Arc<dyn CredentialsProvider>,
}

impl RemoteScheduler for QueueScheduler {
    fn schedule_timer(&self, timer_id: TimerId, delay: Duration) -> DelayedOperation {
        let queue = self.queue.clone();
        self.queue.enqueue_after_delay(timer_id, delay, move |engine| {
            let result = engine.on_timer(timer_id);
            after_operation(&queue, engine, result, "timer");
        })
    }

    fn fetch_token(&self, request: TokenRequest) {
        let queue = self.queue.clone();
        let credentials = Arc::clone(&self.credentials);
        runtime::spawn_detached(async move {
            let token = credentials.get_token(request.force_refresh).await;
            let handle = queue.clone();
            queue.enqueue_and_forget(move |engine| {
                let result = engine.on_token(request.stream, request.generation, token);
                after_operation(&handle, engine, result, "token");
            });
        });
    }

    fn invalidate_token(&self) {
        self.credentials.invalidate_token();
    }
}

/// Logs failures of fire-and-forget operations and schedules network
/// recovery after storage failures.
fn after_operation(queue: &AsyncQueue<Engine>, engine: &mut Engine, result: FirestoreResult<()>, label: &str) {
    if let Err(err) = result {
        log::warn!("Failed to handle {label}: {err}");
    }
    schedule_recovery(queue, engine);
}

fn schedule_recovery(queue: &AsyncQueue<Engine>, engine: &mut Engine) {
    if !engine.take_recovery_request() {
        return;
    }
    let queue = queue.clone();
    queue.clone().enqueue_retryable(move |engine: &mut Engine| {
        let result = engine.recover();
        schedule_recovery(&queue, engine);
        result
    });
}

/// Handle returned by [`FirestoreClient::listen`]. Dropping it removes the
/// listener.
pub struct ListenerRegistration {
    queue: AsyncQueue<Engine>,
    query: Query,
    listener_id: u64,
    detached: bool,
}

impl ListenerRegistration {
    pub fn detach(&mut self) {
        if self.detached {
            return;
        }
        self.detached = true;
        let query = self.query.clone();
        let listener_id = self.listener_id;
        let handle = self.queue.clone();
        self.queue.enqueue_and_forget(move |engine| {
            let result = engine.unlisten(&query, listener_id);
            after_operation(&handle, engine, result, "unlisten");
        });
    }
}

impl Drop for ListenerRegistration {
    fn drop(&mut self) {
        self.detach();
    }
}

/// Entry point of the engine. Every call is serialized on one
/// [`AsyncQueue`] that owns the [`Engine`].
///
/// The transport feeds stream events in through
/// [`FirestoreClient::on_watch_event`] and [`FirestoreClient::on_write_event`];
/// everything the engine sends goes out through the [`Connection`].
#[derive(Clone)]
pub struct FirestoreClient {
    queue: AsyncQueue<Engine>,
    next_listener_id: Arc<AtomicU64>,
}

impl FirestoreClient {
    pub async fn new(
        settings: SyncSettings,
        persistence: Box<dyn Persistence>,
        connection: Box<dyn Connection>,
        credentials: Arc<dyn CredentialsProvider>,
    ) -> FirestoreResult<Self> {
        let scheduler_credentials = Arc::clone(&credentials);
        let retry_backoff = settings.backoff;
        let queue = AsyncQueue::start_with_backoff(retry_backoff, move |queue| {
            let scheduler = Arc::new(QueueScheduler {
                queue,
                credentials: scheduler_credentials,
            });
            let local_store = LocalStore::new(persistence, User::unauthenticated());
            Engine::new(local_store, &settings, connection, scheduler)
        });
        let client = Self {
            queue,
            next_listener_id: Arc::new(AtomicU64::new(1)),
        };
        client.run(|engine| engine.start()).await?;

        let last_user = Mutex::new(User::unauthenticated());
        let queue = client.queue.clone();
        credentials.set_change_listener(Box::new(move |user: User| {
            {
                let mut last = last_user.lock().unwrap();
                if *last == user {
                    return;
                }
                *last = user.clone();
            }
            log::debug!("Credential changed. Current user: {:?}", user.uid());
            let handle = queue.clone();
            queue.enqueue_and_forget(move |engine| {
                let result = engine.handle_credential_change(user);
                after_operation(&handle, engine, result, "credential change");
            });
        }));
        Ok(client)
    }

    /// Queue owning the engine, for driving timers in tests.
    pub fn async_queue(&self) -> &AsyncQueue<Engine> {
        &self.queue
    }

    /// Queues `op` now and resolves with its result.
    fn run<T, F>(&self, op: F) -> impl Future<Output = FirestoreResult<T>>
    where
        T: Send + 'static,
        F: FnOnce(&mut Engine) -> FirestoreResult<T> + Send + 'static,
    {
        let queue = self.queue.clone();
        let result = self.queue.enqueue(move |engine| {
            let result = op(engine);
            schedule_recovery(&queue, engine);
            result
        });
        async move { result.await? }
    }

    /// Starts delivering snapshots of `query` to `observer`.
    pub fn listen(
        &self,
        query: Query,
        options: ListenOptions,
        observer: QueryObserver,
    ) -> impl Future<Output = FirestoreResult<ListenerRegistration>> {
        let listener_id = self.next_listener_id.fetch_add(1, Ordering::SeqCst);
        let listener = QueryListener::new(listener_id, query.clone(), options, observer);
        let queued = self.run(move |engine| {
            engine.listen(listener);
            Ok(())
        });
        let queue = self.queue.clone();
        async move {
            queued.await?;
            Ok(ListenerRegistration {
                queue,
                query,
                listener_id,
                detached: false,
            })
        }
    }

    /// Applies `mutations` locally and resolves once the backend has
    /// accepted or rejected them.
    pub fn write(&self, mutations: Vec<Mutation>) -> impl Future<Output = FirestoreResult<()>> {
        let queued = self.run(move |engine| engine.write(mutations));
        async move {
            let receiver = queued.await?;
            receiver
                .await
                .map_err(|_| cancelled("The client shut down before the write completed"))?
        }
    }

    /// Resolves once every write issued so far is acknowledged or rejected.
    pub fn wait_for_pending_writes(&self) -> impl Future<Output = FirestoreResult<()>> {
        let queued = self.run(|engine| engine.register_pending_writes_callback());
        async move {
            let receiver = queued.await?;
            receiver
                .await
                .map_err(|_| cancelled("The client shut down before pending writes completed"))?
        }
    }

    pub fn get_document_from_local_cache(
        &self,
        key: DocumentKey,
    ) -> impl Future<Output = FirestoreResult<Option<Document>>> {
        self.run(move |engine| engine.get_document_from_local_cache(&key))
    }

    pub fn get_documents_from_local_cache(&self, query: Query) -> impl Future<Output = FirestoreResult<ViewSnapshot>> {
        self.run(move |engine| engine.get_documents_from_local_cache(&query))
    }

    pub fn enable_network(&self) -> impl Future<Output = FirestoreResult<()>> {
        self.run(|engine| engine.enable_network())
    }

    pub fn disable_network(&self) -> impl Future<Output = FirestoreResult<()>> {
        self.run(|engine| {
            engine.disable_network();
            Ok(())
        })
    }

    /// Reports that the host's network reachability changed. Streams waiting
    /// out a backoff reconnect right away.
    pub fn on_connectivity_change(&self) {
        let queue = self.queue.clone();
        self.queue.enqueue_and_forget(move |engine| {
            let result = engine.handle_connectivity_change();
            after_operation(&queue, engine, result, "connectivity change");
        });
    }

    pub fn on_watch_event(&self, event: WatchStreamEvent) {
        let queue = self.queue.clone();
        self.queue.enqueue_and_forget(move |engine| {
            let result = engine.handle_watch_event(event);
            after_operation(&queue, engine, result, "watch stream event");
        });
    }

    pub fn on_write_event(&self, event: WriteStreamEvent) {
        let queue = self.queue.clone();
        self.queue.enqueue_and_forget(move |engine| {
            let result = engine.handle_write_event(event);
            after_operation(&queue, engine, result, "write stream event");
        });
    }

    /// Stops the streams, releases storage and stops the queue. Later calls
    /// fail with `Cancelled`.
    pub fn shutdown(&self) -> impl Future<Output = FirestoreResult<()>> {
        self.queue.shutdown(|engine| {
            if let Err(err) = engine.shutdown() {
                log::warn!("Failed to shut down cleanly: {err}");
            }
        })
    }
}
