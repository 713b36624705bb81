use std::sync::Arc;
use std::time::Duration;

use crate::firestore::error::{FirestoreError, FirestoreErrorCode, FirestoreResult};
use crate::firestore::remote::connection::{Connection, StreamKind};
use crate::firestore::remote::credentials::AuthToken;
use crate::util::async_queue::{DelayedOperation, TimerId};
use crate::util::backoff::ExponentialBackoff;

/// Streams that saw no request for this long are closed.
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(60);

/// Token fetch issued on behalf of a stream. The answer is routed back with
/// the same `generation`; answers for older generations are dropped.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TokenRequest {
    pub stream: StreamKind,
    pub force_refresh: bool,
    pub generation: u64,
}

/// Side effects the remote layer asks its host to perform asynchronously.
///
/// Results re-enter the engine as `on_timer` and `on_token` calls on the
/// worker that owns it.
pub trait RemoteScheduler: Send + Sync {
    fn schedule_timer(&self, timer_id: TimerId, delay: Duration) -> DelayedOperation;

    fn fetch_token(&self, request: TokenRequest);

    fn invalidate_token(&self);
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StreamState {
    /// Not started, or stopped by the client.
    Initial,
    /// Waiting for an auth token.
    Auth,
    /// Transport asked to open, waiting for the open event.
    Starting,
    Open,
    /// Waiting for the backoff timer before the next attempt.
    Backoff,
    /// Closed by a failure. The next start goes through backoff.
    Error,
}

#[derive(Debug)]
pub enum TokenOutcome {
    /// Stale generation or the stream moved on.
    Ignored,
    Opened,
    /// The fetch failed. The stream must be closed with this error.
    Failed(FirestoreError),
}

/// State machine shared by the watch and write streams.
///
/// The stream never touches the transport on its own initiative: callers
/// pass the [`Connection`] into the transitions that open or close it.
pub struct PersistentStream {
    kind: StreamKind,
    state: StreamState,
    backoff: ExponentialBackoff,
    scheduler: Arc<dyn RemoteScheduler>,
    backoff_timer: Option<DelayedOperation>,
    idle_timer: Option<DelayedOperation>,
    token_generation: u64,
    force_token_refresh: bool,
    consecutive_unauthenticated: u32,
}

impl PersistentStream {
    pub fn new(kind: StreamKind, backoff: ExponentialBackoff, scheduler: Arc<dyn RemoteScheduler>) -> Self {
        Self {
            kind,
            state: StreamState::Initial,
            backoff,
            scheduler,
            backoff_timer: None,
            idle_timer: None,
            token_generation: 0,
            force_token_refresh: false,
            consecutive_unauthenticated: 0,
        }
    }

    pub fn kind(&self) -> StreamKind {
        self.kind
    }

    pub fn state(&self) -> StreamState {
        self.state
    }

    /// True from `start` until the stream is stopped or fails.
    pub fn is_started(&self) -> bool {
        matches!(
            self.state,
            StreamState::Auth | StreamState::Starting | StreamState::Open | StreamState::Backoff
        )
    }

    pub fn is_open(&self) -> bool {
        self.state == StreamState::Open
    }

    /// Number of UNAUTHENTICATED closes since the last message.
    pub fn consecutive_unauthenticated(&self) -> u32 {
        self.consecutive_unauthenticated
    }

    /// Forgets earlier UNAUTHENTICATED closes once the caller has given up
    /// on them.
    pub fn clear_unauthenticated_failures(&mut self) {
        self.consecutive_unauthenticated = 0;
    }

    pub fn start(&mut self) {
        if self.state == StreamState::Error {
            self.perform_backoff();
            return;
        }
        if self.state != StreamState::Initial {
            log::debug!("{:?} stream already started ({:?})", self.kind, self.state);
            return;
        }
        self.state = StreamState::Auth;
        self.request_token();
    }

    fn request_token(&mut self) {
        self.token_generation += 1;
        let request = TokenRequest {
            stream: self.kind,
            force_refresh: std::mem::take(&mut self.force_token_refresh),
            generation: self.token_generation,
        };
        self.scheduler.fetch_token(request);
    }

    pub fn on_token(
        &mut self,
        generation: u64,
        result: FirestoreResult<Option<AuthToken>>,
        connection: &mut dyn Connection,
    ) -> TokenOutcome {
        if generation != self.token_generation || self.state != StreamState::Auth {
            return TokenOutcome::Ignored;
        }
        match result {
            Ok(token) => {
                self.state = StreamState::Starting;
                connection.open(self.kind, token.as_ref());
                TokenOutcome::Opened
            }
            Err(err) => TokenOutcome::Failed(FirestoreError::new(
                FirestoreErrorCode::Unknown,
                format!("Fetching auth token failed: {}", err.message()),
            )),
        }
    }

    /// Returns false when the event does not belong to the current attempt.
    pub fn on_open(&mut self) -> bool {
        if self.state != StreamState::Starting {
            return false;
        }
        self.state = StreamState::Open;
        true
    }

    /// Records a successful message. Returns false when the stream is not
    /// open and the message must be dropped.
    pub fn on_message(&mut self) -> bool {
        if self.state != StreamState::Open {
            return false;
        }
        self.backoff.reset();
        self.consecutive_unauthenticated = 0;
        true
    }

    /// Moves the stream to the error state. Returns false when the stream was
    /// not running, in which case the close is stale.
    pub fn on_close(&mut self, error: &FirestoreError) -> bool {
        if !matches!(self.state, StreamState::Auth | StreamState::Starting | StreamState::Open) {
            return false;
        }
        self.close(StreamState::Error, Some(error), None);
        true
    }

    /// Closes the stream on the client's behalf. Not reported as a failure.
    pub fn stop(&mut self, connection: &mut dyn Connection) {
        if self.is_started() {
            self.close(StreamState::Initial, None, Some(connection));
        }
    }

    /// Makes the next start connect without waiting, after a failure that
    /// was handled by dropping the offending request.
    pub fn inhibit_backoff(&mut self) {
        if self.is_started() {
            log::debug!("Cannot inhibit backoff of a running {:?} stream", self.kind);
            return;
        }
        self.state = StreamState::Initial;
        self.backoff.reset();
    }

    fn perform_backoff(&mut self) {
        self.state = StreamState::Backoff;
        let delay = self.backoff.next_delay();
        self.backoff_timer = Some(self.scheduler.schedule_timer(self.kind.backoff_timer(), delay));
    }

    pub fn on_backoff_elapsed(&mut self) {
        self.backoff_timer = None;
        if self.state != StreamState::Backoff {
            return;
        }
        self.state = StreamState::Initial;
        self.start();
    }

    /// Arms the idle timer. The stream closes when it fires before the next
    /// request.
    pub fn mark_idle(&mut self) {
        if self.is_open() && self.idle_timer.is_none() {
            self.idle_timer = Some(self.scheduler.schedule_timer(self.kind.idle_timer(), IDLE_TIMEOUT));
        }
    }

    pub fn cancel_idle_check(&mut self) {
        if let Some(timer) = self.idle_timer.take() {
            timer.cancel();
        }
    }

    /// Returns true when the stream was closed.
    pub fn on_idle_elapsed(&mut self, connection: &mut dyn Connection) -> bool {
        if self.idle_timer.take().is_none() || !self.is_open() {
            return false;
        }
        log::debug!("Closing idle {:?} stream", self.kind);
        self.close(StreamState::Initial, None, Some(connection));
        true
    }

    fn close(&mut self, final_state: StreamState, error: Option<&FirestoreError>, connection: Option<&mut dyn Connection>) {
        self.cancel_idle_check();
        if let Some(timer) = self.backoff_timer.take() {
            timer.cancel();
        }

        match error.map(|err| err.code) {
            None => self.backoff.reset(),
            Some(FirestoreErrorCode::ResourceExhausted) => {
                log::debug!("{:?} stream hit a resource limit, using maximum backoff", self.kind);
                self.backoff.reset_to_max();
            }
            Some(FirestoreErrorCode::Unauthenticated) => {
                self.consecutive_unauthenticated += 1;
                if self.consecutive_unauthenticated == 1 {
                    self.scheduler.invalidate_token();
                    self.force_token_refresh = true;
                }
            }
            Some(_) => {}
        }

        if let Some(connection) = connection {
            if matches!(self.state, StreamState::Starting | StreamState::Open) {
                connection.close(self.kind);
            }
        }
        // Token answers for this attempt are stale from here on.
        self.token_generation += 1;
        self.state = final_state;
    }
}
