//! Production runner implementation.

use crate::apply::{run_apply_worker, ApplyJob};
use crate::metrics;
use crate::timers::TimerManager;
use pbft_bft::persistence::{load_recovered_state, persist_checkpoint, persist_snapshot};
use pbft_bft::{BftConfig, BftState, BftStats, State};
use pbft_core::{
    Action, Application, ApplyError, Backend, Dber, Event, StateMachine, StorageError, Transport,
    TransportError,
};
use pbft_messages::Message;
use pbft_types::{Request, ValidatorId, View};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, span, warn, Level};

/// Errors from the production runner.
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("Event channel closed")]
    ChannelClosed,

    #[error("Request dropped: runner queue is full")]
    RequestDropped,

    #[error("Missing builder field: {0}")]
    MissingField(&'static str),

    #[error("Failed to load persisted state: {0}")]
    Recovery(#[from] StorageError),

    #[error("Timed out after {0:?}")]
    Timeout(Duration),
}

/// A failure of one of the runner's collaborators.
///
/// Reported on the runner's error channel. The consensus core never retries:
/// the snapshot of a decided round keeps its proposal, so an operator can
/// re-attempt the apply.
#[derive(Debug, Error)]
pub enum CollaboratorError {
    #[error("application: {0}")]
    Apply(#[from] ApplyError),

    #[error("storage: {0}")]
    Storage(#[from] StorageError),

    #[error("transport: {0}")]
    Transport(#[from] TransportError),

    #[error("apply worker: {0}")]
    Worker(String),
}

impl CollaboratorError {
    /// Short label for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            CollaboratorError::Apply(_) => "apply",
            CollaboratorError::Storage(_) => "storage",
            CollaboratorError::Transport(_) => "transport",
            CollaboratorError::Worker(_) => "worker",
        }
    }
}

/// Runner tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    /// Capacity of the inbound network and client request channels.
    pub channel_capacity: usize,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 10_000,
        }
    }
}

/// Consensus progress published after every event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RunnerStatus {
    pub state: State,
    pub current_view: View,
    pub committed: View,
    pub view_changes: u64,
    pub stable_checkpoint: u64,
}

/// Handle for shutting down a running [`ProductionRunner`].
///
/// When dropped, signals the runner to exit gracefully.
#[derive(Debug)]
pub struct ShutdownHandle {
    tx: Option<oneshot::Sender<()>>,
}

impl ShutdownHandle {
    /// Trigger shutdown (consumes the handle).
    pub fn shutdown(mut self) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(());
        }
    }
}

impl Drop for ShutdownHandle {
    fn drop(&mut self) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(());
        }
    }
}

/// Cloneable client-side handle: submits requests and observes progress.
#[derive(Debug, Clone)]
pub struct RunnerHandle {
    requests: mpsc::Sender<Request>,
    status: watch::Receiver<RunnerStatus>,
}

impl RunnerHandle {
    /// Submit a client request without waiting for queue space.
    pub fn submit(&self, payload: impl Into<Vec<u8>>) -> Result<(), RunnerError> {
        self.requests
            .try_send(Request::new(payload))
            .map_err(|e| match e {
                mpsc::error::TrySendError::Full(_) => RunnerError::RequestDropped,
                mpsc::error::TrySendError::Closed(_) => RunnerError::ChannelClosed,
            })
    }

    /// Latest published status.
    pub fn status(&self) -> RunnerStatus {
        *self.status.borrow()
    }

    /// Wait until `sequence` is committed.
    pub async fn wait_for_commit(
        &mut self,
        sequence: u64,
        timeout: Duration,
    ) -> Result<RunnerStatus, RunnerError> {
        let wait = self.status.wait_for(|s| s.committed.sequence >= sequence);
        match tokio::time::timeout(timeout, wait).await {
            Ok(Ok(status)) => Ok(*status),
            Ok(Err(_)) => Err(RunnerError::ChannelClosed),
            Err(_) => Err(RunnerError::Timeout(timeout)),
        }
    }
}

/// Builder for constructing a [`ProductionRunner`].
///
/// Required fields:
/// - `backend` - Identity, membership and signing
/// - `transport` - Broadcast to the other validators
/// - `inbound` - Encoded messages from the other validators
/// - `application` - Receives decided proposals
/// - `storage` - Snapshots and checkpoints for crash recovery
///
/// Optional fields:
/// - `bft_config` - Consensus parameters (defaults to [`BftConfig::default`])
/// - `config` - Runner tuning (defaults to [`RunnerConfig::default`])
///
/// # Example
///
/// ```no_run
/// use pbft_core::{MemoryDb, StaticBackend};
/// use pbft_production::{LocalHub, ProductionRunner};
/// use pbft_types::{ProposerPolicy, ValidatorId, ValidatorSet};
/// use std::sync::Arc;
///
/// # async fn example(application: Arc<dyn pbft_core::Application>) -> Result<(), Box<dyn std::error::Error>> {
/// let ids: Vec<_> = (0..4).map(ValidatorId).collect();
/// let validators = ValidatorSet::new(ids, ProposerPolicy::RoundRobin)?;
/// let hub = LocalHub::new();
/// let (transport, inbound) = hub.join(ValidatorId(0), 1024);
///
/// let mut runner = ProductionRunner::builder()
///     .backend(Arc::new(StaticBackend::insecure_for_testing(ValidatorId(0), validators)))
///     .transport(Arc::new(transport))
///     .inbound(inbound)
///     .application(application)
///     .storage(Arc::new(MemoryDb::new()))
///     .build()?;
/// let handle = runner.handle();
/// tokio::spawn(runner.run());
/// handle.submit(b"hello".to_vec())?;
/// # Ok(())
/// # }
/// ```
#[derive(Default)]
pub struct ProductionRunnerBuilder {
    backend: Option<Arc<dyn Backend>>,
    bft_config: Option<BftConfig>,
    transport: Option<Arc<dyn Transport>>,
    inbound: Option<mpsc::Receiver<Vec<u8>>>,
    application: Option<Arc<dyn Application>>,
    storage: Option<Arc<dyn Dber>>,
    config: RunnerConfig,
}

impl ProductionRunnerBuilder {
    /// Create a new builder with all fields unset.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the identity and signing backend (required).
    pub fn backend(mut self, backend: Arc<dyn Backend>) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Set the BFT configuration.
    pub fn bft_config(mut self, config: BftConfig) -> Self {
        self.bft_config = Some(config);
        self
    }

    /// Set the outbound transport (required).
    pub fn transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Set the inbound payload channel (required).
    pub fn inbound(mut self, inbound: mpsc::Receiver<Vec<u8>>) -> Self {
        self.inbound = Some(inbound);
        self
    }

    /// Set the application (required).
    pub fn application(mut self, application: Arc<dyn Application>) -> Self {
        self.application = Some(application);
        self
    }

    /// Set the consensus storage (required).
    pub fn storage(mut self, storage: Arc<dyn Dber>) -> Self {
        self.storage = Some(storage);
        self
    }

    /// Set the runner configuration.
    pub fn config(mut self, config: RunnerConfig) -> Self {
        self.config = config;
        self
    }

    /// Build the runner, resuming from whatever `storage` holds.
    pub fn build(self) -> Result<ProductionRunner, RunnerError> {
        let backend = self.backend.ok_or(RunnerError::MissingField("backend"))?;
        let transport = self
            .transport
            .ok_or(RunnerError::MissingField("transport"))?;
        let inbound_rx = self.inbound.ok_or(RunnerError::MissingField("inbound"))?;
        let application = self
            .application
            .ok_or(RunnerError::MissingField("application"))?;
        let storage = self.storage.ok_or(RunnerError::MissingField("storage"))?;
        let bft_config = self.bft_config.unwrap_or_default();

        let recovered = load_recovered_state(&*storage)?;
        let state = BftState::new(bft_config, backend.clone(), recovered);

        // Channels by priority:
        // - timer: view-change timeouts, never blocked by network floods
        // - callback: backlog replays and checkpoint completions
        // - inbound: consensus messages from other validators
        // - request: client submissions
        let (timer_tx, timer_rx) = mpsc::channel(16);
        let (callback_tx, callback_rx) = mpsc::unbounded_channel();
        let (request_tx, request_rx) = mpsc::channel(self.config.channel_capacity.max(1));
        let (apply_tx, apply_rx) = mpsc::unbounded_channel();
        let (error_tx, error_rx) = mpsc::unbounded_channel();
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let (status_tx, _) = watch::channel(status_of(&state));

        Ok(ProductionRunner {
            address: backend.address(),
            timer_rx,
            callback_rx,
            callback_tx,
            inbound_rx,
            request_rx,
            request_tx,
            state,
            start_time: Instant::now(),
            timer_manager: TimerManager::new(timer_tx),
            transport,
            storage,
            application,
            apply_tx,
            apply_rx: Some(apply_rx),
            error_tx,
            error_rx: Some(error_rx),
            status_tx,
            shutdown_rx,
            shutdown_tx: Some(shutdown_tx),
        })
    }
}

fn status_of(state: &BftState) -> RunnerStatus {
    let stats = state.stats();
    RunnerStatus {
        state: state.state(),
        current_view: state.current_view(),
        committed: state.committed(),
        view_changes: stats.view_changes,
        stable_checkpoint: state.stable_checkpoint().map_or(0, |c| c.view.sequence),
    }
}

/// Production runner with async I/O.
///
/// A single task owns the state machine and receives events through
/// prioritized mpsc channels. Application work runs on a background worker
/// whose results come back as internal events.
pub struct ProductionRunner {
    address: ValidatorId,
    /// View-change timer fires. Dedicated so floods cannot delay them.
    timer_rx: mpsc::Receiver<Event>,
    /// Internal events: backlog replays and checkpoint completions.
    callback_rx: mpsc::UnboundedReceiver<Event>,
    callback_tx: mpsc::UnboundedSender<Event>,
    /// Encoded messages from other validators.
    inbound_rx: mpsc::Receiver<Vec<u8>>,
    /// Client requests.
    request_rx: mpsc::Receiver<Request>,
    request_tx: mpsc::Sender<Request>,
    /// The state machine (owned, not shared).
    state: BftState,
    start_time: Instant,
    timer_manager: TimerManager,
    transport: Arc<dyn Transport>,
    storage: Arc<dyn Dber>,
    application: Arc<dyn Application>,
    apply_tx: mpsc::UnboundedSender<ApplyJob>,
    /// Taken by `run` to start the apply worker.
    apply_rx: Option<mpsc::UnboundedReceiver<ApplyJob>>,
    error_tx: mpsc::UnboundedSender<CollaboratorError>,
    error_rx: Option<mpsc::UnboundedReceiver<CollaboratorError>>,
    status_tx: watch::Sender<RunnerStatus>,
    shutdown_rx: oneshot::Receiver<()>,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl ProductionRunner {
    /// Create a new builder for constructing a production runner.
    pub fn builder() -> ProductionRunnerBuilder {
        ProductionRunnerBuilder::new()
    }

    /// This validator's identity.
    pub fn address(&self) -> ValidatorId {
        self.address
    }

    /// The state machine, for inspection before `run`.
    pub fn state(&self) -> &BftState {
        &self.state
    }

    /// A handle for submitting requests and watching progress.
    pub fn handle(&self) -> RunnerHandle {
        RunnerHandle {
            requests: self.request_tx.clone(),
            status: self.status_tx.subscribe(),
        }
    }

    /// Take the shutdown handle. Only the first call returns it.
    pub fn shutdown_handle(&mut self) -> Option<ShutdownHandle> {
        self.shutdown_tx
            .take()
            .map(|tx| ShutdownHandle { tx: Some(tx) })
    }

    /// Take the collaborator error stream. Only the first call returns it.
    pub fn take_error_receiver(&mut self) -> Option<mpsc::UnboundedReceiver<CollaboratorError>> {
        self.error_rx.take()
    }

    /// Run the main event loop until shutdown.
    ///
    /// Channels are polled with a `biased` select in priority order: shutdown,
    /// timers, internal callbacks, network, then client requests.
    pub async fn run(mut self) -> Result<(), RunnerError> {
        let Some(apply_rx) = self.apply_rx.take() else {
            return Err(RunnerError::ChannelClosed);
        };
        let worker = tokio::spawn(run_apply_worker(
            self.application.clone(),
            apply_rx,
            self.callback_tx.clone(),
            self.error_tx.clone(),
        ));

        info!(
            validator = %self.address,
            view = %self.state.current_view(),
            committed = %self.state.committed(),
            "Starting production runner"
        );
        self.state.set_time(self.start_time.elapsed());
        let actions = self.state.start();
        self.process_actions(actions);

        loop {
            tokio::select! {
                biased;

                _ = &mut self.shutdown_rx => {
                    info!(validator = %self.address, "Shutdown signal received");
                    break;
                }

                Some(event) = self.timer_rx.recv() => {
                    self.dispatch(event);
                }

                Some(event) = self.callback_rx.recv() => {
                    self.dispatch(event);
                }

                Some(payload) = self.inbound_rx.recv() => {
                    self.on_payload(payload);
                }

                Some(request) = self.request_rx.recv() => {
                    self.dispatch(Event::RequestReceived { request });
                }

                else => {
                    debug!(validator = %self.address, "All event channels closed");
                    break;
                }
            }
        }

        self.timer_manager.cancel_all();
        // Closing the job channel lets the worker finish queued applies.
        drop(self.apply_tx);
        if let Err(e) = worker.await {
            warn!(error = %e, "Apply worker ended abnormally");
        }
        info!(validator = %self.address, committed = %self.state.committed(), "Runner stopped");
        Ok(())
    }

    fn on_payload(&mut self, payload: Vec<u8>) {
        metrics::record_message_received();
        match Message::from_payload(&payload) {
            Ok(message) => self.dispatch(Event::MessageReceived { message }),
            Err(e) => {
                metrics::record_message_rejected("codec");
                debug!(validator = %self.address, error = %e, "Dropping undecodable payload");
            }
        }
    }

    fn dispatch(&mut self, event: Event) {
        let event_span = span!(
            Level::DEBUG,
            "handle_event",
            event.type = event.type_name(),
            validator = %self.address,
        );
        let _guard = event_span.enter();

        self.state.set_time(self.start_time.elapsed());
        let before = self.state.stats();
        let actions = self.state.handle(event);
        if let Some(reason) = self.state.take_last_rejection() {
            metrics::record_message_rejected(reason);
        }
        self.process_actions(actions);
        self.publish(before);
    }

    fn publish(&mut self, before: BftStats) {
        let after = self.state.stats();
        if after.committed_sequence > before.committed_sequence {
            metrics::record_committed(
                after.committed_sequence,
                after.committed_sequence - before.committed_sequence,
            );
        }
        if after.view_changes > before.view_changes {
            metrics::record_view_changes(after.view_changes - before.view_changes);
        }
        metrics::set_view_number(after.current_view_number);
        metrics::set_queue_depths(self.state.backlog_len(), self.state.pending_requests());

        let status = status_of(&self.state);
        metrics::set_stable_checkpoint(status.stable_checkpoint);
        self.status_tx.send_if_modified(|current| {
            let changed = *current != status;
            *current = status;
            changed
        });
    }

    fn process_actions(&mut self, actions: Vec<Action>) {
        for action in actions {
            self.process_action(action);
        }
    }

    fn process_action(&mut self, action: Action) {
        match action {
            Action::Broadcast { message } => match message.to_payload() {
                Ok(payload) => match self.transport.send(payload) {
                    Ok(()) => metrics::record_message_sent(),
                    Err(e) => self.report(e.into()),
                },
                Err(e) => warn!(validator = %self.address, error = %e, "Failed to encode message"),
            },

            Action::SetTimer { id, duration } => self.timer_manager.set_timer(id, duration),

            Action::EnqueueInternal { event } => {
                // Receiver is owned by self, so this cannot fail while running.
                let _ = self.callback_tx.send(event);
            }

            Action::CommitProposal { view, proposal } => {
                self.delegate(ApplyJob::Commit { view, proposal })
            }
            Action::BuildCheckpoint { view, digest } => {
                self.delegate(ApplyJob::Checkpoint { view, digest })
            }

            Action::PersistSnapshot { snapshot } => {
                let start = Instant::now();
                match persist_snapshot(&*self.storage, &snapshot) {
                    Ok(()) => metrics::record_storage_write(start.elapsed().as_secs_f64()),
                    Err(e) => self.report(e.into()),
                }
            }
            Action::PersistCheckpoint { checkpoint } => {
                if let Err(e) = persist_checkpoint(&*self.storage, &checkpoint) {
                    self.report(e.into());
                }
            }
        }
    }

    fn delegate(&mut self, job: ApplyJob) {
        if self.apply_tx.send(job).is_err() {
            self.report(CollaboratorError::Worker("apply worker stopped".into()));
        }
    }

    fn report(&self, error: CollaboratorError) {
        warn!(validator = %self.address, error = %error, kind = error.kind(), "Collaborator failed");
        metrics::record_collaborator_error(error.kind());
        let _ = self.error_tx.send(error);
    }
}
