//! # Worker runtime
//!
//! The persistent worker context: a single tokio task owning the durable
//! queue. Pages talk to it through a cloneable [`WorkerHandle`]; it talks
//! back through the [`Notifier`] broadcast.
//!
//! ## Event sources
//!
//! ```text
//! pages ──commands (mpsc)──┐
//! platform ──SyncEvent─────┼──▶ worker loop ──flush tasks──▶ FlushController
//! connectivity (watch) ────┘         │
//!                                    └──notifications (broadcast)──▶ pages
//! ```
//!
//! Tags with queued items hold a registered sync intent. Every offline to
//! online transition fires all registered intents; an intent is dropped once
//! its lane is empty. A flush that stops short re-arms its lane on the
//! retry backoff, so a server outage that never shows up as a connectivity
//! change still drains once the server is back.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};

use outbox_core::{
    current_timestamp_ms, ClientMessage, ConnectionStatus, IdempotencyKey, MutatingRequest,
    Notification, OutboxError, OutboxResult, QueueStatus, QueueStore, QueuedRequest, StoreError,
    SyncEvent, Transport, WorkerLifecycle, DEFAULT_SYNC_TAG,
};
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, oneshot, watch};

use crate::config::{OutboxConfig, RetryConfig};
use crate::connectivity::ConnectivityMonitor;
use crate::error::{WorkerError, WorkerResult};
use crate::flush::{FlushController, FlushReport};
use crate::metrics;
use crate::notifier::Notifier;

const COMMAND_BUFFER: usize = 64;

/// Reply to a page message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum WorkerReply {
    /// The request is durably queued.
    Queued {
        /// Key of the queued request.
        key: IdempotencyKey,
    },
    /// Current contents of a lane.
    QueueStatus(QueueStatus),
    /// Lifecycle after a skip-waiting request.
    Activated {
        /// The new lifecycle state.
        lifecycle: WorkerLifecycle,
    },
}

enum Command {
    Enqueue {
        item: QueuedRequest,
        reply: oneshot::Sender<OutboxResult<IdempotencyKey>>,
    },
    Status {
        tag: String,
        reply: oneshot::Sender<OutboxResult<QueueStatus>>,
    },
    SkipWaiting {
        reply: oneshot::Sender<WorkerLifecycle>,
    },
    Sync {
        event: SyncEvent,
        reply: oneshot::Sender<Option<FlushReport>>,
    },
    RegisterSync {
        tag: String,
    },
    Rearm {
        tag: String,
    },
}

/// Cloneable handle to a running worker.
#[derive(Debug, Clone)]
pub struct WorkerHandle {
    commands: mpsc::Sender<Command>,
    notifier: Notifier,
    lifecycle: watch::Receiver<WorkerLifecycle>,
    shutdown_tx: Arc<Mutex<Option<oneshot::Sender<()>>>>,
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Enqueue { .. } => "Enqueue",
            Self::Status { .. } => "Status",
            Self::SkipWaiting { .. } => "SkipWaiting",
            Self::Sync { .. } => "Sync",
            Self::RegisterSync { .. } => "RegisterSync",
            Self::Rearm { .. } => "Rearm",
        };
        f.write_str(name)
    }
}

impl WorkerHandle {
    async fn call<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> WorkerResult<T> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(make(reply))
            .await
            .map_err(|_| WorkerError::Stopped)?;
        rx.await.map_err(|_| WorkerError::Stopped)
    }

    /// Handle a wire message from a page.
    ///
    /// # Errors
    ///
    /// Returns [`WorkerError::Stopped`] if the worker is gone, or the
    /// storage/request error of a failed enqueue.
    pub async fn post(&self, message: ClientMessage) -> WorkerResult<WorkerReply> {
        metrics::record_message(message.kind());
        match message {
            ClientMessage::QueueRequest(request) => {
                let item = request
                    .into_queued(current_timestamp_ms())
                    .map_err(OutboxError::from)?;
                let key = self.enqueue_item(item).await?;
                Ok(WorkerReply::Queued { key })
            }
            ClientMessage::SkipWaiting => {
                let lifecycle = self.skip_waiting().await?;
                Ok(WorkerReply::Activated { lifecycle })
            }
            ClientMessage::GetQueueStatus { tag } => {
                let status = self.status(tag.as_deref()).await?;
                Ok(WorkerReply::QueueStatus(status))
            }
        }
    }

    /// Durably queue `request` in lane `tag`; resolves once storage answers.
    ///
    /// # Errors
    ///
    /// Returns the storage or request error, or [`WorkerError::Stopped`].
    pub async fn enqueue(&self, request: MutatingRequest, tag: &str) -> WorkerResult<IdempotencyKey> {
        let item = request
            .into_queued(tag, current_timestamp_ms())
            .map_err(OutboxError::from)?;
        self.enqueue_item(item).await
    }

    async fn enqueue_item(&self, item: QueuedRequest) -> WorkerResult<IdempotencyKey> {
        let result = self.call(|reply| Command::Enqueue { item, reply }).await?;
        Ok(result?)
    }

    /// Snapshot lane `tag` (the order lane if `None`).
    ///
    /// # Errors
    ///
    /// Returns the storage error, or [`WorkerError::Stopped`].
    pub async fn status(&self, tag: Option<&str>) -> WorkerResult<QueueStatus> {
        let tag = tag.unwrap_or(DEFAULT_SYNC_TAG).to_string();
        let result = self.call(|reply| Command::Status { tag, reply }).await?;
        Ok(result?)
    }

    /// Activate a waiting worker.
    ///
    /// # Errors
    ///
    /// Returns [`WorkerError::Stopped`] if the worker is gone.
    pub async fn skip_waiting(&self) -> WorkerResult<WorkerLifecycle> {
        self.call(|reply| Command::SkipWaiting { reply }).await
    }

    /// Deliver a platform sync event and wait for the resulting flush.
    ///
    /// Resolves to `None` when no flush ran: the tag is unknown, the worker
    /// is still waiting, or a running flush absorbed the trigger.
    ///
    /// # Errors
    ///
    /// Returns [`WorkerError::Stopped`] if the worker is gone.
    pub async fn sync(&self, event: SyncEvent) -> WorkerResult<Option<FlushReport>> {
        self.call(|reply| Command::Sync { event, reply }).await
    }

    /// Register a background-sync intent for `tag`.
    ///
    /// # Errors
    ///
    /// Returns [`WorkerError::Stopped`] if the worker is gone.
    pub async fn register_sync(&self, tag: &str) -> WorkerResult<()> {
        self.commands
            .send(Command::RegisterSync {
                tag: tag.to_string(),
            })
            .await
            .map_err(|_| WorkerError::Stopped)
    }

    /// Subscribe to worker notifications.
    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<Notification> {
        self.notifier.subscribe()
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn lifecycle(&self) -> WorkerLifecycle {
        *self.lifecycle.borrow()
    }

    /// Whether the worker loop is still running.
    #[must_use]
    pub fn is_running(&self) -> bool {
        !self.commands.is_closed()
    }

    /// Ask the worker loop to stop. Flushes already in flight finish.
    pub fn shutdown(&self) {
        let tx = self
            .shutdown_tx
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
        if let Some(tx) = tx {
            let _ = tx.send(());
        }
    }

    /// Wait until the worker loop has exited.
    pub async fn stopped(&self) {
        self.commands.closed().await;
    }
}

/// Retry state of a lane whose last flush stopped short.
#[derive(Debug, Default)]
struct LaneBackoff {
    attempt: u32,
    armed: bool,
}

type Backoffs = Arc<Mutex<HashMap<String, LaneBackoff>>>;

fn lock_backoffs(backoffs: &Backoffs) -> std::sync::MutexGuard<'_, HashMap<String, LaneBackoff>> {
    backoffs
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner)
}

/// The worker context. Construct and start it with [`Worker::spawn`].
pub struct Worker {
    store: Arc<dyn QueueStore>,
    flusher: Arc<FlushController>,
    notifier: Notifier,
    connectivity: ConnectivityMonitor,
    tags: Vec<String>,
    intents: Arc<Mutex<BTreeSet<String>>>,
    lifecycle: watch::Sender<WorkerLifecycle>,
    retry: RetryConfig,
    backoffs: Backoffs,
    commands: mpsc::WeakSender<Command>,
}

impl Worker {
    /// Start a worker over `store` and return its handle.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(
        config: &OutboxConfig,
        store: Arc<dyn QueueStore>,
        transport: Arc<dyn Transport>,
        connectivity: ConnectivityMonitor,
    ) -> WorkerHandle {
        let notifier = Notifier::new(config.broadcast_capacity);
        let flusher = Arc::new(FlushController::new(
            Arc::clone(&store),
            transport,
            notifier.clone(),
            config.retention,
        ));
        let (lifecycle, lifecycle_rx) = watch::channel(WorkerLifecycle::Waiting);
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_BUFFER);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        let worker = Self {
            store,
            flusher,
            notifier: notifier.clone(),
            connectivity,
            tags: config.tags.clone(),
            intents: Arc::new(Mutex::new(BTreeSet::new())),
            lifecycle,
            retry: config.retry.clone(),
            backoffs: Arc::new(Mutex::new(HashMap::new())),
            commands: commands_tx.downgrade(),
        };
        let mut connectivity = worker.connectivity.subscribe();
        let was_online = connectivity.borrow_and_update().is_online();
        tokio::spawn(worker.run(
            commands_rx,
            shutdown_rx,
            (connectivity, was_online),
            config.activate_immediately,
        ));

        WorkerHandle {
            commands: commands_tx,
            notifier,
            lifecycle: lifecycle_rx,
            shutdown_tx: Arc::new(Mutex::new(Some(shutdown_tx))),
        }
    }

    async fn run(
        self,
        mut commands: mpsc::Receiver<Command>,
        mut shutdown_rx: oneshot::Receiver<()>,
        (mut connectivity, mut was_online): (watch::Receiver<ConnectionStatus>, bool),
        activate: bool,
    ) {
        tracing::info!(tags = ?self.tags, "Outbox worker started");
        if activate {
            self.activate();
        }

        let mut watching = true;

        loop {
            tokio::select! {
                _ = &mut shutdown_rx => {
                    tracing::info!("Outbox worker received shutdown signal");
                    break;
                }

                command = commands.recv() => {
                    let Some(command) = command else {
                        tracing::info!("Outbox worker: all handles dropped");
                        break;
                    };
                    self.handle(command);
                }

                changed = connectivity.changed(), if watching => {
                    if changed.is_err() {
                        watching = false;
                        continue;
                    }
                    let online = connectivity.borrow_and_update().is_online();
                    if online && !was_online {
                        self.fire_sync_intents();
                    }
                    was_online = online;
                }
            }
        }
    }

    fn handle(&self, command: Command) {
        match command {
            Command::Enqueue { item, reply } => {
                let tag = item.tag.clone();
                let result = self.persist(item);
                let queued = result.is_ok();
                let _ = reply.send(result);
                if queued && self.is_active() && self.connectivity.current().is_online() {
                    self.schedule_flush(tag, None);
                }
            }
            Command::Status { tag, reply } => {
                let _ = reply.send(self.status(&tag));
            }
            Command::SkipWaiting { reply } => {
                let _ = reply.send(self.activate());
            }
            Command::Sync { event, reply } => self.on_sync(event, reply),
            Command::RegisterSync { tag } => self.register(&tag),
            Command::Rearm { tag } => self.on_rearm(tag),
        }
    }

    fn is_active(&self) -> bool {
        *self.lifecycle.borrow() == WorkerLifecycle::Active
    }

    fn lock_intents(&self) -> std::sync::MutexGuard<'_, BTreeSet<String>> {
        self.intents
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn register(&self, tag: &str) {
        if self.lock_intents().insert(tag.to_string()) {
            tracing::debug!(tag, "Sync intent registered");
        }
    }

    fn is_known(&self, tag: &str) -> bool {
        self.tags.iter().any(|t| t == tag) || self.lock_intents().contains(tag)
    }

    /// Move to `Active`; on the first activation, resume any leftover queue.
    fn activate(&self) -> WorkerLifecycle {
        let next = self.lifecycle.borrow().skip_waiting();
        let previous = self.lifecycle.send_replace(next);
        if previous == WorkerLifecycle::Waiting {
            self.resume_pending();
        }
        next
    }

    fn resume_pending(&self) {
        let items = match self.store.list_all() {
            Ok(items) => items,
            Err(e) => {
                tracing::error!("Could not read queue on activation: {e}");
                return;
            }
        };
        if items.is_empty() {
            return;
        }
        let tags: BTreeSet<String> = items.iter().map(|item| item.tag.clone()).collect();
        tracing::info!(pending = items.len(), ?tags, "Resuming queued requests");
        let online = self.connectivity.current().is_online();
        for tag in tags {
            self.register(&tag);
            if online {
                self.schedule_flush(tag, None);
            }
        }
    }

    fn persist(&self, item: QueuedRequest) -> OutboxResult<IdempotencyKey> {
        let key = item.key.clone();
        let lane = item.tag.clone();
        let tag = lane.as_str();
        match self.store.enqueue(item) {
            Ok(()) => {
                tracing::info!(key = %key, tag, "Request queued");
                metrics::record_enqueued("worker");
            }
            Err(StoreError::Duplicate(_)) => {
                tracing::debug!(key = %key, tag, "Request already queued");
            }
            Err(e) => {
                tracing::warn!(key = %key, tag, "Failed to queue request: {e}");
                return Err(OutboxError::from(e));
            }
        }
        self.register(tag);
        match self.status(tag) {
            Ok(status) => {
                metrics::set_queue_depth(tag, status.pending);
                self.notifier.notify(Notification::QueueStatus(status));
            }
            Err(e) => tracing::warn!(tag, "Could not snapshot queue after enqueue: {e}"),
        }
        Ok(key)
    }

    fn status(&self, tag: &str) -> OutboxResult<QueueStatus> {
        let items = self.store.list_all()?;
        Ok(QueueStatus::from_items(tag, &items))
    }

    fn on_sync(&self, event: SyncEvent, reply: oneshot::Sender<Option<FlushReport>>) {
        if !self.is_known(&event.tag) {
            tracing::warn!(tag = %event.tag, "Ignoring sync event for unknown tag");
            let _ = reply.send(None);
            return;
        }
        if !self.is_active() {
            tracing::debug!(tag = %event.tag, "Sync event deferred until activation");
            self.register(&event.tag);
            let _ = reply.send(None);
            return;
        }
        self.schedule_flush(event.tag, Some(reply));
    }

    fn fire_sync_intents(&self) {
        if !self.is_active() {
            return;
        }
        let tags: Vec<String> = self.lock_intents().iter().cloned().collect();
        tracing::info!(?tags, "Connectivity restored, firing sync intents");
        for tag in tags {
            self.schedule_flush(tag, None);
        }
    }

    /// A backoff timer fired for `tag`.
    fn on_rearm(&self, tag: String) {
        match lock_backoffs(&self.backoffs).get_mut(&tag) {
            Some(lane) => lane.armed = false,
            // Drained by another trigger while the timer ran
            None => return,
        }
        if !self.is_active() || !self.connectivity.current().is_online() {
            tracing::debug!(tag = %tag, "Backoff elapsed while offline, waiting for reconnect");
            return;
        }
        tracing::debug!(tag = %tag, "Backoff elapsed, retrying flush");
        self.schedule_flush(tag, None);
    }

    fn schedule_flush(&self, tag: String, reply: Option<oneshot::Sender<Option<FlushReport>>>) {
        let flusher = Arc::clone(&self.flusher);
        let intents = Arc::clone(&self.intents);
        let store = Arc::clone(&self.store);
        let backoffs = Arc::clone(&self.backoffs);
        let retry = self.retry.clone();
        let commands = self.commands.clone();
        tokio::spawn(async move {
            let report = flusher.flush(&tag).await;
            let rearm = match &report {
                Some(report) if report.is_drained() => {
                    lock_backoffs(&backoffs).remove(&tag);
                    let mut intents = intents
                        .lock()
                        .unwrap_or_else(std::sync::PoisonError::into_inner);
                    let lane_empty = store
                        .list_all()
                        .is_ok_and(|items| items.iter().all(|item| item.tag != tag));
                    if lane_empty && intents.remove(&tag) {
                        tracing::debug!(tag = %tag, "Lane drained, sync intent released");
                    }
                    None
                }
                Some(_) => {
                    let mut backoffs = lock_backoffs(&backoffs);
                    let lane = backoffs.entry(tag.clone()).or_default();
                    if lane.armed {
                        None
                    } else {
                        lane.armed = true;
                        let delay = retry.delay_for_attempt(lane.attempt);
                        lane.attempt = lane.attempt.saturating_add(1);
                        Some(delay)
                    }
                }
                None => None,
            };
            if let Some(reply) = reply {
                let _ = reply.send(report);
            }

            let Some(delay) = rearm else {
                return;
            };
            tracing::debug!(tag = %tag, ?delay, "Flush stopped short, re-arming lane");
            tokio::time::sleep(delay).await;
            if let Some(commands) = commands.upgrade() {
                let _ = commands.send(Command::Rearm { tag }).await;
            }
        });
    }
}
