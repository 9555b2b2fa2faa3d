//! Outbox runner: lifecycle state machine.
//!
//! The runner owns one supervisor task that drives an explicit loop of feed
//! attempts:
//!
//! ```text
//! read checkpoint -> open feed -> running -> pump events into the queue
//!        ^                                        |
//!        |___ backoff <- restarting <- close <-___| (delivery failure,
//!                                                   feed error, feed end)
//! ```
//!
//! Each event becomes one delivery unit (announce `change`, publish, persist
//! the position, announce `committed`) executed by the [`DeliveryQueue`], so
//! checkpoints are persisted strictly in feed order. A failure discards every
//! unit that has not started and reopens the feed from the last persisted
//! checkpoint, which gives at-least-once delivery.

use crate::config::RunnerConfig;
use crate::error::{OutboxError, OutboxResult};
use crate::event::{ChangeEvent, CheckpointToken, FeedFilter, FeedOptions};
use crate::events::{EventBus, EventKind, RunnerEvent};
use crate::queue::{DeliveryQueue, DeliveryUnit};
use crate::source::{ChangeFeed, ConnectionSignal};
use crate::state::{ConnectionStatus, FeedStatus, Health};
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use tokio::sync::broadcast::error::{RecvError, TryRecvError};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Why an attempt ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AttemptOutcome {
    /// `stop()` was called; do not restart.
    Stopped,
    /// Tear down and try again after the backoff.
    Restart(&'static str),
}

struct Shared<T> {
    config: RunnerConfig<T>,
    events: EventBus<T>,
    health: RwLock<Health>,
    queue: DeliveryQueue<OutboxError>,
    shutdown: watch::Sender<bool>,
}

#[derive(Default)]
struct Tasks {
    supervisor: Option<JoinHandle<()>>,
    watcher: Option<(JoinHandle<()>, oneshot::Sender<()>)>,
    stopped: bool,
}

/// Tails a change feed and relays every insert, in order, to a publisher.
pub struct OutboxRunner<T> {
    shared: Arc<Shared<T>>,
    tasks: Mutex<Tasks>,
}

impl<T: Send + Sync + 'static> OutboxRunner<T> {
    /// Create a runner. Nothing happens until [`start`](Self::start).
    pub fn new(config: RunnerConfig<T>) -> Self {
        let (shutdown, _) = watch::channel(false);

        Self {
            shared: Arc::new(Shared {
                config,
                events: EventBus::new(),
                health: RwLock::new(Health::default()),
                queue: DeliveryQueue::new(),
                shutdown,
            }),
            tasks: Mutex::new(Tasks::default()),
        }
    }

    /// Subscribe `handler` to events of `kind`.
    pub fn on<F>(&self, kind: EventKind, handler: F) -> &Self
    where
        F: Fn(&RunnerEvent<T>) + Send + Sync + 'static,
    {
        self.shared.events.on(kind, handler);
        self
    }

    /// Subscribe to `change`: an event is about to be published.
    pub fn on_change<F>(&self, handler: F) -> &Self
    where
        F: Fn(&ChangeEvent<T>) + Send + Sync + 'static,
    {
        self.on(EventKind::Change, move |event| {
            if let RunnerEvent::Change(change) = event {
                handler(change);
            }
        })
    }

    /// Subscribe to `committed`: a position was persisted.
    pub fn on_committed<F>(&self, handler: F) -> &Self
    where
        F: Fn(&CheckpointToken) + Send + Sync + 'static,
    {
        self.on(EventKind::Committed, move |event| {
            if let RunnerEvent::Committed(token) = event {
                handler(token);
            }
        })
    }

    /// Subscribe to `error`.
    pub fn on_error<F>(&self, handler: F) -> &Self
    where
        F: Fn(&OutboxError) + Send + Sync + 'static,
    {
        self.on(EventKind::Error, move |event| {
            if let RunnerEvent::Error(err) = event {
                handler(err);
            }
        })
    }

    /// Subscribe to `running`: a feed was opened with this filter and options.
    pub fn on_running<F>(&self, handler: F) -> &Self
    where
        F: Fn(&FeedFilter, &FeedOptions) + Send + Sync + 'static,
    {
        self.on(EventKind::Running, move |event| {
            if let RunnerEvent::Running { filter, options } = event {
                handler(filter, options);
            }
        })
    }

    /// Current connection and feed status.
    pub fn health(&self) -> Health {
        *self.shared.health.read()
    }

    /// Start tailing the feed.
    ///
    /// Spawns the supervisor and returns immediately; failures from then on
    /// are reported through `error` / `restarting` events, never returned.
    /// Must be called from within a tokio runtime.
    pub fn start(&self) -> OutboxResult<()> {
        let mut tasks = self.tasks.lock();
        if tasks.stopped {
            return Err(OutboxError::Stopped);
        }
        if tasks.supervisor.is_some() {
            return Err(OutboxError::AlreadyStarted);
        }

        let signals = self.shared.config.connection.subscribe();
        let (exit_tx, exit_rx) = oneshot::channel();
        let watcher = tokio::spawn(watch_connection(self.shared.clone(), signals, exit_rx));
        let supervisor = tokio::spawn(supervise(self.shared.clone()));

        tasks.watcher = Some((watcher, exit_tx));
        tasks.supervisor = Some(supervisor);

        info!(
            restart_delay_ms = self.shared.config.restart_delay.as_millis() as u64,
            read_ahead = self.shared.config.read_ahead,
            "Outbox runner started"
        );
        Ok(())
    }

    /// Stop the runner for good.
    ///
    /// Restarts are disarmed before the connection is forcibly closed, so no
    /// `running` or `restarting` event is emitted once this returns. A
    /// delivery already in flight is not aborted; units not yet started are
    /// discarded. Returns the outcome of closing the connection.
    pub async fn stop(&self) -> OutboxResult<()> {
        let (supervisor, watcher) = {
            let mut tasks = self.tasks.lock();
            if tasks.stopped {
                return Ok(());
            }
            tasks.stopped = true;
            (tasks.supervisor.take(), tasks.watcher.take())
        };

        info!("Stopping outbox runner");
        self.shared.shutdown.send_replace(true);

        let closed = self.shared.config.connection.close(true).await;

        if let Some(handle) = supervisor {
            if let Err(e) = handle.await {
                error!(error = %e, "Outbox supervisor task failed");
            }
        }

        if let Some((handle, exit)) = watcher {
            let _ = exit.send(());
            if let Err(e) = handle.await {
                error!(error = %e, "Connection watcher task failed");
            }
        }

        self.shared.queue.clear();
        {
            let mut health = self.shared.health.write();
            health.connection = ConnectionStatus::Closed;
            health.feed = FeedStatus::Closed;
        }

        closed.map_err(|e| OutboxError::Connection(e.to_string()))
    }
}

impl<T> Drop for OutboxRunner<T> {
    fn drop(&mut self) {
        self.shared.shutdown.send_replace(true);
        let mut tasks = self.tasks.lock();
        if let Some((handle, _)) = tasks.watcher.take() {
            handle.abort();
        }
    }
}

impl<T: Send + Sync + 'static> Shared<T> {
    fn set_feed(&self, status: FeedStatus) {
        self.health.write().feed = status;
    }

    fn set_connection(&self, status: ConnectionStatus) {
        self.health.write().connection = status;
    }

    fn emit_error(&self, err: OutboxError) {
        error!(error = %err, "Outbox runner error");
        self.events.emit(&RunnerEvent::Error(Arc::new(err)));
    }

    fn on_connection_signal(&self, signal: ConnectionSignal) {
        match signal {
            ConnectionSignal::Connecting => self.set_connection(ConnectionStatus::Connecting),
            ConnectionSignal::Connected => {
                self.set_connection(ConnectionStatus::Connected);
                info!("Connection ready");
                self.events.emit(&RunnerEvent::Connected);
            }
            ConnectionSignal::Closed => {
                self.set_connection(ConnectionStatus::Closed);
                info!("Connection closed");
                self.events.emit(&RunnerEvent::Close);
            }
            ConnectionSignal::Error(message) => {
                self.emit_error(OutboxError::Connection(message));
            }
        }
    }

    /// One feed attempt, from checkpoint read to teardown.
    async fn run_attempt(
        self: &Arc<Self>,
        attempt: u64,
        failure_tx: &mpsc::UnboundedSender<u64>,
        failure_rx: &mut mpsc::UnboundedReceiver<u64>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> AttemptOutcome {
        // The previous attempt's in-flight delivery must settle before the
        // checkpoint is read again.
        tokio::select! {
            biased;
            _ = stopped(shutdown) => return AttemptOutcome::Stopped,
            _ = self.queue.settled() => {}
        }
        self.queue.clear();
        while failure_rx.try_recv().is_ok() {}

        self.set_feed(FeedStatus::Connecting);

        let checkpoint = tokio::select! {
            biased;
            _ = stopped(shutdown) => return AttemptOutcome::Stopped,
            result = self.config.checkpoints.get() => match result {
                Ok(checkpoint) => checkpoint,
                Err(e) => {
                    self.emit_error(OutboxError::Checkpoint(e));
                    return AttemptOutcome::Restart("checkpoint read failed");
                }
            },
        };

        let filter = FeedFilter::insert_only(self.config.filter.clone());
        let options = self.config.feed_options_for(checkpoint);

        let mut feed = tokio::select! {
            biased;
            _ = stopped(shutdown) => return AttemptOutcome::Stopped,
            result = self.config.source.open(&filter, &options) => match result {
                Ok(feed) => feed,
                Err(e) => {
                    self.emit_error(OutboxError::Feed(e));
                    return AttemptOutcome::Restart("feed open failed");
                }
            },
        };

        info!(
            attempt = attempt,
            filter = %serde_json::to_string(&filter).unwrap_or_default(),
            options = %serde_json::to_string(&options).unwrap_or_default(),
            "Change feed running"
        );
        self.events.emit(&RunnerEvent::Running { filter, options });
        self.set_feed(FeedStatus::Running);

        let read_ahead = self.config.read_ahead;
        let reason = loop {
            let has_room = self.queue.pending_len() < read_ahead;

            tokio::select! {
                biased;
                _ = stopped(shutdown) => {
                    self.queue.clear();
                    close_feed(feed.as_mut()).await;
                    return AttemptOutcome::Stopped;
                }
                Some(failed) = failure_rx.recv() => {
                    if failed == attempt {
                        break "delivery failed";
                    }
                }
                _ = self.queue.has_room(read_ahead), if !has_room => {}
                next = feed.next(), if has_room => match next {
                    Ok(Some(event)) => {
                        debug!(attempt = attempt, position = %event.id, "Queued change");
                        self.queue
                            .push(self.delivery_unit(attempt, event, failure_tx.clone()));
                    }
                    Ok(None) => {
                        info!(attempt = attempt, "Change feed ended");
                        break "feed ended";
                    }
                    Err(e) => {
                        self.emit_error(OutboxError::Feed(e));
                        break "feed error";
                    }
                },
            }
        };

        let discarded = self.queue.pending_len();
        self.queue.clear();
        close_feed(feed.as_mut()).await;
        self.set_feed(FeedStatus::Closed);

        warn!(
            attempt = attempt,
            reason = reason,
            discarded = discarded,
            "Change feed attempt ended"
        );
        AttemptOutcome::Restart(reason)
    }

    /// Build the unit that delivers one event.
    fn delivery_unit(
        self: &Arc<Self>,
        attempt: u64,
        event: ChangeEvent<T>,
        failure_tx: mpsc::UnboundedSender<u64>,
    ) -> DeliveryUnit<OutboxError> {
        let event = Arc::new(event);
        let position = event.id.clone();
        let shared = self.clone();
        let on_error_shared = self.clone();

        DeliveryUnit::new(
            async move {
                shared.events.emit(&RunnerEvent::Change(event.clone()));

                shared
                    .config
                    .publisher
                    .publish(&event)
                    .await
                    .map_err(OutboxError::Publish)?;

                shared
                    .config
                    .checkpoints
                    .set(&event.id)
                    .await
                    .map_err(OutboxError::Checkpoint)?;

                debug!(position = %event.id, "Committed checkpoint");
                shared.events.emit(&RunnerEvent::Committed(event.id.clone()));
                Ok(())
            },
            move |err| {
                warn!(
                    attempt = attempt,
                    position = %position,
                    "Delivery failed; pending deliveries will be discarded"
                );
                on_error_shared.emit_error(err);
                let _ = failure_tx.send(attempt);
            },
        )
    }
}

/// Supervisor loop: one attempt after another until stopped.
async fn supervise<T: Send + Sync + 'static>(shared: Arc<Shared<T>>) {
    let mut shutdown = shared.shutdown.subscribe();
    let (failure_tx, mut failure_rx) = mpsc::unbounded_channel();
    let mut attempt: u64 = 0;

    loop {
        attempt += 1;
        let outcome = shared
            .run_attempt(attempt, &failure_tx, &mut failure_rx, &mut shutdown)
            .await;

        if outcome == AttemptOutcome::Stopped || *shutdown.borrow() {
            break;
        }

        shared.set_feed(FeedStatus::Restarting);
        info!(
            attempt = attempt,
            delay_ms = shared.config.restart_delay.as_millis() as u64,
            "Change feed restarting"
        );
        shared.events.emit(&RunnerEvent::Restarting);

        tokio::select! {
            biased;
            _ = stopped(&mut shutdown) => break,
            _ = tokio::time::sleep(shared.config.restart_delay) => {}
        }
    }

    shared.set_feed(FeedStatus::Closed);
    debug!(attempts = attempt, "Outbox supervisor stopped");
}

/// Relay connection signals into health and events.
async fn watch_connection<T: Send + Sync + 'static>(
    shared: Arc<Shared<T>>,
    mut signals: broadcast::Receiver<ConnectionSignal>,
    mut exit: oneshot::Receiver<()>,
) {
    loop {
        tokio::select! {
            biased;
            signal = signals.recv() => match signal {
                Ok(signal) => shared.on_connection_signal(signal),
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped = skipped, "Connection signals lagged");
                }
                Err(RecvError::Closed) => break,
            },
            _ = &mut exit => {
                // Deliver whatever the forced close already broadcast.
                loop {
                    match signals.try_recv() {
                        Ok(signal) => shared.on_connection_signal(signal),
                        Err(TryRecvError::Lagged(_)) => continue,
                        Err(_) => break,
                    }
                }
                break;
            }
        }
    }
}

async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    // An error means the sender is gone, which only happens on teardown.
    let _ = shutdown.wait_for(|stopped| *stopped).await;
}

async fn close_feed<T>(feed: &mut (dyn ChangeFeed<T> + '_)) {
    if let Err(e) = feed.close().await {
        debug!(error = %e, "Ignoring change feed close failure");
    }
}
