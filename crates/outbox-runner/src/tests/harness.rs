//! Test harness for outbox runner integration tests.
//!
//! Provides:
//! - MockSource: an in-memory change log that opens feeds and acts as the
//!   connection
//! - RecordingPublisher: a publisher with scripted failures, panics and delays
//! - FlakyCheckpointStore: a memory store with scripted failures
//! - EventRecorder: captures every runner event in emission order
//! - TestHarness: wires all of the above into a runner

use crate::checkpoint::{CheckpointStore, MemoryCheckpointStore};
use crate::config::RunnerConfig;
use crate::error::BoxError;
use crate::event::{ChangeEvent, CheckpointToken, FeedFilter, FeedOptions, Namespace};
use crate::events::{EventKind, RunnerEvent};
use crate::publisher::Publisher;
use crate::runner::OutboxRunner;
use crate::source::{ChangeFeed, ChangeFeedSource, Connection, ConnectionSignal};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, Notify};

/// Backoff used by harness runners.
pub const TEST_RESTART_DELAY: Duration = Duration::from_millis(20);

/// Namespace every harness event belongs to.
pub fn outbox_ns() -> Namespace {
    Namespace {
        db: "shop".to_string(),
        coll: "outbox".to_string(),
    }
}

/// An outbox document with the given event name.
pub fn doc(event: &str) -> Value {
    json!({ "event": event, "payload": { "source": "test" } })
}

/// Poll `check` until it holds, panicking after a few seconds.
pub async fn eventually<F: FnMut() -> bool>(what: &str, mut check: F) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !check() {
        if Instant::now() > deadline {
            panic!("timed out waiting for {}", what);
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Tokens as plain strings, for terse assertions.
pub fn positions(tokens: &[CheckpointToken]) -> Vec<String> {
    tokens.iter().map(|t| t.to_string()).collect()
}

#[derive(Debug, Clone)]
enum Interrupt {
    Fail(String),
    End,
}

#[derive(Default)]
struct SourceState {
    log: Vec<ChangeEvent<Value>>,
    opened: Vec<(FeedFilter, FeedOptions)>,
    open_failures: usize,
    current_feed: u64,
    interrupt: Option<(u64, Interrupt)>,
    closed_feeds: usize,
    connection_closes: usize,
    close_error: Option<String>,
    served: usize,
}

struct SourceShared {
    state: Mutex<SourceState>,
    wake: Notify,
    signals: broadcast::Sender<ConnectionSignal>,
}

/// In-memory change log. Opens feeds over the log and doubles as the
/// connection they run on.
pub struct MockSource {
    shared: Arc<SourceShared>,
}

impl MockSource {
    pub fn new() -> Self {
        let (signals, _) = broadcast::channel(64);
        Self {
            shared: Arc::new(SourceShared {
                state: Mutex::new(SourceState::default()),
                wake: Notify::new(),
                signals,
            }),
        }
    }

    /// Append an insert of `document`; returns its position.
    pub fn append(&self, document: Value) -> CheckpointToken {
        let mut state = self.shared.state.lock();
        let id = CheckpointToken::from(format!("{}-0", state.log.len() + 1));
        state
            .log
            .push(ChangeEvent::insert(id.clone(), outbox_ns(), document));
        drop(state);
        self.shared.wake.notify_waiters();
        id
    }

    /// Append several inserts; returns their positions.
    pub fn append_all(&self, events: &[&str]) -> Vec<CheckpointToken> {
        events.iter().map(|e| self.append(doc(e))).collect()
    }

    /// Append an arbitrary event (non-inserts, other namespaces).
    pub fn append_event(&self, mut event: ChangeEvent<Value>) -> CheckpointToken {
        let mut state = self.shared.state.lock();
        let id = CheckpointToken::from(format!("{}-0", state.log.len() + 1));
        event.id = id.clone();
        state.log.push(event);
        drop(state);
        self.shared.wake.notify_waiters();
        id
    }

    /// Make the next `count` opens fail.
    pub fn fail_next_opens(&self, count: usize) {
        self.shared.state.lock().open_failures = count;
    }

    /// Make the currently open feed report a terminal error.
    pub fn fail_current_feed(&self, message: &str) {
        self.interrupt(Interrupt::Fail(message.to_string()));
    }

    /// Make the currently open feed end cleanly.
    pub fn end_current_feed(&self) {
        self.interrupt(Interrupt::End);
    }

    /// Make `Connection::close` report `message`.
    pub fn fail_close(&self, message: &str) {
        self.shared.state.lock().close_error = Some(message.to_string());
    }

    /// Broadcast a connection signal.
    pub fn signal(&self, signal: ConnectionSignal) {
        let _ = self.shared.signals.send(signal);
    }

    /// Every open request, in order, including refused ones.
    pub fn opened(&self) -> Vec<(FeedFilter, FeedOptions)> {
        self.shared.state.lock().opened.clone()
    }

    pub fn open_count(&self) -> usize {
        self.shared.state.lock().opened.len()
    }

    /// Events handed out by feeds, across all opens.
    pub fn served(&self) -> usize {
        self.shared.state.lock().served
    }

    pub fn closed_feeds(&self) -> usize {
        self.shared.state.lock().closed_feeds
    }

    pub fn connection_closes(&self) -> usize {
        self.shared.state.lock().connection_closes
    }

    fn interrupt(&self, how: Interrupt) {
        let mut state = self.shared.state.lock();
        let feed = state.current_feed;
        state.interrupt = Some((feed, how));
        drop(state);
        self.shared.wake.notify_waiters();
    }
}

#[async_trait]
impl ChangeFeedSource<Value> for MockSource {
    async fn open(
        &self,
        filter: &FeedFilter,
        options: &FeedOptions,
    ) -> Result<Box<dyn ChangeFeed<Value>>, BoxError> {
        let mut state = self.shared.state.lock();
        state.opened.push((filter.clone(), options.clone()));

        if state.open_failures > 0 {
            state.open_failures -= 1;
            return Err("feed open refused".into());
        }

        let cursor = match options.resume_position() {
            None => 0,
            Some(token) => match state.log.iter().position(|e| &e.id == token) {
                Some(index) => index + 1,
                None => return Err(format!("unknown resume token {}", token).into()),
            },
        };

        state.current_feed += 1;
        Ok(Box::new(MockFeed {
            shared: self.shared.clone(),
            id: state.current_feed,
            cursor,
            filter: filter.clone(),
        }))
    }
}

#[async_trait]
impl Connection for MockSource {
    fn subscribe(&self) -> broadcast::Receiver<ConnectionSignal> {
        self.shared.signals.subscribe()
    }

    async fn close(&self, _force: bool) -> Result<(), BoxError> {
        let close_error = {
            let mut state = self.shared.state.lock();
            state.connection_closes += 1;
            state.close_error.clone()
        };
        let _ = self.shared.signals.send(ConnectionSignal::Closed);

        match close_error {
            Some(message) => Err(message.into()),
            None => Ok(()),
        }
    }
}

struct MockFeed {
    shared: Arc<SourceShared>,
    id: u64,
    cursor: usize,
    filter: FeedFilter,
}

#[async_trait]
impl ChangeFeed<Value> for MockFeed {
    async fn next(&mut self) -> Result<Option<ChangeEvent<Value>>, BoxError> {
        loop {
            let notified = self.shared.wake.notified();
            {
                let mut state = self.shared.state.lock();

                if matches!(&state.interrupt, Some((feed, _)) if *feed == self.id) {
                    if let Some((_, how)) = state.interrupt.take() {
                        return match how {
                            Interrupt::Fail(message) => Err(message.into()),
                            Interrupt::End => Ok(None),
                        };
                    }
                }

                while self.cursor < state.log.len() {
                    let event = state.log[self.cursor].clone();
                    self.cursor += 1;
                    let projection = serde_json::to_value(&event)?;
                    if self.filter.matches(&projection) {
                        state.served += 1;
                        return Ok(Some(event));
                    }
                }
            }
            notified.await;
        }
    }

    async fn close(&mut self) -> Result<(), BoxError> {
        self.shared.state.lock().closed_feeds += 1;
        Ok(())
    }
}

/// Publisher that records every attempt.
#[derive(Default)]
pub struct RecordingPublisher {
    attempts: Mutex<Vec<CheckpointToken>>,
    delivered: Mutex<Vec<CheckpointToken>>,
    failures: Mutex<HashMap<String, usize>>,
    panics: Mutex<HashMap<String, usize>>,
    delay: Mutex<Duration>,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl RecordingPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject the event at `position` the next `times` times.
    pub fn fail_at(&self, position: &CheckpointToken, times: usize) {
        self.failures.lock().insert(position.to_string(), times);
    }

    /// Panic while publishing `position` the next `times` times.
    pub fn panic_at(&self, position: &CheckpointToken, times: usize) {
        self.panics.lock().insert(position.to_string(), times);
    }

    /// Make every publish take `delay`.
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = delay;
    }

    /// Every publish attempt, failed ones included.
    pub fn attempts(&self) -> Vec<CheckpointToken> {
        self.attempts.lock().clone()
    }

    /// Successfully published positions.
    pub fn delivered(&self) -> Vec<CheckpointToken> {
        self.delivered.lock().clone()
    }

    pub fn delivered_count(&self) -> usize {
        self.delivered.lock().len()
    }

    /// Highest number of concurrent publishes observed.
    pub fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Publisher<Value> for RecordingPublisher {
    async fn publish(&self, event: &ChangeEvent<Value>) -> Result<(), BoxError> {
        self.attempts.lock().push(event.id.clone());

        let key = event.id.to_string();
        let crash = match self.panics.lock().get_mut(&key) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                true
            }
            _ => false,
        };
        if crash {
            panic!("publisher crashed on {}", key);
        }

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        let delay = *self.delay.lock();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        } else {
            tokio::task::yield_now().await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        {
            let mut failures = self.failures.lock();
            if let Some(remaining) = failures.get_mut(&key) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(format!("publish rejected for {}", key).into());
                }
            }
        }

        self.delivered.lock().push(event.id.clone());
        Ok(())
    }
}

/// Memory checkpoint store with scripted failures.
#[derive(Default)]
pub struct FlakyCheckpointStore {
    inner: MemoryCheckpointStore,
    get_failures: AtomicUsize,
    set_failures: Mutex<HashMap<String, usize>>,
    history: Mutex<Vec<CheckpointToken>>,
    gets: AtomicUsize,
}

impl FlakyCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_token(token: CheckpointToken) -> Self {
        Self {
            inner: MemoryCheckpointStore::with_token(token),
            ..Default::default()
        }
    }

    /// Make the next `count` reads fail.
    pub fn fail_next_gets(&self, count: usize) {
        self.get_failures.store(count, Ordering::SeqCst);
    }

    /// Make persisting `position` fail the next `times` times.
    pub fn fail_set_at(&self, position: &CheckpointToken, times: usize) {
        self.set_failures.lock().insert(position.to_string(), times);
    }

    /// Current persisted token.
    pub fn current(&self) -> Option<CheckpointToken> {
        self.inner.current()
    }

    /// Every successfully persisted token, in order.
    pub fn history(&self) -> Vec<CheckpointToken> {
        self.history.lock().clone()
    }

    pub fn get_count(&self) -> usize {
        self.gets.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CheckpointStore for FlakyCheckpointStore {
    async fn get(&self) -> Result<Option<CheckpointToken>, BoxError> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .get_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err("checkpoint storage unavailable".into());
        }
        self.inner.get().await
    }

    async fn set(&self, token: &CheckpointToken) -> Result<(), BoxError> {
        let key = token.to_string();
        {
            let mut failures = self.set_failures.lock();
            if let Some(remaining) = failures.get_mut(&key) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(format!("checkpoint write failed for {}", key).into());
                }
            }
        }

        self.inner.set(token).await?;
        self.history.lock().push(token.clone());
        Ok(())
    }
}

/// A runner event reduced to comparable data.
#[derive(Debug, Clone, PartialEq)]
pub enum Recorded {
    Connected,
    Close,
    Error(String),
    Running(FeedFilter, FeedOptions),
    Restarting,
    Change(String),
    Committed(String),
}

impl Recorded {
    pub fn kind(&self) -> EventKind {
        match self {
            Recorded::Connected => EventKind::Connected,
            Recorded::Close => EventKind::Close,
            Recorded::Error(_) => EventKind::Error,
            Recorded::Running(..) => EventKind::Running,
            Recorded::Restarting => EventKind::Restarting,
            Recorded::Change(_) => EventKind::Change,
            Recorded::Committed(_) => EventKind::Committed,
        }
    }
}

/// Captures every event a runner emits.
#[derive(Clone, Default)]
pub struct EventRecorder {
    events: Arc<Mutex<Vec<Recorded>>>,
}

impl EventRecorder {
    /// Subscribe to every event kind of `runner`.
    pub fn attach(runner: &OutboxRunner<Value>) -> Self {
        let recorder = Self::default();
        for kind in EventKind::ALL {
            let events = recorder.events.clone();
            runner.on(kind, move |event| {
                let recorded = match event {
                    RunnerEvent::Connected => Recorded::Connected,
                    RunnerEvent::Close => Recorded::Close,
                    RunnerEvent::Error(err) => Recorded::Error(err.to_string()),
                    RunnerEvent::Running { filter, options } => {
                        Recorded::Running(filter.clone(), options.clone())
                    }
                    RunnerEvent::Restarting => Recorded::Restarting,
                    RunnerEvent::Change(change) => Recorded::Change(change.id.to_string()),
                    RunnerEvent::Committed(token) => Recorded::Committed(token.to_string()),
                };
                events.lock().push(recorded);
            });
        }
        recorder
    }

    pub fn all(&self) -> Vec<Recorded> {
        self.events.lock().clone()
    }

    /// Events of one kind, in order.
    pub fn of(&self, kind: EventKind) -> Vec<Recorded> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.kind() == kind)
            .cloned()
            .collect()
    }

    pub fn count(&self, kind: EventKind) -> usize {
        self.events.lock().iter().filter(|e| e.kind() == kind).count()
    }

    /// Positions announced by `committed`, in order.
    pub fn committed(&self) -> Vec<String> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                Recorded::Committed(position) => Some(position.clone()),
                _ => None,
            })
            .collect()
    }

    /// Error messages, in order.
    pub fn errors(&self) -> Vec<String> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                Recorded::Error(message) => Some(message.clone()),
                _ => None,
            })
            .collect()
    }

    /// Options of every `running` event, in order.
    pub fn running_options(&self) -> Vec<FeedOptions> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                Recorded::Running(_, options) => Some(options.clone()),
                _ => None,
            })
            .collect()
    }
}

/// A runner wired to mock collaborators.
pub struct TestHarness {
    pub source: Arc<MockSource>,
    pub publisher: Arc<RecordingPublisher>,
    pub checkpoints: Arc<FlakyCheckpointStore>,
    pub runner: OutboxRunner<Value>,
    pub recorder: EventRecorder,
}

impl TestHarness {
    /// Harness with an empty checkpoint store and the test backoff.
    pub fn new() -> Self {
        Self::build(FlakyCheckpointStore::new(), |config| config)
    }

    /// Harness whose store already holds `token`.
    pub fn with_checkpoint(token: CheckpointToken) -> Self {
        Self::build(FlakyCheckpointStore::with_token(token), |config| config)
    }

    /// Harness with a customized configuration.
    pub fn build<F>(checkpoints: FlakyCheckpointStore, configure: F) -> Self
    where
        F: FnOnce(RunnerConfig<Value>) -> RunnerConfig<Value>,
    {
        let source = Arc::new(MockSource::new());
        let publisher = Arc::new(RecordingPublisher::new());
        let checkpoints = Arc::new(checkpoints);

        let config = RunnerConfig::new(
            source.clone(),
            source.clone(),
            checkpoints.clone(),
            publisher.clone(),
        )
        .with_restart_delay(TEST_RESTART_DELAY);

        let runner = OutboxRunner::new(configure(config));
        let recorder = EventRecorder::attach(&runner);

        Self {
            source,
            publisher,
            checkpoints,
            runner,
            recorder,
        }
    }

    /// Start the runner and wait for the first feed to open.
    pub async fn start(&self) {
        self.runner.start().expect("runner should start");
        eventually("first running event", || {
            self.recorder.count(EventKind::Running) >= 1
        })
        .await;
    }

    /// Wait until `count` positions were committed in total.
    pub async fn wait_committed(&self, count: usize) {
        eventually("committed events", || {
            self.recorder.count(EventKind::Committed) >= count
        })
        .await;
    }

    /// Wait until `count` feeds were announced as running.
    pub async fn wait_running(&self, count: usize) {
        eventually("running events", || {
            self.recorder.count(EventKind::Running) >= count
        })
        .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_feed_resumes_after_token() {
        let source = MockSource::new();
        let ids = source.append_all(&["a", "b", "c"]);

        let filter = FeedFilter::insert_only(Default::default());
        let options = FeedOptions::resume_from(Some(ids[0].clone()));
        let mut feed = source.open(&filter, &options).await.unwrap();

        let next = feed.next().await.unwrap().unwrap();
        assert_eq!(next.id, ids[1]);
    }

    #[tokio::test]
    async fn test_mock_feed_waits_for_appends() {
        let source = Arc::new(MockSource::new());
        let filter = FeedFilter::insert_only(Default::default());
        let mut feed = source
            .open(&filter, &FeedOptions::default())
            .await
            .unwrap();

        let writer = source.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            writer.append(doc("late"));
        });

        let event = tokio::time::timeout(Duration::from_secs(1), feed.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(event.full_document["event"], json!("late"));
    }

    #[tokio::test]
    async fn test_recording_publisher_scripted_failure() {
        let publisher = RecordingPublisher::new();
        let event = ChangeEvent::insert("1-0", outbox_ns(), doc("a"));
        publisher.fail_at(&event.id, 1);

        assert!(publisher.publish(&event).await.is_err());
        assert!(publisher.publish(&event).await.is_ok());
        assert_eq!(publisher.attempts().len(), 2);
        assert_eq!(positions(&publisher.delivered()), vec!["1-0"]);
    }
}
