//! Redis Streams change feed.
//!
//! The outbox change feed is an append-only stream. Each entry is one change
//! event; its entry ID is the feed position and doubles as the checkpoint
//! token. Entry fields:
//!
//! | field           | meaning                                    |
//! |-----------------|--------------------------------------------|
//! | `operationType` | mutation kind, `insert` when absent        |
//! | `db`, `coll`    | namespace of the changed document          |
//! | `documentKey`   | JSON key of the changed document, optional |
//! | `fullDocument`  | JSON body of the changed document          |
//!
//! An `invalidate` entry ends every feed that reaches it.

use crate::error::{RelayError, RelayResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use outbox_runner::{
    BoxError, ChangeEvent, ChangeFeed, ChangeFeedSource, CheckpointToken, Connection,
    ConnectionSignal, FeedFilter, FeedOptions, Namespace, OperationType,
};
use redis::aio::MultiplexedConnection;
use redis::{Client, RedisResult};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::collections::VecDeque;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, info, trace, warn};

/// Position read from when no checkpoint exists.
pub const STREAM_START: &str = "0-0";

/// Entries per XREAD when the feed options do not say.
pub const DEFAULT_BATCH_SIZE: u32 = 100;

/// XREAD block timeout when the feed options do not say.
pub const DEFAULT_BLOCK_MS: u64 = 5000;

struct RedisShared {
    client: Client,
    stream: String,
    conn: Mutex<Option<MultiplexedConnection>>,
    signals: broadcast::Sender<ConnectionSignal>,
    closed: AtomicBool,
}

impl RedisShared {
    fn signal(&self, signal: ConnectionSignal) {
        let _ = self.signals.send(signal);
    }

    /// Cached connection, connecting on first use.
    async fn connection(&self) -> RelayResult<MultiplexedConnection> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(RelayError::Closed);
        }

        let mut cached = self.conn.lock().await;
        if let Some(conn) = cached.as_ref() {
            return Ok(conn.clone());
        }

        self.signal(ConnectionSignal::Connecting);
        match self.client.get_multiplexed_async_connection().await {
            Ok(conn) => {
                info!(stream = %self.stream, "Connected to Redis");
                *cached = Some(conn.clone());
                self.signal(ConnectionSignal::Connected);
                Ok(conn)
            }
            Err(e) => {
                warn!(error = %e, "Redis connection failed");
                self.signal(ConnectionSignal::Error(e.to_string()));
                Err(e.into())
            }
        }
    }

    /// Forget the cached connection so the next open reconnects.
    async fn connection_failed(&self, err: &redis::RedisError) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        self.conn.lock().await.take();
        self.signal(ConnectionSignal::Error(err.to_string()));
    }
}

/// Change feed source over a Redis stream. Also the connection the feeds
/// run on.
pub struct RedisChangeFeedSource<T> {
    shared: Arc<RedisShared>,
    _document: PhantomData<fn() -> T>,
}

impl<T> RedisChangeFeedSource<T> {
    /// Create a source for `stream`. Does not connect until the first open.
    pub fn new(redis_url: &str, stream: impl Into<String>) -> RelayResult<Self> {
        let client = Client::open(redis_url)?;
        let (signals, _) = broadcast::channel(32);

        Ok(Self {
            shared: Arc::new(RedisShared {
                client,
                stream: stream.into(),
                conn: Mutex::new(None),
                signals,
                closed: AtomicBool::new(false),
            }),
            _document: PhantomData,
        })
    }

    /// Key of the stream this source reads.
    pub fn stream(&self) -> &str {
        &self.shared.stream
    }
}

#[async_trait]
impl<T> ChangeFeedSource<T> for RedisChangeFeedSource<T>
where
    T: DeserializeOwned + Send + Sync + 'static,
{
    async fn open(
        &self,
        filter: &FeedFilter,
        options: &FeedOptions,
    ) -> Result<Box<dyn ChangeFeed<T>>, BoxError> {
        let cursor = match options.resume_position() {
            Some(token) => token_to_entry_id(token)?,
            None => STREAM_START.to_string(),
        };
        let conn = self.shared.connection().await?;

        let count = options.batch_size.unwrap_or(DEFAULT_BATCH_SIZE);
        let block_ms = options
            .max_await_time
            .map(|d| d.as_millis() as u64)
            .unwrap_or(DEFAULT_BLOCK_MS);

        debug!(
            stream = %self.shared.stream,
            cursor = %cursor,
            count = count,
            block_ms = block_ms,
            "Opening change feed"
        );

        Ok(Box::new(RedisChangeFeed {
            shared: self.shared.clone(),
            conn,
            filter: filter.clone(),
            cursor,
            count,
            block_ms,
            buffer: VecDeque::new(),
            ended: false,
        }))
    }
}

#[async_trait]
impl<T> Connection for RedisChangeFeedSource<T> {
    fn subscribe(&self) -> broadcast::Receiver<ConnectionSignal> {
        self.shared.signals.subscribe()
    }

    async fn close(&self, force: bool) -> Result<(), BoxError> {
        self.shared.closed.store(true, Ordering::SeqCst);
        let dropped = self.shared.conn.lock().await.take();
        info!(
            force = force,
            connected = dropped.is_some(),
            "Closing Redis connection"
        );
        drop(dropped);
        self.shared.signal(ConnectionSignal::Closed);
        Ok(())
    }
}

/// One open feed: a cursor into the stream plus a decoded read-ahead buffer.
pub struct RedisChangeFeed<T> {
    shared: Arc<RedisShared>,
    conn: MultiplexedConnection,
    filter: FeedFilter,
    cursor: String,
    count: u32,
    block_ms: u64,
    buffer: VecDeque<ChangeEvent<T>>,
    ended: bool,
}

impl<T: DeserializeOwned> RedisChangeFeed<T> {
    async fn read_batch(&mut self) -> RelayResult<Vec<StreamEntry>> {
        if self.shared.closed.load(Ordering::SeqCst) {
            return Err(RelayError::Closed);
        }

        // XREAD [COUNT count] [BLOCK milliseconds] STREAMS key id
        let result: RedisResult<redis::Value> = redis::cmd("XREAD")
            .arg("COUNT")
            .arg(self.count)
            .arg("BLOCK")
            .arg(self.block_ms)
            .arg("STREAMS")
            .arg(&self.shared.stream)
            .arg(&self.cursor)
            .query_async(&mut self.conn)
            .await;

        match result {
            Ok(value) => parse_xread_response(value),
            Err(e) => {
                self.shared.connection_failed(&e).await;
                Err(e.into())
            }
        }
    }

    fn buffer_entries(&mut self, entries: Vec<StreamEntry>) -> RelayResult<()> {
        for entry in entries {
            self.cursor = entry.id.clone();
            match decode_entry::<T>(&entry, &self.filter)? {
                Decoded::Event(event) => self.buffer.push_back(event),
                Decoded::Skipped => trace!(entry_id = %entry.id, "Entry filtered out"),
                Decoded::Invalidated => {
                    info!(entry_id = %entry.id, "Change feed invalidated");
                    self.ended = true;
                    break;
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl<T> ChangeFeed<T> for RedisChangeFeed<T>
where
    T: DeserializeOwned + Send + Sync + 'static,
{
    async fn next(&mut self) -> Result<Option<ChangeEvent<T>>, BoxError> {
        loop {
            if let Some(event) = self.buffer.pop_front() {
                return Ok(Some(event));
            }
            if self.ended {
                return Ok(None);
            }

            let entries = self.read_batch().await?;
            self.buffer_entries(entries)?;
        }
    }

    async fn close(&mut self) -> Result<(), BoxError> {
        self.buffer.clear();
        self.ended = true;
        Ok(())
    }
}

/// A raw stream entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEntry {
    /// Entry ID, e.g. `1700000000000-0`.
    pub id: String,
    /// Field/value pairs in stream order.
    pub fields: Vec<(String, String)>,
}

impl StreamEntry {
    /// First value of `name`, if present.
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|(field, _)| field == name)
            .map(|(_, value)| value.as_str())
    }
}

/// Outcome of decoding one entry against a filter.
#[derive(Debug)]
pub enum Decoded<T> {
    /// Admitted by the filter.
    Event(ChangeEvent<T>),
    /// Rejected by the filter.
    Skipped,
    /// The feed ends here.
    Invalidated,
}

/// Decode an entry into a change event, applying `filter` first.
///
/// Entries rejected by the filter are never decoded into `T`. An entry that
/// passes the filter but cannot be decoded is an error.
pub fn decode_entry<T: DeserializeOwned>(
    entry: &StreamEntry,
    filter: &FeedFilter,
) -> RelayResult<Decoded<T>> {
    let op_name = entry.field("operationType").unwrap_or("insert");
    let operation_type = OperationType::parse(op_name).ok_or_else(|| {
        RelayError::Protocol(format!(
            "entry {} has unknown operationType {:?}",
            entry.id, op_name
        ))
    })?;

    if operation_type == OperationType::Invalidate {
        return Ok(Decoded::Invalidated);
    }

    let ns = Namespace {
        db: entry.field("db").unwrap_or_default().to_string(),
        coll: entry.field("coll").unwrap_or_default().to_string(),
    };
    let document_key = entry
        .field("documentKey")
        .map(|raw| parse_json_field(entry, "documentKey", raw))
        .transpose()?;
    let full_document = match entry.field("fullDocument") {
        Some(raw) => parse_json_field(entry, "fullDocument", raw)?,
        None => Value::Null,
    };

    let mut projection = json!({
        "_id": entry.id,
        "operationType": op_name,
        "ns": { "db": ns.db, "coll": ns.coll },
        "documentKey": document_key.clone().unwrap_or(Value::Null),
        "fullDocument": full_document,
    });
    if !filter.matches(&projection) {
        return Ok(Decoded::Skipped);
    }

    let full_document: T = serde_json::from_value(projection["fullDocument"].take())
        .map_err(|e| {
            RelayError::Protocol(format!("entry {} has an undecodable fullDocument: {}", entry.id, e))
        })?;

    Ok(Decoded::Event(ChangeEvent {
        id: CheckpointToken::from(entry.id.clone()),
        operation_type,
        ns,
        document_key,
        full_document,
        wall_time: wall_time_from_id(&entry.id),
    }))
}

fn parse_json_field(entry: &StreamEntry, field: &str, raw: &str) -> RelayResult<Value> {
    serde_json::from_str(raw).map_err(|e| {
        RelayError::Protocol(format!("entry {} field {} is not JSON: {}", entry.id, field, e))
    })
}

/// Stream IDs start with the millisecond timestamp of the append.
pub fn wall_time_from_id(id: &str) -> Option<DateTime<Utc>> {
    id.split('-')
        .next()
        .and_then(|ms| ms.parse::<i64>().ok())
        .and_then(DateTime::from_timestamp_millis)
}

/// Interpret a checkpoint token as a stream entry ID.
pub fn token_to_entry_id(token: &CheckpointToken) -> RelayResult<String> {
    token.as_str().map(str::to_string).ok_or_else(|| {
        RelayError::Protocol(format!("checkpoint {} is not a stream entry id", token))
    })
}

/// Parse an XREAD reply.
///
/// RESP2 shape: `[[stream_key, [[id, [field, value, ...]], ...]]]`. RESP3
/// replies carry the same entries in a map keyed by stream. `Nil` means the
/// block timeout expired.
pub fn parse_xread_response(value: redis::Value) -> RelayResult<Vec<StreamEntry>> {
    let streams: Vec<redis::Value> = match value {
        redis::Value::Nil => return Ok(Vec::new()),
        redis::Value::Array(streams) => streams
            .into_iter()
            .map(|stream| match stream {
                redis::Value::Array(mut parts) if parts.len() >= 2 => Ok(parts.swap_remove(1)),
                other => Err(RelayError::Protocol(format!(
                    "Expected [key, entries] for stream, got {:?}",
                    other
                ))),
            })
            .collect::<RelayResult<_>>()?,
        redis::Value::Map(streams) => streams.into_iter().map(|(_, entries)| entries).collect(),
        other => {
            return Err(RelayError::Protocol(format!(
                "Unexpected XREAD response type: {:?}",
                other
            )))
        }
    };

    let mut entries = Vec::new();
    for stream in streams {
        let raw_entries = match stream {
            redis::Value::Array(raw) => raw,
            redis::Value::Nil => continue,
            other => {
                return Err(RelayError::Protocol(format!(
                    "Expected array for entries, got {:?}",
                    other
                )))
            }
        };

        for raw in &raw_entries {
            entries.push(parse_entry(raw)?);
        }
    }

    Ok(entries)
}

fn parse_entry(value: &redis::Value) -> RelayResult<StreamEntry> {
    let parts = match value {
        redis::Value::Array(parts) if parts.len() >= 2 => parts,
        other => {
            return Err(RelayError::Protocol(format!(
                "Expected [id, fields] for entry, got {:?}",
                other
            )))
        }
    };

    let id = value_to_string(&parts[0]).ok_or_else(|| {
        RelayError::Protocol(format!("Expected string for entry ID, got {:?}", parts[0]))
    })?;

    let raw_fields = match &parts[1] {
        redis::Value::Array(f) => f,
        other => {
            return Err(RelayError::Protocol(format!(
                "Expected array for fields of {}, got {:?}",
                id, other
            )))
        }
    };

    let mut fields = Vec::with_capacity(raw_fields.len() / 2);
    for pair in raw_fields.chunks(2) {
        if let [name, value] = pair {
            match (value_to_string(name), value_to_string(value)) {
                (Some(name), Some(value)) => fields.push((name, value)),
                _ => warn!(entry_id = %id, "Skipping non-string stream field"),
            }
        }
    }

    Ok(StreamEntry { id, fields })
}

fn value_to_string(value: &redis::Value) -> Option<String> {
    match value {
        redis::Value::BulkString(s) => Some(String::from_utf8_lossy(s).to_string()),
        redis::Value::SimpleString(s) => Some(s.clone()),
        _ => None,
    }
}
