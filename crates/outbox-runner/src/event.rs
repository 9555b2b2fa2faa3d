//! Change feed data model.
//!
//! These types describe what a change feed produces and how the runner asks
//! for it: the events themselves, the opaque checkpoint token that marks a
//! position in the feed, and the filter/options pair used to open a feed.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::time::Duration;
use tracing::warn;

/// Key under which the operation kind appears in filters and projections.
pub const OPERATION_TYPE_KEY: &str = "operationType";

/// Kind of mutation recorded by a change event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum OperationType {
    Insert,
    Update,
    Replace,
    Delete,
    Drop,
    Rename,
    DropDatabase,
    /// The server invalidated the feed; no further events follow.
    Invalidate,
}

impl OperationType {
    /// Wire name of the operation kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationType::Insert => "insert",
            OperationType::Update => "update",
            OperationType::Replace => "replace",
            OperationType::Delete => "delete",
            OperationType::Drop => "drop",
            OperationType::Rename => "rename",
            OperationType::DropDatabase => "dropDatabase",
            OperationType::Invalidate => "invalidate",
        }
    }

    /// Parse a wire name. Returns `None` for unknown kinds.
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "insert" => Some(OperationType::Insert),
            "update" => Some(OperationType::Update),
            "replace" => Some(OperationType::Replace),
            "delete" => Some(OperationType::Delete),
            "drop" => Some(OperationType::Drop),
            "rename" => Some(OperationType::Rename),
            "dropDatabase" => Some(OperationType::DropDatabase),
            "invalidate" => Some(OperationType::Invalidate),
            _ => None,
        }
    }
}

impl fmt::Display for OperationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An opaque position in the change feed.
///
/// The runner never looks inside a token; it only hands it back to the
/// checkpoint store and to the feed source when resuming.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CheckpointToken(Value);

impl CheckpointToken {
    /// Wrap a raw JSON value as a token.
    pub fn new(value: Value) -> Self {
        Self(value)
    }

    /// Borrow the raw value.
    pub fn as_value(&self) -> &Value {
        &self.0
    }

    /// The token as a string, when the source encodes positions as strings.
    pub fn as_str(&self) -> Option<&str> {
        self.0.as_str()
    }

    /// Consume the token, returning the raw value.
    pub fn into_value(self) -> Value {
        self.0
    }
}

impl From<&str> for CheckpointToken {
    fn from(s: &str) -> Self {
        Self(Value::String(s.to_string()))
    }
}

impl From<String> for CheckpointToken {
    fn from(s: String) -> Self {
        Self(Value::String(s))
    }
}

impl fmt::Display for CheckpointToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.0 {
            Value::String(s) => f.write_str(s),
            other => write!(f, "{}", other),
        }
    }
}

/// Database and collection an event belongs to.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Namespace {
    pub db: String,
    pub coll: String,
}

/// An immutable record observed from the change feed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeEvent<T> {
    /// Position of this event; doubles as the checkpoint value.
    #[serde(rename = "_id")]
    pub id: CheckpointToken,
    pub operation_type: OperationType,
    pub ns: Namespace,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub document_key: Option<Value>,
    pub full_document: T,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub wall_time: Option<DateTime<Utc>>,
}

impl<T> ChangeEvent<T> {
    /// Build an insert event.
    pub fn insert(id: impl Into<CheckpointToken>, ns: Namespace, full_document: T) -> Self {
        Self {
            id: id.into(),
            operation_type: OperationType::Insert,
            ns,
            document_key: None,
            full_document,
            wall_time: None,
        }
    }
}

/// Filter used to open a change feed.
///
/// The operation kind is pinned to `insert`; the caller predicate is AND-ed
/// with it. Serializes as `{"operationType": "insert", ...predicate}`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FeedFilter {
    #[serde(rename = "operationType")]
    operation_type: OperationType,
    #[serde(flatten)]
    predicate: Map<String, Value>,
}

impl FeedFilter {
    /// Build an insert-only filter from a caller predicate.
    ///
    /// A predicate key named `operationType` is dropped: it could otherwise
    /// widen the feed to non-insert events.
    pub fn insert_only(mut predicate: Map<String, Value>) -> Self {
        if let Some(discarded) = predicate.remove(OPERATION_TYPE_KEY) {
            warn!(
                discarded = %discarded,
                "Ignoring operationType in caller filter; only inserts are delivered"
            );
        }

        Self {
            operation_type: OperationType::Insert,
            predicate,
        }
    }

    /// The operation kind this filter admits.
    pub fn operation_type(&self) -> OperationType {
        self.operation_type
    }

    /// The caller predicate, without the operation kind.
    pub fn predicate(&self) -> &Map<String, Value> {
        &self.predicate
    }

    /// Evaluate the filter against a JSON projection of an event.
    ///
    /// Keys are dotted paths (`ns.coll`, `fullDocument.event`). A condition is
    /// either a literal (equality) or `{"$in": [..]}`.
    pub fn matches(&self, projection: &Value) -> bool {
        let op_matches = lookup(projection, OPERATION_TYPE_KEY)
            .and_then(Value::as_str)
            .map(|op| op == self.operation_type.as_str())
            .unwrap_or(false);

        op_matches
            && self
                .predicate
                .iter()
                .all(|(path, condition)| condition_holds(lookup(projection, path), condition))
    }
}

fn lookup<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    // Literal keys containing dots win over path traversal.
    if let Some(found) = value.get(path) {
        return Some(found);
    }
    path.split('.').try_fold(value, |current, segment| current.get(segment))
}

fn condition_holds(actual: Option<&Value>, condition: &Value) -> bool {
    if let Some(candidates) = condition.get("$in").and_then(Value::as_array) {
        return actual.map(|a| candidates.contains(a)).unwrap_or(false);
    }
    actual == Some(condition)
}

/// Options used to open a change feed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeedOptions {
    /// Resume after this position (exclusive).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_after: Option<CheckpointToken>,
    /// Start after this position, even past an invalidation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_after: Option<CheckpointToken>,
    /// Maximum events fetched per round trip.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_size: Option<u32>,
    /// How long a single read may wait for new events.
    #[serde(
        default,
        rename = "maxAwaitTimeMS",
        with = "duration_ms",
        skip_serializing_if = "Option::is_none"
    )]
    pub max_await_time: Option<Duration>,
}

impl FeedOptions {
    /// Options resuming after the given checkpoint, if any.
    pub fn resume_from(checkpoint: Option<CheckpointToken>) -> Self {
        Self {
            resume_after: checkpoint,
            ..Default::default()
        }
    }

    /// Apply `overrides` on top of `self`; every field set in `overrides` wins.
    pub fn merged_with(self, overrides: &FeedOptions) -> FeedOptions {
        FeedOptions {
            resume_after: overrides.resume_after.clone().or(self.resume_after),
            start_after: overrides.start_after.clone().or(self.start_after),
            batch_size: overrides.batch_size.or(self.batch_size),
            max_await_time: overrides.max_await_time.or(self.max_await_time),
        }
    }

    /// The position the feed should start after, `startAfter` taking priority.
    pub fn resume_position(&self) -> Option<&CheckpointToken> {
        self.start_after.as_ref().or(self.resume_after.as_ref())
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => s.serialize_some(&(d.as_millis() as u64)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?.map(Duration::from_millis))
    }
}
