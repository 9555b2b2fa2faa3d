//! Checkpoint store contract and an in-memory implementation.

use crate::error::BoxError;
use crate::event::CheckpointToken;
use async_trait::async_trait;
use parking_lot::Mutex;

/// Durable storage for the last committed feed position.
///
/// Holds exactly one token at a time. The encoding is up to the store; the
/// runner only requires that `get` returns what `set` was last given.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Read the current checkpoint. `None` means "from the beginning".
    async fn get(&self) -> Result<Option<CheckpointToken>, BoxError>;

    /// Replace the current checkpoint.
    async fn set(&self, token: &CheckpointToken) -> Result<(), BoxError>;
}

/// Checkpoint store that keeps the token in memory.
///
/// Progress does not survive the process; useful for tests and for
/// deployments that always replay the feed on boot.
#[derive(Debug, Default)]
pub struct MemoryCheckpointStore {
    token: Mutex<Option<CheckpointToken>>,
}

impl MemoryCheckpointStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store already holding `token`.
    pub fn with_token(token: CheckpointToken) -> Self {
        Self {
            token: Mutex::new(Some(token)),
        }
    }

    /// Current token without going through the async contract.
    pub fn current(&self) -> Option<CheckpointToken> {
        self.token.lock().clone()
    }
}

#[async_trait]
impl CheckpointStore for MemoryCheckpointStore {
    async fn get(&self) -> Result<Option<CheckpointToken>, BoxError> {
        Ok(self.current())
    }

    async fn set(&self, token: &CheckpointToken) -> Result<(), BoxError> {
        *self.token.lock() = Some(token.clone());
        Ok(())
    }
}
