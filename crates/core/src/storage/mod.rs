//! State store adapters.
//!
//! The engine only depends on [`StateStore`]; any backend offering durable,
//! ordered, idempotent append and full replay per instance will do.

pub mod event_log;
pub mod memory;
pub mod redb_store;

pub use event_log::JsonlEventLog;
pub use memory::MemoryStateStore;
pub use redb_store::RedbStateStore;

use crate::error::PersistenceError;
use crate::events::Event;
use crate::types::InstanceId;

/// Append-only, per-instance transition log
#[async_trait::async_trait]
pub trait StateStore: Send + Sync {
    /// Durably append a transition. Returns only once the write is durable.
    ///
    /// Appending an event that is already stored (same sequence, same id) is
    /// acknowledged without writing. A different event at an existing
    /// sequence, or a sequence gap, is a [`PersistenceError::Conflict`].
    async fn append(&self, instance_id: InstanceId, event: &Event) -> Result<(), PersistenceError>;

    /// All transitions of an instance, ordered by sequence
    async fn load_all(&self, instance_id: InstanceId) -> Result<Vec<Event>, PersistenceError>;

    /// Every instance with at least one stored transition
    async fn list_instances(&self) -> Result<Vec<InstanceId>, PersistenceError>;

    /// Move the log of a terminal instance to cold storage. It must stay
    /// readable through [`StateStore::load_all`]. Stores without cold storage
    /// keep the log where it is.
    async fn archive(&self, _instance_id: InstanceId) -> Result<(), PersistenceError> {
        Ok(())
    }
}

/// Check an append against the stored log.
///
/// Returns `Ok(true)` if the event extends the log, `Ok(false)` if it is
/// already stored.
pub(crate) fn check_append(
    instance_id: InstanceId,
    event: &Event,
    last_sequence: u64,
    stored_id: Option<&str>,
) -> Result<bool, PersistenceError> {
    let conflict = PersistenceError::Conflict {
        instance_id,
        sequence: event.sequence,
    };

    if event.instance_id != instance_id {
        return Err(conflict);
    }

    if event.sequence == last_sequence + 1 {
        return Ok(true);
    }

    match stored_id {
        Some(id) if event.sequence <= last_sequence && id == event.id => Ok(false),
        _ => Err(conflict),
    }
}
