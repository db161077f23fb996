use super::{check_append, StateStore};
use crate::error::PersistenceError;
use crate::events::Event;
use crate::types::InstanceId;
use anyhow::Context;
use redb::{Database, ReadableTable, TableDefinition};
use std::path::PathBuf;
use std::sync::Arc;

/// Events keyed by `<instance_id>/<sequence, zero padded>`
const EVENTS_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("events");
/// Last stored sequence per instance
const INSTANCES_TABLE: TableDefinition<&str, u64> = TableDefinition::new("instances");

/// Durable state store backed by an embedded redb database
///
/// Every append is its own write transaction, so an acknowledged append has
/// been committed to disk.
#[derive(Clone)]
pub struct RedbStateStore {
    db: Arc<Database>,
}

impl RedbStateStore {
    pub fn new(path: PathBuf) -> anyhow::Result<Self> {
        // Create parent directory if needed
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create state store directory")?;
        }

        let db = Database::create(&path).context("Failed to create redb database")?;

        // Initialize tables
        let write_txn = db.begin_write().context("Failed to begin write transaction")?;
        {
            let _events_table = write_txn
                .open_table(EVENTS_TABLE)
                .context("Failed to open events table")?;
            let _instances_table = write_txn
                .open_table(INSTANCES_TABLE)
                .context("Failed to open instances table")?;
        }
        write_txn.commit().context("Failed to commit transaction")?;

        Ok(Self { db: Arc::new(db) })
    }

    fn event_key(instance_id: InstanceId, sequence: u64) -> String {
        format!("{}/{:020}", instance_id, sequence)
    }

    fn append_sync(&self, instance_id: InstanceId, event: &Event) -> Result<(), PersistenceError> {
        let write_txn = self.db.begin_write().context("Failed to begin write")?;
        {
            let mut instances = write_txn
                .open_table(INSTANCES_TABLE)
                .context("Failed to open instances table")?;
            let mut events = write_txn
                .open_table(EVENTS_TABLE)
                .context("Failed to open events table")?;

            let instance_key = instance_id.to_string();
            let last_sequence = instances
                .get(instance_key.as_str())
                .context("Failed to read last sequence")?
                .map(|guard| guard.value())
                .unwrap_or(0);

            let key = Self::event_key(instance_id, event.sequence);
            let stored_id = match events.get(key.as_str()).context("Failed to read event")? {
                Some(guard) => {
                    let stored: Event = serde_json::from_slice(guard.value())?;
                    Some(stored.id)
                }
                None => None,
            };

            if !check_append(instance_id, event, last_sequence, stored_id.as_deref())? {
                return Ok(());
            }

            let value = serde_json::to_vec(event)?;
            events
                .insert(key.as_str(), value.as_slice())
                .context("Failed to insert event")?;
            instances
                .insert(instance_key.as_str(), event.sequence)
                .context("Failed to update last sequence")?;
        }
        write_txn.commit().context("Failed to commit")?;
        Ok(())
    }

    fn load_sync(&self, instance_id: InstanceId) -> Result<Vec<Event>, PersistenceError> {
        let read_txn = self.db.begin_read().context("Failed to begin read")?;
        let table = read_txn
            .open_table(EVENTS_TABLE)
            .context("Failed to open events table")?;

        // '/' sorts directly before '0', so this covers every key of the instance
        let start = format!("{}/", instance_id);
        let end = format!("{}0", instance_id);

        let mut events = Vec::new();
        for item in table
            .range(start.as_str()..end.as_str())
            .context("Failed to iterate events")?
        {
            let (_key, value) = item.context("Failed to read event")?;
            let event: Event = serde_json::from_slice(value.value())?;
            events.push(event);
        }

        Ok(events)
    }

    fn list_sync(&self) -> Result<Vec<InstanceId>, PersistenceError> {
        let read_txn = self.db.begin_read().context("Failed to begin read")?;
        let table = read_txn
            .open_table(INSTANCES_TABLE)
            .context("Failed to open instances table")?;

        let mut ids = Vec::new();
        for item in table.iter().context("Failed to iterate instances")? {
            let (key, _value) = item.context("Failed to read instance")?;
            let id = key
                .value()
                .parse()
                .map_err(|e| PersistenceError::Serialization(format!("bad instance key: {}", e)))?;
            ids.push(id);
        }

        Ok(ids)
    }
}

#[async_trait::async_trait]
impl StateStore for RedbStateStore {
    async fn append(&self, instance_id: InstanceId, event: &Event) -> Result<(), PersistenceError> {
        self.append_sync(instance_id, event)
    }

    async fn load_all(&self, instance_id: InstanceId) -> Result<Vec<Event>, PersistenceError> {
        self.load_sync(instance_id)
    }

    async fn list_instances(&self) -> Result<Vec<InstanceId>, PersistenceError> {
        self.list_sync()
    }
}
