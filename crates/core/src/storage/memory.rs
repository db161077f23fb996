use super::{check_append, StateStore};
use crate::error::PersistenceError;
use crate::events::Event;
use crate::types::InstanceId;
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Volatile state store for tests and single-process embedding
#[derive(Default)]
pub struct MemoryStateStore {
    logs: RwLock<HashMap<InstanceId, Vec<Event>>>,
}

impl MemoryStateStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl StateStore for MemoryStateStore {
    async fn append(&self, instance_id: InstanceId, event: &Event) -> Result<(), PersistenceError> {
        let mut logs = self.logs.write().await;
        let log = logs.entry(instance_id).or_default();

        let stored_id = event
            .sequence
            .checked_sub(1)
            .and_then(|idx| log.get(idx as usize))
            .map(|e| e.id.as_str());

        if check_append(instance_id, event, log.len() as u64, stored_id)? {
            log.push(event.clone());
        }

        Ok(())
    }

    async fn load_all(&self, instance_id: InstanceId) -> Result<Vec<Event>, PersistenceError> {
        Ok(self
            .logs
            .read()
            .await
            .get(&instance_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn list_instances(&self) -> Result<Vec<InstanceId>, PersistenceError> {
        Ok(self
            .logs
            .read()
            .await
            .iter()
            .filter(|(_, log)| !log.is_empty())
            .map(|(id, _)| *id)
            .collect())
    }
}
