//! Write-ahead commit of instance transitions.

use super::state::InstanceState;
use crate::error::{EngineResult, PersistenceError};
use crate::events::{Event, EventType};
use crate::retry::{RetryDecision, RetryPolicy};
use crate::storage::StateStore;
use std::sync::Arc;

/// Validates a transition, persists it, and only then applies it in memory
pub struct Journal {
    store: Arc<dyn StateStore>,
    retry: RetryPolicy,
}

impl Journal {
    pub fn new(store: Arc<dyn StateStore>, retry: RetryPolicy) -> Self {
        Self { store, retry }
    }

    pub fn store(&self) -> &Arc<dyn StateStore> {
        &self.store
    }

    /// Record a transition of `state`. On error `state` is unchanged.
    pub async fn record(&self, state: &mut InstanceState, event_type: EventType) -> EngineResult<()> {
        state.validate(&event_type)?;

        let event = Event::new(state.id(), state.next_sequence(), event_type);
        self.append(&event).await?;
        state.apply(&event)?;

        tracing::debug!(
            "Instance {} #{}: {}",
            event.instance_id,
            event.sequence,
            event.event_type.name()
        );
        Ok(())
    }

    async fn append(&self, event: &Event) -> Result<(), PersistenceError> {
        let key = format!("persistence:{}", event.instance_id);
        let mut attempt = 0;

        loop {
            let err = match self.store.append(event.instance_id, event).await {
                Ok(()) => return Ok(()),
                Err(err) => err,
            };

            match self.retry.decide(&key, attempt, err.kind()) {
                RetryDecision::Retry { delay } => {
                    tracing::warn!(
                        "Append of {} for instance {} failed ({}), retrying in {:?}",
                        event.event_type.name(),
                        event.instance_id,
                        err,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                RetryDecision::FailFast => {
                    tracing::error!(
                        "Giving up on append of {} for instance {} after {} retries: {}",
                        event.event_type.name(),
                        event.instance_id,
                        attempt,
                        err
                    );
                    return Err(err);
                }
            }
        }
    }
}
