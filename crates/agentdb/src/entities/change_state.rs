//! The last exchange change the node has processed.

use agentdb_core::epoch_secs;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::codec::Record;
use crate::error::StateResult;
use crate::store::Store;
use crate::tables::EXCHANGE_CHANGES;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeState {
    #[serde(rename = "changeId")]
    pub change_id: u64,
    #[serde(rename = "lastUpdated")]
    pub last_updated: i64,
}

impl Record for ChangeState {}

impl Store {
    pub fn find_exchange_change_state(&self) -> StateResult<Option<ChangeState>> {
        self.find_singleton(EXCHANGE_CHANGES)
    }

    /// Record `change_id` as the latest processed change, stamped with the current time.
    pub fn save_exchange_change_state(&self, change_id: u64) -> StateResult<ChangeState> {
        let state = ChangeState {
            change_id,
            last_updated: epoch_secs() as i64,
        };
        self.save_singleton(EXCHANGE_CHANGES, &state)?;
        debug!(change_id, "exchange change state saved");
        Ok(state)
    }

    pub fn delete_exchange_change_state(&self) -> StateResult<()> {
        self.delete_singleton(EXCHANGE_CHANGES)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn latest_change_wins() {
        let store = Store::open_in_memory().unwrap();
        assert_eq!(store.find_exchange_change_state().unwrap(), None);
        store.save_exchange_change_state(10).unwrap();
        let saved = store.save_exchange_change_state(12).unwrap();
        assert!(saved.last_updated > 0);
        let found = store.find_exchange_change_state().unwrap().unwrap();
        assert_eq!(found, saved);
        assert_eq!(found.change_id, 12);
        store.delete_exchange_change_state().unwrap();
        assert_eq!(store.find_exchange_change_state().unwrap(), None);
    }

    #[test]
    fn wire_names() {
        let state: ChangeState =
            serde_json::from_str(r#"{"changeId": 7, "lastUpdated": 1700000000}"#).unwrap();
        assert_eq!(state.change_id, 7);
        assert_eq!(state.last_updated, 1_700_000_000);
    }
}
