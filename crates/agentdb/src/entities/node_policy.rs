//! Node policy document and the exchange's last-updated marker for it.
//!
//! The policy is stored as an opaque JSON document; evaluating it is the
//! caller's business.

use serde_json::Value;
use tracing::debug;

use crate::codec::{Record, decode_raw_string};
use crate::error::StateResult;
use crate::store::Store;
use crate::tables::{EXCHANGE_NP_LAST_UPDATED, NODE_POLICY};

impl Record for Value {}

impl Store {
    pub fn find_node_policy(&self) -> StateResult<Option<Value>> {
        self.find_singleton(NODE_POLICY)
    }

    /// Replace the node policy.
    pub fn save_node_policy(&self, policy: &Value) -> StateResult<()> {
        self.save_singleton(NODE_POLICY, policy)
    }

    pub fn delete_node_policy(&self) -> StateResult<()> {
        let existed = self.delete_singleton(NODE_POLICY)?;
        debug!(existed, "node policy deleted");
        Ok(())
    }

    /// Last-updated string of the node policy in the exchange; empty when never saved.
    pub fn get_node_policy_last_updated_exch(&self) -> StateResult<String> {
        match self.find_raw(EXCHANGE_NP_LAST_UPDATED, EXCHANGE_NP_LAST_UPDATED)? {
            Some(bytes) => decode_raw_string(EXCHANGE_NP_LAST_UPDATED, EXCHANGE_NP_LAST_UPDATED, &bytes),
            None => Ok(String::new()),
        }
    }

    pub fn save_node_policy_last_updated_exch(&self, last_updated: &str) -> StateResult<()> {
        self.save_raw(
            EXCHANGE_NP_LAST_UPDATED,
            EXCHANGE_NP_LAST_UPDATED,
            last_updated.as_bytes(),
        )
    }

    pub fn delete_node_policy_last_updated_exch(&self) -> StateResult<()> {
        self.delete_singleton(EXCHANGE_NP_LAST_UPDATED)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn policy_is_replaced_whole() {
        let store = Store::open_in_memory().unwrap();
        assert_eq!(store.find_node_policy().unwrap(), None);
        store
            .save_node_policy(&json!({"properties": [{"name": "gpu", "value": true}]}))
            .unwrap();
        let replacement = json!({"constraints": ["location == \"east\""]});
        store.save_node_policy(&replacement).unwrap();
        assert_eq!(store.find_node_policy().unwrap(), Some(replacement));
        store.delete_node_policy().unwrap();
        store.delete_node_policy().unwrap();
        assert_eq!(store.find_node_policy().unwrap(), None);
    }

    #[test]
    fn last_updated_is_a_raw_string() {
        let store = Store::open_in_memory().unwrap();
        assert_eq!(store.get_node_policy_last_updated_exch().unwrap(), "");
        store
            .save_node_policy_last_updated_exch("2024-01-01T00:00:00.000Z[UTC]")
            .unwrap();
        assert_eq!(
            store.get_node_policy_last_updated_exch().unwrap(),
            "2024-01-01T00:00:00.000Z[UTC]"
        );
        store.delete_node_policy_last_updated_exch().unwrap();
        assert_eq!(store.get_node_policy_last_updated_exch().unwrap(), "");
    }
}
