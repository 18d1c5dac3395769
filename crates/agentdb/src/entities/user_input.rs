//! Node-level user input for services, and the hash of the copy last pushed to the exchange.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::codec::{Record, encode, null_as_default};
use crate::error::StateResult;
use crate::store::Store;
use crate::tables::{EXCHANGE_NODE_USER_INPUT_HASH, NODE_USER_INPUT};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Input {
    pub name: String,
    pub value: Value,
}

/// User input for one service.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct UserInput {
    #[serde(rename = "serviceOrgid")]
    pub service_org: String,
    #[serde(rename = "serviceUrl")]
    pub service_url: String,
    #[serde(rename = "serviceArch")]
    pub service_arch: String,
    #[serde(rename = "serviceVersionRange")]
    pub service_version_range: String,
    #[serde(deserialize_with = "null_as_default")]
    pub inputs: Vec<Input>,
}

impl UserInput {
    pub fn input(&self, name: &str) -> Option<&Value> {
        self.inputs.iter().find(|i| i.name == name).map(|i| &i.value)
    }
}

impl Record for Vec<UserInput> {}

/// SHA-256 of the JSON encoding of `inputs`.
pub fn user_input_hash(inputs: &[UserInput]) -> StateResult<Vec<u8>> {
    let bytes = encode(&inputs)?;
    Ok(Sha256::digest(&bytes).to_vec())
}

impl Store {
    /// The saved user input; empty when none was saved.
    pub fn find_node_user_input(&self) -> StateResult<Vec<UserInput>> {
        Ok(self.find_singleton(NODE_USER_INPUT)?.unwrap_or_default())
    }

    pub fn save_node_user_input(&self, inputs: &[UserInput]) -> StateResult<()> {
        self.save_singleton(NODE_USER_INPUT, &inputs.to_vec())
    }

    pub fn delete_node_user_input(&self) -> StateResult<()> {
        self.delete_singleton(NODE_USER_INPUT)?;
        Ok(())
    }

    /// Hash of the user input last pushed to the exchange; empty when never saved.
    pub fn get_node_user_input_hash_exch(&self) -> StateResult<Vec<u8>> {
        Ok(self
            .find_raw(EXCHANGE_NODE_USER_INPUT_HASH, EXCHANGE_NODE_USER_INPUT_HASH)?
            .unwrap_or_default())
    }

    pub fn save_node_user_input_hash_exch(&self, hash: &[u8]) -> StateResult<()> {
        self.save_raw(
            EXCHANGE_NODE_USER_INPUT_HASH,
            EXCHANGE_NODE_USER_INPUT_HASH,
            hash,
        )?;
        debug!(hash = %hex::encode(hash), "node user input hash saved");
        Ok(())
    }

    pub fn delete_node_user_input_hash_exch(&self) -> StateResult<()> {
        self.delete_singleton(EXCHANGE_NODE_USER_INPUT_HASH)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn inputs() -> Vec<UserInput> {
        vec![UserInput {
            service_org: "myorg".into(),
            service_url: "netspeed".into(),
            service_arch: "amd64".into(),
            service_version_range: "[1.0.0,INFINITY)".into(),
            inputs: vec![Input {
                name: "var1".into(),
                value: json!("a"),
            }],
        }]
    }

    #[test]
    fn user_input_is_replaced_whole() {
        let store = Store::open_in_memory().unwrap();
        assert!(store.find_node_user_input().unwrap().is_empty());
        store.save_node_user_input(&inputs()).unwrap();
        let found = store.find_node_user_input().unwrap();
        assert_eq!(found, inputs());
        assert_eq!(found[0].input("var1"), Some(&json!("a")));
        store.delete_node_user_input().unwrap();
        assert!(store.find_node_user_input().unwrap().is_empty());
    }

    #[test]
    fn hash_is_stored_raw() {
        let store = Store::open_in_memory().unwrap();
        assert!(store.get_node_user_input_hash_exch().unwrap().is_empty());

        let hash = user_input_hash(&inputs()).unwrap();
        assert_eq!(hash.len(), 32);
        assert_eq!(hash, user_input_hash(&inputs()).unwrap());
        assert_ne!(hash, user_input_hash(&[]).unwrap());

        store.save_node_user_input_hash_exch(&hash).unwrap();
        assert_eq!(store.get_node_user_input_hash_exch().unwrap(), hash);
        store.delete_node_user_input_hash_exch().unwrap();
        assert!(store.get_node_user_input_hash_exch().unwrap().is_empty());
    }
}
