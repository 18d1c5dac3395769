//! Per-workload container status reported by the node. Replaced whole on every save.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::codec::{Record, null_as_default};
use crate::error::StateResult;
use crate::store::Store;
use crate::tables::NODE_STATUS;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContainerStatus {
    pub name: String,
    pub image: String,
    pub created: i64,
    pub state: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkloadStatus {
    #[serde(rename = "agreementId")]
    pub agreement_id: String,
    #[serde(rename = "serviceUrl", default, skip_serializing_if = "String::is_empty")]
    pub service_url: String,
    #[serde(rename = "orgid", default, skip_serializing_if = "String::is_empty")]
    pub org: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub version: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub arch: String,
    #[serde(rename = "containerStatus", default, deserialize_with = "null_as_default")]
    pub containers: Vec<ContainerStatus>,
    #[serde(rename = "operatorStatus", default, skip_serializing_if = "Option::is_none")]
    pub operator_status: Option<Value>,
    #[serde(rename = "configState", default, skip_serializing_if = "String::is_empty")]
    pub config_state: String,
}

impl Record for Vec<WorkloadStatus> {}

impl Store {
    /// The last saved status list; empty when none was saved.
    pub fn find_node_status(&self) -> StateResult<Vec<WorkloadStatus>> {
        Ok(self.find_singleton(NODE_STATUS)?.unwrap_or_default())
    }

    pub fn save_node_status(&self, status: &[WorkloadStatus]) -> StateResult<()> {
        self.save_singleton(NODE_STATUS, &status.to_vec())
    }

    pub fn delete_node_status(&self) -> StateResult<()> {
        self.delete_singleton(NODE_STATUS)?;
        Ok(())
    }
}
