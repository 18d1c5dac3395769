//! Established agreements, one bucket per agreement protocol.
//!
//! Lifecycle timestamps are "happened" markers: each moves from zero to a
//! time once and is never rewritten. Every state helper is a merge-update
//! against the single unarchived agreement with the given id.

use std::collections::BTreeMap;

use agentdb_core::{ServiceSpec, WorkloadInfo, epoch_secs};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use crate::codec::{Record, decode, null_as_default};
use crate::error::{StateError, StateResult};
use crate::filter::RecordFilter;
use crate::merge::{
    MergePolicy, emptiness_toggle, monotonic_max, one_way_flag, ratchet, replace_if_non_default,
    update_unique_in_txn,
};
use crate::store::{Store, find_in, put_record};
use crate::tables::agreements_bucket;

/// Latest metering notification received for an agreement.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MeteringNotification {
    pub amount: u64,
    pub start_time: u64,
    pub current_time: u64,
    pub missed_time: u64,
    pub consumer_meter_signature: String,
    pub agreement_hash: String,
    #[serde(rename = "consumer_agreement_signature")]
    pub consumer_signature: String,
    pub consumer_address: String,
    #[serde(rename = "producer_agreement_signature")]
    pub producer_signature: String,
    pub blockchain_type: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EstablishedAgreement {
    pub name: String,
    /// `None` only while decoding a legacy payload; see [`Record::from_bytes`].
    #[serde(default)]
    pub dependent_services: Option<Vec<ServiceSpec>>,
    #[serde(default)]
    pub archived: bool,
    pub current_agreement_id: String,
    #[serde(default)]
    pub consumer_id: String,
    #[serde(default, rename = "counterparty_address")]
    pub counter_party_address: String,
    #[serde(default)]
    pub agreement_creation_time: u64,
    #[serde(default)]
    pub agreement_accepted_time: u64,
    #[serde(default)]
    pub agreement_bc_update_ack_time: u64,
    #[serde(default)]
    pub agreement_finalized_time: u64,
    #[serde(default)]
    pub agreement_terminated_time: u64,
    #[serde(default)]
    pub agreement_force_terminated_time: u64,
    #[serde(default)]
    pub agreement_execution_start_time: u64,
    #[serde(default)]
    pub agreement_data_received_time: u64,
    /// Native deployment config, by service name. Mutually exclusive with `extended_deployment`.
    #[serde(default, deserialize_with = "null_as_default")]
    pub current_deployment: BTreeMap<String, Value>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub extended_deployment: serde_json::Map<String, Value>,
    #[serde(default)]
    pub proposal: String,
    #[serde(default)]
    pub proposal_sig: String,
    pub agreement_protocol: String,
    #[serde(default)]
    pub protocol_version: i32,
    #[serde(default)]
    pub terminated_reason: u64,
    #[serde(default)]
    pub terminated_description: String,
    #[serde(default)]
    pub agreement_protocol_terminated_time: u64,
    #[serde(default)]
    pub workload_terminated_time: u64,
    #[serde(default, rename = "metering_notification")]
    pub metering_notification_msg: MeteringNotification,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub blockchain_type: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub blockchain_name: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub blockchain_org: String,
    #[serde(default, rename = "workload_to_run")]
    pub running_workload: WorkloadInfo,
    #[serde(default)]
    pub agreement_timeout: u64,
    #[serde(default, rename = "service_definition_id")]
    pub service_def_id: String,
}

/// Older agreements listed dependent services as bare URLs.
#[derive(Deserialize)]
struct LegacySensorUrls {
    #[serde(default)]
    sensor_url: Option<Vec<String>>,
}

impl Record for EstablishedAgreement {
    fn from_bytes(bucket: &str, key: &str, bytes: &[u8]) -> StateResult<Self> {
        let mut agreement: EstablishedAgreement = decode(bucket, key, bytes)?;
        if agreement.dependent_services.is_none() {
            let legacy: LegacySensorUrls = decode(bucket, key, bytes)?;
            let services = legacy
                .sensor_url
                .unwrap_or_default()
                .into_iter()
                .map(|url| ServiceSpec::new(&url, ""))
                .collect();
            agreement.dependent_services = Some(services);
        }
        Ok(agreement)
    }
}

impl MergePolicy for EstablishedAgreement {
    fn merge_from(&mut self, update: &Self) {
        one_way_flag(&mut self.archived, update.archived);
        ratchet(&mut self.counter_party_address, &update.counter_party_address);
        ratchet(&mut self.agreement_accepted_time, &update.agreement_accepted_time);
        ratchet(&mut self.agreement_bc_update_ack_time, &update.agreement_bc_update_ack_time);
        ratchet(&mut self.agreement_finalized_time, &update.agreement_finalized_time);
        ratchet(&mut self.agreement_terminated_time, &update.agreement_terminated_time);
        monotonic_max(
            &mut self.agreement_force_terminated_time,
            &update.agreement_force_terminated_time,
        );
        ratchet(
            &mut self.agreement_execution_start_time,
            &update.agreement_execution_start_time,
        );
        monotonic_max(
            &mut self.agreement_data_received_time,
            &update.agreement_data_received_time,
        );
        emptiness_toggle(&mut self.current_deployment, &update.current_deployment);
        ratchet(&mut self.extended_deployment, &update.extended_deployment);
        ratchet(&mut self.terminated_reason, &update.terminated_reason);
        ratchet(&mut self.terminated_description, &update.terminated_description);
        ratchet(
            &mut self.agreement_protocol_terminated_time,
            &update.agreement_protocol_terminated_time,
        );
        ratchet(&mut self.workload_terminated_time, &update.workload_terminated_time);
        replace_if_non_default(
            &mut self.metering_notification_msg,
            &update.metering_notification_msg,
        );
        ratchet(&mut self.blockchain_type, &update.blockchain_type);
        ratchet(&mut self.blockchain_name, &update.blockchain_name);
        ratchet(&mut self.blockchain_org, &update.blockchain_org);
        ratchet(&mut self.proposal_sig, &update.proposal_sig);
        ratchet(&mut self.service_def_id, &update.service_def_id);
        replace_if_non_default(&mut self.agreement_timeout, &update.agreement_timeout);
    }
}

#[derive(Debug, Clone)]
pub enum AgreementFilter {
    Unarchived,
    Id(String),
    ServiceDefId(String),
}

impl RecordFilter<EstablishedAgreement> for AgreementFilter {
    fn matches(&self, ag: &EstablishedAgreement) -> bool {
        match self {
            AgreementFilter::Unarchived => !ag.archived,
            AgreementFilter::Id(id) => ag.current_agreement_id == *id,
            AgreementFilter::ServiceDefId(id) => ag.service_def_id == *id,
        }
    }
}

/// Deployment configuration recorded when a workload starts.
#[derive(Debug, Clone, PartialEq)]
pub enum DeploymentConfig {
    /// Native service configs by service name; merged into `current_deployment`.
    Native(BTreeMap<String, Value>),
    /// Any other deployment form, stored whole in `extended_deployment`.
    Extended(serde_json::Map<String, Value>),
}

/// Identifying data of a freshly negotiated agreement.
#[derive(Debug, Clone, Default)]
pub struct NewAgreement {
    pub name: String,
    pub agreement_id: String,
    pub consumer_id: String,
    pub proposal: String,
    pub protocol: String,
    pub protocol_version: i32,
    pub dependent_services: Vec<ServiceSpec>,
    pub signature: String,
    pub address: String,
    pub blockchain_type: String,
    pub blockchain_name: String,
    pub blockchain_org: String,
    pub workload: WorkloadInfo,
    pub agreement_timeout: u64,
}

impl NewAgreement {
    fn validate(&self) -> StateResult<()> {
        if self.name.is_empty()
            || self.agreement_id.is_empty()
            || self.consumer_id.is_empty()
            || self.proposal.is_empty()
            || self.protocol.is_empty()
            || self.protocol_version == 0
        {
            return Err(StateError::InvalidArgument(
                "agreement id, consumer id, proposal, protocol or protocol version is empty".into(),
            ));
        }
        Ok(())
    }

    fn into_record(self) -> EstablishedAgreement {
        EstablishedAgreement {
            name: self.name,
            dependent_services: Some(self.dependent_services),
            current_agreement_id: self.agreement_id,
            consumer_id: self.consumer_id,
            counter_party_address: self.address,
            agreement_creation_time: epoch_secs(),
            proposal: self.proposal,
            proposal_sig: self.signature,
            agreement_protocol: self.protocol,
            protocol_version: self.protocol_version,
            blockchain_type: self.blockchain_type,
            blockchain_name: self.blockchain_name,
            blockchain_org: self.blockchain_org,
            running_workload: self.workload,
            agreement_timeout: self.agreement_timeout,
            ..Default::default()
        }
    }
}

fn live_agreement(id: &str) -> [AgreementFilter; 2] {
    [AgreementFilter::Unarchived, AgreementFilter::Id(id.to_string())]
}

impl Store {
    /// Record a new agreement. Fails if an unarchived agreement with the same id exists.
    pub fn new_established_agreement(&self, new: NewAgreement) -> StateResult<EstablishedAgreement> {
        new.validate()?;
        let bucket = agreements_bucket(&new.protocol);
        let agreement = new.into_record();
        let id = agreement.current_agreement_id.clone();

        self.with_write(|txn| {
            let existing: Vec<EstablishedAgreement> = find_in(&*txn, &bucket, &live_agreement(&id))?;
            if !existing.is_empty() {
                return Err(StateError::Duplicate(format!(
                    "agreement {id} already exists in {bucket}"
                )));
            }
            put_record(txn, &bucket, &id, &agreement)
        })?;

        info!(agreement_id = %id, protocol = %agreement.agreement_protocol, "agreement recorded");
        Ok(agreement)
    }

    pub fn find_established_agreements(
        &self,
        protocol: &str,
        filters: &[AgreementFilter],
    ) -> StateResult<Vec<EstablishedAgreement>> {
        self.find_many(&agreements_bucket(protocol), filters)
    }

    pub fn find_established_agreements_all_protocols(
        &self,
        protocols: &[&str],
        filters: &[AgreementFilter],
    ) -> StateResult<Vec<EstablishedAgreement>> {
        let mut agreements = Vec::new();
        for protocol in protocols {
            agreements.extend(self.find_established_agreements(protocol, filters)?);
        }
        Ok(agreements)
    }

    /// Remove an agreement record. An absent agreement is not an error.
    pub fn delete_established_agreement(&self, agreement_id: &str, protocol: &str) -> StateResult<()> {
        if agreement_id.is_empty() {
            return Err(StateError::InvalidArgument("agreement id is empty".into()));
        }
        self.delete_by_key(&agreements_bucket(protocol), agreement_id)?;
        Ok(())
    }

    /// Merge `update` into the stored agreement and return the merged record.
    pub fn persist_updated_agreement(
        &self,
        agreement_id: &str,
        protocol: &str,
        update: &EstablishedAgreement,
    ) -> StateResult<EstablishedAgreement> {
        let merged = self.merge_update(&agreements_bucket(protocol), agreement_id, update)?;
        debug!(%agreement_id, protocol, "agreement updated");
        Ok(merged)
    }

    fn agreement_state_update(
        &self,
        agreement_id: &str,
        protocol: &str,
        mutate: impl FnOnce(&mut EstablishedAgreement),
    ) -> StateResult<EstablishedAgreement> {
        let bucket = agreements_bucket(protocol);
        self.with_write(|txn| {
            update_unique_in_txn(txn, &bucket, &live_agreement(agreement_id), agreement_id, mutate)
        })
    }

    pub fn archive_established_agreement(
        &self,
        agreement_id: &str,
        protocol: &str,
    ) -> StateResult<EstablishedAgreement> {
        self.agreement_state_update(agreement_id, protocol, |ag| {
            ag.archived = true;
            ag.current_deployment.clear();
        })
    }

    pub fn agreement_state_execution_started(
        &self,
        agreement_id: &str,
        protocol: &str,
    ) -> StateResult<EstablishedAgreement> {
        self.agreement_state_update(agreement_id, protocol, |ag| {
            ag.agreement_execution_start_time = epoch_secs();
        })
    }

    pub fn agreement_state_accepted(
        &self,
        agreement_id: &str,
        protocol: &str,
    ) -> StateResult<EstablishedAgreement> {
        self.agreement_state_update(agreement_id, protocol, |ag| {
            ag.agreement_accepted_time = epoch_secs();
        })
    }

    pub fn agreement_state_proposal_signed(
        &self,
        agreement_id: &str,
        protocol: &str,
        sig: &str,
    ) -> StateResult<EstablishedAgreement> {
        self.agreement_state_update(agreement_id, protocol, |ag| {
            ag.proposal_sig = sig.to_string();
        })
    }

    pub fn agreement_state_bc_data_received(
        &self,
        agreement_id: &str,
        protocol: &str,
        address: &str,
    ) -> StateResult<EstablishedAgreement> {
        self.agreement_state_update(agreement_id, protocol, |ag| {
            ag.counter_party_address = address.to_string();
        })
    }

    pub fn agreement_state_bc_update_acked(
        &self,
        agreement_id: &str,
        protocol: &str,
    ) -> StateResult<EstablishedAgreement> {
        self.agreement_state_update(agreement_id, protocol, |ag| {
            ag.agreement_bc_update_ack_time = epoch_secs();
        })
    }

    pub fn agreement_state_finalized(
        &self,
        agreement_id: &str,
        protocol: &str,
    ) -> StateResult<EstablishedAgreement> {
        self.agreement_state_update(agreement_id, protocol, |ag| {
            ag.agreement_finalized_time = epoch_secs();
        })
    }

    pub fn agreement_deployment_started(
        &self,
        agreement_id: &str,
        protocol: &str,
        deployment: DeploymentConfig,
    ) -> StateResult<EstablishedAgreement> {
        self.agreement_state_update(agreement_id, protocol, |ag| match deployment {
            DeploymentConfig::Native(services) => ag.current_deployment.extend(services),
            DeploymentConfig::Extended(config) => ag.extended_deployment = config,
        })
    }

    pub fn agreement_state_terminated(
        &self,
        agreement_id: &str,
        protocol: &str,
        reason: u64,
        description: &str,
    ) -> StateResult<EstablishedAgreement> {
        self.agreement_state_update(agreement_id, protocol, |ag| {
            ag.agreement_terminated_time = epoch_secs();
            ag.terminated_reason = reason;
            ag.terminated_description = description.to_string();
        })
    }

    pub fn agreement_state_force_terminated(
        &self,
        agreement_id: &str,
        protocol: &str,
    ) -> StateResult<EstablishedAgreement> {
        self.agreement_state_update(agreement_id, protocol, |ag| {
            ag.agreement_force_terminated_time = epoch_secs();
        })
    }

    pub fn agreement_state_data_received(
        &self,
        agreement_id: &str,
        protocol: &str,
    ) -> StateResult<EstablishedAgreement> {
        self.agreement_state_update(agreement_id, protocol, |ag| {
            ag.agreement_data_received_time = epoch_secs();
        })
    }

    pub fn agreement_state_agreement_protocol_terminated(
        &self,
        agreement_id: &str,
        protocol: &str,
    ) -> StateResult<EstablishedAgreement> {
        self.agreement_state_update(agreement_id, protocol, |ag| {
            ag.agreement_protocol_terminated_time = epoch_secs();
        })
    }

    pub fn agreement_state_workload_terminated(
        &self,
        agreement_id: &str,
        protocol: &str,
    ) -> StateResult<EstablishedAgreement> {
        self.agreement_state_update(agreement_id, protocol, |ag| {
            ag.workload_terminated_time = epoch_secs();
        })
    }

    pub fn metering_notification_received(
        &self,
        agreement_id: &str,
        protocol: &str,
        notification: MeteringNotification,
    ) -> StateResult<EstablishedAgreement> {
        self.agreement_state_update(agreement_id, protocol, |ag| {
            ag.metering_notification_msg = notification;
        })
    }

    pub fn set_agreement_timeout(
        &self,
        agreement_id: &str,
        protocol: &str,
        timeout_secs: u64,
    ) -> StateResult<EstablishedAgreement> {
        self.agreement_state_update(agreement_id, protocol, |ag| {
            ag.agreement_timeout = timeout_secs;
        })
    }

    pub fn set_agreement_service_def_id(
        &self,
        agreement_id: &str,
        protocol: &str,
        service_def_id: &str,
    ) -> StateResult<EstablishedAgreement> {
        self.agreement_state_update(agreement_id, protocol, |ag| {
            ag.service_def_id = service_def_id.to_string();
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::encode;
    use serde_json::json;

    fn new_agreement(id: &str) -> NewAgreement {
        NewAgreement {
            name: format!("agreement {id}"),
            agreement_id: id.to_string(),
            consumer_id: "agbot1".into(),
            proposal: "{}".into(),
            protocol: "Basic".into(),
            protocol_version: 2,
            workload: WorkloadInfo::new("svc", "org", "1.0.0", "amd64").unwrap(),
            ..Default::default()
        }
    }

    #[test]
    fn new_agreement_validates_and_rejects_duplicates() {
        let store = Store::open_in_memory().unwrap();
        let mut bad = new_agreement("ag1");
        bad.protocol_version = 0;
        let err = store.new_established_agreement(bad).unwrap_err();
        assert!(matches!(err, StateError::InvalidArgument(_)));

        let ag = store.new_established_agreement(new_agreement("ag1")).unwrap();
        assert!(ag.agreement_creation_time > 0);
        assert_eq!(ag.dependent_services, Some(vec![]));
        let err = store.new_established_agreement(new_agreement("ag1")).unwrap_err();
        assert!(matches!(err, StateError::Duplicate(_)));
    }

    #[test]
    fn archived_agreement_allows_new_with_same_id() {
        let store = Store::open_in_memory().unwrap();
        store.new_established_agreement(new_agreement("ag1")).unwrap();
        let archived = store.archive_established_agreement("ag1", "Basic").unwrap();
        assert!(archived.archived);
        store.new_established_agreement(new_agreement("ag1")).unwrap();
        let live = store
            .find_established_agreements("Basic", &[AgreementFilter::Unarchived])
            .unwrap();
        assert_eq!(live.len(), 1);
    }

    #[test]
    fn state_helpers_require_live_agreement() {
        let store = Store::open_in_memory().unwrap();
        let err = store.agreement_state_accepted("missing", "Basic").unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn terminate_sets_reason_once() {
        let store = Store::open_in_memory().unwrap();
        store.new_established_agreement(new_agreement("ag1")).unwrap();
        let first = store
            .agreement_state_terminated("ag1", "Basic", 101, "cancelled")
            .unwrap();
        assert_eq!(first.terminated_reason, 101);
        let second = store
            .agreement_state_terminated("ag1", "Basic", 202, "other")
            .unwrap();
        assert_eq!(second.terminated_reason, 101);
        assert_eq!(second.terminated_description, "cancelled");
        assert_eq!(second.agreement_terminated_time, first.agreement_terminated_time);
    }

    #[test]
    fn deployment_toggles_and_archive_clears_it() {
        let store = Store::open_in_memory().unwrap();
        store.new_established_agreement(new_agreement("ag1")).unwrap();
        let mut services = BTreeMap::new();
        services.insert("web".to_string(), json!({"image": "nginx"}));
        let started = store
            .agreement_deployment_started("ag1", "Basic", DeploymentConfig::Native(services))
            .unwrap();
        assert_eq!(started.current_deployment.len(), 1);

        let archived = store.archive_established_agreement("ag1", "Basic").unwrap();
        assert!(archived.current_deployment.is_empty());
        assert!(archived.archived);
    }

    #[test]
    fn timeout_and_service_def_id() {
        let store = Store::open_in_memory().unwrap();
        store.new_established_agreement(new_agreement("ag1")).unwrap();
        let ag = store.set_agreement_timeout("ag1", "Basic", 600).unwrap();
        assert_eq!(ag.agreement_timeout, 600);
        let ag = store.set_agreement_service_def_id("ag1", "Basic", "7").unwrap();
        assert_eq!(ag.service_def_id, "7");
        let found = store
            .find_established_agreements("Basic", &[AgreementFilter::ServiceDefId("7".into())])
            .unwrap();
        assert_eq!(found.len(), 1);
    }

    #[test]
    fn legacy_sensor_urls_become_dependent_services() {
        let payload = json!({
            "name": "old",
            "current_agreement_id": "ag9",
            "agreement_protocol": "Basic",
            "sensor_url": ["https://example.com/gps"],
            "current_deployment": null
        });
        let bytes = encode(&payload).unwrap();
        let ag = EstablishedAgreement::from_bytes("b", "ag9", &bytes).unwrap();
        assert_eq!(
            ag.dependent_services,
            Some(vec![ServiceSpec::new("https://example.com/gps", "")])
        );
        assert!(ag.current_deployment.is_empty());
    }

    #[test]
    fn delete_is_idempotent() {
        let store = Store::open_in_memory().unwrap();
        store.new_established_agreement(new_agreement("ag1")).unwrap();
        store.delete_established_agreement("ag1", "Basic").unwrap();
        store.delete_established_agreement("ag1", "Basic").unwrap();
        assert!(store.find_established_agreements("Basic", &[]).unwrap().is_empty());
        assert!(store.delete_established_agreement("", "Basic").is_err());
    }

    #[test]
    fn all_protocols_concatenates() {
        let store = Store::open_in_memory().unwrap();
        store.new_established_agreement(new_agreement("ag1")).unwrap();
        let mut other = new_agreement("ag2");
        other.protocol = "Citizen Scientist".into();
        store.new_established_agreement(other).unwrap();
        let all = store
            .find_established_agreements_all_protocols(&["Basic", "Citizen Scientist"], &[])
            .unwrap();
        assert_eq!(all.len(), 2);
    }
}
