//! Microservice definitions and running microservice instances.

use std::collections::BTreeMap;

use agentdb_core::{ServiceInstancePathElement, epoch_secs, exchange_id_from_spec_ref};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use crate::codec::{Record, null_as_default};
use crate::error::{StateError, StateResult};
use crate::filter::RecordFilter;
use crate::merge::{
    MergePolicy, always_set, one_way_flag, ratchet, replace_if_len_differs, update_by_key_in_txn,
};
use crate::store::{Store, put_record};
use crate::tables::{MICROSERVICE_DEFINITIONS, MICROSERVICE_INSTANCES};

// ── Definitions ────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MicroserviceDefinition {
    #[serde(rename = "record_id")]
    pub id: String,
    pub owner: String,
    pub label: String,
    pub description: String,
    #[serde(rename = "specRef")]
    pub spec_ref: String,
    #[serde(rename = "organization")]
    pub org: String,
    pub version: String,
    pub arch: String,
    pub sharable: String,
    #[serde(rename = "userInput", deserialize_with = "null_as_default")]
    pub user_inputs: Vec<Value>,
    pub public: bool,
    #[serde(rename = "requiredServices", deserialize_with = "null_as_default")]
    pub required_services: Vec<Value>,
    pub deployment: String,
    #[serde(rename = "deploymentSignature")]
    pub deployment_signature: String,
    #[serde(rename = "lastUpdated")]
    pub last_updated: String,
    pub archived: bool,
    pub name: String,
    pub upgrade_version_range: String,
    pub auto_upgrade: bool,
    pub active_upgrade: bool,
    pub upgrade_start_time: u64,
    pub upgrade_ms_unregistered_time: u64,
    pub upgrade_agreements_cleared_time: u64,
    pub upgrade_execution_start_time: u64,
    pub upgrade_ms_reregistered_time: u64,
    pub upgrade_failed_time: u64,
    pub upgrade_failure_reason: u64,
    pub upgrade_failure_description: String,
    pub upgrade_new_ms_id: String,
    pub metadata_hash: String,
}

impl Record for MicroserviceDefinition {}

impl MergePolicy for MicroserviceDefinition {
    fn merge_from(&mut self, update: &Self) {
        ratchet(&mut self.upgrade_start_time, &update.upgrade_start_time);
        ratchet(
            &mut self.upgrade_ms_unregistered_time,
            &update.upgrade_ms_unregistered_time,
        );
        ratchet(
            &mut self.upgrade_agreements_cleared_time,
            &update.upgrade_agreements_cleared_time,
        );
        ratchet(
            &mut self.upgrade_execution_start_time,
            &update.upgrade_execution_start_time,
        );
        ratchet(
            &mut self.upgrade_ms_reregistered_time,
            &update.upgrade_ms_reregistered_time,
        );
        ratchet(&mut self.upgrade_failed_time, &update.upgrade_failed_time);
        ratchet(&mut self.upgrade_failure_reason, &update.upgrade_failure_reason);
        ratchet(
            &mut self.upgrade_failure_description,
            &update.upgrade_failure_description,
        );
        one_way_flag(&mut self.archived, update.archived);
        always_set(&mut self.upgrade_new_ms_id, &update.upgrade_new_ms_id);
        always_set(&mut self.upgrade_version_range, &update.upgrade_version_range);
    }
}

#[derive(Debug, Clone)]
pub enum MicroserviceDefFilter {
    Unarchived,
    Url(String),
    Org(String),
    Version(String),
    Arch(String),
}

impl RecordFilter<MicroserviceDefinition> for MicroserviceDefFilter {
    fn matches(&self, def: &MicroserviceDefinition) -> bool {
        match self {
            MicroserviceDefFilter::Unarchived => !def.archived,
            MicroserviceDefFilter::Url(url) => def.spec_ref == *url,
            MicroserviceDefFilter::Org(org) => def.org == *org,
            MicroserviceDefFilter::Version(version) => def.version == *version,
            MicroserviceDefFilter::Arch(arch) => def.arch == *arch,
        }
    }
}

impl Store {
    /// Store a definition under a freshly minted sequence id, which is written
    /// back into `def.id`.
    pub fn save_or_update_microservice_def(&self, def: &mut MicroserviceDefinition) -> StateResult<()> {
        self.with_write(|txn| {
            let seq = txn.next_sequence(MICROSERVICE_DEFINITIONS)?;
            def.id = seq.to_string();
            put_record(txn, MICROSERVICE_DEFINITIONS, &def.id, &*def)
        })?;
        info!(id = %def.id, url = %def.spec_ref, version = %def.version, "service definition saved");
        Ok(())
    }

    pub fn find_microservice_def_with_key(&self, key: &str) -> StateResult<Option<MicroserviceDefinition>> {
        self.find_by_key(MICROSERVICE_DEFINITIONS, key)
    }

    pub fn find_microservice_defs(
        &self,
        filters: &[MicroserviceDefFilter],
    ) -> StateResult<Vec<MicroserviceDefinition>> {
        self.find_many(MICROSERVICE_DEFINITIONS, filters)
    }

    pub fn persist_updated_microservice_def(
        &self,
        key: &str,
        update: &MicroserviceDefinition,
    ) -> StateResult<MicroserviceDefinition> {
        let merged = self.merge_update(MICROSERVICE_DEFINITIONS, key, update)?;
        debug!(%key, "service definition updated");
        Ok(merged)
    }

    fn microservice_def_state_update(
        &self,
        key: &str,
        mutate: impl FnOnce(&mut MicroserviceDefinition),
    ) -> StateResult<MicroserviceDefinition> {
        self.update_by_key(MICROSERVICE_DEFINITIONS, key, mutate)
    }

    pub fn microservice_def_archived(&self, key: &str) -> StateResult<MicroserviceDefinition> {
        self.microservice_def_state_update(key, |def| def.archived = true)
    }

    pub fn microservice_def_upgrade_new_ms_id(
        &self,
        key: &str,
        new_id: &str,
    ) -> StateResult<MicroserviceDefinition> {
        self.microservice_def_state_update(key, |def| def.upgrade_new_ms_id = new_id.to_string())
    }

    pub fn microservice_def_upgrade_started(&self, key: &str) -> StateResult<MicroserviceDefinition> {
        self.microservice_def_state_update(key, |def| def.upgrade_start_time = epoch_secs())
    }

    pub fn microservice_def_upgrade_ms_unregistered(
        &self,
        key: &str,
    ) -> StateResult<MicroserviceDefinition> {
        self.microservice_def_state_update(key, |def| {
            def.upgrade_ms_unregistered_time = epoch_secs()
        })
    }

    pub fn microservice_def_upgrade_agreements_cleared(
        &self,
        key: &str,
    ) -> StateResult<MicroserviceDefinition> {
        self.microservice_def_state_update(key, |def| {
            def.upgrade_agreements_cleared_time = epoch_secs()
        })
    }

    pub fn microservice_def_upgrade_execution_started(
        &self,
        key: &str,
    ) -> StateResult<MicroserviceDefinition> {
        self.microservice_def_state_update(key, |def| {
            def.upgrade_execution_start_time = epoch_secs()
        })
    }

    pub fn microservice_def_upgrade_ms_reregistered(
        &self,
        key: &str,
    ) -> StateResult<MicroserviceDefinition> {
        self.microservice_def_state_update(key, |def| {
            def.upgrade_ms_reregistered_time = epoch_secs()
        })
    }

    pub fn microservice_def_upgrade_failed(
        &self,
        key: &str,
        reason: u64,
        description: &str,
    ) -> StateResult<MicroserviceDefinition> {
        self.microservice_def_state_update(key, |def| {
            def.upgrade_failed_time = epoch_secs();
            def.upgrade_failure_reason = reason;
            def.upgrade_failure_description = description.to_string();
        })
    }
}

// ── Instances ──────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MicroserviceInstance {
    #[serde(rename = "ref_url")]
    pub spec_ref: String,
    #[serde(rename = "organization")]
    pub org: String,
    pub version: String,
    pub arch: String,
    pub instance_id: String,
    pub archived: bool,
    pub instance_creation_time: u64,
    pub execution_start_time: u64,
    pub execution_failure_code: u64,
    pub execution_failure_desc: String,
    pub cleanup_start_time: u64,
    #[serde(deserialize_with = "null_as_default")]
    pub associated_agreements: Vec<String>,
    #[serde(rename = "microservicedef_id")]
    pub microservice_def_id: String,
    pub max_retries: u64,
    pub max_retry_duration: u64,
    pub current_retry_count: u64,
    pub retry_start_time: u64,
    #[serde(deserialize_with = "null_as_default")]
    pub env_vars: BTreeMap<String, String>,
    /// Dependency paths from each top-level service down to this instance.
    #[serde(rename = "service_instance_path", deserialize_with = "null_as_default")]
    pub parent_path: Vec<Vec<ServiceInstancePathElement>>,
    pub agreement_less: bool,
}

impl MicroserviceInstance {
    /// Natural key: `{org}_{exchange id of url}_{version}_{instance id}`.
    pub fn key(&self) -> String {
        make_ms_instance_key(&self.spec_ref, &self.org, &self.version, &self.instance_id)
    }
}

pub fn make_ms_instance_key(url: &str, org: &str, version: &str, instance_id: &str) -> String {
    format!(
        "{org}_{}_{version}_{instance_id}",
        exchange_id_from_spec_ref(url)
    )
}

impl Record for MicroserviceInstance {}

impl MergePolicy for MicroserviceInstance {
    fn merge_from(&mut self, update: &Self) {
        one_way_flag(&mut self.archived, update.archived);
        ratchet(&mut self.instance_creation_time, &update.instance_creation_time);
        always_set(&mut self.execution_start_time, &update.execution_start_time);
        always_set(&mut self.execution_failure_code, &update.execution_failure_code);
        always_set(&mut self.execution_failure_desc, &update.execution_failure_desc);
        always_set(&mut self.cleanup_start_time, &update.cleanup_start_time);
        always_set(&mut self.associated_agreements, &update.associated_agreements);
        always_set(&mut self.retry_start_time, &update.retry_start_time);
        always_set(&mut self.max_retries, &update.max_retries);
        always_set(&mut self.max_retry_duration, &update.max_retry_duration);
        always_set(&mut self.current_retry_count, &update.current_retry_count);
        always_set(&mut self.env_vars, &update.env_vars);
        replace_if_len_differs(&mut self.parent_path, &update.parent_path);
        one_way_flag(&mut self.agreement_less, update.agreement_less);
    }
}

#[derive(Debug, Clone)]
pub enum MicroserviceInstFilter {
    Unarchived,
    Url(String),
    Org(String),
    Version(String),
    DefId(String),
    AgreementLess,
}

impl RecordFilter<MicroserviceInstance> for MicroserviceInstFilter {
    fn matches(&self, inst: &MicroserviceInstance) -> bool {
        match self {
            MicroserviceInstFilter::Unarchived => !inst.archived,
            MicroserviceInstFilter::Url(url) => inst.spec_ref == *url,
            MicroserviceInstFilter::Org(org) => inst.org == *org,
            MicroserviceInstFilter::Version(version) => inst.version == *version,
            MicroserviceInstFilter::DefId(id) => inst.microservice_def_id == *id,
            MicroserviceInstFilter::AgreementLess => inst.agreement_less,
        }
    }
}

impl Store {
    /// Create and store a new instance. `parent` is the dependency path that
    /// led to it; empty for top-level services.
    #[allow(clippy::too_many_arguments)]
    pub fn new_microservice_instance(
        &self,
        url: &str,
        org: &str,
        version: &str,
        instance_id: &str,
        microservice_def_id: &str,
        parent: Vec<ServiceInstancePathElement>,
        agreement_less: bool,
    ) -> StateResult<MicroserviceInstance> {
        if url.is_empty() || version.is_empty() || instance_id.is_empty() {
            return Err(StateError::InvalidArgument(
                "service url, version or instance id is empty".into(),
            ));
        }
        let inst = MicroserviceInstance {
            spec_ref: url.to_string(),
            org: org.to_string(),
            version: version.to_string(),
            instance_id: instance_id.to_string(),
            instance_creation_time: epoch_secs(),
            microservice_def_id: microservice_def_id.to_string(),
            parent_path: if parent.is_empty() { Vec::new() } else { vec![parent] },
            agreement_less,
            ..Default::default()
        };
        self.save_microservice_instance(&inst)?;
        Ok(inst)
    }

    /// Store an instance under its natural key, replacing any previous record.
    pub fn save_microservice_instance(&self, inst: &MicroserviceInstance) -> StateResult<()> {
        self.put_by_key(MICROSERVICE_INSTANCES, &inst.key(), inst)
    }

    /// Locate an instance by identity. Instances recorded without an org
    /// match any org.
    pub fn find_microservice_instance(
        &self,
        url: &str,
        org: &str,
        version: &str,
        instance_id: &str,
    ) -> StateResult<Option<MicroserviceInstance>> {
        let found = self.find_microservice_instances(&[])?;
        Ok(found.into_iter().find(|inst| {
            inst.spec_ref == url
                && inst.version == version
                && inst.instance_id == instance_id
                && (inst.org.is_empty() || inst.org == org)
        }))
    }

    pub fn find_microservice_instance_with_key(
        &self,
        key: &str,
    ) -> StateResult<Option<MicroserviceInstance>> {
        self.find_by_key(MICROSERVICE_INSTANCES, key)
    }

    pub fn find_microservice_instances(
        &self,
        filters: &[MicroserviceInstFilter],
    ) -> StateResult<Vec<MicroserviceInstance>> {
        self.find_many(MICROSERVICE_INSTANCES, filters)
    }

    pub fn persist_updated_microservice_instance(
        &self,
        key: &str,
        update: &MicroserviceInstance,
    ) -> StateResult<MicroserviceInstance> {
        let merged = self.merge_update(MICROSERVICE_INSTANCES, key, update)?;
        debug!(%key, "service instance updated");
        Ok(merged)
    }

    /// Remove an instance, returning it. An absent instance yields `None`.
    pub fn delete_microservice_instance(&self, key: &str) -> StateResult<Option<MicroserviceInstance>> {
        if key.is_empty() {
            return Err(StateError::InvalidArgument("service instance key is empty".into()));
        }
        self.take_by_key(MICROSERVICE_INSTANCES, key)
    }

    fn microservice_instance_state_update(
        &self,
        key: &str,
        mutate: impl FnOnce(&mut MicroserviceInstance),
    ) -> StateResult<MicroserviceInstance> {
        self.with_write(|txn| update_by_key_in_txn(txn, MICROSERVICE_INSTANCES, key, mutate))
    }

    pub fn archive_microservice_instance(&self, key: &str) -> StateResult<MicroserviceInstance> {
        self.microservice_instance_state_update(key, |inst| inst.archived = true)
    }

    /// Record the outcome of starting the instance. A failure clears the start time.
    pub fn update_ms_instance_execution_state(
        &self,
        key: &str,
        started: bool,
        failure_code: u64,
        failure_desc: &str,
    ) -> StateResult<MicroserviceInstance> {
        self.microservice_instance_state_update(key, |inst| {
            if started {
                inst.execution_start_time = epoch_secs();
                inst.execution_failure_code = 0;
                inst.execution_failure_desc.clear();
            } else {
                inst.execution_start_time = 0;
                inst.execution_failure_code = failure_code;
                inst.execution_failure_desc = failure_desc.to_string();
            }
        })
    }

    pub fn microservice_instance_cleanup_started(&self, key: &str) -> StateResult<MicroserviceInstance> {
        self.microservice_instance_state_update(key, |inst| inst.cleanup_start_time = epoch_secs())
    }

    /// Add or remove one associated agreement id.
    pub fn update_ms_instance_associated_agreements(
        &self,
        key: &str,
        add: bool,
        agreement_id: &str,
    ) -> StateResult<MicroserviceInstance> {
        self.microservice_instance_state_update(key, |inst| {
            let present = inst.associated_agreements.iter().any(|a| a == agreement_id);
            if add && !present {
                inst.associated_agreements.push(agreement_id.to_string());
            } else if !add {
                inst.associated_agreements.retain(|a| a != agreement_id);
            }
        })
    }

    pub fn update_ms_instance_agreement_less(&self, key: &str) -> StateResult<MicroserviceInstance> {
        self.microservice_instance_state_update(key, |inst| inst.agreement_less = true)
    }

    pub fn set_ms_instance_retry_policy(
        &self,
        key: &str,
        max_retries: u64,
        max_retry_duration: u64,
    ) -> StateResult<MicroserviceInstance> {
        self.microservice_instance_state_update(key, |inst| {
            inst.max_retries = max_retries;
            inst.max_retry_duration = max_retry_duration;
        })
    }

    /// Start or end a retry window. Both reset the retry counter.
    pub fn update_ms_instance_retry_state(
        &self,
        key: &str,
        started: bool,
    ) -> StateResult<MicroserviceInstance> {
        self.microservice_instance_state_update(key, |inst| {
            inst.retry_start_time = if started { epoch_secs() } else { 0 };
            inst.current_retry_count = 0;
        })
    }

    pub fn update_ms_instance_current_retry_count(
        &self,
        key: &str,
        count: u64,
    ) -> StateResult<MicroserviceInstance> {
        self.microservice_instance_state_update(key, |inst| inst.current_retry_count = count)
    }

    pub fn update_ms_instance_env_vars(
        &self,
        key: &str,
        env_vars: BTreeMap<String, String>,
    ) -> StateResult<MicroserviceInstance> {
        self.microservice_instance_state_update(key, |inst| inst.env_vars = env_vars)
    }

    pub fn add_ms_instance_parent_path(
        &self,
        key: &str,
        path: Vec<ServiceInstancePathElement>,
    ) -> StateResult<MicroserviceInstance> {
        self.microservice_instance_state_update(key, |inst| {
            if !inst.parent_path.contains(&path) {
                inst.parent_path.push(path);
            }
        })
    }

    pub fn remove_ms_instance_parent_path(
        &self,
        key: &str,
        path: &[ServiceInstancePathElement],
    ) -> StateResult<MicroserviceInstance> {
        self.microservice_instance_state_update(key, |inst| {
            inst.parent_path.retain(|p| p.as_slice() != path)
        })
    }
}
