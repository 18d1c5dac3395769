//! Which secret updates each microservice instance has already received.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::codec::{Record, null_as_default};
use crate::error::{StateError, StateResult};
use crate::merge::{MergePolicy, always_set};
use crate::store::{Store, scan_records};
use crate::tables::SECRET_STATUS;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretStatus {
    pub secret_name: String,
    pub update_time: u64,
}

impl SecretStatus {
    pub fn new(secret_name: &str, update_time: u64) -> Self {
        Self {
            secret_name: secret_name.to_string(),
            update_time,
        }
    }
}

#[derive(Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MicroserviceSecretStatusInst {
    #[serde(rename = "MsInstKey")]
    pub ms_inst_key: String,
    #[serde(rename = "ESSToken")]
    pub ess_token: String,
    #[serde(rename = "SecretsStatus", default, deserialize_with = "null_as_default")]
    pub secrets_status: BTreeMap<String, SecretStatus>,
}

// The token stays out of logs.
impl fmt::Debug for MicroserviceSecretStatusInst {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MicroserviceSecretStatusInst")
            .field("ms_inst_key", &self.ms_inst_key)
            .field("ess_token", &"********")
            .field("secrets_status", &self.secrets_status)
            .finish()
    }
}

impl Record for MicroserviceSecretStatusInst {}

impl MergePolicy for MicroserviceSecretStatusInst {
    fn merge_from(&mut self, proposed: &Self) {
        always_set(&mut self.ess_token, &proposed.ess_token);
        always_set(&mut self.secrets_status, &proposed.secrets_status);
    }
}

impl Store {
    /// Register an instance with its ESS token and no secret status yet.
    pub fn new_mss_inst(
        &self,
        ms_inst_key: &str,
        ess_token: &str,
    ) -> StateResult<MicroserviceSecretStatusInst> {
        if ms_inst_key.is_empty() || ess_token.is_empty() {
            return Err(StateError::InvalidArgument(
                "instance key or ESS token is empty".into(),
            ));
        }
        let inst = MicroserviceSecretStatusInst {
            ms_inst_key: ms_inst_key.to_string(),
            ess_token: ess_token.to_string(),
            secrets_status: BTreeMap::new(),
        };
        self.put_by_key(SECRET_STATUS, ms_inst_key, &inst)?;
        Ok(inst)
    }

    pub fn find_mss_inst_with_key(
        &self,
        ms_inst_key: &str,
    ) -> StateResult<Option<MicroserviceSecretStatusInst>> {
        self.find_by_key(SECRET_STATUS, ms_inst_key)
    }

    pub fn find_mss_inst_with_ess_token(
        &self,
        ess_token: &str,
    ) -> StateResult<Option<MicroserviceSecretStatusInst>> {
        self.with_read(|txn| {
            Ok(scan_records::<MicroserviceSecretStatusInst, _>(txn, SECRET_STATUS)?
                .into_iter()
                .map(|(_, inst)| inst)
                .find(|inst| inst.ess_token == ess_token))
        })
    }

    /// Remove an instance and return it. An absent instance is not an error.
    pub fn delete_mss_inst_with_key(
        &self,
        ms_inst_key: &str,
    ) -> StateResult<Option<MicroserviceSecretStatusInst>> {
        self.take_by_key(SECRET_STATUS, ms_inst_key)
    }

    pub fn delete_mss_inst_with_ess_token(
        &self,
        ess_token: &str,
    ) -> StateResult<Option<MicroserviceSecretStatusInst>> {
        match self.find_mss_inst_with_ess_token(ess_token)? {
            Some(inst) => self.delete_mss_inst_with_key(&inst.ms_inst_key),
            None => Ok(None),
        }
    }

    /// Record that the instance has seen `status`. The instance must exist.
    pub fn save_secret_status(
        &self,
        ms_inst_key: &str,
        status: SecretStatus,
    ) -> StateResult<MicroserviceSecretStatusInst> {
        let name = status.secret_name.clone();
        let updated = self.update_by_key(
            SECRET_STATUS,
            ms_inst_key,
            |inst: &mut MicroserviceSecretStatusInst| {
                inst.secrets_status.insert(status.secret_name.clone(), status);
            },
        )?;
        debug!(instance = ms_inst_key, secret = %name, "secret status saved");
        Ok(updated)
    }

    pub fn persist_updated_mss_inst(
        &self,
        ms_inst_key: &str,
        update: &MicroserviceSecretStatusInst,
    ) -> StateResult<MicroserviceSecretStatusInst> {
        self.merge_update(SECRET_STATUS, ms_inst_key, update)
    }

    pub fn find_secret_status(
        &self,
        ms_inst_key: &str,
        secret_name: &str,
    ) -> StateResult<Option<SecretStatus>> {
        Ok(self
            .find_mss_inst_with_key(ms_inst_key)?
            .and_then(|mut inst| inst.secrets_status.remove(secret_name)))
    }

    /// Names of the instance's secrets updated after the instance last saw them.
    pub fn find_updated_secrets_for_mss_instance(&self, ms_inst_key: &str) -> StateResult<Vec<String>> {
        let Some(inst) = self.find_mss_inst_with_key(ms_inst_key)? else {
            return Ok(Vec::new());
        };
        let Some(secrets) = self.find_all_secrets_for_ms(ms_inst_key)? else {
            return Ok(Vec::new());
        };
        Ok(secrets
            .secrets_map
            .into_iter()
            .filter(|(_, secret)| secret.is_updated())
            .filter(|(name, secret)| match inst.secrets_status.get(name) {
                Some(seen) => secret.time_last_updated > seen.update_time,
                None => true,
            })
            .map(|(name, _)| name)
            .collect())
    }
}
