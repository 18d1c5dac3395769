//! Service secrets: lists staged per agreement, then maps per microservice instance.
//!
//! Agreement-scoped lists hold the bindings until the instance exists; after
//! that the secrets live under the instance key, one entry per secret name.

use std::collections::BTreeMap;

use agentdb_core::{epoch_secs, exchange_id_from_spec_ref};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::codec::{Record, null_as_default};
use crate::error::{StateError, StateResult};
use crate::filter::RecordFilter;
use crate::store::{Store, find_in, get_record, put_record};
use crate::tables::{AGREEMENT_SECRETS, SECRETS};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct PersistedServiceSecret {
    pub svc_orgid: String,
    pub svc_url: String,
    pub svc_arch: String,
    pub svc_version_range: String,
    pub svc_secret_name: String,
    pub svc_secret_value: String,
    #[serde(deserialize_with = "null_as_default")]
    pub agreement_ids: Vec<String>,
    #[serde(deserialize_with = "null_as_default")]
    pub container_ids: Vec<String>,
    pub time_created: u64,
    pub time_last_updated: u64,
}

impl PersistedServiceSecret {
    /// Updated since creation.
    pub fn is_updated(&self) -> bool {
        self.time_last_updated != 0 && self.time_last_updated > self.time_created
    }
}

/// All secrets of one microservice instance.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct PersistedServiceSecrets {
    pub ms_inst_key: String,
    /// The instance's concrete version; the secrets themselves carry the binding's range.
    pub ms_inst_vers: String,
    pub ms_inst_url: String,
    pub ms_inst_org: String,
    #[serde(deserialize_with = "null_as_default")]
    pub secrets_map: BTreeMap<String, PersistedServiceSecret>,
}

impl Record for PersistedServiceSecrets {}
impl Record for Vec<PersistedServiceSecret> {}

/// Secret binding as carried by an agreement proposal: per service, a list of
/// `service secret name -> vault secret name` maps.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SecretBinding {
    #[serde(rename = "serviceOrgid")]
    pub service_orgid: String,
    #[serde(rename = "serviceUrl")]
    pub service_url: String,
    #[serde(rename = "serviceArch")]
    pub service_arch: String,
    #[serde(rename = "serviceVersionRange")]
    pub service_version_range: String,
    #[serde(deserialize_with = "null_as_default")]
    pub secrets: Vec<BTreeMap<String, String>>,
}

/// Flatten bindings into one persisted secret per name, attributed to `agreement_id`.
pub fn persisted_secrets_from_bindings(
    bindings: &[SecretBinding],
    agreement_id: &str,
) -> Vec<PersistedServiceSecret> {
    bindings
        .iter()
        .flat_map(|binding| {
            binding.secrets.iter().flat_map(move |names| {
                names.iter().map(move |(name, value)| PersistedServiceSecret {
                    svc_orgid: binding.service_orgid.clone(),
                    svc_url: binding.service_url.clone(),
                    svc_arch: binding.service_arch.clone(),
                    svc_version_range: binding.service_version_range.clone(),
                    svc_secret_name: name.clone(),
                    svc_secret_value: value.clone(),
                    agreement_ids: vec![agreement_id.to_string()],
                    ..Default::default()
                })
            })
        })
        .collect()
}

/// Append the items of `extra` missing from `base`, keeping order.
fn merge_ids(base: &mut Vec<String>, extra: &[String]) {
    for id in extra {
        if !base.contains(id) {
            base.push(id.clone());
        }
    }
}

pub enum SecretFilter {
    /// Same service once both sides are reduced to exchange ids.
    Url(String),
    Org(String),
}

impl RecordFilter<PersistedServiceSecrets> for SecretFilter {
    fn matches(&self, secrets: &PersistedServiceSecrets) -> bool {
        match self {
            SecretFilter::Url(url) => {
                exchange_id_from_spec_ref(&secrets.ms_inst_url) == exchange_id_from_spec_ref(url)
            }
            SecretFilter::Org(org) => secrets.ms_inst_org == *org,
        }
    }
}

impl Store {
    // ── Agreement-scoped ───────────────────────────────────────────

    pub fn save_agreement_secrets(
        &self,
        agreement_id: &str,
        secrets: &[PersistedServiceSecret],
    ) -> StateResult<()> {
        if agreement_id.is_empty() {
            return Err(StateError::InvalidArgument("agreement id is empty".into()));
        }
        self.put_by_key(AGREEMENT_SECRETS, agreement_id, &secrets.to_vec())
    }

    pub fn find_agreement_secrets(
        &self,
        agreement_id: &str,
    ) -> StateResult<Option<Vec<PersistedServiceSecret>>> {
        self.find_by_key(AGREEMENT_SECRETS, agreement_id)
    }

    pub fn delete_agreement_secrets(&self, agreement_id: &str) -> StateResult<()> {
        self.delete_by_key(AGREEMENT_SECRETS, agreement_id)?;
        Ok(())
    }

    // ── Instance-scoped ────────────────────────────────────────────

    /// Save one secret for an instance.
    ///
    /// A new secret is stamped created and updated now. An existing one keeps
    /// its creation time, gains any new agreement and container ids, and has
    /// its last-updated time advanced only when the value changed.
    pub fn save_secret(
        &self,
        secret_name: &str,
        ms_inst_key: &str,
        ms_inst_vers: &str,
        secret: PersistedServiceSecret,
    ) -> StateResult<PersistedServiceSecret> {
        if secret_name.is_empty() || ms_inst_key.is_empty() {
            return Err(StateError::InvalidArgument(
                "secret name or instance key is empty".into(),
            ));
        }
        let saved = self.with_write(|txn| {
            let mut all: PersistedServiceSecrets = get_record(&*txn, SECRETS, ms_inst_key)?
                .unwrap_or_else(|| PersistedServiceSecrets {
                    ms_inst_key: ms_inst_key.to_string(),
                    ms_inst_vers: ms_inst_vers.to_string(),
                    ms_inst_url: secret.svc_url.clone(),
                    ms_inst_org: secret.svc_orgid.clone(),
                    secrets_map: BTreeMap::new(),
                });
            let now = epoch_secs();
            let saved = match all.secrets_map.get_mut(secret_name) {
                Some(current) => {
                    merge_ids(&mut current.agreement_ids, &secret.agreement_ids);
                    merge_ids(&mut current.container_ids, &secret.container_ids);
                    if current.svc_secret_value != secret.svc_secret_value {
                        current.svc_secret_value = secret.svc_secret_value;
                        current.time_last_updated = now;
                    }
                    current.clone()
                }
                None => {
                    let mut fresh = secret;
                    if fresh.time_created == 0 {
                        fresh.time_created = now;
                    }
                    fresh.time_last_updated = now;
                    all.secrets_map.insert(secret_name.to_string(), fresh.clone());
                    fresh
                }
            };
            put_record(txn, SECRETS, ms_inst_key, &all)?;
            Ok(saved)
        })?;
        debug!(secret = secret_name, instance = ms_inst_key, "service secret saved");
        Ok(saved)
    }

    /// Replace every secret of an instance.
    pub fn save_all_secrets_for_service(
        &self,
        ms_inst_key: &str,
        secrets: &PersistedServiceSecrets,
    ) -> StateResult<()> {
        self.put_by_key(SECRETS, ms_inst_key, secrets)
    }

    pub fn find_all_secrets_for_ms(
        &self,
        ms_inst_key: &str,
    ) -> StateResult<Option<PersistedServiceSecrets>> {
        self.find_by_key(SECRETS, ms_inst_key)
    }

    pub fn find_single_secret_for_service(
        &self,
        secret_name: &str,
        ms_inst_key: &str,
    ) -> StateResult<Option<PersistedServiceSecret>> {
        Ok(self
            .find_all_secrets_for_ms(ms_inst_key)?
            .and_then(|mut all| all.secrets_map.remove(secret_name)))
    }

    /// Record that `container_id` mounts the secret.
    pub fn add_container_id_to_secret(
        &self,
        secret_name: &str,
        ms_inst_key: &str,
        container_id: &str,
    ) -> StateResult<()> {
        self.with_write(|txn| {
            let mut all: PersistedServiceSecrets = get_record(&*txn, SECRETS, ms_inst_key)?
                .ok_or_else(|| StateError::NotFound(format!("no secrets for {ms_inst_key}")))?;
            let secret = all.secrets_map.get_mut(secret_name).ok_or_else(|| {
                StateError::NotFound(format!("no secret {secret_name} for {ms_inst_key}"))
            })?;
            if secret.container_ids.iter().any(|c| c == container_id) {
                return Ok(());
            }
            secret.container_ids.push(container_id.to_string());
            put_record(txn, SECRETS, ms_inst_key, &all)
        })
    }

    pub fn find_all_service_secrets_with_filters(
        &self,
        filters: &[SecretFilter],
    ) -> StateResult<Vec<PersistedServiceSecrets>> {
        self.find_many(SECRETS, filters)
    }

    pub fn find_all_service_secrets_with_specs(
        &self,
        svc_url: &str,
        svc_org: &str,
    ) -> StateResult<Vec<PersistedServiceSecrets>> {
        self.find_all_service_secrets_with_filters(&[
            SecretFilter::Url(svc_url.to_string()),
            SecretFilter::Org(svc_org.to_string()),
        ])
    }

    /// Remove one secret from an instance and return it. The instance record
    /// goes away with its last secret. Nothing stored is not an error.
    pub fn delete_secrets(
        &self,
        secret_name: &str,
        ms_inst_key: &str,
    ) -> StateResult<Option<PersistedServiceSecret>> {
        self.with_write(|txn| {
            let Some(mut all) = get_record::<PersistedServiceSecrets, _>(&*txn, SECRETS, ms_inst_key)?
            else {
                return Ok(None);
            };
            let removed = all.secrets_map.remove(secret_name);
            if all.secrets_map.is_empty() {
                txn.delete(SECRETS, ms_inst_key)?;
            } else if removed.is_some() {
                put_record(txn, SECRETS, ms_inst_key, &all)?;
            }
            Ok(removed)
        })
    }

    /// Remove a secret from every instance of the service `svc_url`/`svc_org`.
    /// Returns how many instances held it.
    pub fn delete_secrets_spec(
        &self,
        secret_name: &str,
        svc_url: &str,
        svc_org: &str,
    ) -> StateResult<usize> {
        let filters = [
            SecretFilter::Url(svc_url.to_string()),
            SecretFilter::Org(svc_org.to_string()),
        ];
        self.with_write(|txn| {
            let matching: Vec<PersistedServiceSecrets> = find_in(&*txn, SECRETS, &filters)?;
            let mut removed = 0;
            for mut all in matching {
                if all.secrets_map.remove(secret_name).is_some() {
                    put_record(txn, SECRETS, &all.ms_inst_key, &all)?;
                    removed += 1;
                }
            }
            Ok(removed)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secret(value: &str, agreement: &str) -> PersistedServiceSecret {
        PersistedServiceSecret {
            svc_orgid: "myorg".into(),
            svc_url: "https://example.com/netspeed".into(),
            svc_version_range: "[1.0.0,INFINITY)".into(),
            svc_secret_name: "db_password".into(),
            svc_secret_value: value.into(),
            agreement_ids: vec![agreement.into()],
            ..Default::default()
        }
    }

    #[test]
    fn persisted_with_pascal_case_names() {
        let json = serde_json::to_value(secret("vault/pw", "ag1")).unwrap();
        assert_eq!(json["SvcSecretValue"], "vault/pw");
        assert_eq!(json["AgreementIds"][0], "ag1");
        let legacy: PersistedServiceSecret =
            serde_json::from_str(r#"{"SvcSecretName":"x","ContainerIds":null}"#).unwrap();
        assert!(legacy.container_ids.is_empty());
    }

    #[test]
    fn bindings_flatten_per_name() {
        let binding = SecretBinding {
            service_orgid: "myorg".into(),
            service_url: "netspeed".into(),
            secrets: vec![BTreeMap::from([
                ("a".to_string(), "vault/a".to_string()),
                ("b".to_string(), "vault/b".to_string()),
            ])],
            ..Default::default()
        };
        let secrets = persisted_secrets_from_bindings(&[binding], "ag1");
        assert_eq!(secrets.len(), 2);
        assert_eq!(secrets[0].svc_secret_name, "a");
        assert_eq!(secrets[1].svc_secret_value, "vault/b");
        assert_eq!(secrets[1].agreement_ids, vec!["ag1".to_string()]);
    }

    #[test]
    fn agreement_secrets_round_trip() {
        let store = Store::open_in_memory().unwrap();
        assert_eq!(store.find_agreement_secrets("ag1").unwrap(), None);
        store
            .save_agreement_secrets("ag1", &[secret("v", "ag1")])
            .unwrap();
        assert_eq!(store.find_agreement_secrets("ag1").unwrap().unwrap().len(), 1);
        store.delete_agreement_secrets("ag1").unwrap();
        store.delete_agreement_secrets("ag1").unwrap();
        assert_eq!(store.find_agreement_secrets("ag1").unwrap(), None);
    }

    #[test]
    fn save_secret_merges_ids_and_tracks_value_changes() {
        let store = Store::open_in_memory().unwrap();
        let first = store
            .save_secret("db_password", "inst1", "1.2.0", secret("v1", "ag1"))
            .unwrap();
        assert!(first.time_created > 0);

        let mut again = secret("v1", "ag2");
        again.container_ids = vec!["c1".into()];
        let merged = store
            .save_secret("db_password", "inst1", "1.2.0", again)
            .unwrap();
        assert_eq!(merged.agreement_ids, vec!["ag1".to_string(), "ag2".to_string()]);
        assert_eq!(merged.container_ids, vec!["c1".to_string()]);
        assert_eq!(merged.time_last_updated, first.time_last_updated);
        assert_eq!(merged.time_created, first.time_created);

        let changed = store
            .save_secret("db_password", "inst1", "1.2.0", secret("v2", "ag1"))
            .unwrap();
        assert_eq!(changed.svc_secret_value, "v2");
        assert!(changed.time_last_updated >= first.time_last_updated);

        let all = store.find_all_secrets_for_ms("inst1").unwrap().unwrap();
        assert_eq!(all.ms_inst_vers, "1.2.0");
        assert_eq!(all.ms_inst_org, "myorg");
    }

    #[test]
    fn container_ids_are_added_once() {
        let store = Store::open_in_memory().unwrap();
        store
            .save_secret("db_password", "inst1", "1.0.0", secret("v", "ag1"))
            .unwrap();
        store
            .add_container_id_to_secret("db_password", "inst1", "c1")
            .unwrap();
        store
            .add_container_id_to_secret("db_password", "inst1", "c1")
            .unwrap();
        let found = store
            .find_single_secret_for_service("db_password", "inst1")
            .unwrap()
            .unwrap();
        assert_eq!(found.container_ids, vec!["c1".to_string()]);

        let err = store
            .add_container_id_to_secret("missing", "inst1", "c1")
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn spec_filters_compare_exchange_ids() {
        let store = Store::open_in_memory().unwrap();
        store
            .save_secret("db_password", "inst1", "1.0.0", secret("v", "ag1"))
            .unwrap();
        let found = store
            .find_all_service_secrets_with_specs("http://example.com/netspeed", "myorg")
            .unwrap();
        assert_eq!(found.len(), 1);
        assert!(store
            .find_all_service_secrets_with_specs("example.com/netspeed", "other")
            .unwrap()
            .is_empty());
    }

    #[test]
    fn deleting_last_secret_removes_the_instance() {
        let store = Store::open_in_memory().unwrap();
        assert_eq!(store.delete_secrets("db_password", "inst1").unwrap(), None);

        store
            .save_secret("db_password", "inst1", "1.0.0", secret("v", "ag1"))
            .unwrap();
        store
            .save_secret("api_key", "inst1", "1.0.0", secret("k", "ag1"))
            .unwrap();

        let removed = store.delete_secrets("db_password", "inst1").unwrap().unwrap();
        assert_eq!(removed.svc_secret_value, "v");
        assert!(store.find_all_secrets_for_ms("inst1").unwrap().is_some());

        store.delete_secrets("api_key", "inst1").unwrap();
        assert_eq!(store.find_all_secrets_for_ms("inst1").unwrap(), None);
    }

    #[test]
    fn delete_by_spec_touches_every_instance() {
        let store = Store::open_in_memory().unwrap();
        for inst in ["inst1", "inst2"] {
            store
                .save_secret("db_password", inst, "1.0.0", secret("v", "ag1"))
                .unwrap();
            store
                .save_secret("api_key", inst, "1.0.0", secret("k", "ag1"))
                .unwrap();
        }
        let removed = store
            .delete_secrets_spec("db_password", "example.com/netspeed", "myorg")
            .unwrap();
        assert_eq!(removed, 2);
        assert_eq!(
            store
                .find_single_secret_for_service("db_password", "inst2")
                .unwrap(),
            None
        );
        assert!(store
            .find_single_secret_for_service("api_key", "inst2")
            .unwrap()
            .is_some());
    }
}
