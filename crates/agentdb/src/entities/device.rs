//! The node's own exchange registration (singleton).

use agentdb_core::epoch_secs;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::codec::Record;
use crate::error::{StateError, StateResult};
use crate::merge::MergePolicy;
use crate::store::{Store, put_record, singleton_in};
use crate::tables::DEVICES;

pub const DEVICE_TYPE_DEVICE: &str = "device";
pub const DEVICE_TYPE_CLUSTER: &str = "cluster";

pub const CONFIGSTATE_UNCONFIGURING: &str = "unconfiguring";
pub const CONFIGSTATE_UNCONFIGURED: &str = "unconfigured";
pub const CONFIGSTATE_CONFIGURING: &str = "configuring";
pub const CONFIGSTATE_CONFIGURED: &str = "configured";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Configstate {
    pub state: String,
    pub last_update_time: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExchangeDevice {
    pub id: String,
    #[serde(rename = "organization")]
    pub org: String,
    pub pattern: String,
    pub name: String,
    #[serde(rename = "nodeType")]
    pub node_type: String,
    pub token: String,
    pub token_last_valid_time: u64,
    pub token_valid: bool,
    pub ha: bool,
    #[serde(rename = "configstate")]
    pub config: Configstate,
}

impl ExchangeDevice {
    /// `org/id` as used by the exchange.
    pub fn exchange_id(&self) -> String {
        format!("{}/{}", self.org, self.id)
    }

    pub fn is_edge_cluster(&self) -> bool {
        self.node_type == DEVICE_TYPE_CLUSTER
    }

    pub fn is_state(&self, state: &str) -> bool {
        self.config.state == state
    }
}

impl Record for ExchangeDevice {}

impl MergePolicy for ExchangeDevice {
    fn merge_from(&mut self, update: &Self) {
        if !update.token.is_empty() && update.token != self.token {
            self.token = update.token.clone();
            self.token_valid = true;
            self.token_last_valid_time = epoch_secs();
        }
        if update.config.state != self.config.state {
            self.config = update.config.clone();
        }
        if update.node_type != self.node_type {
            self.node_type = update.node_type.clone();
        }
        if update.pattern != self.pattern {
            self.pattern = update.pattern.clone();
        }
    }
}

/// Split a pattern reference into `(org, name, "org/name")`. A bare name
/// takes the device's org.
pub fn format_pattern(pattern: &str, device_org: &str) -> (String, String, String) {
    if pattern.is_empty() {
        return (String::new(), String::new(), String::new());
    }
    match pattern.split_once('/') {
        Some((org, name)) => (org.to_string(), name.to_string(), pattern.to_string()),
        None if device_org.is_empty() => (String::new(), pattern.to_string(), pattern.to_string()),
        None => (
            device_org.to_string(),
            pattern.to_string(),
            format!("{device_org}/{pattern}"),
        ),
    }
}

/// Registration data for [`Store::save_new_exchange_device`].
#[derive(Debug, Clone, Default)]
pub struct NewExchangeDevice {
    pub id: String,
    pub token: String,
    pub name: String,
    pub node_type: String,
    pub ha: bool,
    pub org: String,
    pub pattern: String,
    pub config_state: String,
}

impl Store {
    /// Record the node registration. The token is assumed valid at call time.
    pub fn save_new_exchange_device(&self, new: NewExchangeDevice) -> StateResult<ExchangeDevice> {
        if new.id.is_empty()
            || new.token.is_empty()
            || new.name.is_empty()
            || new.org.is_empty()
            || new.config_state.is_empty()
        {
            return Err(StateError::InvalidArgument(
                "device id, token, name, org or config state is empty".into(),
            ));
        }

        let now = epoch_secs();
        let (_, _, pattern) = format_pattern(&new.pattern, &new.org);
        let device = ExchangeDevice {
            id: new.id,
            org: new.org,
            pattern,
            name: new.name,
            node_type: new.node_type,
            token: new.token,
            token_last_valid_time: now,
            token_valid: true,
            ha: new.ha,
            config: Configstate {
                state: new.config_state,
                last_update_time: now,
            },
        };

        self.with_write(|txn| {
            if singleton_in::<ExchangeDevice, _>(&*txn, DEVICES)?.is_some() {
                return Err(StateError::Duplicate(format!(
                    "a device is already registered in {DEVICES}"
                )));
            }
            put_record(txn, DEVICES, DEVICES, &device)
        })?;

        info!(device = %device.exchange_id(), "exchange device saved");
        Ok(device)
    }

    /// The registered device, with its pattern normalized to `org/name` and
    /// the node type defaulted.
    pub fn find_exchange_device(&self) -> StateResult<Option<ExchangeDevice>> {
        let Some(mut device) = self.find_singleton::<ExchangeDevice>(DEVICES)? else {
            return Ok(None);
        };
        if !device.pattern.is_empty() {
            device.pattern = format_pattern(&device.pattern, &device.org).2;
        }
        if device.node_type.is_empty() {
            device.node_type = DEVICE_TYPE_DEVICE.to_string();
        }
        Ok(Some(device))
    }

    /// Remove the registration. An absent device is not an error.
    pub fn delete_exchange_device(&self) -> StateResult<()> {
        let existed = self.delete_singleton(DEVICES)?;
        debug!(existed, "exchange device deleted");
        Ok(())
    }

    fn update_exchange_device(
        &self,
        device_id: &str,
        invalidate_token: bool,
        mutate: impl FnOnce(&mut ExchangeDevice),
    ) -> StateResult<ExchangeDevice> {
        if device_id.is_empty() {
            return Err(StateError::InvalidArgument("device id is empty".into()));
        }
        self.with_write(|txn| {
            let mut current: ExchangeDevice = singleton_in(&*txn, DEVICES)?
                .filter(|d: &ExchangeDevice| d.id == device_id)
                .ok_or_else(|| StateError::NotFound(format!("no device {device_id} to update")))?;
            let mut proposed = current.clone();
            mutate(&mut proposed);
            current.merge_from(&proposed);
            if invalidate_token {
                current.token.clear();
                current.token_valid = false;
            }
            put_record(txn, DEVICES, DEVICES, &current)?;
            Ok(current)
        })
    }

    pub fn invalidate_exchange_token(&self) -> StateResult<ExchangeDevice> {
        let device = self
            .find_exchange_device()?
            .ok_or_else(|| StateError::NotFound("no exchange device registered".into()))?;
        self.update_exchange_device(&device.id, true, |_| {})
    }

    pub fn set_exchange_device_token(&self, device_id: &str, token: &str) -> StateResult<ExchangeDevice> {
        if token.is_empty() {
            return Err(StateError::InvalidArgument("token is empty".into()));
        }
        self.update_exchange_device(device_id, false, |d| d.token = token.to_string())
    }

    pub fn set_exchange_device_configstate(
        &self,
        device_id: &str,
        state: &str,
    ) -> StateResult<ExchangeDevice> {
        if state.is_empty() {
            return Err(StateError::InvalidArgument("config state is empty".into()));
        }
        self.update_exchange_device(device_id, false, |d| {
            d.config = Configstate {
                state: state.to_string(),
                last_update_time: epoch_secs(),
            };
        })
    }

    pub fn set_exchange_device_node_type(
        &self,
        device_id: &str,
        node_type: &str,
    ) -> StateResult<ExchangeDevice> {
        if node_type.is_empty() {
            return Err(StateError::InvalidArgument("node type is empty".into()));
        }
        self.update_exchange_device(device_id, false, |d| d.node_type = node_type.to_string())
    }

    pub fn set_exchange_device_pattern(
        &self,
        device_id: &str,
        pattern: &str,
    ) -> StateResult<ExchangeDevice> {
        self.update_exchange_device(device_id, false, |d| d.pattern = pattern.to_string())
    }

    /// True when the stored device was registered with a pattern.
    pub fn migrate_exchange_device(&self) -> StateResult<bool> {
        Ok(self
            .find_exchange_device()?
            .is_some_and(|d| !d.pattern.is_empty()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registration() -> NewExchangeDevice {
        NewExchangeDevice {
            id: "node1".into(),
            token: "secret".into(),
            name: "node one".into(),
            org: "myorg".into(),
            pattern: "netspeed".into(),
            config_state: CONFIGSTATE_CONFIGURING.into(),
            ..Default::default()
        }
    }

    #[test]
    fn pattern_formats() {
        assert_eq!(
            format_pattern("p", "org"),
            ("org".into(), "p".into(), "org/p".into())
        );
        assert_eq!(
            format_pattern("other/p", "org"),
            ("other".into(), "p".into(), "other/p".into())
        );
        assert_eq!(format_pattern("p", ""), ("".into(), "p".into(), "p".into()));
        assert_eq!(format_pattern("", "org"), ("".into(), "".into(), "".into()));
    }

    #[test]
    fn save_and_find() {
        let store = Store::open_in_memory().unwrap();
        assert_eq!(store.find_exchange_device().unwrap(), None);
        let saved = store.save_new_exchange_device(registration()).unwrap();
        assert_eq!(saved.pattern, "myorg/netspeed");
        assert!(saved.token_valid);

        let found = store.find_exchange_device().unwrap().unwrap();
        assert_eq!(found.node_type, DEVICE_TYPE_DEVICE);
        assert!(store.migrate_exchange_device().unwrap());

        let err = store.save_new_exchange_device(registration()).unwrap_err();
        assert!(matches!(err, StateError::Duplicate(_)));
    }

    #[test]
    fn rejects_empty_identity() {
        let store = Store::open_in_memory().unwrap();
        let mut bad = registration();
        bad.token.clear();
        assert!(matches!(
            store.save_new_exchange_device(bad),
            Err(StateError::InvalidArgument(_))
        ));
    }

    #[test]
    fn token_lifecycle() {
        let store = Store::open_in_memory().unwrap();
        store.save_new_exchange_device(registration()).unwrap();

        let invalid = store.invalidate_exchange_token().unwrap();
        assert!(invalid.token.is_empty());
        assert!(!invalid.token_valid);

        let renewed = store.set_exchange_device_token("node1", "fresh").unwrap();
        assert_eq!(renewed.token, "fresh");
        assert!(renewed.token_valid);
        assert!(renewed.token_last_valid_time > 0);
    }

    #[test]
    fn config_state_and_id_mismatch() {
        let store = Store::open_in_memory().unwrap();
        store.save_new_exchange_device(registration()).unwrap();
        let configured = store
            .set_exchange_device_configstate("node1", CONFIGSTATE_CONFIGURED)
            .unwrap();
        assert!(configured.is_state(CONFIGSTATE_CONFIGURED));

        let err = store
            .set_exchange_device_node_type("someone-else", DEVICE_TYPE_CLUSTER)
            .unwrap_err();
        assert!(err.is_not_found());

        let cluster = store
            .set_exchange_device_node_type("node1", DEVICE_TYPE_CLUSTER)
            .unwrap();
        assert!(cluster.is_edge_cluster());
    }

    #[test]
    fn delete_is_idempotent() {
        let store = Store::open_in_memory().unwrap();
        store.delete_exchange_device().unwrap();
        store.save_new_exchange_device(registration()).unwrap();
        store.delete_exchange_device().unwrap();
        assert_eq!(store.find_exchange_device().unwrap(), None);
    }
}
