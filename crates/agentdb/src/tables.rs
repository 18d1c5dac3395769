//! Bucket names for the agent state store.
//!
//! Every bucket maps `&str` keys to JSON payloads, except the few raw-value
//! singletons noted below. Singleton buckets store their one record under a
//! key equal to the bucket name.

/// The registered exchange device (singleton).
pub const DEVICES: &str = "devices";

/// Established agreements, one bucket per agreement protocol. See [`agreements_bucket`].
pub const AGREEMENTS_PREFIX: &str = "established_agreements";

/// Microservice definitions keyed by sequence id.
pub const MICROSERVICE_DEFINITIONS: &str = "microservice_definitions";

/// Microservice instances keyed by `{org}_{exchange id}_{version}_{instance id}`.
pub const MICROSERVICE_INSTANCES: &str = "microservice_instances";

/// Node policy document (singleton).
pub const NODE_POLICY: &str = "nodepolicy";

/// Last-updated string of the node policy in the exchange (raw singleton).
pub const EXCHANGE_NP_LAST_UPDATED: &str = "exchange_nodepolicy_lastupdated";

/// Per-workload container status list (singleton).
pub const NODE_STATUS: &str = "node_status";

/// Append-only event log keyed by sequence id.
pub const EVENT_LOGS: &str = "event_logs";

/// Time of the last node unregistration (raw decimal under [`LAST_UNREG_KEY`]).
pub const LAST_UNREG: &str = "last_unreg";
pub const LAST_UNREG_KEY: &str = "lastunreg";

/// Errors surfaced to the exchange (singleton list).
pub const NODE_SURFACE_ERRORS: &str = "nodesurfaceerror";

/// Secret update status per microservice instance.
pub const SECRET_STATUS: &str = "secret_status";

/// Secrets per microservice instance.
pub const SECRETS: &str = "secrets";

/// Secret lists per agreement id.
pub const AGREEMENT_SECRETS: &str = "agreement_secrets";

/// Last seen exchange change (singleton).
pub const EXCHANGE_CHANGES: &str = "exchange-change-state";

/// Docker volumes created for workloads, keyed by sequence id.
pub const CONTAINER_VOLUMES: &str = "container_volumes";

/// Node user input list (singleton).
pub const NODE_USER_INPUT: &str = "nodeuserinput";

/// Hash of the node user input last pushed to the exchange (raw singleton).
pub const EXCHANGE_NODE_USER_INPUT_HASH: &str = "exchange_node_userinput_hash";

/// Pattern the node was last registered with (raw singleton).
pub const NODE_EXCH_PATTERN: &str = "nodeexchpattern";

/// Bucket holding agreements for one agreement protocol.
pub fn agreements_bucket(protocol: &str) -> String {
    format!("{AGREEMENTS_PREFIX}-{protocol}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn agreement_buckets_are_suffixed_by_protocol() {
        assert_eq!(agreements_bucket("Basic"), "established_agreements-Basic");
    }
}
