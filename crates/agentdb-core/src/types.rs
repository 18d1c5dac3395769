//! Workload identity types shared by the agent's state layer and its callers.

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// The workload an agreement or service instance is running.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkloadInfo {
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub url: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub org: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub version: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub arch: String,
}

impl WorkloadInfo {
    pub fn new(url: &str, org: &str, version: &str, arch: &str) -> Option<Self> {
        if url.is_empty() || org.is_empty() || version.is_empty() {
            return None;
        }
        Some(WorkloadInfo {
            url: url.to_string(),
            org: org.to_string(),
            version: version.to_string(),
            arch: arch.to_string(),
        })
    }

    pub fn is_empty(&self) -> bool {
        self.url.is_empty() && self.org.is_empty()
    }

    /// Two workloads are the same service when url and org agree.
    pub fn same_service(&self, other: &WorkloadInfo) -> bool {
        self.url == other.url && self.org == other.org
    }
}

/// A dependent service reference.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceSpec {
    pub url: String,
    #[serde(default)]
    pub organization: String,
}

impl ServiceSpec {
    pub fn new(url: &str, organization: &str) -> Self {
        ServiceSpec {
            url: url.to_string(),
            organization: organization.to_string(),
        }
    }
}

/// One hop in the dependency path that led to a service instance.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceInstancePathElement {
    pub url: String,
    pub org: String,
    pub version: String,
}

impl ServiceInstancePathElement {
    pub fn new(url: &str, org: &str, version: &str) -> Self {
        ServiceInstancePathElement {
            url: url.to_string(),
            org: org.to_string(),
            version: version.to_string(),
        }
    }
}

/// Exchange-safe identifier for a service spec ref: scheme stripped, `/` replaced by `-`.
pub fn exchange_id_from_spec_ref(spec_ref: &str) -> String {
    let trimmed = spec_ref
        .strip_prefix("https://")
        .or_else(|| spec_ref.strip_prefix("http://"))
        .unwrap_or(spec_ref);
    trimmed.replace('/', "-")
}

/// Seconds since the Unix epoch.
pub fn epoch_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
