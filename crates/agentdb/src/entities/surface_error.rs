//! Errors surfaced to the exchange, one entry per failing workload.

use agentdb_core::WorkloadInfo;
use chrono::DateTime;
use serde::{Deserialize, Serialize};

use crate::codec::Record;
use crate::engine::WriteTxn;
use crate::entities::eventlog::{EventLog, SRC_TYPE_AG, SRC_TYPE_SVC};
use crate::error::StateResult;
use crate::render::MessageRenderer;
use crate::store::{Store, put_record, singleton_in};
use crate::tables::NODE_SURFACE_ERRORS;

pub const EC_ERROR_IMAGE_LOAD: &str = "error_image_load";
pub const EC_ERROR_IN_DEPLOYMENT_CONFIG: &str = "error_in_deployment_config";
pub const EC_ERROR_START_CONTAINER: &str = "error_start_container";
pub const EC_CANCEL_AGREEMENT_EXECUTION_TIMEOUT: &str = "cancel_agreement_execution_timeout";
pub const EC_CANCEL_AGREEMENT_SERVICE_SUSPENDED: &str = "cancel_agreement_service_suspended";
pub const EC_ERROR_SERVICE_CONFIG: &str = "error_service_config";
pub const EC_ERROR_START_SERVICE: &str = "error_start_service";
pub const EC_ERROR_START_DEPENDENT_SERVICE: &str = "error_start_dependent_service";
pub const EC_DEPENDENT_SERVICE_FAILED: &str = "dependent_service_failed";

/// Event codes that are surfaced to the exchange.
pub const SURFACED_EVENT_CODES: [&str; 9] = [
    EC_ERROR_IMAGE_LOAD,
    EC_ERROR_IN_DEPLOYMENT_CONFIG,
    EC_ERROR_START_CONTAINER,
    EC_CANCEL_AGREEMENT_EXECUTION_TIMEOUT,
    EC_CANCEL_AGREEMENT_SERVICE_SUSPENDED,
    EC_ERROR_SERVICE_CONFIG,
    EC_ERROR_START_SERVICE,
    EC_ERROR_START_DEPENDENT_SERVICE,
    EC_DEPENDENT_SERVICE_FAILED,
];

pub fn is_surface_type(event_code: &str) -> bool {
    SURFACED_EVENT_CODES.contains(&event_code)
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SurfaceError {
    pub record_id: String,
    pub message: String,
    pub event_code: String,
    pub hidden: bool,
    #[serde(default)]
    pub workload: WorkloadInfo,
    pub timestamp: String,
}

impl SurfaceError {
    pub fn from_event_log(log: &EventLog, renderer: &dyn MessageRenderer) -> Self {
        SurfaceError {
            record_id: log.id.clone(),
            message: log.render_message(renderer),
            event_code: log.event_code.clone(),
            hidden: false,
            workload: log.source.workload().unwrap_or_default(),
            timestamp: format_timestamp(log.timestamp),
        }
    }
}

fn format_timestamp(secs: u64) -> String {
    i64::try_from(secs)
        .ok()
        .and_then(|s| DateTime::from_timestamp(s, 0))
        .map(|t| t.format("%Y-%m-%d %H:%M:%S %z UTC").to_string())
        .unwrap_or_default()
}

impl Record for Vec<SurfaceError> {}

/// Fold `log` into the surface error list when its code is surfaced and it
/// concerns an agreement or service. An existing entry for the same workload
/// is replaced; its hidden flag survives unless the event code changed.
pub(crate) fn surface_in_txn<W: WriteTxn + ?Sized>(
    txn: &mut W,
    log: &EventLog,
    renderer: &dyn MessageRenderer,
) -> StateResult<bool> {
    if !is_surface_type(&log.event_code)
        || !(log.is_source_type(SRC_TYPE_AG) || log.is_source_type(SRC_TYPE_SVC))
    {
        return Ok(false);
    }

    let mut errors: Vec<SurfaceError> =
        singleton_in(&*txn, NODE_SURFACE_ERRORS)?.unwrap_or_default();
    let fresh = SurfaceError::from_event_log(log, renderer);

    let mut found = false;
    for current in errors.iter_mut() {
        if current.workload.same_service(&fresh.workload) {
            let hidden = current.hidden && current.event_code == fresh.event_code;
            *current = SurfaceError {
                hidden,
                ..fresh.clone()
            };
            found = true;
        }
    }
    if !found {
        errors.push(fresh);
    }

    put_record(txn, NODE_SURFACE_ERRORS, NODE_SURFACE_ERRORS, &errors)?;
    Ok(true)
}

impl Store {
    /// The surface error list; empty when none was saved.
    pub fn find_surface_errors(&self) -> StateResult<Vec<SurfaceError>> {
        Ok(self.find_singleton(NODE_SURFACE_ERRORS)?.unwrap_or_default())
    }

    pub fn find_visible_surface_errors(&self) -> StateResult<Vec<SurfaceError>> {
        let mut errors = self.find_surface_errors()?;
        errors.retain(|e| !e.hidden);
        Ok(errors)
    }

    /// Replace the surface error list.
    pub fn save_surface_errors(&self, errors: &[SurfaceError]) -> StateResult<()> {
        self.save_singleton(NODE_SURFACE_ERRORS, &errors.to_vec())
    }

    pub fn delete_surface_errors(&self) -> StateResult<()> {
        self.delete_singleton(NODE_SURFACE_ERRORS)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::eventlog::{
        AgreementEventSource, EventSource, MessageMeta, NodeEventSource, SEVERITY_ERROR,
        ServiceEventSource,
    };
    use serde_json::json;

    fn agreement_error(code: &str, url: &str) -> EventLog {
        EventLog::new(
            SEVERITY_ERROR,
            MessageMeta::new("image load failed for %v", vec![json!(url)]),
            code,
            EventSource::Agreement(AgreementEventSource {
                agreement_id: "ag1".into(),
                running_workload: WorkloadInfo::new(url, "myorg", "1.0.0", "amd64")
                    .unwrap_or_default(),
                protocol: "Basic".into(),
            }),
        )
    }

    #[test]
    fn timestamps_are_utc() {
        assert_eq!(format_timestamp(0), "1970-01-01 00:00:00 +0000 UTC");
    }

    #[test]
    fn only_surfaced_codes_on_workload_sources() {
        let store = Store::open_in_memory().unwrap();
        store
            .save_event_log(&mut agreement_error("agreement_started", "svc"))
            .unwrap();
        let mut node = EventLog::new(
            SEVERITY_ERROR,
            MessageMeta::new("bad", vec![]),
            EC_ERROR_START_CONTAINER,
            EventSource::Node(NodeEventSource::default()),
        );
        store.save_event_log(&mut node).unwrap();
        assert!(store.find_surface_errors().unwrap().is_empty());

        let mut log = agreement_error(EC_ERROR_IMAGE_LOAD, "svc");
        store.save_event_log(&mut log).unwrap();
        let errors = store.find_surface_errors().unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].record_id, log.id);
        assert_eq!(errors[0].message, "image load failed for svc");
        assert_eq!(errors[0].workload.url, "svc");
    }

    #[test]
    fn same_workload_is_deduplicated() {
        let store = Store::open_in_memory().unwrap();
        store
            .save_event_log(&mut agreement_error(EC_ERROR_IMAGE_LOAD, "svc"))
            .unwrap();

        // A service source for the same url and org replaces the agreement entry.
        let mut svc = EventLog::new(
            SEVERITY_ERROR,
            MessageMeta::new("start failed", vec![]),
            EC_ERROR_START_SERVICE,
            EventSource::Service(ServiceEventSource {
                service_url: "svc".into(),
                org: "myorg".into(),
                version: "2.0.0".into(),
                ..Default::default()
            }),
        );
        store.save_event_log(&mut svc).unwrap();
        store
            .save_event_log(&mut agreement_error(EC_ERROR_IMAGE_LOAD, "other"))
            .unwrap();

        let errors = store.find_surface_errors().unwrap();
        assert_eq!(errors.len(), 2);
        assert_eq!(errors[0].record_id, svc.id);
        assert_eq!(errors[0].event_code, EC_ERROR_START_SERVICE);
    }

    #[test]
    fn hidden_survives_same_code_only() {
        let store = Store::open_in_memory().unwrap();
        store
            .save_event_log(&mut agreement_error(EC_ERROR_IMAGE_LOAD, "svc"))
            .unwrap();
        let mut errors = store.find_surface_errors().unwrap();
        errors[0].hidden = true;
        store.save_surface_errors(&errors).unwrap();
        assert!(store.find_visible_surface_errors().unwrap().is_empty());

        store
            .save_event_log(&mut agreement_error(EC_ERROR_IMAGE_LOAD, "svc"))
            .unwrap();
        assert!(store.find_surface_errors().unwrap()[0].hidden);

        store
            .save_event_log(&mut agreement_error(EC_ERROR_START_CONTAINER, "svc"))
            .unwrap();
        let visible = store.find_visible_surface_errors().unwrap();
        assert_eq!(visible.len(), 1);
        assert_eq!(visible[0].event_code, EC_ERROR_START_CONTAINER);

        store.delete_surface_errors().unwrap();
        assert!(store.find_surface_errors().unwrap().is_empty());
    }
}
