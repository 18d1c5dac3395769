//! Append-only event log with selector queries.
//!
//! Every log carries a source whose shape depends on `source_type`. The
//! stored JSON keeps the source as a nested object next to the discriminant;
//! decoding dispatches on the discriminant into [`EventSource`].
//!
//! Messages are stored as a key plus positional arguments and rendered only
//! when a query asks for them.

use std::collections::HashMap;
use std::fmt;

use agentdb_core::{WorkloadInfo, epoch_secs};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::codec::{Record, decode_failure, decode_raw_string, null_as_default};
use crate::engine::WriteTxn;
use crate::entities::surface_error::surface_in_txn;
use crate::error::StateResult;
use crate::filter::RecordFilter;
use crate::render::MessageRenderer;
use crate::selector::{
    AttributeValue, BASE_SELECTORS, Op, Selectable, Selector, SelectorMap, SelectorValue,
    group_selectors,
};
use crate::store::{Store, find_in, get_record, put_record};
use crate::tables::{EVENT_LOGS, LAST_UNREG, LAST_UNREG_KEY};

pub const SEVERITY_INFO: &str = "info";
pub const SEVERITY_WARNING: &str = "warning";
pub const SEVERITY_ERROR: &str = "error";

pub const SRC_TYPE_AG: &str = "agreement";
pub const SRC_TYPE_SVC: &str = "service";
pub const SRC_TYPE_NODE: &str = "node";
pub const SRC_TYPE_DB: &str = "database";
pub const SRC_TYPE_EXCH: &str = "exchange";

/// Message key and positional arguments, rendered at read time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MessageMeta {
    pub message_key: String,
    #[serde(default, deserialize_with = "null_as_default", skip_serializing_if = "Vec::is_empty")]
    pub message_args: Vec<Value>,
}

impl MessageMeta {
    pub fn new(message_key: &str, message_args: Vec<Value>) -> Self {
        Self {
            message_key: message_key.to_string(),
            message_args,
        }
    }
}

impl fmt::Display for MessageMeta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "MessageKey: {}, MessageArgs: {:?}", self.message_key, self.message_args)
    }
}

// ── Sources ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgreementEventSource {
    pub agreement_id: String,
    #[serde(rename = "workload_to_run")]
    pub running_workload: WorkloadInfo,
    pub protocol: String,
}

impl Selectable for AgreementEventSource {
    fn attribute(&self, name: &str) -> Option<AttributeValue> {
        let w = &self.running_workload;
        Some(match name {
            "agreement_id" => (&self.agreement_id).into(),
            "protocol" => (&self.protocol).into(),
            "workload_to_run" | "service_url" => (&w.url).into(),
            "org" => (&w.org).into(),
            "version" => (&w.version).into(),
            "arch" => (&w.arch).into(),
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceEventSource {
    pub instance_id: String,
    pub service_url: String,
    #[serde(rename = "organization")]
    pub org: String,
    pub version: String,
    pub arch: String,
    #[serde(deserialize_with = "null_as_default")]
    pub agreement_ids: Vec<String>,
}

impl Selectable for ServiceEventSource {
    fn attribute(&self, name: &str) -> Option<AttributeValue> {
        Some(match name {
            "instance_id" => (&self.instance_id).into(),
            "service_url" => (&self.service_url).into(),
            "organization" | "org" => (&self.org).into(),
            "version" => (&self.version).into(),
            "arch" => (&self.arch).into(),
            "agreement_ids" | "agreement_id" => self.agreement_ids.as_slice().into(),
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeEventSource {
    pub node_org: String,
    pub node_id: String,
    pub pattern: String,
    pub config_state: String,
}

impl Selectable for NodeEventSource {
    fn attribute(&self, name: &str) -> Option<AttributeValue> {
        Some(match name {
            "node_org" => (&self.node_org).into(),
            "node_id" => (&self.node_id).into(),
            "pattern" => (&self.pattern).into(),
            "config_state" => (&self.config_state).into(),
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseEventSource {
    pub operation: String,
    pub object_type: String,
}

impl Selectable for DatabaseEventSource {
    fn attribute(&self, name: &str) -> Option<AttributeValue> {
        Some(match name {
            "operation" => (&self.operation).into(),
            "object_type" => (&self.object_type).into(),
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExchangeEventSource {
    pub exchange_url: String,
    pub operation: String,
}

impl Selectable for ExchangeEventSource {
    fn attribute(&self, name: &str) -> Option<AttributeValue> {
        Some(match name {
            "exchange_url" => (&self.exchange_url).into(),
            "operation" => (&self.operation).into(),
            _ => return None,
        })
    }
}

/// What an event is about. The variant is persisted as `source_type`.
#[derive(Debug, Clone, PartialEq)]
pub enum EventSource {
    Agreement(AgreementEventSource),
    Service(ServiceEventSource),
    Node(NodeEventSource),
    Database(DatabaseEventSource),
    Exchange(ExchangeEventSource),
}

impl EventSource {
    pub fn source_type(&self) -> &'static str {
        match self {
            EventSource::Agreement(_) => SRC_TYPE_AG,
            EventSource::Service(_) => SRC_TYPE_SVC,
            EventSource::Node(_) => SRC_TYPE_NODE,
            EventSource::Database(_) => SRC_TYPE_DB,
            EventSource::Exchange(_) => SRC_TYPE_EXCH,
        }
    }

    /// The workload an agreement or service event refers to.
    pub fn workload(&self) -> Option<WorkloadInfo> {
        match self {
            EventSource::Agreement(s) => Some(s.running_workload.clone()),
            EventSource::Service(s) => Some(WorkloadInfo {
                url: s.service_url.clone(),
                org: s.org.clone(),
                version: s.version.clone(),
                arch: s.arch.clone(),
            }),
            _ => None,
        }
    }

    fn from_value(source_type: &str, value: Value) -> Result<Self, String> {
        let value = if value.is_null() {
            Value::Object(Default::default())
        } else {
            value
        };
        let source = match source_type {
            SRC_TYPE_AG => serde_json::from_value(value).map(EventSource::Agreement),
            SRC_TYPE_SVC => serde_json::from_value(value).map(EventSource::Service),
            SRC_TYPE_NODE => serde_json::from_value(value).map(EventSource::Node),
            SRC_TYPE_DB => serde_json::from_value(value).map(EventSource::Database),
            SRC_TYPE_EXCH => serde_json::from_value(value).map(EventSource::Exchange),
            other => return Err(format!("unknown event source type: {other}")),
        };
        source.map_err(|e| format!("invalid {source_type} event source: {e}"))
    }

    fn to_value(&self) -> Result<Value, serde_json::Error> {
        match self {
            EventSource::Agreement(s) => serde_json::to_value(s),
            EventSource::Service(s) => serde_json::to_value(s),
            EventSource::Node(s) => serde_json::to_value(s),
            EventSource::Database(s) => serde_json::to_value(s),
            EventSource::Exchange(s) => serde_json::to_value(s),
        }
    }
}

impl Selectable for EventSource {
    fn attribute(&self, name: &str) -> Option<AttributeValue> {
        match self {
            EventSource::Agreement(s) => s.attribute(name),
            EventSource::Service(s) => s.attribute(name),
            EventSource::Node(s) => s.attribute(name),
            EventSource::Database(s) => s.attribute(name),
            EventSource::Exchange(s) => s.attribute(name),
        }
    }
}

// ── Event log ──────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "StoredEventLog", into = "StoredEventLog")]
pub struct EventLog {
    /// Sequence id assigned on save.
    pub id: String,
    pub timestamp: u64,
    pub severity: String,
    /// Rendered text. Older logs stored only this; newer ones fill it at query time.
    pub message: String,
    pub message_meta: Option<MessageMeta>,
    pub event_code: String,
    pub source: EventSource,
}

impl EventLog {
    pub fn new(severity: &str, message_meta: MessageMeta, event_code: &str, source: EventSource) -> Self {
        Self {
            id: String::new(),
            timestamp: epoch_secs(),
            severity: severity.to_string(),
            message: String::new(),
            message_meta: Some(message_meta),
            event_code: event_code.to_string(),
            source,
        }
    }

    pub fn source_type(&self) -> &'static str {
        self.source.source_type()
    }

    pub fn is_source_type(&self, source_type: &str) -> bool {
        self.source_type() == source_type
    }

    /// Text for display: the rendered template when there is one, else the stored message.
    pub fn render_message(&self, renderer: &dyn MessageRenderer) -> String {
        match &self.message_meta {
            Some(meta) if !meta.message_key.is_empty() => {
                renderer.render(&meta.message_key, &meta.message_args)
            }
            _ => self.message.clone(),
        }
    }

    /// Replace the template with its rendered text.
    fn render_in_place(&mut self, renderer: &dyn MessageRenderer) {
        if self.message_meta.as_ref().is_some_and(|m| !m.message_key.is_empty()) {
            self.message = self.render_message(renderer);
            self.message_meta = None;
        }
    }

    fn base_attribute(&self, name: &str) -> Option<AttributeValue> {
        Some(match name {
            "source_type" => self.source_type().into(),
            "severity" => (&self.severity).into(),
            "message" => (&self.message).into(),
            "event_code" => (&self.event_code).into(),
            "record_id" => (&self.id).into(),
            "timestamp" => self.timestamp.into(),
            _ => return None,
        })
    }

    /// Match pre-grouped selectors: base attributes against the log, the rest against its source.
    pub fn matches_grouped(&self, base: &SelectorMap, source: &SelectorMap) -> bool {
        struct Base<'a>(&'a EventLog);
        impl Selectable for Base<'_> {
            fn attribute(&self, name: &str) -> Option<AttributeValue> {
                self.0.base_attribute(name)
            }
        }
        Base(self).matches(base) && self.source.matches(source)
    }
}

impl Selectable for EventLog {
    fn attribute(&self, name: &str) -> Option<AttributeValue> {
        if BASE_SELECTORS.contains(&name) {
            self.base_attribute(name)
        } else {
            self.source.attribute(name)
        }
    }

    fn matches(&self, selectors: &SelectorMap) -> bool {
        let (base, source) = group_selectors(selectors);
        self.matches_grouped(&base, &source)
    }
}

impl fmt::Display for EventLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let meta = self.message_meta.as_ref().map(|m| m.to_string()).unwrap_or_default();
        write!(
            f,
            "ID: {}, Timestamp: {}, Severity: {}, Message: {}, MessageMeta: {}, EventCode: {}, SourceType: {}, Source: {:?}",
            self.id,
            self.timestamp,
            self.severity,
            self.message,
            meta,
            self.event_code,
            self.source_type(),
            self.source
        )
    }
}

/// Persisted shape of an [`EventLog`].
#[derive(Serialize, Deserialize)]
struct StoredEventLog {
    #[serde(default)]
    record_id: String,
    #[serde(default)]
    timestamp: u64,
    #[serde(default)]
    severity: String,
    #[serde(default)]
    message: String,
    #[serde(default)]
    event_code: String,
    source_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    message_meta: Option<MessageMeta>,
    #[serde(default)]
    event_source: Value,
}

impl TryFrom<StoredEventLog> for EventLog {
    type Error = String;

    fn try_from(stored: StoredEventLog) -> Result<Self, Self::Error> {
        let source = EventSource::from_value(&stored.source_type, stored.event_source)?;
        Ok(EventLog {
            id: stored.record_id,
            timestamp: stored.timestamp,
            severity: stored.severity,
            message: stored.message,
            message_meta: stored.message_meta,
            event_code: stored.event_code,
            source,
        })
    }
}

impl From<EventLog> for StoredEventLog {
    fn from(log: EventLog) -> Self {
        let source_type = log.source_type().to_string();
        StoredEventLog {
            record_id: log.id,
            timestamp: log.timestamp,
            severity: log.severity,
            message: log.message,
            event_code: log.event_code,
            source_type,
            message_meta: log.message_meta,
            // Source structs only hold strings and string lists.
            event_source: log.source.to_value().unwrap_or(Value::Null),
        }
    }
}

impl Record for EventLog {}

pub enum EventLogFilter {
    Severity(String),
    SourceType(String),
    Selectors(SelectorMap),
}

impl RecordFilter<EventLog> for EventLogFilter {
    fn matches(&self, log: &EventLog) -> bool {
        match self {
            EventLogFilter::Severity(severity) => log.severity == *severity,
            EventLogFilter::SourceType(source_type) => log.is_source_type(source_type),
            EventLogFilter::Selectors(selectors) => log.matches(selectors),
        }
    }
}

fn sort_by_sequence(logs: &mut [EventLog]) {
    logs.sort_by_key(|log| log.id.parse::<u64>().unwrap_or(u64::MAX));
}

fn append_in_txn<W: WriteTxn + ?Sized>(txn: &mut W, log: &mut EventLog) -> StateResult<()> {
    let seq = txn.next_sequence(EVENT_LOGS)?;
    log.id = seq.to_string();
    put_record(txn, EVENT_LOGS, &log.id, &*log)
}

impl Store {
    /// Append `log` under a new sequence id, written into `log.id`. Logs
    /// with a surfaced event code update the surface error list in the same
    /// transaction.
    pub fn save_event_log(&self, log: &mut EventLog) -> StateResult<()> {
        let renderer = self.renderer();
        let surfaced = self.with_write(|txn| {
            append_in_txn(txn, log)?;
            surface_in_txn(txn, log, renderer)
        })?;
        debug!(id = %log.id, event_code = %log.event_code, surfaced, "event log saved");
        Ok(())
    }

    pub fn find_event_log_with_key(&self, key: &str) -> StateResult<Option<EventLog>> {
        self.with_read(|txn| get_record(txn, EVENT_LOGS, key))
    }

    /// Logs accepted by every filter, in sequence order.
    pub fn find_event_logs(&self, filters: &[EventLogFilter]) -> StateResult<Vec<EventLog>> {
        let mut logs = self.with_read(|txn| find_in(txn, EVENT_LOGS, filters))?;
        sort_by_sequence(&mut logs);
        Ok(logs)
    }

    pub fn find_all_event_logs(&self) -> StateResult<Vec<EventLog>> {
        self.find_event_logs(&[])
    }

    /// Logs matching `selectors`, with messages rendered by `renderer` (or
    /// the store's renderer) before matching. Unless `all_logs` is set, only
    /// logs newer than the last unregistration are considered.
    pub fn find_event_logs_with_selectors(
        &self,
        all_logs: bool,
        selectors: &SelectorMap,
        renderer: Option<&dyn MessageRenderer>,
    ) -> StateResult<Vec<EventLog>> {
        let (base, source) = group_selectors(selectors);
        let since = if all_logs {
            0
        } else {
            self.get_last_unregistration_time()?
        };
        let renderer = renderer.unwrap_or_else(|| self.renderer());

        let mut logs = self.with_read(|txn| {
            let all: Vec<EventLog> = find_in::<EventLog, EventLogFilter, _>(txn, EVENT_LOGS, &[])?;
            Ok(all
                .into_iter()
                .filter(|log| all_logs || log.timestamp > since)
                .map(|mut log| {
                    log.render_in_place(renderer);
                    log
                })
                .filter(|log| log.matches_grouped(&base, &source))
                .collect::<Vec<_>>())
        })?;
        sort_by_sequence(&mut logs);
        Ok(logs)
    }

    /// The log with `record_id`, rendered, regardless of registration.
    pub fn get_event_log_object(&self, record_id: &str) -> StateResult<Option<EventLog>> {
        let selectors: SelectorMap = HashMap::from([(
            "record_id".to_string(),
            vec![Selector::new(Op::Eq, SelectorValue::Text(record_id.to_string()))],
        )]);
        Ok(self
            .find_event_logs_with_selectors(true, &selectors, None)?
            .into_iter()
            .next())
    }

    pub fn save_last_unregistration_time(&self, time: u64) -> StateResult<()> {
        self.save_raw(LAST_UNREG, LAST_UNREG_KEY, time.to_string().as_bytes())
    }

    /// Time of the last unregistration; 0 when the node was never unregistered.
    pub fn get_last_unregistration_time(&self) -> StateResult<u64> {
        let Some(bytes) = self.find_raw(LAST_UNREG, LAST_UNREG_KEY)? else {
            return Ok(0);
        };
        let text = decode_raw_string(LAST_UNREG, LAST_UNREG_KEY, &bytes)?;
        text.trim()
            .parse()
            .map_err(|e| decode_failure(LAST_UNREG, LAST_UNREG_KEY, &bytes, e))
    }
}
