//! agentdb — local persistent state for an edge-node agent.
//!
//! Backed by [redb](https://docs.rs/redb), records agreements, microservice
//! definitions and instances, the node's registration, policy and user input,
//! secrets and an event log.
//!
//! # Architecture
//!
//! Every record is JSON in a named bucket of one embedded database. Mutable
//! entities are only updated through a merge-update: inside one write
//! transaction the stored record is read, each field is taken from the
//! proposal only if its transition rule allows it, and the result is written
//! back. Event logs are queried with typed selectors.
//!
//! The [`Store`] is `Clone` + `Send` + `Sync` and is shared by every caller.

pub mod codec;
pub mod device_cache;
pub mod engine;
pub mod entities;
pub mod error;
pub mod filter;
pub mod merge;
pub mod registry;
pub mod render;
pub mod selector;
pub mod store;
pub mod tables;

pub use device_cache::DeviceCache;
pub use engine::{ReadTxn, RedbEngine, StorageEngine, WriteTxn};
pub use entities::agreement::{AgreementFilter, EstablishedAgreement, NewAgreement};
pub use entities::device::{ExchangeDevice, NewExchangeDevice};
pub use entities::eventlog::{EventLog, EventLogFilter, EventSource, MessageMeta};
pub use entities::microservice::{MicroserviceDefinition, MicroserviceInstance};
pub use error::{ErrorKind, StateError, StateResult};
pub use merge::MergePolicy;
pub use registry::EngineRegistry;
pub use render::{MessageRenderer, PositionalRenderer};
pub use selector::{Selectable, Selector, SelectorMap, convert_to_selectors};
pub use store::Store;
