//! Entity repositories. Each module owns its buckets and adds its
//! operations to [`Store`](crate::store::Store).

pub mod agreement;
pub mod change_state;
pub mod container_volume;
pub mod device;
pub mod eventlog;
pub mod microservice;
pub mod node_pattern;
pub mod node_policy;
pub mod node_status;
pub mod secret_status;
pub mod secrets;
pub mod surface_error;
pub mod user_input;
