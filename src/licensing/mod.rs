// Entitlement core: identity, local license record, signature trust,
// state machine and the background tasks that keep it current.

pub mod types;
pub mod config;
pub mod identity;
pub mod storage;
pub mod signature;
pub mod settings;
pub mod audit;
pub mod state;
pub mod api;
pub mod activation;
pub mod revocation;
pub mod validator;
pub mod heartbeat;
pub mod backoff;
pub mod supervisor;
pub mod manager;

#[cfg(test)]
pub(crate) mod testing;

pub use types::*;
pub use config::*;
pub use manager::{Collaborators, EntitlementService, StateChange};
pub use state::{feature_enabled, get_limits, EntitlementState, Limits};
