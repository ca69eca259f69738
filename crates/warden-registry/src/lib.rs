//! Warden Registry - content-addressed, versioned agent personas.
//!
//! An agent is defined by its persona: a named set of files whose
//! canonical hash is the agent's identity. Every mutation creates an
//! immutable new version; rollback is a new version whose persona
//! equals an older one. Spawning composes the persona into a system
//! prompt and calls the upstream agent runtime over HTTP.
//!
//! All registry operations write audit entries into the shared
//! ledger.

#![deny(unsafe_code)]
#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(unreachable_pub)]
#![deny(clippy::unwrap_used)]
#![cfg_attr(test, allow(clippy::unwrap_used))]

mod error;
mod model;
mod persona;
mod registry;
mod storage;

pub use error::{RegistryError, RegistryResult};
pub use model::{
    Agent, AgentVersion, CreateAgent, SpawnOptions, SpawnPayload, SpawnRecord, SpawnResult,
    UpdateAgent,
};
pub use persona::{Persona, PersonaFile};
pub use registry::{AgentRegistry, RegistryStats};
pub use storage::AgentStore;
