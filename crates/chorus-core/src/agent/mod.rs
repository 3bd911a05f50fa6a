//! Persona agents: the registry of definitions and per-call prompt assembly.

pub mod prompt;
pub mod registry;

pub use registry::{AgentRegistry, ModelCatalog, ResolvedAgent};
