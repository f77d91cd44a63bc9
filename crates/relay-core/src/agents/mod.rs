//! Agent definitions and the registry that holds them
//!
//! Agents are immutable once registered. Each carries its own
//! instructions and capability set; the handoff graph refers to them by name.

pub mod definition;
pub mod registry;

pub use definition::AgentDefinition;
pub use registry::AgentRegistry;
