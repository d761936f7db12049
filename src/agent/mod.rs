//! Agent identity and queue provisioning

pub mod registry;

pub use registry::{Agent, AgentRegistry, QueueDisposal, RegisteredAgent};
