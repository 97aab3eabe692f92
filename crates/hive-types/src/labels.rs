//! Container label keys.
//!
//! Labels are the authoritative store of agent identity on the container
//! engine; the lifecycle manager compares them against declared configuration
//! and recreates the container when they diverge.

/// Agent name label.
pub const NAME: &str = "orch.agent.name";
/// Owning user id label.
pub const OWNER: &str = "orch.agent.owner";
/// Runtime kind label.
pub const KIND: &str = "orch.agent.kind";
/// Declared CPU quota label.
pub const CPU: &str = "orch.agent.cpu";
/// Declared memory limit label, mebibytes.
pub const MEMORY: &str = "orch.agent.memory";
/// API-key mode label.
pub const API_KEY_MODE: &str = "orch.agent.api_key_mode";
/// Capability preset label.
pub const CAPABILITY_PROFILE: &str = "orch.agent.capability_profile";

/// The labels that participate in reconciliation, in a stable order.
pub const RECONCILED: &[&str] = &[CPU, MEMORY, API_KEY_MODE, CAPABILITY_PROFILE];
