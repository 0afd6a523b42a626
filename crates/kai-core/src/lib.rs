//! Shared types for the kai session daemon: branded ids, session
//! configuration, SDK message records, the processing-state machine, channel
//! topics, and the agent-transport seam.

pub mod config;
pub mod ids;
pub mod messages;
pub mod query;
pub mod state;
pub mod timeout;
pub mod topics;
