//! Room orchestration: the per-room lifecycle agent, the worker/manager
//! session bridge, and pair bookkeeping.

pub mod agent;
pub mod bridge;
pub mod pairs;

pub use agent::{RoomAgent, RoomAgentConfig};
pub use bridge::BridgeManager;
pub use pairs::PairManager;
