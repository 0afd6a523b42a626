//! The daemon's integration layer: the session manager, the RPC surface,
//! the state broadcaster, room orchestration, and the WebSocket front door.

pub mod broadcaster;
pub mod client;
pub mod handlers;
pub mod manager;
pub mod rooms;
pub mod rpc;
pub mod server;

pub use broadcaster::StateBroadcaster;
pub use handlers::{register_handlers, HandlerDeps};
pub use manager::{NullWorktreeGateway, SessionManager, WorktreeGateway};
pub use rooms::{BridgeManager, PairManager, RoomAgent, RoomAgentConfig};
pub use server::{start, ServerConfig, ServerHandle};
