//! Process-local routing fabric: request/reply with exactly one handler per
//! method, plus per-session channels with versioned in-order delivery and a
//! global event bus.

mod error;
mod hub;

pub use error::HubError;
pub use hub::{BusEvent, ChannelEvent, ChannelSubscription, MessageHub, RequestContext};
