//! Per-client reconciliation for the Amida ladder hub: a local mirror of the
//! shared session state, a reconnecting sync agent that keeps it equal to the
//! authoritative copy, and a polling fallback for when the push channel is
//! unavailable.

pub mod agent;
pub mod poll;
pub mod view;

pub use agent::{AgentError, AgentEvent, AgentStatus, ReconnectPolicy, SyncAgent};
pub use poll::StatePoller;
pub use view::ClientView;
