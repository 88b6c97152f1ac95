//! Core model for the Amida ladder service: rail geometry, rung validation,
//! deterministic path resolution, the shared session state, and the wire
//! protocol spoken between the hub and its clients.
//!
//! Everything in this crate is pure and transport-independent. The hub and
//! every client validate rungs with the exact same function, which is what
//! keeps optimistic client-side checks in agreement with the authoritative
//! hub-side ones.

pub mod ladder;
pub mod protocol;
pub mod session;

pub use ladder::{
    resolve_path, validate_rung, LadderError, Layout, PathStep, Resolution, Rung, RungRejection,
    MIN_VERTICAL_GAP,
};
pub use protocol::{ClientMessage, RejectReason, ServerMessage};
pub use session::{Phase, PhaseLocked, SessionState};
