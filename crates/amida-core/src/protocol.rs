use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::ladder::{Layout, Rung, RungRejection};
use crate::session::Phase;

/// Messages sent from a client to the hub.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Submit a locally validated rung candidate.
    DrawLine { rung: Rung },
    /// Freeze the ladder and enter the results phase.
    Finish,
    /// Clear the ladder and return to drawing.
    Reset,
    /// Explicit re-sync request; a bare transport reconnect is not enough to
    /// guarantee state equality, so reconnecting clients must send this.
    RequestState,
    /// Heartbeat to keep the connection alive.
    Ping,
}

/// Why the hub turned down a `draw_line`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    NotAdjacent,
    /// The rung names a rail outside the session's layout.
    OutOfRange,
    TooCloseVertically,
    Overlapping,
    /// The session is in the results phase; drawing is frozen until a reset.
    DrawingClosed,
}

impl From<RungRejection> for RejectReason {
    fn from(rejection: RungRejection) -> Self {
        match rejection {
            RungRejection::NotAdjacent => RejectReason::NotAdjacent,
            RungRejection::OutOfRange => RejectReason::OutOfRange,
            RungRejection::TooCloseVertically => RejectReason::TooCloseVertically,
            RungRejection::Overlapping => RejectReason::Overlapping,
        }
    }
}

/// Messages sent from the hub to clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Full replay sent to a fresh connection only.
    Init {
        layout: Layout,
        rungs: Vec<Rung>,
        phase: Phase,
    },
    /// An accepted rung from some other client.
    NewLine { rung: Rung },
    /// The sender's own rung was rejected; optimistic clients roll it back.
    LineRejected { rung_id: Uuid, reason: RejectReason },
    /// The ladder is frozen. Carries the full rung set so a client that
    /// missed a broadcast can still resolve every path.
    ShowResults { rungs: Vec<Rung> },
    /// The ladder was cleared and drawing reopened.
    Reset,
    /// Full snapshot, sent only to the client that asked for it.
    StateUpdate { rungs: Vec<Rung>, phase: Phase },
    /// Heartbeat response.
    Pong,
    /// Boundary-level failure (malformed message, internal error).
    Error { message: String },
}
