use uuid::Uuid;

use amida_core::{
    resolve_path, validate_rung, LadderError, Layout, Phase, Resolution, Rung, RungRejection,
    ServerMessage,
};

/// Local mirror of the hub's session state. Never authoritative: it is
/// brought to equality on join (full replay) and on explicit re-sync, then
/// kept equal by applying hub events in arrival order. The hub serializes all
/// mutations, so plain in-order application converges without any merging.
#[derive(Debug, Clone)]
pub struct ClientView {
    layout: Layout,
    rungs: Vec<Rung>,
    phase: Phase,
}

impl ClientView {
    pub fn new(layout: Layout) -> Self {
        Self {
            layout,
            rungs: Vec::new(),
            phase: Phase::Drawing,
        }
    }

    pub fn layout(&self) -> Layout {
        self.layout
    }

    pub fn rungs(&self) -> &[Rung] {
        &self.rungs
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Mirrors the hub-side check exactly, so the submitting client and the
    /// hub always reach the same verdict for the same rung set.
    pub fn validate(&self, candidate: &Rung) -> Result<(), RungRejection> {
        validate_rung(candidate, &self.rungs, &self.layout)
    }

    /// Optimistically applies a locally drawn rung. Callers must have passed
    /// `validate` first; a hub-side `line_rejected` is the rollback signal.
    pub fn apply_local(&mut self, rung: Rung) {
        self.rungs.push(rung);
    }

    /// Rolls back an optimistic rung the hub rejected. Returns whether the
    /// rung was present.
    pub fn retract(&mut self, rung_id: Uuid) -> bool {
        let before = self.rungs.len();
        self.rungs.retain(|rung| rung.id != rung_id);
        self.rungs.len() != before
    }

    /// Applies one hub event in arrival order.
    pub fn apply(&mut self, message: &ServerMessage) {
        match message {
            ServerMessage::Init { layout, rungs, phase } => {
                self.layout = *layout;
                self.rungs = rungs.clone();
                self.phase = *phase;
            }
            ServerMessage::NewLine { rung } => self.rungs.push(rung.clone()),
            ServerMessage::LineRejected { rung_id, .. } => {
                self.retract(*rung_id);
            }
            ServerMessage::ShowResults { rungs } => {
                self.rungs = rungs.clone();
                self.phase = Phase::ShowingResults;
            }
            ServerMessage::Reset => {
                self.rungs.clear();
                self.phase = Phase::Drawing;
            }
            ServerMessage::StateUpdate { rungs, phase } => {
                self.rungs = rungs.clone();
                self.phase = *phase;
            }
            ServerMessage::Pong | ServerMessage::Error { .. } => {}
        }
    }

    /// Replaces the mirror wholesale, returning whether anything changed.
    /// The polling fallback uses this to diff a fetched snapshot.
    pub fn replace(&mut self, rungs: Vec<Rung>, phase: Phase) -> bool {
        if self.rungs == rungs && self.phase == phase {
            return false;
        }
        self.rungs = rungs;
        self.phase = phase;
        true
    }

    /// Resolves the exit rail for one start rail over the mirrored rung set.
    /// Deterministic, so every client that converged computes the same answer.
    pub fn resolve(&self, start_rail: usize) -> Result<Resolution, LadderError> {
        resolve_path(start_rail, &self.rungs, &self.layout)
    }
}
