use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ladder::Rung;

/// Which mutations the shared ladder currently accepts. `ShowingResults` is a
/// one-way gate: only a reset returns the session to `Drawing`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    #[default]
    Drawing,
    ShowingResults,
}

/// Returned when a rung is appended while results are showing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("the ladder is frozen while results are showing")]
pub struct PhaseLocked;

/// The authoritative shared ladder: the accepted rung sequence plus the game
/// phase. The hub owns the single live instance; everything else works from
/// snapshots. Fields are private so every mutation goes through the methods
/// below, which keep the two fields consistent.
///
/// Also the persistence format: serialized as `{"rungs": [...], "phase": ...}`.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SessionState {
    rungs: Vec<Rung>,
    phase: Phase,
}

impl SessionState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rungs(&self) -> &[Rung] {
        &self.rungs
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Appends an accepted rung. Rejected while results are showing; geometric
    /// validation is the caller's job (see `ladder::validate_rung`).
    pub fn append(&mut self, rung: Rung) -> Result<(), PhaseLocked> {
        if self.phase == Phase::ShowingResults {
            return Err(PhaseLocked);
        }
        self.rungs.push(rung);
        Ok(())
    }

    /// Freezes the rung set and enters the results phase. Idempotent.
    pub fn finish(&mut self) {
        self.phase = Phase::ShowingResults;
    }

    /// Atomically clears the rung set and returns to `Drawing`. The two
    /// fields always change together; a reset never leaves an orphaned rung.
    pub fn reset(&mut self) {
        self.rungs.clear();
        self.phase = Phase::Drawing;
    }

    /// Detached copy for replay to joining clients and for persistence.
    pub fn snapshot(&self) -> SessionState {
        self.clone()
    }

    pub fn into_parts(self) -> (Vec<Rung>, Phase) {
        (self.rungs, self.phase)
    }

    pub fn from_parts(rungs: Vec<Rung>, phase: Phase) -> Self {
        Self { rungs, phase }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_is_gated_by_phase() {
        let mut state = SessionState::new();
        assert!(state.append(Rung::new(0, 1, 100.0)).is_ok());
        assert_eq!(state.rungs().len(), 1);

        state.finish();
        assert_eq!(state.phase(), Phase::ShowingResults);
        assert_eq!(state.append(Rung::new(1, 2, 200.0)), Err(PhaseLocked));
        assert_eq!(state.rungs().len(), 1);
    }

    #[test]
    fn reset_clears_rungs_and_phase_together() {
        let mut state = SessionState::new();
        state.append(Rung::new(0, 1, 100.0)).unwrap();
        state.finish();

        state.reset();
        assert!(state.rungs().is_empty());
        assert_eq!(state.phase(), Phase::Drawing);

        // Drawing is accepted again after the reset.
        assert!(state.append(Rung::new(0, 1, 100.0)).is_ok());
    }

    #[test]
    fn snapshot_is_detached_from_the_live_state() {
        let mut state = SessionState::new();
        state.append(Rung::new(0, 1, 100.0)).unwrap();

        let snapshot = state.snapshot();
        state.reset();

        assert_eq!(snapshot.rungs().len(), 1);
        assert!(state.rungs().is_empty());
    }

    #[test]
    fn persistence_format_round_trips() {
        let mut state = SessionState::new();
        state.append(Rung::new(0, 1, 100.0)).unwrap();
        state.finish();

        let json = serde_json::to_string(&state).unwrap();
        assert!(json.contains("\"phase\":\"showing_results\""));
        let restored: SessionState = serde_json::from_str(&json).unwrap();
        assert_eq!(restored, state);
    }
}
