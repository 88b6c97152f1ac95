use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Two rungs that share a rail must sit at least this far apart vertically.
pub const MIN_VERTICAL_GAP: f64 = 20.0;

const DEFAULT_RAILS: usize = 4;
const DEFAULT_WIDTH: f64 = 600.0;
const DEFAULT_HEIGHT: f64 = 400.0;

/// Fixed geometry of one ladder session: rail count and canvas extent.
/// Rail x positions are derived from this, never stored.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Layout {
    pub rails: usize,
    pub width: f64,
    pub height: f64,
}

impl Default for Layout {
    fn default() -> Self {
        Self {
            rails: DEFAULT_RAILS,
            width: DEFAULT_WIDTH,
            height: DEFAULT_HEIGHT,
        }
    }
}

impl Layout {
    /// Evenly spaced rail x positions: rail i sits at (i + 1) * width / (rails + 1).
    pub fn rail_positions(&self) -> Vec<f64> {
        let spacing = self.width / (self.rails as f64 + 1.0);
        (0..self.rails).map(|i| (i as f64 + 1.0) * spacing).collect()
    }

    /// Maps a horizontal position to the adjacent rail pair it falls between.
    /// Positions outside the middle 20-80% band between two rails map to
    /// nothing, so a click hugging a rail never produces a rung.
    pub fn rail_pair_at(&self, x: f64) -> Option<(usize, usize)> {
        let positions = self.rail_positions();
        let left = positions.iter().rposition(|&pos| pos < x)?;
        if left + 1 >= self.rails {
            return None;
        }
        let span = positions[left + 1] - positions[left];
        let offset = x - positions[left];
        if offset > span * 0.2 && offset < span * 0.8 {
            Some((left, left + 1))
        } else {
            None
        }
    }
}

/// A user-drawn horizontal connector between two adjacent rails.
/// Immutable once accepted; the rung collection only ever grows by append
/// or is cleared wholesale by a reset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rung {
    pub id: Uuid,
    pub rail_left: usize,
    pub rail_right: usize,
    pub y: f64,
}

impl Rung {
    pub fn new(rail_left: usize, rail_right: usize, y: f64) -> Self {
        Self {
            id: Uuid::new_v4(),
            rail_left,
            rail_right,
            y,
        }
    }

    pub fn touches(&self, rail: usize) -> bool {
        self.rail_left == rail || self.rail_right == rail
    }

    fn shares_rail(&self, other: &Rung) -> bool {
        self.rail_left <= other.rail_right && other.rail_left <= self.rail_right
    }
}

/// Why a candidate rung was not accepted. Carried over the wire, so every
/// client can report the same verdict the hub reached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RungRejection {
    #[error("rung must connect two adjacent rails")]
    NotAdjacent,
    #[error("rung lies outside the ladder's rails")]
    OutOfRange,
    #[error("a rung on the same rail pair sits too close vertically")]
    TooCloseVertically,
    #[error("a rung on an overlapping rail pair sits too close vertically")]
    Overlapping,
}

/// Pure accept/reject decision for a candidate rung against the current set
/// and layout. Runs identically on the submitting client and on the hub;
/// divergence between the two would silently fork the shared state. A rung
/// accepted here always satisfies the resolver's preconditions, so a remote
/// payload can never poison `resolve_path` for everyone else.
pub fn validate_rung(
    candidate: &Rung,
    existing: &[Rung],
    layout: &Layout,
) -> Result<(), RungRejection> {
    if candidate.rail_right != candidate.rail_left + 1 {
        return Err(RungRejection::NotAdjacent);
    }
    if candidate.rail_right >= layout.rails {
        return Err(RungRejection::OutOfRange);
    }
    for rung in existing {
        if (rung.y - candidate.y).abs() < MIN_VERTICAL_GAP && rung.shares_rail(candidate) {
            if rung.rail_left == candidate.rail_left {
                return Err(RungRejection::TooCloseVertically);
            }
            return Err(RungRejection::Overlapping);
        }
    }
    Ok(())
}

/// Precondition violations surfaced by the resolver. These indicate a defect
/// upstream (a malformed rung reached the accepted set), never user input.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LadderError {
    #[error("start rail {0} is outside the layout")]
    StartRailOutOfRange(usize),
    #[error("rung {id} connects rails {rail_left} and {rail_right}, which is not an adjacent pair inside the layout")]
    MalformedRung {
        id: Uuid,
        rail_left: usize,
        rail_right: usize,
    },
}

/// One step of a resolved token path, in traversal order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PathStep {
    Down { rail: usize, from_y: f64, to_y: f64 },
    Cross { y: f64, from_rail: usize, to_rail: usize },
}

/// The full deterministic traversal for one starting rail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resolution {
    pub start_rail: usize,
    pub end_rail: usize,
    pub steps: Vec<PathStep>,
}

/// Walks a token down `start_rail`. Rungs are scanned in increasing y order
/// (arrival order breaks ties); a reached rung touching the current rail is
/// always crossed, and a crossed rung is never revisited within the same
/// resolution, so degenerate geometries cannot oscillate. Deterministic and
/// idempotent: the same inputs always yield the same path.
pub fn resolve_path(
    start_rail: usize,
    rungs: &[Rung],
    layout: &Layout,
) -> Result<Resolution, LadderError> {
    if start_rail >= layout.rails {
        return Err(LadderError::StartRailOutOfRange(start_rail));
    }
    for rung in rungs {
        if rung.rail_right != rung.rail_left + 1 || rung.rail_right >= layout.rails {
            return Err(LadderError::MalformedRung {
                id: rung.id,
                rail_left: rung.rail_left,
                rail_right: rung.rail_right,
            });
        }
    }

    let mut order: Vec<usize> = (0..rungs.len()).collect();
    order.sort_by(|&a, &b| rungs[a].y.total_cmp(&rungs[b].y).then(a.cmp(&b)));

    let mut used = vec![false; rungs.len()];
    let mut rail = start_rail;
    let mut y = 0.0;
    let mut steps = Vec::new();

    while let Some(idx) = order.iter().copied().find(|&i| {
        !used[i] && rungs[i].y >= y && rungs[i].y <= layout.height && rungs[i].touches(rail)
    }) {
        let rung = &rungs[idx];
        used[idx] = true;
        if rung.y > y {
            steps.push(PathStep::Down {
                rail,
                from_y: y,
                to_y: rung.y,
            });
        }
        let to_rail = if rung.rail_left == rail {
            rung.rail_right
        } else {
            rung.rail_left
        };
        steps.push(PathStep::Cross {
            y: rung.y,
            from_rail: rail,
            to_rail,
        });
        rail = to_rail;
        y = rung.y;
    }

    steps.push(PathStep::Down {
        rail,
        from_y: y,
        to_y: layout.height,
    });

    Ok(Resolution {
        start_rail,
        end_rail: rail,
        steps,
    })
}
