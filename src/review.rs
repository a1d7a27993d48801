//! Review state machine for one day's batch of recordings.
//!
//! Stages follow `Preview → Adjust → Annotate` and back to `Preview` for the
//! next day. `Done` is only entered when no day is left. Every completed
//! stage pushes the resulting track on a linear history, which is what undo
//! walks back.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::Track;

/// Workflow stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Stage {
    Preview,
    Adjust,
    Annotate,
    Done,
}

/// `(stage, next, previous)` for the active stages.
const TRANSITIONS: [(Stage, Stage, Stage); 3] = [
    (Stage::Preview, Stage::Adjust, Stage::Annotate),
    (Stage::Adjust, Stage::Annotate, Stage::Preview),
    (Stage::Annotate, Stage::Preview, Stage::Adjust),
];

impl Stage {
    /// Stage entered after this one completes. `None` for `Done`.
    pub fn next(self) -> Option<Stage> {
        TRANSITIONS
            .iter()
            .find(|(stage, _, _)| *stage == self)
            .map(|(_, next, _)| *next)
    }

    /// Stage an undo steps back to. `None` for `Done`.
    pub fn previous(self) -> Option<Stage> {
        TRANSITIONS
            .iter()
            .find(|(stage, _, _)| *stage == self)
            .map(|(_, _, previous)| *previous)
    }

    pub fn is_active(self) -> bool {
        self != Stage::Done
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Preview => "Preview",
            Stage::Adjust => "Adjust",
            Stage::Annotate => "Annotate",
            Stage::Done => "Done",
        };
        f.write_str(name)
    }
}

/// Stage and track history of the day under review.
///
/// Outside `Done` the history is never empty and its last entry is the
/// current track.
#[derive(Debug, Clone, PartialEq)]
pub struct ReviewState {
    stage: Stage,
    history: Vec<Track>,
}

impl ReviewState {
    /// Start a day at `Preview` with `track` as the only history entry.
    pub fn start(track: Track) -> Self {
        Self {
            stage: Stage::Preview,
            history: vec![track],
        }
    }

    pub fn done() -> Self {
        Self {
            stage: Stage::Done,
            history: Vec::new(),
        }
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn history(&self) -> &[Track] {
        &self.history
    }

    pub fn current_track(&self) -> Option<&Track> {
        self.history.last()
    }

    /// Record the result of a completed stage and move forward.
    ///
    /// Returns `false` (and changes nothing) in `Done`.
    pub fn push(&mut self, track: Track) -> bool {
        match self.stage.next() {
            Some(next) => {
                self.history.push(track);
                self.stage = next;
                true
            }
            None => false,
        }
    }

    /// Undo one stage: drop the last history entry and step back.
    ///
    /// A no-op at `Preview` and `Done`. Returns whether anything changed.
    pub fn restore(&mut self) -> bool {
        if matches!(self.stage, Stage::Preview | Stage::Done) || self.history.len() < 2 {
            return false;
        }
        match self.stage.previous() {
            Some(previous) => {
                self.history.pop();
                self.stage = previous;
                true
            }
            None => false,
        }
    }
}
