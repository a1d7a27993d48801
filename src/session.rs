//! One logical review session shared by concurrent callers.
//!
//! Mutating operations take the write lock, so they are serialized and never
//! interleave. Queries take the read lock and may run together, always on a
//! consistent snapshot. Sessions are ordinary values: create one per
//! workspace (or per test) instead of sharing a process-wide instance.

use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use serde_json::Value;

use crate::canonical::RouteCompletion;
use crate::manager::{AdvanceInput, ProcessingManager, SessionState};
use crate::{CanonicalTrip, Location, Point, ProcessingConfig, Result, TrackEngine};

pub struct Session {
    manager: RwLock<ProcessingManager>,
}

impl Session {
    pub fn new(manager: ProcessingManager) -> Self {
        Self {
            manager: RwLock::new(manager),
        }
    }

    /// Build a manager from `config` and wrap it.
    pub fn open(config: ProcessingConfig, engine: Box<dyn TrackEngine>) -> Result<Self> {
        Ok(Self::new(ProcessingManager::new(config, engine)?))
    }

    // Operations assign only after they succeed, so a poisoned lock still
    // guards a consistent manager.
    fn read(&self) -> RwLockReadGuard<'_, ProcessingManager> {
        self.manager.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, ProcessingManager> {
        self.manager.write().unwrap_or_else(|e| e.into_inner())
    }

    pub fn get_state(&self) -> SessionState {
        self.read().get_state()
    }

    pub fn advance(&self, input: AdvanceInput) -> Result<SessionState> {
        self.write().advance(input)
    }

    pub fn undo(&self) -> SessionState {
        self.write().undo()
    }

    pub fn select_day(&self, day: &str) -> Result<SessionState> {
        self.write().select_day(day)
    }

    pub fn skip_day(&self) -> Result<SessionState> {
        self.write().skip_day()
    }

    pub fn remove_day(&self, day: &str) -> Result<SessionState> {
        self.write().remove_day(day)
    }

    pub fn reload_queue(&self) -> Result<SessionState> {
        self.write().reload_queue()
    }

    pub fn run_bulk(&self) -> Result<SessionState> {
        self.write().run_bulk()
    }

    pub fn ingest_annotation_document(&self, text: &str) -> Result<SessionState> {
        self.write().ingest_annotation_document(text)
    }

    pub fn reconfigure(&self, patch: &Value) -> Result<SessionState> {
        self.write().reconfigure(patch)
    }

    pub fn complete_route(&self, from: &Point, to: &Point) -> Result<RouteCompletion> {
        self.read().complete_route(from, to)
    }

    pub fn suggest_location(&self, point: &Point) -> Vec<String> {
        self.read().suggest_location(point)
    }

    pub fn list_canonical_trips(&self) -> Result<Vec<CanonicalTrip>> {
        self.read().list_canonical_trips()
    }

    pub fn list_canonical_locations(&self) -> Result<Vec<Location>> {
        self.read().list_canonical_locations()
    }

    pub fn suggest_transportation_modes(&self, points: &[Point]) -> Vec<String> {
        self.read().suggest_transportation_modes(points)
    }

    pub fn config(&self) -> ProcessingConfig {
        self.read().config().clone()
    }
}
