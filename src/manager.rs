//! # Processing Manager
//!
//! Composition root of the review workflow. Owns the day queue, the review
//! state of the current day, the geometry store and the geocoders, and
//! exposes the operations consumed by a request-handling layer.
//!
//! ## Atomicity
//!
//! Every mutating operation computes its complete outcome (new history entry,
//! next queue, next day's track) before assigning anything, so a failure
//! leaves the previous state intact. The store step writes the whole day in
//! one transaction; raw files are moved to the backup folder while that
//! transaction is open and moved back if the commit fails. Exports run after
//! the commit and only produce warnings.
//!
//! ## Unreadable days
//!
//! A day whose files the engine cannot parse does not block the session.
//! Loading passes over it to the next readable day, leaves it queued, and
//! reports it as a [`Warning::DayUnreadable`] in every state until it is
//! removed or loads again. Only [`ProcessingManager::select_day`] fails on
//! such a day, because the caller asked for it by name.

use std::collections::BTreeMap;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use log::{debug, error, info, warn};
use serde::Serialize;
use serde_json::Value;

use crate::canonical::{self, RouteCompletion};
use crate::config::{with_overrides, DbConfig, LocationConfig, ProcessingConfig};
use crate::day_queue::{list_pending, DayQueue, RawFile};
use crate::error::{StoreError, StoreResult};
use crate::geocoding::GeocoderSet;
use crate::locations::{self, NoLocations};
use crate::review::{ReviewState, Stage};
use crate::store::{GeometryStore, StoreTx};
use crate::track_engine::{AnnotationDocument, TrackEngine};
use crate::{Bounds, CanonicalTrip, Location, Point, Result, ReviewError, Track, Warning};

/// Client input for one stage transition.
#[derive(Debug, Clone, Default)]
pub struct AdvanceInput {
    /// Client-edited track replacing the current one
    pub edits: Option<Track>,
    /// Annotation text for the store step. Defaults to the engine's summary
    pub annotation: Option<String>,
}

/// Snapshot of the session returned by every operation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionState {
    pub stage: Stage,
    /// Queued day keys, ascending
    pub day_queue: Vec<String>,
    pub current_day: Option<String>,
    pub current_track: Option<Track>,
    /// Engine-derived annotation of the current track, at `Annotate` only
    pub current_annotation: Option<String>,
    pub warnings: Vec<Warning>,
}

/// Queue, review and unreadable days computed by a reload.
type Reloaded = (DayQueue, ReviewState, BTreeMap<String, String>);

/// Geometry store as configured.
enum StoreSlot {
    NotConfigured,
    Unreachable(String),
    Ready(Mutex<GeometryStore>),
}

impl StoreSlot {
    fn open(db: &DbConfig) -> Self {
        match &db.path {
            None => StoreSlot::NotConfigured,
            Some(path) => match GeometryStore::open(path) {
                Ok(store) => StoreSlot::Ready(Mutex::new(store)),
                Err(e) => {
                    warn!("[ProcessingManager] Geometry store unavailable: {}", e);
                    match e {
                        StoreError::Unreachable { message } => StoreSlot::Unreachable(message),
                        other => StoreSlot::Unreachable(other.to_string()),
                    }
                }
            },
        }
    }

    fn get_mut(&mut self) -> StoreResult<&mut GeometryStore> {
        match self {
            StoreSlot::NotConfigured => Err(StoreError::NotConfigured),
            StoreSlot::Unreachable(message) => Err(StoreError::Unreachable {
                message: message.clone(),
            }),
            StoreSlot::Ready(store) => store.get_mut().map_err(|_| StoreError::Unreachable {
                message: "store lock poisoned".to_string(),
            }),
        }
    }

    fn with<T>(&self, f: impl FnOnce(&GeometryStore) -> StoreResult<T>) -> StoreResult<T> {
        match self {
            StoreSlot::NotConfigured => Err(StoreError::NotConfigured),
            StoreSlot::Unreachable(message) => Err(StoreError::Unreachable {
                message: message.clone(),
            }),
            StoreSlot::Ready(store) => {
                let store = store.lock().map_err(|_| StoreError::Unreachable {
                    message: "store lock poisoned".to_string(),
                })?;
                f(&store)
            }
        }
    }
}

/// The review workflow of one logical session.
pub struct ProcessingManager {
    config: ProcessingConfig,
    engine: Box<dyn TrackEngine>,
    store: StoreSlot,
    geocoders: GeocoderSet,
    queue: DayQueue,
    review: ReviewState,
    /// Queued days that failed to load, with the reason
    unreadable: BTreeMap<String, String>,
    is_bulk: bool,
}

impl ProcessingManager {
    /// Create a manager from `config`, opening the configured database and
    /// scanning the input folder.
    ///
    /// An unreachable database is not an error: the session runs without
    /// persistence and the store step reports it.
    pub fn new(config: ProcessingConfig, engine: Box<dyn TrackEngine>) -> Result<Self> {
        let store = StoreSlot::open(&config.db);
        let geocoders = GeocoderSet::from_config(&config);
        Self::assemble(config, engine, store, geocoders)
    }

    /// Create a manager around an already opened store.
    pub fn with_store(
        config: ProcessingConfig,
        engine: Box<dyn TrackEngine>,
        store: GeometryStore,
    ) -> Result<Self> {
        let geocoders = GeocoderSet::from_config(&config);
        Self::assemble(config, engine, StoreSlot::Ready(Mutex::new(store)), geocoders)
    }

    /// Replace the geocoders used for location suggestions.
    pub fn with_geocoders(mut self, geocoders: GeocoderSet) -> Self {
        self.geocoders = geocoders;
        self
    }

    fn assemble(
        config: ProcessingConfig,
        engine: Box<dyn TrackEngine>,
        store: StoreSlot,
        geocoders: GeocoderSet,
    ) -> Result<Self> {
        let mut manager = Self {
            config,
            engine,
            store,
            geocoders,
            queue: DayQueue::new(),
            review: ReviewState::done(),
            unreadable: BTreeMap::new(),
            is_bulk: false,
        };
        manager.reload_queue()?;
        Ok(manager)
    }

    pub fn config(&self) -> &ProcessingConfig {
        &self.config
    }

    // ========================================================================
    // State
    // ========================================================================

    pub fn get_state(&self) -> SessionState {
        self.state(Vec::new())
    }

    fn state(&self, mut warnings: Vec<Warning>) -> SessionState {
        warnings.extend(
            self.unreadable
                .iter()
                .filter(|(day, _)| self.queue.contains(day))
                .map(|(day, message)| Warning::DayUnreadable {
                    day: day.clone(),
                    message: message.clone(),
                }),
        );
        let current_track = self.review.current_track().cloned();
        let current_annotation = match self.review.stage() {
            Stage::Annotate => current_track.as_ref().map(|t| self.engine.to_annotation(t)),
            _ => None,
        };
        SessionState {
            stage: self.review.stage(),
            day_queue: self.queue.day_keys(),
            current_day: self.queue.current_day().map(str::to_string),
            current_track,
            current_annotation,
            warnings,
        }
    }

    /// Parse the current day of `queue` into a fresh review, or `Done` when
    /// the queue is empty.
    fn load_day(&self, queue: &DayQueue) -> Result<ReviewState> {
        let Some(day) = queue.current_day() else {
            info!("[ProcessingManager] Queue empty, review done");
            return Ok(ReviewState::done());
        };

        let mut segments = Vec::new();
        for file in queue.current_day_files() {
            let track = self.engine.parse_track(&file.path)?;
            segments.extend(track.segments);
        }
        let track = Track::new("", segments);
        track.validate()?;

        info!(
            "[ProcessingManager] Loaded day {} ({} file(s), {} segment(s))",
            day,
            queue.current_day_files().len(),
            track.segments.len()
        );
        Ok(ReviewState::start(track))
    }

    /// Load the current day of `queue`, moving on to the next day while the
    /// current one fails. Gives `Done` with the queue unmoved when no day
    /// loads. Returns the updated set of unreadable days.
    fn load_readable(&self, queue: &mut DayQueue) -> (ReviewState, BTreeMap<String, String>) {
        let mut unreadable = self.unreadable.clone();
        for _ in 0..queue.len() {
            let Some(day) = queue.current_day().map(str::to_string) else {
                break;
            };
            match self.load_day(queue) {
                Ok(review) => {
                    unreadable.remove(&day);
                    return (review, unreadable);
                }
                Err(e) => {
                    warn!("[ProcessingManager] Passing over unreadable day {}: {}", day, e);
                    unreadable.insert(day, e.to_string());
                    queue.advance_day(false);
                }
            }
        }
        if !queue.is_empty() {
            warn!(
                "[ProcessingManager] None of {} queued day(s) could be loaded",
                queue.len()
            );
        }
        (ReviewState::done(), unreadable)
    }

    fn scan(config: &ProcessingConfig) -> Result<Vec<RawFile>> {
        match &config.input_path {
            Some(input) => list_pending(input, config),
            None => Ok(Vec::new()),
        }
    }

    /// Queue and review after replacing the grouping with `files`. The review
    /// in progress survives only when its day is still current with exactly
    /// the files it was loaded from.
    fn reloaded(&self, files: Vec<RawFile>) -> Reloaded {
        let mut queue = self.queue.clone();
        queue.reload(files);
        if self.review.stage().is_active() && queue.current_day() == self.queue.current_day() {
            if queue.current_day_files() == self.queue.current_day_files() {
                return (queue, self.review.clone(), self.unreadable.clone());
            }
            info!(
                "[ProcessingManager] Files of day {:?} changed, restarting its review",
                queue.current_day()
            );
        }
        let (review, unreadable) = self.load_readable(&mut queue);
        (queue, review, unreadable)
    }

    fn apply(&mut self, (queue, review, unreadable): Reloaded) {
        self.queue = queue;
        self.review = review;
        self.unreadable = unreadable;
    }

    // ========================================================================
    // Day Navigation
    // ========================================================================

    /// Rescan the input folder and regroup pending files by day.
    pub fn reload_queue(&mut self) -> Result<SessionState> {
        let files = Self::scan(&self.config)?;
        let reloaded = self.reloaded(files);
        self.apply(reloaded);
        Ok(self.get_state())
    }

    pub fn select_day(&mut self, day: &str) -> Result<SessionState> {
        let mut queue = self.queue.clone();
        queue.select_day(day)?;
        let review = self.load_day(&queue)?;
        self.queue = queue;
        self.review = review;
        self.unreadable.remove(day);
        info!("[ProcessingManager] Selected day {}", day);
        Ok(self.get_state())
    }

    /// Keep the current day queued and start reviewing the next one.
    pub fn skip_day(&mut self) -> Result<SessionState> {
        let mut queue = self.queue.clone();
        queue.skip();
        let (review, unreadable) = self.load_readable(&mut queue);
        self.apply((queue, review, unreadable));
        Ok(self.get_state())
    }

    /// Drop `day` from the queue. Its files stay in the input folder and
    /// come back on the next reload.
    pub fn remove_day(&mut self, day: &str) -> Result<SessionState> {
        let mut queue = self.queue.clone();
        queue.remove_day(day)?;
        let mut unreadable = self.unreadable.clone();
        unreadable.remove(day);
        let review = if queue.current_day() == self.queue.current_day() {
            self.review.clone()
        } else {
            let (review, still_unreadable) = self.load_readable(&mut queue);
            unreadable = still_unreadable;
            unreadable.remove(day);
            review
        };
        self.apply((queue, review, unreadable));
        info!("[ProcessingManager] Removed day {}", day);
        Ok(self.get_state())
    }

    // ========================================================================
    // Stage Transitions
    // ========================================================================

    /// Run the handler of the current stage and move to the next one.
    pub fn advance(&mut self, input: AdvanceInput) -> Result<SessionState> {
        let warnings = self.step(input)?;
        Ok(self.state(warnings))
    }

    /// Step back one stage within the current day.
    pub fn undo(&mut self) -> SessionState {
        if self.review.restore() {
            info!("[ProcessingManager] Undo to {}", self.review.stage());
        }
        self.get_state()
    }

    /// Drive every queued day through all stages without confirmation.
    ///
    /// Transportation-mode learning is suppressed for the whole run.
    pub fn run_bulk(&mut self) -> Result<SessionState> {
        info!(
            "[ProcessingManager] Bulk processing {} day(s)",
            self.queue.len()
        );
        self.is_bulk = true;
        let mut warnings = Vec::new();
        let mut result = Ok(());
        while self.review.stage().is_active() {
            match self.step(AdvanceInput::default()) {
                Ok(w) => warnings.extend(w),
                Err(e) => {
                    result = Err(e);
                    break;
                }
            }
        }
        self.is_bulk = false;
        result?;
        Ok(self.state(warnings))
    }

    fn step(&mut self, input: AdvanceInput) -> Result<Vec<Warning>> {
        let stage = self.review.stage();
        if !stage.is_active() {
            warn!("[ProcessingManager] Cannot advance from {}", stage);
            return Err(ReviewError::InvalidStage {
                stage: stage.to_string(),
            });
        }

        let track = match input.edits {
            Some(edits) => edits,
            None => match self.review.current_track() {
                Some(track) => track.clone(),
                None => {
                    warn!("[ProcessingManager] No track to advance at {}", stage);
                    return Err(ReviewError::InvalidStage {
                        stage: stage.to_string(),
                    });
                }
            },
        };

        match stage {
            Stage::Preview => {
                let trip = self.preview_to_adjust(track)?;
                self.review.push(trip);
                Ok(Vec::new())
            }
            Stage::Adjust => {
                let annotated = self.adjust_to_annotate(track)?;
                self.review.push(annotated);
                Ok(Vec::new())
            }
            Stage::Annotate => self.annotate_to_next(track, input.annotation),
            Stage::Done => {
                warn!("[ProcessingManager] Cannot advance from {}", stage);
                Err(ReviewError::InvalidStage {
                    stage: stage.to_string(),
                })
            }
        }
    }

    fn preview_to_adjust(&self, track: Track) -> Result<Track> {
        track.validate()?;
        let mut trip = self.engine.raw_to_trip(
            track,
            &self.config.smoothing,
            &self.config.segmentation,
            &self.config.simplification,
        )?;
        if trip.name.is_empty() {
            trip.name = self
                .engine
                .generate_name(&trip, &self.config.trip_name_format);
        }
        trip.validate()?;
        info!(
            "[ProcessingManager] Preview -> Adjust: '{}' ({} segment(s))",
            trip.name,
            trip.segments.len()
        );
        Ok(trip)
    }

    fn adjust_to_annotate(&self, track: Track) -> Result<Track> {
        track.validate()?;
        let located = match &self.store {
            StoreSlot::Ready(store) => match store.lock() {
                Ok(store) => self
                    .engine
                    .infer_locations(track, &*store, &self.config.location)?,
                Err(_) => {
                    warn!("[ProcessingManager] Store lock poisoned, inferring without known locations");
                    self.engine
                        .infer_locations(track, &NoLocations, &self.config.location)?
                }
            },
            _ => self
                .engine
                .infer_locations(track, &NoLocations, &self.config.location)?,
        };
        let annotated = self
            .engine
            .infer_transportation_modes(located, &self.config.transportation)?;
        annotated.validate()?;
        info!("[ProcessingManager] Adjust -> Annotate: '{}'", annotated.name);
        Ok(annotated)
    }

    fn annotate_to_next(&mut self, track: Track, annotation: Option<String>) -> Result<Vec<Warning>> {
        track.validate()?;
        let annotation = annotation
            .filter(|a| !a.trim().is_empty())
            .unwrap_or_else(|| self.engine.to_annotation(&track));
        let document = self.engine.parse_annotation(&annotation)?;

        // Everything that can fail without side effects happens first
        let mut next_queue = self.queue.clone();
        next_queue.advance_day(true);
        let (next_review, mut unreadable) = self.load_readable(&mut next_queue);
        if let Some(day) = self.queue.current_day() {
            unreadable.remove(day);
        }
        let files = self.queue.current_day_files().to_vec();

        let mut warnings = match self.store.get_mut() {
            Ok(store) => store_day(store, &self.config, &track, &document, &files)?,
            Err(e) => {
                warn!("[ProcessingManager] Trip '{}' not persisted: {}", track.name, e);
                let (_, mut warnings) = move_to_backup(&files, self.config.backup_path.as_deref());
                warnings.insert(
                    0,
                    Warning::PersistenceSkipped {
                        reason: e.to_string(),
                    },
                );
                warnings
            }
        };

        warnings.extend(export(&self.config, self.engine.as_ref(), &track, &annotation));

        if !self.is_bulk {
            if let Err(e) = self.engine.learn_transportation_modes(&track) {
                warn!("[ProcessingManager] Transportation model not updated: {}", e);
            }
        }

        info!(
            "[ProcessingManager] Stored '{}' for day {:?} ({} warning(s))",
            track.name,
            self.queue.current_day(),
            warnings.len()
        );
        self.apply((next_queue, next_review, unreadable));
        Ok(warnings)
    }

    // ========================================================================
    // Learning Queries
    // ========================================================================

    /// Candidate routes from `from` to `to` taken from learned canonical trips.
    pub fn complete_route(&self, from: &Point, to: &Point) -> Result<RouteCompletion> {
        let bounds = Bounds::envelope(from, to);
        let candidates = self
            .store
            .with(|store| store.canonical_trips_with_weights(&bounds))?;
        debug!(
            "[ProcessingManager] {} canonical trip(s) around the route query",
            candidates.len()
        );
        Ok(canonical::complete_route(
            &candidates,
            from,
            to,
            self.config.completion.anchor_radius,
        ))
    }

    /// Load an externally written annotation document (places and stays)
    /// into the store.
    pub fn ingest_annotation_document(&mut self, text: &str) -> Result<SessionState> {
        let document = self.engine.parse_annotation(text)?;
        let store = self.store.get_mut()?;
        let tx = store.transaction()?;
        ingest_document(&tx, &document, &self.config.location)?;
        tx.commit()?;
        info!(
            "[ProcessingManager] Ingested {} location(s) and {} stay(s)",
            document.locations.len(),
            document.stays.len()
        );
        Ok(self.get_state())
    }

    /// Labels for a place at `point`, nearest first: known locations, then
    /// whatever the geocoders propose. Never fails.
    pub fn suggest_location(&self, point: &Point) -> Vec<String> {
        let radius = self.config.location.suggestion_radius;
        let known = self
            .store
            .with(|store| store.locations_within(point, radius))
            .unwrap_or_else(|e| {
                debug!("[ProcessingManager] No stored suggestions: {}", e);
                Vec::new()
            });
        let places = self.geocoders.suggest_blocking(point, radius);
        locations::suggest(point, known, places, self.config.location.limit)
    }

    pub fn list_canonical_trips(&self) -> Result<Vec<CanonicalTrip>> {
        Ok(self.store.with(|store| store.list_canonical_trips())?)
    }

    pub fn list_canonical_locations(&self) -> Result<Vec<Location>> {
        Ok(self.store.with(|store| store.list_locations())?)
    }

    pub fn suggest_transportation_modes(&self, points: &[Point]) -> Vec<String> {
        self.engine.suggest_transportation_modes(points)
    }

    // ========================================================================
    // Configuration
    // ========================================================================

    /// Swap in `patch` merged over the current configuration.
    ///
    /// The database is reopened when its path changes, the geocoders are
    /// rebuilt when their settings change, and the queue is rescanned when the
    /// input folder or extensions change.
    pub fn reconfigure(&mut self, patch: &Value) -> Result<SessionState> {
        let config = with_overrides(&self.config, patch)?;

        let rescan = config.input_path != self.config.input_path
            || config.supported_extensions != self.config.supported_extensions;
        let reloaded = if rescan {
            Some(self.reloaded(Self::scan(&config)?))
        } else {
            None
        };

        if config.db != self.config.db {
            self.store = StoreSlot::open(&config.db);
        }
        if config.geocoding != self.config.geocoding
            || config.location.google_key != self.config.location.google_key
        {
            self.geocoders = GeocoderSet::from_config(&config);
        }
        self.config = config;
        if let Some(reloaded) = reloaded {
            self.apply(reloaded);
        }
        info!("[ProcessingManager] Configuration updated");
        Ok(self.get_state())
    }
}

// ============================================================================
// Store Step
// ============================================================================

/// Persist one day in a single transaction: trips with their tags, canonical
/// trip learning, and the annotation's places and stays. Raw files are moved
/// to the backup folder before the commit and moved back if it fails.
fn store_day(
    store: &mut GeometryStore,
    config: &ProcessingConfig,
    track: &Track,
    document: &AnnotationDocument,
    files: &[RawFile],
) -> Result<Vec<Warning>> {
    let tx = store.transaction()?;

    for segment in &track.segments {
        let trip_id = tx.insert_trip(&track.name, segment)?;
        let candidates = canonical::match_trip(&tx, &segment.points)?;
        let outcome = canonical::learn(
            &segment.points,
            trip_id,
            &candidates,
            |points, source| tx.insert_canonical_trip(points, source),
            |id, points, source| tx.update_canonical_trip(id, points, source),
            &config.trip_learning,
        )?;
        debug!(
            "[ProcessingManager] Trip {} -> {:?} ({} candidate(s))",
            trip_id,
            outcome,
            candidates.len()
        );
    }

    ingest_document(&tx, document, &config.location)?;

    let (moved, warnings) = move_to_backup(files, config.backup_path.as_deref());
    if let Err(e) = tx.commit() {
        error!("[ProcessingManager] Commit failed, restoring raw files: {}", e);
        restore_backups(&moved);
        return Err(e.into());
    }
    Ok(warnings)
}

fn ingest_document(
    tx: &StoreTx<'_>,
    document: &AnnotationDocument,
    options: &LocationConfig,
) -> StoreResult<()> {
    for (label, point) in &document.locations {
        locations::resolve(tx, label, point, options.max_distance, options.min_samples)?;
    }
    for stay in &document.stays {
        tx.insert_stay(stay)?;
    }
    Ok(())
}

fn move_to_backup(files: &[RawFile], backup: Option<&Path>) -> (Vec<(PathBuf, PathBuf)>, Vec<Warning>) {
    let Some(backup) = backup else {
        return (Vec::new(), Vec::new());
    };

    let mut moved = Vec::new();
    let mut warnings = Vec::new();
    for file in files {
        let target = backup.join(&file.name);
        match fs::rename(&file.path, &target) {
            Ok(()) => moved.push((file.path.clone(), target)),
            Err(e) => {
                warn!(
                    "[ProcessingManager] Backup of {} failed: {}",
                    file.path.display(),
                    e
                );
                warnings.push(Warning::BackupFailed {
                    file: file.name.clone(),
                    message: e.to_string(),
                });
            }
        }
    }
    (moved, warnings)
}

fn restore_backups(moved: &[(PathBuf, PathBuf)]) {
    for (original, backup) in moved {
        if let Err(e) = fs::rename(backup, original) {
            error!(
                "[ProcessingManager] Could not restore {} from backup: {}",
                original.display(),
                e
            );
        }
    }
}

/// Write the GPX export and the annotation files. Failures become warnings.
fn export(
    config: &ProcessingConfig,
    engine: &dyn TrackEngine,
    track: &Track,
    annotation: &str,
) -> Vec<Warning> {
    let mut warnings = Vec::new();
    let name = if track.name.is_empty() {
        "trip"
    } else {
        track.name.as_str()
    };

    let mut record = |path: PathBuf, result: std::io::Result<()>| {
        if let Err(e) = result {
            warn!("[ProcessingManager] Export to {} failed: {}", path.display(), e);
            warnings.push(Warning::ExportFailed {
                path: path.display().to_string(),
                message: e.to_string(),
            });
        }
    };

    if let Some(output) = &config.output_path {
        let path = output.join(format!("{}.gpx", name));
        let result = fs::write(&path, engine.to_gpx(track));
        record(path, result);
    }

    if let Some(life) = &config.life_path {
        let path = life.join(format!("{}.life", name));
        let result = fs::write(&path, annotation);
        record(path, result);

        let all = config
            .life_all
            .clone()
            .unwrap_or_else(|| life.join("all.life"));
        let result = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&all)
            .and_then(|mut f| write!(f, "\n\n{}", annotation));
        record(all, result);
    }

    warnings
}
