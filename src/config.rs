//! Processing configuration.
//!
//! [`ProcessingConfig`] is an immutable value. Changes are made by building a
//! new value with [`with_overrides`], which deep-merges a JSON patch over the
//! serialized base.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{Result, ReviewError};

/// Database settings.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DbConfig {
    /// SQLite database file. `None` means no database is configured and
    /// trips are reviewed without being persisted.
    pub path: Option<PathBuf>,
}

/// Noise smoothing options passed to the track engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SmoothingConfig {
    #[serde(rename = "use")]
    pub enabled: bool,
    /// Default: "inverse"
    pub algorithm: String,
    /// Default: 10
    pub noise: f64,
}

impl Default for SmoothingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            algorithm: "inverse".to_string(),
            noise: 10.0,
        }
    }
}

/// Segmentation options passed to the track engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SegmentationConfig {
    #[serde(rename = "use")]
    pub enabled: bool,
    /// Default: 1.0
    pub epsilon: f64,
    /// Minimum stop time in seconds. Default: 80
    pub min_time: f64,
}

impl Default for SegmentationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            epsilon: 1.0,
            min_time: 80.0,
        }
    }
}

/// Simplification options passed to the track engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SimplificationConfig {
    /// Default: 2.0
    pub max_dist_error: f64,
    /// Default: 1.0
    pub max_speed_error: f64,
    /// Default: 0.15
    pub eps: f64,
}

impl Default for SimplificationConfig {
    fn default() -> Self {
        Self {
            max_dist_error: 2.0,
            max_speed_error: 1.0,
            eps: 0.15,
        }
    }
}

/// Location clustering and lookup options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LocationConfig {
    /// Points within this many meters of a centroid count towards it.
    /// Default: 20.0
    pub max_distance: f64,
    /// Cluster size from which outliers stop moving the centroid.
    /// Default: 2
    pub min_samples: usize,
    /// Maximum number of suggestions returned. Default: 5
    pub limit: usize,
    /// Google Places API key. Empty disables the Google geocoder.
    pub google_key: String,
    /// Search radius for location suggestions, in meters. Default: 200.0
    pub suggestion_radius: f64,
}

impl Default for LocationConfig {
    fn default() -> Self {
        Self {
            max_distance: 20.0,
            min_samples: 2,
            limit: 5,
            google_key: String::new(),
            suggestion_radius: 200.0,
        }
    }
}

/// Transportation-mode inference options passed to the track engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportationConfig {
    pub remove_stops: bool,
    /// Minimum duration of a mode run in seconds. Default: 10
    pub min_time: f64,
}

impl Default for TransportationConfig {
    fn default() -> Self {
        Self {
            remove_stops: false,
            min_time: 10.0,
        }
    }
}

/// Canonical trip learning options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TripLearningConfig {
    /// Maximum discrete Fréchet distance, in meters, for a trip to be merged
    /// into an existing canonical trip. Default: 100.0
    pub epsilon: f64,
    /// Number of points both polylines are resampled to before scoring.
    /// Default: 50
    pub resample_count: usize,
    /// Upper bound on the number of points of a merged canonical trip.
    /// Default: 100
    pub max_points: usize,
}

impl Default for TripLearningConfig {
    fn default() -> Self {
        Self {
            epsilon: 100.0,
            resample_count: 50,
            max_points: 100,
        }
    }
}

/// Route completion options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompletionConfig {
    /// Maximum distance, in meters, between a query point and a canonical
    /// trip for the point to anchor on it. Default: 100.0
    pub anchor_radius: f64,
}

impl Default for CompletionConfig {
    fn default() -> Self {
        Self {
            anchor_radius: 100.0,
        }
    }
}

/// External geocoder options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GeocodingConfig {
    /// Per-call timeout in milliseconds. Default: 3000
    pub timeout_ms: u64,
    /// Number of cached reverse-geocoding answers. Default: 256
    pub cache_size: usize,
    /// Nominatim base URL. Empty disables the Nominatim geocoder.
    pub nominatim_url: String,
    pub user_agent: String,
}

impl Default for GeocodingConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 3000,
            cache_size: 256,
            nominatim_url: String::new(),
            user_agent: concat!("trip-review/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

/// Complete processing configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProcessingConfig {
    /// Folder scanned for raw recordings
    pub input_path: Option<PathBuf>,
    /// Raw recordings are moved here after their day is stored
    pub backup_path: Option<PathBuf>,
    /// Stored trips are exported here as GPX
    pub output_path: Option<PathBuf>,
    /// Annotations are written here, one file per trip
    pub life_path: Option<PathBuf>,
    /// File collecting every annotation. Defaults to `<life_path>/all.life`
    pub life_all: Option<PathBuf>,
    /// Extensions (without dot, case-insensitive) of queued files.
    /// Default: ["gpx"]
    pub supported_extensions: Vec<String>,
    /// strftime pattern for generated trip names. Default: "%Y-%m-%d"
    pub trip_name_format: String,
    pub db: DbConfig,
    pub smoothing: SmoothingConfig,
    pub segmentation: SegmentationConfig,
    pub simplification: SimplificationConfig,
    pub location: LocationConfig,
    pub transportation: TransportationConfig,
    pub trip_learning: TripLearningConfig,
    pub completion: CompletionConfig,
    pub geocoding: GeocodingConfig,
}

impl Default for ProcessingConfig {
    fn default() -> Self {
        Self {
            input_path: None,
            backup_path: None,
            output_path: None,
            life_path: None,
            life_all: None,
            supported_extensions: vec!["gpx".to_string()],
            trip_name_format: "%Y-%m-%d".to_string(),
            db: DbConfig::default(),
            smoothing: SmoothingConfig::default(),
            segmentation: SegmentationConfig::default(),
            simplification: SimplificationConfig::default(),
            location: LocationConfig::default(),
            transportation: TransportationConfig::default(),
            trip_learning: TripLearningConfig::default(),
            completion: CompletionConfig::default(),
            geocoding: GeocodingConfig::default(),
        }
    }
}

impl ProcessingConfig {
    /// Parse a JSON document as overrides of the default configuration.
    pub fn from_json_str(json: &str) -> Result<Self> {
        let patch: Value = serde_json::from_str(json).map_err(|e| ReviewError::Config {
            message: e.to_string(),
        })?;
        with_overrides(&Self::default(), &patch)
    }

    /// Whether `file_name` has one of the supported extensions.
    pub fn is_supported(&self, file_name: &str) -> bool {
        match file_name.rsplit_once('.') {
            Some((_, ext)) => self
                .supported_extensions
                .iter()
                .any(|s| s.eq_ignore_ascii_case(ext)),
            None => false,
        }
    }
}

/// Build a new configuration from `base` with `patch` deep-merged over it.
///
/// Objects merge key by key; any other value (including arrays and `null`)
/// replaces what was there. `base` is never modified.
pub fn with_overrides(base: &ProcessingConfig, patch: &Value) -> Result<ProcessingConfig> {
    let mut merged = serde_json::to_value(base).map_err(|e| ReviewError::Config {
        message: e.to_string(),
    })?;
    merge_value(&mut merged, patch);
    serde_json::from_value(merged).map_err(|e| ReviewError::Config {
        message: e.to_string(),
    })
}

fn merge_value(target: &mut Value, patch: &Value) {
    match (target, patch) {
        (Value::Object(target), Value::Object(patch)) => {
            for (key, value) in patch {
                match target.get_mut(key) {
                    Some(existing) => merge_value(existing, value),
                    None => {
                        target.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (target, patch) => *target = patch.clone(),
    }
}
