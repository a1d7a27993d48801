//! Reverse geocoding for location suggestions.
//!
//! External services are best-effort: every call runs under a timeout, and a
//! failing or slow geocoder is logged and contributes nothing. Answers are
//! cached by rounded coordinates so repeated suggestions for the same stop do
//! not hit the network again.

use std::num::NonZeroUsize;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use futures::future::{join_all, BoxFuture};
use log::{debug, info, warn};
use lru::LruCache;
use serde::{Deserialize, Serialize};

use crate::config::ProcessingConfig;
use crate::{Point, Result};

/// A place name proposed by an external geocoder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlaceCandidate {
    pub label: String,
    pub point: Point,
}

/// An external reverse-geocoding service.
pub trait Geocoder: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &str;

    /// Places within `radius` meters of `point`.
    fn reverse<'a>(&'a self, point: &'a Point, radius: f64)
        -> BoxFuture<'a, Result<Vec<PlaceCandidate>>>;
}

/// Cache key: coordinates rounded to ~11m plus the radius in whole meters.
type CacheKey = (i64, i64, i64);

fn cache_key(point: &Point, radius: f64) -> CacheKey {
    (
        (point.lat * 1e4).round() as i64,
        (point.lon * 1e4).round() as i64,
        radius.round() as i64,
    )
}

/// All configured geocoders, queried together.
pub struct GeocoderSet {
    geocoders: Vec<Box<dyn Geocoder>>,
    timeout: Duration,
    cache: Option<Mutex<LruCache<CacheKey, Vec<PlaceCandidate>>>>,
}

impl GeocoderSet {
    /// An empty set. A `cache_size` of zero disables caching.
    pub fn new(timeout: Duration, cache_size: usize) -> Self {
        Self {
            geocoders: Vec::new(),
            timeout,
            cache: NonZeroUsize::new(cache_size).map(|n| Mutex::new(LruCache::new(n))),
        }
    }

    /// Build the geocoders enabled by `config`.
    ///
    /// Without the `http` feature the set is always empty.
    pub fn from_config(config: &ProcessingConfig) -> Self {
        #[allow(unused_mut)]
        let mut set = Self::new(
            Duration::from_millis(config.geocoding.timeout_ms),
            config.geocoding.cache_size,
        );

        #[cfg(feature = "http")]
        {
            let timeout = set.timeout;
            if !config.geocoding.nominatim_url.is_empty() {
                match http::NominatimGeocoder::new(
                    &config.geocoding.nominatim_url,
                    &config.geocoding.user_agent,
                    timeout,
                ) {
                    Ok(g) => set.push(Box::new(g)),
                    Err(e) => warn!("[Geocoder] Nominatim disabled: {}", e),
                }
            }
            if !config.location.google_key.is_empty() {
                match http::GooglePlacesGeocoder::new(&config.location.google_key, timeout) {
                    Ok(g) => set.push(Box::new(g)),
                    Err(e) => warn!("[Geocoder] Google Places disabled: {}", e),
                }
            }
        }

        info!("[Geocoder] {} geocoder(s) configured", set.len());
        set
    }

    pub fn push(&mut self, geocoder: Box<dyn Geocoder>) {
        self.geocoders.push(geocoder);
    }

    pub fn len(&self) -> usize {
        self.geocoders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.geocoders.is_empty()
    }

    /// Query every geocoder concurrently and concatenate their answers.
    ///
    /// Never fails: errors and timeouts only shrink the result.
    pub async fn suggest(&self, point: &Point, radius: f64) -> Vec<PlaceCandidate> {
        if self.geocoders.is_empty() {
            return Vec::new();
        }

        let key = cache_key(point, radius);
        if let Some(cache) = &self.cache {
            if let Ok(mut cache) = cache.lock() {
                if let Some(hit) = cache.get(&key) {
                    debug!("[Geocoder] Cache hit for {:?}", key);
                    return hit.clone();
                }
            }
        }

        let start = Instant::now();
        let calls = self.geocoders.iter().map(|g| async move {
            match tokio::time::timeout(self.timeout, g.reverse(point, radius)).await {
                Ok(Ok(places)) => Some(places),
                Ok(Err(e)) => {
                    warn!("[Geocoder] {} failed: {}", g.name(), e);
                    None
                }
                Err(_) => {
                    warn!("[Geocoder] {} timed out after {:?}", g.name(), self.timeout);
                    None
                }
            }
        });
        let answers = join_all(calls).await;

        let complete = answers.iter().all(Option::is_some);
        let places: Vec<PlaceCandidate> = answers.into_iter().flatten().flatten().collect();
        debug!(
            "[Geocoder] {} place(s) in {:.0}ms",
            places.len(),
            start.elapsed().as_secs_f64() * 1000.0
        );

        // Partial answers are not cached so a transient failure is retried
        if complete {
            if let Some(cache) = &self.cache {
                if let Ok(mut cache) = cache.lock() {
                    cache.put(key, places.clone());
                }
            }
        }

        places
    }

    /// Blocking wrapper around [`GeocoderSet::suggest`] on a runtime created
    /// for the call.
    ///
    /// Safe to call from inside a tokio runtime of either flavor: the call
    /// then runs on a scoped helper thread, since a runtime cannot block on
    /// the thread that drives it.
    pub fn suggest_blocking(&self, point: &Point, radius: f64) -> Vec<PlaceCandidate> {
        if self.geocoders.is_empty() {
            return Vec::new();
        }

        if tokio::runtime::Handle::try_current().is_err() {
            return self.suggest_on_own_runtime(point, radius);
        }

        debug!("[Geocoder] Called inside a runtime, querying from a helper thread");
        std::thread::scope(|scope| {
            scope
                .spawn(|| self.suggest_on_own_runtime(point, radius))
                .join()
                .unwrap_or_else(|_| {
                    warn!("[Geocoder] Helper thread panicked");
                    Vec::new()
                })
        })
    }

    fn suggest_on_own_runtime(&self, point: &Point, radius: f64) -> Vec<PlaceCandidate> {
        let rt = match tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
        {
            Ok(rt) => rt,
            Err(e) => {
                warn!("[Geocoder] Failed to create tokio runtime: {}", e);
                return Vec::new();
            }
        };
        rt.block_on(self.suggest(point, radius))
    }
}

// ============================================================================
// HTTP Geocoders
// ============================================================================

#[cfg(feature = "http")]
pub mod http {
    use std::time::Duration;

    use futures::future::{BoxFuture, FutureExt};
    use reqwest::Client;
    use serde::Deserialize;

    use super::{Geocoder, PlaceCandidate};
    use crate::{Point, Result, ReviewError};

    const GOOGLE_PLACES_URL: &str = "https://maps.googleapis.com/maps/api/place/nearbysearch/json";

    fn upstream(service: &str, e: impl std::fmt::Display) -> ReviewError {
        ReviewError::UpstreamUnavailable {
            service: service.to_string(),
            message: e.to_string(),
        }
    }

    fn client(user_agent: &str, timeout: Duration) -> Result<Client> {
        Client::builder()
            .user_agent(user_agent)
            .timeout(timeout)
            .build()
            .map_err(|e| ReviewError::Config {
                message: format!("Failed to create HTTP client: {}", e),
            })
    }

    #[derive(Debug, Deserialize)]
    struct NominatimResponse {
        #[serde(default)]
        name: Option<String>,
        display_name: Option<String>,
        lat: String,
        lon: String,
    }

    /// OpenStreetMap Nominatim reverse geocoding.
    pub struct NominatimGeocoder {
        client: Client,
        base_url: String,
    }

    impl NominatimGeocoder {
        pub fn new(base_url: &str, user_agent: &str, timeout: Duration) -> Result<Self> {
            Ok(Self {
                client: client(user_agent, timeout)?,
                base_url: base_url.trim_end_matches('/').to_string(),
            })
        }

        async fn lookup(&self, point: &Point) -> Result<Vec<PlaceCandidate>> {
            let url = format!("{}/reverse", self.base_url);
            let resp = self
                .client
                .get(&url)
                .query(&[
                    ("format", "jsonv2".to_string()),
                    ("lat", point.lat.to_string()),
                    ("lon", point.lon.to_string()),
                ])
                .send()
                .await
                .map_err(|e| upstream("nominatim", e))?;

            if !resp.status().is_success() {
                return Err(upstream("nominatim", format!("HTTP {}", resp.status())));
            }

            let data: NominatimResponse = resp.json().await.map_err(|e| upstream("nominatim", e))?;
            let label = data
                .name
                .filter(|n| !n.is_empty())
                .or(data.display_name)
                .unwrap_or_default();
            if label.is_empty() {
                return Ok(Vec::new());
            }

            let lat = data.lat.parse().unwrap_or(point.lat);
            let lon = data.lon.parse().unwrap_or(point.lon);
            Ok(vec![PlaceCandidate {
                label,
                point: Point::new(lat, lon),
            }])
        }
    }

    impl Geocoder for NominatimGeocoder {
        fn name(&self) -> &str {
            "nominatim"
        }

        fn reverse<'a>(
            &'a self,
            point: &'a Point,
            _radius: f64,
        ) -> BoxFuture<'a, Result<Vec<PlaceCandidate>>> {
            self.lookup(point).boxed()
        }
    }

    #[derive(Debug, Deserialize)]
    struct PlacesResponse {
        status: String,
        #[serde(default)]
        results: Vec<PlaceResult>,
    }

    #[derive(Debug, Deserialize)]
    struct PlaceResult {
        name: String,
        geometry: PlaceGeometry,
    }

    #[derive(Debug, Deserialize)]
    struct PlaceGeometry {
        location: LatLng,
    }

    #[derive(Debug, Deserialize)]
    struct LatLng {
        lat: f64,
        lng: f64,
    }

    /// Google Places nearby search.
    pub struct GooglePlacesGeocoder {
        client: Client,
        key: String,
    }

    impl GooglePlacesGeocoder {
        pub fn new(key: &str, timeout: Duration) -> Result<Self> {
            Ok(Self {
                client: client(concat!("trip-review/", env!("CARGO_PKG_VERSION")), timeout)?,
                key: key.to_string(),
            })
        }

        async fn lookup(&self, point: &Point, radius: f64) -> Result<Vec<PlaceCandidate>> {
            let resp = self
                .client
                .get(GOOGLE_PLACES_URL)
                .query(&[
                    ("location", format!("{},{}", point.lat, point.lon)),
                    ("radius", format!("{:.0}", radius)),
                    ("key", self.key.clone()),
                ])
                .send()
                .await
                .map_err(|e| upstream("google_places", e))?;

            if !resp.status().is_success() {
                return Err(upstream("google_places", format!("HTTP {}", resp.status())));
            }

            let data: PlacesResponse = resp.json().await.map_err(|e| upstream("google_places", e))?;
            match data.status.as_str() {
                "OK" | "ZERO_RESULTS" => Ok(data
                    .results
                    .into_iter()
                    .map(|r| PlaceCandidate {
                        label: r.name,
                        point: Point::new(r.geometry.location.lat, r.geometry.location.lng),
                    })
                    .collect()),
                status => Err(upstream("google_places", status)),
            }
        }
    }

    impl Geocoder for GooglePlacesGeocoder {
        fn name(&self) -> &str {
            "google_places"
        }

        fn reverse<'a>(
            &'a self,
            point: &'a Point,
            radius: f64,
        ) -> BoxFuture<'a, Result<Vec<PlaceCandidate>>> {
            self.lookup(point, radius).boxed()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ReviewError;
    use futures::FutureExt;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct Fixed {
        label: &'static str,
        calls: Arc<AtomicUsize>,
    }

    impl Geocoder for Fixed {
        fn name(&self) -> &str {
            "fixed"
        }

        fn reverse<'a>(
            &'a self,
            point: &'a Point,
            _radius: f64,
        ) -> BoxFuture<'a, Result<Vec<PlaceCandidate>>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let place = PlaceCandidate {
                label: self.label.to_string(),
                point: *point,
            };
            async move { Ok(vec![place]) }.boxed()
        }
    }

    struct Failing;

    impl Geocoder for Failing {
        fn name(&self) -> &str {
            "failing"
        }

        fn reverse<'a>(
            &'a self,
            _point: &'a Point,
            _radius: f64,
        ) -> BoxFuture<'a, Result<Vec<PlaceCandidate>>> {
            async {
                Err(ReviewError::UpstreamUnavailable {
                    service: "failing".to_string(),
                    message: "connection refused".to_string(),
                })
            }
            .boxed()
        }
    }

    struct Slow;

    impl Geocoder for Slow {
        fn name(&self) -> &str {
            "slow"
        }

        fn reverse<'a>(
            &'a self,
            point: &'a Point,
            _radius: f64,
        ) -> BoxFuture<'a, Result<Vec<PlaceCandidate>>> {
            async move {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(vec![PlaceCandidate {
                    label: "late".to_string(),
                    point: *point,
                }])
            }
            .boxed()
        }
    }

    fn fixed(label: &'static str) -> (Box<dyn Geocoder>, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        (
            Box::new(Fixed {
                label,
                calls: calls.clone(),
            }),
            calls,
        )
    }

    #[tokio::test]
    async fn test_failures_are_swallowed() {
        let mut set = GeocoderSet::new(Duration::from_millis(50), 0);
        let (cafe, _) = fixed("Cafe");
        set.push(cafe);
        set.push(Box::new(Failing));
        set.push(Box::new(Slow));

        let places = set.suggest(&Point::new(41.15, -8.61), 100.0).await;
        let labels: Vec<&str> = places.iter().map(|p| p.label.as_str()).collect();
        assert_eq!(labels, vec!["Cafe"]);
    }

    #[tokio::test]
    async fn test_complete_answers_are_cached() {
        let mut set = GeocoderSet::new(Duration::from_millis(500), 8);
        let (cafe, calls) = fixed("Cafe");
        set.push(cafe);

        let p = Point::new(41.15, -8.61);
        set.suggest(&p, 100.0).await;
        // Within the same rounding cell
        set.suggest(&Point::new(41.150001, -8.610001), 100.0).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        set.suggest(&p, 250.0).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_partial_answers_are_not_cached() {
        let mut set = GeocoderSet::new(Duration::from_millis(500), 8);
        let (cafe, calls) = fixed("Cafe");
        set.push(cafe);
        set.push(Box::new(Failing));

        let p = Point::new(41.15, -8.61);
        set.suggest(&p, 100.0).await;
        set.suggest(&p, 100.0).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_suggest_blocking() {
        let mut set = GeocoderSet::new(Duration::from_millis(500), 0);
        assert!(set.suggest_blocking(&Point::new(0.0, 0.0), 10.0).is_empty());

        let (cafe, _) = fixed("Cafe");
        set.push(cafe);
        assert_eq!(set.suggest_blocking(&Point::new(0.0, 0.0), 10.0).len(), 1);
    }

    #[tokio::test]
    async fn test_suggest_blocking_inside_current_thread_runtime() {
        let mut set = GeocoderSet::new(Duration::from_millis(500), 0);
        let (cafe, calls) = fixed("Cafe");
        set.push(cafe);
        let found = set.suggest_blocking(&Point::new(0.0, 0.0), 10.0);
        assert_eq!(found.len(), 1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_suggest_blocking_inside_multi_thread_runtime() {
        let mut set = GeocoderSet::new(Duration::from_millis(500), 0);
        let (cafe, _) = fixed("Cafe");
        set.push(cafe);
        set.push(Box::new(Failing));
        let found = set.suggest_blocking(&Point::new(0.0, 0.0), 10.0);
        assert_eq!(found.len(), 1);
    }

    #[test]
    fn test_default_config_has_no_geocoders() {
        let set = GeocoderSet::from_config(&ProcessingConfig::default());
        assert!(set.is_empty());
    }
}
