//! Canonical trip learning through the full review workflow, persisted to
//! an on-disk database.
//!
//! Run with: `cargo test --test canonical_learning`

mod common;

use common::{day_start, init_logging, walk, wobbly_walk, write_gpx, StubEngine, Workspace};
use trip_review::canonical::match_trip;
use trip_review::{AdvanceInput, GeometryStore, Point, ProcessingManager, Stage};

fn store_current_day(manager: &mut ProcessingManager) {
    for _ in 0..3 {
        manager.advance(AdvanceInput::default()).unwrap();
    }
}

fn relation_counts(manager: &ProcessingManager) -> Vec<u32> {
    manager
        .list_canonical_trips()
        .unwrap()
        .iter()
        .map(|c| c.relation_count)
        .collect()
}

#[test]
fn test_near_identical_trips_share_one_canonical_trip() {
    init_logging();
    let ws = Workspace::new();
    // A, B and C are parallel within half a meter; D is ~95km north
    write_gpx(&ws.input, "a.gpx", &wobbly_walk(41.150000, -8.62, 15, day_start(25)));
    write_gpx(&ws.input, "b.gpx", &wobbly_walk(41.150004, -8.62, 15, day_start(26)));
    write_gpx(&ws.input, "c.gpx", &wobbly_walk(41.149996, -8.62, 15, day_start(27)));
    write_gpx(&ws.input, "d.gpx", &wobbly_walk(42.000000, -8.62, 15, day_start(28)));

    let mut config = ws.config();
    config.db.path = Some(ws.db_path());
    let mut manager = ProcessingManager::new(config, Box::new(StubEngine::new())).unwrap();

    store_current_day(&mut manager);
    assert_eq!(relation_counts(&manager), vec![1]);

    store_current_day(&mut manager);
    assert_eq!(relation_counts(&manager), vec![2]);

    store_current_day(&mut manager);
    assert_eq!(relation_counts(&manager), vec![3]);

    store_current_day(&mut manager);
    assert_eq!(relation_counts(&manager), vec![3, 1]);
    assert_eq!(manager.get_state().stage, Stage::Done);

    // The merged geometry stays on the shared route and bounded in size
    let canonical = &manager.list_canonical_trips().unwrap()[0];
    assert!(canonical.points.len() <= manager.config().trip_learning.max_points);
    assert!(canonical
        .points
        .iter()
        .all(|p| (p.lat - 41.15).abs() < 5e-5));

    // Everything survived on disk, provenance included
    drop(manager);
    let store = GeometryStore::open(ws.db_path()).unwrap();
    let stats = store.stats().unwrap();
    assert_eq!(stats["trips"], 4);
    assert_eq!(stats["canonical_trips"], 2);
    assert_eq!(stats["canonical_trips_relations"], 4);
    assert_eq!(stats["trips_transportation_modes"], 4);
    let first = store.list_canonical_trips().unwrap()[0].id;
    assert_eq!(store.canonical_relations(first).unwrap().len(), 3);
}

#[test]
fn test_disjoint_bounds_do_not_match() {
    let mut store = GeometryStore::in_memory().unwrap();
    let a = walk(41.15, -8.62, 10, day_start(25));
    let far = walk(38.72, -9.14, 10, day_start(25));

    let tx = store.transaction().unwrap();
    let segment = trip_review::Segment::new(a.clone());
    let trip_id = tx.insert_trip("a", &segment).unwrap();
    tx.insert_canonical_trip(&a, trip_id).unwrap();

    assert!(match_trip(&tx, &far).unwrap().is_empty());
    assert_eq!(match_trip(&tx, &a).unwrap().len(), 1);
    tx.commit().unwrap();
}

#[test]
fn test_route_completion_from_learned_trips() {
    let ws = Workspace::new();
    // The same road walked on three days, plus a parallel street ~100m north
    write_gpx(&ws.input, "a.gpx", &wobbly_walk(41.15, -8.62, 20, day_start(25)));
    write_gpx(&ws.input, "b.gpx", &wobbly_walk(41.15, -8.62, 20, day_start(26)));
    write_gpx(&ws.input, "c.gpx", &wobbly_walk(41.15, -8.62, 20, day_start(27)));
    write_gpx(&ws.input, "d.gpx", &wobbly_walk(41.1509, -8.62, 20, day_start(28)));

    let mut config = ws.config();
    config.completion.anchor_radius = 200.0;
    let mut manager = ProcessingManager::with_store(
        config,
        Box::new(StubEngine::new()),
        GeometryStore::in_memory().unwrap(),
    )
    .unwrap();
    manager.run_bulk().unwrap();
    assert_eq!(relation_counts(&manager), vec![3, 1]);

    // The query envelope spans both streets, each endpoint within anchor range
    let from = Point::new(41.1497, -8.618);
    let to = Point::new(41.1512, -8.606);
    let completion = manager.complete_route(&from, &to).unwrap();
    assert_eq!(completion.possibilities.len(), 2);
    assert!((completion.weights.iter().sum::<f64>() - 1.0).abs() < 1e-9);
    assert!((completion.weights[0] - 0.75).abs() < 1e-9);
    for path in &completion.possibilities {
        assert!(path[0].lon < path[path.len() - 1].lon);
    }

    // Nowhere near a learned route
    let empty = manager
        .complete_route(&Point::new(40.0, -8.0), &Point::new(40.01, -8.0))
        .unwrap();
    assert!(empty.possibilities.is_empty());
    assert!(empty.weights.is_empty());
}
