//! Performance benchmarks for critical sync paths

use client::{ClientConfig, FlagStore, SessionError, SyncClient, Transport};
use server::world::{World, WorldConfig};
use shared::geo::{distance, nearest_conflict};
use shared::{
    Flag, FlagPayload, PlaceOptions, Position, ServerMessage, RECONCILE_TOLERANCE_M,
    TERRITORY_RADIUS_M,
};
use std::time::Instant;

struct NullTransport;

impl Transport for NullTransport {
    fn transmit(&mut self, _frame: String) -> Result<(), SessionError> {
        Ok(())
    }

    fn close(&mut self, _reason: &str) {}
}

/// Flags on a grid roughly 1.1 km apart, alternating owners
fn grid_flags(count: usize) -> Vec<Flag> {
    (0..count)
        .map(|i| Flag {
            id: format!("flag-{}", i),
            owner_id: format!("player-{}", i % 7),
            name: None,
            position: Position::new((i / 100) as f64 * 0.01, (i % 100) as f64 * 0.01),
            is_public: false,
            toll: 0,
            is_hardened: false,
            is_provisional: false,
            created_at: i as u64,
        })
        .collect()
}

/// Benchmarks the haversine distance
#[test]
fn benchmark_distance() {
    let a = Position::new(59.3293, 18.0686);
    let b = Position::new(59.3326, 18.0649);

    let iterations = 100_000;
    let start = Instant::now();

    let mut total = 0.0;
    for _ in 0..iterations {
        total += distance(&a, &b);
    }

    let duration = start.elapsed();
    println!(
        "Distance: {} iterations in {:?} ({:.2} ns/iter)",
        iterations,
        duration,
        duration.as_nanos() as f64 / iterations as f64
    );

    assert!(total > 0.0);
    // Should complete in under 500ms for 100k iterations
    assert!(duration.as_millis() < 500);
}

/// Benchmarks a territory check against a large world
#[test]
fn benchmark_territory_check() {
    let flags = grid_flags(10_000);
    let candidates: Vec<Position> = (0..100)
        .map(|i| Position::new(i as f64 * 0.005, i as f64 * 0.003))
        .collect();

    let start = Instant::now();

    let conflicts = candidates
        .iter()
        .filter(|candidate| {
            nearest_conflict(candidate, &flags, TERRITORY_RADIUS_M, "newcomer").is_some()
        })
        .count();

    let duration = start.elapsed();
    println!(
        "Territory check: 100 candidates x 10k flags in {:?} ({} conflicts)",
        duration, conflicts
    );

    assert!(conflicts > 0);
    assert!(duration.as_millis() < 2000);
}

/// Benchmarks optimistic placement followed by confirmation
#[test]
fn benchmark_reconciliation_performance() {
    let mut store = FlagStore::new(TERRITORY_RADIUS_M, RECONCILE_TOLERANCE_M);
    store.set_local_player(Some("alice".to_string()));

    let iterations = 1_000;
    let start = Instant::now();

    for i in 0..iterations {
        let position = Position::new((i / 50) as f64 * 0.01, (i % 50) as f64 * 0.01);
        let provisional = store
            .place_provisional(position, PlaceOptions::default(), i as u64)
            .unwrap();

        let mut confirmed = provisional.clone();
        confirmed.id = format!("flag-{}", i);
        confirmed.is_provisional = false;
        let outcome = store.confirm_placement(confirmed);
        assert_eq!(outcome.replaced, Some(provisional.id));
    }

    let duration = start.elapsed();
    println!(
        "Reconciliation: {} place/confirm cycles in {:?}",
        iterations, duration
    );

    assert_eq!(store.provisional_count(), 0);
    assert_eq!(store.len(), iterations);
    assert!(duration.as_millis() < 2000);
}

/// Benchmarks inbound routing of remote placements
#[test]
fn benchmark_frame_dispatch() {
    let frames: Vec<String> = grid_flags(5_000)
        .into_iter()
        .map(|flag| serde_json::to_string(&ServerMessage::FlagPlacedByOther(FlagPayload { flag })).unwrap())
        .collect();

    let mut client: SyncClient<NullTransport> = SyncClient::new(&ClientConfig::default());

    let start = Instant::now();
    for frame in &frames {
        client.handle_frame(frame);
    }
    let duration = start.elapsed();

    println!(
        "Dispatch: {} frames in {:?} ({:.2} μs/frame)",
        frames.len(),
        duration,
        duration.as_micros() as f64 / frames.len() as f64
    );

    assert_eq!(client.all_flags().len(), 5_000);
    assert!(duration.as_millis() < 2000);
}

/// Stress test for server-side placement under many players
#[test]
fn stress_test_server_placements() {
    let mut world = World::new(WorldConfig::default());
    for p in 0..10 {
        world.join(&format!("player-{}", p), "bench");
    }

    let start = Instant::now();
    let mut placed = 0;
    for i in 0..2_000 {
        let owner = format!("player-{}", i % 10);
        let position = Position::new((i / 50) as f64 * 0.01, (i % 50) as f64 * 0.01);
        if world
            .place_flag(&owner, position, PlaceOptions::default(), i as u64)
            .is_ok()
        {
            placed += 1;
        }
    }
    let duration = start.elapsed();

    println!("Server placements: {} accepted in {:?}", placed, duration);

    assert_eq!(placed, 2_000);
    assert_eq!(world.flag_count(), 2_000);
    assert!(duration.as_millis() < 5000);
}
