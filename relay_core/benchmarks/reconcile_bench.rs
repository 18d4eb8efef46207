use criterion::{criterion_group, criterion_main, BatchSize, BenchmarkId, Criterion};
use relay_core::{RawRobotRow, ReconciliationEngine, TickEvent, World};
use serde_json::{json, Value};

const LANE_LENGTH: i32 = 16;

/// One open lane per robot; every robot walks up its lane one cell per tick.
fn lane_world(robots: usize) -> World {
    let grid = vec![vec![0u8; robots]; LANE_LENGTH as usize];
    let homes: Vec<[i32; 2]> = (0..robots as i32).map(|col| [0, col]).collect();
    let definition = json!({
        "grid": grid,
        "robot_home_zones": homes,
        "item_load_zones": [],
        "station_zones": [],
    });
    World::from_json_str(&definition.to_string()).expect("bench world")
}

fn lane_ticks(robots: usize) -> Vec<TickEvent> {
    (0..LANE_LENGTH)
        .map(|step| TickEvent {
            t: i64::from(step),
            robots: (0..robots as i64)
                .map(|id| RawRobotRow {
                    id: Some(id),
                    position: Some(json!([id, step])),
                    path: Some(Value::String("U".repeat((LANE_LENGTH - 1 - step) as usize))),
                    held_item_id: None,
                    state: Some("MOVING".into()),
                })
                .collect(),
        })
        .collect()
}

fn bench_reconcile(c: &mut Criterion) {
    let mut group = c.benchmark_group("reconcile");

    for robots in [8usize, 64, 256] {
        let ticks = lane_ticks(robots);
        group.bench_with_input(BenchmarkId::new("lane_walk", robots), &robots, |b, &robots| {
            b.iter_batched(
                || ReconciliationEngine::new(lane_world(robots)),
                |mut engine| {
                    for tick in &ticks {
                        engine.apply_tick(tick);
                    }
                    engine
                },
                BatchSize::SmallInput,
            )
        });
    }

    group.finish();
}

criterion_group!(reconcile_benches, bench_reconcile);
criterion_main!(reconcile_benches);
