//! Benchmarks integration/flow field construction over an open map and one
//! with a snaking wall maze, mirroring the open-vs-maze split of the
//! reference flow-field benchmark suite this crate's field builder is
//! grounded on.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use skirmish_nav::cost::{CostLayers, IMPASSABLE};
use skirmish_nav::field::builder::{build_flow_field, build_integration_field, ChunkRegion};
use skirmish_nav::grid::{MapResolution, TileDesc};
use skirmish_nav::layer::NavLayer;

fn resolution() -> MapResolution {
    MapResolution { chunks_wide: 1, chunks_high: 1, tile_cols: 64, tile_rows: 64, tile_size: 1.0 }
}

fn open_map() -> CostLayers {
    let mut layers = CostLayers::new(resolution());
    layers.recompute_global_islands(NavLayer::Foot);
    layers
}

fn maze_map() -> CostLayers {
    let mut layers = CostLayers::new(resolution());
    for col in (1..64).step_by(2) {
        for row in 0..60 {
            layers.set_cost(NavLayer::Foot, TileDesc::new(0, 0, row, col), IMPASSABLE);
        }
    }
    layers.recompute_global_islands(NavLayer::Foot);
    layers
}

fn bench_flow_field(c: &mut Criterion) {
    let open = open_map();
    let maze = maze_map();

    c.bench_function("integration_field_open_64x64", |b| {
        b.iter(|| {
            let region = ChunkRegion::new(&open, NavLayer::Foot, (0, 0), 0);
            black_box(build_integration_field(64, 64, &region, &[(32, 32)]))
        })
    });

    c.bench_function("flow_field_maze_64x64", |b| {
        b.iter(|| {
            let region = ChunkRegion::new(&maze, NavLayer::Foot, (0, 0), 0);
            let integration = build_integration_field(64, 64, &region, &[(0, 63)]);
            black_box(build_flow_field(&integration, &region))
        })
    });
}

criterion_group!(benches, bench_flow_field);
criterion_main!(benches);
