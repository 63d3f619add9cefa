//! Benchmarks portal graph construction and A* routing across it, mirroring
//! the `init_portals`/`calc_route` split of the reference flow-field
//! benchmark suite portal routing here is grounded on.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use skirmish_nav::cost::CostLayers;
use skirmish_nav::grid::MapResolution;
use skirmish_nav::layer::NavLayer;
use skirmish_nav::math::Vec2;
use skirmish_nav::portal::{route, PortalGraph};

fn resolution() -> MapResolution {
    MapResolution { chunks_wide: 10, chunks_high: 10, tile_cols: 16, tile_rows: 16, tile_size: 1.0 }
}

fn open_layers() -> CostLayers {
    let mut layers = CostLayers::new(resolution());
    layers.recompute_global_islands(NavLayer::Foot);
    layers
}

fn bench_portal_routing(c: &mut Criterion) {
    c.bench_function("build_portal_graph_10x10_chunks", |b| {
        b.iter(|| {
            let mut layers = open_layers();
            black_box(PortalGraph::build(&mut layers, NavLayer::Foot, Vec2::ZERO))
        })
    });

    let mut layers = open_layers();
    let graph = PortalGraph::build(&mut layers, NavLayer::Foot, Vec2::ZERO);

    c.bench_function("route_across_10x10_chunks", |b| {
        b.iter(|| {
            black_box(route(&graph, &layers, NavLayer::Foot, (0, 0), 0, (9, 9), 0, Vec2::new(150.0, 150.0)))
        })
    });
}

criterion_group!(benches, bench_portal_routing);
criterion_main!(benches);
