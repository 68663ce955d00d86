//! Cross-stage culling tests
//!
//! Drives the CPU reference mirrors through the same sequence the GPU passes
//! run, checking the stage contracts: survivors fan out into chunks, chunks
//! into clipped clusters, clusters into draw commands over the right index
//! ranges, with every stage appending through a counter that resets per
//! frame.

use cgmath::{Matrix4, Vector3};

use crate::constants::culling::{CLUSTERS_PER_CHUNK, VERTICES_PER_CLUSTER};
use crate::constants::scene::{
    chunk_count_for, MAX_CLUSTER_CHUNKS, MAX_INSTANCE_CHUNKS,
};
use crate::culling::validation::{is_occluded, project_aabb, AppendSink, DepthPyramid};
use crate::scene::Aabb;
use crate::upload::frame_packer::IndirectCommand;

struct TestObject {
    bounds: Aabb,
    /// World-space per-cluster bounds, indexed by cluster id. Clusters past
    /// the end fall back to the object's bounds, like the GPU table's
    /// fallback entry.
    cluster_bounds: Vec<Aabb>,
    draw: IndirectCommand,
    chunk_count: u32,
}

fn object(z: f32, half: f32, index_count: u32, slot: u32) -> TestObject {
    let bounds = Aabb::new(Vector3::new(0.0, 0.0, z), Vector3::new(half, half, half));
    TestObject {
        bounds,
        cluster_bounds: Vec::new(),
        draw: IndirectCommand {
            index_count,
            instance_count: 1,
            first_index: slot * 10_000,
            base_vertex: slot as i32 * 1_000,
            first_instance: slot,
        },
        chunk_count: chunk_count_for(index_count),
    }
}

/// Orthographic-style view-projection with reversed depth over [0.1, 100].
fn view_proj() -> Matrix4<f32> {
    let near = 0.1f32;
    let far = 100.0f32;
    let mut m = Matrix4::from_scale(1.0);
    m.x.x = 1.0 / 10.0;
    m.y.y = 1.0 / 10.0;
    m.z.z = 1.0 / (far - near);
    m.w.z = far / (far - near);
    m
}

/// CPU rendition of the instance pass: survivors append (slot, chunk_id).
fn run_instance_cull(
    objects: &[TestObject],
    pyramid: &DepthPyramid,
    vp: &Matrix4<f32>,
    viewport: (u32, u32),
    out: &mut AppendSink<(u32, u32)>,
) {
    for (slot, obj) in objects.iter().enumerate() {
        let culled = match project_aabb(&obj.bounds, vp, viewport) {
            Some(footprint) => is_occluded(pyramid, &footprint),
            None => false,
        };
        if !culled {
            for chunk in 0..obj.chunk_count {
                out.append((slot as u32, chunk));
            }
        }
    }
}

/// CPU rendition of the expansion pass: clusters clipped to the object's
/// real index range.
fn run_chunk_expand(
    objects: &[TestObject],
    chunks: &[(u32, u32)],
    out: &mut AppendSink<(u32, u32)>,
) {
    for &(slot, chunk_id) in chunks {
        let obj = &objects[slot as usize];
        for k in 0..CLUSTERS_PER_CHUNK {
            let cluster_id = chunk_id * CLUSTERS_PER_CHUNK + k;
            if cluster_id * VERTICES_PER_CLUSTER < obj.draw.index_count {
                out.append((slot, cluster_id));
            }
        }
    }
}

/// CPU rendition of the cluster pass: each cluster re-tested with its own
/// bounds before its command is emitted.
fn run_cluster_cull(
    objects: &[TestObject],
    clusters: &[(u32, u32)],
    pyramid: &DepthPyramid,
    vp: &Matrix4<f32>,
    viewport: (u32, u32),
    out: &mut AppendSink<IndirectCommand>,
) {
    for &(slot, cluster_id) in clusters {
        let obj = &objects[slot as usize];
        let bounds = obj
            .cluster_bounds
            .get(cluster_id as usize)
            .copied()
            .unwrap_or(obj.bounds);
        let culled = match project_aabb(&bounds, vp, viewport) {
            Some(footprint) => is_occluded(pyramid, &footprint),
            None => false,
        };
        if culled {
            continue;
        }
        let start = cluster_id * VERTICES_PER_CLUSTER;
        out.append(IndirectCommand {
            index_count: (obj.draw.index_count - start).min(VERTICES_PER_CLUSTER),
            instance_count: 1,
            first_index: obj.draw.first_index + start,
            base_vertex: obj.draw.base_vertex,
            first_instance: obj.draw.first_instance,
        });
    }
}

fn sinks() -> (
    AppendSink<(u32, u32)>,
    AppendSink<(u32, u32)>,
    AppendSink<IndirectCommand>,
) {
    (
        AppendSink::new(MAX_INSTANCE_CHUNKS as usize),
        AppendSink::new(MAX_CLUSTER_CHUNKS as usize),
        AppendSink::new(MAX_CLUSTER_CHUNKS as usize),
    )
}

#[test]
fn occluded_objects_emit_no_chunks() {
    let vp = view_proj();
    // Near occluder across the whole screen.
    let pyramid = DepthPyramid::build(64, 64, &vec![0.9f32; 64 * 64]);
    let objects = vec![
        object(-90.0, 1.0, 700, 0), // behind the occluder
        object(-2.0, 1.0, 700, 1),  // in front of it
    ];

    let (mut chunks, _, _) = sinks();
    run_instance_cull(&objects, &pyramid, &vp, (64, 64), &mut chunks);
    assert_eq!(chunks.count(), chunk_count_for(700));
    assert!(chunks.records().iter().all(|&(slot, _)| slot == 1));
}

#[test]
fn expansion_clips_clusters_to_index_count() {
    // 700 indices: 2 chunks, but only ceil(700/64) = 11 real clusters.
    let objects = vec![object(-2.0, 1.0, 700, 0)];
    let chunks: Vec<_> = (0..objects[0].chunk_count).map(|c| (0, c)).collect();
    assert_eq!(chunks.len(), 2);

    let (_, mut clusters, _) = sinks();
    run_chunk_expand(&objects, &chunks, &mut clusters);
    assert_eq!(clusters.count(), 11);
    assert!(clusters
        .records()
        .iter()
        .all(|&(_, id)| id * VERTICES_PER_CLUSTER < 700));
}

#[test]
fn cluster_commands_cover_the_whole_index_range_once() {
    let vp = view_proj();
    // No occluders drawn: every cluster survives.
    let pyramid = DepthPyramid::build(64, 64, &vec![0.0f32; 64 * 64]);
    let objects = vec![object(-2.0, 1.0, 700, 3)];
    let chunks: Vec<_> = (0..objects[0].chunk_count).map(|c| (0, c)).collect();

    let (_, mut clusters, mut commands) = sinks();
    run_chunk_expand(&objects, &chunks, &mut clusters);
    run_cluster_cull(
        &objects,
        clusters.records(),
        &pyramid,
        &vp,
        (64, 64),
        &mut commands,
    );

    let total: u32 = commands.records().iter().map(|c| c.index_count).sum();
    assert_eq!(total, 700);

    // Contiguous, non-overlapping ranges starting at the object's base.
    let mut starts: Vec<u32> = commands.records().iter().map(|c| c.first_index).collect();
    starts.sort_unstable();
    assert_eq!(starts[0], objects[0].draw.first_index);
    for pair in starts.windows(2) {
        assert!(pair[1] > pair[0]);
    }
    // Every command draws the object's instance slot.
    assert!(commands.records().iter().all(|c| c.first_instance == 3));
    assert!(commands.records().iter().all(|c| c.base_vertex == 3_000));
    // The tail command carries the remainder.
    assert!(commands
        .records()
        .iter()
        .any(|c| c.index_count == 700 % VERTICES_PER_CLUSTER));
}

#[test]
fn occluded_clusters_drop_from_a_visible_object() {
    let vp = view_proj();
    // Left half of the screen holds a near occluder, right half is open.
    let mut depth = vec![0.0f32; 64 * 64];
    for y in 0..64 {
        for x in 0..32 {
            depth[y * 64 + x] = 0.9;
        }
    }
    let pyramid = DepthPyramid::build(64, 64, &depth);

    // A wide object straddling both halves: its whole-object bounds reach
    // into the open half, so the instance pass keeps it. Its two clusters
    // sit one per half.
    let mut obj = object(-50.0, 9.0, 128, 0);
    obj.cluster_bounds = vec![
        Aabb::new(Vector3::new(-5.0, 0.0, -50.0), Vector3::new(2.0, 2.0, 2.0)),
        Aabb::new(Vector3::new(5.0, 0.0, -50.0), Vector3::new(2.0, 2.0, 2.0)),
    ];
    let objects = vec![obj];

    let (mut chunks, mut clusters, mut commands) = sinks();
    run_instance_cull(&objects, &pyramid, &vp, (64, 64), &mut chunks);
    assert_eq!(chunks.count(), 1);
    run_chunk_expand(&objects, chunks.records(), &mut clusters);
    assert_eq!(clusters.count(), 2);
    run_cluster_cull(
        &objects,
        clusters.records(),
        &pyramid,
        &vp,
        (64, 64),
        &mut commands,
    );

    // Only the cluster in the open half draws, covering its own slice.
    assert_eq!(commands.count(), 1);
    assert_eq!(
        commands.records()[0].first_index,
        objects[0].draw.first_index + VERTICES_PER_CLUSTER
    );
}

#[test]
fn counters_reset_between_frames() {
    let vp = view_proj();
    let pyramid = DepthPyramid::build(64, 64, &vec![0.0f32; 64 * 64]);
    let objects = vec![object(-2.0, 1.0, 700, 0), object(-5.0, 2.0, 256, 1)];

    let (mut chunks, mut clusters, mut commands) = sinks();
    let mut counts = Vec::new();
    for _ in 0..2 {
        chunks.reset();
        clusters.reset();
        commands.reset();
        run_instance_cull(&objects, &pyramid, &vp, (64, 64), &mut chunks);
        run_chunk_expand(&objects, chunks.records(), &mut clusters);
        run_cluster_cull(
            &objects,
            clusters.records(),
            &pyramid,
            &vp,
            (64, 64),
            &mut commands,
        );
        counts.push((chunks.count(), clusters.count(), commands.count()));
    }
    // Without the reset the second frame would double every count.
    assert_eq!(counts[0], counts[1]);
    assert!(counts[0].2 > 0);
}

#[test]
fn empty_scene_flows_through_as_zero_draws() {
    let vp = view_proj();
    let pyramid = DepthPyramid::build(64, 64, &vec![0.0f32; 64 * 64]);
    let objects: Vec<TestObject> = Vec::new();

    let (mut chunks, mut clusters, mut commands) = sinks();
    run_instance_cull(&objects, &pyramid, &vp, (64, 64), &mut chunks);
    run_chunk_expand(&objects, chunks.records(), &mut clusters);
    run_cluster_cull(
        &objects,
        clusters.records(),
        &pyramid,
        &vp,
        (64, 64),
        &mut commands,
    );
    assert!(commands.is_empty());
}

#[test]
fn cleared_pyramid_culls_nothing() {
    let vp = view_proj();
    // Depth clear value 0.0 everywhere: no occluders were drawn.
    let pyramid = DepthPyramid::build(64, 64, &vec![0.0f32; 64 * 64]);
    let objects = vec![object(-90.0, 1.0, 128, 0), object(-5.0, 2.0, 256, 1)];

    let (mut chunks, _, _) = sinks();
    run_instance_cull(&objects, &pyramid, &vp, (64, 64), &mut chunks);
    let expected: u32 = objects.iter().map(|o| o.chunk_count).sum();
    assert_eq!(chunks.count(), expected);
}
