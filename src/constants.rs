// Basalt renderer constants - SINGLE SOURCE OF TRUTH
//
// All compile-time configuration for the frame-resource ring buffer and the
// GPU culling pipeline lives here. Shader-side copies of these values are
// emitted by `gpu_constants_wgsl()` so CPU and GPU never disagree.

/// Upload arena / frame resource constants
pub mod upload {
    /// Constant-buffer view alignment. Pass and object sub-regions start on
    /// this boundary.
    pub const UPLOAD_ALIGN: u64 = 256;

    /// Upper bound on simultaneously in-flight frame regions. Mirrors the
    /// size of the command-allocator pool: even when byte space is free, a
    /// sixth frame must wait for the oldest fence.
    pub const MAX_FRAMES_IN_FLIGHT: usize = 5;

    /// Default upload arena capacity (64 MiB).
    pub const DEFAULT_ARENA_CAPACITY: u64 = 64 * 1024 * 1024;
}

/// Culling pipeline constants
pub mod culling {
    /// Hi-Z mip chain stops when a dimension would drop below this.
    pub const HIZ_MIN_SIZE: u32 = 4;

    /// Thread-group edge for the Hi-Z downsample dispatch (8x8 threads).
    pub const HIZ_WORKGROUP_DIM: u32 = 8;

    /// Threads per workgroup for the culling/expansion dispatches.
    pub const CULL_WORKGROUP_SIZE: u32 = 64;

    /// Geometry granularity: vertices per cluster, clusters per chunk.
    pub const VERTICES_PER_CLUSTER: u32 = 64;
    pub const CLUSTERS_PER_CHUNK: u32 = 8;
}

/// Scene capacity bounds
pub mod scene {
    use super::culling::{CLUSTERS_PER_CHUNK, VERTICES_PER_CLUSTER};

    pub const MAX_OBJECTS_PER_SCENE: u32 = 4096;
    pub const MAX_MESH_VERTICES_PER_SCENE: u32 = 4_000_000;
    pub const MAX_MATERIALS: u32 = 256;
    pub const MAX_LIGHTS: usize = 16;

    /// Capacity of the instance-culling result buffer: one chunk covers
    /// `VERTICES_PER_CLUSTER * CLUSTERS_PER_CHUNK` vertices.
    pub const MAX_INSTANCE_CHUNKS: u32 = div_ceil(
        MAX_MESH_VERTICES_PER_SCENE,
        VERTICES_PER_CLUSTER * CLUSTERS_PER_CHUNK,
    );

    /// Capacity of the chunk-expansion result buffer. Every surviving chunk
    /// can fan out into `CLUSTERS_PER_CHUNK` clusters, so this is derived
    /// from the chunk capacity rather than from the vertex budget: the two
    /// stages must never disagree about how many records can exist.
    pub const MAX_CLUSTER_CHUNKS: u32 = MAX_INSTANCE_CHUNKS * CLUSTERS_PER_CHUNK;

    pub const fn div_ceil(n: u32, d: u32) -> u32 {
        (n + d - 1) / d
    }

    /// Chunks an item occupies in the culling pipeline: one chunk covers
    /// `VERTICES_PER_CLUSTER * CLUSTERS_PER_CHUNK` indices. Empty geometry
    /// still costs one chunk.
    pub const fn chunk_count_for(index_count: u32) -> u32 {
        let n = if index_count == 0 { 1 } else { index_count };
        div_ceil(n, VERTICES_PER_CLUSTER * CLUSTERS_PER_CHUNK)
    }

    /// Clusters an item occupies: one cluster per `VERTICES_PER_CLUSTER`
    /// indices.
    pub const fn cluster_count_for(index_count: u32) -> u32 {
        let n = if index_count == 0 { 1 } else { index_count };
        div_ceil(n, VERTICES_PER_CLUSTER)
    }
}

/// G-Buffer layout
pub mod gbuffer {
    /// Albedo+normal target and material-id target.
    pub const GBUFFER_COUNT: usize = 2;
}

/// WGSL constant block shared by the culling shaders.
pub fn gpu_constants_wgsl() -> String {
    format!(
        "const HIZ_MIN_SIZE: u32 = {}u;\n\
         const CULL_WORKGROUP_SIZE: u32 = {}u;\n\
         const VERTICES_PER_CLUSTER: u32 = {}u;\n\
         const CLUSTERS_PER_CHUNK: u32 = {}u;\n\
         const MAX_INSTANCE_CHUNKS: u32 = {}u;\n\
         const MAX_CLUSTER_CHUNKS: u32 = {}u;\n",
        culling::HIZ_MIN_SIZE,
        culling::CULL_WORKGROUP_SIZE,
        culling::VERTICES_PER_CLUSTER,
        culling::CLUSTERS_PER_CHUNK,
        scene::MAX_INSTANCE_CHUNKS,
        scene::MAX_CLUSTER_CHUNKS,
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_capacities_cover_scene() {
        let per_chunk = culling::VERTICES_PER_CLUSTER * culling::CLUSTERS_PER_CHUNK;
        assert!(scene::MAX_INSTANCE_CHUNKS * per_chunk >= scene::MAX_MESH_VERTICES_PER_SCENE);
        assert!(
            scene::MAX_CLUSTER_CHUNKS * culling::VERTICES_PER_CLUSTER
                >= scene::MAX_MESH_VERTICES_PER_SCENE
        );
        assert_eq!(
            scene::MAX_CLUSTER_CHUNKS,
            scene::MAX_INSTANCE_CHUNKS * culling::CLUSTERS_PER_CHUNK
        );
    }

    #[test]
    fn chunk_count_rounds_up() {
        let per_chunk = culling::VERTICES_PER_CLUSTER * culling::CLUSTERS_PER_CHUNK;
        assert_eq!(scene::chunk_count_for(0), 1);
        assert_eq!(scene::chunk_count_for(1), 1);
        assert_eq!(scene::chunk_count_for(per_chunk), 1);
        assert_eq!(scene::chunk_count_for(per_chunk + 1), 2);
        assert_eq!(scene::cluster_count_for(0), 1);
        assert_eq!(scene::cluster_count_for(culling::VERTICES_PER_CLUSTER + 1), 2);
    }

    #[test]
    fn wgsl_block_mentions_every_constant() {
        let block = gpu_constants_wgsl();
        for name in [
            "HIZ_MIN_SIZE",
            "CULL_WORKGROUP_SIZE",
            "VERTICES_PER_CLUSTER",
            "CLUSTERS_PER_CHUNK",
            "MAX_INSTANCE_CHUNKS",
            "MAX_CLUSTER_CHUNKS",
        ] {
            assert!(block.contains(name), "missing {}", name);
        }
    }

    #[test]
    fn culling_shaders_take_constants_from_the_generated_block() {
        // The compute shaders are compiled with `gpu_constants_wgsl()`
        // prepended; a local redeclaration would shadow it and drift.
        for source in [
            include_str!("shaders/instance_cull.wgsl"),
            include_str!("shaders/chunk_expand.wgsl"),
            include_str!("shaders/cluster_cull.wgsl"),
        ] {
            for name in [
                "HIZ_MIN_SIZE",
                "CULL_WORKGROUP_SIZE",
                "VERTICES_PER_CLUSTER",
                "CLUSTERS_PER_CHUNK",
            ] {
                assert!(
                    !source.contains(&format!("const {}", name)),
                    "{} redeclared in a culling shader",
                    name
                );
            }
        }
    }
}
