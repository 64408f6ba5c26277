use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use vertexer::{
    arbitrate, clusterize, create_blocks, find_vertices, run, ClusterParams, TrackCollection,
    VertexCollection, NO_VERTEX,
};

fn init_logging() {
    use tracing_subscriber::EnvFilter;
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn tracks_at(positions: &[f64], dz: f64) -> TrackCollection {
    let mut tc = TrackCollection::new();
    for &z in positions {
        tc.push(z, dz, 1.0);
    }
    tc
}

/// Shared invariants of any finalized vertex list.
fn assert_output_invariants(tracks: &TrackCollection, vertices: &VertexCollection) {
    let n = vertices.n_vertices();
    // Strictly increasing positions, minimum spacing, populated vertices.
    for i in 1..n {
        assert!(
            vertices.position(i) > vertices.position(i - 1),
            "vertex positions not strictly increasing"
        );
        assert!(
            vertices.position(i) - vertices.position(i - 1) > 2.0 * ClusterParams::default().vertex_size,
            "vertices closer than twice the vertex size"
        );
    }
    // Every assigned track appears in exactly one vertex, once per identity.
    let mut seen = std::collections::HashSet::new();
    for i in 0..n {
        assert!(vertices.ntracks(i) >= 2);
        for &t in vertices.tracks_of(i) {
            assert!(tracks.is_good[t as usize]);
            assert!(
                seen.insert(tracks.tt_index[t as usize]),
                "track identity {} assigned to more than one vertex",
                tracks.tt_index[t as usize]
            );
        }
    }
}

// --- End-to-end scenarios ---

#[test]
fn test_single_cluster() {
    init_logging();
    let input = tracks_at(&[-0.02, -0.01, 0.0, 0.0, 0.01, 0.02], 0.02);
    let params = ClusterParams::default();
    let (tracks, vertices, n_blocks) = find_vertices(&input, &params, 8, 0.5).unwrap();
    assert_eq!(n_blocks, 1);
    assert_eq!(vertices.n_vertices(), 1);
    assert!(vertices.position(0).abs() < 5e-3, "z = {}", vertices.position(0));
    assert_eq!(vertices.ntracks(0), 6);
    assert_output_invariants(&tracks, &vertices);
}

#[test]
fn test_two_separated_clusters() {
    init_logging();
    let input = tracks_at(&[-1.0, -1.0, -1.0, 1.0, 1.0, 1.0], 0.02);
    let params = ClusterParams::default();
    let (tracks, vertices, _) = find_vertices(&input, &params, 8, 0.5).unwrap();
    assert_eq!(vertices.n_vertices(), 2);
    assert!((vertices.position(0) + 1.0).abs() < 1e-2);
    assert!((vertices.position(1) - 1.0).abs() < 1e-2);
    assert_eq!(vertices.ntracks(0), 3);
    assert_eq!(vertices.ntracks(1), 3);
    assert_output_invariants(&tracks, &vertices);
}

#[test]
fn test_close_subclusters_collapse_to_one_vertex() {
    // Two groups 0.005 apart, inside the merge distance: the annealing
    // never separates them and a single vertex at the weighted mean wins.
    init_logging();
    let input = tracks_at(&[0.0, 0.0, 0.0, 0.005, 0.005, 0.005], 0.02);
    let params = ClusterParams::default();
    let (tracks, vertices, _) = find_vertices(&input, &params, 8, 0.5).unwrap();
    assert_eq!(vertices.n_vertices(), 1);
    assert!((vertices.position(0) - 0.0025).abs() < 2e-3);
    assert_eq!(vertices.ntracks(0), 6);
    assert_output_invariants(&tracks, &vertices);
}

#[test]
fn test_bimodal_block_splits_into_two_vertices() {
    init_logging();
    let input = tracks_at(&[-0.5, -0.5, -0.5, -0.5, 0.5, 0.5, 0.5, 0.5], 0.05);
    let params = ClusterParams::default();
    let (tracks, vertices, _) = find_vertices(&input, &params, 8, 0.5).unwrap();
    assert_eq!(vertices.n_vertices(), 2);
    assert!((vertices.position(0) + 0.5).abs() < 1e-2);
    assert!((vertices.position(1) - 0.5).abs() < 1e-2);
    assert_output_invariants(&tracks, &vertices);
}

#[test]
fn test_outlier_track_stays_unassigned() {
    init_logging();
    let mut input = tracks_at(&[0.0; 10], 0.01);
    input.push(10.0, 0.01, 1.0);
    let params = ClusterParams::default();
    // Single block: 11 tracks fit in a block of 16.
    let (tracks, vertices, n_blocks) = find_vertices(&input, &params, 16, 0.5).unwrap();
    assert_eq!(n_blocks, 1);
    assert_eq!(vertices.n_vertices(), 1);
    assert!(vertices.position(0).abs() < 1e-3);
    assert_eq!(vertices.ntracks(0), 10);
    // The far track was rejected by the outlier density and never assigned.
    assert_eq!(tracks.kmin[10], NO_VERTEX);
    assert_eq!(tracks.assignment(10), None);
    assert_output_invariants(&tracks, &vertices);
}

#[test]
fn test_multi_block_deduplicates_replicated_tracks() {
    // Twelve z-sorted tracks over three overlapping blocks; the replicated
    // copies must fold back into two vertices with unique identities.
    init_logging();
    let mut positions = vec![-1.0; 8];
    positions.extend_from_slice(&[1.0; 4]);
    let input = tracks_at(&positions, 0.02);
    let params = ClusterParams::default();
    let (tracks, vertices, n_blocks) = find_vertices(&input, &params, 8, 0.5).unwrap();
    assert_eq!(n_blocks, 3);
    assert_eq!(vertices.n_vertices(), 2);
    assert!((vertices.position(0) + 1.0).abs() < 1e-2);
    assert!((vertices.position(1) - 1.0).abs() < 1e-2);
    assert_eq!(vertices.ntracks(0), 8);
    assert_eq!(vertices.ntracks(1), 4);
    assert_output_invariants(&tracks, &vertices);
}

// --- Boundaries ---

#[test]
fn test_empty_input_produces_no_vertices() {
    init_logging();
    let input = TrackCollection::new();
    let params = ClusterParams::default();
    let (_, vertices, n_blocks) = find_vertices(&input, &params, 8, 0.5).unwrap();
    assert_eq!(n_blocks, 0);
    assert_eq!(vertices.n_vertices(), 0);
    let batch = run(&input, &params, 8, 0.5).unwrap();
    assert_eq!(batch.num_rows(), 0);
}

#[test]
fn test_block_replication_bookkeeping() {
    // 20 tracks, blocks of 8 at half overlap: five starts, twelve entries
    // counted in the replicated collection.
    init_logging();
    let input = tracks_at(&(0..20).map(|i| i as f64 * 0.1).collect::<Vec<_>>(), 0.02);
    let (replicated, n_blocks) = create_blocks(&input, 8, 0.5).unwrap();
    assert_eq!(n_blocks, 5);
    assert_eq!(replicated.len(), 12);
    assert_eq!(replicated.rows(), 40);
}

#[test]
fn test_identical_tracks_converge_to_single_unit_vertex() {
    init_logging();
    let input = tracks_at(&[0.7; 8], 0.02);
    let params = ClusterParams::default();
    let (tracks, vertices, _) = find_vertices(&input, &params, 8, 0.5).unwrap();
    assert_eq!(vertices.n_vertices(), 1);
    assert!((vertices.position(0) - 0.7).abs() < 1e-6);
    assert!((vertices.density(0) - 1.0).abs() < 1e-2);
    assert_eq!(vertices.ntracks(0), 8);
    assert_output_invariants(&tracks, &vertices);
}

// --- Randomized invariants ---

#[test]
fn test_three_cluster_event_invariants() {
    init_logging();
    let mut rng = StdRng::seed_from_u64(7);
    let centers = [-3.0, 0.0, 3.0];
    let mut positions = Vec::new();
    for &c in &centers {
        for _ in 0..10 {
            positions.push(c + rng.gen_range(-0.02..0.02));
        }
    }
    let input = tracks_at(&positions, 0.05);
    let params = ClusterParams::default();
    let (tracks, vertices, n_blocks) = find_vertices(&input, &params, 32, 0.5).unwrap();
    assert_eq!(n_blocks, 1);
    assert_eq!(vertices.n_vertices(), 3);
    for (i, &c) in centers.iter().enumerate() {
        assert!(
            (vertices.position(i) - c).abs() < 0.05,
            "vertex {i} at {} expected near {c}",
            vertices.position(i)
        );
        assert_eq!(vertices.ntracks(i), 10);
    }
    assert_output_invariants(&tracks, &vertices);
}

#[test]
fn test_staged_entry_points_match_full_pipeline() {
    // Driving create_blocks / clusterize / arbitrate by hand must agree
    // with find_vertices.
    init_logging();
    let input = tracks_at(&[-1.0, -1.0, -1.0, 1.0, 1.0, 1.0], 0.02);
    let params = ClusterParams::default();

    let (mut tracks, n_blocks) = create_blocks(&input, 8, 0.5).unwrap();
    let mut vertices = VertexCollection::standard();
    clusterize(&mut tracks, &mut vertices, &params, n_blocks, 8).unwrap();
    arbitrate(&mut tracks, &mut vertices, &params, n_blocks, 8).unwrap();

    let (_, reference, _) = find_vertices(&input, &params, 8, 0.5).unwrap();
    assert_eq!(vertices.n_vertices(), reference.n_vertices());
    for i in 0..reference.n_vertices() {
        assert!((vertices.position(i) - reference.position(i)).abs() < 1e-9);
        assert_eq!(vertices.ntracks(i), reference.ntracks(i));
    }
}
