use std::sync::{Arc, Barrier};

use arrow_array::{ArrayRef, Float64Array, Int64Array, RecordBatch};
use arrow_schema::{DataType, Field, Schema};
use quanta::Clock;
use tracing::{debug, info, info_span};

pub use vertexer_types::{
    ClusterParams, TrackCollection, VertexCollection, MAX_CRITICAL, MAX_GLOBAL_VERTICES,
    MAX_VERTICES, NO_VERTEX,
};

mod anneal;
mod arbitrate;
mod blocks;
mod shared;
mod validation;

use crate::anneal::{BlockWorker, Scratch};
use crate::arbitrate::{finalize_vertices, ArbiterWorker};
use crate::shared::{BlockShared, TrackViews, VertexViews};

#[derive(Debug)]
pub enum Error {
    InvalidConfig(String),
    Execution(String),
}

impl std::fmt::Display for Error {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Error::InvalidConfig(msg) => write!(f, "invalid configuration: {msg}"),
            Error::Execution(msg) => write!(f, "execution failed: {msg}"),
        }
    }
}

impl std::error::Error for Error {}

/// Workers per block team. The kernels stride every loop by team width, so
/// this only affects scheduling, never results.
fn team_width(block_size: usize, n_teams: usize) -> usize {
    let avail = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    block_size.min((avail / n_teams.max(1)).max(1))
}

/// Replicate input tracks into overlapping blocks of `block_size`. Returns
/// the replicated collection and the block count.
pub fn create_blocks(
    input: &TrackCollection,
    block_size: usize,
    overlap: f64,
) -> Result<(TrackCollection, usize), Error> {
    if block_size == 0 {
        return Err(Error::InvalidConfig("block size must be positive".into()));
    }
    if !(overlap > 0.0 && overlap <= 1.0) {
        return Err(Error::InvalidConfig(
            "block overlap must lie in (0, 1]".into(),
        ));
    }
    let _span = info_span!("create_blocks", n = input.len(), block_size).entered();
    Ok(blocks::create_blocks(input, block_size, overlap))
}

/// Run the deterministic-annealing pipeline on every block in parallel.
/// Each block team owns the track range `[g*block_size, (g+1)*block_size)`
/// and the vertex slot window `[g*vmax, (g+1)*vmax)`.
pub fn clusterize(
    tracks: &mut TrackCollection,
    vertices: &mut VertexCollection,
    params: &ClusterParams,
    n_blocks: usize,
    block_size: usize,
) -> Result<(), Error> {
    validation::validate_clusterize(tracks, vertices, params, n_blocks, block_size)?;
    let _span = info_span!("clusterize", n_blocks, block_size).entered();
    let clock = Clock::new();
    let start = clock.now();

    let vmax = MAX_VERTICES / n_blocks;
    let team = team_width(block_size, n_blocks);
    let rows = tracks.rows();
    let track_views = TrackViews::new(tracks);
    let vertex_views = VertexViews::new(vertices);
    let block_shared: Vec<BlockShared> = (0..n_blocks).map(|_| BlockShared::new()).collect();
    let barriers: Vec<Barrier> = (0..n_blocks).map(|_| Barrier::new(team)).collect();

    info!(n_blocks, block_size, team, rows, "launching block teams");
    std::thread::scope(|scope| {
        for block in 0..n_blocks {
            for w in 0..team {
                let worker = BlockWorker {
                    tracks: track_views,
                    vertices: vertex_views,
                    params,
                    shared: &block_shared[block],
                    barrier: &barriers[block],
                    block,
                    worker: w,
                    team,
                    vmax,
                    base: block * vmax,
                    t0: (block * block_size).min(rows),
                    t1: ((block + 1) * block_size).min(rows),
                };
                scope.spawn(move || {
                    let mut scratch = Scratch::new(vmax);
                    worker.run(&mut scratch);
                });
            }
        }
    });

    debug!(
        elapsed_us = clock.now().duration_since(start).as_micros() as u64,
        "clusterize done"
    );
    Ok(())
}

/// Gather all per-block vertices into one sorted global list, hard-assign
/// every track, and finalize the surviving vertices.
pub fn arbitrate(
    tracks: &mut TrackCollection,
    vertices: &mut VertexCollection,
    params: &ClusterParams,
    n_blocks: usize,
    block_size: usize,
) -> Result<(), Error> {
    validation::validate_arbitrate(vertices, n_blocks)?;
    let _span = info_span!("arbitrate", n_blocks).entered();
    let clock = Clock::new();
    let start = clock.now();

    let vmax = MAX_VERTICES / n_blocks;
    let team = team_width(block_size.max(1), 1);
    {
        let track_views = TrackViews::new(tracks);
        let vertex_views = VertexViews::new(vertices);
        let barrier = Barrier::new(team);
        std::thread::scope(|scope| {
            for w in 0..team {
                let worker = ArbiterWorker {
                    tracks: track_views,
                    vertices: vertex_views,
                    params,
                    barrier: &barrier,
                    worker: w,
                    team,
                    n_blocks,
                    vmax,
                };
                scope.spawn(move || worker.run());
            }
        });
    }
    finalize_vertices(tracks, vertices, params);

    debug!(
        elapsed_us = clock.now().duration_since(start).as_micros() as u64,
        n_vertices = vertices.n_vertices(),
        "arbitrate done"
    );
    Ok(())
}

/// Full pipeline: block replication, per-block clusterization, arbitration.
/// Returns the replicated tracks (carrying their final assignments), the
/// finalized vertices and the block count.
pub fn find_vertices(
    input: &TrackCollection,
    params: &ClusterParams,
    block_size: usize,
    overlap: f64,
) -> Result<(TrackCollection, VertexCollection, usize), Error> {
    let (mut tracks, n_blocks) = create_blocks(input, block_size, overlap)?;
    let mut vertices = VertexCollection::standard();
    if n_blocks == 0 {
        return Ok((tracks, vertices, 0));
    }
    clusterize(&mut tracks, &mut vertices, params, n_blocks, block_size)?;
    arbitrate(&mut tracks, &mut vertices, params, n_blocks, block_size)?;
    Ok((tracks, vertices, n_blocks))
}

/// Run the full pipeline and return the finalized vertices as a record
/// batch with `z`, `rho` and `ntracks` columns.
pub fn run(
    input: &TrackCollection,
    params: &ClusterParams,
    block_size: usize,
    overlap: f64,
) -> Result<RecordBatch, Error> {
    let _span = info_span!("run", n = input.len()).entered();
    info!("starting vertex finding");
    let (_tracks, vertices, _n_blocks) = find_vertices(input, params, block_size, overlap)?;
    let batch = vertex_record_batch(&vertices)?;
    info!(n_vertices = vertices.n_vertices(), "vertex finding complete");
    Ok(batch)
}

fn vertex_record_batch(vertices: &VertexCollection) -> Result<RecordBatch, Error> {
    let n = vertices.n_vertices();
    let z: Vec<f64> = (0..n).map(|i| vertices.position(i)).collect();
    let rho: Vec<f64> = (0..n).map(|i| vertices.density(i)).collect();
    let ntracks: Vec<i64> = (0..n).map(|i| vertices.ntracks(i) as i64).collect();

    let schema = Schema::new(vec![
        Field::new("z", DataType::Float64, false),
        Field::new("rho", DataType::Float64, false),
        Field::new("ntracks", DataType::Int64, false),
    ]);
    let arrays: Vec<ArrayRef> = vec![
        Arc::new(Float64Array::from(z)) as ArrayRef,
        Arc::new(Float64Array::from(rho)) as ArrayRef,
        Arc::new(Int64Array::from(ntracks)) as ArrayRef,
    ];
    RecordBatch::try_new(Arc::new(schema), arrays)
        .map_err(|e| Error::Execution(format!("building vertex batch: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow_array::Array;

    #[test]
    fn test_team_width_bounds() {
        assert!(team_width(8, 1) >= 1);
        assert!(team_width(8, 1) <= 8);
        assert_eq!(team_width(1, 64), 1);
    }

    #[test]
    fn test_create_blocks_rejects_bad_overlap() {
        let input = TrackCollection::new();
        assert!(create_blocks(&input, 8, 0.0).is_err());
        assert!(create_blocks(&input, 8, 1.5).is_err());
        assert!(create_blocks(&input, 0, 0.5).is_err());
    }

    #[test]
    fn test_clusterize_rejects_oversized_grid() {
        let mut tracks = TrackCollection::zeroed(8);
        let mut vertices = VertexCollection::standard();
        let params = ClusterParams::default();
        let result = clusterize(&mut tracks, &mut vertices, &params, 600, 8);
        assert!(matches!(result, Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_vertex_record_batch_shape() {
        let mut vertices = VertexCollection::standard();
        vertices.z[0] = -1.0;
        vertices.z[1] = 1.0;
        vertices.rho[0] = 0.4;
        vertices.rho[1] = 0.6;
        vertices.order[0] = 0;
        vertices.order[1] = 1;
        vertices.track_id[0] = vec![0, 1];
        vertices.track_id[1] = vec![2, 3, 4];
        vertices.nv[0] = 2;
        let batch = vertex_record_batch(&vertices).unwrap();
        assert_eq!(batch.num_rows(), 2);
        assert_eq!(batch.num_columns(), 3);
        let ntracks = batch
            .column(2)
            .as_any()
            .downcast_ref::<Int64Array>()
            .unwrap();
        assert_eq!(ntracks.value(0), 2);
        assert_eq!(ntracks.value(1), 3);
    }

    #[test]
    fn test_error_display() {
        let err = Error::InvalidConfig("bad".into());
        assert!(err.to_string().contains("invalid configuration"));
    }
}
