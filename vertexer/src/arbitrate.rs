use std::sync::Barrier;

use tracing::debug;
use vertexer_types::{
    ClusterParams, TrackCollection, VertexCollection, MAX_GLOBAL_VERTICES, NO_VERTEX,
};

use crate::anneal::{NEGLIGIBLE_SUM_Z, ZRANGE_MIN};
use crate::shared::{TrackViews, VertexViews};

/// Vertices at least this dense are rejected as numerically blown up.
const RHO_CEILING: f64 = 1e4;
/// Vertices outside this window along the beam are rejected.
const Z_WINDOW: f64 = 30.0;
/// Minimum posterior probability for a hard assignment.
const MIN_TRACK_WEIGHT: f64 = 0.5;
/// Vertices keeping fewer tracks than this after deduplication are dropped.
const MIN_VERTEX_TRACKS: usize = 2;

/// Stable ascending argsort of float keys: map the IEEE bits to an
/// order-preserving unsigned key and do four byte-wise counting passes.
pub(crate) fn radix_argsort_f32(keys: &[f32]) -> Vec<u32> {
    let n = keys.len();
    let bits: Vec<u32> = keys
        .iter()
        .map(|&k| {
            let b = k.to_bits();
            if b & 0x8000_0000 != 0 {
                !b
            } else {
                b | 0x8000_0000
            }
        })
        .collect();
    let mut idx: Vec<u32> = (0..n as u32).collect();
    let mut tmp = vec![0u32; n];
    for shift in [0, 8, 16, 24] {
        let mut counts = [0usize; 256];
        for &i in &idx {
            counts[((bits[i as usize] >> shift) & 0xff) as usize] += 1;
        }
        let mut offsets = [0usize; 256];
        let mut acc = 0;
        for (byte, count) in counts.iter().enumerate() {
            offsets[byte] = acc;
            acc += count;
        }
        for &i in &idx {
            let byte = ((bits[i as usize] >> shift) & 0xff) as usize;
            tmp[offsets[byte]] = i;
            offsets[byte] += 1;
        }
        idx.copy_from_slice(&tmp);
    }
    idx
}

/// One worker of the single arbitration team: the leader gathers and sorts
/// the surviving block vertices into the global list, then all workers
/// recompute track windows against it and hard-assign every track.
pub(crate) struct ArbiterWorker<'a> {
    pub tracks: TrackViews<'a>,
    pub vertices: VertexViews<'a>,
    pub params: &'a ClusterParams,
    pub barrier: &'a Barrier,
    pub worker: usize,
    pub team: usize,
    pub n_blocks: usize,
    pub vmax: usize,
}

impl<'a> ArbiterWorker<'a> {
    fn bar(&self) {
        self.barrier.wait();
    }

    fn z_at(&self, pos: i64) -> f64 {
        self.vertices.z.get(self.vertices.order.get(pos as usize) as usize)
    }

    pub fn run(&self) {
        let beta = 1.0 / self.params.t_stop;

        if self.worker == 0 {
            let mut gathered_z: Vec<f32> = Vec::with_capacity(MAX_GLOBAL_VERTICES);
            let mut gathered_rho: Vec<f32> = Vec::with_capacity(MAX_GLOBAL_VERTICES);
            'gather: for g in 0..self.n_blocks {
                let nv = self.vertices.nv.get(g) as usize;
                for pos in g * self.vmax..g * self.vmax + nv {
                    let v = self.vertices.order.get(pos) as usize;
                    let z = self.vertices.z.get(v);
                    let rho = self.vertices.rho.get(v);
                    if rho < RHO_CEILING && z.abs() < Z_WINDOW {
                        gathered_z.push(z as f32);
                        gathered_rho.push(rho as f32);
                        if gathered_z.len() == MAX_GLOBAL_VERTICES {
                            break 'gather;
                        }
                    }
                }
            }
            let sorted = radix_argsort_f32(&gathered_z);
            for i in 0..gathered_z.len() {
                self.vertices.z.set(i, gathered_z[i] as f64);
                self.vertices.rho.set(i, gathered_rho[i] as f64);
                self.vertices.order.set(i, sorted[i]);
                self.vertices.is_good.set(i, true);
            }
            self.vertices.nv.set(0, gathered_z.len() as u32);
            debug!(n_vertices = gathered_z.len(), "gathered and sorted block vertices");
        }
        self.bar();

        let n_true = self.vertices.nv.get(0) as usize;
        if n_true == 0 {
            for t in (self.worker..self.tracks.n).step_by(self.team) {
                self.tracks.kmin.set(t, NO_VERTEX);
                self.tracks.kmax.set(t, NO_VERTEX + 1);
            }
            self.bar();
            return;
        }

        // Candidate window of every track against the global sorted list.
        let last = n_true as i64 - 1;
        for t in (self.worker..self.tracks.n).step_by(self.team) {
            if !self.tracks.is_good.get(t) {
                continue;
            }
            let oo = self.tracks.oneoverdz2.get(t);
            let zrange = (self.params.zrange / (beta * oo).sqrt()).max(ZRANGE_MIN);
            let zt = self.tracks.z.get(t);
            let zmin = zt - zrange;
            let zmax = zt + zrange;

            let mut kmin = last;
            if self.z_at(kmin) > zmin {
                while kmin > 0 && self.z_at(kmin - 1) > zmin {
                    kmin -= 1;
                }
            } else {
                while kmin < n_true as i64 && self.z_at(kmin) < zmin {
                    kmin += 1;
                }
            }

            let mut kmax = 0i64;
            if self.z_at(kmax) < zmax {
                while kmax < last && self.z_at(kmax + 1) < zmax {
                    kmax += 1;
                }
            } else {
                while kmax > 0 && self.z_at(kmax) > zmax {
                    kmax -= 1;
                }
            }

            if kmin <= kmax {
                self.tracks.kmin.set(t, kmin as i32);
                self.tracks.kmax.set(t, (kmax + 1) as i32);
            } else {
                self.tracks.kmin.set(t, kmin.min(kmax).max(0) as i32);
                self.tracks.kmax.set(t, (kmin.max(kmax) + 1).min(n_true as i64) as i32);
            }
        }
        self.bar();

        // Hard assignment to the most probable vertex.
        let rho0 = if n_true > 1 { 1.0 / n_true as f64 } else { 1.0 };
        let z_sum_init = rho0 * (-beta * self.params.dz_cutoff * self.params.dz_cutoff).exp();
        for t in (self.worker..self.tracks.n).step_by(self.team) {
            if !self.tracks.is_good.get(t) {
                self.tracks.kmin.set(t, NO_VERTEX);
                self.tracks.kmax.set(t, NO_VERTEX + 1);
                continue;
            }
            let zt = self.tracks.z.get(t);
            let oo = self.tracks.oneoverdz2.get(t);
            let k0 = self.tracks.kmin.get(t) as usize;
            let k1 = self.tracks.kmax.get(t) as usize;
            let mut sum_z = z_sum_init;
            for k in k0..k1 {
                let dz = zt - self.z_at(k as i64);
                let rho = self.vertices.rho.get(self.vertices.order.get(k) as usize);
                sum_z += rho * (-beta * dz * dz * oo).exp();
            }
            let inv_z = if sum_z > NEGLIGIBLE_SUM_Z { 1.0 / sum_z } else { 0.0 };
            let mut p_max = -1.0;
            let mut i_max = NO_VERTEX;
            for k in k0..k1 {
                let dz = zt - self.z_at(k as i64);
                let rho = self.vertices.rho.get(self.vertices.order.get(k) as usize);
                let p = rho * (-beta * dz * dz * oo).exp() * inv_z;
                if p > p_max && p > MIN_TRACK_WEIGHT {
                    p_max = p;
                    i_max = k as i32;
                }
            }
            self.tracks.kmin.set(t, i_max);
            self.tracks.kmax.set(t, i_max + 1);
        }
        self.bar();
    }
}

/// Build the per-vertex track lists, drop under-populated vertices, collapse
/// vertices closer than twice the vertex size, and compact the order prefix.
/// Single-threaded; runs after the arbitration team joins.
pub(crate) fn finalize_vertices(
    tracks: &TrackCollection,
    vertices: &mut VertexCollection,
    params: &ClusterParams,
) {
    let nv0 = vertices.nv[0] as usize;

    for k in 0..nv0 {
        let v = vertices.order[k] as usize;
        vertices.track_id[v].clear();
        vertices.track_weight[v].clear();
        for t in 0..tracks.rows() {
            if !tracks.is_good[t] {
                continue;
            }
            if tracks.kmin[t] != k as i32 {
                continue;
            }
            // Block overlap replicates tracks; keep one copy per identity.
            let tt = tracks.tt_index[t];
            let duplicate = vertices.track_id[v]
                .iter()
                .any(|&added| tracks.tt_index[added as usize] == tt);
            if duplicate {
                continue;
            }
            vertices.track_id[v].push(t as u32);
            vertices.track_weight[v].push(1.0);
        }
        if vertices.track_id[v].len() < MIN_VERTEX_TRACKS {
            vertices.is_good[v] = false;
        }
    }

    // Keep a vertex only if it clears the previous surviving one.
    for k in 0..nv0 {
        let v = vertices.order[k] as usize;
        if !vertices.is_good[v] {
            continue;
        }
        let mut prev = k as i64 - 1;
        while prev >= 0 && !vertices.is_good[vertices.order[prev as usize] as usize] {
            prev -= 1;
        }
        if prev < 0 {
            continue;
        }
        let pv = vertices.order[prev as usize] as usize;
        if (vertices.z[v] - vertices.z[pv]).abs() <= 2.0 * params.vertex_size {
            vertices.is_good[v] = false;
        }
    }

    let mut count = nv0;
    let mut k = 0;
    while k < count {
        let v = vertices.order[k] as usize;
        if vertices.is_good[v] {
            k += 1;
            continue;
        }
        for l in k..count - 1 {
            vertices.order[l] = vertices.order[l + 1];
        }
        count -= 1;
    }
    vertices.nv[0] = count as u32;
    debug!(n_vertices = count, "finalized vertex list");
}
