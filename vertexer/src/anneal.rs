use std::sync::Barrier;

use portable_atomic::Ordering::Relaxed;
use tracing::debug;
use vertexer_types::{ClusterParams, INVALID_ORDER, MAX_CRITICAL};

use crate::shared::{BlockShared, TrackViews, VertexViews, NO_DECISION};

/// Partition functions below this are treated as "track couples to nothing".
pub(crate) const NEGLIGIBLE_SUM_Z: f64 = 1e-100;
/// Vertex densities below this cannot anchor a weighted merge position.
pub(crate) const NEGLIGIBLE_RHO: f64 = 1e-100;
/// Lower clamp on the track association range, in cm.
pub(crate) const ZRANGE_MIN: f64 = 0.1;
/// Accumulated vertex movement that forces a window recomputation.
const MOVEMENT_RESET: f64 = 0.01;
/// Separation below which a split candidate is not worth a new slot.
const SPLIT_EPSILON: f64 = 1e-3;
/// Beyond this argument the left/right soft assignment saturates.
const SPLIT_SOFTEN_LIMIT: f64 = 20.0;
/// Vertices keeping fewer uniquely assigned tracks than this get purged.
const MIN_UNIQUE_TRACKS: f64 = 2.0;
const MAX_THERMALIZE_ITERS: usize = 1000;
const MAX_RESPLIT_ROUNDS: usize = 10;
const RHO0_RAMP_STEPS: usize = 5;

const FLAG_PROCEED: usize = 0;
const FLAG_SKIP: usize = 1;
const FLAG_STOP: usize = 2;

/// Bounded max-heap of critical vertices, keyed on critical temperature and
/// carrying the vertex's order position. Candidates past the capacity are
/// silently dropped.
pub(crate) struct CriticalQueue {
    entries: Vec<(f64, usize)>,
    cap: usize,
}

impl CriticalQueue {
    pub fn new(cap: usize) -> Self {
        CriticalQueue { entries: Vec::with_capacity(cap), cap }
    }

    pub fn push(&mut self, key: f64, pos: usize) -> bool {
        if self.entries.len() == self.cap {
            return false;
        }
        self.entries.push((key, pos));
        let mut i = self.entries.len() - 1;
        while i > 0 {
            let parent = (i - 1) / 2;
            if self.entries[parent].0 >= self.entries[i].0 {
                break;
            }
            self.entries.swap(parent, i);
            i = parent;
        }
        true
    }

    /// Remove and return the position of the hottest candidate.
    pub fn pop(&mut self) -> Option<usize> {
        if self.entries.is_empty() {
            return None;
        }
        let last = self.entries.len() - 1;
        self.entries.swap(0, last);
        let (_, pos) = self.entries.pop().unwrap();
        let mut i = 0;
        loop {
            let (l, r) = (2 * i + 1, 2 * i + 2);
            let mut hottest = i;
            if l < self.entries.len() && self.entries[l].0 > self.entries[hottest].0 {
                hottest = l;
            }
            if r < self.entries.len() && self.entries[r].0 > self.entries[hottest].0 {
                hottest = r;
            }
            if hottest == i {
                break;
            }
            self.entries.swap(i, hottest);
            i = hottest;
        }
        Some(pos)
    }

    /// An insertion at `pos` shifted every later order position up by one.
    /// Keys are untouched, so the heap shape is preserved.
    pub fn shift_after_insert(&mut self, pos: usize) {
        for entry in &mut self.entries {
            if entry.1 > pos {
                entry.1 += 1;
            }
        }
    }
}

/// Worker-local window scratch reused across mean-field iterations.
pub(crate) struct Scratch {
    earg: Vec<f64>,
    eexp: Vec<f64>,
}

impl Scratch {
    pub fn new(vmax: usize) -> Self {
        Scratch { earg: vec![0.0; vmax], eexp: vec![0.0; vmax] }
    }
}

/// One worker of a block team. All workers of a team execute the same call
/// sequence; structural mutations (order, nv, isGood, queue picks) happen on
/// the leader between barriers, accumulator writes go through atomics, and
/// every per-track or per-vertex loop strides by team width.
pub(crate) struct BlockWorker<'a> {
    pub tracks: TrackViews<'a>,
    pub vertices: VertexViews<'a>,
    pub params: &'a ClusterParams,
    pub shared: &'a BlockShared,
    pub barrier: &'a Barrier,
    pub block: usize,
    pub worker: usize,
    pub team: usize,
    /// Vertex slots per block window.
    pub vmax: usize,
    /// First slot of this block's window.
    pub base: usize,
    /// Track range of this block, half-open.
    pub t0: usize,
    pub t1: usize,
}

impl<'a> BlockWorker<'a> {
    #[inline]
    fn bar(&self) {
        self.barrier.wait();
    }

    #[inline]
    fn leader(&self) -> bool {
        self.worker == 0
    }

    #[inline]
    fn nv(&self) -> usize {
        self.vertices.nv.get(self.block) as usize
    }

    #[inline]
    fn slot_at(&self, pos: usize) -> usize {
        self.vertices.order.get(pos) as usize
    }

    #[inline]
    fn z_at(&self, pos: i64) -> f64 {
        self.vertices.z.get(self.slot_at(pos as usize))
    }

    fn my_tracks(&self) -> impl Iterator<Item = usize> {
        (self.t0 + self.worker..self.t1).step_by(self.team)
    }

    fn my_vertex_positions(&self, nv: usize) -> impl Iterator<Item = usize> {
        (self.base + self.worker..self.base + nv).step_by(self.team)
    }

    /// Full per-block pipeline; one call per worker.
    pub fn run(&self, scratch: &mut Scratch) {
        self.initialize();
        let has_tracks = (self.t0..self.t1).any(|t| self.tracks.is_good.get(t));
        if !has_tracks {
            if self.leader() {
                self.vertices.nv.set(self.block, 0);
                self.vertices.is_good.set(self.base, false);
            }
            self.bar();
            return;
        }
        self.sum_track_weights();
        self.beta0();
        self.thermalize(scratch, self.params.delta_high_t, 0.0);
        self.cool_while_splitting(scratch);
        self.re_merge(scratch);
        self.re_split(scratch);
        self.reject_outliers(scratch);
    }

    /// Clear the block's slot window and seed a single all-tracks vertex.
    pub fn initialize(&self) {
        for slot in (self.base + self.worker..self.base + self.vmax).step_by(self.team) {
            self.vertices.z.set(slot, 0.0);
            self.vertices.rho.set(slot, 0.0);
            self.vertices.sw[slot].store(0.0, Relaxed);
            self.vertices.se[slot].store(0.0, Relaxed);
            self.vertices.swz[slot].store(0.0, Relaxed);
            self.vertices.swe[slot].store(0.0, Relaxed);
            self.vertices.aux1[slot].store(0.0, Relaxed);
            self.vertices.aux2[slot].store(0.0, Relaxed);
            self.vertices.is_good.set(slot, false);
            self.vertices.order.set(slot, INVALID_ORDER);
            if slot == self.base {
                self.vertices.rho.set(slot, 1.0);
                self.vertices.order.set(slot, self.base as u32);
                self.vertices.is_good.set(slot, true);
            }
        }
        for t in self.my_tracks() {
            self.tracks.kmin.set(t, self.base as i32);
            self.tracks.kmax.set(t, self.base as i32 + 1);
        }
        if self.leader() {
            self.vertices.nv.set(self.block, 1);
        }
        self.bar();
    }

    /// Reduce the block's track weights and publish the reciprocal.
    fn sum_track_weights(&self) {
        if self.leader() {
            self.shared.red_a.store(0.0, Relaxed);
        }
        self.bar();
        for t in self.my_tracks() {
            if !self.tracks.is_good.get(t) {
                continue;
            }
            self.shared.red_a.fetch_add(self.tracks.weight.get(t), Relaxed);
        }
        self.bar();
        if self.leader() {
            let sum = self.shared.red_a.load(Relaxed);
            let recip = if sum > 0.0 { 1.0 / sum } else { 0.0 };
            self.shared.osumtkwt.store(recip, Relaxed);
        }
        self.bar();
    }

    /// First critical temperature of the block and the starting beta at or
    /// above it.
    pub fn beta0(&self) {
        if self.leader() {
            self.shared.red_a.store(0.0, Relaxed);
            self.shared.red_b.store(0.0, Relaxed);
        }
        self.bar();
        for t in self.my_tracks() {
            if !self.tracks.is_good.get(t) {
                continue;
            }
            let w = self.tracks.weight.get(t) * self.tracks.oneoverdz2.get(t);
            self.tracks.aux1.set(t, w);
            self.tracks.aux2.set(t, w * self.tracks.z.get(t));
            self.shared.red_a.fetch_add(w, Relaxed);
            self.shared.red_b.fetch_add(w * self.tracks.z.get(t), Relaxed);
        }
        self.bar();
        if self.leader() {
            let wsum = self.shared.red_a.load(Relaxed);
            let zhat = if wsum > 0.0 { self.shared.red_b.load(Relaxed) / wsum } else { 0.0 };
            self.vertices.z.set(self.base, zhat);
            self.shared.red_b.store(0.0, Relaxed);
        }
        self.bar();
        for t in self.my_tracks() {
            if !self.tracks.is_good.get(t) {
                continue;
            }
            let d = self.vertices.z.get(self.base) - self.tracks.z.get(t);
            let chi = self.tracks.aux1.get(t) * d * d * self.tracks.oneoverdz2.get(t);
            self.tracks.aux2.set(t, chi);
            self.shared.red_b.fetch_add(chi, Relaxed);
        }
        self.bar();
        if self.leader() {
            let wsum = self.shared.red_a.load(Relaxed);
            let t_c = if wsum > 0.0 { 2.0 * self.shared.red_b.load(Relaxed) / wsum } else { 0.0 };
            let t_min = self.params.t_min;
            let cooling = self.params.cooling_factor;
            let beta = if t_c > t_min {
                let steps = 1 - ((t_c / t_min).ln() / cooling.ln()).floor() as i32;
                cooling.powi(steps) / t_min
            } else {
                cooling / t_min
            };
            self.shared.beta.store(beta, Relaxed);
            debug!(block = self.block, t_c, beta, "first critical temperature");
        }
        self.bar();
    }

    /// Recompute each track's candidate-vertex window around its position.
    pub fn set_vtx_range(&self) {
        let nv = self.nv() as i64;
        if nv == 0 {
            self.bar();
            return;
        }
        let beta = self.shared.beta.load(Relaxed);
        let lo = self.base as i64;
        let last = lo + nv - 1;
        for t in self.my_tracks() {
            if !self.tracks.is_good.get(t) {
                continue;
            }
            let oo = self.tracks.oneoverdz2.get(t);
            let zrange = (self.params.zrange / (beta * oo).sqrt()).max(ZRANGE_MIN);
            let zt = self.tracks.z.get(t);
            let zmin = zt - zrange;
            let zmax = zt + zrange;

            let mut kmin = (self.tracks.kmin.get(t) as i64).min(last);
            if self.z_at(kmin) > zmin {
                while kmin > lo && self.z_at(kmin - 1) > zmin {
                    kmin -= 1;
                }
            } else {
                while kmin < last && self.z_at(kmin) < zmin {
                    kmin += 1;
                }
            }

            let mut kmax = (self.tracks.kmax.get(t) as i64 - 1).min(last);
            if self.z_at(kmax) < zmax {
                while kmax < last && self.z_at(kmax + 1) < zmax {
                    kmax += 1;
                }
            } else {
                while kmax > lo && self.z_at(kmax) > zmax {
                    kmax -= 1;
                }
            }

            if kmin <= kmax {
                self.tracks.kmin.set(t, kmin as i32);
                self.tracks.kmax.set(t, (kmax + 1) as i32);
            } else {
                self.tracks.kmin.set(t, lo.max(kmin.min(kmax)) as i32);
                self.tracks.kmax.set(t, (lo + nv).min(kmin.max(kmax) + 1) as i32);
            }
        }
        self.bar();
    }

    /// One mean-field iteration: partition functions, accumulator reduction,
    /// new vertex positions and densities.
    pub fn update(&self, scratch: &mut Scratch, rho0: f64, update_tc: bool) {
        let beta = self.shared.beta.load(Relaxed);
        let osumtkwt = self.shared.osumtkwt.load(Relaxed);
        let nv = self.nv();
        let z_init = rho0 * (-beta * self.params.dz_cutoff * self.params.dz_cutoff).exp();

        for p in self.my_vertex_positions(nv) {
            let v = self.slot_at(p);
            self.vertices.se[v].store(0.0, Relaxed);
            self.vertices.sw[v].store(0.0, Relaxed);
            self.vertices.swz[v].store(0.0, Relaxed);
            if update_tc {
                self.vertices.swe[v].store(0.0, Relaxed);
            }
        }
        self.bar();

        for t in self.my_tracks() {
            if !self.tracks.is_good.get(t) {
                continue;
            }
            let zt = self.tracks.z.get(t);
            let oo = self.tracks.oneoverdz2.get(t);
            let botrack = -beta * oo;
            let k0 = self.tracks.kmin.get(t) as usize;
            let k1 = self.tracks.kmax.get(t) as usize;
            let mut sum_z = z_init;
            for k in k0..k1 {
                let v = self.slot_at(k);
                let dz = zt - self.vertices.z.get(v);
                let arg = botrack * dz * dz;
                let e = arg.exp();
                scratch.earg[k - k0] = arg;
                scratch.eexp[k - k0] = e;
                sum_z += self.vertices.rho.get(v) * e;
            }
            if !sum_z.is_finite() {
                sum_z = 0.0;
            }
            self.tracks.sum_z.set(t, sum_z);
            if sum_z > NEGLIGIBLE_SUM_Z {
                let sumw = self.tracks.weight.get(t) / sum_z;
                for k in k0..k1 {
                    let v = self.slot_at(k);
                    let e = scratch.eexp[k - k0];
                    let w = self.vertices.rho.get(v) * e * sumw * oo;
                    self.vertices.se[v].fetch_add(e * sumw, Relaxed);
                    self.vertices.sw[v].fetch_add(w, Relaxed);
                    self.vertices.swz[v].fetch_add(w * zt, Relaxed);
                    if update_tc {
                        self.vertices.swe[v].fetch_add(-w * scratch.earg[k - k0] / beta, Relaxed);
                    }
                }
            }
        }
        self.bar();

        for p in self.my_vertex_positions(nv) {
            let v = self.slot_at(p);
            let sw = self.vertices.sw[v].load(Relaxed);
            if sw > 0.0 {
                let znew = self.vertices.swz[v].load(Relaxed) / sw;
                self.vertices.aux1[v].store((znew - self.vertices.z.get(v)).abs(), Relaxed);
                self.vertices.z.set(v, znew);
            } else {
                self.vertices.aux1[v].store(0.0, Relaxed);
            }
            let rho = self.vertices.rho.get(v) * self.vertices.se[v].load(Relaxed) * osumtkwt;
            self.vertices.rho.set(v, rho);
        }
        self.bar();
    }

    /// Iterate `update` at fixed temperature until the largest vertex
    /// movement drops below the convergence step.
    pub fn thermalize(&self, scratch: &mut Scratch, delta: f64, rho0: f64) {
        let beta = self.shared.beta.load(Relaxed);
        let delta_max = match self.params.convergence_mode {
            0 => delta,
            1 => self.params.delta_low_t / beta.max(1.0).sqrt(),
            _ => self.params.delta_low_t,
        };
        self.set_vtx_range();
        let mut delta_sum = 0.0;
        let mut niter = 0;
        while niter < MAX_THERMALIZE_ITERS {
            niter += 1;
            self.update(scratch, rho0, false);
            let nv = self.nv();
            let mut dmax = 0.0f64;
            for p in self.base..self.base + nv {
                let v = self.slot_at(p);
                dmax = dmax.max(self.vertices.aux1[v].load(Relaxed));
            }
            self.bar();
            delta_sum += dmax;
            if delta_sum > MOVEMENT_RESET && dmax > MOVEMENT_RESET {
                self.set_vtx_range();
                delta_sum = 0.0;
            }
            if dmax < delta_max {
                break;
            }
        }
        if niter >= MAX_THERMALIZE_ITERS && self.leader() {
            debug!(block = self.block, "thermalize hit the iteration cap");
        }
    }

    /// Collapse the closest adjacent pair below the merge distance. At most
    /// one pair per invocation; callers loop to a fixpoint.
    pub fn merge(&self) -> bool {
        let nv = self.nv();
        if nv < 2 {
            return false;
        }
        for p in (self.base + self.worker..self.base + nv - 1).step_by(self.team) {
            let v = self.slot_at(p);
            let vn = self.slot_at(p + 1);
            let gap = (self.vertices.z.get(v) - self.vertices.z.get(vn)).abs();
            self.vertices.aux1[v].store(gap, Relaxed);
        }
        self.bar();

        if self.leader() {
            let mut best = NO_DECISION;
            let mut best_gap = f64::INFINITY;
            for p in self.base..self.base + nv - 1 {
                let gap = self.vertices.aux1[self.slot_at(p)].load(Relaxed);
                if gap < self.params.zmerge && gap < best_gap {
                    best_gap = gap;
                    best = p;
                }
            }
            if best != NO_DECISION {
                let v = self.slot_at(best);
                let vn = self.slot_at(best + 1);
                self.vertices.is_good.set(v, false);
                let rho_l = self.vertices.rho.get(v);
                let rho_r = self.vertices.rho.get(vn);
                let rho_sum = rho_l + rho_r;
                let z_merged = if rho_sum > NEGLIGIBLE_RHO {
                    (rho_l * self.vertices.z.get(v) + rho_r * self.vertices.z.get(vn)) / rho_sum
                } else {
                    0.5 * (self.vertices.z.get(v) + self.vertices.z.get(vn))
                };
                self.vertices.z.set(vn, z_merged);
                self.vertices.rho.set(vn, rho_sum);
                self.vertices.sw[vn].fetch_add(self.vertices.sw[v].load(Relaxed), Relaxed);
                for q in best..self.base + nv - 1 {
                    self.vertices.order.set(q, self.vertices.order.get(q + 1));
                }
                self.vertices.nv.set(self.block, (nv - 1) as u32);
                debug!(block = self.block, pos = best, gap = best_gap, "merged adjacent vertices");
            }
            self.shared.decision.store(best, Relaxed);
        }
        self.bar();

        let removed = self.shared.decision.load(Relaxed);
        if removed == NO_DECISION {
            return false;
        }
        let pos = removed as i32;
        for t in self.my_tracks() {
            if !self.tracks.is_good.get(t) {
                continue;
            }
            if self.tracks.kmax.get(t) > pos {
                self.tracks.kmax.set(t, self.tracks.kmax.get(t) - 1);
            }
            let kmin = self.tracks.kmin.get(t);
            if kmin > pos
                || (self.tracks.kmax.get(t) < kmin + 1 && kmin > self.base as i32)
            {
                self.tracks.kmin.set(t, kmin - 1);
            }
        }
        self.bar();
        self.set_vtx_range();
        true
    }

    /// Bifurcate every vertex whose critical temperature has been crossed,
    /// hottest first. Returns whether the vertex count changed.
    pub fn split(&self, scratch: &mut Scratch, threshold: f64) -> bool {
        self.update(scratch, 0.0, true);
        let nv0 = self.nv();
        if nv0 == 0 {
            return false;
        }
        let beta = self.shared.beta.load(Relaxed);

        for p in self.my_vertex_positions(nv0) {
            let v = self.slot_at(p);
            let t_c = 2.0 * self.vertices.swe[v].load(Relaxed) / self.vertices.sw[v].load(Relaxed);
            self.vertices.aux1[v].store(t_c, Relaxed);
        }
        self.bar();

        let mut queue = CriticalQueue::new(MAX_CRITICAL);
        if self.leader() {
            for p in self.base..self.base + nv0 {
                let t_c = self.vertices.aux1[self.slot_at(p)].load(Relaxed);
                if t_c * beta > threshold {
                    if !queue.push(t_c, p) {
                        break;
                    }
                }
            }
        }

        loop {
            if self.leader() {
                let next = if self.nv() == self.vmax { None } else { queue.pop() };
                self.shared.decision.store(next.unwrap_or(NO_DECISION), Relaxed);
            }
            self.bar();
            let pos = self.shared.decision.load(Relaxed);
            if pos == NO_DECISION {
                break;
            }
            let v = self.slot_at(pos);
            if self.leader() {
                for cell in [
                    &self.shared.p1,
                    &self.shared.p2,
                    &self.shared.z1,
                    &self.shared.z2,
                    &self.shared.w1,
                    &self.shared.w2,
                ] {
                    cell.store(0.0, Relaxed);
                }
            }
            self.bar();

            let zv = self.vertices.z.get(v);
            let rho_v = self.vertices.rho.get(v);
            for t in self.my_tracks() {
                if !self.tracks.is_good.get(t) {
                    continue;
                }
                let sum_z = self.tracks.sum_z.get(t);
                if sum_z <= NEGLIGIBLE_SUM_Z {
                    continue;
                }
                let zt = self.tracks.z.get(t);
                let oo = self.tracks.oneoverdz2.get(t);
                // Winner-takes-all overestimates splitting; soften it.
                let mut tl = if zt < zv { 1.0 } else { 0.0 };
                let mut tr = 1.0 - tl;
                let arg = (zt - zv) * (beta * oo).sqrt();
                if arg.abs() < SPLIT_SOFTEN_LIMIT {
                    let e = (-arg).exp();
                    tl = e / (e + 1.0);
                    tr = 1.0 / (e + 1.0);
                }
                let dz = zt - zv;
                let p = rho_v * self.tracks.weight.get(t) * (-beta * dz * dz * oo).exp() / sum_z;
                let w = p * oo;
                self.shared.p1.fetch_add(p * tl, Relaxed);
                self.shared.p2.fetch_add(p * tr, Relaxed);
                self.shared.z1.fetch_add(w * tl * zt, Relaxed);
                self.shared.z2.fetch_add(w * tr * zt, Relaxed);
                self.shared.w1.fetch_add(w * tl, Relaxed);
                self.shared.w2.fetch_add(w * tr, Relaxed);
            }
            self.bar();

            if self.leader() {
                let nv = self.nv();
                let p1 = self.shared.p1.load(Relaxed);
                let p2 = self.shared.p2.load(Relaxed);
                let w1 = self.shared.w1.load(Relaxed);
                let w2 = self.shared.w2.load(Relaxed);
                let mut z1 = if w1 > 0.0 {
                    self.shared.z1.load(Relaxed) / w1
                } else {
                    zv - SPLIT_EPSILON
                };
                let mut z2 = if w2 > 0.0 {
                    self.shared.z2.load(Relaxed) / w2
                } else {
                    zv + SPLIT_EPSILON
                };
                // Keep the halves inside the corridor towards the neighbors.
                if pos > self.base {
                    let prev = self.slot_at(pos - 1);
                    let lo = 0.6 * zv + 0.4 * self.vertices.z.get(prev);
                    if z1 < lo {
                        z1 = lo;
                    }
                }
                if pos < self.base + nv - 1 {
                    let next = self.slot_at(pos + 1);
                    let hi = 0.6 * zv + 0.4 * self.vertices.z.get(next);
                    if z2 > hi {
                        z2 = hi;
                    }
                }

                let mut flag = FLAG_SKIP;
                if (z2 - z1).abs() > SPLIT_EPSILON {
                    let free = (self.base..self.base + self.vmax)
                        .find(|&s| !self.vertices.is_good.get(s));
                    match free {
                        None => flag = FLAG_STOP,
                        Some(free) => {
                            let denom = p1 + p2;
                            let (rho_1, rho_2) = if denom > 0.0 {
                                (p1 * rho_v / denom, p2 * rho_v / denom)
                            } else {
                                (0.5 * rho_v, 0.5 * rho_v)
                            };
                            self.vertices.z.set(v, z2);
                            self.vertices.rho.set(v, rho_2);
                            self.vertices.z.set(free, z1);
                            self.vertices.rho.set(free, rho_1);
                            self.vertices.is_good.set(free, true);
                            self.vertices.sw[free].store(0.0, Relaxed);
                            self.vertices.se[free].store(0.0, Relaxed);
                            self.vertices.swz[free].store(0.0, Relaxed);
                            self.vertices.swe[free].store(0.0, Relaxed);
                            self.vertices.aux1[free].store(0.0, Relaxed);
                            self.vertices.aux2[free].store(0.0, Relaxed);
                            let mut q = self.base + nv;
                            while q > pos {
                                self.vertices.order.set(q, self.vertices.order.get(q - 1));
                                q -= 1;
                            }
                            self.vertices.order.set(pos, free as u32);
                            self.vertices.nv.set(self.block, (nv + 1) as u32);
                            queue.shift_after_insert(pos);
                            debug!(block = self.block, pos, z1, z2, "split vertex");
                            flag = FLAG_PROCEED;
                        }
                    }
                }
                self.shared.flag.store(flag, Relaxed);
            }
            self.bar();

            match self.shared.flag.load(Relaxed) {
                FLAG_STOP => break,
                FLAG_SKIP => continue,
                _ => {}
            }
            let pos_i = pos as i32;
            for t in self.my_tracks() {
                if !self.tracks.is_good.get(t) {
                    continue;
                }
                if self.tracks.kmin.get(t) > pos_i {
                    self.tracks.kmin.set(t, self.tracks.kmin.get(t) + 1);
                }
                let kmax = self.tracks.kmax.get(t);
                if kmax >= pos_i || kmax == self.tracks.kmin.get(t) {
                    self.tracks.kmax.set(t, kmax + 1);
                }
            }
            self.bar();
        }
        self.nv() != nv0
    }

    /// Remove the lowest-quality vertex: fewer than two uniquely assigned
    /// tracks and the smallest summed assignment probability.
    pub fn purge(&self, rho0: f64) -> bool {
        let nv0 = self.nv();
        if nv0 < 2 {
            return false;
        }
        let beta = self.shared.beta.load(Relaxed);
        let rho_const = rho0 * (-beta * self.params.dz_cutoff * self.params.dz_cutoff).exp();
        self.set_vtx_range();

        for p in self.my_vertex_positions(nv0) {
            let v = self.slot_at(p);
            self.vertices.aux1[v].store(0.0, Relaxed);
            self.vertices.aux2[v].store(0.0, Relaxed);
        }
        self.bar();

        for t in self.my_tracks() {
            if !self.tracks.is_good.get(t) {
                continue;
            }
            let sum_z = self.tracks.sum_z.get(t);
            let inv = if sum_z > NEGLIGIBLE_SUM_Z
                && self.tracks.weight.get(t) > self.params.uniquetrkminp
            {
                1.0 / sum_z
            } else {
                0.0
            };
            let zt = self.tracks.z.get(t);
            let oo = self.tracks.oneoverdz2.get(t);
            let k0 = self.tracks.kmin.get(t) as usize;
            let k1 = self.tracks.kmax.get(t) as usize;
            for k in k0..k1 {
                let v = self.slot_at(k);
                let rho_v = self.vertices.rho.get(v);
                let ppcut = self.params.uniquetrkweight * rho_v / (rho_v + rho_const);
                let dz = zt - self.vertices.z.get(v);
                let p = rho_v * (-beta * oo * dz * dz).exp() * inv;
                self.vertices.aux1[v].fetch_add(p, Relaxed);
                if p > ppcut {
                    self.vertices.aux2[v].fetch_add(1.0, Relaxed);
                }
            }
        }
        self.bar();

        if self.leader() {
            let mut worst = NO_DECISION;
            let mut sump_min = f64::INFINITY;
            for p in self.base..self.base + nv0 {
                let v = self.slot_at(p);
                if self.vertices.aux2[v].load(Relaxed) < MIN_UNIQUE_TRACKS
                    && self.vertices.aux1[v].load(Relaxed) < sump_min
                {
                    sump_min = self.vertices.aux1[v].load(Relaxed);
                    worst = p;
                }
            }
            if worst != NO_DECISION {
                let v = self.slot_at(worst);
                self.vertices.is_good.set(v, false);
                for q in worst..self.base + nv0 - 1 {
                    self.vertices.order.set(q, self.vertices.order.get(q + 1));
                }
                self.vertices.nv.set(self.block, (nv0 - 1) as u32);
                debug!(block = self.block, pos = worst, sump = sump_min, "purged vertex");
            }
            self.shared.decision.store(worst, Relaxed);
        }
        self.bar();

        let removed = self.shared.decision.load(Relaxed);
        if removed == NO_DECISION {
            return false;
        }
        let pos = removed as i32;
        for t in self.my_tracks() {
            if !self.tracks.is_good.get(t) {
                continue;
            }
            if self.tracks.kmax.get(t) > pos {
                self.tracks.kmax.set(t, self.tracks.kmax.get(t) - 1);
            }
            let kmin = self.tracks.kmin.get(t);
            if kmin > pos
                || (self.tracks.kmax.get(t) < kmin + 1 && kmin > self.base as i32)
            {
                self.tracks.kmin.set(t, kmin - 1);
            }
        }
        self.bar();
        self.set_vtx_range();
        true
    }

    /// Cooling schedule with merge-then-split at every step until the first
    /// freeze-out temperature.
    fn cool_while_splitting(&self, scratch: &mut Scratch) {
        let betafreeze = self.params.cooling_factor.sqrt() / self.params.t_min;
        while self.shared.beta.load(Relaxed) < betafreeze {
            let mut merged = self.merge();
            while merged {
                self.update(scratch, 0.0, false);
                merged = self.merge();
            }
            self.split(scratch, 1.0);
            if self.leader() {
                let beta = self.shared.beta.load(Relaxed) / self.params.cooling_factor;
                self.shared.beta.store(beta, Relaxed);
                debug!(block = self.block, beta, nv = self.nv(), "cooling step");
            }
            self.bar();
            self.thermalize(scratch, self.params.delta_high_t, 0.0);
            self.set_vtx_range();
            self.update(scratch, 0.0, false);
        }
    }

    /// Post-cooling merge to a fixpoint.
    fn re_merge(&self, scratch: &mut Scratch) {
        let mut merged = self.merge();
        while merged {
            self.set_vtx_range();
            self.update(scratch, 0.0, false);
            merged = self.merge();
        }
    }

    /// Final splitting rounds with a progressively easier threshold.
    fn re_split(&self, scratch: &mut Scratch) {
        let mut threshold = 1.0;
        let mut rounds = 0;
        let mut changed = self.split(scratch, threshold);
        while changed {
            rounds += 1;
            if rounds > MAX_RESPLIT_ROUNDS {
                break;
            }
            self.thermalize(scratch, self.params.delta_high_t, 0.0);
            let mut merged = self.merge();
            while merged {
                self.update(scratch, 0.0, false);
                merged = self.merge();
            }
            threshold *= 1.1;
            changed = self.split(scratch, threshold);
        }
    }

    /// Ramp in the outlier density, cool to the purge temperature, purge to
    /// a fixpoint, then cool to the stop temperature.
    fn reject_outliers(&self, scratch: &mut Scratch) {
        let mut rho0 = 0.0;
        if self.params.dz_cutoff > 0.0 {
            let nv = self.nv();
            rho0 = if nv > 1 { 1.0 / nv as f64 } else { 1.0 };
            for step in 0..RHO0_RAMP_STEPS {
                self.update(scratch, step as f64 * rho0 / RHO0_RAMP_STEPS as f64, false);
            }
        }
        self.thermalize(scratch, self.params.delta_low_t, rho0);
        let mut merged = self.merge();
        while merged {
            self.set_vtx_range();
            self.update(scratch, rho0, false);
            merged = self.merge();
        }

        let beta_purge = 1.0 / self.params.t_purge;
        while self.shared.beta.load(Relaxed) < beta_purge {
            if self.leader() {
                let beta = (self.shared.beta.load(Relaxed) / self.params.cooling_factor)
                    .min(beta_purge);
                self.shared.beta.store(beta, Relaxed);
            }
            self.bar();
            self.thermalize(scratch, self.params.delta_low_t, rho0);
        }

        let mut purged = self.purge(rho0);
        while purged {
            self.thermalize(scratch, self.params.delta_low_t, rho0);
            purged = self.purge(rho0);
        }

        let beta_stop = 1.0 / self.params.t_stop;
        while self.shared.beta.load(Relaxed) < beta_stop {
            if self.leader() {
                let beta = (self.shared.beta.load(Relaxed) / self.params.cooling_factor)
                    .min(beta_stop);
                self.shared.beta.store(beta, Relaxed);
            }
            self.bar();
            self.thermalize(scratch, self.params.delta_low_t, rho0);
        }
        self.set_vtx_range();
    }
}
