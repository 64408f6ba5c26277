use std::cell::UnsafeCell;

use portable_atomic::{AtomicF64, AtomicUsize};
use vertexer_types::{TrackCollection, VertexCollection};

/// Published by the team leader when no candidate / no removal happened.
pub(crate) const NO_DECISION: usize = usize::MAX;

/// Column view shared across one worker team.
///
/// Plain (non-atomic) loads and stores; soundness comes from the kernel's
/// phase discipline: a cell is written by at most one worker per phase
/// (owner-stride or leader-only), and every phase boundary is a full-team
/// barrier.
pub(crate) struct SharedSlice<'a, T> {
    cells: &'a [UnsafeCell<T>],
}

impl<'a, T: Copy> SharedSlice<'a, T> {
    pub fn new(slice: &'a mut [T]) -> Self {
        // UnsafeCell<T> is layout-compatible with T.
        let cells = unsafe { &*(slice as *mut [T] as *const [UnsafeCell<T>]) };
        SharedSlice { cells }
    }

    #[inline]
    pub fn get(&self, i: usize) -> T {
        unsafe { *self.cells[i].get() }
    }

    #[inline]
    pub fn set(&self, i: usize, value: T) {
        unsafe { *self.cells[i].get() = value }
    }
}

impl<'a, T> Clone for SharedSlice<'a, T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<'a, T> Copy for SharedSlice<'a, T> {}

unsafe impl<'a, T: Copy + Send> Send for SharedSlice<'a, T> {}
unsafe impl<'a, T: Copy + Send> Sync for SharedSlice<'a, T> {}

/// Reinterpret a mutable f64 column as atomics for commuting reductions.
/// `AtomicF64` has the same in-memory representation as `f64`.
pub(crate) fn atomic_f64(slice: &mut [f64]) -> &[AtomicF64] {
    unsafe { &*(slice as *mut [f64] as *const [AtomicF64]) }
}

/// Kernel-facing view of the track columns. `n` is the physical row count;
/// padding rows carry `is_good = false` and are skipped by every kernel.
#[derive(Clone, Copy)]
pub(crate) struct TrackViews<'a> {
    pub n: usize,
    pub z: SharedSlice<'a, f64>,
    pub oneoverdz2: SharedSlice<'a, f64>,
    pub weight: SharedSlice<'a, f64>,
    pub kmin: SharedSlice<'a, i32>,
    pub kmax: SharedSlice<'a, i32>,
    pub sum_z: SharedSlice<'a, f64>,
    pub aux1: SharedSlice<'a, f64>,
    pub aux2: SharedSlice<'a, f64>,
    pub is_good: SharedSlice<'a, bool>,
}

impl<'a> TrackViews<'a> {
    pub fn new(tracks: &'a mut TrackCollection) -> Self {
        TrackViews {
            n: tracks.z.len(),
            z: SharedSlice::new(&mut tracks.z),
            oneoverdz2: SharedSlice::new(&mut tracks.oneoverdz2),
            weight: SharedSlice::new(&mut tracks.weight),
            kmin: SharedSlice::new(&mut tracks.kmin),
            kmax: SharedSlice::new(&mut tracks.kmax),
            sum_z: SharedSlice::new(&mut tracks.sum_z),
            aux1: SharedSlice::new(&mut tracks.aux1),
            aux2: SharedSlice::new(&mut tracks.aux2),
            is_good: SharedSlice::new(&mut tracks.is_good),
        }
    }
}

/// Kernel-facing view of the vertex slot pool. The accumulators and the
/// phase-overloaded auxiliaries are atomic; everything else follows the
/// leader/owner-stride discipline.
#[derive(Clone, Copy)]
pub(crate) struct VertexViews<'a> {
    pub z: SharedSlice<'a, f64>,
    pub rho: SharedSlice<'a, f64>,
    pub sw: &'a [AtomicF64],
    pub se: &'a [AtomicF64],
    pub swz: &'a [AtomicF64],
    pub swe: &'a [AtomicF64],
    pub aux1: &'a [AtomicF64],
    pub aux2: &'a [AtomicF64],
    pub is_good: SharedSlice<'a, bool>,
    pub order: SharedSlice<'a, u32>,
    pub nv: SharedSlice<'a, u32>,
}

impl<'a> VertexViews<'a> {
    pub fn new(vertices: &'a mut VertexCollection) -> Self {
        VertexViews {
            z: SharedSlice::new(&mut vertices.z),
            rho: SharedSlice::new(&mut vertices.rho),
            sw: atomic_f64(&mut vertices.sw),
            se: atomic_f64(&mut vertices.se),
            swz: atomic_f64(&mut vertices.swz),
            swe: atomic_f64(&mut vertices.swe),
            aux1: atomic_f64(&mut vertices.aux1),
            aux2: atomic_f64(&mut vertices.aux2),
            is_good: SharedSlice::new(&mut vertices.is_good),
            order: SharedSlice::new(&mut vertices.order),
            nv: SharedSlice::new(&mut vertices.nv),
        }
    }
}

/// Per-block annealing state and leader/worker handoff cells. All cells are
/// read and written with relaxed ordering; the team barrier provides the
/// happens-before edges between phases.
pub(crate) struct BlockShared {
    /// Inverse temperature of the block's annealing schedule.
    pub beta: AtomicF64,
    /// Reciprocal of the summed track weights of the block.
    pub osumtkwt: AtomicF64,
    /// General-purpose reduction cells (weighted sums in the first critical
    /// temperature estimate).
    pub red_a: AtomicF64,
    pub red_b: AtomicF64,
    /// Split-candidate reduction cells.
    pub p1: AtomicF64,
    pub p2: AtomicF64,
    pub z1: AtomicF64,
    pub z2: AtomicF64,
    pub w1: AtomicF64,
    pub w2: AtomicF64,
    /// Order position published by the leader for the current structural
    /// mutation (merge removal, split insertion, purge removal).
    pub decision: AtomicUsize,
    /// Uniform-branch code published by the leader (see anneal).
    pub flag: AtomicUsize,
}

impl BlockShared {
    pub fn new() -> Self {
        BlockShared {
            beta: AtomicF64::new(0.0),
            osumtkwt: AtomicF64::new(0.0),
            red_a: AtomicF64::new(0.0),
            red_b: AtomicF64::new(0.0),
            p1: AtomicF64::new(0.0),
            p2: AtomicF64::new(0.0),
            z1: AtomicF64::new(0.0),
            z2: AtomicF64::new(0.0),
            w1: AtomicF64::new(0.0),
            w2: AtomicF64::new(0.0),
            decision: AtomicUsize::new(NO_DECISION),
            flag: AtomicUsize::new(0),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use portable_atomic::Ordering;

    #[test]
    fn test_shared_slice_round_trip() {
        let mut data = vec![1.0f64, 2.0, 3.0];
        let view = SharedSlice::new(&mut data);
        view.set(1, 7.5);
        assert_eq!(view.get(1), 7.5);
        drop(view);
        assert_eq!(data[1], 7.5);
    }

    #[test]
    fn test_atomic_f64_view_aliases_column() {
        let mut col = vec![0.0f64; 4];
        {
            let atoms = atomic_f64(&mut col);
            atoms[2].fetch_add(1.25, Ordering::Relaxed);
            atoms[2].fetch_add(0.25, Ordering::Relaxed);
        }
        assert_eq!(col[2], 1.5);
    }

    #[test]
    fn test_shared_slice_concurrent_stride_writes() {
        let mut data = vec![0u32; 64];
        let view = SharedSlice::new(&mut data);
        std::thread::scope(|s| {
            for w in 0..4usize {
                s.spawn(move || {
                    for i in (w..64).step_by(4) {
                        view.set(i, i as u32);
                    }
                });
            }
        });
        drop(view);
        assert!(data.iter().enumerate().all(|(i, &v)| v == i as u32));
    }
}
