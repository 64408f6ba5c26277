use serde::{Deserialize, Serialize};

/// Total vertex slots shared by all blocks during per-block clusterization.
/// Each of the `G` blocks owns a window of `MAX_VERTICES / G` slots.
pub const MAX_VERTICES: usize = 512;

/// Slot capacity of the global, arbitrated vertex list.
pub const MAX_GLOBAL_VERTICES: usize = 1024;

/// Capacity of the per-block critical-candidate queue used by merge/split.
pub const MAX_CRITICAL: usize = 128;

/// Sentinel stored in `kmin`/`kmax` for a track that no vertex claimed.
pub const NO_VERTEX: i32 = 10_000;

/// Order-slot filler for vertex slots that are not part of any block's
/// sorted prefix.
pub const INVALID_ORDER: u32 = 9_999;

/// Annealing and selection parameters of the clusterizer.
///
/// Field names follow the configuration keys recognized by the upstream
/// producer; serde round-trips them unchanged.
#[derive(Serialize, Deserialize, Clone, Debug)]
pub struct ClusterParams {
    /// Track-to-vertex association range, in units of the track resolution.
    pub zrange: f64,
    /// Adjacent vertices closer than this are collapsed.
    pub zmerge: f64,
    #[serde(rename = "dzCutOff")]
    pub dz_cutoff: f64,
    /// Minimum track weight for a track to count as uniquely assigned.
    pub uniquetrkminp: f64,
    /// Assignment-probability fraction above which a track is unique.
    pub uniquetrkweight: f64,
    #[serde(rename = "vertexSize")]
    pub vertex_size: f64,
    #[serde(rename = "TMin")]
    pub t_min: f64,
    #[serde(rename = "Tpurge")]
    pub t_purge: f64,
    #[serde(rename = "Tstop")]
    pub t_stop: f64,
    #[serde(rename = "coolingFactor")]
    pub cooling_factor: f64,
    #[serde(rename = "delta_highT")]
    pub delta_high_t: f64,
    #[serde(rename = "delta_lowT")]
    pub delta_low_t: f64,
    /// 0: fixed high-T step, 1: temperature-scaled low-T step,
    /// anything else: fixed low-T step.
    pub convergence_mode: u32,
}

impl Default for ClusterParams {
    fn default() -> Self {
        ClusterParams {
            zrange: 4.0,
            zmerge: 1e-2,
            dz_cutoff: 4.0,
            uniquetrkminp: 0.0,
            uniquetrkweight: 0.8,
            vertex_size: 1e-2,
            t_min: 4.0,
            t_purge: 2.0,
            t_stop: 0.5,
            cooling_factor: 0.6,
            delta_high_t: 1e-2,
            delta_low_t: 1e-4,
            convergence_mode: 0,
        }
    }
}

/// Structure-of-arrays track store. Position, resolution and weight are
/// frozen after block replication; the assignment window (`kmin`/`kmax`),
/// the partition function and the auxiliaries are mutated by the solver.
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct TrackCollection {
    pub z: Vec<f64>,
    pub dz2: Vec<f64>,
    pub oneoverdz2: Vec<f64>,
    pub weight: Vec<f64>,
    /// Stable identity from the upstream collection; replicated tracks in
    /// overlapping blocks share it.
    pub tt_index: Vec<i32>,
    pub kmin: Vec<i32>,
    pub kmax: Vec<i32>,
    pub sum_z: Vec<f64>,
    pub aux1: Vec<f64>,
    pub aux2: Vec<f64>,
    pub is_good: Vec<bool>,
    pub x: Vec<f64>,
    pub y: Vec<f64>,
    pub px: Vec<f64>,
    pub py: Vec<f64>,
    pub pz: Vec<f64>,
    /// Logical track count; the columns may carry padded capacity beyond it.
    pub n: usize,
}

impl TrackCollection {
    pub fn new() -> Self {
        Self::default()
    }

    /// All-zero collection with `rows` physical rows and `n = 0`.
    pub fn zeroed(rows: usize) -> Self {
        TrackCollection {
            z: vec![0.0; rows],
            dz2: vec![0.0; rows],
            oneoverdz2: vec![0.0; rows],
            weight: vec![0.0; rows],
            tt_index: vec![0; rows],
            kmin: vec![0; rows],
            kmax: vec![0; rows],
            sum_z: vec![0.0; rows],
            aux1: vec![0.0; rows],
            aux2: vec![0.0; rows],
            is_good: vec![false; rows],
            x: vec![0.0; rows],
            y: vec![0.0; rows],
            px: vec![0.0; rows],
            py: vec![0.0; rows],
            pz: vec![0.0; rows],
            n: 0,
        }
    }

    /// Append a measured track. `dz` is the longitudinal resolution;
    /// `tt_index` is assigned from the insertion position.
    pub fn push(&mut self, z: f64, dz: f64, weight: f64) {
        let idx = self.z.len() as i32;
        self.z.push(z);
        self.dz2.push(dz * dz);
        self.oneoverdz2.push(1.0 / (dz * dz));
        self.weight.push(weight);
        self.tt_index.push(idx);
        self.kmin.push(0);
        self.kmax.push(0);
        self.sum_z.push(0.0);
        self.aux1.push(0.0);
        self.aux2.push(0.0);
        self.is_good.push(true);
        self.x.push(0.0);
        self.y.push(0.0);
        self.px.push(0.0);
        self.py.push(0.0);
        self.pz.push(0.0);
        self.n += 1;
    }

    pub fn len(&self) -> usize {
        self.n
    }

    pub fn is_empty(&self) -> bool {
        self.n == 0
    }

    /// Physical row count of the columns.
    pub fn rows(&self) -> usize {
        self.z.len()
    }

    /// Arbitrated assignment of track `i`: the sorted-order position of its
    /// vertex, or `None` if no vertex claimed it.
    pub fn assignment(&self, i: usize) -> Option<usize> {
        if self.kmin[i] == NO_VERTEX {
            None
        } else {
            Some(self.kmin[i] as usize)
        }
    }
}

/// Structure-of-arrays vertex slot pool. Slot storage never moves; logical
/// ordering lives in `order` and per-block occupancy in `nv` (block-leader
/// slot convention: block `g` stores its count at slot index `g`, the
/// arbitrated global count sits at slot 0).
#[derive(Serialize, Deserialize, Clone, Debug, Default)]
pub struct VertexCollection {
    pub z: Vec<f64>,
    pub rho: Vec<f64>,
    pub sw: Vec<f64>,
    pub se: Vec<f64>,
    pub swz: Vec<f64>,
    pub swe: Vec<f64>,
    pub aux1: Vec<f64>,
    pub aux2: Vec<f64>,
    pub is_good: Vec<bool>,
    pub order: Vec<u32>,
    pub nv: Vec<u32>,
    pub track_id: Vec<Vec<u32>>,
    pub track_weight: Vec<Vec<f64>>,
}

impl VertexCollection {
    /// Slot pool with `slots` empty slots.
    pub fn with_slots(slots: usize) -> Self {
        VertexCollection {
            z: vec![0.0; slots],
            rho: vec![0.0; slots],
            sw: vec![0.0; slots],
            se: vec![0.0; slots],
            swz: vec![0.0; slots],
            swe: vec![0.0; slots],
            aux1: vec![0.0; slots],
            aux2: vec![0.0; slots],
            is_good: vec![false; slots],
            order: vec![INVALID_ORDER; slots],
            nv: vec![0; slots],
            track_id: vec![Vec::new(); slots],
            track_weight: vec![Vec::new(); slots],
        }
    }

    /// Standard pool sized for arbitration.
    pub fn standard() -> Self {
        Self::with_slots(MAX_GLOBAL_VERTICES)
    }

    pub fn slots(&self) -> usize {
        self.z.len()
    }

    /// Number of finalized vertices after arbitration.
    pub fn n_vertices(&self) -> usize {
        self.nv[0] as usize
    }

    /// Slot index of the `i`-th vertex in ascending-`z` order.
    pub fn slot_of(&self, i: usize) -> usize {
        self.order[i] as usize
    }

    pub fn position(&self, i: usize) -> f64 {
        self.z[self.slot_of(i)]
    }

    pub fn density(&self, i: usize) -> f64 {
        self.rho[self.slot_of(i)]
    }

    pub fn ntracks(&self, i: usize) -> usize {
        self.track_id[self.slot_of(i)].len()
    }

    pub fn tracks_of(&self, i: usize) -> &[u32] {
        &self.track_id[self.slot_of(i)]
    }

    pub fn track_weights_of(&self, i: usize) -> &[f64] {
        &self.track_weight[self.slot_of(i)]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_params_round_trip() {
        let p = ClusterParams::default();
        assert_eq!(p.t_min, 4.0);
        assert_eq!(p.convergence_mode, 0);
        let json = serde_json::to_string(&p).unwrap();
        assert!(json.contains("\"TMin\""));
        assert!(json.contains("\"dzCutOff\""));
        let back: ClusterParams = serde_json::from_str(&json).unwrap();
        assert_eq!(back.cooling_factor, p.cooling_factor);
    }

    #[test]
    fn test_track_push() {
        let mut tc = TrackCollection::new();
        tc.push(1.5, 0.02, 1.0);
        tc.push(-0.5, 0.1, 0.7);
        assert_eq!(tc.len(), 2);
        assert_eq!(tc.tt_index, vec![0, 1]);
        assert!((tc.oneoverdz2[0] - 2500.0).abs() < 1e-9);
        assert!(tc.is_good[1]);
    }

    #[test]
    fn test_vertex_pool_layout() {
        let vc = VertexCollection::with_slots(8);
        assert_eq!(vc.slots(), 8);
        assert_eq!(vc.n_vertices(), 0);
        assert!(vc.order.iter().all(|&o| o == INVALID_ORDER));
    }
}
