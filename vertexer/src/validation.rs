use vertexer_types::{
    ClusterParams, TrackCollection, VertexCollection, MAX_GLOBAL_VERTICES, MAX_VERTICES,
};

use crate::Error;

pub(crate) fn validate_params(params: &ClusterParams) -> Result<(), Error> {
    if !(params.cooling_factor > 0.0 && params.cooling_factor < 1.0) {
        return Err(Error::InvalidConfig(
            "coolingFactor must lie in (0, 1)".into(),
        ));
    }
    if params.t_min <= 0.0 || params.t_purge <= 0.0 || params.t_stop <= 0.0 {
        return Err(Error::InvalidConfig(
            "annealing temperatures must be positive".into(),
        ));
    }
    if params.t_min < params.t_purge || params.t_purge < params.t_stop {
        return Err(Error::InvalidConfig(
            "annealing must cool: TMin >= Tpurge >= Tstop".into(),
        ));
    }
    if params.zrange <= 0.0 {
        return Err(Error::InvalidConfig("zrange must be positive".into()));
    }
    if params.zmerge < 0.0 || params.vertex_size < 0.0 {
        return Err(Error::InvalidConfig(
            "zmerge and vertexSize must be non-negative".into(),
        ));
    }
    Ok(())
}

pub(crate) fn validate_clusterize(
    tracks: &TrackCollection,
    vertices: &VertexCollection,
    params: &ClusterParams,
    n_blocks: usize,
    block_size: usize,
) -> Result<(), Error> {
    validate_params(params)?;
    if block_size == 0 {
        return Err(Error::InvalidConfig("block size must be positive".into()));
    }
    if n_blocks == 0 {
        return Err(Error::InvalidConfig("need at least one block".into()));
    }
    if n_blocks > MAX_VERTICES {
        return Err(Error::InvalidConfig(format!(
            "{n_blocks} blocks leave no vertex slots per block window"
        )));
    }
    if n_blocks * block_size > tracks.rows() {
        return Err(Error::InvalidConfig(format!(
            "track buffer holds {} rows, block grid needs {}",
            tracks.rows(),
            n_blocks * block_size
        )));
    }
    let vmax = MAX_VERTICES / n_blocks;
    if n_blocks * vmax > vertices.slots() {
        return Err(Error::InvalidConfig(format!(
            "vertex pool holds {} slots, block windows need {}",
            vertices.slots(),
            n_blocks * vmax
        )));
    }
    Ok(())
}

pub(crate) fn validate_arbitrate(
    vertices: &VertexCollection,
    n_blocks: usize,
) -> Result<(), Error> {
    if n_blocks == 0 {
        return Err(Error::InvalidConfig("need at least one block".into()));
    }
    if vertices.slots() < MAX_GLOBAL_VERTICES {
        return Err(Error::InvalidConfig(format!(
            "vertex pool holds {} slots, arbitration needs {}",
            vertices.slots(),
            MAX_GLOBAL_VERTICES
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_params_pass() {
        assert!(validate_params(&ClusterParams::default()).is_ok());
    }

    #[test]
    fn test_bad_cooling_factor() {
        let mut params = ClusterParams::default();
        params.cooling_factor = 1.5;
        let result = validate_params(&params);
        assert!(result.is_err());
        if let Err(Error::InvalidConfig(msg)) = result {
            assert!(msg.contains("coolingFactor"));
        }
    }

    #[test]
    fn test_inverted_temperatures() {
        let mut params = ClusterParams::default();
        params.t_stop = 10.0;
        assert!(validate_params(&params).is_err());
    }

    #[test]
    fn test_clusterize_requires_track_capacity() {
        let tracks = TrackCollection::zeroed(8);
        let vertices = VertexCollection::standard();
        let params = ClusterParams::default();
        assert!(validate_clusterize(&tracks, &vertices, &params, 2, 8).is_err());
        assert!(validate_clusterize(&tracks, &vertices, &params, 1, 8).is_ok());
    }

    #[test]
    fn test_arbitrate_requires_global_pool() {
        let vertices = VertexCollection::with_slots(512);
        assert!(validate_arbitrate(&vertices, 1).is_err());
        assert!(validate_arbitrate(&VertexCollection::standard(), 1).is_ok());
    }
}
