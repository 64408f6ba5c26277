use tracing::debug;
use vertexer_types::TrackCollection;

/// Replicate the input tracks into overlapping blocks of `block_size`.
///
/// Block `g` starts at input index `g * (overlap * block_size)`, so any
/// vertex whose tracks span less than `(1 - overlap) * block_size` entries
/// falls fully inside at least one block. Duplicated tracks keep their
/// `tt_index` and are collapsed again during finalization.
///
/// Returns the replicated collection and the number of blocks.
pub(crate) fn create_blocks(
    input: &TrackCollection,
    block_size: usize,
    overlap: f64,
) -> (TrackCollection, usize) {
    let n_old = input.len();
    if n_old == 0 {
        debug!("create_blocks: empty input");
        return (TrackCollection::zeroed(0), 0);
    }

    let stride = overlap * block_size as f64;
    let n_blocks = if n_old > block_size {
        ((n_old - 1) as f64 / stride).ceil() as usize
    } else {
        1
    };
    let overlap_start = stride as usize;

    let mut out = TrackCollection::zeroed(n_blocks * block_size);
    for iblock in 0..n_blocks {
        for ilocal in 0..block_size {
            let old = iblock * overlap_start + ilocal;
            if old >= n_old {
                break;
            }
            let new = iblock * block_size + ilocal;
            copy_row(input, old, &mut out, new);
        }
    }

    out.n = if n_old > block_size {
        let full = (n_old as f64 / stride).floor() as i64;
        let count = ((n_blocks - 1) * block_size) as i64 + n_old as i64
            - (block_size as i64) * full;
        count.clamp(0, (n_blocks * block_size) as i64) as usize
    } else {
        n_old
    };

    debug!(
        n_in = n_old,
        n_out = out.n,
        n_blocks,
        block_size,
        "create_blocks"
    );
    (out, n_blocks)
}

fn copy_row(src: &TrackCollection, i: usize, dst: &mut TrackCollection, j: usize) {
    dst.x[j] = src.x[i];
    dst.y[j] = src.y[i];
    dst.z[j] = src.z[i];
    dst.px[j] = src.px[i];
    dst.py[j] = src.py[i];
    dst.pz[j] = src.pz[i];
    dst.weight[j] = src.weight[i];
    dst.tt_index[j] = src.tt_index[i];
    dst.dz2[j] = src.dz2[i];
    dst.oneoverdz2[j] = src.oneoverdz2[i];
    dst.sum_z[j] = src.sum_z[i];
    dst.kmin[j] = src.kmin[i];
    dst.kmax[j] = src.kmax[i];
    dst.aux1[j] = src.aux1[i];
    dst.aux2[j] = src.aux2[i];
    dst.is_good[j] = src.is_good[i];
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracks(n: usize) -> TrackCollection {
        let mut tc = TrackCollection::new();
        for i in 0..n {
            tc.push(i as f64 * 0.1, 0.02, 1.0);
        }
        tc
    }

    #[test]
    fn test_empty_input() {
        let (out, n_blocks) = create_blocks(&tracks(0), 8, 0.5);
        assert_eq!(n_blocks, 0);
        assert_eq!(out.len(), 0);
    }

    #[test]
    fn test_small_input_single_block() {
        let (out, n_blocks) = create_blocks(&tracks(6), 8, 0.5);
        assert_eq!(n_blocks, 1);
        assert_eq!(out.len(), 6);
        assert_eq!(out.rows(), 8);
        for i in 0..6 {
            assert_eq!(out.z[i], i as f64 * 0.1);
            assert_eq!(out.tt_index[i], i as i32);
            assert!(out.is_good[i]);
        }
    }

    #[test]
    fn test_exact_fit_single_block() {
        let (out, n_blocks) = create_blocks(&tracks(8), 8, 0.5);
        assert_eq!(n_blocks, 1);
        assert_eq!(out.len(), 8);
    }

    #[test]
    fn test_overlapping_replication() {
        // 20 tracks, blocks of 8, half overlap: starts at 0, 4, 8, 12, 16.
        let (out, n_blocks) = create_blocks(&tracks(20), 8, 0.5);
        assert_eq!(n_blocks, 5);
        assert_eq!(out.len(), 12);
        assert_eq!(out.rows(), 40);
        // Block 1 replicates inputs 4..12.
        for ilocal in 0..8 {
            assert_eq!(out.tt_index[8 + ilocal], 4 + ilocal as i32);
        }
        // Tail block holds inputs 16..20 and padding.
        assert_eq!(out.tt_index[4 * 8], 16);
        assert!(out.is_good[4 * 8 + 3]);
        assert!(!out.is_good[4 * 8 + 4]);
    }
}
