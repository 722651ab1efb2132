//! Collective communication facade.
//!
//! The index never talks to a transport directly; it drives the five
//! capabilities below. Realizations exist for a single-rank group (here),
//! an in-process thread mesh (`keymesh_inproc`), and MPI (`keymesh_mpi`).

use crate::Rank;

/// The collective operations the index requires from its process group.
///
/// Every method is a collective: all ranks of the group must call it in
/// the same order with compatible arguments. A rank that never enters a
/// collective leaves the rest of the group blocked; there is no timeout
/// or cancellation. Transports are assumed reliable - a lost peer aborts
/// the group rather than surfacing as a recoverable error.
///
/// Ordering guarantee: bytes handed to [`Collective::all_to_all_bytes`]
/// arrive at each receiver in the sender's pack order. No ordering holds
/// between distinct senders; callers sort receive aggregates themselves.
pub trait Collective {
    /// This rank's id, in `0..size`.
    fn rank(&self) -> Rank;

    /// Number of ranks in the group.
    fn size(&self) -> Rank;

    /// Replicate `buf` from `root` to every rank. All ranks must pass
    /// equal-length buffers.
    fn broadcast_u64(&self, buf: &mut [u64], root: Rank);

    /// Elementwise sum of `local` across the group, replicated into
    /// `global` on every rank.
    fn all_reduce_sum_u64(&self, local: &[u64], global: &mut [u64]);

    /// Concatenate every rank's `local` in rank order into `global`,
    /// replicated everywhere. `global.len()` must be
    /// `size * local.len()`.
    fn all_gather_u64(&self, local: &[u64], global: &mut [u64]);

    /// Signed variant of [`Collective::all_gather_u64`].
    fn all_gather_i64(&self, local: &[i64], global: &mut [i64]);

    /// Deliver `send[p]` to rank `p` and return one buffer per sender.
    ///
    /// `recv_sizes[p]` is the byte count this rank will receive from `p`,
    /// as agreed beforehand through a size exchange; transports that need
    /// posted receive lengths rely on it. The self slot is delivered
    /// locally.
    fn all_to_all_bytes(&self, send: Vec<Vec<u8>>, recv_sizes: &[usize]) -> Vec<Vec<u8>>;
}

impl<C: Collective + ?Sized> Collective for &C {
    fn rank(&self) -> Rank {
        (**self).rank()
    }

    fn size(&self) -> Rank {
        (**self).size()
    }

    fn broadcast_u64(&self, buf: &mut [u64], root: Rank) {
        (**self).broadcast_u64(buf, root)
    }

    fn all_reduce_sum_u64(&self, local: &[u64], global: &mut [u64]) {
        (**self).all_reduce_sum_u64(local, global)
    }

    fn all_gather_u64(&self, local: &[u64], global: &mut [u64]) {
        (**self).all_gather_u64(local, global)
    }

    fn all_gather_i64(&self, local: &[i64], global: &mut [i64]) {
        (**self).all_gather_i64(local, global)
    }

    fn all_to_all_bytes(&self, send: Vec<Vec<u8>>, recv_sizes: &[usize]) -> Vec<Vec<u8>> {
        (**self).all_to_all_bytes(send, recv_sizes)
    }
}

/// The group of one rank: every collective degenerates to a local copy.
///
/// Useful for serial runs and unit tests; semantically identical to a
/// real transport at `size == 1`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SelfComm;

impl Collective for SelfComm {
    fn rank(&self) -> Rank {
        0
    }

    fn size(&self) -> Rank {
        1
    }

    fn broadcast_u64(&self, _buf: &mut [u64], _root: Rank) {}

    fn all_reduce_sum_u64(&self, local: &[u64], global: &mut [u64]) {
        global.copy_from_slice(local);
    }

    fn all_gather_u64(&self, local: &[u64], global: &mut [u64]) {
        global.copy_from_slice(local);
    }

    fn all_gather_i64(&self, local: &[i64], global: &mut [i64]) {
        global.copy_from_slice(local);
    }

    fn all_to_all_bytes(&self, send: Vec<Vec<u8>>, recv_sizes: &[usize]) -> Vec<Vec<u8>> {
        debug_assert_eq!(send.len(), 1);
        debug_assert_eq!(recv_sizes.len(), 1);
        send
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_self_comm_identity() {
        let comm = SelfComm;
        assert_eq!(comm.rank(), 0);
        assert_eq!(comm.size(), 1);

        let local = [3u64, 5, 8];
        let mut global = [0u64; 3];
        comm.all_reduce_sum_u64(&local, &mut global);
        assert_eq!(global, local);

        comm.all_gather_u64(&local, &mut global);
        assert_eq!(global, local);

        let recv = comm.all_to_all_bytes(vec![vec![1, 2, 3]], &[3]);
        assert_eq!(recv, vec![vec![1, 2, 3]]);
    }
}
