//! MPI realization of the keymesh collective facade.
//!
//! Wraps an MPI communicator so a `keymesh::KeyIndex` can run over a real
//! process group. Reductions, gathers and broadcasts map directly onto
//! the MPI collectives; the sized all-to-all runs as a rank-ordered
//! pairwise exchange where the lower rank of each pair sends first.
//!
//! Requires a system MPI installation; launch with `mpirun`/`mpiexec`.

use mpi::collective::{CommunicatorCollectives, Root, SystemOperation};
use mpi::point_to_point::{Destination, Source};
use mpi::topology::{Communicator, SimpleCommunicator};

use keymesh::{Collective, Rank};

/// A [`Collective`] over an MPI communicator.
pub struct MpiComm<'a> {
    world: &'a SimpleCommunicator,
}

impl<'a> MpiComm<'a> {
    /// Wrap `world`. The communicator must not be used concurrently by
    /// anything else while index collectives are running.
    pub fn new(world: &'a SimpleCommunicator) -> Self {
        Self { world }
    }
}

impl Collective for MpiComm<'_> {
    fn rank(&self) -> Rank {
        self.world.rank()
    }

    fn size(&self) -> Rank {
        self.world.size()
    }

    fn broadcast_u64(&self, buf: &mut [u64], root: Rank) {
        self.world.process_at_rank(root).broadcast_into(buf);
    }

    fn all_reduce_sum_u64(&self, local: &[u64], global: &mut [u64]) {
        self.world
            .all_reduce_into(local, global, SystemOperation::sum());
    }

    fn all_gather_u64(&self, local: &[u64], global: &mut [u64]) {
        self.world.all_gather_into(local, global);
    }

    fn all_gather_i64(&self, local: &[i64], global: &mut [i64]) {
        self.world.all_gather_into(local, global);
    }

    fn all_to_all_bytes(&self, send: Vec<Vec<u8>>, recv_sizes: &[usize]) -> Vec<Vec<u8>> {
        let rank = self.rank();
        let mut send = send;

        let mut recv: Vec<Vec<u8>> = recv_sizes.iter().map(|&n| vec![0u8; n]).collect();
        recv[rank as usize] = std::mem::take(&mut send[rank as usize]);

        // Pairwise exchange in rank order; the lower rank of each pair
        // sends first. Sizes were agreed beforehand, so empty directions
        // are skipped on both sides.
        for p in 0..self.size() {
            if p == rank {
                continue;
            }
            let peer = self.world.process_at_rank(p);
            let outgoing = &send[p as usize];
            let incoming = &mut recv[p as usize];
            if rank < p {
                if !outgoing.is_empty() {
                    peer.send(&outgoing[..]);
                }
                if !incoming.is_empty() {
                    peer.receive_into(&mut incoming[..]);
                }
            } else {
                if !incoming.is_empty() {
                    peer.receive_into(&mut incoming[..]);
                }
                if !outgoing.is_empty() {
                    peer.send(&outgoing[..]);
                }
            }
        }
        recv
    }
}
