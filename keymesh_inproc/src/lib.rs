//! In-process thread-mesh realization of the keymesh collective facade.
//!
//! A group of `n` ranks runs as `n` threads wired by a full mesh of
//! per-pair unbounded channels, one channel per direction per pair. With a
//! dedicated channel per pair, per-sender FIFO holds by construction, and
//! because every rank executes the same sequence of collectives, messages
//! from different operations can never be confused on a pair.
//!
//! Reductions, gathers and broadcasts are star-shaped through rank 0;
//! the all-to-all is a direct per-pair exchange. Sends never block
//! (channels are unbounded), so there is no deadlock concern beyond the
//! usual one: a rank that never enters a collective leaves its peers
//! waiting forever. A rank that drops out mid-run aborts the group with a
//! panic rather than returning an error; the group is assumed reliable.

use crossbeam_channel::{unbounded, Receiver, Sender};
use keymesh::{Collective, Rank};

/// One rank's endpoint in an in-process group.
///
/// Create a full group with [`create_comms`] and move one endpoint into
/// each rank's thread.
pub struct InprocComm {
    rank: Rank,
    size: Rank,
    /// `tx_to[p]` sends to rank `p`; `None` at the self slot.
    tx_to: Vec<Option<Sender<Vec<u8>>>>,
    /// `rx_from[p]` receives from rank `p`; `None` at the self slot.
    rx_from: Vec<Option<Receiver<Vec<u8>>>>,
}

/// Create the endpoints of an `n`-rank group, in rank order.
///
/// # Panics
/// Panics if `n` is 0.
pub fn create_comms(n: usize) -> Vec<InprocComm> {
    assert!(n > 0, "must have at least one rank");

    let mut tx_to: Vec<Vec<Option<Sender<Vec<u8>>>>> =
        (0..n).map(|_| (0..n).map(|_| None).collect()).collect();
    let mut rx_from: Vec<Vec<Option<Receiver<Vec<u8>>>>> =
        (0..n).map(|_| (0..n).map(|_| None).collect()).collect();

    for from in 0..n {
        for to in 0..n {
            if from != to {
                let (tx, rx) = unbounded();
                tx_to[from][to] = Some(tx);
                rx_from[to][from] = Some(rx);
            }
        }
    }

    tx_to
        .into_iter()
        .zip(rx_from)
        .enumerate()
        .map(|(rank, (tx_to, rx_from))| InprocComm {
            rank: rank as Rank,
            size: n as Rank,
            tx_to,
            rx_from,
        })
        .collect()
}

impl InprocComm {
    fn send_to(&self, to: Rank, bytes: Vec<u8>) {
        let tx = self.tx_to[to as usize].as_ref().expect("no channel to self");
        tx.send(bytes).expect("peer rank disconnected");
    }

    fn recv_from(&self, from: Rank) -> Vec<u8> {
        let rx = self.rx_from[from as usize]
            .as_ref()
            .expect("no channel from self");
        rx.recv().expect("peer rank disconnected")
    }
}

fn u64s_to_bytes(words: &[u64]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(words.len() * 8);
    for word in words {
        bytes.extend_from_slice(&word.to_le_bytes());
    }
    bytes
}

fn bytes_to_u64s(bytes: &[u8], out: &mut [u64]) {
    debug_assert_eq!(bytes.len(), out.len() * 8);
    for (word, chunk) in out.iter_mut().zip(bytes.chunks_exact(8)) {
        *word = u64::from_le_bytes(chunk.try_into().unwrap());
    }
}

fn i64s_to_bytes(words: &[i64]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(words.len() * 8);
    for word in words {
        bytes.extend_from_slice(&word.to_le_bytes());
    }
    bytes
}

fn bytes_to_i64s(bytes: &[u8], out: &mut [i64]) {
    debug_assert_eq!(bytes.len(), out.len() * 8);
    for (word, chunk) in out.iter_mut().zip(bytes.chunks_exact(8)) {
        *word = i64::from_le_bytes(chunk.try_into().unwrap());
    }
}

impl Collective for InprocComm {
    fn rank(&self) -> Rank {
        self.rank
    }

    fn size(&self) -> Rank {
        self.size
    }

    fn broadcast_u64(&self, buf: &mut [u64], root: Rank) {
        if self.rank == root {
            for p in 0..self.size {
                if p != self.rank {
                    self.send_to(p, u64s_to_bytes(buf));
                }
            }
        } else {
            let bytes = self.recv_from(root);
            bytes_to_u64s(&bytes, buf);
        }
    }

    fn all_reduce_sum_u64(&self, local: &[u64], global: &mut [u64]) {
        if self.rank == 0 {
            global.copy_from_slice(local);
            let mut contribution = vec![0u64; global.len()];
            for p in 1..self.size {
                bytes_to_u64s(&self.recv_from(p), &mut contribution);
                for (sum, value) in global.iter_mut().zip(&contribution) {
                    *sum += value;
                }
            }
            for p in 1..self.size {
                self.send_to(p, u64s_to_bytes(global));
            }
        } else {
            self.send_to(0, u64s_to_bytes(local));
            bytes_to_u64s(&self.recv_from(0), global);
        }
    }

    fn all_gather_u64(&self, local: &[u64], global: &mut [u64]) {
        let len = local.len();
        if self.rank == 0 {
            global[..len].copy_from_slice(local);
            for p in 1..self.size {
                let at = p as usize * len;
                bytes_to_u64s(&self.recv_from(p), &mut global[at..at + len]);
            }
            for p in 1..self.size {
                self.send_to(p, u64s_to_bytes(global));
            }
        } else {
            self.send_to(0, u64s_to_bytes(local));
            bytes_to_u64s(&self.recv_from(0), global);
        }
    }

    fn all_gather_i64(&self, local: &[i64], global: &mut [i64]) {
        let len = local.len();
        if self.rank == 0 {
            global[..len].copy_from_slice(local);
            for p in 1..self.size {
                let at = p as usize * len;
                bytes_to_i64s(&self.recv_from(p), &mut global[at..at + len]);
            }
            for p in 1..self.size {
                self.send_to(p, i64s_to_bytes(global));
            }
        } else {
            self.send_to(0, i64s_to_bytes(local));
            bytes_to_i64s(&self.recv_from(0), global);
        }
    }

    fn all_to_all_bytes(&self, send: Vec<Vec<u8>>, recv_sizes: &[usize]) -> Vec<Vec<u8>> {
        let mut send = send;

        // Sends never block, so push everything out before draining.
        for p in 0..self.size {
            if p != self.rank {
                self.send_to(p, std::mem::take(&mut send[p as usize]));
            }
        }

        let mut recv = Vec::with_capacity(self.size as usize);
        for p in 0..self.size {
            if p == self.rank {
                recv.push(std::mem::take(&mut send[p as usize]));
            } else {
                let bytes = self.recv_from(p);
                debug_assert_eq!(bytes.len(), recv_sizes[p as usize]);
                recv.push(bytes);
            }
        }
        recv
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn run_group<R, F>(n: usize, f: F) -> Vec<R>
    where
        R: Send + 'static,
        F: Fn(InprocComm) -> R + Clone + Send + 'static,
    {
        let handles: Vec<_> = create_comms(n)
            .into_iter()
            .map(|comm| {
                let f = f.clone();
                thread::spawn(move || f(comm))
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    }

    #[test]
    fn test_create_comms_ids() {
        let comms = create_comms(3);
        assert_eq!(comms.len(), 3);
        for (i, comm) in comms.iter().enumerate() {
            assert_eq!(comm.rank(), i as Rank);
            assert_eq!(comm.size(), 3);
        }
    }

    #[test]
    fn test_broadcast() {
        let results = run_group(4, |comm| {
            let mut buf = if comm.rank() == 0 { [10u64, 20] } else { [0u64, 0] };
            comm.broadcast_u64(&mut buf, 0);
            buf
        });
        for buf in results {
            assert_eq!(buf, [10, 20]);
        }
    }

    #[test]
    fn test_broadcast_nonzero_root() {
        let results = run_group(3, |comm| {
            let mut buf = if comm.rank() == 2 { [7u64] } else { [0u64] };
            comm.broadcast_u64(&mut buf, 2);
            buf
        });
        for buf in results {
            assert_eq!(buf, [7]);
        }
    }

    #[test]
    fn test_all_reduce_sum() {
        let results = run_group(4, |comm| {
            let local = [comm.rank() as u64, 1];
            let mut global = [0u64; 2];
            comm.all_reduce_sum_u64(&local, &mut global);
            global
        });
        for global in results {
            assert_eq!(global, [6, 4]);
        }
    }

    #[test]
    fn test_all_gather() {
        let results = run_group(3, |comm| {
            let local = [comm.rank() as u64 * 10];
            let mut global = [0u64; 3];
            comm.all_gather_u64(&local, &mut global);

            let signed = [-(comm.rank() as i64)];
            let mut signed_global = [0i64; 3];
            comm.all_gather_i64(&signed, &mut signed_global);
            (global, signed_global)
        });
        for (global, signed_global) in results {
            assert_eq!(global, [0, 10, 20]);
            assert_eq!(signed_global, [0, -1, -2]);
        }
    }

    #[test]
    fn test_all_to_all() {
        let results = run_group(3, |comm| {
            // Rank r sends one byte `10 * r + p` to each rank p, itself
            // included.
            let rank = comm.rank() as u8;
            let send: Vec<Vec<u8>> = (0..3).map(|p| vec![10 * rank + p]).collect();
            comm.all_to_all_bytes(send, &[1, 1, 1])
        });
        for (r, recv) in results.into_iter().enumerate() {
            let expected: Vec<Vec<u8>> = (0..3u8).map(|p| vec![10 * p + r as u8]).collect();
            assert_eq!(recv, expected);
        }
    }

    #[test]
    fn test_all_to_all_uneven_sizes() {
        let results = run_group(2, |comm| {
            if comm.rank() == 0 {
                comm.all_to_all_bytes(vec![vec![], vec![1, 2, 3]], &[0, 9])
            } else {
                comm.all_to_all_bytes(vec![vec![9; 9], vec![]], &[3, 0])
            }
        });
        assert_eq!(results[0], vec![vec![], vec![9; 9]]);
        assert_eq!(results[1], vec![vec![1, 2, 3], vec![]]);
    }
}
