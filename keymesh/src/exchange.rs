//! Sized two-phase all-to-all buffers.
//!
//! Send sizes are computed by walking the source data, so an [`Exchange`]
//! runs in two passes over the same walk: a sizing pass that reserves
//! bytes per destination, then - after [`Exchange::allocate`] has agreed
//! sizes across the group - a packing pass that must write exactly the
//! bytes it reserved. The allocation step carries each rank's error flag
//! in the same size row, so input validation becomes parallel-consistent
//! without a second collective.
//!
//! Wire format is little-endian `u64` words throughout.

use crate::comm::Collective;
use crate::Rank;

/// Per-destination send buffer with separate sizing and packing state.
#[derive(Debug, Default)]
pub struct SendBuffer {
    reserved: usize,
    data: Vec<u8>,
}

impl SendBuffer {
    /// Sizing pass: reserve room for `count` words.
    #[inline]
    pub fn skip_u64(&mut self, count: usize) {
        self.reserved += count * 8;
    }

    /// Packing pass: append one word.
    #[inline]
    pub fn pack_u64(&mut self, value: u64) {
        self.data.extend_from_slice(&value.to_le_bytes());
    }

    /// Bytes reserved by the sizing pass.
    #[inline]
    pub fn reserved(&self) -> usize {
        self.reserved
    }
}

/// Cursor over the bytes received from one sender.
#[derive(Debug)]
pub struct RecvBuffer {
    data: Vec<u8>,
    pos: usize,
}

impl RecvBuffer {
    /// Bytes not yet consumed.
    #[inline]
    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    /// Consume one word.
    ///
    /// # Panics
    /// Panics if fewer than 8 bytes remain; the sender's sizing and
    /// packing passes agree by contract, so underrun means a protocol bug.
    #[inline]
    pub fn take_u64(&mut self) -> u64 {
        let end = self.pos + 8;
        let value = u64::from_le_bytes(self.data[self.pos..end].try_into().unwrap());
        self.pos = end;
        value
    }
}

/// One sized all-to-all over a [`Collective`] group.
///
/// Lifecycle: sizing pass via [`Exchange::send`] + [`SendBuffer::skip_u64`],
/// [`Exchange::allocate`], packing pass via [`SendBuffer::pack_u64`],
/// [`Exchange::communicate`].
pub struct Exchange<'a, C: Collective> {
    comm: &'a C,
    send: Vec<SendBuffer>,
    recv_sizes: Vec<usize>,
    allocated: bool,
}

impl<'a, C: Collective> Exchange<'a, C> {
    /// Start an exchange over `comm`.
    pub fn new(comm: &'a C) -> Self {
        let size = comm.size() as usize;
        Self {
            comm,
            send: (0..size).map(|_| SendBuffer::default()).collect(),
            recv_sizes: vec![0; size],
            allocated: false,
        }
    }

    /// The send buffer for rank `to`. Valid in both passes.
    #[inline]
    pub fn send(&mut self, to: Rank) -> &mut SendBuffer {
        &mut self.send[to as usize]
    }

    /// Agree send/receive sizes across the group and learn whether any
    /// rank flagged an error.
    ///
    /// Gathers one row per rank of `size` send byte counts plus the error
    /// flag as a trailing word, then reads this rank's receive sizes down
    /// the matching column and ORs the flags. Exactly one collective;
    /// returns the global OR so the caller can fail consistently before
    /// anything is packed or sent.
    pub fn allocate(&mut self, local_error: bool) -> bool {
        let size = self.comm.size() as usize;
        let me = self.comm.rank() as usize;
        let row_len = size + 1;

        let mut row = Vec::with_capacity(row_len);
        row.extend(self.send.iter().map(|buf| buf.reserved as u64));
        row.push(local_error as u64);

        let mut matrix = vec![0u64; row_len * size];
        self.comm.all_gather_u64(&row, &mut matrix);

        let mut flagged = false;
        for p in 0..size {
            self.recv_sizes[p] = matrix[p * row_len + me] as usize;
            flagged |= matrix[p * row_len + size] != 0;
        }

        for buf in &mut self.send {
            buf.data.reserve_exact(buf.reserved);
        }
        self.allocated = true;
        flagged
    }

    /// Run the transport and return one receive cursor per sender.
    ///
    /// The packing pass must have written exactly the bytes the sizing
    /// pass reserved for every destination.
    pub fn communicate(self) -> Vec<RecvBuffer> {
        debug_assert!(self.allocated, "communicate before allocate");
        debug_assert!(
            self.send.iter().all(|buf| buf.data.len() == buf.reserved),
            "packing pass does not match sizing pass"
        );

        let send: Vec<Vec<u8>> = self.send.into_iter().map(|buf| buf.data).collect();
        self.comm
            .all_to_all_bytes(send, &self.recv_sizes)
            .into_iter()
            .map(|data| RecvBuffer { data, pos: 0 })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::comm::SelfComm;

    #[test]
    fn test_self_roundtrip() {
        let comm = SelfComm;
        let mut xch = Exchange::new(&comm);

        xch.send(0).skip_u64(3);
        assert!(!xch.allocate(false));

        xch.send(0).pack_u64(7);
        xch.send(0).pack_u64(11);
        xch.send(0).pack_u64(u64::MAX);

        let mut recv = xch.communicate();
        assert_eq!(recv.len(), 1);
        assert_eq!(recv[0].remaining(), 24);
        assert_eq!(recv[0].take_u64(), 7);
        assert_eq!(recv[0].take_u64(), 11);
        assert_eq!(recv[0].take_u64(), u64::MAX);
        assert_eq!(recv[0].remaining(), 0);
    }

    #[test]
    fn test_error_flag_is_reported() {
        let comm = SelfComm;
        let mut xch = Exchange::new(&comm);
        assert!(xch.allocate(true));
    }

    #[test]
    fn test_empty_exchange() {
        let comm = SelfComm;
        let mut xch = Exchange::new(&comm);
        assert!(!xch.allocate(false));
        let recv = xch.communicate();
        assert_eq!(recv.len(), 1);
        assert_eq!(recv[0].remaining(), 0);
    }
}
