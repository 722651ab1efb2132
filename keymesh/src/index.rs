//! The distributed sparse key index.

use crate::comm::Collective;
use crate::error::{Error, Result};
use crate::exchange::Exchange;
use crate::span::{self, KeySpan, CHUNK_SIZE};
use crate::store::{self, KeyRank};
use crate::{Key, Rank};

/// A key index replicated across a group of ranks.
///
/// Each key belongs to exactly one owning rank, computed from the key
/// alone; the owner holds the authoritative `(key, rank)` usage records
/// for it. All public operations are collectives: every rank of the group
/// must call them in the same order. On any input error, every rank
/// returns an error from the same call and the local state is left
/// exactly as it was.
///
/// Dropping the index is purely local; transports that require symmetric
/// teardown (as MPI does) leave that to the caller.
pub struct KeyIndex<C: Collective> {
    comm: C,
    rank: Rank,
    size: Rank,
    spans: Vec<KeySpan>,
    chunk_first: Vec<u64>,
    key_usage: Vec<KeyRank>,
}

impl<C: Collective> KeyIndex<C> {
    /// Create the index over `comm`. Collective.
    ///
    /// Rank 0's `partition_bounds` is authoritative and is replicated to
    /// the group; the lists passed on other ranks are ignored. An empty
    /// list synthesizes a single span covering the whole key range. If the
    /// root's list is invalid every rank returns [`Error::InvalidSpans`].
    pub fn new(comm: C, partition_bounds: &[KeySpan]) -> Result<Self> {
        let rank = comm.rank();
        let size = comm.size();

        let mut header = [
            partition_bounds.len() as u64,
            !span::spans_are_valid(partition_bounds) as u64,
        ];
        comm.broadcast_u64(&mut header, 0);
        let span_count = header[0] as usize;

        let mut flat = vec![0u64; span_count * 2];
        if rank == 0 {
            for (i, span) in partition_bounds.iter().enumerate() {
                flat[i * 2] = span.first;
                flat[i * 2 + 1] = span.last;
            }
        }
        if span_count > 0 {
            comm.broadcast_u64(&mut flat, 0);
        }

        if header[1] != 0 {
            return Err(Error::InvalidSpans);
        }

        let mut spans: Vec<KeySpan> = flat
            .chunks_exact(2)
            .map(|pair| KeySpan::new(pair[0], pair[1]))
            .collect();
        if spans.is_empty() {
            spans.push(KeySpan::full());
        }

        let chunk_first = spans
            .iter()
            .map(|span| span::first_owned_chunk(span.first, rank, size))
            .collect();

        Ok(Self {
            comm,
            rank,
            size,
            spans,
            chunk_first,
            key_usage: Vec::new(),
        })
    }

    /// This rank's id.
    #[inline]
    pub fn rank(&self) -> Rank {
        self.rank
    }

    /// Number of ranks in the group.
    #[inline]
    pub fn size(&self) -> Rank {
        self.size
    }

    /// The replicated span list.
    #[inline]
    pub fn spans(&self) -> &[KeySpan] {
        &self.spans
    }

    /// This rank's usage records, sorted and duplicate-free.
    #[inline]
    pub fn key_usage(&self) -> &[KeyRank] {
        &self.key_usage
    }

    /// The rank that owns `key`.
    #[inline]
    pub fn owner_of(&self, key: Key) -> Rank {
        span::owner_of(key, self.size)
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    /// Full sharing information for every key this rank uses. Collective.
    pub fn query_all(&self) -> Vec<KeyRank> {
        self.query_to(&self.key_usage)
    }

    /// Sharing information for `keys`. Collective.
    ///
    /// Each key is routed to its owner; the owner answers with every
    /// `(key, rank)` record it holds. Keys absent from the index (or
    /// outside every span) simply contribute nothing. The result is
    /// sorted and duplicate-free, identical for identical inputs on every
    /// rank.
    pub fn query_keys(&self, keys: &[Key]) -> Vec<KeyRank> {
        let mut all = Exchange::new(&self.comm);
        for &key in keys {
            all.send(self.owner_of(key)).skip_u64(1);
        }
        all.allocate(false);
        for &key in keys {
            all.send(self.owner_of(key)).pack_u64(key);
        }
        let mut recv = all.communicate();

        // Reconstruct (key, requester) pairs on the owning side; duplicate
        // lookups must not produce duplicate answers.
        let mut request = Vec::new();
        for (p, buf) in recv.iter_mut().enumerate() {
            while buf.remaining() > 0 {
                request.push(KeyRank::new(buf.take_u64(), p as Rank));
            }
        }
        store::sort_unique(&mut request);

        self.query_to(&request)
    }

    /// For every `(key, target)` in `request`, ship all records the owner
    /// of `key` holds to rank `target`; return what this rank was shipped.
    /// Collective.
    ///
    /// This is the primitive the other query forms are built on.
    pub fn query_to(&self, request: &[KeyRank]) -> Vec<KeyRank> {
        let mut request = request.to_vec();
        store::sort_unique(&mut request);

        let mut all = Exchange::new(&self.comm);
        self.pack_sharing(&request, &mut all, false);
        all.allocate(false);
        self.pack_sharing(&request, &mut all, true);
        let mut recv = all.communicate();

        let mut sharing = Vec::new();
        for buf in &mut recv {
            while buf.remaining() > 0 {
                let key = buf.take_u64();
                let rank = buf.take_u64() as Rank;
                sharing.push(KeyRank::new(key, rank));
            }
        }
        store::sort_unique(&mut sharing);
        sharing
    }

    /// Merge walk of the sorted request against the sorted usage records.
    /// Runs twice per query: sizing then packing, identical layouts.
    fn pack_sharing(&self, request: &[KeyRank], all: &mut Exchange<'_, C>, packing: bool) {
        let usage = &self.key_usage;
        let mut i = 0;
        for kr in request {
            while i < usage.len() && usage[i].key < kr.key {
                i += 1;
            }
            let mut j = i;
            while j < usage.len() && usage[j].key == kr.key {
                let buf = all.send(kr.rank);
                if packing {
                    buf.pack_u64(usage[j].key);
                    buf.pack_u64(usage[j].rank as u64);
                } else {
                    buf.skip_u64(2);
                }
                j += 1;
            }
        }
    }

    // ------------------------------------------------------------------
    // Updates
    // ------------------------------------------------------------------

    /// Insert and remove `(key, this rank)` associations. Collective.
    ///
    /// Adds must lie inside a span; violations are counted locally, merged
    /// globally, and reported on every rank before anything is sent or
    /// applied ([`Error::KeysOutsideSpans`] where the violation happened,
    /// [`Error::PeerBadInput`] elsewhere). Removing an association that
    /// does not exist is silently ignored; re-adding an existing one is
    /// deduplicated, so the call is idempotent.
    pub fn update_keys(
        &mut self,
        add_new_keys: &[Key],
        remove_existing_keys: &[Key],
    ) -> Result<()> {
        let size = self.size as usize;
        let mut count_remove = vec![0u64; size];
        let mut count_add = vec![0u64; size];

        for &key in remove_existing_keys {
            let p = self.owner_of(key);
            if p != self.rank {
                count_remove[p as usize] += 1;
            }
        }

        let mut local_bad = 0usize;
        for &key in add_new_keys {
            if !self.spans.iter().any(|span| span.contains(key)) {
                local_bad += 1;
            }
            let p = self.owner_of(key);
            if p != self.rank {
                count_add[p as usize] += 1;
            }
        }

        let mut all = Exchange::new(&self.comm);

        // Sizing: one remove-count word, the remove keys, the add keys.
        // A rank that already knows it will fail sends nothing.
        if local_bad == 0 {
            for p in 0..size {
                if count_remove[p] > 0 || count_add[p] > 0 {
                    let buf = all.send(p as Rank);
                    buf.skip_u64(1);
                    buf.skip_u64(count_remove[p] as usize);
                    buf.skip_u64(count_add[p] as usize);
                }
            }
        }

        if all.allocate(local_bad > 0) {
            return Err(if local_bad > 0 {
                Error::KeysOutsideSpans {
                    bad: local_bad,
                    total: add_new_keys.len(),
                }
            } else {
                Error::PeerBadInput
            });
        }

        // Packing, same walk as sizing.
        for p in 0..size {
            if count_remove[p] > 0 || count_add[p] > 0 {
                all.send(p as Rank).pack_u64(count_remove[p]);
            }
        }
        for &key in remove_existing_keys {
            let p = self.owner_of(key);
            if p != self.rank {
                all.send(p).pack_u64(key);
            }
        }
        for &key in add_new_keys {
            let p = self.owner_of(key);
            if p != self.rank {
                all.send(p).pack_u64(key);
            }
        }

        let mut recv = all.communicate();

        // Mark removes for keys this rank owns, then removes received
        // from peers, then compact once.
        for &key in remove_existing_keys {
            if self.owner_of(key) == self.rank {
                store::mark_removed(&mut self.key_usage, KeyRank::new(key, self.rank));
            }
        }
        for (p, buf) in recv.iter_mut().enumerate() {
            if buf.remaining() > 0 {
                let remove_count = buf.take_u64();
                for _ in 0..remove_count {
                    let key = buf.take_u64();
                    store::mark_removed(&mut self.key_usage, KeyRank::new(key, p as Rank));
                }
            }
        }
        store::sweep_removed(&mut self.key_usage);

        // Append adds for keys this rank owns, then the remainder of each
        // peer message.
        for &key in add_new_keys {
            if self.owner_of(key) == self.rank {
                self.key_usage.push(KeyRank::new(key, self.rank));
            }
        }
        for (p, buf) in recv.iter_mut().enumerate() {
            while buf.remaining() > 0 {
                self.key_usage.push(KeyRank::new(buf.take_u64(), p as Rank));
            }
        }

        store::sort_unique(&mut self.key_usage);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Key generation
    // ------------------------------------------------------------------

    /// Draw `requests[i]` fresh, globally unique keys from span `i` for
    /// this rank. Collective.
    ///
    /// Returns one vector per span. Across the whole group every returned
    /// key is distinct, lies in its span, and the union densely packs the
    /// lowest free keys of each span. Errors ([`Error::RequestCountMismatch`],
    /// [`Error::SpanExhausted`], [`Error::PeerBadInput`]) are raised on
    /// every rank with the state untouched.
    pub fn generate_new_keys(&mut self, requests: &[usize]) -> Result<Vec<Vec<Key>>> {
        let span_count = self.spans.len();

        let (existing_global, requests_global) = self.generate_global_counts(requests)?;

        // All inputs are good and parallel consistent from here on.
        let (new_request, mut new_keys, contrib_keys) =
            self.generate_local_plan(&existing_global, &requests_global, requests);

        let my_donations = self.generate_donation_plan(&new_request);

        // Record the kept keys, then the donated keys in the exact order
        // the transport will ship them, consuming `contrib_keys` linearly.
        for &key in &new_keys {
            self.key_usage.push(KeyRank::new(key, self.rank));
        }
        {
            let mut n = 0;
            for i in 0..span_count {
                for p in 0..self.size as usize {
                    let n_to_p = my_donations[p * span_count + i] as usize;
                    for _ in 0..n_to_p {
                        self.key_usage.push(KeyRank::new(contrib_keys[n], p as Rank));
                        n += 1;
                    }
                }
            }
        }
        self.key_usage.sort_unstable();

        // Ship donated keys to their recipients.
        let mut all = Exchange::new(&self.comm);
        for i in 0..span_count {
            for p in 0..self.size as usize {
                let n_to_p = my_donations[p * span_count + i] as usize;
                if n_to_p > 0 {
                    all.send(p as Rank).skip_u64(n_to_p);
                }
            }
        }
        all.allocate(false);
        {
            let mut n = 0;
            for i in 0..span_count {
                for p in 0..self.size as usize {
                    let n_to_p = my_donations[p * span_count + i] as usize;
                    if n_to_p > 0 {
                        let buf = all.send(p as Rank);
                        for _ in 0..n_to_p {
                            buf.pack_u64(contrib_keys[n]);
                            n += 1;
                        }
                    }
                }
            }
        }
        let mut recv = all.communicate();
        for buf in &mut recv {
            while buf.remaining() > 0 {
                new_keys.push(buf.take_u64());
            }
        }
        new_keys.sort_unstable();

        // Spans are disjoint and increasing, so splitting the sorted keys
        // by per-span request counts lands each slice in its span.
        let mut requested_keys = Vec::with_capacity(span_count);
        let mut n = 0;
        for &count in requests {
            requested_keys.push(new_keys[n..n + count].to_vec());
            n += count;
        }
        Ok(requested_keys)
    }

    /// Merge three reductions into one collective: per-span counts of used
    /// keys, per-span totals of requested keys, and the input error flag.
    fn generate_global_counts(&self, requests: &[usize]) -> Result<(Vec<u64>, Vec<u64>)> {
        let span_count = self.spans.len();
        let mut local = vec![0u64; 2 * span_count + 1];

        // Distinct keys per span, not records: a shared key counts once.
        let mut cursor = 0;
        for i in 0..span_count {
            local[i] =
                store::count_distinct_through(&self.key_usage, &mut cursor, self.spans[i].last);
        }
        for i in 0..span_count {
            local[span_count + i] = if i < requests.len() { requests[i] as u64 } else { 0 };
        }
        local[2 * span_count] = (requests.len() != span_count) as u64;

        let mut global = vec![0u64; 2 * span_count + 1];
        self.comm.all_reduce_sum_u64(&local, &mut global);

        if global[2 * span_count] != 0 {
            return Err(if requests.len() != span_count {
                Error::RequestCountMismatch {
                    got: requests.len(),
                    expected: span_count,
                }
            } else {
                Error::PeerBadInput
            });
        }

        for i in 0..span_count {
            let available = self.spans[i].capacity() - global[i];
            let requested = global[span_count + i];
            if available < requested {
                return Err(Error::SpanExhausted {
                    span: i,
                    requested,
                    available,
                });
            }
        }

        Ok((
            global[..span_count].to_vec(),
            global[span_count..2 * span_count].to_vec(),
        ))
    }

    /// Walk this rank's owned chunks and collect free keys.
    ///
    /// The walk is bounded by the highest key the whole group will need
    /// (existing plus requested), which is what packs the address space
    /// densely. The rank keeps up to `requests[i]` keys from the tail of
    /// its own span contribution; `new_request[i]` is positive when it
    /// still needs keys from a donor and negative when it has extras to
    /// donate.
    fn generate_local_plan(
        &self,
        existing_global: &[u64],
        requests_global: &[u64],
        requests: &[usize],
    ) -> (Vec<i64>, Vec<Key>, Vec<Key>) {
        let span_count = self.spans.len();
        let mut new_request = vec![0i64; span_count];
        let mut new_keys: Vec<Key> = Vec::new();
        let mut contrib_keys: Vec<Key> = Vec::new();

        let usage = &self.key_usage;
        let stride = self.size as u64 * CHUNK_SIZE;
        let mut j = 0;

        for i in 0..span_count {
            let span = self.spans[i];
            let final_key_count = existing_global[i] + requests_global[i];
            let init_len = contrib_keys.len();

            if final_key_count > 0 {
                let key_global_max = span.first + (final_key_count - 1);

                let mut key_begin = self.chunk_first[i]
                    .checked_mul(CHUNK_SIZE)
                    .and_then(|offset| span.first.checked_add(offset));

                while let Some(begin) = key_begin {
                    if begin > key_global_max {
                        break;
                    }
                    let key_last = begin.saturating_add(CHUNK_SIZE - 1).min(key_global_max);

                    // Jump to the first record that could collide.
                    j += store::lower_bound_key(&usage[j..], begin);

                    for key_iter in begin..=key_last {
                        if j < usage.len() && usage[j].key == key_iter {
                            while j < usage.len() && usage[j].key == key_iter {
                                j += 1;
                            }
                        } else {
                            contrib_keys.push(key_iter);
                        }
                    }

                    key_begin = begin.checked_add(stride);
                }
            }

            // Keep what this rank can use itself; donating keys it would
            // immediately request back only adds transport load.
            let this_contrib = contrib_keys.len() - init_len;
            let keep = requests[i].min(this_contrib);
            new_keys.extend_from_slice(&contrib_keys[contrib_keys.len() - keep..]);
            contrib_keys.truncate(contrib_keys.len() - keep);

            new_request[i] = requests[i] as i64 - this_contrib as i64;
        }

        (new_request, new_keys, contrib_keys)
    }

    /// Match donors to receivers per span.
    ///
    /// Every rank gathers the same request table and computes the same
    /// prefix-sum assignment, so donor and receiver agree without further
    /// communication. Returns donation counts indexed `[p * span_count + i]`.
    fn generate_donation_plan(&self, new_request: &[i64]) -> Vec<i64> {
        let size = self.size as usize;
        let span_count = self.spans.len();

        let mut global = vec![0i64; size * span_count];
        self.comm.all_gather_i64(new_request, &mut global);

        let mut my_donations = vec![0i64; size * span_count];

        for i in 0..span_count {
            if new_request[i] >= 0 {
                continue;
            }
            let mut my_donate = -new_request[i];

            // Keys donated by lower ranks come first in the global order.
            let mut previous_donate: i64 = (0..self.rank as usize)
                .map(|p| global[p * span_count + i])
                .filter(|&r| r < 0)
                .map(|r| -r)
                .sum();
            let end_donate = previous_donate + my_donate;

            let mut previous_receive = 0i64;
            for p in 0..size {
                if my_donate == 0 {
                    break;
                }
                let request_p = global[p * span_count + i];
                if request_p > 0 {
                    previous_receive += request_p;
                    if previous_donate < previous_receive {
                        let n = previous_receive.min(end_donate) - previous_donate;
                        my_donations[p * span_count + i] = n;
                        previous_donate += n;
                        my_donate -= n;
                    }
                }
            }
        }

        my_donations
    }
}
