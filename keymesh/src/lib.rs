//! keymesh - Distributed sparse key index over collective communication.
//!
//! A `KeyIndex` is replicated across a group of cooperating ranks. It
//! answers "which ranks currently use key K?", allocates fresh globally
//! unique 64-bit keys from declared spans without a central allocator, and
//! applies batched insert/remove of key-to-rank associations. Every public
//! operation is a collective: all ranks enter it together and either all
//! succeed with the same resulting state or all observe the same error.
//!
//! Ownership of a key is a pure function of the key and the group size:
//! keys are grouped into 4096-wide chunks and chunks are dealt round-robin
//! to ranks (`(key >> 12) % size`). The owning rank holds the
//! authoritative usage records for its keys; everything else is routed to
//! it through a sized two-phase exchange.
//!
//! ## Usage
//!
//! ```
//! use keymesh::{KeyIndex, KeySpan, SelfComm};
//!
//! # fn main() -> keymesh::Result<()> {
//! // SelfComm is the single-rank group; swap in an MPI- or thread-backed
//! // communicator for a real run.
//! let mut index = KeyIndex::new(SelfComm, &[KeySpan::new(0, 9_999)])?;
//!
//! let fresh = index.generate_new_keys(&[4])?;
//! assert_eq!(fresh[0], vec![0, 1, 2, 3]);
//!
//! index.update_keys(&[100], &[])?;
//! assert_eq!(index.query_keys(&[100]).len(), 1);
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - [`span`]: key spans and the chunked key-to-rank partition
//! - [`store`]: the sorted `(key, rank)` usage records
//! - [`comm`]: the [`Collective`] communication facade
//! - [`exchange`]: sized two-phase all-to-all buffers
//! - [`index`]: the [`KeyIndex`] itself
//!
//! Transport realizations live in sibling crates: `keymesh_inproc` runs a
//! group of ranks as threads wired by channels, `keymesh_mpi` runs over an
//! MPI communicator.

pub mod comm;
pub mod error;
pub mod exchange;
pub mod index;
pub mod span;
pub mod store;

pub use comm::{Collective, SelfComm};
pub use error::{Error, Result};
pub use index::KeyIndex;
pub use span::{KeySpan, CHUNK_BITS, CHUNK_SIZE};
pub use store::KeyRank;

/// Identifier for a domain entity.
pub type Key = u64;

/// Identifier for a rank in the group. Non-negative; `-1` is reserved by
/// the store as an erase marker.
pub type Rank = i32;
