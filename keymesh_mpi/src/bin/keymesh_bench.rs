//! Distributed key index smoke benchmark over MPI.
//!
//! Every rank generates a batch of fresh keys per round, queries the
//! sharing information back, and releases half of the batch again.
//!
//! ```text
//! mpirun -n 4 keymesh_bench --keys-per-rank 1000 --rounds 10
//! ```

use std::time::Instant;

use clap::Parser;
use mpi::topology::Communicator;

use keymesh::{KeyIndex, KeySpan};
use keymesh_mpi::MpiComm;

#[derive(Parser, Debug)]
#[command(name = "keymesh_bench")]
#[command(about = "Distributed key index smoke benchmark over MPI")]
struct Cli {
    /// Keys generated per rank per round
    #[arg(short = 'k', long, default_value = "1000")]
    keys_per_rank: usize,

    /// Number of generate/query/release rounds
    #[arg(short = 'r', long, default_value = "10")]
    rounds: usize,

    /// Highest key of the span
    #[arg(long, default_value = "1073741824")]
    span_last: u64,
}

fn main() {
    let cli = Cli::parse();

    let universe = mpi::initialize().expect("Failed to initialize MPI");
    let world = universe.world();
    let rank = world.rank();
    let size = world.size();

    let mut index = KeyIndex::new(MpiComm::new(&world), &[KeySpan::new(0, cli.span_last)])
        .expect("Failed to build index");

    let start = Instant::now();
    let mut generated = 0usize;

    for round in 0..cli.rounds {
        let keys = index
            .generate_new_keys(&[cli.keys_per_rank])
            .expect("generate_new_keys failed")
            .remove(0);
        generated += keys.len();

        let shares = index.query_keys(&keys);
        assert_eq!(shares.len(), keys.len(), "every fresh key has one user");

        // Release the first half of the batch; the next round hands the
        // freed keys out again.
        index
            .update_keys(&[], &keys[..keys.len() / 2])
            .expect("update_keys failed");

        if rank == 0 {
            println!(
                "round {:3}: {} keys per rank, {} usage records on rank 0",
                round,
                keys.len(),
                index.key_usage().len()
            );
        }
    }

    let elapsed = start.elapsed();
    println!(
        "rank {}: generated {} keys in {:.3} s",
        rank,
        generated,
        elapsed.as_secs_f64()
    );
    if rank == 0 {
        println!(
            "{} ranks, {:.6} s per round average",
            size,
            elapsed.as_secs_f64() / cli.rounds as f64
        );
    }
}
