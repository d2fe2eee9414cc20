//! Hello World example - initialization, a broadcast and a reduction.
//!
//! Run with: mpiexec -n 4 cargo run --features mpi --example hello_params

use mpiparams::params::{alloc_new, op, ops, send_buf, send_recv_buf};
use mpiparams::{Mpi, Result};

fn main() -> Result<()> {
    // Initialize MPI
    let mpi = Mpi::init()?;
    let world = mpi.world();

    let rank = world.rank();
    let size = world.size();
    let version = mpi.version()?;
    let first_line = version.lines().next().unwrap_or_default();

    println!("Hello from rank {rank} of {size} ({first_line})");

    // The root's greeting reaches every rank; non-roots do not know its length
    let greeting = if rank == 0 {
        let mut text = b"hello, named parameters".to_vec();
        world.bcast(send_recv_buf(&mut text))?;
        text
    } else {
        world.bcast(send_recv_buf(alloc_new::<Vec<u8>>()))?.into_value()
    };
    assert_eq!(greeting, b"hello, named parameters");

    // Sum of ranks at the root
    let total = world.reduce((send_buf(rank), op(ops::Plus)))?.into_value();
    if rank == 0 {
        assert_eq!(total, vec![size * (size - 1) / 2]);
        println!("\nAll processes reported in. Test passed!");
    }

    // MPI is finalized when `mpi` is dropped
    Ok(())
}
