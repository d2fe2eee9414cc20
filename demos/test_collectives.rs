//! Integration test for the wrapped collectives on a real MPI library.
//!
//! Exercises bcast, gather, gatherv, scatter, scatterv, allgather,
//! allgatherv, alltoall, alltoallv, reduce, allreduce, allreduce_inplace,
//! scan and exscan, with library-allocated and caller-provided buffers.
//!
//! A custom panic hook calls `std::process::abort()` to prevent MPI hangs.
//!
//! Run with: mpiexec -n 4 ./target/debug/examples/test_collectives

use mpiparams::params::{
    alloc_container_of, alloc_new, op, op_with, ops, recv_buf, recv_counts_out, root, send_buf,
    send_counts, send_recv_buf, values_on_rank_0, Commutative,
};
use mpiparams::Mpi;

fn main() {
    let mpi = Mpi::init().expect("MPI init failed");

    // Install a panic hook that aborts the process to prevent MPI deadlocks.
    // Must be installed after Mpi::init().
    std::panic::set_hook(Box::new(|info| {
        eprintln!("PANIC: {info}");
        std::process::abort();
    }));

    let world = mpi.world();
    let rank = world.rank();
    let size = world.size();

    assert!(size >= 2, "test_collectives requires at least 2 processes");

    // ========================================================================
    // Test 1: bcast of a container the non-roots cannot size
    // ========================================================================
    {
        let data = if rank == 0 {
            let mut data: Vec<f64> = (1..=10).map(f64::from).collect();
            world.bcast(send_recv_buf(&mut data)).expect("bcast failed");
            data
        } else {
            world
                .bcast(send_recv_buf(alloc_new::<Vec<f64>>()))
                .expect("bcast failed")
                .into_value()
        };
        assert_eq!(data.len(), 10, "rank {rank}: bcast length");
        for (i, &x) in data.iter().enumerate() {
            assert!((x - (i + 1) as f64).abs() < f64::EPSILON, "rank {rank}: bcast data[{i}] = {x}");
        }
        if rank == 0 {
            println!("PASS: bcast");
        }
    }

    // ========================================================================
    // Test 2: gather and gatherv
    // ========================================================================
    {
        let gathered = world
            .gather(send_buf(&[rank * 10, rank * 10 + 1][..]))
            .expect("gather failed")
            .into_value();
        if rank == 0 {
            let expected: Vec<i32> = (0..size).flat_map(|r| [r * 10, r * 10 + 1]).collect();
            assert_eq!(gathered, expected);
            println!("PASS: gather");
        } else {
            assert!(gathered.is_empty());
        }

        let mine: Vec<i32> = vec![rank; rank as usize + 1];
        let (data, rest) = world
            .gatherv((send_buf(&mine), recv_counts_out()))
            .expect("gatherv failed")
            .extract_recv_buffer();
        if rank == 0 {
            let counts = rest.into_value();
            assert_eq!(counts, (1..=size).collect::<Vec<_>>());
            let expected: Vec<i32> = (0..size).flat_map(|r| vec![r; r as usize + 1]).collect();
            assert_eq!(data, expected);
            println!("PASS: gatherv");
        }
    }

    // ========================================================================
    // Test 3: scatter and scatterv
    // ========================================================================
    {
        let block = if rank == 0 {
            let all: Vec<u32> = (0..size as u32 * 3).collect();
            world.scatter(send_buf(&all)).expect("scatter failed").into_value()
        } else {
            world
                .scatter(recv_buf(alloc_container_of::<u32>()))
                .expect("scatter failed")
                .into_value()
        };
        let base = rank as u32 * 3;
        assert_eq!(block, vec![base, base + 1, base + 2], "rank {rank}: scatter");

        let part = if rank == 0 {
            let counts: Vec<i32> = (0..size).map(|r| r + 1).collect();
            let total: i32 = counts.iter().sum();
            let all: Vec<i32> = (0..total).collect();
            world
                .scatterv((send_buf(&all), send_counts(counts)))
                .expect("scatterv failed")
                .into_value()
        } else {
            world
                .scatterv(recv_buf(alloc_container_of::<i32>()))
                .expect("scatterv failed")
                .into_value()
        };
        let start = rank * (rank + 1) / 2;
        assert_eq!(part, (start..start + rank + 1).collect::<Vec<_>>(), "rank {rank}: scatterv");
        if rank == 0 {
            println!("PASS: scatter, scatterv");
        }
    }

    // ========================================================================
    // Test 4: allgather, allgatherv, alltoall, alltoallv
    // ========================================================================
    {
        let all = world.allgather(send_buf(rank)).expect("allgather failed").into_value();
        assert_eq!(all, (0..size).collect::<Vec<_>>());

        let mine = vec![rank as i64; rank as usize];
        let all = world.allgatherv(send_buf(&mine)).expect("allgatherv failed").into_value();
        let expected: Vec<i64> = (0..size).flat_map(|r| vec![r as i64; r as usize]).collect();
        assert_eq!(all, expected);

        let outgoing: Vec<i32> = (0..size).map(|dest| rank * 100 + dest).collect();
        let incoming = world.alltoall(send_buf(&outgoing)).expect("alltoall failed").into_value();
        assert_eq!(incoming, (0..size).map(|src| src * 100 + rank).collect::<Vec<_>>());

        // Rank r sends r + 1 copies of itself to everyone
        let counts = vec![rank + 1; size as usize];
        let outgoing = vec![rank; ((rank + 1) * size) as usize];
        let (incoming, rest) = world
            .alltoallv((send_buf(&outgoing), send_counts(counts), recv_counts_out()))
            .expect("alltoallv failed")
            .extract_recv_buffer();
        assert_eq!(rest.into_value(), (1..=size).collect::<Vec<_>>());
        assert_eq!(incoming, (0..size).flat_map(|r| vec![r; r as usize + 1]).collect::<Vec<_>>());
        if rank == 0 {
            println!("PASS: allgather, allgatherv, alltoall, alltoallv");
        }
    }

    // ========================================================================
    // Test 5: reductions
    // ========================================================================
    {
        let sums = world
            .reduce((send_buf(&[rank, rank + 1, rank + 2][..]), op(ops::Plus), root(size - 1)))
            .expect("reduce failed")
            .into_value();
        if rank == size - 1 {
            let base = size * (size - 1) / 2;
            assert_eq!(sums, vec![base, size + base, 2 * size + base]);
        }

        let max = world
            .allreduce((send_buf(rank as f64), op(ops::Max)))
            .expect("allreduce failed")
            .into_value();
        assert_eq!(max, vec![(size - 1) as f64]);

        // User operator: element-wise maximum
        let best = world
            .allreduce((
                send_buf(&[rank % 2, rank][..]),
                op_with(|a: &i32, b: &i32| (*a).max(*b), Commutative),
            ))
            .expect("allreduce with user operator failed")
            .into_value();
        assert_eq!(best, vec![i32::from(size > 1), size - 1]);

        let mut values = vec![1u64, rank as u64];
        world
            .allreduce_inplace((send_recv_buf(&mut values), op(ops::Plus)))
            .expect("allreduce_inplace failed");
        assert_eq!(values, vec![size as u64, (size * (size - 1) / 2) as u64]);
        if rank == 0 {
            println!("PASS: reduce, allreduce, allreduce_inplace");
        }
    }

    // ========================================================================
    // Test 6: scan and exscan
    // ========================================================================
    {
        let inclusive = world
            .scan((send_buf(rank + 1), op(ops::Plus)))
            .expect("scan failed")
            .into_value();
        assert_eq!(inclusive, vec![(rank + 1) * (rank + 2) / 2]);

        let exclusive = world
            .exscan((send_buf(rank + 1), op(ops::Plus)))
            .expect("exscan failed")
            .into_value();
        assert_eq!(exclusive, vec![rank * (rank + 1) / 2]);

        let exclusive = world
            .exscan((send_buf(rank + 1), op(ops::Multiplies), values_on_rank_0(-1)))
            .expect("exscan with values_on_rank_0 failed")
            .into_value();
        let expected = if rank == 0 { -1 } else { (1..=rank).product() };
        assert_eq!(exclusive, vec![expected]);
        if rank == 0 {
            println!("PASS: scan, exscan");
        }
    }

    world.barrier().expect("barrier failed");
    if rank == 0 {
        println!("\n========================================");
        println!("All collective tests passed!");
        println!("========================================");
    }
}
