//! Integration test for nonblocking point-to-point operations and request
//! pools on a real MPI library.
//!
//! Exercises isend/irecv with owned requests, pooled requests with
//! wait_all/wait_any, probe/iprobe, synchronous sends and the serialized
//! transfer of a `serde` value.
//!
//! Run with: mpiexec -n 4 ./target/debug/examples/test_requests

use mpiparams::params::{
    alloc_container_of, as_deserializable, as_serialized, destination, recv_buf, recv_count_out,
    request, send_buf, send_mode, source, status_out, statuses_out, tag,
};
use mpiparams::transport::SendMode;
use mpiparams::Mpi;
use std::collections::BTreeMap;

fn main() {
    let mpi = Mpi::init().expect("MPI init failed");

    std::panic::set_hook(Box::new(|info| {
        eprintln!("PANIC: {info}");
        std::process::abort();
    }));

    let world = mpi.world();
    let rank = world.rank();
    let size = world.size();

    assert!(size >= 2, "test_requests requires at least 2 processes, got {size}");

    let next = (rank + 1) % size;
    let prev = (rank + size - 1) % size;

    // ========================================================================
    // Test 1: isend / irecv ring with owned requests
    // ========================================================================
    {
        let send_data = vec![f64::from(rank) * 10.0 + 1.0, f64::from(rank) * 10.0 + 2.0];
        let mut recv_data = vec![0.0f64; 2];

        // Post the receive first, then the send
        let recv_req = world
            .irecv((recv_buf(&mut recv_data), source(prev), tag(100)))
            .expect("irecv failed");
        let send_req = world
            .isend((send_buf(&send_data), destination(next), tag(100)))
            .expect("isend failed");

        send_req.wait().expect("isend wait failed");
        recv_req.wait().expect("irecv wait failed");

        let expected = vec![f64::from(prev) * 10.0 + 1.0, f64::from(prev) * 10.0 + 2.0];
        assert_eq!(recv_data, expected, "rank {rank}: ring data mismatch");
        if rank == 0 {
            println!("PASS: isend/irecv ring");
        }
    }

    world.barrier().expect("barrier 1 failed");

    // ========================================================================
    // Test 2: pooled requests
    // ========================================================================
    {
        let pool = world.request_pool();
        for i in 0..3 {
            // Dropping the result parks the owned send buffer in the pool
            let _ = world
                .isend((
                    send_buf(vec![rank * 100 + i; 4]),
                    destination(next),
                    tag(200 + i),
                    request(pool.get_request()),
                ))
                .expect("pooled isend failed");
        }

        for i in 0..3 {
            let (data, rest) = world
                .recv((recv_buf(alloc_container_of::<i32>()), source(prev), tag(200 + i), recv_count_out()))
                .expect("recv failed")
                .extract_recv_buffer();
            assert_eq!(rest.into_value(), 4);
            assert_eq!(data, vec![prev * 100 + i; 4], "rank {rank}: pooled message {i}");
        }

        let statuses = pool.wait_all_with(statuses_out()).expect("wait_all failed");
        assert_eq!(statuses.len(), 3);
        assert_eq!(pool.active(), 0);
        assert_eq!(pool.wait_any().expect("wait_any failed"), None);
        if rank == 0 {
            println!("PASS: request pool");
        }
    }

    world.barrier().expect("barrier 2 failed");

    // ========================================================================
    // Test 3: probe / iprobe and synchronous sends
    // ========================================================================
    {
        if rank == 0 {
            world
                .send((
                    send_buf(&[1u16, 2, 3, 4, 5][..]),
                    destination(1),
                    tag(7),
                    send_mode(SendMode::Synchronous),
                ))
                .expect("ssend failed");
        } else if rank == 1 {
            let status = world.probe((source(0), tag(7))).expect("probe failed");
            assert_eq!(status.count::<u16>(), 5);
            assert!(world.iprobe(tag(7)).expect("iprobe failed").is_some());
            let (data, rest) = world
                .recv((recv_buf(alloc_container_of::<u16>()), source(0), status_out()))
                .expect("recv failed")
                .extract_recv_buffer();
            assert_eq!(data, vec![1, 2, 3, 4, 5]);
            assert_eq!(rest.into_value().tag, 7);
            assert!(world.iprobe(tag(7)).expect("iprobe failed").is_none());
            println!("PASS: probe, iprobe, synchronous send");
        }
    }

    world.barrier().expect("barrier 3 failed");

    // ========================================================================
    // Test 4: serialized values
    // ========================================================================
    {
        let expected = BTreeMap::from([
            ("rank".to_string(), "0".to_string()),
            ("size".to_string(), size.to_string()),
        ]);
        if rank == 0 {
            let encoded = as_serialized(&expected).expect("serialization failed");
            for dest in 1..size {
                world
                    .send((send_buf(&encoded), destination(dest)))
                    .expect("send of serialized value failed");
            }
        } else {
            let received = world
                .recv((recv_buf(as_deserializable::<BTreeMap<String, String>>()), source(0)))
                .expect("recv of serialized value failed")
                .into_value()
                .deserialize()
                .expect("deserialization failed");
            assert_eq!(received, expected, "rank {rank}: serialized map mismatch");
        }
        if rank == 0 {
            println!("PASS: serialized transfer");
        }
    }

    world.barrier().expect("final barrier failed");
    if rank == 0 {
        println!("\nAll request tests passed!");
    }
}
