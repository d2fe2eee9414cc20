//! Failures surface as the documented error kinds, before any transfer.

mod common;

use common::{calls, capture, init_logging};
use mpiparams::params::{
    alloc_container_of, destination, op, ops, recv_buf, recv_count, recv_counts, root, send_buf,
    send_counts, send_type, tag, Rank, Tag,
};
use mpiparams::{local, Error};

#[test]
fn too_small_caller_buffer_fails_before_the_gather() {
    init_logging();
    local::run(1, |mpi| {
        let world = mpi.world();
        let mut out = vec![0i32; 1];
        let (result, events) = capture(|| world.gather((send_buf(&[1, 2][..]), recv_buf(&mut out))));
        let err = result.unwrap_err();
        assert!(
            matches!(err, Error::SizePolicyViolated { required: 2, actual: 1 }),
            "{err}"
        );
        assert!(calls(&events).is_empty());
        assert_eq!(out, vec![0]);
    });
}

#[test]
fn grow_only_keeps_extra_room() {
    init_logging();
    local::run(2, |mpi| {
        let world = mpi.world();
        let mut out = vec![-1i64; 5];
        world
            .allgather((send_buf(i64::from(world.rank())), recv_buf(&mut out).grow_only()))
            .unwrap();
        assert_eq!(out, vec![0, 1, -1, -1, -1]);
    });
}

#[test]
fn mismatched_datatypes_are_rejected() {
    init_logging();
    local::run(1, |mpi| {
        let world = mpi.world();
        let bytes = world.datatype::<u8>().unwrap();
        let (result, events) = capture(|| {
            world.gather((send_buf(&[1i32][..]), send_type(bytes), recv_buf(alloc_container_of::<i32>())))
        });
        assert!(matches!(result, Err(Error::TypeMismatch(_))));
        assert!(calls(&events).is_empty());
    });
}

#[test]
fn invalid_roots_ranks_and_tags() {
    init_logging();
    local::run(2, |mpi| {
        let world = mpi.world();
        let err = world.reduce((send_buf(1u32), op(ops::Max), root(2))).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)), "{err}");
        assert!(world.set_root(-1).is_err());

        let err = world.send((send_buf(1u8), destination(Rank::Any))).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));

        let too_large = world.tag_upper_bound() + 1;
        let err = world
            .send((send_buf(1u8), destination(0), tag(too_large)))
            .unwrap_err();
        assert!(err.to_string().contains(&too_large.to_string()), "{err}");

        let err = world
            .send((send_buf(1u8), destination(0), tag(Tag::Any)))
            .unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
        assert_eq!(err.code(), None);
    });
}

#[test]
fn scatter_without_root_data_fails_on_every_rank() {
    init_logging();
    let outcomes = local::run(3, |mpi| {
        let world = mpi.world();
        world
            .scatter(recv_buf(alloc_container_of::<f64>()))
            .map(|result| result.into_value())
    });
    for outcome in outcomes {
        assert!(matches!(outcome, Err(Error::LogicError(_))), "{outcome:?}");
    }
}

#[test]
fn scatterv_counts_rejected_by_the_root_fail_every_rank() {
    init_logging();
    let outcomes = local::run(2, |mpi| {
        let world = mpi.world();
        let outcome = if world.rank() == 0 {
            // One count for a communicator of two
            world
                .scatterv((
                    send_buf(&[1, 2, 3][..]),
                    send_counts(&[1][..]),
                    recv_buf(alloc_container_of::<i32>()),
                ))
                .map(|result| result.into_value())
        } else {
            world
                .scatterv(recv_buf(alloc_container_of::<i32>()))
                .map(|result| result.into_value())
        };
        let total = world.allreduce((send_buf(1), op(ops::Plus))).unwrap().into_value();
        (outcome, total)
    });
    for (outcome, total) in outcomes {
        assert!(matches!(outcome, Err(Error::InvalidArgument(_))), "{outcome:?}");
        assert_eq!(total, vec![2]);
    }
}

#[test]
fn scatter_short_of_data_on_the_root_fails_every_rank() {
    init_logging();
    let outcomes = local::run(2, |mpi| {
        let world = mpi.world();
        if world.rank() == 0 {
            world
                .scatter((
                    send_buf(&[1u16, 2, 3][..]),
                    recv_count(2),
                    recv_buf(alloc_container_of::<u16>()),
                ))
                .map(|result| result.into_value())
        } else {
            world
                .scatter((recv_count(2), recv_buf(alloc_container_of::<u16>())))
                .map(|result| result.into_value())
        }
    });
    assert!(
        matches!(outcomes[0], Err(Error::SizeMismatch { expected: 4, actual: 3 })),
        "{:?}",
        outcomes[0]
    );
    assert!(matches!(outcomes[1], Err(Error::InvalidArgument(_))), "{:?}", outcomes[1]);
}

#[test]
fn receive_count_on_some_ranks_only_is_invalid() {
    init_logging();
    let outcomes = local::run(2, |mpi| {
        let world = mpi.world();
        let scattered = if world.rank() == 0 {
            world
                .scatter((
                    send_buf(&[7, 8, 9, 10][..]),
                    recv_count(2),
                    recv_buf(alloc_container_of::<i32>()),
                ))
                .map(|result| result.into_value())
        } else {
            world
                .scatter(recv_buf(alloc_container_of::<i32>()))
                .map(|result| result.into_value())
        };

        let gathered = if world.rank() == 0 {
            world
                .gatherv((send_buf(&[1][..]), recv_counts(&[1, 1][..])))
                .map(|result| result.into_value())
        } else {
            world
                .gatherv(send_buf(&[2][..]))
                .map(|result| result.into_value())
        };
        (scattered, gathered)
    });
    for (scattered, gathered) in outcomes {
        assert!(matches!(scattered, Err(Error::InvalidArgument(_))), "{scattered:?}");
        assert!(matches!(gathered, Err(Error::InvalidArgument(_))), "{gathered:?}");
    }
}

#[test]
fn gatherv_counts_rejected_by_the_root_fail_every_rank() {
    init_logging();
    let outcomes = local::run(2, |mpi| {
        let world = mpi.world();
        let counts: &[i32] = if world.rank() == 0 { &[1, -1] } else { &[1, 1] };
        world
            .gatherv((send_buf(&[world.rank()][..]), recv_counts(counts)))
            .map(|result| result.into_value())
    });
    for outcome in outcomes {
        assert!(matches!(outcome, Err(Error::InvalidArgument(_))), "{outcome:?}");
    }
}

#[test]
fn failed_calls_leave_the_communicator_usable() {
    init_logging();
    let sums = local::run(3, |mpi| {
        let world = mpi.world();
        assert!(world.reduce((send_buf(1i32), op(ops::Plus), root(9))).is_err());
        world
            .reduce((send_buf(world.rank()), op(ops::Plus)))
            .unwrap()
            .into_value()
    });
    assert_eq!(sums[0], vec![3]);
}
