//! Property tests of reductions and variable-count collectives on the local
//! transport.

use mpiparams::params::{
    alloc_container_of, op, ops, recv_buf, recv_count, recv_counts, recv_counts_out, send_buf,
    send_counts,
};
use mpiparams::{local, Error};
use proptest::prelude::*;

/// `identity op x == x` and `x op identity == x`, checked through a two-rank
/// allreduce in which each rank contributes the identity in one lane.
macro_rules! identity_properties {
    ($($name:ident: $functor:ident on $ty:ty, $strategy:expr;)*) => {
        proptest! {
            #![proptest_config(ProptestConfig::with_cases(16))]
            $(
                #[test]
                fn $name(x in $strategy) {
                    let out = local::run(2, |mpi| {
                        let world = mpi.world();
                        let reduction = op(ops::$functor);
                        let id: $ty = reduction.identity();
                        let mine = if world.rank() == 0 { [id, x] } else { [x, id] };
                        world.allreduce((send_buf(&mine), reduction)).unwrap().into_value()
                    });
                    for result in out {
                        prop_assert_eq!(result, vec![x, x]);
                    }
                }
            )*
        }
    };
}

identity_properties! {
    plus_i32: Plus on i32, any::<i32>();
    multiplies_i64: Multiplies on i64, any::<i64>();
    min_u16: Min on u16, any::<u16>();
    max_i8: Max on i8, any::<i8>();
    bit_and_u32: BitAnd on u32, any::<u32>();
    bit_or_u64: BitOr on u64, any::<u64>();
    bit_xor_i16: BitXor on i16, any::<i16>();
    plus_f64: Plus on f64, -1.0e9f64..1.0e9;
    multiplies_f32: Multiplies on f32, -1.0e3f32..1.0e3;
    min_f64: Min on f64, -1.0e9f64..1.0e9;
    max_f32: Max on f32, -1.0e3f32..1.0e3;
    logical_and: LogicalAnd on bool, any::<bool>();
    logical_or: LogicalOr on bool, any::<bool>();
    logical_xor: LogicalXor on bool, any::<bool>();
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn allgatherv_concatenates_in_rank_order(lens in proptest::collection::vec(0usize..6, 3)) {
        let out = local::run(3, |mpi| {
            let world = mpi.world();
            let r = world.rank();
            let mine: Vec<i32> = (0..lens[r as usize] as i32).map(|i| 100 * r + i).collect();
            let result = world.allgatherv((send_buf(&mine), recv_counts_out())).unwrap();
            let (data, rest) = result.extract_recv_buffer();
            (data, rest.into_value())
        });

        let expected: Vec<i32> = lens
            .iter()
            .enumerate()
            .flat_map(|(r, &len)| (0..len as i32).map(move |i| 100 * r as i32 + i))
            .collect();
        let counts: Vec<i32> = lens.iter().map(|&len| len as i32).collect();
        for (data, recv_counts) in out {
            prop_assert_eq!(&data, &expected);
            prop_assert_eq!(&recv_counts, &counts);
        }
    }

    #[test]
    fn counts_past_the_int_range_are_rejected(
        large in (i32::MAX - 16)..=i32::MAX,
        small in 17i32..1000,
    ) {
        let outcomes = local::run(2, |mpi| {
            let world = mpi.world();
            let counts = [large, small];
            let scattered = if world.rank() == 0 {
                world
                    .scatterv((
                        send_buf(&[0u8; 4][..]),
                        send_counts(&counts[..]),
                        recv_count(0),
                        recv_buf(alloc_container_of::<u8>()),
                    ))
                    .map(|result| result.into_value())
            } else {
                world
                    .scatterv((recv_count(0), recv_buf(alloc_container_of::<u8>())))
                    .map(|result| result.into_value())
            };
            let gathered = world
                .allgatherv((send_buf(&[1u8][..]), recv_counts(&counts[..])))
                .map(|result| result.into_value());
            (scattered, gathered)
        });
        for (scattered, gathered) in outcomes {
            prop_assert!(matches!(scattered, Err(Error::InvalidArgument(_))), "{:?}", scattered);
            prop_assert!(matches!(gathered, Err(Error::InvalidArgument(_))), "{:?}", gathered);
        }
    }
}
