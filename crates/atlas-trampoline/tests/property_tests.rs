//! Generated code behaves like a direct call for arbitrary inputs

mod common;

use atlas_trampoline::wrap;
use proptest::prelude::*;

proptest! {
    #[test]
    fn prop_mixed_arguments_match_direct_call(
        a in any::<i64>(),
        b in -1.0e9f64..1.0e9,
        c in any::<u8>(),
        d in any::<i16>(),
    ) {
        let direct = |a: i64, b: f64, c: u8, d: i16| -> f64 {
            (a % 1_000_000) as f64 + b * 2.0 + c as f64 - d as f64
        };
        let wrapped = wrap(direct).unwrap();

        let got = unsafe { (wrapped.pointer())(a, b, c, d) };
        prop_assert_eq!(got.to_bits(), direct(a, b, c, d).to_bits());
    }

    #[test]
    fn prop_captured_state_is_per_handle(seeds in prop::collection::vec(any::<i32>(), 1..40)) {
        let handles: Vec<_> = seeds
            .iter()
            .map(|&seed| wrap(move |x: i32| x.wrapping_mul(3) ^ seed).unwrap())
            .collect();

        for (seed, h) in seeds.iter().zip(&handles) {
            prop_assert_eq!(unsafe { (h.pointer())(11) }, 33 ^ seed);
        }
    }

    #[test]
    fn prop_counter_counts_every_call(calls in 0usize..200) {
        let mut count = 0u64;
        let c = wrap(|| -> u64 {
            count += 1;
            count
        })
        .unwrap();

        let mut last = 0;
        for _ in 0..calls {
            last = unsafe { (c.pointer())() };
        }
        prop_assert_eq!(last, calls as u64);
    }
}
