use proptest::prelude::*;
use shipyard_core::RolloutType;
use shipyard_policy::evaluators::rollout_offset_seconds;

fn rollout_type() -> impl Strategy<Value = RolloutType> {
    prop_oneof![
        Just(RolloutType::Linear),
        Just(RolloutType::Exponential),
        Just(RolloutType::Normal),
    ]
}

proptest! {
    #[test]
    fn offsets_are_ordered(
        kind in rollout_type(),
        total in 1usize..200,
        scale in 1u64..86_400,
    ) {
        let offsets: Vec<u64> = (0..total)
            .map(|p| rollout_offset_seconds(kind, p, total, scale))
            .collect();
        prop_assert!(offsets.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn first_linear_target_is_admitted_immediately(total in 1usize..50, scale in 1u64..3600) {
        prop_assert_eq!(rollout_offset_seconds(RolloutType::Linear, 0, total, scale), 0);
        prop_assert_eq!(rollout_offset_seconds(RolloutType::Exponential, 0, total, scale), 0);
    }

    #[test]
    fn huge_scales_saturate(kind in rollout_type(), total in 2usize..50) {
        let last = rollout_offset_seconds(kind, total - 1, total, u64::MAX);
        prop_assert!(last > 0);
    }
}
