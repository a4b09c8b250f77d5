//! Properties of the closed loop under arbitrary surgeon input

use proptest::prelude::*;

use telesurg_core::{SystemState, Vec3};
use telesurg_test::{MasterPose, SimulatedSession};

const WORKSPACE_BOUND: f32 = 150.0;
const NEEDLE_DRIVER_MAX_JAW: f32 = 45.0;

/// Hand excursions that keep arm 0 on its own side of the field
fn excursion() -> impl Strategy<Value = Vec3> {
    (0.0f32..300.0, -300.0f32..300.0, -300.0f32..300.0).prop_map(|(x, y, z)| Vec3::new(x, y, z))
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn prop_tip_stays_in_workspace(
        waypoints in prop::collection::vec((excursion(), 0.0f32..=1.0), 1..4),
    ) {
        let mut sim = SimulatedSession::dual_arm().unwrap();
        sim.start().unwrap();
        sim.set_pose(0, MasterPose::at(Vec3::ZERO));
        sim.run(5);

        for (position, gripper) in waypoints {
            sim.set_pose(0, MasterPose::at(position).with_gripper(gripper));
            for _ in 0..300 {
                sim.tick();
                let tip = sim.tip(0).unwrap();
                prop_assert!(tip.max_abs() <= WORKSPACE_BOUND, "tip {:?}", tip);
                let jaw = sim.jaw(0).unwrap_or(0.0);
                prop_assert!((-1e-3..=NEEDLE_DRIVER_MAX_JAW + 1e-3).contains(&jaw), "jaw {}", jaw);
            }
        }
        prop_assert_eq!(sim.state(), SystemState::Operating);
    }

    #[test]
    fn prop_held_arm_never_moves(
        position in excursion(),
    ) {
        let mut sim = SimulatedSession::dual_arm().unwrap();
        sim.start().unwrap();
        let parked = sim.tip(1).unwrap();

        sim.set_pose(0, MasterPose::at(Vec3::ZERO));
        sim.run(5);
        sim.set_pose(0, MasterPose::at(position));
        sim.run(200);
        let drift = (sim.tip(1).unwrap() - parked).norm();
        prop_assert!(drift < 1e-3, "drift {}", drift);
    }
}
