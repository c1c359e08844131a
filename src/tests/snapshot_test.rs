#[cfg(test)]
mod tests {
    use nalgebra::Vector3;

    use crate::active::AffineDofs;
    use crate::errors::RobotError;
    use crate::manipulator::Manipulator;
    use crate::robot::Robot;
    use crate::snapshot::{SnapshotOptions, StateSnapshot};
    use crate::tests::test_model::{PlanarArm, LINK_BASE, LINK_FLAP, LINK_PALM, LINK_WRIST};

    fn robot_with_manipulators() -> Robot<PlanarArm> {
        let mut robot = Robot::new(PlanarArm::new());
        robot.add_manipulator(Manipulator::new("gripper", Some(LINK_BASE), LINK_PALM));
        robot.add_manipulator(Manipulator::new("flap", Some(LINK_WRIST), LINK_FLAP));
        robot.finalize();
        robot
    }

    #[test]
    fn test_capture_restore_active_state() {
        let mut robot = robot_with_manipulators();
        robot
            .set_active_dofs_with_axis(
                &[0, 2],
                AffineDofs::X | AffineDofs::ROTATION_AXIS,
                Vector3::y(),
            )
            .unwrap();
        robot.set_active_manipulator_by_name("flap").unwrap();

        let snapshot = StateSnapshot::capture(
            &robot,
            SnapshotOptions::ACTIVE_DOF | SnapshotOptions::ACTIVE_MANIPULATOR,
        );

        robot.set_active_dofs(&[1], AffineDofs::empty()).unwrap();
        robot.set_active_manipulator(None).unwrap();

        snapshot.restore(&mut robot).unwrap();
        assert_eq!(robot.active_dof_indices(), vec![0, 2]);
        assert_eq!(
            robot.active_affine_dofs(),
            AffineDofs::X | AffineDofs::ROTATION_AXIS
        );
        assert_eq!(robot.affine_settings().rotation_axis, Vector3::y());
        let active = robot.active_manipulator().unwrap();
        assert_eq!(robot.manipulator(active).name, "flap");
    }

    #[test]
    fn test_options_limit_what_is_restored() {
        let mut robot = robot_with_manipulators();
        robot.set_active_dofs(&[0], AffineDofs::empty()).unwrap();
        robot.set_active_manipulator_by_name("gripper").unwrap();

        let snapshot = StateSnapshot::capture(&robot, SnapshotOptions::ACTIVE_DOF);

        robot.set_active_dofs(&[3], AffineDofs::empty()).unwrap();
        robot.set_active_manipulator_by_name("flap").unwrap();

        snapshot.restore(&mut robot).unwrap();
        assert_eq!(robot.active_dof_indices(), vec![0]);
        // The manipulator choice was not captured and must keep the new value.
        let active = robot.active_manipulator().unwrap();
        assert_eq!(robot.manipulator(active).name, "flap");
    }

    #[test]
    fn test_with_saved_state_restores_on_success() {
        let mut robot = robot_with_manipulators();
        robot.set_active_dofs(&[1, 2], AffineDofs::Y).unwrap();

        let count = robot
            .with_saved_state(SnapshotOptions::ACTIVE_DOF, |robot| {
                robot.set_active_dofs(&[0], AffineDofs::empty())?;
                Ok(robot.active_dof_count())
            })
            .unwrap();
        assert_eq!(count, 1);
        assert_eq!(robot.active_dof_indices(), vec![1, 2]);
        assert_eq!(robot.active_affine_dofs(), AffineDofs::Y);
    }

    #[test]
    fn test_with_saved_state_restores_on_error_unwind() {
        let mut robot = robot_with_manipulators();
        robot.set_active_dofs(&[1, 2], AffineDofs::Y).unwrap();
        robot.set_active_manipulator_by_name("gripper").unwrap();

        let result: Result<(), RobotError> = robot.with_saved_state(
            SnapshotOptions::ACTIVE_DOF | SnapshotOptions::ACTIVE_MANIPULATOR,
            |robot| {
                robot.set_active_dofs(&[3], AffineDofs::empty())?;
                robot.set_active_manipulator(None)?;
                Err(RobotError::InvalidArgument("injected".to_string()))
            },
        );
        assert!(matches!(result, Err(RobotError::InvalidArgument(_))));
        // The failed trial left nothing behind.
        assert_eq!(robot.active_dof_indices(), vec![1, 2]);
        assert_eq!(robot.active_affine_dofs(), AffineDofs::Y);
        let active = robot.active_manipulator().unwrap();
        assert_eq!(robot.manipulator(active).name, "gripper");
    }

    #[cfg(feature = "collisions")]
    mod grabs {
        use std::collections::BTreeSet;

        use super::*;
        use crate::model::BodyRef;
        use crate::tests::test_model::{ball_body, sphere_checker, LINK_MAST};

        fn grabbing_robot() -> (Robot<PlanarArm>, BodyRef, BodyRef) {
            let mut robot = robot_with_manipulators();
            let checker = sphere_checker();
            let near: BodyRef = ball_body("mug", 2.6, 0.0, 0.0);
            let far: BodyRef = ball_body("crate", 5.0, 0.0, 0.0);
            checker.register_body(&near, vec![0.25]);
            checker.register_body(&far, vec![0.25]);
            robot.set_collision_checker(checker);
            (robot, near, far)
        }

        #[test]
        fn test_grabs_are_restored_in_original_order() {
            let (mut robot, near, far) = grabbing_robot();
            robot.grab(&near, LINK_PALM, &BTreeSet::new()).unwrap();
            let partition_before = robot.grab_records()[0].colliding_links().to_vec();

            let snapshot = StateSnapshot::capture(&robot, SnapshotOptions::GRABBED_BODIES);

            robot.release_all_grabbed();
            robot.grab(&far, LINK_MAST, &BTreeSet::new()).unwrap();

            snapshot.restore(&mut robot).unwrap();
            assert_eq!(robot.grabbed_bodies().len(), 1);
            assert_eq!(robot.is_grabbing(&near), Some(LINK_PALM));
            assert_eq!(robot.is_grabbing(&far), None);
            // Partitions were recomputed by the re-grab, not spliced back.
            assert_eq!(
                robot.grab_records()[0].colliding_links(),
                partition_before.as_slice()
            );
        }

        #[test]
        fn test_error_unwind_restores_grabs() {
            let (mut robot, near, far) = grabbing_robot();
            robot.grab(&near, LINK_PALM, &BTreeSet::new()).unwrap();

            let result: Result<(), RobotError> =
                robot.with_saved_state(SnapshotOptions::GRABBED_BODIES, |robot| {
                    robot.release_all_grabbed();
                    robot.grab(&far, LINK_MAST, &BTreeSet::new())?;
                    Err(RobotError::InvalidArgument("injected".to_string()))
                });
            assert!(result.is_err());
            assert_eq!(robot.is_grabbing(&near), Some(LINK_PALM));
            assert_eq!(robot.is_grabbing(&far), None);
        }

        #[test]
        fn test_ignored_links_survive_restore() {
            let (mut robot, near, _) = grabbing_robot();
            let ignore: BTreeSet<usize> = [LINK_MAST].into_iter().collect();
            robot.grab(&near, LINK_PALM, &ignore).unwrap();

            let snapshot = StateSnapshot::capture(&robot, SnapshotOptions::GRABBED_BODIES);
            robot.release_all_grabbed();
            snapshot.restore(&mut robot).unwrap();

            let record = &robot.grab_records()[0];
            assert!(!record.colliding_links().contains(&LINK_MAST));
            assert!(!record.non_colliding_links().contains(&LINK_MAST));
        }
    }
}
