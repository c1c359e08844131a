#[cfg(test)]
mod tests {
    use std::f64::consts::PI;

    use nalgebra::{UnitQuaternion, Vector3};

    use crate::active::AffineDofs;
    use crate::errors::RobotError;
    use crate::tests::test_model::{arm_robot, rot_z, translation};

    fn assert_close(actual: &[f64], expected: &[f64], tolerance: f64) {
        assert_eq!(actual.len(), expected.len(), "{:?} vs {:?}", actual, expected);
        for (a, e) in actual.iter().zip(expected.iter()) {
            assert!(
                (a - e).abs() < tolerance,
                "expected {:?}, got {:?}",
                expected,
                actual
            );
        }
    }

    #[test]
    fn test_active_dof_count() {
        let mut robot = arm_robot();
        // No explicit selection: the full configuration.
        assert_eq!(robot.active_dof_count(), 4);

        robot.set_active_dofs(&[0, 2], AffineDofs::empty()).unwrap();
        assert_eq!(robot.active_dof_count(), 2);

        robot
            .set_active_dofs(&[0, 2], AffineDofs::X | AffineDofs::Y)
            .unwrap();
        assert_eq!(robot.active_dof_count(), 4);

        robot
            .set_active_dofs(&[1], AffineDofs::ROTATION_AXIS)
            .unwrap();
        assert_eq!(robot.active_dof_count(), 2);

        robot
            .set_active_dofs(&[], AffineDofs::Z | AffineDofs::ROTATION_3D)
            .unwrap();
        assert_eq!(robot.active_dof_count(), 4);

        robot
            .set_active_dofs(&[3], AffineDofs::ROTATION_QUAT)
            .unwrap();
        assert_eq!(robot.active_dof_count(), 5);
    }

    #[test]
    fn test_set_active_dofs_rejects_out_of_range() {
        let mut robot = arm_robot();
        robot.set_active_dofs(&[1], AffineDofs::empty()).unwrap();

        let err = robot
            .set_active_dofs(&[0, 9], AffineDofs::X)
            .unwrap_err();
        assert!(matches!(err, RobotError::InvalidArgument(_)));
        // Rejected call leaves the previous selection untouched.
        assert_eq!(robot.active_dof_indices(), vec![1]);
        assert_eq!(robot.active_affine_dofs(), AffineDofs::empty());
    }

    #[test]
    fn test_set_active_dofs_rejects_duplicates() {
        let mut robot = arm_robot();
        let err = robot
            .set_active_dofs(&[2, 0, 2], AffineDofs::empty())
            .unwrap_err();
        assert!(matches!(err, RobotError::InvalidArgument(_)));
    }

    #[test]
    fn test_joint_only_roundtrip() {
        let mut robot = arm_robot();
        robot.set_dof_values(&[0.1, 0.2, 0.3, 0.4]).unwrap();
        robot.set_active_dofs(&[2, 0], AffineDofs::empty()).unwrap();

        robot.set_active_values(&[-0.5, 0.7]).unwrap();
        assert_close(&robot.active_values(), &[-0.5, 0.7], 1e-12);
        // Selection order maps onto the full vector; unselected values stay.
        assert_close(&robot.dof_values(), &[0.7, 0.2, -0.5, 0.4], 1e-12);
    }

    #[test]
    fn test_translation_roundtrip() {
        let mut robot = arm_robot();
        robot
            .set_active_dofs(&[0], AffineDofs::X | AffineDofs::Y)
            .unwrap();

        robot.set_active_values(&[0.3, 1.5, -2.0]).unwrap();
        assert_close(&robot.active_values(), &[0.3, 1.5, -2.0], 1e-12);
        let base = robot.transform();
        assert!((base.translation.vector.x - 1.5).abs() < 1e-12);
        assert!((base.translation.vector.y + 2.0).abs() < 1e-12);
        // Z was not selected and must not move.
        assert!(base.translation.vector.z.abs() < 1e-12);
    }

    #[test]
    fn test_rotation_axis_roundtrip() {
        let mut robot = arm_robot();
        robot
            .set_active_dofs_with_axis(&[], AffineDofs::ROTATION_AXIS, Vector3::z())
            .unwrap();

        for angle in [0.8, -0.8, 2.9, -2.9] {
            robot.set_active_values(&[angle]).unwrap();
            let rotation = robot.transform().rotation;
            let expected = UnitQuaternion::from_axis_angle(&Vector3::z_axis(), angle);
            assert!(rotation.angle_to(&expected) < 1e-10);
            // Sign recovery from the quaternion vector part.
            assert_close(&robot.active_values(), &[angle], 1e-10);
        }
    }

    #[test]
    fn test_rotation_3d_roundtrip() {
        let mut robot = arm_robot();
        robot
            .set_active_dofs(&[], AffineDofs::ROTATION_3D)
            .unwrap();

        let v = [0.3, -0.2, 0.5];
        robot.set_active_values(&v).unwrap();
        assert_close(&robot.active_values(), &v, 1e-10);

        // Zero magnitude decodes to the identity and encodes back to zero.
        robot.set_active_values(&[0.0, 0.0, 0.0]).unwrap();
        assert!(robot.transform().rotation.angle() < 1e-12);
        assert_close(&robot.active_values(), &[0.0, 0.0, 0.0], 1e-12);
    }

    #[test]
    fn test_rotation_quat_roundtrip() {
        let mut robot = arm_robot();
        robot
            .set_active_dofs(&[], AffineDofs::ROTATION_QUAT)
            .unwrap();

        let half = 0.3_f64;
        let v = [half.cos(), 0.0, 0.0, half.sin()];
        robot.set_active_values(&v).unwrap();
        assert_close(&robot.active_values(), &v, 1e-10);

        // Raw values are normalized on input.
        let scaled: Vec<f64> = v.iter().map(|c| c * 2.0).collect();
        robot.set_active_values(&scaled).unwrap();
        assert_close(&robot.active_values(), &v, 1e-10);
    }

    #[test]
    fn test_rotation_quat_reference_offset() {
        let mut robot = arm_robot();
        robot
            .set_active_dofs(&[], AffineDofs::ROTATION_QUAT)
            .unwrap();
        robot.affine_settings_mut().quat_offset =
            UnitQuaternion::from_axis_angle(&Vector3::z_axis(), 1.0);

        // The identity parameter lands on the reference rotation itself.
        robot.set_active_values(&[1.0, 0.0, 0.0, 0.0]).unwrap();
        let expected = UnitQuaternion::from_axis_angle(&Vector3::z_axis(), 1.0);
        assert!(robot.transform().rotation.angle_to(&expected) < 1e-10);
        assert_close(&robot.active_values(), &[1.0, 0.0, 0.0, 0.0], 1e-10);
    }

    #[test]
    fn test_empty_selection_is_a_valid_zero_width_vector() {
        let mut robot = arm_robot();
        robot.set_dof_values(&[0.1, 0.2, 0.3, 0.4]).unwrap();
        robot.set_active_dofs(&[], AffineDofs::empty()).unwrap();

        assert_eq!(robot.active_dof_count(), 0);
        robot.set_active_values(&[]).unwrap();
        assert!(robot.active_values().is_empty());
        assert_close(&robot.dof_values(), &[0.1, 0.2, 0.3, 0.4], 1e-12);
    }

    #[test]
    fn test_value_length_mismatch_rejected() {
        let mut robot = arm_robot();
        robot.set_active_dofs(&[0, 1], AffineDofs::X).unwrap();
        let err = robot.set_active_values(&[1.0, 2.0]).unwrap_err();
        assert!(matches!(err, RobotError::InvalidArgument(_)));
    }

    #[test]
    fn test_affine_dof_index_layout() {
        let mut robot = arm_robot();
        robot
            .set_active_dofs(&[1, 2], AffineDofs::X | AffineDofs::Z | AffineDofs::ROTATION_AXIS)
            .unwrap();

        assert_eq!(robot.affine_dof_index(AffineDofs::X), Some(2));
        assert_eq!(robot.affine_dof_index(AffineDofs::Y), None);
        assert_eq!(robot.affine_dof_index(AffineDofs::Z), Some(3));
        assert_eq!(robot.affine_dof_index(AffineDofs::ROTATION_AXIS), Some(4));
    }

    #[test]
    fn test_subtract_same_is_zero() {
        let mut robot = arm_robot();
        robot
            .set_active_dofs_with_axis(
                &[0, 1, 3],
                AffineDofs::X | AffineDofs::ROTATION_AXIS,
                Vector3::z(),
            )
            .unwrap();
        let q = [0.4, -2.9, 0.6, 11.0, 3.0];
        let diff = robot.subtract_active_values(&q, &q).unwrap();
        assert_close(&diff, &[0.0; 5], 1e-12);
    }

    #[test]
    fn test_subtract_wraps_circular_joint() {
        let mut robot = arm_robot();
        // DOF 1 (the elbow) is circular, DOF 0 is not.
        robot.set_active_dofs(&[0, 1], AffineDofs::empty()).unwrap();

        let diff = robot
            .subtract_active_values(&[3.1, 3.1], &[-3.1, -3.1])
            .unwrap();
        assert!((diff[0] - 6.2).abs() < 1e-12);
        let wrapped = 6.2 - 2.0 * PI;
        assert!((diff[1] - wrapped).abs() < 1e-12);
        assert!(diff[1] > -PI && diff[1] <= PI);
    }

    #[test]
    fn test_subtract_wraps_rotation_axis() {
        let mut robot = arm_robot();
        robot
            .set_active_dofs_with_axis(&[], AffineDofs::ROTATION_AXIS, Vector3::z())
            .unwrap();
        let diff = robot.subtract_active_values(&[3.1], &[-3.1]).unwrap();
        assert!((diff[0] - (6.2 - 2.0 * PI)).abs() < 1e-12);
    }

    #[test]
    fn test_velocity_roundtrip() {
        let mut robot = arm_robot();
        robot
            .set_active_dofs_with_axis(
                &[0, 2],
                AffineDofs::X | AffineDofs::ROTATION_AXIS,
                Vector3::z(),
            )
            .unwrap();

        robot
            .set_active_velocities(&[0.5, -0.25, 1.5, 0.1])
            .unwrap();
        assert_close(
            &robot.active_velocities().unwrap(),
            &[0.5, -0.25, 1.5, 0.1],
            1e-12,
        );
    }

    #[test]
    fn test_quat_velocities_unsupported() {
        let mut robot = arm_robot();
        robot
            .set_active_dofs(&[], AffineDofs::ROTATION_QUAT)
            .unwrap();
        let err = robot
            .set_active_velocities(&[1.0, 0.0, 0.0, 0.0])
            .unwrap_err();
        assert!(matches!(err, RobotError::UnsupportedOperation(_)));
        let err = robot.active_velocities().unwrap_err();
        assert!(matches!(err, RobotError::UnsupportedOperation(_)));
    }

    #[test]
    fn test_limits_follow_layout() {
        let mut robot = arm_robot();
        robot
            .set_active_dofs(&[2], AffineDofs::Y | AffineDofs::ROTATION_3D)
            .unwrap();

        let (lower, upper) = robot.active_dof_limits();
        assert_eq!(lower.len(), 5);
        // The wrist limit comes from the model, the tail from the affine
        // settings.
        assert!((lower[0] + 2.0).abs() < 1e-12 && (upper[0] - 2.0).abs() < 1e-12);
        let settings = robot.affine_settings();
        assert_eq!(lower[1], settings.translation_lower.y);
        assert_eq!(upper[2], settings.rotation3d_upper.x);
    }

    #[test]
    fn test_acceleration_limits_are_not_velocity_limits() {
        let mut robot = arm_robot();
        robot.set_active_dofs(&[0], AffineDofs::X).unwrap();

        let velocities = robot.active_dof_max_velocities();
        let accelerations = robot.active_dof_max_accelerations();
        assert_eq!(velocities.len(), 2);
        assert_eq!(accelerations.len(), 2);
        // Model DOF 0: 2.0 vs 5.0; affine X: 1.0 vs 2.0.
        assert!((velocities[0] - 2.0).abs() < 1e-12);
        assert!((accelerations[0] - 5.0).abs() < 1e-12);
        assert!((velocities[1] - 1.0).abs() < 1e-12);
        assert!((accelerations[1] - 2.0).abs() < 1e-12);
    }

    #[test]
    fn test_resolutions_and_weights_lengths() {
        let mut robot = arm_robot();
        robot
            .set_active_dofs(&[1, 3], AffineDofs::ROTATION_QUAT)
            .unwrap();
        assert_eq!(robot.active_dof_resolutions().len(), 6);
        assert_eq!(robot.active_dof_weights().len(), 6);
    }

    #[test]
    fn test_no_selection_passthrough() {
        let mut robot = arm_robot();
        robot.set_active_values(&[0.1, 0.2, 0.3, 0.4]).unwrap();
        assert_close(&robot.active_values(), &[0.1, 0.2, 0.3, 0.4], 1e-12);
        assert_eq!(robot.active_dof_indices(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_rotation_modes_are_exclusive() {
        let mut robot = arm_robot();
        robot
            .set_active_dofs(
                &[],
                AffineDofs::ROTATION_AXIS | AffineDofs::ROTATION_3D | AffineDofs::ROTATION_QUAT,
            )
            .unwrap();
        assert_eq!(robot.active_affine_dofs(), AffineDofs::ROTATION_AXIS);
        assert_eq!(robot.active_dof_count(), 1);
    }

    #[test]
    fn test_affine_values_see_external_base_moves() {
        let mut robot = arm_robot();
        robot
            .set_active_dofs_with_axis(
                &[],
                AffineDofs::X | AffineDofs::Y | AffineDofs::ROTATION_AXIS,
                Vector3::z(),
            )
            .unwrap();
        robot.set_transform(&(translation(2.0, -1.0, 0.0) * rot_z(0.4)));
        assert_close(&robot.active_values(), &[2.0, -1.0, 0.4], 1e-10);
    }
}
