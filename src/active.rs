//! Active degrees of freedom: the caller-selected subset of joint DOFs plus
//! optional base-pose parameters, exposed as one generalized configuration
//! vector.
//!
//! The generalized vector places the selected joint values first, in
//! selection order, followed by affine components in fixed order X, Y, Z and
//! the chosen rotation block. Three rotation parameterizations are
//! supported: a single angle about a fixed axis, a three-component
//! exponential map, and a raw quaternion centered on a configurable
//! reference offset. With no explicit selection every operation falls back
//! to the full configuration.

extern crate nalgebra as na;

use std::f64::consts::PI;

use bitflags::bitflags;
use na::{DMatrix, Point3, Quaternion, UnitQuaternion, Vector3};

use crate::errors::{Result, RobotError};
use crate::model::{Pose, RigidBodyModel};
use crate::robot::Robot;
use crate::utils::angle_diff;

bitflags! {
    /// Base-pose components addable to the active configuration. The three
    /// rotation parameterizations are mutually exclusive; when several are
    /// requested, the first of AXIS, 3D, QUAT wins.
    #[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
    pub struct AffineDofs: u32 {
        const X             = 0b00_0001;
        const Y             = 0b00_0010;
        const Z             = 0b00_0100;
        /// One angle about the configured fixed axis.
        const ROTATION_AXIS = 0b00_1000;
        /// Exponential map: direction is the axis, magnitude the angle.
        const ROTATION_3D   = 0b01_0000;
        /// Raw quaternion, normalized on input and offset by the configured
        /// reference quaternion.
        const ROTATION_QUAT = 0b10_0000;
    }
}

impl AffineDofs {
    /// Drop all but the highest-priority rotation parameterization.
    pub(crate) fn normalized(self) -> AffineDofs {
        if self.contains(AffineDofs::ROTATION_AXIS) {
            self - (AffineDofs::ROTATION_3D | AffineDofs::ROTATION_QUAT)
        } else if self.contains(AffineDofs::ROTATION_3D) {
            self - AffineDofs::ROTATION_QUAT
        } else {
            self
        }
    }

    /// Number of scalar components this mask contributes to the vector.
    pub fn dof_count(self) -> usize {
        let mut n = 0;
        if self.contains(AffineDofs::X) {
            n += 1;
        }
        if self.contains(AffineDofs::Y) {
            n += 1;
        }
        if self.contains(AffineDofs::Z) {
            n += 1;
        }
        if self.contains(AffineDofs::ROTATION_AXIS) {
            n += 1;
        } else if self.contains(AffineDofs::ROTATION_3D) {
            n += 3;
        } else if self.contains(AffineDofs::ROTATION_QUAT) {
            n += 4;
        }
        n
    }
}

/// The current explicit selection: joint DOF indices plus the affine mask.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct ActiveSelection {
    pub dof_indices: Vec<usize>,
    pub affine: AffineDofs,
}

/// Limits, resolutions, weights and velocity/acceleration bounds of the
/// affine components, appended to the per-joint values pulled from the
/// model. Acceleration bounds are their own quantity, not derived from the
/// velocity bounds.
#[derive(Debug, Clone)]
pub struct AffineSettings {
    /// Axis of the ROTATION_AXIS parameterization, unit length.
    pub rotation_axis: Vector3<f64>,
    pub translation_lower: Vector3<f64>,
    pub translation_upper: Vector3<f64>,
    pub translation_max_vel: Vector3<f64>,
    pub translation_max_accel: Vector3<f64>,
    pub translation_resolution: Vector3<f64>,
    pub translation_weights: Vector3<f64>,
    pub rotation_axis_lower: f64,
    pub rotation_axis_upper: f64,
    pub rotation_axis_max_vel: f64,
    pub rotation_axis_max_accel: f64,
    pub rotation_axis_resolution: f64,
    pub rotation_axis_weight: f64,
    pub rotation3d_lower: Vector3<f64>,
    pub rotation3d_upper: Vector3<f64>,
    pub rotation3d_max_vel: Vector3<f64>,
    pub rotation3d_max_accel: Vector3<f64>,
    pub rotation3d_resolution: Vector3<f64>,
    pub rotation3d_weights: Vector3<f64>,
    /// Reference quaternion the QUAT parameterization is centered on, so the
    /// working range stays away from the branch cut.
    pub quat_offset: UnitQuaternion<f64>,
    pub quat_limit_max_angle: f64,
    pub quat_max_vel: f64,
    pub quat_max_accel: f64,
    pub quat_resolution: f64,
    pub quat_weight: f64,
}

impl Default for AffineSettings {
    fn default() -> Self {
        AffineSettings {
            rotation_axis: Vector3::z(),
            translation_lower: Vector3::new(-100.0, -100.0, -100.0),
            translation_upper: Vector3::new(100.0, 100.0, 100.0),
            translation_max_vel: Vector3::new(1.0, 1.0, 1.0),
            translation_max_accel: Vector3::new(2.0, 2.0, 2.0),
            translation_resolution: Vector3::new(0.001, 0.001, 0.001),
            translation_weights: Vector3::new(2.0, 2.0, 2.0),
            rotation_axis_lower: -PI,
            rotation_axis_upper: PI,
            rotation_axis_max_vel: 0.07,
            rotation_axis_max_accel: 0.35,
            rotation_axis_resolution: 0.01,
            rotation_axis_weight: 2.0,
            rotation3d_lower: Vector3::new(-10000.0, -10000.0, -10000.0),
            rotation3d_upper: Vector3::new(10000.0, 10000.0, 10000.0),
            rotation3d_max_vel: Vector3::new(0.07, 0.07, 0.07),
            rotation3d_max_accel: Vector3::new(0.35, 0.35, 0.35),
            rotation3d_resolution: Vector3::new(0.01, 0.01, 0.01),
            rotation3d_weights: Vector3::new(1.0, 1.0, 1.0),
            quat_offset: UnitQuaternion::identity(),
            quat_limit_max_angle: PI,
            quat_max_vel: 1.0,
            quat_max_accel: 2.0,
            quat_resolution: 0.01,
            quat_weight: 0.4,
        }
    }
}

impl<M: RigidBodyModel> Robot<M> {
    // ---- selection ----

    /// Select the active DOFs: joint DOF indices (in order) plus affine
    /// base-pose components. Every index must address a valid DOF and appear
    /// once; a failed validation leaves the previous selection untouched.
    pub fn set_active_dofs(&mut self, dof_indices: &[usize], affine: AffineDofs) -> Result<()> {
        let dof = self.model.dof();
        for &index in dof_indices {
            if index >= dof {
                return Err(RobotError::InvalidArgument(format!(
                    "active dof index {} out of range (dof count {})",
                    index, dof
                )));
            }
        }
        for (i, &index) in dof_indices.iter().enumerate() {
            if dof_indices[..i].contains(&index) {
                return Err(RobotError::InvalidArgument(format!(
                    "active dof index {} selected twice",
                    index
                )));
            }
        }

        // Only the DOF selection feeds the adjacency filter; a pure affine
        // change does not invalidate it.
        let changed = match &self.active {
            Some(sel) => sel.dof_indices != dof_indices,
            None => dof_indices.len() != dof || dof_indices.iter().enumerate().any(|(i, &d)| i != d),
        };
        if changed {
            self.adjacency.invalidate_active_dofs();
        }

        self.active = Some(ActiveSelection {
            dof_indices: dof_indices.to_vec(),
            affine: affine.normalized(),
        });
        Ok(())
    }

    /// [`Robot::set_active_dofs`] plus the fixed rotation axis for the
    /// ROTATION_AXIS parameterization.
    pub fn set_active_dofs_with_axis(
        &mut self,
        dof_indices: &[usize],
        affine: AffineDofs,
        axis: Vector3<f64>,
    ) -> Result<()> {
        self.affine.rotation_axis = axis;
        self.set_active_dofs(dof_indices, affine)
    }

    /// Width of the generalized configuration vector.
    pub fn active_dof_count(&self) -> usize {
        match &self.active {
            None => self.model.dof(),
            Some(sel) => sel.dof_indices.len() + sel.affine.dof_count(),
        }
    }

    /// The selected joint DOF indices; all of them when nothing was selected.
    pub fn active_dof_indices(&self) -> Vec<usize> {
        match &self.active {
            None => (0..self.model.dof()).collect(),
            Some(sel) => sel.dof_indices.clone(),
        }
    }

    pub fn active_affine_dofs(&self) -> AffineDofs {
        self.active.as_ref().map_or(AffineDofs::empty(), |sel| sel.affine)
    }

    pub fn affine_settings(&self) -> &AffineSettings {
        &self.affine
    }

    pub fn affine_settings_mut(&mut self) -> &mut AffineSettings {
        &mut self.affine
    }

    /// Configure the quaternion block from a scaled-axis vector: the norm
    /// becomes the angular range, the direction the reference quaternion.
    /// A zero vector centers the range on the current base rotation.
    pub fn set_affine_rotation_quat_limits(&mut self, quat_angle: &na::Vector4<f64>) {
        let angle = quat_angle.norm();
        self.affine.quat_limit_max_angle = angle;
        if angle > 0.0 {
            let q = quat_angle / angle;
            self.affine.quat_offset =
                UnitQuaternion::new_unchecked(Quaternion::new(q[0], q[1], q[2], q[3]));
        } else {
            self.affine.quat_offset = self.model.transform().rotation;
        }
    }

    /// Position of one affine component in the generalized vector, `None`
    /// when it is not selected.
    pub fn affine_dof_index(&self, dof: AffineDofs) -> Option<usize> {
        let sel = self.active.as_ref()?;
        if !sel.affine.contains(dof) {
            return None;
        }
        let mut index = sel.dof_indices.len();
        for flag in [AffineDofs::X, AffineDofs::Y, AffineDofs::Z] {
            if dof == flag {
                return Some(index);
            }
            if sel.affine.contains(flag) {
                index += 1;
            }
        }
        // All rotation blocks start right after the translation components.
        Some(index)
    }

    // ---- values ----

    /// Apply one generalized configuration vector: decode the affine tail
    /// into a base pose, overwrite the selected joint DOFs, and push the
    /// whole update through the model in a single pass.
    pub fn set_active_values(&mut self, values: &[f64]) -> Result<()> {
        let Some(sel) = self.active.clone() else {
            return self.set_dof_values(values);
        };
        let expected = self.active_dof_count();
        if values.len() != expected {
            return Err(RobotError::InvalidArgument(format!(
                "active dof vector length {} does not match active dof count {}",
                values.len(),
                expected
            )));
        }

        let njoints = sel.dof_indices.len();
        let base = if sel.affine.is_empty() {
            None
        } else {
            Some(self.decode_affine_pose(&values[njoints..], sel.affine))
        };

        if njoints > 0 {
            let mut full = self.model.dof_values();
            for (value, &index) in values[..njoints].iter().zip(sel.dof_indices.iter()) {
                full[index] = *value;
            }
            match &base {
                Some(pose) => self.model.set_dof_values_with_base(&full, pose),
                None => self.model.set_dof_values(&full),
            }
        } else if let Some(pose) = &base {
            self.model.set_transform(pose);
        }
        self.refresh_attachments();
        Ok(())
    }

    /// The exact inverse of [`Robot::set_active_values`].
    pub fn active_values(&self) -> Vec<f64> {
        let Some(sel) = &self.active else {
            return self.model.dof_values();
        };
        let mut values = Vec::with_capacity(self.active_dof_count());
        if !sel.dof_indices.is_empty() {
            let full = self.model.dof_values();
            for &index in &sel.dof_indices {
                values.push(full[index]);
            }
        }
        if !sel.affine.is_empty() {
            self.encode_affine_pose(&self.model.transform(), sel.affine, &mut values);
        }
        values
    }

    fn decode_affine_pose(&self, affine_values: &[f64], affine: AffineDofs) -> Pose {
        let mut t = self.model.transform();
        let mut it = affine_values.iter();
        if affine.contains(AffineDofs::X) {
            t.translation.vector.x = *it.next().unwrap();
        }
        if affine.contains(AffineDofs::Y) {
            t.translation.vector.y = *it.next().unwrap();
        }
        if affine.contains(AffineDofs::Z) {
            t.translation.vector.z = *it.next().unwrap();
        }
        if affine.contains(AffineDofs::ROTATION_AXIS) {
            let angle = *it.next().unwrap();
            t.rotation = UnitQuaternion::from_scaled_axis(self.affine.rotation_axis * angle);
        } else if affine.contains(AffineDofs::ROTATION_3D) {
            let x = *it.next().unwrap();
            let y = *it.next().unwrap();
            let z = *it.next().unwrap();
            // Exponential map, identity at zero magnitude.
            t.rotation = UnitQuaternion::from_scaled_axis(Vector3::new(x, y, z));
        } else if affine.contains(AffineDofs::ROTATION_QUAT) {
            let w = *it.next().unwrap();
            let x = *it.next().unwrap();
            let y = *it.next().unwrap();
            let z = *it.next().unwrap();
            // Callers rarely keep the four components normalized.
            let q = UnitQuaternion::from_quaternion(Quaternion::new(w, x, y, z));
            t.rotation = self.affine.quat_offset * q;
        }
        t
    }

    fn encode_affine_pose(&self, t: &Pose, affine: AffineDofs, values: &mut Vec<f64>) {
        if affine.contains(AffineDofs::X) {
            values.push(t.translation.vector.x);
        }
        if affine.contains(AffineDofs::Y) {
            values.push(t.translation.vector.y);
        }
        if affine.contains(AffineDofs::Z) {
            values.push(t.translation.vector.z);
        }
        let q = t.rotation.quaternion();
        if affine.contains(AffineDofs::ROTATION_AXIS) {
            let axis = &self.affine.rotation_axis;
            let mut fsin = (q.i * q.i + q.j * q.j + q.k * q.k).sqrt();
            // The quaternion vector part is parallel to the configured axis;
            // recover the angle sign by comparing component signs.
            if (q.i > 0.0) != (axis.x > 0.0)
                || (q.j > 0.0) != (axis.y > 0.0)
                || (q.k > 0.0) != (axis.z > 0.0)
            {
                fsin = -fsin;
            }
            values.push(2.0 * fsin.atan2(q.w));
        } else if affine.contains(AffineDofs::ROTATION_3D) {
            let fsin = (q.i * q.i + q.j * q.j + q.k * q.k).sqrt();
            let fangle = 2.0 * fsin.atan2(q.w);
            if fsin > 0.0 {
                let normalizer = fangle / fsin;
                values.push(normalizer * q.i);
                values.push(normalizer * q.j);
                values.push(normalizer * q.k);
            } else {
                values.extend_from_slice(&[0.0, 0.0, 0.0]);
            }
        } else if affine.contains(AffineDofs::ROTATION_QUAT) {
            let q = self.affine.quat_offset.inverse() * t.rotation;
            let q = q.quaternion();
            values.extend_from_slice(&[q.w, q.i, q.j, q.k]);
        }
    }

    // ---- velocities ----

    /// Apply a generalized velocity vector; the affine tail maps onto the
    /// base linear/angular velocity.
    pub fn set_active_velocities(&mut self, velocities: &[f64]) -> Result<()> {
        let Some(sel) = self.active.clone() else {
            if velocities.len() != self.model.dof() {
                return Err(RobotError::InvalidArgument(format!(
                    "velocity vector length {} does not match dof count {}",
                    velocities.len(),
                    self.model.dof()
                )));
            }
            self.model.set_dof_velocities(velocities);
            return Ok(());
        };
        let expected = self.active_dof_count();
        if velocities.len() != expected {
            return Err(RobotError::InvalidArgument(format!(
                "velocity vector length {} does not match active dof count {}",
                velocities.len(),
                expected
            )));
        }
        if sel.affine.contains(AffineDofs::ROTATION_QUAT) {
            return Err(RobotError::UnsupportedOperation(
                "quaternion velocities are not defined".to_string(),
            ));
        }

        let njoints = sel.dof_indices.len();
        if !sel.affine.is_empty() {
            let (mut linear, mut angular) = self.model.base_velocity();
            let mut it = velocities[njoints..].iter();
            if sel.affine.contains(AffineDofs::X) {
                linear.x = *it.next().unwrap();
            }
            if sel.affine.contains(AffineDofs::Y) {
                linear.y = *it.next().unwrap();
            }
            if sel.affine.contains(AffineDofs::Z) {
                linear.z = *it.next().unwrap();
            }
            if sel.affine.contains(AffineDofs::ROTATION_AXIS) {
                angular = self.affine.rotation_axis * *it.next().unwrap();
            } else if sel.affine.contains(AffineDofs::ROTATION_3D) {
                angular.x = *it.next().unwrap();
                angular.y = *it.next().unwrap();
                angular.z = *it.next().unwrap();
            }
            self.model.set_base_velocity(linear, angular);
        }
        if njoints > 0 {
            let mut full = self.model.dof_velocities();
            for (vel, &index) in velocities[..njoints].iter().zip(sel.dof_indices.iter()) {
                full[index] = *vel;
            }
            self.model.set_dof_velocities(&full);
        }
        Ok(())
    }

    pub fn active_velocities(&self) -> Result<Vec<f64>> {
        let Some(sel) = &self.active else {
            return Ok(self.model.dof_velocities());
        };
        if sel.affine.contains(AffineDofs::ROTATION_QUAT) {
            return Err(RobotError::UnsupportedOperation(
                "quaternion velocities are not defined".to_string(),
            ));
        }
        let mut velocities = Vec::with_capacity(self.active_dof_count());
        if !sel.dof_indices.is_empty() {
            let full = self.model.dof_velocities();
            for &index in &sel.dof_indices {
                velocities.push(full[index]);
            }
        }
        if !sel.affine.is_empty() {
            let (linear, angular) = self.model.base_velocity();
            if sel.affine.contains(AffineDofs::X) {
                velocities.push(linear.x);
            }
            if sel.affine.contains(AffineDofs::Y) {
                velocities.push(linear.y);
            }
            if sel.affine.contains(AffineDofs::Z) {
                velocities.push(linear.z);
            }
            if sel.affine.contains(AffineDofs::ROTATION_AXIS) {
                velocities.push(self.affine.rotation_axis.dot(&angular));
            } else if sel.affine.contains(AffineDofs::ROTATION_3D) {
                velocities.push(angular.x);
                velocities.push(angular.y);
                velocities.push(angular.z);
            }
        }
        Ok(velocities)
    }

    // ---- limits, resolutions, weights, bounds ----

    pub fn active_dof_limits(&self) -> (Vec<f64>, Vec<f64>) {
        let Some(sel) = &self.active else {
            return self.model.dof_limits();
        };
        let mut lower = Vec::with_capacity(self.active_dof_count());
        let mut upper = Vec::with_capacity(self.active_dof_count());
        if !sel.dof_indices.is_empty() {
            let (all_lower, all_upper) = self.model.dof_limits();
            for &index in &sel.dof_indices {
                lower.push(all_lower[index]);
                upper.push(all_upper[index]);
            }
        }
        let a = &self.affine;
        for (flag, lo, hi) in [
            (AffineDofs::X, a.translation_lower.x, a.translation_upper.x),
            (AffineDofs::Y, a.translation_lower.y, a.translation_upper.y),
            (AffineDofs::Z, a.translation_lower.z, a.translation_upper.z),
        ] {
            if sel.affine.contains(flag) {
                lower.push(lo);
                upper.push(hi);
            }
        }
        if sel.affine.contains(AffineDofs::ROTATION_AXIS) {
            lower.push(a.rotation_axis_lower);
            upper.push(a.rotation_axis_upper);
        } else if sel.affine.contains(AffineDofs::ROTATION_3D) {
            for i in 0..3 {
                lower.push(a.rotation3d_lower[i]);
                upper.push(a.rotation3d_upper[i]);
            }
        } else if sel.affine.contains(AffineDofs::ROTATION_QUAT) {
            // A box is a crude fit for a quaternion ball of the configured
            // angular radius.
            let fsin = a.quat_limit_max_angle.sin();
            lower.push(a.quat_limit_max_angle.cos());
            upper.push(1.0);
            for _ in 0..3 {
                lower.push(-fsin);
                upper.push(fsin);
            }
        }
        (lower, upper)
    }

    pub fn active_dof_resolutions(&self) -> Vec<f64> {
        let a = &self.affine;
        self.marshal_active(
            |model| model.dof_resolutions(),
            [
                a.translation_resolution.x,
                a.translation_resolution.y,
                a.translation_resolution.z,
            ],
            [a.rotation_axis_resolution],
            [
                a.rotation3d_resolution.x,
                a.rotation3d_resolution.y,
                a.rotation3d_resolution.z,
            ],
            [a.quat_resolution; 4],
        )
    }

    pub fn active_dof_weights(&self) -> Vec<f64> {
        let a = &self.affine;
        self.marshal_active(
            |model| model.dof_weights(),
            [
                a.translation_weights.x,
                a.translation_weights.y,
                a.translation_weights.z,
            ],
            [a.rotation_axis_weight],
            [
                a.rotation3d_weights.x,
                a.rotation3d_weights.y,
                a.rotation3d_weights.z,
            ],
            [a.quat_weight; 4],
        )
    }

    pub fn active_dof_max_velocities(&self) -> Vec<f64> {
        let a = &self.affine;
        self.marshal_active(
            |model| model.dof_max_velocities(),
            [
                a.translation_max_vel.x,
                a.translation_max_vel.y,
                a.translation_max_vel.z,
            ],
            [a.rotation_axis_max_vel],
            [
                a.rotation3d_max_vel.x,
                a.rotation3d_max_vel.y,
                a.rotation3d_max_vel.z,
            ],
            [a.quat_max_vel; 4],
        )
    }

    pub fn active_dof_max_accelerations(&self) -> Vec<f64> {
        let a = &self.affine;
        self.marshal_active(
            |model| model.dof_max_accelerations(),
            [
                a.translation_max_accel.x,
                a.translation_max_accel.y,
                a.translation_max_accel.z,
            ],
            [a.rotation_axis_max_accel],
            [
                a.rotation3d_max_accel.x,
                a.rotation3d_max_accel.y,
                a.rotation3d_max_accel.z,
            ],
            [a.quat_max_accel; 4],
        )
    }

    /// Shared layout walk for the per-DOF quantity getters: joint values
    /// from the model, then the affine defaults for whatever is selected.
    fn marshal_active(
        &self,
        full: impl Fn(&M) -> Vec<f64>,
        translation: [f64; 3],
        axis: [f64; 1],
        rotation3d: [f64; 3],
        quat: [f64; 4],
    ) -> Vec<f64> {
        let Some(sel) = &self.active else {
            return full(&self.model);
        };
        let mut out = Vec::with_capacity(self.active_dof_count());
        if !sel.dof_indices.is_empty() {
            let all = full(&self.model);
            for &index in &sel.dof_indices {
                out.push(all[index]);
            }
        }
        for (flag, value) in [AffineDofs::X, AffineDofs::Y, AffineDofs::Z]
            .into_iter()
            .zip(translation)
        {
            if sel.affine.contains(flag) {
                out.push(value);
            }
        }
        if sel.affine.contains(AffineDofs::ROTATION_AXIS) {
            out.extend_from_slice(&axis);
        } else if sel.affine.contains(AffineDofs::ROTATION_3D) {
            out.extend_from_slice(&rotation3d);
        } else if sel.affine.contains(AffineDofs::ROTATION_QUAT) {
            out.extend_from_slice(&quat);
        }
        out
    }

    // ---- differences ----

    /// Componentwise `a - b` in the active layout. Circular joint DOFs and
    /// the rotation-axis angle wrap into (-PI, PI]; everything else
    /// subtracts plainly.
    pub fn subtract_active_values(&self, a: &[f64], b: &[f64]) -> Result<Vec<f64>> {
        let expected = self.active_dof_count();
        if a.len() != expected || b.len() != expected {
            return Err(RobotError::InvalidArgument(format!(
                "subtract operands must have length {}, got {} and {}",
                expected,
                a.len(),
                b.len()
            )));
        }
        let indices = self.active_dof_indices();
        let affine = self.active_affine_dofs();
        let mut out = Vec::with_capacity(expected);
        for (i, &dof) in indices.iter().enumerate() {
            let joint = self.model.joint_from_dof(dof);
            let circular = joint
                .dof_offset
                .map(|offset| joint.circular[dof - offset])
                .unwrap_or(false);
            if circular {
                out.push(angle_diff(a[i], b[i]));
            } else {
                out.push(a[i] - b[i]);
            }
        }
        let mut index = indices.len();
        for flag in [AffineDofs::X, AffineDofs::Y, AffineDofs::Z] {
            if affine.contains(flag) {
                out.push(a[index] - b[index]);
                index += 1;
            }
        }
        if affine.contains(AffineDofs::ROTATION_AXIS) {
            out.push(angle_diff(a[index], b[index]));
        } else if affine.intersects(AffineDofs::ROTATION_3D | AffineDofs::ROTATION_QUAT) {
            for i in index..expected {
                out.push(a[i] - b[i]);
            }
        }
        Ok(out)
    }

    // ---- Jacobians ----

    /// Positional Jacobian of a world point rigidly attached to `link`,
    /// 3 x active_dof_count(), in the active layout.
    pub fn calculate_active_jacobian(
        &self,
        link: usize,
        point: &Point3<f64>,
    ) -> Result<DMatrix<f64>> {
        self.check_link_index(link)?;
        let Some(sel) = &self.active else {
            return Ok(self.model.positional_jacobian(link, point));
        };
        let mut jacobian = DMatrix::zeros(3, self.active_dof_count());
        if !sel.dof_indices.is_empty() {
            let full = self.model.positional_jacobian(link, point);
            for (i, &dof) in sel.dof_indices.iter().enumerate() {
                jacobian.column_mut(i).copy_from(&full.column(dof));
            }
        }

        let mut ind = sel.dof_indices.len();
        for (flag, axis) in [
            (AffineDofs::X, Vector3::x()),
            (AffineDofs::Y, Vector3::y()),
            (AffineDofs::Z, Vector3::z()),
        ] {
            if sel.affine.contains(flag) {
                jacobian.column_mut(ind).copy_from(&axis);
                ind += 1;
            }
        }
        if sel.affine.contains(AffineDofs::ROTATION_AXIS) {
            let origin = self.model.transform().translation.vector;
            let column = self.affine.rotation_axis.cross(&(point.coords - origin));
            jacobian.column_mut(ind).copy_from(&column);
        } else if sel.affine.contains(AffineDofs::ROTATION_3D) {
            let t = self.model.transform();
            let d_rq = translation_quat_derivative(&t, point);
            let d_qa = quat_expmap_derivative(&t.rotation);
            for i in 0..3 {
                for j in 0..3 {
                    let mut sum = 0.0;
                    for k in 0..4 {
                        sum += d_rq[i][k] * d_qa[k][j];
                    }
                    jacobian[(i, ind + j)] = sum;
                }
            }
        } else if sel.affine.contains(AffineDofs::ROTATION_QUAT) {
            // Differentiate in the offset-relative parameterization the
            // caller actually controls.
            let mut t = self.model.transform();
            t.rotation = self.affine.quat_offset.inverse() * t.rotation;
            let d_rq = translation_quat_derivative(&t, point);
            for i in 0..3 {
                for j in 0..4 {
                    jacobian[(i, ind + j)] = d_rq[i][j];
                }
            }
        }
        Ok(jacobian)
    }

    /// Quaternion-rotation Jacobian of `link`, 4 x active_dof_count(), rows
    /// in (w, i, j, k) order. The 3D and quaternion affine blocks have no
    /// implemented derivative and are rejected.
    pub fn calculate_active_rotation_jacobian(
        &self,
        link: usize,
        quat: &Quaternion<f64>,
    ) -> Result<DMatrix<f64>> {
        self.check_link_index(link)?;
        let Some(sel) = &self.active else {
            return Ok(self.model.rotation_jacobian(link, quat));
        };
        if sel.affine.contains(AffineDofs::ROTATION_3D) {
            return Err(RobotError::UnsupportedOperation(
                "rotation jacobian of the 3d rotation block is not derived".to_string(),
            ));
        }
        if sel.affine.contains(AffineDofs::ROTATION_QUAT) {
            return Err(RobotError::UnsupportedOperation(
                "rotation jacobian of the quaternion block is not derived".to_string(),
            ));
        }
        let mut jacobian = DMatrix::zeros(4, self.active_dof_count());
        if !sel.dof_indices.is_empty() {
            let full = self.model.rotation_jacobian(link, quat);
            for (i, &dof) in sel.dof_indices.iter().enumerate() {
                jacobian.column_mut(i).copy_from(&full.column(dof));
            }
        }
        // Translation components do not rotate anything; their columns stay
        // zero.
        let ind = sel.dof_indices.len() + (sel.affine & (AffineDofs::X | AffineDofs::Y | AffineDofs::Z)).dof_count();
        if sel.affine.contains(AffineDofs::ROTATION_AXIS) {
            let v = &self.affine.rotation_axis;
            jacobian[(0, ind)] = 0.5 * (-quat.i * v.x - quat.j * v.y - quat.k * v.z);
            jacobian[(1, ind)] = 0.5 * (quat.w * v.x - quat.j * v.z + quat.k * v.y);
            jacobian[(2, ind)] = 0.5 * (quat.w * v.y + quat.i * v.z - quat.k * v.x);
            jacobian[(3, ind)] = 0.5 * (quat.w * v.z - quat.i * v.y + quat.j * v.x);
        }
        Ok(jacobian)
    }

    /// Angular-velocity Jacobian of `link`, 3 x active_dof_count(). The 3D
    /// and quaternion affine blocks are rejected as for the rotation
    /// Jacobian.
    pub fn calculate_active_angular_velocity_jacobian(&self, link: usize) -> Result<DMatrix<f64>> {
        self.check_link_index(link)?;
        let Some(sel) = &self.active else {
            return Ok(self.model.angular_velocity_jacobian(link));
        };
        if sel.affine.contains(AffineDofs::ROTATION_3D) {
            return Err(RobotError::UnsupportedOperation(
                "angular velocity jacobian of the 3d rotation block is not derived".to_string(),
            ));
        }
        if sel.affine.contains(AffineDofs::ROTATION_QUAT) {
            return Err(RobotError::UnsupportedOperation(
                "angular velocity jacobian of the quaternion block is not derived".to_string(),
            ));
        }
        let mut jacobian = DMatrix::zeros(3, self.active_dof_count());
        if !sel.dof_indices.is_empty() {
            let full = self.model.angular_velocity_jacobian(link);
            for (i, &dof) in sel.dof_indices.iter().enumerate() {
                jacobian.column_mut(i).copy_from(&full.column(dof));
            }
        }
        let ind = sel.dof_indices.len() + (sel.affine & (AffineDofs::X | AffineDofs::Y | AffineDofs::Z)).dof_count();
        if sel.affine.contains(AffineDofs::ROTATION_AXIS) {
            jacobian.column_mut(ind).copy_from(&self.affine.rotation_axis);
        }
        Ok(jacobian)
    }

    fn check_link_index(&self, link: usize) -> Result<()> {
        if link >= self.model.link_count() {
            return Err(RobotError::InvalidArgument(format!(
                "link index {} out of range (link count {})",
                link,
                self.model.link_count()
            )));
        }
        Ok(())
    }
}

/// dT/dQ: how the world position of `point` moves per quaternion component,
/// 3 rows x 4 columns, quaternion in (w, i, j, k) order.
fn translation_quat_derivative(t: &Pose, point: &Point3<f64>) -> [[f64; 4]; 3] {
    let q = t.rotation.quaternion();
    let (qw, qi, qj, qk) = (q.w, q.i, q.j, q.k);
    let tx = point.x - t.translation.vector.x;
    let ty = point.y - t.translation.vector.y;
    let tz = point.z - t.translation.vector.z;
    [
        [
            2.0 * qi * ty + 2.0 * qj * tz,
            -4.0 * qi * tx + 2.0 * qw * ty + 2.0 * qk * tz,
            -4.0 * qj * tx - 2.0 * qk * ty + 2.0 * qw * tz,
            -2.0 * qj * ty + 2.0 * qi * tz,
        ],
        [
            2.0 * qi * tx - 4.0 * qw * ty - 2.0 * qk * tz,
            2.0 * qw * tx + 2.0 * qj * tz,
            2.0 * qk * tx - 4.0 * qj * ty + 2.0 * qi * tz,
            2.0 * qj * tx - 2.0 * qw * tz,
        ],
        [
            2.0 * qj * tx + 2.0 * qk * ty - 4.0 * qw * tz,
            -2.0 * qk * tx + 2.0 * qj * ty - 4.0 * qi * tz,
            2.0 * qw * tx + 2.0 * qi * ty,
            -2.0 * qi * tx + 2.0 * qw * ty,
        ],
    ]
}

/// dQ/dA: quaternion per exponential-map component, 4 rows x 3 columns.
/// The rotation angle is floored at 1e-8 near identity so the division by
/// the angle stays finite.
fn quat_expmap_derivative(rotation: &UnitQuaternion<f64>) -> [[f64; 3]; 4] {
    let q = rotation.quaternion();
    let fsin = (q.i * q.i + q.j * q.j + q.k * q.k).sqrt();
    let fcos = q.w;
    let mut fangle = 2.0 * fsin.atan2(fcos);
    let (ax, ay, az, normalizer) = if fsin > 1e-12 {
        let n = fangle / fsin;
        (n * q.i, n * q.j, n * q.k, n)
    } else {
        // angle/sin(angle/2) -> 2 as the rotation approaches identity.
        (0.0, 0.0, 0.0, 2.0)
    };
    if fangle.abs() < 1e-8 {
        fangle = 1e-8;
    }
    let fiangle2 = 1.0 / (fangle * fangle);
    let inormalizer = if normalizer > 0.0 { 1.0 / normalizer } else { 0.0 };
    let fconst = inormalizer * fiangle2;
    let fconst2 = fcos * fiangle2;
    [
        [
            -0.5 * ax * inormalizer,
            -0.5 * ay * inormalizer,
            -0.5 * az * inormalizer,
        ],
        [
            inormalizer + 0.5 * ax * ax * (fconst2 - fconst),
            0.5 * ax * fconst2 * ay - ax * fconst * ay,
            0.5 * ax * fconst2 * az - ax * fconst * az,
        ],
        [
            0.5 * ax * fconst2 * ay - ax * fconst * ay,
            inormalizer + 0.5 * ay * ay * (fconst2 - fconst),
            0.5 * ay * fconst2 * az - ay * fconst * az,
        ],
        [
            0.5 * ax * fconst2 * az - ax * fconst * az,
            0.5 * ay * fconst2 * az - ay * fconst * az,
            inormalizer + 0.5 * az * az * (fconst2 - fconst),
        ],
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_affine_dof_count() {
        assert_eq!(AffineDofs::empty().dof_count(), 0);
        assert_eq!((AffineDofs::X | AffineDofs::Y | AffineDofs::Z).dof_count(), 3);
        assert_eq!((AffineDofs::X | AffineDofs::ROTATION_AXIS).dof_count(), 2);
        assert_eq!((AffineDofs::Z | AffineDofs::ROTATION_3D).dof_count(), 4);
        assert_eq!(AffineDofs::ROTATION_QUAT.dof_count(), 4);
    }

    #[test]
    fn test_rotation_flags_are_exclusive_after_normalization() {
        let mask = (AffineDofs::ROTATION_AXIS | AffineDofs::ROTATION_3D | AffineDofs::ROTATION_QUAT)
            .normalized();
        assert_eq!(mask, AffineDofs::ROTATION_AXIS);
        let mask = (AffineDofs::ROTATION_3D | AffineDofs::ROTATION_QUAT).normalized();
        assert_eq!(mask, AffineDofs::ROTATION_3D);
        assert_eq!(AffineDofs::ROTATION_QUAT.normalized(), AffineDofs::ROTATION_QUAT);
    }

    #[test]
    fn test_expmap_derivative_finite_at_identity() {
        let d = quat_expmap_derivative(&UnitQuaternion::identity());
        for row in &d {
            for v in row {
                assert!(v.is_finite());
            }
        }
        // At identity dQ/dA is 0.5 on the vector diagonal, zero elsewhere.
        assert!((d[1][0] - 0.5).abs() < 1e-12);
        assert!((d[2][1] - 0.5).abs() < 1e-12);
        assert!((d[3][2] - 0.5).abs() < 1e-12);
        assert!(d[0][0].abs() < 1e-12 && d[0][1].abs() < 1e-12 && d[0][2].abs() < 1e-12);
    }
}
