//! Manipulators: named base-to-end-effector kinematic sub-chains with an
//! optional bound IK solver.
//!
//! A manipulator does not walk the joint graph itself; the arm DOF sequence
//! is derived at finalization from the model's chain query, and the child /
//! independent link sets are derived on demand from per-DOF influence
//! queries. Operations needing robot-wide state are methods on [`Robot`]
//! taking a [`ManipulatorHandle`], so no back-reference to the owning robot
//! is ever stored.

extern crate nalgebra as na;

use na::{Quaternion, Vector3};
use tracing::warn;

use crate::active::AffineDofs;
use crate::errors::{Result, RobotError};
use crate::fingerprint::{digest, fmt_pose, fmt_real, fmt_vec3, SerializationFlags};
use crate::ik::{IkFilterOptions, IkSolverRef};
use crate::model::{BodyRef, Pose, RigidBodyModel, SceneBody};
use crate::robot::Robot;
use crate::snapshot::SnapshotOptions;

/// Index-stable handle to a manipulator. The manipulator collection only
/// grows, so a handle never dangles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ManipulatorHandle(pub(crate) usize);

impl ManipulatorHandle {
    pub fn index(self) -> usize {
        self.0
    }
}

pub struct Manipulator {
    pub name: String,
    /// Link the IK goal frame is relative to; `None` means the world frame.
    pub base: Option<usize>,
    /// Link carrying the gripper.
    pub end_effector: usize,
    /// Grasp frame relative to the end-effector link.
    pub grasp: Pose,
    /// Palm/approach direction in the grasp frame.
    pub direction: Vector3<f64>,
    pub gripper_dofs: Vec<usize>,
    /// Per-gripper-DOF closing sign.
    pub closing_direction: Vec<f64>,
    pub(crate) arm_dofs: Vec<usize>,
    pub(crate) ik_solver: Option<IkSolverRef>,
    pub(crate) structure_hash: String,
    pub(crate) kinematics_hash: String,
}

impl Manipulator {
    pub fn new(name: impl Into<String>, base: Option<usize>, end_effector: usize) -> Self {
        Manipulator {
            name: name.into(),
            base,
            end_effector,
            grasp: Pose::identity(),
            direction: Vector3::z(),
            gripper_dofs: Vec::new(),
            closing_direction: Vec::new(),
            arm_dofs: Vec::new(),
            ik_solver: None,
            structure_hash: String::new(),
            kinematics_hash: String::new(),
        }
    }

    /// DOF indices of the arm, in chain order, mimic joints expanded to
    /// their source DOFs. Derived at finalization.
    pub fn arm_dof_indices(&self) -> &[usize] {
        &self.arm_dofs
    }

    pub fn has_ik_solver(&self) -> bool {
        self.ik_solver.is_some()
    }

    /// Free parameter count of the bound solver; 0 without one.
    pub fn num_free_parameters(&self) -> usize {
        match &self.ik_solver {
            Some(solver) => solver.borrow().num_free_parameters(),
            None => 0,
        }
    }

    /// Free parameter values of the bound solver; `false` without one.
    pub fn free_parameters(&self, out: &mut Vec<f64>) -> bool {
        match &self.ik_solver {
            Some(solver) => solver.borrow().free_parameters(out),
            None => false,
        }
    }

    /// Hash over the manipulator definition, an external cache key.
    pub fn structure_fingerprint(&self) -> &str {
        &self.structure_hash
    }

    /// Hash over the solvable chain only (what an IK database keys on).
    pub fn kinematics_fingerprint(&self) -> &str {
        &self.kinematics_hash
    }

    /// Canonical dump of this manipulator for fingerprinting; deterministic
    /// for identical structure.
    pub fn serialize<M: RigidBodyModel>(
        &self,
        model: &M,
        flags: SerializationFlags,
        out: &mut String,
    ) {
        if flags.contains(SerializationFlags::MANIPULATORS) {
            out.push_str(&format!(
                "manip {} {} ",
                self.base.map(|b| b as i64).unwrap_or(-1),
                self.end_effector
            ));
            out.push_str(&format!(
                "{} {} {} ",
                self.gripper_dofs.len(),
                self.arm_dofs.len(),
                self.closing_direction.len()
            ));
            for dof in &self.gripper_dofs {
                out.push_str(&format!("{} ", dof));
            }
            for dof in &self.arm_dofs {
                out.push_str(&format!("{} ", dof));
            }
            for dir in &self.closing_direction {
                fmt_real(out, *dir);
            }
            fmt_pose(out, &self.grasp);
        }
        if flags.contains(SerializationFlags::KINEMATICS) {
            out.push_str(&format!(
                "chain {} {} {} ",
                self.base.map(|b| b as i64).unwrap_or(-1),
                self.end_effector,
                self.arm_dofs.len()
            ));
            for &dof in &self.arm_dofs {
                let joint = model.joint_from_dof(dof);
                let offset = joint.dof_offset.unwrap_or(0);
                out.push_str(&format!(
                    "{} {} {} ",
                    joint.index,
                    dof - offset,
                    joint.circular[dof - offset] as u8
                ));
                fmt_real(out, joint.lower_limits[dof - offset]);
                fmt_real(out, joint.upper_limits[dof - offset]);
            }
            // The arm may be driven by mimic joints; their equations are
            // part of the solvable structure.
            if let Some(base) = self.base {
                if let Some(chain) = model.chain(base, self.end_effector) {
                    for (position, joint_index) in chain.iter().enumerate() {
                        let joint = model.joint(*joint_index);
                        if joint.is_static {
                            continue;
                        }
                        if let Some(mimic) = &joint.mimic {
                            out.push_str(&format!("mimic {} ", position));
                            for eq in &mimic.equations {
                                out.push_str(eq);
                                out.push(' ');
                            }
                        }
                    }
                }
            }
            fmt_pose(out, &self.grasp);
        }
        if flags.intersects(SerializationFlags::MANIPULATORS | SerializationFlags::KINEMATICS) {
            fmt_vec3(out, &self.direction);
        }
    }
}

/// Recompute the arm DOF sequence of one manipulator from the model's
/// base-to-end-effector chain. Static joints are skipped, mimic joints
/// expand to their source DOFs (deduplicated, discovery order), joints with
/// no assigned DOF index are skipped with a warning.
pub(crate) fn derive_arm_dofs<M: RigidBodyModel>(model: &M, manip: &mut Manipulator) {
    manip.arm_dofs.clear();
    let Some(base) = manip.base else {
        warn!(
            manipulator = %manip.name,
            "manipulator has no base link, arm dof indices stay empty"
        );
        return;
    };
    let Some(chain) = model.chain(base, manip.end_effector) else {
        warn!(
            manipulator = %manip.name,
            base,
            end_effector = manip.end_effector,
            "failed to find chain between base and end effector links"
        );
        return;
    };
    for joint_index in chain {
        let joint = model.joint(joint_index);
        if joint.is_static {
            continue;
        }
        if let Some(mimic) = &joint.mimic {
            for &source in &mimic.source_dofs {
                if !manip.arm_dofs.contains(&source) {
                    manip.arm_dofs.push(source);
                }
            }
        } else if joint.dof_offset.is_none() {
            warn!(
                manipulator = %manip.name,
                joint = %joint.name,
                "manipulator arm contains joint without a dof index, ignoring"
            );
        } else {
            manip.arm_dofs.extend(joint.dof_range());
        }
    }
}

pub(crate) fn manipulator_hashes<M: RigidBodyModel>(
    model: &M,
    manip: &Manipulator,
) -> (String, String) {
    let mut dump = String::new();
    manip.serialize(model, SerializationFlags::MANIPULATORS, &mut dump);
    let structure = digest(&dump);
    dump.clear();
    manip.serialize(model, SerializationFlags::KINEMATICS, &mut dump);
    (structure, digest(&dump))
}

impl<M: RigidBodyModel> Robot<M> {
    /// Bind (or unbind with `None`) an IK solver. Binding initializes the
    /// solver against this manipulator; a failed init leaves it unbound.
    pub fn set_ik_solver(&mut self, handle: ManipulatorHandle, solver: Option<IkSolverRef>) -> bool {
        match solver {
            None => {
                self.manipulators[handle.0].ik_solver = None;
                true
            }
            Some(solver) => {
                let bound = solver.borrow_mut().init(handle);
                if bound {
                    self.manipulators[handle.0].ik_solver = Some(solver);
                } else {
                    warn!(
                        manipulator = %self.manipulators[handle.0].name,
                        "ik solver refused to initialize, leaving manipulator unbound"
                    );
                }
                bound
            }
        }
    }

    /// World pose of the grasp frame.
    pub fn end_effector_transform(&self, handle: ManipulatorHandle) -> Pose {
        let manip = &self.manipulators[handle.0];
        self.model.link_transform(manip.end_effector) * manip.grasp
    }

    // ---- derived link sets ----

    /// Links that move rigidly with the gripper: the end effector, its
    /// rigidly attached cluster, and every link strictly downstream of the
    /// whole arm.
    pub fn child_links(&self, handle: ManipulatorHandle) -> Vec<usize> {
        let manip = &self.manipulators[handle.0];
        let ee = manip.end_effector;
        let mut links = vec![ee];
        links.extend(self.model.link(ee).rigidly_attached.iter().copied());
        for link in 0..self.model.link_count() {
            if links.contains(&link) {
                continue;
            }
            if self.link_is_arm_child(manip, link) {
                links.push(link);
            }
        }
        links
    }

    pub fn is_child_link(&self, handle: ManipulatorHandle, link: usize) -> bool {
        let manip = &self.manipulators[handle.0];
        if link == manip.end_effector
            || self.model.link(manip.end_effector).rigidly_attached.contains(&link)
        {
            return true;
        }
        self.link_is_arm_child(manip, link)
    }

    /// Strictly-downstream test: every arm DOF influences the link, and at
    /// least one DOF influences the link without influencing the end
    /// effector. Side branches fail the first clause, the arm itself fails
    /// the second.
    fn link_is_arm_child(&self, manip: &Manipulator, link: usize) -> bool {
        if link == manip.end_effector {
            return false;
        }
        if manip
            .arm_dofs
            .iter()
            .any(|&dof| !self.model.dof_affects_link(dof, link))
        {
            return false;
        }
        (0..self.model.dof()).any(|dof| {
            self.model.dof_affects_link(dof, link)
                && !self.model.dof_affects_link(dof, manip.end_effector)
        })
    }

    /// Joints strictly downstream of the arm with at least one
    /// non-degenerate DOF (dummy joints with equal limits are skipped).
    pub fn child_joints(&self, handle: ManipulatorHandle) -> Vec<usize> {
        let manip = &self.manipulators[handle.0];
        let ee = manip.end_effector;
        let mut joints = Vec::new();
        for link in 0..self.model.link_count() {
            if link == ee || !self.link_is_arm_child(manip, link) {
                continue;
            }
            for dof in 0..self.model.dof() {
                let joint = self.model.joint_from_dof(dof);
                if joints.contains(&joint.index) {
                    continue;
                }
                if self.model.dof_affects_link(dof, link)
                    && !self.model.dof_affects_link(dof, ee)
                    && joint.has_nondegenerate_dof()
                {
                    joints.push(joint.index);
                }
            }
        }
        joints
    }

    /// DOF indices of the child joints, expanded in joint order.
    pub fn child_dof_indices(&self, handle: ManipulatorHandle) -> Vec<usize> {
        self.child_joints(handle)
            .into_iter()
            .flat_map(|joint| self.model.joint(joint).dof_range())
            .collect()
    }

    /// Links influenced by neither the arm nor the gripper DOFs. These can
    /// never move relative to the robot base under manipulator motion.
    pub fn independent_links(&self, handle: ManipulatorHandle) -> Vec<usize> {
        let manip = &self.manipulators[handle.0];
        (0..self.model.link_count())
            .filter(|&link| {
                !manip
                    .arm_dofs
                    .iter()
                    .chain(manip.gripper_dofs.iter())
                    .any(|&dof| self.model.dof_affects_link(dof, link))
            })
            .collect()
    }

    // ---- inverse kinematics ----

    /// One IK solution for `goal`, written into `solution`. Needs a bound
    /// solver; the goal is moved into the base link frame and the solve is
    /// seeded with the current arm configuration.
    pub fn find_ik_solution(
        &self,
        handle: ManipulatorHandle,
        goal: &Pose,
        free_parameters: &[f64],
        options: IkFilterOptions,
        solution: &mut Vec<f64>,
    ) -> Result<bool> {
        let manip = &self.manipulators[handle.0];
        let solver = self.checked_solver(manip, handle)?;
        let seed = self.arm_values(manip);
        let local_goal = self.goal_in_base_frame(manip, goal);
        Ok(solver
            .borrow_mut()
            .solve(&local_goal, &seed, free_parameters, options, solution))
    }

    /// Every IK solution for `goal`, appended to `solutions`.
    pub fn find_ik_solutions(
        &self,
        handle: ManipulatorHandle,
        goal: &Pose,
        free_parameters: &[f64],
        options: IkFilterOptions,
        solutions: &mut Vec<Vec<f64>>,
    ) -> Result<bool> {
        let manip = &self.manipulators[handle.0];
        let solver = self.checked_solver(manip, handle)?;
        let seed = self.arm_values(manip);
        let local_goal = self.goal_in_base_frame(manip, goal);
        Ok(solver
            .borrow_mut()
            .solve_all(&local_goal, &seed, free_parameters, options, solutions))
    }

    fn checked_solver(&self, manip: &Manipulator, handle: ManipulatorHandle) -> Result<IkSolverRef> {
        let solver = manip.ik_solver.clone().ok_or_else(|| {
            RobotError::PreconditionViolation(format!(
                "manipulator {}:{} does not have an IK solver set",
                self.model.name(),
                manip.name
            ))
        })?;
        let bound = solver.borrow().bound_manipulator();
        if bound != Some(handle) {
            return Err(RobotError::PreconditionViolation(format!(
                "ik solver of manipulator {} is bound to a different manipulator",
                manip.name
            )));
        }
        Ok(solver)
    }

    fn arm_values(&self, manip: &Manipulator) -> Vec<f64> {
        let full = self.model.dof_values();
        manip.arm_dofs.iter().map(|&dof| full[dof]).collect()
    }

    fn goal_in_base_frame(&self, manip: &Manipulator, goal: &Pose) -> Pose {
        match manip.base {
            Some(base) => self.model.link_transform(base).inverse() * goal,
            None => *goal,
        }
    }

    // ---- collision probing ----

    /// Would the gripper collide if the grasp frame were at `ee_pose`? The
    /// pose delta is applied to the end-effector cluster and every child
    /// link inside the query only; no persisted transform changes.
    pub fn check_end_effector_collision(
        &self,
        handle: ManipulatorHandle,
        ee_pose: &Pose,
        mut report: Option<&mut crate::collision::CollisionReport>,
    ) -> Result<bool> {
        self.require_checker()?;
        let manip = &self.manipulators[handle.0];
        let delta = ee_pose * self.end_effector_transform(handle).inverse();

        let mut cluster = vec![manip.end_effector];
        cluster.extend(self.model.link(manip.end_effector).rigidly_attached.iter().copied());
        for &link in &cluster {
            let pose = delta * self.model.link_transform(link);
            if self.check_link_collision(link, &pose, report.as_deref_mut())? {
                return Ok(true);
            }
        }
        for link in 0..self.model.link_count() {
            if cluster.contains(&link) || !self.model.link(link).enabled {
                continue;
            }
            if !self.link_is_arm_child(manip, link) {
                continue;
            }
            let pose = delta * self.model.link_transform(link);
            if self.check_link_collision(link, &pose, report.as_deref_mut())? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Check every independent link against the environment, including
    /// grabbed bodies held by independent links (those cannot be moved by
    /// this manipulator, so one check covers every candidate arm motion).
    pub fn check_independent_collision(
        &self,
        handle: ManipulatorHandle,
        mut report: Option<&mut crate::collision::CollisionReport>,
    ) -> Result<bool> {
        let checker = self.require_checker()?;
        for link in self.independent_links(handle) {
            if !self.model.link(link).enabled {
                continue;
            }
            let pose = self.model.link_transform(link);
            if checker.link_environment(link, &pose, report.as_deref_mut()) {
                return Ok(true);
            }
            for grab in self.grabs.iter().filter(|g| g.link == link) {
                if let Some(body) = grab.body.upgrade() {
                    let body_pose = body.borrow().transform();
                    if checker.body_environment(&body, &body_pose, report.as_deref_mut()) {
                        return Ok(true);
                    }
                }
            }
        }
        Ok(false)
    }

    /// True when the grabbed body is held by this manipulator: by its base,
    /// its end effector, or one of its gripper-side links.
    pub fn manipulator_is_grabbing(&self, handle: ManipulatorHandle, body: &BodyRef) -> bool {
        let Some(link) = self.is_grabbing(body) else {
            return false;
        };
        let manip = &self.manipulators[handle.0];
        if Some(link) == manip.base || link == manip.end_effector {
            return true;
        }
        self.is_child_link(handle, link)
    }

    // ---- Jacobians of the grasp frame ----

    /// Positional Jacobian of the grasp point over the arm DOFs, computed by
    /// temporarily selecting the arm as the active set.
    pub fn manipulator_jacobian(
        &mut self,
        handle: ManipulatorHandle,
    ) -> Result<na::DMatrix<f64>> {
        let arm = self.manipulators[handle.0].arm_dofs.clone();
        let ee = self.manipulators[handle.0].end_effector;
        let point = self.end_effector_transform(handle).translation.vector;
        self.with_saved_state(SnapshotOptions::ACTIVE_DOF, |robot| {
            robot.set_active_dofs(&arm, AffineDofs::empty())?;
            robot.calculate_active_jacobian(ee, &na::Point3::from(point))
        })
    }

    /// Quaternion-rotation Jacobian of the grasp frame over the arm DOFs.
    pub fn manipulator_rotation_jacobian(
        &mut self,
        handle: ManipulatorHandle,
    ) -> Result<na::DMatrix<f64>> {
        let arm = self.manipulators[handle.0].arm_dofs.clone();
        let ee = self.manipulators[handle.0].end_effector;
        let quat: Quaternion<f64> = *self.end_effector_transform(handle).rotation.quaternion();
        self.with_saved_state(SnapshotOptions::ACTIVE_DOF, |robot| {
            robot.set_active_dofs(&arm, AffineDofs::empty())?;
            robot.calculate_active_rotation_jacobian(ee, &quat)
        })
    }

    /// Angular-velocity Jacobian of the end effector over the arm DOFs.
    pub fn manipulator_angular_velocity_jacobian(
        &mut self,
        handle: ManipulatorHandle,
    ) -> Result<na::DMatrix<f64>> {
        let arm = self.manipulators[handle.0].arm_dofs.clone();
        let ee = self.manipulators[handle.0].end_effector;
        self.with_saved_state(SnapshotOptions::ACTIVE_DOF, |robot| {
            robot.set_active_dofs(&arm, AffineDofs::empty())?;
            robot.calculate_active_angular_velocity_jacobian(ee)
        })
    }
}
