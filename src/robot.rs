//! The robot: an articulated model plus the mutable configuration state this
//! crate manages on top of it.
//!
//! A [`Robot`] owns its [`RigidBodyModel`] and layers four pieces of state
//! over it: the active-DOF selection, the manipulator and sensor
//! collections, the grab registry and the non-adjacent-link cache. All
//! mutation flows through the robot so the dependent caches and attachments
//! stay consistent.

use std::rc::Rc;

use bitflags::bitflags;
use tracing::warn;

use crate::active::{ActiveSelection, AffineSettings};
use crate::adjacency::AdjacencyCache;
use crate::collision::CollisionChecker;
use crate::errors::{Result, RobotError};
use crate::fingerprint::{digest, SerializationFlags};
use crate::grab::GrabRecord;
use crate::manipulator::{derive_arm_dofs, manipulator_hashes, Manipulator, ManipulatorHandle};
use crate::model::{Pose, RigidBodyModel};
use crate::sensor::{AttachedSensor, SensorHandle};

bitflags! {
    /// What changed, reported through [`Robot::structure_changed`]. Both the
    /// fingerprint and adjacency subsystems subscribe to this one entry
    /// point; there is no other invalidation path.
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    pub struct StructureChange: u32 {
        /// Joint/link structure changed: re-derive arm DOFs, rehash everything.
        const KINEMATICS       = 0b0000_0001;
        /// Manipulator definitions changed.
        const MANIPULATORS     = 0b0000_0010;
        /// Sensor set changed.
        const SENSORS          = 0b0000_0100;
        /// Only a sensor's mounting transform changed.
        const SENSOR_PLACEMENT = 0b0000_1000;
        /// A link was enabled or disabled.
        const LINK_ENABLED     = 0b0001_0000;
    }
}

pub struct Robot<M: RigidBodyModel> {
    pub(crate) model: M,
    pub(crate) active: Option<ActiveSelection>,
    pub(crate) affine: AffineSettings,
    pub(crate) manipulators: Vec<Manipulator>,
    pub(crate) sensors: Vec<AttachedSensor>,
    pub(crate) active_manipulator: Option<ManipulatorHandle>,
    pub(crate) grabs: Vec<GrabRecord>,
    pub(crate) adjacency: AdjacencyCache,
    pub(crate) checker: Option<Rc<dyn CollisionChecker>>,
    structure_hash: String,
    finalized: bool,
}

impl<M: RigidBodyModel> Robot<M> {
    pub fn new(model: M) -> Self {
        Robot {
            model,
            active: None,
            affine: AffineSettings::default(),
            manipulators: Vec::new(),
            sensors: Vec::new(),
            active_manipulator: None,
            grabs: Vec::new(),
            adjacency: AdjacencyCache::new(),
            checker: None,
            structure_hash: String::new(),
            finalized: false,
        }
    }

    pub fn name(&self) -> &str {
        self.model.name()
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    /// Direct access to the model. Enabled-state or structural edits made
    /// through this must be followed by [`Robot::structure_changed`].
    pub fn model_mut(&mut self) -> &mut M {
        &mut self.model
    }

    pub fn set_collision_checker(&mut self, checker: Rc<dyn CollisionChecker>) {
        self.checker = Some(checker);
    }

    pub fn collision_checker(&self) -> Option<Rc<dyn CollisionChecker>> {
        self.checker.clone()
    }

    pub(crate) fn require_checker(&self) -> Result<Rc<dyn CollisionChecker>> {
        self.checker.clone().ok_or_else(|| {
            RobotError::PreconditionViolation(format!(
                "robot {} has no collision checker attached",
                self.model.name()
            ))
        })
    }

    pub(crate) fn ensure_finalized(&self) -> Result<()> {
        if self.finalized {
            Ok(())
        } else {
            Err(RobotError::PreconditionViolation(format!(
                "robot {} has not been finalized",
                self.model.name()
            )))
        }
    }

    // ---- manipulators and sensors ----

    /// Register a manipulator. Handles are never invalidated; the collection
    /// only grows.
    pub fn add_manipulator(&mut self, manipulator: Manipulator) -> ManipulatorHandle {
        self.manipulators.push(manipulator);
        ManipulatorHandle(self.manipulators.len() - 1)
    }

    pub fn manipulator(&self, handle: ManipulatorHandle) -> &Manipulator {
        &self.manipulators[handle.0]
    }

    pub fn manipulator_count(&self) -> usize {
        self.manipulators.len()
    }

    pub fn manipulator_handles(&self) -> impl Iterator<Item = ManipulatorHandle> {
        (0..self.manipulators.len()).map(ManipulatorHandle)
    }

    pub fn find_manipulator(&self, name: &str) -> Option<ManipulatorHandle> {
        self.manipulators
            .iter()
            .position(|m| m.name == name)
            .map(ManipulatorHandle)
    }

    pub fn set_active_manipulator(&mut self, handle: Option<ManipulatorHandle>) -> Result<()> {
        if let Some(h) = handle {
            if h.0 >= self.manipulators.len() {
                return Err(RobotError::InvalidArgument(format!(
                    "manipulator handle {} out of range",
                    h.0
                )));
            }
        }
        self.active_manipulator = handle;
        Ok(())
    }

    pub fn set_active_manipulator_by_name(&mut self, name: &str) -> Result<ManipulatorHandle> {
        match self.find_manipulator(name) {
            Some(handle) => {
                self.active_manipulator = Some(handle);
                Ok(handle)
            }
            None => Err(RobotError::NotFound(format!("manipulator {}", name))),
        }
    }

    pub fn active_manipulator(&self) -> Option<ManipulatorHandle> {
        self.active_manipulator
    }

    pub fn add_sensor(&mut self, sensor: AttachedSensor) -> SensorHandle {
        self.sensors.push(sensor);
        SensorHandle(self.sensors.len() - 1)
    }

    pub fn sensor(&self, handle: SensorHandle) -> &AttachedSensor {
        &self.sensors[handle.0]
    }

    pub fn sensor_count(&self) -> usize {
        self.sensors.len()
    }

    // ---- finalization ----

    /// Freeze the kinematic hierarchy and compute every piece of derived
    /// state: default names, arm DOF indices, the adjacency base set,
    /// structural fingerprints, and IK solver bindings.
    ///
    /// Structural inconsistencies (duplicate manipulator names, mimic joints
    /// without DOF indices) are logged and never abort the pass.
    pub fn finalize(&mut self) {
        for (i, manip) in self.manipulators.iter_mut().enumerate() {
            if manip.name.is_empty() {
                let fallback = format!("manip{}", i);
                warn!(
                    robot = self.model.name(),
                    manipulator = i,
                    "manipulator has no name, setting to {}",
                    fallback
                );
                manip.name = fallback;
            }
        }
        for i in 0..self.manipulators.len() {
            for j in i + 1..self.manipulators.len() {
                if self.manipulators[i].name == self.manipulators[j].name {
                    warn!(
                        robot = self.model.name(),
                        name = %self.manipulators[i].name,
                        "two manipulators share the same name"
                    );
                }
            }
        }
        for (i, sensor) in self.sensors.iter_mut().enumerate() {
            if sensor.name.is_empty() {
                let fallback = format!("sensor{}", i);
                warn!(
                    robot = self.model.name(),
                    sensor = i,
                    "sensor has no name, setting to {}",
                    fallback
                );
                sensor.name = fallback;
            }
        }

        for manip in self.manipulators.iter_mut() {
            derive_arm_dofs(&self.model, manip);
        }

        self.adjacency.set_base(self.model.non_adjacent_link_pairs());
        self.finalized = true;

        self.recompute_structure_hash();
        for manip in self.manipulators.iter_mut() {
            let (structure, kinematics) = manipulator_hashes(&self.model, manip);
            manip.structure_hash = structure;
            manip.kinematics_hash = kinematics;
        }
        for sensor in self.sensors.iter_mut() {
            sensor.recompute_hash();
        }

        // Solver init may depend on the hashes, so it runs last.
        for (i, manip) in self.manipulators.iter_mut().enumerate() {
            let bound = match &manip.ik_solver {
                Some(solver) => solver.borrow_mut().init(ManipulatorHandle(i)),
                None => true,
            };
            if !bound {
                warn!(
                    robot = self.model.name(),
                    manipulator = %manip.name,
                    "failed to init ik solver, unbinding"
                );
                manip.ik_solver = None;
            }
        }
    }

    fn recompute_structure_hash(&mut self) {
        let mut dump = String::new();
        self.serialize(
            SerializationFlags::KINEMATICS
                | SerializationFlags::GEOMETRY
                | SerializationFlags::MANIPULATORS
                | SerializationFlags::SENSORS,
            &mut dump,
        );
        self.structure_hash = digest(&dump);
    }

    /// Canonical structure dump: the model's own kinematics/geometry
    /// sections followed by manipulators and sensors in index order.
    pub fn serialize(&self, flags: SerializationFlags, out: &mut String) {
        self.model
            .serialize_structure(flags & (SerializationFlags::KINEMATICS | SerializationFlags::GEOMETRY), out);
        if flags.contains(SerializationFlags::MANIPULATORS) {
            for manip in &self.manipulators {
                manip.serialize(&self.model, flags, out);
            }
        }
        if flags.contains(SerializationFlags::SENSORS) {
            for sensor in &self.sensors {
                sensor.serialize(out);
            }
        }
    }

    /// Digest of the full structure dump, usable as an external cache key
    /// (precomputed IK databases, cached models).
    pub fn structure_fingerprint(&self) -> Result<&str> {
        self.ensure_finalized()?;
        Ok(&self.structure_hash)
    }

    // ---- change notification ----

    /// The single structure-change entry point. The model and callers report
    /// every structural edit here; fingerprints and the adjacency cache
    /// re-derive exactly what the reported change invalidates.
    pub fn structure_changed(&mut self, change: StructureChange) {
        if change.contains(StructureChange::LINK_ENABLED) {
            self.adjacency.invalidate_enabled();
        }
        if !self.finalized {
            return;
        }
        if change.contains(StructureChange::KINEMATICS) {
            for manip in self.manipulators.iter_mut() {
                derive_arm_dofs(&self.model, manip);
            }
            self.adjacency.set_base(self.model.non_adjacent_link_pairs());
        }
        if change.intersects(StructureChange::MANIPULATORS | StructureChange::KINEMATICS) {
            for manip in self.manipulators.iter_mut() {
                let (structure, kinematics) = manipulator_hashes(&self.model, manip);
                manip.structure_hash = structure;
                manip.kinematics_hash = kinematics;
            }
        }
        if change.intersects(
            StructureChange::SENSORS | StructureChange::SENSOR_PLACEMENT | StructureChange::KINEMATICS,
        ) {
            for sensor in self.sensors.iter_mut() {
                sensor.recompute_hash();
            }
        }
        if !change.is_empty() {
            self.recompute_structure_hash();
        }
    }

    // ---- pose and configuration passthrough ----

    /// Move the whole robot, dragging grabbed bodies and sensors along.
    pub fn set_transform(&mut self, pose: &Pose) {
        self.model.set_transform(pose);
        self.refresh_attachments();
    }

    pub fn transform(&self) -> Pose {
        self.model.transform()
    }

    /// Set the full joint configuration, dragging grabbed bodies and
    /// sensors along.
    pub fn set_dof_values(&mut self, values: &[f64]) -> Result<()> {
        if values.len() != self.model.dof() {
            return Err(RobotError::InvalidArgument(format!(
                "dof values length {} does not match dof count {}",
                values.len(),
                self.model.dof()
            )));
        }
        self.model.set_dof_values(values);
        self.refresh_attachments();
        Ok(())
    }

    pub fn dof_values(&self) -> Vec<f64> {
        self.model.dof_values()
    }

    /// Re-place grabbed bodies and attached sensors after any pose change.
    pub(crate) fn refresh_attachments(&mut self) {
        self.update_grabbed_bodies();
        self.update_attached_sensors();
    }

    /// Per-step maintenance: call once the external model advanced.
    pub fn simulation_step(&mut self) {
        self.refresh_attachments();
    }
}
