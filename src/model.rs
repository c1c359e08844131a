//! Data model of the articulated body and the trait through which the
//! configuration core talks to it.
//!
//! The rigid-body graph itself (links, joints, forward kinematics) is owned
//! by an external model. This module defines the read-mostly descriptions of
//! links and joints that the core needs, and the [`RigidBodyModel`] trait the
//! model must implement. The core never walks the joint graph itself; chain
//! extraction, kinematic influence and full-body Jacobians are all queried
//! through the trait.

extern crate nalgebra as na;

use std::cell::RefCell;
use std::collections::BTreeSet;
use std::rc::{Rc, Weak};

use na::{DMatrix, Point3, Quaternion, Vector3};

use crate::collision::CollisionReport;
use crate::fingerprint::SerializationFlags;

/// World pose of a link or body: Cartesian position plus rotation quaternion.
pub type Pose = na::Isometry3<f64>;

/// Description of one link, frozen at finalization except for its transform
/// (which lives in the model) and the enabled flag.
#[derive(Debug, Clone)]
pub struct LinkInfo {
    /// Stable index of this link in the model.
    pub index: usize,
    pub name: String,
    /// Disabled links are skipped by every collision path.
    pub enabled: bool,
    /// Indices of the other links welded to this one (static joints and
    /// fixed attachments). Does not contain `index` itself.
    pub rigidly_attached: BTreeSet<usize>,
}

/// Mimic relation of a joint whose value is driven by other joints.
#[derive(Debug, Clone)]
pub struct MimicInfo {
    /// DOF indices of the source joints this joint's value is derived from,
    /// recorded by the model when the mimic equations were parsed.
    pub source_dofs: Vec<usize>,
    /// Position/velocity/acceleration equations, kept verbatim for the
    /// structural fingerprint.
    pub equations: Vec<String>,
}

/// Description of one joint, frozen at finalization.
#[derive(Debug, Clone)]
pub struct JointInfo {
    /// Stable index of this joint in the model.
    pub index: usize,
    pub name: String,
    /// Number of scalar DOFs, 1 to 4.
    pub dof: usize,
    /// Per-DOF flag: the DOF wraps around (continuous rotation).
    pub circular: Vec<bool>,
    pub lower_limits: Vec<f64>,
    pub upper_limits: Vec<f64>,
    /// Static joints contribute no DOFs and are skipped by chain derivation.
    pub is_static: bool,
    pub mimic: Option<MimicInfo>,
    /// Offset of this joint's first DOF in the full configuration vector,
    /// `None` when the model assigned it none (mimic and static joints).
    pub dof_offset: Option<usize>,
}

impl JointInfo {
    /// The DOF indices this joint occupies in the full configuration vector.
    pub fn dof_range(&self) -> std::ops::Range<usize> {
        match self.dof_offset {
            Some(offset) => offset..offset + self.dof,
            None => 0..0,
        }
    }

    /// True if any DOF has distinct lower and upper limits. Joints failing
    /// this are dummies inserted for modeling convenience.
    pub fn has_nondegenerate_dof(&self) -> bool {
        self.lower_limits
            .iter()
            .zip(self.upper_limits.iter())
            .any(|(lo, hi)| lo != hi)
    }
}

/// The articulated rigid-body model the configuration core operates on.
///
/// Implementations own links, joints and forward kinematics. All setters are
/// expected to immediately re-propagate link transforms. Enabled-state
/// changes made outside this trait must be reported through
/// `Robot::structure_changed` so dependent caches are invalidated.
pub trait RigidBodyModel {
    fn name(&self) -> &str;

    fn link_count(&self) -> usize;
    fn joint_count(&self) -> usize;
    /// Total scalar DOF count of the full configuration vector.
    fn dof(&self) -> usize;

    fn link(&self, index: usize) -> &LinkInfo;
    fn joint(&self, index: usize) -> &JointInfo;
    /// Joint owning the given DOF index.
    fn joint_from_dof(&self, dof: usize) -> &JointInfo;

    /// World transform of the model base (first link).
    fn transform(&self) -> Pose;
    /// Move the whole body, re-propagating all link transforms.
    fn set_transform(&mut self, pose: &Pose);

    fn link_transform(&self, index: usize) -> Pose;

    fn dof_values(&self) -> Vec<f64>;
    /// Set all joint values and recompute link transforms.
    fn set_dof_values(&mut self, values: &[f64]);
    /// Set joint values and the base pose in one forward-kinematics pass, so
    /// no intermediate configuration is ever observable.
    fn set_dof_values_with_base(&mut self, values: &[f64], base: &Pose);

    fn dof_velocities(&self) -> Vec<f64>;
    fn set_dof_velocities(&mut self, velocities: &[f64]);
    /// Base linear and angular velocity.
    fn base_velocity(&self) -> (Vector3<f64>, Vector3<f64>);
    fn set_base_velocity(&mut self, linear: Vector3<f64>, angular: Vector3<f64>);

    fn dof_limits(&self) -> (Vec<f64>, Vec<f64>);
    fn dof_resolutions(&self) -> Vec<f64>;
    fn dof_weights(&self) -> Vec<f64>;
    fn dof_max_velocities(&self) -> Vec<f64>;
    fn dof_max_accelerations(&self) -> Vec<f64>;

    /// Joint sequence along the kinematic chain from `base_link` to
    /// `ee_link`, or `None` when no chain connects them.
    fn chain(&self, base_link: usize, ee_link: usize) -> Option<Vec<usize>>;

    /// True when moving the given DOF changes the world pose of the link.
    fn dof_affects_link(&self, dof: usize, link: usize) -> bool;

    /// Full-body positional Jacobian of a world point rigidly attached to
    /// the link: 3 x dof().
    fn positional_jacobian(&self, link: usize, point: &Point3<f64>) -> DMatrix<f64>;
    /// Full-body quaternion-rotation Jacobian of the link: 4 x dof().
    fn rotation_jacobian(&self, link: usize, quat: &Quaternion<f64>) -> DMatrix<f64>;
    /// Full-body angular-velocity Jacobian of the link: 3 x dof().
    fn angular_velocity_jacobian(&self, link: usize) -> DMatrix<f64>;

    /// All link-index pairs with no direct static/kinematic adjacency,
    /// computed once at finalization. Pairs are stored `(low, high)`.
    fn non_adjacent_link_pairs(&self) -> BTreeSet<(usize, usize)>;

    /// Canonical, deterministic dump of kinematic/geometric structure for
    /// fingerprinting. Must be bit-reproducible for identical structure.
    fn serialize_structure(&self, flags: SerializationFlags, out: &mut String);
}

/// An external body the robot can grab: a scene object with its own links.
pub trait SceneBody {
    fn name(&self) -> &str;
    fn link_count(&self) -> usize;
    fn transform(&self) -> Pose;
    /// Move the body; while grabbed, the owning robot link is the only writer.
    fn set_transform(&mut self, pose: &Pose);
    fn link_transform(&self, index: usize) -> Pose;
    /// The body checked against itself.
    fn check_self_collision(&self, report: Option<&mut CollisionReport>) -> bool;
}

/// Shared handle to a scene body. The robot stores only weak references to
/// grabbed bodies; the scene keeps ownership.
pub type BodyRef = Rc<RefCell<dyn SceneBody>>;
/// Weak counterpart of [`BodyRef`], held by grab records.
pub type BodyWeak = Weak<RefCell<dyn SceneBody>>;

/// True when both handles refer to the same body.
pub fn same_body(a: &BodyRef, b: &BodyRef) -> bool {
    Rc::ptr_eq(a, b)
}
