//! Kinematic/configuration state core for articulated robot models.
//!
//! An external model owns the rigid-body graph and its forward kinematics;
//! this crate layers the mutable configuration state a planner works with
//! on top of it:
//!
//! - **Active DOFs**: a caller-selected subset of joint DOFs, optionally
//!   extended by base-pose ("affine") parameters, exposed as one
//!   generalized configuration vector with matching limits, velocity
//!   bounds, differences and Jacobians. Three rotation parameterizations
//!   are supported: angle about a fixed axis, exponential map, and raw
//!   quaternion.
//! - **Manipulators**: named base-to-end-effector chains with derived arm
//!   DOF indices (mimic joints expanded), child/independent link sets, IK
//!   solver delegation and hypothetical-pose gripper collision probing.
//! - **Grabbing**: rigid attachment of scene bodies to links with
//!   collision partitions recorded at grab time, extending the robot's
//!   self-collision check to whatever it holds.
//! - **Adjacency cache**: the lazily filtered set of link pairs worth
//!   self-collision testing, keyed by enabled/active-DOF relevance and
//!   never returned stale.
//! - **State snapshots**: scoped capture/restore of selection, active
//!   manipulator and grabs, for trial mutations that must not leak.
//!
//! Collision checking and IK solving stay behind the [`collision`] and
//! [`ik`] seams; a sphere-based reference checker ships behind the
//! `collisions` feature.
//!
//! A robot instance is single-threaded by design: callers serialize access,
//! the core holds no locks and spawns no tasks.

pub mod errors;

pub mod model;

pub mod collision;
pub mod ik;

pub mod robot;

pub mod active;
pub mod manipulator;
pub mod sensor;

pub mod grab;
pub mod adjacency;
pub mod snapshot;

pub mod fingerprint;

pub mod utils;

#[cfg(feature = "collisions")]
pub mod collisions;

#[cfg(test)]
mod tests;

pub use active::{AffineDofs, AffineSettings};
pub use adjacency::AdjacencyFilter;
pub use collision::{CollisionChecker, CollisionOptions, CollisionOptionsScope, CollisionReport};
pub use errors::{Result, RobotError};
pub use fingerprint::SerializationFlags;
pub use grab::GrabRecord;
pub use ik::{IkFilterOptions, IkSolver, IkSolverRef};
pub use manipulator::{Manipulator, ManipulatorHandle};
pub use model::{BodyRef, BodyWeak, JointInfo, LinkInfo, MimicInfo, Pose, RigidBodyModel, SceneBody};
pub use robot::{Robot, StructureChange};
pub use sensor::{AttachedSensor, SensorDevice, SensorDeviceRef, SensorHandle, SensorReading};
pub use snapshot::{SnapshotOptions, StateSnapshot};
