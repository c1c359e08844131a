//! Scoped capture and restore of the robot's mutable configuration state.

extern crate nalgebra as na;

use std::collections::BTreeSet;

use bitflags::bitflags;
use na::Vector3;

use crate::active::AffineDofs;
use crate::errors::Result;
use crate::manipulator::ManipulatorHandle;
use crate::model::{BodyWeak, RigidBodyModel};
use crate::robot::Robot;

bitflags! {
    /// What a snapshot captures.
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    pub struct SnapshotOptions: u32 {
        /// Active-DOF selection, affine mask and rotation axis.
        const ACTIVE_DOF         = 0b001;
        const ACTIVE_MANIPULATOR = 0b010;
        /// The full grab-record list.
        const GRABBED_BODIES     = 0b100;
    }
}

#[derive(Clone)]
struct GrabCapture {
    body: BodyWeak,
    link: usize,
    ignored_links: BTreeSet<usize>,
}

/// A captured slice of robot state. Restoring applies active-DOF state
/// first, then the active manipulator, then the grabs, so grab partitions
/// are recomputed against the already-restored rest of the state.
pub struct StateSnapshot {
    options: SnapshotOptions,
    active_dofs: Vec<usize>,
    affine: AffineDofs,
    rotation_axis: Vector3<f64>,
    active_manipulator: Option<ManipulatorHandle>,
    grabs: Vec<GrabCapture>,
}

impl StateSnapshot {
    pub fn capture<M: RigidBodyModel>(robot: &Robot<M>, options: SnapshotOptions) -> Self {
        let grabs = if options.contains(SnapshotOptions::GRABBED_BODIES) {
            robot
                .grab_records()
                .iter()
                .map(|record| GrabCapture {
                    body: record.body.clone(),
                    link: record.link,
                    ignored_links: record.ignored_links.clone(),
                })
                .collect()
        } else {
            Vec::new()
        };
        StateSnapshot {
            options,
            active_dofs: robot.active_dof_indices(),
            affine: robot.active_affine_dofs(),
            rotation_axis: robot.affine_settings().rotation_axis,
            active_manipulator: robot.active_manipulator(),
            grabs,
        }
    }

    /// Put the captured state back. Grabs are restored by releasing
    /// everything currently held and re-invoking the grab for each captured
    /// record in original order.
    pub fn restore<M: RigidBodyModel>(&self, robot: &mut Robot<M>) -> Result<()> {
        if self.options.contains(SnapshotOptions::ACTIVE_DOF) {
            robot.set_active_dofs_with_axis(&self.active_dofs, self.affine, self.rotation_axis)?;
        }
        if self.options.contains(SnapshotOptions::ACTIVE_MANIPULATOR) {
            robot.set_active_manipulator(self.active_manipulator)?;
        }
        if self.options.contains(SnapshotOptions::GRABBED_BODIES) {
            robot.release_all_grabbed();
            for capture in &self.grabs {
                if let Some(body) = capture.body.upgrade() {
                    robot.grab(&body, capture.link, &capture.ignored_links)?;
                }
            }
        }
        Ok(())
    }
}

impl<M: RigidBodyModel> Robot<M> {
    /// Run `f` with the selected state captured; the pre-state is restored
    /// whether `f` succeeds or errors out.
    pub fn with_saved_state<T>(
        &mut self,
        options: SnapshotOptions,
        f: impl FnOnce(&mut Self) -> Result<T>,
    ) -> Result<T> {
        let snapshot = StateSnapshot::capture(self, options);
        let result = f(self);
        let restored = snapshot.restore(self);
        match result {
            Ok(value) => {
                restored?;
                Ok(value)
            }
            // The caller's error wins over a secondary restore failure.
            Err(err) => Err(err),
        }
    }
}
