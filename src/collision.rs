//! Collision-checker seam.
//!
//! The core never intersects geometry itself; it decides *what* to check and
//! delegates to a [`CollisionChecker`]. Every query takes explicit world
//! poses for the robot links involved, so hypothetical-pose probing (end
//! effector checks during planning) flows through without mutating any
//! persisted transform.

use std::fmt;
use std::rc::Rc;

use bitflags::bitflags;

use crate::model::{BodyRef, Pose};

bitflags! {
    /// Options of the active collision checker. Pushed to a relaxed state
    /// (empty) while grab-time partitions are computed.
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    pub struct CollisionOptions: u32 {
        /// Compute closest distance, not just a boolean.
        const DISTANCE    = 0b0001;
        /// Record contact points in the report.
        const CONTACTS    = 0b0010;
        /// Restrict checking to geometry moved by the active DOFs.
        const ACTIVE_DOFS = 0b0100;
    }
}

/// First detected contact pair, filled when the caller supplies a report.
#[derive(Debug, Clone, Default)]
pub struct CollisionReport {
    pub first: String,
    pub second: String,
    /// Number of pairwise checks the query performed before returning.
    pub checks: usize,
}

impl CollisionReport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, first: &str, second: &str) {
        self.first = first.to_string();
        self.second = second.to_string();
    }
}

impl fmt::Display for CollisionReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "contact {} <-> {} ({} checks)", self.first, self.second, self.checks)
    }
}

/// Narrow-phase collision queries over the robot's links, external bodies
/// and the rest of the scene.
///
/// Robot links are addressed by index and an explicit world pose; the
/// checker must use the supplied pose, never the link's stored one. External
/// bodies are addressed by [`BodyRef`]; their link poses are read from the
/// body, offset to `body_pose` where one is supplied.
pub trait CollisionChecker {
    fn options(&self) -> CollisionOptions;
    /// Replace the option set. Interior mutability is expected; the checker
    /// is shared behind `Rc`.
    fn set_options(&self, options: CollisionOptions);

    /// One robot link against everything in the scene except the robot itself.
    fn link_environment(
        &self,
        link: usize,
        pose: &Pose,
        report: Option<&mut CollisionReport>,
    ) -> bool;

    /// Two robot links against each other.
    fn link_pair(
        &self,
        link1: usize,
        pose1: &Pose,
        link2: usize,
        pose2: &Pose,
        report: Option<&mut CollisionReport>,
    ) -> bool;

    /// One robot link against one link of an external body (at the body's
    /// current pose).
    fn link_body_link(
        &self,
        link: usize,
        link_pose: &Pose,
        body: &BodyRef,
        body_link: usize,
        report: Option<&mut CollisionReport>,
    ) -> bool;

    /// An external body, positioned at `body_pose`, against the scene with
    /// both the robot and the body itself excluded.
    fn body_environment(
        &self,
        body: &BodyRef,
        body_pose: &Pose,
        report: Option<&mut CollisionReport>,
    ) -> bool;

    /// One link of body `a` against one link of body `b`, both at their
    /// current poses.
    fn body_link_pair(
        &self,
        a: &BodyRef,
        a_link: usize,
        b: &BodyRef,
        b_link: usize,
        report: Option<&mut CollisionReport>,
    ) -> bool;

    /// Mark a body as attached to the robot. Attached bodies are part of the
    /// robot for environment queries: excluded from `link_environment` and
    /// `body_environment`. Checkers should hold weak references so an
    /// expired body needs no explicit detach.
    fn attach_body(&self, _body: &BodyRef) {}

    fn detach_body(&self, _body: &BodyRef) {}
}

/// Scoped push/pop of checker options. The previous option set is restored
/// when the scope is dropped, including on an error unwind.
pub struct CollisionOptionsScope {
    checker: Rc<dyn CollisionChecker>,
    saved: CollisionOptions,
}

impl CollisionOptionsScope {
    pub fn new(checker: Rc<dyn CollisionChecker>, options: CollisionOptions) -> Self {
        let saved = checker.options();
        checker.set_options(options);
        CollisionOptionsScope { checker, saved }
    }
}

impl Drop for CollisionOptionsScope {
    fn drop(&mut self) {
        self.checker.set_options(self.saved);
    }
}
