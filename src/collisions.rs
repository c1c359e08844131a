//! Reference collision checker over bounding spheres.
//!
//! Implements the [`CollisionChecker`] seam with one sphere per robot link,
//! per scene-body link and per environment obstacle, intersected with
//! parry3d. Good enough for gripper clearance probing and for exercising
//! the grab/self-collision bookkeeping; swap in a mesh-based checker for
//! contact-accurate work.

extern crate nalgebra as na;

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use na::Isometry3;
use parry3d::query::intersection_test;
use parry3d::shape::Ball;

use crate::collision::{CollisionChecker, CollisionOptions, CollisionReport};
use crate::model::{BodyRef, BodyWeak, Pose, SceneBody};

const SUPPORTED: &str = "Ball intersection should be supported by Parry3d";

struct EnvSphere {
    name: String,
    pose: Pose,
    radius: f64,
}

struct RegisteredBody {
    body: BodyWeak,
    /// Per-link sphere radius; zero disables the link.
    link_radii: Vec<f64>,
}

pub struct SphereCollisionChecker {
    options: Cell<CollisionOptions>,
    /// Per robot link: reporting name and sphere radius (zero = no geometry).
    links: Vec<(String, f64)>,
    environment: RefCell<Vec<EnvSphere>>,
    bodies: RefCell<Vec<RegisteredBody>>,
    attached: RefCell<Vec<BodyWeak>>,
}

impl SphereCollisionChecker {
    pub fn new(links: Vec<(String, f64)>) -> Self {
        SphereCollisionChecker {
            options: Cell::new(CollisionOptions::empty()),
            links,
            environment: RefCell::new(Vec::new()),
            bodies: RefCell::new(Vec::new()),
            attached: RefCell::new(Vec::new()),
        }
    }

    pub fn add_environment_sphere(&self, name: impl Into<String>, pose: Pose, radius: f64) {
        self.environment.borrow_mut().push(EnvSphere {
            name: name.into(),
            pose,
            radius,
        });
    }

    /// Make a scene body known to the checker, one sphere per body link.
    pub fn register_body(&self, body: &BodyRef, link_radii: Vec<f64>) {
        self.bodies.borrow_mut().push(RegisteredBody {
            body: Rc::downgrade(body),
            link_radii,
        });
    }

    fn body_radii(&self, body: &BodyRef) -> Option<Vec<f64>> {
        self.bodies
            .borrow()
            .iter()
            .find(|registered| {
                registered
                    .body
                    .upgrade()
                    .is_some_and(|candidate| Rc::ptr_eq(&candidate, body))
            })
            .map(|registered| registered.link_radii.clone())
    }

    fn is_attached(&self, body: &BodyRef) -> bool {
        self.attached
            .borrow()
            .iter()
            .any(|weak| weak.upgrade().is_some_and(|held| Rc::ptr_eq(&held, body)))
    }

    fn spheres_hit(pose1: &Pose, radius1: f64, pose2: &Pose, radius2: f64) -> bool {
        if radius1 <= 0.0 || radius2 <= 0.0 {
            return false;
        }
        let p1: Isometry3<f32> = pose1.cast::<f32>();
        let p2: Isometry3<f32> = pose2.cast::<f32>();
        intersection_test(&p1, &Ball::new(radius1 as f32), &p2, &Ball::new(radius2 as f32))
            .expect(SUPPORTED)
    }

    fn note(report: &mut Option<&mut CollisionReport>, first: &str, second: &str) {
        if let Some(report) = report.as_deref_mut() {
            report.checks += 1;
            report.record(first, second);
        }
    }

    /// World poses of a body's link spheres when its root sits at
    /// `body_pose` (which may differ from the stored pose during
    /// hypothetical checks).
    fn body_link_poses(body: &BodyRef, body_pose: &Pose) -> Vec<Pose> {
        let body = body.borrow();
        let to_local = body.transform().inverse();
        (0..body.link_count())
            .map(|i| body_pose * (to_local * body.link_transform(i)))
            .collect()
    }
}

impl CollisionChecker for SphereCollisionChecker {
    fn options(&self) -> CollisionOptions {
        self.options.get()
    }

    fn set_options(&self, options: CollisionOptions) {
        self.options.set(options);
    }

    fn link_environment(
        &self,
        link: usize,
        pose: &Pose,
        mut report: Option<&mut CollisionReport>,
    ) -> bool {
        let (link_name, radius) = &self.links[link];
        for sphere in self.environment.borrow().iter() {
            if Self::spheres_hit(pose, *radius, &sphere.pose, sphere.radius) {
                Self::note(&mut report, link_name, &sphere.name);
                return true;
            }
        }
        for registered in self.bodies.borrow().iter() {
            let Some(body) = registered.body.upgrade() else {
                continue;
            };
            if self.is_attached(&body) {
                continue;
            }
            let current = body.borrow().transform();
            let name = body.borrow().name().to_string();
            for (i, body_link_pose) in Self::body_link_poses(&body, &current).iter().enumerate() {
                if Self::spheres_hit(pose, *radius, body_link_pose, registered.link_radii[i]) {
                    Self::note(&mut report, link_name, &name);
                    return true;
                }
            }
        }
        false
    }

    fn link_pair(
        &self,
        link1: usize,
        pose1: &Pose,
        link2: usize,
        pose2: &Pose,
        mut report: Option<&mut CollisionReport>,
    ) -> bool {
        let (name1, radius1) = &self.links[link1];
        let (name2, radius2) = &self.links[link2];
        if Self::spheres_hit(pose1, *radius1, pose2, *radius2) {
            Self::note(&mut report, name1, name2);
            return true;
        }
        false
    }

    fn link_body_link(
        &self,
        link: usize,
        link_pose: &Pose,
        body: &BodyRef,
        body_link: usize,
        mut report: Option<&mut CollisionReport>,
    ) -> bool {
        let (link_name, radius) = &self.links[link];
        let Some(radii) = self.body_radii(body) else {
            return false;
        };
        let current = body.borrow().transform();
        let body_link_pose = Self::body_link_poses(body, &current)[body_link];
        if Self::spheres_hit(link_pose, *radius, &body_link_pose, radii[body_link]) {
            Self::note(&mut report, link_name, body.borrow().name());
            return true;
        }
        false
    }

    fn body_environment(
        &self,
        body: &BodyRef,
        body_pose: &Pose,
        mut report: Option<&mut CollisionReport>,
    ) -> bool {
        let Some(radii) = self.body_radii(body) else {
            return false;
        };
        let name = body.borrow().name().to_string();
        let link_poses = Self::body_link_poses(body, body_pose);
        for (pose, radius) in link_poses.iter().zip(radii.iter()) {
            for sphere in self.environment.borrow().iter() {
                if Self::spheres_hit(pose, *radius, &sphere.pose, sphere.radius) {
                    Self::note(&mut report, &name, &sphere.name);
                    return true;
                }
            }
            for registered in self.bodies.borrow().iter() {
                let Some(other) = registered.body.upgrade() else {
                    continue;
                };
                if Rc::ptr_eq(&other, body) || self.is_attached(&other) {
                    continue;
                }
                let other_current = other.borrow().transform();
                let other_name = other.borrow().name().to_string();
                for (i, other_pose) in
                    Self::body_link_poses(&other, &other_current).iter().enumerate()
                {
                    if Self::spheres_hit(pose, *radius, other_pose, registered.link_radii[i]) {
                        Self::note(&mut report, &name, &other_name);
                        return true;
                    }
                }
            }
        }
        false
    }

    fn body_link_pair(
        &self,
        a: &BodyRef,
        a_link: usize,
        b: &BodyRef,
        b_link: usize,
        mut report: Option<&mut CollisionReport>,
    ) -> bool {
        let (Some(a_radii), Some(b_radii)) = (self.body_radii(a), self.body_radii(b)) else {
            return false;
        };
        let a_current = a.borrow().transform();
        let b_current = b.borrow().transform();
        let a_pose = Self::body_link_poses(a, &a_current)[a_link];
        let b_pose = Self::body_link_poses(b, &b_current)[b_link];
        if Self::spheres_hit(&a_pose, a_radii[a_link], &b_pose, b_radii[b_link]) {
            let a_name = a.borrow().name().to_string();
            Self::note(&mut report, &a_name, b.borrow().name());
            return true;
        }
        false
    }

    fn attach_body(&self, body: &BodyRef) {
        if !self.is_attached(body) {
            self.attached.borrow_mut().push(Rc::downgrade(body));
        }
    }

    fn detach_body(&self, body: &BodyRef) {
        self.attached.borrow_mut().retain(|weak| match weak.upgrade() {
            Some(held) => !Rc::ptr_eq(&held, body),
            None => false,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use na::{Translation3, UnitQuaternion};

    fn at(x: f64, y: f64, z: f64) -> Pose {
        Pose::from_parts(Translation3::new(x, y, z), UnitQuaternion::identity())
    }

    #[test]
    fn test_sphere_overlap() {
        assert!(SphereCollisionChecker::spheres_hit(
            &at(0.0, 0.0, 0.0),
            0.6,
            &at(1.0, 0.0, 0.0),
            0.6
        ));
        assert!(!SphereCollisionChecker::spheres_hit(
            &at(0.0, 0.0, 0.0),
            0.4,
            &at(1.0, 0.0, 0.0),
            0.4
        ));
        // Zero radius means no geometry, never a hit.
        assert!(!SphereCollisionChecker::spheres_hit(
            &at(0.0, 0.0, 0.0),
            0.0,
            &at(0.0, 0.0, 0.0),
            1.0
        ));
    }

    #[test]
    fn test_link_environment_reports_names() {
        let checker =
            SphereCollisionChecker::new(vec![("base".to_string(), 0.5), ("arm".to_string(), 0.3)]);
        checker.add_environment_sphere("pillar", at(0.4, 0.0, 0.0), 0.5);
        let mut report = CollisionReport::new();
        assert!(checker.link_environment(0, &at(0.0, 0.0, 0.0), Some(&mut report)));
        assert_eq!(report.first, "base");
        assert_eq!(report.second, "pillar");
        assert!(!checker.link_environment(1, &at(3.0, 0.0, 0.0), None));
    }
}
