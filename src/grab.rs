//! Grabbing: rigid attachment of external bodies to robot links, with the
//! collision bookkeeping that makes grasped objects checkable.
//!
//! At grab time the robot links are partitioned against the body: links
//! already touching it (the fingers around the object) are expected to stay
//! in contact and are excluded from the ongoing self-collision check; links
//! clear of it must stay clear, and later contact with one of them is a
//! grasp failure that must be reported. Explicitly ignored links are tracked
//! in neither set.

use std::collections::BTreeSet;

use tracing::{debug, trace};

use crate::adjacency::AdjacencyFilter;
use crate::collision::{CollisionOptions, CollisionOptionsScope, CollisionReport};
use crate::errors::{Result, RobotError};
use crate::model::{same_body, BodyRef, BodyWeak, Pose, RigidBodyModel, SceneBody};
use crate::robot::Robot;

/// One grabbed body. The body itself stays owned by the scene; the record
/// holds a weak reference and is pruned when the body goes away.
#[derive(Clone)]
pub struct GrabRecord {
    pub(crate) body: BodyWeak,
    /// Robot link the body is rigidly attached to.
    pub(crate) link: usize,
    /// Body pose in the owning link's frame, captured at grab time. The
    /// body's world pose is `link_transform * root` from then on.
    pub(crate) root: Pose,
    pub(crate) colliding_links: Vec<usize>,
    pub(crate) non_colliding_links: Vec<usize>,
    pub(crate) ignored_links: BTreeSet<usize>,
}

impl GrabRecord {
    pub fn link(&self) -> usize {
        self.link
    }

    /// Links that touched the body at grab time.
    pub fn colliding_links(&self) -> &[usize] {
        &self.colliding_links
    }

    /// Links that were clear of the body at grab time; contact with one of
    /// these is reported by the self-collision check.
    pub fn non_colliding_links(&self) -> &[usize] {
        &self.non_colliding_links
    }
}

impl<M: RigidBodyModel> Robot<M> {
    /// Rigidly attach `body` to `link`. Idempotent when the body is already
    /// grabbed. Collision partitions are computed under a relaxed
    /// collision-options scope; links listed in `ignore` land in neither
    /// partition.
    pub fn grab(&mut self, body: &BodyRef, link: usize, ignore: &BTreeSet<usize>) -> Result<()> {
        if link >= self.model.link_count() {
            return Err(RobotError::InvalidArgument(format!(
                "grab link index {} does not address a link of robot {}",
                link,
                self.model.name()
            )));
        }
        if body.borrow().name() == self.model.name() {
            return Err(RobotError::InvalidArgument(format!(
                "robot {} cannot grab itself",
                self.model.name()
            )));
        }
        if self.is_grabbing(body).is_some() {
            debug!(
                robot = self.model.name(),
                body = body.borrow().name(),
                "body already grabbed"
            );
            return Ok(());
        }
        let checker = self.require_checker()?;

        let root = self.model.link_transform(link).inverse() * body.borrow().transform();
        let (colliding_links, non_colliding_links) = {
            // Partition with all checker filtering off, so the split only
            // depends on geometry.
            let _scope = CollisionOptionsScope::new(checker.clone(), CollisionOptions::empty());
            self.partition_links(&checker, body, ignore)
        };
        self.grabs.push(GrabRecord {
            body: std::rc::Rc::downgrade(body),
            link,
            root,
            colliding_links,
            non_colliding_links,
            ignored_links: ignore.clone(),
        });
        // From now on the body counts as part of the robot for environment
        // queries.
        checker.attach_body(body);
        Ok(())
    }

    fn partition_links(
        &self,
        checker: &std::rc::Rc<dyn crate::collision::CollisionChecker>,
        body: &BodyRef,
        ignore: &BTreeSet<usize>,
    ) -> (Vec<usize>, Vec<usize>) {
        let mut colliding = Vec::new();
        let mut non_colliding = Vec::new();
        let body_links = body.borrow().link_count();
        for link in 0..self.model.link_count() {
            if ignore.contains(&link) {
                continue;
            }
            let pose = self.model.link_transform(link);
            let touching = (0..body_links)
                .any(|bl| checker.link_body_link(link, &pose, body, bl, None));
            if touching {
                colliding.push(link);
            } else {
                non_colliding.push(link);
            }
        }
        (colliding, non_colliding)
    }

    /// The link holding `body`, or `None` when it is not grabbed.
    pub fn is_grabbing(&self, body: &BodyRef) -> Option<usize> {
        self.grabs.iter().find_map(|grab| {
            grab.body
                .upgrade()
                .filter(|held| same_body(held, body))
                .map(|_| grab.link)
        })
    }

    /// Drop the grab on `body`. Not holding it is not an error.
    pub fn release(&mut self, body: &BodyRef) {
        let before = self.grabs.len();
        self.grabs.retain(|grab| match grab.body.upgrade() {
            Some(held) => !same_body(&held, body),
            None => true,
        });
        if self.grabs.len() == before {
            debug!(
                robot = self.model.name(),
                body = body.borrow().name(),
                "release of a body that was not grabbed"
            );
        } else if let Some(checker) = &self.checker {
            checker.detach_body(body);
        }
    }

    pub fn release_all_grabbed(&mut self) {
        if let Some(checker) = &self.checker {
            for grab in &self.grabs {
                if let Some(body) = grab.body.upgrade() {
                    checker.detach_body(&body);
                }
            }
        }
        self.grabs.clear();
    }

    /// Recompute both collision partitions of every grab against the current
    /// scene. Call after scene changes that may have moved obstacles into or
    /// out of contact.
    pub fn regrab_all(&mut self) -> Result<()> {
        if self.grabs.is_empty() {
            return Ok(());
        }
        let checker = self.require_checker()?;
        let _scope = CollisionOptionsScope::new(checker.clone(), CollisionOptions::empty());
        let mut records = std::mem::take(&mut self.grabs);
        for grab in records.iter_mut() {
            let Some(body) = grab.body.upgrade() else {
                continue;
            };
            let (colliding, non_colliding) =
                self.partition_links(&checker, &body, &grab.ignored_links);
            grab.colliding_links = colliding;
            grab.non_colliding_links = non_colliding;
        }
        self.grabs = records;
        Ok(())
    }

    /// All currently grabbed bodies that are still alive.
    pub fn grabbed_bodies(&self) -> Vec<BodyRef> {
        self.grabs.iter().filter_map(|grab| grab.body.upgrade()).collect()
    }

    pub(crate) fn grab_records(&self) -> &[GrabRecord] {
        &self.grabs
    }

    /// Re-place every grabbed body from its owning link. Records whose body
    /// has expired are pruned here.
    pub(crate) fn update_grabbed_bodies(&mut self) {
        let model = &self.model;
        self.grabs.retain(|grab| match grab.body.upgrade() {
            Some(body) => {
                let pose = model.link_transform(grab.link) * grab.root;
                body.borrow_mut().set_transform(&pose);
                true
            }
            None => {
                debug!(robot = model.name(), "erasing grab record of an expired body");
                false
            }
        });
    }

    /// One robot link, placed at `pose`, against the environment, including
    /// any grabbed bodies riding on that link, moved by the same delta. The
    /// hypothetical pose goes straight into the collision query; nothing is
    /// mutated.
    pub fn check_link_collision(
        &self,
        link: usize,
        pose: &Pose,
        mut report: Option<&mut CollisionReport>,
    ) -> Result<bool> {
        let checker = self.require_checker()?;
        if self.model.link(link).enabled
            && checker.link_environment(link, pose, report.as_deref_mut())
        {
            return Ok(true);
        }
        for grab in self.grabs.iter().filter(|g| g.link == link) {
            if let Some(body) = grab.body.upgrade() {
                let body_pose = pose * grab.root;
                if checker.body_environment(&body, &body_pose, report.as_deref_mut()) {
                    return Ok(true);
                }
            }
        }
        Ok(false)
    }

    /// Self-collision of the robot extended by its grabbed bodies: the
    /// adjacency-filtered link pairs, then each body against the links that
    /// were clear at grab time, each body against itself, and grabbed bodies
    /// pairwise. Short-circuits on the first contact.
    pub fn check_self_collision(
        &mut self,
        mut report: Option<&mut CollisionReport>,
    ) -> Result<bool> {
        let pairs: Vec<(usize, usize)> = self
            .non_adjacent_links(AdjacencyFilter::ENABLED)?
            .iter()
            .copied()
            .collect();
        let checker = self.require_checker()?;
        let mut collision = false;
        'outer: {
            for (l1, l2) in pairs {
                let p1 = self.model.link_transform(l1);
                let p2 = self.model.link_transform(l2);
                if checker.link_pair(l1, &p1, l2, &p2, report.as_deref_mut()) {
                    collision = true;
                    break 'outer;
                }
            }
            for (i, grab) in self.grabs.iter().enumerate() {
                let Some(body) = grab.body.upgrade() else {
                    continue;
                };
                let body_links = body.borrow().link_count();
                for &rlink in &grab.non_colliding_links {
                    let pose = self.model.link_transform(rlink);
                    for bl in 0..body_links {
                        if checker.link_body_link(rlink, &pose, &body, bl, report.as_deref_mut()) {
                            collision = true;
                            break 'outer;
                        }
                    }
                }
                if body.borrow().check_self_collision(report.as_deref_mut()) {
                    collision = true;
                    break 'outer;
                }
                for other in self.grabs.iter().skip(i + 1) {
                    let Some(other_body) = other.body.upgrade() else {
                        continue;
                    };
                    let other_links = other_body.borrow().link_count();
                    for bl in 0..body_links {
                        for ol in 0..other_links {
                            if checker.body_link_pair(
                                &body,
                                bl,
                                &other_body,
                                ol,
                                report.as_deref_mut(),
                            ) {
                                collision = true;
                                break 'outer;
                            }
                        }
                    }
                }
            }
        }
        if collision {
            if let Some(report) = report {
                trace!(robot = self.model.name(), "self collision: {}", report);
            }
        }
        Ok(collision)
    }
}
