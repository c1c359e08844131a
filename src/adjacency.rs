//! Lazily filtered cache of the link pairs eligible for self-collision
//! testing.
//!
//! The unfiltered base set (all pairs with no direct static/kinematic
//! adjacency) is computed once by the model at finalization. This cache
//! only filters it, one entry per filter bitmask, recomputed lazily after
//! the invalidation that targets exactly the bits a change affects: an
//! active-DOF selection change kills the ACTIVE_DOFS-dependent entries, an
//! enabled-state change the ENABLED-dependent ones.

use std::collections::BTreeSet;

use bitflags::bitflags;

use crate::errors::Result;
use crate::model::RigidBodyModel;
use crate::robot::Robot;

bitflags! {
    /// Filters applicable to the non-adjacent link-pair set.
    #[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
    pub struct AdjacencyFilter: u32 {
        /// Keep only pairs with both links enabled.
        const ENABLED     = 0b01;
        /// Keep only pairs some currently active DOF can move; pairs frozen
        /// under the current selection can be skipped by planners.
        const ACTIVE_DOFS = 0b10;
    }
}

type PairSet = BTreeSet<(usize, usize)>;

/// One cached entry per filter bitmask (the empty mask holds the base set).
pub(crate) struct AdjacencyCache {
    sets: [PairSet; 4],
    valid: [bool; 4],
}

impl AdjacencyCache {
    pub fn new() -> Self {
        AdjacencyCache {
            sets: Default::default(),
            valid: [false; 4],
        }
    }

    /// Install the base set; every filtered entry becomes stale.
    pub fn set_base(&mut self, base: PairSet) {
        self.sets[0] = base;
        self.valid = [true, false, false, false];
    }

    pub fn invalidate_active_dofs(&mut self) {
        for mask in 0..4 {
            if mask & AdjacencyFilter::ACTIVE_DOFS.bits() as usize != 0 {
                self.valid[mask] = false;
            }
        }
    }

    pub fn invalidate_enabled(&mut self) {
        for mask in 0..4 {
            if mask & AdjacencyFilter::ENABLED.bits() as usize != 0 {
                self.valid[mask] = false;
            }
        }
    }

    fn is_valid(&self, mask: usize) -> bool {
        self.valid[mask]
    }

    fn get(&self, mask: usize) -> &PairSet {
        &self.sets[mask]
    }

    fn install(&mut self, mask: usize, set: PairSet) {
        self.sets[mask] = set;
        self.valid[mask] = true;
    }
}

impl<M: RigidBodyModel> Robot<M> {
    /// Link pairs eligible for self-collision testing under `filter`. Never
    /// stale: entries invalidated by a selection or enabled-state change are
    /// recomputed before this returns.
    pub fn non_adjacent_links(&mut self, filter: AdjacencyFilter) -> Result<&BTreeSet<(usize, usize)>> {
        self.ensure_finalized()?;
        let mask = filter.bits() as usize;
        if !self.adjacency.is_valid(mask) {
            if filter.contains(AdjacencyFilter::ENABLED | AdjacencyFilter::ACTIVE_DOFS) {
                // The combined entry derives from the ACTIVE_DOFS entry, so
                // that one has to be fresh first.
                let active_mask = AdjacencyFilter::ACTIVE_DOFS.bits() as usize;
                if !self.adjacency.is_valid(active_mask) {
                    let set = self.filter_by_active_dofs(self.adjacency.get(0));
                    self.adjacency.install(active_mask, set);
                }
                let set = self.filter_by_enabled(self.adjacency.get(active_mask));
                self.adjacency.install(mask, set);
            } else if filter == AdjacencyFilter::ENABLED {
                let set = self.filter_by_enabled(self.adjacency.get(0));
                self.adjacency.install(mask, set);
            } else if filter == AdjacencyFilter::ACTIVE_DOFS {
                let set = self.filter_by_active_dofs(self.adjacency.get(0));
                self.adjacency.install(mask, set);
            }
        }
        Ok(self.adjacency.get(mask))
    }

    fn filter_by_enabled(&self, source: &PairSet) -> PairSet {
        source
            .iter()
            .filter(|(l1, l2)| self.model.link(*l1).enabled && self.model.link(*l2).enabled)
            .copied()
            .collect()
    }

    fn filter_by_active_dofs(&self, source: &PairSet) -> PairSet {
        let selected = self.active_dof_indices();
        source
            .iter()
            .filter(|(l1, l2)| {
                selected.iter().any(|&dof| {
                    self.model.dof_affects_link(dof, *l1) || self.model.dof_affects_link(dof, *l2)
                })
            })
            .copied()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalidate_targets_dependent_masks_only() {
        let mut cache = AdjacencyCache::new();
        cache.set_base([(0usize, 2usize)].into_iter().collect());
        cache.install(1, PairSet::new());
        cache.install(2, PairSet::new());
        cache.install(3, PairSet::new());

        cache.invalidate_active_dofs();
        assert!(cache.is_valid(0));
        assert!(cache.is_valid(1));
        assert!(!cache.is_valid(2));
        assert!(!cache.is_valid(3));

        cache.install(2, PairSet::new());
        cache.install(3, PairSet::new());
        cache.invalidate_enabled();
        assert!(cache.is_valid(0));
        assert!(!cache.is_valid(1));
        assert!(cache.is_valid(2));
        assert!(!cache.is_valid(3));
    }

    #[test]
    fn test_set_base_resets_everything() {
        let mut cache = AdjacencyCache::new();
        cache.set_base(PairSet::new());
        cache.install(3, PairSet::new());
        cache.set_base(PairSet::new());
        assert!(cache.is_valid(0));
        assert!(!cache.is_valid(3));
    }
}
