//! Consistent membership snapshot for the prune planner.

use crate::consensus::{ConsensusEngine, LogPosition, MemberId};
use std::collections::{BTreeMap, BTreeSet};

/// An immutable copy of the admitted roster and each member's applied
/// position, read at one point in time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MembershipView {
    pub admitted: BTreeSet<MemberId>,
    pub progress: BTreeMap<MemberId, LogPosition>,
}

impl MembershipView {
    pub fn new(
        admitted: impl IntoIterator<Item = MemberId>,
        progress: BTreeMap<MemberId, LogPosition>,
    ) -> Self {
        Self {
            admitted: admitted.into_iter().collect(),
            progress,
        }
    }

    /// Read the roster and progress from the consensus engine.
    pub fn capture(consensus: &dyn ConsensusEngine) -> Self {
        Self::new(consensus.roster(), consensus.applied_positions())
    }

    /// Applied position of an admitted member; unknown progress counts as zero.
    pub fn applied(&self, member: MemberId) -> LogPosition {
        self.progress.get(&member).copied().unwrap_or_default()
    }

    /// Lowest index every admitted member has applied.
    ///
    /// `None` when nobody is admitted.
    pub fn retention_watermark(&self) -> Option<u64> {
        self.admitted.iter().map(|m| self.applied(*m).index).min()
    }

    /// Whether every admitted member has applied `index`.
    pub fn all_applied(&self, index: u64) -> bool {
        self.admitted.iter().all(|m| self.applied(*m).covers(index))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_watermark_is_minimum_over_admitted() {
        let progress = BTreeMap::from([
            (1, LogPosition::new(40, 1)),
            (2, LogPosition::new(25, 1)),
            (9, LogPosition::new(1, 1)),
        ]);
        let view = MembershipView::new([1, 2], progress);
        assert_eq!(view.retention_watermark(), Some(25));
        assert!(view.all_applied(25));
        assert!(!view.all_applied(26));
    }

    #[test]
    fn test_member_without_progress_pins_watermark() {
        let progress = BTreeMap::from([(1, LogPosition::new(40, 1))]);
        let view = MembershipView::new([1, 3], progress);
        assert_eq!(view.retention_watermark(), Some(0));
    }

    #[test]
    fn test_empty_roster() {
        assert_eq!(MembershipView::default().retention_watermark(), None);
    }
}
