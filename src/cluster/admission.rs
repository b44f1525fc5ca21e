//! Join admission.
//!
//! Every candidate presents the identity pair it has persisted, if any. The
//! gate compares it against the cluster's established pair:
//!
//! | cluster         | candidate           | decision                  |
//! |-----------------|---------------------|---------------------------|
//! | not established | anything            | `RejectAwaitingBootstrap` |
//! | established     | no identity         | `Admit` (new member)      |
//! | established     | any half differs    | `RejectIdentityMismatch`  |
//! | established     | both halves match   | `Admit`, regardless of lag|
//!
//! A candidate holding only one half of the pair is judged on that half.
//!
//! Only a peer whose own identity has been verified against the cluster may
//! admit or reject. A peer that has merely loaded its record from disk
//! answers `RejectAwaitingBootstrap`, and at most corroborates a candidate
//! presenting exactly the pair it holds.

use crate::consensus::MemberId;
use crate::core::error::{LineageError, MismatchField};
use crate::identity::{BootstrapPhase, ClusterIdentity, IdentityPair, IdentityRecord, StoreIdentity};

/// A member asking to participate in consensus.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinCandidate {
    pub member_id: MemberId,
    pub cluster_id: Option<ClusterIdentity>,
    pub store_id: Option<StoreIdentity>,
}

impl JoinCandidate {
    /// A candidate with no persisted identity.
    pub fn fresh(member_id: MemberId) -> Self {
        Self {
            member_id,
            cluster_id: None,
            store_id: None,
        }
    }

    /// A candidate presenting the given pair.
    pub fn with_identity(member_id: MemberId, pair: IdentityPair) -> Self {
        Self {
            member_id,
            cluster_id: Some(pair.cluster_id),
            store_id: Some(pair.store_id),
        }
    }

    /// Build a candidate from a member's persisted record.
    ///
    /// Only committed identities are presented; a record still in the
    /// seeding phase counts as no identity.
    pub fn from_record(member_id: MemberId, record: Option<&IdentityRecord>) -> Self {
        match record {
            Some(record) if record.phase.is_bootstrapped() => {
                Self::with_identity(member_id, record.pair())
            }
            _ => Self::fresh(member_id),
        }
    }

    pub fn has_identity(&self) -> bool {
        self.cluster_id.is_some() || self.store_id.is_some()
    }
}

/// Outcome of a join evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinDecision {
    /// The candidate may participate.
    Admit,
    /// The candidate holds foreign or stale data. Fatal to the candidate.
    RejectIdentityMismatch(MismatchField),
    /// The cluster has no identity yet. Retry later.
    RejectAwaitingBootstrap,
}

impl JoinDecision {
    pub fn is_admitted(&self) -> bool {
        matches!(self, Self::Admit)
    }

    /// Whether the candidate should retry.
    pub fn is_retriable(&self) -> bool {
        matches!(self, Self::RejectAwaitingBootstrap)
    }

    /// Map a rejection to the error surfaced to the candidate.
    pub fn into_result(self) -> Result<(), LineageError> {
        match self {
            Self::Admit => Ok(()),
            Self::RejectIdentityMismatch(field) => Err(LineageError::IdentityMismatch { field }),
            Self::RejectAwaitingBootstrap => Err(LineageError::AwaitingBootstrap),
        }
    }
}

impl std::fmt::Display for JoinDecision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Admit => write!(f, "admit"),
            Self::RejectIdentityMismatch(field) => write!(f, "reject_identity_mismatch({field})"),
            Self::RejectAwaitingBootstrap => write!(f, "reject_awaiting_bootstrap"),
        }
    }
}

/// Reply sent back to a candidate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdmissionResponse {
    pub decision: JoinDecision,
    /// The cluster's pair, included when the candidate is admitted.
    pub established: Option<IdentityPair>,
    /// An unverified peer persists exactly the candidate's pair.
    pub corroborates: bool,
}

impl AdmissionResponse {
    pub fn awaiting_bootstrap() -> Self {
        Self {
            decision: JoinDecision::RejectAwaitingBootstrap,
            established: None,
            corroborates: false,
        }
    }
}

/// Compares candidates against the cluster's established identity.
#[derive(Debug, Clone)]
pub struct JoinAdmissionGate {
    established: Option<IdentityPair>,
}

impl JoinAdmissionGate {
    /// Gate for a cluster whose evaluating member is in `phase`.
    ///
    /// The identity only counts as established once it is committed.
    pub fn for_cluster(phase: BootstrapPhase, identity: Option<IdentityPair>) -> Self {
        Self {
            established: identity.filter(|_| phase.is_bootstrapped()),
        }
    }

    pub fn established(&self) -> Option<&IdentityPair> {
        self.established.as_ref()
    }

    /// Decide whether `candidate` may join.
    pub fn evaluate_join(&self, candidate: &JoinCandidate) -> JoinDecision {
        let decision = match &self.established {
            None => JoinDecision::RejectAwaitingBootstrap,
            Some(pair) => {
                if candidate.cluster_id.is_some_and(|c| c != pair.cluster_id) {
                    JoinDecision::RejectIdentityMismatch(MismatchField::Cluster)
                } else if candidate.store_id.is_some_and(|s| s != pair.store_id) {
                    JoinDecision::RejectIdentityMismatch(MismatchField::Store)
                } else {
                    JoinDecision::Admit
                }
            }
        };

        match decision {
            JoinDecision::RejectIdentityMismatch(field) => tracing::warn!(
                candidate = candidate.member_id,
                field = %field,
                "join rejected: identity mismatch"
            ),
            _ => tracing::debug!(
                candidate = candidate.member_id,
                new_member = !candidate.has_identity(),
                decision = %decision,
                "join evaluated"
            ),
        }
        decision
    }

    /// Evaluate and build the reply.
    pub fn respond(&self, candidate: &JoinCandidate) -> AdmissionResponse {
        let decision = self.evaluate_join(candidate);
        AdmissionResponse {
            decision,
            established: self.established.filter(|_| decision.is_admitted()),
            corroborates: false,
        }
    }

    /// Reply from a peer whose own identity is not yet verified.
    ///
    /// Never admits or rejects. Corroborates only a candidate presenting
    /// both halves of the pair this peer holds, so nothing is disclosed.
    pub fn respond_unverified(&self, candidate: &JoinCandidate) -> AdmissionResponse {
        let corroborates = match (&self.established, candidate.cluster_id, candidate.store_id) {
            (Some(pair), Some(cluster_id), Some(store_id)) => {
                pair.cluster_id == cluster_id && pair.store_id == store_id
            }
            _ => false,
        };
        tracing::debug!(
            candidate = candidate.member_id,
            corroborates,
            "join deferred: evaluating member not verified"
        );
        AdmissionResponse {
            corroborates,
            ..AdmissionResponse::awaiting_bootstrap()
        }
    }
}
