pub mod apply;
pub mod consensus;
pub mod coordinator;
pub mod proposal;

pub use consensus::{CompareExchangeValue, Consensus, LocalConsensus, ProposalOutcome};
pub use coordinator::{ClusterBatchResult, ClusterTransactionCoordinator, ClusterTransactionState};
pub use proposal::{
    ATOMIC_GUARD_PREFIX, ClusterCommand, ClusterTransactionOptions, ClusterTransactionProposal,
    ClusterTransactionViolation, CommittedClusterTransaction, ViolationKind, atomic_guard_key,
};
