//! Records and the `PolicyStore` trait the evaluation engine persists through.

pub mod conformance;
mod error;
mod memory;
mod record;
mod traits;

pub use error::StorageError;
pub use memory::InMemoryStore;
pub use record::{
    ActionId, ActionKind, ActionRecord, ActivityRecord, CommunityId, CommunityRef,
    ConstitutionChange, DataMap, EvaluationLogRecord, GovernanceProcessRef, Initiator, LogLevel,
    PolicyDraft, PolicyId, PolicyKind, PolicyRecord, ProposalId, ProposalRecord, ProposalStatus,
    StageCode,
};
pub use traits::{PolicyFilter, PolicyStore, ProposalFilter};
