//! Event grouping and audit core for the power-quality dashboard.
//!
//! Decides which of several related detections is the mother event, folds the
//! rest in as children, undoes that on demand, toggles the false-event flag,
//! and writes one audit entry per affected event.

pub mod audit;
pub mod conflict;
pub mod error;
pub mod event;
pub mod memory;
pub mod selection;
pub mod service;
pub mod store;

pub use audit::{
    ActorIdentity, ActorLabel, AuditCategory, AuditEntry, AuditOperation, AuditTrailEntry,
    NewAuditEntry, OperationDetails,
};
pub use error::CoreError;
pub use event::{
    ActorId, ClassificationFlags, ClassificationGuard, ClassificationPatch, EventId, EventRecord,
    EventRole, GroupingOrigin, GroupingType, VoltageLevel,
};
pub use selection::{Candidate, GroupingProposal, select_mother};
pub use service::{
    ConvertOutcome, EventGroupingService, FalseEventReport, GroupView, GroupingReport,
    PartialUngroupReport, UngroupOutcome,
};
pub use store::{
    ActorDirectory, AuditLog, AuditMode, Changeset, ClassificationWrite, EventRepository,
    IdentityProvider,
};
