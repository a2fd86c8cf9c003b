use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;

use crate::audit::{ActorIdentity, AuditEntry, NewAuditEntry};
use crate::error::CoreError;
use crate::event::{
    ActorId, ClassificationFlags, ClassificationGuard, ClassificationPatch, EventId, EventRecord,
};

/// One conditional update: `patch` lands only if the row still matches `guard`.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassificationWrite {
    pub id: EventId,
    pub guard: ClassificationGuard,
    pub patch: ClassificationPatch,
}

/// Everything one operation changes, applied all-or-nothing.
///
/// Writes are applied before any audit row. If any guard fails the store
/// reports `GroupingConflict` naming every failed id and changes nothing.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Changeset {
    pub writes: Vec<ClassificationWrite>,
    pub audit: Vec<NewAuditEntry>,
}

impl Changeset {
    pub fn is_empty(&self) -> bool {
        self.writes.is_empty() && self.audit.is_empty()
    }
}

#[async_trait]
pub trait EventRepository: Send + Sync {
    /// Fresh read of the mother/child flags. Ids absent from the store are
    /// absent from the map.
    async fn fetch_event_flags(
        &self,
        ids: &[EventId],
    ) -> Result<HashMap<EventId, ClassificationFlags>, CoreError>;

    /// Loads every id, in the order given; fails with `NotFound` on the first
    /// missing one.
    async fn fetch_events(&self, ids: &[EventId]) -> Result<Vec<EventRecord>, CoreError>;

    async fn fetch_event(&self, id: EventId) -> Result<EventRecord, CoreError> {
        let mut events = self.fetch_events(&[id]).await?;
        events.pop().ok_or(CoreError::NotFound { id })
    }

    /// Current children of `mother`, oldest first.
    async fn fetch_children(&self, mother: EventId) -> Result<Vec<EventRecord>, CoreError>;

    async fn commit(&self, changeset: Changeset) -> Result<(), CoreError>;
}

#[async_trait]
pub trait AuditLog: Send + Sync {
    async fn append(&self, entries: &[NewAuditEntry]) -> Result<(), CoreError>;

    /// All entries for one event, `created_at` ascending.
    async fn entries_for(&self, event_id: EventId) -> Result<Vec<AuditEntry>, CoreError>;
}

#[async_trait]
pub trait ActorDirectory: Send + Sync {
    async fn resolve(
        &self,
        actor_ids: &[ActorId],
    ) -> Result<HashMap<ActorId, ActorIdentity>, CoreError>;
}

/// Source of the acting operator for the current request.
pub trait IdentityProvider {
    fn current_actor_id(&self) -> Option<ActorId>;
}

/// How audit rows relate to the classification write they describe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AuditMode {
    /// Audit rows ride in the classification transaction. A failed audit
    /// insert fails the whole operation.
    #[default]
    Transactional,
    /// Classification commits first; audit rows follow and a failure is only
    /// logged.
    BestEffort,
}

impl fmt::Display for AuditMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuditMode::Transactional => f.write_str("transactional"),
            AuditMode::BestEffort => f.write_str("best_effort"),
        }
    }
}

impl FromStr for AuditMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "transactional" | "tx" => Ok(AuditMode::Transactional),
            "best_effort" | "best-effort" | "besteffort" => Ok(AuditMode::BestEffort),
            other => Err(format!("unknown audit mode: {other}")),
        }
    }
}
