//! Grouping, ungrouping and false-event transitions over an
//! [`EventRepository`], with one audit entry per affected event.

use std::sync::Arc;

use serde_json::json;

use crate::audit::NewAuditEntry;
use crate::error::CoreError;
use crate::event::{ClassificationPatch, EventId, EventRecord};
use crate::store::{
    ActorDirectory, AuditLog, AuditMode, Changeset, ClassificationWrite, EventRepository,
};

mod false_event;
mod grouping;
mod trail;
mod ungrouping;

pub use false_event::{ConvertOutcome, FalseEventReport};
pub use grouping::{GroupView, GroupingReport};
pub use ungrouping::{PartialUngroupReport, UngroupOutcome};

#[derive(Clone)]
pub struct EventGroupingService {
    events: Arc<dyn EventRepository>,
    audit: Arc<dyn AuditLog>,
    actors: Option<Arc<dyn ActorDirectory>>,
    audit_mode: AuditMode,
}

impl EventGroupingService {
    pub fn new(events: Arc<dyn EventRepository>, audit: Arc<dyn AuditLog>) -> Self {
        Self {
            events,
            audit,
            actors: None,
            audit_mode: AuditMode::default(),
        }
    }

    pub fn with_actor_directory(mut self, actors: Arc<dyn ActorDirectory>) -> Self {
        self.actors = Some(actors);
        self
    }

    pub fn with_audit_mode(mut self, mode: AuditMode) -> Self {
        self.audit_mode = mode;
        self
    }

    pub fn audit_mode(&self) -> AuditMode {
        self.audit_mode
    }

    /// Commits classification writes, then their audit entries.
    async fn apply(
        &self,
        writes: Vec<ClassificationWrite>,
        entries: Vec<NewAuditEntry>,
    ) -> Result<(), CoreError> {
        match self.audit_mode {
            AuditMode::Transactional => {
                self.events
                    .commit(Changeset {
                        writes,
                        audit: entries,
                    })
                    .await
            }
            AuditMode::BestEffort => {
                self.events
                    .commit(Changeset {
                        writes,
                        audit: Vec::new(),
                    })
                    .await?;

                if entries.is_empty() {
                    return Ok(());
                }
                if let Err(err) = self.audit.append(&entries).await {
                    let event_ids: Vec<String> =
                        entries.iter().map(|e| e.event_id.to_string()).collect();
                    tracing::warn!(
                        %err,
                        operation = %entries[0].operation_type,
                        ?event_ids,
                        "failed to write audit entries"
                    );
                }
                Ok(())
            }
        }
    }
}

/// Guarded no-op writes for the children that stay with `mother_id`.
///
/// Whether a mother keeps her role depends on these siblings; without a guard
/// on each, two callers detaching different children could both leave one
/// behind and neither revert the mother.
fn pin_children<'a>(
    mother_id: EventId,
    remaining: impl IntoIterator<Item = &'a EventRecord>,
) -> Vec<ClassificationWrite> {
    remaining
        .into_iter()
        .map(|child| ClassificationWrite {
            id: child.id,
            guard: child.guard(),
            patch: ClassificationPatch::keep_child(mother_id),
        })
        .collect()
}

/// Classification columns as they stood, for `before`/`after` payloads.
fn classification_snapshot(ev: &EventRecord) -> serde_json::Value {
    json!({
        "is_mother_event": ev.is_mother_event,
        "is_child_event": ev.is_child_event,
        "parent_event_id": ev.parent_event_id,
        "grouping_type": ev.grouping_type,
        "grouped_at": ev.grouped_at,
        "false_event": ev.false_event,
    })
}

#[cfg(test)]
pub(crate) mod testkit {
    use std::sync::Arc;

    use chrono::{DateTime, TimeZone, Utc};

    use super::EventGroupingService;
    use crate::event::{EventId, EventRecord, VoltageLevel};
    use crate::memory::MemoryStore;
    use crate::store::AuditMode;

    pub fn at(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 14, h, m, 0).unwrap()
    }

    pub struct Harness {
        pub store: Arc<MemoryStore>,
        pub service: EventGroupingService,
    }

    impl Harness {
        pub fn new() -> Self {
            Self::with_mode(AuditMode::Transactional)
        }

        pub fn with_mode(mode: AuditMode) -> Self {
            let store = Arc::new(MemoryStore::new());
            let service = EventGroupingService::new(store.clone(), store.clone())
                .with_actor_directory(store.clone())
                .with_audit_mode(mode);
            Self { store, service }
        }

        pub fn event(&self, level: VoltageLevel, ts: DateTime<Utc>) -> EventId {
            let ev = EventRecord::new(EventId::new(), ts, level);
            let id = ev.id;
            self.store.insert_event(ev);
            id
        }

        pub fn get(&self, id: EventId) -> EventRecord {
            self.store.event(id).expect("seeded event")
        }
    }
}
