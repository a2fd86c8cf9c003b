use chrono::Utc;
use serde_json::json;

use super::{EventGroupingService, classification_snapshot, pin_children};
use crate::audit::{AuditOperation, NewAuditEntry, OperationDetails};
use crate::error::CoreError;
use crate::event::{ActorId, ClassificationPatch, EventId, EventRecord, EventRole};
use crate::selection::dedup_ids;
use crate::store::ClassificationWrite;

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum UngroupOutcome {
    Ungrouped {
        mother_id: EventId,
        child_ids: Vec<EventId>,
    },
    /// Nothing to do: the event is not (or no longer) a mother.
    AlreadyStandalone { id: EventId },
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct PartialUngroupReport {
    pub mother_id: EventId,
    pub removed: Vec<EventId>,
    pub remaining_children: usize,
    /// The mother lost its last child and is standalone again.
    pub mother_reverted: bool,
}

impl EventGroupingService {
    /// Dissolves a whole group. Repeating the call on the now-standalone
    /// event is a no-op.
    pub async fn ungroup_full(
        &self,
        mother_id: EventId,
        actor: Option<ActorId>,
    ) -> Result<UngroupOutcome, CoreError> {
        let mother = self.events.fetch_event(mother_id).await?;
        match mother.role() {
            EventRole::Mother => {}
            EventRole::Standalone => {
                tracing::debug!(event = %mother_id, "ungroup skipped, already standalone");
                return Ok(UngroupOutcome::AlreadyStandalone { id: mother_id });
            }
            EventRole::Child(_) => return Err(CoreError::NotMother { id: mother_id }),
        }

        let children = self.events.fetch_children(mother_id).await?;
        let child_ids: Vec<EventId> = children.iter().map(|c| c.id).collect();
        let patch = ClassificationPatch::standalone();

        let mut writes = Vec::with_capacity(children.len() + 1);
        writes.push(ClassificationWrite {
            id: mother_id,
            guard: mother.guard(),
            patch: patch.clone(),
        });
        writes.extend(children.iter().map(|c| ClassificationWrite {
            id: c.id,
            guard: c.guard(),
            patch: patch.clone(),
        }));

        let entry = NewAuditEntry::new(
            mother_id,
            AuditOperation::UngroupedFull,
            OperationDetails::fields(patch.affected_fields())
                .related(child_ids.clone())
                .child_count(child_ids.len())
                .before(classification_snapshot(&mother)),
            actor,
            Utc::now(),
        );

        self.apply(writes, vec![entry]).await?;

        tracing::info!(mother = %mother_id, children = child_ids.len(), "group dissolved");
        Ok(UngroupOutcome::Ungrouped {
            mother_id,
            child_ids,
        })
    }

    /// Detaches some children from their mother.
    ///
    /// Every id must currently be a child of the same mother. Removing the
    /// last child reverts the mother to standalone in the same commit.
    pub async fn ungroup_partial(
        &self,
        child_ids: &[EventId],
        actor: Option<ActorId>,
    ) -> Result<PartialUngroupReport, CoreError> {
        let ids = dedup_ids(child_ids);
        if ids.is_empty() {
            return Err(CoreError::InvalidSelection {
                reason: "no children given".to_string(),
            });
        }

        let events = self.events.fetch_events(&ids).await?;
        let mut parents = Vec::new();
        let mut not_children = Vec::new();
        for ev in &events {
            match ev.role() {
                EventRole::Child(parent) => {
                    if !parents.contains(&parent) {
                        parents.push(parent);
                    }
                }
                EventRole::Mother | EventRole::Standalone => not_children.push(ev.id),
            }
        }
        if parents.len() != 1 || !not_children.is_empty() {
            return Err(CoreError::PartialUngroupMismatch {
                parents,
                not_children,
            });
        }

        let mother_id = parents[0];
        let mother = self.events.fetch_event(mother_id).await?;
        let siblings = self.events.fetch_children(mother_id).await?;
        let remaining: Vec<&EventRecord> =
            siblings.iter().filter(|s| !ids.contains(&s.id)).collect();
        let remaining_children = remaining.len();
        let mother_reverted = remaining_children == 0;

        let patch = ClassificationPatch::standalone();
        let now = Utc::now();

        let mut writes: Vec<ClassificationWrite> = events
            .iter()
            .map(|ev| ClassificationWrite {
                id: ev.id,
                guard: ev.guard(),
                patch: patch.clone(),
            })
            .collect();
        let mut entries: Vec<NewAuditEntry> = events
            .iter()
            .map(|ev| {
                NewAuditEntry::new(
                    ev.id,
                    AuditOperation::UngroupedPartial,
                    OperationDetails::fields(patch.affected_fields())
                        .mother(mother_id)
                        .before(classification_snapshot(ev)),
                    actor,
                    now,
                )
            })
            .collect();

        let mut mother_details = OperationDetails::default()
            .related(ids.clone())
            .child_count(remaining_children)
            .after(json!({ "mother_reverted": mother_reverted }));
        if mother_reverted {
            writes.push(ClassificationWrite {
                id: mother_id,
                guard: mother.guard(),
                patch: patch.clone(),
            });
            mother_details.affected_fields = patch.affected_fields();
            mother_details = mother_details
                .before(classification_snapshot(&mother))
                .note("last child removed, mother reverted to standalone");
        } else {
            writes.extend(pin_children(mother_id, remaining));
        }
        entries.push(NewAuditEntry::new(
            mother_id,
            AuditOperation::UngroupedPartial,
            mother_details,
            actor,
            now,
        ));

        self.apply(writes, entries).await?;

        tracing::info!(
            mother = %mother_id,
            removed = ids.len(),
            remaining_children,
            mother_reverted,
            "children detached"
        );
        Ok(PartialUngroupReport {
            mother_id,
            removed: ids,
            remaining_children,
            mother_reverted,
        })
    }
}
