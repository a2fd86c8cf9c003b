use std::collections::{BTreeMap, HashSet};

use chrono::Utc;
use serde_json::json;

use super::{EventGroupingService, classification_snapshot, pin_children};
use crate::audit::{AuditOperation, NewAuditEntry, OperationDetails};
use crate::error::CoreError;
use crate::event::{ActorId, ClassificationPatch, EventId, EventRecord, EventRole};
use crate::selection::dedup_ids;
use crate::store::ClassificationWrite;

#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct FalseEventReport {
    /// Events marked false one by one (children are detached).
    pub marked: Vec<EventId>,
    /// Mothers whose whole group was marked false, grouping kept.
    pub batch_groups: Vec<EventId>,
    /// Mothers that lost their last child to this call.
    pub reverted_mothers: Vec<EventId>,
    /// Already false; nothing written.
    pub skipped: Vec<EventId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ConvertOutcome {
    Converted { id: EventId },
    Unchanged { id: EventId },
}

impl EventGroupingService {
    /// Marks detections as not corresponding to a real disturbance.
    ///
    /// A mother listed together with all of its children marks the whole
    /// group false and keeps it intact. A child listed without its mother is
    /// detached from the group. A mother listed without all of its children is
    /// rejected.
    pub async fn mark_false(
        &self,
        ids: &[EventId],
        actor: Option<ActorId>,
    ) -> Result<FalseEventReport, CoreError> {
        let ids = dedup_ids(ids);
        if ids.is_empty() {
            return Err(CoreError::InvalidSelection {
                reason: "no events given".to_string(),
            });
        }

        let events = self.events.fetch_events(&ids).await?;
        let selected: HashSet<EventId> = ids.iter().copied().collect();
        let now = Utc::now();

        let mut report = FalseEventReport::default();
        let mut writes = Vec::new();
        let mut entries = Vec::new();
        let mut in_batch: HashSet<EventId> = HashSet::new();

        for mother in events.iter().filter(|ev| ev.role() == EventRole::Mother) {
            let children = self.events.fetch_children(mother.id).await?;
            let missing: Vec<EventId> = children
                .iter()
                .map(|c| c.id)
                .filter(|id| !selected.contains(id))
                .collect();
            if !missing.is_empty() {
                return Err(CoreError::IncompleteGroupSelection {
                    mother_id: mother.id,
                    missing,
                });
            }

            let members: Vec<&EventRecord> =
                std::iter::once(mother).chain(children.iter()).collect();
            let member_ids: Vec<EventId> = members.iter().map(|m| m.id).collect();
            in_batch.extend(member_ids.iter().copied());

            let mut changed = false;
            for member in members {
                // Every member is guarded, so a child detached meanwhile
                // fails the commit instead of being silently left out.
                let patch = ClassificationPatch::false_event(true);
                writes.push(ClassificationWrite {
                    id: member.id,
                    guard: member.guard(),
                    patch: patch.clone(),
                });
                if member.false_event {
                    report.skipped.push(member.id);
                    continue;
                }
                changed = true;
                entries.push(NewAuditEntry::new(
                    member.id,
                    AuditOperation::BatchMarkedFalse,
                    OperationDetails::fields(patch.affected_fields())
                        .mother(mother.id)
                        .related(member_ids.clone())
                        .child_count(member_ids.len() - 1)
                        .before(json!({ "false_event": false }))
                        .after(json!({ "false_event": true })),
                    actor,
                    now,
                ));
            }
            if changed {
                report.batch_groups.push(mother.id);
            }
        }

        // Detached children per mother, for the last-child check below.
        let mut detached: BTreeMap<EventId, Vec<EventId>> = BTreeMap::new();

        for ev in events.iter().filter(|ev| !in_batch.contains(&ev.id)) {
            let patch = match ev.role() {
                // A child marked on its own always leaves its group, even if
                // an earlier batch already flagged it false.
                EventRole::Child(parent) => {
                    detached.entry(parent).or_default().push(ev.id);
                    ClassificationPatch::standalone().with_false_event(true)
                }
                EventRole::Standalone if ev.false_event => {
                    report.skipped.push(ev.id);
                    continue;
                }
                EventRole::Standalone => ClassificationPatch::false_event(true),
                // Mothers are all in `in_batch` by now.
                EventRole::Mother => continue,
            };

            let mut details = OperationDetails::fields(patch.affected_fields())
                .before(classification_snapshot(ev))
                .after(json!({ "false_event": true }));
            if let EventRole::Child(parent) = ev.role() {
                details = details
                    .mother(parent)
                    .note("detection marked false, removed from its group");
            }
            entries.push(NewAuditEntry::new(
                ev.id,
                AuditOperation::MarkedFalse,
                details,
                actor,
                now,
            ));
            writes.push(ClassificationWrite {
                id: ev.id,
                guard: ev.guard(),
                patch,
            });
            report.marked.push(ev.id);
        }

        for (mother_id, removed) in detached {
            let mother = self.events.fetch_event(mother_id).await?;
            if mother.role() != EventRole::Mother {
                continue;
            }
            let siblings = self.events.fetch_children(mother_id).await?;
            let remaining: Vec<&EventRecord> =
                siblings.iter().filter(|s| !removed.contains(&s.id)).collect();
            if !remaining.is_empty() {
                writes.extend(pin_children(mother_id, remaining));
                continue;
            }

            let patch = ClassificationPatch::standalone();
            entries.push(NewAuditEntry::new(
                mother_id,
                AuditOperation::UngroupedPartial,
                OperationDetails::fields(patch.affected_fields())
                    .related(removed)
                    .child_count(0)
                    .before(classification_snapshot(&mother))
                    .after(json!({ "mother_reverted": true }))
                    .note("last child marked false, mother reverted to standalone"),
                actor,
                now,
            ));
            writes.push(ClassificationWrite {
                id: mother_id,
                guard: mother.guard(),
                patch,
            });
            report.reverted_mothers.push(mother_id);
        }

        // Guard-only writes change nothing; skip the commit.
        if entries.is_empty() {
            return Ok(report);
        }

        self.apply(writes, entries).await?;

        tracing::info!(
            marked = report.marked.len(),
            batch_groups = report.batch_groups.len(),
            reverted_mothers = report.reverted_mothers.len(),
            skipped = report.skipped.len(),
            "events marked false"
        );
        Ok(report)
    }

    /// Clears the false flag. The event stays wherever it is; nothing is
    /// re-grouped.
    pub async fn convert_from_false(
        &self,
        id: EventId,
        actor: Option<ActorId>,
    ) -> Result<ConvertOutcome, CoreError> {
        let ev = self.events.fetch_event(id).await?;
        if !ev.false_event {
            return Ok(ConvertOutcome::Unchanged { id });
        }

        let patch = ClassificationPatch::false_event(false);
        let entry = NewAuditEntry::new(
            id,
            AuditOperation::ConvertedFromFalse,
            OperationDetails::fields(patch.affected_fields())
                .before(json!({ "false_event": true }))
                .after(json!({ "false_event": false })),
            actor,
            Utc::now(),
        );
        self.apply(
            vec![ClassificationWrite {
                id,
                guard: ev.guard(),
                patch,
            }],
            vec![entry],
        )
        .await?;

        tracing::info!(event = %id, "event converted from false");
        Ok(ConvertOutcome::Converted { id })
    }
}
