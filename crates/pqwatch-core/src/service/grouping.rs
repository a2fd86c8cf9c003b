use chrono::{DateTime, Utc};
use serde_json::json;

use super::EventGroupingService;
use crate::audit::{AuditOperation, NewAuditEntry, OperationDetails};
use crate::conflict::check_ungrouped;
use crate::error::CoreError;
use crate::event::{
    ActorId, ClassificationGuard, ClassificationPatch, EventId, EventRecord, EventRole,
    GroupingOrigin, GroupingType,
};
use crate::selection::{Candidate, GroupingProposal, dedup_ids, select_mother};
use crate::store::ClassificationWrite;

#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct GroupingReport {
    pub mother_id: EventId,
    pub child_ids: Vec<EventId>,
    pub grouping_type: GroupingType,
    pub grouped_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct GroupView {
    pub mother: EventRecord,
    pub children: Vec<EventRecord>,
}

impl EventGroupingService {
    /// Resolves the candidates and picks the mother. Reads only.
    pub async fn propose_grouping(&self, ids: &[EventId]) -> Result<GroupingProposal, CoreError> {
        let ids = dedup_ids(ids);
        if ids.len() < 2 {
            return Err(CoreError::InsufficientSelection { count: ids.len() });
        }

        let events = self.events.fetch_events(&ids).await?;
        let candidates: Vec<Candidate> = events.iter().map(Candidate::from).collect();
        select_mother(&candidates)
    }

    /// Re-verifies the selection against fresh flags and commits it.
    ///
    /// A `GroupingConflict` means someone else grouped one of the ids since the
    /// proposal; the caller has to re-propose.
    pub async fn commit_grouping(
        &self,
        mother_id: EventId,
        child_ids: &[EventId],
        origin: GroupingOrigin,
        actor: Option<ActorId>,
    ) -> Result<GroupingReport, CoreError> {
        if child_ids.is_empty() {
            return Err(CoreError::InsufficientSelection { count: 1 });
        }
        if dedup_ids(child_ids).len() != child_ids.len() {
            return Err(CoreError::InvalidSelection {
                reason: "duplicate child ids".to_string(),
            });
        }
        if child_ids.contains(&mother_id) {
            return Err(CoreError::InvalidSelection {
                reason: format!("mother {mother_id} is also listed as a child"),
            });
        }

        let mut all = Vec::with_capacity(child_ids.len() + 1);
        all.push(mother_id);
        all.extend_from_slice(child_ids);

        let flags = self.events.fetch_event_flags(&all).await?;
        if let Err(err) = check_ungrouped(&all, &flags) {
            if let CoreError::GroupingConflict { ids } = &err {
                tracing::warn!(
                    mother = %mother_id,
                    conflicting = ids.len(),
                    "grouping rejected, selection is stale"
                );
            }
            return Err(err);
        }

        let now = Utc::now();
        let grouping_type = GroupingType::from(origin);
        let mother_patch = ClassificationPatch::mother(grouping_type, now);
        let child_patch = ClassificationPatch::child(mother_id, grouping_type, now);

        let mut writes = Vec::with_capacity(all.len());
        writes.push(ClassificationWrite {
            id: mother_id,
            guard: ClassificationGuard::standalone(),
            patch: mother_patch.clone(),
        });
        writes.extend(child_ids.iter().map(|id| ClassificationWrite {
            id: *id,
            guard: ClassificationGuard::standalone(),
            patch: child_patch.clone(),
        }));

        let operation = AuditOperation::grouped(origin);
        let mut entries = Vec::with_capacity(all.len());
        entries.push(NewAuditEntry::new(
            mother_id,
            operation,
            OperationDetails::fields(mother_patch.affected_fields())
                .related(child_ids.to_vec())
                .child_count(child_ids.len())
                .after(json!({ "role": "mother", "grouping_type": grouping_type })),
            actor,
            now,
        ));
        entries.extend(child_ids.iter().map(|id| {
            NewAuditEntry::new(
                *id,
                operation,
                OperationDetails::fields(child_patch.affected_fields())
                    .mother(mother_id)
                    .after(json!({ "role": "child", "parent_event_id": mother_id })),
                actor,
                now,
            )
        }));

        self.apply(writes, entries).await?;

        tracing::info!(
            mother = %mother_id,
            children = child_ids.len(),
            %grouping_type,
            "grouping committed"
        );

        Ok(GroupingReport {
            mother_id,
            child_ids: child_ids.to_vec(),
            grouping_type,
            grouped_at: now,
        })
    }

    /// Proposal and commit in one call, for system-initiated grouping.
    pub async fn group(
        &self,
        ids: &[EventId],
        origin: GroupingOrigin,
        actor: Option<ActorId>,
    ) -> Result<GroupingReport, CoreError> {
        let proposal = self.propose_grouping(ids).await?;
        self.commit_grouping(proposal.mother_id, &proposal.child_ids, origin, actor)
            .await
    }

    pub async fn get_group(&self, mother_id: EventId) -> Result<GroupView, CoreError> {
        let mother = self.events.fetch_event(mother_id).await?;
        if mother.role() != EventRole::Mother {
            return Err(CoreError::NotMother { id: mother_id });
        }
        let children = self.events.fetch_children(mother_id).await?;
        Ok(GroupView { mother, children })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::VoltageLevel;
    use crate::service::testkit::{Harness, at};

    #[tokio::test]
    async fn proposal_follows_voltage_then_time() {
        let h = Harness::new();
        let e1 = h.event(VoltageLevel::Kv400, at(10, 0));
        let e2 = h.event(VoltageLevel::Kv11, at(9, 58));
        let e3 = h.event(VoltageLevel::Kv11, at(9, 59));

        let p = h.service.propose_grouping(&[e2, e3, e1]).await.unwrap();
        assert_eq!(p.mother_id, e1);
        assert_eq!(p.child_ids, vec![e2, e3]);

        let e4 = h.event(VoltageLevel::Kv11, at(9, 58));
        let e5 = h.event(VoltageLevel::Kv11, at(9, 59));
        let p = h.service.propose_grouping(&[e5, e4]).await.unwrap();
        assert_eq!(p.mother_id, e4);
    }

    #[tokio::test]
    async fn proposal_needs_two_distinct_events() {
        let h = Harness::new();
        let e = h.event(VoltageLevel::Kv11, at(9, 0));
        let err = h.service.propose_grouping(&[e, e]).await.unwrap_err();
        assert_eq!(err, CoreError::InsufficientSelection { count: 1 });
    }

    #[tokio::test]
    async fn proposal_reports_missing_events() {
        let h = Harness::new();
        let e = h.event(VoltageLevel::Kv11, at(9, 0));
        let ghost = EventId::new();
        let err = h.service.propose_grouping(&[e, ghost]).await.unwrap_err();
        assert_eq!(err, CoreError::NotFound { id: ghost });
    }

    #[tokio::test]
    async fn commit_sets_one_mother_and_linked_children() {
        let h = Harness::new();
        let m = h.event(VoltageLevel::Kv132, at(8, 0));
        let c1 = h.event(VoltageLevel::Kv11, at(8, 1));
        let c2 = h.event(VoltageLevel::V380, at(8, 2));

        let report = h
            .service
            .commit_grouping(m, &[c1, c2], GroupingOrigin::Manual, None)
            .await
            .unwrap();
        assert_eq!(report.grouping_type, GroupingType::Manual);

        let members = [h.get(m), h.get(c1), h.get(c2)];
        assert_eq!(members.iter().filter(|e| e.is_mother_event).count(), 1);
        assert!(members[0].is_mother_event && !members[0].is_child_event);
        assert_eq!(members[0].parent_event_id, None);
        for child in &members[1..] {
            assert!(child.is_child_event && !child.is_mother_event);
            assert_eq!(child.parent_event_id, Some(m));
            assert_eq!(child.grouping_type, GroupingType::Manual);
            assert_eq!(child.grouped_at, Some(report.grouped_at));
        }
    }

    #[tokio::test]
    async fn commit_writes_an_entry_per_member() {
        let h = Harness::new();
        let actor = ActorId(uuid::Uuid::new_v4());
        let m = h.event(VoltageLevel::Kv400, at(8, 0));
        let children: Vec<EventId> = (0..3)
            .map(|i| h.event(VoltageLevel::Kv11, at(8, i + 1)))
            .collect();

        h.service
            .commit_grouping(m, &children, GroupingOrigin::Automatic, Some(actor))
            .await
            .unwrap();

        let entries = h.store.audit_entries();
        assert_eq!(entries.len(), children.len() + 1);
        assert!(entries.iter().all(|e| e.operation_type == AuditOperation::GroupedAutomatic));
        assert!(entries.iter().all(|e| e.actor_id == Some(actor)));

        let mother_entry = entries.iter().find(|e| e.event_id == m).unwrap();
        assert_eq!(mother_entry.operation_details.child_count, Some(3));
        assert_eq!(mother_entry.operation_details.related_event_ids, children);

        for c in &children {
            let entry = entries.iter().find(|e| e.event_id == *c).unwrap();
            assert_eq!(entry.operation_details.mother_event_id, Some(m));
        }
    }

    #[tokio::test]
    async fn concurrent_grouping_loses_with_conflict() {
        let h = Harness::new();
        let x = h.event(VoltageLevel::Kv11, at(9, 0));
        let y = h.event(VoltageLevel::Kv11, at(9, 1));
        let z = h.event(VoltageLevel::Kv400, at(9, 2));

        // Actor A proposes {x, y}.
        let proposal = h.service.propose_grouping(&[x, y]).await.unwrap();

        // Actor B groups x with z first.
        h.service
            .commit_grouping(z, &[x], GroupingOrigin::Manual, None)
            .await
            .unwrap();
        let entries_before = h.store.audit_entries().len();

        let err = h
            .service
            .commit_grouping(proposal.mother_id, &proposal.child_ids, GroupingOrigin::Manual, None)
            .await
            .unwrap_err();
        assert_eq!(err, CoreError::GroupingConflict { ids: vec![x] });
        assert!(!err.is_retryable());

        let y_after = h.get(y);
        assert!(!y_after.is_mother_event && !y_after.is_child_event);
        assert_eq!(h.get(x).parent_event_id, Some(z));
        assert_eq!(h.store.audit_entries().len(), entries_before);
    }

    #[tokio::test]
    async fn race_after_verification_is_caught_by_guarded_commit() {
        let h = Harness::new();
        let a = h.event(VoltageLevel::Kv132, at(6, 0));
        let b = h.event(VoltageLevel::Kv11, at(6, 1));
        let other = EventId::new();
        let now = Utc::now();

        // Another committer lands between our verification and our write.
        h.store.before_next_commit(move |events| {
            if let Some(ev) = events.get_mut(&b) {
                ev.apply(&ClassificationPatch::child(other, GroupingType::Manual, now));
            }
        });

        let err = h
            .service
            .commit_grouping(a, &[b], GroupingOrigin::Manual, None)
            .await
            .unwrap_err();
        assert_eq!(err, CoreError::GroupingConflict { ids: vec![b] });
        assert!(!h.get(a).is_mother_event);
        assert!(h.store.audit_entries().is_empty());
    }

    #[tokio::test]
    async fn commit_rejects_malformed_selections() {
        let h = Harness::new();
        let m = h.event(VoltageLevel::Kv11, at(7, 0));
        let c = h.event(VoltageLevel::Kv11, at(7, 1));

        assert!(matches!(
            h.service
                .commit_grouping(m, &[], GroupingOrigin::Manual, None)
                .await,
            Err(CoreError::InsufficientSelection { .. })
        ));
        assert!(matches!(
            h.service
                .commit_grouping(m, &[c, c], GroupingOrigin::Manual, None)
                .await,
            Err(CoreError::InvalidSelection { .. })
        ));
        assert!(matches!(
            h.service
                .commit_grouping(m, &[c, m], GroupingOrigin::Manual, None)
                .await,
            Err(CoreError::InvalidSelection { .. })
        ));
        assert!(!h.get(m).is_mother_event);
    }

    #[tokio::test]
    async fn group_view_lists_children() {
        let h = Harness::new();
        let m = h.event(VoltageLevel::Kv400, at(5, 0));
        let c = h.event(VoltageLevel::Kv11, at(5, 1));
        h.service
            .group(&[c, m], GroupingOrigin::Automatic, None)
            .await
            .unwrap();

        let view = h.service.get_group(m).await.unwrap();
        assert_eq!(view.mother.id, m);
        assert_eq!(view.children.iter().map(|e| e.id).collect::<Vec<_>>(), vec![c]);
        assert_eq!(
            h.service.get_group(c).await.unwrap_err(),
            CoreError::NotMother { id: c }
        );
    }
}
