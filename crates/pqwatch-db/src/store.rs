use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use pqwatch_core::{
    ActorDirectory, ActorId, ActorIdentity, AuditEntry, AuditLog, Changeset, ClassificationFlags,
    ClassificationWrite, CoreError, EventId, EventRecord, EventRepository, GroupingType,
    NewAuditEntry, VoltageLevel,
};
use sea_orm::prelude::Expr;
use sea_orm::{
    ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, QueryOrder, Set, TransactionTrait,
    UpdateMany,
};

use crate::entities::{event_audit_log, events, users};

/// Postgres-backed store for events, their audit log and operator names.
#[derive(Clone)]
pub struct SeaOrmStore {
    db: Arc<DatabaseConnection>,
}

impl SeaOrmStore {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }
}

fn event_from_model(m: events::Model) -> Result<EventRecord, CoreError> {
    let grouping_type = m
        .grouping_type
        .parse::<GroupingType>()
        .map_err(|e| CoreError::Storage(format!("event {}: {e}", m.id)))?;

    Ok(EventRecord {
        id: EventId(m.id),
        timestamp: m.timestamp.with_timezone(&Utc),
        voltage_level: VoltageLevel::from_label(m.voltage_level.as_deref()),
        is_mother_event: m.is_mother_event,
        is_child_event: m.is_child_event,
        parent_event_id: m.parent_event_id.map(EventId),
        grouping_type,
        grouped_at: m.grouped_at.map(|t| t.with_timezone(&Utc)),
        false_event: m.false_event,
    })
}

fn audit_from_model(m: event_audit_log::Model) -> Result<AuditEntry, CoreError> {
    let operation_type = m
        .operation_type
        .parse()
        .map_err(|e| CoreError::Storage(format!("audit entry {}: {e}", m.id)))?;
    let operation_details = serde_json::from_value(m.operation_details)
        .map_err(|e| CoreError::Storage(format!("audit entry {}: {e}", m.id)))?;

    Ok(AuditEntry {
        id: m.id,
        event_id: EventId(m.event_id),
        operation_type,
        operation_details,
        actor_id: m.actor_id.map(ActorId),
        created_at: m.created_at.with_timezone(&Utc),
    })
}

fn audit_active_model(e: &NewAuditEntry) -> Result<event_audit_log::ActiveModel, CoreError> {
    let details = serde_json::to_value(&e.operation_details).map_err(CoreError::storage)?;
    Ok(event_audit_log::ActiveModel {
        id: Set(e.id),
        event_id: Set(e.event_id.0),
        operation_type: Set(e.operation_type.as_str().to_string()),
        operation_details: Set(details),
        actor_id: Set(e.actor_id.map(|a| a.0)),
        created_at: Set(e.created_at.fixed_offset()),
    })
}

fn audit_active_models(
    entries: &[NewAuditEntry],
) -> Result<Vec<event_audit_log::ActiveModel>, CoreError> {
    entries.iter().map(audit_active_model).collect()
}

/// `UPDATE events SET <patch> WHERE id = ? AND <guard>`; zero rows affected
/// means the guard no longer holds.
fn guarded_update(w: &ClassificationWrite) -> UpdateMany<events::Entity> {
    let p = &w.patch;
    let mut update = events::Entity::update_many();

    if let Some(v) = p.is_mother_event {
        update = update.col_expr(events::Column::IsMotherEvent, Expr::value(v));
    }
    if let Some(v) = p.is_child_event {
        update = update.col_expr(events::Column::IsChildEvent, Expr::value(v));
    }
    if let Some(v) = p.parent_event_id {
        update = update.col_expr(events::Column::ParentEventId, Expr::value(v.map(|id| id.0)));
    }
    if let Some(v) = p.grouping_type {
        update = update.col_expr(events::Column::GroupingType, Expr::value(v.as_str()));
    }
    if let Some(v) = p.grouped_at {
        update = update.col_expr(
            events::Column::GroupedAt,
            Expr::value(v.map(|t| t.fixed_offset())),
        );
    }
    if let Some(v) = p.false_event {
        update = update.col_expr(events::Column::FalseEvent, Expr::value(v));
    }

    let parent = match w.guard.parent_event_id {
        Some(parent) => events::Column::ParentEventId.eq(parent.0),
        None => events::Column::ParentEventId.is_null(),
    };

    update
        .filter(events::Column::Id.eq(w.id.0))
        .filter(events::Column::IsMotherEvent.eq(w.guard.is_mother_event))
        .filter(events::Column::IsChildEvent.eq(w.guard.is_child_event))
        .filter(parent)
}

#[async_trait]
impl EventRepository for SeaOrmStore {
    async fn fetch_event_flags(
        &self,
        ids: &[EventId],
    ) -> Result<HashMap<EventId, ClassificationFlags>, CoreError> {
        let rows = events::Entity::find()
            .filter(events::Column::Id.is_in(ids.iter().map(|id| id.0)))
            .all(&*self.db)
            .await
            .map_err(CoreError::storage)?;

        Ok(rows
            .into_iter()
            .map(|m| {
                (
                    EventId(m.id),
                    ClassificationFlags {
                        is_mother_event: m.is_mother_event,
                        is_child_event: m.is_child_event,
                    },
                )
            })
            .collect())
    }

    async fn fetch_events(&self, ids: &[EventId]) -> Result<Vec<EventRecord>, CoreError> {
        let rows = events::Entity::find()
            .filter(events::Column::Id.is_in(ids.iter().map(|id| id.0)))
            .all(&*self.db)
            .await
            .map_err(CoreError::storage)?;

        let mut by_id: HashMap<EventId, events::Model> =
            rows.into_iter().map(|m| (EventId(m.id), m)).collect();
        ids.iter()
            .map(|id| {
                by_id
                    .remove(id)
                    .ok_or(CoreError::NotFound { id: *id })
                    .and_then(event_from_model)
            })
            .collect()
    }

    async fn fetch_children(&self, mother: EventId) -> Result<Vec<EventRecord>, CoreError> {
        events::Entity::find()
            .filter(events::Column::ParentEventId.eq(mother.0))
            .filter(events::Column::IsChildEvent.eq(true))
            .order_by_asc(events::Column::Timestamp)
            .order_by_asc(events::Column::Id)
            .all(&*self.db)
            .await
            .map_err(CoreError::storage)?
            .into_iter()
            .map(event_from_model)
            .collect()
    }

    async fn commit(&self, changeset: Changeset) -> Result<(), CoreError> {
        if changeset.is_empty() {
            return Ok(());
        }

        let audit_rows = audit_active_models(&changeset.audit)?;
        // Dropping the transaction on an early return rolls it back.
        let txn = self.db.begin().await.map_err(CoreError::storage)?;

        let mut conflicts = Vec::new();
        for w in &changeset.writes {
            let res = guarded_update(w)
                .exec(&txn)
                .await
                .map_err(CoreError::storage)?;
            if res.rows_affected == 0 {
                conflicts.push(w.id);
            }
        }
        if !conflicts.is_empty() {
            txn.rollback().await.map_err(CoreError::storage)?;
            tracing::warn!(conflicting = conflicts.len(), "classification commit lost a race");
            return Err(CoreError::GroupingConflict { ids: conflicts });
        }

        if !audit_rows.is_empty() {
            event_audit_log::Entity::insert_many(audit_rows)
                .exec_without_returning(&txn)
                .await
                .map_err(CoreError::storage)?;
        }

        txn.commit().await.map_err(CoreError::storage)
    }
}

#[async_trait]
impl AuditLog for SeaOrmStore {
    async fn append(&self, entries: &[NewAuditEntry]) -> Result<(), CoreError> {
        if entries.is_empty() {
            return Ok(());
        }
        event_audit_log::Entity::insert_many(audit_active_models(entries)?)
            .exec_without_returning(&*self.db)
            .await
            .map_err(CoreError::storage)?;
        Ok(())
    }

    async fn entries_for(&self, event_id: EventId) -> Result<Vec<AuditEntry>, CoreError> {
        event_audit_log::Entity::find()
            .filter(event_audit_log::Column::EventId.eq(event_id.0))
            .order_by_asc(event_audit_log::Column::CreatedAt)
            .order_by_asc(event_audit_log::Column::Id)
            .all(&*self.db)
            .await
            .map_err(CoreError::storage)?
            .into_iter()
            .map(audit_from_model)
            .collect()
    }
}

#[async_trait]
impl ActorDirectory for SeaOrmStore {
    async fn resolve(
        &self,
        actor_ids: &[ActorId],
    ) -> Result<HashMap<ActorId, ActorIdentity>, CoreError> {
        let rows = users::Entity::find()
            .filter(users::Column::Id.is_in(actor_ids.iter().map(|a| a.0)))
            .all(&*self.db)
            .await
            .map_err(CoreError::storage)?;

        Ok(rows
            .into_iter()
            .map(|u| {
                let actor_id = ActorId(u.id);
                (
                    actor_id,
                    ActorIdentity {
                        actor_id,
                        username: u.username,
                        display_name: u.display_name,
                    },
                )
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use pqwatch_core::{
        AuditOperation, ClassificationGuard, ClassificationPatch, OperationDetails,
    };
    use sea_orm::prelude::Uuid;

    fn row(grouping_type: &str, voltage: Option<&str>) -> events::Model {
        let ts = Utc.with_ymd_and_hms(2026, 1, 2, 3, 4, 5).unwrap().fixed_offset();
        events::Model {
            id: Uuid::new_v4(),
            timestamp: ts,
            voltage_level: voltage.map(str::to_string),
            is_mother_event: false,
            is_child_event: true,
            parent_event_id: Some(Uuid::new_v4()),
            grouping_type: grouping_type.to_string(),
            grouped_at: Some(ts),
            false_event: false,
            created_at: ts,
        }
    }

    #[test]
    fn event_rows_map_to_records() {
        let m = row("automatic", Some("132 kV"));
        let parent = m.parent_event_id;
        let ev = event_from_model(m).unwrap();
        assert_eq!(ev.voltage_level, VoltageLevel::Kv132);
        assert_eq!(ev.grouping_type, GroupingType::Automatic);
        assert_eq!(ev.parent_event_id.map(|p| p.0), parent);
    }

    #[test]
    fn unknown_grouping_type_is_a_storage_error() {
        let err = event_from_model(row("nested", None)).unwrap_err();
        assert!(matches!(err, CoreError::Storage(msg) if msg.contains("nested")));
    }

    #[test]
    fn audit_rows_keep_stored_names() {
        let entry = NewAuditEntry::new(
            EventId(Uuid::new_v4()),
            AuditOperation::BatchMarkedFalse,
            OperationDetails::fields(vec!["false_event".into()]).child_count(2),
            None,
            Utc::now(),
        );
        let model = audit_active_model(&entry).unwrap();
        assert_eq!(
            model.operation_type,
            Set("batch_marked_false".to_string())
        );
        assert_eq!(model.actor_id, Set(None));
    }

    #[test]
    fn unknown_operation_type_is_not_dropped() {
        let m = event_audit_log::Model {
            id: Uuid::new_v4(),
            event_id: Uuid::new_v4(),
            operation_type: "teleported".to_string(),
            operation_details: serde_json::json!({}),
            actor_id: None,
            created_at: Utc::now().fixed_offset(),
        };
        assert!(matches!(audit_from_model(m), Err(CoreError::Storage(_))));
    }

    #[test]
    fn guarded_update_filters_on_expected_classification() {
        use sea_orm::{DbBackend, QueryTrait};

        let parent = EventId(Uuid::new_v4());
        let w = ClassificationWrite {
            id: EventId(Uuid::new_v4()),
            guard: ClassificationGuard {
                is_mother_event: false,
                is_child_event: true,
                parent_event_id: Some(parent),
            },
            patch: ClassificationPatch::standalone().with_false_event(true),
        };
        let sql = guarded_update(&w).build(DbBackend::Postgres).to_string();
        assert!(sql.starts_with("UPDATE \"events\" SET"));
        assert!(sql.contains("\"false_event\" = TRUE"));
        assert!(sql.contains("\"is_child_event\" = TRUE"));
        assert!(sql.contains(&parent.to_string()));

        let fresh = ClassificationWrite {
            guard: ClassificationGuard::standalone(),
            ..w
        };
        let sql = guarded_update(&fresh).build(DbBackend::Postgres).to_string();
        assert!(sql.contains("\"parent_event_id\" IS NULL"));
    }

    fn mock_store(rows_affected: &[u64]) -> (SeaOrmStore, Arc<DatabaseConnection>) {
        use sea_orm::{DatabaseBackend, MockDatabase, MockExecResult};

        let results = rows_affected.iter().map(|&n| MockExecResult {
            last_insert_id: 0,
            rows_affected: n,
        });
        let db = Arc::new(
            MockDatabase::new(DatabaseBackend::Postgres)
                .append_exec_results(results)
                .into_connection(),
        );
        (SeaOrmStore::new(db.clone()), db)
    }

    fn transaction_log(store: SeaOrmStore, db: Arc<DatabaseConnection>) -> String {
        drop(store);
        let db = Arc::try_unwrap(db).ok().unwrap();
        db.into_transaction_log()
            .iter()
            .flat_map(|t| t.statements())
            .map(|s| s.sql.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }

    fn grouping_changeset(mother: EventId, child: EventId) -> Changeset {
        let now = Utc::now();
        Changeset {
            writes: vec![
                ClassificationWrite {
                    id: mother,
                    guard: ClassificationGuard::standalone(),
                    patch: ClassificationPatch::mother(GroupingType::Manual, now),
                },
                ClassificationWrite {
                    id: child,
                    guard: ClassificationGuard::standalone(),
                    patch: ClassificationPatch::child(mother, GroupingType::Manual, now),
                },
            ],
            audit: vec![
                NewAuditEntry::new(
                    mother,
                    AuditOperation::GroupedManual,
                    OperationDetails::default().related(vec![child]).child_count(1),
                    None,
                    now,
                ),
                NewAuditEntry::new(
                    child,
                    AuditOperation::GroupedManual,
                    OperationDetails::default().mother(mother),
                    None,
                    now,
                ),
            ],
        }
    }

    #[tokio::test]
    async fn commit_writes_guarded_updates_then_audit_rows() {
        let mother = EventId(Uuid::new_v4());
        let child = EventId(Uuid::new_v4());
        let (store, db) = mock_store(&[1, 1, 2]);

        store.commit(grouping_changeset(mother, child)).await.unwrap();

        let log = transaction_log(store, db);
        assert!(log.contains("UPDATE \"events\" SET"));
        assert!(log.contains("INSERT INTO \"event_audit_log\""));
    }

    #[tokio::test]
    async fn stale_guard_rolls_back_and_names_the_event() {
        let mother = EventId(Uuid::new_v4());
        let child = EventId(Uuid::new_v4());
        // The child's row no longer matches its guard.
        let (store, db) = mock_store(&[1, 0]);

        let err = store
            .commit(grouping_changeset(mother, child))
            .await
            .unwrap_err();
        assert_eq!(err, CoreError::GroupingConflict { ids: vec![child] });

        let log = transaction_log(store, db);
        assert!(!log.contains("event_audit_log"));
    }
}
