//! In-process store. Same atomicity as the database store: one lock covers a
//! whole changeset.

use std::collections::HashMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;

use crate::audit::{ActorIdentity, AuditEntry, NewAuditEntry};
use crate::error::CoreError;
use crate::event::{ActorId, ClassificationFlags, EventId, EventRecord};
use crate::store::{ActorDirectory, AuditLog, Changeset, EventRepository};

type CommitHook = Box<dyn FnOnce(&mut HashMap<EventId, EventRecord>) + Send>;

#[derive(Default)]
struct State {
    events: HashMap<EventId, EventRecord>,
    audit: Vec<AuditEntry>,
    actors: HashMap<ActorId, ActorIdentity>,
    before_next_commit: Option<CommitHook>,
}

#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
    fail_audit_writes: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn insert_event(&self, event: EventRecord) {
        self.lock().events.insert(event.id, event);
    }

    pub fn insert_actor(&self, actor: ActorIdentity) {
        self.lock().actors.insert(actor.actor_id, actor);
    }

    pub fn event(&self, id: EventId) -> Option<EventRecord> {
        self.lock().events.get(&id).cloned()
    }

    pub fn audit_entries(&self) -> Vec<AuditEntry> {
        self.lock().audit.clone()
    }

    /// Makes every audit insert fail until reset.
    #[cfg(test)]
    pub(crate) fn fail_audit_writes(&self, fail: bool) {
        self.fail_audit_writes.store(fail, Ordering::SeqCst);
    }

    /// Runs `hook` against the event table at the start of the next commit,
    /// before guards are checked. Models another writer landing first.
    #[cfg(test)]
    pub(crate) fn before_next_commit(
        &self,
        hook: impl FnOnce(&mut HashMap<EventId, EventRecord>) + Send + 'static,
    ) {
        self.lock().before_next_commit = Some(Box::new(hook));
    }

    fn audit_failure(&self) -> Option<CoreError> {
        self.fail_audit_writes
            .load(Ordering::SeqCst)
            .then(|| CoreError::storage("audit log unavailable"))
    }
}

#[async_trait]
impl EventRepository for MemoryStore {
    async fn fetch_event_flags(
        &self,
        ids: &[EventId],
    ) -> Result<HashMap<EventId, ClassificationFlags>, CoreError> {
        let state = self.lock();
        Ok(ids
            .iter()
            .filter_map(|id| state.events.get(id).map(|ev| (*id, ev.flags())))
            .collect())
    }

    async fn fetch_events(&self, ids: &[EventId]) -> Result<Vec<EventRecord>, CoreError> {
        let state = self.lock();
        ids.iter()
            .map(|id| {
                state
                    .events
                    .get(id)
                    .cloned()
                    .ok_or(CoreError::NotFound { id: *id })
            })
            .collect()
    }

    async fn fetch_children(&self, mother: EventId) -> Result<Vec<EventRecord>, CoreError> {
        let state = self.lock();
        let mut children: Vec<EventRecord> = state
            .events
            .values()
            .filter(|ev| ev.is_child_event && ev.parent_event_id == Some(mother))
            .cloned()
            .collect();
        children.sort_by(|a, b| a.timestamp.cmp(&b.timestamp).then(a.id.cmp(&b.id)));
        Ok(children)
    }

    async fn commit(&self, changeset: Changeset) -> Result<(), CoreError> {
        let mut state = self.lock();

        if let Some(hook) = state.before_next_commit.take() {
            hook(&mut state.events);
        }

        let conflicts: Vec<EventId> = changeset
            .writes
            .iter()
            .filter(|w| {
                state
                    .events
                    .get(&w.id)
                    .is_none_or(|ev| !ev.matches(&w.guard))
            })
            .map(|w| w.id)
            .collect();
        if !conflicts.is_empty() {
            return Err(CoreError::GroupingConflict { ids: conflicts });
        }

        if !changeset.audit.is_empty() {
            if let Some(err) = self.audit_failure() {
                return Err(err);
            }
        }

        for w in &changeset.writes {
            if let Some(ev) = state.events.get_mut(&w.id) {
                ev.apply(&w.patch);
            }
        }
        state
            .audit
            .extend(changeset.audit.into_iter().map(AuditEntry::from));
        Ok(())
    }
}

#[async_trait]
impl AuditLog for MemoryStore {
    async fn append(&self, entries: &[NewAuditEntry]) -> Result<(), CoreError> {
        if let Some(err) = self.audit_failure() {
            return Err(err);
        }
        self.lock()
            .audit
            .extend(entries.iter().cloned().map(AuditEntry::from));
        Ok(())
    }

    async fn entries_for(&self, event_id: EventId) -> Result<Vec<AuditEntry>, CoreError> {
        let mut out: Vec<AuditEntry> = self
            .lock()
            .audit
            .iter()
            .filter(|e| e.event_id == event_id)
            .cloned()
            .collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(out)
    }
}

#[async_trait]
impl ActorDirectory for MemoryStore {
    async fn resolve(
        &self,
        actor_ids: &[ActorId],
    ) -> Result<HashMap<ActorId, ActorIdentity>, CoreError> {
        let state = self.lock();
        Ok(actor_ids
            .iter()
            .filter_map(|id| state.actors.get(id).map(|a| (*id, a.clone())))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{ClassificationGuard, ClassificationPatch, GroupingType, VoltageLevel};
    use crate::store::ClassificationWrite;
    use chrono::Utc;

    fn seeded() -> (MemoryStore, EventId, EventId) {
        let store = MemoryStore::new();
        let a = EventRecord::new(EventId::new(), Utc::now(), VoltageLevel::Kv11);
        let b = EventRecord::new(EventId::new(), Utc::now(), VoltageLevel::Kv11);
        let ids = (a.id, b.id);
        store.insert_event(a);
        store.insert_event(b);
        (store, ids.0, ids.1)
    }

    #[tokio::test]
    async fn stale_guard_rejects_whole_changeset() {
        let (store, a, b) = seeded();
        let now = Utc::now();

        // b was grouped elsewhere after the caller read it.
        store.before_next_commit(move |events| {
            if let Some(ev) = events.get_mut(&b) {
                ev.apply(&ClassificationPatch::mother(GroupingType::Manual, now));
            }
        });

        let changeset = Changeset {
            writes: vec![
                ClassificationWrite {
                    id: a,
                    guard: ClassificationGuard::standalone(),
                    patch: ClassificationPatch::mother(GroupingType::Manual, now),
                },
                ClassificationWrite {
                    id: b,
                    guard: ClassificationGuard::standalone(),
                    patch: ClassificationPatch::child(a, GroupingType::Manual, now),
                },
            ],
            audit: vec![],
        };

        let err = store.commit(changeset).await.unwrap_err();
        assert_eq!(err, CoreError::GroupingConflict { ids: vec![b] });
        assert!(!store.event(a).unwrap().is_mother_event);
    }

    #[tokio::test]
    async fn missing_ids_are_not_found() {
        let (store, a, _) = seeded();
        let ghost = EventId::new();
        let err = store.fetch_events(&[a, ghost]).await.unwrap_err();
        assert_eq!(err, CoreError::NotFound { id: ghost });

        let flags = store.fetch_event_flags(&[a, ghost]).await.unwrap();
        assert_eq!(flags.len(), 1);
    }
}
