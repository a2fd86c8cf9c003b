use std::collections::HashMap;

use chrono::Utc;

use super::EventGroupingService;
use crate::audit::{
    ActorLabel, AuditCategory, AuditEntry, AuditOperation, AuditTrailEntry, NewAuditEntry,
    OperationDetails,
};
use crate::error::CoreError;
use crate::event::{ActorId, EventId};

impl EventGroupingService {
    /// Audit history of one event, oldest first.
    ///
    /// `category` narrows the trail for filtered display. With `resolve_actors`
    /// set and a directory configured, actor ids are replaced by display
    /// identities.
    pub async fn get_audit_trail(
        &self,
        event_id: EventId,
        category: Option<AuditCategory>,
        resolve_actors: bool,
    ) -> Result<Vec<AuditTrailEntry>, CoreError> {
        let entries: Vec<AuditEntry> = self
            .audit
            .entries_for(event_id)
            .await?
            .into_iter()
            .filter(|e| category.is_none_or(|c| e.operation_type.category() == c))
            .collect();

        let directory = match (&self.actors, resolve_actors) {
            (Some(dir), true) => Some(dir),
            _ => None,
        };

        let resolved = match directory {
            Some(dir) => {
                let mut actor_ids: Vec<ActorId> =
                    entries.iter().filter_map(|e| e.actor_id).collect();
                actor_ids.sort();
                actor_ids.dedup();
                if actor_ids.is_empty() {
                    HashMap::new()
                } else {
                    dir.resolve(&actor_ids).await?
                }
            }
            None => HashMap::new(),
        };

        Ok(entries
            .into_iter()
            .map(|entry| {
                let actor = match entry.actor_id {
                    None => ActorLabel::System,
                    Some(actor_id) if directory.is_none() => ActorLabel::Raw { actor_id },
                    Some(actor_id) => match resolved.get(&actor_id) {
                        Some(identity) => ActorLabel::Known(identity.clone()),
                        None => ActorLabel::Unresolved { actor_id },
                    },
                };
                AuditTrailEntry {
                    category: entry.operation_type.category(),
                    entry,
                    actor,
                }
            })
            .collect())
    }

    /// Appends an entry on behalf of an adjacent workflow (IDR, status).
    ///
    /// Grouping and false-event entries are only written by their own
    /// transitions, so those categories are refused here.
    pub async fn record_operation(
        &self,
        event_id: EventId,
        operation: AuditOperation,
        details: OperationDetails,
        actor: Option<ActorId>,
    ) -> Result<AuditEntry, CoreError> {
        match operation.category() {
            AuditCategory::Idr | AuditCategory::Status => {}
            AuditCategory::Grouping | AuditCategory::FalseEvent => {
                return Err(CoreError::InvalidSelection {
                    reason: format!("{operation} is written by its own transition"),
                });
            }
        }

        let entry = NewAuditEntry::new(event_id, operation, details, actor, Utc::now());
        self.audit.append(std::slice::from_ref(&entry)).await?;
        tracing::debug!(event = %event_id, %operation, "audit entry recorded");
        Ok(AuditEntry::from(entry))
    }
}
