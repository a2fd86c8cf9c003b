use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use specta::Type;
use uuid::Uuid;

use crate::event::{ActorId, EventId, GroupingOrigin};

/// Every state change the dashboard records. Stored as the snake_case name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize, Type)]
#[serde(rename_all = "snake_case")]
pub enum AuditOperation {
    GroupedManual,
    GroupedAutomatic,
    UngroupedFull,
    UngroupedPartial,
    MarkedFalse,
    BatchMarkedFalse,
    ConvertedFromFalse,
    IdrCreated,
    IdrUpdated,
    StatusChanged,
    SeverityChanged,
    EventResolved,
    EventDeleted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize, Type)]
#[serde(rename_all = "snake_case")]
pub enum AuditCategory {
    Grouping,
    FalseEvent,
    Idr,
    Status,
}

impl AuditOperation {
    pub const ALL: [AuditOperation; 13] = [
        AuditOperation::GroupedManual,
        AuditOperation::GroupedAutomatic,
        AuditOperation::UngroupedFull,
        AuditOperation::UngroupedPartial,
        AuditOperation::MarkedFalse,
        AuditOperation::BatchMarkedFalse,
        AuditOperation::ConvertedFromFalse,
        AuditOperation::IdrCreated,
        AuditOperation::IdrUpdated,
        AuditOperation::StatusChanged,
        AuditOperation::SeverityChanged,
        AuditOperation::EventResolved,
        AuditOperation::EventDeleted,
    ];

    pub fn grouped(origin: GroupingOrigin) -> Self {
        match origin {
            GroupingOrigin::Manual => AuditOperation::GroupedManual,
            GroupingOrigin::Automatic => AuditOperation::GroupedAutomatic,
        }
    }

    pub fn category(self) -> AuditCategory {
        match self {
            AuditOperation::GroupedManual
            | AuditOperation::GroupedAutomatic
            | AuditOperation::UngroupedFull
            | AuditOperation::UngroupedPartial => AuditCategory::Grouping,
            AuditOperation::MarkedFalse
            | AuditOperation::BatchMarkedFalse
            | AuditOperation::ConvertedFromFalse => AuditCategory::FalseEvent,
            AuditOperation::IdrCreated | AuditOperation::IdrUpdated => AuditCategory::Idr,
            AuditOperation::StatusChanged
            | AuditOperation::SeverityChanged
            | AuditOperation::EventResolved
            | AuditOperation::EventDeleted => AuditCategory::Status,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            AuditOperation::GroupedManual => "grouped_manual",
            AuditOperation::GroupedAutomatic => "grouped_automatic",
            AuditOperation::UngroupedFull => "ungrouped_full",
            AuditOperation::UngroupedPartial => "ungrouped_partial",
            AuditOperation::MarkedFalse => "marked_false",
            AuditOperation::BatchMarkedFalse => "batch_marked_false",
            AuditOperation::ConvertedFromFalse => "converted_from_false",
            AuditOperation::IdrCreated => "idr_created",
            AuditOperation::IdrUpdated => "idr_updated",
            AuditOperation::StatusChanged => "status_changed",
            AuditOperation::SeverityChanged => "severity_changed",
            AuditOperation::EventResolved => "event_resolved",
            AuditOperation::EventDeleted => "event_deleted",
        }
    }
}

impl fmt::Display for AuditOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AuditOperation {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        AuditOperation::ALL
            .into_iter()
            .find(|op| op.as_str() == s)
            .ok_or_else(|| format!("unknown audit operation: {s}"))
    }
}

/// Payload stored in `operation_details`.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct OperationDetails {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub affected_fields: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub before: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub related_event_ids: Vec<EventId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mother_event_id: Option<EventId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub child_count: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

impl OperationDetails {
    pub fn fields(fields: Vec<String>) -> Self {
        Self {
            affected_fields: fields,
            ..Self::default()
        }
    }

    pub fn before(mut self, value: serde_json::Value) -> Self {
        self.before = Some(value);
        self
    }

    pub fn after(mut self, value: serde_json::Value) -> Self {
        self.after = Some(value);
        self
    }

    pub fn related(mut self, ids: Vec<EventId>) -> Self {
        self.related_event_ids = ids;
        self
    }

    pub fn mother(mut self, id: EventId) -> Self {
        self.mother_event_id = Some(id);
        self
    }

    pub fn child_count(mut self, n: usize) -> Self {
        self.child_count = Some(n);
        self
    }

    pub fn note(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }
}

/// An entry ready to be appended; the store stamps nothing else.
#[derive(Debug, Clone, PartialEq)]
pub struct NewAuditEntry {
    pub id: Uuid,
    pub event_id: EventId,
    pub operation_type: AuditOperation,
    pub operation_details: OperationDetails,
    pub actor_id: Option<ActorId>,
    pub created_at: DateTime<Utc>,
}

impl NewAuditEntry {
    pub fn new(
        event_id: EventId,
        operation_type: AuditOperation,
        operation_details: OperationDetails,
        actor_id: Option<ActorId>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            // v7 ids sort by creation time, which keeps same-timestamp entries in
            // append order.
            id: Uuid::now_v7(),
            event_id,
            operation_type,
            operation_details,
            actor_id,
            created_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct AuditEntry {
    pub id: Uuid,
    pub event_id: EventId,
    pub operation_type: AuditOperation,
    pub operation_details: OperationDetails,
    pub actor_id: Option<ActorId>,
    pub created_at: DateTime<Utc>,
}

impl From<NewAuditEntry> for AuditEntry {
    fn from(e: NewAuditEntry) -> Self {
        Self {
            id: e.id,
            event_id: e.event_id,
            operation_type: e.operation_type,
            operation_details: e.operation_details,
            actor_id: e.actor_id,
            created_at: e.created_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ActorIdentity {
    pub actor_id: ActorId,
    pub username: String,
    pub display_name: Option<String>,
}

impl ActorIdentity {
    pub fn label(&self) -> &str {
        self.display_name.as_deref().unwrap_or(&self.username)
    }
}

/// Who performed an entry, as shown next to it in the audit trail.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ActorLabel {
    System,
    Known(ActorIdentity),
    /// The actor id no longer resolves (deleted account, foreign directory).
    Unresolved { actor_id: ActorId },
    /// Resolution was not requested.
    Raw { actor_id: ActorId },
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct AuditTrailEntry {
    pub entry: AuditEntry,
    pub category: AuditCategory,
    pub actor: ActorLabel,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_operation_has_exactly_one_category() {
        let mut grouping = 0;
        let mut false_event = 0;
        let mut idr = 0;
        let mut status = 0;
        for op in AuditOperation::ALL {
            match op.category() {
                AuditCategory::Grouping => grouping += 1,
                AuditCategory::FalseEvent => false_event += 1,
                AuditCategory::Idr => idr += 1,
                AuditCategory::Status => status += 1,
            }
        }
        assert_eq!((grouping, false_event, idr, status), (4, 3, 2, 4));
    }

    #[test]
    fn stored_names_match_serde_and_parse_back() {
        for op in AuditOperation::ALL {
            let json = serde_json::to_string(&op).unwrap();
            assert_eq!(json, format!("\"{}\"", op.as_str()));
            assert_eq!(op.as_str().parse::<AuditOperation>().unwrap(), op);
        }
        assert!("grouped".parse::<AuditOperation>().is_err());
    }

    #[test]
    fn false_event_operations_are_categorized() {
        assert_eq!(AuditOperation::BatchMarkedFalse.category(), AuditCategory::FalseEvent);
        assert_eq!(AuditOperation::UngroupedPartial.category(), AuditCategory::Grouping);
        assert_eq!(AuditOperation::SeverityChanged.category(), AuditCategory::Status);
        assert_eq!(AuditOperation::IdrUpdated.category(), AuditCategory::Idr);
    }

    #[test]
    fn details_skip_empty_fields() {
        let mother = EventId::new();
        let details = OperationDetails::fields(vec!["is_child_event".into()]).mother(mother);
        let v = serde_json::to_value(&details).unwrap();
        assert_eq!(v["mother_event_id"], serde_json::json!(mother.to_string()));
        assert!(v.get("note").is_none());
        assert!(v.get("related_event_ids").is_none());

        let back: OperationDetails = serde_json::from_value(v).unwrap();
        assert_eq!(back, details);
    }
}
