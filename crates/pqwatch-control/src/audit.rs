use pqwatch_core::{
    ActorLabel, AuditCategory, AuditEntry, AuditOperation, AuditTrailEntry, IdentityProvider,
    OperationDetails,
};
use rspc::{Procedure, Router};
use specta::Type;

use crate::rpc::{
    ApiError, Ctx, api_error, api_error_from_core, enforce_rate_limit, ensure_writable,
    parse_event_id,
};

#[derive(Debug, Clone, serde::Deserialize, Type)]
pub struct AuditTrailInput {
    pub event_id: String,
    pub category: Option<AuditCategory>,
    /// Defaults to true.
    pub resolve_actors: Option<bool>,
}

#[derive(Debug, Clone, serde::Deserialize, Type)]
pub struct RecordOperationInput {
    pub event_id: String,
    pub operation_type: AuditOperation,
    #[serde(default)]
    pub affected_fields: Vec<String>,
    /// JSON text.
    pub before: Option<String>,
    /// JSON text.
    pub after: Option<String>,
    pub note: Option<String>,
}

#[derive(Debug, Clone, serde::Serialize, Type)]
pub struct OperationDetailsDto {
    pub affected_fields: Vec<String>,
    /// JSON text.
    pub before: Option<String>,
    /// JSON text.
    pub after: Option<String>,
    pub related_event_ids: Vec<String>,
    pub mother_event_id: Option<String>,
    pub child_count: Option<u32>,
    pub note: Option<String>,
}

impl From<OperationDetails> for OperationDetailsDto {
    fn from(d: OperationDetails) -> Self {
        Self {
            affected_fields: d.affected_fields,
            before: d.before.map(|v| v.to_string()),
            after: d.after.map(|v| v.to_string()),
            related_event_ids: d.related_event_ids.iter().map(ToString::to_string).collect(),
            mother_event_id: d.mother_event_id.map(|id| id.to_string()),
            child_count: d.child_count.map(|n| u32::try_from(n).unwrap_or(u32::MAX)),
            note: d.note,
        }
    }
}

#[derive(Debug, Clone, Copy, serde::Serialize, Type)]
#[serde(rename_all = "snake_case")]
pub enum ActorKind {
    System,
    Known,
    Unresolved,
    Raw,
}

#[derive(Debug, Clone, serde::Serialize, Type)]
pub struct ActorDto {
    pub kind: ActorKind,
    pub actor_id: Option<String>,
    /// What the trail shows next to the entry.
    pub label: String,
}

impl From<ActorLabel> for ActorDto {
    fn from(a: ActorLabel) -> Self {
        match a {
            ActorLabel::System => Self {
                kind: ActorKind::System,
                actor_id: None,
                label: "system".to_string(),
            },
            ActorLabel::Known(identity) => Self {
                kind: ActorKind::Known,
                label: identity.label().to_string(),
                actor_id: Some(identity.actor_id.to_string()),
            },
            ActorLabel::Unresolved { actor_id } => Self {
                kind: ActorKind::Unresolved,
                actor_id: Some(actor_id.to_string()),
                label: "unknown user".to_string(),
            },
            ActorLabel::Raw { actor_id } => Self {
                kind: ActorKind::Raw,
                actor_id: Some(actor_id.to_string()),
                label: actor_id.to_string(),
            },
        }
    }
}

#[derive(Debug, Clone, serde::Serialize, Type)]
pub struct AuditEntryDto {
    pub id: String,
    pub event_id: String,
    pub operation_type: AuditOperation,
    pub category: AuditCategory,
    pub operation_details: OperationDetailsDto,
    pub actor: ActorDto,
    pub created_at: String,
}

fn entry_dto(entry: AuditEntry, category: AuditCategory, actor: ActorLabel) -> AuditEntryDto {
    AuditEntryDto {
        id: entry.id.to_string(),
        event_id: entry.event_id.to_string(),
        operation_type: entry.operation_type,
        category,
        operation_details: entry.operation_details.into(),
        actor: actor.into(),
        created_at: entry.created_at.to_rfc3339(),
    }
}

impl From<AuditTrailEntry> for AuditEntryDto {
    fn from(t: AuditTrailEntry) -> Self {
        entry_dto(t.entry, t.category, t.actor)
    }
}

fn parse_json_field(
    ctx: &Ctx,
    field: &str,
    raw: Option<String>,
) -> Result<Option<serde_json::Value>, ApiError> {
    raw.map(|text| {
        serde_json::from_str(&text).map_err(|e| {
            let mut err = api_error(ctx, "invalid_param", format!("{field} is not valid JSON"));
            err.field_errors.insert(field.to_string(), e.to_string());
            err
        })
    })
    .transpose()
}

fn details_from_input(
    ctx: &Ctx,
    input: RecordOperationInput,
) -> Result<OperationDetails, ApiError> {
    let mut details = OperationDetails::fields(input.affected_fields);
    details.before = parse_json_field(ctx, "before", input.before)?;
    details.after = parse_json_field(ctx, "after", input.after)?;
    details.note = input.note;
    Ok(details)
}

pub fn router() -> Router<Ctx> {
    Router::new()
        .procedure(
            "trail",
            Procedure::builder::<ApiError>().query(|ctx, input: AuditTrailInput| async move {
                let event_id = parse_event_id(&ctx, "event_id", &input.event_id)?;
                let trail = ctx
                    .service
                    .get_audit_trail(
                        event_id,
                        input.category,
                        input.resolve_actors.unwrap_or(true),
                    )
                    .await
                    .map_err(|e| api_error_from_core(&ctx, e))?;
                Ok(trail.into_iter().map(AuditEntryDto::from).collect::<Vec<_>>())
            }),
        )
        .procedure(
            "record",
            Procedure::builder::<ApiError>().mutation(
                |ctx, input: RecordOperationInput| async move {
                    ensure_writable(&ctx)?;
                    enforce_rate_limit(&ctx)?;
                    let event_id = parse_event_id(&ctx, "event_id", &input.event_id)?;
                    let operation = input.operation_type;
                    let details = details_from_input(&ctx, input)?;
                    let actor = ctx.current_actor_id();

                    let entry = ctx
                        .service
                        .record_operation(event_id, operation, details, actor)
                        .await
                        .map_err(|e| api_error_from_core(&ctx, e))?;

                    let label = match entry.actor_id {
                        Some(actor_id) => ActorLabel::Raw { actor_id },
                        None => ActorLabel::System,
                    };
                    Ok(entry_dto(entry, operation.category(), label))
                },
            ),
        )
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use pqwatch_core::memory::MemoryStore;
    use pqwatch_core::{ActorId, ActorIdentity, EventId};

    use super::*;
    use crate::rpc::tests::ctx_with;

    fn input(before: Option<&str>) -> RecordOperationInput {
        RecordOperationInput {
            event_id: EventId::new().to_string(),
            operation_type: AuditOperation::StatusChanged,
            affected_fields: vec!["status".to_string()],
            before: before.map(str::to_string),
            after: Some(r#"{"status":"resolved"}"#.to_string()),
            note: Some("closed after site visit".to_string()),
        }
    }

    #[test]
    fn record_input_parses_json_snapshots() {
        let ctx = ctx_with(Arc::new(MemoryStore::new()), None);
        let details = details_from_input(&ctx, input(Some(r#"{"status":"open"}"#))).unwrap();
        assert_eq!(details.before.unwrap()["status"], "open");
        assert_eq!(details.after.unwrap()["status"], "resolved");
        assert_eq!(details.affected_fields, vec!["status".to_string()]);
    }

    #[test]
    fn malformed_snapshot_is_a_field_error() {
        let ctx = ctx_with(Arc::new(MemoryStore::new()), None);
        let err = details_from_input(&ctx, input(Some("{status"))).unwrap_err();
        assert_eq!(err.code, "invalid_param");
        assert!(err.field_errors.contains_key("before"));
    }

    #[test]
    fn actor_labels_for_display() {
        let id = ActorId(uuid::Uuid::new_v4());
        let known = ActorDto::from(ActorLabel::Known(ActorIdentity {
            actor_id: id,
            username: "ana".to_string(),
            display_name: None,
        }));
        assert_eq!(known.label, "ana");
        assert_eq!(known.actor_id, Some(id.to_string()));

        let system = ActorDto::from(ActorLabel::System);
        assert!(system.actor_id.is_none());

        let gone = ActorDto::from(ActorLabel::Unresolved { actor_id: id });
        assert_eq!(gone.label, "unknown user");
    }

    #[tokio::test]
    async fn trail_maps_through_the_service() {
        let store = Arc::new(MemoryStore::new());
        let ctx = ctx_with(store.clone(), None);
        let event_id = EventId::new();

        ctx.service
            .record_operation(
                event_id,
                AuditOperation::IdrCreated,
                OperationDetails::default().note("IDR-42"),
                None,
            )
            .await
            .unwrap();

        let trail = ctx.service.get_audit_trail(event_id, None, true).await.unwrap();
        let dtos: Vec<AuditEntryDto> = trail.into_iter().map(AuditEntryDto::from).collect();
        assert_eq!(dtos.len(), 1);
        assert_eq!(dtos[0].category, AuditCategory::Idr);
        assert_eq!(dtos[0].operation_details.note.as_deref(), Some("IDR-42"));

        let json = serde_json::to_value(&dtos[0]).unwrap();
        assert_eq!(json["operation_type"], "idr_created");
        assert_eq!(json["actor"]["kind"], "system");
    }
}
