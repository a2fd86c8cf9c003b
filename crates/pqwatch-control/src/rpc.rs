use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use pqwatch_core::{
    ActorId, ConvertOutcome, CoreError, EventGroupingService, EventId, EventRecord,
    FalseEventReport, GroupView, GroupingOrigin, GroupingProposal, GroupingReport, GroupingType,
    IdentityProvider, PartialUngroupReport, UngroupOutcome, VoltageLevel,
};
use rspc::{Procedure, ProcedureError, ResolverError, Router};
use specta::Type;

use crate::audit;
use crate::auth::AuthUser;
use crate::config::ControlConfig;

// Request context for rspc procedures.
#[derive(Clone)]
pub struct Ctx {
    pub service: Arc<EventGroupingService>,
    pub config: Arc<ControlConfig>,
    pub limiter: Arc<RateLimiter>,
    pub user: Option<AuthUser>,
    pub request_id: String,
}

impl IdentityProvider for Ctx {
    fn current_actor_id(&self) -> Option<ActorId> {
        self.user.as_ref().and_then(|u| u.current_actor_id())
    }
}

#[derive(Debug, Clone, serde::Serialize, Type)]
pub struct ApiError {
    pub code: String,
    pub message: String,
    pub request_id: String,
    pub field_errors: BTreeMap<String, String>,
    pub hint: Option<String>,
}

impl rspc::Error for ApiError {
    fn into_procedure_error(self) -> ProcedureError {
        // Keep error payload intentionally minimal/safe for frontend.
        ResolverError::new(self, Option::<std::io::Error>::None).into()
    }
}

pub(crate) fn api_error(ctx: &Ctx, code: &str, message: impl Into<String>) -> ApiError {
    ApiError {
        code: code.to_string(),
        message: message.into(),
        request_id: ctx.request_id.clone(),
        field_errors: BTreeMap::new(),
        hint: None,
    }
}

fn mark_ids(fields: &mut BTreeMap<String, String>, ids: &[EventId], reason: &str) {
    for id in ids {
        fields.insert(id.to_string(), reason.to_string());
    }
}

/// Maps a service failure to the frontend payload. Offending event ids land in
/// `field_errors` so the UI can highlight them and re-fetch.
pub(crate) fn api_error_from_core(ctx: &Ctx, err: CoreError) -> ApiError {
    let mut field_errors = BTreeMap::new();
    let hint = match &err {
        CoreError::InsufficientSelection { .. } => Some("select at least two events"),
        CoreError::GroupingConflict { ids } => {
            mark_ids(&mut field_errors, ids, "already grouped");
            Some("the selection changed underneath you; refresh the events and group again")
        }
        CoreError::PartialUngroupMismatch {
            parents,
            not_children,
        } => {
            mark_ids(&mut field_errors, parents, "different parent");
            mark_ids(&mut field_errors, not_children, "not a child event");
            Some("select children of a single mother")
        }
        CoreError::NotFound { id } => {
            mark_ids(&mut field_errors, &[*id], "not found");
            None
        }
        CoreError::NotMother { id } => {
            mark_ids(&mut field_errors, &[*id], "not a mother event");
            None
        }
        CoreError::IncompleteGroupSelection { missing, .. } => {
            mark_ids(&mut field_errors, missing, "child not selected");
            Some("select the whole group, or mark the children individually")
        }
        CoreError::InvalidSelection { .. } => None,
        CoreError::Storage(_) => {
            tracing::error!(request_id = %ctx.request_id, %err, "storage failure");
            Some("temporary storage failure; safe to retry")
        }
    };

    ApiError {
        code: err.code().to_string(),
        message: err.to_string(),
        request_id: ctx.request_id.clone(),
        field_errors,
        hint: hint.map(str::to_string),
    }
}

pub(crate) fn parse_event_id(ctx: &Ctx, field: &str, raw: &str) -> Result<EventId, ApiError> {
    raw.trim().parse::<EventId>().map_err(|_| {
        let mut err = api_error(ctx, "invalid_param", format!("{field} is not a valid event id"));
        err.field_errors
            .insert(field.to_string(), format!("invalid id: {raw}"));
        err
    })
}

fn parse_event_ids(ctx: &Ctx, field: &str, raw: &[String]) -> Result<Vec<EventId>, ApiError> {
    raw.iter().map(|r| parse_event_id(ctx, field, r)).collect()
}

pub(crate) fn ensure_writable(ctx: &Ctx) -> Result<(), ApiError> {
    if ctx.config.read_only {
        return Err(api_error(ctx, "read_only", "dashboard is in read-only mode"));
    }
    Ok(())
}

pub struct RateLimiter {
    window: Duration,
    max_hits: usize,
    hits: Mutex<HashMap<String, VecDeque<Instant>>>,
}

impl RateLimiter {
    pub fn new(max_hits: usize, window: Duration) -> Self {
        Self {
            window,
            max_hits,
            hits: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_config(config: &ControlConfig) -> Self {
        Self::new(config.rate_limit_max_hits, config.rate_limit_window)
    }

    fn allow(&self, key: &str) -> bool {
        let now = Instant::now();
        let mut map = self.hits.lock().unwrap_or_else(|e| e.into_inner());
        let q = map.entry(key.to_string()).or_default();
        while q
            .front()
            .is_some_and(|t| now.duration_since(*t) > self.window)
        {
            q.pop_front();
        }
        if q.len() >= self.max_hits {
            return false;
        }
        q.push_back(now);
        true
    }
}

fn rate_limit_key(ctx: &Ctx) -> String {
    ctx.user
        .as_ref()
        .map(|u| format!("user:{}", u.user_id))
        .unwrap_or_else(|| "anon".to_string())
}

pub(crate) fn enforce_rate_limit(ctx: &Ctx) -> Result<(), ApiError> {
    if !ctx.limiter.allow(&rate_limit_key(ctx)) {
        return Err(api_error(ctx, "rate_limited", "too many requests"));
    }
    Ok(())
}

/// Common gate for every classification change.
fn guard_mutation(ctx: &Ctx) -> Result<Option<ActorId>, ApiError> {
    ensure_writable(ctx)?;
    enforce_rate_limit(ctx)?;
    Ok(ctx.current_actor_id())
}

fn ids_out(ids: &[EventId]) -> Vec<String> {
    ids.iter().map(ToString::to_string).collect()
}

#[derive(Debug, Clone, serde::Serialize, Type)]
pub struct PingResponse {
    pub status: String,
    pub version: String,
}

#[derive(Debug, Clone, serde::Deserialize, Type)]
pub struct EventIdsInput {
    pub event_ids: Vec<String>,
}

#[derive(Debug, Clone, serde::Deserialize, Type)]
pub struct EventIdInput {
    pub event_id: String,
}

#[derive(Debug, Clone, serde::Deserialize, Type)]
pub struct CommitGroupingInput {
    pub mother_id: String,
    pub child_ids: Vec<String>,
    pub origin: GroupingOrigin,
}

#[derive(Debug, Clone, serde::Deserialize, Type)]
pub struct MotherInput {
    pub mother_id: String,
}

#[derive(Debug, Clone, serde::Deserialize, Type)]
pub struct ChildIdsInput {
    pub child_ids: Vec<String>,
}

#[derive(Debug, Clone, serde::Serialize, Type)]
pub struct ProposalDto {
    pub mother_id: String,
    pub child_ids: Vec<String>,
}

impl From<GroupingProposal> for ProposalDto {
    fn from(p: GroupingProposal) -> Self {
        Self {
            mother_id: p.mother_id.to_string(),
            child_ids: ids_out(&p.child_ids),
        }
    }
}

#[derive(Debug, Clone, serde::Serialize, Type)]
pub struct GroupingReportDto {
    pub mother_id: String,
    pub child_ids: Vec<String>,
    pub grouping_type: GroupingType,
    pub grouped_at: String,
}

impl From<GroupingReport> for GroupingReportDto {
    fn from(r: GroupingReport) -> Self {
        Self {
            mother_id: r.mother_id.to_string(),
            child_ids: ids_out(&r.child_ids),
            grouping_type: r.grouping_type,
            grouped_at: r.grouped_at.to_rfc3339(),
        }
    }
}

#[derive(Debug, Clone, serde::Serialize, Type)]
pub struct EventDto {
    pub id: String,
    pub timestamp: String,
    pub voltage_level: VoltageLevel,
    pub is_mother_event: bool,
    pub is_child_event: bool,
    pub parent_event_id: Option<String>,
    pub grouping_type: GroupingType,
    pub grouped_at: Option<String>,
    pub false_event: bool,
}

impl From<EventRecord> for EventDto {
    fn from(e: EventRecord) -> Self {
        Self {
            id: e.id.to_string(),
            timestamp: e.timestamp.to_rfc3339(),
            voltage_level: e.voltage_level,
            is_mother_event: e.is_mother_event,
            is_child_event: e.is_child_event,
            parent_event_id: e.parent_event_id.map(|p| p.to_string()),
            grouping_type: e.grouping_type,
            grouped_at: e.grouped_at.map(|t| t.to_rfc3339()),
            false_event: e.false_event,
        }
    }
}

#[derive(Debug, Clone, serde::Serialize, Type)]
pub struct GroupViewDto {
    pub mother: EventDto,
    pub children: Vec<EventDto>,
}

impl From<GroupView> for GroupViewDto {
    fn from(v: GroupView) -> Self {
        Self {
            mother: v.mother.into(),
            children: v.children.into_iter().map(EventDto::from).collect(),
        }
    }
}

#[derive(Debug, Clone, serde::Serialize, Type)]
pub struct UngroupFullDto {
    /// False when the event was already standalone.
    pub ungrouped: bool,
    pub mother_id: String,
    pub child_ids: Vec<String>,
}

impl From<UngroupOutcome> for UngroupFullDto {
    fn from(o: UngroupOutcome) -> Self {
        match o {
            UngroupOutcome::Ungrouped {
                mother_id,
                child_ids,
            } => Self {
                ungrouped: true,
                mother_id: mother_id.to_string(),
                child_ids: ids_out(&child_ids),
            },
            UngroupOutcome::AlreadyStandalone { id } => Self {
                ungrouped: false,
                mother_id: id.to_string(),
                child_ids: Vec::new(),
            },
        }
    }
}

#[derive(Debug, Clone, serde::Serialize, Type)]
pub struct PartialUngroupDto {
    pub mother_id: String,
    pub removed: Vec<String>,
    pub remaining_children: u32,
    pub mother_reverted: bool,
}

impl From<PartialUngroupReport> for PartialUngroupDto {
    fn from(r: PartialUngroupReport) -> Self {
        Self {
            mother_id: r.mother_id.to_string(),
            removed: ids_out(&r.removed),
            remaining_children: u32::try_from(r.remaining_children).unwrap_or(u32::MAX),
            mother_reverted: r.mother_reverted,
        }
    }
}

#[derive(Debug, Clone, serde::Serialize, Type)]
pub struct FalseEventReportDto {
    pub marked: Vec<String>,
    pub batch_groups: Vec<String>,
    pub reverted_mothers: Vec<String>,
    pub skipped: Vec<String>,
}

impl From<FalseEventReport> for FalseEventReportDto {
    fn from(r: FalseEventReport) -> Self {
        Self {
            marked: ids_out(&r.marked),
            batch_groups: ids_out(&r.batch_groups),
            reverted_mothers: ids_out(&r.reverted_mothers),
            skipped: ids_out(&r.skipped),
        }
    }
}

#[derive(Debug, Clone, serde::Serialize, Type)]
pub struct ConvertDto {
    pub event_id: String,
    /// False when the event was not marked false.
    pub converted: bool,
}

impl From<ConvertOutcome> for ConvertDto {
    fn from(o: ConvertOutcome) -> Self {
        match o {
            ConvertOutcome::Converted { id } => Self {
                event_id: id.to_string(),
                converted: true,
            },
            ConvertOutcome::Unchanged { id } => Self {
                event_id: id.to_string(),
                converted: false,
            },
        }
    }
}

pub fn router() -> Router<Ctx> {
    // NOTE: Procedure keys are nested segments; the runtime request path
    // flattens to "segment.segment".
    let control = Router::new().procedure(
        "ping",
        Procedure::builder::<ApiError>().query(|_, _: ()| async move {
            Ok(PingResponse {
                status: "ok".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
            })
        }),
    );

    let grouping = Router::new()
        .procedure(
            "propose",
            Procedure::builder::<ApiError>().query(|ctx, input: EventIdsInput| async move {
                let ids = parse_event_ids(&ctx, "event_ids", &input.event_ids)?;
                let proposal = ctx
                    .service
                    .propose_grouping(&ids)
                    .await
                    .map_err(|e| api_error_from_core(&ctx, e))?;
                Ok(ProposalDto::from(proposal))
            }),
        )
        .procedure(
            "commit",
            Procedure::builder::<ApiError>().mutation(
                |ctx, input: CommitGroupingInput| async move {
                    let actor = guard_mutation(&ctx)?;
                    let mother = parse_event_id(&ctx, "mother_id", &input.mother_id)?;
                    let children = parse_event_ids(&ctx, "child_ids", &input.child_ids)?;
                    let report = ctx
                        .service
                        .commit_grouping(mother, &children, input.origin, actor)
                        .await
                        .map_err(|e| api_error_from_core(&ctx, e))?;
                    Ok(GroupingReportDto::from(report))
                },
            ),
        )
        .procedure(
            "ungroupFull",
            Procedure::builder::<ApiError>().mutation(|ctx, input: MotherInput| async move {
                let actor = guard_mutation(&ctx)?;
                let mother = parse_event_id(&ctx, "mother_id", &input.mother_id)?;
                let outcome = ctx
                    .service
                    .ungroup_full(mother, actor)
                    .await
                    .map_err(|e| api_error_from_core(&ctx, e))?;
                Ok(UngroupFullDto::from(outcome))
            }),
        )
        .procedure(
            "ungroupPartial",
            Procedure::builder::<ApiError>().mutation(|ctx, input: ChildIdsInput| async move {
                let actor = guard_mutation(&ctx)?;
                let children = parse_event_ids(&ctx, "child_ids", &input.child_ids)?;
                let report = ctx
                    .service
                    .ungroup_partial(&children, actor)
                    .await
                    .map_err(|e| api_error_from_core(&ctx, e))?;
                Ok(PartialUngroupDto::from(report))
            }),
        )
        .procedure(
            "group",
            Procedure::builder::<ApiError>().query(|ctx, input: MotherInput| async move {
                let mother = parse_event_id(&ctx, "mother_id", &input.mother_id)?;
                let view = ctx
                    .service
                    .get_group(mother)
                    .await
                    .map_err(|e| api_error_from_core(&ctx, e))?;
                Ok(GroupViewDto::from(view))
            }),
        );

    let false_event = Router::new()
        .procedure(
            "mark",
            Procedure::builder::<ApiError>().mutation(|ctx, input: EventIdsInput| async move {
                let actor = guard_mutation(&ctx)?;
                let ids = parse_event_ids(&ctx, "event_ids", &input.event_ids)?;
                let report = ctx
                    .service
                    .mark_false(&ids, actor)
                    .await
                    .map_err(|e| api_error_from_core(&ctx, e))?;
                Ok(FalseEventReportDto::from(report))
            }),
        )
        .procedure(
            "convert",
            Procedure::builder::<ApiError>().mutation(|ctx, input: EventIdInput| async move {
                let actor = guard_mutation(&ctx)?;
                let id = parse_event_id(&ctx, "event_id", &input.event_id)?;
                let outcome = ctx
                    .service
                    .convert_from_false(id, actor)
                    .await
                    .map_err(|e| api_error_from_core(&ctx, e))?;
                Ok(ConvertDto::from(outcome))
            }),
        );

    Router::new()
        .nest("control", control)
        .nest("grouping", grouping)
        .nest("falseEvent", false_event)
        .nest("audit", audit::router())
}

#[cfg(test)]
pub(crate) mod tests {
    use pqwatch_core::memory::MemoryStore;

    use super::*;

    pub(crate) fn test_config(read_only: bool) -> ControlConfig {
        let mut cfg = ControlConfig::from_lookup(|key| match key {
            "DATABASE_URL" => Some("postgres://localhost/pqwatch".to_string()),
            "PQWATCH_JWT_SECRET" => Some("test-secret".to_string()),
            _ => None,
        })
        .unwrap();
        cfg.read_only = read_only;
        cfg
    }

    pub(crate) fn ctx_with(store: Arc<MemoryStore>, user: Option<AuthUser>) -> Ctx {
        let config = test_config(false);
        Ctx {
            service: Arc::new(EventGroupingService::new(store.clone(), store)),
            limiter: Arc::new(RateLimiter::from_config(&config)),
            config: Arc::new(config),
            user,
            request_id: "req-1".to_string(),
        }
    }

    #[test]
    fn conflict_names_every_blocking_event() {
        let ctx = ctx_with(Arc::new(MemoryStore::new()), None);
        let a = EventId::new();
        let b = EventId::new();
        let err = api_error_from_core(&ctx, CoreError::GroupingConflict { ids: vec![a, b] });
        assert_eq!(err.code, "grouping_conflict");
        assert_eq!(err.request_id, "req-1");
        assert_eq!(err.field_errors.get(&a.to_string()).map(String::as_str), Some("already grouped"));
        assert!(err.field_errors.contains_key(&b.to_string()));
        assert!(err.hint.is_some());
    }

    #[test]
    fn partial_mismatch_separates_reasons() {
        let ctx = ctx_with(Arc::new(MemoryStore::new()), None);
        let p = EventId::new();
        let n = EventId::new();
        let err = api_error_from_core(
            &ctx,
            CoreError::PartialUngroupMismatch {
                parents: vec![p],
                not_children: vec![n],
            },
        );
        assert_eq!(err.code, "partial_ungroup_mismatch");
        assert_eq!(err.field_errors[&p.to_string()], "different parent");
        assert_eq!(err.field_errors[&n.to_string()], "not a child event");
    }

    #[test]
    fn storage_failure_is_flagged_retryable() {
        let ctx = ctx_with(Arc::new(MemoryStore::new()), None);
        let err = api_error_from_core(&ctx, CoreError::storage("connection reset"));
        assert_eq!(err.code, "storage_failure");
        assert!(err.hint.unwrap().contains("retry"));
    }

    #[test]
    fn bad_ids_are_reported_per_field() {
        let ctx = ctx_with(Arc::new(MemoryStore::new()), None);
        let err = parse_event_ids(&ctx, "child_ids", &["nope".to_string()]).unwrap_err();
        assert_eq!(err.code, "invalid_param");
        assert!(err.field_errors.contains_key("child_ids"));

        let id = EventId::new();
        assert_eq!(parse_event_id(&ctx, "mother_id", &format!(" {id} ")).unwrap(), id);
    }

    #[test]
    fn read_only_blocks_mutations() {
        let mut ctx = ctx_with(Arc::new(MemoryStore::new()), None);
        assert!(ensure_writable(&ctx).is_ok());
        ctx.config = Arc::new(test_config(true));
        assert_eq!(ensure_writable(&ctx).unwrap_err().code, "read_only");
    }

    #[test]
    fn rate_limit_is_per_user() {
        let mut ctx = ctx_with(Arc::new(MemoryStore::new()), None);
        ctx.limiter = Arc::new(RateLimiter::new(2, Duration::from_secs(60)));
        assert!(enforce_rate_limit(&ctx).is_ok());
        assert!(enforce_rate_limit(&ctx).is_ok());
        assert_eq!(enforce_rate_limit(&ctx).unwrap_err().code, "rate_limited");

        ctx.user = Some(AuthUser {
            user_id: uuid::Uuid::new_v4().to_string(),
            username: "ana".to_string(),
            is_admin: false,
        });
        assert!(enforce_rate_limit(&ctx).is_ok());
    }

    #[test]
    fn actor_comes_from_the_signed_in_user() {
        let id = uuid::Uuid::new_v4();
        let ctx = ctx_with(
            Arc::new(MemoryStore::new()),
            Some(AuthUser {
                user_id: id.to_string(),
                username: "ana".to_string(),
                is_admin: false,
            }),
        );
        assert_eq!(guard_mutation(&ctx).unwrap(), Some(ActorId(id)));
    }

    #[test]
    fn outcomes_flatten_for_the_frontend() {
        let id = EventId::new();
        let dto = UngroupFullDto::from(UngroupOutcome::AlreadyStandalone { id });
        assert!(!dto.ungrouped);
        assert_eq!(dto.mother_id, id.to_string());

        let json = serde_json::to_value(ConvertDto::from(ConvertOutcome::Converted { id })).unwrap();
        assert_eq!(json["converted"], true);
        assert_eq!(json["event_id"], id.to_string());
    }

    #[test]
    fn router_builds() {
        assert!(router().build().is_ok());
    }
}
