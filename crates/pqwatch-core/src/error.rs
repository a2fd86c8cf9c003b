use thiserror::Error;

use crate::event::EventId;

fn join_ids(ids: &[EventId]) -> String {
    ids.iter()
        .map(|id| id.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoreError {
    #[error("at least two events are required to form a group (got {count})")]
    InsufficientSelection { count: usize },

    #[error("events already grouped by someone else: {}", join_ids(.ids))]
    GroupingConflict { ids: Vec<EventId> },

    #[error(
        "requested children do not share one parent (parents: [{}], not children: [{}])",
        join_ids(.parents),
        join_ids(.not_children)
    )]
    PartialUngroupMismatch {
        parents: Vec<EventId>,
        not_children: Vec<EventId>,
    },

    #[error("event {id} not found")]
    NotFound { id: EventId },

    #[error("event {id} is not a mother event")]
    NotMother { id: EventId },

    #[error(
        "mother {mother_id} selected without all of its children (missing: {})",
        join_ids(.missing)
    )]
    IncompleteGroupSelection {
        mother_id: EventId,
        missing: Vec<EventId>,
    },

    #[error("invalid selection: {reason}")]
    InvalidSelection { reason: String },

    #[error("storage failure: {0}")]
    Storage(String),
}

impl CoreError {
    pub fn storage(err: impl std::fmt::Display) -> Self {
        CoreError::Storage(err.to_string())
    }

    /// Only transient storage failures may be retried as-is. A conflict means
    /// the caller's selection is stale and has to be re-proposed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, CoreError::Storage(_))
    }

    pub fn code(&self) -> &'static str {
        match self {
            CoreError::InsufficientSelection { .. } => "insufficient_selection",
            CoreError::GroupingConflict { .. } => "grouping_conflict",
            CoreError::PartialUngroupMismatch { .. } => "partial_ungroup_mismatch",
            CoreError::NotFound { .. } => "not_found",
            CoreError::NotMother { .. } => "not_mother",
            CoreError::IncompleteGroupSelection { .. } => "incomplete_group_selection",
            CoreError::InvalidSelection { .. } => "invalid_selection",
            CoreError::Storage(_) => "storage_failure",
        }
    }
}
