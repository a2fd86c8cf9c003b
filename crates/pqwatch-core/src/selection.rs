use chrono::{DateTime, Utc};

use crate::error::CoreError;
use crate::event::{EventId, EventRecord, VoltageLevel};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Candidate {
    pub id: EventId,
    pub voltage_level: VoltageLevel,
    pub timestamp: DateTime<Utc>,
}

impl From<&EventRecord> for Candidate {
    fn from(ev: &EventRecord) -> Self {
        Self {
            id: ev.id,
            voltage_level: ev.voltage_level,
            timestamp: ev.timestamp,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct GroupingProposal {
    pub mother_id: EventId,
    pub child_ids: Vec<EventId>,
}

/// Drops repeated ids, keeping the first occurrence so input order survives.
pub fn dedup_ids(ids: &[EventId]) -> Vec<EventId> {
    let mut seen = std::collections::HashSet::with_capacity(ids.len());
    ids.iter().copied().filter(|id| seen.insert(*id)).collect()
}

/// Picks the mother of a candidate set.
///
/// Highest voltage rank wins; equal ranks go to the earliest timestamp; full
/// ties keep input order (the sort is stable).
pub fn select_mother(candidates: &[Candidate]) -> Result<GroupingProposal, CoreError> {
    if candidates.len() < 2 {
        return Err(CoreError::InsufficientSelection {
            count: candidates.len(),
        });
    }

    let mut ranked: Vec<&Candidate> = candidates.iter().collect();
    ranked.sort_by(|a, b| {
        b.voltage_level
            .rank()
            .cmp(&a.voltage_level.rank())
            .then_with(|| a.timestamp.cmp(&b.timestamp))
    });

    let mother_id = ranked[0].id;
    let child_ids = ranked[1..].iter().map(|c| c.id).collect();
    Ok(GroupingProposal {
        mother_id,
        child_ids,
    })
}
