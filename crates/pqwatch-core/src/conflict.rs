use std::collections::HashMap;

use crate::error::CoreError;
use crate::event::{ClassificationFlags, EventId};

/// Checks freshly read flags for a proposed group.
///
/// Every id must exist and carry neither flag. Conflicts are reported in input
/// order so callers can show them next to their selection.
pub fn check_ungrouped(
    ids: &[EventId],
    flags: &HashMap<EventId, ClassificationFlags>,
) -> Result<(), CoreError> {
    let mut conflicting = Vec::new();
    for id in ids {
        match flags.get(id) {
            None => return Err(CoreError::NotFound { id: *id }),
            Some(f) if f.is_grouped() => conflicting.push(*id),
            Some(_) => {}
        }
    }

    if conflicting.is_empty() {
        Ok(())
    } else {
        Err(CoreError::GroupingConflict { ids: conflicting })
    }
}
