use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use specta::Type;
use uuid::Uuid;

/// Identity of a detected disturbance event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct EventId(pub Uuid);

impl EventId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for EventId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl FromStr for EventId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim()).map(Self)
    }
}

/// Operator (or service account) that performed a change. Absent = system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct ActorId(pub Uuid);

impl fmt::Display for ActorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl FromStr for ActorId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim()).map(Self)
    }
}

/// Nominal voltage level of the feeder an event was detected on.
///
/// Declaration order is priority order: a higher level always wins mother
/// selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize, Type)]
pub enum VoltageLevel {
    #[serde(rename = "400kV")]
    Kv400,
    #[serde(rename = "132kV")]
    Kv132,
    #[serde(rename = "11kV")]
    Kv11,
    #[serde(rename = "380V")]
    V380,
    Others,
    Unknown,
}

impl VoltageLevel {
    pub fn rank(self) -> u8 {
        match self {
            VoltageLevel::Kv400 => 5,
            VoltageLevel::Kv132 => 4,
            VoltageLevel::Kv11 => 3,
            VoltageLevel::V380 => 2,
            VoltageLevel::Others => 1,
            VoltageLevel::Unknown => 0,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            VoltageLevel::Kv400 => "400kV",
            VoltageLevel::Kv132 => "132kV",
            VoltageLevel::Kv11 => "11kV",
            VoltageLevel::V380 => "380V",
            VoltageLevel::Others => "Others",
            VoltageLevel::Unknown => "Unknown",
        }
    }

    /// Derives the level from the label stored by the detection pipeline.
    ///
    /// Matching ignores case and whitespace. Missing or blank labels are
    /// `Unknown`; anything unrecognised is `Others`.
    pub fn from_label(label: Option<&str>) -> Self {
        let normalized: String = match label {
            Some(raw) => raw
                .chars()
                .filter(|c| !c.is_whitespace())
                .flat_map(char::to_lowercase)
                .collect(),
            None => return VoltageLevel::Unknown,
        };

        match normalized.as_str() {
            "" | "unknown" => VoltageLevel::Unknown,
            "400kv" => VoltageLevel::Kv400,
            "132kv" => VoltageLevel::Kv132,
            "11kv" => VoltageLevel::Kv11,
            "380v" | "0.38kv" | "0.4kv" | "400v" => VoltageLevel::V380,
            _ => VoltageLevel::Others,
        }
    }
}

impl fmt::Display for VoltageLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Stored origin of a grouping decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, serde::Serialize, serde::Deserialize, Type)]
#[serde(rename_all = "snake_case")]
pub enum GroupingType {
    #[default]
    None,
    Automatic,
    Manual,
}

impl GroupingType {
    pub fn as_str(self) -> &'static str {
        match self {
            GroupingType::None => "none",
            GroupingType::Automatic => "automatic",
            GroupingType::Manual => "manual",
        }
    }
}

impl fmt::Display for GroupingType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for GroupingType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "none" | "" => Ok(GroupingType::None),
            "automatic" => Ok(GroupingType::Automatic),
            "manual" => Ok(GroupingType::Manual),
            other => Err(format!("unknown grouping type: {other}")),
        }
    }
}

/// Who initiated a grouping: an operator or the detection pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize, Type)]
#[serde(rename_all = "snake_case")]
pub enum GroupingOrigin {
    Manual,
    Automatic,
}

impl From<GroupingOrigin> for GroupingType {
    fn from(origin: GroupingOrigin) -> Self {
        match origin {
            GroupingOrigin::Manual => GroupingType::Manual,
            GroupingOrigin::Automatic => GroupingType::Automatic,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
pub struct ClassificationFlags {
    pub is_mother_event: bool,
    pub is_child_event: bool,
}

impl ClassificationFlags {
    pub fn is_grouped(self) -> bool {
        self.is_mother_event || self.is_child_event
    }
}

/// Classification an event is expected to still carry when a write lands.
///
/// A write whose guard no longer matches the stored row is rejected, which
/// turns the repository commit into a compare-and-swap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClassificationGuard {
    pub is_mother_event: bool,
    pub is_child_event: bool,
    pub parent_event_id: Option<EventId>,
}

impl ClassificationGuard {
    pub fn standalone() -> Self {
        Self {
            is_mother_event: false,
            is_child_event: false,
            parent_event_id: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventRole {
    Standalone,
    Mother,
    Child(EventId),
}

#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct EventRecord {
    pub id: EventId,
    pub timestamp: DateTime<Utc>,
    pub voltage_level: VoltageLevel,
    pub is_mother_event: bool,
    pub is_child_event: bool,
    pub parent_event_id: Option<EventId>,
    pub grouping_type: GroupingType,
    pub grouped_at: Option<DateTime<Utc>>,
    pub false_event: bool,
}

impl EventRecord {
    /// A freshly detected, ungrouped event.
    pub fn new(id: EventId, timestamp: DateTime<Utc>, voltage_level: VoltageLevel) -> Self {
        Self {
            id,
            timestamp,
            voltage_level,
            is_mother_event: false,
            is_child_event: false,
            parent_event_id: None,
            grouping_type: GroupingType::None,
            grouped_at: None,
            false_event: false,
        }
    }

    pub fn flags(&self) -> ClassificationFlags {
        ClassificationFlags {
            is_mother_event: self.is_mother_event,
            is_child_event: self.is_child_event,
        }
    }

    pub fn guard(&self) -> ClassificationGuard {
        ClassificationGuard {
            is_mother_event: self.is_mother_event,
            is_child_event: self.is_child_event,
            parent_event_id: self.parent_event_id,
        }
    }

    pub fn role(&self) -> EventRole {
        match (self.is_mother_event, self.is_child_event, self.parent_event_id) {
            (true, _, _) => EventRole::Mother,
            (false, true, Some(parent)) => EventRole::Child(parent),
            _ => EventRole::Standalone,
        }
    }

    pub fn matches(&self, guard: &ClassificationGuard) -> bool {
        self.guard() == *guard
    }

    pub fn apply(&mut self, patch: &ClassificationPatch) {
        if let Some(v) = patch.is_mother_event {
            self.is_mother_event = v;
        }
        if let Some(v) = patch.is_child_event {
            self.is_child_event = v;
        }
        if let Some(v) = patch.parent_event_id {
            self.parent_event_id = v;
        }
        if let Some(v) = patch.grouping_type {
            self.grouping_type = v;
        }
        if let Some(v) = patch.grouped_at {
            self.grouped_at = v;
        }
        if let Some(v) = patch.false_event {
            self.false_event = v;
        }
    }
}

/// Column-level update; `None` leaves the stored value untouched.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ClassificationPatch {
    pub is_mother_event: Option<bool>,
    pub is_child_event: Option<bool>,
    pub parent_event_id: Option<Option<EventId>>,
    pub grouping_type: Option<GroupingType>,
    pub grouped_at: Option<Option<DateTime<Utc>>>,
    pub false_event: Option<bool>,
}

impl ClassificationPatch {
    pub fn mother(grouping_type: GroupingType, at: DateTime<Utc>) -> Self {
        Self {
            is_mother_event: Some(true),
            is_child_event: Some(false),
            parent_event_id: Some(None),
            grouping_type: Some(grouping_type),
            grouped_at: Some(Some(at)),
            false_event: None,
        }
    }

    pub fn child(mother: EventId, grouping_type: GroupingType, at: DateTime<Utc>) -> Self {
        Self {
            is_mother_event: Some(false),
            is_child_event: Some(true),
            parent_event_id: Some(Some(mother)),
            grouping_type: Some(grouping_type),
            grouped_at: Some(Some(at)),
            false_event: None,
        }
    }

    pub fn standalone() -> Self {
        Self {
            is_mother_event: Some(false),
            is_child_event: Some(false),
            parent_event_id: Some(None),
            grouping_type: Some(GroupingType::None),
            grouped_at: Some(None),
            false_event: None,
        }
    }

    /// Rewrites a child's current parent link unchanged. Paired with the
    /// child's guard, it pins the sibling so a concurrent detach conflicts.
    pub fn keep_child(mother: EventId) -> Self {
        Self {
            parent_event_id: Some(Some(mother)),
            ..Self::default()
        }
    }

    pub fn false_event(value: bool) -> Self {
        Self {
            false_event: Some(value),
            ..Self::default()
        }
    }

    pub fn with_false_event(mut self, value: bool) -> Self {
        self.false_event = Some(value);
        self
    }

    /// Names of the columns this patch touches, in storage order.
    pub fn affected_fields(&self) -> Vec<String> {
        let mut out = Vec::new();
        if self.is_mother_event.is_some() {
            out.push("is_mother_event".to_string());
        }
        if self.is_child_event.is_some() {
            out.push("is_child_event".to_string());
        }
        if self.parent_event_id.is_some() {
            out.push("parent_event_id".to_string());
        }
        if self.grouping_type.is_some() {
            out.push("grouping_type".to_string());
        }
        if self.grouped_at.is_some() {
            out.push("grouped_at".to_string());
        }
        if self.false_event.is_some() {
            out.push("false_event".to_string());
        }
        out
    }
}
