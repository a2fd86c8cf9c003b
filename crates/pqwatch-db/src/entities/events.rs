use sea_orm::entity::prelude::*;

/// Detections written by the ingest pipeline. Only the classification and
/// false-event columns are changed from here.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "events")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub timestamp: DateTimeWithTimeZone,
    pub voltage_level: Option<String>,
    pub is_mother_event: bool,
    pub is_child_event: bool,
    pub parent_event_id: Option<Uuid>,
    pub grouping_type: String,
    pub grouped_at: Option<DateTimeWithTimeZone>,
    pub false_event: bool,
    pub created_at: DateTimeWithTimeZone,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
