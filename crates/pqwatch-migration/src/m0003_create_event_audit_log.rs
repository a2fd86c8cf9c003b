use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(EventAuditLog::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(EventAuditLog::Id)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(EventAuditLog::EventId).uuid().not_null())
                    .col(
                        ColumnDef::new(EventAuditLog::OperationType)
                            .string()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(EventAuditLog::OperationDetails)
                            .json_binary()
                            .not_null(),
                    )
                    .col(ColumnDef::new(EventAuditLog::ActorId).uuid().null())
                    .col(
                        ColumnDef::new(EventAuditLog::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null()
                            .default(Expr::current_timestamp()),
                    )
                    .to_owned(),
            )
            .await?;

        // No foreign key to events: entries outlive the events they describe
        // (`event_deleted`).
        manager
            .create_index(
                Index::create()
                    .name("idx_event_audit_log_event_id_created_at")
                    .table(EventAuditLog::Table)
                    .col(EventAuditLog::EventId)
                    .col(EventAuditLog::CreatedAt)
                    .if_not_exists()
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_event_audit_log_actor_id")
                    .table(EventAuditLog::Table)
                    .col(EventAuditLog::ActorId)
                    .if_not_exists()
                    .to_owned(),
            )
            .await?;

        // Entries are immutable once written.
        manager
            .get_connection()
            .execute_unprepared(
                r#"
CREATE OR REPLACE FUNCTION event_audit_log_append_only() RETURNS trigger AS $$
BEGIN
    RAISE EXCEPTION 'event_audit_log is append-only';
END;
$$ LANGUAGE plpgsql;

DROP TRIGGER IF EXISTS event_audit_log_append_only ON event_audit_log;
CREATE TRIGGER event_audit_log_append_only
    BEFORE UPDATE OR DELETE ON event_audit_log
    FOR EACH ROW EXECUTE FUNCTION event_audit_log_append_only();
"#,
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .get_connection()
            .execute_unprepared("DROP FUNCTION IF EXISTS event_audit_log_append_only() CASCADE;")
            .await?;
        manager
            .drop_table(Table::drop().table(EventAuditLog::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum EventAuditLog {
    Table,
    Id,
    EventId,
    OperationType,
    OperationDetails,
    ActorId,
    CreatedAt,
}
