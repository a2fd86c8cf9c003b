pub mod event_audit_log;
pub mod events;
pub mod users;
