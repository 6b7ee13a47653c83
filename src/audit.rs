use anyhow::Result;
use rusqlite::{params, Connection};
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditAction {
    Create,
    Update,
    Delete,
}

impl AuditAction {
    pub fn as_str(self) -> &'static str {
        match self {
            AuditAction::Create => "create",
            AuditAction::Update => "update",
            AuditAction::Delete => "delete",
        }
    }
}

#[derive(Debug, Clone)]
pub struct AuditEvent {
    pub classroom_id: String,
    pub lesson_id: String,
    pub action: AuditAction,
    pub description: String,
}

/// Where reconciliation audit events land. The engine batches events and
/// records them at week granularity, never per-day.
pub trait AuditSink {
    fn record(&self, events: &[AuditEvent]) -> Result<()>;
}

pub struct SqliteAudit<'a> {
    conn: &'a Connection,
}

impl<'a> SqliteAudit<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        SqliteAudit { conn }
    }
}

fn now_ts() -> String {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs().to_string())
        .unwrap_or_else(|_| "0".to_string())
}

impl AuditSink for SqliteAudit<'_> {
    fn record(&self, events: &[AuditEvent]) -> Result<()> {
        if events.is_empty() {
            return Ok(());
        }
        let ts = now_ts();
        let mut stmt = self.conn.prepare(
            "INSERT INTO audit_log(id, classroom_id, lesson_id, action, description, created_at)
             VALUES(?, ?, ?, ?, ?, ?)",
        )?;
        for ev in events {
            stmt.execute(params![
                Uuid::new_v4().to_string(),
                ev.classroom_id,
                ev.lesson_id,
                ev.action.as_str(),
                ev.description,
                ts,
            ])?;
        }
        Ok(())
    }
}
