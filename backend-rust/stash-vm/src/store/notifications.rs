use chrono::Utc;
use rusqlite::{params, Connection};
use uuid::Uuid;

use super::{fmt_datetime, not_found, parse_datetime, parse_opt_datetime, Store, StoreError, StoreResult};
use crate::models::{Notification, NotificationContent};

/// Notifications written inside a transaction, waiting for it to commit.
#[derive(Default)]
pub(crate) struct Outbox {
    notifications: Vec<Notification>,
}

impl Outbox {
    /// Persist a notification in the current transaction and queue it for delivery.
    pub(crate) fn push(
        &mut self,
        conn: &Connection,
        recipient_id: &str,
        actor_id: Option<&str>,
        content: NotificationContent,
    ) -> StoreResult<()> {
        let notification = insert_notification(conn, recipient_id, actor_id, content)?;
        self.notifications.push(notification);
        Ok(())
    }

    pub(crate) fn into_notifications(self) -> Vec<Notification> {
        self.notifications
    }
}

pub(crate) fn insert_notification(
    conn: &Connection,
    recipient_id: &str,
    actor_id: Option<&str>,
    content: NotificationContent,
) -> StoreResult<Notification> {
    let notification = Notification {
        id: Uuid::new_v4().to_string(),
        recipient_id: recipient_id.to_string(),
        actor_id: actor_id.map(str::to_string),
        content,
        acknowledged_at: None,
        created_at: Utc::now(),
    };
    let content_json = serde_json::to_string(&notification.content)?;

    conn.execute(
        r#"INSERT INTO notifications (id, recipient_id, actor_id, content_type, content, created_at)
           VALUES (?1, ?2, ?3, ?4, ?5, ?6)"#,
        params![
            &notification.id,
            &notification.recipient_id,
            &notification.actor_id,
            notification.content.content_type(),
            &content_json,
            fmt_datetime(&notification.created_at),
        ],
    )?;
    Ok(notification)
}

/// Raw row; the payload is decoded separately because it can fail as JSON.
struct NotificationRow {
    id: String,
    recipient_id: String,
    actor_id: Option<String>,
    content: String,
    acknowledged_at: Option<String>,
    created_at: String,
}

impl NotificationRow {
    fn decode(self) -> StoreResult<Notification> {
        Ok(Notification {
            id: self.id,
            recipient_id: self.recipient_id,
            actor_id: self.actor_id,
            content: serde_json::from_str(&self.content)?,
            acknowledged_at: parse_opt_datetime(self.acknowledged_at),
            created_at: parse_datetime(self.created_at),
        })
    }
}

fn row_to_notification(row: &rusqlite::Row) -> rusqlite::Result<NotificationRow> {
    Ok(NotificationRow {
        id: row.get("id")?,
        recipient_id: row.get("recipient_id")?,
        actor_id: row.get("actor_id")?,
        content: row.get("content")?,
        acknowledged_at: row.get("acknowledged_at")?,
        created_at: row.get("created_at")?,
    })
}

impl Store {
    // ==================== Notification Operations ====================

    /// Newest first.
    pub fn notifications(
        &self,
        user_id: &str,
        only_unacknowledged: bool,
        limit: i64,
        offset: i64,
    ) -> StoreResult<Vec<Notification>> {
        self.read(|conn| {
            let sql = if only_unacknowledged {
                "SELECT * FROM notifications WHERE recipient_id = ?1 AND acknowledged_at IS NULL
                 ORDER BY created_at DESC LIMIT ?2 OFFSET ?3"
            } else {
                "SELECT * FROM notifications WHERE recipient_id = ?1
                 ORDER BY created_at DESC LIMIT ?2 OFFSET ?3"
            };
            let mut stmt = conn.prepare(sql)?;
            let rows = stmt
                .query_map(params![user_id, limit, offset], row_to_notification)?
                .collect::<Result<Vec<_>, _>>()?;
            rows.into_iter().map(NotificationRow::decode).collect()
        })
    }

    pub fn count_unacknowledged(&self, user_id: &str) -> StoreResult<i64> {
        self.read(|conn| {
            Ok(conn.query_row(
                "SELECT COUNT(*) FROM notifications WHERE recipient_id = ?1 AND acknowledged_at IS NULL",
                params![user_id],
                |row| row.get(0),
            )?)
        })
    }

    pub fn acknowledge_notification(&self, user_id: &str, id: &str) -> StoreResult<Notification> {
        self.transaction(|tx| {
            let mut notification = tx
                .query_row(
                    "SELECT * FROM notifications WHERE id = ?1",
                    params![id],
                    row_to_notification,
                )
                .map_err(not_found(format!("Notification {}", id)))?
                .decode()?;

            if notification.recipient_id != user_id {
                return Err(StoreError::DoesNotBelongToUser(format!("Notification {}", id)));
            }

            if notification.acknowledged_at.is_none() {
                let now = Utc::now();
                tx.execute(
                    "UPDATE notifications SET acknowledged_at = ?1 WHERE id = ?2",
                    params![fmt_datetime(&now), id],
                )?;
                notification.acknowledged_at = Some(now);
            }
            Ok(notification)
        })
    }
}
