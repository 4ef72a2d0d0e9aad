use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashSet;
use uuid::Uuid;

use super::cart::prune_carts;
use super::users::user_exists;
use super::{fmt_datetime, not_found, parse_datetime, Store, StoreError, StoreResult};
use crate::models::{NotificationContent, Share, ShareTarget};
use crate::resolver::Resolver;

// One row per share, with whichever join row it has.
const SHARE_SELECT: &str = r#"SELECT s.id, s.owner_id, s.target_user_id, s.created_at,
                                     st.thing_id, sl.list_id
                              FROM shares s
                              LEFT JOIN shares_things st ON st.share_id = s.id
                              LEFT JOIN shares_lists sl ON sl.share_id = s.id"#;

fn row_to_share(row: &rusqlite::Row) -> rusqlite::Result<Share> {
    let thing_id: Option<String> = row.get("thing_id")?;
    let list_id: Option<String> = row.get("list_id")?;
    let target = match (thing_id, list_id) {
        (Some(thing_id), None) => ShareTarget::Thing(thing_id),
        (None, Some(list_id)) => ShareTarget::List(list_id),
        _ => {
            return Err(rusqlite::Error::InvalidColumnType(
                4,
                "share target".to_string(),
                rusqlite::types::Type::Null,
            ))
        }
    };
    Ok(Share {
        id: row.get("id")?,
        owner_id: row.get("owner_id")?,
        target_user_id: row.get("target_user_id")?,
        target,
        created_at: parse_datetime(row.get("created_at")?),
    })
}

pub(crate) fn load_share(conn: &Connection, id: &str) -> StoreResult<Share> {
    conn.query_row(
        &format!("{} WHERE s.id = ?1", SHARE_SELECT),
        params![id],
        row_to_share,
    )
    .map_err(not_found(format!("Share {}", id)))
}

fn query_shares(conn: &Connection, condition: &str, arg: &str) -> StoreResult<Vec<Share>> {
    let mut stmt = conn.prepare(&format!(
        "{} WHERE {} ORDER BY s.created_at, s.id",
        SHARE_SELECT, condition
    ))?;
    let shares = stmt
        .query_map(params![arg], row_to_share)?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(shares)
}

fn shares_on(conn: &Connection, target: &ShareTarget) -> StoreResult<Vec<Share>> {
    match target {
        ShareTarget::Thing(id) => query_shares(conn, "st.thing_id = ?1", id),
        ShareTarget::List(id) => query_shares(conn, "sl.list_id = ?1", id),
    }
}

/// Remove a share and its join row.
pub(crate) fn delete_share_rows(conn: &Connection, id: &str) -> StoreResult<()> {
    conn.execute("DELETE FROM shares_things WHERE share_id = ?1", params![id])?;
    conn.execute("DELETE FROM shares_lists WHERE share_id = ?1", params![id])?;
    conn.execute("DELETE FROM shares WHERE id = ?1", params![id])?;
    Ok(())
}

impl Store {
    // ==================== Share Operations ====================

    /// Grant `target_user_id` read access to `target`. Only the owner of the
    /// object may share it. Sharing the same object with the same user again
    /// returns the existing share without notifying anyone.
    pub fn create_share(
        &self,
        owner_id: &str,
        target_user_id: &str,
        target: &ShareTarget,
    ) -> StoreResult<Share> {
        self.notifying_transaction(|tx, outbox| {
            Resolver::new(tx).ensure_can_manage(owner_id, target)?;

            if target_user_id == owner_id {
                return Err(StoreError::InvalidArgument(
                    "cannot share an object with its owner".to_string(),
                ));
            }
            if !user_exists(tx, target_user_id)? {
                return Err(StoreError::NotFound(format!("User {}", target_user_id)));
            }

            if let Some(existing) = shares_on(tx, target)?
                .into_iter()
                .find(|s| s.target_user_id == target_user_id)
            {
                return Ok(existing);
            }

            let id = Uuid::new_v4().to_string();
            tx.execute(
                "INSERT INTO shares (id, owner_id, target_user_id, created_at) VALUES (?1, ?2, ?3, ?4)",
                params![&id, owner_id, target_user_id, fmt_datetime(&Utc::now())],
            )?;
            let content = match target {
                ShareTarget::Thing(thing_id) => {
                    tx.execute(
                        "INSERT INTO shares_things (share_id, thing_id) VALUES (?1, ?2)",
                        params![&id, thing_id],
                    )?;
                    NotificationContent::ThingShared {
                        share_id: id.clone(),
                        thing_id: thing_id.clone(),
                        sharer_id: owner_id.to_string(),
                    }
                }
                ShareTarget::List(list_id) => {
                    tx.execute(
                        "INSERT INTO shares_lists (share_id, list_id) VALUES (?1, ?2)",
                        params![&id, list_id],
                    )?;
                    NotificationContent::ListShared {
                        share_id: id.clone(),
                        list_id: list_id.clone(),
                        sharer_id: owner_id.to_string(),
                    }
                }
            };
            outbox.push(tx, target_user_id, Some(owner_id), content)?;

            load_share(tx, &id)
        })
    }

    /// Visible to the owner and the target of the share only.
    pub fn get_share(&self, user_id: &str, id: &str) -> StoreResult<Share> {
        self.read(|conn| {
            let share = load_share(conn, id)?;
            if share.owner_id != user_id && share.target_user_id != user_id {
                return Err(StoreError::NotFound(format!("Share {}", id)));
            }
            Ok(share)
        })
    }

    /// Revoke a share. The former target loses any cart entry that is no
    /// longer visible to them.
    pub fn delete_share(&self, user_id: &str, id: &str) -> StoreResult<()> {
        self.transaction(|tx| {
            let share = load_share(tx, id)?;
            if share.owner_id != user_id {
                if share.target_user_id == user_id {
                    return Err(StoreError::DoesNotBelongToUser(format!("Share {}", id)));
                }
                return Err(StoreError::NotFound(format!("Share {}", id)));
            }
            delete_share_rows(tx, id)?;
            prune_carts(tx, &HashSet::from([share.target_user_id]))?;
            Ok(())
        })
    }

    /// Shares on an object, for its owner.
    pub fn shares_for_target(&self, owner_id: &str, target: &ShareTarget) -> StoreResult<Vec<Share>> {
        self.read(|conn| {
            Resolver::new(conn).ensure_can_manage(owner_id, target)?;
            shares_on(conn, target)
        })
    }

    pub fn shares_received(&self, user_id: &str) -> StoreResult<Vec<Share>> {
        self.read(|conn| query_shares(conn, "s.target_user_id = ?1", user_id))
    }

    pub fn shares_given(&self, user_id: &str) -> StoreResult<Vec<Share>> {
        self.read(|conn| query_shares(conn, "s.owner_id = ?1", user_id))
    }

    pub fn share_exists(&self, id: &str) -> StoreResult<bool> {
        self.read(|conn| {
            Ok(conn
                .query_row("SELECT 1 FROM shares WHERE id = ?1", params![id], |_| Ok(()))
                .optional()?
                .is_some())
        })
    }
}
