use chrono::Utc;
use rusqlite::{params, Connection};
use std::collections::HashSet;

use super::{fmt_datetime, parse_datetime, Store, StoreError, StoreResult};
use crate::models::{CartEntry, ShareTarget};
use crate::resolver::Resolver;

fn load_cart(conn: &Connection, user_id: &str) -> StoreResult<Vec<CartEntry>> {
    let mut stmt = conn.prepare_cached(
        "SELECT * FROM cart_entries WHERE user_id = ?1 ORDER BY created_at, thing_id",
    )?;
    let entries = stmt
        .query_map(params![user_id], |row| {
            Ok(CartEntry {
                user_id: row.get("user_id")?,
                thing_id: row.get("thing_id")?,
                created_at: parse_datetime(row.get("created_at")?),
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;
    Ok(entries)
}

/// Delete cart entries of `users` whose thing they can no longer read.
/// Returns how many entries were removed.
pub(crate) fn prune_carts<'a>(
    conn: &Connection,
    users: impl IntoIterator<Item = &'a String>,
) -> StoreResult<usize> {
    let resolver = Resolver::new(conn);
    let mut removed = 0;

    for user_id in users {
        let entries = load_cart(conn, user_id)?;
        if entries.is_empty() {
            continue;
        }
        let visible = resolver.visible_thing_ids(user_id)?;
        for entry in entries {
            if visible.contains(&entry.thing_id) {
                continue;
            }
            removed += conn.execute(
                "DELETE FROM cart_entries WHERE user_id = ?1 AND thing_id = ?2",
                params![user_id, &entry.thing_id],
            )?;
            log::debug!("Removed {} from the cart of {}", entry.thing_id, user_id);
        }
    }
    Ok(removed)
}

impl Store {
    // ==================== Cart Operations ====================

    pub fn cart(&self, user_id: &str) -> StoreResult<Vec<CartEntry>> {
        self.read(|conn| load_cart(conn, user_id))
    }

    /// Replace the user's cart with `thing_ids`. Every thing must be readable
    /// by the user and owned by someone else.
    pub fn update_cart(&self, user_id: &str, thing_ids: &[String]) -> StoreResult<Vec<CartEntry>> {
        self.transaction(|tx| {
            let resolver = Resolver::new(tx);
            let mut unique = HashSet::new();
            for thing_id in thing_ids {
                if !unique.insert(thing_id) {
                    continue;
                }
                if !resolver.can_read_thing(user_id, thing_id)? {
                    return Err(StoreError::NotFound(format!("Thing {}", thing_id)));
                }
                if resolver.can_manage(user_id, &ShareTarget::Thing(thing_id.clone()))? {
                    return Err(StoreError::InvalidArgument(format!(
                        "Thing {} is your own and cannot be put in your cart",
                        thing_id
                    )));
                }
            }

            tx.execute("DELETE FROM cart_entries WHERE user_id = ?1", params![user_id])?;
            let now = fmt_datetime(&Utc::now());
            for thing_id in unique {
                tx.execute(
                    "INSERT INTO cart_entries (user_id, thing_id, created_at) VALUES (?1, ?2, ?3)",
                    params![user_id, thing_id, &now],
                )?;
            }
            load_cart(tx, user_id)
        })
    }
}
