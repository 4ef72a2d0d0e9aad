//! Account purge: the cascading delete of a user and everything that
//! depends on them, plus the background worker that runs it on schedule.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use std::collections::HashSet;

use crate::graph::FriendGraph;
use crate::store::cart::prune_carts;
use crate::store::users::load_user;
use crate::store::{Store, StoreError, StoreResult};

mod worker;

pub use worker::{PurgeWorker, PurgeWorkerHandle};

/// What a committed purge left for follow-up outside the transaction.
#[derive(Debug, Clone, Default)]
pub struct PurgeOutcome {
    pub user_id: String,
    /// Content hashes of the user's deleted images. The blobs are removed
    /// unless another image still uses them.
    pub released_content: Vec<String>,
    /// Cart entries of other users removed because their visibility went
    /// through the purged user.
    pub pruned_cart_entries: usize,
}

/// Result of one pass over all due users.
#[derive(Debug, Clone, Default)]
pub struct PurgeReport {
    pub purged: Vec<String>,
    pub failed: Vec<(String, String)>,
}

// Deletion steps, children before parents. Every statement takes the user id as ?1.
const CASCADE: &[(&str, &str)] = &[
    // 1. Carts: other users' entries on the user's things, then the user's own cart
    (
        "cart entries on owned things",
        "DELETE FROM cart_entries WHERE thing_id IN (SELECT id FROM things WHERE owner_id = ?1)",
    ),
    ("own cart entries", "DELETE FROM cart_entries WHERE user_id = ?1"),
    // 2. Shares made by or granted to the user, or pointing at the user's objects
    (
        "share thing links",
        r#"DELETE FROM shares_things WHERE share_id IN (
               SELECT id FROM shares WHERE owner_id = ?1 OR target_user_id = ?1)
           OR thing_id IN (SELECT id FROM things WHERE owner_id = ?1)"#,
    ),
    (
        "share list links",
        r#"DELETE FROM shares_lists WHERE share_id IN (
               SELECT id FROM shares WHERE owner_id = ?1 OR target_user_id = ?1)
           OR list_id IN (SELECT id FROM lists WHERE owner_id = ?1)"#,
    ),
    (
        "shares",
        r#"DELETE FROM shares WHERE owner_id = ?1 OR target_user_id = ?1
           OR (id NOT IN (SELECT share_id FROM shares_things)
               AND id NOT IN (SELECT share_id FROM shares_lists))"#,
    ),
    // 3. Friendships reference their request, so they go first
    (
        "friendships",
        "DELETE FROM friendships WHERE friend1_id = ?1 OR friend2_id = ?1",
    ),
    (
        "friend requests",
        "DELETE FROM friend_requests WHERE sender_id = ?1 OR receiver_id = ?1",
    ),
    // 4. Notifications to the user or caused by the user
    (
        "notifications",
        "DELETE FROM notifications WHERE recipient_id = ?1 OR actor_id = ?1",
    ),
    // 5. Things and their dependents
    (
        "properties",
        "DELETE FROM properties WHERE thing_id IN (SELECT id FROM things WHERE owner_id = ?1)",
    ),
    (
        "quantity entries",
        "DELETE FROM quantity_entries WHERE thing_id IN (SELECT id FROM things WHERE owner_id = ?1)",
    ),
    (
        "thing images",
        "DELETE FROM images_things WHERE thing_id IN (SELECT id FROM things WHERE owner_id = ?1)",
    ),
    (
        "thing list memberships",
        "DELETE FROM lists_things WHERE thing_id IN (SELECT id FROM things WHERE owner_id = ?1)",
    ),
    ("things", "DELETE FROM things WHERE owner_id = ?1"),
    // 6. Lists
    (
        "list memberships",
        "DELETE FROM lists_things WHERE list_id IN (SELECT id FROM lists WHERE owner_id = ?1)",
    ),
    ("lists", "DELETE FROM lists WHERE owner_id = ?1"),
    // 7. Images, after detaching them from any profile and thing
    (
        "profile images",
        "UPDATE profiles SET image_id = NULL WHERE image_id IN (SELECT id FROM images WHERE owner_id = ?1)",
    ),
    (
        "image thing links",
        "DELETE FROM images_things WHERE image_id IN (SELECT id FROM images WHERE owner_id = ?1)",
    ),
    ("images", "DELETE FROM images WHERE owner_id = ?1"),
    // 8. Profile and the user row
    ("profile", "DELETE FROM profiles WHERE user_id = ?1"),
    ("user", "DELETE FROM users WHERE id = ?1"),
];

/// Delete `user_id` and everything that depends on it, inside the caller's
/// transaction. Fails with `NotFound`, without touching anything, when the
/// user does not exist.
pub fn cascade_delete(conn: &Connection, user_id: &str) -> StoreResult<PurgeOutcome> {
    load_user(conn, user_id)?;

    // Users who may see things only through one of this user's friendships
    let graph = FriendGraph::new(conn);
    let mut dependents: HashSet<String> = graph.friend_ids(user_id)?;
    dependents.extend(graph.friends_of_friends(user_id)?);

    let released_content: Vec<String> = {
        let mut stmt = conn.prepare("SELECT DISTINCT hash FROM images WHERE owner_id = ?1")?;
        let hashes = stmt
            .query_map(params![user_id], |row| row.get(0))?
            .collect::<Result<Vec<_>, _>>()?;
        hashes
    };

    for (step, sql) in CASCADE {
        let rows = conn.execute(sql, params![user_id])?;
        if rows > 0 {
            log::debug!("Purge of {}: removed {} {}", user_id, rows, step);
        }
    }

    dependents.remove(user_id);
    let pruned_cart_entries = prune_carts(conn, &dependents)?;

    Ok(PurgeOutcome {
        user_id: user_id.to_string(),
        released_content,
        pruned_cart_entries,
    })
}

impl Store {
    // ==================== Purge Operations ====================

    /// Purge one user in its own transaction, then drop content blobs nobody
    /// references any more. Blobs still in use are kept silently.
    pub fn purge_user(&self, user_id: &str) -> StoreResult<PurgeOutcome> {
        let outcome = self.transaction(|tx| cascade_delete(tx, user_id))?;

        for hash in &outcome.released_content {
            match self.delete_content(hash) {
                Ok(()) => {}
                Err(StoreError::EntityInUse(_)) => {
                    log::debug!("Keeping content {}: still used by another image", hash);
                }
                Err(e) => {
                    log::warn!("Failed to delete content {} of purged user {}: {}", hash, user_id, e);
                }
            }
        }
        Ok(outcome)
    }

    /// Purge every user due at `now`. A failure is logged and skipped; the
    /// user stays scheduled and is retried on the next pass.
    pub fn purge_due_users(&self, now: DateTime<Utc>) -> StoreResult<PurgeReport> {
        let mut report = PurgeReport::default();
        for user_id in self.users_due_for_purge(now)? {
            match self.purge_user(&user_id) {
                Ok(outcome) => {
                    log::info!(
                        "Purged user {} ({} cart entries of other users pruned)",
                        user_id,
                        outcome.pruned_cart_entries
                    );
                    report.purged.push(user_id);
                }
                Err(e) => {
                    log::error!("Failed to purge user {}: {}", user_id, e);
                    report.failed.push((user_id, e.to_string()));
                }
            }
        }
        Ok(report)
    }
}
