//! Friend graph: the symmetric friendship relation between users.
//!
//! Friendships are stored once per unordered pair with `friend1_id < friend2_id`.

use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashSet;

use crate::models::Friendship;
use crate::store::{parse_datetime, StoreResult};

/// Order a pair the way it is stored.
pub fn normalize_pair<'a>(a: &'a str, b: &'a str) -> (&'a str, &'a str) {
    if a <= b {
        (a, b)
    } else {
        (b, a)
    }
}

pub struct FriendGraph<'c> {
    conn: &'c Connection,
}

impl<'c> FriendGraph<'c> {
    pub fn new(conn: &'c Connection) -> Self {
        Self { conn }
    }

    pub fn friendship(&self, a: &str, b: &str) -> StoreResult<Option<Friendship>> {
        let (first, second) = normalize_pair(a, b);
        Ok(self
            .conn
            .query_row(
                "SELECT * FROM friendships WHERE friend1_id = ?1 AND friend2_id = ?2",
                params![first, second],
                |row| {
                    Ok(Friendship {
                        friend1_id: row.get("friend1_id")?,
                        friend2_id: row.get("friend2_id")?,
                        friend_request_id: row.get("friend_request_id")?,
                        created_at: parse_datetime(row.get("created_at")?),
                    })
                },
            )
            .optional()?)
    }

    pub fn are_friends(&self, a: &str, b: &str) -> StoreResult<bool> {
        if a == b {
            return Ok(false);
        }
        Ok(self.friendship(a, b)?.is_some())
    }

    pub fn friend_ids(&self, user_id: &str) -> StoreResult<HashSet<String>> {
        let mut stmt = self.conn.prepare_cached(
            r#"SELECT CASE WHEN friend1_id = ?1 THEN friend2_id ELSE friend1_id END
               FROM friendships WHERE friend1_id = ?1 OR friend2_id = ?1"#,
        )?;
        let ids = stmt
            .query_map(params![user_id], |row| row.get(0))?
            .collect::<Result<HashSet<String>, _>>()?;
        Ok(ids)
    }

    /// Union of the friends of every friend of `user_id`, minus the user and
    /// their direct friends.
    pub fn friends_of_friends(&self, user_id: &str) -> StoreResult<HashSet<String>> {
        let friends = self.friend_ids(user_id)?;
        let mut result = HashSet::new();
        for friend in &friends {
            result.extend(self.friend_ids(friend)?);
        }
        result.remove(user_id);
        result.retain(|id| !friends.contains(id));
        Ok(result)
    }

    /// Whether `a` and `b` share at least one friend.
    pub fn have_common_friend(&self, a: &str, b: &str) -> StoreResult<bool> {
        if a == b {
            return Ok(false);
        }
        let of_a = self.friend_ids(a)?;
        if of_a.is_empty() {
            return Ok(false);
        }
        let of_b = self.friend_ids(b)?;
        Ok(!of_a.is_disjoint(&of_b))
    }
}
