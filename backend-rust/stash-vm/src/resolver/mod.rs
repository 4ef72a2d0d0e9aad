//! Sharing resolver.
//!
//! An object owned by A is visible to U when any of these holds:
//! - U is A
//! - a share on the object targets U
//! - the object is a thing in a list U can see
//! - the list's tier is `friends` or wider and U is A's friend
//! - the list's tier is `friends_of_friends` and U shares a friend with A
//!
//! Visibility is a plain OR of these rules. Only ownership grants management
//! rights. `Resolver` works on a borrowed connection so it can run inside a
//! caller's transaction; the `Store` wrappers below never fail and report
//! "not visible" when the store cannot answer.

use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use std::collections::HashSet;

use crate::graph::FriendGraph;
use crate::models::{SharingState, ShareTarget};
use crate::store::{placeholders, Store, StoreError, StoreResult};

pub struct Resolver<'c> {
    conn: &'c Connection,
    graph: FriendGraph<'c>,
}

impl<'c> Resolver<'c> {
    pub fn new(conn: &'c Connection) -> Self {
        Self {
            conn,
            graph: FriendGraph::new(conn),
        }
    }

    pub fn graph(&self) -> &FriendGraph<'c> {
        &self.graph
    }

    /// Lists owned by someone else that `user_id` can see.
    pub fn visible_list_ids(&self, user_id: &str) -> StoreResult<HashSet<String>> {
        let mut ids = self.column_set(
            r#"SELECT sl.list_id FROM shares_lists sl
               JOIN shares s ON s.id = sl.share_id
               WHERE s.target_user_id = ?"#,
            &[user_id.to_string()],
        )?;

        let friends = self.graph.friend_ids(user_id)?;
        if !friends.is_empty() {
            ids.extend(self.lists_of_owners(
                &friends,
                &[SharingState::Friends, SharingState::FriendsOfFriends],
            )?);
        }

        let friends_of_friends = self.graph.friends_of_friends(user_id)?;
        if !friends_of_friends.is_empty() {
            ids.extend(self.lists_of_owners(
                &friends_of_friends,
                &[SharingState::FriendsOfFriends],
            )?);
        }

        Ok(ids)
    }

    /// Things owned by someone else that `user_id` can see.
    pub fn visible_thing_ids(&self, user_id: &str) -> StoreResult<HashSet<String>> {
        let mut ids = self.column_set(
            r#"SELECT st.thing_id FROM shares_things st
               JOIN shares s ON s.id = st.share_id
               WHERE s.target_user_id = ?"#,
            &[user_id.to_string()],
        )?;

        let lists: Vec<String> = self.visible_list_ids(user_id)?.into_iter().collect();
        if !lists.is_empty() {
            let sql = format!(
                "SELECT lt.thing_id FROM lists_things lt
                 JOIN things t ON t.id = lt.thing_id
                 WHERE lt.list_id IN ({}) AND t.owner_id <> ?",
                placeholders(lists.len())
            );
            let mut args = lists;
            args.push(user_id.to_string());
            ids.extend(self.column_set(&sql, &args)?);
        }

        Ok(ids)
    }

    pub fn can_read_list(&self, user_id: &str, list_id: &str) -> StoreResult<bool> {
        let row: Option<(String, String)> = self
            .conn
            .query_row(
                "SELECT owner_id, sharing_state FROM lists WHERE id = ?1",
                params![list_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        let Some((owner_id, state)) = row else {
            return Ok(false);
        };
        if owner_id == user_id {
            return Ok(true);
        }
        if self.has_share(user_id, &ShareTarget::List(list_id.to_string()))? {
            return Ok(true);
        }
        self.tier_grants(&owner_id, parse_state(&state), user_id)
    }

    pub fn can_read_thing(&self, user_id: &str, thing_id: &str) -> StoreResult<bool> {
        let Some(owner_id) = self.owner_of(&ShareTarget::Thing(thing_id.to_string()))? else {
            return Ok(false);
        };
        if owner_id == user_id {
            return Ok(true);
        }
        if self.has_share(user_id, &ShareTarget::Thing(thing_id.to_string()))? {
            return Ok(true);
        }

        let mut stmt = self
            .conn
            .prepare_cached("SELECT list_id FROM lists_things WHERE thing_id = ?1")?;
        let lists = stmt
            .query_map(params![thing_id], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        for list_id in lists {
            if self.can_read_list(user_id, &list_id)? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    pub fn can_read(&self, user_id: &str, target: &ShareTarget) -> StoreResult<bool> {
        match target {
            ShareTarget::Thing(id) => self.can_read_thing(user_id, id),
            ShareTarget::List(id) => self.can_read_list(user_id, id),
        }
    }

    pub fn can_manage(&self, user_id: &str, target: &ShareTarget) -> StoreResult<bool> {
        Ok(self.owner_of(target)?.as_deref() == Some(user_id))
    }

    /// Require management rights on `target`. Fails with `NotFound` when the
    /// object is missing or invisible, `NoAccessRights` when visible but not owned.
    pub fn ensure_can_manage(&self, user_id: &str, target: &ShareTarget) -> StoreResult<()> {
        let what = format!("{} {}", target.kind(), target.id());
        match self.owner_of(target)? {
            None => Err(StoreError::NotFound(what)),
            Some(owner) if owner == user_id => Ok(()),
            Some(_) if self.can_read(user_id, target)? => Err(StoreError::NoAccessRights(what)),
            Some(_) => Err(StoreError::NotFound(what)),
        }
    }

    pub fn owner_of(&self, target: &ShareTarget) -> StoreResult<Option<String>> {
        let sql = match target {
            ShareTarget::Thing(_) => "SELECT owner_id FROM things WHERE id = ?1",
            ShareTarget::List(_) => "SELECT owner_id FROM lists WHERE id = ?1",
        };
        Ok(self
            .conn
            .query_row(sql, params![target.id()], |row| row.get(0))
            .optional()?)
    }

    /// Every user other than the owner who can currently read the list.
    pub fn list_audience(&self, list_id: &str) -> StoreResult<HashSet<String>> {
        let row: Option<(String, String)> = self
            .conn
            .query_row(
                "SELECT owner_id, sharing_state FROM lists WHERE id = ?1",
                params![list_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        let Some((owner_id, state)) = row else {
            return Ok(HashSet::new());
        };

        let mut audience = self.column_set(
            r#"SELECT s.target_user_id FROM shares s
               JOIN shares_lists sl ON sl.share_id = s.id
               WHERE sl.list_id = ?"#,
            &[list_id.to_string()],
        )?;
        let state = parse_state(&state);
        if state >= SharingState::Friends {
            audience.extend(self.graph.friend_ids(&owner_id)?);
        }
        if state >= SharingState::FriendsOfFriends {
            audience.extend(self.graph.friends_of_friends(&owner_id)?);
        }
        audience.remove(&owner_id);
        Ok(audience)
    }

    fn has_share(&self, user_id: &str, target: &ShareTarget) -> StoreResult<bool> {
        let sql = match target {
            ShareTarget::Thing(_) => {
                r#"SELECT 1 FROM shares s JOIN shares_things st ON st.share_id = s.id
                   WHERE s.target_user_id = ?1 AND st.thing_id = ?2 LIMIT 1"#
            }
            ShareTarget::List(_) => {
                r#"SELECT 1 FROM shares s JOIN shares_lists sl ON sl.share_id = s.id
                   WHERE s.target_user_id = ?1 AND sl.list_id = ?2 LIMIT 1"#
            }
        };
        Ok(self
            .conn
            .query_row(sql, params![user_id, target.id()], |_| Ok(()))
            .optional()?
            .is_some())
    }

    fn tier_grants(&self, owner_id: &str, state: SharingState, user_id: &str) -> StoreResult<bool> {
        match state {
            SharingState::Private => Ok(false),
            SharingState::Friends => self.graph.are_friends(owner_id, user_id),
            SharingState::FriendsOfFriends => Ok(self.graph.are_friends(owner_id, user_id)?
                || self.graph.have_common_friend(owner_id, user_id)?),
        }
    }

    /// Lists owned by any of `owners` whose tier is one of `states`.
    fn lists_of_owners(
        &self,
        owners: &HashSet<String>,
        states: &[SharingState],
    ) -> StoreResult<HashSet<String>> {
        let sql = format!(
            "SELECT id FROM lists WHERE owner_id IN ({}) AND sharing_state IN ({})",
            placeholders(owners.len()),
            placeholders(states.len())
        );
        let args: Vec<String> = owners
            .iter()
            .cloned()
            .chain(states.iter().map(|s| s.as_str().to_string()))
            .collect();
        self.column_set(&sql, &args)
    }

    fn column_set(&self, sql: &str, args: &[String]) -> StoreResult<HashSet<String>> {
        let mut stmt = self.conn.prepare(sql)?;
        let ids = stmt
            .query_map(params_from_iter(args.iter()), |row| row.get(0))?
            .collect::<Result<HashSet<String>, _>>()?;
        Ok(ids)
    }
}

/// Unknown values read as private, the narrowest tier.
fn parse_state(state: &str) -> SharingState {
    state.parse().unwrap_or_else(|e| {
        log::warn!("{}; treating list as private", e);
        SharingState::Private
    })
}

impl Store {
    // ==================== Visibility Queries ====================

    pub fn visible_thing_ids(&self, user_id: &str) -> HashSet<String> {
        self.read(|conn| Resolver::new(conn).visible_thing_ids(user_id))
            .unwrap_or_else(|e| {
                log::error!("Failed to resolve visible things for {}: {}", user_id, e);
                HashSet::new()
            })
    }

    pub fn visible_list_ids(&self, user_id: &str) -> HashSet<String> {
        self.read(|conn| Resolver::new(conn).visible_list_ids(user_id))
            .unwrap_or_else(|e| {
                log::error!("Failed to resolve visible lists for {}: {}", user_id, e);
                HashSet::new()
            })
    }

    pub fn can_read(&self, user_id: &str, target: &ShareTarget) -> bool {
        self.read(|conn| Resolver::new(conn).can_read(user_id, target))
            .unwrap_or_else(|e| {
                log::error!("Failed to check read access of {} to {:?}: {}", user_id, target, e);
                false
            })
    }

    pub fn can_manage(&self, user_id: &str, target: &ShareTarget) -> bool {
        self.read(|conn| Resolver::new(conn).can_manage(user_id, target))
            .unwrap_or_else(|e| {
                log::error!("Failed to check ownership of {:?} for {}: {}", target, user_id, e);
                false
            })
    }

    pub fn are_friends(&self, a: &str, b: &str) -> bool {
        self.read(|conn| FriendGraph::new(conn).are_friends(a, b))
            .unwrap_or_else(|e| {
                log::error!("Failed to check friendship of {} and {}: {}", a, b, e);
                false
            })
    }

    pub fn friend_ids(&self, user_id: &str) -> HashSet<String> {
        self.read(|conn| FriendGraph::new(conn).friend_ids(user_id))
            .unwrap_or_else(|e| {
                log::error!("Failed to load friends of {}: {}", user_id, e);
                HashSet::new()
            })
    }

    pub fn friends_of_friends(&self, user_id: &str) -> HashSet<String> {
        self.read(|conn| FriendGraph::new(conn).friends_of_friends(user_id))
            .unwrap_or_else(|e| {
                log::error!("Failed to load friends of friends of {}: {}", user_id, e);
                HashSet::new()
            })
    }
}
