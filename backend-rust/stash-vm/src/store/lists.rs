use chrono::Utc;
use rusqlite::{params, Connection};
use std::collections::HashSet;
use uuid::Uuid;

use super::cart::prune_carts;
use super::things::load_thing;
use super::{fmt_datetime, not_found, parse_datetime, Outbox, Store, StoreError, StoreResult};
use crate::models::*;
use crate::resolver::Resolver;

fn row_to_list(row: &rusqlite::Row) -> rusqlite::Result<List> {
    let state: String = row.get("sharing_state")?;
    Ok(List {
        id: row.get("id")?,
        owner_id: row.get("owner_id")?,
        name: row.get("name")?,
        sharing_state: state.parse().unwrap_or_default(),
        thing_ids: Vec::new(),
        created_at: parse_datetime(row.get("created_at")?),
        updated_at: parse_datetime(row.get("updated_at")?),
    })
}

pub(crate) fn load_list(conn: &Connection, id: &str) -> StoreResult<List> {
    let mut list = conn
        .query_row("SELECT * FROM lists WHERE id = ?1", params![id], row_to_list)
        .map_err(not_found(format!("List {}", id)))?;
    list.thing_ids = list_thing_ids(conn, id)?;
    Ok(list)
}

fn list_thing_ids(conn: &Connection, list_id: &str) -> StoreResult<Vec<String>> {
    let mut stmt = conn.prepare_cached(
        "SELECT thing_id FROM lists_things WHERE list_id = ?1 ORDER BY rowid",
    )?;
    let ids = stmt
        .query_map(params![list_id], |row| row.get(0))?
        .collect::<Result<Vec<String>, _>>()?;
    Ok(ids)
}

/// Owned lists plus every foreign list the viewer can see.
pub(crate) fn readable_list_ids(conn: &Connection, viewer_id: &str) -> StoreResult<HashSet<String>> {
    let mut ids: HashSet<String> = owned_list_ids(conn, viewer_id)?.into_iter().collect();
    ids.extend(Resolver::new(conn).visible_list_ids(viewer_id)?);
    Ok(ids)
}

pub(crate) fn owned_list_ids(conn: &Connection, owner_id: &str) -> StoreResult<Vec<String>> {
    let mut stmt = conn.prepare_cached("SELECT id FROM lists WHERE owner_id = ?1")?;
    let ids = stmt
        .query_map(params![owner_id], |row| row.get(0))?
        .collect::<Result<Vec<String>, _>>()?;
    Ok(ids)
}

/// Lists may only hold things of their owner. Duplicates are dropped, order is kept.
fn validate_things(conn: &Connection, owner_id: &str, thing_ids: &[String]) -> StoreResult<Vec<String>> {
    let mut seen = HashSet::new();
    let mut result = Vec::new();
    for thing_id in thing_ids {
        if !seen.insert(thing_id.as_str()) {
            continue;
        }
        let owner: String = conn
            .query_row(
                "SELECT owner_id FROM things WHERE id = ?1",
                params![thing_id],
                |row| row.get(0),
            )
            .map_err(not_found(format!("Thing {}", thing_id)))?;
        if owner != owner_id {
            return Err(StoreError::DoesNotBelongToUser(format!("Thing {}", thing_id)));
        }
        result.push(thing_id.clone());
    }
    Ok(result)
}

fn with_things(conn: &Connection, list: List, viewer_id: &str) -> StoreResult<ListWithThings> {
    let things = list
        .thing_ids
        .iter()
        .map(|id| load_thing(conn, id).map(|t| t.redacted_for(viewer_id)))
        .collect::<StoreResult<Vec<_>>>()?;
    Ok(ListWithThings { list, things })
}

/// Notify each user in `recipients` that the list became visible to them.
fn notify_newly_visible(
    conn: &Connection,
    outbox: &mut Outbox,
    list: &List,
    recipients: impl IntoIterator<Item = String>,
) -> StoreResult<()> {
    for recipient in recipients {
        outbox.push(
            conn,
            &recipient,
            Some(&list.owner_id),
            NotificationContent::ListSharingChanged {
                list_id: list.id.clone(),
                owner_id: list.owner_id.clone(),
                sharing_state: list.sharing_state,
            },
        )?;
    }
    Ok(())
}

impl Store {
    // ==================== List Operations ====================

    pub fn create_list(&self, owner_id: &str, req: &CreateListRequest) -> StoreResult<ListWithThings> {
        if req.name.trim().is_empty() {
            return Err(StoreError::InvalidArgument("name must not be empty".to_string()));
        }
        let id = Uuid::new_v4().to_string();
        let now = fmt_datetime(&Utc::now());

        self.notifying_transaction(|tx, outbox| {
            let thing_ids = validate_things(tx, owner_id, &req.thing_ids)?;
            tx.execute(
                r#"INSERT INTO lists (id, owner_id, name, sharing_state, created_at, updated_at)
                   VALUES (?1, ?2, ?3, ?4, ?5, ?6)"#,
                params![&id, owner_id, &req.name, req.sharing_state.as_str(), &now, &now],
            )?;
            for thing_id in &thing_ids {
                tx.execute(
                    "INSERT INTO lists_things (list_id, thing_id) VALUES (?1, ?2)",
                    params![&id, thing_id],
                )?;
            }

            let list = load_list(tx, &id)?;
            let audience = Resolver::new(tx).list_audience(&id)?;
            notify_newly_visible(tx, outbox, &list, audience)?;
            with_things(tx, list, owner_id)
        })
    }

    /// The list and its things as `viewer_id` may see them; `NotFound` when not readable.
    pub fn get_list_for(&self, viewer_id: &str, id: &str) -> StoreResult<ListWithThings> {
        self.read(|conn| {
            if !Resolver::new(conn).can_read_list(viewer_id, id)? {
                return Err(StoreError::NotFound(format!("List {}", id)));
            }
            let list = load_list(conn, id)?;
            with_things(conn, list, viewer_id)
        })
    }

    /// Rename, change the tier, and/or replace the things of a list.
    ///
    /// Users who can read the list only after the update get one
    /// `ListSharingChanged`; users who could read it before get one
    /// `ThingsAddedToList` when things were added. Users who may have lost
    /// access have their carts pruned.
    pub fn update_list(
        &self,
        user_id: &str,
        id: &str,
        req: &UpdateListRequest,
    ) -> StoreResult<ListWithThings> {
        self.notifying_transaction(|tx, outbox| {
            let resolver = Resolver::new(tx);
            resolver.ensure_can_manage(user_id, &ShareTarget::List(id.to_string()))?;

            let before = load_list(tx, id)?;
            let audience_before = resolver.list_audience(id)?;

            if let Some(name) = &req.name {
                if name.trim().is_empty() {
                    return Err(StoreError::InvalidArgument("name must not be empty".to_string()));
                }
            }
            let sharing_state = req.sharing_state.unwrap_or(before.sharing_state);
            tx.execute(
                "UPDATE lists SET name = ?1, sharing_state = ?2, updated_at = ?3 WHERE id = ?4",
                params![
                    req.name.as_ref().unwrap_or(&before.name),
                    sharing_state.as_str(),
                    fmt_datetime(&Utc::now()),
                    id,
                ],
            )?;

            let mut added = Vec::new();
            let mut removed = false;
            if let Some(thing_ids) = &req.thing_ids {
                let thing_ids = validate_things(tx, user_id, thing_ids)?;
                let old: HashSet<&String> = before.thing_ids.iter().collect();
                let new: HashSet<&String> = thing_ids.iter().collect();
                added = thing_ids.iter().filter(|t| !old.contains(t)).cloned().collect();
                removed = before.thing_ids.iter().any(|t| !new.contains(t));

                tx.execute("DELETE FROM lists_things WHERE list_id = ?1", params![id])?;
                for thing_id in &thing_ids {
                    tx.execute(
                        "INSERT INTO lists_things (list_id, thing_id) VALUES (?1, ?2)",
                        params![id, thing_id],
                    )?;
                }
            }

            let list = load_list(tx, id)?;
            let audience_after = resolver.list_audience(id)?;

            let newly_visible: Vec<String> = audience_after
                .difference(&audience_before)
                .cloned()
                .collect();
            notify_newly_visible(tx, outbox, &list, newly_visible)?;

            if !added.is_empty() {
                for recipient in audience_after.intersection(&audience_before) {
                    outbox.push(
                        tx,
                        recipient,
                        Some(user_id),
                        NotificationContent::ThingsAddedToList {
                            list_id: id.to_string(),
                            thing_ids: added.clone(),
                            sharer_id: user_id.to_string(),
                        },
                    )?;
                }
            }

            if removed || sharing_state < before.sharing_state {
                prune_carts(tx, &audience_before)?;
            }

            with_things(tx, list, user_id)
        })
    }

    /// Delete a list and the shares on it. The things themselves stay.
    pub fn delete_list(&self, user_id: &str, id: &str) -> StoreResult<()> {
        self.transaction(|tx| {
            let resolver = Resolver::new(tx);
            resolver.ensure_can_manage(user_id, &ShareTarget::List(id.to_string()))?;
            let audience = resolver.list_audience(id)?;
            delete_list_rows(tx, id)?;
            prune_carts(tx, &audience)?;
            Ok(())
        })
    }

    /// Owned lists plus every list visible to `viewer_id`, sorted by name.
    pub fn visible_lists(&self, viewer_id: &str) -> StoreResult<Vec<List>> {
        self.read(|conn| {
            let mut lists = readable_list_ids(conn, viewer_id)?
                .iter()
                .map(|id| load_list(conn, id))
                .collect::<StoreResult<Vec<_>>>()?;
            lists.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.id.cmp(&b.id)));
            Ok(lists)
        })
    }
}

/// Remove a list, its memberships and the shares on it, children first.
pub(crate) fn delete_list_rows(conn: &Connection, id: &str) -> StoreResult<()> {
    let share_ids: Vec<String> = {
        let mut stmt = conn.prepare("SELECT share_id FROM shares_lists WHERE list_id = ?1")?;
        let ids = stmt
            .query_map(params![id], |row| row.get(0))?
            .collect::<Result<Vec<_>, _>>()?;
        ids
    };
    conn.execute("DELETE FROM shares_lists WHERE list_id = ?1", params![id])?;
    for share_id in &share_ids {
        conn.execute("DELETE FROM shares WHERE id = ?1", params![share_id])?;
    }
    conn.execute("DELETE FROM lists_things WHERE list_id = ?1", params![id])?;
    let rows = conn.execute("DELETE FROM lists WHERE id = ?1", params![id])?;
    if rows == 0 {
        return Err(StoreError::NotFound(format!("List {}", id)));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_user(store: &Store, name: &str) -> User {
        let mut user = User {
            id: String::new(),
            name: name.to_string(),
            email: format!("{}@example.com", name),
            password_hash: "hash".to_string(),
            is_admin: false,
            purge_at: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        };
        store.create_user(&mut user).unwrap();
        user
    }

    fn thing(store: &Store, owner: &User, name: &str) -> Thing {
        store
            .create_thing(
                &owner.id,
                &CreateThingRequest {
                    name: name.to_string(),
                    description: String::new(),
                    private_note: "note".to_string(),
                    quantity: 1,
                    quantity_unit: String::new(),
                    properties: Vec::new(),
                    image_ids: Vec::new(),
                },
            )
            .unwrap()
    }

    #[test]
    fn test_create_list_with_things() {
        let store = Store::in_memory().unwrap();
        let alice = create_user(&store, "alice");
        let hammer = thing(&store, &alice, "Hammer");
        let saw = thing(&store, &alice, "Saw");

        let list = store
            .create_list(
                &alice.id,
                &CreateListRequest {
                    name: "Tools".to_string(),
                    sharing_state: SharingState::Private,
                    thing_ids: vec![saw.id.clone(), hammer.id.clone(), saw.id.clone()],
                },
            )
            .unwrap();

        assert_eq!(list.list.thing_ids, vec![saw.id.clone(), hammer.id.clone()]);
        assert_eq!(list.things.len(), 2);
        assert_eq!(list.things[0].name, "Saw");
    }

    #[test]
    fn test_list_rejects_foreign_things() {
        let store = Store::in_memory().unwrap();
        let alice = create_user(&store, "alice");
        let bob = create_user(&store, "bob");
        let bobs = thing(&store, &bob, "Bike");

        let err = store
            .create_list(
                &alice.id,
                &CreateListRequest {
                    name: "Mine".to_string(),
                    sharing_state: SharingState::Private,
                    thing_ids: vec![bobs.id.clone()],
                },
            )
            .unwrap_err();
        assert!(matches!(err, StoreError::DoesNotBelongToUser(_)));
    }

    #[test]
    fn test_update_and_delete_list() {
        let store = Store::in_memory().unwrap();
        let alice = create_user(&store, "alice");
        let hammer = thing(&store, &alice, "Hammer");

        let list = store
            .create_list(
                &alice.id,
                &CreateListRequest {
                    name: "Tools".to_string(),
                    sharing_state: SharingState::Private,
                    thing_ids: Vec::new(),
                },
            )
            .unwrap();

        let updated = store
            .update_list(
                &alice.id,
                &list.list.id,
                &UpdateListRequest {
                    name: Some("Workshop".to_string()),
                    sharing_state: Some(SharingState::Friends),
                    thing_ids: Some(vec![hammer.id.clone()]),
                },
            )
            .unwrap();
        assert_eq!(updated.list.name, "Workshop");
        assert_eq!(updated.list.sharing_state, SharingState::Friends);
        assert_eq!(updated.list.thing_ids, vec![hammer.id.clone()]);

        store.delete_list(&alice.id, &list.list.id).unwrap();
        assert!(store.visible_lists(&alice.id).unwrap().is_empty());
        // The thing survives its list
        assert!(store.get_thing_for(&alice.id, &hammer.id).is_ok());
    }
}
