use chrono::Utc;
use rusqlite::{params, Connection};
use std::collections::HashSet;
use uuid::Uuid;

use super::{fmt_datetime, not_found, parse_datetime, Store, StoreError, StoreResult};
use crate::models::*;
use crate::resolver::Resolver;

// Columns of `things` plus the ledger sum as `quantity`.
const THING_SELECT: &str = r#"SELECT t.*, COALESCE((SELECT SUM(q.delta) FROM quantity_entries q
                                WHERE q.thing_id = t.id), 0) AS quantity
                              FROM things t"#;

fn row_to_thing(row: &rusqlite::Row) -> rusqlite::Result<Thing> {
    Ok(Thing {
        id: row.get("id")?,
        owner_id: row.get("owner_id")?,
        name: row.get("name")?,
        description: row.get("description")?,
        private_note: Some(row.get("private_note")?),
        quantity: row.get("quantity")?,
        quantity_unit: row.get("quantity_unit")?,
        properties: Vec::new(),
        image_ids: Vec::new(),
        created_at: parse_datetime(row.get("created_at")?),
        updated_at: parse_datetime(row.get("updated_at")?),
    })
}

fn row_to_property(row: &rusqlite::Row) -> rusqlite::Result<Property> {
    let kind: String = row.get("type")?;
    let value = match kind.as_str() {
        "float" => PropertyValue::Float {
            value: row.get::<_, Option<f64>>("value_float")?.unwrap_or_default(),
            unit: row.get::<_, Option<String>>("unit")?.unwrap_or_default(),
        },
        "datetime" => PropertyValue::Datetime {
            value: parse_datetime(row.get::<_, Option<String>>("value_datetime")?.unwrap_or_default()),
        },
        _ => PropertyValue::String {
            value: row.get::<_, Option<String>>("value_string")?.unwrap_or_default(),
        },
    };
    Ok(Property {
        name: row.get("name")?,
        value,
    })
}

/// Load a thing with its properties, image ids and current quantity.
/// The private note is included; callers redact it for non-owners.
pub(crate) fn load_thing(conn: &Connection, id: &str) -> StoreResult<Thing> {
    let mut thing = conn
        .query_row(
            &format!("{} WHERE t.id = ?1", THING_SELECT),
            params![id],
            row_to_thing,
        )
        .map_err(not_found(format!("Thing {}", id)))?;

    let mut stmt = conn.prepare_cached(
        "SELECT * FROM properties WHERE thing_id = ?1 ORDER BY position",
    )?;
    thing.properties = stmt
        .query_map(params![id], row_to_property)?
        .collect::<Result<Vec<_>, _>>()?;

    let mut stmt = conn.prepare_cached(
        "SELECT image_id FROM images_things WHERE thing_id = ?1 ORDER BY image_id",
    )?;
    thing.image_ids = stmt
        .query_map(params![id], |row| row.get(0))?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(thing)
}

pub(crate) fn owned_thing_ids(conn: &Connection, owner_id: &str) -> StoreResult<Vec<String>> {
    let mut stmt = conn.prepare_cached("SELECT id FROM things WHERE owner_id = ?1")?;
    let ids = stmt
        .query_map(params![owner_id], |row| row.get(0))?
        .collect::<Result<Vec<String>, _>>()?;
    Ok(ids)
}

/// Owned things plus every foreign thing the viewer can see.
pub(crate) fn readable_thing_ids(conn: &Connection, viewer_id: &str) -> StoreResult<HashSet<String>> {
    let mut ids: HashSet<String> = owned_thing_ids(conn, viewer_id)?.into_iter().collect();
    ids.extend(Resolver::new(conn).visible_thing_ids(viewer_id)?);
    Ok(ids)
}

pub(crate) fn quantity_of(conn: &Connection, thing_id: &str) -> StoreResult<i64> {
    Ok(conn.query_row(
        "SELECT COALESCE(SUM(delta), 0) FROM quantity_entries WHERE thing_id = ?1",
        params![thing_id],
        |row| row.get(0),
    )?)
}

fn append_quantity(conn: &Connection, thing_id: &str, delta: i64) -> StoreResult<()> {
    conn.execute(
        "INSERT INTO quantity_entries (id, thing_id, delta, created_at) VALUES (?1, ?2, ?3, ?4)",
        params![
            Uuid::new_v4().to_string(),
            thing_id,
            delta,
            fmt_datetime(&Utc::now())
        ],
    )?;
    Ok(())
}

fn replace_properties(conn: &Connection, thing_id: &str, properties: &[Property]) -> StoreResult<()> {
    conn.execute("DELETE FROM properties WHERE thing_id = ?1", params![thing_id])?;
    for (position, property) in properties.iter().enumerate() {
        let (value_string, value_float, unit, value_datetime) = match &property.value {
            PropertyValue::String { value } => (Some(value.clone()), None, None, None),
            PropertyValue::Float { value, unit } => (None, Some(*value), Some(unit.clone()), None),
            PropertyValue::Datetime { value } => (None, None, None, Some(fmt_datetime(value))),
        };
        conn.execute(
            r#"INSERT INTO properties (id, thing_id, name, type, value_string, value_float, unit, value_datetime, position)
               VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"#,
            params![
                Uuid::new_v4().to_string(),
                thing_id,
                &property.name,
                property.value.type_name(),
                value_string,
                value_float,
                unit,
                value_datetime,
                position as i64,
            ],
        )?;
    }
    Ok(())
}

/// Attach exactly `image_ids` to the thing. Each image must belong to `owner_id`.
fn replace_images(
    conn: &Connection,
    owner_id: &str,
    thing_id: &str,
    image_ids: &[String],
) -> StoreResult<()> {
    for image_id in image_ids {
        let owner: String = conn
            .query_row(
                "SELECT owner_id FROM images WHERE id = ?1",
                params![image_id],
                |row| row.get(0),
            )
            .map_err(not_found(format!("Image {}", image_id)))?;
        if owner != owner_id {
            return Err(StoreError::DoesNotBelongToUser(format!("Image {}", image_id)));
        }
    }

    conn.execute("DELETE FROM images_things WHERE thing_id = ?1", params![thing_id])?;
    for image_id in image_ids.iter().collect::<HashSet<_>>() {
        conn.execute(
            "INSERT INTO images_things (image_id, thing_id) VALUES (?1, ?2)",
            params![image_id, thing_id],
        )?;
    }
    Ok(())
}

impl Store {
    // ==================== Thing Operations ====================

    pub fn create_thing(&self, owner_id: &str, req: &CreateThingRequest) -> StoreResult<Thing> {
        if req.name.trim().is_empty() {
            return Err(StoreError::InvalidArgument("name must not be empty".to_string()));
        }
        let id = Uuid::new_v4().to_string();
        let now = fmt_datetime(&Utc::now());

        self.transaction(|tx| {
            tx.execute(
                r#"INSERT INTO things (id, owner_id, name, description, private_note, quantity_unit, created_at, updated_at)
                   VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"#,
                params![
                    &id,
                    owner_id,
                    &req.name,
                    &req.description,
                    &req.private_note,
                    &req.quantity_unit,
                    &now,
                    &now,
                ],
            )?;
            if req.quantity != 0 {
                append_quantity(tx, &id, req.quantity)?;
            }
            replace_properties(tx, &id, &req.properties)?;
            replace_images(tx, owner_id, &id, &req.image_ids)?;
            load_thing(tx, &id)
        })
    }

    /// The thing as `viewer_id` may see it. Things the viewer cannot read are
    /// reported as `NotFound`, exactly like missing ones.
    pub fn get_thing_for(&self, viewer_id: &str, id: &str) -> StoreResult<Thing> {
        self.read(|conn| {
            if !Resolver::new(conn).can_read_thing(viewer_id, id)? {
                return Err(StoreError::NotFound(format!("Thing {}", id)));
            }
            Ok(load_thing(conn, id)?.redacted_for(viewer_id))
        })
    }

    pub fn update_thing(
        &self,
        user_id: &str,
        id: &str,
        req: &UpdateThingRequest,
    ) -> StoreResult<Thing> {
        self.transaction(|tx| {
            Resolver::new(tx).ensure_can_manage(user_id, &ShareTarget::Thing(id.to_string()))?;
            let current = load_thing(tx, id)?;

            if let Some(name) = &req.name {
                if name.trim().is_empty() {
                    return Err(StoreError::InvalidArgument("name must not be empty".to_string()));
                }
            }

            tx.execute(
                r#"UPDATE things SET name = ?1, description = ?2, private_note = ?3,
                   quantity_unit = ?4, updated_at = ?5 WHERE id = ?6"#,
                params![
                    req.name.as_ref().unwrap_or(&current.name),
                    req.description.as_ref().unwrap_or(&current.description),
                    req.private_note
                        .as_ref()
                        .or(current.private_note.as_ref())
                        .map(String::as_str)
                        .unwrap_or_default(),
                    req.quantity_unit.as_ref().unwrap_or(&current.quantity_unit),
                    fmt_datetime(&Utc::now()),
                    id,
                ],
            )?;

            if let Some(target) = req.quantity {
                let delta = target.checked_sub(quantity_of(tx, id)?).ok_or_else(|| {
                    StoreError::InvalidArgument(format!("quantity {} is out of range", target))
                })?;
                if delta != 0 {
                    append_quantity(tx, id, delta)?;
                }
            }
            if let Some(properties) = &req.properties {
                replace_properties(tx, id, properties)?;
            }
            if let Some(image_ids) = &req.image_ids {
                replace_images(tx, user_id, id, image_ids)?;
            }

            load_thing(tx, id)
        })
    }

    /// Delete a thing together with its ledger, properties, image links, list
    /// memberships, shares and every cart entry pointing at it.
    pub fn delete_thing(&self, user_id: &str, id: &str) -> StoreResult<()> {
        self.transaction(|tx| {
            Resolver::new(tx).ensure_can_manage(user_id, &ShareTarget::Thing(id.to_string()))?;
            delete_thing_rows(tx, id)
        })
    }

    /// Owned things plus everything shared with `viewer_id`, newest first.
    pub fn visible_things(&self, viewer_id: &str) -> StoreResult<Vec<Thing>> {
        self.read(|conn| {
            let mut things = readable_thing_ids(conn, viewer_id)?
                .iter()
                .map(|id| load_thing(conn, id).map(|t| t.redacted_for(viewer_id)))
                .collect::<StoreResult<Vec<_>>>()?;
            things.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));
            Ok(things)
        })
    }

    /// Ledger of a thing the viewer can read, oldest first.
    pub fn quantity_entries(&self, viewer_id: &str, thing_id: &str) -> StoreResult<Vec<QuantityEntry>> {
        self.read(|conn| {
            if !Resolver::new(conn).can_read_thing(viewer_id, thing_id)? {
                return Err(StoreError::NotFound(format!("Thing {}", thing_id)));
            }
            let mut stmt = conn.prepare(
                "SELECT * FROM quantity_entries WHERE thing_id = ?1 ORDER BY created_at, rowid",
            )?;
            let entries = stmt
                .query_map(params![thing_id], |row| {
                    Ok(QuantityEntry {
                        id: row.get("id")?,
                        thing_id: row.get("thing_id")?,
                        delta: row.get("delta")?,
                        created_at: parse_datetime(row.get("created_at")?),
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(entries)
        })
    }
}

/// Remove a thing and every row that references it, children first.
pub(crate) fn delete_thing_rows(conn: &Connection, id: &str) -> StoreResult<()> {
    conn.execute("DELETE FROM cart_entries WHERE thing_id = ?1", params![id])?;

    // Shares on this thing disappear with it
    let share_ids: Vec<String> = {
        let mut stmt = conn.prepare("SELECT share_id FROM shares_things WHERE thing_id = ?1")?;
        let ids = stmt
            .query_map(params![id], |row| row.get(0))?
            .collect::<Result<Vec<_>, _>>()?;
        ids
    };
    conn.execute("DELETE FROM shares_things WHERE thing_id = ?1", params![id])?;
    for share_id in &share_ids {
        conn.execute("DELETE FROM shares WHERE id = ?1", params![share_id])?;
    }

    conn.execute("DELETE FROM lists_things WHERE thing_id = ?1", params![id])?;
    conn.execute("DELETE FROM images_things WHERE thing_id = ?1", params![id])?;
    conn.execute("DELETE FROM properties WHERE thing_id = ?1", params![id])?;
    conn.execute("DELETE FROM quantity_entries WHERE thing_id = ?1", params![id])?;
    let rows = conn.execute("DELETE FROM things WHERE id = ?1", params![id])?;
    if rows == 0 {
        return Err(StoreError::NotFound(format!("Thing {}", id)));
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

    fn drill() -> CreateThingRequest {
        CreateThingRequest {
            name: "Drill".to_string(),
            description: "Cordless".to_string(),
            private_note: "bought used".to_string(),
            quantity: 2,
            quantity_unit: "pcs".to_string(),
            properties: vec![
                Property {
                    name: "Voltage".to_string(),
                    value: PropertyValue::Float {
                        value: 18.0,
                        unit: "V".to_string(),
                    },
                },
                Property {
                    name: "Brand".to_string(),
                    value: PropertyValue::String {
                        value: "Acme".to_string(),
                    },
                },
            ],
            image_ids: Vec::new(),
        }
    }

    #[test]
    fn test_create_and_get_thing() {
        let store = Store::in_memory().unwrap();
        let alice = create_user(&store, "alice");

        let thing = store.create_thing(&alice.id, &drill()).unwrap();
        assert_eq!(thing.quantity, 2);
        assert_eq!(thing.properties.len(), 2);
        assert_eq!(thing.properties[0].name, "Voltage");
        assert_eq!(thing.private_note.as_deref(), Some("bought used"));

        let fetched = store.get_thing_for(&alice.id, &thing.id).unwrap();
        assert_eq!(fetched.name, "Drill");
        assert_eq!(fetched.private_note.as_deref(), Some("bought used"));
    }

    #[test]
    fn test_thing_invisible_to_stranger() {
        let store = Store::in_memory().unwrap();
        let alice = create_user(&store, "alice");
        let bob = create_user(&store, "bob");
        let thing = store.create_thing(&alice.id, &drill()).unwrap();

        assert!(matches!(
            store.get_thing_for(&bob.id, &thing.id),
            Err(StoreError::NotFound(_))
        ));
        assert!(matches!(
            store.get_thing_for(&bob.id, "missing"),
            Err(StoreError::NotFound(_))
        ));
        // Editing an invisible thing looks the same as editing a missing one
        assert!(matches!(
            store.update_thing(&bob.id, &thing.id, &UpdateThingRequest::default()),
            Err(StoreError::NotFound(_))
        ));
    }

    #[test]
    fn test_quantity_is_an_append_only_ledger() {
        let store = Store::in_memory().unwrap();
        let alice = create_user(&store, "alice");
        let thing = store.create_thing(&alice.id, &drill()).unwrap();

        let update = UpdateThingRequest {
            quantity: Some(5),
            ..Default::default()
        };
        let updated = store.update_thing(&alice.id, &thing.id, &update).unwrap();
        assert_eq!(updated.quantity, 5);

        // Same target again appends nothing
        store.update_thing(&alice.id, &thing.id, &update).unwrap();

        let update = UpdateThingRequest {
            quantity: Some(1),
            ..Default::default()
        };
        assert_eq!(store.update_thing(&alice.id, &thing.id, &update).unwrap().quantity, 1);

        let deltas: Vec<i64> = store
            .quantity_entries(&alice.id, &thing.id)
            .unwrap()
            .into_iter()
            .map(|e| e.delta)
            .collect();
        assert_eq!(deltas, vec![2, 3, -4]);
    }

    #[test]
    fn test_quantity_change_that_overflows_is_rejected() {
        let store = Store::in_memory().unwrap();
        let alice = create_user(&store, "alice");
        let thing = store
            .create_thing(
                &alice.id,
                &CreateThingRequest {
                    quantity: i64::MIN,
                    ..drill()
                },
            )
            .unwrap();

        let update = UpdateThingRequest {
            quantity: Some(1),
            name: Some("Renamed".to_string()),
            ..Default::default()
        };
        assert!(matches!(
            store.update_thing(&alice.id, &thing.id, &update),
            Err(StoreError::InvalidArgument(_))
        ));

        // Rolled back as a whole
        let current = store.get_thing_for(&alice.id, &thing.id).unwrap();
        assert_eq!(current.quantity, i64::MIN);
        assert_eq!(current.name, "Drill");
        assert_eq!(store.quantity_entries(&alice.id, &thing.id).unwrap().len(), 1);
    }

    #[test]
    fn test_update_replaces_properties_and_keeps_other_fields() {
        let store = Store::in_memory().unwrap();
        let alice = create_user(&store, "alice");
        let thing = store.create_thing(&alice.id, &drill()).unwrap();

        let when = Utc::now();
        let update = UpdateThingRequest {
            name: Some("Impact drill".to_string()),
            properties: Some(vec![Property {
                name: "Bought".to_string(),
                value: PropertyValue::Datetime { value: when },
            }]),
            ..Default::default()
        };
        let updated = store.update_thing(&alice.id, &thing.id, &update).unwrap();
        assert_eq!(updated.name, "Impact drill");
        assert_eq!(updated.description, "Cordless");
        assert_eq!(updated.private_note.as_deref(), Some("bought used"));
        assert_eq!(updated.properties.len(), 1);
        match &updated.properties[0].value {
            PropertyValue::Datetime { value } => {
                assert_eq!(value.timestamp_micros(), when.timestamp_micros())
            }
            other => panic!("unexpected property {:?}", other),
        }
    }

    #[test]
    fn test_images_must_belong_to_owner() {
        let store = Store::in_memory().unwrap();
        let alice = create_user(&store, "alice");
        let bob = create_user(&store, "bob");
        let bobs_image = store.create_image(&bob.id, "b.png", "image/png", b"b").unwrap();
        let alices_image = store.create_image(&alice.id, "a.png", "image/png", b"a").unwrap();

        let mut req = drill();
        req.image_ids = vec![bobs_image.id.clone()];
        assert!(matches!(
            store.create_thing(&alice.id, &req),
            Err(StoreError::DoesNotBelongToUser(_))
        ));

        req.image_ids = vec![alices_image.id.clone()];
        let thing = store.create_thing(&alice.id, &req).unwrap();
        assert_eq!(thing.image_ids, vec![alices_image.id]);
    }

    #[test]
    fn test_delete_thing() {
        let store = Store::in_memory().unwrap();
        let alice = create_user(&store, "alice");
        let bob = create_user(&store, "bob");
        let thing = store.create_thing(&alice.id, &drill()).unwrap();

        assert!(matches!(
            store.delete_thing(&bob.id, &thing.id),
            Err(StoreError::NotFound(_))
        ));

        store.delete_thing(&alice.id, &thing.id).unwrap();
        assert!(matches!(
            store.get_thing_for(&alice.id, &thing.id),
            Err(StoreError::NotFound(_))
        ));
        assert!(store.visible_things(&alice.id).unwrap().is_empty());
    }
}
