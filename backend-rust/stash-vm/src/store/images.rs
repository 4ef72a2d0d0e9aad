use chrono::Utc;
use rusqlite::{params, Connection};
use uuid::Uuid;

use super::{fmt_datetime, not_found, parse_datetime, Store, StoreError, StoreResult};
use crate::content::ContentStore;
use crate::models::Image;
use crate::resolver::Resolver;

fn row_to_image(row: &rusqlite::Row) -> rusqlite::Result<Image> {
    Ok(Image {
        id: row.get("id")?,
        owner_id: row.get("owner_id")?,
        name: row.get("name")?,
        mime: row.get("mime")?,
        hash: row.get("hash")?,
        created_at: parse_datetime(row.get("created_at")?),
    })
}

pub(crate) fn load_image(conn: &Connection, id: &str) -> StoreResult<Image> {
    conn.query_row("SELECT * FROM images WHERE id = ?1", params![id], row_to_image)
        .map_err(not_found(format!("Image {}", id)))
}

/// Number of image rows still pointing at a content blob.
pub(crate) fn content_references(conn: &Connection, hash: &str) -> StoreResult<i64> {
    Ok(conn.query_row(
        "SELECT COUNT(*) FROM images WHERE hash = ?1",
        params![hash],
        |row| row.get(0),
    )?)
}

fn can_read_image(conn: &Connection, viewer_id: &str, image: &Image) -> StoreResult<bool> {
    if image.owner_id == viewer_id {
        return Ok(true);
    }
    let mut stmt = conn.prepare_cached("SELECT thing_id FROM images_things WHERE image_id = ?1")?;
    let things = stmt
        .query_map(params![&image.id], |row| row.get::<_, String>(0))?
        .collect::<Result<Vec<_>, _>>()?;
    let resolver = Resolver::new(conn);
    for thing_id in things {
        if resolver.can_read_thing(viewer_id, &thing_id)? {
            return Ok(true);
        }
    }
    Ok(false)
}

impl Store {
    // ==================== Image Operations ====================

    /// Store `bytes` and record an image row for them. The blob is written
    /// under the connection lock so it cannot interleave with `delete_content`.
    pub fn create_image(&self, owner_id: &str, name: &str, mime: &str, bytes: &[u8]) -> StoreResult<Image> {
        self.transaction(|tx| {
            let image = Image {
                id: Uuid::new_v4().to_string(),
                owner_id: owner_id.to_string(),
                name: name.to_string(),
                mime: mime.to_string(),
                hash: self.content.put(bytes)?,
                created_at: Utc::now(),
            };
            tx.execute(
                r#"INSERT INTO images (id, owner_id, name, mime, hash, created_at)
                   VALUES (?1, ?2, ?3, ?4, ?5, ?6)"#,
                params![
                    &image.id,
                    &image.owner_id,
                    &image.name,
                    &image.mime,
                    &image.hash,
                    fmt_datetime(&image.created_at),
                ],
            )?;
            Ok(image)
        })
    }

    /// Readable by the owner and by anyone who can read a thing showing the image.
    pub fn get_image_for(&self, viewer_id: &str, id: &str) -> StoreResult<Image> {
        self.read(|conn| {
            let image = load_image(conn, id)?;
            if !can_read_image(conn, viewer_id, &image)? {
                return Err(StoreError::NotFound(format!("Image {}", id)));
            }
            Ok(image)
        })
    }

    pub fn image_content(&self, viewer_id: &str, id: &str) -> StoreResult<(Image, Vec<u8>)> {
        let image = self.get_image_for(viewer_id, id)?;
        let bytes = self.content.get(&image.hash)?;
        Ok((image, bytes))
    }

    /// Delete one of the caller's images. An image still attached to a thing
    /// or used as a profile picture cannot be deleted.
    pub fn delete_image(&self, user_id: &str, id: &str) -> StoreResult<()> {
        let hash = self.transaction(|tx| {
            let image = load_image(tx, id)?;
            if image.owner_id != user_id {
                return Err(if can_read_image(tx, user_id, &image)? {
                    StoreError::NoAccessRights(format!("Image {}", id))
                } else {
                    StoreError::NotFound(format!("Image {}", id))
                });
            }

            let used: i64 = tx.query_row(
                r#"SELECT (SELECT COUNT(*) FROM images_things WHERE image_id = ?1)
                        + (SELECT COUNT(*) FROM profiles WHERE image_id = ?1)"#,
                params![id],
                |row| row.get(0),
            )?;
            if used > 0 {
                return Err(StoreError::EntityInUse(format!("Image {}", id)));
            }

            tx.execute("DELETE FROM images WHERE id = ?1", params![id])?;
            Ok(image.hash)
        })?;

        match self.delete_content(&hash) {
            Ok(()) | Err(StoreError::EntityInUse(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Remove a content blob. Fails with `EntityInUse` while any image row
    /// still references the hash.
    ///
    /// The lock is held from the reference count to the removal, so an upload
    /// of the same bytes either lands before the count or after the removal.
    pub fn delete_content(&self, hash: &str) -> StoreResult<()> {
        self.read(|conn| {
            if content_references(conn, hash)? > 0 {
                return Err(StoreError::EntityInUse(format!("Content {}", hash)));
            }
            self.content.remove(hash)?;
            Ok(())
        })
    }
}
