use chrono::{DateTime, Datelike, Duration, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use uuid::Uuid;

use super::{
    fmt_datetime, not_found, parse_datetime, parse_opt_datetime, Store, StoreError, StoreResult,
};
use crate::models::{NotificationContent, Profile, ProfileSummary, User};

/// `now + delay`, rejected when it overflows or leaves the four-digit years
/// that stored timestamps can represent.
fn deadline_after(delay: Duration) -> StoreResult<DateTime<Utc>> {
    Utc::now()
        .checked_add_signed(delay)
        .filter(|at| at.year() <= 9999)
        .ok_or_else(|| StoreError::InvalidArgument("delay is too large".to_string()))
}

fn row_to_user(row: &rusqlite::Row) -> rusqlite::Result<User> {
    Ok(User {
        id: row.get("id")?,
        name: row.get("name")?,
        email: row.get("email")?,
        password_hash: row.get("password_hash")?,
        is_admin: row.get("is_admin")?,
        purge_at: parse_opt_datetime(row.get("purge_at")?),
        created_at: parse_datetime(row.get("created_at")?),
        updated_at: parse_datetime(row.get("updated_at")?),
    })
}

pub(crate) fn load_user(conn: &Connection, id: &str) -> StoreResult<User> {
    conn.query_row("SELECT * FROM users WHERE id = ?1", params![id], row_to_user)
        .map_err(not_found(format!("User {}", id)))
}

pub(crate) fn user_exists(conn: &Connection, id: &str) -> StoreResult<bool> {
    Ok(conn
        .query_row("SELECT 1 FROM users WHERE id = ?1", params![id], |_| Ok(()))
        .optional()?
        .is_some())
}

fn set_purge_at(conn: &Connection, id: &str, purge_at: Option<DateTime<Utc>>) -> StoreResult<()> {
    conn.execute(
        "UPDATE users SET purge_at = ?1, updated_at = ?2 WHERE id = ?3",
        params![purge_at.as_ref().map(fmt_datetime), fmt_datetime(&Utc::now()), id],
    )?;
    Ok(())
}

impl Store {
    // ==================== User Operations ====================

    pub fn create_user(&self, user: &mut User) -> StoreResult<()> {
        user.id = Uuid::new_v4().to_string();
        let now = Utc::now();
        user.created_at = now;
        user.updated_at = now;

        self.transaction(|tx| {
            tx.execute(
                r#"INSERT INTO users (id, name, email, password_hash, is_admin, purge_at, created_at, updated_at)
                   VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"#,
                params![
                    &user.id,
                    &user.name,
                    &user.email,
                    &user.password_hash,
                    user.is_admin,
                    user.purge_at.as_ref().map(fmt_datetime),
                    fmt_datetime(&user.created_at),
                    fmt_datetime(&user.updated_at),
                ],
            )?;
            tx.execute(
                "INSERT INTO profiles (user_id, updated_at) VALUES (?1, ?2)",
                params![&user.id, fmt_datetime(&now)],
            )?;
            Ok(())
        })
    }

    pub fn get_user(&self, id: &str) -> StoreResult<User> {
        self.read(|conn| load_user(conn, id))
    }

    pub fn get_user_by_email(&self, email: &str) -> StoreResult<User> {
        self.read(|conn| {
            conn.query_row("SELECT * FROM users WHERE email = ?1", params![email], row_to_user)
                .map_err(not_found(format!("User {}", email)))
        })
    }

    pub fn count_users(&self) -> StoreResult<i64> {
        self.read(|conn| Ok(conn.query_row("SELECT COUNT(*) FROM users", [], |row| row.get(0))?))
    }

    pub fn set_admin(&self, id: &str, is_admin: bool) -> StoreResult<()> {
        self.transaction(|tx| {
            let rows = tx.execute(
                "UPDATE users SET is_admin = ?1 WHERE id = ?2",
                params![is_admin, id],
            )?;
            if rows == 0 {
                return Err(StoreError::NotFound(format!("User {}", id)));
            }
            Ok(())
        })
    }

    /// Replace the stored password hash. Verifying the old password is the
    /// caller's job.
    pub fn set_password_hash(&self, id: &str, password_hash: &str) -> StoreResult<()> {
        self.transaction(|tx| {
            let rows = tx.execute(
                "UPDATE users SET password_hash = ?1, updated_at = ?2 WHERE id = ?3",
                params![password_hash, fmt_datetime(&Utc::now()), id],
            )?;
            if rows == 0 {
                return Err(StoreError::NotFound(format!("User {}", id)));
            }
            Ok(())
        })
    }

    // ==================== Profile Operations ====================

    /// Every user's public profile, ordered by name.
    pub fn list_profiles(&self) -> StoreResult<Vec<ProfileSummary>> {
        self.read(|conn| {
            let mut stmt = conn.prepare(
                r#"SELECT u.id, u.name, p.full_name, p.information, p.image_id
                   FROM users u JOIN profiles p ON p.user_id = u.id
                   ORDER BY u.name, u.id"#,
            )?;
            let profiles = stmt
                .query_map([], |row| {
                    Ok(ProfileSummary {
                        user_id: row.get(0)?,
                        name: row.get(1)?,
                        full_name: row.get(2)?,
                        information: row.get(3)?,
                        image_id: row.get(4)?,
                    })
                })?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(profiles)
        })
    }

    pub fn get_profile(&self, user_id: &str) -> StoreResult<Profile> {
        self.read(|conn| {
            conn.query_row(
                "SELECT * FROM profiles WHERE user_id = ?1",
                params![user_id],
                |row| {
                    Ok(Profile {
                        user_id: row.get("user_id")?,
                        full_name: row.get("full_name")?,
                        information: row.get("information")?,
                        image_id: row.get("image_id")?,
                        updated_at: parse_datetime(row.get("updated_at")?),
                    })
                },
            )
            .map_err(not_found(format!("Profile {}", user_id)))
        })
    }

    /// The profile image, when given, must be one of the user's own images.
    pub fn update_profile(
        &self,
        user_id: &str,
        full_name: &str,
        information: &str,
        image_id: Option<&str>,
    ) -> StoreResult<Profile> {
        let now = Utc::now();
        self.transaction(|tx| {
            load_user(tx, user_id)?;
            if let Some(image_id) = image_id {
                let owner: String = tx
                    .query_row(
                        "SELECT owner_id FROM images WHERE id = ?1",
                        params![image_id],
                        |row| row.get(0),
                    )
                    .map_err(not_found(format!("Image {}", image_id)))?;
                if owner != user_id {
                    return Err(StoreError::DoesNotBelongToUser(format!("Image {}", image_id)));
                }
            }

            tx.execute(
                r#"INSERT INTO profiles (user_id, full_name, information, image_id, updated_at)
                   VALUES (?1, ?2, ?3, ?4, ?5)
                   ON CONFLICT(user_id) DO UPDATE SET
                     full_name = excluded.full_name,
                     information = excluded.information,
                     image_id = excluded.image_id,
                     updated_at = excluded.updated_at"#,
                params![user_id, full_name, information, image_id, fmt_datetime(&now)],
            )?;
            Ok(())
        })?;
        self.get_profile(user_id)
    }

    // ==================== Deletion Scheduling ====================

    /// Administrative trigger: the user becomes due `delay` from now.
    /// A zero delay makes the user eligible on the purge worker's next tick.
    pub fn schedule_purge(&self, user_id: &str, delay: Duration) -> StoreResult<User> {
        if delay < Duration::zero() {
            return Err(StoreError::InvalidArgument("delay must not be negative".to_string()));
        }
        let purge_at = deadline_after(delay)?;
        self.transaction(|tx| {
            load_user(tx, user_id)?;
            set_purge_at(tx, user_id, Some(purge_at))?;
            load_user(tx, user_id)
        })
    }

    /// User-initiated deletion after a grace period. An already scheduled
    /// deletion is kept as it is.
    pub fn request_deletion(&self, user_id: &str, grace_period: Duration) -> StoreResult<User> {
        self.notifying_transaction(|tx, outbox| {
            let user = load_user(tx, user_id)?;
            if user.purge_at.is_some() {
                return Ok(user);
            }

            let purge_at = deadline_after(grace_period)?;
            set_purge_at(tx, user_id, Some(purge_at))?;
            outbox.push(
                tx,
                user_id,
                None,
                NotificationContent::AccountDeletionScheduled { purge_at },
            )?;
            load_user(tx, user_id)
        })
    }

    pub fn cancel_deletion(&self, user_id: &str) -> StoreResult<User> {
        self.transaction(|tx| {
            let user = load_user(tx, user_id)?;
            if user.purge_at.is_none() {
                return Err(StoreError::NotFound(format!("Scheduled deletion for user {}", user_id)));
            }
            set_purge_at(tx, user_id, None)?;
            load_user(tx, user_id)
        })
    }

    /// Ids of users whose `purge_at` is at or before `now`, oldest first.
    pub fn users_due_for_purge(&self, now: DateTime<Utc>) -> StoreResult<Vec<String>> {
        self.read(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id FROM users WHERE purge_at IS NOT NULL AND purge_at <= ?1 ORDER BY purge_at",
            )?;
            let ids = stmt
                .query_map(params![fmt_datetime(&now)], |row| row.get(0))?
                .collect::<Result<Vec<String>, _>>()?;
            Ok(ids)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_user(name: &str) -> User {
        User {
            id: String::new(),
            name: name.to_string(),
            email: format!("{}@example.com", name),
            password_hash: "hash".to_string(),
            is_admin: false,
            purge_at: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_create_and_get_user() {
        let store = Store::in_memory().unwrap();
        let mut user = new_user("alice");
        store.create_user(&mut user).unwrap();
        assert!(!user.id.is_empty());

        let retrieved = store.get_user(&user.id).unwrap();
        assert_eq!(retrieved.name, "alice");
        assert!(retrieved.purge_at.is_none());

        let by_email = store.get_user_by_email("alice@example.com").unwrap();
        assert_eq!(by_email.id, user.id);

        // Registration also creates an empty profile
        let profile = store.get_profile(&user.id).unwrap();
        assert_eq!(profile.full_name, "");
    }

    #[test]
    fn test_duplicate_email_rejected() {
        let store = Store::in_memory().unwrap();
        store.create_user(&mut new_user("alice")).unwrap();
        assert!(matches!(
            store.create_user(&mut new_user("alice")),
            Err(StoreError::Database(_))
        ));
    }

    #[test]
    fn test_schedule_purge_with_zero_delay_is_due_now() {
        let store = Store::in_memory().unwrap();
        let mut alice = new_user("alice");
        store.create_user(&mut alice).unwrap();
        let mut bob = new_user("bob");
        store.create_user(&mut bob).unwrap();

        store.schedule_purge(&alice.id, Duration::zero()).unwrap();
        store.schedule_purge(&bob.id, Duration::minutes(30)).unwrap();

        let due = store.users_due_for_purge(Utc::now()).unwrap();
        assert_eq!(due, vec![alice.id.clone()]);

        let later = store.users_due_for_purge(Utc::now() + Duration::hours(1)).unwrap();
        assert_eq!(later.len(), 2);
    }

    #[test]
    fn test_oversized_delay_is_rejected() {
        let store = Store::in_memory().unwrap();
        let mut alice = new_user("alice");
        store.create_user(&mut alice).unwrap();

        for delay in [Duration::minutes(200_000_000_000), Duration::MAX] {
            assert!(matches!(
                store.schedule_purge(&alice.id, delay),
                Err(StoreError::InvalidArgument(_))
            ));
        }
        assert!(matches!(
            store.request_deletion(&alice.id, Duration::days(365 * 9000)),
            Err(StoreError::InvalidArgument(_))
        ));
        assert!(store.get_user(&alice.id).unwrap().purge_at.is_none());
    }

    #[test]
    fn test_schedule_purge_unknown_user() {
        let store = Store::in_memory().unwrap();
        assert!(matches!(
            store.schedule_purge("missing", Duration::zero()),
            Err(StoreError::NotFound(_))
        ));
    }

    #[test]
    fn test_request_and_cancel_deletion() {
        let store = Store::in_memory().unwrap();
        let mut alice = new_user("alice");
        store.create_user(&mut alice).unwrap();

        let scheduled = store.request_deletion(&alice.id, Duration::days(7)).unwrap();
        let purge_at = scheduled.purge_at.unwrap();

        // Asking again keeps the original date
        let again = store.request_deletion(&alice.id, Duration::days(1)).unwrap();
        assert_eq!(
            again.purge_at.unwrap().timestamp_micros(),
            purge_at.timestamp_micros()
        );
        assert_eq!(store.count_unacknowledged(&alice.id).unwrap(), 1);

        let cancelled = store.cancel_deletion(&alice.id).unwrap();
        assert!(cancelled.purge_at.is_none());
        assert!(matches!(
            store.cancel_deletion(&alice.id),
            Err(StoreError::NotFound(_))
        ));
    }

    #[test]
    fn test_set_password_hash() {
        let store = Store::in_memory().unwrap();
        let mut alice = new_user("alice");
        store.create_user(&mut alice).unwrap();

        store.set_password_hash(&alice.id, "new-hash").unwrap();
        assert_eq!(store.get_user(&alice.id).unwrap().password_hash, "new-hash");
        assert!(matches!(
            store.set_password_hash("missing", "x"),
            Err(StoreError::NotFound(_))
        ));
    }

    #[test]
    fn test_list_profiles_orders_by_name() {
        let store = Store::in_memory().unwrap();
        let mut bob = new_user("bob");
        store.create_user(&mut bob).unwrap();
        let mut alice = new_user("alice");
        store.create_user(&mut alice).unwrap();
        store.update_profile(&bob.id, "Robert", "likes tools", None).unwrap();

        let profiles = store.list_profiles().unwrap();
        let names: Vec<&str> = profiles.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["alice", "bob"]);
        assert_eq!(profiles[1].full_name, "Robert");
        assert_eq!(profiles[1].user_id, bob.id);
    }

    #[test]
    fn test_profile_image_must_be_owned() {
        let store = Store::in_memory().unwrap();
        let mut alice = new_user("alice");
        store.create_user(&mut alice).unwrap();
        let mut bob = new_user("bob");
        store.create_user(&mut bob).unwrap();

        let image = store
            .create_image(&bob.id, "bob.png", "image/png", b"bob")
            .unwrap();

        let err = store
            .update_profile(&alice.id, "Alice", "", Some(&image.id))
            .unwrap_err();
        assert!(matches!(err, StoreError::DoesNotBelongToUser(_)));

        let profile = store
            .update_profile(&bob.id, "Bob", "likes tools", Some(&image.id))
            .unwrap();
        assert_eq!(profile.image_id.as_deref(), Some(image.id.as_str()));
    }
}
