use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashSet;
use uuid::Uuid;

use super::cart::prune_carts;
use super::users::{load_user, user_exists};
use super::{fmt_datetime, not_found, parse_datetime, Store, StoreError, StoreResult};
use crate::graph::{normalize_pair, FriendGraph};
use crate::models::*;

fn row_to_request(row: &rusqlite::Row) -> rusqlite::Result<FriendRequest> {
    let state: String = row.get("state")?;
    Ok(FriendRequest {
        id: row.get("id")?,
        sender_id: row.get("sender_id")?,
        receiver_id: row.get("receiver_id")?,
        state: state.parse().unwrap_or(FriendRequestState::Rejected),
        created_at: parse_datetime(row.get("created_at")?),
        updated_at: parse_datetime(row.get("updated_at")?),
    })
}

fn load_request(conn: &Connection, id: &str) -> StoreResult<FriendRequest> {
    conn.query_row(
        "SELECT * FROM friend_requests WHERE id = ?1",
        params![id],
        row_to_request,
    )
    .map_err(not_found(format!("Friend request {}", id)))
}

fn set_request_state(conn: &Connection, id: &str, state: FriendRequestState) -> StoreResult<()> {
    conn.execute(
        "UPDATE friend_requests SET state = ?1, updated_at = ?2 WHERE id = ?3",
        params![state.as_str(), fmt_datetime(&Utc::now()), id],
    )?;
    Ok(())
}

/// Users whose view can change when the friendship between `a` and `b` goes away.
fn edge_dependents(graph: &FriendGraph<'_>, a: &str, b: &str) -> StoreResult<HashSet<String>> {
    let mut users = graph.friend_ids(a)?;
    users.extend(graph.friend_ids(b)?);
    users.insert(a.to_string());
    users.insert(b.to_string());
    Ok(users)
}

impl Store {
    // ==================== Friend Request Operations ====================

    /// A sender may have only one pending request at a time.
    pub fn create_friend_request(&self, sender_id: &str, receiver_id: &str) -> StoreResult<FriendRequest> {
        if sender_id == receiver_id {
            return Err(StoreError::InvalidArgument(
                "cannot send a friend request to yourself".to_string(),
            ));
        }

        self.notifying_transaction(|tx, outbox| {
            load_user(tx, sender_id)?;
            if !user_exists(tx, receiver_id)? {
                return Err(StoreError::NotFound(format!("User {}", receiver_id)));
            }

            let pending: Option<String> = tx
                .query_row(
                    "SELECT id FROM friend_requests WHERE sender_id = ?1 AND state = 'pending' LIMIT 1",
                    params![sender_id],
                    |row| row.get(0),
                )
                .optional()?;
            if pending.is_some() {
                return Err(StoreError::PendingRequestExists);
            }
            if FriendGraph::new(tx).are_friends(sender_id, receiver_id)? {
                return Err(StoreError::FriendshipExists);
            }

            let id = Uuid::new_v4().to_string();
            let now = fmt_datetime(&Utc::now());
            tx.execute(
                r#"INSERT INTO friend_requests (id, sender_id, receiver_id, state, created_at, updated_at)
                   VALUES (?1, ?2, ?3, 'pending', ?4, ?5)"#,
                params![&id, sender_id, receiver_id, &now, &now],
            )?;
            outbox.push(
                tx,
                receiver_id,
                Some(sender_id),
                NotificationContent::FriendRequest {
                    request_id: id.clone(),
                    sender_id: sender_id.to_string(),
                },
            )?;
            load_request(tx, &id)
        })
    }

    /// Withdraw a pending request. Only the sender may cancel it.
    pub fn cancel_friend_request(&self, user_id: &str, request_id: &str) -> StoreResult<()> {
        self.transaction(|tx| {
            let request = load_request(tx, request_id)?;
            if request.sender_id != user_id {
                return Err(StoreError::DoesNotBelongToUser(format!("Friend request {}", request_id)));
            }
            if request.state != FriendRequestState::Pending {
                return Err(StoreError::FriendRequestNotPending);
            }
            tx.execute("DELETE FROM friend_requests WHERE id = ?1", params![request_id])?;
            Ok(())
        })
    }

    /// Accept or reject a pending request. Only the receiver may react.
    /// Accepting creates the friendship in the same transaction and notifies
    /// both users; rejecting notifies the sender.
    pub fn react_friend_request(
        &self,
        user_id: &str,
        request_id: &str,
        accept: bool,
    ) -> StoreResult<FriendRequest> {
        self.notifying_transaction(|tx, outbox| {
            let request = load_request(tx, request_id)?;
            if request.receiver_id != user_id {
                return Err(StoreError::DoesNotBelongToUser(format!("Friend request {}", request_id)));
            }
            if request.state != FriendRequestState::Pending {
                return Err(StoreError::FriendRequestNotPending);
            }

            let content = NotificationContent::FriendRequestReaction {
                request_id: request.id.clone(),
                sender_id: request.sender_id.clone(),
                receiver_id: request.receiver_id.clone(),
                accepted: accept,
            };

            if accept {
                if FriendGraph::new(tx).are_friends(&request.sender_id, &request.receiver_id)? {
                    return Err(StoreError::FriendshipExists);
                }
                set_request_state(tx, request_id, FriendRequestState::Accepted)?;
                let (first, second) = normalize_pair(&request.sender_id, &request.receiver_id);
                tx.execute(
                    r#"INSERT INTO friendships (friend1_id, friend2_id, friend_request_id, created_at)
                       VALUES (?1, ?2, ?3, ?4)"#,
                    params![first, second, request_id, fmt_datetime(&Utc::now())],
                )?;
                outbox.push(tx, &request.sender_id, Some(user_id), content.clone())?;
                outbox.push(tx, &request.receiver_id, Some(&request.sender_id), content)?;
            } else {
                set_request_state(tx, request_id, FriendRequestState::Rejected)?;
                outbox.push(tx, &request.sender_id, Some(user_id), content)?;
            }

            load_request(tx, request_id)
        })
    }

    pub fn friend_requests(&self, user_id: &str) -> StoreResult<FriendRequests> {
        self.read(|conn| {
            let mut stmt = conn.prepare(
                "SELECT * FROM friend_requests WHERE sender_id = ?1 ORDER BY created_at DESC",
            )?;
            let sent = stmt
                .query_map(params![user_id], row_to_request)?
                .collect::<Result<Vec<_>, _>>()?;
            let mut stmt = conn.prepare(
                "SELECT * FROM friend_requests WHERE receiver_id = ?1 ORDER BY created_at DESC",
            )?;
            let received = stmt
                .query_map(params![user_id], row_to_request)?
                .collect::<Result<Vec<_>, _>>()?;
            Ok(FriendRequests { sent, received })
        })
    }

    // ==================== Friendship Operations ====================

    /// Friends of `user_id`, sorted by name.
    pub fn friends(&self, user_id: &str) -> StoreResult<Vec<User>> {
        self.read(|conn| {
            let mut friends = FriendGraph::new(conn)
                .friend_ids(user_id)?
                .iter()
                .map(|id| load_user(conn, id))
                .collect::<StoreResult<Vec<_>>>()?;
            friends.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.id.cmp(&b.id)));
            Ok(friends)
        })
    }

    /// End a friendship. Carts of everyone whose visibility went through this
    /// friendship are pruned in the same transaction.
    pub fn unfriend(&self, user_id: &str, friend_id: &str) -> StoreResult<()> {
        self.transaction(|tx| {
            let graph = FriendGraph::new(tx);
            if graph.friendship(user_id, friend_id)?.is_none() {
                return Err(StoreError::NotFound(format!("Friendship with {}", friend_id)));
            }
            let dependents = edge_dependents(&graph, user_id, friend_id)?;

            let (first, second) = normalize_pair(user_id, friend_id);
            tx.execute(
                "DELETE FROM friendships WHERE friend1_id = ?1 AND friend2_id = ?2",
                params![first, second],
            )?;
            prune_carts(tx, &dependents)?;
            Ok(())
        })
    }
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

    #[test]
    fn test_accept_creates_single_friendship() {
        let store = Store::in_memory().unwrap();
        let alice = create_user(&store, "alice");
        let bob = create_user(&store, "bob");

        let request = store.create_friend_request(&alice.id, &bob.id).unwrap();
        assert_eq!(request.state, FriendRequestState::Pending);

        let accepted = store.react_friend_request(&bob.id, &request.id, true).unwrap();
        assert_eq!(accepted.state, FriendRequestState::Accepted);
        assert!(store.are_friends(&alice.id, &bob.id));
        assert!(store.are_friends(&bob.id, &alice.id));

        let friends = store.friends(&alice.id).unwrap();
        assert_eq!(friends.len(), 1);
        assert_eq!(friends[0].id, bob.id);

        // Reacting twice is rejected
        assert!(matches!(
            store.react_friend_request(&bob.id, &request.id, true),
            Err(StoreError::FriendRequestNotPending)
        ));
    }

    #[test]
    fn test_one_pending_request_per_sender() {
        let store = Store::in_memory().unwrap();
        let alice = create_user(&store, "alice");
        let bob = create_user(&store, "bob");
        let carol = create_user(&store, "carol");

        store.create_friend_request(&alice.id, &bob.id).unwrap();
        assert!(matches!(
            store.create_friend_request(&alice.id, &carol.id),
            Err(StoreError::PendingRequestExists)
        ));
    }

    #[test]
    fn test_request_to_existing_friend() {
        let store = Store::in_memory().unwrap();
        let alice = create_user(&store, "alice");
        let bob = create_user(&store, "bob");

        let request = store.create_friend_request(&alice.id, &bob.id).unwrap();
        store.react_friend_request(&bob.id, &request.id, true).unwrap();

        assert!(matches!(
            store.create_friend_request(&bob.id, &alice.id),
            Err(StoreError::FriendshipExists)
        ));
    }

    #[test]
    fn test_crossed_requests_yield_one_friendship() {
        let store = Store::in_memory().unwrap();
        let alice = create_user(&store, "alice");
        let bob = create_user(&store, "bob");

        let from_alice = store.create_friend_request(&alice.id, &bob.id).unwrap();
        let from_bob = store.create_friend_request(&bob.id, &alice.id).unwrap();

        store.react_friend_request(&bob.id, &from_alice.id, true).unwrap();
        assert!(matches!(
            store.react_friend_request(&alice.id, &from_bob.id, true),
            Err(StoreError::FriendshipExists)
        ));
        assert_eq!(store.friend_ids(&alice.id).len(), 1);
    }

    #[test]
    fn test_only_receiver_reacts_and_only_sender_cancels() {
        let store = Store::in_memory().unwrap();
        let alice = create_user(&store, "alice");
        let bob = create_user(&store, "bob");

        let request = store.create_friend_request(&alice.id, &bob.id).unwrap();
        assert!(matches!(
            store.react_friend_request(&alice.id, &request.id, true),
            Err(StoreError::DoesNotBelongToUser(_))
        ));
        assert!(matches!(
            store.cancel_friend_request(&bob.id, &request.id),
            Err(StoreError::DoesNotBelongToUser(_))
        ));

        store.cancel_friend_request(&alice.id, &request.id).unwrap();
        let requests = store.friend_requests(&alice.id).unwrap();
        assert!(requests.sent.is_empty());

        // The sender is free to ask again
        store.create_friend_request(&alice.id, &bob.id).unwrap();
    }

    #[test]
    fn test_reject_and_self_request() {
        let store = Store::in_memory().unwrap();
        let alice = create_user(&store, "alice");
        let bob = create_user(&store, "bob");

        assert!(matches!(
            store.create_friend_request(&alice.id, &alice.id),
            Err(StoreError::InvalidArgument(_))
        ));

        let request = store.create_friend_request(&alice.id, &bob.id).unwrap();
        let rejected = store.react_friend_request(&bob.id, &request.id, false).unwrap();
        assert_eq!(rejected.state, FriendRequestState::Rejected);
        assert!(!store.are_friends(&alice.id, &bob.id));
    }

    #[test]
    fn test_unfriend() {
        let store = Store::in_memory().unwrap();
        let alice = create_user(&store, "alice");
        let bob = create_user(&store, "bob");

        assert!(matches!(
            store.unfriend(&alice.id, &bob.id),
            Err(StoreError::NotFound(_))
        ));

        let request = store.create_friend_request(&alice.id, &bob.id).unwrap();
        store.react_friend_request(&bob.id, &request.id, true).unwrap();
        store.unfriend(&bob.id, &alice.id).unwrap();
        assert!(!store.are_friends(&alice.id, &bob.id));
    }
}
