use chrono::Utc;
use std::collections::HashSet;

use stash_vm::models::*;
use stash_vm::store::{Store, StoreError};

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

fn create_thing(store: &Store, owner: &User, name: &str) -> Thing {
    store
        .create_thing(
            &owner.id,
            &CreateThingRequest {
                name: name.to_string(),
                description: String::new(),
                private_note: format!("note on {}", name),
                quantity: 1,
                quantity_unit: String::new(),
                properties: Vec::new(),
                image_ids: Vec::new(),
            },
        )
        .unwrap()
}

fn create_list(store: &Store, owner: &User, state: SharingState, things: &[&Thing]) -> List {
    store
        .create_list(
            &owner.id,
            &CreateListRequest {
                name: "Camping".to_string(),
                sharing_state: state,
                thing_ids: things.iter().map(|t| t.id.clone()).collect(),
            },
        )
        .unwrap()
        .list
}

fn befriend(store: &Store, a: &User, b: &User) {
    let request = store.create_friend_request(&a.id, &b.id).unwrap();
    store.react_friend_request(&b.id, &request.id, true).unwrap();
}

fn thing_target(thing: &Thing) -> ShareTarget {
    ShareTarget::Thing(thing.id.clone())
}

// ==================== Ownership ====================

#[test]
fn test_owner_always_reads_and_manages() {
    let store = Store::in_memory().unwrap();
    let alice = create_user(&store, "alice");
    let tent = create_thing(&store, &alice, "tent");
    let list = create_list(&store, &alice, SharingState::Private, &[&tent]);

    assert!(store.can_read(&alice.id, &thing_target(&tent)));
    assert!(store.can_read(&alice.id, &ShareTarget::List(list.id.clone())));
    assert!(store.can_manage(&alice.id, &thing_target(&tent)));

    // Owned objects are not part of the "visible to me from others" sets
    assert!(store.visible_thing_ids(&alice.id).is_empty());
    assert!(store.visible_list_ids(&alice.id).is_empty());

    let owned = store.get_thing_for(&alice.id, &tent.id).unwrap();
    assert_eq!(owned.private_note.as_deref(), Some("note on tent"));
}

#[test]
fn test_stranger_sees_nothing() {
    let store = Store::in_memory().unwrap();
    let alice = create_user(&store, "alice");
    let bob = create_user(&store, "bob");
    let tent = create_thing(&store, &alice, "tent");
    create_list(&store, &alice, SharingState::FriendsOfFriends, &[&tent]);

    assert!(!store.can_read(&bob.id, &thing_target(&tent)));
    assert!(store.visible_thing_ids(&bob.id).is_empty());
    assert!(matches!(
        store.get_thing_for(&bob.id, &tent.id),
        Err(StoreError::NotFound(_))
    ));
    assert!(store.visible_things(&bob.id).unwrap().is_empty());
}

// ==================== Direct Shares ====================

#[test]
fn test_direct_share_then_revoke() {
    let store = Store::in_memory().unwrap();
    let alice = create_user(&store, "alice");
    let bob = create_user(&store, "bob");
    let tent = create_thing(&store, &alice, "tent");

    let share = store.create_share(&alice.id, &bob.id, &thing_target(&tent)).unwrap();
    assert!(store.can_read(&bob.id, &thing_target(&tent)));
    assert!(!store.can_manage(&bob.id, &thing_target(&tent)));

    let seen = store.get_thing_for(&bob.id, &tent.id).unwrap();
    assert!(seen.private_note.is_none());
    assert_eq!(seen.name, "tent");

    store.update_cart(&bob.id, &[tent.id.clone()]).unwrap();
    store.delete_share(&alice.id, &share.id).unwrap();

    assert!(!store.can_read(&bob.id, &thing_target(&tent)));
    assert!(store.cart(&bob.id).unwrap().is_empty());
}

#[test]
fn test_shared_list_exposes_its_things() {
    let store = Store::in_memory().unwrap();
    let alice = create_user(&store, "alice");
    let bob = create_user(&store, "bob");
    let tent = create_thing(&store, &alice, "tent");
    let stove = create_thing(&store, &alice, "stove");
    let list = create_list(&store, &alice, SharingState::Private, &[&tent]);

    store
        .create_share(&alice.id, &bob.id, &ShareTarget::List(list.id.clone()))
        .unwrap();

    assert_eq!(store.visible_list_ids(&bob.id), HashSet::from([list.id.clone()]));
    assert_eq!(store.visible_thing_ids(&bob.id), HashSet::from([tent.id.clone()]));
    assert!(!store.can_read(&bob.id, &thing_target(&stove)));

    let seen = store.get_list_for(&bob.id, &list.id).unwrap();
    assert_eq!(seen.things.len(), 1);
    assert!(seen.things[0].private_note.is_none());
}

#[test]
fn test_visible_but_not_owned_cannot_be_edited() {
    let store = Store::in_memory().unwrap();
    let alice = create_user(&store, "alice");
    let bob = create_user(&store, "bob");
    let carol = create_user(&store, "carol");
    let tent = create_thing(&store, &alice, "tent");
    store.create_share(&alice.id, &bob.id, &thing_target(&tent)).unwrap();

    let rename = UpdateThingRequest {
        name: Some("mine now".to_string()),
        ..Default::default()
    };
    assert!(matches!(
        store.update_thing(&bob.id, &tent.id, &rename),
        Err(StoreError::NoAccessRights(_))
    ));
    assert!(matches!(
        store.delete_thing(&bob.id, &tent.id),
        Err(StoreError::NoAccessRights(_))
    ));
    assert!(matches!(
        store.update_thing(&carol.id, &tent.id, &rename),
        Err(StoreError::NotFound(_))
    ));
}

// ==================== Sharing Tiers ====================

#[test]
fn test_friends_tier_does_not_reach_friends_of_friends() {
    let store = Store::in_memory().unwrap();
    let alice = create_user(&store, "alice");
    let bob = create_user(&store, "bob");
    let carol = create_user(&store, "carol");
    let tent = create_thing(&store, &alice, "tent");
    let list = create_list(&store, &alice, SharingState::Friends, &[&tent]);
    let target = ShareTarget::List(list.id.clone());

    befriend(&store, &alice, &bob);
    assert!(store.can_read(&bob.id, &target));
    assert!(store.can_read(&bob.id, &thing_target(&tent)));
    assert!(!store.can_read(&carol.id, &target));

    befriend(&store, &bob, &carol);
    assert!(!store.can_read(&carol.id, &target));
    assert!(!store.can_read(&carol.id, &thing_target(&tent)));

    store
        .update_list(
            &alice.id,
            &list.id,
            &UpdateListRequest {
                sharing_state: Some(SharingState::FriendsOfFriends),
                ..Default::default()
            },
        )
        .unwrap();
    assert!(store.can_read(&carol.id, &target));
    assert!(store.can_read(&carol.id, &thing_target(&tent)));
}

#[test]
fn test_private_list_is_hidden_from_friends() {
    let store = Store::in_memory().unwrap();
    let alice = create_user(&store, "alice");
    let bob = create_user(&store, "bob");
    let tent = create_thing(&store, &alice, "tent");
    let list = create_list(&store, &alice, SharingState::Private, &[&tent]);
    befriend(&store, &alice, &bob);

    assert!(!store.can_read(&bob.id, &ShareTarget::List(list.id.clone())));
    assert!(store.visible_thing_ids(&bob.id).is_empty());
}

#[test]
fn test_friend_of_friend_visibility_is_symmetric() {
    let store = Store::in_memory().unwrap();
    let alice = create_user(&store, "alice");
    let bob = create_user(&store, "bob");
    let carol = create_user(&store, "carol");
    befriend(&store, &alice, &bob);
    befriend(&store, &bob, &carol);

    let alice_list = create_list(&store, &alice, SharingState::FriendsOfFriends, &[]);
    let carol_list = create_list(&store, &carol, SharingState::FriendsOfFriends, &[]);

    assert!(store.can_read(&carol.id, &ShareTarget::List(alice_list.id.clone())));
    assert!(store.can_read(&alice.id, &ShareTarget::List(carol_list.id.clone())));
    assert_eq!(store.friends_of_friends(&alice.id), HashSet::from([carol.id.clone()]));
    assert_eq!(store.friends_of_friends(&carol.id), HashSet::from([alice.id.clone()]));
}

#[test]
fn test_direct_friend_is_not_also_friend_of_friend() {
    let store = Store::in_memory().unwrap();
    let alice = create_user(&store, "alice");
    let bob = create_user(&store, "bob");
    let carol = create_user(&store, "carol");
    befriend(&store, &alice, &bob);
    befriend(&store, &bob, &carol);
    befriend(&store, &alice, &carol);

    assert!(store.friends_of_friends(&alice.id).is_empty());
    assert_eq!(
        store.friend_ids(&alice.id),
        HashSet::from([bob.id.clone(), carol.id.clone()])
    );

    // Reached through two paths, listed once
    let tent = create_thing(&store, &alice, "tent");
    let list = create_list(&store, &alice, SharingState::FriendsOfFriends, &[&tent]);
    store
        .create_share(&alice.id, &carol.id, &ShareTarget::List(list.id.clone()))
        .unwrap();
    assert_eq!(store.visible_list_ids(&carol.id), HashSet::from([list.id.clone()]));
    assert_eq!(store.visible_things(&carol.id).unwrap().len(), 1);
}

// ==================== Monotonicity ====================

#[test]
fn test_granting_operations_never_shrink_visibility() {
    let store = Store::in_memory().unwrap();
    let alice = create_user(&store, "alice");
    let bob = create_user(&store, "bob");
    let carol = create_user(&store, "carol");
    let tent = create_thing(&store, &alice, "tent");
    let stove = create_thing(&store, &alice, "stove");
    let lamp = create_thing(&store, &carol, "lamp");
    let list = create_list(&store, &alice, SharingState::Private, &[&stove]);
    create_list(&store, &carol, SharingState::FriendsOfFriends, &[&lamp]);

    let mut previous = store.visible_thing_ids(&bob.id);
    let mut check = |store: &Store| {
        let now = store.visible_thing_ids(&bob.id);
        assert!(now.is_superset(&previous));
        previous = now;
    };

    store.create_share(&alice.id, &bob.id, &thing_target(&tent)).unwrap();
    check(&store);
    befriend(&store, &alice, &bob);
    check(&store);
    store
        .update_list(
            &alice.id,
            &list.id,
            &UpdateListRequest {
                sharing_state: Some(SharingState::Friends),
                ..Default::default()
            },
        )
        .unwrap();
    check(&store);
    befriend(&store, &alice, &carol);
    check(&store);

    assert_eq!(
        store.visible_thing_ids(&bob.id),
        HashSet::from([tent.id.clone(), stove.id.clone(), lamp.id.clone()])
    );
}

// ==================== Friend Requests ====================

#[test]
fn test_friend_request_preconditions() {
    let store = Store::in_memory().unwrap();
    let alice = create_user(&store, "alice");
    let bob = create_user(&store, "bob");
    let carol = create_user(&store, "carol");

    let request = store.create_friend_request(&alice.id, &bob.id).unwrap();
    assert!(matches!(
        store.create_friend_request(&alice.id, &carol.id),
        Err(StoreError::PendingRequestExists)
    ));
    assert!(matches!(
        store.react_friend_request(&carol.id, &request.id, true),
        Err(StoreError::DoesNotBelongToUser(_))
    ));

    store.react_friend_request(&bob.id, &request.id, true).unwrap();
    assert!(store.are_friends(&alice.id, &bob.id));
    assert!(matches!(
        store.react_friend_request(&bob.id, &request.id, false),
        Err(StoreError::FriendRequestNotPending)
    ));
    assert!(matches!(
        store.create_friend_request(&bob.id, &alice.id),
        Err(StoreError::FriendshipExists)
    ));
}

#[test]
fn test_unfriend_removes_tier_visibility() {
    let store = Store::in_memory().unwrap();
    let alice = create_user(&store, "alice");
    let bob = create_user(&store, "bob");
    let tent = create_thing(&store, &alice, "tent");
    create_list(&store, &alice, SharingState::Friends, &[&tent]);
    befriend(&store, &alice, &bob);
    assert!(store.can_read(&bob.id, &thing_target(&tent)));

    store.unfriend(&bob.id, &alice.id).unwrap();
    assert!(!store.are_friends(&alice.id, &bob.id));
    assert!(!store.can_read(&bob.id, &thing_target(&tent)));
    assert!(matches!(
        store.unfriend(&bob.id, &alice.id),
        Err(StoreError::NotFound(_))
    ));
}
